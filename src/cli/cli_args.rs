use clap::{Parser, Subcommand, ValueEnum};

/// tsql-proc-host CLI — runs the TDS stored-procedure server and
/// inspects a running (or about-to-run) registry/compile state.
#[derive(Parser, Debug)]
#[command(name = "tsql-proc-hostd")]
#[command(about = "Multi-tenant stored-procedure server speaking the SQL Server TDS wire protocol")]
#[command(version = "0.1.0")]
pub struct CliArgs {
    /// Path to the server's TOML configuration file.
    #[arg(short, long, default_value = "tsql-proc-host.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server: bind every configured listener and accept
    /// connections until interrupted.
    Serve,

    /// Inspect the procedure registry.
    Procedures {
        #[command(subcommand)]
        action: ProcedureAction,
    },

    /// Show compile/promote pipeline status for loaded procedures.
    CompileStatus {
        /// Restrict the report to one procedure's qualified name
        /// (`schema.name` or `database.schema.name`).
        #[arg(value_name = "NAME")]
        name: Option<String>,

        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Execute an ad-hoc SQL batch or a registered procedure against a
    /// locally loaded registry, without going over the wire.
    Exec {
        /// SQL batch text, or `EXEC schema.name @param=value, ...`.
        #[arg(value_name = "SQL")]
        sql: String,

        /// Database to run against.
        #[arg(short, long)]
        database: Option<String>,

        /// Tenant to run under.
        #[arg(short, long)]
        tenant: Option<String>,

        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProcedureAction {
    /// List every procedure visible for a (tenant, database) scope.
    List {
        #[arg(short, long)]
        database: Option<String>,

        #[arg(short, long)]
        tenant: Option<String>,

        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show one procedure's source, parameters, and counters.
    Show {
        /// Qualified name (`schema.name`).
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(short, long)]
        database: Option<String>,

        #[arg(short, long)]
        tenant: Option<String>,
    },
}

/// Output format options.
#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}
