use base64::prelude::*;
use colored::*;
use serde_json::{json, Value as JsonValue};

use crate::cli::cli_args::OutputFormat;
use crate::error::ServerError;
use crate::types::{QueryResult, Value};

/// Formats query results and generic tabular reports for CLI output.
pub struct OutputFormatter;

impl OutputFormatter {
    pub fn format_result(result: &QueryResult, format: &OutputFormat) -> String {
        match format {
            OutputFormat::Table => Self::format_table(result),
            OutputFormat::Json => Self::format_json(result),
            OutputFormat::Csv => Self::format_csv(result),
        }
    }

    fn format_table(result: &QueryResult) -> String {
        if result.is_empty() {
            return "No results found.".dimmed().to_string();
        }

        let headers: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
        let rows: Vec<Vec<String>> = result
            .rows
            .iter()
            .map(|row| row.values.iter().map(Self::value_to_string).collect())
            .collect();

        let mut output = Self::format_row_table(&headers, &rows);
        output.push_str(&format!(
            "\n{} {}\n",
            result.row_count().to_string().green().bold(),
            if result.row_count() == 1 { "row" } else { "rows" }
        ));
        output
    }

    /// Render an arbitrary header + row grid as a bordered table. Used
    /// both for query result sets and for the `procedures`/
    /// `compile-status` reports, which have no `QueryResult` to format.
    pub fn format_row_table(headers: &[String], rows: &[Vec<String>]) -> String {
        let mut col_widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in rows {
            for (i, value) in row.iter().enumerate() {
                if i < col_widths.len() {
                    col_widths[i] = col_widths[i].max(value.len());
                }
            }
        }
        for width in &mut col_widths {
            *width = (*width).max(8);
        }

        let mut output = String::new();
        output.push_str(&Self::format_table_separator(&col_widths));
        output.push('|');
        for (i, header) in headers.iter().enumerate() {
            output.push_str(&format!(" {:<width$} |", header.bold().cyan(), width = col_widths[i]));
        }
        output.push('\n');
        output.push_str(&Self::format_table_separator(&col_widths));

        for row in rows {
            output.push('|');
            for (i, value) in row.iter().enumerate() {
                if i < col_widths.len() {
                    output.push_str(&format!(" {:<width$} |", value, width = col_widths[i]));
                }
            }
            output.push('\n');
        }
        output.push_str(&Self::format_table_separator(&col_widths));
        output
    }

    fn format_table_separator(col_widths: &[usize]) -> String {
        let mut separator = String::from('+');
        for &width in col_widths {
            separator.push_str(&"-".repeat(width + 2));
            separator.push('+');
        }
        separator.push('\n');
        separator
    }

    fn format_json(result: &QueryResult) -> String {
        let mut rows = Vec::new();
        for row in &result.rows {
            let mut row_obj = serde_json::Map::new();
            for (i, value) in row.values.iter().enumerate() {
                if let Some(col) = result.columns.get(i) {
                    row_obj.insert(col.name.clone(), Self::value_to_json(value));
                }
            }
            rows.push(JsonValue::Object(row_obj));
        }

        let output = json!({
            "data": rows,
            "metadata": {
                "columns": result.columns.iter().map(|col| {
                    json!({
                        "name": col.name,
                        "type": format!("{:?}", col.data_type),
                        "nullable": col.nullable,
                    })
                }).collect::<Vec<_>>(),
                "row_count": result.row_count(),
            }
        });

        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
    }

    fn format_csv(result: &QueryResult) -> String {
        let mut output = String::new();
        let headers: Vec<String> = result.columns.iter().map(|c| Self::escape_csv_field(&c.name)).collect();
        output.push_str(&headers.join(","));
        output.push('\n');

        for row in &result.rows {
            let values: Vec<String> = row
                .values
                .iter()
                .map(|v| Self::escape_csv_field(&Self::value_to_string(v)))
                .collect();
            output.push_str(&values.join(","));
            output.push('\n');
        }
        output
    }

    fn value_to_string(value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bit(b) => b.to_string(),
            Value::TinyInt(n) => n.to_string(),
            Value::SmallInt(n) => n.to_string(),
            Value::Int(n) => n.to_string(),
            Value::BigInt(n) => n.to_string(),
            Value::Float(n) => format!("{n:.4}"),
            Value::Double(n) => format!("{n:.4}"),
            Value::Decimal { unscaled, scale } => Self::format_decimal(*unscaled, *scale),
            Value::Text(s) => s.clone(),
            Value::Binary(b) => format!("<binary: {} bytes>", b.len()),
            Value::Guid(g) => Self::format_guid(g),
            Value::DateTime(s) => s.clone(),
            Value::Date(s) => s.clone(),
        }
    }

    fn format_decimal(unscaled: i128, scale: u8) -> String {
        let scale = scale as u32;
        let divisor = 10i128.pow(scale);
        let whole = unscaled / divisor;
        let frac = (unscaled % divisor).abs();
        if scale == 0 {
            whole.to_string()
        } else {
            format!("{whole}.{frac:0width$}", width = scale as usize)
        }
    }

    fn format_guid(bytes: &[u8; 16]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    }

    fn value_to_json(value: &Value) -> JsonValue {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bit(b) => JsonValue::Bool(*b),
            Value::TinyInt(n) => JsonValue::Number((*n).into()),
            Value::SmallInt(n) => JsonValue::Number((*n).into()),
            Value::Int(n) => JsonValue::Number((*n).into()),
            Value::BigInt(n) => JsonValue::Number((*n).into()),
            Value::Float(n) => serde_json::Number::from_f64(*n as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Double(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Decimal { unscaled, scale } => JsonValue::String(Self::format_decimal(*unscaled, *scale)),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Binary(b) => JsonValue::String(BASE64_STANDARD.encode(b)),
            Value::Guid(g) => JsonValue::String(Self::format_guid(g)),
            Value::DateTime(s) | Value::Date(s) => JsonValue::String(s.clone()),
        }
    }

    fn escape_csv_field(field: &str) -> String {
        if field.contains(',') || field.contains('"') || field.contains('\n') {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    pub fn format_error(error: &ServerError) -> String {
        format!("{} {}", "Error:".red().bold(), error.to_string().red())
    }

    pub fn format_success(message: &str) -> String {
        format!("{} {}", "Success:".green().bold(), message)
    }

    pub fn format_info(message: &str) -> String {
        format!("{} {}", "Info:".blue().bold(), message)
    }
}
