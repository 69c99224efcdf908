//! Connection lifecycle state machine (§4.1.2).
//!
//! `AWAIT-PRELOGIN → (TLS-NEGOTIATE?) → AWAIT-LOGIN7 → READY → EXECUTING
//! → READY → … → CLOSED`. This module owns the byte-level conversation;
//! it hands completed requests to the [`crate::runtime::Runtime`] and
//! turns results back into token-stream bytes.
//!
//! While a statement is executing, the read side keeps watching the
//! same connection for an ATTENTION packet (§4.1.2 "query attention
//! arriving mid-stream"). `Connection<S>` is split into an I/O half
//! (`ConnectionIo`, holding the read half and message reassembly state)
//! and an exec half (everything dispatch needs) so the two can be
//! raced with `tokio::select!` without both wanting `&mut self` at
//! once.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogProvider;
use crate::error::{ExecError, ProtocolError, ServerError, ServerResult};
use crate::protocol::tds::login7::Login7;
use crate::protocol::tds::packet::{
    MessageReader, Packet, PacketStatus, PacketType, PacketWriter, ReadOutcome, DEFAULT_PACKET_SIZE, HEADER_LEN,
};
use crate::protocol::tds::prelogin::{negotiate_encryption, EncryptionLevel, EncryptionOutcome, PreLogin};
use crate::protocol::tds::rpc::{decode_rpc_request, ProcedureRef};
use crate::protocol::tds::tokens::{self, done_status, EnvChangeType};
use crate::registry::Registry;
use crate::runtime::{ExecContext, Runtime, Session};
use crate::tenancy::{TenantResolver, TenantSignal};
use crate::types::{ExecResult, TransactionEventKind, Value};

static NEXT_SPID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitPrelogin,
    AwaitLogin7,
    Ready,
    Executing,
    Closed,
}

/// Server-reported identity surfaced in PRELOGIN's VERSION option and
/// the LOGINACK token (§4.1.2, §8 S1: `VERSION=15.0.2000.0`).
pub struct ServerIdentity {
    pub version: u32,
    pub sub_build: u16,
    pub program_name: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            version: 0x0F000000 | (2000 << 8) | 0,
            sub_build: 0,
            program_name: "tsql-proc-host".to_string(),
        }
    }
}

/// Read half plus message reassembly state, kept apart from everything
/// dispatch touches so [`Connection::dispatch_ready_packet`] can race a
/// read against an in-flight statement.
struct ConnectionIo<S> {
    read_half: ReadHalf<S>,
    reader: MessageReader,
    read_buf: Vec<u8>,
}

impl<S: AsyncRead + Unpin + Send> ConnectionIo<S> {
    async fn read_message(&mut self) -> ServerResult<Option<(PacketType, Vec<u8>, PacketStatus)>> {
        loop {
            match Packet::decode(&self.read_buf) {
                Ok((packet, consumed)) => {
                    self.read_buf.drain(..consumed);
                    match self.reader.feed(packet)? {
                        ReadOutcome::Complete {
                            packet_type,
                            message,
                            first_status,
                        } => return Ok(Some((packet_type, message, first_status))),
                        ReadOutcome::Incomplete => continue,
                    }
                }
                Err(ServerError::Protocol(ProtocolError::PacketTooShort { .. })) => {
                    // Not enough bytes buffered yet for a full packet.
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; 4096];
            let n = self
                .read_half
                .read(&mut chunk)
                .await
                .map_err(|e| ServerError::Connection(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read messages until an ATTENTION packet arrives. The TDS client
    /// protocol forbids sending anything else while a request is
    /// outstanding, so anything other than ATTENTION here is ignored
    /// rather than rejected.
    async fn wait_for_attention(&mut self) -> ServerResult<()> {
        loop {
            match self.read_message().await? {
                Some((PacketType::AttentionSignal, _, _)) => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(ServerError::Connection(
                        "connection closed while awaiting ATTENTION".to_string(),
                    ))
                }
            }
        }
    }
}

async fn write_packets<S: AsyncWrite + Unpin + Send>(
    write_half: &mut WriteHalf<S>,
    writer: &mut PacketWriter,
    packet_type: PacketType,
    payload: &[u8],
) -> ServerResult<()> {
    let packets = writer.split(packet_type, payload);
    for packet in packets {
        write_half
            .write_all(&packet.encode())
            .await
            .map_err(|e| ServerError::Connection(e.to_string()))?;
    }
    write_half
        .flush()
        .await
        .map_err(|e| ServerError::Connection(e.to_string()))?;
    Ok(())
}

/// Everything a dispatched statement needs, borrowed out of
/// `Connection` for the duration of one `dispatch_ready_packet` call so
/// it can run concurrently with `ConnectionIo::wait_for_attention`.
struct ExecHalf<'a, S> {
    session: &'a mut Session,
    write_half: &'a mut WriteHalf<S>,
    writer: &'a mut PacketWriter,
    registry: &'a mut Arc<Registry>,
    runtime: &'a mut Arc<Runtime>,
    catalog: &'a mut Option<Arc<CatalogProvider>>,
    identity: &'a mut ServerIdentity,
}

impl<'a, S: AsyncWrite + Unpin + Send> ExecHalf<'a, S> {
    async fn dispatch_statement(
        &mut self,
        packet_type: PacketType,
        payload: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerResult<()> {
        match packet_type {
            PacketType::SqlBatch => self.handle_sql_batch(&payload, cancel).await,
            PacketType::Rpc => self.handle_rpc(&payload, cancel).await,
            PacketType::AttentionSignal => self.handle_attention().await,
            PacketType::TransactionManagerRequest => self.handle_transaction_mgr(&payload).await,
            PacketType::BulkLoadData => Err(ServerError::NotImplemented("BULK_LOAD_DATA".to_string())),
            other => Err(ProtocolError::InvalidFraming(format!(
                "unexpected packet type in READY state: {other:?}"
            ))
            .into()),
        }
    }

    async fn handle_sql_batch(&mut self, payload: &[u8], cancel: CancellationToken) -> ServerResult<()> {
        let sql = decode_ucs2le_batch(payload)?;

        if let Some(catalog) = self.catalog.clone() {
            if let Some(query_result) = catalog
                .query(&sql, self.session.tenant.as_deref(), &self.session.database)
                .await
            {
                let exec_result = ExecResult {
                    result_sets: vec![query_result],
                    rows_affected: 0,
                    return_value: None,
                    output_params: Vec::new(),
                    elapsed: Duration::default(),
                    transaction_events: Vec::new(),
                };
                return self.emit_exec_result(Ok(exec_result), false).await;
            }
        }

        let ctx = self.build_context(cancel);
        let result = self.runtime.execute_sql(self.session, &sql, ctx).await;
        self.emit_exec_result(result, false).await
    }

    async fn handle_rpc(&mut self, payload: &[u8], cancel: CancellationToken) -> ServerResult<()> {
        let request = decode_rpc_request(payload)?;

        if let ProcedureRef::Builtin(crate::protocol::tds::rpc::BuiltinProcedure::SpExecuteSql) =
            &request.procedure
        {
            return self.handle_sp_executesql(&request, cancel).await;
        }

        let callee = match &request.procedure {
            ProcedureRef::Named(name) => name.clone(),
            ProcedureRef::Builtin(_) => {
                return Err(ServerError::NotImplemented(
                    "built-in system procedures other than sp_executesql are not modelled by this host".to_string(),
                ))
            }
        };

        let mut ctx = self.build_context(cancel);
        ctx.params = request.param_map();

        let lookup = crate::registry::LookupContext {
            tenant: self.session.tenant.clone(),
            database: Some(self.session.database.clone()),
        };
        let procedure = self.registry.lookup(&lookup, &callee)?;
        ctx.call_stack.push(procedure.qualified_name());
        let result = self.runtime.execute(self.session, procedure, ctx).await;
        self.emit_exec_result(result, true).await
    }

    /// `sp_executesql`: first parameter is the statement text, second is
    /// an `@name type, @name type, ...` declaration that binds the
    /// remaining positional parameters by name (§4.1.3 supplement).
    async fn handle_sp_executesql(
        &mut self,
        request: &crate::protocol::tds::rpc::RpcRequest,
        cancel: CancellationToken,
    ) -> ServerResult<()> {
        let stmt = match request.params.first().map(|p| &p.value) {
            Some(Value::Text(sql)) => sql.clone(),
            _ => {
                return Err(ProtocolError::BadRpcRequest(
                    "sp_executesql requires a string statement as its first parameter".to_string(),
                )
                .into())
            }
        };

        let declared_names = request
            .params
            .get(1)
            .and_then(|p| match &p.value {
                Value::Text(decl) => Some(parse_param_declaration(decl)),
                _ => None,
            })
            .unwrap_or_default();

        let mut ctx = self.build_context(cancel);
        for param in request.params.iter().skip(2) {
            let key = if param.name.starts_with('@') {
                param.name.clone()
            } else {
                format!("@{}", param.name)
            };
            ctx.params.insert(key, param.value.clone());
        }
        // Parameters bound only through the declaration string (no
        // positional RPC parameter carries them) still need a slot so
        // the interpreter can report a clear missing-parameter error
        // rather than treating the name as undeclared.
        for name in declared_names {
            ctx.params.entry(name).or_insert(Value::Null);
        }

        let result = self.runtime.execute_sql(self.session, &stmt, ctx).await;
        self.emit_exec_result(result, false).await
    }

    async fn handle_attention(&mut self) -> ServerResult<()> {
        let reply = tokens::encode_done(tokens::TOKEN_DONE, done_status::ATTN, 0, 0);
        self.write_packets(PacketType::TabularResult, &reply).await
    }

    async fn handle_transaction_mgr(&mut self, _payload: &[u8]) -> ServerResult<()> {
        // Transaction manager requests (ISO level changes, enlistment)
        // are out of scope: this host drives transactions exclusively
        // through BEGIN/COMMIT/ROLLBACK text recognised by the
        // interpreter (§4.3 "Transaction handling").
        let reply = tokens::encode_done(tokens::TOKEN_DONE, done_status::COUNT, 0, 0);
        self.write_packets(PacketType::TabularResult, &reply).await
    }

    fn build_context(&self, cancel: CancellationToken) -> ExecContext {
        let mut ctx = ExecContext::new(self.session.session_id.clone(), self.session.database.clone());
        ctx.tenant = self.session.tenant.clone();
        ctx.user = self.session.user.clone();
        ctx.nocount = self.session.nocount;
        ctx.timeout = Some(Duration::from_secs(30));
        ctx.cancel = cancel;
        ctx
    }

    async fn emit_exec_result(&mut self, result: ServerResult<ExecResult>, is_proc: bool) -> ServerResult<()> {
        match result {
            Ok(exec_result) => {
                let mut reply = Vec::new();
                for event in &exec_result.transaction_events {
                    let kind = match event.kind {
                        TransactionEventKind::Began => EnvChangeType::BeginTransaction,
                        TransactionEventKind::Committed => EnvChangeType::CommitTransaction,
                        TransactionEventKind::RolledBack => EnvChangeType::RollbackTransaction,
                    };
                    reply.extend_from_slice(&tokens::encode_envchange_transaction(
                        kind,
                        event.new_descriptor,
                        event.old_descriptor,
                    ));
                }
                for (i, result_set) in exec_result.result_sets.iter().enumerate() {
                    reply.extend_from_slice(&tokens::encode_colmetadata(&result_set.columns));
                    for row in &result_set.rows {
                        if tokens::should_use_nbcrow(self.session.tds_version, &result_set.columns, row) {
                            reply.extend_from_slice(&tokens::encode_nbcrow(row));
                        } else {
                            reply.extend_from_slice(&tokens::encode_row(row));
                        }
                    }
                    let more = i + 1 < exec_result.result_sets.len();
                    let status = if more { done_status::COUNT | done_status::MORE } else { done_status::COUNT };
                    reply.extend_from_slice(&tokens::encode_done(
                        tokens::TOKEN_DONEINPROC,
                        status,
                        0,
                        result_set.rows.len() as u64,
                    ));
                }

                for (ordinal, (name, value)) in exec_result.output_params.iter().enumerate() {
                    reply.extend_from_slice(&tokens::encode_returnvalue(ordinal as u16, name, value));
                }
                if let Some(return_value) = exec_result.return_value {
                    reply.extend_from_slice(&tokens::encode_returnstatus(return_value));
                }

                let kind = if is_proc { tokens::TOKEN_DONEPROC } else { tokens::TOKEN_DONE };
                reply.extend_from_slice(&tokens::encode_done(
                    kind,
                    done_status::COUNT,
                    0,
                    exec_result.rows_affected,
                ));
                self.write_packets(PacketType::TabularResult, &reply).await
            }
            Err(err) => self.emit_error_for(&err).await,
        }
    }

    async fn emit_error_for(&mut self, err: &ServerError) -> ServerResult<()> {
        let severity = err.severity();
        let class = match severity {
            crate::error::Severity::Warning => 10,
            crate::error::Severity::Error => 16,
            crate::error::Severity::Critical => 20,
            crate::error::Severity::Fatal => 24,
        };

        if matches!(err, ServerError::Exec(ExecError::Cancelled)) {
            return self.handle_attention().await;
        }

        let mut reply = tokens::encode_info_or_error(
            true,
            err.sql_error_number(),
            1,
            class,
            &err.to_string(),
            &self.identity.program_name,
            "",
            0,
        );
        reply.extend_from_slice(&tokens::encode_done(
            tokens::TOKEN_DONEINPROC,
            done_status::ERROR,
            0,
            0,
        ));
        self.write_packets(PacketType::TabularResult, &reply).await
    }

    async fn write_packets(&mut self, packet_type: PacketType, payload: &[u8]) -> ServerResult<()> {
        write_packets(self.write_half, self.writer, packet_type, payload).await
    }
}

/// Drives one TDS connection end to end over `stream`, which must
/// already support plaintext framing (a raw TCP socket, or one already
/// upgraded to TLS by the caller).
pub struct Connection<S> {
    io: ConnectionIo<S>,
    write_half: WriteHalf<S>,
    state: ConnectionState,
    session: Session,
    writer: PacketWriter,
    registry: Arc<Registry>,
    runtime: Arc<Runtime>,
    catalog: Option<Arc<CatalogProvider>>,
    tenant_resolver: Option<Arc<TenantResolver>>,
    identity: ServerIdentity,
    /// Whether this connection's listener has TLS configured. Drives
    /// the PRELOGIN ENCRYPTION byte the server advertises (§4.1.2).
    tls_available: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S, registry: Arc<Registry>, runtime: Arc<Runtime>, default_database: &str) -> Self {
        Self::with_collaborators(stream, registry, runtime, None, None, default_database, false)
    }

    /// Like [`Connection::new`], but also wires a [`CatalogProvider`] so
    /// `sys.*`/`information_schema.*` references in ad-hoc batches are
    /// answered from the Registry/storage instead of being forwarded, a
    /// [`TenantResolver`] so LOGIN7's hostname field can resolve a
    /// tenant (§6 Tenancy, `TdsProperty` source), and whether the
    /// listener accepting this connection has TLS configured.
    pub fn with_collaborators(
        stream: S,
        registry: Arc<Registry>,
        runtime: Arc<Runtime>,
        catalog: Option<Arc<CatalogProvider>>,
        tenant_resolver: Option<Arc<TenantResolver>>,
        default_database: &str,
        tls_available: bool,
    ) -> Self {
        let spid = NEXT_SPID.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("sess-{spid}");
        let mut session = Session::new(session_id, format!("conn-{spid}"));
        session.database = default_database.to_string();

        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            io: ConnectionIo {
                read_half,
                reader: MessageReader::new(),
                read_buf: Vec::new(),
            },
            write_half,
            state: ConnectionState::AwaitPrelogin,
            session,
            writer: PacketWriter::new(DEFAULT_PACKET_SIZE, spid),
            registry,
            runtime,
            catalog,
            tenant_resolver,
            identity: ServerIdentity::default(),
            tls_available,
        }
    }

    /// Run the connection to completion: PRELOGIN, LOGIN7, then the
    /// READY/EXECUTING request loop, until the client closes or a fatal
    /// error occurs.
    pub async fn run(&mut self) -> ServerResult<()> {
        self.handle_prelogin().await?;
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.handle_login7().await?;
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        loop {
            match self.io.read_message().await? {
                Some((packet_type, payload, first_status)) => {
                    if let Err(err) = self.dispatch_ready_packet(packet_type, payload, first_status).await {
                        self.emit_error_for(&err).await?;
                        if err.severity() >= crate::error::Severity::Critical {
                            self.state = ConnectionState::Closed;
                            break;
                        }
                    }
                }
                None => {
                    self.state = ConnectionState::Closed;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn write_packets(&mut self, packet_type: PacketType, payload: &[u8]) -> ServerResult<()> {
        write_packets(&mut self.write_half, &mut self.writer, packet_type, payload).await
    }

    async fn handle_prelogin(&mut self) -> ServerResult<()> {
        let (packet_type, payload, _) = match self.io.read_message().await? {
            Some(m) => m,
            None => {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        };
        if packet_type != PacketType::PreLogin {
            return Err(ProtocolError::InvalidFraming(
                "expected PRELOGIN as the first packet".to_string(),
            )
            .into());
        }

        let client_prelogin = PreLogin::decode(&payload)?;
        let client_encryption = client_prelogin.encryption.unwrap_or(EncryptionLevel::Off);
        let server_encryption = if self.tls_available {
            EncryptionLevel::Off
        } else {
            EncryptionLevel::NotSupported
        };
        let outcome = negotiate_encryption(client_encryption, server_encryption);

        if outcome == EncryptionOutcome::Deny {
            self.write_half
                .write_all(b"N")
                .await
                .map_err(|e| ServerError::Connection(e.to_string()))?;
            self.state = ConnectionState::Closed;
            return Ok(());
        }

        // A strict or opportunistic TLS upgrade is out of scope for
        // this path: actually performing the handshake over
        // `TlsPreloginWrapper` is a named Non-goal (SPEC_FULL.md "TLS
        // handshake execution"); only the ENCRYPTION byte negotiation
        // above is implemented, so a client that requires TLS against a
        // TLS-capable listener is acknowledged here but then talks
        // cleartext TDS.
        let reply = PreLogin::default()
            .with_version(self.identity.version, self.identity.sub_build)
            .with_encryption(server_encryption)
            .with_mars(client_prelogin.mars.unwrap_or(false))
            .encode();
        self.write_packets(PacketType::PreLogin, &reply).await?;

        self.state = ConnectionState::AwaitLogin7;
        Ok(())
    }

    async fn handle_login7(&mut self) -> ServerResult<()> {
        let (packet_type, payload, _) = match self.io.read_message().await? {
            Some(m) => m,
            None => {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        };
        if packet_type != PacketType::Tds7Login {
            self.emit_login_failure().await?;
            self.state = ConnectionState::Closed;
            return Ok(());
        }

        let login = match Login7::decode(&payload) {
            Ok(login) => login,
            Err(_) => {
                self.emit_login_failure().await?;
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        };

        self.session.user = login.username.clone();
        if let Some(resolver) = &self.tenant_resolver {
            let signal = TenantSignal {
                tds_property: Some(login.hostname.as_str()),
                ..Default::default()
            };
            self.session.tenant = resolver.resolve(&signal);
        }
        self.session.database = if login.database.is_empty() {
            self.session.database.clone()
        } else {
            login.database.clone()
        };
        self.session.tds_version = login.tds_version;
        self.session.packet_size = login.packet_size.clamp(
            crate::protocol::tds::packet::MIN_PACKET_SIZE as u32,
            crate::protocol::tds::packet::MAX_PACKET_SIZE as u32,
        ) as u16;
        self.writer = PacketWriter::new(self.session.packet_size, self.writer_spid());

        let mut reply = tokens::encode_loginack(login.tds_version, &self.identity.program_name, 1);
        if !login.feature_extension_ids.is_empty() {
            reply.extend_from_slice(&tokens::encode_featureextack(&login.feature_extension_ids));
        }
        reply.extend_from_slice(&tokens::encode_envchange_string(
            EnvChangeType::Database,
            &self.session.database,
            "",
        ));
        reply.extend_from_slice(&tokens::encode_envchange_string(
            EnvChangeType::PacketSize,
            &self.session.packet_size.to_string(),
            &DEFAULT_PACKET_SIZE.to_string(),
        ));
        reply.extend_from_slice(&tokens::encode_done(
            tokens::TOKEN_DONE,
            done_status::COUNT,
            0,
            0,
        ));
        self.write_packets(PacketType::TabularResult, &reply).await?;

        self.state = ConnectionState::Ready;
        Ok(())
    }

    async fn emit_login_failure(&mut self) -> ServerResult<()> {
        let mut reply = tokens::encode_info_or_error(
            true,
            18456,
            1,
            14,
            "Login failed.",
            &self.identity.program_name,
            "",
            0,
        );
        reply.extend_from_slice(&tokens::encode_done(tokens::TOKEN_DONE, done_status::ERROR, 0, 0));
        self.write_packets(PacketType::TabularResult, &reply).await
    }

    fn writer_spid(&self) -> u16 {
        // `PacketWriter` does not expose its SPID; re-derive a stable
        // value from the session id so a packet-size change keeps the
        // same SPID across the swap above.
        self.session
            .session_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1)
    }

    /// Race the in-flight statement against an incoming ATTENTION
    /// packet (§4.1.2). `self` is split into disjoint borrows so the
    /// read side and the dispatch side can advance concurrently: the
    /// moment ATTENTION arrives, `cancel` is tripped, which
    /// `Runtime::run`'s own `select!` observes and turns into
    /// `ExecError::Cancelled`, which `emit_error_for` turns into a
    /// DONE+ATTN reply.
    async fn dispatch_ready_packet(
        &mut self,
        packet_type: PacketType,
        payload: Vec<u8>,
        first_status: PacketStatus,
    ) -> ServerResult<()> {
        if first_status.contains(PacketStatus::RESET_CONNECTION) {
            self.session.reset_connection(&self.session.database.clone());
        } else if first_status.contains(PacketStatus::RESET_CONNECTION_SKIP_TRAN) {
            self.session
                .reset_connection_skip_tran(&self.session.database.clone());
        }

        self.state = ConnectionState::Executing;
        let cancel = CancellationToken::new();

        let Connection {
            io,
            write_half,
            session,
            writer,
            registry,
            runtime,
            catalog,
            identity,
            ..
        } = self;

        let mut exec = ExecHalf {
            session,
            write_half,
            writer,
            registry,
            runtime,
            catalog,
            identity,
        };

        let work = exec.dispatch_statement(packet_type, payload, cancel.clone());
        tokio::pin!(work);

        let outcome = loop {
            tokio::select! {
                biased;
                res = &mut work => break res,
                attn = io.wait_for_attention() => match attn {
                    Ok(()) => cancel.cancel(),
                    Err(e) => break Err(e),
                },
            }
        };

        self.state = ConnectionState::Ready;
        outcome
    }

    async fn emit_error_for(&mut self, err: &ServerError) -> ServerResult<()> {
        let severity = err.severity();
        let class = match severity {
            crate::error::Severity::Warning => 10,
            crate::error::Severity::Error => 16,
            crate::error::Severity::Critical => 20,
            crate::error::Severity::Fatal => 24,
        };

        if matches!(err, ServerError::Exec(ExecError::Cancelled)) {
            let reply = tokens::encode_done(tokens::TOKEN_DONE, done_status::ATTN, 0, 0);
            return self.write_packets(PacketType::TabularResult, &reply).await;
        }

        let mut reply = tokens::encode_info_or_error(
            true,
            err.sql_error_number(),
            1,
            class,
            &err.to_string(),
            &self.identity.program_name,
            "",
            0,
        );
        reply.extend_from_slice(&tokens::encode_done(
            tokens::TOKEN_DONEINPROC,
            done_status::ERROR,
            0,
            0,
        ));
        self.write_packets(PacketType::TabularResult, &reply).await
    }
}

fn decode_ucs2le_batch(payload: &[u8]) -> ServerResult<String> {
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::InvalidFraming("odd-length SQL batch payload".to_string()).into());
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ProtocolError::InvalidFraming("invalid UTF-16 in SQL batch".to_string()).into())
}

/// Parse an `sp_executesql` parameter declaration (`@id int, @name
/// nvarchar(50)`) into the `@name`s it declares; types are not modelled
/// here since binding only needs the name to key `ExecContext::params`.
fn parse_param_declaration(decl: &str) -> Vec<String> {
    decl.split(',')
        .filter_map(|part| part.trim().split_whitespace().next())
        .filter(|tok| tok.starts_with('@'))
        .map(|tok| tok.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ucs2le_batch_rejects_odd_length() {
        let err = decode_ucs2le_batch(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Protocol(ProtocolError::InvalidFraming(_))
        ));
    }

    #[test]
    fn parse_param_declaration_extracts_names() {
        let names = parse_param_declaration("@id int, @name nvarchar(50)");
        assert_eq!(names, vec!["@id".to_string(), "@name".to_string()]);
    }

    #[test]
    fn parse_param_declaration_handles_empty_string() {
        assert!(parse_param_declaration("").is_empty());
    }

    fn test_runtime() -> (Arc<Registry>, Arc<Runtime>) {
        let registry = Arc::new(Registry::new());
        let storage = Arc::new(crate::storage::MemoryStorage::new());
        let manager = Arc::new(crate::compile::Manager::spawn(Arc::new(crate::compile::DisabledTranspiler), 1));
        let runtime = Runtime::new(registry.clone(), storage, manager, crate::config::RuntimeConfig::default());
        (registry, runtime)
    }

    /// §4.1.2: a listener with no TLS configured must advertise
    /// `NotSupported`, which makes a client that requires encryption
    /// hit the Deny branch (a single `N` byte, then close).
    #[tokio::test]
    async fn prelogin_denies_required_encryption_when_tls_unavailable() {
        let (registry, runtime) = test_runtime();
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::with_collaborators(server, registry, runtime, None, None, "master", false);

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let client_prelogin = PreLogin::default().with_encryption(EncryptionLevel::Required).encode();
        let packet = Packet {
            packet_type: PacketType::PreLogin,
            status: PacketStatus::EOM,
            spid: 0,
            packet_id: 1,
            window: 0,
            payload: client_prelogin,
        };
        client_write.write_all(&packet.encode()).await.unwrap();

        connection.handle_prelogin().await.unwrap();
        assert_eq!(connection.state, ConnectionState::Closed);

        let mut reply = [0u8; 1];
        client_read.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"N");
    }

    /// §4.1.2: with TLS configured on the listener, `NotSupported`
    /// never applies, so a client requiring encryption negotiates a
    /// (still cleartext, per the Non-goal) upgrade instead of Deny.
    #[tokio::test]
    async fn prelogin_accepts_required_encryption_when_tls_available() {
        let (registry, runtime) = test_runtime();
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::with_collaborators(server, registry, runtime, None, None, "master", true);

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let client_prelogin = PreLogin::default().with_encryption(EncryptionLevel::Required).encode();
        let packet = Packet {
            packet_type: PacketType::PreLogin,
            status: PacketStatus::EOM,
            spid: 0,
            packet_id: 1,
            window: 0,
            payload: client_prelogin,
        };
        client_write.write_all(&packet.encode()).await.unwrap();

        connection.handle_prelogin().await.unwrap();
        assert_eq!(connection.state, ConnectionState::AwaitLogin7);

        let mut header = [0u8; HEADER_LEN];
        client_read.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], PacketType::PreLogin as u8);
    }
}
