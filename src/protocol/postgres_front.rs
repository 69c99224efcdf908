//! PostgreSQL wire-protocol front end — stub (§6, §9).
//!
//! Wire-accurate PostgreSQL support is out of scope (§1); this exists
//! only so a `Postgres`-tagged [`crate::config::ListenerConfig`] has
//! something to bind to and log against instead of silently vanishing
//! from the listener capability set.

use log::info;
use tokio::net::TcpStream;

use crate::error::{ServerError, ServerResult};

/// Accepts a connection on a `Postgres`-tagged listener and reports
/// that this host does not speak the wire protocol, instead of leaving
/// the client to time out against a silently dead socket.
pub struct PostgresFront;

impl PostgresFront {
    pub async fn handle(stream: TcpStream) -> ServerResult<()> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(target: "protocol::postgres_front", "rejecting PostgreSQL-wire connection from {peer}: not implemented");
        Err(ServerError::NotImplemented(
            "PostgreSQL wire protocol is not implemented by this host".to_string(),
        ))
    }
}
