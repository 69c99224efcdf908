//! HTTP front end — stub (§6, §9).
//!
//! Like [`super::postgres_front`], present only so an
//! `Http`-tagged listener has a registered handler; no HTTP request
//! parsing happens here.

use log::info;
use tokio::net::TcpStream;

use crate::error::{ServerError, ServerResult};

pub struct HttpFront;

impl HttpFront {
    pub async fn handle(stream: TcpStream) -> ServerResult<()> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(target: "protocol::http_front", "rejecting HTTP connection from {peer}: not implemented");
        Err(ServerError::NotImplemented(
            "HTTP front end is not implemented by this host".to_string(),
        ))
    }
}
