//! Protocol front ends (§6). TDS is the primary, fully modelled front
//! end; `postgres_front`/`http_front` are thin stand-ins so
//! [`crate::server::Server`] can register a listener for every
//! [`crate::config::ListenerProtocol`] tag without special-casing the
//! ones this host doesn't speak (§1, §9 "represent listeners as a
//! capability set").

pub mod http_front;
pub mod postgres_front;
pub mod tds;

pub use http_front::HttpFront;
pub use postgres_front::PostgresFront;
