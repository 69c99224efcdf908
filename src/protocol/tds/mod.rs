//! TDS (Tabular Data Stream) wire protocol, versions 7.0 through 8.0
//! (§4.1). This is the primary front end: the CLI's `serve` subcommand
//! accepts TCP connections and drives each one through
//! [`connection::Connection`].

pub mod connection;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod tls;
pub mod tokens;
pub mod types;

pub use connection::{Connection, ConnectionState, ServerIdentity};
pub use login7::Login7;
pub use packet::{
    MessageReader, Packet, PacketStatus, PacketType, PacketWriter, ReadOutcome, DEFAULT_PACKET_SIZE,
    MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
pub use prelogin::{EncryptionLevel, EncryptionOutcome, PreLogin, PreLoginOption};
pub use rpc::{decode_rpc_request, BuiltinProcedure, ProcedureRef, RpcParam, RpcRequest};
pub use tls::{detect_client_hello_variant, ClientHelloVariant, TlsPreloginWrapper};
pub use types::TdsType;
