//! Control socket for the cache daemon

pub mod protocol;
pub mod server;

pub use protocol::{parse_command, serialize_response, Command, Response, PROTOCOL_VERSION};
pub use server::IpcServer;
