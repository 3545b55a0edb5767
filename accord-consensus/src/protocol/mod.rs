//! Wire-level message model: typed requests, correlated responses and
//! their binary encoding.
pub mod codec;
pub mod messages;
pub mod status;

pub use codec::{from_bytes, to_bytes, ProtocolError, WireFormat};
pub use messages::*;
pub use status::{ErrorKind, Response, ResponseError, Status};
