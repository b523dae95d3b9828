//! Wire model shared by the Kiln compilation server and its clients.
//!
//! Every client connection carries exactly one framed [`BuildRequest`]
//! followed by exactly one framed [`BuildResponse`]. A frame is a
//! little-endian `u32` payload length followed by the payload bytes:
//!
//! ```text
//! frame    := length:u32  payload[length]
//! request  := version:u32  count:u32  argument{count}
//! argument := id:u32  index:u32  string
//! response := kind:u32  body
//! string   := byte_length:u32  utf8-bytes
//! ```
//!
//! The crate performs no interpretation of build arguments beyond what the
//! server needs to route a request: the protocol version, the shutdown
//! marker, and the optional keep-alive override.

mod codec;
mod error;
mod keep_alive;
mod request;
mod response;

pub use codec::MAX_FRAME_BYTES;
pub use error::ProtocolError;
pub use keep_alive::KeepAlive;
pub use request::{ArgumentId, BuildRequest, PROTOCOL_VERSION, RequestArgument};
pub use response::{BuildResponse, ResponseKind};
