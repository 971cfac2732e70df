//! Wire protocol for the gossip layer.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON. The JSON object carries a top-level
//! `kind` string and a `payload` object; see [`WireMessage`].

mod framing;
mod wire;

pub use framing::{read_frame, write_frame, CodecError, MAX_FRAME_LEN};
pub use wire::WireMessage;
