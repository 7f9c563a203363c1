//! Wire protocol for tether workstation↔agent communication.
//!
//! Messages are MessagePack maps framed with a 4-byte big-endian length
//! prefix, suitable for any reliable byte stream. Only a curated subset of
//! MessagePack is used (unsigned ints, booleans, nil, strings, binary,
//! maps, arrays); the encoder always emits the minimum-width form so the
//! bytes match what a hand-rolled embedded peer produces.

mod error;
mod frame;
mod message;
mod value;

pub use error::{Error, Result};
pub use frame::{read_frame, write_frame};
pub use message::{
    encode_data, encode_hello, encode_hello_ack, encode_request, encode_response_err,
    encode_response_ok, Message,
};
pub use value::{map_get_bin, map_get_bool, map_get_str, map_get_uint, Reader, Writer};

/// Wire protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// Default TCP port for both bind and reverse mode.
pub const DEFAULT_PORT: u16 = 1337;

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Chunk size for streamed file transfers (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// An encoded empty map, the default for absent `args`/`data` fields.
pub const EMPTY_MAP: &[u8] = &[0x80];
