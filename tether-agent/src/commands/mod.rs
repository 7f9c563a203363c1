//! Command handlers, grouped the way the opcodes group.

pub mod exec;
pub mod fs;
pub mod net;
pub mod sysinfo;
pub mod transfer;

use tether_proto::{map_get_str, map_get_uint};

/// Extracts a string argument; a malformed args map counts as absent.
pub(crate) fn str_arg(args: &[u8], key: &str) -> Option<String> {
    map_get_str(args, key).ok().flatten()
}

/// Extracts an unsigned integer argument.
pub(crate) fn uint_arg(args: &[u8], key: &str) -> Option<u64> {
    map_get_uint(args, key).ok().flatten()
}
