//! tether agent — runs on the target device and serves protocol sessions.
//!
//! Each TCP connection gets its own [`Session`] with a private working
//! directory; the dispatcher routes request opcodes to command handlers
//! that answer with a Response (and, for transfers, a Data stream).
#![allow(unsafe_code)]

pub mod commands;
pub mod dispatch;
pub mod session;
pub mod transport;

pub use session::Session;
