//! Workstation-side client for tether agents.
//!
//! [`Session`] speaks the wire protocol over one TCP connection with the
//! one-request-in-flight discipline and exposes a typed method per opcode.
//! [`Manager`] tracks a fleet of devices across sessions: connect timeout,
//! idle heartbeat, and reconnection.

mod error;
mod manager;
mod session;
mod types;

pub use error::{Error, Result};
pub use manager::{Device, DeviceInfo, DeviceState, Manager, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL};
pub use session::{Progress, Session};
pub use types::{DirEntry, ExecOutput, ProcessInfo, Response, SocketInfo, SysInfo, UserInfo};
