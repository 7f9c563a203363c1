//! Typed projections of command response maps.
//!
//! Fields the agent omits project to their zero values; keys the client
//! does not recognize are skipped during decoding.

/// A parsed Response frame, before any command-specific projection.
#[derive(Debug, Clone)]
pub struct Response {
    /// Correlation id echoed by the agent.
    pub id: u32,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Raw encoded result map; an empty map when the agent sent none.
    pub data: Vec<u8>,
    /// Agent error string; empty on success.
    pub error: String,
}

/// One `ls` directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// `"file"`, `"dir"`, `"link"`, or `"other"`.
    pub kind: String,
    pub size: u64,
    /// Low 9 permission bits.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
}

/// `uname` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysInfo {
    pub sysname: String,
    pub nodename: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

/// `whoami` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub user: String,
    pub uid: u64,
    pub gid: u64,
}

/// One `ps` process row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u64,
    pub ppid: u64,
    pub name: String,
    pub state: String,
    pub cmdline: String,
}

/// One `ss` socket row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketInfo {
    pub proto: String,
    pub local_addr: String,
    pub local_port: u64,
    pub remote_addr: String,
    pub remote_port: u64,
    pub state: String,
    pub pid: u64,
    pub process: String,
}

/// Captured output of a remote `exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Wait status, or 128 + signal number for signal deaths.
    pub exit_code: u64,
}
