//! Client session: framing, request correlation, and the command facade.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use tether_proto::{
    encode_data, encode_hello, encode_hello_ack, encode_request, map_get_bin, map_get_str,
    map_get_uint, read_frame, write_frame, Error as ProtoError, Message, Reader, Writer,
    CHUNK_SIZE,
};

use crate::error::{Error, Result};
use crate::types::{DirEntry, ExecOutput, ProcessInfo, Response, SocketInfo, SysInfo, UserInfo};

/// Progress callback: `(bytes transferred, total bytes)`.
///
/// Invoked once per chunk. On cancellation (session drop) there is no
/// guarantee of a final call with the full byte count.
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64);

/// One protocol session over a TCP connection, workstation side.
///
/// At most one request is in flight at a time: the next Response read off
/// the wire always pairs with the last Request written, so no id table is
/// needed. The send mutex keeps multi-frame operations (push) from
/// interleaving if callers share the session across threads.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    send_mu: Mutex<()>,
    // Incremented before use; the first id on the wire is 2.
    next_id: AtomicU32,
    closed: AtomicBool,
    peer_version: u64,
    last_used: Mutex<Instant>,
}

impl Session {
    /// Dials an agent (bind mode) and performs the handshake.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::establish(stream, true)
    }

    /// Dials an agent with a connect timeout (bind mode).
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        Self::establish(stream, true)
    }

    /// Adopts a connection accepted from a dialing agent (reverse mode).
    pub fn accept(stream: TcpStream) -> Result<Self> {
        Self::establish(stream, false)
    }

    /// Wraps an established stream and runs the role-appropriate handshake.
    ///
    /// The initiator (whichever side dialed) sends Hello; the acceptor
    /// answers HelloAck. Any peer version ≥ 1 is accepted.
    pub fn establish(stream: TcpStream, is_initiator: bool) -> Result<Self> {
        stream.set_nodelay(true)?;
        let mut session = Self {
            stream,
            send_mu: Mutex::new(()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            peer_version: 0,
            last_used: Mutex::new(Instant::now()),
        };

        if is_initiator {
            write_frame(&mut &session.stream, &encode_hello(false))?;
            match Message::decode(&read_frame(&mut &session.stream)?)? {
                Message::HelloAck { version, .. } if version >= 1 => {
                    session.peer_version = version;
                }
                Message::HelloAck { .. } => {
                    return Err(ProtoError::MalformedMessage("unsupported peer version").into())
                }
                other => {
                    return Err(ProtoError::UnexpectedType {
                        expected: "hello_ack",
                        got: other.type_name().to_owned(),
                    }
                    .into())
                }
            }
        } else {
            match Message::decode(&read_frame(&mut &session.stream)?)? {
                Message::Hello { version, .. } if version >= 1 => {
                    session.peer_version = version;
                }
                Message::Hello { .. } => {
                    return Err(ProtoError::MalformedMessage("unsupported peer version").into())
                }
                other => {
                    return Err(ProtoError::UnexpectedType {
                        expected: "hello",
                        got: other.type_name().to_owned(),
                    }
                    .into())
                }
            }
            write_frame(&mut &session.stream, &encode_hello_ack(false))?;
        }

        debug!("handshake complete, peer version {}", session.peer_version);
        Ok(session)
    }

    /// Protocol version the agent advertised.
    pub fn peer_version(&self) -> u64 {
        self.peer_version
    }

    /// True once the session has seen a fatal error or been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How long since the session last carried a request.
    pub fn idle(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Closes the session. Idempotent; later calls fail with SessionClosed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ProtoError::SessionClosed.into());
        }
        Ok(())
    }

    /// Marks the session Closed and returns `err` unchanged.
    fn fatal(&self, err: Error) -> Error {
        if !matches!(err, Error::Command(_)) {
            self.close();
        }
        err
    }

    /// Sends one Request frame, returning the id it was assigned.
    pub fn send_request(&self, cmd: &str, args: &[u8]) -> Result<u32> {
        self.check_open()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = encode_request(id, cmd, args);
        let _guard = self.send_mu.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut &self.stream, &payload).map_err(|e| self.fatal(e.into()))?;
        self.touch();
        Ok(id)
    }

    /// Reads one frame and requires it to be a Response.
    pub fn recv_response(&self) -> Result<Response> {
        self.check_open()?;
        let payload = read_frame(&mut &self.stream).map_err(|e| self.fatal(e.into()))?;
        match Message::decode(&payload).map_err(|e| self.fatal(e.into()))? {
            Message::Response {
                id,
                ok,
                data,
                error,
            } => Ok(Response {
                id,
                ok,
                data,
                error,
            }),
            other => Err(self.fatal(
                ProtoError::UnexpectedType {
                    expected: "resp",
                    got: other.type_name().to_owned(),
                }
                .into(),
            )),
        }
    }

    /// One unary round trip: request out, Response in, `ok` enforced.
    ///
    /// Returns the raw data map; an `ok=false` answer becomes
    /// [`Error::Command`] and leaves the session usable.
    pub fn request(&self, cmd: &str, args: &[u8]) -> Result<Vec<u8>> {
        self.send_request(cmd, args)?;
        let resp = self.recv_response()?;
        if resp.ok {
            Ok(resp.data)
        } else {
            Err(Error::Command(resp.error))
        }
    }

    fn send_data_frame(&self, id: u32, seq: u32, chunk: &[u8], done: bool) -> Result<()> {
        let payload = encode_data(id, seq, chunk, done);
        let _guard = self.send_mu.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut &self.stream, &payload).map_err(|e| self.fatal(e.into()))
    }

    fn recv_message(&self) -> Result<Message> {
        self.check_open()?;
        let payload = read_frame(&mut &self.stream).map_err(|e| self.fatal(e.into()))?;
        Message::decode(&payload).map_err(|e| self.fatal(e.into()))
    }

    // ------------------------------------------------------------------
    // Streaming transfers
    // ------------------------------------------------------------------

    /// Downloads a file, returning its bytes and permission bits.
    ///
    /// Validates the Data stream: contiguous `seq` from 0, cumulative
    /// length within one chunk of the advertised size, and a full-length
    /// total once `done` arrives.
    pub fn pull(&self, path: &str, progress: Option<Progress<'_>>) -> Result<(Vec<u8>, u32)> {
        let mut args = Writer::new();
        args.put_map(1);
        args.put_str("path");
        args.put_str(path);

        let data = self.request("pull", args.as_bytes())?;
        let size = get_uint(&data, "size");
        let mode = narrow_u32(get_uint(&data, "mode")).map_err(|e| self.fatal(e))?;

        let mut buf = Vec::with_capacity(size.min(64 * 1024 * 1024) as usize);
        let mut expected_seq = 0u32;
        let mut progress = progress;

        loop {
            let (seq, chunk, done) = match self.recv_message()? {
                Message::Data {
                    seq, data, done, ..
                } => (seq, data, done),
                other => {
                    return Err(self.fatal(
                        ProtoError::UnexpectedType {
                            expected: "data",
                            got: other.type_name().to_owned(),
                        }
                        .into(),
                    ))
                }
            };
            if seq != expected_seq {
                return Err(self.fatal(
                    ProtoError::Stream(format!(
                        "sequence gap: expected {expected_seq}, got {seq}"
                    ))
                    .into(),
                ));
            }
            expected_seq = expected_seq.wrapping_add(1);

            buf.extend_from_slice(&chunk);
            let transferred = buf.len() as u64;
            if transferred > size.saturating_add(CHUNK_SIZE as u64) {
                return Err(self.fatal(
                    ProtoError::Stream(format!(
                        "transfer overflow: got {transferred} of {size} bytes"
                    ))
                    .into(),
                ));
            }
            if let Some(cb) = progress.as_deref_mut() {
                cb(transferred, size);
            }
            if done {
                break;
            }
        }

        if (buf.len() as u64) < size {
            return Err(self.fatal(
                ProtoError::Stream(format!(
                    "transfer truncated: got {} of {size} bytes",
                    buf.len()
                ))
                .into(),
            ));
        }

        self.touch();
        Ok((buf, mode))
    }

    /// Uploads `bytes` to `path` with the given permission bits.
    pub fn push(
        &self,
        path: &str,
        bytes: &[u8],
        mode: u32,
        progress: Option<Progress<'_>>,
    ) -> Result<()> {
        let mut args = Writer::new();
        args.put_map(3);
        args.put_str("path");
        args.put_str(path);
        args.put_str("size");
        args.put_uint(bytes.len() as u64);
        args.put_str("mode");
        args.put_uint(u64::from(mode));

        let id = self.send_request("push", args.as_bytes())?;
        let resp = self.recv_response()?;
        if !resp.ok {
            return Err(Error::Command(resp.error));
        }

        let total = bytes.len() as u64;
        let mut progress = progress;
        let mut seq = 0u32;

        if bytes.is_empty() {
            // Still terminate the stream so the agent sees done=true.
            self.send_data_frame(id, 0, &[], true)?;
            if let Some(cb) = progress.as_deref_mut() {
                cb(0, 0);
            }
        } else {
            let mut sent = 0usize;
            while sent < bytes.len() {
                let end = (sent + CHUNK_SIZE).min(bytes.len());
                let done = end == bytes.len();
                self.send_data_frame(id, seq, &bytes[sent..end], done)?;
                sent = end;
                seq = seq.wrapping_add(1);
                if let Some(cb) = progress.as_deref_mut() {
                    cb(sent as u64, total);
                }
            }
        }

        self.touch();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Command facade: one method per opcode
    // ------------------------------------------------------------------

    /// `pwd` — the agent's current working directory.
    pub fn pwd(&self) -> Result<String> {
        let data = self.request("pwd", tether_proto::EMPTY_MAP)?;
        Ok(get_str(&data, "path"))
    }

    /// `cd` — change the agent's working directory; returns the new cwd.
    pub fn cd(&self, path: &str) -> Result<String> {
        let data = self.request("cd", &path_args(path))?;
        Ok(get_str(&data, "path"))
    }

    /// `realpath` — canonicalize a path without changing the cwd.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let data = self.request("realpath", &path_args(path))?;
        Ok(get_str(&data, "path"))
    }

    /// `ls` — list a directory (the cwd when `path` is `None`).
    pub fn ls(&self, path: Option<&str>) -> Result<Vec<DirEntry>> {
        let args = match path {
            Some(p) => path_args(p),
            None => tether_proto::EMPTY_MAP.to_vec(),
        };
        let data = self.request("ls", &args)?;
        parse_array(&data, "entries", |r: &mut Reader<'_>| {
            let mut e = DirEntry::default();
            let count = r.read_map_header()?;
            for _ in 0..count {
                match r.read_str()? {
                    "name" => e.name = r.read_str()?.to_owned(),
                    "type" => e.kind = r.read_str()?.to_owned(),
                    "size" => e.size = r.read_uint()?,
                    "mode" => e.mode = r.read_uint()? as u32,
                    "mtime" => e.mtime = r.read_uint()?,
                    _ => r.skip_value()?,
                }
            }
            Ok(e)
        })
        .map_err(|e| self.fatal(e))
    }

    /// `cat` — a whole file, inline.
    pub fn cat(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.request("cat", &path_args(path))?;
        Ok(get_bin(&data, "content"))
    }

    /// `rm` — remove a file or empty directory.
    pub fn rm(&self, path: &str) -> Result<()> {
        self.request("rm", &path_args(path)).map(|_| ())
    }

    /// `mv` — rename within one filesystem.
    pub fn mv(&self, src: &str, dst: &str) -> Result<()> {
        self.request("mv", &src_dst_args(src, dst)).map(|_| ())
    }

    /// `cp` — copy a file, preserving permission bits.
    pub fn cp(&self, src: &str, dst: &str) -> Result<()> {
        self.request("cp", &src_dst_args(src, dst)).map(|_| ())
    }

    /// `mkdir` — create a directory (default mode 0o755).
    pub fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()> {
        let mut args = Writer::new();
        match mode {
            Some(m) => {
                args.put_map(2);
                args.put_str("path");
                args.put_str(path);
                args.put_str("mode");
                args.put_uint(u64::from(m));
            }
            None => {
                args.put_map(1);
                args.put_str("path");
                args.put_str(path);
            }
        }
        self.request("mkdir", args.as_bytes()).map(|_| ())
    }

    /// `chmod` — set permission bits.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mut args = Writer::new();
        args.put_map(2);
        args.put_str("path");
        args.put_str(path);
        args.put_str("mode");
        args.put_uint(u64::from(mode));
        self.request("chmod", args.as_bytes()).map(|_| ())
    }

    /// `uname` — kernel identification.
    pub fn uname(&self) -> Result<SysInfo> {
        let data = self.request("uname", tether_proto::EMPTY_MAP)?;
        Ok(SysInfo {
            sysname: get_str(&data, "sysname"),
            nodename: get_str(&data, "nodename"),
            release: get_str(&data, "release"),
            version: get_str(&data, "version"),
            machine: get_str(&data, "machine"),
        })
    }

    /// `whoami` — the agent's effective identity.
    pub fn whoami(&self) -> Result<UserInfo> {
        let data = self.request("whoami", tether_proto::EMPTY_MAP)?;
        Ok(UserInfo {
            user: get_str(&data, "user"),
            uid: get_uint(&data, "uid"),
            gid: get_uint(&data, "gid"),
        })
    }

    /// `ps` — process table.
    pub fn ps(&self) -> Result<Vec<ProcessInfo>> {
        let data = self.request("ps", tether_proto::EMPTY_MAP)?;
        parse_array(&data, "processes", |r: &mut Reader<'_>| {
            let mut p = ProcessInfo::default();
            let count = r.read_map_header()?;
            for _ in 0..count {
                match r.read_str()? {
                    "pid" => p.pid = r.read_uint()?,
                    "ppid" => p.ppid = r.read_uint()?,
                    "name" => p.name = r.read_str()?.to_owned(),
                    "state" => p.state = r.read_str()?.to_owned(),
                    "cmdline" => p.cmdline = r.read_str()?.to_owned(),
                    _ => r.skip_value()?,
                }
            }
            Ok(p)
        })
        .map_err(|e| self.fatal(e))
    }

    /// `ss` — socket table.
    pub fn ss(&self) -> Result<Vec<SocketInfo>> {
        let data = self.request("ss", tether_proto::EMPTY_MAP)?;
        parse_array(&data, "connections", |r: &mut Reader<'_>| {
            let mut s = SocketInfo::default();
            let count = r.read_map_header()?;
            for _ in 0..count {
                match r.read_str()? {
                    "proto" => s.proto = r.read_str()?.to_owned(),
                    "local_addr" => s.local_addr = r.read_str()?.to_owned(),
                    "local_port" => s.local_port = r.read_uint()?,
                    "remote_addr" => s.remote_addr = r.read_str()?.to_owned(),
                    "remote_port" => s.remote_port = r.read_uint()?,
                    "state" => s.state = r.read_str()?.to_owned(),
                    "pid" => s.pid = r.read_uint()?,
                    "process" => s.process = r.read_str()?.to_owned(),
                    _ => r.skip_value()?,
                }
            }
            Ok(s)
        })
        .map_err(|e| self.fatal(e))
    }

    /// `exec` — run a program on the device (no shell).
    pub fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut args = Writer::new();
        args.put_map(1);
        args.put_str("command");
        args.put_str(command);
        let data = self.request("exec", args.as_bytes())?;
        Ok(ExecOutput {
            stdout: get_bin(&data, "stdout"),
            stderr: get_bin(&data, "stderr"),
            exit_code: get_uint(&data, "exit_code"),
        })
    }

    /// `dmesg` — kernel ring buffer.
    pub fn dmesg(&self) -> Result<Vec<u8>> {
        let data = self.request("dmesg", tether_proto::EMPTY_MAP)?;
        Ok(get_bin(&data, "log"))
    }

    /// `cpuinfo` — raw /proc/cpuinfo.
    pub fn cpuinfo(&self) -> Result<Vec<u8>> {
        self.content_command("cpuinfo")
    }

    /// `mtd` — raw /proc/mtd partition table.
    pub fn mtd(&self) -> Result<Vec<u8>> {
        self.content_command("mtd")
    }

    /// `ip_addr` — interface summary text.
    pub fn ip_addr(&self) -> Result<Vec<u8>> {
        self.content_command("ip_addr")
    }

    /// `ip_route` — routing table text.
    pub fn ip_route(&self) -> Result<Vec<u8>> {
        self.content_command("ip_route")
    }

    /// `strings` — printable runs from a remote file.
    pub fn strings(&self, path: &str, min_len: Option<u64>) -> Result<Vec<u8>> {
        let mut args = Writer::new();
        match min_len {
            Some(n) => {
                args.put_map(2);
                args.put_str("path");
                args.put_str(path);
                args.put_str("min_len");
                args.put_uint(n);
            }
            None => {
                args.put_map(1);
                args.put_str("path");
                args.put_str(path);
            }
        }
        let data = self.request("strings", args.as_bytes())?;
        Ok(get_bin(&data, "content"))
    }

    /// `reboot` — restart the device; returns the acknowledged status.
    pub fn reboot(&self) -> Result<String> {
        let data = self.request("reboot", tether_proto::EMPTY_MAP)?;
        Ok(get_str(&data, "status"))
    }

    /// `kill-agent` — terminate the bind-mode supervisor process.
    pub fn kill_agent(&self) -> Result<u64> {
        let data = self.request("kill-agent", tether_proto::EMPTY_MAP)?;
        Ok(get_uint(&data, "killed_pid"))
    }

    fn content_command(&self, cmd: &str) -> Result<Vec<u8>> {
        let data = self.request(cmd, tether_proto::EMPTY_MAP)?;
        Ok(get_bin(&data, "content"))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn path_args(path: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_map(1);
    w.put_str("path");
    w.put_str(path);
    w.into_bytes()
}

fn src_dst_args(src: &str, dst: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_map(2);
    w.put_str("src");
    w.put_str(src);
    w.put_str("dst");
    w.put_str(dst);
    w.into_bytes()
}

// Zero-value projections: a missing or wrong-typed key reads as empty.

fn get_str(data: &[u8], key: &str) -> String {
    map_get_str(data, key).ok().flatten().unwrap_or_default()
}

fn get_uint(data: &[u8], key: &str) -> u64 {
    map_get_uint(data, key).ok().flatten().unwrap_or_default()
}

fn get_bin(data: &[u8], key: &str) -> Vec<u8> {
    map_get_bin(data, key).ok().flatten().unwrap_or_default()
}

fn narrow_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| ProtoError::MalformedMessage("value exceeds 32 bits").into())
}

/// Finds `key` in the data map and parses its array elements.
///
/// A missing key yields an empty vector; unknown sibling keys are skipped.
fn parse_array<T>(
    data: &[u8],
    key: &str,
    parse_item: impl Fn(&mut Reader<'_>) -> tether_proto::Result<T>,
) -> Result<Vec<T>> {
    let mut r = Reader::new(data);
    let count = r.read_map_header().map_err(Error::from)?;
    for _ in 0..count {
        let k = r.read_str().map_err(Error::from)?;
        if k == key {
            let len = r.read_array_header().map_err(Error::from)?;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(parse_item(&mut r).map_err(Error::from)?);
            }
            return Ok(items);
        }
        r.skip_value().map_err(Error::from)?;
    }
    Ok(Vec::new())
}
