//! Per-connection protocol session: handshake and request loop.

use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tether_proto::{
    encode_data, encode_hello, encode_hello_ack, encode_response_err, encode_response_ok,
    read_frame, write_frame, Error, Message, Result,
};

use crate::dispatch;

/// State of one agent-side session over its TCP connection.
///
/// The working directory is per-session; concurrent sessions do not share
/// navigation state. `supervisor` carries the pid of the process owning the
/// bind-mode accept loop, the target of `kill-agent`.
pub struct Session {
    stream: TcpStream,
    cwd: PathBuf,
    peer_version: u64,
    supervisor: Option<u32>,
    closed: bool,
}

impl Session {
    /// Wraps an established connection. `supervisor` is `Some` in bind mode.
    pub fn new(stream: TcpStream, supervisor: Option<u32>) -> io::Result<Self> {
        crate::transport::configure(&stream)?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Ok(Self {
            stream,
            cwd,
            peer_version: 0,
            supervisor,
            closed: false,
        })
    }

    /// The session's current working directory (canonical absolute path).
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Replaces the working directory. The caller canonicalizes first.
    pub fn set_cwd(&mut self, cwd: PathBuf) {
        self.cwd = cwd;
    }

    /// Resolves a request path against the session cwd.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }

    /// Pid of the accept-loop owner, when running in bind mode.
    pub fn supervisor(&self) -> Option<u32> {
        self.supervisor
    }

    /// Protocol version advertised by the peer during the handshake.
    pub fn peer_version(&self) -> u64 {
        self.peer_version
    }

    /// Runs the handshake for this side of the connection.
    ///
    /// The initiator (whichever side dialed) sends Hello and expects
    /// HelloAck; the acceptor expects Hello and answers HelloAck. Any
    /// version ≥ 1 from the peer is accepted.
    pub fn handshake(&mut self, is_initiator: bool) -> Result<()> {
        if is_initiator {
            self.send_frame(&encode_hello(true))?;
            match self.recv_message()? {
                Message::HelloAck { version, .. } if version >= 1 => {
                    self.peer_version = version;
                }
                Message::HelloAck { .. } => return self.fail(Error::MalformedMessage(
                    "unsupported peer version",
                )),
                other => {
                    let got = other.type_name().to_owned();
                    return self.fail(Error::UnexpectedType {
                        expected: "hello_ack",
                        got,
                    });
                }
            }
        } else {
            match self.recv_message()? {
                Message::Hello { version, .. } if version >= 1 => {
                    self.peer_version = version;
                }
                Message::Hello { .. } => {
                    return self.fail(Error::MalformedMessage("unsupported peer version"))
                }
                other => {
                    let got = other.type_name().to_owned();
                    return self.fail(Error::UnexpectedType {
                        expected: "hello",
                        got,
                    });
                }
            }
            self.send_frame(&encode_hello_ack(true))?;
        }
        debug!("handshake complete, peer version {}", self.peer_version);
        Ok(())
    }

    /// Serves requests until the peer disconnects or a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        info!("session started, cwd={}", self.cwd.display());
        loop {
            let payload = match read_frame(&mut self.stream) {
                Ok(p) => p,
                // Clean disconnect between requests.
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.closed = true;
                    return Ok(());
                }
                Err(e) => return self.fail(e),
            };

            let msg = match Message::decode(&payload) {
                Ok(m) => m,
                Err(e) => return self.fail(e),
            };

            match msg {
                Message::Request { id, cmd, args } => {
                    debug!("request id={id} cmd={cmd}");
                    if let Err(e) = dispatch::handle(self, id, &cmd, &args) {
                        warn!("session error handling {cmd}: {e}");
                        return self.fail(e);
                    }
                }
                other => {
                    let got = other.type_name().to_owned();
                    return self.fail(Error::UnexpectedType {
                        expected: "req",
                        got,
                    });
                }
            }
        }
    }

    /// Sends one frame, serialized by `&mut self` exclusivity.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        write_frame(&mut self.stream, payload)
    }

    /// Reads and decodes one message.
    pub fn recv_message(&mut self) -> Result<Message> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let payload = read_frame(&mut self.stream)?;
        Message::decode(&payload)
    }

    /// Sends a success Response carrying a pre-encoded data map.
    pub fn send_ok(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.send_frame(&encode_response_ok(id, data))
    }

    /// Sends an error Response.
    pub fn send_err(&mut self, id: u32, error: &str) -> Result<()> {
        debug!("request {id} failed: {error}");
        self.send_frame(&encode_response_err(id, error))
    }

    /// Sends one Data chunk of a streamed transfer.
    pub fn send_data(&mut self, id: u32, seq: u32, chunk: &[u8], done: bool) -> Result<()> {
        self.send_frame(&encode_data(id, seq, chunk, done))
    }

    /// Marks the session Closed, shuts the socket down, and returns `err`.
    ///
    /// Closing is idempotent; later send/receive calls get `SessionClosed`.
    fn fail(&mut self, err: Error) -> Result<()> {
        self.close();
        Err(err)
    }

    /// Closes the underlying socket. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
