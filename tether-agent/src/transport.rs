//! TCP transport: listener setup and outbound connection.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use log::{debug, info};

/// Creates the listening socket for bind mode.
///
/// Binds the IPv6 any-address first, which on Linux yields a dual-stack
/// socket that also accepts IPv4 peers; falls back to IPv4-only when the
/// host has no IPv6 support.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    let listener = match TcpListener::bind(("::", port)) {
        Ok(l) => l,
        Err(e) => {
            debug!("ipv6 bind failed ({e}), falling back to ipv4");
            TcpListener::bind(("0.0.0.0", port))?
        }
    };
    info!("listening on port {port}");
    Ok(listener)
}

/// Dials the workstation for reverse mode.
///
/// Tries every resolved address in order, like the usual getaddrinfo loop.
pub fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                configure(&stream)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved")
    }))
}

/// Per-connection socket setup: disable Nagle for low request latency.
pub fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
