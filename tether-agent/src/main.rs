//! tether agent binary.
//!
//! `tether-agent -l <port>` listens for workstation connections (bind
//! mode); `tether-agent -c <host:port>` dials out to a listening
//! workstation (reverse mode). Default port is 1337.
#![allow(unsafe_code)]

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::Parser;
use log::{error, info, warn};
use tether_agent::{transport, Session};
use tether_proto::DEFAULT_PORT;

/// Set by the SIGINT/SIGTERM handler; the accept loop polls it.
static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser)]
#[command(name = "tether-agent", version, about = "tether target-side agent")]
struct Cli {
    /// Connect out to a workstation (reverse mode).
    #[arg(short = 'c', long = "connect", value_name = "HOST:PORT", conflicts_with = "listen")]
    connect: Option<String>,

    /// Listen for workstation connections (bind mode).
    #[arg(short = 'l', long = "listen", value_name = "PORT")]
    listen: Option<u16>,
}

fn main() {
    env_logger::init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        // Usage problems exit 1, matching the embedded convention.
        eprintln!("{e}");
        process::exit(1);
    });

    setup_signals();

    let code = match (cli.connect, cli.listen) {
        (Some(target), None) => run_reverse_mode(&target),
        (None, Some(port)) => run_bind_mode(port),
        (None, None) => {
            eprintln!("error: one of -c <host:port> or -l <port> is required");
            eprintln!("run with --help for usage");
            1
        }
        (Some(_), Some(_)) => unreachable!("clap conflicts_with prevents this"),
    };
    process::exit(code);
}

/// Reverse mode: dial the workstation and serve a single session.
fn run_reverse_mode(target: &str) -> i32 {
    let Some((host, port)) = parse_host_port(target) else {
        eprintln!("error: invalid host:port format: {target}");
        return 1;
    };

    info!("connecting to {host}:{port}");
    let stream = match transport::connect(&host, port) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to connect to {host}:{port}: {e}");
            return 1;
        }
    };

    let mut session = match Session::new(stream, None) {
        Ok(s) => s,
        Err(e) => {
            error!("session setup failed: {e}");
            return 1;
        }
    };

    // The dialing side initiates the handshake.
    if let Err(e) = session.handshake(true).and_then(|()| session.run()) {
        error!("session error: {e}");
        return 1;
    }
    0
}

/// Bind mode: accept loop with one session thread per connection.
fn run_bind_mode(port: u16) -> i32 {
    let listener = match transport::listen(port) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to listen on port {port}: {e}");
            return 1;
        }
    };
    let supervisor = process::id();

    while RUNNING.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            // Shutdown signals interrupt accept; anything else is transient.
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        info!("client connected from {peer}");
        thread::spawn(move || {
            // Keep shutdown signals pointed at the accept loop's thread.
            block_shutdown_signals();
            let mut session = match Session::new(stream, Some(supervisor)) {
                Ok(s) => s,
                Err(e) => {
                    warn!("session setup failed: {e}");
                    return;
                }
            };
            if let Err(e) = session.handshake(false).and_then(|()| session.run()) {
                warn!("session error: {e}");
            }
        });
    }

    info!("shutting down");
    0
}

/// Splits `host:port`; a bare host gets the default port.
fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let Some((host, port)) = target.rsplit_once(':') else {
        return Some((target.to_owned(), DEFAULT_PORT));
    };
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok().filter(|&p| p != 0)?;
    Some((host.to_owned(), port))
}

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Installs the process signal dispositions.
///
/// SIGINT/SIGTERM flip the running flag without SA_RESTART so a blocked
/// accept(2) wakes with EINTR. SIGPIPE is ignored so writes to a vanished
/// peer surface as ordinary errors.
fn setup_signals() {
    // SAFETY: both sigaction structs are fully initialized and the handler
    // only touches an atomic flag.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction =
            on_shutdown_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());

        let mut ignore: libc::sigaction = std::mem::zeroed();
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut ignore.sa_mask);
        libc::sigaction(libc::SIGPIPE, &ignore, std::ptr::null_mut());
    }
}

/// Blocks SIGINT/SIGTERM in the calling thread so delivery lands on the
/// main thread, where accept(2) gets interrupted.
fn block_shutdown_signals() {
    // SAFETY: set is initialized by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::parse_host_port;

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port("192.168.1.50:4444"),
            Some(("192.168.1.50".to_owned(), 4444))
        );
        // A bare host falls back to the default port.
        assert_eq!(
            parse_host_port("device.local"),
            Some(("device.local".to_owned(), 1337))
        );
        assert_eq!(parse_host_port(":1337"), None);
        assert_eq!(parse_host_port("host:0"), None);
        assert_eq!(parse_host_port("host:notaport"), None);
    }
}
