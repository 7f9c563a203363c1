//! `tether` — workstation CLI for driving a target agent.
//!
//! Bind mode: `tether -c 192.168.1.50:1337 ls /etc`
//! Reverse mode: `tether -l 1337 pwd` (waits for the agent to dial in).

use std::fs;
use std::io::Write as _;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tether::{Error, Session, CONNECT_TIMEOUT};
use tether_proto::DEFAULT_PORT;

#[derive(Parser)]
#[command(name = "tether", version, about = "tether workstation client")]
struct Cli {
    /// Connect to a listening agent (bind mode).
    #[arg(short = 'c', long = "connect", value_name = "HOST:PORT", conflicts_with = "listen")]
    connect: Option<String>,

    /// Listen for a dialing agent (reverse mode).
    #[arg(short = 'l', long = "listen", value_name = "PORT")]
    listen: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a remote directory.
    Ls { path: Option<String> },
    /// Print the agent's working directory.
    Pwd,
    /// Change the agent's working directory.
    Cd { path: String },
    /// Canonicalize a remote path.
    Realpath { path: String },
    /// Print a remote file.
    Cat { path: String },
    /// Download a remote file.
    Pull { remote: String, local: String },
    /// Upload a local file.
    Push {
        local: String,
        remote: String,
        /// Permission bits for the remote file (octal).
        #[arg(long, value_parser = parse_octal)]
        mode: Option<u32>,
    },
    /// Remove a remote file or empty directory.
    Rm { path: String },
    /// Rename a remote path.
    Mv { src: String, dst: String },
    /// Copy a remote file.
    Cp { src: String, dst: String },
    /// Create a remote directory.
    Mkdir {
        path: String,
        #[arg(long, value_parser = parse_octal)]
        mode: Option<u32>,
    },
    /// Change remote permission bits.
    Chmod {
        #[arg(value_parser = parse_octal)]
        mode: u32,
        path: String,
    },
    /// Run a program on the device (no shell).
    Exec {
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Kernel identification.
    Uname,
    /// Agent identity.
    Whoami,
    /// Process table.
    Ps,
    /// Socket table.
    Ss,
    /// Kernel ring buffer.
    Dmesg,
    /// Raw /proc/cpuinfo.
    Cpuinfo,
    /// MTD partition table.
    Mtd,
    /// Printable runs from a remote file.
    Strings {
        path: String,
        #[arg(long)]
        min_len: Option<u64>,
    },
    /// Interface summary.
    IpAddr,
    /// Routing table.
    IpRoute,
    /// Reboot the device.
    Reboot,
    /// Terminate the bind-mode agent supervisor.
    KillAgent,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        // A remote command failure is normal output, not a crash.
        Err(e) => {
            match e.downcast_ref::<Error>() {
                Some(Error::Command(msg)) => eprintln!("Error: {msg}"),
                _ => eprintln!("error: {e:#}"),
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let session = match (&cli.connect, cli.listen) {
        (Some(target), None) => dial(target)?,
        (None, Some(port)) => wait_for_agent(port)?,
        _ => bail!("one of -c <host:port> or -l <port> is required"),
    };
    execute(&session, cli.command)
}

/// Bind mode: resolve and dial with the standard connect timeout.
fn dial(target: &str) -> Result<Session> {
    let (host, port) = match target.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() => {
            let port: u16 = p.parse().with_context(|| format!("invalid port: {p}"))?;
            (h.to_owned(), port)
        }
        Some(_) => bail!("invalid host:port format: {target}"),
        None => (target.to_owned(), DEFAULT_PORT),
    };

    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}"))?
        .next()
        .with_context(|| format!("no address for {host}"))?;

    info!("connecting to {addr}");
    Ok(Session::connect_timeout(&addr, CONNECT_TIMEOUT)?)
}

/// Reverse mode: accept exactly one agent connection.
fn wait_for_agent(port: u16) -> Result<Session> {
    let listener = TcpListener::bind(("::", port))
        .or_else(|_| TcpListener::bind(("0.0.0.0", port)))
        .with_context(|| format!("cannot listen on port {port}"))?;
    info!("waiting for agent on port {port}");

    let (stream, peer) = listener.accept().context("accept failed")?;
    info!("agent connected from {peer}");
    adopt(stream)
}

fn adopt(stream: TcpStream) -> Result<Session> {
    Ok(Session::accept(stream)?)
}

fn execute(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Ls { path } => {
            for e in session.ls(path.as_deref())? {
                println!("{:>4} {:o} {:>10} {}", e.kind, e.mode, e.size, e.name);
            }
        }
        Command::Pwd => println!("{}", session.pwd()?),
        Command::Cd { path } => println!("{}", session.cd(&path)?),
        Command::Realpath { path } => println!("{}", session.realpath(&path)?),
        Command::Cat { path } => {
            let content = session.cat(&path)?;
            std::io::stdout().write_all(&content)?;
        }
        Command::Pull { remote, local } => {
            let mut progress = |t: u64, total: u64| transfer_progress(t, total);
            let (bytes, mode) = session.pull(&remote, Some(&mut progress))?;
            eprintln!();
            fs::write(&local, &bytes).with_context(|| format!("write {local}"))?;
            fs::set_permissions(&local, fs::Permissions::from_mode(mode))?;
            println!("pulled {} bytes to {local} (mode {mode:o})", bytes.len());
        }
        Command::Push {
            local,
            remote,
            mode,
        } => {
            let bytes = fs::read(&local).with_context(|| format!("read {local}"))?;
            let mode = match mode {
                Some(m) => m,
                None => fs::metadata(&local)?.permissions().mode() & 0o777,
            };
            let mut progress = |t: u64, total: u64| transfer_progress(t, total);
            session.push(&remote, &bytes, mode, Some(&mut progress))?;
            eprintln!();
            println!("pushed {} bytes to {remote} (mode {mode:o})", bytes.len());
        }
        Command::Rm { path } => session.rm(&path)?,
        Command::Mv { src, dst } => session.mv(&src, &dst)?,
        Command::Cp { src, dst } => session.cp(&src, &dst)?,
        Command::Mkdir { path, mode } => session.mkdir(&path, mode)?,
        Command::Chmod { mode, path } => session.chmod(&path, mode)?,
        Command::Exec { command } => {
            let out = session.exec(&command.join(" "))?;
            std::io::stdout().write_all(&out.stdout)?;
            std::io::stderr().write_all(&out.stderr)?;
            if out.exit_code != 0 {
                std::process::exit(i32::try_from(out.exit_code).unwrap_or(1));
            }
        }
        Command::Uname => {
            let s = session.uname()?;
            println!(
                "{} {} {} {} {}",
                s.sysname, s.nodename, s.release, s.version, s.machine
            );
        }
        Command::Whoami => {
            let u = session.whoami()?;
            println!("{} (uid={} gid={})", u.user, u.uid, u.gid);
        }
        Command::Ps => {
            println!("{:>7} {:>7} {:>2} {}", "PID", "PPID", "S", "CMD");
            for p in session.ps()? {
                println!("{:>7} {:>7} {:>2} {}", p.pid, p.ppid, p.state, p.cmdline);
            }
        }
        Command::Ss => {
            for c in session.ss()? {
                println!(
                    "{:<5} {}:{} -> {}:{} {} pid={} {}",
                    c.proto,
                    c.local_addr,
                    c.local_port,
                    c.remote_addr,
                    c.remote_port,
                    c.state,
                    c.pid,
                    c.process
                );
            }
        }
        Command::Dmesg => std::io::stdout().write_all(&session.dmesg()?)?,
        Command::Cpuinfo => std::io::stdout().write_all(&session.cpuinfo()?)?,
        Command::Mtd => std::io::stdout().write_all(&session.mtd()?)?,
        Command::Strings { path, min_len } => {
            std::io::stdout().write_all(&session.strings(&path, min_len)?)?;
        }
        Command::IpAddr => std::io::stdout().write_all(&session.ip_addr()?)?,
        Command::IpRoute => std::io::stdout().write_all(&session.ip_route()?)?,
        Command::Reboot => println!("{}", session.reboot()?),
        Command::KillAgent => {
            let pid = session.kill_agent()?;
            println!("killed agent pid {pid}");
        }
    }
    Ok(())
}

fn transfer_progress(transferred: u64, total: u64) {
    if total > 0 {
        eprint!("\r{transferred}/{total} bytes ({}%)", transferred * 100 / total);
    } else {
        eprint!("\r{transferred} bytes");
    }
}

fn parse_octal(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| e.to_string())
}
