//! Process execution and agent control commands.

use std::process::Command;

use log::{debug, info};
use tether_proto::{Result, Writer};

use super::str_arg;
use crate::session::Session;

/// `exec {command}` — run a program directly, no shell.
///
/// The command string is split on whitespace into argv; argv[0] is
/// executed as-is. Stdout and stderr are captured in full; the exit code
/// is the wait status, or 128 + signal for signal-terminated children.
pub fn exec(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(command) = str_arg(args, "command") else {
        return sess.send_err(id, "missing command argument");
    };

    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return sess.send_err(id, "invalid command");
    };
    let argv: Vec<&str> = parts.collect();

    debug!("exec: running '{command}'");

    // A failed spawn reports like a shell would: empty stdout, the spawn
    // error on stderr, exit code 127.
    let (stdout, stderr, exit_code) = match Command::new(program).args(&argv).output() {
        Ok(out) => {
            let exit_code = match out.status.code() {
                Some(code) => code as u64,
                None => {
                    use std::os::unix::process::ExitStatusExt;
                    128 + out.status.signal().unwrap_or(0) as u64
                }
            };
            (out.stdout, out.stderr, exit_code)
        }
        Err(e) => (Vec::new(), format!("exec: {e}\n").into_bytes(), 127),
    };

    debug!(
        "exec: exit_code={exit_code}, stdout={} bytes, stderr={} bytes",
        stdout.len(),
        stderr.len()
    );

    let mut w = Writer::with_capacity(128 + stdout.len() + stderr.len());
    w.put_map(3);
    w.put_str("stdout");
    w.put_bin(&stdout);
    w.put_str("stderr");
    w.put_bin(&stderr);
    w.put_str("exit_code");
    w.put_uint(exit_code);
    sess.send_ok(id, w.as_bytes())
}

/// `reboot {}` — acknowledge, sync, and restart the system.
///
/// The Response goes out before the syscall since a successful reboot
/// never returns. A returning syscall is reported as an error Response.
pub fn reboot(sess: &mut Session, id: u32) -> Result<()> {
    info!("reboot requested");

    let mut w = Writer::with_capacity(32);
    w.put_map(1);
    w.put_str("status");
    w.put_str("rebooting");
    sess.send_ok(id, w.as_bytes())?;

    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() };
    // SAFETY: plain restart request; no argument buffer involved.
    let ret = unsafe { libc::reboot(libc::LINUX_REBOOT_CMD_RESTART) };
    if ret < 0 {
        return sess.send_err(id, &std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

/// `kill-agent {}` — terminate the supervisor that owns the accept loop.
///
/// Only meaningful in bind mode, where the listening process serves as
/// the supervisor for every connection. The Response is sent before the
/// signal so it reaches the peer even as the process begins shutdown.
pub fn kill_agent(sess: &mut Session, id: u32) -> Result<()> {
    let Some(pid) = sess.supervisor() else {
        return sess.send_err(id, "not running in bind mode (no supervisor to kill)");
    };

    info!("killing supervisor (pid {pid})");

    let mut w = Writer::with_capacity(64);
    w.put_map(1);
    w.put_str("killed_pid");
    w.put_uint(u64::from(pid));
    sess.send_ok(id, w.as_bytes())?;

    // SAFETY: signaling the agent's own pid; the installed handler turns
    // this into a clean accept-loop shutdown.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret < 0 {
        return sess.send_err(id, &std::io::Error::last_os_error().to_string());
    }
    Ok(())
}
