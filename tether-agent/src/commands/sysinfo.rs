//! System introspection commands: uname, whoami, ps, dmesg, cpuinfo,
//! mtd, strings.

use std::ffi::CStr;
use std::fs::{self, File};
use std::io::{BufReader, Read};

use log::debug;
use tether_proto::{Result, Writer};

use super::{str_arg, uint_arg};
use crate::session::Session;

/// `uname {}` — kernel identification via uname(2).
pub fn uname(sess: &mut Session, id: u32) -> Result<()> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: uts is a zeroed utsname the kernel fills in.
    if unsafe { libc::uname(&mut uts) } < 0 {
        return sess.send_err(id, &std::io::Error::last_os_error().to_string());
    }

    let mut w = Writer::with_capacity(512);
    w.put_map(5);
    w.put_str("sysname");
    w.put_str(&cchar_field(&uts.sysname));
    w.put_str("nodename");
    w.put_str(&cchar_field(&uts.nodename));
    w.put_str("release");
    w.put_str(&cchar_field(&uts.release));
    w.put_str("version");
    w.put_str(&cchar_field(&uts.version));
    w.put_str("machine");
    w.put_str(&cchar_field(&uts.machine));
    sess.send_ok(id, w.as_bytes())
}

/// `whoami {}` — effective identity of the agent process.
pub fn whoami(sess: &mut Session, id: u32) -> Result<()> {
    // SAFETY: getuid/getgid cannot fail.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let user = username_for(uid).unwrap_or_else(|| "unknown".to_owned());

    let mut w = Writer::with_capacity(128);
    w.put_map(3);
    w.put_str("user");
    w.put_str(&user);
    w.put_str("uid");
    w.put_uint(u64::from(uid));
    w.put_str("gid");
    w.put_uint(u64::from(gid));
    sess.send_ok(id, w.as_bytes())
}

/// `ps {}` — walk /proc for the process table.
pub fn ps(sess: &mut Session, id: u32) -> Result<()> {
    let dir = match fs::read_dir("/proc") {
        Ok(d) => d,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };

    let mut procs = Vec::new();
    for dent in dir {
        let Ok(dent) = dent else { continue };
        let name = dent.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        if let Some(info) = read_proc_info(pid) {
            procs.push(info);
        }
    }

    debug!("ps: found {} processes", procs.len());

    let mut w = Writer::with_capacity(8192);
    w.put_map(1);
    w.put_str("processes");
    w.put_array(procs.len());
    for p in &procs {
        w.put_map(5);
        w.put_str("pid");
        w.put_uint(p.pid);
        w.put_str("ppid");
        w.put_uint(p.ppid);
        w.put_str("name");
        w.put_str(&p.name);
        w.put_str("state");
        w.put_str(&p.state);
        w.put_str("cmdline");
        w.put_str(&p.cmdline);
    }
    sess.send_ok(id, w.as_bytes())
}

/// `dmesg {}` — drain the kernel ring buffer via klogctl(2).
pub fn dmesg(sess: &mut Session, id: u32) -> Result<()> {
    const SYSLOG_ACTION_READ_ALL: libc::c_int = 3;
    const SYSLOG_ACTION_SIZE_BUFFER: libc::c_int = 10;

    // SAFETY: the size query takes no buffer.
    let mut bufsize = unsafe { libc::klogctl(SYSLOG_ACTION_SIZE_BUFFER, std::ptr::null_mut(), 0) };
    if bufsize < 0 {
        return sess.send_err(id, &std::io::Error::last_os_error().to_string());
    }
    if bufsize == 0 {
        bufsize = 16384;
    }

    let mut buf = vec![0u8; bufsize as usize];
    // SAFETY: buf is valid for bufsize bytes and the kernel writes at most
    // that many.
    let len = unsafe {
        libc::klogctl(
            SYSLOG_ACTION_READ_ALL,
            buf.as_mut_ptr().cast::<libc::c_char>(),
            bufsize,
        )
    };
    if len < 0 {
        return sess.send_err(id, &std::io::Error::last_os_error().to_string());
    }

    debug!("dmesg: read {len} bytes from kernel log");

    let mut w = Writer::with_capacity(len as usize + 64);
    w.put_map(1);
    w.put_str("log");
    w.put_bin(&buf[..len as usize]);
    sess.send_ok(id, w.as_bytes())
}

/// `cpuinfo {}` — raw /proc/cpuinfo.
pub fn cpuinfo(sess: &mut Session, id: u32) -> Result<()> {
    send_file_content(sess, id, "/proc/cpuinfo")
}

/// `mtd {}` — raw /proc/mtd partition table.
pub fn mtd(sess: &mut Session, id: u32) -> Result<()> {
    send_file_content(sess, id, "/proc/mtd")
}

fn send_file_content(sess: &mut Session, id: u32, path: &str) -> Result<()> {
    match fs::read(path) {
        Ok(content) => {
            let mut w = Writer::with_capacity(content.len() + 64);
            w.put_map(1);
            w.put_str("content");
            w.put_bin(&content);
            sess.send_ok(id, w.as_bytes())
        }
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

/// `strings {path, min_len?}` — printable runs of at least `min_len`
/// characters (default 4), newline-separated.
pub fn strings(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    // Individual runs are capped like the classic tool caps its line buffer.
    const RUN_MAX: usize = 1023;

    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let min_len = uint_arg(args, "min_len").unwrap_or(4).max(1) as usize;

    let file = match File::open(sess.resolve(&path)) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };

    let mut output = Vec::new();
    let mut run: Vec<u8> = Vec::with_capacity(RUN_MAX);
    let flush = |run: &mut Vec<u8>, output: &mut Vec<u8>| {
        if run.len() >= min_len {
            output.extend_from_slice(run);
            output.push(b'\n');
        }
        run.clear();
    };

    let mut reader = BufReader::new(file);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                let c = byte[0];
                if (0x20..=0x7e).contains(&c) || c == b'\t' {
                    if run.len() < RUN_MAX {
                        run.push(c);
                    }
                } else {
                    flush(&mut run, &mut output);
                }
            }
            Err(e) => return sess.send_err(id, &e.to_string()),
        }
    }
    flush(&mut run, &mut output);

    debug!("strings: extracted {} bytes", output.len());

    let mut w = Writer::with_capacity(output.len() + 64);
    w.put_map(1);
    w.put_str("content");
    w.put_bin(&output);
    sess.send_ok(id, w.as_bytes())
}

struct ProcInfo {
    pid: u64,
    ppid: u64,
    name: String,
    state: String,
    cmdline: String,
}

/// Parses /proc/[pid]/stat and /proc/[pid]/cmdline.
///
/// The comm field may itself contain spaces and parentheses, so the stat
/// line is split at the last ')'.
fn read_proc_info(pid: u64) -> Option<ProcInfo> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = stat[open + 1..close].to_owned();

    let mut rest = stat[close + 1..].split_whitespace();
    let state = rest.next().unwrap_or("?").to_owned();
    let ppid = rest.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let mut cmdline = String::new();
    if let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) {
        let joined: Vec<u8> = raw
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect();
        cmdline = String::from_utf8_lossy(&joined).trim_end().to_owned();
    }
    if cmdline.is_empty() {
        // Kernel threads have no cmdline; render them bracketed like ps does.
        cmdline = format!("[{name}]");
    }

    Some(ProcInfo {
        pid,
        ppid,
        name,
        state,
        cmdline,
    })
}

/// NUL-terminated fixed C buffer to an owned string.
fn cchar_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Resolves a uid to a login name via getpwuid_r(3).
fn username_for(uid: libc::uid_t) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: all out-pointers reference live, correctly sized storage.
    let ret = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if ret != 0 || result.is_null() {
        return None;
    }
    // SAFETY: on success pw_name points into buf, NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}
