//! Streamed file transfer: `pull` (agent → client) and `push` (client → agent).

use std::cmp;
use std::fs::{self, File};
use std::io::{Read, Write as _};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, warn};
use tether_proto::{Error, Message, Result, Writer, CHUNK_SIZE, EMPTY_MAP};

use super::{str_arg, uint_arg};
use crate::session::Session;

/// `pull {path}` — initial `{size, mode}` Response, then a Data stream.
///
/// MTD character devices stat as zero bytes, so for `/dev/mtd*` the true
/// partition size is queried from the driver instead (ioctl, then
/// `/proc/mtd` as a fallback).
pub fn pull(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let resolved = sess.resolve(&path);

    let mut file = match File::open(&resolved) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    let meta = match file.metadata() {
        Ok(m) => m,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    if meta.is_dir() {
        return sess.send_err(id, "is a directory");
    }

    let mut size = meta.len();
    if size == 0 && is_mtd_device(&resolved) {
        size = mtd_size(&file, &resolved).unwrap_or(0);
    }
    let mode = meta.permissions().mode() & 0o777;

    debug!("pull: {} size={size} mode={mode:o}", resolved.display());

    let mut w = Writer::with_capacity(64);
    w.put_map(2);
    w.put_str("size");
    w.put_uint(size);
    w.put_str("mode");
    w.put_uint(u64::from(mode));
    sess.send_ok(id, w.as_bytes())?;

    if size == 0 {
        return sess.send_data(id, 0, &[], true);
    }

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut seq = 0u32;
    let mut sent = 0u64;
    while sent < size {
        let want = cmp::min(CHUNK_SIZE as u64, size - sent) as usize;
        let n = match file.read(&mut chunk[..want]) {
            Ok(n) => n,
            Err(e) => {
                warn!("pull: read failed at {sent}/{size}: {e}");
                // Terminate the stream; the short total tells the client
                // the transfer was truncated.
                return sess.send_data(id, seq, &[], true);
            }
        };
        if n == 0 {
            return sess.send_data(id, seq, &[], true);
        }
        sent += n as u64;
        let done = sent >= size;
        sess.send_data(id, seq, &chunk[..n], done)?;
        seq = seq.wrapping_add(1);
    }
    debug!("pull: sent {sent} bytes in {seq} chunks");
    Ok(())
}

/// `push {path, size, mode}` — empty Response, then the client streams
/// `size` bytes of Data frames.
///
/// The file is truncated and its mode applied at open. Chunks are written
/// as they arrive; on a write failure the rest of the stream is drained
/// and an error Response is sent in its place.
pub fn push(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let size = uint_arg(args, "size").unwrap_or(0);
    let mode = uint_arg(args, "mode").unwrap_or(0o644) as u32 & 0o7777;
    let resolved = sess.resolve(&path);

    debug!("push: {} size={size} mode={mode:o}", resolved.display());

    let mut file = match super::fs::open_for_push(&resolved, mode) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };

    sess.send_ok(id, EMPTY_MAP)?;

    let mut received = 0u64;
    let mut expected_seq = 0u32;
    let mut write_error: Option<String> = None;

    loop {
        let (seq, data, done) = match sess.recv_message()? {
            Message::Data {
                seq, data, done, ..
            } => (seq, data, done),
            other => {
                let got = other.type_name().to_owned();
                return Err(Error::UnexpectedType {
                    expected: "data",
                    got,
                });
            }
        };
        if seq != expected_seq {
            return Err(Error::Stream(format!(
                "sequence gap: expected {expected_seq}, got {seq}"
            )));
        }
        expected_seq = expected_seq.wrapping_add(1);

        if write_error.is_none() && !data.is_empty() {
            match file.write_all(&data) {
                Ok(()) => received += data.len() as u64,
                Err(e) => {
                    warn!("push: write failed at {received}: {e}");
                    write_error = Some(e.to_string());
                }
            }
        }
        if done {
            break;
        }
    }

    if let Some(e) = write_error {
        let _ = fs::remove_file(&resolved);
        return sess.send_err(id, &e);
    }

    debug!("push: received {received} bytes in {expected_seq} chunks");
    Ok(())
}

/// True for paths under `/dev/mtd*` (including the read-only nodes).
fn is_mtd_device(path: &Path) -> bool {
    path.to_string_lossy().starts_with("/dev/mtd")
}

/// Asks the MTD driver for the partition size.
///
/// Prefers the MEMGETINFO ioctl; falls back to parsing `/proc/mtd` when
/// the ioctl is unavailable (old kernels, restricted devices).
fn mtd_size(file: &File, path: &Path) -> Option<u64> {
    if let Some(size) = mtd_size_ioctl(file) {
        return Some(size);
    }
    mtd_size_procfs(path)
}

/// `struct mtd_info_user` from `<mtd/mtd-abi.h>`.
#[repr(C)]
#[allow(dead_code)]
struct MtdInfoUser {
    kind: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    padding: u64,
}

/// `MEMGETINFO`: `_IOR('M', 1, struct mtd_info_user)`.
const MEMGETINFO: libc::c_ulong = 0x8020_4d01;

fn mtd_size_ioctl(file: &File) -> Option<u64> {
    let mut info: MtdInfoUser = unsafe { std::mem::zeroed() };
    // SAFETY: fd is valid for the lifetime of `file`; MEMGETINFO writes at
    // most size_of::<MtdInfoUser>() bytes into `info`.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), MEMGETINFO as _, &mut info) };
    if ret == 0 {
        Some(u64::from(info.size))
    } else {
        None
    }
}

fn mtd_size_procfs(path: &Path) -> Option<u64> {
    // Device node mtd3 (or mtd3ro) maps to the "mtd3:" line.
    let name = path.file_name()?.to_str()?;
    let name = name.strip_suffix("ro").unwrap_or(name);

    let table = fs::read_to_string("/proc/mtd").ok()?;
    for line in table.lines().skip(1) {
        let Some((dev, rest)) = line.split_once(':') else {
            continue;
        };
        if dev.trim() == name {
            let size_hex = rest.split_whitespace().next()?;
            return u64::from_str_radix(size_hex, 16).ok();
        }
    }
    None
}
