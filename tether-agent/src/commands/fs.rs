//! Filesystem navigation, reading, and mutation commands.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};

use tether_proto::{Result, Writer, EMPTY_MAP, MAX_FRAME};

use super::str_arg;
use crate::session::Session;

/// Largest file `cat` will return inline; bigger files must use `pull`.
const CAT_MAX: u64 = (MAX_FRAME - 1024) as u64;

/// Copy buffer for `cp`.
const COPY_BUF: usize = 8192;

/// `ls {path?}` — list a directory with per-entry metadata.
///
/// Entries that fail to stat still appear, with zeroed fields and type
/// `other`. `.` and `..` are never included.
pub fn ls(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let path = match str_arg(args, "path") {
        Some(p) => sess.resolve(&p),
        None => sess.cwd().to_path_buf(),
    };

    let dir = match fs::read_dir(&path) {
        Ok(d) => d,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };

    struct Entry {
        name: String,
        kind: &'static str,
        size: u64,
        mode: u32,
        mtime: u64,
    }

    let mut entries = Vec::new();
    for dent in dir {
        let Ok(dent) = dent else { continue };
        let name = dent.file_name().to_string_lossy().into_owned();
        // metadata() on a DirEntry does not follow symlinks, so links
        // report as links rather than as their targets.
        match dent.metadata() {
            Ok(meta) => {
                let ft = meta.file_type();
                let kind = if ft.is_dir() {
                    "dir"
                } else if ft.is_symlink() {
                    "link"
                } else if ft.is_file() {
                    "file"
                } else {
                    "other"
                };
                entries.push(Entry {
                    name,
                    kind,
                    size: meta.len(),
                    mode: meta.mode() & 0o777,
                    mtime: u64::try_from(meta.mtime()).unwrap_or(0),
                });
            }
            Err(_) => entries.push(Entry {
                name,
                kind: "other",
                size: 0,
                mode: 0,
                mtime: 0,
            }),
        }
    }

    let mut w = Writer::with_capacity(4096);
    w.put_map(1);
    w.put_str("entries");
    w.put_array(entries.len());
    for e in &entries {
        w.put_map(5);
        w.put_str("name");
        w.put_str(&e.name);
        w.put_str("type");
        w.put_str(e.kind);
        w.put_str("size");
        w.put_uint(e.size);
        w.put_str("mode");
        w.put_uint(u64::from(e.mode));
        w.put_str("mtime");
        w.put_uint(e.mtime);
    }
    sess.send_ok(id, w.as_bytes())
}

/// `pwd {}` — report the session working directory.
pub fn pwd(sess: &mut Session, id: u32) -> Result<()> {
    let mut w = Writer::with_capacity(256);
    w.put_map(1);
    w.put_str("path");
    w.put_str(&sess.cwd().to_string_lossy());
    sess.send_ok(id, w.as_bytes())
}

/// `cd {path}` — change the session working directory.
///
/// The stored cwd is always the canonical realpath, so later relative
/// resolution cannot escape through stale symlinks.
pub fn cd(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let resolved = sess.resolve(&path);

    let meta = match fs::metadata(&resolved) {
        Ok(m) => m,
        Err(_) => return sess.send_err(id, "no such directory"),
    };
    if !meta.is_dir() {
        return sess.send_err(id, "not a directory");
    }

    let canonical = match fs::canonicalize(&resolved) {
        Ok(c) => c,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    sess.set_cwd(canonical);

    let mut w = Writer::with_capacity(256);
    w.put_map(1);
    w.put_str("path");
    w.put_str(&sess.cwd().to_string_lossy());
    sess.send_ok(id, w.as_bytes())
}

/// `realpath {path}` — canonicalize without changing the cwd.
pub fn realpath(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    match fs::canonicalize(sess.resolve(&path)) {
        Ok(canonical) => {
            let mut w = Writer::with_capacity(256);
            w.put_map(1);
            w.put_str("path");
            w.put_str(&canonical.to_string_lossy());
            sess.send_ok(id, w.as_bytes())
        }
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

/// `cat {path}` — return a whole file inline.
///
/// Regular files take the size-known fast path; files that stat as zero
/// bytes (procfs, sysfs) are read to EOF instead. Either way the size cap
/// is enforced before the payload is built.
pub fn cat(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };

    let mut file = match File::open(sess.resolve(&path)) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    match file.metadata() {
        Ok(m) if m.is_dir() => return sess.send_err(id, "is a directory"),
        _ => {}
    }

    let size = file.seek(SeekFrom::End(0)).unwrap_or(0);
    if size > CAT_MAX {
        return sess.send_err(id, "file too large");
    }
    if let Err(e) = file.seek(SeekFrom::Start(0)) {
        return sess.send_err(id, &e.to_string());
    }

    let mut content = Vec::with_capacity(size as usize);
    // Reads to EOF in both paths: virtual files lie about their size, and
    // take() bounds the regular-file path at the cap.
    if let Err(e) = file.take(CAT_MAX + 1).read_to_end(&mut content) {
        return sess.send_err(id, &e.to_string());
    }
    if content.len() as u64 > CAT_MAX {
        return sess.send_err(id, "file too large");
    }

    let mut w = Writer::with_capacity(content.len() + 64);
    w.put_map(2);
    w.put_str("content");
    w.put_bin(&content);
    w.put_str("size");
    w.put_uint(content.len() as u64);
    sess.send_ok(id, w.as_bytes())
}

/// `rm {path}` — unlink a file, or remove an empty directory.
pub fn rm(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let resolved = sess.resolve(&path);

    let meta = match fs::symlink_metadata(&resolved) {
        Ok(m) => m,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    let result = if meta.is_dir() {
        fs::remove_dir(&resolved)
    } else {
        fs::remove_file(&resolved)
    };
    match result {
        Ok(()) => sess.send_ok(id, EMPTY_MAP),
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

/// `mv {src, dst}` — atomic rename within one filesystem.
pub fn mv(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(src) = str_arg(args, "src") else {
        return sess.send_err(id, "missing src argument");
    };
    let Some(dst) = str_arg(args, "dst") else {
        return sess.send_err(id, "missing dst argument");
    };
    let src = sess.resolve(&src);
    let dst = sess.resolve(&dst);

    if fs::symlink_metadata(&src).is_err() {
        return sess.send_err(id, "source does not exist");
    }
    match fs::rename(&src, &dst) {
        Ok(()) => sess.send_ok(id, EMPTY_MAP),
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

/// `cp {src, dst}` — chunked file copy preserving the permission bits.
///
/// A partial destination is unlinked on any copy error.
pub fn cp(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(src) = str_arg(args, "src") else {
        return sess.send_err(id, "missing src argument");
    };
    let Some(dst) = str_arg(args, "dst") else {
        return sess.send_err(id, "missing dst argument");
    };
    let src = sess.resolve(&src);
    let dst = sess.resolve(&dst);

    let mut fsrc = match File::open(&src) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    let meta = match fsrc.metadata() {
        Ok(m) => m,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };
    if meta.is_dir() {
        return sess.send_err(id, "source is a directory");
    }

    let mut fdst = match File::create(&dst) {
        Ok(f) => f,
        Err(e) => return sess.send_err(id, &e.to_string()),
    };

    let mut buf = [0u8; COPY_BUF];
    loop {
        let n = match fsrc.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(fdst);
                let _ = fs::remove_file(&dst);
                return sess.send_err(id, &e.to_string());
            }
        };
        if let Err(e) = fdst.write_all(&buf[..n]) {
            drop(fdst);
            let _ = fs::remove_file(&dst);
            return sess.send_err(id, &e.to_string());
        }
    }

    let perms = fs::Permissions::from_mode(meta.mode() & 0o777);
    let _ = fs::set_permissions(&dst, perms);
    sess.send_ok(id, EMPTY_MAP)
}

/// `mkdir {path, mode?}` — create a directory, default mode 0o755.
pub fn mkdir(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let mode = super::uint_arg(args, "mode").unwrap_or(0o755);

    let mut builder = fs::DirBuilder::new();
    builder.mode(mode as u32);
    match builder.create(sess.resolve(&path)) {
        Ok(()) => sess.send_ok(id, EMPTY_MAP),
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

/// `chmod {path, mode}` — set the low 12 permission bits.
pub fn chmod(sess: &mut Session, id: u32, args: &[u8]) -> Result<()> {
    let Some(path) = str_arg(args, "path") else {
        return sess.send_err(id, "missing path argument");
    };
    let Some(mode) = super::uint_arg(args, "mode") else {
        return sess.send_err(id, "missing mode argument");
    };

    let perms = fs::Permissions::from_mode(mode as u32 & 0o7777);
    match fs::set_permissions(sess.resolve(&path), perms) {
        Ok(()) => sess.send_ok(id, EMPTY_MAP),
        Err(e) => sess.send_err(id, &e.to_string()),
    }
}

// Referenced by transfer::push for mode application.
pub(crate) fn open_for_push(path: &std::path::Path, mode: u32) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // mode() only applies at creation; re-apply for pre-existing files.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(file)
}
