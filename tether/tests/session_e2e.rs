//! End-to-end protocol tests: a real agent session on one thread, the
//! client facade on another, over loopback TCP.

use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use tether::{Error, Session};
use tether_proto::{
    encode_hello, read_frame, write_frame, Error as ProtoError, Message, Writer, EMPTY_MAP,
};

/// Starts a one-connection agent and returns its address.
fn spawn_agent() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut session = tether_agent::Session::new(stream, None).expect("session");
        // EOF from the client ends the loop cleanly; anything else is a
        // test-visible panic.
        if let Err(e) = session.handshake(false).and_then(|()| session.run()) {
            panic!("agent session failed: {e}");
        }
    });
    (addr, handle)
}

/// Starts an agent that tolerates protocol errors (for negative tests).
fn spawn_lenient_agent() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut session = tether_agent::Session::new(stream, None).expect("session");
        let _ = session.handshake(false).and_then(|()| session.run());
    });
    addr
}

/// Unique scratch directory per test.
fn temp_dir(tag: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "tether-test-{tag}-{}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn pwd_after_handshake_is_absolute() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).expect("connect");
    assert_eq!(session.peer_version(), 1);

    let path = session.pwd().expect("pwd");
    assert!(path.starts_with('/'), "pwd returned {path:?}");

    drop(session);
    agent.join().unwrap();
}

#[test]
fn reverse_mode_handshake() {
    // Workstation listens; agent dials and initiates the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let agent = thread::spawn(move || {
        let stream = TcpStream::connect(addr).expect("agent dial");
        let mut session = tether_agent::Session::new(stream, None).expect("session");
        session.handshake(true).expect("agent handshake");
        assert_eq!(session.peer_version(), 1);
        let _ = session.run();
    });

    let (stream, _) = listener.accept().unwrap();
    let session = Session::accept(stream).expect("accept handshake");
    assert_eq!(session.peer_version(), 1);
    assert!(session.pwd().expect("pwd over reverse session").starts_with('/'));

    drop(session);
    agent.join().unwrap();
}

#[test]
fn cd_to_nonexistent_leaves_cwd_unchanged() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let before = session.pwd().unwrap();
    let err = session.cd("/does/not/exist").expect_err("cd must fail");
    match &err {
        Error::Command(msg) => assert!(msg.contains("no such"), "unexpected error: {msg}"),
        other => panic!("expected command failure, got {other:?}"),
    }
    assert_eq!(session.pwd().unwrap(), before);

    drop(session);
    agent.join().unwrap();
}

#[test]
fn request_ids_are_strictly_increasing() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let mut last = 0u32;
    for _ in 0..5 {
        let id = session.send_request("pwd", EMPTY_MAP).unwrap();
        let resp = session.recv_response().unwrap();
        assert!(id > last, "ids must increase: {last} then {id}");
        assert_eq!(resp.id, id);
        assert!(resp.ok);
        last = id;
    }

    drop(session);
    agent.join().unwrap();
}

#[test]
fn pull_100k_of_0x41() {
    let dir = temp_dir("pull");
    let path = dir.join("payload.bin");
    fs::write(&path, vec![0x41u8; 100_000]).unwrap();

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let mut observed = Vec::new();
    let mut progress = |t: u64, total: u64| observed.push((t, total));
    let (bytes, mode) = session
        .pull(path.to_str().unwrap(), Some(&mut progress))
        .expect("pull");

    assert_eq!(bytes.len(), 100_000);
    assert!(bytes.iter().all(|&b| b == 0x41));
    assert_eq!(mode, fs::metadata(&path).unwrap().permissions().mode() & 0o777);

    // 100000 bytes at 64 KiB per chunk is exactly two Data frames.
    assert_eq!(observed, vec![(65_536, 100_000), (100_000, 100_000)]);

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn push_then_pull_roundtrip_with_mode() {
    let dir = temp_dir("push");
    let path = dir.join("uploaded.bin");

    // Deterministic pseudo-random payload, three chunks' worth.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let bytes: Vec<u8> = (0..200_000)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) as u8
        })
        .collect();

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let mut observed = Vec::new();
    let mut progress = |t: u64, total: u64| observed.push((t, total));
    session
        .push(path.to_str().unwrap(), &bytes, 0o640, Some(&mut progress))
        .expect("push");

    // seq 0, 1, 2: two full 64 KiB chunks and a 68 928-byte tail.
    assert_eq!(
        observed,
        vec![(65_536, 200_000), (131_072, 200_000), (200_000, 200_000)]
    );

    // push carries no final ack, so order the local checks behind the next
    // request: the agent finishes writing before it answers the pull.
    let (roundtrip, mode) = session.pull(path.to_str().unwrap(), None).expect("pull back");
    assert_eq!(roundtrip, bytes);
    assert_eq!(mode, 0o640);

    let meta = fs::metadata(&path).unwrap();
    assert_eq!(meta.len(), 200_000);
    assert_eq!(meta.permissions().mode() & 0o777, 0o640);

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn push_empty_file_still_terminates_stream() {
    let dir = temp_dir("push-empty");
    let path = dir.join("empty.bin");

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    session
        .push(path.to_str().unwrap(), &[], 0o600, None)
        .expect("push empty");

    // The session must still be usable afterwards; the answered pwd also
    // orders the agent's write ahead of the local metadata check.
    assert!(session.pwd().is_ok());
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn pull_of_directory_fails_without_killing_session() {
    let dir = temp_dir("pull-dir");

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let err = session
        .pull(dir.to_str().unwrap(), None)
        .expect_err("pulling a directory must fail");
    assert!(err.is_command_failure(), "got {err:?}");
    assert!(session.pwd().is_ok());

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn malformed_response_closes_session() {
    // A fake agent that handshakes, then answers the first request with a
    // payload whose first byte is not in the supported subset.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut stream = stream;
        let hello = read_frame(&mut stream).unwrap();
        assert!(matches!(
            Message::decode(&hello).unwrap(),
            Message::Hello { .. }
        ));
        write_frame(&mut stream, &tether_proto::encode_hello_ack(true)).unwrap();

        let _request = read_frame(&mut stream).unwrap();
        write_frame(&mut stream, &[0xff, 0x00]).unwrap();
        // Hold the socket open long enough for the client to read.
        let _ = read_frame(&mut stream);
    });

    let session = Session::connect(addr).unwrap();
    let err = session.pwd().expect_err("malformed response must fail");
    match err {
        Error::Protocol(ProtoError::MalformedValue(_))
        | Error::Protocol(ProtoError::MalformedMessage(_)) => {}
        other => panic!("expected malformed error, got {other:?}"),
    }

    let err = session.pwd().expect_err("session must be closed");
    assert!(
        matches!(err, Error::Protocol(ProtoError::SessionClosed)),
        "got {err:?}"
    );
}

#[test]
fn unknown_command_keeps_session_alive() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let err = session.request("flarp", EMPTY_MAP).expect_err("flarp");
    match &err {
        Error::Command(msg) => assert_eq!(msg, "unknown command"),
        other => panic!("expected command failure, got {other:?}"),
    }
    assert!(session.pwd().is_ok());

    drop(session);
    agent.join().unwrap();
}

#[test]
fn unknown_keys_in_requests_are_tolerated() {
    // Drive the agent with hand-built frames carrying extra keys at both
    // the top level and inside args.
    let addr = spawn_lenient_agent();
    let mut stream = TcpStream::connect(addr).unwrap();

    write_frame(&mut stream, &encode_hello(false)).unwrap();
    let ack = read_frame(&mut stream).unwrap();
    assert!(matches!(
        Message::decode(&ack).unwrap(),
        Message::HelloAck { version: 1, .. }
    ));

    let mut payload = Writer::new();
    payload.put_map(5);
    payload.put_str("type");
    payload.put_str("req");
    payload.put_str("id");
    payload.put_uint(2);
    payload.put_str("cmd");
    payload.put_str("pwd");
    payload.put_str("args");
    payload.put_map(1);
    payload.put_str("color");
    payload.put_str("green");
    payload.put_str("shadow");
    payload.put_uint(99);
    write_frame(&mut stream, payload.as_bytes()).unwrap();

    let resp = read_frame(&mut stream).unwrap();
    match Message::decode(&resp).unwrap() {
        Message::Response { id, ok, data, .. } => {
            assert_eq!(id, 2);
            assert!(ok);
            let path = tether_proto::map_get_str(&data, "path").unwrap().unwrap();
            assert!(path.starts_with('/'));
        }
        other => panic!("expected Response, got {other:?}"),
    }
}

#[test]
fn filesystem_commands_roundtrip() {
    let dir = temp_dir("fsops");
    let dir_str = dir.to_str().unwrap();

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    // cd into the scratch dir so relative paths resolve there.
    let cwd = session.cd(dir_str).unwrap();
    assert_eq!(cwd, fs::canonicalize(&dir).unwrap().to_str().unwrap());

    session.mkdir("sub", Some(0o700)).unwrap();
    session
        .push("sub/file.txt", b"tether test data", 0o644, None)
        .unwrap();

    let entries = session.ls(Some("sub")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "file.txt");
    assert_eq!(entries[0].kind, "file");
    assert_eq!(entries[0].size, 16);
    assert_eq!(entries[0].mode, 0o644);
    assert!(entries[0].mtime > 0);

    assert_eq!(session.cat("sub/file.txt").unwrap(), b"tether test data");

    session.cp("sub/file.txt", "sub/copy.txt").unwrap();
    assert_eq!(session.cat("sub/copy.txt").unwrap(), b"tether test data");

    session.chmod("sub/copy.txt", 0o600).unwrap();
    let copy_meta = fs::metadata(dir.join("sub/copy.txt")).unwrap();
    assert_eq!(copy_meta.permissions().mode() & 0o777, 0o600);

    session.mv("sub/copy.txt", "sub/moved.txt").unwrap();
    assert!(!dir.join("sub/copy.txt").exists());
    assert!(dir.join("sub/moved.txt").exists());

    session.rm("sub/moved.txt").unwrap();
    session.rm("sub/file.txt").unwrap();
    session.rm("sub").unwrap();
    assert!(!dir.join("sub").exists());

    let resolved = session.realpath(".").unwrap();
    assert_eq!(resolved, cwd);

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn exec_captures_output_and_exit_code() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let out = session.exec("echo tether-exec-test").unwrap();
    assert_eq!(out.stdout, b"tether-exec-test\n");
    assert!(out.stderr.is_empty());
    assert_eq!(out.exit_code, 0);

    // A nonexistent program reports like a shell: 127 with a message.
    let out = session.exec("/no/such/binary").unwrap();
    assert_eq!(out.exit_code, 127);
    assert!(!out.stderr.is_empty());

    drop(session);
    agent.join().unwrap();
}

#[test]
fn introspection_commands_have_expected_shape() {
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let sys = session.uname().unwrap();
    assert!(!sys.sysname.is_empty());
    assert!(!sys.machine.is_empty());

    let user = session.whoami().unwrap();
    assert!(!user.user.is_empty());

    let procs = session.ps().unwrap();
    assert!(!procs.is_empty());
    let me = std::process::id() as u64;
    assert!(procs.iter().any(|p| p.pid == me), "own pid missing from ps");

    let cpuinfo = session.cpuinfo().unwrap();
    assert!(!cpuinfo.is_empty());

    drop(session);
    agent.join().unwrap();
}

#[test]
fn strings_extracts_printable_runs() {
    let dir = temp_dir("strings");
    let path = dir.join("blob.bin");
    let mut blob = vec![0u8, 1, 2];
    blob.extend_from_slice(b"hello-tether");
    blob.extend_from_slice(&[0xfe, 0xff]);
    blob.extend_from_slice(b"ok");
    blob.push(0);
    blob.extend_from_slice(b"worldwide");
    fs::write(&path, &blob).unwrap();

    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    // Default threshold drops the two-byte run.
    let out = session.strings(path.to_str().unwrap(), None).unwrap();
    assert_eq!(out, b"hello-tether\nworldwide\n");

    let out = session.strings(path.to_str().unwrap(), Some(2)).unwrap();
    assert_eq!(out, b"hello-tether\nok\nworldwide\n");

    drop(session);
    agent.join().unwrap();
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn kill_agent_requires_bind_mode() {
    // The test harness agent runs without a supervisor, as in reverse mode.
    let (addr, agent) = spawn_agent();
    let session = Session::connect(addr).unwrap();

    let err = session.kill_agent().expect_err("no supervisor to kill");
    assert!(err.is_command_failure());
    assert!(session.pwd().is_ok());

    drop(session);
    agent.join().unwrap();
}
