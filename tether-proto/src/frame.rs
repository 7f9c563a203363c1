//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][payload]`. The payload is opaque
//! at this layer. Concurrent writers must be serialized by a caller-held
//! lock; within one call no partial frame is ever exposed.

use std::io::{Read, Write};

use crate::{Error, Result, MAX_FRAME};

/// Writes one frame: 4-byte big-endian length followed by the payload.
///
/// `write_all` retries interrupted and short writes, so either the whole
/// frame reaches the stream or an error is returned.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(Error::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame and returns its payload.
///
/// The length cap is checked before the payload buffer is allocated. A
/// declared length of zero yields an empty buffer, not an error.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head)?;
    let len = u32::from_be_bytes(head) as usize;
    if len > MAX_FRAME {
        return Err(Error::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").unwrap();
        assert_eq!(&buf[..4], &11u32.to_be_bytes());

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello frame");
    }

    #[test]
    fn empty_payload_is_empty_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[]).unwrap();
        assert_eq!(buf, 0u32.to_be_bytes());

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_oversized_frame_before_allocating() {
        // Header claims 32 MiB; no payload follows. If the cap check ran
        // after allocation, read_exact would fail with Io instead.
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut cursor = Cursor::new(&header[..]);
        match read_frame(&mut cursor) {
            Err(Error::TooLarge(len)) => assert_eq!(len, 32 * 1024 * 1024),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_payload_on_write() {
        let payload = vec![0u8; MAX_FRAME + 1];
        let mut buf = Vec::new();
        assert!(matches!(
            write_frame(&mut buf, &payload),
            Err(Error::TooLarge(_))
        ));
    }

    #[test]
    fn truncated_payload_is_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"full payload").unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = Cursor::new(&buf);
        assert!(matches!(read_frame(&mut cursor), Err(Error::Io(_))));
    }

    /// Reader that returns at most one byte per call.
    struct Dribble<R>(R);

    impl<R: Read> Read for Dribble<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.0.read(&mut buf[..1])
        }
    }

    /// Writer that accepts at most one byte per call.
    struct DribbleOut(Vec<u8>);

    impl Write for DribbleOut {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.0.push(buf[0]);
            Ok(1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn survives_short_reads_and_writes() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();

        let mut out = DribbleOut(Vec::new());
        write_frame(&mut out, &payload).unwrap();

        let mut dribble = Dribble(Cursor::new(&out.0));
        assert_eq!(read_frame(&mut dribble).unwrap(), payload);
    }
}
