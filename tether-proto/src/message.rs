//! Typed protocol messages and their frame-payload encodings.
//!
//! Every message is a map with a mandatory `"type"` field. Decoding walks
//! the map once, storing recognized keys and skipping unknown ones, then
//! checks the mandatory fields for the discriminated type.

use crate::value::{Reader, Writer};
use crate::{Error, Result, EMPTY_MAP, PROTOCOL_VERSION};

/// A decoded frame payload.
///
/// `args` and `data` maps stay raw at this seam; each command projects
/// them into its own structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake initiation, sent by whichever side opened the connection.
    Hello {
        /// Advertised protocol version.
        version: u64,
        /// True when the sender is the agent.
        agent: bool,
    },
    /// Handshake acknowledgement from the accepting side.
    HelloAck {
        /// Version the acceptor settled on.
        version: u64,
        /// True when the sender is the agent.
        agent: bool,
    },
    /// Command request, client to agent.
    Request {
        /// Correlation id, strictly increasing per session.
        id: u32,
        /// Opcode string.
        cmd: String,
        /// Raw encoded argument map (an empty map when absent).
        args: Vec<u8>,
    },
    /// Command response, agent to client.
    Response {
        /// Correlation id echoed from the request.
        id: u32,
        /// Whether the command succeeded.
        ok: bool,
        /// Raw encoded result map; meaningful only when `ok`.
        data: Vec<u8>,
        /// Failure description; meaningful only when `!ok`, never empty.
        error: String,
    },
    /// One chunk of a streamed transfer.
    Data {
        /// Correlation id of the originating request.
        id: u32,
        /// Chunk sequence number, starting at 0.
        seq: u32,
        /// Chunk bytes; may be empty.
        data: Vec<u8>,
        /// True on the final chunk of the stream.
        done: bool,
    },
}

impl Message {
    /// The wire `type` string of this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::Request { .. } => "req",
            Message::Response { .. } => "resp",
            Message::Data { .. } => "data",
        }
    }

    /// Decodes one frame payload into a typed message.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let mut r = Reader::new(payload);
        let count = r.read_map_header()?;

        let mut type_str: Option<String> = None;
        let mut version: Option<u64> = None;
        let mut agent: Option<bool> = None;
        let mut id: Option<u64> = None;
        let mut cmd: Option<String> = None;
        let mut args: Option<Vec<u8>> = None;
        let mut ok: Option<bool> = None;
        let mut data: Option<Vec<u8>> = None;
        let mut error: Option<String> = None;
        let mut seq: Option<u64> = None;
        let mut done: Option<bool> = None;

        for _ in 0..count {
            let key = r.read_str()?;
            match key {
                "type" => type_str = Some(r.read_str()?.to_owned()),
                "version" => version = Some(r.read_uint()?),
                "agent" => agent = Some(r.read_bool()?),
                "id" => id = Some(r.read_uint()?),
                "cmd" => cmd = Some(r.read_str()?.to_owned()),
                "args" => args = Some(r.value_bytes()?.to_vec()),
                "ok" => ok = Some(r.read_bool()?),
                // Shape depends on the message type, which may not have
                // been seen yet; capture raw and interpret below.
                "data" => data = Some(r.value_bytes()?.to_vec()),
                "error" => error = Some(r.read_str()?.to_owned()),
                "seq" => seq = Some(r.read_uint()?),
                "done" => done = Some(r.read_bool()?),
                _ => r.skip_value()?,
            }
        }

        let type_str = type_str.ok_or(Error::MalformedMessage("missing type field"))?;
        match type_str.as_str() {
            "hello" => Ok(Message::Hello {
                version: version.ok_or(Error::MalformedMessage("hello missing version"))?,
                agent: agent.ok_or(Error::MalformedMessage("hello missing agent flag"))?,
            }),
            "hello_ack" => Ok(Message::HelloAck {
                version: version.ok_or(Error::MalformedMessage("hello_ack missing version"))?,
                agent: agent.ok_or(Error::MalformedMessage("hello_ack missing agent flag"))?,
            }),
            "req" => Ok(Message::Request {
                id: narrow_u32(id.ok_or(Error::MalformedMessage("req missing id"))?)?,
                cmd: cmd.ok_or(Error::MalformedMessage("req missing cmd"))?,
                args: args.unwrap_or_else(|| EMPTY_MAP.to_vec()),
            }),
            "resp" => {
                let ok = ok.ok_or(Error::MalformedMessage("resp missing ok"))?;
                let error = match error {
                    Some(e) if !e.is_empty() => e,
                    _ if !ok => "unspecified error".to_owned(),
                    _ => String::new(),
                };
                Ok(Message::Response {
                    id: narrow_u32(id.ok_or(Error::MalformedMessage("resp missing id"))?)?,
                    ok,
                    data: data.unwrap_or_else(|| EMPTY_MAP.to_vec()),
                    error,
                })
            }
            "data" => {
                let raw = data.ok_or(Error::MalformedMessage("data missing chunk"))?;
                let chunk = Reader::new(&raw).read_bin()?.to_vec();
                Ok(Message::Data {
                    id: narrow_u32(id.ok_or(Error::MalformedMessage("data missing id"))?)?,
                    seq: narrow_u32(seq.ok_or(Error::MalformedMessage("data missing seq"))?)?,
                    data: chunk,
                    done: done.unwrap_or(false),
                })
            }
            _ => Err(Error::MalformedMessage("unrecognized type field")),
        }
    }
}

fn narrow_u32(v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::MalformedMessage("counter exceeds 32 bits"))
}

fn encode_greeting(type_str: &str, agent: bool) -> Vec<u8> {
    let mut w = Writer::with_capacity(64);
    w.put_map(3);
    w.put_str("type");
    w.put_str(type_str);
    w.put_str("version");
    w.put_uint(PROTOCOL_VERSION);
    w.put_str("agent");
    w.put_bool(agent);
    w.into_bytes()
}

/// Encodes a Hello payload for the connection initiator.
pub fn encode_hello(agent: bool) -> Vec<u8> {
    encode_greeting("hello", agent)
}

/// Encodes a HelloAck payload for the accepting side.
pub fn encode_hello_ack(agent: bool) -> Vec<u8> {
    encode_greeting("hello_ack", agent)
}

/// Encodes a Request payload. `args` must be a pre-encoded map.
pub fn encode_request(id: u32, cmd: &str, args: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(64 + args.len());
    w.put_map(4);
    w.put_str("type");
    w.put_str("req");
    w.put_str("id");
    w.put_uint(u64::from(id));
    w.put_str("cmd");
    w.put_str(cmd);
    w.put_str("args");
    w.put_raw(args);
    w.into_bytes()
}

/// Encodes a success Response. `data` must be a pre-encoded map.
pub fn encode_response_ok(id: u32, data: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(64 + data.len());
    w.put_map(4);
    w.put_str("type");
    w.put_str("resp");
    w.put_str("id");
    w.put_uint(u64::from(id));
    w.put_str("ok");
    w.put_bool(true);
    w.put_str("data");
    w.put_raw(data);
    w.into_bytes()
}

/// Encodes a failure Response carrying an error string.
pub fn encode_response_err(id: u32, error: &str) -> Vec<u8> {
    let mut w = Writer::with_capacity(96 + error.len());
    w.put_map(4);
    w.put_str("type");
    w.put_str("resp");
    w.put_str("id");
    w.put_uint(u64::from(id));
    w.put_str("ok");
    w.put_bool(false);
    w.put_str("error");
    w.put_str(error);
    w.into_bytes()
}

/// Encodes one Data chunk of a streamed transfer.
pub fn encode_data(id: u32, seq: u32, chunk: &[u8], done: bool) -> Vec<u8> {
    let mut w = Writer::with_capacity(64 + chunk.len());
    w.put_map(5);
    w.put_str("type");
    w.put_str("data");
    w.put_str("id");
    w.put_uint(u64::from(id));
    w.put_str("seq");
    w.put_uint(u64::from(seq));
    w.put_str("data");
    w.put_bin(chunk);
    w.put_str("done");
    w.put_bool(done);
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let payload = encode_hello(true);
        assert_eq!(
            Message::decode(&payload).unwrap(),
            Message::Hello {
                version: PROTOCOL_VERSION,
                agent: true
            }
        );

        let payload = encode_hello_ack(false);
        assert_eq!(
            Message::decode(&payload).unwrap(),
            Message::HelloAck {
                version: PROTOCOL_VERSION,
                agent: false
            }
        );
    }

    #[test]
    fn request_roundtrip_and_default_args() {
        let mut args = Writer::new();
        args.put_map(1);
        args.put_str("path");
        args.put_str("/etc");
        let payload = encode_request(7, "ls", args.as_bytes());

        match Message::decode(&payload).unwrap() {
            Message::Request { id, cmd, args } => {
                assert_eq!(id, 7);
                assert_eq!(cmd, "ls");
                assert_eq!(
                    crate::map_get_str(&args, "path").unwrap().as_deref(),
                    Some("/etc")
                );
            }
            other => panic!("expected Request, got {other:?}"),
        }

        // A request without an args key decodes to an empty map.
        let mut w = Writer::new();
        w.put_map(3);
        w.put_str("type");
        w.put_str("req");
        w.put_str("id");
        w.put_uint(3);
        w.put_str("cmd");
        w.put_str("pwd");
        match Message::decode(w.as_bytes()).unwrap() {
            Message::Request { args, .. } => assert_eq!(args, EMPTY_MAP),
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn response_defaults() {
        // ok=true with no data field: treated as an empty data map.
        let mut w = Writer::new();
        w.put_map(3);
        w.put_str("type");
        w.put_str("resp");
        w.put_str("id");
        w.put_uint(9);
        w.put_str("ok");
        w.put_bool(true);
        match Message::decode(w.as_bytes()).unwrap() {
            Message::Response { ok, data, .. } => {
                assert!(ok);
                assert_eq!(data, EMPTY_MAP);
            }
            other => panic!("expected Response, got {other:?}"),
        }

        // ok=false with no error field: generic error string.
        let mut w = Writer::new();
        w.put_map(3);
        w.put_str("type");
        w.put_str("resp");
        w.put_str("id");
        w.put_uint(9);
        w.put_str("ok");
        w.put_bool(false);
        match Message::decode(w.as_bytes()).unwrap() {
            Message::Response { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error, "unspecified error");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn data_roundtrip_and_empty_keepalive() {
        let payload = encode_data(4, 2, b"chunk bytes", false);
        assert_eq!(
            Message::decode(&payload).unwrap(),
            Message::Data {
                id: 4,
                seq: 2,
                data: b"chunk bytes".to_vec(),
                done: false
            }
        );

        // Zero-length chunk with done=false is a legal keep-alive marker.
        let payload = encode_data(4, 3, &[], false);
        match Message::decode(&payload).unwrap() {
            Message::Data { data, done, .. } => {
                assert!(data.is_empty());
                assert!(!done);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut w = Writer::new();
        w.put_map(5);
        w.put_str("type");
        w.put_str("req");
        w.put_str("trace");
        w.put_bin(&[0xde, 0xad]);
        w.put_str("id");
        w.put_uint(2);
        w.put_str("cmd");
        w.put_str("pwd");
        w.put_str("deadline");
        w.put_uint(999_999);
        match Message::decode(w.as_bytes()).unwrap() {
            Message::Request { id, cmd, .. } => {
                assert_eq!(id, 2);
                assert_eq!(cmd, "pwd");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn wide_id_encodings_are_accepted() {
        // An id of 2 sent as uint32 instead of fixint.
        let mut w = Writer::new();
        w.put_map(3);
        w.put_str("type");
        w.put_str("resp");
        w.put_str("id");
        w.put_raw(&[0xce, 0, 0, 0, 2]);
        w.put_str("ok");
        w.put_bool(true);
        match Message::decode(w.as_bytes()).unwrap() {
            Message::Response { id, .. } => assert_eq!(id, 2),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn missing_mandatory_fields_are_malformed() {
        // A req without a cmd.
        let mut w = Writer::new();
        w.put_map(2);
        w.put_str("type");
        w.put_str("req");
        w.put_str("id");
        w.put_uint(2);
        assert!(matches!(
            Message::decode(w.as_bytes()),
            Err(Error::MalformedMessage(_))
        ));

        // No type at all.
        let mut w = Writer::new();
        w.put_map(1);
        w.put_str("id");
        w.put_uint(2);
        assert!(matches!(
            Message::decode(w.as_bytes()),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn reserved_tag_payload_is_malformed() {
        assert!(matches!(
            Message::decode(&[0xff, 0x00]),
            Err(Error::MalformedValue(_))
        ));
    }

    #[test]
    fn id_wider_than_u32_is_rejected() {
        let mut w = Writer::new();
        w.put_map(3);
        w.put_str("type");
        w.put_str("req");
        w.put_str("id");
        w.put_uint(u64::from(u32::MAX) + 1);
        w.put_str("cmd");
        w.put_str("pwd");
        assert!(matches!(
            Message::decode(w.as_bytes()),
            Err(Error::MalformedMessage(_))
        ));
    }
}
