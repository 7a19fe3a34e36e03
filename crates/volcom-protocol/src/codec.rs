//! Envelope framing: `[kind: u8][len: u32 BE][payload: len bytes]`.
//!
//! Payloads are JSON bodies of the per-kind structs; an Invite has an empty
//! payload. The explicit length means script and output text may contain any
//! bytes, including bytes that look like another envelope header.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{HEADER_LEN, MAX_PAYLOAD_BYTES, Message, MessageKind};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message kind tag {0:#04x}")]
    UnknownKind(u8),

    #[error("{kind} payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        kind: MessageKind,
        len: usize,
        max: usize,
    },

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("invite carries no payload, got {0} bytes")]
    UnexpectedPayload(usize),

    #[error("truncated envelope: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream codec for [`Message`] envelopes.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_payload: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = MessageKind::from_tag(src[0]).ok_or(CodecError::UnknownKind(src[0]))?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                kind,
                len,
                max: self.max_payload,
            });
        }

        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        decode_payload(kind, &payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let kind = msg.kind();
        let payload = encode_payload(&msg)?;
        if payload.len() > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                kind,
                len: payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind.tag());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Encode a single message as one datagram.
pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(msg.clone(), &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode a datagram that must hold exactly one envelope.
pub fn decode_datagram(datagram: &[u8]) -> Result<Message, CodecError> {
    let mut buf = BytesMut::from(datagram);
    match MessageCodec::new().decode(&mut buf)? {
        Some(msg) if buf.is_empty() => Ok(msg),
        Some(_) => Err(CodecError::TrailingBytes(buf.len())),
        None => {
            let expected = if datagram.len() < HEADER_LEN {
                HEADER_LEN
            } else {
                let len = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
                HEADER_LEN + len as usize
            };
            Err(CodecError::Truncated {
                expected,
                actual: datagram.len(),
            })
        }
    }
}

fn encode_payload(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let kind = msg.kind();
    let body = match msg {
        Message::Presence(presence) => serde_json::to_vec(presence),
        Message::Invite => return Ok(Vec::new()),
        Message::Task(task) => serde_json::to_vec(task),
        Message::Result(result) => serde_json::to_vec(result),
    };
    body.map_err(|source| CodecError::Payload { kind, source })
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message, CodecError> {
    let wrap = |source| CodecError::Payload { kind, source };
    match kind {
        MessageKind::Presence => serde_json::from_slice(payload)
            .map(Message::Presence)
            .map_err(wrap),
        MessageKind::Invite if payload.is_empty() => Ok(Message::Invite),
        MessageKind::Invite => Err(CodecError::UnexpectedPayload(payload.len())),
        MessageKind::Task => serde_json::from_slice(payload)
            .map(Message::Task)
            .map_err(wrap),
        MessageKind::Result => serde_json::from_slice(payload)
            .map(Message::Result)
            .map_err(wrap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Presence, Task, TaskResult};

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn invite_is_header_only() {
        let buf = encode(Message::Invite);
        assert_eq!(&buf[..], &[2, 0, 0, 0, 0]);
    }

    #[test]
    fn task_with_framing_markers_survives() {
        // Legacy prefixes, a fake envelope header and multi-byte text inside the script.
        let script = "TASKRESULT:BECOME_WORKER\u{3}\0\0\0\u{10}\n\r\nconsole.log('héllo ✓')";
        let task = Task {
            task_id: "t-1".to_string(),
            script: script.to_string(),
            engine: "node".to_string(),
        };
        let mut buf = encode(Message::Task(task.clone()));
        let decoded = MessageCodec::new().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Message::Task(task)));
        assert!(buf.is_empty());
    }

    #[test]
    fn result_output_survives() {
        let result = TaskResult {
            task_id: "t-2".to_string(),
            output: "RESULT:\u{4}\0\0\0\u{0}data:image/png;base64,iVBORw0KGgo=".to_string(),
            success: false,
        };
        let mut buf = encode(Message::Result(result.clone()));
        let decoded = MessageCodec::new().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Message::Result(result)));
    }

    #[test]
    fn frame_split_across_reads() {
        let task = Task::new("x".repeat(10_000), "sh");
        let encoded = encode(Message::Task(task.clone()));

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in encoded.chunks(7) {
            assert!(decoded.is_none(), "decoded before the last chunk arrived");
            buf.extend_from_slice(chunk);
            decoded = codec.decode(&mut buf).unwrap();
        }
        assert_eq!(decoded, Some(Message::Task(task)));
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = encode(Message::Invite);
        buf.extend_from_slice(&encode(Message::Task(Task::new("echo 1", "sh"))));

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Invite));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Message::Task(_))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0, 0][..]);
        let err = MessageCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnknownKind(9)));
    }

    #[test]
    fn oversized_length_rejected_before_buffering() {
        let mut codec = MessageCodec::with_max_payload(16);
        assert_eq!(codec.max_payload(), 16);
        assert_eq!(MessageCodec::default().max_payload(), MAX_PAYLOAD_BYTES);
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::Task.tag());
        buf.put_u32(17);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::PayloadTooLarge { len: 17, max: 16, .. }
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let mut codec = MessageCodec::with_max_payload(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Message::Task(Task::new("too long", "sh")), &mut buf)
            .unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn invite_with_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::Invite.tag());
        buf.put_u32(2);
        buf.extend_from_slice(b"{}");
        let err = MessageCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedPayload(2)));
    }

    #[test]
    fn body_must_match_kind() {
        let task = Task::new("echo 1", "sh");
        let body = serde_json::to_vec(&task).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::Presence.tag());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
        let err = MessageCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Payload {
                kind: MessageKind::Presence,
                ..
            }
        ));
    }

    #[test]
    fn presence_datagram_roundtrip() {
        let presence = Presence {
            address: "127.0.0.1:10002".parse().unwrap(),
            task_port: 10003,
            capability: "4 cores".to_string(),
        };
        let datagram = encode_datagram(&Message::Presence(presence.clone())).unwrap();
        assert_eq!(datagram[0], MessageKind::Presence.tag());
        assert_eq!(
            decode_datagram(&datagram).unwrap(),
            Message::Presence(presence)
        );
    }

    #[test]
    fn datagram_trailing_bytes_rejected() {
        let mut datagram = encode_datagram(&Message::Invite).unwrap();
        datagram.extend_from_slice(b"junk");
        let err = decode_datagram(&datagram).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(4)));
    }

    #[test]
    fn truncated_datagram_rejected() {
        let datagram = encode_datagram(&Message::Task(Task::new("echo hi", "sh"))).unwrap();
        let err = decode_datagram(&datagram[..datagram.len() - 3]).unwrap_err();
        match err {
            CodecError::Truncated { expected, actual } => {
                assert_eq!(expected, datagram.len());
                assert_eq!(actual, datagram.len() - 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = decode_datagram(b"IDL").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: HEADER_LEN,
                actual: 3
            }
        ));
    }

    #[test]
    fn legacy_plain_text_is_not_a_message() {
        assert!(decode_datagram(b"IDLE_PRESENCE").is_err());
        assert!(decode_datagram(br#"{"type":"IDLE_PRESENCE"}"#).is_err());
    }
}
