//! Framing: fixed-layout binary encoding of one `Message` per link frame.
//!
//! ```text
//! u8  kind | u8 ttl | u8 idLen id | u8 senderLen sender
//! u16 contentLen content | u8 roomLen room | i64 timestamp
//! ```
//! Multi-byte integers are big-endian. `roomLen == 0` means no room.

use crate::protocol::{Message, MessageKind, MAX_PACKET_SIZE, MAX_TTL};

const TIMESTAMP_SIZE: usize = 8;

/// Encode a message into one frame. Deterministic; fails rather than truncate.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    if msg.ttl > MAX_TTL {
        return Err(EncodeError::TtlOutOfRange(msg.ttl));
    }
    let id = short_field("id", &msg.id)?;
    let sender = short_field("sender", &msg.sender)?;
    let content = msg.content.as_bytes();
    if content.len() > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong {
            field: "content",
            len: content.len(),
            max: u16::MAX as usize,
        });
    }
    let room = short_field("room", msg.room.as_deref().unwrap_or(""))?;

    let len = 2 + 1 + id.len() + 1 + sender.len() + 2 + content.len() + 1 + room.len()
        + TIMESTAMP_SIZE;
    if len > MAX_PACKET_SIZE {
        return Err(EncodeError::FrameTooLarge(len));
    }
    let mut out = Vec::with_capacity(len);
    out.push(msg.kind.as_u8());
    out.push(msg.ttl);
    out.push(id.len() as u8);
    out.extend_from_slice(id);
    out.push(sender.len() as u8);
    out.extend_from_slice(sender);
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.extend_from_slice(content);
    out.push(room.len() as u8);
    out.extend_from_slice(room);
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    Ok(out)
}

/// Check a string against a one-byte length prefix.
pub(crate) fn short_field<'a>(field: &'static str, value: &'a str) -> Result<&'a [u8], EncodeError> {
    let bytes = value.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(EncodeError::FieldTooLong {
            field,
            len: bytes.len(),
            max: u8::MAX as usize,
        });
    }
    Ok(bytes)
}

/// Error encoding a message (field over its length prefix, frame over the link limit).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} is {len} bytes, limit {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("frame of {0} bytes exceeds {MAX_PACKET_SIZE}")]
    FrameTooLarge(usize),
    #[error("ttl {0} out of range")]
    TtlOutOfRange(u8),
}

/// Decode one frame. Bytes after the timestamp are ignored.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader { buf: bytes, pos: 0 };
    let kind_byte = r.u8()?;
    let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;
    let ttl = r.u8()?;
    if ttl > MAX_TTL {
        return Err(DecodeError::TtlOutOfRange(ttl));
    }
    let n = r.u8()? as usize;
    let id = r.string("id", n)?;
    let n = r.u8()? as usize;
    let sender = r.string("sender", n)?;
    let n = r.u16()? as usize;
    let content = r.string("content", n)?;
    let n = r.u8()? as usize;
    let room = r.string("room", n)?;
    let timestamp = i64::from_be_bytes(r.array::<TIMESTAMP_SIZE>()?);
    Ok(Message {
        id,
        kind,
        sender,
        content,
        room: if room.is_empty() { None } else { Some(room) },
        ttl,
        timestamp,
    })
}

/// Error decoding a frame (short buffer, bad prefix, unknown kind, bad UTF-8).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame: needed {needed} bytes at offset {offset}, {remaining} left")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("ttl {0} out of range")]
    TtlOutOfRange(u8),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn string(&mut self, field: &'static str, n: usize) -> Result<String, DecodeError> {
        let bytes = self.take(n)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chat() -> Message {
        Message::new(MessageKind::Chat, "alice", "hello mesh", MAX_TTL).with_room(Some("general"))
    }

    #[test]
    fn roundtrip_chat_with_room() {
        let msg = sample_chat();
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn roundtrip_every_kind() {
        for v in 0x01..=0x07u8 {
            let kind = MessageKind::from_u8(v).unwrap();
            let msg = Message::new(kind, "bob", "ü ✓", 0);
            assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn layout_is_fixed() {
        let msg = Message {
            id: "ab".into(),
            kind: MessageKind::JoinRoom,
            sender: "c".into(),
            content: "room".into(),
            room: None,
            ttl: 5,
            timestamp: 0x0102,
        };
        let frame = encode(&msg).unwrap();
        assert_eq!(
            frame,
            vec![
                0x03, 5, 2, b'a', b'b', 1, b'c', 0, 4, b'r', b'o', b'o', b'm', 0, 0, 0, 0, 0, 0,
                0, 0x01, 0x02
            ]
        );
    }

    #[test]
    fn every_truncation_fails() {
        let frame = encode(&sample_chat()).unwrap();
        for cut in 0..frame.len() {
            assert!(
                matches!(decode(&frame[..cut]), Err(DecodeError::Truncated { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn overlong_prefix_fails() {
        let mut frame = encode(&sample_chat()).unwrap();
        // idLen claims more bytes than the frame holds.
        frame[2] = 0xff;
        assert!(matches!(decode(&frame), Err(DecodeError::Truncated { .. })));

        let mut frame = encode(&sample_chat()).unwrap();
        let content_len_at = 3 + frame[2] as usize + 1 + frame[3 + frame[2] as usize] as usize;
        frame[content_len_at] = 0xff;
        frame[content_len_at + 1] = 0xff;
        assert!(matches!(decode(&frame), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut frame = encode(&sample_chat()).unwrap();
        frame[0] = 0x42;
        assert_eq!(decode(&frame), Err(DecodeError::UnknownKind(0x42)));
    }

    #[test]
    fn ttl_over_max_rejected() {
        let mut frame = encode(&sample_chat()).unwrap();
        frame[1] = MAX_TTL + 1;
        assert_eq!(decode(&frame), Err(DecodeError::TtlOutOfRange(MAX_TTL + 1)));

        let mut msg = sample_chat();
        msg.ttl = 9;
        assert_eq!(encode(&msg), Err(EncodeError::TtlOutOfRange(9)));
    }

    #[test]
    fn bad_utf8_rejected() {
        let msg = Message::new(MessageKind::Chat, "zz", "x", 1);
        let mut frame = encode(&msg).unwrap();
        let sender_at = 3 + frame[2] as usize + 1;
        frame[sender_at] = 0xff;
        assert_eq!(decode(&frame), Err(DecodeError::InvalidUtf8("sender")));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let msg = sample_chat();
        let mut frame = encode(&msg).unwrap();
        frame.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn oversized_fields_fail_to_encode() {
        let msg = Message::new(MessageKind::Chat, &"n".repeat(256), "hi", 1);
        assert!(matches!(
            encode(&msg),
            Err(EncodeError::FieldTooLong { field: "sender", .. })
        ));

        let msg = Message::new(MessageKind::Chat, "alice", &"x".repeat(600), 1);
        assert!(matches!(encode(&msg), Err(EncodeError::FrameTooLarge(_))));

        let msg = Message::new(MessageKind::Chat, "alice", &"x".repeat(70_000), 1);
        assert!(matches!(
            encode(&msg),
            Err(EncodeError::FieldTooLong { field: "content", .. })
        ));
    }

    #[test]
    fn largest_frame_fits() {
        let base = Message::new(MessageKind::Chat, "a", "", 1);
        let overhead = encode(&base).unwrap().len();
        let msg = Message::new(MessageKind::Chat, "a", &"x".repeat(MAX_PACKET_SIZE - overhead), 1);
        assert_eq!(encode(&msg).unwrap().len(), MAX_PACKET_SIZE);
    }
}
