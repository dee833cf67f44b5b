//! 帧编解码 / Frame encode/decode over a byte stream.
//!
//! 解码是增量式的：不完整的帧返回 `Ok(None)` 并保留缓冲区内容。
//! Decoding is incremental: a partial frame yields `Ok(None)` and leaves
//! the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::*;
use crate::ReasonCode;

/// 单帧体积上限 / Upper bound for a single frame body.
pub const MAX_FRAME_SIZE: usize = 1 << 22;

#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("remaining length varint overflow")]
    VarintOverflow,
    #[error("truncated frame body")]
    Truncated,
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
}

// ---------------------------------------------------------------------------
// 编码 / encoding
// ---------------------------------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut b = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            b |= 0x80;
        }
        buf.put_u8(b);
        if len == 0 {
            break;
        }
    }
}

/// 编码单帧为字节串 / Encode a single frame to bytes.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut body = BytesMut::new();
    let mut flags = 0u8;
    match frame {
        Frame::Connect(p) => {
            body.put_u8(p.version);
            body.put_u8(p.device_flag);
            put_str(&mut body, &p.device_id);
            put_str(&mut body, &p.uid);
            put_str(&mut body, &p.token);
            body.put_i64(p.client_timestamp);
            put_str(&mut body, &p.client_key);
        }
        Frame::Connack(p) => {
            flags = p.has_server_version as u8;
            body.put_i64(p.time_diff);
            body.put_u8(p.reason_code.to_u8());
            put_str(&mut body, &p.server_key);
            put_str(&mut body, &p.salt);
            if p.has_server_version {
                body.put_u8(p.server_version);
            }
        }
        Frame::Send(p) => {
            flags = p.framer.to_flags();
            body.put_u8(p.setting.to_u8());
            body.put_u32(p.client_seq);
            put_str(&mut body, &p.client_msg_no);
            put_str(&mut body, &p.channel_id);
            body.put_u8(p.channel_type);
            body.put_u32(p.expire);
            put_str(&mut body, &p.msg_key);
            if p.setting.stream {
                put_str(&mut body, &p.stream_no);
            }
            if p.setting.topic {
                put_str(&mut body, &p.topic);
            }
            body.put_slice(&p.payload);
        }
        Frame::Sendack(p) => {
            flags = p.framer.to_flags();
            body.put_u32(p.client_seq);
            put_str(&mut body, &p.client_msg_no);
            body.put_i64(p.message_id);
            body.put_u32(p.message_seq);
            body.put_u8(p.reason_code.to_u8());
        }
        Frame::Recv(p) => {
            flags = p.framer.to_flags();
            body.put_u8(p.setting.to_u8());
            body.put_i64(p.message_id);
            body.put_u32(p.message_seq);
            put_str(&mut body, &p.client_msg_no);
            body.put_i32(p.timestamp);
            put_str(&mut body, &p.channel_id);
            body.put_u8(p.channel_type);
            body.put_u32(p.expire);
            put_str(&mut body, &p.from_uid);
            if p.setting.stream {
                put_str(&mut body, &p.stream_no);
                body.put_u8(p.stream_flag);
            }
            if p.setting.topic {
                put_str(&mut body, &p.topic);
            }
            body.put_slice(&p.payload);
        }
        Frame::Recvack(p) => {
            flags = p.framer.to_flags();
            body.put_i64(p.message_id);
            body.put_u32(p.message_seq);
        }
        Frame::Ping | Frame::Pong => {}
        Frame::Disconnect(p) => {
            body.put_u8(p.reason_code.to_u8());
            put_str(&mut body, &p.reason);
        }
        Frame::Sub(p) => {
            put_str(&mut body, &p.sub_no);
            put_str(&mut body, &p.channel_id);
            body.put_u8(p.channel_type);
            body.put_u8(p.action.to_u8());
            put_str(&mut body, &p.param);
        }
        Frame::Suback(p) => {
            put_str(&mut body, &p.sub_no);
            put_str(&mut body, &p.channel_id);
            body.put_u8(p.channel_type);
            body.put_u8(p.action.to_u8());
            body.put_u8(p.reason_code.to_u8());
        }
        Frame::Unknown(_) => {}
    }

    let type_byte = match frame {
        Frame::Unknown(t) => *t << 4,
        _ => (frame.frame_type().to_u8() << 4) | (flags & 0x0f),
    };
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(type_byte);
    put_remaining_length(&mut out, body.len());
    out.put_slice(&body);
    out.freeze()
}

// ---------------------------------------------------------------------------
// 解码 / decoding
// ---------------------------------------------------------------------------

struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize) -> Result<(), ProtoError> {
        if self.buf.remaining() < n {
            return Err(ProtoError::Truncated);
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, ProtoError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn read_u32(&mut self) -> Result<u32, ProtoError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn read_i32(&mut self) -> Result<i32, ProtoError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn read_i64(&mut self) -> Result<i64, ProtoError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn read_str(&mut self) -> Result<String, ProtoError> {
        self.need(2)?;
        let len = self.buf.get_u16() as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }

    fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.buf.split_to(self.buf.remaining());
        rest.to_vec()
    }
}

/// 从流缓冲中解出一帧；不完整返回None / Pop one frame off the stream buffer.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    // 剩余长度varint，最多4字节 / remaining-length varint, at most 4 bytes
    let mut rem: usize = 0;
    let mut shift = 0u32;
    let mut header_len = 1usize;
    loop {
        if buf.len() <= header_len {
            return Ok(None);
        }
        let b = buf[header_len];
        rem |= ((b & 0x7f) as usize) << shift;
        header_len += 1;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(ProtoError::VarintOverflow);
        }
    }
    if rem > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(rem));
    }
    if buf.len() < header_len + rem {
        return Ok(None);
    }

    let header = buf.split_to(header_len);
    let type_byte = header[0];
    let frame_type = FrameType::from_u8(type_byte >> 4);
    let flags = type_byte & 0x0f;
    let body = buf.split_to(rem).freeze();
    let mut r = BodyReader { buf: body };

    let frame = match frame_type {
        FrameType::Connect => Frame::Connect(ConnectPacket {
            version: r.read_u8()?,
            device_flag: r.read_u8()?,
            device_id: r.read_str()?,
            uid: r.read_str()?,
            token: r.read_str()?,
            client_timestamp: r.read_i64()?,
            client_key: r.read_str()?,
        }),
        FrameType::Connack => {
            let has_server_version = flags & 0b1 != 0;
            let time_diff = r.read_i64()?;
            let reason_code = ReasonCode::from_u8(r.read_u8()?);
            let server_key = r.read_str()?;
            let salt = r.read_str()?;
            let server_version = if has_server_version { r.read_u8()? } else { 0 };
            Frame::Connack(ConnackPacket {
                time_diff,
                reason_code,
                server_key,
                salt,
                server_version,
                has_server_version,
            })
        }
        FrameType::Send => {
            let framer = Framer::from_flags(flags);
            let setting = Setting::from_u8(r.read_u8()?);
            let client_seq = r.read_u32()?;
            let client_msg_no = r.read_str()?;
            let channel_id = r.read_str()?;
            let channel_type = r.read_u8()?;
            let expire = r.read_u32()?;
            let msg_key = r.read_str()?;
            let stream_no = if setting.stream { r.read_str()? } else { String::new() };
            let topic = if setting.topic { r.read_str()? } else { String::new() };
            Frame::Send(SendPacket {
                framer,
                setting,
                client_seq,
                client_msg_no,
                channel_id,
                channel_type,
                expire,
                msg_key,
                stream_no,
                topic,
                payload: r.read_rest(),
            })
        }
        FrameType::Sendack => Frame::Sendack(SendackPacket {
            framer: Framer::from_flags(flags),
            client_seq: r.read_u32()?,
            client_msg_no: r.read_str()?,
            message_id: r.read_i64()?,
            message_seq: r.read_u32()?,
            reason_code: ReasonCode::from_u8(r.read_u8()?),
        }),
        FrameType::Recv => {
            let framer = Framer::from_flags(flags);
            let setting = Setting::from_u8(r.read_u8()?);
            let message_id = r.read_i64()?;
            let message_seq = r.read_u32()?;
            let client_msg_no = r.read_str()?;
            let timestamp = r.read_i32()?;
            let channel_id = r.read_str()?;
            let channel_type = r.read_u8()?;
            let expire = r.read_u32()?;
            let from_uid = r.read_str()?;
            let (stream_no, stream_flag) = if setting.stream {
                (r.read_str()?, r.read_u8()?)
            } else {
                (String::new(), 0)
            };
            let topic = if setting.topic { r.read_str()? } else { String::new() };
            Frame::Recv(RecvPacket {
                framer,
                setting,
                message_id,
                message_seq,
                client_msg_no,
                timestamp,
                channel_id,
                channel_type,
                expire,
                from_uid,
                stream_no,
                stream_flag,
                topic,
                payload: r.read_rest(),
            })
        }
        FrameType::Recvack => Frame::Recvack(RecvackPacket {
            framer: Framer::from_flags(flags),
            message_id: r.read_i64()?,
            message_seq: r.read_u32()?,
        }),
        FrameType::Ping => Frame::Ping,
        FrameType::Pong => Frame::Pong,
        FrameType::Disconnect => Frame::Disconnect(DisconnectPacket {
            reason_code: ReasonCode::from_u8(r.read_u8()?),
            reason: r.read_str()?,
        }),
        FrameType::Sub => Frame::Sub(SubPacket {
            sub_no: r.read_str()?,
            channel_id: r.read_str()?,
            channel_type: r.read_u8()?,
            action: Action::from_u8(r.read_u8()?),
            param: r.read_str()?,
        }),
        FrameType::Suback => Frame::Suback(SubackPacket {
            sub_no: r.read_str()?,
            channel_id: r.read_str()?,
            channel_type: r.read_u8()?,
            action: Action::from_u8(r.read_u8()?),
            reason_code: ReasonCode::from_u8(r.read_u8()?),
        }),
        FrameType::Unknown => Frame::Unknown(type_byte >> 4),
    };
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        let decoded = decode_frame(&mut buf).expect("decode").expect("complete");
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn connect_round_trip() {
        let frame = Frame::Connect(ConnectPacket {
            version: 5,
            device_flag: 1,
            device_id: "d1".into(),
            uid: "alice".into(),
            token: "tok".into(),
            client_timestamp: 1_700_000_000_123,
            client_key: "a2V5".into(),
        });
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn connack_version_field_follows_flag() {
        let with = Frame::Connack(ConnackPacket {
            time_diff: -12,
            reason_code: ReasonCode::Success,
            server_key: "c2s=".into(),
            salt: "0123456789abcdef".into(),
            server_version: 5,
            has_server_version: true,
        });
        assert_eq!(round_trip(with.clone()), with);

        let without = Frame::Connack(ConnackPacket {
            has_server_version: false,
            server_version: 0,
            ..match with.clone() {
                Frame::Connack(p) => p,
                _ => unreachable!(),
            }
        });
        assert_eq!(round_trip(without.clone()), without);
        // 无标志时 server_version 不占字节 / without the flag no byte is spent
        assert_eq!(encode_frame(&with).len(), encode_frame(&without).len() + 1);
    }

    #[test]
    fn send_round_trip_with_topic_and_stream() {
        let frame = Frame::Send(SendPacket {
            framer: Framer { red_dot: true, ..Default::default() },
            setting: Setting { topic: true, stream: true },
            client_seq: 7,
            client_msg_no: "no-7".into(),
            channel_id: "grp".into(),
            channel_type: crate::channel_type::GROUP,
            expire: 60,
            msg_key: "abcd".into(),
            stream_no: "s1".into(),
            topic: "t".into(),
            payload: b"cipher==".to_vec(),
        });
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn recv_flags_survive_round_trip() {
        let frame = Frame::Recv(RecvPacket {
            framer: Framer { no_persist: true, sync_once: true, red_dot: false },
            message_id: 99,
            message_seq: 3,
            client_msg_no: "n".into(),
            timestamp: 1700000000,
            channel_id: "a@b".into(),
            channel_type: crate::channel_type::PERSON,
            from_uid: "a".into(),
            payload: b"x".to_vec(),
            ..Default::default()
        });
        match round_trip(frame) {
            Frame::Recv(p) => {
                assert!(p.framer.no_persist);
                assert!(p.framer.sync_once);
                assert!(!p.framer.red_dot);
            }
            other => panic!("expected recv, got {:?}", other),
        }
    }

    #[test]
    fn partial_input_yields_none() {
        let frame = Frame::Send(SendPacket {
            channel_id: "grp".into(),
            channel_type: 2,
            payload: vec![0u8; 300],
            ..Default::default()
        });
        let encoded = encode_frame(&frame);
        for cut in [1usize, 2, 5, encoded.len() - 1] {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(decode_frame(&mut buf).expect("no error").is_none());
            assert_eq!(buf.len(), cut, "partial decode must not consume");
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&Frame::Ping));
        buf.extend_from_slice(&encode_frame(&Frame::Recvack(RecvackPacket {
            framer: Framer::default(),
            message_id: 5,
            message_seq: 2,
        })));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::Ping));
        match decode_frame(&mut buf).unwrap() {
            Some(Frame::Recvack(p)) => assert_eq!(p.message_id, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_frame_type_is_skipped_not_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(14 << 4);
        buf.put_u8(3);
        buf.extend_from_slice(b"???");
        buf.extend_from_slice(&encode_frame(&Frame::Ping));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::Unknown(14)));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::Ping));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(3 << 4);
        put_remaining_length(&mut buf, MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        // 声明长度2的帧体，但Connect需要更多字段 / declared body too short for connect
        let mut buf = BytesMut::new();
        buf.put_u8(1 << 4);
        buf.put_u8(2);
        buf.put_u8(5);
        buf.put_u8(1);
        assert!(matches!(decode_frame(&mut buf), Err(ProtoError::Truncated)));
    }
}
