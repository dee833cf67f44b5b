//! 帧与包定义 / Frame and packet definitions.

use crate::ReasonCode;

/// 帧类型 / Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connack,
    Send,
    Sendack,
    Recv,
    Recvack,
    Ping,
    Pong,
    Disconnect,
    Sub,
    Suback,
    Unknown,
}

impl FrameType {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameType::Connect => 1,
            FrameType::Connack => 2,
            FrameType::Send => 3,
            FrameType::Sendack => 4,
            FrameType::Recv => 5,
            FrameType::Recvack => 6,
            FrameType::Ping => 7,
            FrameType::Pong => 8,
            FrameType::Disconnect => 9,
            FrameType::Sub => 10,
            FrameType::Suback => 11,
            FrameType::Unknown => 0,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => FrameType::Connect,
            2 => FrameType::Connack,
            3 => FrameType::Send,
            4 => FrameType::Sendack,
            5 => FrameType::Recv,
            6 => FrameType::Recvack,
            7 => FrameType::Ping,
            8 => FrameType::Pong,
            9 => FrameType::Disconnect,
            10 => FrameType::Sub,
            11 => FrameType::Suback,
            _ => FrameType::Unknown,
        }
    }
}

/// 帧头标志位 / Per-frame header flags (low nibble of the header byte).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Framer {
    pub no_persist: bool,
    pub sync_once: bool,
    pub red_dot: bool,
}

impl Framer {
    pub fn to_flags(self) -> u8 {
        (self.no_persist as u8) | (self.sync_once as u8) << 1 | (self.red_dot as u8) << 2
    }

    pub fn from_flags(flags: u8) -> Self {
        Framer {
            no_persist: flags & 0b001 != 0,
            sync_once: flags & 0b010 != 0,
            red_dot: flags & 0b100 != 0,
        }
    }
}

/// 消息设置位 / Send/recv setting bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Setting {
    pub topic: bool,
    pub stream: bool,
}

impl Setting {
    pub fn to_u8(self) -> u8 {
        (self.topic as u8) | (self.stream as u8) << 1
    }

    pub fn from_u8(v: u8) -> Self {
        Setting {
            topic: v & 0b01 != 0,
            stream: v & 0b10 != 0,
        }
    }
}

/// 订阅动作 / Subscribe action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

impl Action {
    pub fn to_u8(self) -> u8 {
        match self {
            Action::Subscribe => 0,
            Action::Unsubscribe => 1,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            Action::Unsubscribe
        } else {
            Action::Subscribe
        }
    }
}

/// 连接包 / Connect packet (client -> server).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    pub version: u8,
    pub device_flag: u8,
    pub device_id: String,
    pub uid: String,
    pub token: String,
    pub client_timestamp: i64,
    /// base64 编码的客户端 X25519 公钥 / base64-encoded client X25519 public key
    pub client_key: String,
}

/// 连接应答包 / Connack packet (server -> client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnackPacket {
    pub time_diff: i64,
    pub reason_code: ReasonCode,
    /// base64 编码的服务端 X25519 公钥 / base64-encoded server X25519 public key
    pub server_key: String,
    /// aesIV，同时作为盐值下发 / the aes IV, doubling as the salt
    pub salt: String,
    pub server_version: u8,
    pub has_server_version: bool,
}

impl Default for ConnackPacket {
    fn default() -> Self {
        ConnackPacket {
            time_diff: 0,
            reason_code: ReasonCode::Success,
            server_key: String::new(),
            salt: String::new(),
            server_version: 0,
            has_server_version: false,
        }
    }
}

/// 发送包 / Send packet (client -> server).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPacket {
    pub framer: Framer,
    pub setting: Setting,
    pub client_seq: u32,
    pub client_msg_no: String,
    pub channel_id: String,
    pub channel_type: u8,
    /// 消息过期时长（秒），0为不过期 / message expiry in seconds, 0 = never
    pub expire: u32,
    /// 校验串的md5，见 [`SendPacket::verity_string`] / md5 digest guarding the payload
    pub msg_key: String,
    pub stream_no: String,
    pub topic: String,
    /// 线上载荷：base64(AES-CBC-PKCS7(明文)) / on-wire payload: base64 of the AES ciphertext
    pub payload: Vec<u8>,
}

impl SendPacket {
    /// 完整性校验串：各字段以`|`连接，payload取线上形式
    /// Integrity string: fields joined by `|`, payload in its on-wire form.
    pub fn verity_string(&self, from_uid: &str) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.client_seq,
            self.client_msg_no,
            self.channel_id,
            self.channel_type,
            from_uid,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// 发送应答包 / Sendack packet (server -> client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendackPacket {
    pub framer: Framer,
    pub client_seq: u32,
    pub client_msg_no: String,
    pub message_id: i64,
    pub message_seq: u32,
    pub reason_code: ReasonCode,
}

/// 收取包 / Recv packet (server -> client).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvPacket {
    pub framer: Framer,
    pub setting: Setting,
    pub message_id: i64,
    pub message_seq: u32,
    pub client_msg_no: String,
    pub timestamp: i32,
    pub channel_id: String,
    pub channel_type: u8,
    pub expire: u32,
    pub from_uid: String,
    pub stream_no: String,
    pub stream_flag: u8,
    pub topic: String,
    /// 按接收方会话密钥重新加密的载荷 / payload re-encrypted for the recipient session
    pub payload: Vec<u8>,
}

/// 收取应答包 / Recvack packet (client -> server).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvackPacket {
    pub framer: Framer,
    pub message_id: i64,
    pub message_seq: u32,
}

/// 订阅包 / Sub packet (client -> server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPacket {
    pub sub_no: String,
    /// URL形式：path为频道ID，query合入订阅参数 / URL form: path is the channel id
    pub channel_id: String,
    pub channel_type: u8,
    pub action: Action,
    pub param: String,
}

/// 订阅应答包 / Suback packet (server -> client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubackPacket {
    pub sub_no: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub action: Action,
    pub reason_code: ReasonCode,
}

/// 断开包 / Disconnect packet (server -> client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub reason: String,
}

/// 线协议帧 / A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Send(SendPacket),
    Sendack(SendackPacket),
    Recv(RecvPacket),
    Recvack(RecvackPacket),
    Ping,
    Pong,
    Disconnect(DisconnectPacket),
    Sub(SubPacket),
    Suback(SubackPacket),
    /// 未知帧类型，解码时跳过 / unknown frame type, skipped by the processor
    Unknown(u8),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect(_) => FrameType::Connect,
            Frame::Connack(_) => FrameType::Connack,
            Frame::Send(_) => FrameType::Send,
            Frame::Sendack(_) => FrameType::Sendack,
            Frame::Recv(_) => FrameType::Recv,
            Frame::Recvack(_) => FrameType::Recvack,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::Disconnect(_) => FrameType::Disconnect,
            Frame::Sub(_) => FrameType::Sub,
            Frame::Suback(_) => FrameType::Suback,
            Frame::Unknown(_) => FrameType::Unknown,
        }
    }
}
