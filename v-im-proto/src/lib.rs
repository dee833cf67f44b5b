//! v-im-server 的二进制线协议 / Binary wire protocol for v-im-server.
//!
//! 帧格式：1字节头（高4位帧类型，低4位标志）+ 剩余长度varint + 帧体
//! Frame layout: 1 header byte (type in the high nibble, flags in the low
//! nibble), a 7-bit varint remaining length, then the type-specific body.

pub mod codec;
pub mod crypto;
pub mod frame;

pub use codec::{decode_frame, encode_frame, ProtoError};
pub use frame::{
    Action, ConnackPacket, ConnectPacket, DisconnectPacket, Frame, FrameType, Framer, RecvPacket,
    RecvackPacket, SendPacket, SendackPacket, Setting, SubPacket, SubackPacket,
};

/// 协议最新版本 / Latest protocol version.
pub const LATEST_VERSION: u8 = 5;

/// 频道类型 / Channel types.
pub mod channel_type {
    pub const PERSON: u8 = 1;
    pub const GROUP: u8 = 2;
    pub const CUSTOMER_SERVICE: u8 = 3;
    pub const INFO: u8 = 4;
    pub const DATA: u8 = 5;

    /// 群组类频道（非个人、非资讯）需要订阅关系才能发言
    /// Group-like channels (neither person nor info) require membership to send.
    pub fn is_group_like(t: u8) -> bool {
        t != PERSON && t != INFO
    }
}

/// 设备等级 / Device levels.
pub mod device_level {
    pub const SLAVE: u8 = 0;
    pub const MASTER: u8 = 1;
}

/// 流消息状态 / Stream message states.
pub mod stream_flag {
    pub const ING: u8 = 0;
    pub const END: u8 = 1;
}

/// 原因码 / Reason codes carried by connack/sendack/suback/disconnect frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    Success = 1,
    AuthFail = 2,
    Ban = 3,
    ChannelNotExist = 4,
    SubscriberNotExist = 5,
    InBlacklist = 6,
    NotAllowSend = 7,
    NotSupportHeader = 8,
    NotSupportChannelType = 9,
    PayloadDecodeError = 10,
    SystemError = 11,
    ConnectKick = 12,
    ServerStop = 13,
}

impl ReasonCode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ReasonCode::Success,
            2 => ReasonCode::AuthFail,
            3 => ReasonCode::Ban,
            4 => ReasonCode::ChannelNotExist,
            5 => ReasonCode::SubscriberNotExist,
            6 => ReasonCode::InBlacklist,
            7 => ReasonCode::NotAllowSend,
            8 => ReasonCode::NotSupportHeader,
            9 => ReasonCode::NotSupportChannelType,
            10 => ReasonCode::PayloadDecodeError,
            12 => ReasonCode::ConnectKick,
            13 => ReasonCode::ServerStop,
            _ => ReasonCode::SystemError,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReasonCode::Success)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
