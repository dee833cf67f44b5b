use v_im_proto::RecvPacket;

/// 流经管道的消息：线协议 recv 模板加上不参与编码的簿记字段
/// A message flowing through the pipeline: the wire recv template plus
/// bookkeeping fields that never hit the wire.
///
/// `recv.payload` 在此持有明文，投递时才按接收方会话密钥加密。
/// `recv.payload` holds plaintext here; delivery encrypts per recipient.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub recv: RecvPacket,
    pub client_seq: u32,
    pub from_device_flag: u8,
    pub from_device_id: String,
    pub large: bool,
}

impl Message {
    /// 是否需要落库 / Whether the message is persisted at all.
    pub fn persisted(&self) -> bool {
        !self.recv.framer.no_persist && !self.recv.framer.sync_once
    }

    /// 是否流式消息 / Whether the message is a stream item.
    pub fn streaming(&self) -> bool {
        self.recv.setting.stream
    }
}

/// 个人频道的规范存储键：两个uid按字典序拼接
/// Canonical person-channel key: the two uids joined in lexical order.
pub fn fake_channel_id(uid_a: &str, uid_b: &str, delimiter: &str) -> String {
    if uid_a <= uid_b {
        format!("{}{}{}", uid_a, delimiter, uid_b)
    } else {
        format!("{}{}{}", uid_b, delimiter, uid_a)
    }
}

/// 从规范键还原两个参与者 / Split the canonical key back into the two peers.
pub fn person_channel_peers(fake_id: &str, delimiter: &str) -> Vec<String> {
    fake_id
        .splitn(2, delimiter)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
