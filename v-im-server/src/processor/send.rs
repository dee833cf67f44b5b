//! SEND摄入：鉴权、解密、落库、扇出
//! SEND ingest: permission, decrypt, store append, fan-out.

use std::sync::Arc;
use tracing::{error, warn};

use v_im_proto::{
    channel_type, crypto, stream_flag, Frame, Framer, ReasonCode, RecvPacket, SendPacket,
    SendackPacket,
};

use crate::domain::{fake_channel_id, Message};
use crate::server::conn::Conn;
use crate::server::ImServer;
use crate::storage::StreamItem;

/// 一批来自同一连接的SEND：按频道切分后逐频道处理
/// A batch of SENDs from one connection, partitioned by channel.
pub async fn process_msgs(server: &Arc<ImServer>, conn: &Arc<Conn>, packets: &[SendPacket]) {
    conn.touch();
    let mut partitions: Vec<((String, u8), Vec<&SendPacket>)> = Vec::new();
    for packet in packets {
        let key = (packet.channel_id.clone(), packet.channel_type);
        match partitions.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(packet),
            None => partitions.push((key, vec![packet])),
        }
    }

    let mut sendacks = server.frame_pool.get_frames();
    for ((channel_id, channel_type_), group) in partitions {
        let acks = process_channel_messages(server, conn, &channel_id, channel_type_, &group).await;
        sendacks.extend(acks);
    }
    for ack in sendacks.drain(..) {
        let _ = conn.send_frame(ack);
    }
    server.frame_pool.put_frames(sendacks);
}

async fn process_channel_messages(
    server: &Arc<ImServer>,
    conn: &Arc<Conn>,
    channel_id: &str,
    channel_type_: u8,
    packets: &[&SendPacket],
) -> Vec<Frame> {
    let state = conn.state();
    let mut sendacks: Vec<Frame> = Vec::with_capacity(packets.len());

    // -------- 频道定位与许可 / resolve channel and assert permission --------
    let effective_channel_id = if channel_type_ == channel_type::PERSON
        && !server.opts.is_fake_channel(channel_id)
    {
        fake_channel_id(&state.uid, channel_id, &server.opts.channel.fake_delimiter)
    } else {
        channel_id.to_string()
    };

    let channel = match server.channels.get(&effective_channel_id, channel_type_).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            error!(
                "频道不存在或已解散 / channel missing: channel={} type={}",
                effective_channel_id, channel_type_
            );
            return acks_for_packets(packets, ReasonCode::ChannelNotExist);
        }
        Err(e) => {
            error!(
                "获取频道失败 / get channel err: channel={} type={} err={}",
                effective_channel_id, channel_type_, e
            );
            return acks_for_packets(packets, ReasonCode::SystemError);
        }
    };

    let system_uids = server.system_uids_snapshot();
    let permission = channel.has_permission(&state.uid, &system_uids);
    if !permission.is_success() {
        error!(
            "发送被拒 / send denied: uid={} channel={} reason={}",
            state.uid, effective_channel_id, permission
        );
        return acks_for_packets(packets, permission);
    }

    // -------- 解密与构造 / message decrypt and build --------
    let mut messages: Vec<Message> = Vec::with_capacity(packets.len());
    for packet in packets {
        let message_id = match server.message_id_gen.next() {
            Ok(id) => id,
            Err(e) => {
                error!("生成消息ID失败 / gen message id err: {}", e);
                sendacks.push(ack_for_packet(packet, 0, ReasonCode::SystemError));
                continue;
            }
        };
        // 客户端不允许发送syncOnce消息 / clients may not set syncOnce themselves
        if packet.framer.sync_once {
            sendacks.push(ack_for_packet(packet, message_id, ReasonCode::NotSupportHeader));
            continue;
        }
        let payload = match check_and_decode_payload(packet, &state.uid, &state.aes_key, &state.aes_iv)
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "载荷校验失败 / decode payload err: uid={} channel={} err={}",
                    state.uid, channel_id, e
                );
                sendacks.push(ack_for_packet(packet, message_id, ReasonCode::PayloadDecodeError));
                continue;
            }
        };
        messages.push(Message {
            recv: RecvPacket {
                framer: Framer {
                    red_dot: packet.framer.red_dot,
                    sync_once: packet.framer.sync_once,
                    no_persist: packet.framer.no_persist,
                },
                setting: packet.setting,
                message_id,
                message_seq: 0,
                client_msg_no: packet.client_msg_no.clone(),
                timestamp: chrono::Utc::now().timestamp() as i32,
                channel_id: packet.channel_id.clone(),
                channel_type: packet.channel_type,
                expire: packet.expire,
                from_uid: state.uid.clone(),
                stream_no: packet.stream_no.clone(),
                stream_flag: stream_flag::ING,
                topic: packet.topic.clone(),
                payload,
            },
            client_seq: packet.client_seq,
            from_device_flag: state.device_flag,
            from_device_id: state.device_id.clone(),
            large: channel.large(),
        });
    }
    if messages.is_empty() {
        return sendacks;
    }

    // -------- 落库（仅此后才有messageSeq） / store append assigns messageSeq --------
    if let Err(e) =
        store_channel_messages_if_need(server, &effective_channel_id, channel_type_, &mut messages)
    {
        error!(
            "消息落库失败 / store messages err: channel={} err={}",
            effective_channel_id, e
        );
        return acks_for_messages(&messages, ReasonCode::SystemError, sendacks);
    }

    // -------- 通知队列 / notify queue --------
    if server.webhook.on() {
        let notifiable: Vec<Message> = messages
            .iter()
            .filter(|m| !m.streaming() && !(m.recv.framer.no_persist && m.recv.framer.sync_once))
            .cloned()
            .collect();
        if let Err(e) = server.store.append_messages_of_notify_queue(&notifiable) {
            error!("写通知队列失败 / notify queue err: {}", e);
            return acks_for_messages(&messages, ReasonCode::SystemError, sendacks);
        }
    }

    // -------- 投递 / put to channel --------
    if let Err(e) = channel.put(
        &server.delivery,
        &messages,
        &state.uid,
        state.device_flag,
        &state.device_id,
    ) {
        error!("消息投递失败 / put to channel err: {}", e);
        return acks_for_messages(&messages, ReasonCode::SystemError, sendacks);
    }

    for message in &messages {
        sendacks.push(ack_for_message(message, ReasonCode::Success));
    }
    sendacks
}

/// 完整性校验并解出明文 / Verify the msgKey, then decrypt the payload.
fn check_and_decode_payload(
    packet: &SendPacket,
    from_uid: &str,
    aes_key: &str,
    aes_iv: &str,
) -> anyhow::Result<Vec<u8>> {
    let expected = crypto::msg_key(&packet.verity_string(from_uid), aes_key, aes_iv)?;
    if packet.msg_key != expected {
        anyhow::bail!("msgKey不合法 / msgKey mismatch");
    }
    let payload_text = std::str::from_utf8(&packet.payload)
        .map_err(|_| anyhow::anyhow!("载荷不是合法base64文本 / payload not base64 text"))?;
    Ok(crypto::aes_decrypt_b64(payload_text, aes_key, aes_iv)?)
}

/// 持久与流式消息分路落库 / Persist plain and stream messages separately.
fn store_channel_messages_if_need(
    server: &Arc<ImServer>,
    effective_channel_id: &str,
    channel_type_: u8,
    messages: &mut [Message],
) -> anyhow::Result<()> {
    let mut persist_idx: Vec<usize> = Vec::with_capacity(messages.len());
    for (i, message) in messages.iter().enumerate() {
        if message.recv.framer.no_persist || message.recv.framer.sync_once {
            continue;
        }
        if message.streaming() {
            // 流消息单独存储 / stream items are stored apart
            server.store.append_stream_item(
                effective_channel_id,
                channel_type_,
                &message.recv.stream_no,
                &StreamItem {
                    client_msg_no: message.recv.client_msg_no.clone(),
                    blob: message.recv.payload.clone(),
                },
            )?;
            continue;
        }
        persist_idx.push(i);
    }
    if persist_idx.is_empty() {
        return Ok(());
    }
    let batch: Vec<Message> = persist_idx.iter().map(|&i| messages[i].clone()).collect();
    let seqs = server
        .store
        .append_messages(effective_channel_id, channel_type_, &batch)?;
    if seqs.len() != persist_idx.len() {
        warn!(
            "落库返回的seq数量不符 / store returned {} seqs for {} messages",
            seqs.len(),
            persist_idx.len()
        );
    }
    for (&i, seq) in persist_idx.iter().zip(seqs) {
        messages[i].recv.message_seq = seq;
    }
    Ok(())
}

fn ack_for_packet(packet: &SendPacket, message_id: i64, reason: ReasonCode) -> Frame {
    Frame::Sendack(SendackPacket {
        framer: packet.framer,
        client_seq: packet.client_seq,
        client_msg_no: packet.client_msg_no.clone(),
        message_id,
        message_seq: 0,
        reason_code: reason,
    })
}

fn acks_for_packets(packets: &[&SendPacket], reason: ReasonCode) -> Vec<Frame> {
    packets.iter().map(|p| ack_for_packet(p, 0, reason)).collect()
}

fn ack_for_message(message: &Message, reason: ReasonCode) -> Frame {
    Frame::Sendack(SendackPacket {
        framer: message.recv.framer,
        client_seq: message.client_seq,
        client_msg_no: message.recv.client_msg_no.clone(),
        message_id: message.recv.message_id,
        message_seq: message.recv.message_seq,
        reason_code: reason,
    })
}

fn acks_for_messages(messages: &[Message], reason: ReasonCode, mut acc: Vec<Frame>) -> Vec<Frame> {
    for message in messages {
        acc.push(ack_for_message(message, reason));
    }
    acc
}
