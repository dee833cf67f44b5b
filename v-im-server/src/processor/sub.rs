//! 订阅处理：仅数据频道支持SUB/UNSUB
//! SUB/UNSUB handling; only data channels are subscribable.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use v_im_proto::{channel_type, Action, Frame, ReasonCode, SubPacket, SubackPacket};

use crate::server::conn::Conn;
use crate::server::ImServer;

pub async fn process_subs(server: &Arc<ImServer>, conn: &Arc<Conn>, packets: &[SubPacket]) {
    conn.touch();
    for packet in packets {
        process_sub(server, conn, packet).await;
    }
}

async fn process_sub(server: &Arc<ImServer>, conn: &Arc<Conn>, packet: &SubPacket) {
    // 频道ID按URL解析：path为逻辑频道，query并入订阅参数
    // channelId parses as a URL: path is the logical channel, query merges
    // into the subscription parameter map
    let (channel_id, mut params) = parse_channel_url(&packet.channel_id);
    if channel_id.trim().is_empty() {
        warn!("订阅的频道ID不能为空 / empty channel id in sub: {}", packet.channel_id);
        return;
    }

    if packet.channel_type != channel_type::DATA {
        warn!(
            "订阅的频道类型不支持 / unsupported channel type for sub: {}",
            packet.channel_type
        );
        let _ = conn.send_frame(suback(packet, &channel_id, ReasonCode::NotSupportChannelType));
        return;
    }

    let channel = match server.channels.get(&channel_id, packet.channel_type).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            let _ = conn.send_frame(suback(packet, &channel_id, ReasonCode::ChannelNotExist));
            return;
        }
        Err(e) => {
            warn!("获取频道失败 / get channel err: {}", e);
            let _ = conn.send_frame(suback(packet, &channel_id, ReasonCode::SystemError));
            return;
        }
    };

    let uid = conn.uid();
    match packet.action {
        Action::Subscribe => {
            // JSON参数与query合并，JSON优先 / merge the JSON param map over the query
            if !packet.param.trim().is_empty() {
                if let Ok(extra) =
                    serde_json::from_str::<HashMap<String, serde_json::Value>>(&packet.param)
                {
                    params.extend(extra);
                }
            }
            channel.add_subscriber(&uid);
            conn.subscribe_channel(&channel_id, packet.channel_type, params);
        }
        Action::Unsubscribe => {
            conn.unsubscribe_channel(&channel_id, packet.channel_type);
            if !server.conn_manager.exist_conns_with_uid(&uid) {
                channel.remove_subscriber(&uid);
            }
            if channel.subscriber_count() == 0 {
                server
                    .channels
                    .remove_data_channel(&channel_id, packet.channel_type);
            }
        }
    }
    let _ = conn.send_frame(suback(packet, &channel_id, ReasonCode::Success));
}

/// 解析频道URL：`chat?key=v` -> ("chat", {key: "v"})
///
/// path部分原样保留（含斜杠），`/room`与`room`是两个不同频道。
/// The path part is kept verbatim (slashes included); `/room` and `room`
/// name two distinct channels.
fn parse_channel_url(raw: &str) -> (String, HashMap<String, serde_json::Value>) {
    let mut params = HashMap::new();
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }
    }
    (path.to_string(), params)
}

fn suback(packet: &SubPacket, channel_id: &str, reason: ReasonCode) -> Frame {
    Frame::Suback(SubackPacket {
        sub_no: packet.sub_no.clone(),
        channel_id: channel_id.to_string(),
        channel_type: packet.channel_type,
        action: packet.action,
        reason_code: reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_splits_path_and_query() {
        let (id, params) = parse_channel_url("room1?mode=live&quality=hd");
        assert_eq!(id, "room1");
        assert_eq!(params.get("mode"), Some(&serde_json::Value::String("live".into())));
        assert_eq!(params.get("quality"), Some(&serde_json::Value::String("hd".into())));

        let (id, params) = parse_channel_url("plain");
        assert_eq!(id, "plain");
        assert!(params.is_empty());
    }

    #[test]
    fn channel_url_path_keeps_slashes() {
        // 斜杠是频道标识的一部分，不得折叠 / slashes are identity, never collapsed
        let (id, _) = parse_channel_url("/room1");
        assert_eq!(id, "/room1");
        let (id, _) = parse_channel_url("room1/");
        assert_eq!(id, "room1/");
        let (id, params) = parse_channel_url("/a/b?k=v");
        assert_eq!(id, "/a/b");
        assert_eq!(params.get("k"), Some(&serde_json::Value::String("v".into())));
    }
}
