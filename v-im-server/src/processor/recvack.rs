//! RECVACK处理：完成重试项并推进游标
//! RECVACK handling: finish retry entries and advance the user cursor.

use std::sync::Arc;
use tracing::{debug, warn};

use v_im_proto::{device_level, RecvackPacket};

use crate::server::conn::Conn;
use crate::server::ImServer;

pub fn process_recvacks(server: &Arc<ImServer>, conn: &Arc<Conn>, acks: &[RecvackPacket]) {
    if acks.is_empty() {
        return;
    }
    conn.touch();
    let state = conn.state();
    for ack in acks {
        let persist = !ack.framer.no_persist;
        if persist {
            // 完成消息（移除重试队列里的等待项） / complete the pending retry entry
            let finished = server
                .retry
                .finish(&state.uid, &state.device_id, ack.message_id);
            if finished {
                debug!(
                    "✅ 投递确认 / delivery acked: uid={} device={} message_id={} seq={}",
                    state.uid, state.device_id, ack.message_id, ack.message_seq
                );
            } else {
                warn!(
                    "重试队列无此消息 / no retry entry for ack: uid={} device={} message_id={}",
                    state.uid, state.device_id, ack.message_id
                );
            }
        }
        // 写扩散且存储、master设备，才推进游标
        // only persistent syncOnce acks from master devices advance the cursor
        if ack.framer.sync_once && persist && state.device_level == device_level::MASTER {
            debug!(
                "游标推进 / cursor advance: uid={} seq={}",
                state.uid, ack.message_seq
            );
            if let Err(e) = server.store.update_user_cursor_if_need(&state.uid, ack.message_seq) {
                warn!("游标更新失败 / cursor update err: uid={} err={}", state.uid, e);
            }
        }
    }
}
