//! 连接认证 / The CONNECT handshake.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use v_im_proto::{
    channel_type, crypto, device_level, ConnackPacket, ConnectPacket, DisconnectPacket, Frame,
    ReasonCode, LATEST_VERSION,
};

use crate::server::conn::{Conn, ConnState};
use crate::server::ImServer;

/// 处理连接认证：令牌校验、封禁检查、DH密钥协商、同类设备互踢
/// Authenticate a connection: token verify, ban check, DH agreement and the
/// same-device-flag kick policy.
pub async fn process_auth(server: &Arc<ImServer>, conn: &Arc<Conn>, packet: ConnectPacket) {
    let uid = packet.uid.clone();
    if packet.client_key.trim().is_empty() {
        error!("clientKey为空 / empty client key: uid={}", uid);
        respond_auth_fail(server, conn);
        return;
    }

    // -------------------- 令牌校验 / token verify --------------------
    let mut level = device_level::SLAVE;
    if uid == server.opts.auth.manager_uid {
        if server.opts.auth.manager_token_on && packet.token != server.opts.auth.manager_token {
            error!("管理员令牌校验失败 / manager token verify fail: uid={}", uid);
            respond_auth_fail(server, conn);
            return;
        }
        // 管理员连接一律按slave设备对待 / manager connections are always slave devices
        level = device_level::SLAVE;
    } else if server.opts.auth.token_auth_on {
        if packet.token.is_empty() {
            error!("令牌为空 / token is empty: uid={}", uid);
            respond_auth_fail(server, conn);
            return;
        }
        match server.store.get_user_token(&uid, packet.device_flag) {
            Ok(Some((token, stored_level))) if token == packet.token => level = stored_level,
            Ok(_) => {
                error!("令牌校验失败 / token verify fail: uid={}", uid);
                respond_auth_fail(server, conn);
                return;
            }
            Err(e) => {
                error!("读取用户令牌失败 / get user token err: uid={} err={}", uid, e);
                respond_auth_fail(server, conn);
                return;
            }
        }
    }

    // -------------------- 封禁检查 / ban check --------------------
    match server.store.get_channel(&uid, channel_type::PERSON) {
        Ok(info) => {
            if info.map(|i| i.ban).unwrap_or(false) {
                error!("用户已封禁 / user is banned: uid={}", uid);
                respond_connack(server, conn, 0, ReasonCode::Ban);
                return;
            }
        }
        Err(e) => {
            error!("读取用户频道信息失败 / get user channel err: uid={} err={}", uid, e);
            respond_auth_fail(server, conn);
            return;
        }
    }

    // -------------------- 会话密钥协商 / message encrypt key --------------------
    let (server_secret, server_public) = crypto::dh_keypair();
    let (aes_key, aes_iv) = match crypto::session_params(&packet.client_key, &server_secret) {
        Ok(params) => params,
        Err(e) => {
            error!("密钥协商失败 / derive aes key err: uid={} err={}", uid, e);
            respond_auth_fail(server, conn);
            return;
        }
    };
    let server_key = B64.encode(server_public.as_bytes());

    // -------------------- 同类设备互踢 / same master kicks each other --------------------
    let old_conns = server.conn_manager.conns_with(&uid, packet.device_flag);
    for old in old_conns {
        if old.id == conn.id {
            continue;
        }
        if level == device_level::MASTER {
            server.conn_manager.remove_uid_index(&uid, old.id);
            let _ = old.send_frame(Frame::Disconnect(DisconnectPacket {
                reason_code: ReasonCode::ConnectKick,
                reason: "login in other device".to_string(),
            }));
            let grace = if old.device_id() == packet.device_id {
                server.opts.kick.grace_same_device_ms
            } else {
                info!(
                    "同类master互踢 / same master kicks each other: uid={} new={} old={}",
                    uid,
                    packet.device_id,
                    old.device_id()
                );
                server.opts.kick.grace_other_device_ms
            };
            server.closer.schedule(old.id, Duration::from_millis(grace));
        } else if old.device_id() == packet.device_id {
            server.conn_manager.remove_uid_index(&uid, old.id);
            server
                .closer
                .schedule(old.id, Duration::from_millis(server.opts.kick.grace_other_device_ms));
        }
    }

    // -------------------- 连接状态 / set conn info --------------------
    let time_diff = chrono::Utc::now().timestamp_millis() - packet.client_timestamp;
    conn.set_state(ConnState {
        uid: uid.clone(),
        device_flag: packet.device_flag,
        device_id: packet.device_id.clone(),
        device_level: level,
        proto_version: packet.version,
        authed: true,
        aes_key,
        aes_iv: aes_iv.clone(),
        max_idle: Duration::from_secs(server.opts.server.conn_idle_secs),
    });
    conn.touch();
    server.conn_manager.index_uid(conn);

    // -------------------- 应答connack / response connack --------------------
    let server_version = packet.version.min(LATEST_VERSION);
    let has_server_version = packet.version > 3;
    let _ = conn.send_frame(Frame::Connack(ConnackPacket {
        time_diff,
        reason_code: ReasonCode::Success,
        server_key,
        salt: aes_iv,
        server_version,
        has_server_version,
    }));

    // -------------------- 上线webhook / user online --------------------
    let (online_count, total_online_count) =
        server.conn_manager.count_with(&uid, packet.device_flag);
    server
        .webhook
        .online(&uid, packet.device_flag, conn.id, online_count, total_online_count);
    info!(
        "✅ 认证通过 / auth success: uid={} device={} conn={} protoVersion={}",
        uid, packet.device_id, conn.id, packet.version
    );
}

fn respond_auth_fail(server: &Arc<ImServer>, conn: &Arc<Conn>) {
    respond_connack(server, conn, 0, ReasonCode::AuthFail);
}

/// 认证失败或封禁：应答后给一个冲刷窗口再关闭连接
/// Failed auth or ban: respond, then close after a short flush window.
fn respond_connack(server: &Arc<ImServer>, conn: &Arc<Conn>, time_diff: i64, code: ReasonCode) {
    let _ = conn.send_frame(Frame::Connack(ConnackPacket {
        time_diff,
        reason_code: code,
        ..Default::default()
    }));
    server
        .closer
        .schedule(conn.id, Duration::from_millis(server.opts.kick.auth_fail_close_ms));
}
