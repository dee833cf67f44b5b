use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::server::ImServer;

/// 启动空闲连接清理任务 / Spawn the idle-connection sweep task.
///
/// 已认证连接超过各自max-idle即关闭；始终未认证的连接超过认证宽限即关闭。
/// Authed connections close past their max-idle; never-authed connections
/// close past the auth deadline.
pub fn spawn_cleanup_task(server: Arc<ImServer>) {
    let idle_ms = server.opts.server.conn_idle_secs * 1000;
    let cleanup_interval_ms = if idle_ms <= 1000 {
        (idle_ms / 2).max(100)
    } else if idle_ms <= 10_000 {
        1000
    } else {
        5000
    };
    info!(
        "⏰ 空闲清理间隔 / cleanup interval {}ms for idle {}ms",
        cleanup_interval_ms, idle_ms
    );
    let mut shutdown_rx = server.shutdown_rx();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(cleanup_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => cleanup_timeout_connections(&server),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

fn cleanup_timeout_connections(server: &Arc<ImServer>) {
    let auth_deadline = Duration::from_secs(server.opts.server.auth_deadline_secs);
    for conn in server.conn_manager.all_conns() {
        let idle = conn.idle_for();
        let timeout = if conn.authed() { conn.max_idle() } else { auth_deadline };
        if idle > timeout {
            debug!(
                "💤 空闲超时，关闭连接 / idle timeout, closing: conn={} idle={:?}",
                conn.id, idle
            );
            conn.close();
        }
    }
}
