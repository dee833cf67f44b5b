use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::conn_manager::ConnManager;

/// 延迟关闭事件 / A delayed close event.
#[derive(Debug)]
struct CloseEvent {
    conn_id: u64,
    deadline: Instant,
}

/// 连接延迟关闭器：事件入队，由专属任务按期执行
/// Delayed connection closer: `(connId, afterMs)` events consumed by one
/// dedicated task, so no close callback captures a connection.
#[derive(Clone)]
pub struct Closer {
    tx: mpsc::UnboundedSender<CloseEvent>,
}

impl Closer {
    /// 启动消费任务 / Spawn the consumer task.
    pub fn start(conn_manager: Arc<ConnManager>) -> Closer {
        let (tx, mut rx) = mpsc::unbounded_channel::<CloseEvent>();
        tokio::spawn(async move {
            let mut queue: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
            loop {
                let next_deadline = queue.peek().map(|Reverse((at, _))| *at);
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                queue.push(Reverse((event.deadline, event.conn_id)));
                            }
                            None => break,
                        }
                    }
                    _ = sleep_until_or_forever(next_deadline) => {
                        let now = Instant::now();
                        while let Some(Reverse((at, conn_id))) = queue.peek().copied() {
                            if at > now {
                                break;
                            }
                            queue.pop();
                            if let Some(conn) = conn_manager.get(conn_id) {
                                debug!("🔒 延迟关闭触发 / delayed close fired: conn={}", conn_id);
                                conn.close();
                            }
                        }
                    }
                }
            }
        });
        Closer { tx }
    }

    /// 计划在 after 之后关闭连接 / Schedule a close `after` from now.
    pub fn schedule(&self, conn_id: u64, after: Duration) {
        let _ = self.tx.send(CloseEvent { conn_id, deadline: Instant::now() + after });
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::conn::{Conn, OutEvent};

    #[tokio::test]
    async fn scheduled_close_fires_in_order() {
        let manager = Arc::new(ConnManager::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Conn::new(
            manager.next_conn_id(),
            "127.0.0.1:9".parse().expect("addr"),
            tx,
        ));
        manager.register(conn.clone());

        let closer = Closer::start(manager.clone());
        closer.schedule(conn.id, Duration::from_millis(20));
        assert!(rx.try_recv().is_err(), "must not close before the grace");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(rx.try_recv(), Ok(OutEvent::Close)));
        assert!(conn.is_closed());
    }
}
