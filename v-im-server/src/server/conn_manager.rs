use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::conn::Conn;

/// 连接索引：connId 与 uid 两级，(uid,deviceFlag) 视图按需过滤
/// Live-connection index by connId and uid; (uid, deviceFlag) views are
/// filtered off the uid index on demand.
///
/// 被踢连接先移出uid索引（不再被寻址），socket 真正关闭时再整体移除。
/// Kicked connections leave the uid index first (no longer addressable) and
/// are fully removed when the socket actually closes.
#[derive(Default)]
pub struct ConnManager {
    conns: DashMap<u64, Arc<Conn>>,
    uid_conns: DashMap<String, HashSet<u64>>,
    next_id: AtomicU64,
}

impl ConnManager {
    pub fn new() -> Self {
        ConnManager::default()
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 接入即登记（未认证） / Register at accept time (pre-auth).
    pub fn register(&self, conn: Arc<Conn>) {
        self.conns.insert(conn.id, conn);
    }

    /// 认证通过后进入uid索引 / Index by uid once authed.
    pub fn index_uid(&self, conn: &Arc<Conn>) {
        self.uid_conns.entry(conn.uid()).or_default().insert(conn.id);
    }

    /// 踢出寻址：仅移出uid索引，连接对象保留至socket关闭
    /// Unaddress a kicked connection: uid index only, the conn object stays.
    pub fn remove_uid_index(&self, uid: &str, conn_id: u64) {
        if let Some(mut set) = self.uid_conns.get_mut(uid) {
            set.remove(&conn_id);
        }
        self.uid_conns.remove_if(uid, |_, set| set.is_empty());
    }

    /// 连接关闭时的整体移除 / Full removal when the socket closes.
    pub fn remove_conn(&self, conn_id: u64) -> Option<Arc<Conn>> {
        let conn = self.conns.remove(&conn_id).map(|(_, c)| c)?;
        let uid = conn.uid();
        if !uid.is_empty() {
            self.remove_uid_index(&uid, conn_id);
        }
        Some(conn)
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Conn>> {
        self.conns.get(&conn_id).map(|c| c.value().clone())
    }

    /// 指定uid的全部在线连接 / All addressable connections of a uid.
    pub fn conns_by_uid(&self, uid: &str) -> Vec<Arc<Conn>> {
        let Some(ids) = self.uid_conns.get(uid) else {
            return vec![];
        };
        ids.iter().filter_map(|id| self.get(*id)).collect()
    }

    /// 指定uid与设备类型的在线连接 / Connections of (uid, deviceFlag).
    pub fn conns_with(&self, uid: &str, device_flag: u8) -> Vec<Arc<Conn>> {
        self.conns_by_uid(uid)
            .into_iter()
            .filter(|c| c.device_flag() == device_flag)
            .collect()
    }

    pub fn exist_conns_with_uid(&self, uid: &str) -> bool {
        self.uid_conns
            .get(uid)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// (同设备类型在线数, uid总在线数) / (per-device count, total per uid).
    pub fn count_with(&self, uid: &str, device_flag: u8) -> (u32, u32) {
        let conns = self.conns_by_uid(uid);
        let device = conns.iter().filter(|c| c.device_flag() == device_flag).count() as u32;
        (device, conns.len() as u32)
    }

    pub fn all_conns(&self) -> Vec<Arc<Conn>> {
        self.conns.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::conn::ConnState;
    use tokio::sync::mpsc;

    fn make_conn(manager: &ConnManager, uid: &str, device_flag: u8, device_id: &str) -> Arc<Conn> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Conn::new(
            manager.next_conn_id(),
            "127.0.0.1:9".parse().expect("addr"),
            tx,
        ));
        conn.set_state(ConnState {
            uid: uid.to_string(),
            device_flag,
            device_id: device_id.to_string(),
            authed: true,
            ..Default::default()
        });
        manager.register(conn.clone());
        manager.index_uid(&conn);
        // 写端接收者随rx丢弃，测试中只关心索引 / writer receiver dropped, tests use indexes only
        conn
    }

    #[test]
    fn uid_and_flag_views() {
        let manager = ConnManager::new();
        let c1 = make_conn(&manager, "alice", 1, "d1");
        let _c2 = make_conn(&manager, "alice", 2, "d2");
        let _c3 = make_conn(&manager, "bob", 1, "d3");

        assert_eq!(manager.conns_by_uid("alice").len(), 2);
        assert_eq!(manager.conns_with("alice", 1).len(), 1);
        assert_eq!(manager.count_with("alice", 1), (1, 2));

        manager.remove_uid_index("alice", c1.id);
        assert_eq!(manager.conns_with("alice", 1).len(), 0);
        // 对象仍可按id寻址，直到真正关闭 / still addressable by id until close
        assert!(manager.get(c1.id).is_some());

        manager.remove_conn(c1.id);
        assert!(manager.get(c1.id).is_none());
    }

    #[test]
    fn exist_conns_follows_index() {
        let manager = ConnManager::new();
        let conn = make_conn(&manager, "alice", 1, "d1");
        assert!(manager.exist_conns_with_uid("alice"));
        manager.remove_uid_index("alice", conn.id);
        assert!(!manager.exist_conns_with_uid("alice"));
    }
}
