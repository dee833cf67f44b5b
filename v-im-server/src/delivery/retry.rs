use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RetryConfig;
use crate::domain::Message;

type RetryKey = (String, String, i64);

/// 等待确认的投递 / One delivery awaiting its recvack.
#[derive(Clone)]
pub struct RetryEntry {
    pub uid: String,
    pub device_id: String,
    pub message_id: i64,
    pub send_count: u32,
    pub message: Message,
}

impl RetryEntry {
    fn key(&self) -> RetryKey {
        (self.uid.clone(), self.device_id.clone(), self.message_id)
    }
}

/// 重试队列：哈希时间轮，桶内slot记录到期刻
/// Retry queue: hashed timing wheel; slots carry their absolute due tick so
/// a small wheel still supports long intervals.
///
/// 条目的权威状态在 `entries`，recvack 完成即移除；桶里的引用到期时惰性作废。
/// Authoritative state lives in `entries`; recvack removal invalidates the
/// bucket references lazily at expiry.
pub struct RetryQueue {
    entries: DashMap<RetryKey, RetryEntry>,
    buckets: Vec<Mutex<Vec<(RetryKey, u64)>>>,
    tick: AtomicU64,
    ticks_per_interval: u64,
    max_retry: u32,
    pub tick_ms: u64,
}

impl RetryQueue {
    pub fn new(config: &RetryConfig) -> Self {
        let wheel_size = config.wheel_size.max(2);
        let tick_ms = config.tick_ms.max(1);
        let ticks_per_interval = (config.interval_ms / tick_ms).max(1);
        RetryQueue {
            entries: DashMap::new(),
            buckets: (0..wheel_size).map(|_| Mutex::new(Vec::new())).collect(),
            tick: AtomicU64::new(0),
            ticks_per_interval,
            max_retry: config.max_count.max(1),
            tick_ms,
        }
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// 登记一次投递 / Register a delivery for retry tracking.
    pub fn schedule(&self, entry: RetryEntry) {
        let key = entry.key();
        let due = self.tick.load(Ordering::Acquire) + self.ticks_per_interval;
        self.entries.insert(key.clone(), entry);
        let bucket = (due % self.buckets.len() as u64) as usize;
        self.buckets[bucket].lock().push((key, due));
    }

    /// 确认完成：移除等待项，返回是否存在
    /// Finish on recvack; returns whether an entry was pending.
    pub fn finish(&self, uid: &str, device_id: &str, message_id: i64) -> bool {
        self.entries
            .remove(&(uid.to_string(), device_id.to_string(), message_id))
            .is_some()
    }

    /// 推进一刻并取出到期且仍存活的条目
    /// Advance one tick, returning expired entries that are still live.
    pub fn advance(&self) -> Vec<RetryEntry> {
        let now = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let bucket = (now % self.buckets.len() as u64) as usize;
        let mut slot = self.buckets[bucket].lock();
        let mut due_keys = Vec::new();
        slot.retain(|(key, due)| {
            if *due <= now {
                due_keys.push(key.clone());
                false
            } else {
                true
            }
        });
        drop(slot);
        due_keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(_, e)| e))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(interval_ms: u64, tick_ms: u64, wheel: usize) -> RetryQueue {
        RetryQueue::new(&RetryConfig {
            interval_ms,
            max_count: 3,
            wheel_size: wheel,
            tick_ms,
        })
    }

    fn entry(uid: &str, message_id: i64) -> RetryEntry {
        RetryEntry {
            uid: uid.to_string(),
            device_id: "d1".to_string(),
            message_id,
            send_count: 1,
            message: Message::default(),
        }
    }

    #[test]
    fn entry_expires_after_interval() {
        let q = queue(40, 10, 8);
        q.schedule(entry("alice", 1));
        for _ in 0..3 {
            assert!(q.advance().is_empty(), "premature expiry");
        }
        let expired = q.advance();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn finish_prevents_expiry() {
        let q = queue(40, 10, 8);
        q.schedule(entry("alice", 1));
        assert!(q.finish("alice", "d1", 1));
        assert!(!q.finish("alice", "d1", 1), "second finish finds nothing");
        for _ in 0..8 {
            assert!(q.advance().is_empty());
        }
    }

    #[test]
    fn small_wheel_supports_long_intervals() {
        // 间隔10刻，轮长4：须绕两圈半才到期 / 10 ticks on a 4-slot wheel
        let q = queue(100, 10, 4);
        q.schedule(entry("alice", 1));
        let mut fired = 0;
        for _ in 0..9 {
            fired += q.advance().len();
        }
        assert_eq!(fired, 0);
        assert_eq!(q.advance().len(), 1);
    }

    #[test]
    fn reschedule_keeps_latest_send_count() {
        let q = queue(20, 10, 4);
        q.schedule(entry("alice", 1));
        let mut e = entry("alice", 1);
        e.send_count = 2;
        q.schedule(e);
        q.advance();
        let expired = q.advance();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].send_count, 2);
        // 旧桶引用惰性作废 / the stale bucket reference resolves to nothing
        assert!(q.advance().is_empty());
        assert!(q.advance().is_empty());
    }
}
