//! In-memory store implementation.
//!
//! Single-process stand-in for the Redis backend with the same single-key
//! atomicity guarantees. Used by the test suite; two coordinators sharing one
//! `MemoryStore` model a multi-instance cluster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{SharedStore, StreamEntry};
use crate::error::Result;

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Record {
    seq: u64,
    fields: Vec<(String, String)>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, Vec<Record>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    stream_notify: Notify,
    next_seq: AtomicU64,
}

/// Minimal glob matcher (`*` and `?`), enough for `prefix:*` scans.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pb = pattern.as_bytes();
    let tb = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (usize::MAX, 0usize);

    while ti < tb.len() {
        if pi < pb.len() && (pb[pi] == b'?' || pb[pi] == tb[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pb.len() && pb[pi] == b'*' {
            star_p = pi;
            star_t = ti;
            pi += 1;
        } else if star_p != usize::MAX {
            pi = star_p + 1;
            star_t += 1;
            ti = star_t;
        } else {
            return false;
        }
    }
    while pi < pb.len() && pb[pi] == b'*' {
        pi += 1;
    }
    pi == pb.len()
}

fn format_id(seq: u64) -> String {
    format!("0-{seq}")
}

fn parse_id(id: &str) -> u64 {
    id.strip_prefix("0-")
        .unwrap_or(id)
        .parse::<u64>()
        .unwrap_or(0)
}

/// Normalize a redis-style (start, stop) range against a list length.
/// Negative indices count from the end; an inverted range is empty.
fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        if inner.strings.get(key).is_some_and(StringEntry::expired) {
            inner.strings.remove(key);
        }
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.lock().strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.lists.remove(key);
        inner.streams.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.strings.get(key).is_some_and(StringEntry::expired) {
            inner.strings.remove(key);
        }
        Ok(inner.strings.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.sets.contains_key(key)
            || inner.lists.contains_key(key)
            || inner.streams.contains_key(key))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .strings
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.strings.remove(&key);
        }

        let mut found: HashSet<&String> = HashSet::new();
        found.extend(inner.strings.keys());
        found.extend(inner.hashes.keys());
        found.extend(inner.sets.keys());
        found.extend(inner.lists.keys());
        found.extend(inner.streams.keys());
        Ok(found
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn hash_put(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hash_del(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut inner = self.lock();
        if let Some(hash) = inner.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
            if hash.is_empty() {
                inner.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lock().lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = normalize_range(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut inner = self.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };
        match normalize_range(list.len(), start, stop) {
            Some((start, stop)) => {
                let kept: VecDeque<String> = list
                    .iter()
                    .skip(start)
                    .take(stop - start + 1)
                    .cloned()
                    .collect();
                *list = kept;
            }
            None => {
                list.clear();
            }
        }
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(())
    }

    async fn stream_add(&self, key: &str, field: &str, value: &str) -> Result<String> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock()
            .streams
            .entry(key.to_string())
            .or_default()
            .push(Record {
                seq,
                fields: vec![(field.to_string(), value.to_string())],
            });
        self.stream_notify.notify_waiters();
        Ok(format_id(seq))
    }

    async fn stream_read(
        &self,
        key: &str,
        after_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let cursor = {
            let inner = self.lock();
            if after_id == "$" {
                inner
                    .streams
                    .get(key)
                    .and_then(|s| s.last())
                    .map(|r| r.seq)
                    .unwrap_or(0)
            } else {
                parse_id(after_id)
            }
        };

        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            {
                let inner = self.lock();
                if let Some(records) = inner.streams.get(key) {
                    let out: Vec<StreamEntry> = records
                        .iter()
                        .filter(|r| r.seq > cursor)
                        .take(count)
                        .map(|r| StreamEntry {
                            id: format_id(r.seq),
                            fields: r.fields.clone(),
                        })
                        .collect();
                    if !out.is_empty() {
                        return Ok(out);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                () = self.stream_notify.notified() => {}
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn stream_del(&self, key: &str, id: &str) -> Result<()> {
        let seq = parse_id(id);
        if let Some(records) = self.lock().streams.get_mut(key) {
            records.retain(|r| r.seq != seq);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
