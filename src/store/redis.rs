//! Redis-backed shared store.
//!
//! Plain commands go over one multiplexed connection. Blocking stream reads
//! get a dedicated connection so a 2s XREAD BLOCK never stalls unrelated
//! commands, and the broadcast subscription runs on its own pub/sub
//! connection with messages forwarded over a channel.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::{SharedStore, StreamEntry};
use crate::error::Result;

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// Dedicated connection for blocking XREADs (single consumer: the
    /// cluster's private-stream loop).
    blocking: Mutex<MultiplexedConnection>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let blocking = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(blocking),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        Ok(conn.set_ex(key, value, ttl_secs).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn hash_put(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_del(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, fields.to_vec()).await?;
        Ok(())
    }

    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn stream_add(&self, key: &str, field: &str, value: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        Ok(conn.xadd(key, "*", &[(field, value)]).await?)
    }

    async fn stream_read(
        &self,
        key: &str,
        after_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let opts = StreamReadOptions::default()
            .block(block_ms as usize)
            .count(count);
        let reply: StreamReadReply = {
            let mut conn = self.blocking.lock().await;
            conn.xread_options(&[key], &[after_id], &opts).await?
        };

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let fields = id
                    .map
                    .iter()
                    .filter_map(|(k, v)| {
                        redis::from_redis_value::<String>(v)
                            .ok()
                            .map(|v| (k.clone(), v))
                    })
                    .collect();
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn stream_del(&self, key: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.xdel(key, &[id]).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
