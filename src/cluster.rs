//! Cluster coordinator: instance identity, liveness, and message forwarding.
//!
//! Every instance owns a private delivery stream in the shared store; a
//! message for a user connected elsewhere is appended to the owning
//! instance's stream and delivered by that instance's consumer loop.
//! Liveness is the heartbeat key with a short TTL, never the session index:
//! the index only tells the sweep which sessions a dead instance held.
//!
//! The dead-instance sweep runs on every instance with no leader election;
//! cleanup is idempotent because the index key disappears with the first
//! completed pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::delivery::MessageSender;
use crate::error::Result;
use crate::message::{now_millis, Message};
use crate::registry::ConnectionRegistry;
use crate::store::{keys, SharedStore, StreamEntry};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TTL_SECS: u64 = 10;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const STREAM_BLOCK_MS: u64 = 2000;
const STREAM_BATCH: usize = 50;
const STREAM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct ClusterCoordinator {
    instance_id: String,
    store: Arc<dyn SharedStore>,
    registry: Arc<ConnectionRegistry>,
    delivery: MessageSender,
    cancel: CancellationToken,
}

impl ClusterCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<ConnectionRegistry>,
        delivery: MessageSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            store,
            registry,
            delivery,
            cancel: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Announce this instance and spawn the background loops: private-stream
    /// consumer, heartbeat refresh, dead-instance sweep, and the advisory
    /// broadcast listener.
    pub async fn start(self: &Arc<Self>) {
        tracing::info!(
            instance_id = %self.instance_id,
            "Cluster coordinator started, listening on private stream {}",
            keys::instance_stream(&self.instance_id)
        );

        // First heartbeat lands before the sweep loop can run, so a slow
        // startup is never mistaken for a dead instance.
        self.publish_heartbeat().await;
        self.publish_event("STARTUP").await;

        tokio::spawn(self.clone().listen_stream());
        tokio::spawn(self.clone().heartbeat_loop());
        tokio::spawn(self.clone().sweep_loop());
        tokio::spawn(self.clone().broadcast_loop());
    }

    /// Stop stream reads and drop the heartbeat key immediately so peers
    /// detect the departure faster than the TTL expiry. Session cleanup is
    /// left to normal disconnect handling, or to the sweep if we died hard.
    pub async fn shutdown(&self) {
        tracing::info!(instance_id = %self.instance_id, "Cluster coordinator shutting down");
        self.cancel.cancel();
        if let Err(e) = self.store.del(&keys::heartbeat(&self.instance_id)).await {
            tracing::warn!(error = %e, "Failed to delete own heartbeat key");
        }
    }

    // --- private stream ---

    /// Append a message to another instance's private stream. Fire-and-forget:
    /// end-user reliability comes from the sender-side ack cache, not from
    /// stream delivery confirmation.
    pub async fn forward_to_instance(&self, target_instance_id: &str, msg: &Message) -> Result<()> {
        if target_instance_id.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_string(msg)?;
        self.store
            .stream_add(&keys::instance_stream(target_instance_id), "body", &body)
            .await?;
        Ok(())
    }

    /// Dedicated consumer loop for this instance's own stream. Each record is
    /// handled on an independent task; read errors back off and retry while
    /// the coordinator is running.
    async fn listen_stream(self: Arc<Self>) {
        let stream_key = keys::instance_stream(&self.instance_id);
        let mut last_id = "$".to_string();

        loop {
            let read = tokio::select! {
                read = self
                    .store
                    .stream_read(&stream_key, &last_id, STREAM_BLOCK_MS, STREAM_BATCH) => read,
                () = self.cancel.cancelled() => break,
            };

            match read {
                Ok(records) => {
                    for record in records {
                        last_id = record.id.clone();
                        tokio::spawn(self.clone().handle_stream_record(record));
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error reading from private stream");
                    tokio::select! {
                        () = tokio::time::sleep(STREAM_ERROR_BACKOFF) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
            }
        }
    }

    async fn handle_stream_record(self: Arc<Self>, record: StreamEntry) {
        if let Some(body) = record.field("body") {
            self.handle_forwarded(body).await;
        }
        // No consumer group: deleting the consumed record keeps the stream
        // small and gives at-most-once removal.
        let stream_key = keys::instance_stream(&self.instance_id);
        if let Err(e) = self.store.stream_del(&stream_key, &record.id).await {
            tracing::error!(record_id = %record.id, error = %e, "Failed to delete consumed stream record");
        }
    }

    /// Deliver a message forwarded from another instance to this instance's
    /// local connections. The sender already cached it for acks, so this is a
    /// plain send.
    async fn handle_forwarded(&self, body: &str) {
        let msg: Message = match serde_json::from_str(body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "Malformed forwarded message");
                return;
            }
        };

        let conns = self.registry.get_connections(&msg.to_uid);
        if conns.is_empty() {
            tracing::warn!(
                to_uid = %msg.to_uid,
                "Received forwarded message but user not connected locally"
            );
            return;
        }
        for conn in conns.iter().filter(|c| c.is_open()) {
            if let Err(e) = self.delivery.send(conn, &msg).await {
                tracing::warn!(to_uid = %msg.to_uid, error = %e, "Failed to deliver forwarded message");
            }
        }
    }

    // --- liveness ---

    /// Refresh this instance's heartbeat key (the authoritative liveness
    /// signal) and publish the advisory broadcast event.
    pub async fn publish_heartbeat(&self) {
        self.publish_event("HEARTBEAT").await;
        if let Err(e) = self
            .store
            .set_with_ttl(
                &keys::heartbeat(&self.instance_id),
                &now_millis().to_string(),
                HEARTBEAT_TTL_SECS,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to refresh heartbeat key");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // start() already wrote the first heartbeat
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_heartbeat().await,
                () = self.cancel.cancelled() => break,
            }
        }
    }

    /// Detect instances whose heartbeat key has expired and release their
    /// claimed sessions. Runs on every instance; re-running on an
    /// already-cleaned instance is a no-op because its index key is gone.
    pub async fn sweep_dead_instances(&self) -> Result<()> {
        let index_keys = self
            .store
            .keys_matching(&format!("{}*", keys::INSTANCE_SESSIONS_PREFIX))
            .await?;

        for index_key in index_keys {
            let dead_id = index_key
                .strip_prefix(keys::INSTANCE_SESSIONS_PREFIX)
                .unwrap_or(&index_key)
                .to_string();
            if self.store.exists(&keys::heartbeat(&dead_id)).await? {
                continue;
            }
            tracing::warn!(dead_instance = %dead_id, "Detected dead instance, cleaning up its sessions");
            self.cleanup_dead_instance(&dead_id, &index_key).await;
        }
        Ok(())
    }

    async fn cleanup_dead_instance(&self, dead_id: &str, index_key: &str) {
        match self.store.set_members(index_key).await {
            Ok(pairs) => {
                for pair in pairs {
                    let Some((uid, device_id)) = pair.split_once(':') else {
                        continue;
                    };
                    if let Err(e) = self
                        .store
                        .hash_del(&keys::session(uid), &[device_id.to_string()])
                        .await
                    {
                        tracing::error!(user = %uid, device = %device_id, error = %e, "Failed to clean up dead session");
                        continue;
                    }
                    tracing::info!(
                        user = %uid,
                        device = %device_id,
                        dead_instance = %dead_id,
                        "Cleaned up session owned by dead instance"
                    );
                }
            }
            Err(e) => {
                tracing::error!(dead_instance = %dead_id, error = %e, "Failed to read dead instance session index");
            }
        }

        if let Err(e) = self.store.del(index_key).await {
            tracing::error!(dead_instance = %dead_id, error = %e, "Failed to delete session index key");
        }
        if let Err(e) = self.store.del(&keys::instance_stream(dead_id)).await {
            tracing::error!(dead_instance = %dead_id, error = %e, "Failed to delete dead instance stream");
        }
        tracing::info!(dead_instance = %dead_id, "Completed dead instance cleanup");
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_dead_instances().await {
                        tracing::error!(error = %e, "Error checking dead instances");
                    }
                }
                () = self.cancel.cancelled() => break,
            }
        }
    }

    // --- session index ---

    /// Record that this instance owns a (user, device) session. The reverse
    /// index feeds only the dead-instance sweep.
    pub async fn register_session(&self, uid: &str, device_id: &str) -> Result<()> {
        self.store
            .set_add(
                &keys::instance_sessions(&self.instance_id),
                &format!("{uid}:{device_id}"),
            )
            .await
    }

    pub async fn unregister_session(&self, uid: &str, device_id: &str) -> Result<()> {
        self.store
            .set_remove(
                &keys::instance_sessions(&self.instance_id),
                &format!("{uid}:{device_id}"),
            )
            .await
    }

    // --- advisory broadcast ---

    async fn publish_event(&self, event: &str) {
        let payload = format!("{}:{event}", self.instance_id);
        if let Err(e) = self.store.publish(keys::BROADCAST_CHANNEL, &payload).await {
            tracing::warn!(event = %event, error = %e, "Failed to publish cluster event");
        }
    }

    async fn broadcast_loop(self: Arc<Self>) {
        let mut rx = match self.store.subscribe(keys::BROADCAST_CHANNEL).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to cluster broadcast channel");
                return;
            }
        };
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        // Advisory only; ignore our own events.
                        Some(body) if !body.starts_with(&self.instance_id) => {
                            tracing::debug!(event = %body, "Received cluster event");
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                () = self.cancel.cancelled() => break,
            }
        }
    }
}
