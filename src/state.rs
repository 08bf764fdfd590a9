use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterCoordinator;
use crate::delivery::MessageSender;
use crate::registry::ConnectionRegistry;
use crate::store::SharedStore;

/// Shared application context, wired once at startup and cloned into every
/// handler: one instance each of the registry, store client, delivery
/// engine, and cluster coordinator.
#[derive(Clone)]
pub struct AppState {
    /// Shared store client (the only cross-instance coordination point).
    pub store: Arc<dyn SharedStore>,
    /// Active local connections per (user, device).
    pub registry: Arc<ConnectionRegistry>,
    /// Delivery engine.
    pub delivery: MessageSender,
    /// Cluster coordinator for this instance.
    pub cluster: Arc<ClusterCoordinator>,
    /// Reader-idle timeout for the transport actor.
    pub idle_timeout: Duration,
}
