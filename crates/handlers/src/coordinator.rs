//! Claim-once coordination for side effects that must not repeat across
//! replicas watching the same cluster.

use std::sync::Arc;

use tracing::{debug, warn};

use watcher_core::Event;
use watcher_kv::{GetOptions, KvStore};

/// Seconds before a claim marker expires on its own; no explicit deletion.
const CLAIM_TTL: i64 = 10;
const CLAIM_MARKER: &str = r#"{"success": true}"#;

/// Best-effort at-most-once claims backed by short-TTL markers in the
/// coordination store.
///
/// The read-then-write window between two replicas is an accepted race, not
/// a bug: there is no compare-and-swap here, and store errors degrade to
/// "claim and proceed" so a flaky store never suppresses a side effect.
pub struct Coordinator {
    store: Arc<dyn KvStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Returns `true` when this call claimed the event (the side effect
    /// should run) and `false` when another replica already holds the claim.
    pub async fn claim(&self, event: &Event) -> bool {
        let key = event.claim_key();

        match self.store.get(&key, GetOptions::keys_only_first()).await {
            Ok(range) if range.count > 0 => {
                debug!(key = %key, "already claimed elsewhere");
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(key = %key, "claim check failed, proceeding: {err}");
            }
        }

        if let Err(err) = self.store.put(&key, CLAIM_MARKER, Some(CLAIM_TTL)).await {
            warn!(key = %key, "claim marker write failed: {err}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use watcher_core::{EventAction, ResourceKind, WatchedObject};
    use watcher_kv::mem::MemStore;

    fn event() -> Event {
        let mut pod = k8s_openapi::api::core::v1::Pod::default();
        pod.metadata.name = Some("web-1".to_string());
        pod.metadata.namespace = Some("default".to_string());
        Event {
            key: "default/web-1".to_string(),
            action: EventAction::Created,
            resource: ResourceKind::Pod,
            namespace: "default".to_string(),
            object: WatchedObject::Pod(Box::new(pod)),
            old_object: None,
        }
    }

    #[tokio::test]
    async fn second_claim_for_same_event_is_refused() {
        let coordinator = Coordinator::new(Arc::new(MemStore::new()));
        assert!(coordinator.claim(&event()).await);
        assert!(!coordinator.claim(&event()).await);
    }

    #[tokio::test]
    async fn claims_are_scoped_by_action() {
        let coordinator = Coordinator::new(Arc::new(MemStore::new()));
        let created = event();
        let mut deleted = event();
        deleted.action = EventAction::Deleted;

        assert!(coordinator.claim(&created).await);
        assert!(coordinator.claim(&deleted).await);
    }

    #[tokio::test]
    async fn expired_claim_can_be_taken_again() {
        let store = Arc::new(MemStore::with_ttl_unit(Duration::from_millis(5)));
        let coordinator = Coordinator::new(store);

        assert!(coordinator.claim(&event()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.claim(&event()).await);
    }
}
