//! The notifier handler: deduplicated human-readable notifications for
//! every transition of the kinds it is attached to.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{extract::State, routing::get, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use watcher_api::Responder;
use watcher_core::{Event, Handler};

use crate::{Coordinator, HttpRetry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub chat_id: String,
    /// Runtime switch: when off, claims are still written but nothing is
    /// sent, so multi-replica dedup state stays consistent.
    pub enable: bool,
}

/// Transport seam for the outbound notification call.
#[async_trait]
pub trait NoticeSender: Send + Sync {
    async fn send(&self, content: &str) -> Result<()>;
}

/// Delivers notifications to the messaging relay with basic auth.
pub struct HttpSender {
    config: NotifierConfig,
    http: reqwest::Client,
    retry: HttpRetry,
}

impl HttpSender {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            retry: HttpRetry::default(),
        }
    }
}

#[async_trait]
impl NoticeSender for HttpSender {
    async fn send(&self, content: &str) -> Result<()> {
        let url = format!("{}/api/tasks/push", self.config.endpoint.trim_end_matches('/'));
        let body = json!({
            "config": {
                "chat_id": self.config.chat_id,
                "content": content,
            }
        });

        let mut wait = self.retry.initial_wait;
        let mut last_err = None;
        for attempt in 1..=self.retry.attempts.max(1) {
            let req = self
                .http
                .post(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .json(&body);

            match req.send().await {
                Ok(res) if res.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(res) => {
                    last_err = Some(anyhow!("notice push failed, status code[{}]", res.status().as_u16()));
                }
                Err(err) => last_err = Some(err.into()),
            }

            if attempt < self.retry.attempts {
                wait = self.retry.pause(wait).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("notice push failed")))
    }
}

pub struct NotifierHandler {
    coordinator: Coordinator,
    sender: Arc<dyn NoticeSender>,
    enabled: bool,
}

impl NotifierHandler {
    pub fn new(coordinator: Coordinator, sender: Arc<dyn NoticeSender>, enabled: bool) -> Self {
        Self {
            coordinator,
            sender,
            enabled,
        }
    }

    async fn notify(&self, event: &Event) -> Result<()> {
        // claim first so replicas racing on the same event mostly collapse
        // into one send
        if !self.coordinator.claim(event).await {
            debug!(key = %event.key, action = %event.action, "already notified elsewhere, skipped");
            return Ok(());
        }

        if !self.enabled {
            debug!(key = %event.key, "notifications disabled, claim recorded only");
            return Ok(());
        }

        self.sender.send(&event.message()).await?;
        metrics::counter!("watcher_notifications_total", 1u64);
        Ok(())
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new().route("/", get(route_name)).with_state(Arc::clone(self))
    }
}

async fn route_name(State(h): State<Arc<NotifierHandler>>) -> Responder {
    Responder::ok(h.name())
}

#[async_trait]
impl Handler for NotifierHandler {
    fn name(&self) -> &'static str {
        "notifier"
    }

    async fn created(&self, event: &Event) -> Result<()> {
        self.notify(event).await
    }

    async fn updated(&self, event: &Event) -> Result<()> {
        self.notify(event).await
    }

    async fn deleted(&self, event: &Event) -> Result<()> {
        self.notify(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use watcher_core::{EventAction, ResourceKind, WatchedObject};
    use watcher_kv::mem::MemStore;
    use watcher_kv::{GetOptions, KvStore};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NoticeSender for RecordingSender {
        async fn send(&self, content: &str) -> Result<()> {
            self.sent.lock().unwrap().push(content.to_string());
            Ok(())
        }
    }

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

    fn notifier(store: Arc<MemStore>, enabled: bool) -> (NotifierHandler, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let handler = NotifierHandler::new(
            Coordinator::new(store),
            sender.clone() as Arc<dyn NoticeSender>,
            enabled,
        );
        (handler, sender)
    }

    #[tokio::test]
    async fn duplicate_events_send_exactly_once() {
        let (handler, sender) = notifier(Arc::new(MemStore::new()), true);

        handler.created(&event()).await.unwrap();
        handler.created(&event()).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("web-1 has been created"));
    }

    #[tokio::test]
    async fn expired_claim_sends_again() {
        let store = Arc::new(MemStore::with_ttl_unit(Duration::from_millis(5)));
        let (handler, sender) = notifier(store, true);

        handler.created(&event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handler.created(&event()).await.unwrap();

        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn disabled_notifier_claims_but_never_sends() {
        let store = Arc::new(MemStore::new());
        let (handler, sender) = notifier(store.clone(), false);

        let e = event();
        handler.created(&e).await.unwrap();
        assert!(sender.sent().is_empty());

        // the claim marker is still written to keep replica state consistent
        let range = store
            .get(&e.claim_key(), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(range.count, 1);
    }
}
