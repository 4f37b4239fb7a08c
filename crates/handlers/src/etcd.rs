//! The etcd handler: DNS registrar for pod-declared services, plus raw
//! key-value admin routes under `/handlers/etcd/keys/*`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use watcher_api::Responder;
use watcher_core::{classify, containers_ready, is_departing, Event, Handler, PodTransition, ResourceKind, ServiceDescriptor};
use watcher_kv::{join_key, GetOptions, KvStore};

pub struct EtcdHandler {
    store: Arc<dyn KvStore>,
    dns_prefix: String,
}

impl EtcdHandler {
    /// `dns_prefix` is the root under which DNS records live; it must be an
    /// absolute key path. A trailing slash is tolerated and trimmed.
    pub fn new(store: Arc<dyn KvStore>, dns_prefix: &str) -> Result<Self> {
        let dns_prefix = dns_prefix.trim_end_matches('/').to_string();
        if !dns_prefix.starts_with('/') {
            bail!("invalid dns prefix, must start with '/'");
        }

        Ok(Self { store, dns_prefix })
    }

    pub fn dns_prefix(&self) -> &str {
        &self.dns_prefix
    }

    fn record_key(&self, service: &ServiceDescriptor) -> String {
        join_key(&[&self.dns_prefix, &service.dns_name(), &service.dns_key()])
    }

    /// Write the service's resolution record for DNS to serve.
    pub async fn create_service(&self, service: &ServiceDescriptor) -> Result<()> {
        self.store
            .put(&self.record_key(service), &service.dns_record(), None)
            .await
            .context("etcd key cannot be created")?;

        info!("[etcd][{}] - [{}] create successful", service.name, service.identity());
        metrics::counter!("watcher_dns_records_total", 1u64, "op" => "create");
        Ok(())
    }

    /// Remove the service's resolution record. The scan is prefix-based but
    /// only the exactly matching key is deleted, so sibling records under
    /// the same DNS name survive.
    pub async fn delete_service(&self, service: &ServiceDescriptor) -> Result<()> {
        let scope = join_key(&[&self.dns_prefix, &service.dns_name()]);
        let range = self
            .store
            .get(&scope, GetOptions::prefix())
            .await
            .context("get key error")?;

        let target = self.record_key(service);
        for entry in &range.kvs {
            if entry.key != target {
                continue;
            }
            self.store
                .delete(&target, false)
                .await
                .context("etcd key cannot be deleted")?;
        }

        info!("[etcd][{}] - [{}] delete successful", service.name, service.identity());
        metrics::counter!("watcher_dns_records_total", 1u64, "op" => "delete");
        Ok(())
    }
}

#[async_trait]
impl Handler for EtcdHandler {
    fn name(&self) -> &'static str {
        "etcd"
    }

    // DNS registration only happens through the update transition or the
    // administrative create; creates are observed and dropped.
    async fn created(&self, event: &Event) -> Result<()> {
        if event.resource != ResourceKind::Pod {
            debug!("invalid resource type, skipped");
            return Ok(());
        }

        debug!("pod[{}] did not do anything when created, skipped", event.object.name());
        Ok(())
    }

    async fn deleted(&self, event: &Event) -> Result<()> {
        if event.resource != ResourceKind::Pod {
            debug!("invalid resource type, skipped");
            return Ok(());
        }

        // best effort: one failing record must not block the others
        let services = match event.pod_services() {
            Ok(services) => services,
            Err(err) => {
                error!("an error occurred while getting services: {err}");
                return Ok(());
            }
        };
        for service in &services {
            if let Err(err) = self.delete_service(service).await {
                error!("an error occurred while deleting the service: {err:#}");
            }
        }

        Ok(())
    }

    async fn updated(&self, event: &Event) -> Result<()> {
        let Some(pod) = event.object.as_pod() else {
            debug!("invalid resource type, skipped");
            return Ok(());
        };
        let Some(old_pod) = event.old_object.as_ref().and_then(|o| o.as_pod()) else {
            debug!("update event without previous state, skipped");
            return Ok(());
        };

        let services = match event.pod_services() {
            Ok(services) => services,
            Err(err) => {
                debug!("{err}");
                return Ok(());
            }
        };

        let total = services.len();
        let mut failed = 0usize;

        match classify(pod, old_pod) {
            PodTransition::Teardown => {
                for service in &services {
                    if let Err(err) = self.delete_service(service).await {
                        error!(
                            "pod[{}] - [{}] remove dns record error: {err:#}",
                            event.object.name(),
                            service.identity()
                        );
                        failed += 1;
                    }
                }
            }
            PodTransition::Activate => {
                if !containers_ready(pod) {
                    debug!("pod[{}] containers not ready, skipped", event.object.name());
                    return Ok(());
                }
                if is_departing(pod) {
                    debug!("pod[{}] is about to be deleted, skipped", event.object.name());
                    return Ok(());
                }
                for service in &services {
                    if let Err(err) = self.create_service(service).await {
                        error!(
                            "pod[{}] - [{}] add dns record error: {err:#}",
                            event.object.name(),
                            service.identity()
                        );
                        failed += 1;
                    }
                }
            }
            PodTransition::Unknown => {
                error!(
                    "pod[{}] unknown transition event, operator attention needed",
                    event.object.name()
                );
            }
        }

        if failed > 0 {
            return Err(anyhow!("{failed} of {total} services failed"));
        }
        Ok(())
    }
}

// ---- admin routes ----

#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    #[serde(default)]
    keys_only: bool,
    #[serde(default)]
    prefix: bool,
    #[serde(default)]
    limit: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PutBody {
    value: Option<Value>,
    #[serde(default)]
    expire: i64,
}

impl EtcdHandler {
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(route_name))
            .route("/keys/*key", get(route_get_key).put(route_put_key).delete(route_delete_key))
            .with_state(Arc::clone(self))
    }
}

async fn route_name(State(h): State<Arc<EtcdHandler>>) -> Responder {
    Responder::ok(h.name())
}

async fn route_get_key(
    State(h): State<Arc<EtcdHandler>>,
    Path(key): Path<String>,
    Query(q): Query<KeyQuery>,
) -> Responder {
    let key = format!("/{}", key.trim_start_matches('/'));
    let opts = GetOptions { prefix: q.prefix, keys_only: q.keys_only, limit: q.limit };

    match h.store.get(&key, opts).await {
        Ok(range) => {
            let kvs: Vec<Value> = range
                .kvs
                .iter()
                .map(|kv| {
                    // values are stored as json; fall back to the raw string
                    let value: Value = serde_json::from_slice(&kv.value)
                        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&kv.value).into_owned()));
                    json!({
                        "key": kv.key,
                        "value": value,
                        "mod_revision": kv.mod_revision,
                        "create_revision": kv.create_revision,
                        "version": kv.version,
                    })
                })
                .collect();
            Responder::ok(json!({ "count": range.count, "kvs": kvs, "more": range.more }))
        }
        Err(err) => Responder::internal(err),
    }
}

async fn route_put_key(
    State(h): State<Arc<EtcdHandler>>,
    Path(key): Path<String>,
    body: Option<axum::Json<PutBody>>,
) -> Responder {
    let key = format!("/{}", key.trim_start_matches('/'));
    let body = body.map(|b| b.0).unwrap_or_default();

    let value = body.value.unwrap_or(Value::Null).to_string();
    let ttl = (body.expire > 0).then_some(body.expire);

    match h.store.put(&key, &value, ttl).await {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(err),
    }
}

async fn route_delete_key(
    State(h): State<Arc<EtcdHandler>>,
    Path(key): Path<String>,
    Query(q): Query<KeyQuery>,
) -> Responder {
    let key = format!("/{}", key.trim_start_matches('/'));

    match h.store.delete(&key, q.prefix).await {
        Ok(deleted) => Responder::ok(json!({ "deleted": deleted })),
        Err(err) => Responder::internal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watcher_kv::mem::MemStore;

    fn handler() -> EtcdHandler {
        EtcdHandler::new(Arc::new(MemStore::new()), "/skydns").expect("valid prefix")
    }

    fn service(name: &str, host: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            namespace: "default".to_string(),
            host: host.to_string(),
            port: 8080,
            protocol: "http".to_string(),
            fl_domain: String::new(),
            health_check: watcher_core::HealthCheck { path: "/healthz".to_string(), port: 8080 },
        }
    }

    #[test]
    fn prefix_must_be_absolute() {
        assert!(EtcdHandler::new(Arc::new(MemStore::new()), "skydns").is_err());
        let h = EtcdHandler::new(Arc::new(MemStore::new()), "/skydns/").expect("valid");
        assert_eq!(h.dns_prefix(), "/skydns");
    }

    #[tokio::test]
    async fn create_then_get_returns_exactly_one_record() {
        let h = handler();
        let s = service("web", "10.0.0.5");
        h.create_service(&s).await.expect("create");

        let range = h
            .store
            .get("/skydns/web", GetOptions::prefix())
            .await
            .expect("get");
        assert_eq!(range.count, 1);
        assert!(range.kvs[0].key.ends_with("10-0-0-5"));
        assert_eq!(range.kvs[0].value, br#"{"host":"10.0.0.5"}"#);
    }

    #[tokio::test]
    async fn delete_removes_only_the_matching_host() {
        let h = handler();
        h.create_service(&service("web", "10.0.0.5")).await.expect("create");
        h.create_service(&service("web", "10.0.0.6")).await.expect("create");

        h.delete_service(&service("web", "10.0.0.5")).await.expect("delete");

        let range = h
            .store
            .get("/skydns/web", GetOptions::prefix())
            .await
            .expect("get");
        assert_eq!(range.count, 1);
        assert!(range.kvs[0].key.ends_with("10-0-0-6"));
    }

    #[tokio::test]
    async fn delete_after_create_leaves_no_records() {
        let h = handler();
        let s = service("web", "10.0.0.5");
        h.create_service(&s).await.expect("create");
        h.delete_service(&s).await.expect("delete");

        let range = h
            .store
            .get("/skydns/web", GetOptions::prefix())
            .await
            .expect("get");
        assert_eq!(range.count, 0);
    }

    #[tokio::test]
    async fn fl_domain_scopes_the_record_path() {
        let h = handler();
        let mut s = service("web", "10.0.0.5");
        s.fl_domain = "payments".to_string();
        h.create_service(&s).await.expect("create");

        let range = h
            .store
            .get("/skydns/payments/web", GetOptions::prefix())
            .await
            .expect("get");
        assert_eq!(range.count, 1);
    }
}
