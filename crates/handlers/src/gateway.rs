//! The gateway handler: registers and unregisters pod-declared services
//! against a namespace-scoped API gateway, plus admin proxy routes.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use watcher_api::Responder;
use watcher_core::{classify, containers_ready, is_departing, Event, Handler, PodTransition, ResourceKind, ServiceDescriptor};

use crate::HttpRetry;

/// Static per-namespace gateway endpoint, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub namespace: String,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub struct GatewayHandler {
    configs: Vec<GatewayConfig>,
    http: reqwest::Client,
    retry: HttpRetry,
}

#[derive(Serialize)]
struct RegisterUpstream<'a> {
    name: &'a str,
    host: &'a str,
    #[serde(rename = "type")]
    protocol: &'a str,
    port: i32,
    hc_path: &'a str,
    hc_port: i32,
}

#[derive(Serialize)]
struct UnregisterUpstream<'a> {
    host: &'a str,
    port: i32,
}

/// Upstream gateway responses wrap payloads in `{status, data}`.
#[derive(Debug, Deserialize)]
struct GatewayResult {
    #[allow(dead_code)]
    status: bool,
    #[serde(default)]
    data: Value,
}

impl GatewayHandler {
    pub fn new(configs: Vec<GatewayConfig>) -> Self {
        Self::with_transport_retry(configs, HttpRetry::default())
    }

    pub fn with_transport_retry(configs: Vec<GatewayConfig>, retry: HttpRetry) -> Self {
        Self {
            configs,
            http: reqwest::Client::new(),
            retry,
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.configs.iter().map(|c| c.namespace.clone()).collect()
    }

    fn config(&self, namespace: &str) -> Option<&GatewayConfig> {
        self.configs.iter().find(|c| c.namespace == namespace)
    }

    /// The gateway URL for a namespace, `None` when the namespace has no
    /// gateway integration configured.
    pub fn url(&self, namespace: &str, path: &str) -> Option<String> {
        self.config(namespace)
            .map(|c| format!("http://{}:{}/{}", c.host, c.port, path.trim_start_matches('/')))
    }

    async fn post_json<T: Serialize>(&self, namespace: &str, url: &str, body: &T) -> Result<()> {
        let auth = self
            .config(namespace)
            .filter(|c| !c.username.is_empty())
            .map(|c| (c.username.clone(), c.password.clone()));

        let mut wait = self.retry.initial_wait;
        let mut last_err = None;
        for attempt in 1..=self.retry.attempts.max(1) {
            let mut req = self.http.post(url).json(body);
            if let Some((user, pass)) = &auth {
                req = req.basic_auth(user, Some(pass));
            }

            match req.send().await {
                Ok(res) if res.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(res) => {
                    let status = res.status();
                    let text = res.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("status code[{}]: {}", status.as_u16(), text));
                }
                Err(err) => last_err = Some(err.into()),
            }

            if attempt < self.retry.attempts {
                wait = self.retry.pause(wait).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("request failed")))
    }

    /// Register one service with its namespace's gateway. Errors when the
    /// namespace has no gateway configured; watch-path callers check first.
    pub async fn register(&self, service: &ServiceDescriptor) -> Result<()> {
        let url = self
            .url(&service.namespace, &format!("/upstreams/{}/register", service.name))
            .ok_or_else(|| {
                anyhow!(
                    "namespace `{}` has no associated gateway config, {} register skipped",
                    service.namespace,
                    service.identity()
                )
            })?;

        let body = RegisterUpstream {
            name: &service.name,
            host: &service.host,
            protocol: &service.protocol,
            port: service.port,
            hc_path: &service.health_check.path,
            hc_port: service.health_check.port,
        };
        self.post_json(&service.namespace, &url, &body).await?;

        info!("[gateway][{}] - [{}] register successful", service.name, service.identity());
        metrics::counter!("watcher_gateway_requests_total", 1u64, "op" => "register");
        Ok(())
    }

    pub async fn unregister(&self, service: &ServiceDescriptor) -> Result<()> {
        let url = self
            .url(&service.namespace, &format!("/upstreams/{}/unregister", service.name))
            .ok_or_else(|| {
                anyhow!(
                    "namespace `{}` has no associated gateway config, {} unregister skipped",
                    service.namespace,
                    service.identity()
                )
            })?;

        let body = UnregisterUpstream { host: &service.host, port: service.port };
        self.post_json(&service.namespace, &url, &body).await?;

        info!("[gateway][{}] - [{}] unregister successful", service.name, service.identity());
        metrics::counter!("watcher_gateway_requests_total", 1u64, "op" => "unregister");
        Ok(())
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    fn name(&self) -> &'static str {
        "gateway"
    }

    // only a new deployment produces genuine pod creates; nothing to do yet
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

        debug!("pod[{}] did not do anything when deleted, skipped", event.object.name());
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

        let pod_name = event.object.name();
        let total = services.len();
        let mut failed = 0usize;

        match classify(pod, old_pod) {
            PodTransition::Teardown => {
                for service in &services {
                    // a namespace without gateway integration is a skip, not a failure
                    if self.url(&service.namespace, "").is_none() {
                        error!(
                            "namespace `{}` has no associated gateway config, pod[{}] unregister skipped",
                            service.namespace,
                            service.identity()
                        );
                        continue;
                    }
                    if let Err(err) = self.unregister(service).await {
                        error!("pod[{pod_name}] - [{}] unregister error: {err:#}", service.identity());
                        failed += 1;
                    }
                }
            }
            PodTransition::Activate => {
                if !containers_ready(pod) {
                    debug!("pod[{pod_name}] containers not ready, skipped");
                    return Ok(());
                }
                if is_departing(pod) {
                    debug!("pod[{pod_name}] is about to be deleted, skipped");
                    return Ok(());
                }
                for service in &services {
                    if self.url(&service.namespace, "").is_none() {
                        error!(
                            "namespace `{}` has no associated gateway config, pod[{}] register skipped",
                            service.namespace,
                            service.identity()
                        );
                        continue;
                    }
                    if let Err(err) = self.register(service).await {
                        error!("pod[{pod_name}] - [{}] register error: {err:#}", service.identity());
                        failed += 1;
                    }
                }
            }
            PodTransition::Unknown => {
                error!("pod[{pod_name}] unknown transition event, operator attention needed");
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
#[serde(default)]
struct RegisterPayload {
    host: String,
    #[serde(rename = "type")]
    protocol: String,
    port: i32,
    hc_path: String,
    hc_port: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UnregisterPayload {
    host: String,
    port: i32,
}

impl GatewayHandler {
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(route_name))
            .route("/namespaces", get(route_namespaces))
            .route("/namespaces/:namespace/upstreams", get(route_upstreams))
            .route("/namespaces/:namespace/upstreams/:upstream", get(route_upstream))
            .route(
                "/namespaces/:namespace/upstreams/:upstream/register",
                post(route_register),
            )
            .route(
                "/namespaces/:namespace/upstreams/:upstream/unregister",
                post(route_unregister),
            )
            .with_state(Arc::clone(self))
    }

    async fn proxy_get(&self, namespace: &str, path: &str) -> Result<Value> {
        let url = self
            .url(namespace, path)
            .ok_or_else(|| anyhow!("namespace `{namespace}` has no associated gateway config"))?;

        let res = self.http.get(&url).send().await?;
        let status = res.status();
        if status != reqwest::StatusCode::OK {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("status code[{}]: {}", status.as_u16(), text));
        }

        let result: GatewayResult = res.json().await?;
        Ok(result.data)
    }
}

async fn route_name(State(h): State<Arc<GatewayHandler>>) -> Responder {
    Responder::ok(h.name())
}

async fn route_namespaces(State(h): State<Arc<GatewayHandler>>) -> Responder {
    Responder::ok(h.namespaces())
}

async fn route_upstreams(
    State(h): State<Arc<GatewayHandler>>,
    Path(namespace): Path<String>,
) -> Responder {
    match h.proxy_get(&namespace, "/upstreams").await {
        Ok(data) => Responder::ok(data),
        Err(err) => Responder::internal(format!("failed to get upstream list: {err:#}")),
    }
}

async fn route_upstream(
    State(h): State<Arc<GatewayHandler>>,
    Path((namespace, upstream)): Path<(String, String)>,
) -> Responder {
    match h.proxy_get(&namespace, &format!("/upstreams/{upstream}")).await {
        Ok(data) => Responder::ok(data),
        Err(err) => Responder::internal(format!("failed to get upstream: {err:#}")),
    }
}

async fn route_register(
    State(h): State<Arc<GatewayHandler>>,
    Path((namespace, upstream)): Path<(String, String)>,
    body: Option<Json<RegisterPayload>>,
) -> Responder {
    let Some(Json(p)) = body else {
        return Responder::bad_request("invalid request body");
    };
    if p.host.is_empty() || p.protocol.is_empty() || p.port == 0 {
        return Responder::bad_request("host, type and port are required");
    }
    let Some(url) = h.url(&namespace, &format!("/upstreams/{upstream}/register")) else {
        return Responder::bad_request(format!(
            "namespace `{namespace}` has no associated gateway config, {upstream} register skipped"
        ));
    };

    // non-http upstreams register without a health check
    let body = if p.protocol == "http" {
        json!({
            "host": p.host,
            "type": p.protocol,
            "port": p.port,
            "hc_path": p.hc_path,
            "hc_port": p.hc_port,
        })
    } else {
        json!({ "host": p.host, "type": "general", "port": p.port })
    };

    match h.post_json(&namespace, &url, &body).await {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(format!("failed to register upstream: {err:#}")),
    }
}

async fn route_unregister(
    State(h): State<Arc<GatewayHandler>>,
    Path((namespace, upstream)): Path<(String, String)>,
    body: Option<Json<UnregisterPayload>>,
) -> Responder {
    let Some(Json(p)) = body else {
        return Responder::bad_request("invalid request body");
    };
    if p.host.is_empty() || p.port == 0 {
        return Responder::bad_request("host and port are required");
    }
    let Some(url) = h.url(&namespace, &format!("/upstreams/{upstream}/unregister")) else {
        return Responder::bad_request(format!(
            "namespace `{namespace}` has no associated gateway config, {upstream} unregister skipped"
        ));
    };

    match h.post_json(&namespace, &url, &json!({ "host": p.host, "port": p.port })).await {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(format!("failed to unregister upstream: {err:#}")),
    }
}
