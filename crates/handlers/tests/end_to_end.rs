//! End-to-end registrar scenarios: a pod going live registers DNS and
//! gateway upstreams, a teardown removes them, and resync noise does
//! neither. The gateway is a loopback server recording every call; the
//! coordination store is the in-memory double.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;

use watcher_core::{Event, EventAction, Handler, ResourceKind, WatchedObject};
use watcher_handlers::{CoreHandler, EtcdHandler, GatewayConfig, GatewayHandler, HttpRetry};
use watcher_kv::mem::MemStore;
use watcher_kv::{GetOptions, KvStore};

type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

async fn upstream_call(
    State(recorded): State<Recorded>,
    Path((upstream, op)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> &'static str {
    recorded.lock().unwrap().push((format!("{upstream}/{op}"), body));
    "ok"
}

async fn spawn_gateway_stub() -> (SocketAddr, Recorded) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/upstreams/:upstream/:op", post(upstream_call))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });

    (addr, recorded)
}

fn service_env() -> Vec<EnvVar> {
    [
        ("SERVICE_NAME", "web"),
        ("SERVICE_PORT", "8080"),
        ("SERVICE_PROTOCOL_TYPE", "http"),
        ("DNS_FL_DOMAIN", "-"),
        ("HEALTH_CHECK_URL", "/healthz"),
        ("HEALTH_CHECK_PORT", "8080"),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    })
    .collect()
}

fn pod(phase: &str, ready: bool, ip: Option<&str>, deleting: bool) -> Pod {
    let mut p = Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("web-1".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "web".to_string(),
                env: Some(service_env()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: ip.map(|s| s.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "ContainersReady".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    };
    if deleting {
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    }
    p
}

fn update_event(old: Pod, new: Pod) -> Event {
    Event {
        key: "default/web-1".to_string(),
        action: EventAction::Updated,
        resource: ResourceKind::Pod,
        namespace: "default".to_string(),
        object: WatchedObject::Pod(Box::new(new)),
        old_object: Some(WatchedObject::Pod(Box::new(old))),
    }
}

fn fast_retry() -> HttpRetry {
    HttpRetry {
        attempts: 3,
        initial_wait: Duration::from_millis(1),
        max_wait: Duration::from_millis(2),
    }
}

struct Fixture {
    store: Arc<MemStore>,
    etcd: Arc<EtcdHandler>,
    gateway: Arc<GatewayHandler>,
    recorded: Recorded,
}

async fn fixture() -> Fixture {
    let (addr, recorded) = spawn_gateway_stub().await;
    let store = Arc::new(MemStore::new());
    let etcd = Arc::new(
        EtcdHandler::new(store.clone() as Arc<dyn KvStore>, "/skydns").expect("etcd handler"),
    );
    let gateway = Arc::new(GatewayHandler::with_transport_retry(
        vec![GatewayConfig {
            namespace: "default".to_string(),
            host: addr.ip().to_string(),
            port: addr.port().to_string(),
            username: String::new(),
            password: String::new(),
        }],
        fast_retry(),
    ));

    Fixture {
        store,
        etcd,
        gateway,
        recorded,
    }
}

#[tokio::test]
async fn pod_going_live_registers_dns_and_gateway() {
    let fx = fixture().await;

    let old = pod("Pending", false, None, false);
    let new = pod("Running", true, Some("10.0.0.5"), false);
    let event = update_event(old, new);

    fx.etcd.updated(&event).await.expect("etcd updated");
    fx.gateway.updated(&event).await.expect("gateway updated");

    // exactly one DNS record at {prefix}/web/10-0-0-5
    let range = fx
        .store
        .get("/skydns/web", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 1);
    assert_eq!(range.kvs[0].key, "/skydns/web/10-0-0-5");
    assert_eq!(range.kvs[0].value, br#"{"host":"10.0.0.5"}"#);

    // exactly one gateway register with the declared fields
    let calls = fx.recorded.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (path, body) = &calls[0];
    assert_eq!(path, "web/register");
    assert_eq!(body["host"], "10.0.0.5");
    assert_eq!(body["port"], 8080);
    assert_eq!(body["type"], "http");
}

#[tokio::test]
async fn pod_teardown_removes_dns_and_unregisters() {
    let fx = fixture().await;

    // go live first
    let live = update_event(
        pod("Pending", false, None, false),
        pod("Running", true, Some("10.0.0.5"), false),
    );
    fx.etcd.updated(&live).await.expect("etcd activate");
    fx.gateway.updated(&live).await.expect("gateway activate");

    // then the deletion edge
    let gone = update_event(
        pod("Running", true, Some("10.0.0.5"), false),
        pod("Running", true, Some("10.0.0.5"), true),
    );
    fx.etcd.updated(&gone).await.expect("etcd teardown");
    fx.gateway.updated(&gone).await.expect("gateway teardown");

    let range = fx
        .store
        .get("/skydns/web", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 0, "the DNS record must be gone");

    let calls = fx.recorded.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, "web/unregister");
    assert_eq!(calls[1].1["host"], "10.0.0.5");
}

#[tokio::test]
async fn pure_resync_update_produces_no_side_effects() {
    let fx = fixture().await;

    // identical old/new steady state matches neither transition edge
    let noise = update_event(
        pod("Running", true, Some("10.0.0.5"), false),
        pod("Running", true, Some("10.0.0.5"), false),
    );
    fx.etcd.updated(&noise).await.expect("etcd resync");
    fx.gateway.updated(&noise).await.expect("gateway resync");

    let range = fx
        .store
        .get("/skydns", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 0);
    assert!(fx.recorded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unconfigured_namespace_is_skipped_not_failed() {
    let fx = fixture().await;

    let mut event = update_event(
        pod("Pending", false, None, false),
        pod("Running", true, Some("10.0.0.5"), false),
    );
    event.namespace = "other".to_string();
    if let WatchedObject::Pod(pod) = &mut event.object {
        pod.metadata.namespace = Some("other".to_string());
    }

    fx.gateway.updated(&event).await.expect("must not error");
    assert!(fx.recorded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn deleted_pod_cleans_up_dns_best_effort() {
    let fx = fixture().await;

    let live = update_event(
        pod("Pending", false, None, false),
        pod("Running", true, Some("10.0.0.5"), false),
    );
    fx.etcd.updated(&live).await.expect("activate");

    let event = Event {
        key: "default/web-1".to_string(),
        action: EventAction::Deleted,
        resource: ResourceKind::Pod,
        namespace: "default".to_string(),
        object: WatchedObject::Pod(Box::new(pod("Running", true, Some("10.0.0.5"), true))),
        old_object: None,
    };
    fx.etcd.deleted(&event).await.expect("deleted");

    let range = fx
        .store
        .get("/skydns/web", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 0);
}

#[tokio::test]
async fn composite_service_lifecycle_hits_both_backends() {
    let fx = fixture().await;
    let core = Arc::new(CoreHandler::new(fx.etcd.clone(), fx.gateway.clone()));

    let service = watcher_core::ServiceDescriptor {
        name: "web".to_string(),
        namespace: "default".to_string(),
        host: "10.0.0.5".to_string(),
        port: 8080,
        protocol: "http".to_string(),
        fl_domain: String::new(),
        health_check: watcher_core::HealthCheck {
            path: "/healthz".to_string(),
            port: 8080,
        },
    };

    core.create_service(&service).await.expect("create");
    let range = fx
        .store
        .get("/skydns/web", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 1);

    core.delete_service(&service).await.expect("delete");
    let range = fx
        .store
        .get("/skydns/web", GetOptions::prefix())
        .await
        .expect("dns scan");
    assert_eq!(range.count, 0);

    let calls = fx.recorded.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "web/register");
    assert_eq!(calls[1].0, "web/unregister");
}
