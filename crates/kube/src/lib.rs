//! Watch wiring: one kube watcher stream per resource kind, mirrored into a
//! local cache keyed by `namespace/name`, with add/update/delete
//! notifications and a "has synced" signal for the owning controller.
//!
//! The cache replays informer semantics on top of the raw watch stream: the
//! first restart list flips the synced signal, later restarts are diffed
//! against the cache so resyncs surface as updates (old state attached) and
//! vanished objects surface as deletes.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::{api::Api, runtime::watcher, Client};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use watcher_core::{ResourceKind, WatchedObject};

use k8s_openapi::api::{apps::v1 as appsv1, batch::v1 as batchv1, core::v1 as corev1, networking::v1 as netv1};

const NOTIFICATION_BUFFER: usize = 1024;

/// A raw change notification produced by the watch layer. Updates carry the
/// previous object state; deletes carry the last known state.
#[derive(Debug, Clone)]
pub enum Notification {
    Added(WatchedObject),
    Modified { old: WatchedObject, new: WatchedObject },
    Deleted(WatchedObject),
}

type CacheMap = Arc<RwLock<FxHashMap<String, WatchedObject>>>;

/// Read side of the watch cache, handed to the controller for by-key lookup.
#[derive(Clone, Default)]
pub struct CacheReader {
    map: CacheMap,
}

impl CacheReader {
    pub async fn get(&self, key: &str) -> Option<WatchedObject> {
        self.map.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }
}

/// Write side: absorbs raw watch events, keeps the cache consistent and
/// produces the notifications the controller enqueues.
#[derive(Clone, Default)]
pub struct CacheWriter {
    map: CacheMap,
}

impl CacheWriter {
    pub fn reader(&self) -> CacheReader {
        CacheReader { map: Arc::clone(&self.map) }
    }

    /// Object applied (added or modified). Returns `None` when the object
    /// has no usable identity; such notifications are dropped, not retried.
    pub async fn absorb_applied(&self, kind: ResourceKind, obj: WatchedObject) -> Option<Notification> {
        let key = match obj.store_key() {
            Some(key) => key,
            None => {
                drop_unkeyed(kind);
                return None;
            }
        };

        let old = self.map.write().await.insert(key, obj.clone());
        Some(match old {
            Some(old) => Notification::Modified { old, new: obj },
            None => Notification::Added(obj),
        })
    }

    pub async fn absorb_deleted(&self, kind: ResourceKind, obj: WatchedObject) -> Option<Notification> {
        let key = match obj.store_key() {
            Some(key) => key,
            None => {
                drop_unkeyed(kind);
                return None;
            }
        };

        // Prefer the cached state as "last known" over the tombstone payload.
        let last = self.map.write().await.remove(&key).unwrap_or(obj);
        Some(Notification::Deleted(last))
    }

    /// Absorb a full relist: unknown keys become adds, known keys become
    /// updates carrying the previous state, vanished keys become deletes.
    pub async fn absorb_restarted(
        &self,
        kind: ResourceKind,
        list: Vec<WatchedObject>,
    ) -> Vec<Notification> {
        let mut next = FxHashMap::default();
        for obj in list {
            match obj.store_key() {
                Some(key) => {
                    next.insert(key, obj);
                }
                None => drop_unkeyed(kind),
            }
        }

        let mut map = self.map.write().await;
        let mut notifications = Vec::with_capacity(next.len());
        for (key, obj) in &next {
            match map.get(key) {
                Some(old) => notifications.push(Notification::Modified {
                    old: old.clone(),
                    new: obj.clone(),
                }),
                None => notifications.push(Notification::Added(obj.clone())),
            }
        }
        for (key, old) in map.iter() {
            if !next.contains_key(key) {
                notifications.push(Notification::Deleted(old.clone()));
            }
        }
        *map = next;

        notifications
    }
}

fn drop_unkeyed(kind: ResourceKind) {
    error!(kind = %kind, "object has no usable key, notification dropped");
    metrics::counter!("watcher_notifications_dropped_total", 1u64, "kind" => kind.to_string());
}

/// A running watch for one resource kind: cache lookup, the notification
/// stream, the sync signal and the driving task.
pub struct WatchHandle {
    pub cache: CacheReader,
    pub notifications: mpsc::Receiver<Notification>,
    pub synced: watch::Receiver<bool>,
    pub task: JoinHandle<()>,
}

/// Feeds a manually driven watch, for tests and local tooling.
pub struct ManualWatch {
    pub cache: CacheWriter,
    pub notifications: mpsc::Sender<Notification>,
    pub synced: watch::Sender<bool>,
}

/// A watch whose cache and notifications are driven by the caller instead of
/// an API server connection.
pub fn manual_watch() -> (WatchHandle, ManualWatch) {
    let writer = CacheWriter::default();
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (synced_tx, synced_rx) = watch::channel(false);

    let handle = WatchHandle {
        cache: writer.reader(),
        notifications: rx,
        synced: synced_rx,
        task: tokio::spawn(std::future::pending::<()>()),
    };
    let manual = ManualWatch {
        cache: writer,
        notifications: tx,
        synced: synced_tx,
    };
    (handle, manual)
}

/// A watchable resource kind: ties the concrete kube API type to its
/// [`ResourceKind`] tag and the scope-appropriate `Api` constructor.
pub trait WatchTarget:
    kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    const RESOURCE: ResourceKind;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    fn into_watched(self) -> WatchedObject;
}

macro_rules! namespaced_target {
    ($type:ty, $kind:ident) => {
        impl WatchTarget for $type {
            const RESOURCE: ResourceKind = ResourceKind::$kind;

            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }

            fn into_watched(self) -> WatchedObject {
                WatchedObject::$kind(Box::new(self))
            }
        }
    };
}

macro_rules! cluster_target {
    ($type:ty, $kind:ident) => {
        impl WatchTarget for $type {
            const RESOURCE: ResourceKind = ResourceKind::$kind;

            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }

            fn into_watched(self) -> WatchedObject {
                WatchedObject::$kind(Box::new(self))
            }
        }
    };
}

namespaced_target!(corev1::Pod, Pod);
namespaced_target!(appsv1::DaemonSet, DaemonSet);
namespaced_target!(appsv1::ReplicaSet, ReplicaSet);
namespaced_target!(corev1::Service, Service);
namespaced_target!(appsv1::Deployment, Deployment);
namespaced_target!(corev1::ReplicationController, ReplicationController);
namespaced_target!(batchv1::Job, Job);
namespaced_target!(corev1::Secret, Secret);
namespaced_target!(corev1::ConfigMap, ConfigMap);
namespaced_target!(netv1::Ingress, Ingress);
cluster_target!(corev1::Namespace, Namespace);
cluster_target!(corev1::PersistentVolume, PersistentVolume);

/// [`spawn_watch`] dispatched over the supported kind set.
pub fn spawn_watch_kind(kind: ResourceKind, client: Client, namespace: Option<&str>) -> WatchHandle {
    match kind {
        ResourceKind::Pod => spawn_watch::<corev1::Pod>(client, namespace),
        ResourceKind::DaemonSet => spawn_watch::<appsv1::DaemonSet>(client, namespace),
        ResourceKind::ReplicaSet => spawn_watch::<appsv1::ReplicaSet>(client, namespace),
        ResourceKind::Service => spawn_watch::<corev1::Service>(client, namespace),
        ResourceKind::Deployment => spawn_watch::<appsv1::Deployment>(client, namespace),
        ResourceKind::Namespace => spawn_watch::<corev1::Namespace>(client, namespace),
        ResourceKind::ReplicationController => {
            spawn_watch::<corev1::ReplicationController>(client, namespace)
        }
        ResourceKind::Job => spawn_watch::<batchv1::Job>(client, namespace),
        ResourceKind::PersistentVolume => spawn_watch::<corev1::PersistentVolume>(client, namespace),
        ResourceKind::Secret => spawn_watch::<corev1::Secret>(client, namespace),
        ResourceKind::ConfigMap => spawn_watch::<corev1::ConfigMap>(client, namespace),
        ResourceKind::Ingress => spawn_watch::<netv1::Ingress>(client, namespace),
    }
}

/// Start list+watch for one resource kind and mirror it into a local cache.
pub fn spawn_watch<K: WatchTarget>(client: Client, namespace: Option<&str>) -> WatchHandle {
    let writer = CacheWriter::default();
    let reader = writer.reader();
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (synced_tx, synced_rx) = watch::channel(false);

    let api = K::api(client, namespace);
    let ns = namespace.map(|s| s.to_string());
    let task = tokio::spawn(async move {
        run_watch::<K>(api, ns, writer, tx, synced_tx).await;
    });

    WatchHandle {
        cache: reader,
        notifications: rx,
        synced: synced_rx,
        task,
    }
}

async fn run_watch<K: WatchTarget>(
    api: Api<K>,
    namespace: Option<String>,
    writer: CacheWriter,
    tx: mpsc::Sender<Notification>,
    synced_tx: watch::Sender<bool>,
) {
    let kind = K::RESOURCE;
    info!(kind = %kind, ns = ?namespace, "watch started");

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(watcher::Event::Applied(obj)) => {
                if let Some(n) = writer.absorb_applied(kind, obj.into_watched()).await {
                    if tx.send(n).await.is_err() {
                        break;
                    }
                }
            }
            Ok(watcher::Event::Deleted(obj)) => {
                if let Some(n) = writer.absorb_deleted(kind, obj.into_watched()).await {
                    if tx.send(n).await.is_err() {
                        break;
                    }
                }
            }
            Ok(watcher::Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                let list = list.into_iter().map(K::into_watched).collect();
                let mut closed = false;
                for n in writer.absorb_restarted(kind, list).await {
                    if tx.send(n).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
                // First successful relist means the local cache converged.
                synced_tx.send_replace(true);
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "watch stream error");
            }
        }
    }
    warn!(kind = %kind, "watch stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    fn pod(ns: &str, name: &str, ip: &str) -> WatchedObject {
        let mut p = Pod::default();
        p.metadata.name = Some(name.to_string());
        p.metadata.namespace = Some(ns.to_string());
        p.status = Some(k8s_openapi::api::core::v1::PodStatus {
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        });
        WatchedObject::Pod(Box::new(p))
    }

    fn ip_of(obj: &WatchedObject) -> String {
        obj.as_pod()
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn applied_is_add_then_update_with_old_state() {
        let writer = CacheWriter::default();

        let first = writer
            .absorb_applied(ResourceKind::Pod, pod("ns", "a", "10.0.0.1"))
            .await
            .unwrap();
        assert!(matches!(first, Notification::Added(_)));

        let second = writer
            .absorb_applied(ResourceKind::Pod, pod("ns", "a", "10.0.0.2"))
            .await
            .unwrap();
        match second {
            Notification::Modified { old, new } => {
                assert_eq!(ip_of(&old), "10.0.0.1");
                assert_eq!(ip_of(&new), "10.0.0.2");
            }
            other => panic!("expected modified, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deleted_prefers_cached_last_known_state() {
        let writer = CacheWriter::default();
        let _ = writer
            .absorb_applied(ResourceKind::Pod, pod("ns", "a", "10.0.0.1"))
            .await;

        let n = writer
            .absorb_deleted(ResourceKind::Pod, pod("ns", "a", ""))
            .await
            .unwrap();
        match n {
            Notification::Deleted(last) => assert_eq!(ip_of(&last), "10.0.0.1"),
            other => panic!("expected deleted, got {other:?}"),
        }
        assert!(writer.reader().is_empty().await);
    }

    #[tokio::test]
    async fn unkeyed_objects_are_dropped() {
        let writer = CacheWriter::default();
        let obj = WatchedObject::Pod(Box::new(Pod::default()));
        assert!(writer.absorb_applied(ResourceKind::Pod, obj).await.is_none());
    }

    #[tokio::test]
    async fn restart_diffs_against_the_cache() {
        let writer = CacheWriter::default();
        let _ = writer
            .absorb_applied(ResourceKind::Pod, pod("ns", "kept", "10.0.0.1"))
            .await;
        let _ = writer
            .absorb_applied(ResourceKind::Pod, pod("ns", "gone", "10.0.0.2"))
            .await;

        let list = vec![pod("ns", "kept", "10.0.0.1"), pod("ns", "fresh", "10.0.0.3")];
        let notifications = writer.absorb_restarted(ResourceKind::Pod, list).await;

        let mut added = 0;
        let mut modified = 0;
        let mut deleted = 0;
        for n in &notifications {
            match n {
                Notification::Added(obj) => {
                    added += 1;
                    assert_eq!(obj.name(), "fresh");
                }
                Notification::Modified { new, .. } => {
                    modified += 1;
                    assert_eq!(new.name(), "kept");
                }
                Notification::Deleted(obj) => {
                    deleted += 1;
                    assert_eq!(obj.name(), "gone");
                }
            }
        }
        assert_eq!((added, modified, deleted), (1, 1, 1));

        let reader = writer.reader();
        assert_eq!(reader.len().await, 2);
        assert!(reader.get("ns/gone").await.is_none());
    }
}
