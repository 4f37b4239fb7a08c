//! The normalized unit of work flowing from a resource watch to handlers.

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::{apps::v1 as appsv1, batch::v1 as batchv1, core::v1 as corev1, networking::v1 as netv1};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use watcher_queue::WorkItem;

/// Root path for coordination claim markers in the key-value store.
const CLAIM_PREFIX: &str = "/watcher/handlers/etcd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// The watched resource kinds. Cluster-scoped kinds carry no namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    DaemonSet,
    ReplicaSet,
    Service,
    Deployment,
    Namespace,
    ReplicationController,
    Job,
    PersistentVolume,
    Secret,
    ConfigMap,
    Ingress,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::Service => "Service",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ReplicationController => "ReplicationController",
            ResourceKind::Job => "Job",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Ingress => "Ingress",
        })
    }
}

/// One observed cluster object, tagged by kind.
///
/// Handlers match on the variant they care about instead of downcasting; the
/// supported-kind set is closed and checked by the compiler.
#[derive(Debug, Clone)]
pub enum WatchedObject {
    Pod(Box<corev1::Pod>),
    DaemonSet(Box<appsv1::DaemonSet>),
    ReplicaSet(Box<appsv1::ReplicaSet>),
    Service(Box<corev1::Service>),
    Deployment(Box<appsv1::Deployment>),
    Namespace(Box<corev1::Namespace>),
    ReplicationController(Box<corev1::ReplicationController>),
    Job(Box<batchv1::Job>),
    PersistentVolume(Box<corev1::PersistentVolume>),
    Secret(Box<corev1::Secret>),
    ConfigMap(Box<corev1::ConfigMap>),
    Ingress(Box<netv1::Ingress>),
}

impl WatchedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchedObject::Pod(_) => ResourceKind::Pod,
            WatchedObject::DaemonSet(_) => ResourceKind::DaemonSet,
            WatchedObject::ReplicaSet(_) => ResourceKind::ReplicaSet,
            WatchedObject::Service(_) => ResourceKind::Service,
            WatchedObject::Deployment(_) => ResourceKind::Deployment,
            WatchedObject::Namespace(_) => ResourceKind::Namespace,
            WatchedObject::ReplicationController(_) => ResourceKind::ReplicationController,
            WatchedObject::Job(_) => ResourceKind::Job,
            WatchedObject::PersistentVolume(_) => ResourceKind::PersistentVolume,
            WatchedObject::Secret(_) => ResourceKind::Secret,
            WatchedObject::ConfigMap(_) => ResourceKind::ConfigMap,
            WatchedObject::Ingress(_) => ResourceKind::Ingress,
        }
    }

    /// Human label used in notification messages.
    pub fn kind_label(&self) -> &'static str {
        match self.kind() {
            ResourceKind::Pod => "pod",
            ResourceKind::DaemonSet => "daemon set",
            ResourceKind::ReplicaSet => "replica set",
            ResourceKind::Service => "service",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Namespace => "namespace",
            ResourceKind::ReplicationController => "replication controller",
            ResourceKind::Job => "job",
            ResourceKind::PersistentVolume => "persistent volume",
            ResourceKind::Secret => "secret",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Ingress => "ingress",
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            WatchedObject::Pod(o) => &o.metadata,
            WatchedObject::DaemonSet(o) => &o.metadata,
            WatchedObject::ReplicaSet(o) => &o.metadata,
            WatchedObject::Service(o) => &o.metadata,
            WatchedObject::Deployment(o) => &o.metadata,
            WatchedObject::Namespace(o) => &o.metadata,
            WatchedObject::ReplicationController(o) => &o.metadata,
            WatchedObject::Job(o) => &o.metadata,
            WatchedObject::PersistentVolume(o) => &o.metadata,
            WatchedObject::Secret(o) => &o.metadata,
            WatchedObject::ConfigMap(o) => &o.metadata,
            WatchedObject::Ingress(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta().creation_timestamp.as_ref().map(|t| t.0)
    }

    /// Stable identity used for queue dedup and cache lookup:
    /// `namespace/name`, or `name` alone for cluster-scoped objects.
    /// `None` when the object carries no name (nothing to key on).
    pub fn store_key(&self) -> Option<String> {
        let name = self.meta().name.as_deref()?;
        match self.meta().namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Some(format!("{ns}/{name}")),
            _ => Some(name.to_string()),
        }
    }

    pub fn as_pod(&self) -> Option<&corev1::Pod> {
        match self {
            WatchedObject::Pod(pod) => Some(pod),
            _ => None,
        }
    }
}

/// One observed transition of exactly one cluster object.
///
/// `old_object` is only present for [`EventAction::Updated`]. Events are
/// immutable after construction; the controller owns their lifecycle.
#[derive(Debug, Clone)]
pub struct Event {
    pub key: String,
    pub action: EventAction,
    pub resource: ResourceKind,
    pub namespace: String,
    pub object: WatchedObject,
    pub old_object: Option<WatchedObject>,
}

impl Event {
    /// Key under which coordination claim markers for this event are stored.
    pub fn claim_key(&self) -> String {
        format!("{}/{}/{}", CLAIM_PREFIX, self.key, self.action)
    }

    /// Human-readable summary used by the notifier. The namespace line is
    /// omitted for cluster-scoped objects.
    pub fn message(&self) -> String {
        let kind = self.object.kind_label();
        let name = self.object.name();
        if self.namespace.is_empty() {
            format!(
                "kubernetes cluster event\nkind: {}\n{} has been {}\n",
                kind, name, self.action
            )
        } else {
            format!(
                "kubernetes cluster event\nkind: {}\nnamespace: {}\n{} has been {}\n",
                kind, self.namespace, name, self.action
            )
        }
    }
}

impl WorkItem for Event {
    type Key = (ResourceKind, EventAction, String);

    fn work_key(&self) -> Self::Key {
        (self.resource, self.action, self.key.clone())
    }
}
