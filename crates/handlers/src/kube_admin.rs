//! The k8s handler: thin CRUD pass-through to the cluster API for the admin
//! surface. Passive on the watch path.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Event as ClusterEvent, Namespace, Node, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use watcher_api::Responder;
use watcher_core::Handler;

pub struct KubeAdminHandler {
    client: Client,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    field_selector: Option<String>,
    label_selector: Option<String>,
    #[serde(rename = "continue")]
    continue_token: Option<String>,
    limit: Option<u32>,
}

impl ListQuery {
    fn params(&self) -> ListParams {
        ListParams {
            field_selector: self.field_selector.clone(),
            label_selector: self.label_selector.clone(),
            continue_token: self.continue_token.clone(),
            limit: self.limit,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    delete_policy: String,
    grace_period_seconds: Option<u32>,
}

impl DeleteQuery {
    fn params(&self) -> DeleteParams {
        let policy = match self.delete_policy.as_str() {
            "orphan" => PropagationPolicy::Orphan,
            "background" => PropagationPolicy::Background,
            _ => PropagationPolicy::Foreground,
        };
        DeleteParams {
            propagation_policy: Some(policy),
            grace_period_seconds: self.grace_period_seconds,
            ..Default::default()
        }
    }
}

impl KubeAdminHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, ns: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }
}

async fn list<K>(api: Api<K>, q: &ListQuery) -> Responder
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Serialize,
{
    match api.list(&q.params()).await {
        Ok(objects) => Responder::ok(objects.items),
        Err(err) => Responder::internal(err),
    }
}

async fn create<K>(api: Api<K>, object: K) -> Responder
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Serialize,
{
    match api.create(&PostParams::default(), &object).await {
        Ok(created) => Responder::ok(created),
        Err(err) => Responder::internal(err),
    }
}

async fn replace<K>(api: Api<K>, name: &str, object: K) -> Responder
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Serialize,
{
    match api.replace(name, &PostParams::default(), &object).await {
        Ok(updated) => Responder::ok(updated),
        Err(err) => Responder::internal(err),
    }
}

async fn delete<K>(api: Api<K>, name: &str, q: &DeleteQuery) -> Responder
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Serialize,
{
    match api.delete(name, &q.params()).await {
        Ok(_) => Responder::ok_empty(),
        Err(err) => Responder::internal(err),
    }
}

macro_rules! namespaced_crud {
    ($list:ident, $create:ident, $replace:ident, $delete:ident, $type:ty) => {
        async fn $list(
            State(h): State<Arc<KubeAdminHandler>>,
            Path(ns): Path<String>,
            Query(q): Query<ListQuery>,
        ) -> Responder {
            list::<$type>(h.namespaced(&ns), &q).await
        }

        async fn $create(
            State(h): State<Arc<KubeAdminHandler>>,
            Path(ns): Path<String>,
            Json(object): Json<$type>,
        ) -> Responder {
            create::<$type>(h.namespaced(&ns), object).await
        }

        async fn $replace(
            State(h): State<Arc<KubeAdminHandler>>,
            Path((ns, name)): Path<(String, String)>,
            Json(object): Json<$type>,
        ) -> Responder {
            replace::<$type>(h.namespaced(&ns), &name, object).await
        }

        async fn $delete(
            State(h): State<Arc<KubeAdminHandler>>,
            Path((ns, name)): Path<(String, String)>,
            Query(q): Query<DeleteQuery>,
        ) -> Responder {
            delete::<$type>(h.namespaced(&ns), &name, &q).await
        }
    };
}

namespaced_crud!(list_pods, create_pod, replace_pod, delete_pod, Pod);
namespaced_crud!(list_secrets, create_secret, replace_secret, delete_secret, Secret);
namespaced_crud!(list_daemonsets, create_daemonset, replace_daemonset, delete_daemonset, DaemonSet);
namespaced_crud!(list_deployments, create_deployment, replace_deployment, delete_deployment, Deployment);

impl KubeAdminHandler {
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(route_name))
            .route("/namespaces", get(list_namespaces).post(create_namespace))
            .route("/namespaces/:name", axum::routing::delete(delete_namespace))
            .route("/nodes", get(list_nodes))
            .route("/namespaces/:ns/events", get(list_events))
            .route("/namespaces/:ns/pods", get(list_pods).post(create_pod))
            .route(
                "/namespaces/:ns/pods/:name",
                axum::routing::put(replace_pod).delete(delete_pod),
            )
            .route("/namespaces/:ns/secrets", get(list_secrets).post(create_secret))
            .route(
                "/namespaces/:ns/secrets/:name",
                axum::routing::put(replace_secret).delete(delete_secret),
            )
            .route("/namespaces/:ns/daemonsets", get(list_daemonsets).post(create_daemonset))
            .route(
                "/namespaces/:ns/daemonsets/:name",
                axum::routing::put(replace_daemonset).delete(delete_daemonset),
            )
            .route(
                "/namespaces/:ns/deployments",
                get(list_deployments).post(create_deployment),
            )
            .route(
                "/namespaces/:ns/deployments/:name",
                axum::routing::put(replace_deployment).delete(delete_deployment),
            )
            .route("/namespaces/:ns/deployments/:name/scale", get(get_scale))
            .route(
                "/namespaces/:ns/deployments/:name/scale/:replicas",
                axum::routing::put(set_scale),
            )
            .with_state(Arc::clone(self))
    }
}

async fn route_name(State(h): State<Arc<KubeAdminHandler>>) -> Responder {
    Responder::ok(h.name())
}

async fn list_namespaces(
    State(h): State<Arc<KubeAdminHandler>>,
    Query(q): Query<ListQuery>,
) -> Responder {
    list::<Namespace>(Api::all(h.client.clone()), &q).await
}

async fn create_namespace(
    State(h): State<Arc<KubeAdminHandler>>,
    Json(object): Json<Namespace>,
) -> Responder {
    create::<Namespace>(Api::all(h.client.clone()), object).await
}

async fn delete_namespace(
    State(h): State<Arc<KubeAdminHandler>>,
    Path(name): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> Responder {
    delete::<Namespace>(Api::all(h.client.clone()), &name, &q).await
}

async fn list_nodes(State(h): State<Arc<KubeAdminHandler>>, Query(q): Query<ListQuery>) -> Responder {
    list::<Node>(Api::all(h.client.clone()), &q).await
}

async fn list_events(
    State(h): State<Arc<KubeAdminHandler>>,
    Path(ns): Path<String>,
    Query(q): Query<ListQuery>,
) -> Responder {
    list::<ClusterEvent>(h.namespaced(&ns), &q).await
}

async fn get_scale(
    State(h): State<Arc<KubeAdminHandler>>,
    Path((ns, name)): Path<(String, String)>,
) -> Responder {
    let api: Api<Deployment> = h.namespaced(&ns);
    match api.get(&name).await {
        Ok(deployment) => {
            let spec = deployment.spec.as_ref().and_then(|s| s.replicas);
            let ready = deployment.status.as_ref().and_then(|s| s.ready_replicas);
            Responder::ok(json!({ "replicas": spec, "ready_replicas": ready }))
        }
        Err(err) => Responder::internal(err),
    }
}

async fn set_scale(
    State(h): State<Arc<KubeAdminHandler>>,
    Path((ns, name, replicas)): Path<(String, String, i32)>,
) -> Responder {
    let api: Api<Deployment> = h.namespaced(&ns);
    let patch = json!({ "spec": { "replicas": replicas } });
    match api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await {
        Ok(_) => Responder::ok_empty(),
        Err(err) => Responder::internal(err),
    }
}

#[async_trait]
impl Handler for KubeAdminHandler {
    fn name(&self) -> &'static str {
        "k8s"
    }
}
