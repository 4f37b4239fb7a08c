//! The core handler: composes DNS and gateway registration into one logical
//! administrative operation.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use tracing::error;

use watcher_api::Responder;
use watcher_core::{Handler, ServiceDescriptor};

use crate::{EtcdHandler, GatewayHandler};

/// Passive handler driving both registrars from the admin surface. The
/// two-step composition is best effort: a failing second step is reported
/// but the completed first step is not rolled back.
pub struct CoreHandler {
    etcd: Arc<EtcdHandler>,
    gateway: Arc<GatewayHandler>,
}

impl CoreHandler {
    pub fn new(etcd: Arc<EtcdHandler>, gateway: Arc<GatewayHandler>) -> Self {
        Self { etcd, gateway }
    }

    pub async fn create_service(&self, service: &ServiceDescriptor) -> Result<()> {
        self.etcd.create_service(service).await?;
        self.gateway.register(service).await?;
        Ok(())
    }

    pub async fn delete_service(&self, service: &ServiceDescriptor) -> Result<()> {
        self.etcd.delete_service(service).await?;
        self.gateway.unregister(service).await?;
        Ok(())
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(route_name))
            .route("/services/:name", put(route_create).delete(route_delete))
            .with_state(Arc::clone(self))
    }
}

#[async_trait]
impl Handler for CoreHandler {
    fn name(&self) -> &'static str {
        "core"
    }
}

async fn route_name(State(h): State<Arc<CoreHandler>>) -> Responder {
    Responder::ok(h.name())
}

fn descriptor_from(name: String, mut body: ServiceDescriptor) -> Result<ServiceDescriptor, Responder> {
    body.name = name;
    match body.validate() {
        Ok(()) => Ok(body),
        Err(reasons) => Err(Responder::bad_request(reasons.join(", "))),
    }
}

async fn route_create(
    State(h): State<Arc<CoreHandler>>,
    Path(name): Path<String>,
    body: Option<Json<ServiceDescriptor>>,
) -> Responder {
    let body = match body {
        Some(Json(body)) => body,
        None => return Responder::bad_request("invalid request body"),
    };
    let service = match descriptor_from(name, body) {
        Ok(service) => service,
        Err(responder) => return responder,
    };

    if let Err(err) = h.create_service(&service).await {
        error!("create service failed: {err:#}");
        return Responder::internal(format!("{err:#}"));
    }
    Responder::ok_empty()
}

async fn route_delete(
    State(h): State<Arc<CoreHandler>>,
    Path(name): Path<String>,
    body: Option<Json<ServiceDescriptor>>,
) -> Responder {
    let body = match body {
        Some(Json(body)) => body,
        None => return Responder::bad_request("invalid request body"),
    };
    let service = match descriptor_from(name, body) {
        Ok(service) => service,
        Err(responder) => return responder,
    };

    if let Err(err) = h.delete_service(&service).await {
        error!("delete service failed: {err:#}");
        return Responder::internal(format!("{err:#}"));
    }
    Responder::ok_empty()
}
