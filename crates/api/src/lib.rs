//! Admin HTTP surface shared by all handlers: the response envelope, router
//! assembly under `/handlers/{name}`, request logging and `/metrics`.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info};

/// The uniform response envelope of every admin route. `result` and
/// `pagination` are omitted when empty; `msg` defaults to the HTTP status
/// text.
pub struct Responder {
    pub status: StatusCode,
    pub success: bool,
    pub result: Option<Value>,
    pub msg: Option<String>,
    pub pagination: Option<Value>,
}

impl Responder {
    pub fn ok(result: impl Serialize) -> Self {
        Self {
            status: StatusCode::OK,
            success: true,
            result: serde_json::to_value(result).ok(),
            msg: None,
            pagination: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            status: StatusCode::OK,
            success: true,
            result: None,
            msg: None,
            pagination: None,
        }
    }

    pub fn error(status: StatusCode, msg: impl ToString) -> Self {
        Self {
            status,
            success: false,
            result: None,
            msg: Some(msg.to_string()),
            pagination: None,
        }
    }

    pub fn bad_request(msg: impl ToString) -> Self {
        Self::error(StatusCode::BAD_REQUEST, msg)
    }

    pub fn internal(msg: impl ToString) -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    fn body(&self) -> Value {
        let msg = match &self.msg {
            Some(msg) if !msg.is_empty() => msg.clone(),
            _ => self
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        };

        let mut body = json!({
            "success": self.success,
            "msg": msg,
        });
        if let Some(result) = &self.result {
            body["result"] = result.clone();
        }
        if let Some(pagination) = &self.pagination {
            body["pagination"] = pagination.clone();
        }
        body
    }
}

impl IntoResponse for Responder {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let res = next.run(req).await;

    if res.status() == StatusCode::OK {
        info!(id = %request_id, method = %method, uri = %uri, status = %res.status(), "request");
    } else {
        error!(id = %request_id, method = %method, uri = %uri, status = %res.status(), "request");
    }
    res
}

/// Assemble the admin router: every handler's route group is mounted under
/// `/handlers/{name}`, plus the Prometheus text endpoint.
pub fn build_router(handler_routes: Vec<(&'static str, Router)>, metrics: PrometheusHandle) -> Router {
    let mut handlers = Router::new();
    for (name, routes) in handler_routes {
        handlers = handlers.nest(&format!("/{name}"), routes);
    }

    Router::new()
        .nest("/handlers", handlers)
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { metrics.render() }
            }),
        )
        .fallback(|| async { Responder::error(StatusCode::NOT_FOUND, "") })
        .layer(middleware::from_fn(log_requests))
}

/// Serve the admin surface until the shutdown signal fires.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin http surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
