//! The registry handler: proxies an image registry's API (Harbor-style)
//! with session-cookie authentication and automatic re-login.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use watcher_api::Responder;
use watcher_core::Handler;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

/// Passive handler: only the admin routes talk to the registry.
pub struct RegistryHandler {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryHandler {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        // the registry frontends commonly run self-signed TLS; the session
        // cookie jar carries `sid` across calls
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn login(&self) -> Result<()> {
        let form = [
            ("principal", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let res = self.http.post(self.url("/c/login")).form(&form).send().await?;
        if res.status() != reqwest::StatusCode::OK {
            bail!("authentication failed, please check the configuration or contact the administrator");
        }
        Ok(())
    }

    async fn ensure_session(&self) -> Result<()> {
        let res = self.http.get(self.url("/api/users/current")).send().await;
        match res {
            Ok(res) if res.status() == reqwest::StatusCode::OK => Ok(()),
            _ => {
                debug!("registry session invalid, logging in again");
                self.login().await
            }
        }
    }

    /// GET a registry API path, re-logging in once when the session was
    /// rejected mid-flight.
    async fn proxy_get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.ensure_session().await?;

        let mut res = self.http.get(self.url(path)).query(query).send().await?;
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.login().await?;
            res = self.http.get(self.url(path)).query(query).send().await?;
        }

        let status = res.status();
        if status != reqwest::StatusCode::OK {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("status code[{}]: {}", status.as_u16(), text));
        }
        Ok(res.json().await?)
    }

    async fn proxy_send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        expect: reqwest::StatusCode,
    ) -> Result<()> {
        self.ensure_session().await?;

        let build = |method: reqwest::Method| {
            let mut req = self.http.request(method, self.url(path));
            if let Some(body) = body {
                req = req.json(body);
            }
            req
        };

        let mut res = build(method.clone()).send().await?;
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.login().await?;
            res = build(method).send().await?;
        }

        let status = res.status();
        if status != expect {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("status code[{}]: {}", status.as_u16(), text));
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for RegistryHandler {
    fn name(&self) -> &'static str {
        "registry"
    }
}

// ---- admin routes ----

#[derive(Debug, Default, Deserialize)]
struct ProjectQuery {
    name: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreateProjectBody {
    project_name: String,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TagQuery {
    #[serde(default)]
    sort: String,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct RetagBody {
    tag: String,
    src_image: String,
    #[serde(default)]
    r#override: bool,
}

impl RegistryHandler {
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(route_name))
            .route("/projects", get(route_projects).post(route_create_project))
            .route("/projects/:id", axum::routing::delete(route_delete_project))
            .route("/projects/:id/repositories", get(route_repositories))
            .route(
                "/repositories/:project/:repo/tags",
                get(route_tags).post(route_retag),
            )
            .with_state(Arc::clone(self))
    }
}

async fn route_name(State(h): State<Arc<RegistryHandler>>) -> Responder {
    Responder::ok(h.name())
}

async fn route_projects(
    State(h): State<Arc<RegistryHandler>>,
    Query(q): Query<ProjectQuery>,
) -> Responder {
    let mut query = Vec::new();
    if let Some(name) = &q.name {
        query.push(("name", name.clone()));
    }
    if let Some(page) = q.page {
        query.push(("page", page.to_string()));
    }
    if let Some(page_size) = q.page_size {
        query.push(("page_size", page_size.to_string()));
    }

    match h.proxy_get("/api/projects", &query).await {
        Ok(projects) => Responder::ok(projects),
        Err(err) => Responder::internal(format!("failed to get the list of projects: {err:#}")),
    }
}

async fn route_create_project(
    State(h): State<Arc<RegistryHandler>>,
    Json(body): Json<CreateProjectBody>,
) -> Responder {
    let payload = json!({
        "project_name": body.project_name,
        "metadata": { "public": body.public.to_string() },
    });

    match h
        .proxy_send(
            reqwest::Method::POST,
            "/api/projects",
            Some(&payload),
            reqwest::StatusCode::CREATED,
        )
        .await
    {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(format!("failed to create project: {err:#}")),
    }
}

async fn route_delete_project(
    State(h): State<Arc<RegistryHandler>>,
    Path(id): Path<String>,
) -> Responder {
    match h
        .proxy_send(
            reqwest::Method::DELETE,
            &format!("/api/projects/{id}"),
            None,
            reqwest::StatusCode::OK,
        )
        .await
    {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(format!("failed to delete project: {err:#}")),
    }
}

async fn route_repositories(
    State(h): State<Arc<RegistryHandler>>,
    Path(id): Path<String>,
    Query(q): Query<ProjectQuery>,
) -> Responder {
    let mut query = vec![("project_id", id)];
    if let Some(page) = q.page {
        query.push(("page", page.to_string()));
    }
    if let Some(page_size) = q.page_size {
        query.push(("page_size", page_size.to_string()));
    }

    match h.proxy_get("/api/repositories", &query).await {
        Ok(repos) => Responder::ok(repos),
        Err(err) => Responder::internal(format!("failed to get the repo list: {err:#}")),
    }
}

async fn route_tags(
    State(h): State<Arc<RegistryHandler>>,
    Path((project, repo)): Path<(String, String)>,
    Query(q): Query<TagQuery>,
) -> Responder {
    let path = format!("/api/repositories/{project}/{repo}/tags");
    match h.proxy_get(&path, &[]).await {
        Ok(Value::Array(mut tags)) => {
            // registry returns tags unsorted; sort by name client-side
            tags.sort_by(|a, b| {
                let a = a.get("name").and_then(Value::as_str).unwrap_or_default();
                let b = b.get("name").and_then(Value::as_str).unwrap_or_default();
                a.cmp(b)
            });
            if q.sort == "desc" {
                tags.reverse();
            }
            if q.limit > 0 && q.limit < tags.len() {
                tags.truncate(q.limit);
            }
            Responder::ok(tags)
        }
        Ok(other) => Responder::ok(other),
        Err(err) => Responder::internal(format!("failed to get the tag list: {err:#}")),
    }
}

async fn route_retag(
    State(h): State<Arc<RegistryHandler>>,
    Path((project, repo)): Path<(String, String)>,
    Json(body): Json<RetagBody>,
) -> Responder {
    let path = format!("/api/repositories/{project}/{repo}/tags");
    let payload = json!({
        "tag": body.tag,
        "src_image": body.src_image,
        "override": body.r#override,
    });

    match h
        .proxy_send(reqwest::Method::POST, &path, Some(&payload), reqwest::StatusCode::OK)
        .await
    {
        Ok(()) => Responder::ok_empty(),
        Err(err) => Responder::internal(format!("failed to retag: {err:#}")),
    }
}
