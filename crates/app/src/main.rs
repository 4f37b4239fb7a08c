//! Watcher service binary: loads configuration, starts one controller per
//! enabled resource kind and serves the admin HTTP surface.

#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use kube::Client;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::{info, warn};

use watcher_controller::Controller;
use watcher_core::{Handler, ResourceKind};
use watcher_handlers::{
    Coordinator, CoreHandler, EtcdHandler, GatewayHandler, HttpSender, KubeAdminHandler,
    NotifierHandler, RegistryHandler,
};
use watcher_kube::spawn_watch_kind;
use watcher_kv::{EtcdStore, KvStore};

use config::{Config, KubernetesConfig};

#[derive(Parser, Debug)]
#[command(name = "watcher", version, about = "Kubernetes resource watcher")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

fn init_tracing(level: &str, debug: bool) {
    let fallback = if debug { "debug" } else { level };
    let env = std::env::var("WATCHER_LOG").unwrap_or_else(|_| fallback.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("installing the prometheus recorder")
}

/// In-cluster configuration when available, kubeconfig otherwise; an
/// explicit kubeconfig path from the config file takes precedence.
async fn build_client(cfg: &KubernetesConfig) -> Result<Client> {
    match &cfg.config {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let options = kube::config::KubeConfigOptions::default();
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .context("building client config from kubeconfig")?;
            Client::try_from(config).context("building kube client")
        }
        None => Client::try_default().await.context("building kube client"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    init_tracing(&config.log.level, config.http.debug);
    let metrics_handle = init_metrics()?;

    let client = build_client(&config.kubernetes).await?;
    let store: Arc<dyn KvStore> = Arc::new(
        EtcdStore::connect(&config.handlers.etcd.options)
            .await
            .context("init etcd handler")?,
    );

    let etcd = Arc::new(
        EtcdHandler::new(Arc::clone(&store), &config.handlers.etcd.dns_prefix)
            .context("init etcd handler")?,
    );
    let gateway = Arc::new(GatewayHandler::new(config.handlers.gateway.clone()));
    let notifier = Arc::new(NotifierHandler::new(
        Coordinator::new(Arc::clone(&store)),
        Arc::new(HttpSender::new(config.handlers.notifier.clone())),
        config.handlers.notifier.enable,
    ));
    let core = Arc::new(CoreHandler::new(Arc::clone(&etcd), Arc::clone(&gateway)));
    let k8s = Arc::new(KubeAdminHandler::new(client.clone()));
    let registry = match &config.handlers.registry {
        Some(cfg) => Some(Arc::new(
            RegistryHandler::new(cfg.clone()).context("init registry handler")?,
        )),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // one independent controller per enabled kind; a panic in one watch task
    // never takes down the others
    let mut controllers = Vec::new();
    for kind in config.resources.enabled() {
        let handlers: Vec<Arc<dyn Handler>> = if kind == ResourceKind::Pod {
            vec![
                Arc::clone(&gateway) as Arc<dyn Handler>,
                Arc::clone(&etcd) as Arc<dyn Handler>,
                Arc::clone(&notifier) as Arc<dyn Handler>,
            ]
        } else {
            vec![Arc::clone(&notifier) as Arc<dyn Handler>]
        };

        let watch_handle = spawn_watch_kind(kind, client.clone(), config.kubernetes.namespace());
        let controller = Controller::new(kind, handlers);
        controllers.push(tokio::spawn(controller.run(watch_handle, shutdown_rx.clone())));
        info!(kind = %kind, "controller started");
    }

    let mut routes: Vec<(&'static str, Router)> = vec![
        ("etcd", etcd.routes()),
        ("gateway", gateway.routes()),
        ("notifier", notifier.routes()),
        ("core", core.routes()),
        ("k8s", k8s.routes()),
    ];
    if let Some(registry) = &registry {
        routes.push(("registry", registry.routes()));
    }

    let app = watcher_api::build_router(routes, metrics_handle);
    let server = tokio::spawn(watcher_api::serve(
        config.http.listen_addr(),
        app,
        shutdown_rx.clone(),
    ));

    wait_for_signal().await;
    info!("shutdown signal received");
    shutdown_tx.send_replace(true);

    let drain = async {
        for controller in controllers {
            let _ = controller.await;
        }
        let _ = server.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("graceful shutdown timed out, exiting anyway");
    }

    Ok(())
}
