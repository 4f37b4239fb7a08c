//! File-based process configuration, built once at startup and passed by
//! reference into each component.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use watcher_core::ResourceKind;
use watcher_handlers::{GatewayConfig, NotifierConfig, RegistryConfig};
use watcher_kv::EtcdOptions;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub http: HttpConfig,
    pub kubernetes: KubernetesConfig,
    pub resources: Resources,
    pub handlers: HandlersConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            debug: false,
        }
    }
}

impl HttpConfig {
    /// Listen address; falls back to the default when the configured host
    /// does not parse.
    pub fn listen_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9999)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Kubeconfig path override; in-cluster configuration when absent.
    pub config: Option<PathBuf>,
    /// Namespace to watch; empty watches all namespaces. Ignored for
    /// cluster-scoped kinds.
    pub namespace: String,
}

impl KubernetesConfig {
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

/// Independent switches for the watched resource kinds.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub pod: bool,
    pub daemon_set: bool,
    pub replica_set: bool,
    pub services: bool,
    pub deployment: bool,
    pub namespace: bool,
    pub replication_controller: bool,
    pub job: bool,
    pub persistent_volume: bool,
    pub secret: bool,
    pub config_map: bool,
    pub ingress: bool,
}

impl Resources {
    pub fn enabled(&self) -> Vec<ResourceKind> {
        [
            (self.pod, ResourceKind::Pod),
            (self.daemon_set, ResourceKind::DaemonSet),
            (self.replica_set, ResourceKind::ReplicaSet),
            (self.services, ResourceKind::Service),
            (self.deployment, ResourceKind::Deployment),
            (self.namespace, ResourceKind::Namespace),
            (self.replication_controller, ResourceKind::ReplicationController),
            (self.job, ResourceKind::Job),
            (self.persistent_volume, ResourceKind::PersistentVolume),
            (self.secret, ResourceKind::Secret),
            (self.config_map, ResourceKind::ConfigMap),
            (self.ingress, ResourceKind::Ingress),
        ]
        .into_iter()
        .filter_map(|(enabled, kind)| enabled.then_some(kind))
        .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EtcdHandlerConfig {
    #[serde(flatten)]
    pub options: EtcdOptions,
    pub dns_prefix: String,
}

impl Default for EtcdHandlerConfig {
    fn default() -> Self {
        Self {
            options: EtcdOptions::default(),
            dns_prefix: "/skydns".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    pub etcd: EtcdHandlerConfig,
    pub gateway: Vec<GatewayConfig>,
    pub notifier: NotifierConfig,
    pub registry: Option<RegistryConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let yaml = r#"
log:
  level: debug
http:
  host: 127.0.0.1
  port: 8080
kubernetes:
  namespace: prod
resources:
  pod: true
  deployment: true
handlers:
  etcd:
    endpoints: ["https://etcd-1:2379", "https://etcd-2:2379"]
    ca_file: /etc/ssl/etcd/ca.pem
    timeout: 3
    dns_prefix: /coredns
  gateway:
    - namespace: prod
      host: 10.1.0.1
      port: "8888"
  notifier:
    endpoint: https://notify.internal
    username: svc
    password: secret
    chat_id: "42"
    enable: true
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("config parses");

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.http.listen_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.kubernetes.namespace(), Some("prod"));
        assert_eq!(
            config.resources.enabled(),
            vec![ResourceKind::Pod, ResourceKind::Deployment]
        );
        assert_eq!(config.handlers.etcd.options.endpoints.len(), 2);
        assert_eq!(config.handlers.etcd.options.timeout, 3);
        assert_eq!(config.handlers.etcd.dns_prefix, "/coredns");
        assert_eq!(config.handlers.gateway.len(), 1);
        assert!(config.handlers.notifier.enable);
        assert!(config.handlers.registry.is_none());
    }

    #[test]
    fn defaults_apply_for_an_empty_config() {
        let config: Config = serde_yaml::from_str("{}").expect("empty config parses");

        assert_eq!(config.log.level, "info");
        assert_eq!(config.http.listen_addr().to_string(), "0.0.0.0:9999");
        assert_eq!(config.kubernetes.namespace(), None);
        assert!(config.resources.enabled().is_empty());
        assert_eq!(config.handlers.etcd.dns_prefix, "/skydns");
    }

    #[test]
    fn bad_listen_host_falls_back_to_the_default() {
        let http = HttpConfig {
            host: "not a host".to_string(),
            port: 1,
            debug: false,
        };
        assert_eq!(http.listen_addr().to_string(), "0.0.0.0:9999");
    }
}
