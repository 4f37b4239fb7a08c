//! Side-effect handlers dispatched by the controllers, plus their admin
//! route groups.
//!
//! Active handlers (etcd registrar, gateway registrar, notifier) react to
//! pod lifecycle transitions; passive handlers (core, k8s, registry) only
//! expose administrative routes and keep the default no-op reactions.

#![forbid(unsafe_code)]

mod composite;
mod coordinator;
mod etcd;
mod gateway;
mod kube_admin;
mod notifier;
mod registry;

pub use composite::CoreHandler;
pub use coordinator::Coordinator;
pub use etcd::EtcdHandler;
pub use gateway::{GatewayConfig, GatewayHandler};
pub use kube_admin::KubeAdminHandler;
pub use notifier::{HttpSender, NoticeSender, NotifierConfig, NotifierHandler};
pub use registry::{RegistryConfig, RegistryHandler};

use std::time::Duration;

/// Transport-level retry for outbound REST calls, independent of the
/// controller's own event retry.
#[derive(Debug, Clone, Copy)]
pub struct HttpRetry {
    pub attempts: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl Default for HttpRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_wait: Duration::from_secs(5),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl HttpRetry {
    /// Sleep before the next attempt and return the grown wait.
    pub(crate) async fn pause(&self, wait: Duration) -> Duration {
        tokio::time::sleep(wait).await;
        (wait * 2).min(self.max_wait)
    }
}
