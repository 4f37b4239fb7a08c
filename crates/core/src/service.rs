//! Services a pod declares through its container environment.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::event::{Event, ResourceKind};

const ENV_SERVICE_NAME: &str = "SERVICE_NAME";
const ENV_SERVICE_PORT: &str = "SERVICE_PORT";
const ENV_SERVICE_PROTOCOL_TYPE: &str = "SERVICE_PROTOCOL_TYPE";
const ENV_DNS_FL_DOMAIN: &str = "DNS_FL_DOMAIN";
const ENV_HEALTH_CHECK_URL: &str = "HEALTH_CHECK_URL";
const ENV_HEALTH_CHECK_PORT: &str = "HEALTH_CHECK_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid resource type, skipped")]
    NotAPod,
    #[error("pod[{0}] has not yet obtained a valid IP, skipped")]
    NoPodIp(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: i32,
}

fn is_zero(port: &i32) -> bool {
    *port == 0
}

/// A service declared by one container of a pod.
///
/// Only descriptors that pass [`ServiceDescriptor::validate`] reach handlers;
/// partially populated ones are dropped during extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    #[serde(skip)]
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// Father-level domain used to namespace the DNS name.
    #[serde(default)]
    pub fl_domain: String,
    #[serde(default)]
    pub health_check: HealthCheck,
}

impl ServiceDescriptor {
    /// `host:port`, the identity used in log lines.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A resolvable record in the form the coordination store serves to DNS.
    pub fn dns_record(&self) -> String {
        format!(r#"{{"host":"{}"}}"#, self.host)
    }

    /// DNS name: `fl_domain/name` when a father-level domain is set.
    pub fn dns_name(&self) -> String {
        if self.fl_domain.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.fl_domain, self.name)
        }
    }

    /// Per-host DNS key, host with dots replaced by dashes.
    pub fn dns_key(&self) -> String {
        self.host.replace('.', "-")
    }

    /// Field-level validation. The name is deliberately not validated: a
    /// missing declared name falls back to the container name for logging
    /// and the descriptor is dropped by the caller.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();

        if self.namespace.is_empty() {
            reasons.push("namespace is required".to_string());
        }
        if self.host.is_empty() {
            reasons.push("host is required".to_string());
        } else if self.host.parse::<Ipv4Addr>().is_err() {
            reasons.push("host must be a valid IPv4 literal".to_string());
        }
        if !(1..=65535).contains(&self.port) {
            reasons.push("port must be between 1 and 65535".to_string());
        }
        if self.protocol.is_empty() {
            reasons.push("protocol is required".to_string());
        }
        if !(1..=65535).contains(&self.health_check.port) {
            reasons.push("health check port must be between 1 and 65535".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

impl Event {
    /// Extract the services declared by this event's pod.
    ///
    /// Containers declaring fewer than 5 environment variables are skipped
    /// outright. Unparseable port values skip that single field; descriptors
    /// failing validation are logged and dropped, never partially used.
    pub fn pod_services(&self) -> Result<Vec<ServiceDescriptor>, ServiceError> {
        if self.resource != ResourceKind::Pod {
            return Err(ServiceError::NotAPod);
        }

        let pod = self.object.as_pod().ok_or(ServiceError::NotAPod)?;
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        if pod_ip.is_empty() {
            return Err(ServiceError::NoPodIp(self.object.name().to_string()));
        }

        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[]);

        let mut services = Vec::new();
        for container in containers {
            let env = container.env.as_deref().unwrap_or(&[]);
            if env.len() < 5 {
                continue;
            }

            let mut service = ServiceDescriptor {
                host: pod_ip.to_string(),
                namespace: self.namespace.clone(),
                ..ServiceDescriptor::default()
            };

            for var in env {
                let value = var.value.as_deref().unwrap_or_default();
                match var.name.as_str() {
                    ENV_SERVICE_NAME => service.name = value.to_string(),
                    ENV_SERVICE_PORT => {
                        if let Ok(port) = value.parse() {
                            service.port = port;
                        }
                    }
                    ENV_SERVICE_PROTOCOL_TYPE => service.protocol = value.to_string(),
                    ENV_DNS_FL_DOMAIN => {
                        // "-" declares "no father-level domain"
                        if value != "-" {
                            service.fl_domain = value.to_string();
                        }
                    }
                    ENV_HEALTH_CHECK_URL => service.health_check.path = value.to_string(),
                    ENV_HEALTH_CHECK_PORT => {
                        if let Ok(port) = value.parse() {
                            service.health_check.port = port;
                        }
                    }
                    _ => {}
                }
            }

            if let Err(reasons) = service.validate() {
                if service.name.is_empty() {
                    service.name = container.name.clone();
                }
                info!(
                    container = %service.name,
                    "container variable is invalid: {}",
                    reasons.join(", ")
                );
            } else {
                services.push(service);
            }
        }

        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventAction, WatchedObject};
    use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodStatus};

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..EnvVar::default()
        }
    }

    fn service_env(host_port: &str) -> Vec<EnvVar> {
        vec![
            env("SERVICE_NAME", "web"),
            env("SERVICE_PORT", host_port),
            env("SERVICE_PROTOCOL_TYPE", "http"),
            env("DNS_FL_DOMAIN", "-"),
            env("HEALTH_CHECK_URL", "/healthz"),
            env("HEALTH_CHECK_PORT", "8080"),
        ]
    }

    fn pod_event(pod_ip: &str, containers: Vec<Container>) -> Event {
        let pod = Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: if pod_ip.is_empty() { None } else { Some(pod_ip.to_string()) },
                ..Default::default()
            }),
        };
        Event {
            key: "default/web-1".to_string(),
            action: EventAction::Updated,
            resource: ResourceKind::Pod,
            namespace: "default".to_string(),
            object: WatchedObject::Pod(Box::new(pod)),
            old_object: None,
        }
    }

    fn container(name: &str, env: Vec<EnvVar>) -> Container {
        Container {
            name: name.to_string(),
            env: Some(env),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_a_fully_declared_service() {
        let e = pod_event("10.0.0.5", vec![container("web", service_env("8080"))]);
        let services = e.pod_services().unwrap();
        assert_eq!(services.len(), 1);

        let s = &services[0];
        assert_eq!(s.name, "web");
        assert_eq!(s.host, "10.0.0.5");
        assert_eq!(s.port, 8080);
        assert_eq!(s.protocol, "http");
        assert_eq!(s.fl_domain, "");
        assert_eq!(s.health_check.path, "/healthz");
        assert_eq!(s.health_check.port, 8080);
        assert_eq!(s.identity(), "10.0.0.5:8080");
        assert_eq!(s.dns_name(), "web");
        assert_eq!(s.dns_key(), "10-0-0-5");
        assert_eq!(s.dns_record(), r#"{"host":"10.0.0.5"}"#);
    }

    #[test]
    fn fl_domain_prefixes_the_dns_name() {
        let mut vars = service_env("8080");
        vars[3] = env("DNS_FL_DOMAIN", "payments");
        let e = pod_event("10.0.0.5", vec![container("web", vars)]);
        let services = e.pod_services().unwrap();
        assert_eq!(services[0].dns_name(), "payments/web");
    }

    #[test]
    fn containers_with_few_env_vars_are_skipped() {
        let e = pod_event(
            "10.0.0.5",
            vec![container("sidecar", vec![env("SERVICE_NAME", "x")])],
        );
        assert!(e.pod_services().unwrap().is_empty());
    }

    #[test]
    fn unparseable_port_skips_the_field_and_fails_validation() {
        let e = pod_event("10.0.0.5", vec![container("web", service_env("not-a-port"))]);
        assert!(e.pod_services().unwrap().is_empty());
    }

    #[test]
    fn out_of_range_port_drops_the_descriptor() {
        let e = pod_event("10.0.0.5", vec![container("web", service_env("70000"))]);
        assert!(e.pod_services().unwrap().is_empty());
    }

    #[test]
    fn pod_without_ip_is_an_error() {
        let e = pod_event("", vec![container("web", service_env("8080"))]);
        assert!(matches!(e.pod_services(), Err(ServiceError::NoPodIp(_))));
    }

    #[test]
    fn non_pod_event_is_an_error() {
        let mut e = pod_event("10.0.0.5", vec![]);
        e.resource = ResourceKind::Deployment;
        assert!(matches!(e.pod_services(), Err(ServiceError::NotAPod)));
    }

    #[test]
    fn invalid_host_is_rejected_by_validation() {
        let s = ServiceDescriptor {
            name: "web".to_string(),
            namespace: "default".to_string(),
            host: "not-an-ip".to_string(),
            port: 8080,
            protocol: "http".to_string(),
            health_check: HealthCheck { path: String::new(), port: 8080 },
            ..Default::default()
        };
        let reasons = s.validate().unwrap_err();
        assert!(reasons.iter().any(|r| r.contains("IPv4")));
    }

    #[test]
    fn one_valid_one_invalid_container_yields_one_service() {
        let e = pod_event(
            "10.0.0.5",
            vec![
                container("web", service_env("8080")),
                container("broken", service_env("oops")),
            ],
        );
        let services = e.pod_services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "web");
    }
}
