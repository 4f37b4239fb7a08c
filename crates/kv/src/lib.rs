//! Coordination key-value store interface.
//!
//! Handlers only need get / put-with-TTL / delete plus prefix scans, so that
//! is the whole contract; the etcd wire protocol stays behind [`EtcdStore`]
//! and tests run against [`mem::MemStore`].

#![forbid(unsafe_code)]

pub mod mem;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, DeleteOptions, GetOptions as EtcdGetOptions, Identity,
    PutOptions, TlsOptions,
};
use serde::Deserialize;
use tracing::debug;

/// Error taxonomy surfaced to callers, distinguishable so they can decide
/// whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("operation canceled by the caller")]
    Canceled,
    #[error("operation deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("client-side error: empty key")]
    EmptyKey,
    #[error("bad cluster endpoints, which are not etcd servers: {0}")]
    BadEndpoints(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub prefix: bool,
    pub keys_only: bool,
    /// 0 means no limit.
    pub limit: i64,
}

impl GetOptions {
    pub fn prefix() -> Self {
        Self { prefix: true, ..Self::default() }
    }

    pub fn keys_only_first() -> Self {
        Self { keys_only: true, limit: 1, ..Self::default() }
    }
}

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct KvRange {
    pub kvs: Vec<KvEntry>,
    pub count: i64,
    pub more: bool,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, opts: GetOptions) -> Result<KvRange, KvError>;

    /// `ttl` is in seconds; `None` writes a persistent key.
    async fn put(&self, key: &str, value: &str, ttl: Option<i64>) -> Result<(), KvError>;

    /// Returns the number of keys removed.
    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError>;
}

/// Connection settings for the etcd-backed store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Per-operation deadline in seconds, also used as the dial timeout.
    pub timeout: u64,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            ca_file: None,
            cert_file: None,
            key_file: None,
            timeout: 5,
        }
    }
}

/// etcd v3 implementation. One client is shared by all handlers; every
/// operation carries the configured per-operation deadline.
pub struct EtcdStore {
    client: Client,
    timeout: Duration,
}

impl EtcdStore {
    pub async fn connect(opts: &EtcdOptions) -> Result<Self, KvError> {
        let timeout = Duration::from_secs(opts.timeout);
        let mut connect = ConnectOptions::new()
            .with_timeout(timeout)
            .with_connect_timeout(timeout);

        if let Some(tls) = Self::tls_options(opts).await? {
            connect = connect.with_tls(tls);
        }

        let client = Client::connect(&opts.endpoints, Some(connect))
            .await
            .map_err(|e| KvError::BadEndpoints(e.to_string()))?;

        debug!(endpoints = ?opts.endpoints, "etcd store connected");
        Ok(Self { client, timeout })
    }

    async fn tls_options(opts: &EtcdOptions) -> Result<Option<TlsOptions>, KvError> {
        let ca = match &opts.ca_file {
            Some(path) => tokio::fs::read(path)
                .await
                .map_err(|e| KvError::BadEndpoints(format!("reading CA file: {e}")))?,
            None => return Ok(None),
        };

        let mut tls = TlsOptions::new().ca_certificate(Certificate::from_pem(ca));
        if let (Some(cert), Some(key)) = (&opts.cert_file, &opts.key_file) {
            let cert = tokio::fs::read(cert)
                .await
                .map_err(|e| KvError::BadEndpoints(format!("reading client cert: {e}")))?;
            let key = tokio::fs::read(key)
                .await
                .map_err(|e| KvError::BadEndpoints(format!("reading client key: {e}")))?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }

        Ok(Some(tls))
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: std::future::Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(KvError::BadEndpoints(e.to_string())),
            Err(_) => Err(KvError::DeadlineExceeded(self.timeout)),
        }
    }
}

fn require_key(key: &str) -> Result<(), KvError> {
    if key.is_empty() {
        Err(KvError::EmptyKey)
    } else {
        Ok(())
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str, opts: GetOptions) -> Result<KvRange, KvError> {
        require_key(key)?;

        let mut options = EtcdGetOptions::new();
        if opts.prefix {
            options = options.with_prefix();
        }
        if opts.keys_only {
            options = options.with_keys_only();
        }
        if opts.limit > 0 {
            options = options.with_limit(opts.limit);
        }

        let mut client = self.client.clone();
        let res = self
            .deadline(async move { client.get(key, Some(options)).await })
            .await?;

        Ok(KvRange {
            count: res.count(),
            more: res.more(),
            kvs: res
                .kvs()
                .iter()
                .map(|kv| KvEntry {
                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                    value: kv.value().to_vec(),
                    create_revision: kv.create_revision(),
                    mod_revision: kv.mod_revision(),
                    version: kv.version(),
                })
                .collect(),
        })
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<i64>) -> Result<(), KvError> {
        require_key(key)?;

        let mut client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.deadline(async move {
            let options = match ttl {
                Some(ttl) if ttl > 0 => {
                    let lease = client.lease_grant(ttl, None).await?;
                    Some(PutOptions::new().with_lease(lease.id()))
                }
                _ => None,
            };
            client.put(key, value, options).await.map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError> {
        require_key(key)?;

        let options = prefix.then(|| DeleteOptions::new().with_prefix());
        let mut client = self.client.clone();
        let key = key.to_string();
        let res = self
            .deadline(async move { client.delete(key, options).await })
            .await?;

        Ok(res.deleted())
    }
}

/// Join key path segments with single slashes.
pub fn join_key(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(trimmed);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
