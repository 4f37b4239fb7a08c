//! In-memory [`KvStore`] double for tests.
//!
//! Semantics mirror the etcd contract closely enough for handler tests:
//! ordered prefix scans, keys-only reads, limits with the `more` flag, and
//! lease-style expiry. The TTL unit is configurable so expiry is testable
//! without multi-second sleeps.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{GetOptions, KvEntry, KvError, KvRange, KvStore};

struct MemEntry {
    value: String,
    expires_at: Option<Instant>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
}

struct MemInner {
    entries: BTreeMap<String, MemEntry>,
    revision: i64,
}

pub struct MemStore {
    inner: Mutex<MemInner>,
    ttl_unit: Duration,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_ttl_unit(Duration::from_secs(1))
    }

    /// A store whose TTLs count in `unit` instead of seconds.
    pub fn with_ttl_unit(unit: Duration) -> Self {
        Self {
            inner: Mutex::new(MemInner {
                entries: BTreeMap::new(),
                revision: 0,
            }),
            ttl_unit: unit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(inner: &mut MemInner) {
        let now = Instant::now();
        inner
            .entries
            .retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str, opts: GetOptions) -> Result<KvRange, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }

        let mut inner = self.lock();
        Self::purge_expired(&mut inner);

        let matches: Vec<(&String, &MemEntry)> = if opts.prefix {
            inner
                .entries
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .collect()
        } else {
            inner.entries.get_key_value(key).into_iter().collect()
        };

        let count = matches.len() as i64;
        let mut selected = matches;
        if opts.limit > 0 {
            selected.truncate(opts.limit as usize);
        }

        Ok(KvRange {
            count,
            more: opts.limit > 0 && count > opts.limit,
            kvs: selected
                .into_iter()
                .map(|(k, e)| KvEntry {
                    key: (*k).clone(),
                    value: if opts.keys_only { Vec::new() } else { e.value.clone().into_bytes() },
                    create_revision: e.create_revision,
                    mod_revision: e.mod_revision,
                    version: e.version,
                })
                .collect(),
        })
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<i64>) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }

        let mut inner = self.lock();
        Self::purge_expired(&mut inner);
        inner.revision += 1;
        let revision = inner.revision;
        let expires_at = ttl
            .filter(|t| *t > 0)
            .map(|t| Instant::now() + self.ttl_unit * t as u32);

        match inner.entries.get_mut(key) {
            Some(existing) => {
                existing.value = value.to_string();
                existing.expires_at = expires_at;
                existing.mod_revision = revision;
                existing.version += 1;
            }
            None => {
                inner.entries.insert(
                    key.to_string(),
                    MemEntry {
                        value: value.to_string(),
                        expires_at,
                        create_revision: revision,
                        mod_revision: revision,
                        version: 1,
                    },
                );
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }

        let mut inner = self.lock();
        Self::purge_expired(&mut inner);

        if prefix {
            let doomed: Vec<String> = inner
                .entries
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &doomed {
                inner.entries.remove(k);
            }
            Ok(doomed.len() as i64)
        } else {
            Ok(inner.entries.remove(key).map(|_| 1).unwrap_or(0))
        }
    }
}
