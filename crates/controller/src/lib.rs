//! Per-kind watch controller: bridges a resource watch into a rate-limited
//! work queue and drains it through the registered handlers with a bounded
//! retry budget.
//!
//! One controller owns one queue and one watch. Dispatch for a given kind is
//! strictly serialized in queue order by a single worker; controllers for
//! different kinds run independently and share nothing.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Error;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use watcher_core::{Event, EventAction, Handler, ResourceKind};
use watcher_kube::{CacheReader, Notification, WatchHandle};
use watcher_queue::{RetryPolicy, WorkItem, WorkQueue};

/// Retry ceiling per queue item; beyond it the item is dropped and recorded
/// as unrecoverable.
const MAX_RETRIES: u32 = 5;

pub struct Controller {
    resource: ResourceKind,
    handlers: Vec<Arc<dyn Handler>>,
    queue: Arc<WorkQueue<Event>>,
    max_retries: u32,
}

impl Controller {
    pub fn new(resource: ResourceKind, handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self::with_retry(resource, handlers, RetryPolicy::default(), MAX_RETRIES)
    }

    pub fn with_retry(
        resource: ResourceKind,
        handlers: Vec<Arc<dyn Handler>>,
        retry: RetryPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            resource,
            handlers,
            queue: WorkQueue::new(retry),
            max_retries,
        }
    }

    /// Run until the shutdown signal fires. Blocks first on cache sync; a
    /// sync failure is fatal for this controller only (it logs and returns,
    /// the process keeps running without this resource kind).
    pub async fn run(self, watch_handle: WatchHandle, mut shutdown: watch::Receiver<bool>) {
        let WatchHandle {
            cache,
            mut notifications,
            mut synced,
            task: watch_task,
        } = watch_handle;

        info!(kind = %self.resource, "starting watch controller");

        let ready = loop {
            if *synced.borrow() {
                break true;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        break false;
                    }
                }
                _ = shutdown.changed() => {
                    break false;
                }
            }
        };
        if !ready {
            error!(kind = %self.resource, "timed out waiting for caches to sync");
            watch_task.abort();
            return;
        }

        info!(kind = %self.resource, "watch controller synced and ready");
        let started_at = Utc::now();

        // Bridge watch notifications into the queue until the watch ends.
        let capture_queue = Arc::clone(&self.queue);
        let resource = self.resource;
        let capture = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                if let Some(event) = capture_event(resource, notification) {
                    metrics::counter!(
                        "watcher_events_enqueued_total", 1u64,
                        "kind" => resource.to_string(),
                        "action" => event.action.to_string()
                    );
                    capture_queue.add(event);
                }
            }
        });

        // On shutdown: stop the watch, stop accepting pushes, let the worker
        // drain whatever is queued.
        let shutdown_queue = Arc::clone(&self.queue);
        let watch_abort = watch_task.abort_handle();
        let shutdown_guard = tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            watch_abort.abort();
            shutdown_queue.shut_down();
        });

        while let Some(event) = self.queue.next().await {
            self.process(&cache, started_at, event).await;
        }

        capture.abort();
        shutdown_guard.abort();
        info!(kind = %self.resource, "watch controller stopped");
    }

    async fn process(&self, cache: &CacheReader, started_at: DateTime<Utc>, event: Event) {
        let key = event.work_key();

        match self.process_event(cache, started_at, &event).await {
            Ok(()) => {
                // reset the item's rate-limit counter
                self.queue.forget(&key);
            }
            Err(err) if self.queue.num_requeues(&key) < self.max_retries => {
                error!(kind = %self.resource, key = %event.key, "error processing (will retry): {err:#}");
                metrics::counter!("watcher_event_retries_total", 1u64, "kind" => self.resource.to_string());
                Arc::clone(&self.queue).add_rate_limited(event.clone());
            }
            Err(err) => {
                error!(kind = %self.resource, key = %event.key, "error processing (giving up): {err:#}");
                self.queue.forget(&key);
                record_unrecoverable(self.resource, &event.key, &err);
            }
        }

        self.queue.done(&key);
    }

    async fn process_event(
        &self,
        cache: &CacheReader,
        started_at: DateTime<Utc>,
        event: &Event,
    ) -> Result<(), Error> {
        if event.action == EventAction::Created {
            // Resync replays every pre-existing object as a create; only
            // objects born after this controller started are real creates.
            let current = match cache.get(&event.key).await {
                Some(current) => current,
                None => {
                    debug!(key = %event.key, "object gone from cache, create suppressed");
                    return Ok(());
                }
            };
            let fresh = current
                .creation_timestamp()
                .map(|ts| ts > started_at)
                .unwrap_or(false);
            if !fresh {
                debug!(key = %event.key, "pre-existing object, create suppressed");
                metrics::counter!("watcher_creates_suppressed_total", 1u64, "kind" => self.resource.to_string());
                return Ok(());
            }
        }

        self.dispatch(event).await
    }

    async fn dispatch(&self, event: &Event) -> Result<(), Error> {
        let mut failed = 0usize;
        let mut first_err: Option<Error> = None;

        for handler in &self.handlers {
            let result = match event.action {
                EventAction::Created => handler.created(event).await,
                EventAction::Updated => handler.updated(event).await,
                EventAction::Deleted => handler.deleted(event).await,
            };
            if let Err(err) = result {
                warn!(
                    handler = handler.name(),
                    key = %event.key,
                    action = %event.action,
                    "handler failed: {err:#}"
                );
                failed += 1;
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            None => Ok(()),
            Some(err) if failed == 1 => Err(err),
            Some(err) => Err(err.context(format!("{failed} handlers failed"))),
        }
    }
}

fn capture_event(resource: ResourceKind, notification: Notification) -> Option<Event> {
    match notification {
        Notification::Added(object) => Some(Event {
            key: object.store_key()?,
            action: EventAction::Created,
            resource,
            namespace: object.namespace().to_string(),
            object,
            old_object: None,
        }),
        // Pushed unconditionally, resync included; handlers own no-op
        // detection. The key comes from the previous state.
        Notification::Modified { old, new } => Some(Event {
            key: old.store_key()?,
            action: EventAction::Updated,
            resource,
            namespace: new.namespace().to_string(),
            object: new,
            old_object: Some(old),
        }),
        Notification::Deleted(object) => Some(Event {
            key: object.store_key()?,
            action: EventAction::Deleted,
            resource,
            namespace: object.namespace().to_string(),
            object,
            old_object: None,
        }),
    }
}

/// Process-wide record of an event dropped after exhausting its retry
/// budget. There is no dead-letter store; the log line and counter are the
/// operator's signal.
fn record_unrecoverable(resource: ResourceKind, key: &str, err: &Error) {
    error!(kind = %resource, key = %key, "unrecoverable event dropped: {err:#}");
    metrics::counter!("watcher_events_unrecoverable_total", 1u64, "kind" => resource.to_string());
}
