//! Watcher core types: the event model shared by controllers and handlers,
//! service descriptors declared through pod environment variables, and the
//! pod transition classifier driving the registrar handlers.

#![forbid(unsafe_code)]

mod classify;
mod event;
mod handler;
mod service;

pub use classify::{classify, containers_ready, is_departing, PodTransition};
pub use event::{Event, EventAction, ResourceKind, WatchedObject};
pub use handler::Handler;
pub use service::{HealthCheck, ServiceDescriptor, ServiceError};
