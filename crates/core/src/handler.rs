//! The pluggable reactor contract controllers dispatch events to.

use anyhow::Result;
use async_trait::async_trait;

use crate::event::Event;

/// Implemented by anything reacting to watched resource transitions.
///
/// Returning an error asks the controller to retry the whole event under its
/// rate-limited retry budget, so implementations must be idempotent.
/// Administrative handlers that only serve HTTP routes keep the default
/// no-op reactions.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn created(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn updated(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn deleted(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}
