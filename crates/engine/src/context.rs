//! Tool context – what every tool invocation gets to work with.

use crate::handle::EngineHandle;
use crate::lifecycle::{EngineError, EngineManager};
use std::time::Duration;

/// Central context passed to all tool invocations.
///
/// Holds the shared engine manager so that every tool goes through the same
/// single engine instance.
#[derive(Clone)]
pub struct ToolContext {
    engine: EngineManager,
    acquire_timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(engine: EngineManager) -> Self {
        Self {
            engine,
            acquire_timeout: None,
        }
    }

    /// Bound how long engine tools wait for the engine to become ready.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn engine(&self) -> &EngineManager {
        &self.engine
    }

    pub async fn acquire_engine(&self) -> Result<EngineHandle, EngineError> {
        match self.acquire_timeout {
            Some(timeout) => self.engine.acquire_timeout(timeout).await,
            None => self.engine.acquire().await,
        }
    }
}
