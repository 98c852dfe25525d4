//! Engine crate – shared heavy-engine lifecycle and the tools built on it.
//!
//! One expensive conversion engine is loaded lazily, shared by every tool,
//! and torn down on reset. The crate has no UI dependencies, so the same
//! logic backs the headless CLI and its daemon mode.

pub mod context;
pub mod doctor;
pub mod ffmpeg;
pub mod handle;
pub mod lifecycle;
pub mod progress;
pub mod scenario;
pub mod tools;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use context::ToolContext;
pub use handle::EngineHandle;
pub use lifecycle::{EngineError, EngineManager, EngineSettings, EngineState, EngineStatus};
pub use progress::ProgressSubscription;
pub use tools::ToolRegistry;
pub use types::{ErrorCode, ToolResult};
