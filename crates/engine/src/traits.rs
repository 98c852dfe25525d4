//! External engine boundary – the heavy conversion backend behind traits.
//!
//! The lifecycle manager treats the backend as an opaque collaborator: only
//! the async `load` contract and the shape of the events it emits matter.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine process failed: {0}")]
    Process(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event emitted by a backend while loading or running an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Free-form log line. Advisory only.
    Log { message: String },
    /// Completion ratio of the current work, expected in `[0, 1]`.
    Progress { progress: f64 },
}

/// Identifies one attached subscriber so it can detach exactly itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Event emitter surface of one engine instance.
///
/// Every subscriber gets its own unbounded queue, so events reach each
/// subscriber in emission order and are never dropped or merged.
#[derive(Clone, Default)]
pub struct EngineEvents {
    inner: Arc<EmitterInner>,
}

#[derive(Default)]
struct EmitterInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, mpsc::UnboundedSender<EngineEvent>)>>,
}

impl EngineEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut subs = self.inner.subscribers.lock();
        // Receivers that went away without detaching are pruned here.
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(EngineEvent::Log {
            message: message.into(),
        });
    }

    pub fn progress(&self, progress: f64) {
        self.emit(EngineEvent::Progress { progress });
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<EngineEvent>) {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push((id, tx));
        (id, rx)
    }

    /// Detach one subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.inner.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Binary or text payload passed to / returned from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Binary(b) => b,
            Payload::Text(s) => s.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Binary(b) => b,
            Payload::Text(s) => s.into_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named engine operation with its input payload.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub input: Payload,
    /// Named parameters, e.g. `input_format` / `output_format`.
    pub params: HashMap<String, String>,
    /// Extra engine-specific arguments, passed through verbatim.
    pub args: Vec<String>,
}

impl Operation {
    pub fn new(name: impl Into<String>, input: Payload) -> Self {
        Self {
            name: name.into(),
            input,
            params: HashMap::new(),
            args: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

/// The heavy conversion engine itself.
#[async_trait::async_trait]
pub trait ConversionBackend: Send + Sync {
    /// Short human-readable name, used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Load the engine. May take seconds.
    async fn load(&self, events: &EngineEvents) -> BackendResult<()>;

    /// Run one named operation. Never called concurrently on one instance.
    async fn run(&self, op: &Operation, events: &EngineEvents) -> BackendResult<Payload>;
}

/// Builds a fresh backend for every initialization attempt.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> BackendResult<Box<dyn ConversionBackend>>;
}
