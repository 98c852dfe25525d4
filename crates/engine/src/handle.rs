//! Engine handle – the single live, loaded engine instance.

use crate::traits::{
    BackendResult, ConversionBackend, EngineEvent, EngineEvents, Operation, Payload, SubscriberId,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Cheap-clone reference to the loaded engine.
///
/// All clones point at the same instance; equality is identity. Operations
/// are serialized through one async lock because the backend does not
/// support parallel work.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: uuid::Uuid,
    backend: Box<dyn ConversionBackend>,
    events: EngineEvents,
    run_lock: Mutex<()>,
}

impl EngineHandle {
    pub(crate) fn new(backend: Box<dyn ConversionBackend>, events: EngineEvents) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: uuid::Uuid::new_v4(),
                backend,
                events,
                run_lock: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.inner.id
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<EngineEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    /// Run a named operation, waiting for any operation already in progress.
    pub async fn run(&self, op: &Operation) -> BackendResult<Payload> {
        let _guard = self.inner.run_lock.lock().await;
        tracing::debug!(engine = %self.inner.id, op = %op.name, "running engine operation");
        self.inner.backend.run(op, &self.inner.events).await
    }
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_engine(other)
    }
}

impl Eq for EngineHandle {}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name())
            .finish()
    }
}
