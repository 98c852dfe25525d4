//! Engine lifecycle – one shared engine, initialized at most once at a time.
//!
//! [`EngineManager::acquire`] either hands out the loaded engine, joins the
//! initialization already in flight, or starts a new one. The load itself
//! runs on a spawned task and publishes its outcome on a per-attempt watch
//! channel; every caller of that attempt (including the one that started it)
//! awaits the same channel, so all of them see the same handle or the same
//! error, and a caller giving up early never strands the state in
//! `Initializing`.

use crate::handle::EngineHandle;
use crate::progress::{ProgressProjector, ProgressSubscription};
use crate::traits::{BackendFactory, EngineEvent, EngineEvents};
use crate::types::ErrorCode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine initialization failed: {0}")]
    Initialization(String),

    #[error("engine was reset before initialization finished")]
    Reset,

    #[error("engine initialization was aborted")]
    Aborted,

    #[error("timed out after {0:?} waiting for the engine")]
    Timeout(Duration),

    #[error("engine is not ready (status: {0})")]
    NotReady(EngineStatus),
}

impl EngineError {
    /// Result code reported when a caller could not get the engine.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Timeout(_) => ErrorCode::Timeout,
            _ => ErrorCode::EngineUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineStatus::Uninitialized => "uninitialized",
            EngineStatus::Initializing => "initializing",
            EngineStatus::Ready => "ready",
            EngineStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot of the shared engine state, as shown to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineState {
    pub status: EngineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub raw_progress: f64,
    pub display_progress: u8,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Uninitialized,
            last_error: None,
            raw_progress: 0.0,
            display_progress: 0,
            busy: false,
            status_message: None,
        }
    }
}

/// Tunables for the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interval between display smoothing steps.
    #[serde(default = "default_smoothing_interval_ms")]
    pub smoothing_interval_ms: u64,
}

fn default_smoothing_interval_ms() -> u64 {
    16
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            smoothing_interval_ms: default_smoothing_interval_ms(),
        }
    }
}

type Outcome = Option<Result<EngineHandle, EngineError>>;

enum Phase {
    Uninitialized,
    Initializing { outcome: watch::Receiver<Outcome> },
    Ready(EngineHandle),
    Failed(EngineError),
}

impl Phase {
    fn status(&self) -> EngineStatus {
        match self {
            Phase::Uninitialized => EngineStatus::Uninitialized,
            Phase::Initializing { .. } => EngineStatus::Initializing,
            Phase::Ready(_) => EngineStatus::Ready,
            Phase::Failed(_) => EngineStatus::Failed,
        }
    }
}

struct Inner {
    phase: Phase,
    /// Bumped on every new attempt and every reset; stale work is fenced
    /// off by comparing against it.
    generation: u64,
    progress: ProgressProjector,
}

struct Shared {
    factory: Arc<dyn BackendFactory>,
    settings: EngineSettings,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<EngineState>,
    attempts: AtomicU64,
}

/// Owner of the single shared engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EngineManager {
    shared: Arc<Shared>,
}

impl EngineManager {
    pub fn new(factory: impl BackendFactory + 'static, settings: EngineSettings) -> Self {
        Self::with_factory(Arc::new(factory), settings)
    }

    pub fn with_factory(factory: Arc<dyn BackendFactory>, settings: EngineSettings) -> Self {
        let (state_tx, _) = watch::channel(EngineState::default());
        Self {
            shared: Arc::new(Shared {
                factory,
                settings,
                inner: Mutex::new(Inner {
                    phase: Phase::Uninitialized,
                    generation: 0,
                    progress: ProgressProjector::default(),
                }),
                state_tx,
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Return the loaded engine, loading it first if needed.
    pub async fn acquire(&self) -> Result<EngineHandle, EngineError> {
        let mut outcome = {
            let mut inner = self.shared.inner.lock();
            let in_flight = match &inner.phase {
                Phase::Ready(handle) => return Ok(handle.clone()),
                Phase::Initializing { outcome } => Some(outcome.clone()),
                Phase::Uninitialized | Phase::Failed(_) => None,
            };
            match in_flight {
                Some(outcome) => {
                    debug!(generation = inner.generation, "joining in-flight engine initialization");
                    outcome
                }
                None => self.begin_initialization(&mut inner),
            }
        };

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(EngineError::Aborted))
    }

    /// [`acquire`](Self::acquire) with a caller-side deadline. The deadline
    /// only bounds this caller's wait; the initialization keeps going.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<EngineHandle, EngineError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    /// Drop the engine and all bookkeeping, back to `Uninitialized`.
    ///
    /// Work already running inside the engine is not interrupted; an
    /// initialization still in flight will have its result discarded.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        let previous = std::mem::replace(&mut inner.phase, Phase::Uninitialized);
        inner.progress.reset();
        info!(
            from = %previous.status(),
            generation = inner.generation,
            "engine reset"
        );
        self.publish(&inner);
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.inner.lock().phase.status()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state_tx.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of initialization attempts started so far.
    pub fn init_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Start projecting the ready engine's events into [`EngineState`].
    pub fn subscribe_progress(&self) -> Result<ProgressSubscription, EngineError> {
        let inner = self.shared.inner.lock();
        match &inner.phase {
            Phase::Ready(handle) => Ok(ProgressSubscription::start(
                self.clone(),
                handle.clone(),
                inner.generation,
                Duration::from_millis(self.shared.settings.smoothing_interval_ms.max(1)),
            )),
            other => Err(EngineError::NotReady(other.status())),
        }
    }

    pub(crate) fn apply_event(&self, generation: u64, event: &EngineEvent) -> bool {
        let mut inner = self.shared.inner.lock();
        if !self.is_current(&inner, generation) {
            return false;
        }
        let needs_tick = inner.progress.observe(event);
        self.publish(&inner);
        needs_tick
    }

    pub(crate) fn smoothing_tick(&self, generation: u64) -> bool {
        let mut inner = self.shared.inner.lock();
        if !self.is_current(&inner, generation) {
            return false;
        }
        let before = inner.progress.display();
        let more = inner.progress.tick();
        if inner.progress.display() != before {
            self.publish(&inner);
        }
        more
    }

    fn is_current(&self, inner: &Inner, generation: u64) -> bool {
        inner.generation == generation && matches!(inner.phase, Phase::Ready(_))
    }

    fn begin_initialization(&self, inner: &mut Inner) -> watch::Receiver<Outcome> {
        inner.generation += 1;
        let generation = inner.generation;
        let (tx, rx) = watch::channel(None);
        inner.phase = Phase::Initializing {
            outcome: rx.clone(),
        };
        inner.progress.reset();
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        info!(generation, "initializing conversion engine");
        self.publish(inner);

        let manager = self.clone();
        tokio::spawn(async move {
            // The load runs on its own task so a panicking backend still
            // settles this attempt as Failed.
            let loader = manager.clone();
            let result = match tokio::spawn(async move { loader.load_engine().await }).await {
                Ok(result) => result,
                Err(e) => Err(EngineError::Initialization(format!(
                    "engine load did not complete: {}",
                    e
                ))),
            };
            let outcome = manager.commit(generation, result);
            // Nobody waiting is fine; the state already holds the outcome.
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    async fn load_engine(&self) -> Result<EngineHandle, EngineError> {
        let backend = self
            .shared
            .factory
            .create()
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        let events = EngineEvents::new();
        debug!(backend = backend.name(), "loading engine");
        backend
            .load(&events)
            .await
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        Ok(EngineHandle::new(backend, events))
    }

    fn commit(
        &self,
        generation: u64,
        result: Result<EngineHandle, EngineError>,
    ) -> Result<EngineHandle, EngineError> {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            warn!(generation, "discarding engine initialization superseded by reset");
            return Err(EngineError::Reset);
        }
        match result {
            Ok(handle) => {
                info!(engine = %handle.id(), backend = handle.backend_name(), "engine ready");
                inner.phase = Phase::Ready(handle.clone());
                inner.progress.complete_load();
                self.publish(&inner);
                Ok(handle)
            }
            Err(e) => {
                warn!(error = %e, "engine initialization failed");
                inner.phase = Phase::Failed(e.clone());
                self.publish(&inner);
                Err(e)
            }
        }
    }

    fn publish(&self, inner: &Inner) {
        let status = inner.phase.status();
        let last_error = match &inner.phase {
            Phase::Failed(e) => Some(e.to_string()),
            _ => None,
        };
        self.shared.state_tx.send_replace(EngineState {
            status,
            last_error,
            raw_progress: inner.progress.raw(),
            display_progress: inner.progress.display(),
            busy: status == EngineStatus::Ready && inner.progress.busy(),
            status_message: inner.progress.message().map(String::from),
        });
    }
}

impl fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineManager")
            .field("status", &self.status())
            .field("attempts", &self.init_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFactory;
    use crate::traits::{Operation, Payload};

    fn manager(factory: &ScriptedFactory) -> EngineManager {
        EngineManager::new(factory.clone(), EngineSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_loads_once() {
        let factory = ScriptedFactory::default().with_load_delay_ms(200);
        let mgr = manager(&factory);

        let (a, b, c) = tokio::join!(mgr.acquire(), mgr.acquire(), mgr.acquire());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(factory.creates(), 1);
        assert_eq!(factory.loads(), 1);
        assert!(a.same_engine(&b) && b.same_engine(&c));
        assert_eq!(mgr.status(), EngineStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_from_spawned_tasks() {
        let factory = ScriptedFactory::default().with_load_delay_ms(100);
        let mgr = manager(&factory);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire().await })
            })
            .collect();

        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap().unwrap());
        }
        assert_eq!(factory.loads(), 1);
        assert_eq!(mgr.init_attempts(), 1);
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_acquire_is_idempotent() {
        let factory = ScriptedFactory::default().with_load_delay_ms(10);
        let mgr = manager(&factory);

        let first = mgr.acquire().await.unwrap();
        for _ in 0..5 {
            assert_eq!(mgr.acquire().await.unwrap(), first);
        }
        assert_eq!(factory.loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_initialization_failure() {
        let factory = ScriptedFactory::default()
            .with_load_delay_ms(50)
            .failing_first(1);
        let mgr = manager(&factory);

        let (a, b, c) = tokio::join!(mgr.acquire(), mgr.acquire(), mgr.acquire());
        let (a, b, c) = (a.unwrap_err(), b.unwrap_err(), c.unwrap_err());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(a.to_string().contains("scripted load failure"));
        assert_eq!(factory.loads(), 1);

        let state = mgr.state();
        assert_eq!(state.status, EngineStatus::Failed);
        assert!(state.last_error.is_some());
        assert!(!state.busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_engine_recovers_on_next_acquire() {
        let factory = ScriptedFactory::default().failing_first(1);
        let mgr = manager(&factory);

        assert!(mgr.acquire().await.is_err());
        assert_eq!(mgr.status(), EngineStatus::Failed);

        let mut states = mgr.watch_state();
        let handle = mgr.acquire().await.unwrap();
        assert_eq!(mgr.status(), EngineStatus::Ready);
        assert_eq!(factory.creates(), 2);
        assert_eq!(mgr.init_attempts(), 2);
        assert!(mgr.state().last_error.is_none());
        assert!(states.has_changed().unwrap());
        assert_eq!(mgr.acquire().await.unwrap(), handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_load_fails_and_allows_retry() {
        let factory = ScriptedFactory::default().panicking_first(1);
        let mgr = manager(&factory);

        let (a, b) = tokio::join!(mgr.acquire(), mgr.acquire());
        let err = a.unwrap_err();
        assert_eq!(b.unwrap_err(), err);
        assert!(matches!(err, EngineError::Initialization(_)));

        let state = mgr.state();
        assert_eq!(state.status, EngineStatus::Failed);
        assert!(state.last_error.unwrap().contains("panicked"));

        mgr.acquire().await.unwrap();
        assert_eq!(mgr.status(), EngineStatus::Ready);
        assert_eq!(mgr.init_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initializing_state_is_visible() {
        let factory = ScriptedFactory::default().with_load_delay_ms(100);
        let mgr = manager(&factory);

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire().await })
        };
        let mut states = mgr.watch_state();
        let seen = states
            .wait_for(|s| s.status == EngineStatus::Initializing)
            .await
            .unwrap()
            .clone();
        assert_eq!(seen.display_progress, 0);
        assert_eq!(seen.raw_progress, 0.0);
        assert!(!seen.busy);

        waiter.await.unwrap().unwrap();
        let ready = mgr.state();
        assert_eq!(ready.status, EngineStatus::Ready);
        assert_eq!(ready.display_progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_to_uninitialized() {
        let factory = ScriptedFactory::default();
        let mgr = manager(&factory);

        let first = mgr.acquire().await.unwrap();
        mgr.reset();
        assert_eq!(mgr.state(), EngineState::default());

        let second = mgr.acquire().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(factory.loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_initialization_discards_result() {
        let factory = ScriptedFactory::default().with_load_delay_ms(100);
        let mgr = manager(&factory);

        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire().await })
        };
        mgr.watch_state()
            .wait_for(|s| s.status == EngineStatus::Initializing)
            .await
            .unwrap();
        mgr.reset();

        assert_eq!(pending.await.unwrap(), Err(EngineError::Reset));
        assert_eq!(mgr.status(), EngineStatus::Uninitialized);

        mgr.acquire().await.unwrap();
        assert_eq!(mgr.status(), EngineStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_leaves_initialization_running() {
        let factory = ScriptedFactory::default().with_load_delay_ms(500);
        let mgr = manager(&factory);

        let err = mgr
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout(Duration::from_millis(50)));
        assert_eq!(mgr.status(), EngineStatus::Initializing);

        mgr.acquire().await.unwrap();
        assert_eq!(factory.loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_requires_ready() {
        let mgr = manager(&ScriptedFactory::default());
        match mgr.subscribe_progress() {
            Err(EngineError::NotReady(EngineStatus::Uninitialized)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_projects_operation_progress() {
        let factory = ScriptedFactory::default().with_progress(vec![0.0, 0.1, 0.5, 0.95]);
        let mgr = manager(&factory);
        let handle = mgr.acquire().await.unwrap();
        let subscription = mgr.subscribe_progress().unwrap();
        assert!(subscription.is_attached());

        handle
            .run(&Operation::new("echo", Payload::Text("x".into())))
            .await
            .unwrap();

        let mut states = mgr.watch_state();
        let settled = states
            .wait_for(|s| s.status_message.as_deref() == Some("ran echo") && s.display_progress == 94)
            .await
            .unwrap()
            .clone();
        assert_eq!(settled.raw_progress, 0.95);
        assert!(!settled.busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_detach_is_idempotent() {
        let mgr = manager(&ScriptedFactory::default());
        let handle = mgr.acquire().await.unwrap();

        let mut first = mgr.subscribe_progress().unwrap();
        let second = mgr.subscribe_progress().unwrap();
        assert_eq!(handle.subscriber_count(), 2);

        first.detach();
        first.detach();
        assert!(!first.is_attached());
        assert_eq!(handle.subscriber_count(), 1);

        drop(second);
        assert_eq!(handle.subscriber_count(), 0);
        drop(first);
        assert_eq!(handle.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subscription_ignored_after_reset() {
        let mgr = manager(&ScriptedFactory::default());
        mgr.acquire().await.unwrap();
        let subscription = mgr.subscribe_progress().unwrap();
        let generation = mgr.shared.inner.lock().generation;

        mgr.reset();
        assert!(!mgr.apply_event(generation, &EngineEvent::Progress { progress: 0.5 }));
        assert_eq!(mgr.state(), EngineState::default());
        drop(subscription);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_failure_keeps_engine_ready() {
        let mgr = manager(&ScriptedFactory::default());
        let handle = mgr.acquire().await.unwrap();

        let failed = handle
            .run(&Operation::new("fail", Payload::Binary(vec![1])))
            .await;
        assert!(failed.is_err());
        assert_eq!(mgr.status(), EngineStatus::Ready);

        let ok = handle
            .run(&Operation::new("echo", Payload::Binary(vec![2])))
            .await
            .unwrap();
        assert_eq!(ok.as_bytes(), &[2]);
    }
}
