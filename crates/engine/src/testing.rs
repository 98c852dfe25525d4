//! Scripted backend doubles shared by the unit tests.

use crate::traits::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default, Clone)]
pub struct ScriptedBackend {
    progress: Vec<f64>,
    load_delay_ms: u64,
    run_delay_ms: u64,
    fail_load: bool,
    panic_load: bool,
    loads: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn with_progress(mut self, progress: Vec<f64>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_run_delay_ms(mut self, ms: u64) -> Self {
        self.run_delay_ms = ms;
        self
    }

    pub fn max_concurrent_runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_running)
    }
}

#[async_trait::async_trait]
impl ConversionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self, events: &EngineEvents) -> BackendResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        events.log("loading scripted engine");
        tokio::time::sleep(Duration::from_millis(self.load_delay_ms)).await;
        if self.panic_load {
            panic!("scripted load panic");
        }
        if self.fail_load {
            return Err(BackendError::Other("scripted load failure".into()));
        }
        Ok(())
    }

    async fn run(&self, op: &Operation, events: &EngineEvents) -> BackendResult<Payload> {
        if op.name == "fail" || op.input.as_bytes() == b"fail" {
            return Err(BackendError::Process("scripted operation failure".into()));
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        for p in &self.progress {
            events.progress(*p);
        }
        events.log(format!("ran {}", op.name));
        tokio::time::sleep(Duration::from_millis(self.run_delay_ms)).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(op.input.clone())
    }
}

/// Factory producing [`ScriptedBackend`]s, counting creations and loads.
#[derive(Default, Clone)]
pub struct ScriptedFactory {
    template: ScriptedBackend,
    creates: Arc<AtomicUsize>,
    failing_loads: Arc<AtomicUsize>,
    panicking_loads: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn with_load_delay_ms(mut self, ms: u64) -> Self {
        self.template.load_delay_ms = ms;
        self
    }

    pub fn with_progress(mut self, progress: Vec<f64>) -> Self {
        self.template.progress = progress;
        self
    }

    /// The next `n` load attempts fail.
    pub fn failing_first(self, n: usize) -> Self {
        self.failing_loads.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` load attempts panic.
    pub fn panicking_first(self, n: usize) -> Self {
        self.panicking_loads.store(n, Ordering::SeqCst);
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.template.loads.load(Ordering::SeqCst)
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self) -> BackendResult<Box<dyn ConversionBackend>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let fail_load = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let panic_load = self
            .panicking_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let mut backend = self.template.clone();
        backend.fail_load = fail_load;
        backend.panic_load = panic_load;
        // Each instance tracks its own concurrency; load counts stay shared.
        backend.running = Arc::new(AtomicUsize::new(0));
        backend.max_running = Arc::new(AtomicUsize::new(0));
        Ok(Box::new(backend))
    }
}
