use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub mod routes;
pub mod supervisor;

/// State shared between the supervisor and the HTTP endpoint.
#[derive(Clone)]
pub struct AppState {
    ready: Arc<AtomicBool>,
    metrics_enabled: bool,
    pprof_enabled: bool,
}

impl AppState {
    pub fn new(metrics_enabled: bool, pprof_enabled: bool) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            metrics_enabled,
            pprof_enabled,
        }
    }

    /// Flips false→true on the first successful sync and never back.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    pub fn pprof_enabled(&self) -> bool {
        self.pprof_enabled
    }
}
