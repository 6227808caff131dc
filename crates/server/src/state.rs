// crates/server/src/state.rs
//! Application state for the streaming fan-out server.

use std::sync::Arc;
use std::time::Instant;

use arlens_bus::JobBus;

use crate::sse::TextGenerator;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Bus handle for subscribing to per-job progress subjects.
    pub bus: Arc<dyn JobBus>,
    /// AI text-generation collaborator. `None` when no provider is
    /// configured; the SSE endpoint then reports unavailable.
    pub generator: Option<Arc<dyn TextGenerator>>,
}

impl AppState {
    pub fn new(bus: Arc<dyn JobBus>, generator: Option<Arc<dyn TextGenerator>>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            bus,
            generator,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arlens_bus::MemoryBus;

    #[tokio::test]
    async fn test_app_state_uptime() {
        let state = AppState::new(Arc::new(MemoryBus::new()), None);
        assert!(state.uptime_secs() < 5);
        assert!(state.generator.is_none());
    }
}
