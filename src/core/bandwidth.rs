//! Shared bytes-per-second ceiling for all running fetchers

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

/// One-second window throttle. Cloning shares the window and the limit.
#[derive(Clone, Debug)]
pub struct BandwidthController {
    limit: Arc<RwLock<Option<u64>>>,
    state: Arc<Mutex<BandwidthState>>,
}

#[derive(Debug)]
struct BandwidthState {
    window_start: Instant,
    bytes_in_window: u64,
}

impl BandwidthState {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }
}

impl Default for BandwidthController {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BandwidthController {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: Arc::new(RwLock::new(limit)),
            state: Arc::new(Mutex::new(BandwidthState::new())),
        }
    }

    pub async fn set_limit(&self, limit: Option<u64>) {
        *self.limit.write().await = limit;
    }

    pub async fn limit(&self) -> Option<u64> {
        *self.limit.read().await
    }

    /// Account for `bytes` just written and sleep off any excess over the limit
    pub async fn throttle(&self, bytes: u64) {
        let Some(limit) = *self.limit.read().await else {
            return;
        };
        if limit == 0 {
            return;
        }

        let mut state = self.state.lock().await;
        if state.window_start.elapsed() >= Duration::from_secs(1) {
            state.window_start = Instant::now();
            state.bytes_in_window = 0;
        }
        state.bytes_in_window += bytes;
        if state.bytes_in_window > limit {
            let excess = state.bytes_in_window - limit;
            let sleep_secs = excess as f64 / limit as f64;
            drop(state);
            sleep(Duration::from_secs_f64(sleep_secs)).await;
        }
    }
}
