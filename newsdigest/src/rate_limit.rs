use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Fixed-window request counter shared by the abstractor's workers.
///
/// The lock is held while waiting for the window to reset, so every caller
/// queues behind the one that hit the cap.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    /// `max_per_minute` calls per rolling 60 second window
    pub fn per_minute(max_per_minute: u32) -> Self {
        Self::new(max_per_minute, Duration::from_secs(60))
    }

    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1),
            window,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take one slot, waiting for the next window if this one is used up.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.max_per_window {
            let elapsed = now.duration_since(state.window_start);
            if let Some(wait) = self.window.checked_sub(elapsed) {
                debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting for next window");
                tokio::time::sleep(wait).await;
            }
            state.count = 0;
            state.window_start = Instant::now();
        }

        state.count += 1;
    }
}
