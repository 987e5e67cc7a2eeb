//! Token-bucket limiter shared by every source adapter call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Async token bucket refilled continuously at `permits_per_sec`.
///
/// Cloning shares the bucket, so every clone draws from the same budget.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Builds a limiter allowing `permits_per_sec` acquisitions per second,
    /// with a burst equal to one second's worth of permits.
    pub fn per_second(permits_per_sec: u32) -> Self {
        let rate = permits_per_sec.max(1) as f64;
        Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: rate,
                last_refill: Instant::now(),
            })),
            capacity: rate,
            refill_per_sec: rate,
        }
    }

    /// Waits until a permit is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
                guard.last_refill = now;
                guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                if guard.tokens >= 1.0 {
                    guard.tokens -= 1.0;
                    return;
                }
                (1.0 - guard.tokens) / self.refill_per_sec
            };
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}
