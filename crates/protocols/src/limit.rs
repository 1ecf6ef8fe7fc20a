use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between the starts of successive requests.
///
/// The check and the compensating sleep both happen under the mutex, which
/// serializes callers and keeps the rate ceiling burst-free.
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(requests_per_second: f64) -> Self {
        let min_interval = if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let since = Instant::now().saturating_duration_since(previous);
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_out_consecutive_acquisitions() {
        let limiter = RateLimiter::per_second(10.0);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // Three starts at 10 rps span at least 200ms.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_never_sleeps() {
        let limiter = RateLimiter::per_second(0.0);
        let started = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
