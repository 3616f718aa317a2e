use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Process-wide spacing of outbound CRM calls.
///
/// One instance is shared (behind an `Arc`) by every client so that no two
/// calls start less than `min_interval` apart, whichever session issued them.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for the next call slot and claim it.
    ///
    /// The slot is recorded before the caller issues its request, so a call
    /// that later fails still counts.
    pub async fn acquire(&self) -> Instant {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_interval).await;
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_call_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        let t = limiter.acquire().await;
        assert_eq!(t, start);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_calls_are_spaced_exactly() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let t0 = limiter.acquire().await;
        let t1 = limiter.acquire().await;
        let t2 = limiter.acquire().await;
        assert_eq!(t1 - t0, Duration::from_millis(500));
        assert_eq!(t2 - t1, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn no_extra_delay_after_idle_period() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let t0 = limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        let t1 = limiter.acquire().await;
        assert_eq!(t1 - t0, Duration::from_millis(800));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let t2 = limiter.acquire().await;
        assert_eq!(t2 - t1, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_schedule() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire().await }));
        }
        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }
}
