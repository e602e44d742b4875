//! Token-bucket rate limiter for the sheet client
//!
//! One bucket is shared by every task that talks to the sheet; callers block
//! on [`TokenBucket::acquire`] when the budget for the current second is
//! spent. After the sheet reports a quota breach the effective rate halves
//! for a minute, and an explicit `Retry-After` blocks all calls until it
//! elapses.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;

/// Duration of the reduced-rate period after a 429
const PENALTY: Duration = Duration::from_secs(60);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Rate is halved until this instant
    penalty_until: Option<Instant>,
    /// No requests at all until this instant (Retry-After)
    blocked_until: Option<Instant>,
}

pub struct TokenBucket {
    qps: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(qps: u32) -> TokenBucket {
        TokenBucket {
            qps: qps as f64,
            state: Mutex::new(BucketState {
                tokens: qps as f64,
                last_refill: Instant::now(),
                penalty_until: None,
                blocked_until: None,
            }),
        }
    }

    /// Take one token, sleeping as long as necessary.
    ///
    /// The lock is never held across a sleep; contending callers re-check
    /// after waking.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.try_take(&mut state, Instant::now())
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Take a token if one is available; otherwise return how long to wait
    fn try_take(&self, state: &mut BucketState, now: Instant) -> Option<Duration> {
        if let Some(until) = state.blocked_until {
            if now < until {
                return Some(until - now);
            }
            state.blocked_until = None;
        }
        let rate = self.effective_qps_locked(state, now);
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(rate);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / rate))
        }
    }

    fn effective_qps_locked(&self, state: &mut BucketState, now: Instant) -> f64 {
        match state.penalty_until {
            Some(until) if now < until => (self.qps / 2.0).max(1.0),
            Some(_) => {
                state.penalty_until = None;
                self.qps
            }
            None => self.qps,
        }
    }

    /// Enter penalty mode after a quota breach
    pub fn penalize(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.penalty_until = Some(now + PENALTY);
        if let Some(after) = retry_after {
            state.blocked_until = Some(now + after);
        }
        state.tokens = 0.0;
        warn!(
            "sheet rate limited; halving QPS for {:?}{}",
            PENALTY,
            retry_after
                .map(|d| format!(", blocked for {:?}", d))
                .unwrap_or_default()
        );
    }

    /// Effective QPS right now (for status reporting)
    pub fn current_qps(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        self.effective_qps_locked(&mut state, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits() {
        let bucket = TokenBucket::new(5);
        for _ in 0..5 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        bucket.acquire().await;
        // Sixth call needs one token refilled at 5/s: about 200ms
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_penalty_halves_qps() {
        let bucket = TokenBucket::new(10);
        assert_eq!(bucket.current_qps(), 10.0);
        bucket.penalize(None);
        assert_eq!(bucket.current_qps(), 5.0);
    }

    #[test]
    fn test_penalty_floor_is_one_qps() {
        let bucket = TokenBucket::new(1);
        bucket.penalize(None);
        assert_eq!(bucket.current_qps(), 1.0);
    }

    #[tokio::test]
    async fn test_retry_after_blocks() {
        let bucket = TokenBucket::new(100);
        bucket.penalize(Some(Duration::from_millis(150)));
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
