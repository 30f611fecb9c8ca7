//! Token-bucket rate limiting
//!
//! Tokens are never refilled by a timer; every operation recomputes the
//! current count from elapsed wall-clock time before acting. A bucket with
//! capacity `C` and window `W` refills one token every `W / C`.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of a bucket
#[derive(Debug, Clone, Copy)]
pub struct BucketSnapshot {
    /// Tokens currently available
    pub tokens: u32,
    /// Maximum tokens the bucket holds
    pub capacity: u32,
    /// When the next token becomes available, if below capacity
    pub next_available: Option<Instant>,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// A single token bucket
///
/// All operations serialize on an internal mutex; none of them await
/// while holding it.
pub struct TokenBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket allowing `max_calls` per `window`, starting full
    pub fn new(max_calls: u32, window: Duration) -> Self {
        let capacity = max_calls.max(1);
        let refill_interval = (window / capacity).max(Duration::from_millis(1));
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Recompute tokens from elapsed time. `last_refill` advances by whole
    /// intervals so the fractional remainder keeps accruing; a full bucket
    /// re-anchors to now so idle time is not banked.
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        if state.tokens >= self.capacity {
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u64;
        if intervals == 0 {
            return;
        }
        let refilled = intervals.min(u64::from(self.capacity - state.tokens)) as u32;
        state.tokens += refilled;
        if state.tokens >= self.capacity {
            state.last_refill = now;
        } else {
            state.last_refill += self.refill_interval * (intervals as u32);
        }
    }

    fn wait_until_locked(&self, state: &BucketState, n: u32) -> Duration {
        if state.tokens >= n {
            return Duration::ZERO;
        }
        let deficit = n - state.tokens;
        let target = state.last_refill + self.refill_interval * deficit;
        target.saturating_duration_since(Instant::now())
    }

    /// Current tokens, capacity, and next token arrival
    pub fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.state.lock().expect("bucket state poisoned");
        self.refill(&mut state);
        let next_available = if state.tokens < self.capacity {
            Some(state.last_refill + self.refill_interval)
        } else {
            None
        };
        BucketSnapshot {
            tokens: state.tokens,
            capacity: self.capacity,
            next_available,
        }
    }

    /// Time until `n` tokens are available (zero if they already are)
    pub fn wait_time(&self, n: u32) -> Duration {
        let mut state = self.state.lock().expect("bucket state poisoned");
        self.refill(&mut state);
        self.wait_until_locked(&state, n)
    }

    /// Atomically consume `n` tokens; fails without side effects if
    /// insufficient
    pub fn try_consume(&self, n: u32) -> bool {
        let mut state = self.state.lock().expect("bucket state poisoned");
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens can be consumed, or until cancelled.
    ///
    /// Returns `true` when the tokens were acquired, `false` on
    /// cancellation.
    pub async fn wait_and_consume(&self, n: u32, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket state poisoned");
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return true;
                }
                self.wait_until_locked(&state, n)
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_consume_decrements_by_exactly_one() {
        let bucket = TokenBucket::new(5, Duration::from_secs(5));
        assert_eq!(bucket.snapshot().tokens, 5);
        assert!(bucket.try_consume(1));
        assert_eq!(bucket.snapshot().tokens, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_by_elapsed_time() {
        let bucket = TokenBucket::new(4, Duration::from_secs(4));
        assert!(bucket.try_consume(4));
        assert_eq!(bucket.snapshot().tokens, 0);

        // One token per second; 2.5s elapsed yields exactly 2
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(bucket.snapshot().tokens, 2);

        // Remainder keeps accruing: 0.5s more completes the third interval
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(bucket.snapshot().tokens, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        assert!(bucket.try_consume(1));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.snapshot().tokens, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_for_nth_token() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        assert!(bucket.try_consume(2));
        // 500ms per token
        let wait = bucket.wait_time(1);
        assert_eq!(wait, Duration::from_millis(500));
        let wait = bucket.wait_time(2);
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_consume_acquires_after_refill() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        assert!(bucket.try_consume(2));

        let start = Instant::now();
        let cancel = CancellationToken::new();
        assert!(bucket.wait_and_consume(1, &cancel).await);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_consume_observes_cancellation() {
        let bucket = TokenBucket::new(1, Duration::from_secs(3600));
        assert!(bucket.try_consume(1));

        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            async move { bucket.wait_and_consume(1, &cancel).await }
        };
        let handle = tokio::spawn(waiter);
        tokio::time::advance(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(!handle.await.unwrap());
    }
}
