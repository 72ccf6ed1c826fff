//! Process-wide outbound rate limiting.
//!
//! A sliding log of the last `max_permits` issue instants: a new permit is
//! granted only once the oldest of them has left the rolling window, so no
//! window of length `period` ever contains more than `max_permits` grants,
//! however bursty the demand.
//!
//! Waiters queue on a tokio mutex, which hands out the lock in FIFO order;
//! the holder sleeps until its slot opens, so callers are admitted strictly
//! in arrival order.

use crate::cancel::CancelSignal;
use crate::error::AcquireCancelled;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Permission to make exactly one outbound call. Not cloneable; dropped
/// once the call completes.
#[derive(Debug)]
#[must_use = "a rate token authorizes exactly one outbound call"]
pub struct RateToken {
    issued_at: Instant,
    sequence: u64,
}

impl RateToken {
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Monotonic issue order across the limiter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug)]
struct Window {
    issued: VecDeque<Instant>,
    next_sequence: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
    max_permits: usize,
    period: Duration,
}

impl RateLimiter {
    pub fn new(max_permits: usize, period: Duration) -> Self {
        let max_permits = max_permits.max(1);
        Self {
            window: Mutex::new(Window {
                issued: VecDeque::with_capacity(max_permits),
                next_sequence: 0,
            }),
            max_permits,
            period,
        }
    }

    pub fn per_second(max_permits: usize) -> Self {
        Self::new(max_permits, Duration::from_secs(1))
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for a permit. If `cancel` fires first, no permit is issued.
    pub async fn acquire(&self, cancel: Option<&CancelSignal>) -> Result<RateToken, AcquireCancelled> {
        match cancel {
            Some(cancel) => {
                if cancel.is_cancelled() {
                    return Err(AcquireCancelled);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Rate permit wait cancelled");
                        Err(AcquireCancelled)
                    }
                    token = self.wait_for_slot() => Ok(token),
                }
            }
            None => Ok(self.wait_for_slot().await),
        }
    }

    async fn wait_for_slot(&self) -> RateToken {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = window.issued.front() {
                if now.saturating_duration_since(oldest) >= self.period {
                    window.issued.pop_front();
                } else {
                    break;
                }
            }

            if window.issued.len() < self.max_permits {
                window.issued.push_back(now);
                let sequence = window.next_sequence;
                window.next_sequence += 1;
                return RateToken {
                    issued_at: now,
                    sequence,
                };
            }

            if let Some(&oldest) = window.issued.front() {
                tokio::time::sleep_until(oldest + self.period).await;
            }
        }
    }

    /// Permits that could be granted right now without waiting.
    pub async fn available(&self) -> usize {
        let window = self.window.lock().await;
        let now = Instant::now();
        let live = window
            .issued
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.period)
            .count();
        self.max_permits - live
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_second(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    fn assert_window_respected(mut instants: Vec<Instant>, max: usize, period: Duration) {
        instants.sort();
        for pair in instants.windows(max + 1) {
            let span = pair[max].duration_since(pair[0]);
            assert!(
                span >= period,
                "{} permits issued within {:?}",
                max + 1,
                span
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_burst_is_immediate() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        for _ in 0..5 {
            let _ = limiter.acquire(None).await.unwrap();
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_twenty_acquisitions_are_throttled() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        let mut issued = Vec::new();

        for _ in 0..20 {
            issued.push(limiter.acquire(None).await.unwrap().issued_at());
        }

        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_window_respected(issued, 5, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::per_second(5));
        let mut handles = Vec::new();

        for _ in 0..40 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(None).await.unwrap().issued_at()
            }));
        }

        let mut issued = Vec::new();
        for handle in handles {
            issued.push(handle.await.unwrap());
        }
        assert_eq!(issued.len(), 40);
        assert_window_respected(issued, 5, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::per_second(1));
        let _first = limiter.acquire(None).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for caller in 0..5 {
            let limiter = Arc::clone(&limiter);
            let tx = tx.clone();
            tokio::spawn(async move {
                let token = limiter.acquire(None).await.unwrap();
                tx.send((caller, token.sequence())).unwrap();
            });
            // Let each caller enqueue before spawning the next.
            tokio::task::yield_now().await;
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some((caller, _)) = rx.recv().await {
            order.push(caller);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_issues_no_token() {
        let limiter = RateLimiter::per_second(1);
        let held = limiter.acquire(None).await.unwrap();

        let (handle, signal) = cancel_pair();
        let mut waiting = tokio_test::task::spawn(limiter.acquire(Some(&signal)));
        assert_pending!(waiting.poll());

        handle.cancel();
        assert!(waiting.is_woken());
        let result = assert_ready!(waiting.poll());
        assert_eq!(result.unwrap_err(), AcquireCancelled);
        drop(waiting);

        tokio::time::advance(Duration::from_secs(1)).await;
        let next = limiter.acquire(None).await.unwrap();
        assert_eq!(next.sequence(), held.sequence() + 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_signal_fails_fast() {
        let limiter = RateLimiter::per_second(5);
        let (handle, signal) = cancel_pair();
        handle.cancel();

        assert_eq!(
            limiter.acquire(Some(&signal)).await.unwrap_err(),
            AcquireCancelled
        );
        assert_eq!(limiter.available().await, 5);
    }
}
