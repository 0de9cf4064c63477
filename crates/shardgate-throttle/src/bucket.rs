//! Token bucket implementation.

use crate::config::ThrottleConfig;
use crate::events::ThrottleEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[cfg(feature = "metrics")]
use metrics::counter;
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

/// Mutable bucket state, guarded by one mutex.
///
/// `rate == None` is the unlimited initial state; [`slow_down`] is the only
/// transition, and there is no way back.
///
/// [`slow_down`]: TokenBucket::slow_down
#[derive(Debug)]
struct BucketState {
    /// Tokens per second; `None` means unlimited.
    rate: Option<f64>,
    /// Bucket capacity.
    burst: f64,
    /// Current token balance.
    tokens: f64,
    /// Last refill time.
    last_refill: Instant,
    slowed: bool,
}

impl BucketState {
    /// Refills by elapsed time and tries to take one token.
    /// Returns `None` on success (or unlimited), otherwise the time until a
    /// full token accrues.
    fn try_take(&mut self, now: Instant) -> Option<Duration> {
        let Some(rate) = self.rate else {
            return None;
        };

        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / rate))
        }
    }
}

/// Per-replica rate gate: a token bucket that starts unlimited and can be
/// switched once to a configured slow rate when the backend signals
/// overload.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    config: Arc<ThrottleConfig>,
}

impl TokenBucket {
    /// Creates a new bucket from a finished configuration.
    ///
    /// Initial state: unlimited rate, burst of one.
    pub(crate) fn new(config: ThrottleConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                rate: None,
                burst: 1.0,
                tokens: 1.0,
                last_refill: Instant::now(),
                slowed: false,
            })),
            config: Arc::new(config),
        }
    }

    /// Creates a new builder for configuring a bucket.
    pub fn builder() -> crate::config::ThrottleConfigBuilder {
        #[cfg(feature = "metrics")]
        {
            METRICS_INIT.call_once(|| {
                metrics::describe_counter!(
                    "throttle_slowdowns_total",
                    "Total number of replica slow-down transitions"
                );
                metrics::describe_counter!(
                    "throttle_delayed_total",
                    "Total number of acquisitions that had to wait for a token"
                );
            });
        }
        crate::config::ThrottleConfigBuilder::new()
    }

    /// Waits until a token is available.
    ///
    /// Returns immediately while the bucket is unlimited. Once slowed, the
    /// call refills the bucket by elapsed time, debits a token if one is
    /// available, and otherwise sleeps until one accrues. The debit happens
    /// in the same locked section that grants it, so dropping the future
    /// mid-wait never leaks a token.
    pub async fn acquire(&self) {
        let mut delayed = false;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                match state.try_take(Instant::now()) {
                    None => return,
                    Some(wait) => wait,
                }
            };

            if !delayed {
                delayed = true;
                self.config
                    .event_listeners
                    .emit(&ThrottleEvent::AcquireDelayed {
                        name: self.config.name.clone(),
                        timestamp: std::time::Instant::now(),
                        wait,
                    });

                #[cfg(feature = "metrics")]
                counter!(
                    "throttle_delayed_total",
                    "replica" => self.config.name.clone()
                )
                .increment(1);
            }

            sleep(wait).await;
        }
    }

    /// Switches the bucket to the configured slow rate and burst.
    ///
    /// Idempotent: only the first call has any effect, and only the first
    /// call emits [`ThrottleEvent::SlowdownEngaged`]. The accrued token
    /// balance carries over capped at the new burst, so the request that
    /// triggered the transition does not stall the very next one.
    pub fn slow_down(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.slowed {
                return;
            }
            state.tokens = state.tokens.min(self.config.slow_burst as f64);
            state.last_refill = Instant::now();
            state.rate = Some(self.config.slow_rate);
            state.burst = self.config.slow_burst as f64;
            state.slowed = true;
        }

        self.config
            .event_listeners
            .emit(&ThrottleEvent::SlowdownEngaged {
                name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                rate: self.config.slow_rate,
                burst: self.config.slow_burst,
            });

        #[cfg(feature = "metrics")]
        counter!(
            "throttle_slowdowns_total",
            "replica" => self.config.name.clone()
        )
        .increment(1);
    }

    /// Whether the one-shot slow-down has happened.
    pub fn is_slowed(&self) -> bool {
        self.state.lock().unwrap().slowed
    }

    /// The rate currently in effect, in tokens per second; `None` while
    /// unlimited.
    pub fn rate(&self) -> Option<f64> {
        self.state.lock().unwrap().rate
    }

    /// The burst currently in effect.
    pub fn burst(&self) -> usize {
        self.state.lock().unwrap().burst as usize
    }

    /// The replica this bucket throttles.
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThrottleConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unlimited_acquires_immediately() {
        let bucket = ThrottleConfig::builder().build();
        let start = std::time::Instant::now();
        for _ in 0..100 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!bucket.is_slowed());
        assert_eq!(bucket.rate(), None);
    }

    #[tokio::test]
    async fn slow_down_switches_rate_and_burst() {
        let bucket = ThrottleConfig::builder()
            .slow_rate(2.0)
            .slow_burst(3)
            .build();

        bucket.slow_down();

        assert!(bucket.is_slowed());
        assert_eq!(bucket.rate(), Some(2.0));
        assert_eq!(bucket.burst(), 3);
    }

    #[tokio::test]
    async fn slow_down_is_idempotent() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&transitions);

        let bucket = ThrottleConfig::builder()
            .slow_rate(5.0)
            .name("replica-a")
            .on_slowdown(move |_, _| {
                t.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        bucket.slow_down();
        bucket.slow_down();
        bucket.slow_down();

        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        assert_eq!(bucket.rate(), Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_after_slow_down_passes_immediately() {
        let bucket = ThrottleConfig::builder()
            .slow_rate(1.0)
            .slow_burst(1)
            .build();

        bucket.slow_down();

        // The balance carried over from the unlimited phase covers this one.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));

        // The next one paces at the slow rate.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn slowed_acquires_pace_at_the_configured_rate() {
        let bucket = ThrottleConfig::builder()
            .slow_rate(10.0)
            .slow_burst(1)
            .build();

        bucket.slow_down();

        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        // One free token, then four waits of ~100ms each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(395), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(450), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_event_fires_once_per_waiting_acquire() {
        let delays = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&delays);

        let bucket = ThrottleConfig::builder()
            .slow_rate(10.0)
            .slow_burst(1)
            .on_delayed(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        bucket.slow_down();

        bucket.acquire().await; // free
        bucket.acquire().await; // waits
        bucket.acquire().await; // waits

        assert_eq!(delays.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn degenerate_configuration_is_coerced() {
        let bucket = ThrottleConfig::builder()
            .slow_rate(0.0)
            .slow_burst(0)
            .build();
        bucket.slow_down();
        assert_eq!(bucket.rate(), Some(1.0));
        assert_eq!(bucket.burst(), 1);
    }
}
