//! Group limiter implementation.

use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::events::AdmissionEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[cfg(feature = "metrics")]
use metrics::counter;
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

/// Per-tenant admission controller: at most `max_concurrent` requests run at
/// once, at most `max_queue` wait for a slot, and no request waits longer
/// than `queue_timeout`.
///
/// The two bounds are enforced by two semaphores: a queue seat must be taken
/// (without blocking) before a request may wait on a concurrency slot. The
/// seat is returned on every exit from [`acquire`](Self::acquire); the slot
/// is returned when the granted [`AdmissionPermit`] is dropped.
#[derive(Debug)]
pub struct GroupLimiter {
    slots: Arc<Semaphore>,
    seats: Option<Arc<Semaphore>>,
    config: Arc<AdmissionConfig>,
}

impl GroupLimiter {
    /// Creates a new limiter from a finished configuration.
    pub(crate) fn new(config: AdmissionConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        let seats = match config.max_queue {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            slots,
            seats,
            config: Arc::new(config),
        }
    }

    /// Creates a new builder for configuring a limiter.
    pub fn builder() -> crate::config::AdmissionConfigBuilder {
        #[cfg(feature = "metrics")]
        {
            METRICS_INIT.call_once(|| {
                metrics::describe_counter!(
                    "admission_slots_acquired_total",
                    "Total number of requests granted a concurrency slot"
                );
                metrics::describe_counter!(
                    "admission_rejections_total",
                    "Total number of requests rejected by admission control"
                );
            });
        }
        crate::config::AdmissionConfigBuilder::new()
    }

    /// Acquires one concurrency slot, queueing if permitted.
    ///
    /// With queueing enabled, the call first takes a queue seat without
    /// blocking (no seat → [`AdmissionError::QueueFull`]) and then waits up
    /// to the configured queue timeout for a slot
    /// (→ [`AdmissionError::QueueTimeout`]). With queueing disabled, the
    /// call never waits: either a slot is free right now or it fails with
    /// `QueueFull`.
    ///
    /// Cancellation is dropping the returned future; the queue seat and any
    /// partially acquired state are released on that path as well. The
    /// granted slot frees when the returned [`AdmissionPermit`] is dropped.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        let start = Instant::now();

        let seat = match &self.seats {
            Some(seats) => match Arc::clone(seats).try_acquire_owned() {
                Ok(seat) => seat,
                Err(_) => return Err(self.reject()),
            },
            None => {
                // Queueing disabled: grant or reject without waiting.
                return match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(slot) => Ok(self.grant(slot, start)),
                    Err(_) => Err(self.reject()),
                };
            }
        };

        match tokio::time::timeout(
            self.config.queue_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => {
                drop(seat);
                Ok(self.grant(slot, start))
            }
            Ok(Err(_)) => {
                // The semaphore is never closed; treated as capacity exhausted.
                drop(seat);
                Err(self.reject())
            }
            Err(_) => {
                drop(seat);
                let waited = start.elapsed();
                self.config
                    .event_listeners
                    .emit(&AdmissionEvent::QueueTimedOut {
                        group: self.config.name.clone(),
                        timestamp: Instant::now(),
                        waited,
                    });

                #[cfg(feature = "metrics")]
                counter!(
                    "admission_rejections_total",
                    "group" => self.config.name.clone(),
                    "reason" => "queue_timeout"
                )
                .increment(1);

                Err(AdmissionError::QueueTimeout {
                    timeout: self.config.queue_timeout,
                })
            }
        }
    }

    fn grant(&self, slot: OwnedSemaphorePermit, start: Instant) -> AdmissionPermit {
        let in_flight = self.config.max_concurrent - self.slots.available_permits();
        self.config
            .event_listeners
            .emit(&AdmissionEvent::SlotAcquired {
                group: self.config.name.clone(),
                timestamp: Instant::now(),
                in_flight,
                waited: start.elapsed(),
            });

        #[cfg(feature = "metrics")]
        counter!(
            "admission_slots_acquired_total",
            "group" => self.config.name.clone()
        )
        .increment(1);

        AdmissionPermit {
            _slot: slot,
            config: Arc::clone(&self.config),
            acquired_at: Instant::now(),
        }
    }

    fn reject(&self) -> AdmissionError {
        self.config
            .event_listeners
            .emit(&AdmissionEvent::QueueRejected {
                group: self.config.name.clone(),
                timestamp: Instant::now(),
                max_queue: self.config.max_queue,
            });

        #[cfg(feature = "metrics")]
        counter!(
            "admission_rejections_total",
            "group" => self.config.name.clone(),
            "reason" => "queue_full"
        )
        .increment(1);

        AdmissionError::QueueFull {
            max_queue: self.config.max_queue,
        }
    }

    /// Number of concurrency slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Number of queue seats currently free; `None` when queueing is disabled.
    pub fn available_seats(&self) -> Option<usize> {
        self.seats.as_ref().map(|s| s.available_permits())
    }

    /// The configured concurrency cap.
    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// The tenant group this limiter guards.
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// A granted concurrency slot. Dropping it returns the slot.
///
/// Holding the permit for the full life of the request (including response
/// streaming) is what keeps a tenant's in-flight count accurate; there is no
/// separate release call to forget.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    config: Arc<AdmissionConfig>,
    acquired_at: Instant,
}

impl AdmissionPermit {
    /// How long this slot has been held.
    pub fn held(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.config
            .event_listeners
            .emit(&AdmissionEvent::SlotReleased {
                group: self.config.name.clone(),
                timestamp: Instant::now(),
                held: self.acquired_at.elapsed(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdmissionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[tokio::test]
    async fn grants_up_to_max_concurrent() {
        let limiter = AdmissionConfig::builder().max_concurrent(2).build();

        let first = limiter.acquire().await;
        let second = limiter.acquire().await;
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(limiter.available_slots(), 0);
    }

    #[tokio::test]
    async fn rejects_immediately_when_queueing_disabled() {
        let limiter = AdmissionConfig::builder()
            .max_concurrent(1)
            .max_queue(0)
            .build();

        let held = limiter.acquire().await.unwrap();
        let start = Instant::now();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { max_queue: 0 }));
        assert!(start.elapsed() < Duration::from_millis(50));
        drop(held);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full() {
        let limiter = Arc::new(
            AdmissionConfig::builder()
                .max_concurrent(1)
                .max_queue(1)
                .queue_timeout(Duration::from_secs(5))
                .build(),
        );

        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };

        // Let the waiter take the single queue seat.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.available_seats(), Some(0));

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { max_queue: 1 }));

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn times_out_in_queue() {
        let limiter = AdmissionConfig::builder()
            .max_concurrent(1)
            .max_queue(5)
            .queue_timeout(Duration::from_millis(50))
            .build();

        let held = limiter.acquire().await.unwrap();

        let start = Instant::now();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
        // The queue seat was returned on the timeout path.
        assert_eq!(limiter.available_seats(), Some(5));
        drop(held);
    }

    #[tokio::test]
    async fn cancelled_waiters_release_their_queue_seat() {
        let limiter = Arc::new(
            AdmissionConfig::builder()
                .max_concurrent(1)
                .max_queue(1)
                .queue_timeout(Duration::from_secs(5))
                .build(),
        );

        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _ = limiter.acquire().await;
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.available_seats(), Some(0));

        // The client hanging up drops the acquire future mid-wait.
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(limiter.available_seats(), Some(1));
        assert_eq!(limiter.available_slots(), 0);
        drop(held);
        assert_eq!(limiter.available_slots(), 1);
    }

    #[tokio::test]
    async fn dropping_the_permit_frees_the_slot() {
        let limiter = AdmissionConfig::builder().max_concurrent(1).build();

        let permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_slots(), 0);
        drop(permit);
        assert_eq!(limiter.available_slots(), 1);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_cap_under_a_storm() {
        let limiter = Arc::new(
            AdmissionConfig::builder()
                .max_concurrent(5)
                .max_queue(50)
                .queue_timeout(Duration::from_secs(10))
                .build(),
        );
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(limiter.available_slots(), 5);
    }

    #[tokio::test]
    async fn emits_events_for_each_outcome() {
        let acquired = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&acquired);
        let r = Arc::clone(&rejected);
        let f = Arc::clone(&released);

        let limiter = AdmissionConfig::builder()
            .max_concurrent(1)
            .name("tenant-a")
            .on_slot_acquired(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_queue_rejected(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .on_slot_released(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let permit = limiter.acquire().await.unwrap();
        let _ = limiter.acquire().await.unwrap_err();
        drop(permit);

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_max_concurrent_is_coerced_to_one() {
        let limiter = AdmissionConfig::builder().max_concurrent(0).build();
        assert_eq!(limiter.max_concurrent(), 1);
        assert!(limiter.acquire().await.is_ok());
    }
}
