//! In-flight call accounting and graceful shutdown.
//!
//! Every call holds a [`CallPermit`] for as long as it is running. Shutdown
//! proceeds in phases:
//!
//! 1. refuse new calls with `UNAVAILABLE`,
//! 2. wait up to the configured timeout for in-flight calls to drain,
//! 3. cancel the shared [`CancellationToken`] so that drivers still pumping
//!    inbound streams deliver `UNAVAILABLE` and stop.

use crate::server::telemetry::{
    decrement_calls_inflight, increment_calls, increment_calls_inflight, record_call_duration,
};
use callscope_core::{Error, types::StreamShape};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Tracks running calls and coordinates their shutdown.
#[derive(Debug, Default)]
pub struct CallTracker {
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once shutdown has begun.
    pub fn begin(self: &Arc<Self>, shape: StreamShape) -> Result<CallPermit, Error> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if self.shutting_down.load(Ordering::Acquire) {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ServiceShutdown);
        }

        increment_calls(shape);
        increment_calls_inflight();
        Ok(CallPermit {
            tracker: Arc::clone(self),
            started: Instant::now(),
        })
    }

    /// Number of calls currently holding a permit.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Cancelled once the drain period of a shutdown has elapsed.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Refuses new calls, drains in-flight calls for up to `drain_timeout`,
    /// then cancels whatever is left.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        // === Phase 0: Stop accepting new calls ===
        tracing::info!("Refusing new calls");
        self.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight calls to drain ===
        tracing::info!("Draining in-flight calls ({} active)", self.inflight());
        let drained = timeout(drain_timeout, async {
            while self.inflight() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All in-flight calls drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} calls still active)",
                self.inflight()
            ),
        }

        // === Phase 2: Cancel remaining calls ===
        tracing::debug!("Cancelling remaining calls via shutdown token");
        self.shutdown_token.cancel();
    }
}

/// Marks one running call. Dropping it ends the call's accounting.
#[derive(Debug)]
#[must_use = "the call is accounted as finished when the permit is dropped"]
pub struct CallPermit {
    tracker: Arc<CallTracker>,
    started: Instant,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.tracker.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_calls_inflight();
        record_call_duration(self.started.elapsed().as_secs_f64() * 1_000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_track_inflight_calls() {
        let tracker = Arc::new(CallTracker::new());
        let first = tracker.begin(StreamShape::Unary).unwrap();
        let second = tracker.begin(StreamShape::Bidirectional).unwrap();
        assert_eq!(tracker.inflight(), 2);

        drop(first);
        assert_eq!(tracker.inflight(), 1);
        drop(second);
        assert_eq!(tracker.inflight(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_drain_then_cancels() {
        let tracker = Arc::new(CallTracker::new());
        let permit = tracker.begin(StreamShape::ClientStreaming).unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            drop(permit);
        });

        tracker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(tracker.inflight(), 0);
        assert!(tracker.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_timeout() {
        let tracker = Arc::new(CallTracker::new());
        let _stuck = tracker.begin(StreamShape::Bidirectional).unwrap();

        tracker.shutdown(Duration::from_millis(50)).await;

        assert_eq!(tracker.inflight(), 1);
        assert!(tracker.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn new_calls_are_refused_during_shutdown() {
        let tracker = Arc::new(CallTracker::new());
        tracker.shutdown(Duration::from_millis(10)).await;

        assert!(matches!(
            tracker.begin(StreamShape::Unary),
            Err(Error::ServiceShutdown)
        ));
        assert_eq!(tracker.inflight(), 0);
    }
}
