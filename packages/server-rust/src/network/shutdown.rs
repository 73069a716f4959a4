//! Graceful shutdown: health state machine, in-flight tracking, and a
//! bounded drain.
//!
//! Connection tasks subscribe to the shutdown signal and hold an RAII
//! guard per request; shutdown flips the state to `Draining`, signals
//! every subscriber, and waits for the guards to drop before the process
//! tears down sockets and the write queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state of the server.
///
/// Transitions: `Starting -> Ready -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Initializing; the listener is not accepting yet.
    Starting,
    /// Accepting and serving.
    Ready,
    /// Shutdown signalled; no new connections, in-flight work finishing.
    Draining,
    /// Fully stopped.
    Stopped,
}

/// Coordinates graceful shutdown across the accept loop and connection
/// tasks.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Marks the server ready to serve.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> HealthState {
        **self.state.load()
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self.state(), HealthState::Draining | HealthState::Stopped)
    }

    /// A receiver that flips to `true` when shutdown begins.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every subscriber.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        // Receivers may already be gone; that is fine.
        let _ = self.signal.send(true);
    }

    /// RAII guard tracking one in-flight request; the counter decrements
    /// on drop even if the handler panics.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current in-flight request count.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until the in-flight count reaches zero, up to `timeout`.
    /// Returns `true` (and moves to `Stopped`) on a clean drain.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), HealthState::Starting);
        assert!(!controller.is_draining());

        controller.set_ready();
        assert_eq!(controller.state(), HealthState::Ready);

        controller.begin_drain();
        assert_eq!(controller.state(), HealthState::Draining);
        assert!(controller.is_draining());
    }

    #[test]
    fn guards_track_in_flight_work() {
        let controller = ShutdownController::new();
        let g1 = controller.guard();
        let g2 = controller.guard();
        assert_eq!(controller.in_flight(), 2);
        drop(g1);
        assert_eq!(controller.in_flight(), 1);
        drop(g2);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn subscribers_are_woken() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        assert!(!*rx.borrow());
        controller.begin_drain();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_succeeds_when_guards_release() {
        let controller = Arc::new(ShutdownController::new());
        let guard = controller.guard();
        controller.begin_drain();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_held_guard() {
        let controller = ShutdownController::new();
        let _guard = controller.guard();
        controller.begin_drain();
        assert!(!controller.wait_for_drain(Duration::from_millis(40)).await);
        assert_eq!(controller.state(), HealthState::Draining);
    }
}
