use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

/// Counts scheduling work that has been enqueued but not yet finished.
///
/// The engine bumps the count from post-commit hooks, so aborted transactions never
/// move it. Cloning shares the counter.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
  count: Arc<watch::Sender<usize>>,
}

impl Default for InFlightTracker {
  fn default() -> Self {
    Self::new()
  }
}

impl InFlightTracker {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(0);
    Self { count: Arc::new(tx) }
  }

  pub fn in_flight(&self) -> usize {
    *self.count.borrow()
  }

  pub fn enqueued(&self) {
    self.count.send_modify(|count| *count += 1);
    trace!(in_flight = self.in_flight(), "Work enqueued.");
  }

  pub fn dequeued(&self) {
    self.count.send_modify(|count| *count = count.saturating_sub(1));
    trace!(in_flight = self.in_flight(), "Work dequeued.");
  }

  /// Resolves once no work is in flight.
  pub async fn wait_idle(&self) {
    let mut rx = self.count.subscribe();
    // The sender lives in `self`, so the channel cannot close while we wait.
    if rx.wait_for(|count| *count == 0).await.is_err() {
      trace!("In-flight channel closed while waiting for idle.");
    }
  }

  /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
  /// Returns `true` if the tracker went idle in time.
  pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn idle_fires_when_count_returns_to_zero() {
    let tracker = InFlightTracker::new();
    tracker.wait_idle().await;

    tracker.enqueued();
    tracker.enqueued();
    assert!(!tracker.wait_idle_timeout(Duration::from_millis(20)).await);

    let waiter = {
      let tracker = tracker.clone();
      tokio::spawn(async move { tracker.wait_idle().await })
    };
    tracker.dequeued();
    tracker.dequeued();
    waiter.await.unwrap();
    assert_eq!(tracker.in_flight(), 0);
  }

  #[test]
  fn dequeue_never_underflows() {
    let tracker = InFlightTracker::new();
    tracker.dequeued();
    assert_eq!(tracker.in_flight(), 0);
  }
}
