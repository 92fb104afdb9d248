use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

/// Tunables for the scheduling work queue.
///
/// All fields have defaults, so a partial document (e.g. only `attendee_refresh_batch`)
/// deserializes into a complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
  /// Delay before an organizer change (or one of its sends) becomes eligible.
  pub request_delay_seconds: f64,
  /// Delay before an attendee reply becomes eligible.
  pub reply_delay_seconds: f64,
  /// Delay before an auto-reply becomes eligible.
  pub auto_reply_delay_seconds: f64,
  /// Maximum number of attendees refreshed per batch.
  pub attendee_refresh_batch: usize,
  /// Delay between a refresh trigger and its first batch.
  pub attendee_refresh_batch_delay_seconds: f64,
  /// Delay between consecutive refresh batches.
  pub attendee_refresh_batch_interval_seconds: f64,
  /// Number of all-pending attempts tolerated before recipients are marked unavailable.
  pub max_temporary_failures: u32,
  /// Retry delay after an all-pending delivery attempt.
  pub temporary_failure_delay_seconds: f64,
  /// Spacing between the Organizer-Send items produced from one organizer change.
  pub stagger_seconds: f64,
}

impl Default for WorkQueueConfig {
  fn default() -> Self {
    Self {
      request_delay_seconds: 0.1,
      reply_delay_seconds: 1.0,
      auto_reply_delay_seconds: 5.0,
      attendee_refresh_batch: 5,
      attendee_refresh_batch_delay_seconds: 5.0,
      attendee_refresh_batch_interval_seconds: 5.0,
      max_temporary_failures: 3,
      temporary_failure_delay_seconds: 60.0,
      stagger_seconds: 1.0,
    }
  }
}

impl WorkQueueConfig {
  /// Parses a configuration from a JSON document, filling unspecified fields with defaults.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// A configuration with every delay set to zero. Useful for embedding in tests.
  pub fn immediate() -> Self {
    Self {
      request_delay_seconds: 0.0,
      reply_delay_seconds: 0.0,
      auto_reply_delay_seconds: 0.0,
      attendee_refresh_batch_delay_seconds: 0.0,
      attendee_refresh_batch_interval_seconds: 0.0,
      temporary_failure_delay_seconds: 0.0,
      stagger_seconds: 0.0,
      ..Self::default()
    }
  }

  pub fn request_delay(&self) -> ChronoDuration {
    seconds(self.request_delay_seconds)
  }

  pub fn reply_delay(&self) -> ChronoDuration {
    seconds(self.reply_delay_seconds)
  }

  pub fn auto_reply_delay(&self) -> ChronoDuration {
    seconds(self.auto_reply_delay_seconds)
  }

  pub fn refresh_batch_delay(&self) -> ChronoDuration {
    seconds(self.attendee_refresh_batch_delay_seconds)
  }

  pub fn refresh_batch_interval(&self) -> ChronoDuration {
    seconds(self.attendee_refresh_batch_interval_seconds)
  }

  /// Batch size, never less than one so that a drain always makes progress.
  pub fn refresh_batch_size(&self) -> usize {
    self.attendee_refresh_batch.max(1)
  }

  /// Stagger offset for the `index`-th send of an organizer change.
  pub fn stagger(&self, index: usize) -> ChronoDuration {
    seconds(self.stagger_seconds * index as f64)
  }

  /// Retry delay carried by `WorkError::Temporary`.
  pub fn temporary_failure_delay(&self) -> Duration {
    Duration::from_secs_f64(self.temporary_failure_delay_seconds.max(0.0))
  }
}

fn seconds(value: f64) -> ChronoDuration {
  // Negative or NaN delays collapse to zero.
  let millis = if value.is_finite() && value > 0.0 {
    (value * 1000.0).round() as i64
  } else {
    0
  };
  ChronoDuration::milliseconds(millis)
}
