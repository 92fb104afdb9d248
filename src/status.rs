//! iTIP request-status codes as reported per recipient by the delivery layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The message is queued for delivery but not yet delivered.
pub const MESSAGE_PENDING_CODE: &str = "1.0";
/// The message was sent but delivery is unconfirmed.
pub const MESSAGE_SENT_CODE: &str = "1.1";
/// The message was delivered.
pub const MESSAGE_DELIVERED_CODE: &str = "1.2";
/// The recipient's service is unavailable; no further retries will happen.
pub const SERVICE_UNAVAILABLE_CODE: &str = "5.1";

/// A parsed `REQUEST-STATUS` value, `"N.M;description"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestStatus {
  code: String,
  description: Option<String>,
}

impl RequestStatus {
  pub fn new(code: impl Into<String>, description: Option<String>) -> Self {
    Self {
      code: code.into(),
      description,
    }
  }

  pub fn pending() -> Self {
    Self::new(MESSAGE_PENDING_CODE, Some("Scheduling message is pending".to_string()))
  }

  pub fn sent() -> Self {
    Self::new(MESSAGE_SENT_CODE, Some("Scheduling message has been sent".to_string()))
  }

  pub fn delivered() -> Self {
    Self::new(MESSAGE_DELIVERED_CODE, Some("Delivered".to_string()))
  }

  pub fn service_unavailable() -> Self {
    Self::new(SERVICE_UNAVAILABLE_CODE, Some("Service unavailable".to_string()))
  }

  /// The `N.M` part.
  pub fn code(&self) -> &str {
    &self.code
  }

  pub fn description(&self) -> Option<&str> {
    self.description.as_deref()
  }

  pub fn is_delivered(&self) -> bool {
    self.code == MESSAGE_DELIVERED_CODE
  }

  pub fn is_pending(&self) -> bool {
    self.code == MESSAGE_PENDING_CODE
  }
}

impl FromStr for RequestStatus {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (code, description) = match s.split_once(';') {
      Some((code, rest)) => (code, Some(rest.trim().to_string()).filter(|d| !d.is_empty())),
      None => (s, None),
    };
    Ok(Self::new(code.trim(), description))
  }
}

impl fmt::Display for RequestStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.description {
      Some(description) => write!(f, "{};{}", self.code, description),
      None => f.write_str(&self.code),
    }
  }
}

/// Returns only the `N.M` code of a raw request-status string.
pub fn status_code(raw: &str) -> &str {
  raw.split(';').next().unwrap_or(raw).trim()
}
