//! Semantic error taxonomy and the transport failure classifier.

use std::fmt;
use thiserror::Error;

use crate::api::transport::TransportFailure;

/// Closed set of error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Network,
  Unauthorized,
  Forbidden,
  NotFound,
  Conflict,
  Validation,
  RateLimited,
  ServerError,
  Unknown,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Network => "NETWORK",
      ErrorKind::Unauthorized => "UNAUTHORIZED",
      ErrorKind::Forbidden => "FORBIDDEN",
      ErrorKind::NotFound => "NOT_FOUND",
      ErrorKind::Conflict => "CONFLICT",
      ErrorKind::Validation => "VALIDATION",
      ErrorKind::RateLimited => "RATE_LIMITED",
      ErrorKind::ServerError => "SERVER_ERROR",
      ErrorKind::Unknown => "UNKNOWN",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A classified failure. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ErrorInfo {
  pub kind: ErrorKind,
  pub http_status: Option<u16>,
  pub message: String,
  pub retryable: bool,
  /// Application error code from the response body, if the server sent one
  pub code: Option<String>,
}

impl ErrorInfo {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      http_status: None,
      message: message.into(),
      retryable: default_retryable(kind),
      code: None,
    }
  }

  /// Notification text for this error.
  pub fn user_message(&self) -> String {
    match self.kind {
      ErrorKind::Network => {
        "Unable to connect to LivReplenish servers. Please check your internet connection.".into()
      }
      ErrorKind::Unauthorized => {
        "Your session has expired. Please log in again to continue your wellness journey.".into()
      }
      ErrorKind::Forbidden => "You do not have permission to perform this action.".into(),
      ErrorKind::NotFound => "The requested ritual or resource was not found.".into(),
      ErrorKind::Validation => {
        if self.message.is_empty() {
          "Please check your input and try again.".into()
        } else {
          self.message.clone()
        }
      }
      ErrorKind::RateLimited => "Too many requests. Please wait a moment before trying again.".into(),
      ErrorKind::ServerError => {
        "Our servers are experiencing issues. Please try again in a few moments.".into()
      }
      ErrorKind::Conflict | ErrorKind::Unknown => {
        if self.message.is_empty() {
          "Something went wrong. Please try again.".into()
        } else {
          self.message.clone()
        }
      }
    }
  }
}

fn default_retryable(kind: ErrorKind) -> bool {
  matches!(
    kind,
    ErrorKind::Network | ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::Unknown
  )
}

fn kind_for_status(status: u16) -> ErrorKind {
  match status {
    400 | 422 => ErrorKind::Validation,
    401 => ErrorKind::Unauthorized,
    403 => ErrorKind::Forbidden,
    404 => ErrorKind::NotFound,
    409 => ErrorKind::Conflict,
    429 => ErrorKind::RateLimited,
    s if s >= 500 => ErrorKind::ServerError,
    _ => ErrorKind::Unknown,
  }
}

/// Map a transport failure to exactly one [`ErrorInfo`].
pub fn classify(failure: &TransportFailure) -> ErrorInfo {
  match failure {
    TransportFailure::Network { message } => ErrorInfo::new(ErrorKind::Network, message.clone()),
    TransportFailure::Http {
      status,
      message,
      code,
    } => {
      let kind = kind_for_status(*status);
      ErrorInfo {
        kind,
        http_status: Some(*status),
        message: message.clone(),
        retryable: default_retryable(kind),
        code: code.clone(),
      }
    }
    TransportFailure::Parse { message } => ErrorInfo::new(ErrorKind::Unknown, message.clone()),
    TransportFailure::Request { message } => ErrorInfo {
      retryable: false,
      ..ErrorInfo::new(ErrorKind::Unknown, message.clone())
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn http(status: u16) -> TransportFailure {
    TransportFailure::Http {
      status,
      message: format!("HTTP {}", status),
      code: None,
    }
  }

  #[test]
  fn test_status_table() {
    let cases = [
      (400, ErrorKind::Validation, false),
      (401, ErrorKind::Unauthorized, false),
      (403, ErrorKind::Forbidden, false),
      (404, ErrorKind::NotFound, false),
      (409, ErrorKind::Conflict, false),
      (422, ErrorKind::Validation, false),
      (429, ErrorKind::RateLimited, true),
      (500, ErrorKind::ServerError, true),
      (503, ErrorKind::ServerError, true),
      (418, ErrorKind::Unknown, true),
    ];

    for (status, kind, retryable) in cases {
      let info = classify(&http(status));
      assert_eq!(info.kind, kind, "status {}", status);
      assert_eq!(info.retryable, retryable, "status {}", status);
      assert_eq!(info.http_status, Some(status));
    }
  }

  #[test]
  fn test_network_is_retryable() {
    let info = classify(&TransportFailure::Network {
      message: "connection refused".into(),
    });
    assert_eq!(info.kind, ErrorKind::Network);
    assert!(info.retryable);
    assert_eq!(info.http_status, None);
  }

  #[test]
  fn test_parse_failure_is_unknown() {
    let info = classify(&TransportFailure::Parse {
      message: "expected value".into(),
    });
    assert_eq!(info.kind, ErrorKind::Unknown);
    assert!(info.retryable);
  }

  #[test]
  fn test_malformed_request_is_not_retried() {
    let info = classify(&TransportFailure::Request {
      message: "invalid request URL".into(),
    });
    assert_eq!(info.kind, ErrorKind::Unknown);
    assert!(!info.retryable);
    assert!(!crate::cache::RetryPolicy::queries().should_retry(&info, 1));
  }

  #[test]
  fn test_body_code_is_kept() {
    let info = classify(&TransportFailure::Http {
      status: 409,
      message: "Ritual already completed".into(),
      code: Some("RITUAL_ALREADY_COMPLETED".into()),
    });
    assert_eq!(info.code.as_deref(), Some("RITUAL_ALREADY_COMPLETED"));
    assert_eq!(info.user_message(), "Ritual already completed");
  }
}
