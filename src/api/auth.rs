//! Process-wide credential state.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Authentication state as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
  Anonymous,
  Authenticated(String),
  /// The server rejected the credential; the login collaborator should
  /// prompt for a new one.
  Expired,
}

/// Shared bearer credential.
///
/// The login/logout collaborator owns persistence of the token; this type
/// only holds it for the current process and publishes changes to
/// subscribers.
#[derive(Clone)]
pub struct AuthState {
  session: Arc<watch::Sender<Session>>,
}

impl AuthState {
  pub fn new() -> Self {
    let (session, _) = watch::channel(Session::Anonymous);
    Self {
      session: Arc::new(session),
    }
  }

  pub fn with_token(token: impl Into<String>) -> Self {
    let state = Self::new();
    state.set(token);
    state
  }

  pub fn set(&self, token: impl Into<String>) {
    self.session.send_replace(Session::Authenticated(token.into()));
    info!("credential set");
  }

  pub fn clear(&self) {
    self.session.send_replace(Session::Anonymous);
    info!("credential cleared");
  }

  /// Drop the credential and signal that the session expired.
  pub fn expire(&self) {
    if matches!(*self.session.borrow(), Session::Authenticated(_)) {
      warn!("session expired, clearing credential");
    }
    self.session.send_replace(Session::Expired);
  }

  pub fn token(&self) -> Option<String> {
    match &*self.session.borrow() {
      Session::Authenticated(token) => Some(token.clone()),
      _ => None,
    }
  }

  pub fn session(&self) -> Session {
    self.session.borrow().clone()
  }

  /// Watch session changes, e.g. to react to expiry.
  pub fn subscribe(&self) -> watch::Receiver<Session> {
    self.session.subscribe()
  }
}

impl Default for AuthState {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_lifecycle() {
    let auth = AuthState::new();
    assert_eq!(auth.token(), None);

    auth.set("abc");
    assert_eq!(auth.token().as_deref(), Some("abc"));

    auth.clear();
    assert_eq!(auth.session(), Session::Anonymous);
  }

  #[tokio::test]
  async fn test_expiry_is_published() {
    let auth = AuthState::with_token("abc");
    let mut changes = auth.subscribe();

    auth.expire();

    changes.changed().await.unwrap();
    assert_eq!(*changes.borrow(), Session::Expired);
    assert_eq!(auth.token(), None);
  }
}
