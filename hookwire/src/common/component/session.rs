// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bookkeeping for proxy sessions pairing one accepted connection with one backend connection
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::transport::{ArcConnection, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
  /// Accepted; the backend dial has not finished
  Connecting,
  Active,
  /// Teardown has begun; both sides are being closed
  Closing,
  /// Removed from the table; only observed through [SessionMap::state] returning it
  Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
  #[error("Backend dial to {target:?} failed: {reason}")]
  Failed { target: String, reason: String },
  #[error("Backend dial to {target:?} timed out after {timeout:?}")]
  Timeout { target: String, timeout: Duration },
  #[error("Backend dial was abandoned because the session closed")]
  Abandoned,
}

/// Resolves once the backend of a session is connected; cloned by every waiter
pub type SharedDial = Shared<BoxFuture<'static, Result<ArcConnection, DialError>>>;

struct Session {
  incoming: ArcConnection,
  outgoing: Option<ArcConnection>,
  dial: SharedDial,
  state: SessionState,
  token: CancellationToken,
}

/// Both sides of a session, handed to whoever wins the race to tear it down
pub(crate) struct ClosingSession {
  pub incoming: ArcConnection,
  pub outgoing: Option<ArcConnection>,
  pub token: CancellationToken,
}

#[derive(Default)]
pub struct SessionMap {
  sessions: DashMap<ConnectionId, Session>,
}

impl SessionMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn open(
    &self,
    id: ConnectionId,
    incoming: ArcConnection,
    dial: SharedDial,
    token: CancellationToken,
  ) {
    self.sessions.insert(
      id,
      Session {
        incoming,
        outgoing: None,
        dial,
        state: SessionState::Connecting,
        token,
      },
    );
  }

  /// Records the dialed backend; returns false if the session is already gone or closing
  pub(crate) fn activate(&self, id: ConnectionId, outgoing: ArcConnection) -> bool {
    match self.sessions.get_mut(&id) {
      Some(mut session) if session.state == SessionState::Connecting => {
        session.outgoing = Some(outgoing);
        session.state = SessionState::Active;
        true
      }
      _ => false,
    }
  }

  pub fn dial(&self, id: ConnectionId) -> Option<SharedDial> {
    self.sessions.get(&id).map(|session| session.dial.clone())
  }

  /// Marks the session closing; only the first caller receives its connections
  pub(crate) fn begin_close(&self, id: ConnectionId) -> Option<ClosingSession> {
    let mut session = self.sessions.get_mut(&id)?;
    if session.state == SessionState::Closing {
      return None;
    }
    session.state = SessionState::Closing;
    Some(ClosingSession {
      incoming: session.incoming.clone(),
      outgoing: session.outgoing.clone(),
      token: session.token.clone(),
    })
  }

  pub(crate) fn finish_close(&self, id: ConnectionId) -> bool {
    self.sessions.remove(&id).is_some()
  }

  /// `Closed` for ids that were never opened or have been fully torn down
  pub fn state(&self, id: ConnectionId) -> SessionState {
    self
      .sessions
      .get(&id)
      .map(|session| session.state)
      .unwrap_or(SessionState::Closed)
  }

  pub fn ids(&self) -> Vec<ConnectionId> {
    self.sessions.iter().map(|entry| *entry.key()).collect()
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}

impl std::fmt::Debug for SessionMap {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_map()
      .entries(
        self
          .sessions
          .iter()
          .map(|entry| (*entry.key(), entry.value().state)),
      )
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{DialError, SessionMap, SessionState};
  use crate::common::transport::{memory::link_pair, ConnectionId};
  use futures::FutureExt;
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn lifecycle_moves_forward_only() {
    let sessions = SessionMap::new();
    let id = ConnectionId::new(1);
    let (client, backend) = link_pair(id, "client", ConnectionId::new(2), "backend");
    let (dialed, dial) = futures::channel::oneshot::channel();
    let dial = async move { dial.await.unwrap_or(Err(DialError::Abandoned)) }
      .boxed()
      .shared();

    sessions.open(id, client.connection.clone(), dial, CancellationToken::new());
    assert_eq!(sessions.state(id), SessionState::Connecting);
    assert!(sessions.activate(id, backend.connection.clone()));
    assert_eq!(sessions.state(id), SessionState::Active);
    assert!(dialed.send(Ok(backend.connection.clone())).is_ok());
    let waiter = sessions.dial(id).unwrap();
    assert_eq!(waiter.await.unwrap().id(), ConnectionId::new(2));

    let closing = sessions.begin_close(id).unwrap();
    assert!(closing.outgoing.is_some());
    assert!(sessions.begin_close(id).is_none());
    // A late dial can no longer attach to a closing session
    assert!(!sessions.activate(id, backend.connection.clone()));
    assert!(sessions.finish_close(id));
    assert_eq!(sessions.state(id), SessionState::Closed);
    assert!(sessions.is_empty());
  }
}
