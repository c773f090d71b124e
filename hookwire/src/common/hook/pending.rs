// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A one-shot promise with separate resolve and reject entry points
//!
//! The [Resolver] half lives in the hook registry, the [PendingResolution] half with the
//! step that waits on it. Timeouts, disconnects, and scope teardown all settle the same
//! promise; whichever comes first wins and later attempts are no-ops.
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::HookError;
use crate::common::message::Message;

type Settlement = Result<Message, HookError>;

pub fn pending(cancellation: CancellationToken) -> (Resolver, PendingResolution) {
  let (sender, receiver) = oneshot::channel();
  (
    Resolver {
      sender: Some(sender),
    },
    PendingResolution {
      receiver,
      cancellation,
    },
  )
}

#[derive(Debug)]
pub struct Resolver {
  sender: Option<oneshot::Sender<Settlement>>,
}

impl Resolver {
  /// Returns `false` if the promise was already settled
  pub fn resolve(&mut self, message: Message) -> bool {
    self.settle(Ok(message))
  }

  /// Returns `false` if the promise was already settled
  pub fn reject(&mut self, error: HookError) -> bool {
    self.settle(Err(error))
  }

  pub fn is_settled(&self) -> bool {
    self.sender.is_none()
  }

  fn settle(&mut self, settlement: Settlement) -> bool {
    match self.sender.take() {
      Some(sender) => {
        // The waiting side may have given up already; that still counts as settled
        let _ = sender.send(settlement);
        true
      }
      None => false,
    }
  }
}

#[derive(Debug)]
pub struct PendingResolution {
  receiver: oneshot::Receiver<Settlement>,
  cancellation: CancellationToken,
}

impl PendingResolution {
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancellation
  }

  /// Suspends until the promise settles, is cancelled, or `timeout` elapses
  ///
  /// A settlement that is already available wins over an expired timer.
  pub async fn wait(self, timeout: Duration) -> Result<Message, HookError> {
    let Self {
      receiver,
      cancellation,
    } = self;
    tokio::select! {
      biased;
      settled = receiver => settled.unwrap_or(Err(HookError::Cancelled)),
      _ = cancellation.cancelled() => Err(HookError::Cancelled),
      _ = tokio::time::sleep(timeout) => Err(HookError::Timeout(timeout)),
    }
  }
}
