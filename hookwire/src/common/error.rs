// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

use super::hook::HookId;

/// Classification of a failure as seen by reporters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
  /// A predicate inside an `assert` handler was false or errored
  Assertion,
  Timeout,
  /// Raised by a transform/mock/proxy handler or by a transport
  Unhandled,
  /// Programming error in the test definition or harness wiring
  Resource,
  Disconnected,
}

impl FailureKind {
  /// Assertion failures mean the system under test misbehaved; everything else means the
  /// test itself could not run to completion
  pub fn is_broken(&self) -> bool {
    !matches!(self, FailureKind::Assertion)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
  #[error("No component named {0:?} is part of this scenario")]
  ComponentNotFound(String),
  #[error("A component named {0:?} was already added")]
  DuplicateComponent(String),
  #[error("Component {0:?} has not been started")]
  NotStarted(String),
  #[error("Component {0:?} was already started")]
  AlreadyStarted(String),
  #[error("Component {component:?} cannot {operation} in its configured role")]
  UnsupportedRole {
    component: String,
    operation: &'static str,
  },
  #[error("Hook {0:?} does not exist")]
  HookNotFound(HookId),
}
