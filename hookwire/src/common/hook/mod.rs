// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-component registry of listeners matching inbound messages
//!
//! Hooks are kept in a flat, registration-ordered list and referenced by [HookId]; steps
//! refer to their hook by id and hooks to their step by [StepId], so neither owns the other.
use serde::{Deserialize, Serialize};
use std::{
  collections::BTreeMap,
  sync::{Arc, Mutex},
  time::Duration,
};
use tokio_util::sync::CancellationToken;

use super::{
  error::{FailureKind, ResourceError},
  handler::{Handler, HandlerError},
  matcher::Matcher,
  message::Message,
  step::StepId,
};
use crate::util::id::{numeric_id, IdGenerator};

pub mod pending;

use pending::{PendingResolution, Resolver};

numeric_id!(HookId);

/// Lifetime scope of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
  /// Registered during scenario initialisation; survives test-case boundaries
  Init,
  /// Removed at the end of the test case that registered it
  Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
  /// Fires on every match until its scope ends
  Listen,
  /// Consumed by its first match, settling a pending promise
  Wait,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
  #[error("Assertion failed: {0}")]
  AssertionFailed(String),
  #[error("Timed out after {0:?} waiting for a matching message")]
  Timeout(Duration),
  #[error("Component disconnected before a matching message arrived")]
  Disconnected,
  #[error("Handler failed: {0}")]
  Handler(String),
  #[error("Wait was cancelled")]
  Cancelled,
}

impl HookError {
  pub fn failure_kind(&self) -> FailureKind {
    match self {
      HookError::AssertionFailed(_) => FailureKind::Assertion,
      HookError::Timeout(_) => FailureKind::Timeout,
      HookError::Disconnected => FailureKind::Disconnected,
      HookError::Handler(_) | HookError::Cancelled => FailureKind::Unhandled,
    }
  }
}

impl From<HandlerError> for HookError {
  fn from(e: HandlerError) -> Self {
    match e {
      HandlerError::AssertionFailed { description, .. } => HookError::AssertionFailed(description),
      unhandled @ HandlerError::Unhandled { .. } => HookError::Handler(unhandled.to_string()),
    }
  }
}

/// Everything needed to register a hook; produced from a hook- or wait-mode step
#[derive(Debug, Clone)]
pub struct HookSpec {
  pub step: Option<StepId>,
  pub description: String,
  pub phase: HookPhase,
  pub mode: HookMode,
  pub matcher: Matcher,
  pub handlers: Arc<[Handler]>,
}

#[derive(Debug)]
struct Hook {
  id: HookId,
  step: Option<StepId>,
  description: String,
  phase: HookPhase,
  mode: HookMode,
  matcher: Matcher,
  handlers: Arc<[Handler]>,
  resolver: Option<Resolver>,
  resolved: bool,
  matches: u64,
}

impl Hook {
  fn persistent(&self) -> bool {
    self.phase == HookPhase::Init
  }

  fn is_matchable(&self) -> bool {
    !(self.resolved && (self.mode == HookMode::Wait || !self.persistent()))
  }

  fn summary(&self) -> HookSummary {
    HookSummary {
      id: self.id,
      step: self.step,
      description: self.description.clone(),
      phase: self.phase,
      mode: self.mode,
      resolved: self.resolved,
      matches: self.matches,
    }
  }
}

/// Read-only view of a registered hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookSummary {
  pub id: HookId,
  pub step: Option<StepId>,
  pub description: String,
  pub phase: HookPhase,
  pub mode: HookMode,
  pub resolved: bool,
  pub matches: u64,
}

/// A hook claimed for one specific message
#[derive(Debug, Clone)]
pub struct HookMatch {
  pub hook: HookId,
  pub step: Option<StepId>,
  pub mode: HookMode,
  pub handlers: Arc<[Handler]>,
  /// Route captures when the hook was registered against a path template
  pub params: Option<BTreeMap<String, String>>,
}

#[derive(Debug)]
pub struct RegisteredHook {
  pub id: HookId,
  /// Present for wait-mode hooks; allocated before registration returns so that a message
  /// arriving before anyone waits still settles it
  pub pending: Option<PendingResolution>,
}

pub struct HookRegistry {
  component: String,
  ids: Arc<dyn IdGenerator>,
  // Never held while user code runs; claiming and settling are each one short section
  hooks: Mutex<Vec<Hook>>,
  cancellation: CancellationToken,
}

impl HookRegistry {
  pub fn new(component: impl Into<String>, ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      component: component.into(),
      ids,
      hooks: Mutex::new(Vec::new()),
      cancellation: CancellationToken::new(),
    }
  }

  pub fn component(&self) -> &str {
    &self.component
  }

  /// Never fails; wait-mode hooks come back with their pending promise already allocated
  pub fn register_hook(&self, spec: HookSpec) -> RegisteredHook {
    let id = HookId::generate(self.ids.as_ref());
    let (resolver, pending) = match spec.mode {
      HookMode::Wait => {
        let (resolver, pending) = pending::pending(self.cancellation.child_token());
        (Some(resolver), Some(pending))
      }
      HookMode::Listen => (None, None),
    };
    tracing::debug!(
      component = %self.component,
      hook = ?id,
      phase = ?spec.phase,
      mode = ?spec.mode,
      matcher = ?spec.matcher,
      "Registering hook"
    );
    self.lock().push(Hook {
      id,
      step: spec.step,
      description: spec.description,
      phase: spec.phase,
      mode: spec.mode,
      matcher: spec.matcher,
      handlers: spec.handlers,
      resolver,
      resolved: false,
      matches: 0,
    });
    RegisteredHook { id, pending }
  }

  /// Claims the first matchable hook, in registration order, whose matcher accepts `message`
  ///
  /// Matchers run user predicates, so they are evaluated against a snapshot taken outside
  /// the lock. Claiming then re-checks the hook under the lock; a wait-mode hook is marked
  /// resolved in that same critical section, so two concurrent messages can never both
  /// consume it, and the loser moves on to the next candidate.
  pub fn find_matching_hook(&self, message: &Message) -> Option<HookMatch> {
    let candidates: Vec<(HookId, Matcher)> = self
      .lock()
      .iter()
      .filter(|hook| hook.is_matchable())
      .map(|hook| (hook.id, hook.matcher.clone()))
      .collect();
    candidates
      .into_iter()
      .filter(|(_, matcher)| matcher.matches(message))
      .find_map(|(id, matcher)| self.claim(id, matcher.route_params(message)))
  }

  fn claim(&self, id: HookId, params: Option<BTreeMap<String, String>>) -> Option<HookMatch> {
    let mut hooks = self.lock();
    let hook = hooks
      .iter_mut()
      .find(|hook| hook.id == id && hook.is_matchable())?;
    hook.matches += 1;
    if hook.mode == HookMode::Wait {
      hook.resolved = true;
    }
    Some(HookMatch {
      hook: hook.id,
      step: hook.step,
      mode: hook.mode,
      handlers: Arc::clone(&hook.handlers),
      params,
    })
  }

  /// Fulfils a wait hook's promise; a no-op returning `false` once already settled
  pub fn resolve_hook(&self, id: HookId, message: Message) -> bool {
    self.settle(id, |resolver| resolver.resolve(message))
  }

  /// Rejects a wait hook's promise; a no-op returning `false` once already settled
  pub fn reject_hook(&self, id: HookId, error: HookError) -> bool {
    self.settle(id, |resolver| resolver.reject(error))
  }

  fn settle(&self, id: HookId, action: impl FnOnce(&mut Resolver) -> bool) -> bool {
    let mut hooks = self.lock();
    match hooks.iter_mut().find(|hook| hook.id == id) {
      Some(hook) => {
        hook.resolved = true;
        hook.resolver.as_mut().map_or(false, action)
      }
      None => false,
    }
  }

  /// Rejects every unsettled wait hook, returning how many were rejected
  pub fn reject_pending(&self, error: HookError) -> usize {
    let mut hooks = self.lock();
    let mut rejected = 0;
    for hook in hooks.iter_mut() {
      if let Some(resolver) = hook.resolver.as_mut() {
        if resolver.reject(error.clone()) {
          hook.resolved = true;
          rejected += 1;
        }
      }
    }
    if rejected > 0 {
      tracing::debug!(component = %self.component, rejected, error = %error, "Rejected pending hooks");
    }
    rejected
  }

  pub fn remove_hook(&self, id: HookId) -> bool {
    let mut hooks = self.lock();
    let before = hooks.len();
    hooks.retain(|hook| hook.id != id);
    hooks.len() != before
  }

  /// Looks up a hook that must exist
  pub fn hook(&self, id: HookId) -> Result<HookSummary, ResourceError> {
    self
      .lock()
      .iter()
      .find(|hook| hook.id == id)
      .map(Hook::summary)
      .ok_or(ResourceError::HookNotFound(id))
  }

  pub fn hooks(&self) -> Vec<HookSummary> {
    self.lock().iter().map(Hook::summary).collect()
  }

  /// Drops every test-phase hook; init-phase hooks survive. Returns how many were removed.
  ///
  /// Unsettled promises of removed hooks observe [HookError::Cancelled].
  pub fn clear_test_case_hooks(&self) -> usize {
    let mut hooks = self.lock();
    let before = hooks.len();
    hooks.retain(|hook| hook.persistent());
    before - hooks.len()
  }

  pub fn clear_hooks(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Hook>> {
    self.hooks.lock().expect("Mutex poisoned")
  }
}

impl Drop for HookRegistry {
  fn drop(&mut self) {
    self.cancellation.cancel();
  }
}

impl std::fmt::Debug for HookRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HookRegistry")
      .field("component", &self.component)
      .field("hooks", &self.len())
      .finish_non_exhaustive()
  }
}
