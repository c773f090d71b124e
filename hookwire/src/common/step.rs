// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Declarative test steps and the chainable builder used to attach handlers to them
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use super::{
  component::{Component, ComponentError},
  error::{FailureKind, ResourceError},
  handler::{Handler, HandlerError},
  hook::{HookError, HookMode, HookPhase, HookSpec},
  matcher::{build_matcher, MatcherOptions, MessageTypeSpec, PayloadPredicate},
};
use crate::util::id::{numeric_id, IdGenerator};

numeric_id!(StepId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
  /// Performs an operation on a component when executed
  Action,
  /// Registers a listen-mode hook; nothing happens at execution time
  Hook,
  /// Registers a wait-mode hook and blocks execution until it settles
  Wait,
}

impl From<HookMode> for StepMode {
  fn from(mode: HookMode) -> Self {
    match mode {
      HookMode::Listen => StepMode::Hook,
      HookMode::Wait => StepMode::Wait,
    }
  }
}

/// Free-form details attached to a step's result
pub type StepMetadata = BTreeMap<String, Value>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
  pub kind: FailureKind,
  pub message: String,
  /// Full error chain when one is available
  pub detail: Option<String>,
}

impl StepFailure {
  pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      detail: None,
    }
  }

  pub fn unhandled(error: anyhow::Error) -> Self {
    Self {
      kind: FailureKind::Unhandled,
      message: error.to_string(),
      detail: Some(format!("{:?}", error)),
    }
  }

  pub fn timeout(timeout: Duration) -> Self {
    Self::new(
      FailureKind::Timeout,
      format!("Step timed out after {:?}", timeout),
    )
  }
}

impl From<HookError> for StepFailure {
  fn from(e: HookError) -> Self {
    Self::new(e.failure_kind(), e.to_string())
  }
}

impl From<HandlerError> for StepFailure {
  fn from(e: HandlerError) -> Self {
    let detail = format!("{:?}", e);
    Self {
      detail: Some(detail),
      ..Self::from(HookError::from(e))
    }
  }
}

impl From<ResourceError> for StepFailure {
  fn from(e: ResourceError) -> Self {
    Self::new(FailureKind::Resource, e.to_string())
  }
}

impl From<ComponentError> for StepFailure {
  fn from(e: ComponentError) -> Self {
    match e {
      ComponentError::Resource(e) => e.into(),
      ComponentError::Hook(e) => e.into(),
      ComponentError::Transport { .. } => Self {
        kind: FailureKind::Unhandled,
        message: e.to_string(),
        detail: Some(format!("{:?}", e)),
      },
    }
  }
}

pub type ActionFuture = BoxFuture<'static, Result<StepMetadata, StepFailure>>;

/// Executes an action step against its resolved component and the step's handlers
pub type ActionFn = Box<dyn FnOnce(Arc<Component>, Arc<[Handler]>) -> ActionFuture + Send>;

/// The generic form every authoring helper reduces to
pub enum StepDescriptor {
  Action {
    component: String,
    step_type: String,
    description: String,
    action: ActionFn,
  },
  Hook {
    component: String,
    step_type: String,
    description: String,
    mode: HookMode,
    message_type: MessageTypeSpec,
  },
}

pub(crate) enum StepBody {
  /// Taken exactly once, when the step executes
  Action(Option<ActionFn>),
  Hook {
    message_type: MessageTypeSpec,
    payload: Option<PayloadPredicate>,
  },
}

pub struct Step {
  pub(crate) id: StepId,
  pub(crate) component: String,
  pub(crate) step_type: String,
  pub(crate) description: String,
  pub(crate) mode: StepMode,
  pub(crate) handlers: Vec<Handler>,
  pub(crate) timeout: Option<Duration>,
  pub(crate) body: StepBody,
  /// Set when the builder was handed something unusable; the step fails instead of running
  pub(crate) invalid: Option<String>,
}

impl Step {
  pub(crate) fn new(descriptor: StepDescriptor, ids: &dyn IdGenerator) -> Self {
    let id = StepId::generate(ids);
    match descriptor {
      StepDescriptor::Action {
        component,
        step_type,
        description,
        action,
      } => Step {
        id,
        component,
        step_type,
        description,
        mode: StepMode::Action,
        handlers: Vec::new(),
        timeout: None,
        body: StepBody::Action(Some(action)),
        invalid: None,
      },
      StepDescriptor::Hook {
        component,
        step_type,
        description,
        mode,
        message_type,
      } => Step {
        id,
        component,
        step_type,
        description,
        mode: mode.into(),
        handlers: Vec::new(),
        timeout: None,
        body: StepBody::Hook {
          message_type,
          payload: None,
        },
        invalid: None,
      },
    }
  }

  pub fn id(&self) -> StepId {
    self.id
  }

  pub fn component(&self) -> &str {
    &self.component
  }

  pub fn step_type(&self) -> &str {
    &self.step_type
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn mode(&self) -> StepMode {
    self.mode
  }

  pub fn handlers(&self) -> &[Handler] {
    &self.handlers
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  pub(crate) fn validate(&self) -> Result<(), StepFailure> {
    match &self.invalid {
      Some(reason) => Err(StepFailure::new(FailureKind::Resource, reason.clone())),
      None => Ok(()),
    }
  }

  /// The hook this step registers, if it is a hook- or wait-mode step
  pub(crate) fn hook_spec(&self, phase: HookPhase, templated: bool) -> Option<HookSpec> {
    if self.invalid.is_some() {
      return None;
    }
    let (message_type, payload) = match &self.body {
      StepBody::Hook {
        message_type,
        payload,
      } => (message_type.clone(), payload.clone()),
      StepBody::Action(_) => return None,
    };
    let mode = match self.mode {
      StepMode::Wait => HookMode::Wait,
      _ => HookMode::Listen,
    };
    Some(HookSpec {
      step: Some(self.id),
      description: self.description.clone(),
      phase,
      mode,
      matcher: build_matcher(message_type, MatcherOptions { payload, templated }),
      handlers: Arc::from(self.handlers.clone()),
    })
  }

  pub(crate) fn take_action(&mut self) -> Option<ActionFn> {
    match &mut self.body {
      StepBody::Action(action) => action.take(),
      StepBody::Hook { .. } => None,
    }
  }
}

impl std::fmt::Debug for Step {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(Step))
      .field("id", &self.id)
      .field("component", &self.component)
      .field("step_type", &self.step_type)
      .field("description", &self.description)
      .field("mode", &self.mode)
      .field("handlers", &self.handlers)
      .field("timeout", &self.timeout)
      .finish_non_exhaustive()
  }
}

/// Chainable view over a just-registered step; every call appends to its handler list in order
pub struct StepBuilder<'a> {
  step: &'a mut Step,
}

impl<'a> StepBuilder<'a> {
  pub(crate) fn new(step: &'a mut Step) -> Self {
    Self { step }
  }

  pub fn id(&self) -> StepId {
    self.step.id
  }

  pub fn description(self, description: impl Into<String>) -> Self {
    self.step.description = description.into();
    self
  }

  /// Limits how long the step may run; for wait steps this replaces the scenario default
  pub fn timeout(self, timeout: Duration) -> Self {
    self.step.timeout = Some(timeout);
    self
  }

  /// Narrows a hook's match to messages whose payload satisfies `predicate`
  pub fn matching<F>(self, predicate: F) -> Self
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    self.try_matching(move |p| Ok(predicate(p)))
  }

  /// Like [StepBuilder::matching]; an `Err` from `predicate` counts as no match
  pub fn try_matching<F>(self, predicate: F) -> Self
  where
    F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
  {
    match &mut self.step.body {
      StepBody::Hook { payload, .. } => *payload = Some(Arc::new(predicate)),
      StepBody::Action(_) => {
        tracing::warn!(step = ?self.step.id, "Payload matchers only apply to hook steps")
      }
    }
    self
  }

  /// Appends any handler, including fallible variants built with [Handler]'s constructors
  pub fn handler(self, handler: Handler) -> Self {
    self.step.handlers.push(handler);
    self
  }

  pub fn assert<F>(self, description: impl Into<String>, predicate: F) -> Self
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    self.handler(Handler::assert(description, move |p| Ok(predicate(p))))
  }

  /// An assertion whose `Err` fails the step with the error attached as its cause
  pub fn try_assert<F>(self, description: impl Into<String>, predicate: F) -> Self
  where
    F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
  {
    self.handler(Handler::assert(description, predicate))
  }

  pub fn transform<F>(self, transform: F) -> Self
  where
    F: Fn(Value) -> Value + Send + Sync + 'static,
  {
    self.handler(Handler::transform(move |p| Ok(transform(p))))
  }

  pub fn drop(self) -> Self {
    self.handler(Handler::Drop)
  }

  pub fn mock_response<F>(self, build: F) -> Self
  where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
  {
    self.handler(Handler::mock_response(move |p| Ok(build(p))))
  }

  pub fn mock_event<F>(self, message_type: impl Into<String>, build: F) -> Self
  where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
  {
    match Handler::mock_event(message_type, move |p| Ok(build(p))) {
      Ok(handler) => self.handler(handler),
      Err(e) => {
        tracing::warn!(step = ?self.step.id, error = %e, "Invalid mockEvent handler");
        self
          .step
          .invalid
          .get_or_insert_with(|| format!("Invalid mockEvent handler: {}", e));
        self
      }
    }
  }

  pub fn proxy<F>(self, transform: F) -> Self
  where
    F: Fn(Value) -> Value + Send + Sync + 'static,
  {
    self.handler(Handler::proxy(move |p| Ok(transform(p))))
  }

  pub fn delay(self, duration: Duration) -> Self {
    self.handler(Handler::delay(duration))
  }
}
