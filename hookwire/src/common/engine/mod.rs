// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Scenario runner
//!
//! Each test case runs in three passes: its body registers steps, hook- and wait-mode steps
//! register their hooks, then steps execute in order. Hooks therefore exist before any action
//! can produce the traffic they are waiting for.
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::{
  future::Future,
  panic::AssertUnwindSafe,
  sync::Arc,
  time::{Duration, Instant},
};
use tracing_futures::Instrument;

use super::{
  component::Component,
  error::{FailureKind, ResourceError},
  handler::{execute_handlers, Handler, PipelineOutcome},
  hook::{pending::PendingResolution, HookError, HookId, HookMode, HookPhase},
  matcher::MessageTypeSpec,
  message::Message,
  step::{
    ActionFuture, Step, StepBuilder, StepDescriptor, StepFailure, StepMetadata, StepMode,
  },
};
use crate::util::id::{IdGenerator, MonotonicAtomicGenerator};

pub mod report;

use report::{Reporter, ScenarioResult, Status, StepResult, TestCaseResult};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

const INIT_CASE: &str = "init";

/// Collects the steps of one test case (or of scenario initialisation)
pub struct TestContext {
  phase: HookPhase,
  ids: Arc<dyn IdGenerator>,
  steps: Vec<Step>,
}

impl TestContext {
  fn new(phase: HookPhase, ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      phase,
      ids,
      steps: Vec::new(),
    }
  }

  pub fn phase(&self) -> HookPhase {
    self.phase
  }

  pub fn steps(&self) -> &[Step] {
    &self.steps
  }

  pub fn register_step(&mut self, descriptor: StepDescriptor) -> StepBuilder<'_> {
    let step = Step::new(descriptor, self.ids.as_ref());
    self.steps.push(step);
    let last = self.steps.len() - 1;
    StepBuilder::new(&mut self.steps[last])
  }

  fn action<F>(
    &mut self,
    component: &str,
    step_type: &str,
    description: String,
    action: F,
  ) -> StepBuilder<'_>
  where
    F: FnOnce(Arc<Component>, Arc<[Handler]>) -> ActionFuture + Send + 'static,
  {
    self.register_step(StepDescriptor::Action {
      component: component.to_owned(),
      step_type: step_type.to_owned(),
      description,
      action: Box::new(action),
    })
  }

  /// Sends `message` from `component`; handlers on the step run against it first
  pub fn send(&mut self, component: &str, message: Message) -> StepBuilder<'_> {
    let description = format!("send {}", message.message_type);
    self.action(component, "send", description, move |component, handlers| {
      async move {
        let message = match execute_handlers(&handlers, &message).await? {
          PipelineOutcome::Forward(payload) => message.with_payload(payload),
          PipelineOutcome::Reply(replacement) => replacement,
          PipelineOutcome::Dropped => {
            return Ok(StepMetadata::from([("dropped".to_owned(), json!(true))]))
          }
        };
        let delivered = component.send(message).await?;
        Ok::<_, StepFailure>(StepMetadata::from([(
          "delivered".to_owned(),
          json!(delivered),
        )]))
      }
      .boxed()
    })
  }

  /// Issues a request from `component`; handlers on the step run against the response
  pub fn request(&mut self, component: &str, message: Message) -> StepBuilder<'_> {
    let description = format!("request {}", message.message_type);
    self.action(component, "request", description, move |component, handlers| {
      async move {
        let response = component.request(message).await?;
        execute_handlers(&handlers, &response).await?;
        Ok::<_, StepFailure>(StepMetadata::from([(
          "response".to_owned(),
          serde_json::to_value(&response).unwrap_or(Value::Null),
        )]))
      }
      .boxed()
    })
  }

  /// Closes a client component's connection
  pub fn disconnect(&mut self, component: &str) -> StepBuilder<'_> {
    self.action(
      component,
      "disconnect",
      "disconnect".to_owned(),
      |component, _| {
        async move {
          component.disconnect().await?;
          Ok::<_, StepFailure>(StepMetadata::new())
        }
        .boxed()
      },
    )
  }

  /// Runs arbitrary async code against a component
  pub fn run<F, Fut>(
    &mut self,
    component: &str,
    description: impl Into<String>,
    action: F,
  ) -> StepBuilder<'_>
  where
    F: FnOnce(Arc<Component>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.action(
      component,
      "action",
      description.into(),
      move |component, _| {
        async move {
          action(component).await.map_err(StepFailure::unhandled)?;
          Ok::<_, StepFailure>(StepMetadata::new())
        }
        .boxed()
      },
    )
  }

  /// Registers a listen-mode hook firing for every matching message in the case's scope
  pub fn on_message(
    &mut self,
    component: &str,
    message_type: impl Into<MessageTypeSpec>,
  ) -> StepBuilder<'_> {
    self.hook_step(component, "onMessage", HookMode::Listen, message_type.into())
  }

  /// Registers a wait-mode hook; execution blocks here until a matching message arrives
  pub fn wait_message(
    &mut self,
    component: &str,
    message_type: impl Into<MessageTypeSpec>,
  ) -> StepBuilder<'_> {
    self.hook_step(component, "waitMessage", HookMode::Wait, message_type.into())
  }

  fn hook_step(
    &mut self,
    component: &str,
    step_type: &str,
    mode: HookMode,
    message_type: MessageTypeSpec,
  ) -> StepBuilder<'_> {
    let description = match &message_type {
      MessageTypeSpec::Exact(name) => name.clone(),
      MessageTypeSpec::AnyOf(names) => names.join(" | "),
      MessageTypeSpec::Custom(_) => "custom matcher".to_owned(),
    };
    self.register_step(StepDescriptor::Hook {
      component: component.to_owned(),
      step_type: step_type.to_owned(),
      description,
      mode,
      message_type,
    })
  }

  fn into_steps(self) -> Vec<Step> {
    self.steps
  }
}

type CaseBody = Box<dyn FnOnce(&mut TestContext) + Send>;

struct TestCase {
  name: String,
  body: CaseBody,
}

pub struct Scenario {
  name: String,
  components: Vec<Arc<Component>>,
  init: Option<CaseBody>,
  cases: Vec<TestCase>,
  reporters: Vec<Arc<dyn Reporter>>,
  step_ids: Arc<dyn IdGenerator>,
  default_timeout: Duration,
  setup_errors: Vec<ResourceError>,
}

impl Scenario {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      components: Vec::new(),
      init: None,
      cases: Vec::new(),
      reporters: Vec::new(),
      step_ids: Arc::new(MonotonicAtomicGenerator::default()),
      default_timeout: DEFAULT_WAIT_TIMEOUT,
      setup_errors: Vec::new(),
    }
  }

  pub fn with_component(mut self, component: impl Into<Arc<Component>>) -> Self {
    let component = component.into();
    if self.component(component.name()).is_some() {
      self
        .setup_errors
        .push(ResourceError::DuplicateComponent(component.name().to_owned()));
    } else {
      self.components.push(component);
    }
    self
  }

  pub fn with_init(mut self, body: impl FnOnce(&mut TestContext) + Send + 'static) -> Self {
    self.init = Some(Box::new(body));
    self
  }

  pub fn with_test_case(
    mut self,
    name: impl Into<String>,
    body: impl FnOnce(&mut TestContext) + Send + 'static,
  ) -> Self {
    self.cases.push(TestCase {
      name: name.into(),
      body: Box::new(body),
    });
    self
  }

  pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
    self.reporters.push(reporter);
    self
  }

  /// Applies to wait steps without an explicit timeout
  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout;
    self
  }

  pub fn with_step_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
    self.step_ids = ids;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn component(&self, name: &str) -> Option<&Arc<Component>> {
    self.components.iter().find(|c| c.name() == name)
  }

  /// Starts every component, runs initialisation and each test case, then stops everything
  ///
  /// Teardown happens on every path, including a component failing to start.
  pub async fn run(self) -> ScenarioResult {
    let Scenario {
      name,
      components,
      init,
      cases,
      reporters,
      step_ids,
      default_timeout,
      setup_errors,
    } = self;
    let runner = Runner {
      scenario: name,
      components,
      reporters,
      step_ids,
      default_timeout,
    };
    let span = tracing::info_span!("scenario", name = %runner.scenario);
    runner.run(init, cases, setup_errors).instrument(span).await
  }
}

impl std::fmt::Debug for Scenario {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(Scenario))
      .field("name", &self.name)
      .field("components", &self.components)
      .field("cases", &self.cases.iter().map(|c| &c.name).collect::<Vec<_>>())
      .field("default_timeout", &self.default_timeout)
      .finish_non_exhaustive()
  }
}

struct Runner {
  scenario: String,
  components: Vec<Arc<Component>>,
  reporters: Vec<Arc<dyn Reporter>>,
  step_ids: Arc<dyn IdGenerator>,
  default_timeout: Duration,
}

/// A step bound to its component, with the hook it registered if any
struct Planned {
  step: Step,
  component: Option<Arc<Component>>,
  hook: Option<HookId>,
  pending: Option<PendingResolution>,
}

impl Runner {
  async fn run(
    &self,
    init: Option<CaseBody>,
    cases: Vec<TestCase>,
    setup_errors: Vec<ResourceError>,
  ) -> ScenarioResult {
    let started = Instant::now();
    let mut result = ScenarioResult::new(self.scenario.clone());
    if let Some(error) = setup_errors.first() {
      result.break_with(error.to_string());
    } else {
      match self.start_components().await {
        Err(error) => result.break_with(error),
        Ok(()) => {
          let init = match init {
            Some(body) => {
              let case = self.run_case(INIT_CASE, HookPhase::Init, body).await;
              let passed = case.passed;
              result.init = Some(case);
              passed
            }
            None => true,
          };
          for case in cases {
            if init {
              let case = self.run_case(&case.name, HookPhase::Test, case.body).await;
              result.test_cases.push(case);
            } else {
              let mut skipped = TestCaseResult::new(case.name);
              skipped.skip("Scenario initialisation did not pass");
              self.report_case(&skipped);
              result.test_cases.push(skipped);
            }
          }
        }
      }
    }
    self.stop_components().await;
    result.settle();
    result.duration = started.elapsed();
    for reporter in self.reporters.iter() {
      reporter.on_scenario(&result);
    }
    result
  }

  async fn start_components(&self) -> Result<(), String> {
    for component in self.components.iter() {
      if let Err(error) = component.start().await {
        tracing::error!(component = %component.name(), %error, "Component failed to start");
        return Err(format!("Component {:?} failed to start: {}", component.name(), error));
      }
    }
    Ok(())
  }

  async fn stop_components(&self) {
    for component in self.components.iter().rev() {
      component.stop().await;
    }
  }

  fn component(&self, name: &str) -> Option<&Arc<Component>> {
    self.components.iter().find(|c| c.name() == name)
  }

  async fn run_case(&self, name: &str, phase: HookPhase, body: CaseBody) -> TestCaseResult {
    let span = tracing::info_span!("test_case", name);
    self.run_case_inner(name, phase, body).instrument(span).await
  }

  async fn run_case_inner(&self, name: &str, phase: HookPhase, body: CaseBody) -> TestCaseResult {
    let started = Instant::now();
    let mut case = TestCaseResult::new(name);
    for component in self.components.iter() {
      let stale = component.take_failures();
      if !stale.is_empty() {
        tracing::debug!(component = %component.name(), count = stale.len(), "Discarding failures from outside any test case");
      }
    }

    let mut context = TestContext::new(phase, Arc::clone(&self.step_ids));
    body(&mut context);
    let mut planned = self.register_hooks(context.into_steps(), phase);
    let mut results: Vec<StepResult> = planned.iter().map(|p| pending_result(&p.step)).collect();

    let mut halted = false;
    for (planned, result) in planned.iter_mut().zip(results.iter_mut()) {
      if halted {
        result.skip();
        continue;
      }
      let started = Instant::now();
      let outcome = self.execute(planned).await;
      result.duration = started.elapsed();
      if let Err(failure) = &outcome {
        case.fail(failure);
        halted = true;
      }
      result.set_outcome(outcome);
    }

    // Listen hooks report how often they fired; failures they raised land on their step
    for (planned, result) in planned.iter().zip(results.iter_mut()) {
      if let (Some(component), Some(hook)) = (&planned.component, planned.hook) {
        if let Ok(summary) = component.hooks().hook(hook) {
          result.metadata.insert("matches".to_owned(), json!(summary.matches));
        }
      }
    }
    for component in self.components.iter() {
      for failure in component.take_failures() {
        let step_failure = StepFailure::new(failure.kind, failure.message.clone());
        case.fail(&step_failure);
        match results
          .iter_mut()
          .find(|result| Some(result.id) == failure.step)
        {
          Some(result) if result.passed => result.fail(step_failure),
          _ => {}
        }
      }
    }

    if phase == HookPhase::Test {
      for component in self.components.iter() {
        let removed = component.hooks().clear_test_case_hooks();
        tracing::trace!(component = %component.name(), removed, "Cleared test case hooks");
      }
    }
    case.steps = results;
    case.duration = started.elapsed();
    for result in case.steps.iter() {
      for reporter in self.reporters.iter() {
        reporter.on_step(&self.scenario, &case.name, result);
      }
    }
    self.report_case(&case);
    case
  }

  fn report_case(&self, case: &TestCaseResult) {
    for reporter in self.reporters.iter() {
      reporter.on_test_case(&self.scenario, case);
    }
  }

  fn register_hooks(&self, steps: Vec<Step>, phase: HookPhase) -> Vec<Planned> {
    steps
      .into_iter()
      .map(|step| {
        let component = self.component(&step.component).cloned();
        let registered = component.as_ref().and_then(|component| {
          step
            .hook_spec(phase, component.role().is_request_response())
            .map(|spec| component.register_hook(spec))
        });
        let (hook, pending) = match registered {
          Some(registered) => (Some(registered.id), registered.pending),
          None => (None, None),
        };
        Planned {
          step,
          component,
          hook,
          pending,
        }
      })
      .collect()
  }

  async fn execute(&self, planned: &mut Planned) -> Result<StepMetadata, StepFailure> {
    planned.step.validate()?;
    let component = match &planned.component {
      Some(component) => Arc::clone(component),
      None => {
        return Err(ResourceError::ComponentNotFound(planned.step.component.clone()).into())
      }
    };
    match planned.step.mode {
      StepMode::Hook => Ok(StepMetadata::new()),
      StepMode::Action => {
        let action = match planned.step.take_action() {
          Some(action) => action,
          None => return Err(StepFailure::new(FailureKind::Resource, "Step already executed")),
        };
        let handlers: Arc<[Handler]> = Arc::from(planned.step.handlers.clone());
        let action: BoxFuture<'static, _> = action(component, handlers);
        // A panic in user code fails this step rather than the whole scenario
        let running = AssertUnwindSafe(action).catch_unwind().map(|outcome| {
          outcome.unwrap_or_else(|_| {
            Err(StepFailure::new(
              FailureKind::Unhandled,
              "Step action panicked",
            ))
          })
        });
        match planned.step.timeout {
          Some(timeout) => tokio::time::timeout(timeout, running)
            .await
            .unwrap_or_else(|_| Err(StepFailure::timeout(timeout))),
          None => running.await,
        }
      }
      StepMode::Wait => {
        let (hook, pending) = match (planned.hook, planned.pending.take()) {
          (Some(hook), Some(pending)) => (hook, pending),
          _ => return Err(StepFailure::new(FailureKind::Resource, "Wait step has no hook")),
        };
        let timeout = planned.step.timeout.unwrap_or(self.default_timeout);
        match pending.wait(timeout).await {
          Ok(message) => Ok(StepMetadata::from([(
            "message".to_owned(),
            serde_json::to_value(&message).unwrap_or(Value::Null),
          )])),
          Err(error) => {
            if let HookError::Timeout(_) = error {
              component.hooks().reject_hook(hook, error.clone());
              if is_test_phase_hook(component.as_ref(), hook) {
                component.hooks().remove_hook(hook);
              }
            }
            Err(error.into())
          }
        }
      }
    }
  }
}

/// Test-phase hooks go away with their case; init-phase hooks persist
fn is_test_phase_hook(component: &Component, hook: HookId) -> bool {
  component
    .hooks()
    .hook(hook)
    .map(|summary| summary.phase == HookPhase::Test)
    .unwrap_or(false)
}

fn pending_result(step: &Step) -> StepResult {
  StepResult {
    id: step.id(),
    component: step.component().to_owned(),
    step_type: step.step_type().to_owned(),
    description: step.description().to_owned(),
    mode: step.mode(),
    status: Status::Skipped,
    passed: false,
    duration: Duration::ZERO,
    error: None,
    failure: None,
    stack_trace: None,
    metadata: StepMetadata::new(),
  }
}
