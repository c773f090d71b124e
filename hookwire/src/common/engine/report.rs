// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::common::{
  error::FailureKind,
  step::{StepFailure, StepId, StepMetadata, StepMode},
};

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Passed,
  /// An assertion did not hold
  Failed,
  /// The test could not run to completion (timeout, handler error, wiring mistake)
  Broken,
  /// Not executed because an earlier step failed
  Skipped,
}

impl Status {
  pub fn of(failure: Option<&StepFailure>) -> Self {
    match failure {
      None => Status::Passed,
      Some(failure) if failure.kind.is_broken() => Status::Broken,
      Some(_) => Status::Failed,
    }
  }

  pub fn is_passed(&self) -> bool {
    matches!(self, Status::Passed)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
  pub id: StepId,
  pub component: String,
  pub step_type: String,
  pub description: String,
  pub mode: StepMode,
  pub status: Status,
  pub passed: bool,
  #[serde(rename = "durationMs", serialize_with = "as_millis")]
  pub duration: Duration,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<FailureKind>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack_trace: Option<String>,
  #[serde(skip_serializing_if = "StepMetadata::is_empty")]
  pub metadata: StepMetadata,
}

impl StepResult {
  pub(crate) fn set_outcome(&mut self, outcome: Result<StepMetadata, StepFailure>) {
    match outcome {
      Ok(metadata) => {
        self.metadata.extend(metadata);
        self.status = Status::Passed;
      }
      Err(failure) => self.fail(failure),
    }
    self.passed = self.status.is_passed();
  }

  pub(crate) fn fail(&mut self, failure: StepFailure) {
    self.status = Status::of(Some(&failure));
    self.passed = false;
    self.error = Some(failure.message);
    self.failure = Some(failure.kind);
    self.stack_trace = failure.detail;
  }

  pub(crate) fn skip(&mut self) {
    self.status = Status::Skipped;
    self.passed = false;
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
  pub name: String,
  pub status: Status,
  pub passed: bool,
  #[serde(rename = "durationMs", serialize_with = "as_millis")]
  pub duration: Duration,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<FailureKind>,
  pub steps: Vec<StepResult>,
}

impl TestCaseResult {
  pub(crate) fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      status: Status::Passed,
      passed: true,
      duration: Duration::ZERO,
      error: None,
      failure: None,
      steps: Vec::new(),
    }
  }

  /// Records the first failure of the case; later ones only show on their steps
  pub(crate) fn fail(&mut self, failure: &StepFailure) {
    if self.error.is_none() {
      self.status = Status::of(Some(failure));
      self.passed = false;
      self.error = Some(failure.message.clone());
      self.failure = Some(failure.kind);
    }
  }

  pub(crate) fn skip(&mut self, reason: impl Into<String>) {
    self.status = Status::Skipped;
    self.passed = false;
    self.error = Some(reason.into());
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
  pub name: String,
  pub status: Status,
  pub passed: bool,
  #[serde(rename = "durationMs", serialize_with = "as_millis")]
  pub duration: Duration,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub init: Option<TestCaseResult>,
  pub test_cases: Vec<TestCaseResult>,
}

impl ScenarioResult {
  pub(crate) fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      status: Status::Passed,
      passed: true,
      duration: Duration::ZERO,
      error: None,
      init: None,
      test_cases: Vec::new(),
    }
  }

  pub(crate) fn break_with(&mut self, error: impl Into<String>) {
    self.status = Status::Broken;
    self.passed = false;
    self.error = Some(error.into());
  }

  /// Failed if any case failed, otherwise Broken if any case broke or was skipped
  pub(crate) fn settle(&mut self) {
    if self.error.is_some() {
      return;
    }
    let cases = self.init.iter().chain(self.test_cases.iter());
    let mut status = Status::Passed;
    for case in cases {
      status = match (status, case.status) {
        (Status::Failed, _) | (_, Status::Failed) => Status::Failed,
        (_, Status::Broken) | (_, Status::Skipped) | (Status::Broken, _) => Status::Broken,
        _ => Status::Passed,
      };
    }
    self.status = status;
    self.passed = status.is_passed();
  }

  pub fn case(&self, name: &str) -> Option<&TestCaseResult> {
    self.test_cases.iter().find(|case| case.name == name)
  }
}

/// Receives results as the runner produces them
#[cfg_attr(test, mockall::automock)]
pub trait Reporter: Send + Sync {
  fn on_step(&self, scenario: &str, test_case: &str, result: &StepResult);
  fn on_test_case(&self, scenario: &str, result: &TestCaseResult);
  fn on_scenario(&self, result: &ScenarioResult);
}

/// Emits every result as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
  fn on_step(&self, scenario: &str, test_case: &str, result: &StepResult) {
    match result.status {
      Status::Passed | Status::Skipped => tracing::debug!(
        scenario,
        test_case,
        step = %result.id,
        component = %result.component,
        step_type = %result.step_type,
        status = ?result.status,
        duration = ?result.duration,
        "{}", result.description
      ),
      Status::Failed | Status::Broken => tracing::warn!(
        scenario,
        test_case,
        step = %result.id,
        component = %result.component,
        step_type = %result.step_type,
        status = ?result.status,
        error = ?result.error,
        "{}", result.description
      ),
    }
  }

  fn on_test_case(&self, scenario: &str, result: &TestCaseResult) {
    tracing::info!(
      scenario,
      test_case = %result.name,
      status = ?result.status,
      duration = ?result.duration,
      error = ?result.error,
      "Test case finished"
    );
  }

  fn on_scenario(&self, result: &ScenarioResult) {
    tracing::info!(
      scenario = %result.name,
      status = ?result.status,
      cases = result.test_cases.len(),
      duration = ?result.duration,
      "Scenario finished"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::{ScenarioResult, Status, StepResult, TestCaseResult};
  use crate::common::{
    error::FailureKind,
    step::{StepFailure, StepId, StepMetadata, StepMode},
  };
  use serde_json::json;
  use std::time::Duration;

  fn step() -> StepResult {
    StepResult {
      id: StepId::new(1),
      component: "client".into(),
      step_type: "send".into(),
      description: "send Ping".into(),
      mode: StepMode::Action,
      status: Status::Passed,
      passed: true,
      duration: Duration::from_millis(12),
      error: None,
      failure: None,
      stack_trace: None,
      metadata: StepMetadata::new(),
    }
  }

  #[test]
  fn failure_kind_decides_failed_or_broken() {
    let mut assertion = step();
    assertion.fail(StepFailure::new(FailureKind::Assertion, "nope"));
    assert_eq!(assertion.status, Status::Failed);
    let mut timeout = step();
    timeout.fail(StepFailure::timeout(Duration::from_millis(50)));
    assert_eq!(timeout.status, Status::Broken);
    assert!(!timeout.passed);
  }

  #[test]
  fn serializes_with_wire_names() {
    let value = serde_json::to_value(step()).unwrap();
    assert_eq!(value["durationMs"], json!(12));
    assert_eq!(value["stepType"], json!("send"));
    assert_eq!(value["status"], json!("passed"));
    assert!(value.get("error").is_none());
  }

  #[test]
  fn scenario_status_prefers_failed_over_broken() {
    let mut result = ScenarioResult::new("s");
    let mut broken = TestCaseResult::new("a");
    broken.fail(&StepFailure::timeout(Duration::from_millis(1)));
    let mut failed = TestCaseResult::new("b");
    failed.fail(&StepFailure::new(FailureKind::Assertion, "x"));
    result.test_cases = vec![broken, failed, TestCaseResult::new("c")];
    result.settle();
    assert_eq!(result.status, Status::Failed);
    assert!(!result.passed);
    assert_eq!(result.case("c").map(|c| c.status), Some(Status::Passed));
  }
}
