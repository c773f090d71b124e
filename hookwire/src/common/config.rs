// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Declarative harness wiring, loadable from JSON
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use super::{
  component::{Component, Role, TransportBinding, DEFAULT_DIAL_TIMEOUT},
  engine::{report::TracingReporter, Scenario, DEFAULT_WAIT_TIMEOUT},
  error::ResourceError,
};

fn default_dial_timeout_ms() -> u64 {
  DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
  DEFAULT_WAIT_TIMEOUT.as_millis() as u64
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read configuration: {0}")]
  Io(#[from] std::io::Error),
  #[error("Invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
  #[error(transparent)]
  Resource(#[from] ResourceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
  pub name: String,
  pub role: Role,
  #[serde(default = "default_dial_timeout_ms")]
  pub dial_timeout_ms: u64,
}

impl ComponentConfig {
  pub fn build(&self, transport: TransportBinding) -> Component {
    Component::new(self.name.clone(), self.role.clone(), transport)
      .with_dial_timeout(Duration::from_millis(self.dial_timeout_ms))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
  pub components: Vec<ComponentConfig>,
  #[serde(default = "default_timeout_ms")]
  pub default_timeout_ms: u64,
}

impl HarnessConfig {
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: HarnessConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    Self::from_json_str(&json)
  }

  pub fn validate(&self) -> Result<(), ResourceError> {
    let mut names = HashSet::new();
    for component in self.components.iter() {
      if !names.insert(component.name.as_str()) {
        return Err(ResourceError::DuplicateComponent(component.name.clone()));
      }
    }
    Ok(())
  }

  pub fn default_timeout(&self) -> Duration {
    Duration::from_millis(self.default_timeout_ms)
  }

  /// A scenario holding every configured component, logging results through `tracing`
  ///
  /// `bind` picks each component's transport.
  pub fn scenario(
    &self,
    name: impl Into<String>,
    bind: impl Fn(&Role) -> TransportBinding,
  ) -> Scenario {
    self
      .components
      .iter()
      .fold(Scenario::new(name), |scenario, component| {
        scenario.with_component(component.build(bind(&component.role)))
      })
      .with_default_timeout(self.default_timeout())
      .with_reporter(Arc::new(TracingReporter))
  }
}
