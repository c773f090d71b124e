// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use hookwire::{
  common::{
    component::TransportBinding,
    handler::Handler,
    hook::{HookMode, HookPhase, HookSpec},
    matcher::{build_matcher, MatcherOptions},
    transport::tcp::TcpTransport,
  },
  Component, Role,
};
use serde::Deserialize;
use serde_json::Value;
use std::{
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
};

/// Parameters used to run a mock server answering from canned replies
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct MockArgs {
  pub listen: SocketAddr,
  pub stubs: PathBuf,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct StubReply {
  #[serde(rename = "type")]
  pub message_type: String,
  #[serde(default)]
  pub payload: Value,
}

/// Answer every message of type `on` with `reply`
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Stub {
  pub on: String,
  pub reply: StubReply,
}

#[derive(thiserror::Error, Debug)]
pub enum StubError {
  #[error("Stub file {0:?} defines no stubs")]
  Empty(PathBuf),
  #[error("Stub #{index} has an empty message type")]
  EmptyType { index: usize },
}

pub fn parse_stubs(json: &str, origin: &Path) -> Result<Vec<Stub>> {
  let stubs: Vec<Stub> = serde_json::from_str(json)
    .with_context(|| format!("Stub file {:?} is not a JSON array of stubs", origin))?;
  if stubs.is_empty() {
    return Err(StubError::Empty(origin.to_path_buf()).into());
  }
  if let Some(index) = stubs
    .iter()
    .position(|stub| stub.on.is_empty() || stub.reply.message_type.is_empty())
  {
    return Err(StubError::EmptyType { index }.into());
  }
  Ok(stubs)
}

/// Registers each stub as an init-phase hook so it survives for the component's lifetime
pub fn install_stubs(component: &Component, stubs: Vec<Stub>) -> Result<()> {
  for stub in stubs {
    let StubReply {
      message_type,
      payload,
    } = stub.reply;
    let reply = Handler::mock_event(message_type.clone(), move |_| Ok(payload.clone()))?;
    component.register_hook(HookSpec {
      step: None,
      description: format!("stub {} -> {}", stub.on, message_type),
      phase: HookPhase::Init,
      mode: HookMode::Listen,
      matcher: build_matcher(stub.on.into(), MatcherOptions::default()),
      handlers: vec![reply].into(),
    });
  }
  Ok(())
}

pub async fn mock_main(config: MockArgs) -> Result<()> {
  let json = tokio::fs::read_to_string(&config.stubs)
    .await
    .with_context(|| format!("Failed to read stub file {:?}", config.stubs))?;
  let stubs = parse_stubs(&json, &config.stubs)?;
  let transport = TransportBinding::bidirectional(Arc::new(TcpTransport::new()));
  let server = Arc::new(Component::new(
    "mock",
    Role::Server {
      listen: config.listen.to_string(),
      target: None,
    },
    transport,
  ));
  let count = stubs.len();
  install_stubs(&server, stubs)?;
  server.start().await?;
  tracing::info!(listen = ?server.bound_addr(), stubs = count, "Mock server ready; press Ctrl-C to stop");
  tokio::signal::ctrl_c().await?;
  for hook in server.hooks().hooks() {
    tracing::info!(matches = hook.matches, "{}", hook.description);
  }
  server.stop().await;
  Ok(())
}
