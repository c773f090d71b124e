// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Ordered, typed operations applied to a matched message's payload
use serde::Serialize;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};

use super::message::{Message, MessageError};

pub type AssertFn = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;
pub type MockFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
  Assert {
    description: String,
    predicate: AssertFn,
  },
  Transform {
    description: Option<String>,
    transform: TransformFn,
  },
  /// Discard the message; the pipeline stops and nothing is forwarded or replied
  Drop,
  /// Terminal; replies to the sender using the matched message's type
  MockResponse {
    description: Option<String>,
    build: MockFn,
  },
  /// Terminal; replies to the sender with a message of the given type
  MockEvent {
    message_type: String,
    build: MockFn,
  },
  /// Rewrites the payload forwarded to the peer of a proxy session
  Proxy {
    transform: TransformFn,
  },
  Delay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
  Assert,
  Transform,
  Drop,
  MockResponse,
  MockEvent,
  Proxy,
  Delay,
}

impl fmt::Display for HandlerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      HandlerKind::Assert => "assert",
      HandlerKind::Transform => "transform",
      HandlerKind::Drop => "drop",
      HandlerKind::MockResponse => "mockResponse",
      HandlerKind::MockEvent => "mockEvent",
      HandlerKind::Proxy => "proxy",
      HandlerKind::Delay => "delay",
    };
    f.write_str(name)
  }
}

impl Handler {
  pub fn assert<F>(description: impl Into<String>, predicate: F) -> Self
  where
    F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
  {
    Handler::Assert {
      description: description.into(),
      predicate: Arc::new(predicate),
    }
  }

  pub fn transform<F>(transform: F) -> Self
  where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
  {
    Handler::Transform {
      description: None,
      transform: Arc::new(transform),
    }
  }

  pub fn mock_response<F>(build: F) -> Self
  where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
  {
    Handler::MockResponse {
      description: None,
      build: Arc::new(build),
    }
  }

  /// Fails up front on an empty `message_type` rather than when the reply is built
  pub fn mock_event<F>(message_type: impl Into<String>, build: F) -> Result<Self, MessageError>
  where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
  {
    let message_type = message_type.into();
    if message_type.is_empty() {
      return Err(MessageError::EmptyType);
    }
    Ok(Handler::MockEvent {
      message_type,
      build: Arc::new(build),
    })
  }

  pub fn proxy<F>(transform: F) -> Self
  where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
  {
    Handler::Proxy {
      transform: Arc::new(transform),
    }
  }

  pub fn delay(duration: Duration) -> Self {
    Handler::Delay(duration)
  }

  pub fn kind(&self) -> HandlerKind {
    match self {
      Handler::Assert { .. } => HandlerKind::Assert,
      Handler::Transform { .. } => HandlerKind::Transform,
      Handler::Drop => HandlerKind::Drop,
      Handler::MockResponse { .. } => HandlerKind::MockResponse,
      Handler::MockEvent { .. } => HandlerKind::MockEvent,
      Handler::Proxy { .. } => HandlerKind::Proxy,
      Handler::Delay(_) => HandlerKind::Delay,
    }
  }

  pub fn description(&self) -> Option<&str> {
    match self {
      Handler::Assert { description, .. } => Some(description),
      Handler::Transform { description, .. } | Handler::MockResponse { description, .. } => {
        description.as_deref()
      }
      _ => None,
    }
  }

  async fn apply(&self, message: &Message, payload: Value) -> Result<Flow, HandlerError> {
    let unhandled = |source| HandlerError::Unhandled {
      kind: self.kind(),
      source,
    };
    match self {
      Handler::Assert {
        description,
        predicate,
      } => match predicate(&payload) {
        Ok(true) => Ok(Flow::Continue(payload)),
        Ok(false) => Err(HandlerError::AssertionFailed {
          description: description.clone(),
          cause: None,
        }),
        Err(cause) => Err(HandlerError::AssertionFailed {
          description: description.clone(),
          cause: Some(cause),
        }),
      },
      Handler::Transform { transform, .. } | Handler::Proxy { transform } => {
        transform(payload).map(Flow::Continue).map_err(unhandled)
      }
      Handler::Drop => Ok(Flow::Stop(PipelineOutcome::Dropped)),
      Handler::MockResponse { build, .. } => {
        let reply = build(&payload).map_err(unhandled)?;
        message
          .try_reply(message.message_type.clone(), reply)
          .map(|reply| Flow::Stop(PipelineOutcome::Reply(reply)))
          .map_err(|e| unhandled(e.into()))
      }
      Handler::MockEvent {
        message_type,
        build,
      } => {
        let event = build(&payload).map_err(unhandled)?;
        message
          .try_reply(message_type.clone(), event)
          .map(|event| Flow::Stop(PipelineOutcome::Reply(event)))
          .map_err(|e| unhandled(e.into()))
      }
      Handler::Delay(duration) => {
        tokio::time::sleep(*duration).await;
        Ok(Flow::Continue(payload))
      }
    }
  }
}

impl fmt::Debug for Handler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut s = f.debug_struct("Handler");
    s.field("kind", &self.kind());
    if let Some(description) = self.description() {
      s.field("description", &description);
    }
    match self {
      Handler::MockEvent { message_type, .. } => {
        s.field("message_type", message_type);
      }
      Handler::Delay(duration) => {
        s.field("duration", duration);
      }
      _ => {}
    }
    s.finish()
  }
}

/// What a completed pipeline asks its caller to do with the message
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
  /// Continue delivery with the (possibly rewritten) payload
  Forward(Value),
  /// Send this message back to whoever sent the matched one
  Reply(Message),
  /// Intentionally discarded; a successful outcome
  Dropped,
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
  #[error("Assertion failed: {description}")]
  AssertionFailed {
    description: String,
    #[source]
    cause: Option<anyhow::Error>,
  },
  #[error("{kind} handler failed: {source:#}")]
  Unhandled {
    kind: HandlerKind,
    #[source]
    source: anyhow::Error,
  },
}

enum Flow {
  Continue(Value),
  Stop(PipelineOutcome),
}

/// Runs `handlers` in declaration order against `message`'s payload
///
/// The first failing handler stops the pipeline; handlers after it never run.
pub async fn execute_handlers(
  handlers: &[Handler],
  message: &Message,
) -> Result<PipelineOutcome, HandlerError> {
  let mut payload = message.payload.clone();
  for handler in handlers {
    match handler.apply(message, payload).await? {
      Flow::Continue(next) => payload = next,
      Flow::Stop(outcome) => {
        tracing::trace!(kind = %handler.kind(), "Pipeline stopped by terminal handler");
        return Ok(outcome);
      }
    }
  }
  Ok(PipelineOutcome::Forward(payload))
}

#[cfg(test)]
mod tests {
  use super::{execute_handlers, Handler, HandlerError, HandlerKind, PipelineOutcome};
  use crate::common::message::{Message, MessageError};
  use serde_json::{json, Value};
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::{Duration, Instant},
  };

  fn ping() -> Message {
    Message::new("Ping", json!({"seq": 1})).with_trace_id("t-1")
  }

  #[tokio::test]
  async fn empty_pipeline_forwards_unchanged() {
    let outcome = execute_handlers(&[], &ping()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Forward(json!({"seq": 1})));
  }

  #[tokio::test]
  async fn transforms_chain_in_order() {
    let handlers = vec![
      Handler::transform(|mut p| {
        p["seq"] = json!(p["seq"].as_i64().unwrap_or_default() * 10);
        Ok(p)
      }),
      Handler::transform(|mut p| {
        p["seq"] = json!(p["seq"].as_i64().unwrap_or_default() + 1);
        Ok(p)
      }),
    ];
    let outcome = execute_handlers(&handlers, &ping()).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Forward(json!({"seq": 11})));
  }

  #[tokio::test]
  async fn mock_event_is_terminal_and_keeps_trace() {
    let after = Arc::new(AtomicUsize::new(0));
    let handlers = vec![
      Handler::mock_event("Pong", |p| Ok(json!({"seq": p["seq"].clone()}))).unwrap(),
      Handler::transform({
        let after = after.clone();
        move |p| {
          after.fetch_add(1, Ordering::SeqCst);
          Ok(p)
        }
      }),
    ];
    match execute_handlers(&handlers, &ping()).await.unwrap() {
      PipelineOutcome::Reply(reply) => {
        assert_eq!(reply.message_type, "Pong");
        assert_eq!(reply.payload, json!({"seq": 1}));
        assert_eq!(reply.trace_id.as_deref(), Some("t-1"));
      }
      other => panic!("Expected a reply, got {:?}", other),
    }
    assert_eq!(after.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn mock_response_reuses_the_request_type() {
    let handlers = vec![Handler::mock_response(|_| Ok(json!({"ok": true})))];
    match execute_handlers(&handlers, &ping()).await.unwrap() {
      PipelineOutcome::Reply(reply) => assert_eq!(reply.message_type, "Ping"),
      other => panic!("Expected a reply, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn drop_is_a_successful_outcome() {
    let handlers = vec![
      Handler::Drop,
      Handler::mock_event("Never", |_| Ok(Value::Null)).unwrap(),
    ];
    assert_eq!(
      execute_handlers(&handlers, &ping()).await.unwrap(),
      PipelineOutcome::Dropped
    );
  }

  #[tokio::test]
  async fn failed_assertion_stops_the_pipeline() {
    let handlers = vec![
      Handler::assert("seq is two", |p| Ok(p["seq"] == 2)),
      Handler::Drop,
    ];
    let err = execute_handlers(&handlers, &ping()).await.unwrap_err();
    assert_eq!(err.to_string(), "Assertion failed: seq is two");
    assert!(matches!(err, HandlerError::AssertionFailed { cause: None, .. }));
  }

  #[tokio::test]
  async fn erroring_assertion_is_an_assertion_failure() {
    let handlers = vec![Handler::assert("parses", |_| Err(anyhow::anyhow!("bad shape")))];
    let err = execute_handlers(&handlers, &ping()).await.unwrap_err();
    assert!(matches!(
      err,
      HandlerError::AssertionFailed { cause: Some(_), .. }
    ));
  }

  #[tokio::test]
  async fn transform_errors_are_unhandled() {
    let handlers = vec![Handler::proxy(|_| Err(anyhow::anyhow!("cannot rewrite")))];
    match execute_handlers(&handlers, &ping()).await.unwrap_err() {
      HandlerError::Unhandled { kind, .. } => assert_eq!(kind, HandlerKind::Proxy),
      other => panic!("Expected an unhandled error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn mock_events_need_a_message_type() {
    assert_eq!(
      Handler::mock_event("", |_| Ok(Value::Null)).unwrap_err(),
      MessageError::EmptyType
    );
    let assembled = Handler::MockEvent {
      message_type: String::new(),
      build: Arc::new(|_: &Value| Ok(Value::Null)),
    };
    match execute_handlers(&[assembled], &ping()).await.unwrap_err() {
      HandlerError::Unhandled { kind, .. } => assert_eq!(kind, HandlerKind::MockEvent),
      other => panic!("Expected an unhandled error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn delay_suspends_before_the_next_handler() {
    let handlers = vec![Handler::delay(Duration::from_millis(30)), Handler::Drop];
    let started = Instant::now();
    execute_handlers(&handlers, &ping()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
  }

  #[test]
  fn kinds_render_with_wire_names() {
    assert_eq!(HandlerKind::MockEvent.to_string(), "mockEvent");
    assert_eq!(Handler::Drop.kind(), HandlerKind::Drop);
  }
}
