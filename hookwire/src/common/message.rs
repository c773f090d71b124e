// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata key carrying route captures attached by templated matchers
pub const PARAMS_METADATA_KEY: &str = "params";
/// Metadata key carrying a request/response status code
pub const STATUS_METADATA_KEY: &str = "status";

/// A single framed, decoded unit exchanged between components
///
/// `message_type` is never empty; transports and codecs refuse to produce one that is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
  #[serde(rename = "type")]
  pub message_type: String,
  #[serde(default)]
  pub payload: Value,
  #[serde(rename = "traceId", default, skip_serializing_if = "Option::is_none")]
  pub trace_id: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub metadata: BTreeMap<String, Value>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
  #[error("Message type must not be empty")]
  EmptyType,
}

impl Message {
  /// # Panics
  ///
  /// Panics if `message_type` is empty; use [Message::try_new] for names not known up front.
  pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
    match Self::try_new(message_type, payload) {
      Ok(message) => message,
      Err(e) => panic!("{}", e),
    }
  }

  pub fn try_new(message_type: impl Into<String>, payload: Value) -> Result<Self, MessageError> {
    let message_type = message_type.into();
    if message_type.is_empty() {
      return Err(MessageError::EmptyType);
    }
    Ok(Self {
      message_type,
      payload,
      trace_id: None,
      metadata: BTreeMap::new(),
    })
  }

  pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
    self.trace_id = Some(trace_id.into());
    self
  }

  /// Assigns a fresh random trace id unless one is already present
  pub fn traced(mut self) -> Self {
    if self.trace_id.is_none() {
      self.trace_id = Some(uuid::Uuid::new_v4().to_string());
    }
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
    self.metadata.insert(key.into(), value);
    self
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = payload;
    self
  }

  /// Builds a message answering this one; the trace id carries over so the pair correlates
  ///
  /// # Panics
  ///
  /// Panics if `message_type` is empty, as [Message::new] does.
  pub fn reply(&self, message_type: impl Into<String>, payload: Value) -> Message {
    Message {
      trace_id: self.trace_id.clone(),
      ..Message::new(message_type, payload)
    }
  }

  pub fn try_reply(
    &self,
    message_type: impl Into<String>,
    payload: Value,
  ) -> Result<Message, MessageError> {
    Ok(Message {
      trace_id: self.trace_id.clone(),
      ..Message::try_new(message_type, payload)?
    })
  }

  pub fn status(&self) -> Option<u16> {
    self
      .metadata
      .get(STATUS_METADATA_KEY)
      .and_then(Value::as_u64)
      .and_then(|status| u16::try_from(status).ok())
  }

  pub fn params(&self) -> Option<&serde_json::Map<String, Value>> {
    self
      .metadata
      .get(PARAMS_METADATA_KEY)
      .and_then(Value::as_object)
  }
}

#[cfg(test)]
mod tests {
  use super::{Message, MessageError};
  use serde_json::json;

  #[test]
  fn wire_shape_uses_camel_case_trace_id() {
    let message = Message::new("Ping", json!({"seq": 1})).with_trace_id("t-1");
    let encoded = serde_json::to_value(&message).unwrap();
    assert_eq!(
      encoded,
      json!({"type": "Ping", "payload": {"seq": 1}, "traceId": "t-1"})
    );
  }

  #[test]
  fn missing_optional_fields_default() {
    let message: Message = serde_json::from_value(json!({"type": "Ping"})).unwrap();
    assert_eq!(message.payload, serde_json::Value::Null);
    assert!(message.trace_id.is_none());
    assert!(message.metadata.is_empty());
  }

  #[test]
  fn replies_keep_the_trace_id() {
    let request = Message::new("Login", json!({})).with_trace_id("abc");
    let reply = request.reply("LoginResult", json!({"ok": true}));
    assert_eq!(reply.trace_id.as_deref(), Some("abc"));
    assert_eq!(reply.message_type, "LoginResult");
  }

  #[test]
  fn traced_only_assigns_once() {
    let message = Message::new("Ping", json!(null)).traced();
    let trace_id = message.trace_id.clone();
    assert!(trace_id.is_some());
    assert_eq!(message.traced().trace_id, trace_id);
  }

  #[test]
  #[should_panic]
  fn empty_type_is_rejected() {
    Message::new("", json!(null));
  }

  #[test]
  fn fallible_constructors_refuse_an_empty_type() {
    assert_eq!(Message::try_new("", json!(null)), Err(MessageError::EmptyType));
    let request = Message::new("Ping", json!(null)).with_trace_id("t");
    assert_eq!(request.try_reply("", json!(null)), Err(MessageError::EmptyType));
    assert_eq!(
      request.try_reply("Pong", json!(1)).unwrap().trace_id.as_deref(),
      Some("t")
    );
  }
}
