// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Conversion between [Message] values and their wire bytes
use super::message::Message;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
  #[error("Failed to encode message of type {message_type:?}: {source}")]
  Encode {
    message_type: String,
    #[source]
    source: anyhow::Error,
  },
  #[error("Failed to decode message: {0}")]
  Decode(#[source] anyhow::Error),
}

impl CodecError {
  pub fn is_encode(&self) -> bool {
    matches!(self, CodecError::Encode { .. })
  }

  pub fn is_decode(&self) -> bool {
    matches!(self, CodecError::Decode(_))
  }
}

/// Binary codecs (MessagePack, Protobuf, ...) implement this same contract as drop-in replacements
pub trait Codec: Send + Sync + 'static {
  fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

  fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
  fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Encode {
      message_type: message.message_type.clone(),
      source: e.into(),
    })
  }

  fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
    let message: Message =
      serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.into()))?;
    if message.message_type.is_empty() {
      return Err(CodecError::Decode(anyhow::Error::msg(
        "Message type must not be empty",
      )));
    }
    Ok(message)
  }
}
