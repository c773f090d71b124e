// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames: a big-endian `u32` byte count followed by that many bytes
use crate::common::{
  codec::{Codec, CodecError},
  message::Message,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

impl ReadError {
  /// The peer closed the stream between frames rather than in the middle of one
  pub fn is_clean_close(&self) -> bool {
    match self {
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      } => error.kind() == std::io::ErrorKind::UnexpectedEof,
      _ => false,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  /// Nothing is written when the frame would be oversized, so the stream stays aligned
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum MessageReadError {
  #[error("Failure reading message frame: {0}")]
  Read(#[from] ReadError),
  #[error(transparent)]
  Codec(#[from] CodecError),
}

#[derive(thiserror::Error, Debug)]
pub enum MessageWriteError {
  #[error("Failure writing message frame: {0}")]
  Write(#[from] WriteError),
  #[error(transparent)]
  Codec(#[from] CodecError),
}

const U32_SIZE: usize = std::mem::size_of::<u32>();

pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
  max_length: Option<usize>,
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  if let Some(max_length) = max_length {
    if buffer.len() + U32_SIZE > max_length {
      return Err(WriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len() + U32_SIZE,
      });
    }
  }
  s.write_u32(buffer.len() as u32).await?;
  s.write_all(buffer).await?;
  Ok(s.flush().await?)
}

pub async fn read_message<TStream, TCodec>(
  s: TStream,
  codec: &TCodec,
  max_length: Option<usize>,
) -> Result<Message, MessageReadError>
where
  TStream: tokio::io::AsyncRead + Unpin,
  TCodec: Codec + ?Sized,
{
  let buffer = read_frame(s, max_length).await?;
  Ok(codec.decode(&buffer)?)
}

pub async fn write_message<TStream, TCodec>(
  s: TStream,
  codec: &TCodec,
  message: &Message,
  max_length: Option<usize>,
) -> Result<(), MessageWriteError>
where
  TStream: tokio::io::AsyncWrite + Unpin,
  TCodec: Codec + ?Sized,
{
  let buffer = codec.encode(message)?;
  Ok(write_frame(s, &buffer, max_length).await?)
}
