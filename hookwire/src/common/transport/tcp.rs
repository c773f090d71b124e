// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional transport over TCP, carrying one length-prefixed frame per message
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use std::sync::Arc;
use tokio::{
  io::AsyncWriteExt,
  net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
  },
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use super::{
  AdapterBookkeeping, AsyncTransport, Connection, ConnectionId, Link, Listener, TransportError,
};
use crate::{
  common::{
    codec::{Codec, JsonCodec},
    message::Message,
  },
  util::{
    framed::{read_message, write_message, MessageReadError},
    id::{IdGenerator, MonotonicAtomicGenerator},
  },
};

/// Frames larger than this are refused in both directions unless overridden
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub struct TcpTransport<C: Codec = JsonCodec> {
  codec: Arc<C>,
  max_frame_length: Option<usize>,
  bookkeeping: Arc<AdapterBookkeeping>,
}

impl TcpTransport<JsonCodec> {
  pub fn new() -> Self {
    Self::with_codec(JsonCodec)
  }
}

impl Default for TcpTransport<JsonCodec> {
  fn default() -> Self {
    Self::new()
  }
}

impl<C: Codec> TcpTransport<C> {
  pub fn with_codec(codec: C) -> Self {
    Self {
      codec: Arc::new(codec),
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
      bookkeeping: Arc::new(AdapterBookkeeping::new(Arc::new(
        MonotonicAtomicGenerator::default(),
      ))),
    }
  }

  pub fn with_max_frame_length(mut self, max_frame_length: Option<usize>) -> Self {
    self.max_frame_length = max_frame_length;
    self
  }

  pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
    self.bookkeeping = Arc::new(AdapterBookkeeping::new(ids));
    self
  }

  pub fn bookkeeping(&self) -> &AdapterBookkeeping {
    &self.bookkeeping
  }
}

impl<C: Codec> std::fmt::Debug for TcpTransport<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(TcpTransport))
      .field("max_frame_length", &self.max_frame_length)
      .field("bookkeeping", &self.bookkeeping)
      .finish()
  }
}

struct TcpConnection<C: Codec> {
  id: ConnectionId,
  remote: Option<String>,
  codec: Arc<C>,
  max_frame_length: Option<usize>,
  writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
  closed: CancellationToken,
}

impl<C: Codec> Connection for TcpConnection<C> {
  fn id(&self) -> ConnectionId {
    self.id
  }

  fn remote(&self) -> Option<String> {
    self.remote.clone()
  }

  fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let mut writer = self.writer.lock().await;
      let writer = writer.as_mut().ok_or(TransportError::ConnectionClosed)?;
      write_message(writer, self.codec.as_ref(), &message, self.max_frame_length).await?;
      Ok::<_, TransportError>(())
    }
    .boxed()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    async move {
      self.closed.cancel();
      if let Some(mut writer) = self.writer.lock().await.take() {
        if let Err(error) = writer.shutdown().await {
          tracing::trace!(?error, id = ?self.id, "TCP shutdown failed");
        }
      }
    }
    .boxed()
  }

  fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }
}

struct ReadState<C> {
  reader: OwnedReadHalf,
  codec: Arc<C>,
  max_frame_length: Option<usize>,
}

fn link<C: Codec>(
  socket: TcpStream,
  id: ConnectionId,
  codec: Arc<C>,
  max_frame_length: Option<usize>,
) -> Link {
  let remote = socket.peer_addr().ok().map(|addr| addr.to_string());
  if let Err(error) = socket.set_nodelay(true) {
    tracing::trace!(?error, "Failed to disable Nagle's algorithm");
  }
  let (reader, writer) = socket.into_split();
  let closed = CancellationToken::new();
  let state = ReadState {
    reader,
    codec: Arc::clone(&codec),
    max_frame_length,
  };
  // A framing failure leaves the stream misaligned, so the first one ends it
  let incoming = stream::unfold(Some(state), |state| async move {
    let mut state = match state {
      Some(state) => state,
      None => return None,
    };
    match read_message(&mut state.reader, state.codec.as_ref(), state.max_frame_length).await {
      Ok(message) => Some((Ok(message), Some(state))),
      Err(MessageReadError::Read(error)) if error.is_clean_close() => None,
      Err(MessageReadError::Codec(error)) => {
        Some((Err(TransportError::from(error)), Some(state)))
      }
      Err(error) => Some((Err(TransportError::from(error)), None)),
    }
  });
  let stop = closed.clone();
  let incoming = incoming
    .take_until(async move { stop.cancelled().await })
    .boxed();
  Link {
    connection: Arc::new(TcpConnection {
      id,
      remote,
      codec,
      max_frame_length,
      writer: tokio::sync::Mutex::new(Some(writer)),
      closed,
    }),
    incoming,
  }
}

impl<C: Codec> AsyncTransport for TcpTransport<C> {
  fn start_server(&self, addr: &str) -> BoxFuture<'static, Result<Listener, TransportError>> {
    let addr = addr.to_owned();
    let ids = self.bookkeeping.id_generator();
    let codec = Arc::clone(&self.codec);
    let max_frame_length = self.max_frame_length;
    let bookkeeping = Arc::clone(&self.bookkeeping);
    async move {
      let listener = TcpListener::bind(&addr).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::AddrInUse {
          TransportError::AddressInUse(addr.clone())
        } else {
          TransportError::Io(error)
        }
      })?;
      let local_addr = listener.local_addr()?.to_string();
      let stop = bookkeeping.register_server(&local_addr)?;
      tracing::debug!(%local_addr, "TCP server listening");
      let links = TcpListenerStream::new(listener)
        .take_until(async move { stop.cancelled().await })
        .filter_map(move |accepted| {
          let accepted_link = match accepted {
            Ok(socket) => Some(link(
              socket,
              ConnectionId::generate(ids.as_ref()),
              Arc::clone(&codec),
              max_frame_length,
            )),
            Err(error) => {
              tracing::warn!(?error, "TCP accept failed");
              None
            }
          };
          futures::future::ready(accepted_link)
        })
        .boxed();
      Ok::<_, TransportError>(Listener { local_addr, links })
    }
    .boxed()
  }

  fn stop_server(&self, addr: &str) -> bool {
    self.bookkeeping.stop_server(addr)
  }

  fn create_client(&self, addr: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
    let addr = addr.to_owned();
    let id = self.bookkeeping.next_connection_id();
    let codec = Arc::clone(&self.codec);
    let max_frame_length = self.max_frame_length;
    let connect = async move {
      let socket = TcpStream::connect(&addr).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::ConnectionRefused {
          TransportError::ConnectionRefused(addr.clone())
        } else {
          TransportError::Io(error)
        }
      })?;
      Ok::<_, TransportError>(link(socket, id, codec, max_frame_length))
    };
    let bookkeeping = Arc::clone(&self.bookkeeping);
    async move {
      let client = connect.await?;
      bookkeeping.track_client(Arc::clone(&client.connection));
      Ok::<_, TransportError>(client)
    }
    .boxed()
  }

  fn close_client(&self, id: ConnectionId) -> BoxFuture<'static, bool> {
    self.bookkeeping.close_client(id)
  }
}
