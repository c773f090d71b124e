// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Capability traits for the adapters that move [Message] values on and off the wire
//!
//! Adapters deliver already-framed, already-decoded messages; nothing above this module
//! touches sockets. Bidirectional protocols implement [AsyncTransport], request/response
//! protocols implement [SyncTransport], and an adapter may implement both.
use dashmap::DashMap;
use futures::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{codec::CodecError, message::Message};
use crate::util::{
  framed::{MessageReadError, MessageWriteError, ReadError, WriteError},
  id::{numeric_id, IdGenerator},
};

pub mod memory;
pub mod tcp;

numeric_id!(ConnectionId);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Nothing is listening at {0:?}")]
  ConnectionRefused(String),
  #[error("Address {0:?} is already in use")]
  AddressInUse(String),
  #[error("No response was produced for the request")]
  NoResponse,
  #[error(transparent)]
  Codec(#[from] CodecError),
  #[error("Frame read failure: {0}")]
  Read(#[from] ReadError),
  #[error("Frame write failure: {0}")]
  Write(#[from] WriteError),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl From<MessageReadError> for TransportError {
  fn from(e: MessageReadError) -> Self {
    match e {
      MessageReadError::Read(e) => TransportError::Read(e),
      MessageReadError::Codec(e) => TransportError::Codec(e),
    }
  }
}

impl From<MessageWriteError> for TransportError {
  fn from(e: MessageWriteError) -> Self {
    match e {
      MessageWriteError::Write(e) => TransportError::Write(e),
      MessageWriteError::Codec(e) => TransportError::Codec(e),
    }
  }
}

/// The sending half of one established connection
pub trait Connection: Send + Sync + 'static {
  fn id(&self) -> ConnectionId;

  fn remote(&self) -> Option<String> {
    None
  }

  fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Closes both directions; the peer's incoming stream ends once it drains
  fn close(&self) -> BoxFuture<'_, ()>;

  fn is_closed(&self) -> bool;
}

pub type ArcConnection = Arc<dyn Connection>;

/// Inbound messages of a connection; the stream ending is the connection's close event
pub type MessageStream = BoxStream<'static, Result<Message, TransportError>>;

pub struct Link {
  pub connection: ArcConnection,
  pub incoming: MessageStream,
}

impl std::fmt::Debug for Link {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(Link))
      .field("id", &self.connection.id())
      .field("remote", &self.connection.remote())
      .finish_non_exhaustive()
  }
}

pub struct Listener {
  /// The bound address, which may differ from the requested one (e.g. port `0`)
  pub local_addr: String,
  /// Accepted connections; ends when the server is stopped
  pub links: BoxStream<'static, Link>,
}

pub trait AsyncTransport: Send + Sync + 'static {
  fn start_server(&self, addr: &str) -> BoxFuture<'static, Result<Listener, TransportError>>;

  fn stop_server(&self, addr: &str) -> bool;

  fn create_client(&self, addr: &str) -> BoxFuture<'static, Result<Link, TransportError>>;

  fn close_client(&self, id: ConnectionId) -> BoxFuture<'static, bool>;
}

pub type RequestHandler =
  Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Message, TransportError>> + Send + Sync>;

pub trait SyncTransport: Send + Sync + 'static {
  /// Serves `handler` for every request arriving at `addr`; returns the bound address
  fn start_server(
    &self,
    addr: &str,
    handler: RequestHandler,
  ) -> BoxFuture<'static, Result<String, TransportError>>;

  fn stop_server(&self, addr: &str) -> bool;

  fn request(
    &self,
    addr: &str,
    message: Message,
  ) -> BoxFuture<'static, Result<Message, TransportError>>;
}

/// Server and client registries shared by every adapter, embedded by value
pub struct AdapterBookkeeping {
  ids: Arc<dyn IdGenerator>,
  servers: DashMap<String, CancellationToken>,
  clients: DashMap<ConnectionId, ArcConnection>,
}

impl AdapterBookkeeping {
  pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      ids,
      servers: DashMap::new(),
      clients: DashMap::new(),
    }
  }

  pub fn id_generator(&self) -> Arc<dyn IdGenerator> {
    Arc::clone(&self.ids)
  }

  pub fn next_connection_id(&self) -> ConnectionId {
    ConnectionId::generate(self.ids.as_ref())
  }

  /// Returns the token that stops the server, or `AddressInUse` if already serving `addr`
  pub fn register_server(&self, addr: &str) -> Result<CancellationToken, TransportError> {
    use dashmap::mapref::entry::Entry;
    match self.servers.entry(addr.to_owned()) {
      Entry::Occupied(_) => Err(TransportError::AddressInUse(addr.to_owned())),
      Entry::Vacant(slot) => Ok(slot.insert(CancellationToken::new()).clone()),
    }
  }

  pub fn stop_server(&self, addr: &str) -> bool {
    match self.servers.remove(addr) {
      Some((_, token)) => {
        token.cancel();
        true
      }
      None => false,
    }
  }

  pub fn is_serving(&self, addr: &str) -> bool {
    self.servers.contains_key(addr)
  }

  pub fn track_client(&self, connection: ArcConnection) {
    self.clients.retain(|_, client| !client.is_closed());
    self.clients.insert(connection.id(), connection);
  }

  pub fn close_client(&self, id: ConnectionId) -> BoxFuture<'static, bool> {
    let removed = self.clients.remove(&id);
    Box::pin(async move {
      match removed {
        Some((_, connection)) => {
          connection.close().await;
          true
        }
        None => false,
      }
    })
  }

  pub fn server_count(&self) -> usize {
    self.servers.len()
  }

  pub fn client_count(&self) -> usize {
    self
      .clients
      .iter()
      .filter(|client| !client.value().is_closed())
      .count()
  }
}

impl std::fmt::Debug for AdapterBookkeeping {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(AdapterBookkeeping))
      .field("servers", &self.servers.len())
      .field("clients", &self.clients.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{AdapterBookkeeping, TransportError};
  use crate::util::id::MonotonicAtomicGenerator;
  use std::sync::Arc;

  #[test]
  fn servers_are_exclusive_per_address() {
    let bookkeeping = AdapterBookkeeping::new(Arc::new(MonotonicAtomicGenerator::new(1)));
    let token = bookkeeping.register_server("a").unwrap();
    assert!(matches!(
      bookkeeping.register_server("a"),
      Err(TransportError::AddressInUse(_))
    ));
    assert!(bookkeeping.stop_server("a"));
    assert!(token.is_cancelled());
    assert!(!bookkeeping.is_serving("a"));
    assert!(bookkeeping.register_server("a").is_ok());
  }

  #[test]
  fn connection_ids_come_from_the_injected_generator() {
    let bookkeeping = AdapterBookkeeping::new(Arc::new(MonotonicAtomicGenerator::new(40)));
    assert_eq!(bookkeeping.next_connection_id().inner(), 40);
    assert_eq!(bookkeeping.next_connection_id().inner(), 41);
  }
}
