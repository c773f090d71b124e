// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-process transport; every [MemoryTransport] sharing a [MemoryNetwork] can reach the others
//!
//! Addresses are arbitrary strings. Connection ids are drawn from the network's generator so
//! that two clients of different transports never collide inside one server.
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
  AdapterBookkeeping, AsyncTransport, Connection, ConnectionId, Link, Listener, RequestHandler,
  SyncTransport, TransportError,
};
use crate::{
  common::message::Message,
  util::id::{IdGenerator, MonotonicAtomicGenerator},
};

struct NetworkInner {
  ids: Arc<dyn IdGenerator>,
  listeners: DashMap<String, mpsc::UnboundedSender<Link>>,
  services: DashMap<String, RequestHandler>,
}

#[derive(Clone)]
pub struct MemoryNetwork {
  inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
  pub fn new() -> Self {
    Self::with_id_generator(Arc::new(MonotonicAtomicGenerator::default()))
  }

  pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      inner: Arc::new(NetworkInner {
        ids,
        listeners: DashMap::new(),
        services: DashMap::new(),
      }),
    }
  }

  pub fn is_listening(&self, addr: &str) -> bool {
    self.inner.listeners.contains_key(addr) || self.inner.services.contains_key(addr)
  }
}

impl Default for MemoryNetwork {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for MemoryNetwork {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(MemoryNetwork))
      .field("listeners", &self.inner.listeners.len())
      .field("services", &self.inner.services.len())
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
  A,
  B,
}

struct Pipe {
  to_a: Mutex<Option<mpsc::UnboundedSender<Message>>>,
  to_b: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Pipe {
  fn toward(&self, side: Side) -> &Mutex<Option<mpsc::UnboundedSender<Message>>> {
    match side {
      Side::A => &self.to_a,
      Side::B => &self.to_b,
    }
  }
}

struct MemoryConnection {
  id: ConnectionId,
  side: Side,
  remote: String,
  pipe: Arc<Pipe>,
}

impl MemoryConnection {
  fn peer(&self) -> Side {
    match self.side {
      Side::A => Side::B,
      Side::B => Side::A,
    }
  }
}

impl Connection for MemoryConnection {
  fn id(&self) -> ConnectionId {
    self.id
  }

  fn remote(&self) -> Option<String> {
    Some(self.remote.clone())
  }

  fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>> {
    let sent = match self
      .pipe
      .toward(self.peer())
      .lock()
      .expect("Mutex poisoned")
      .as_ref()
    {
      Some(sender) => sender
        .send(message)
        .map_err(|_| TransportError::ConnectionClosed),
      None => Err(TransportError::ConnectionClosed),
    };
    futures::future::ready(sent).boxed()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    // Dropping both senders ends both incoming streams once they drain
    self.pipe.to_a.lock().expect("Mutex poisoned").take();
    self.pipe.to_b.lock().expect("Mutex poisoned").take();
    futures::future::ready(()).boxed()
  }

  fn is_closed(&self) -> bool {
    match self.pipe.toward(self.peer()).lock().expect("Mutex poisoned").as_ref() {
      Some(sender) => sender.is_closed(),
      None => true,
    }
  }
}

impl Drop for MemoryConnection {
  fn drop(&mut self) {
    // An abandoned side behaves like a closed socket
    self.pipe.to_a.lock().expect("Mutex poisoned").take();
    self.pipe.to_b.lock().expect("Mutex poisoned").take();
  }
}

/// Two connected in-memory links: `(a, b)`, where what `a` sends arrives on `b.incoming`
pub fn link_pair(
  a: ConnectionId,
  a_remote: impl Into<String>,
  b: ConnectionId,
  b_remote: impl Into<String>,
) -> (Link, Link) {
  let (to_a, a_incoming) = mpsc::unbounded_channel();
  let (to_b, b_incoming) = mpsc::unbounded_channel();
  let pipe = Arc::new(Pipe {
    to_a: Mutex::new(Some(to_a)),
    to_b: Mutex::new(Some(to_b)),
  });
  let link = |id: ConnectionId,
              side: Side,
              remote: String,
              incoming: mpsc::UnboundedReceiver<Message>| Link {
    connection: Arc::new(MemoryConnection {
      id,
      side,
      remote,
      pipe: Arc::clone(&pipe),
    }),
    incoming: UnboundedReceiverStream::new(incoming).map(Ok).boxed(),
  };
  (
    link(a, Side::A, a_remote.into(), a_incoming),
    link(b, Side::B, b_remote.into(), b_incoming),
  )
}

pub struct MemoryTransport {
  network: MemoryNetwork,
  bookkeeping: AdapterBookkeeping,
}

impl MemoryTransport {
  pub fn new(network: &MemoryNetwork) -> Self {
    Self {
      network: network.clone(),
      bookkeeping: AdapterBookkeeping::new(Arc::clone(&network.inner.ids)),
    }
  }

  pub fn network(&self) -> &MemoryNetwork {
    &self.network
  }

  pub fn bookkeeping(&self) -> &AdapterBookkeeping {
    &self.bookkeeping
  }
}

impl std::fmt::Debug for MemoryTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(MemoryTransport))
      .field("bookkeeping", &self.bookkeeping)
      .finish()
  }
}

impl AsyncTransport for MemoryTransport {
  fn start_server(&self, addr: &str) -> BoxFuture<'static, Result<Listener, TransportError>> {
    use dashmap::mapref::entry::Entry;
    let addr = addr.to_owned();
    let result = match self.network.inner.listeners.entry(addr.clone()) {
      Entry::Occupied(_) => Err(TransportError::AddressInUse(addr.clone())),
      Entry::Vacant(slot) => match self.bookkeeping.register_server(&addr) {
        Ok(stop) => {
          let (links, accepted) = mpsc::unbounded_channel();
          slot.insert(links);
          tracing::debug!(%addr, "Memory server listening");
          Ok(Listener {
            local_addr: addr.clone(),
            links: UnboundedReceiverStream::new(accepted)
              .take_until(async move { stop.cancelled().await })
              .boxed(),
          })
        }
        Err(e) => Err(e),
      },
    };
    futures::future::ready(result).boxed()
  }

  fn stop_server(&self, addr: &str) -> bool {
    self.network.inner.listeners.remove(addr);
    self.bookkeeping.stop_server(addr)
  }

  fn create_client(&self, addr: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
    let accept = self
      .network
      .inner
      .listeners
      .get(addr)
      .map(|listener| listener.value().clone());
    let result = match accept {
      None => Err(TransportError::ConnectionRefused(addr.to_owned())),
      Some(accept) => {
        let client_id = self.bookkeeping.next_connection_id();
        let server_id = self.bookkeeping.next_connection_id();
        let (client, server) = link_pair(
          client_id,
          addr,
          server_id,
          format!("memory-client-{}", client_id),
        );
        match accept.send(server) {
          Ok(()) => {
            self.bookkeeping.track_client(Arc::clone(&client.connection));
            Ok(client)
          }
          Err(_) => Err(TransportError::ConnectionRefused(addr.to_owned())),
        }
      }
    };
    futures::future::ready(result).boxed()
  }

  fn close_client(&self, id: ConnectionId) -> BoxFuture<'static, bool> {
    self.bookkeeping.close_client(id)
  }
}

impl SyncTransport for MemoryTransport {
  fn start_server(
    &self,
    addr: &str,
    handler: RequestHandler,
  ) -> BoxFuture<'static, Result<String, TransportError>> {
    use dashmap::mapref::entry::Entry;
    let addr = addr.to_owned();
    let result = match self.network.inner.services.entry(addr.clone()) {
      Entry::Occupied(_) => Err(TransportError::AddressInUse(addr)),
      Entry::Vacant(slot) => self.bookkeeping.register_server(&addr).map(|_| {
        slot.insert(handler);
        tracing::debug!(%addr, "Memory request server listening");
        addr
      }),
    };
    futures::future::ready(result).boxed()
  }

  fn stop_server(&self, addr: &str) -> bool {
    self.network.inner.services.remove(addr);
    self.bookkeeping.stop_server(addr)
  }

  fn request(
    &self,
    addr: &str,
    message: Message,
  ) -> BoxFuture<'static, Result<Message, TransportError>> {
    let handler = self
      .network
      .inner
      .services
      .get(addr)
      .map(|service| Arc::clone(service.value()));
    let addr = addr.to_owned();
    async move {
      match handler {
        Some(handler) => handler(message).await,
        None => Err(TransportError::ConnectionRefused(addr)),
      }
    }
    .boxed()
  }
}
