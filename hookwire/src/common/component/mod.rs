// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Named endpoints of a scenario and the dispatch loop feeding their inbound traffic to hooks
//!
//! A component owns its hook registry and the live connections of its role. Each connection
//! is processed serially in its own loop; separate connections progress concurrently.
use dashmap::DashMap;
use futures::{
  future::{BoxFuture, FutureExt},
  stream::{BoxStream, StreamExt},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
  sync::{Arc, Mutex, Weak},
  time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  error::{FailureKind, ResourceError},
  handler::{execute_handlers, PipelineOutcome},
  hook::{HookError, HookId, HookMatch, HookMode, HookRegistry, HookSpec, RegisteredHook},
  message::{Message, PARAMS_METADATA_KEY, STATUS_METADATA_KEY},
  step::StepId,
  transport::{
    ArcConnection, AsyncTransport, ConnectionId, Link, MessageStream, RequestHandler,
    SyncTransport, TransportError,
  },
};
use crate::util::id::{IdGenerator, MonotonicAtomicGenerator};

pub mod session;

use session::{DialError, SessionMap, SharedDial};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);

/// What a component does on the network; a `target` on a server role makes it a proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Role {
  Server {
    listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },
  Client {
    target: String,
  },
  RequestServer {
    listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },
  RequestClient {
    target: String,
  },
}

impl Role {
  /// Request/response roles match message types against route templates
  pub fn is_request_response(&self) -> bool {
    matches!(self, Role::RequestServer { .. } | Role::RequestClient { .. })
  }

  pub fn proxy_target(&self) -> Option<&str> {
    match self {
      Role::Server { target, .. } | Role::RequestServer { target, .. } => target.as_deref(),
      Role::Client { .. } | Role::RequestClient { .. } => None,
    }
  }

  pub fn listen_addr(&self) -> Option<&str> {
    match self {
      Role::Server { listen, .. } | Role::RequestServer { listen, .. } => Some(listen),
      Role::Client { .. } | Role::RequestClient { .. } => None,
    }
  }
}

#[derive(Clone)]
pub enum TransportBinding {
  Async(Arc<dyn AsyncTransport>),
  Sync(Arc<dyn SyncTransport>),
}

impl TransportBinding {
  pub fn bidirectional(transport: Arc<impl AsyncTransport>) -> Self {
    TransportBinding::Async(transport)
  }

  pub fn request_response(transport: Arc<impl SyncTransport>) -> Self {
    TransportBinding::Sync(transport)
  }
}

impl std::fmt::Debug for TransportBinding {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      TransportBinding::Async(_) => "TransportBinding::Async",
      TransportBinding::Sync(_) => "TransportBinding::Sync",
    })
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ComponentError {
  #[error(transparent)]
  Resource(#[from] ResourceError),
  #[error("Transport failure in component {component:?}: {source}")]
  Transport {
    component: String,
    #[source]
    source: TransportError,
  },
  #[error(transparent)]
  Hook(#[from] HookError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
  Created,
  Started,
  Stopped,
}

/// An error raised outside any awaited step, surfaced when the test case ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentFailure {
  pub component: String,
  pub hook: Option<HookId>,
  pub step: Option<StepId>,
  pub kind: FailureKind,
  pub message: String,
}

/// Where an inbound message goes after its hook pipeline ran
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
  /// No hook matched; the message is delivered unchanged
  Unmatched(Message),
  Forward(Message),
  /// Send this back toward the sender of the matched message
  Reply(Message),
  Dropped,
  /// The pipeline failed; the failure was routed to the hook's waiter or the failure log
  Failed,
}

pub struct Component {
  name: String,
  role: Role,
  transport: TransportBinding,
  hooks: HookRegistry,
  sessions: SessionMap,
  connections: DashMap<ConnectionId, ArcConnection>,
  failures: Mutex<Vec<ComponentFailure>>,
  state: Mutex<ComponentState>,
  bound_addr: Mutex<Option<String>>,
  shutdown: CancellationToken,
  dial_timeout: Duration,
}

impl Component {
  pub fn new(name: impl Into<String>, role: Role, transport: TransportBinding) -> Self {
    let name = name.into();
    Self {
      hooks: HookRegistry::new(
        name.clone(),
        Arc::new(MonotonicAtomicGenerator::default()),
      ),
      name,
      role,
      transport,
      sessions: SessionMap::new(),
      connections: DashMap::new(),
      failures: Mutex::new(Vec::new()),
      state: Mutex::new(ComponentState::Created),
      bound_addr: Mutex::new(None),
      shutdown: CancellationToken::new(),
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
    }
  }

  pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
    self.hooks = HookRegistry::new(self.name.clone(), ids);
    self
  }

  pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
    self.dial_timeout = dial_timeout;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn role(&self) -> &Role {
    &self.role
  }

  pub fn hooks(&self) -> &HookRegistry {
    &self.hooks
  }

  pub fn sessions(&self) -> &SessionMap {
    &self.sessions
  }

  pub fn state(&self) -> ComponentState {
    *self.state.lock().expect("Mutex poisoned")
  }

  /// The address actually bound by a server role once started
  pub fn bound_addr(&self) -> Option<String> {
    self.bound_addr.lock().expect("Mutex poisoned").clone()
  }

  /// Live connections: accepted ones for a server, the single dialed one for a client
  pub fn connection_ids(&self) -> Vec<ConnectionId> {
    self.connections.iter().map(|entry| *entry.key()).collect()
  }

  pub fn register_hook(&self, spec: HookSpec) -> RegisteredHook {
    self.hooks.register_hook(spec)
  }

  /// Drains failures recorded by listen-mode hooks and connection loops
  pub fn take_failures(&self) -> Vec<ComponentFailure> {
    std::mem::take(&mut *self.failures.lock().expect("Mutex poisoned"))
  }

  fn record_failure(&self, hook: Option<&HookMatch>, kind: FailureKind, message: String) {
    tracing::warn!(component = %self.name, ?kind, %message, "Component failure");
    self
      .failures
      .lock()
      .expect("Mutex poisoned")
      .push(ComponentFailure {
        component: self.name.clone(),
        hook: hook.map(|hook| hook.hook),
        step: hook.and_then(|hook| hook.step),
        kind,
        message,
      });
  }

  fn transport_error(&self, source: TransportError) -> ComponentError {
    ComponentError::Transport {
      component: self.name.clone(),
      source,
    }
  }

  fn unsupported(&self, operation: &'static str) -> ComponentError {
    ResourceError::UnsupportedRole {
      component: self.name.clone(),
      operation,
    }
    .into()
  }

  fn ensure_started(&self) -> Result<(), ComponentError> {
    match self.state() {
      ComponentState::Started => Ok(()),
      _ => Err(ResourceError::NotStarted(self.name.clone()).into()),
    }
  }

  pub async fn start(self: &Arc<Self>) -> Result<(), ComponentError> {
    {
      let mut state = self.state.lock().expect("Mutex poisoned");
      if *state != ComponentState::Created {
        return Err(ResourceError::AlreadyStarted(self.name.clone()).into());
      }
      *state = ComponentState::Started;
    }
    let started = self.start_role().await;
    if started.is_err() {
      *self.state.lock().expect("Mutex poisoned") = ComponentState::Created;
    }
    started
  }

  async fn start_role(self: &Arc<Self>) -> Result<(), ComponentError> {
    let span = tracing::info_span!("component", name = %self.name);
    match (&self.role, &self.transport) {
      (Role::Server { listen, target }, TransportBinding::Async(transport)) => {
        let listener = transport
          .start_server(listen)
          .await
          .map_err(|e| self.transport_error(e))?;
        tracing::info!(component = %self.name, addr = %listener.local_addr, proxy = ?target, "Server started");
        *self.bound_addr.lock().expect("Mutex poisoned") = Some(listener.local_addr);
        tokio::spawn(Arc::clone(self).accept_loop(listener.links).instrument(span));
      }
      (Role::Client { target }, TransportBinding::Async(transport)) => {
        let link = transport
          .create_client(target)
          .await
          .map_err(|e| self.transport_error(e))?;
        tracing::info!(component = %self.name, %target, "Client connected");
        // Registered before the loop starts so sends immediately after start find it
        self
          .connections
          .insert(link.connection.id(), Arc::clone(&link.connection));
        tokio::spawn(Arc::clone(self).client_loop(link).instrument(span));
      }
      (Role::RequestServer { listen, .. }, TransportBinding::Sync(transport)) => {
        let addr = transport
          .start_server(listen, self.request_handler())
          .await
          .map_err(|e| self.transport_error(e))?;
        tracing::info!(component = %self.name, %addr, "Request server started");
        *self.bound_addr.lock().expect("Mutex poisoned") = Some(addr);
      }
      (Role::RequestClient { .. }, TransportBinding::Sync(_)) => {}
      _ => return Err(self.unsupported("start")),
    }
    Ok(())
  }

  /// Tears down every connection and session, then rejects and discards all hooks
  ///
  /// Idempotent; calling it on a never-started component only marks it stopped.
  pub async fn stop(&self) {
    let previous = std::mem::replace(
      &mut *self.state.lock().expect("Mutex poisoned"),
      ComponentState::Stopped,
    );
    if previous == ComponentState::Stopped {
      return;
    }
    self.shutdown.cancel();
    if let Some(addr) = self.bound_addr() {
      let stopped = match &self.transport {
        TransportBinding::Async(transport) => transport.stop_server(&addr),
        TransportBinding::Sync(transport) => transport.stop_server(&addr),
      };
      tracing::debug!(component = %self.name, %addr, stopped, "Stopped server");
    }
    for id in self.sessions.ids() {
      self.teardown_session(id).await;
    }
    let connections: Vec<ArcConnection> = self
      .connections
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    self.connections.clear();
    for connection in connections {
      connection.close().await;
    }
    self.hooks.reject_pending(HookError::Disconnected);
    self.hooks.clear_hooks();
    tracing::info!(component = %self.name, "Component stopped");
  }

  /// Sends to every live connection of this component, returning how many received it
  pub async fn send(&self, message: Message) -> Result<usize, ComponentError> {
    self.ensure_started()?;
    match &self.role {
      Role::Server { target: None, .. } | Role::Client { .. } => {}
      _ => return Err(self.unsupported("send")),
    }
    let message = message.traced();
    let connections: Vec<ArcConnection> = self
      .connections
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    if connections.is_empty() && matches!(self.role, Role::Client { .. }) {
      return Err(self.transport_error(TransportError::ConnectionClosed));
    }
    for connection in connections.iter() {
      connection
        .send(message.clone())
        .await
        .map_err(|e| self.transport_error(e))?;
    }
    tracing::trace!(component = %self.name, message_type = %message.message_type, delivered = connections.len(), "Sent");
    Ok(connections.len())
  }

  pub async fn send_to(&self, id: ConnectionId, message: Message) -> Result<(), ComponentError> {
    self.ensure_started()?;
    let connection = self
      .connections
      .get(&id)
      .map(|entry| Arc::clone(entry.value()))
      .ok_or_else(|| self.transport_error(TransportError::ConnectionClosed))?;
    connection
      .send(message.traced())
      .await
      .map_err(|e| self.transport_error(e))
  }

  /// Issues a request and runs the response through this component's hooks
  ///
  /// Returns the response as transformed by a matching pipeline, otherwise unchanged.
  pub async fn request(&self, message: Message) -> Result<Message, ComponentError> {
    self.ensure_started()?;
    let (target, transport) = match (&self.role, &self.transport) {
      (Role::RequestClient { target }, TransportBinding::Sync(transport)) => (target, transport),
      _ => return Err(self.unsupported("request")),
    };
    let response = transport
      .request(target, message.traced())
      .await
      .map_err(|e| self.transport_error(e))?;
    Ok(match self.dispatch(response.clone()).await {
      Dispatch::Forward(transformed) => transformed,
      _ => response,
    })
  }

  /// Closes a client's connection as though the peer went away
  pub async fn disconnect(&self) -> Result<(), ComponentError> {
    self.ensure_started()?;
    if !matches!(self.role, Role::Client { .. }) {
      return Err(self.unsupported("disconnect"));
    }
    let connections: Vec<ArcConnection> = self
      .connections
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    for connection in connections {
      connection.close().await;
    }
    Ok(())
  }

  /// Runs an inbound message through the first matching hook and settles it
  pub async fn dispatch(&self, message: Message) -> Dispatch {
    let matched = match self.hooks.find_matching_hook(&message) {
      Some(matched) => matched,
      None => {
        tracing::trace!(component = %self.name, message_type = %message.message_type, "No hook matched");
        return Dispatch::Unmatched(message);
      }
    };
    let message = match &matched.params {
      Some(params) => message.with_metadata(PARAMS_METADATA_KEY, json!(params)),
      None => message,
    };
    let span = tracing::debug_span!("hook", component = %self.name, hook = ?matched.hook);
    let outcome = execute_handlers(&matched.handlers, &message)
      .instrument(span)
      .await;
    match outcome {
      Ok(PipelineOutcome::Forward(payload)) => {
        let forwarded = message.with_payload(payload);
        self.settle(&matched, forwarded.clone());
        Dispatch::Forward(forwarded)
      }
      Ok(PipelineOutcome::Reply(reply)) => {
        self.settle(&matched, message);
        Dispatch::Reply(reply)
      }
      Ok(PipelineOutcome::Dropped) => {
        self.settle(&matched, message);
        Dispatch::Dropped
      }
      Err(error) => {
        let error = HookError::from(error);
        match matched.mode {
          HookMode::Wait => {
            self.hooks.reject_hook(matched.hook, error);
          }
          HookMode::Listen => {
            self.record_failure(Some(&matched), error.failure_kind(), error.to_string())
          }
        }
        Dispatch::Failed
      }
    }
  }

  fn settle(&self, matched: &HookMatch, message: Message) {
    if matched.mode == HookMode::Wait {
      self.hooks.resolve_hook(matched.hook, message);
    }
  }

  async fn accept_loop(self: Arc<Self>, links: BoxStream<'static, Link>) {
    let shutdown = self.shutdown.clone();
    links
      .take_until(async move { shutdown.cancelled().await })
      .for_each_concurrent(None, |link| {
        let this = Arc::clone(&self);
        async move {
          let id = link.connection.id();
          let connection = Arc::clone(&link.connection);
          // Each link runs in its own task so a panicking hook only ends its own connection
          let served = tokio::spawn(Arc::clone(&this).serve_link(link).in_current_span()).await;
          if let Err(error) = served {
            this.record_failure(
              None,
              FailureKind::Unhandled,
              format!("Connection {} task failed: {}", id, error),
            );
            this.connections.remove(&id);
            connection.close().await;
            this.teardown_session(id).await;
          }
        }
      })
      .await;
    tracing::debug!(component = %self.name, "Accept loop ended");
  }

  async fn serve_link(self: Arc<Self>, link: Link) {
    match self.role.proxy_target() {
      Some(target) => {
        let target = target.to_owned();
        self.serve_proxy_session(link, target).await
      }
      None => {
        self.serve_connection(link).await;
        if self.connections.is_empty() {
          let rejected = self.hooks.reject_pending(HookError::Disconnected);
          tracing::debug!(component = %self.name, rejected, "Last connection ended");
        }
      }
    }
  }

  async fn client_loop(self: Arc<Self>, link: Link) {
    self.serve_connection(link).await;
    let rejected = self.hooks.reject_pending(HookError::Disconnected);
    tracing::debug!(component = %self.name, rejected, "Client connection ended");
  }

  async fn serve_connection(&self, link: Link) {
    let Link {
      connection,
      incoming,
    } = link;
    let id = connection.id();
    self.connections.insert(id, Arc::clone(&connection));
    let shutdown = self.shutdown.clone();
    let mut incoming = Box::pin(incoming.take_until(async move { shutdown.cancelled().await }));
    while let Some(received) = incoming.next().await {
      let message = match received {
        Ok(message) => message,
        Err(error) => {
          self.record_failure(None, FailureKind::Unhandled, error.to_string());
          continue;
        }
      };
      if let Dispatch::Reply(reply) = self.dispatch(message).await {
        match connection.send(reply).await {
          Ok(()) => {}
          Err(TransportError::ConnectionClosed) => {
            tracing::debug!(component = %self.name, connection = %id, "Peer left before its reply was sent");
            break;
          }
          Err(error) => self.record_failure(None, FailureKind::Unhandled, error.to_string()),
        }
      }
    }
    self.connections.remove(&id);
    connection.close().await;
  }

  async fn serve_proxy_session(self: &Arc<Self>, link: Link, target: String) {
    let Link {
      connection: client,
      incoming,
    } = link;
    let id = client.id();
    let session = self.shutdown.child_token();
    let (dialed, dial) = futures::channel::oneshot::channel();
    let dial = async move { dial.await.unwrap_or(Err(DialError::Abandoned)) }
      .boxed()
      .shared();
    self
      .sessions
      .open(id, Arc::clone(&client), dial.clone(), session.clone());
    let span = tracing::debug_span!("session", component = %self.name, connection = %id, %target);
    tracing::debug!(parent: &span, "Session accepted; dialing backend");
    tokio::spawn(
      Arc::clone(self)
        .dial_backend(id, Arc::clone(&client), target, dialed, session.clone())
        .instrument(span.clone()),
    );
    self
      .pump_client(client, incoming, dial, session)
      .instrument(span)
      .await;
    self.teardown_session(id).await;
  }

  async fn dial_backend(
    self: Arc<Self>,
    id: ConnectionId,
    client: ArcConnection,
    target: String,
    dialed: futures::channel::oneshot::Sender<Result<ArcConnection, DialError>>,
    session: CancellationToken,
  ) {
    let transport = match &self.transport {
      TransportBinding::Async(transport) => Arc::clone(transport),
      TransportBinding::Sync(_) => return,
    };
    let dial = tokio::time::timeout(self.dial_timeout, transport.create_client(&target));
    let dialed_link = tokio::select! {
      result = dial => result,
      _ = session.cancelled() => {
        let _ = dialed.send(Err(DialError::Abandoned));
        return;
      }
    };
    let link = match dialed_link {
      Ok(Ok(link)) => link,
      Ok(Err(e)) => {
        let error = DialError::Failed {
          target,
          reason: e.to_string(),
        };
        self.record_failure(None, FailureKind::Unhandled, error.to_string());
        let _ = dialed.send(Err(error));
        self.teardown_session(id).await;
        return;
      }
      Err(_elapsed) => {
        let error = DialError::Timeout {
          target,
          timeout: self.dial_timeout,
        };
        self.record_failure(None, FailureKind::Timeout, error.to_string());
        let _ = dialed.send(Err(error));
        self.teardown_session(id).await;
        return;
      }
    };
    let Link {
      connection: backend,
      incoming,
    } = link;
    if !self.sessions.activate(id, Arc::clone(&backend)) {
      let _ = dialed.send(Err(DialError::Abandoned));
      backend.close().await;
      return;
    }
    tracing::debug!(backend = %backend.id(), "Backend connected");
    let _ = dialed.send(Ok(Arc::clone(&backend)));
    self.pump_backend(client, backend, incoming, session).await;
    self.teardown_session(id).await;
  }

  async fn pump_client(
    &self,
    client: ArcConnection,
    incoming: MessageStream,
    dial: SharedDial,
    session: CancellationToken,
  ) {
    let mut incoming = Box::pin(incoming.take_until(async move { session.cancelled().await }));
    while let Some(received) = incoming.next().await {
      let message = match received {
        Ok(message) => message,
        Err(error) => {
          self.record_failure(None, FailureKind::Unhandled, error.to_string());
          break;
        }
      };
      match self.dispatch(message).await {
        Dispatch::Reply(reply) => {
          if client.send(reply).await.is_err() {
            break;
          }
        }
        Dispatch::Forward(message) | Dispatch::Unmatched(message) => {
          let backend = match dial.clone().await {
            Ok(backend) => backend,
            Err(error) => {
              tracing::debug!(%error, "No backend to forward to");
              break;
            }
          };
          if let Err(error) = backend.send(message).await {
            self.record_failure(None, FailureKind::Unhandled, error.to_string());
            break;
          }
        }
        Dispatch::Dropped | Dispatch::Failed => {}
      }
    }
  }

  /// Delivers backend traffic to the one client this session was opened for
  async fn pump_backend(
    &self,
    client: ArcConnection,
    backend: ArcConnection,
    incoming: MessageStream,
    session: CancellationToken,
  ) {
    let mut incoming = Box::pin(incoming.take_until(async move { session.cancelled().await }));
    while let Some(received) = incoming.next().await {
      let message = match received {
        Ok(message) => message,
        Err(error) => {
          self.record_failure(None, FailureKind::Unhandled, error.to_string());
          break;
        }
      };
      match self.dispatch(message).await {
        Dispatch::Reply(reply) => {
          if backend.send(reply).await.is_err() {
            break;
          }
        }
        Dispatch::Forward(message) | Dispatch::Unmatched(message) => {
          if let Err(error) = client.send(message).await {
            tracing::debug!(%error, "Client went away before backend traffic was delivered");
            break;
          }
        }
        Dispatch::Dropped | Dispatch::Failed => {}
      }
    }
  }

  /// Closes both sides of a session exactly once, whichever side ended first
  async fn teardown_session(&self, id: ConnectionId) {
    if let Some(closing) = self.sessions.begin_close(id) {
      closing.token.cancel();
      closing.incoming.close().await;
      if let Some(outgoing) = closing.outgoing {
        outgoing.close().await;
      }
      self.sessions.finish_close(id);
      tracing::debug!(component = %self.name, connection = %id, "Session closed");
    }
  }

  fn request_handler(self: &Arc<Self>) -> RequestHandler {
    let this: Weak<Self> = Arc::downgrade(self);
    Arc::new(move |request: Message| -> BoxFuture<'static, Result<Message, TransportError>> {
      let this = this.clone();
      async move {
        match this.upgrade() {
          Some(component) => component.handle_request(request).await,
          None => Err(TransportError::ConnectionClosed),
        }
      }
      .boxed()
    })
  }

  async fn handle_request(&self, request: Message) -> Result<Message, TransportError> {
    let forwarded = match self.dispatch(request).await {
      Dispatch::Reply(response) => return Ok(response),
      Dispatch::Forward(request) | Dispatch::Unmatched(request) => request,
      Dispatch::Dropped | Dispatch::Failed => return Err(TransportError::NoResponse),
    };
    let (target, transport) = match (self.role.proxy_target(), &self.transport) {
      (Some(target), TransportBinding::Sync(transport)) => (target, transport),
      _ => return Ok(not_found(&forwarded)),
    };
    let response = transport.request(target, forwarded).await?;
    match self.dispatch(response.clone()).await {
      Dispatch::Reply(reply) => Ok(reply),
      Dispatch::Forward(response) | Dispatch::Unmatched(response) => Ok(response),
      Dispatch::Dropped => Err(TransportError::NoResponse),
      Dispatch::Failed => Ok(response),
    }
  }
}

/// The answer of a request server with nothing to mock and nowhere to forward
fn not_found(request: &Message) -> Message {
  request
    .reply(
      request.message_type.clone(),
      json!({ "error": "No hook matched the request" }),
    )
    .with_metadata(STATUS_METADATA_KEY, json!(404))
}

impl std::fmt::Debug for Component {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(Component))
      .field("name", &self.name)
      .field("role", &self.role)
      .field("state", &self.state())
      .field("hooks", &self.hooks.len())
      .field("connections", &self.connections.len())
      .field("sessions", &self.sessions)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::{Component, ComponentError, ComponentState, Role, TransportBinding};
  use crate::common::{
    error::{FailureKind, ResourceError},
    handler::Handler,
    hook::{HookError, HookMode, HookPhase, HookSpec},
    matcher::{build_matcher, MatcherOptions},
    message::Message,
    transport::{
      memory::{MemoryNetwork, MemoryTransport},
      AsyncTransport, ConnectionId, Link, Listener, TransportError,
    },
  };
  use futures::{
    future::{BoxFuture, FutureExt},
    StreamExt,
  };
  use serde_json::json;
  use std::{sync::Arc, time::Duration};

  /// Memory transport whose outbound dials take `delay` to complete
  struct SlowDial {
    inner: Arc<MemoryTransport>,
    delay: Duration,
  }

  impl AsyncTransport for SlowDial {
    fn start_server(&self, addr: &str) -> BoxFuture<'static, Result<Listener, TransportError>> {
      AsyncTransport::start_server(self.inner.as_ref(), addr)
    }

    fn stop_server(&self, addr: &str) -> bool {
      AsyncTransport::stop_server(self.inner.as_ref(), addr)
    }

    fn create_client(&self, addr: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
      let inner = Arc::clone(&self.inner);
      let addr = addr.to_owned();
      let delay = self.delay;
      async move {
        tokio::time::sleep(delay).await;
        inner.create_client(&addr).await
      }
      .boxed()
    }

    fn close_client(&self, id: ConnectionId) -> BoxFuture<'static, bool> {
      self.inner.close_client(id)
    }
  }

  fn slow_proxy(transport: &Arc<MemoryTransport>, delay: Duration, dial_timeout: Duration) -> Arc<Component> {
    Arc::new(
      Component::new(
        "proxy",
        Role::Server {
          listen: "proxy".into(),
          target: Some("backend".into()),
        },
        TransportBinding::bidirectional(Arc::new(SlowDial {
          inner: Arc::clone(transport),
          delay,
        })),
      )
      .with_dial_timeout(dial_timeout),
    )
  }

  fn spec(message_type: &str, mode: HookMode, handlers: Vec<Handler>, templated: bool) -> HookSpec {
    HookSpec {
      step: None,
      description: message_type.to_owned(),
      phase: HookPhase::Test,
      mode,
      matcher: build_matcher(
        message_type.into(),
        MatcherOptions {
          payload: None,
          templated,
        },
      ),
      handlers: handlers.into(),
    }
  }

  fn server(name: &str, listen: &str, target: Option<&str>, transport: &Arc<MemoryTransport>) -> Arc<Component> {
    Arc::new(Component::new(
      name,
      Role::Server {
        listen: listen.to_owned(),
        target: target.map(str::to_owned),
      },
      TransportBinding::bidirectional(Arc::clone(transport)),
    ))
  }

  async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
      if condition() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
  }

  #[tokio::test]
  async fn server_replies_with_mocked_response() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let server = server("server", "svc", None, &transport);
    server.start().await.unwrap();
    server.register_hook(spec(
      "Ping",
      HookMode::Listen,
      vec![Handler::mock_response(|p| Ok(json!({ "pong": p["seq"] })))],
      false,
    ));

    let mut link = transport.create_client("svc").await.unwrap();
    link
      .connection
      .send(Message::new("Ping", json!({"seq": 7})).with_trace_id("t"))
      .await
      .unwrap();
    let reply = link.incoming.next().await.unwrap().unwrap();
    assert_eq!(reply.message_type, "Ping");
    assert_eq!(reply.payload, json!({"pong": 7}));
    assert_eq!(reply.trace_id.as_deref(), Some("t"));

    server.stop().await;
    assert_eq!(server.state(), ComponentState::Stopped);
    assert!(server.hooks().is_empty());
    assert!(link.incoming.next().await.is_none());
  }

  #[tokio::test]
  async fn operations_require_a_started_component_in_a_fitting_role() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let client = Arc::new(Component::new(
      "client",
      Role::Client {
        target: "svc".into(),
      },
      TransportBinding::bidirectional(Arc::clone(&transport)),
    ));
    assert!(matches!(
      client.send(Message::new("Ping", json!(null))).await,
      Err(ComponentError::Resource(ResourceError::NotStarted(_)))
    ));

    let mismatched = Arc::new(Component::new(
      "mismatched",
      Role::Server {
        listen: "svc".into(),
        target: None,
      },
      TransportBinding::request_response(Arc::clone(&transport)),
    ));
    assert!(matches!(
      mismatched.start().await,
      Err(ComponentError::Resource(ResourceError::UnsupportedRole { .. }))
    ));
    assert_eq!(mismatched.state(), ComponentState::Created);

    // Nothing listens at "svc", so the dial is refused and the component stays unstarted
    assert!(matches!(
      client.start().await,
      Err(ComponentError::Transport { .. })
    ));
  }

  #[tokio::test]
  async fn pending_waits_reject_when_the_client_disconnects() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let server = server("server", "svc", None, &transport);
    let client = Arc::new(Component::new(
      "client",
      Role::Client {
        target: "svc".into(),
      },
      TransportBinding::bidirectional(Arc::clone(&transport)),
    ));
    server.start().await.unwrap();
    client.start().await.unwrap();

    let pending = client
      .register_hook(spec("Never", HookMode::Wait, vec![], false))
      .pending
      .unwrap();
    client.disconnect().await.unwrap();
    assert_eq!(
      pending.wait(Duration::from_secs(5)).await,
      Err(HookError::Disconnected)
    );
    client.stop().await;
    server.stop().await;
  }

  #[tokio::test]
  async fn proxy_routes_each_backend_reply_to_its_own_client() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let backend = server("backend", "backend", None, &transport);
    let proxy = server("proxy", "proxy", Some("backend"), &transport);
    backend.start().await.unwrap();
    proxy.start().await.unwrap();
    backend.register_hook(spec(
      "Hello",
      HookMode::Listen,
      vec![Handler::mock_event("Welcome", |p| Ok(p.clone())).unwrap()],
      false,
    ));
    proxy.register_hook(spec(
      "Hello",
      HookMode::Listen,
      vec![Handler::proxy(|mut p| {
        if let Some(upper) = p["name"].as_str().map(str::to_uppercase) {
          p["name"] = json!(upper);
        }
        Ok(p)
      })],
      false,
    ));

    let mut a = transport.create_client("proxy").await.unwrap();
    let mut b = transport.create_client("proxy").await.unwrap();
    a.connection
      .send(Message::new("Hello", json!({"name": "a"})))
      .await
      .unwrap();
    b.connection
      .send(Message::new("Hello", json!({"name": "b"})))
      .await
      .unwrap();

    let to_a = a.incoming.next().await.unwrap().unwrap();
    let to_b = b.incoming.next().await.unwrap().unwrap();
    assert_eq!(to_a.message_type, "Welcome");
    assert_eq!(to_a.payload, json!({"name": "A"}));
    assert_eq!(to_b.payload, json!({"name": "B"}));
    assert_eq!(proxy.sessions().len(), 2);

    a.connection.close().await;
    assert!(eventually(|| proxy.sessions().len() == 1).await);
    proxy.stop().await;
    assert!(eventually(|| proxy.sessions().is_empty()).await);
    assert!(b.incoming.next().await.is_none());
    backend.stop().await;
  }

  #[tokio::test]
  async fn failed_backend_dial_closes_the_accepted_connection() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let proxy = server("proxy", "proxy", Some("missing"), &transport);
    proxy.start().await.unwrap();

    let mut link = transport.create_client("proxy").await.unwrap();
    let _ = link
      .connection
      .send(Message::new("Hello", json!(null)))
      .await;
    assert!(link.incoming.next().await.is_none());
    let failures = proxy.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Unhandled);
    assert!(eventually(|| proxy.sessions().is_empty()).await);
    proxy.stop().await;
  }

  #[tokio::test]
  async fn request_server_mocks_routes_and_answers_404_otherwise() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let api = Arc::new(Component::new(
      "api",
      Role::RequestServer {
        listen: "api".into(),
        target: None,
      },
      TransportBinding::request_response(Arc::clone(&transport)),
    ));
    let caller = Arc::new(Component::new(
      "caller",
      Role::RequestClient {
        target: "api".into(),
      },
      TransportBinding::request_response(Arc::clone(&transport)),
    ));
    api.start().await.unwrap();
    caller.start().await.unwrap();

    let pending = api
      .register_hook(spec(
        "GET /users/{id}",
        HookMode::Wait,
        vec![Handler::mock_response(|_| Ok(json!({"name": "Ada"})))],
        true,
      ))
      .pending
      .unwrap();
    let response = caller
      .request(Message::new("GET /users/42?verbose=1", json!(null)))
      .await
      .unwrap();
    assert_eq!(response.payload, json!({"name": "Ada"}));
    let seen = pending.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(seen.params().unwrap()["id"], json!("42"));

    let missing = caller
      .request(Message::new("GET /orders", json!(null)))
      .await
      .unwrap();
    assert_eq!(missing.status(), Some(404));
    caller.stop().await;
    api.stop().await;
  }

  #[tokio::test]
  async fn server_rejects_pending_waits_when_its_last_peer_leaves() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let server = server("server", "svc", None, &transport);
    server.start().await.unwrap();
    let a = transport.create_client("svc").await.unwrap();
    let b = transport.create_client("svc").await.unwrap();
    assert!(eventually(|| server.connection_ids().len() == 2).await);

    let registered = server.register_hook(spec("Never", HookMode::Wait, vec![], false));
    a.connection.close().await;
    assert!(eventually(|| server.connection_ids().len() == 1).await);
    assert!(!server.hooks().hook(registered.id).unwrap().resolved);

    b.connection.close().await;
    assert_eq!(
      registered.pending.unwrap().wait(Duration::from_secs(5)).await,
      Err(HookError::Disconnected)
    );
    server.stop().await;
  }

  #[tokio::test]
  async fn a_panicking_hook_only_ends_its_own_connection() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let server = server("server", "svc", None, &transport);
    server.start().await.unwrap();
    server.register_hook(HookSpec {
      matcher: build_matcher(
        "Login".into(),
        MatcherOptions {
          payload: Some(Arc::new(|p: &serde_json::Value| {
            Ok(p["user"].as_str().unwrap().len() > 1)
          })),
          templated: false,
        },
      ),
      ..spec(
        "Login",
        HookMode::Listen,
        vec![Handler::mock_event("LoginOk", |p| Ok(p.clone())).unwrap()],
        false,
      )
    });
    server.register_hook(spec(
      "Crash",
      HookMode::Listen,
      vec![Handler::transform(|p| Ok(json!(p["n"].as_u64().unwrap() + 1)))],
      false,
    ));

    let mut first = transport.create_client("svc").await.unwrap();
    first
      .connection
      .send(Message::new("Login", json!({"user": 5})))
      .await
      .unwrap();
    first
      .connection
      .send(Message::new("Crash", json!({})))
      .await
      .unwrap();
    assert!(first.incoming.next().await.is_none());
    assert!(eventually(|| server.connection_ids().is_empty()).await);
    let failures = server.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Unhandled);

    let mut second = transport.create_client("svc").await.unwrap();
    second
      .connection
      .send(Message::new("Login", json!({"user": "alice"})))
      .await
      .unwrap();
    let reply = second.incoming.next().await.unwrap().unwrap();
    assert_eq!(reply.message_type, "LoginOk");
    assert_eq!(reply.payload, json!({"user": "alice"}));
    server.stop().await;
  }

  #[tokio::test]
  async fn drop_in_a_proxy_reaches_no_peer() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let backend = server("backend", "backend", None, &transport);
    let proxy = server("proxy", "proxy", Some("backend"), &transport);
    backend.start().await.unwrap();
    proxy.start().await.unwrap();
    proxy.register_hook(spec("Secret", HookMode::Listen, vec![Handler::Drop], false));
    let first_seen = backend
      .register_hook(HookSpec {
        matcher: build_matcher(["Secret", "Open"].into(), MatcherOptions::default()),
        ..spec("Secret | Open", HookMode::Wait, vec![], false)
      })
      .pending
      .unwrap();

    let client = transport.create_client("proxy").await.unwrap();
    client
      .connection
      .send(Message::new("Secret", json!({"pin": 1234})))
      .await
      .unwrap();
    client
      .connection
      .send(Message::new("Open", json!(null)))
      .await
      .unwrap();
    let seen = first_seen.wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(seen.message_type, "Open");
    assert!(proxy.take_failures().is_empty());
    proxy.stop().await;
    backend.stop().await;
  }

  #[tokio::test]
  async fn backend_going_away_closes_the_linked_client() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let backend = server("backend", "backend", None, &transport);
    let proxy = server("proxy", "proxy", Some("backend"), &transport);
    backend.start().await.unwrap();
    proxy.start().await.unwrap();

    let mut client = transport.create_client("proxy").await.unwrap();
    assert!(eventually(|| backend.connection_ids().len() == 1).await);
    assert_eq!(proxy.sessions().len(), 1);
    backend.stop().await;
    assert!(client.incoming.next().await.is_none());
    assert!(eventually(|| proxy.sessions().is_empty()).await);
    proxy.stop().await;
  }

  #[tokio::test]
  async fn slow_backend_dial_times_out() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let backend = server("backend", "backend", None, &transport);
    backend.start().await.unwrap();
    let proxy = slow_proxy(&transport, Duration::from_secs(2), Duration::from_millis(20));
    proxy.start().await.unwrap();

    let mut client = transport.create_client("proxy").await.unwrap();
    assert!(client.incoming.next().await.is_none());
    let failures = proxy.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Timeout);
    assert!(eventually(|| proxy.sessions().is_empty()).await);
    assert!(backend.connection_ids().is_empty());
    proxy.stop().await;
    backend.stop().await;
  }

  #[tokio::test]
  async fn traffic_sent_before_the_dial_completes_is_forwarded_after_it() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(MemoryTransport::new(&network));
    let backend = server("backend", "backend", None, &transport);
    backend.start().await.unwrap();
    let proxy = slow_proxy(&transport, Duration::from_millis(50), Duration::from_secs(2));
    proxy.start().await.unwrap();
    let pending = backend
      .register_hook(spec("Early", HookMode::Wait, vec![], false))
      .pending
      .unwrap();

    let client = transport.create_client("proxy").await.unwrap();
    client
      .connection
      .send(Message::new("Early", json!({"seq": 1})))
      .await
      .unwrap();
    let seen = pending.wait(Duration::from_secs(2)).await.unwrap();
    assert_eq!(seen.payload, json!({"seq": 1}));
    assert!(proxy.take_failures().is_empty());
    proxy.stop().await;
    backend.stop().await;
  }
}
