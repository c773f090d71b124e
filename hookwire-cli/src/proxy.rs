// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use hookwire::{
  common::{
    component::TransportBinding,
    transport::tcp::TcpTransport,
  },
  Component, Role,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// Parameters used to run a session-pairing TCP proxy
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ProxyArgs {
  pub listen: SocketAddr,
  pub target: SocketAddr,
  pub dial_timeout: Duration,
}

impl ProxyArgs {
  pub fn component(&self, transport: TransportBinding) -> Component {
    Component::new(
      "proxy",
      Role::Server {
        listen: self.listen.to_string(),
        target: Some(self.target.to_string()),
      },
      transport,
    )
    .with_dial_timeout(self.dial_timeout)
  }
}

pub async fn proxy_main(config: ProxyArgs) -> Result<()> {
  let transport = TransportBinding::bidirectional(Arc::new(TcpTransport::new()));
  let proxy = Arc::new(config.component(transport));
  proxy.start().await?;
  tracing::info!(
    listen = ?proxy.bound_addr(),
    target = %config.target,
    "Proxy ready; press Ctrl-C to stop"
  );
  tokio::signal::ctrl_c().await?;
  tracing::info!(sessions = proxy.sessions().len(), "Shutting down");
  proxy.stop().await;
  for failure in proxy.take_failures() {
    tracing::warn!(kind = ?failure.kind, "{}", failure.message);
  }
  Ok(())
}
