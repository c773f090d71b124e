// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Hook-based message routing and proxy session engine for protocol test harnesses.
//!
//! Components own a [hook registry](common::hook::HookRegistry) which matches inbound
//! messages and runs [handler pipelines](common::handler) against them; proxying servers
//! additionally keep one backend connection per accepted client. The
//! [execution engine](common::engine) drives declarative test cases against those components.

pub mod common;
pub mod util;

pub use common::{
  component::{Component, ComponentError, Role},
  engine::{Scenario, TestContext},
  message::Message,
};
