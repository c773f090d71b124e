// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod codec;
pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod hook;
pub mod matcher;
pub mod message;
pub mod step;
pub mod transport;
