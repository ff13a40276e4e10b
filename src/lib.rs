// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Index lifecycle and write buffering for a vector search agent.

pub mod config;
pub mod core;
pub mod graph;
pub mod kvs;
pub mod metadata;
pub mod service;
pub mod vqueue;

pub use config::{AgentConfig, DaemonConfig};
pub use crate::core::{AgentError, Distance, Result};
pub use service::{Agent, Daemon, DaemonHandle};
