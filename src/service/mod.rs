// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

pub mod agent;
pub mod daemon;
pub mod lifecycle;
pub mod metrics;

pub use agent::Agent;
pub use daemon::{Daemon, DaemonHandle};
pub use lifecycle::{DirectoryManager, IndexPaths};
pub use metrics::{AnnotationPublisher, IndexMetrics, MetricsExporter};
