// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

pub mod error;
pub mod types;

pub use error::{AgentError, Result};
pub use types::{
    now_nanos, Distance, DistanceType, ObjectId, ObjectType, ObjectVector, Timestamp,
};
