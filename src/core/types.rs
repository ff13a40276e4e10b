// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Internal object id assigned by the graph index.
pub type ObjectId = u32;

/// Logical mutation timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall clock as a mutation timestamp.
pub fn now_nanos() -> Timestamp {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distance {
    pub uuid: String,
    pub distance: f32,
}

impl Distance {
    pub fn new(uuid: impl Into<String>, distance: f32) -> Self {
        Self {
            uuid: uuid.into(),
            distance,
        }
    }
}

/// A vector together with the timestamp of the mutation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVector {
    pub uuid: String,
    pub vector: Vec<f32>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceType {
    #[default]
    L2,
    L1,
    Cosine,
}

impl DistanceType {
    pub fn measure(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceType::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
            DistanceType::L1 => a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum(),
            DistanceType::Cosine => {
                let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
                let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if mag_a == 0.0 || mag_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (mag_a * mag_b)
            }
        }
    }
}

impl FromStr for DistanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceType::L2),
            "l1" | "manhattan" => Ok(DistanceType::L1),
            "cosine" | "cos" => Ok(DistanceType::Cosine),
            other => Err(format!("unknown distance type: {}", other)),
        }
    }
}

impl fmt::Display for DistanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistanceType::L2 => "l2",
            DistanceType::L1 => "l1",
            DistanceType::Cosine => "cosine",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    #[default]
    Float,
    Uint8,
}

impl ObjectType {
    /// Brings a raw vector into the representation stored by the index.
    pub fn normalize(&self, mut vector: Vec<f32>) -> Vec<f32> {
        if let ObjectType::Uint8 = self {
            for v in vector.iter_mut() {
                *v = v.round().clamp(0.0, 255.0);
            }
        }
        vector
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float" | "float32" => Ok(ObjectType::Float),
            "uint8" | "u8" => Ok(ObjectType::Uint8),
            other => Err(format!("unknown object type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_measures() {
        let a = [0.0, 3.0];
        let b = [4.0, 0.0];
        assert_relative_eq!(DistanceType::L2.measure(&a, &b), 5.0);
        assert_relative_eq!(DistanceType::L1.measure(&a, &b), 7.0);
        assert_relative_eq!(DistanceType::Cosine.measure(&a, &b), 1.0);
        assert_relative_eq!(DistanceType::Cosine.measure(&a, &a), 0.0);
    }

    #[test]
    fn test_parse_types() {
        assert_eq!("Cosine".parse::<DistanceType>().unwrap(), DistanceType::Cosine);
        assert_eq!("uint8".parse::<ObjectType>().unwrap(), ObjectType::Uint8);
        assert!("hamming".parse::<DistanceType>().is_err());
    }

    #[test]
    fn test_uint8_normalization() {
        let v = ObjectType::Uint8.normalize(vec![-3.0, 12.4, 300.0]);
        assert_eq!(v, vec![0.0, 12.0, 255.0]);
    }
}
