// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Publication of index counters as pod annotations.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod annotations {
    pub const INDEX_COUNT: &str = "index-count";
    pub const UNCOMMITTED_COUNT: &str = "uncommitted-count";
    pub const UNSAVED_CREATE_INDEX_EXECUTION_COUNT: &str = "unsaved-create-index-execution-count";
    pub const UNSAVED_PROCESSED_VECTOR_COUNT: &str = "unsaved-processed-vector-count";
    pub const LAST_SAVE_TIMESTAMP: &str = "last-save-timestamp";
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to apply pod annotations: {0}")]
    Apply(String),
}

#[async_trait]
pub trait AnnotationPublisher: Send + Sync {
    async fn apply_pod_annotations(
        &self,
        pod_name: &str,
        namespace: &str,
        annotations: HashMap<String, String>,
    ) -> Result<(), PublishError>;
}

/// Counters exported on each event. Unset fields are not published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMetrics {
    pub index_count: Option<u64>,
    pub uncommitted_count: Option<u64>,
    pub unsaved_create_index_executions: Option<u64>,
    pub unsaved_processed_vectors: Option<u64>,
    pub last_save: Option<DateTime<Utc>>,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl IndexMetrics {
    pub fn to_annotations(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some(v) = self.index_count {
            out.insert(annotations::INDEX_COUNT.to_string(), v.to_string());
        }
        if let Some(v) = self.uncommitted_count {
            out.insert(annotations::UNCOMMITTED_COUNT.to_string(), v.to_string());
        }
        if let Some(v) = self.unsaved_create_index_executions {
            out.insert(
                annotations::UNSAVED_CREATE_INDEX_EXECUTION_COUNT.to_string(),
                v.to_string(),
            );
        }
        if let Some(v) = self.unsaved_processed_vectors {
            out.insert(
                annotations::UNSAVED_PROCESSED_VECTOR_COUNT.to_string(),
                v.to_string(),
            );
        }
        if let Some(ts) = &self.last_save {
            out.insert(
                annotations::LAST_SAVE_TIMESTAMP.to_string(),
                format_timestamp(ts),
            );
        }
        out
    }
}

/// Logs annotations instead of patching a pod.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl AnnotationPublisher for TracingPublisher {
    async fn apply_pod_annotations(
        &self,
        pod_name: &str,
        namespace: &str,
        annotations: HashMap<String, String>,
    ) -> Result<(), PublishError> {
        info!(pod = pod_name, namespace, ?annotations, "pod annotations");
        Ok(())
    }
}

/// Keeps every published annotation set in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    applied: Mutex<Vec<HashMap<String, String>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<HashMap<String, String>> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<HashMap<String, String>> {
        self.applied().pop()
    }

    /// Every key at its most recently published value.
    pub fn merged(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for set in self.applied() {
            merged.extend(set);
        }
        merged
    }
}

#[async_trait]
impl AnnotationPublisher for RecordingPublisher {
    async fn apply_pod_annotations(
        &self,
        _pod_name: &str,
        _namespace: &str,
        annotations: HashMap<String, String>,
    ) -> Result<(), PublishError> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(annotations);
        Ok(())
    }
}

pub struct MetricsExporter {
    publisher: Arc<dyn AnnotationPublisher>,
    pod_name: String,
    namespace: String,
}

impl MetricsExporter {
    pub fn new(
        publisher: Arc<dyn AnnotationPublisher>,
        pod_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            pod_name: pod_name.into(),
            namespace: namespace.into(),
        }
    }

    async fn publish(&self, event: &str, metrics: IndexMetrics) {
        debug!(event, ?metrics, "exporting index metrics");
        if let Err(e) = self
            .publisher
            .apply_pod_annotations(&self.pod_name, &self.namespace, metrics.to_annotations())
            .await
        {
            warn!("failed to export {} metrics: {}", event, e);
        }
    }

    pub async fn export_on_tick(&self, index_count: u64, uncommitted_count: u64) {
        self.publish(
            "tick",
            IndexMetrics {
                index_count: Some(index_count),
                uncommitted_count: Some(uncommitted_count),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn export_on_create_index(
        &self,
        index_count: u64,
        uncommitted_count: u64,
        unsaved_create_index_executions: u64,
        unsaved_processed_vectors: u64,
    ) {
        self.publish(
            "create_index",
            IndexMetrics {
                index_count: Some(index_count),
                uncommitted_count: Some(uncommitted_count),
                unsaved_create_index_executions: Some(unsaved_create_index_executions),
                unsaved_processed_vectors: Some(unsaved_processed_vectors),
                last_save: None,
            },
        )
        .await
    }

    pub async fn export_on_save_index(&self, index_count: u64, last_save: DateTime<Utc>) {
        self.publish(
            "save_index",
            IndexMetrics {
                index_count: Some(index_count),
                uncommitted_count: None,
                unsaved_create_index_executions: Some(0),
                unsaved_processed_vectors: Some(0),
                last_save: Some(last_save),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_annotations_full() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let metrics = IndexMetrics {
            index_count: Some(10),
            uncommitted_count: Some(2),
            unsaved_create_index_executions: Some(1),
            unsaved_processed_vectors: Some(10),
            last_save: Some(ts),
        };
        let out = metrics.to_annotations();
        assert_eq!(out.len(), 5);
        assert_eq!(out[annotations::INDEX_COUNT], "10");
        assert_eq!(out[annotations::LAST_SAVE_TIMESTAMP], "2024-03-01T12:30:00Z");
    }

    #[test]
    fn test_to_annotations_partial() {
        let metrics = IndexMetrics {
            index_count: Some(3),
            ..Default::default()
        };
        let out = metrics.to_annotations();
        assert_eq!(out.len(), 1);
        assert!(!out.contains_key(annotations::LAST_SAVE_TIMESTAMP));
    }

    #[tokio::test]
    async fn test_export_on_tick() {
        let publisher = Arc::new(RecordingPublisher::new());
        let exporter = MetricsExporter::new(publisher.clone(), "agent-0", "default");
        exporter.export_on_tick(5, 7).await;

        let last = publisher.last().unwrap();
        assert_eq!(last[annotations::INDEX_COUNT], "5");
        assert_eq!(last[annotations::UNCOMMITTED_COUNT], "7");
    }

    struct FailingPublisher;

    #[async_trait]
    impl AnnotationPublisher for FailingPublisher {
        async fn apply_pod_annotations(
            &self,
            _: &str,
            _: &str,
            _: HashMap<String, String>,
        ) -> Result<(), PublishError> {
            Err(PublishError::Apply("forbidden".into()))
        }
    }

    #[tokio::test]
    async fn test_export_failure_is_swallowed() {
        let exporter = MetricsExporter::new(Arc::new(FailingPublisher), "agent-0", "default");
        exporter.export_on_tick(1, 0).await;
    }
}
