//! Health-feedback hook — converts a streaming corruption event into
//! durable signals: descriptor status, a health row, and a per-path
//! failure counter that can trip file masking.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

use crate::meta::FileDescriptor;
use crate::store::MetadataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Pending,
    Error,
    Masked,
}

#[derive(Debug, Clone)]
pub struct HealthRow {
    pub status: HealthStatus,
    pub error: String,
    pub no_retry: bool,
    pub total_articles: u64,
    pub missing_articles: u64,
    pub failure_count: u32,
}

/// Durable store for per-path health rows.
pub trait HealthStore: Send + Sync {
    fn upsert(&self, path: &str, row: HealthRow);
    fn get(&self, path: &str) -> Option<HealthRow>;
    fn is_masked(&self, path: &str) -> bool;
}

/// In-memory health store. A production deployment would back this with a
/// persistent table, but the read path only needs a trait boundary here —
/// the same shape `cache::SegmentCache` uses for its own pluggable store.
#[derive(Default)]
pub struct InMemoryHealthStore {
    rows: RwLock<HashMap<String, HealthRow>>,
}

impl InMemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthStore for InMemoryHealthStore {
    fn upsert(&self, path: &str, row: HealthRow) {
        self.rows.write().insert(path.to_string(), row);
    }

    fn get(&self, path: &str) -> Option<HealthRow> {
        self.rows.read().get(path).cloned()
    }

    fn is_masked(&self, path: &str) -> bool {
        matches!(self.rows.read().get(path), Some(row) if row.status == HealthStatus::Masked)
    }
}

/// Report a fatal streaming error: marks the descriptor corrupted, upserts
/// a health row, and masks the path once `mask_threshold` consecutive
/// failures have been recorded. Every write is bounded by `timeout`; on
/// timeout the attempt is abandoned and a warning logged, never an error
/// surfaced to the stream caller (the corrupted-file error already carries
/// the failure to them).
pub async fn report_streaming_failure(
    metadata: &dyn MetadataStore,
    health: &dyn HealthStore,
    path: &str,
    mut descriptor: FileDescriptor,
    reason: String,
    total_articles: u64,
    missing_articles: u64,
    mask_threshold: u32,
    timeout: Duration,
) {
    let path_owned = path.to_string();
    let previous_failures = health.get(path).map(|r| r.failure_count).unwrap_or(0);
    let failure_count = previous_failures + 1;

    let write = async {
        descriptor.mark_corrupted();
        if let Err(e) = metadata.write_descriptor(&path_owned, &descriptor) {
            warn!(path = %path_owned, error = %e, "failed to persist corrupted descriptor status");
        }

        let status =
            if failure_count >= mask_threshold { HealthStatus::Masked } else { HealthStatus::Pending };
        health.upsert(
            &path_owned,
            HealthRow {
                status,
                error: reason,
                no_retry: false,
                total_articles,
                missing_articles,
                failure_count,
            },
        );
    };

    if tokio::time::timeout(timeout, write).await.is_err() {
        warn!(path, "health-feedback write exceeded timeout, continuing without it");
    }
}
