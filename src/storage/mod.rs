//! # Storage Backend Trait
//!
//! The contract between the commit/query engines and any document store.
//! Every operation the object layer needs against the underlying store is
//! defined here: document load/save/bulk ops, the `_handled_by` row-lock
//! primitive the commit engine uses for its lock phase, and index
//! management. Calls that can hit a transient reconnect error go through
//! [`retry`] with the fixed backoff schedule from the design notes.

pub mod memory;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instance::{AttrData, ToiId};
use crate::value::Value;

pub use memory::MemoryBackend;

/// `0, 0.1, 0.5, 1, 2, 5, 5, 5, 5` seconds — nine attempts total.
pub const BACKOFF_SCHEDULE_MS: &[u64] = &[0, 100, 500, 1000, 2000, 5000, 5000, 5000, 5000];

/// A storage-layer failure distinct from the client-facing [`Error`]
/// taxonomy: transient failures are retried by [`retry`]; fatal ones
/// propagate immediately, converted to `Error::Internal`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Fatal(String),
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Internal(e.to_string())
    }
}

/// Retries `op` up to [`BACKOFF_SCHEDULE_MS`]'s length on
/// `StorageError::Transient`; a `Fatal` error propagates immediately.
pub async fn retry<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, StorageError>>,
{
    let mut last = None;
    for &delay_ms in BACKOFF_SCHEDULE_MS {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(StorageError::Fatal(msg)) => return Err(Error::Internal(msg)),
            Err(e @ StorageError::Transient(_)) => last = Some(e),
        }
    }
    Err(last.map(Error::from).unwrap_or_else(|| Error::Internal("retry exhausted".into())))
}

/// The persisted document envelope: `{_id, _toc, _bases, _handled_by?,
/// ...attrs, allowRead}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: ToiId,
    pub toc: String,
    pub bases: Vec<String>,
    pub handled_by: Option<String>,
    pub attrs: AttrData,
    pub allow_read: Vec<Value>,
}

/// One write in a bulk batch, matching the three write shapes the commit
/// engine's persistence step issues.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert(Document),
    SetAttrs { id: ToiId, attrs: AttrData },
    Delete(ToiId),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageCapabilities {
    pub supports_fulltext: bool,
    pub supports_transactions: bool,
    pub max_batch_size: Option<usize>,
}

/// Index kinds the adapter is asked to maintain (`_toc`, `_bases`,
/// `allowRead.id` on instances; `timestamp` on clients; `metadata.references.value`
/// on blobs — see §6).
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub field: &'static str,
}

/// The universal storage contract. A backend that can't support an
/// optional capability (fulltext, transactions) reports so via
/// `capabilities()` rather than failing calls at random.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Runs a query predicate (already translated by the query model)
    /// against the instance collection, returning full documents for the
    /// requested projection (identity and `_toc`/`_bases` are always
    /// included by the caller's projection list).
    async fn find(
        &self,
        predicate: &serde_json::Value,
        projection: &[String],
    ) -> Result<Vec<Document>>;

    async fn find_one(&self, id: ToiId) -> Result<Option<Document>>;

    async fn count(&self, predicate: &serde_json::Value) -> Result<u64>;

    /// Inserts a brand-new document.
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Atomically sets `_handled_by := handler` on every document in `ids`
    /// whose `_handled_by` is currently absent. Returns the subset actually
    /// claimed — the caller (the commit engine's lock phase) compares this
    /// against `ids` to distinguish a conflict (id no longer exists) from a
    /// lock held by someone else.
    async fn lock_unhandled(&self, ids: &BTreeSet<ToiId>, handler: &str) -> Result<BTreeSet<ToiId>>;

    /// `$unset _handled_by` for every document currently handled by `handler`.
    async fn unlock(&self, handler: &str) -> Result<()>;

    /// Applies a batch of writes as a single unordered bulk operation.
    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<()>;

    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> Result<()>;

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }
}

/// Standard index set named in §6.
pub fn standard_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec { collection: "instances", field: "_toc" },
        IndexSpec { collection: "instances", field: "_bases" },
        IndexSpec { collection: "instances", field: "allowRead.id" },
        IndexSpec { collection: "clients", field: "timestamp" },
        IndexSpec { collection: "blobs", field: "metadata.references.value" },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn standard_indexes_cover_instances_clients_and_blobs() {
        let specs = standard_indexes();
        assert!(specs.iter().any(|s| s.collection == "instances" && s.field == "_toc"));
        assert!(specs.iter().any(|s| s.collection == "clients" && s.field == "timestamp"));
        assert!(specs.iter().any(|s| s.collection == "blobs"));
    }

    #[tokio::test]
    async fn retry_returns_the_first_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(7u32) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_full_backoff_schedule_on_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Transient("unavailable".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), BACKOFF_SCHEDULE_MS.len() as u32);
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_a_fatal_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Fatal("corrupt".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
