//! Blob reference manager: ref-counted lifecycle for externalised large
//! values. Owners are instance ids, client ids, link ids, and commit ids —
//! all modelled here as opaque owner-id strings so the manager doesn't need
//! to know which kind of entity holds a reference.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::value::BlobRef;

/// The narrow interface the blob reference manager consumes; a real
/// deployment backs this with whatever large-object store it already runs
/// (S3, GridFS-alike chunked collection, etc).
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<String>;
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Values at or above this size are externalised rather than kept inline.
pub const BLOB_THRESHOLD_BYTES: usize = 64 * 1024;

pub struct MemoryBlobBackend {
    store: Mutex<BTreeMap<String, Vec<u8>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for MemoryBlobBackend {
    fn default() -> Self {
        MemoryBlobBackend { store: Mutex::new(BTreeMap::new()), next_id: std::sync::atomic::AtomicU64::new(0) }
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let key = format!("blob-{id}");
        self.store.lock().insert(key.clone(), bytes);
        Ok(key)
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.store.lock().remove(id);
        Ok(())
    }
}

/// Decides whether a value should be externalised, matching the size
/// threshold note in the design notes.
pub fn should_externalise(bytes_len: usize) -> bool {
    bytes_len >= BLOB_THRESHOLD_BYTES
}

/// Ref-counted owner tracking for externalised blobs. `addref`/`delref`
/// mutate the owner set directly; the payload is destroyed once it empties.
pub struct BlobRefManager {
    backend: std::sync::Arc<dyn BlobBackend>,
    references: Mutex<BTreeMap<String, std::collections::BTreeSet<String>>>,
}

impl BlobRefManager {
    pub fn new(backend: std::sync::Arc<dyn BlobBackend>) -> Self {
        BlobRefManager { backend, references: Mutex::new(BTreeMap::new()) }
    }

    pub async fn addref(&self, blob: &BlobRef, owner: &str) {
        if let BlobRef::External(id) = blob {
            self.references.lock().entry(id.clone()).or_default().insert(owner.to_string());
        }
    }

    /// Removes `owner` from the blob's reference set; if the set becomes
    /// empty, destroys the payload.
    pub async fn delref(&self, blob: &BlobRef, owner: &str) -> Result<()> {
        let BlobRef::External(id) = blob else { return Ok(()) };
        let now_empty = {
            let mut refs = self.references.lock();
            if let Some(set) = refs.get_mut(id) {
                set.remove(owner);
                if set.is_empty() {
                    refs.remove(id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if now_empty {
            self.backend.delete(id).await?;
        }
        Ok(())
    }

    pub fn refcount(&self, blob: &BlobRef) -> usize {
        match blob {
            BlobRef::External(id) => self.references.lock().get(id).map(|s| s.len()).unwrap_or(0),
            BlobRef::Inline(_) => 0,
        }
    }

    pub async fn store(&self, bytes: Vec<u8>) -> Result<BlobRef> {
        if should_externalise(bytes.len()) {
            let id = self.backend.put(bytes).await?;
            self.references.lock().insert(id.clone(), Default::default());
            Ok(BlobRef::External(id))
        } else {
            Ok(BlobRef::Inline(bytes))
        }
    }
}

/// Equality of two externalised blobs is by payload identifier; two inline
/// blobs compare by byte content; mixed comparison is always unequal. This
/// matches `BlobRef`'s derived `PartialEq` exactly (kept here as a named
/// doc anchor since blob equality is a spec invariant, not an incidental
/// trait derive).
pub fn blob_eq(a: &BlobRef, b: &BlobRef) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delref_destroys_payload_once_owner_set_empties() {
        let backend = std::sync::Arc::new(MemoryBlobBackend::default());
        let mgr = BlobRefManager::new(backend.clone());
        let blob = mgr.store(vec![0u8; BLOB_THRESHOLD_BYTES]).await.unwrap();
        mgr.addref(&blob, "instance-1").await;
        mgr.addref(&blob, "commit-1").await;
        assert_eq!(mgr.refcount(&blob), 2);
        mgr.delref(&blob, "commit-1").await.unwrap();
        assert_eq!(mgr.refcount(&blob), 1);
        mgr.delref(&blob, "instance-1").await.unwrap();
        assert_eq!(mgr.refcount(&blob), 0);
        if let BlobRef::External(id) = &blob {
            assert!(backend.get(id).await.unwrap().is_none());
        }
    }

    #[test]
    fn small_values_stay_inline() {
        assert!(!should_externalise(10));
        assert!(should_externalise(BLOB_THRESHOLD_BYTES));
    }
}
