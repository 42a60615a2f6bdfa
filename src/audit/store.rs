//! Audit storage backends.
//!
//! The log serializes every call, so implementations never see concurrent
//! writers and can take `&mut self`.

use std::path::Path;

use tracing::info;

use super::AuditError;
use crate::config::defaults::AUDIT_SLED_TREE;
use crate::types::AuditEvent;

/// Append-only event storage, addressed by sequence number.
pub trait AuditStore: Send {
    /// Persist one event. `event.seq` is always `last_seq() + 1`.
    fn insert(&mut self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Highest stored sequence number, 0 when empty.
    fn last_seq(&self) -> Result<u64, AuditError>;

    /// Up to `limit` events with `after < seq <= upto`, in sequence order.
    fn scan(&self, after: u64, upto: u64, limit: usize) -> Result<Vec<AuditEvent>, AuditError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Vector-backed store. Index `i` holds sequence number `i + 1`.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: Vec<AuditEvent>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn insert(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn last_seq(&self) -> Result<u64, AuditError> {
        Ok(self.events.len() as u64)
    }

    fn scan(&self, after: u64, upto: u64, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(self.events.len());
        let end = usize::try_from(upto).unwrap_or(usize::MAX).min(self.events.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self.events[start..end].iter().take(limit).cloned().collect())
    }
}

// ============================================================================
// Sled Store
// ============================================================================

/// Durable store in a sled tree keyed by big-endian sequence number.
pub struct SledAuditStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledAuditStore {
    /// Open or create the audit database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| AuditError::Storage(e.to_string()))?;
        let store = Self::from_db(db)?;
        info!(path = %path.display(), events = store.last_seq()?, "Audit storage opened");
        Ok(store)
    }

    /// Temporary database, removed on drop. Used by tests.
    pub fn temporary() -> Result<Self, AuditError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| AuditError::Storage(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, AuditError> {
        let tree = db
            .open_tree(AUDIT_SLED_TREE)
            .map_err(|e| AuditError::Storage(e.to_string()))?;
        Ok(Self { _db: db, tree })
    }
}

impl AuditStore for SledAuditStore {
    fn insert(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        let value =
            serde_json::to_vec(event).map_err(|e| AuditError::Serialization(e.to_string()))?;
        self.tree
            .insert(event.seq.to_be_bytes(), value)
            .map_err(|e| AuditError::Storage(e.to_string()))?;
        Ok(())
    }

    fn last_seq(&self) -> Result<u64, AuditError> {
        match self.tree.last().map_err(|e| AuditError::Storage(e.to_string()))? {
            Some((key, _)) => {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| AuditError::Storage("corrupt audit key".to_string()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn scan(&self, after: u64, upto: u64, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        if after >= upto {
            return Ok(Vec::new());
        }
        let lo = (after + 1).to_be_bytes();
        let hi = upto.to_be_bytes();
        self.tree
            .range(lo..=hi)
            .take(limit)
            .map(|entry| {
                let (_, value) = entry.map_err(|e| AuditError::Storage(e.to_string()))?;
                serde_json::from_slice(&value).map_err(|e| AuditError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuditKind;
    use chrono::Utc;

    fn event(seq: u64) -> AuditEvent {
        AuditEvent {
            seq,
            timestamp: Utc::now(),
            kind: AuditKind::StageStart,
            clip_id: Some(format!("clip-{seq}")),
            stage: None,
            payload: serde_json::json!({}),
        }
    }

    fn exercise(store: &mut dyn AuditStore) {
        assert_eq!(store.last_seq().unwrap(), 0);
        for seq in 1..=10 {
            store.insert(&event(seq)).unwrap();
        }
        assert_eq!(store.last_seq().unwrap(), 10);

        let page = store.scan(3, 10, 4).unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);

        let tail = store.scan(8, 9, 100).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 9);

        assert!(store.scan(10, 10, 100).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_scan() {
        exercise(&mut MemoryAuditStore::new());
    }

    #[test]
    fn test_sled_store_scan() {
        exercise(&mut SledAuditStore::temporary().unwrap());
    }
}
