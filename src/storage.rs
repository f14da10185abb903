use std::collections::HashMap;
use std::sync::RwLock;

/// Keys under which a replica persists its durable state.
///
/// All three are written on every durable-state change and all three must
/// be present for a restore to succeed.
pub mod keys {
    pub const CURRENT_TERM: &str = "currentTerm";
    pub const VOTED_FOR: &str = "votedFor";
    pub const LOG: &str = "log";
}

/// Durable key/value storage for a replica's persistent Raft state.
///
/// Values are opaque encoded byte strings; the consensus module owns the
/// encoding. A `set` must be durable by the time it returns, since the
/// module replies to RPCs only after persisting.
pub trait Storage: Send + Sync {
    /// Whether any state has ever been persisted.
    fn has_data(&self) -> bool;

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&self, key: &str, value: Vec<u8>);
}

/// In-memory storage backend.
///
/// Useful for tests and for embedders that handle durability elsewhere;
/// survives a consensus-module restart as long as the process lives.
#[derive(Debug, Default)]
pub struct MemStorage {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn has_data(&self) -> bool {
        !self.data.read().unwrap().is_empty()
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.data.write().unwrap().insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_storage_starts_empty() {
        let storage = MemStorage::new();
        assert!(!storage.has_data());
        assert!(storage.get(keys::CURRENT_TERM).is_none());
    }

    #[test]
    fn test_mem_storage_set_get() {
        let storage = MemStorage::new();
        storage.set(keys::CURRENT_TERM, vec![1, 2, 3]);

        assert!(storage.has_data());
        assert_eq!(storage.get(keys::CURRENT_TERM), Some(vec![1, 2, 3]));
        assert!(storage.get(keys::LOG).is_none());
    }

    #[test]
    fn test_mem_storage_overwrite() {
        let storage = MemStorage::new();
        storage.set(keys::VOTED_FOR, vec![1]);
        storage.set(keys::VOTED_FOR, vec![2]);

        assert_eq!(storage.get(keys::VOTED_FOR), Some(vec![2]));
    }
}
