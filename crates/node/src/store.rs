//! Backend selection for the node process.

use std::path::Path;

use utxod_storage::fjall::{FjallOptions, FjallStore};
use utxod_storage::memory::MemoryStore;
use utxod_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    /// Flushes the fjall journal; a no-op for the memory backend.
    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

pub fn open_store(
    backend: Backend,
    db_path: &Path,
    cache_bytes: Option<u64>,
    fsync_ms: Option<u16>,
) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes,
                fsync_ms,
            };
            let store = FjallStore::open_with_options(db_path, options)
                .map_err(|err| format!("failed to open db {}: {err}", db_path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fjall_backend_reopens_written_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        {
            let store = open_store(Backend::Fjall, &path, None, None).expect("open");
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, b"probe".to_vec(), b"value".to_vec());
            store.write_batch(&batch).expect("write");
            store.persist().expect("persist");
        }
        let store = open_store(Backend::Fjall, &path, None, None).expect("reopen");
        assert_eq!(
            store.get(Column::Meta, b"probe").expect("get"),
            Some(b"value".to_vec())
        );
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!(Backend::parse("Memory"), Some(Backend::Memory));
        assert_eq!(Backend::parse("fjall"), Some(Backend::Fjall));
        assert_eq!(Backend::parse("rocksdb"), None);
    }
}
