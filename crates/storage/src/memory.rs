use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Volatile store for tests and throwaway regtest runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held in `column`.
    pub fn count(&self, column: Column) -> usize {
        let guard = self.inner.read().expect("memory store lock");
        guard.range(column_range(column, &[])).count()
    }

    fn visit_prefix(
        &self,
        column: Column,
        prefix: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        for ((_, key), value) in guard.range(column_range(column, prefix)) {
            if !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }
}

fn column_range(
    column: Column,
    prefix: &[u8],
) -> (Bound<(Column, Vec<u8>)>, Bound<(Column, Vec<u8>)>) {
    let start = Bound::Included((column, prefix.to_vec()));
    let end = match Column::ALL.get(column.index() + 1) {
        Some(next) => Bound::Excluded((*next, Vec::new())),
        None => Bound::Unbounded,
    };
    (start, end)
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut results = Vec::new();
        self.visit_prefix(column, prefix, |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.visit_prefix(column, prefix, |key, value| visitor(key, value))
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}
