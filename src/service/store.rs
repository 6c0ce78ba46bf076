//! Per-member partitioned storage.

use std::collections::{BTreeSet, HashMap};

use crate::utils::{GridError, PartitionId};

use bytes::Bytes;

/// Every partition holds a plain `HashMap` from binary key to binary value.
type Partition = HashMap<Bytes, Bytes>;

/// The local in-memory store of one member, holding data for any partition
/// (ownership is checked by the caller) plus the service's index registry.
#[derive(Debug)]
pub struct PartitionStore {
    partitions: Vec<Partition>,

    /// Registered index names.
    indexes: BTreeSet<String>,
}

impl PartitionStore {
    /// Creates an empty store for `partition_count` partitions.
    pub fn new(partition_count: u32) -> Self {
        PartitionStore {
            partitions: (0..partition_count).map(|_| Partition::new()).collect(),
            indexes: BTreeSet::new(),
        }
    }

    fn partition(&self, p: PartitionId) -> Result<&Partition, GridError> {
        self.partitions
            .get(p as usize)
            .ok_or_else(|| GridError::msg(format!("partition {} out of range", p)))
    }

    fn partition_mut(
        &mut self,
        p: PartitionId,
    ) -> Result<&mut Partition, GridError> {
        self.partitions
            .get_mut(p as usize)
            .ok_or_else(|| GridError::msg(format!("partition {} out of range", p)))
    }

    pub fn get(
        &self,
        p: PartitionId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError> {
        Ok(self.partition(p)?.get(key).cloned())
    }

    /// Returns the old value if the key was present.
    pub fn put(
        &mut self,
        p: PartitionId,
        key: Bytes,
        value: Bytes,
    ) -> Result<Option<Bytes>, GridError> {
        Ok(self.partition_mut(p)?.insert(key, value))
    }

    pub fn remove(
        &mut self,
        p: PartitionId,
        key: &Bytes,
    ) -> Result<Option<Bytes>, GridError> {
        Ok(self.partition_mut(p)?.remove(key))
    }

    pub fn partition_len(&self, p: PartitionId) -> Result<usize, GridError> {
        Ok(self.partition(p)?.len())
    }

    pub fn partition_keys(&self, p: PartitionId) -> Result<Vec<Bytes>, GridError> {
        Ok(self.partition(p)?.keys().cloned().collect())
    }

    /// Empties a partition, returning how many entries it held.
    pub fn clear_partition(&mut self, p: PartitionId) -> Result<usize, GridError> {
        let partition = self.partition_mut(p)?;
        let cleared = partition.len();
        partition.clear();
        Ok(cleared)
    }

    /// Registers an index. Registering an existing index changes nothing;
    /// returns whether the registry changed.
    pub fn add_index(&mut self, name: &str) -> Result<bool, GridError> {
        if name.is_empty() {
            return Err(GridError::msg("index name must not be empty"));
        }
        Ok(self.indexes.insert(name.to_string()))
    }

    /// Unregisters an index. Removing an absent index changes nothing;
    /// returns whether the registry changed.
    pub fn remove_index(&mut self, name: &str) -> Result<bool, GridError> {
        if name.is_empty() {
            return Err(GridError::msg("index name must not be empty"));
        }
        Ok(self.indexes.remove(name))
    }

    #[inline]
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains(name)
    }

    /// Registered index names in order.
    pub fn indexes(&self) -> impl Iterator<Item = &str> {
        self.indexes.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    #[test]
    fn put_get_remove() -> Result<(), GridError> {
        let mut store = PartitionStore::new(4);
        let key = Bytes::from_static(b"k1");
        assert_eq!(store.put(1, key.clone(), Bytes::from_static(b"a"))?, None);
        assert_eq!(
            store.put(1, key.clone(), Bytes::from_static(b"b"))?,
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(store.get(1, &key)?, Some(Bytes::from_static(b"b")));
        assert_eq!(store.get(2, &key)?, None);
        assert_eq!(store.partition_len(1)?, 1);
        assert_eq!(store.remove(1, &key)?, Some(Bytes::from_static(b"b")));
        assert_eq!(store.partition_len(1)?, 0);
        assert!(store.get(4, &key).is_err());
        Ok(())
    }

    #[test]
    fn clear_and_keys() -> Result<(), GridError> {
        let mut store = PartitionStore::new(2);
        for name in ["x", "y", "z"] {
            store.put(0, Bytes::from(name), Bytes::from_static(b"v"))?;
        }
        let mut keys = store.partition_keys(0)?;
        keys.sort();
        assert_eq!(keys, vec!["x", "y", "z"]);
        assert_eq!(store.clear_partition(0)?, 3);
        assert_eq!(store.clear_partition(0)?, 0);
        Ok(())
    }

    #[test]
    fn index_registry_idempotent() -> Result<(), GridError> {
        let mut store = PartitionStore::new(1);
        assert!(store.add_index("by_name")?);
        assert!(!store.add_index("by_name")?);
        assert!(store.has_index("by_name"));
        assert_eq!(store.indexes().collect::<Vec<_>>(), vec!["by_name"]);
        assert!(store.remove_index("by_name")?);
        assert!(!store.remove_index("by_name")?);
        assert!(store.add_index("").is_err());
        Ok(())
    }
}
