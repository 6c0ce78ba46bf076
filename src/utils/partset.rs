//! Partition set data structure.

use std::fmt;

use crate::utils::GridError;

use fixedbitset::FixedBitSet;

use serde::{Deserialize, Serialize};

/// Partition ID type, always in `[0, partition_count)`.
pub type PartitionId = u32;

/// Mutable set of partition IDs of one partitioned service. Every member of
/// the set is below the service's fixed partition count, and clones never
/// alias each other.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPartitionSet", into = "RawPartitionSet")]
pub struct PartitionSet {
    /// Partition count of the owning service.
    count: u32,

    /// One bit per partition.
    bits: FixedBitSet,
}

/// Serialized form of a `PartitionSet`; decoding goes through
/// `PartitionSet::from_blocks` so out-of-range bits are rejected.
#[derive(Serialize, Deserialize)]
struct RawPartitionSet {
    count: u32,
    blocks: Vec<u32>,
}

impl TryFrom<RawPartitionSet> for PartitionSet {
    type Error = GridError;

    fn try_from(raw: RawPartitionSet) -> Result<Self, Self::Error> {
        PartitionSet::from_blocks(raw.count, raw.blocks)
    }
}

impl From<PartitionSet> for RawPartitionSet {
    fn from(set: PartitionSet) -> Self {
        RawPartitionSet {
            count: set.count,
            blocks: set.bits.as_slice().to_vec(),
        }
    }
}

impl PartitionSet {
    /// Creates an empty partition set for a service of `count` partitions.
    pub fn empty(count: u32) -> Self {
        PartitionSet {
            count,
            bits: FixedBitSet::with_capacity(count as usize),
        }
    }

    /// Creates a partition set holding all `count` partitions.
    pub fn full(count: u32) -> Self {
        let mut set = Self::empty(count);
        set.bits.set_range(.., true);
        set
    }

    /// Creates a partition set from a list of IDs. Fails if any ID is out of
    /// range.
    pub fn from_ids(
        count: u32,
        ids: impl IntoIterator<Item = PartitionId>,
    ) -> Result<Self, GridError> {
        let mut set = Self::empty(count);
        for id in ids {
            set.add(id)?;
        }
        Ok(set)
    }

    /// Reconstructs a partition set from its raw bit blocks.
    pub(crate) fn from_blocks(
        count: u32,
        blocks: Vec<u32>,
    ) -> Result<Self, GridError> {
        let needed = (count as usize + 31) / 32;
        if blocks.len() != needed {
            return Err(GridError(format!(
                "partition set of {} expects {} blocks, got {}",
                count,
                needed,
                blocks.len()
            )));
        }
        // bits past `count` would be silently masked off by the bitset
        let tail = count % 32;
        if let Some(&last) = blocks.last() {
            if tail != 0 && last >> tail != 0 {
                return Err(GridError(format!(
                    "partition set blocks exceed bound {}",
                    count
                )));
            }
        }
        let bits = FixedBitSet::with_capacity_and_blocks(count as usize, blocks);
        Ok(PartitionSet { count, bits })
    }

    /// Raw bit blocks, used by the wire codec.
    #[inline]
    pub(crate) fn blocks(&self) -> &[u32] {
        self.bits.as_slice()
    }

    /// Returns the partition count of the owning service.
    #[inline]
    pub fn partition_count(&self) -> u32 {
        self.count
    }

    /// Adds a partition. Returns true if it was not present before.
    #[inline]
    pub fn add(&mut self, id: PartitionId) -> Result<bool, GridError> {
        if id >= self.count {
            return Err(GridError(format!(
                "partition {} out of bound {}",
                id, self.count
            )));
        }
        Ok(!self.bits.put(id as usize))
    }

    /// Removes a partition. Returns true if it was present.
    #[inline]
    pub fn remove(&mut self, id: PartitionId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.bits.set(id as usize, false);
        true
    }

    #[inline]
    pub fn contains(&self, id: PartitionId) -> bool {
        id < self.count && self.bits[id as usize]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.ones().next().is_none()
    }

    /// Returns the number of partitions in the set.
    #[inline]
    pub fn cardinality(&self) -> usize {
        self.bits.count_ones(..)
    }

    /// Returns the lowest partition in the set, if any.
    #[inline]
    pub fn first(&self) -> Option<PartitionId> {
        self.bits.ones().next().map(|p| p as PartitionId)
    }

    /// Adds every partition of `other` (set union).
    pub fn add_set(&mut self, other: &PartitionSet) {
        if other.count == self.count {
            self.bits.union_with(&other.bits);
        } else {
            for id in other.iter().filter(|&id| id < self.count) {
                self.bits.put(id as usize);
            }
        }
    }

    /// Removes every partition of `other` (set difference). Returns the
    /// partitions of `other` that were already absent from this set.
    pub fn remove_set(&mut self, other: &PartitionSet) -> PartitionSet {
        let mut absent = PartitionSet::empty(self.count);
        for id in other.iter() {
            if !self.remove(id) && id < self.count {
                absent.bits.put(id as usize);
            }
        }
        absent
    }

    /// Returns a new set holding partitions present in both sets.
    pub fn intersection(&self, other: &PartitionSet) -> PartitionSet {
        let mut both = PartitionSet::empty(self.count);
        for id in self.iter().filter(|&id| other.contains(id)) {
            both.bits.put(id as usize);
        }
        both
    }

    /// Returns true if the two sets share at least one partition.
    pub fn intersects(&self, other: &PartitionSet) -> bool {
        self.iter().any(|id| other.contains(id))
    }

    /// Allows `for id in set.iter()`, in ascending order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.bits.ones().map(|p| p as PartitionId)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.count)?;
        let mut first = true;
        for id in self.iter() {
            if !first {
                write!(f, ", {}", id)?;
            } else {
                write!(f, "{}", id)?;
                first = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod partset_tests {
    use super::*;

    #[test]
    fn partset_add_remove() -> Result<(), GridError> {
        let mut set = PartitionSet::empty(7);
        assert!(set.add(0)?);
        assert!(set.add(6)?);
        assert!(!set.add(0)?);
        assert!(set.add(7).is_err());
        assert!(set.contains(6));
        assert!(!set.contains(7));
        assert!(set.remove(6));
        assert!(!set.remove(6));
        assert_eq!(set.cardinality(), 1);
        Ok(())
    }

    #[test]
    fn partset_full_empty() {
        let set = PartitionSet::full(5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(PartitionSet::empty(5).is_empty());
        assert!(!set.is_empty());
    }

    #[test]
    fn partset_copies_independent() -> Result<(), GridError> {
        let original = PartitionSet::from_ids(8, [1, 2])?;
        let mut copy = original.clone();
        copy.add(5)?;
        copy.remove(1);
        assert_eq!(original.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(copy.iter().collect::<Vec<_>>(), vec![2, 5]);
        Ok(())
    }

    #[test]
    fn partset_union_difference() -> Result<(), GridError> {
        let mut a = PartitionSet::from_ids(16, [1, 2, 3])?;
        let b = PartitionSet::from_ids(16, [3, 9])?;
        a.add_set(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3, 9]);
        let absent = a.remove_set(&PartitionSet::from_ids(16, [2, 9, 11])?);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(absent.iter().collect::<Vec<_>>(), vec![11]);
        Ok(())
    }

    #[test]
    fn partset_intersection() -> Result<(), GridError> {
        let a = PartitionSet::from_ids(16, [1, 2, 3])?;
        let b = PartitionSet::from_ids(16, [3, 4])?;
        assert_eq!(a.intersection(&b).iter().collect::<Vec<_>>(), vec![3]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&PartitionSet::from_ids(16, [15])?));
        Ok(())
    }

    #[test]
    fn partset_blocks() -> Result<(), GridError> {
        let set = PartitionSet::from_ids(40, [0, 33, 39])?;
        let rebuilt =
            PartitionSet::from_blocks(40, set.blocks().to_vec())?;
        assert_eq!(set, rebuilt);
        assert!(PartitionSet::from_blocks(40, vec![0]).is_err());
        assert!(PartitionSet::from_blocks(40, vec![0, 1 << 8]).is_err());
        assert!(PartitionSet::from_blocks(64, vec![0, 1 << 31]).is_ok());
        Ok(())
    }

    #[test]
    fn partset_decode_checks_bound() -> Result<(), GridError> {
        let set = PartitionSet::from_ids(40, [2, 39])?;
        let bytes = rmp_serde::encode::to_vec(&set)?;
        let decoded: PartitionSet = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(decoded, set);

        // bit 5 set in a set of only 4 partitions
        let bad = rmp_serde::encode::to_vec(&RawPartitionSet {
            count: 4,
            blocks: vec![0b10_0001],
        })?;
        assert!(rmp_serde::decode::from_slice::<PartitionSet>(&bad).is_err());

        // block count mismatch
        let short = rmp_serde::encode::to_vec(&RawPartitionSet {
            count: 40,
            blocks: vec![1],
        })?;
        assert!(rmp_serde::decode::from_slice::<PartitionSet>(&short).is_err());
        Ok(())
    }

    #[test]
    fn partset_debug() -> Result<(), GridError> {
        let set = PartitionSet::from_ids(4, [0, 3])?;
        assert_eq!(format!("{:?}", set), "{4; [0, 3]}");
        Ok(())
    }
}
