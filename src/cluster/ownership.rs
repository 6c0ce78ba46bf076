//! Partition ownership view of one member.
//!
//! NOTE: keys in format `k<number>` map directly to partition `number mod N`;
//! any other key is hashed.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::utils::{GridError, MemberId, MemberSet, PartitionId, PartitionSet};

/// Derives the partition of a binary key for a service of `count` partitions.
pub fn key_partition(key: &[u8], count: u32) -> PartitionId {
    debug_assert!(count > 0);
    if let Some(num) = key
        .strip_prefix(b"k")
        .and_then(|digits| std::str::from_utf8(digits).ok())
        .and_then(|digits| digits.parse::<u64>().ok())
    {
        return (num % count as u64) as PartitionId;
    }

    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    (hasher.finish() % count as u64) as PartitionId
}

/// A (possibly stale) view of which member owns which partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipMap {
    /// Fixed partition count of the service.
    partition_count: u32,

    /// Partition ID -> current owner, if any.
    owners: Vec<Option<MemberId>>,

    /// Members that are joining the service and own nothing yet.
    pending: MemberSet,

    /// Explicitly designated ownership senior. Defaults to the lowest-ID
    /// owner when unset.
    senior: Option<MemberId>,

    /// Bumped on every mutation.
    version: u64,
}

impl OwnershipMap {
    /// Creates a view with no partition owned by anyone.
    pub fn new(partition_count: u32) -> Self {
        OwnershipMap {
            partition_count,
            owners: vec![None; partition_count as usize],
            pending: MemberSet::new(),
            senior: None,
            version: 0,
        }
    }

    #[inline]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Assigns one partition to a member.
    pub fn assign(
        &mut self,
        partition: PartitionId,
        member: MemberId,
    ) -> Result<(), GridError> {
        if partition >= self.partition_count {
            return Err(GridError::msg(format!(
                "partition {} out of bound {}",
                partition, self.partition_count
            )));
        }
        self.owners[partition as usize] = Some(member);
        self.pending.remove(member);
        self.version += 1;
        Ok(())
    }

    /// Assigns every partition to a single member.
    pub fn assign_all(&mut self, member: MemberId) {
        self.owners.iter_mut().for_each(|o| *o = Some(member));
        self.pending.remove(member);
        self.version += 1;
    }

    /// Spreads partitions over the given members round-robin, in the order
    /// given.
    pub fn assign_round_robin(
        &mut self,
        members: &[MemberId],
    ) -> Result<(), GridError> {
        if members.is_empty() {
            return Err(GridError::msg("no members to assign partitions to"));
        }
        for (p, owner) in self.owners.iter_mut().enumerate() {
            *owner = Some(members[p % members.len()]);
        }
        for &m in members {
            self.pending.remove(m);
        }
        self.version += 1;
        Ok(())
    }

    /// Moves the given partitions to a new owner, as a redistribution would.
    pub fn move_partitions(
        &mut self,
        partitions: &PartitionSet,
        to: MemberId,
    ) -> Result<(), GridError> {
        for p in partitions.iter() {
            self.assign(p, to)?;
        }
        Ok(())
    }

    /// Drops all ownership of a departed member, leaving its partitions
    /// orphaned until reassigned.
    pub fn release_member(&mut self, member: MemberId) {
        for owner in self.owners.iter_mut() {
            if *owner == Some(member) {
                *owner = None;
            }
        }
        self.pending.remove(member);
        if self.senior == Some(member) {
            self.senior = None;
        }
        self.version += 1;
    }

    /// Marks a member as pending-join.
    pub fn add_pending(&mut self, member: MemberId) {
        self.pending.insert(member);
        self.version += 1;
    }

    /// Designates the ownership senior explicitly.
    pub fn set_senior(&mut self, member: MemberId) {
        self.senior = Some(member);
        self.version += 1;
    }

    /// Returns the owner of a partition, if any.
    #[inline]
    pub fn owner_of(&self, partition: PartitionId) -> Option<MemberId> {
        self.owners.get(partition as usize).copied().flatten()
    }

    /// Returns the set of partitions owned by a member.
    pub fn owned_by(&self, member: MemberId) -> PartitionSet {
        let mut owned = PartitionSet::empty(self.partition_count);
        for (p, owner) in self.owners.iter().enumerate() {
            if *owner == Some(member) {
                // cannot fail: index below partition count
                let _ = owned.add(p as PartitionId);
            }
        }
        owned
    }

    /// Returns the set of members owning at least one partition, plus the
    /// pending-join members if `include_pending` is set.
    pub fn ownership_members(&self, include_pending: bool) -> MemberSet {
        let mut members: MemberSet = self.owners.iter().flatten().copied().collect();
        if include_pending {
            members.add_all(&self.pending);
        }
        members
    }

    /// Returns the ownership senior, if the service has any owner at all.
    pub fn ownership_senior(&self) -> Option<MemberId> {
        self.senior.or_else(|| self.ownership_members(false).first())
    }

    /// Derives the partition of a binary key.
    #[inline]
    pub fn key_partition(&self, key: &[u8]) -> PartitionId {
        key_partition(key, self.partition_count)
    }
}

#[cfg(test)]
mod ownership_tests {
    use super::*;

    #[test]
    fn numbered_keys_map_directly() {
        assert_eq!(key_partition(b"k0", 4), 0);
        assert_eq!(key_partition(b"k3", 4), 3);
        assert_eq!(key_partition(b"k9", 4), 1);
    }

    #[test]
    fn hashed_keys_deterministic() {
        let p = key_partition(b"alice", 257);
        assert!(p < 257);
        assert_eq!(p, key_partition(b"alice", 257));
        assert!(key_partition(b"kx7", 3) < 3);
    }

    #[test]
    fn round_robin_and_move() -> Result<(), GridError> {
        let mut map = OwnershipMap::new(6);
        map.assign_round_robin(&[1, 2])?;
        assert_eq!(map.owned_by(1).iter().collect::<Vec<_>>(), vec![0, 2, 4]);
        map.move_partitions(&PartitionSet::from_ids(6, [0, 2])?, 2)?;
        assert_eq!(map.owned_by(1).iter().collect::<Vec<_>>(), vec![4]);
        assert_eq!(map.owner_of(0), Some(2));
        assert!(map.assign(6, 1).is_err());
        Ok(())
    }

    #[test]
    fn members_and_senior() -> Result<(), GridError> {
        let mut map = OwnershipMap::new(4);
        assert_eq!(map.ownership_senior(), None);
        map.assign_round_robin(&[3, 5])?;
        map.add_pending(9);
        assert_eq!(map.ownership_members(false).iter().collect::<Vec<_>>(), vec![3, 5]);
        assert_eq!(
            map.ownership_members(true).iter().collect::<Vec<_>>(),
            vec![3, 5, 9]
        );
        assert_eq!(map.ownership_senior(), Some(3));
        map.set_senior(5);
        assert_eq!(map.ownership_senior(), Some(5));
        map.release_member(5);
        assert_eq!(map.ownership_senior(), Some(3));
        assert_eq!(map.owner_of(1), None);
        Ok(())
    }
}
