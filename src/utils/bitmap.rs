//! Member set bitmap helper.

use std::fmt;

use fixedbitset::FixedBitSet;

use serde::{Deserialize, Serialize};

/// Grid member ID type.
pub type MemberId = u8;

/// Number of distinct member IDs representable.
const MEMBER_SLOTS: usize = MemberId::MAX as usize + 1;

/// Compact bitmap of grid members, indexed by `MemberId`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet(FixedBitSet);

impl MemberSet {
    /// Creates a new empty member set.
    pub fn new() -> Self {
        MemberSet(FixedBitSet::with_capacity(MEMBER_SLOTS))
    }

    /// Creates a member set holding exactly the given member.
    pub fn single(member: MemberId) -> Self {
        let mut set = Self::new();
        set.insert(member);
        set
    }

    /// Adds a member; returns true if it was not present before.
    #[inline]
    pub fn insert(&mut self, member: MemberId) -> bool {
        !self.0.put(member as usize)
    }

    /// Removes a member; returns true if it was present.
    #[inline]
    pub fn remove(&mut self, member: MemberId) -> bool {
        let present = self.0[member as usize];
        self.0.set(member as usize, false);
        present
    }

    #[inline]
    pub fn contains(&self, member: MemberId) -> bool {
        self.0[member as usize]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.ones().next().is_none()
    }

    /// Returns the number of members in the set.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Adds all members of `other` into this set.
    #[inline]
    pub fn add_all(&mut self, other: &MemberSet) {
        self.0.union_with(&other.0);
    }

    /// Removes all members of `other` from this set.
    #[inline]
    pub fn remove_all(&mut self, other: &MemberSet) {
        self.0.difference_with(&other.0);
    }

    /// Returns the smallest member ID in the set, if any.
    #[inline]
    pub fn first(&self) -> Option<MemberId> {
        self.0.ones().next().map(|m| m as MemberId)
    }

    /// Allows `for member in set.iter()`, in ascending ID order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.0.ones().map(|m| m as MemberId)
    }
}

impl Default for MemberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<MemberId> for MemberSet {
    fn from_iter<I: IntoIterator<Item = MemberId>>(iter: I) -> Self {
        let mut set = MemberSet::new();
        for member in iter {
            set.insert(member);
        }
        set
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for MemberSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for m in self.iter() {
            if !first {
                write!(f, ", m{}", m)?;
            } else {
                write!(f, "m{}", m)?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn set_insert_remove() {
        let mut set = MemberSet::new();
        assert!(set.is_empty());
        assert!(set.insert(0));
        assert!(set.insert(255));
        assert!(!set.insert(0));
        assert!(set.contains(255));
        assert!(!set.contains(3));
        assert!(set.remove(0));
        assert!(!set.remove(0));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn set_union_difference() {
        let mut a: MemberSet = [1, 2, 3].into_iter().collect();
        let b: MemberSet = [3, 4].into_iter().collect();
        a.add_all(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        a.remove_all(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(a.first(), Some(1));
    }

    #[test]
    fn set_debug() {
        let set: MemberSet = [0, 7].into_iter().collect();
        assert_eq!(format!("{:?}", set), "{m0, m7}");
    }
}
