//! Outstanding-partition accumulator shared by sibling polls.

use std::sync::{Arc, Mutex};

use crate::utils::{GridError, PartitionSet};

/// Partitions of one logical multi-target operation that no sibling poll has
/// yet reported as processed. Every sibling poll holds a clone; all of them
/// point at the same set, guarded by its own lock.
#[derive(Debug, Clone)]
pub struct OutstandingPartitions(Arc<Mutex<PartitionSet>>);

impl OutstandingPartitions {
    /// Creates a new accumulator seeded with the operation's whole scope.
    pub fn new(scope: PartitionSet) -> Self {
        OutstandingPartitions(Arc::new(Mutex::new(scope)))
    }

    /// Subtracts processed partitions. Returns the partitions of `processed`
    /// that had already been subtracted (e.g., by a sibling), which should
    /// be empty under normal operation.
    pub fn subtract(
        &self,
        processed: &PartitionSet,
    ) -> Result<PartitionSet, GridError> {
        let mut outstanding = self.0.lock()?;
        Ok(outstanding.remove_set(processed))
    }

    /// Returns a snapshot of the partitions still outstanding.
    pub fn remaining(&self) -> Result<PartitionSet, GridError> {
        Ok(self.0.lock()?.clone())
    }

    /// True once every partition has been accounted for.
    pub fn is_settled(&self) -> Result<bool, GridError> {
        Ok(self.0.lock()?.is_empty())
    }
}
