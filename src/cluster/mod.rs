//! Cluster-facing collaborators: ownership view, routing service trait, and
//! member-to-member transport.

mod ownership;
mod transport;

pub use ownership::{key_partition, OwnershipMap};
pub use transport::{Fabric, Incoming, TransportHub};

use crate::request::{GridMsg, PartitionRequest, RequestId};
use crate::utils::{GridError, MemberId, MemberSet, PartitionId, PartitionSet};

/// Ownership and routing service a member's request processing consults.
pub trait OwnershipService {
    /// Returns the ID of the member running this service.
    fn this_member(&self) -> MemberId;

    /// Returns the fixed partition count of the service.
    fn partition_count(&self) -> u32;

    /// Derives the partition a binary key belongs to.
    fn key_partition(&self, key: &[u8]) -> PartitionId;

    /// Returns the members owning partitions, plus pending-join members if
    /// `include_pending` is set.
    fn ownership_members(&self, include_pending: bool) -> MemberSet;

    /// Returns the current ownership senior, if any.
    fn ownership_senior(&self) -> Option<MemberId>;

    /// Returns the partitions this member currently owns.
    fn owned_partitions(&self) -> PartitionSet;

    /// Posts a message to a member.
    fn post(&mut self, to: MemberId, msg: GridMsg) -> Result<(), GridError>;
}

/// Ownership service that can also dispatch new requests, each tracked by
/// its own poll, as the senior does when relaying metadata changes.
pub trait RelayContext: OwnershipService {
    /// Assigns an ID to the request, registers a poll for it, and sends it to
    /// all of its targets.
    fn dispatch(
        &mut self,
        request: PartitionRequest,
    ) -> Result<RequestId, GridError>;
}
