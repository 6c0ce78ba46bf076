//! Partgrid: request/response coordination core of a partitioned in-memory
//! data grid.
//!
//! A coordinating member fans cache operations out to the members owning the
//! relevant partitions according to its (possibly stale) ownership view, and
//! reconciles partial successes, partition rejections, and member departures
//! into one outcome per operation. Retrying is left to the caller, who always
//! gets the remainder it needs to retry correctly.

#[macro_use]
mod utils;

mod cluster;
mod poll;
mod request;
mod service;

// Things exposed to users of this library.

pub use utils::{
    logger_init, GridError, LogPrefix, MemberId, MemberSet, PartitionId,
    PartitionSet,
};

pub use cluster::{
    key_partition, Fabric, Incoming, OwnershipMap, OwnershipService,
    RelayContext, TransportHub,
};

pub use request::{
    check_response, decode_request, encode_request, DeferredResponse, Entry,
    EntryOp, GridMsg, GridResponse, KeyOp, MaskOp, MetadataOp,
    PartitionRequest, Rejection, RequestId, RequestKind, ResponseResult,
    ResponseValue,
};

pub use poll::{
    Completion, MergeStrategy, Outcome, OutstandingPartitions, Poll,
    PollState, ResponseMerger, RetryInfo, RetryReason,
};

pub use service::{
    GridCluster, GridHandle, GridMember, MemberConfig, PartitionStore,
};
