//! Responses and member-to-member messages.

use crate::request::{Entry, PartitionRequest, RequestId};
use crate::utils::{MemberId, PartitionSet};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Value carried by a successful response.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ResponseValue {
    Empty,
    Entries(Vec<Entry>),
    Keys(Vec<Bytes>),
    Count(u64),
    Flag(bool),
    Partitions(PartitionSet),
}

/// Result of executing a request on one member.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ResponseResult {
    Success(ResponseValue),

    /// Reserved sentinel: no usable result, the whole operation must be
    /// retried by the caller.
    Retry,

    /// Receiver-side failure, carrying its cause.
    Failure(String),
}

/// Response of one member to one request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GridResponse {
    pub result: ResponseResult,

    /// Partitions the responder refused because it does not own them.
    pub rejected: Option<PartitionSet>,

    /// Partitions the responder did process.
    pub partitions: Option<PartitionSet>,
}

impl GridResponse {
    pub fn success(value: ResponseValue) -> Self {
        GridResponse {
            result: ResponseResult::Success(value),
            rejected: None,
            partitions: None,
        }
    }

    pub fn retry() -> Self {
        GridResponse {
            result: ResponseResult::Retry,
            rejected: None,
            partitions: None,
        }
    }

    pub fn failure(cause: impl ToString) -> Self {
        GridResponse {
            result: ResponseResult::Failure(cause.to_string()),
            rejected: None,
            partitions: None,
        }
    }

    /// Attaches the rejected partitions, if any.
    pub fn with_rejected(mut self, rejected: PartitionSet) -> Self {
        if !rejected.is_empty() {
            self.rejected = Some(rejected);
        }
        self
    }

    /// Attaches the processed partitions.
    pub fn with_partitions(mut self, partitions: PartitionSet) -> Self {
        self.partitions = Some(partitions);
        self
    }
}

/// The response the senior owes the original requestor of a metadata
/// change, held back until every relay target has answered.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeferredResponse {
    pub requestor: MemberId,
    pub request_id: RequestId,
    pub response: GridResponse,
}

/// Peer-peer message type.
#[derive(Debug, Serialize, Deserialize)]
pub enum GridMsg {
    Request(PartitionRequest),

    Response { id: RequestId, response: GridResponse },
}
