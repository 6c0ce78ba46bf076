//! Response collection for dispatched partition requests.
//!
//! One `Poll` exists per dispatched `PartitionRequest`. It owns the request
//! so it can correct the request's tracked scope as rejections come in, and
//! it resolves the request's outcome once every target has either answered
//! or left the cluster. Polls are driven solely by the service loop of the
//! member that dispatched the request; the only state they share with
//! sibling polls is the `OutstandingPartitions` accumulator.

mod accumulator;
mod merger;

pub use accumulator::OutstandingPartitions;
pub use merger::{MergeStrategy, ResponseMerger};

use crate::request::{
    check_response, GridResponse, PartitionRequest, Rejection, RequestId,
    RequestKind, ResponseResult, ResponseValue,
};
use crate::utils::{GridError, MemberId, MemberSet, PartitionId, PartitionSet};

/// Lifecycle of a poll.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PollState {
    /// Awaiting at least one target.
    Open,

    /// Every target has answered or departed.
    Completing,

    /// Outcome delivered.
    Closed,
}

/// Why an operation has to be retried by its caller.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RetryReason {
    /// Some partitions of the scope were rejected.
    PartialRejection,

    /// The whole scope was rejected.
    FullRejection,

    /// A target left before answering.
    IncompleteMembership,

    /// A responder answered with the RETRY sentinel.
    Sentinel,
}

/// Everything the caller needs to retry correctly.
#[derive(Debug, PartialEq, Clone)]
pub struct RetryInfo {
    pub reason: RetryReason,

    /// Value covering the parts that did succeed, which must not be redone.
    pub accepted: Option<ResponseValue>,

    /// Partitions whose work is still owed.
    pub partitions: PartitionSet,

    /// The items (or mask share) to resubmit; `None` if there is no explicit
    /// remainder.
    pub remainder: Option<RequestKind>,
}

/// Final outcome of a request or operation as seen by the caller.
#[derive(Debug, PartialEq, Clone)]
pub enum Outcome {
    Success(ResponseValue),
    Retry(RetryInfo),
    Failure(GridError),
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Returns the retry information if this is a retry outcome.
    pub fn retry_info(&self) -> Option<&RetryInfo> {
        match self {
            Outcome::Retry(info) => Some(info),
            _ => None,
        }
    }
}

/// What closing a poll yields.
#[derive(Debug, PartialEq)]
pub enum Completion {
    /// Local outcome of a plain request.
    Resolved(Outcome),

    /// Merged response a relay poll owes the original requestor.
    Relay {
        requestor: MemberId,
        request_id: RequestId,
        response: GridResponse,
    },
}

/// Response collector of one dispatched request.
#[derive(Debug)]
pub struct Poll {
    /// Member driving this poll.
    me: MemberId,

    request: PartitionRequest,

    /// Targets yet to answer.
    remaining: MemberSet,

    /// Targets that left without answering.
    departed: MemberSet,

    /// All partitions reported rejected so far.
    rejected: PartitionSet,

    /// All partitions reported processed so far.
    merged_parts: PartitionSet,

    /// Items removed from the request by rejections.
    remainder: Option<RequestKind>,

    merger: ResponseMerger,

    /// Shared with the sibling polls of the same operation, if any.
    accumulator: Option<OutstandingPartitions>,

    state: PollState,
}

impl Poll {
    /// Creates a new open poll for a dispatched request awaiting all of its
    /// targets.
    pub fn new(
        me: MemberId,
        request: PartitionRequest,
        accumulator: Option<OutstandingPartitions>,
    ) -> Self {
        let count = request.tracked().partition_count();
        Poll {
            me,
            remaining: request.to().clone(),
            departed: MemberSet::new(),
            rejected: PartitionSet::empty(count),
            merged_parts: PartitionSet::empty(count),
            remainder: None,
            merger: ResponseMerger::for_request(me, &request),
            accumulator,
            state: PollState::Open,
            request,
        }
    }

    #[inline]
    pub fn request(&self) -> &PartitionRequest {
        &self.request
    }

    #[inline]
    pub fn state(&self) -> PollState {
        self.state
    }

    #[inline]
    pub fn remaining(&self) -> &MemberSet {
        &self.remaining
    }

    #[inline]
    pub fn departed(&self) -> &MemberSet {
        &self.departed
    }

    #[inline]
    pub fn rejected(&self) -> &PartitionSet {
        &self.rejected
    }

    #[inline]
    pub fn merged_partitions(&self) -> &PartitionSet {
        &self.merged_parts
    }

    /// Stashes items removed from the request into the retry remainder.
    fn keep_remainder(&mut self, removed: RequestKind) {
        match self.remainder.as_mut() {
            None => self.remainder = Some(removed),
            Some(remainder) => {
                if let Err(removed) = remainder.absorb(removed) {
                    pf_error!(
                        self.me;
                        "remainder of {:?} cannot absorb {:?}",
                        self.request,
                        removed
                    );
                }
            }
        }
    }

    /// Removes rejected partitions, and the items in them, from the
    /// request's scope.
    fn apply_rejected(
        &mut self,
        rejected: &PartitionSet,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) {
        self.rejected.add_set(rejected);
        if let Some(removed) =
            self.request.reject_partitions(rejected, key_partition)
        {
            self.keep_remainder(removed);
        }
    }

    /// Processes one target's response. Responses from members that are not
    /// awaited are ignored.
    pub fn on_response(
        &mut self,
        from: MemberId,
        response: GridResponse,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) -> Result<PollState, GridError> {
        if self.state != PollState::Open || !self.remaining.remove(from) {
            pf_warn!(
                self.me;
                "unexpected response from m{} to {:?}",
                from,
                self.request
            );
            return Ok(self.state);
        }
        pf_trace!(self.me; "poll {} got {:?} from m{}", self.request.id(), response, from);

        if let Some(rejected) = response.rejected.as_ref() {
            self.apply_rejected(rejected, &key_partition);
        }
        if let Some(processed) = response.partitions.as_ref() {
            self.merged_parts.add_set(processed);
            if let Some(accumulator) = self.accumulator.as_ref() {
                let overlap = accumulator.subtract(processed)?;
                if !overlap.is_empty() {
                    pf_warn!(
                        self.me;
                        "partitions {:?} of {:?} already accounted for by a sibling",
                        overlap,
                        self.request
                    );
                }
            }
        }
        self.merger.merge(response.result);

        if self.remaining.is_empty() {
            self.state = PollState::Completing;
        }
        Ok(self.state)
    }

    /// Records that a member left the cluster. Its share is never assumed
    /// to have succeeded.
    pub fn on_member_left(&mut self, member: MemberId) -> PollState {
        if self.state == PollState::Open && self.remaining.remove(member) {
            pf_debug!(
                self.me;
                "m{} left before answering {:?}",
                member,
                self.request
            );
            self.departed.insert(member);
            if self.remaining.is_empty() {
                self.state = PollState::Completing;
            }
        }
        self.state
    }

    /// Closes a completing poll, yielding its outcome. A relay poll instead
    /// yields the merged response owed to the original requestor.
    pub fn close(
        &mut self,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) -> Result<Completion, GridError> {
        if self.state != PollState::Completing {
            return logged_err!(
                self.me;
                "closing poll of {:?} in state {:?}",
                self.request,
                self.state
            );
        }
        self.state = PollState::Closed;
        let incomplete = !self.departed.is_empty();
        let merger = std::mem::replace(
            &mut self.merger,
            ResponseMerger::new(self.me, MergeStrategy::for_kind(self.request.kind())),
        );

        if let Some(deferred) = self.request.take_deferred() {
            let mut response = deferred.response;
            response.result = merger.finish(incomplete);
            return Ok(Completion::Relay {
                requestor: deferred.requestor,
                request_id: deferred.request_id,
                response,
            });
        }

        let merged = merger.finish(false);
        if let RequestKind::StorageMetadata { .. } = self.request.kind() {
            return Ok(Completion::Resolved(self.metadata_outcome(merged, incomplete)));
        }

        if incomplete {
            // whatever was not reported processed is treated as rejected
            let mut unresolved = self.request.tracked().clone();
            unresolved.remove_set(&self.merged_parts);
            self.apply_rejected(&unresolved, &key_partition);
        }
        Ok(Completion::Resolved(self.data_outcome(merged, incomplete)))
    }

    fn metadata_outcome(&self, merged: ResponseResult, incomplete: bool) -> Outcome {
        let retry = |reason| {
            Outcome::Retry(RetryInfo {
                reason,
                accepted: None,
                partitions: PartitionSet::empty(0),
                remainder: Some(self.request.kind().clone()),
            })
        };
        if incomplete {
            return retry(RetryReason::IncompleteMembership);
        }
        match check_response(merged) {
            Ok(Some(value)) => Outcome::Success(value),
            Ok(None) => retry(RetryReason::Sentinel),
            Err(e) => Outcome::Failure(e),
        }
    }

    fn data_outcome(&mut self, merged: ResponseResult, incomplete: bool) -> Outcome {
        let value = match merged {
            ResponseResult::Failure(cause) => {
                return Outcome::Failure(GridError::msg(cause));
            }
            ResponseResult::Retry => {
                // nothing usable came back: the whole scope is owed again
                self.keep_remainder(self.request.kind().clone());
                let mut partitions = self.request.tracked().clone();
                partitions.add_set(&self.rejected);
                return Outcome::Retry(RetryInfo {
                    reason: RetryReason::Sentinel,
                    accepted: None,
                    partitions,
                    remainder: self.remainder.take(),
                });
            }
            ResponseResult::Success(value) => value,
        };

        let reason = match (incomplete, self.request.rejection()) {
            (true, _) => RetryReason::IncompleteMembership,
            (false, Rejection::None) => return Outcome::Success(value),
            (false, Rejection::Partial) => RetryReason::PartialRejection,
            (false, Rejection::Full) => RetryReason::FullRejection,
        };
        let accepted = match self.request.rejection() {
            Rejection::Full => None,
            _ => Some(value),
        };
        Outcome::Retry(RetryInfo {
            reason,
            accepted,
            partitions: self.rejected.clone(),
            remainder: self.remainder.take(),
        })
    }
}
