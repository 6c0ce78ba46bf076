//! Combining several members' results into one.

use crate::request::{
    MaskOp, PartitionRequest, RequestKind, ResponseResult, ResponseValue,
};
use crate::utils::MemberId;

/// How two successful values are combined.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MergeStrategy {
    /// Append entry or key lists.
    Concat,

    /// Add up counts.
    Sum,

    /// Logical AND of flags.
    All,

    /// Union partition sets.
    Union,
}

impl MergeStrategy {
    /// Selects the strategy matching a request flavor and operation.
    pub fn for_kind(kind: &RequestKind) -> Self {
        match kind {
            RequestKind::KeySet { .. } => MergeStrategy::Concat,
            RequestKind::EntryMap { .. } => MergeStrategy::Sum,
            RequestKind::PartitionMask { op: MaskOp::Keys, .. } => {
                MergeStrategy::Concat
            }
            RequestKind::PartitionMask {
                op: MaskOp::IsEmpty, ..
            } => MergeStrategy::All,
            RequestKind::PartitionMask { .. } => MergeStrategy::Sum,
            RequestKind::StorageMetadata { .. } => MergeStrategy::Union,
        }
    }

    /// Combines two values. Gives both back untouched if they do not fit
    /// this strategy.
    fn combine(
        &self,
        prior: ResponseValue,
        next: ResponseValue,
    ) -> Result<ResponseValue, (ResponseValue, ResponseValue)> {
        match (self, prior, next) {
            (_, ResponseValue::Empty, v) | (_, v, ResponseValue::Empty) => Ok(v),
            (
                MergeStrategy::Concat,
                ResponseValue::Entries(mut a),
                ResponseValue::Entries(b),
            ) => {
                a.extend(b);
                Ok(ResponseValue::Entries(a))
            }
            (
                MergeStrategy::Concat,
                ResponseValue::Keys(mut a),
                ResponseValue::Keys(b),
            ) => {
                a.extend(b);
                Ok(ResponseValue::Keys(a))
            }
            (
                MergeStrategy::Sum,
                ResponseValue::Count(a),
                ResponseValue::Count(b),
            ) => Ok(ResponseValue::Count(a + b)),
            (
                MergeStrategy::All,
                ResponseValue::Flag(a),
                ResponseValue::Flag(b),
            ) => Ok(ResponseValue::Flag(a && b)),
            (
                MergeStrategy::Union,
                ResponseValue::Partitions(mut a),
                ResponseValue::Partitions(b),
            ) => {
                a.add_set(&b);
                Ok(ResponseValue::Partitions(a))
            }
            (_, prior, next) => Err((prior, next)),
        }
    }
}

/// Folds member results in arrival order into one result. Failure beats
/// retry, which beats success; successes combine by the strategy. The
/// outcome class does not depend on arrival order.
#[derive(Debug)]
pub struct ResponseMerger {
    /// Member doing the merge, for logging.
    me: MemberId,

    strategy: MergeStrategy,

    /// `None` until the first result.
    merged: Option<ResponseResult>,
}

impl ResponseMerger {
    /// Creates an empty merger with the given strategy.
    pub fn new(me: MemberId, strategy: MergeStrategy) -> Self {
        ResponseMerger {
            me,
            strategy,
            merged: None,
        }
    }

    /// Creates the merger for a request's poll. On a relay copy the merge
    /// starts from the senior's own deferred response.
    pub fn for_request(me: MemberId, request: &PartitionRequest) -> Self {
        let mut merger = Self::new(me, MergeStrategy::for_kind(request.kind()));
        if let Some(deferred) = request.deferred() {
            merger.merged = Some(deferred.response.result.clone());
        }
        merger
    }

    #[inline]
    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Merges in one more result.
    pub fn merge(&mut self, result: ResponseResult) {
        self.merged = Some(match (self.merged.take(), result) {
            (None, result) => result,
            (Some(failure @ ResponseResult::Failure(_)), _) => failure,
            (_, failure @ ResponseResult::Failure(_)) => failure,
            (Some(ResponseResult::Retry), _) | (_, ResponseResult::Retry) => {
                ResponseResult::Retry
            }
            (
                Some(ResponseResult::Success(prior)),
                ResponseResult::Success(next),
            ) => match self.strategy.combine(prior, next) {
                Ok(value) => ResponseResult::Success(value),
                Err((prior, next)) => {
                    pf_warn!(
                        self.me;
                        "skipped merging {:?} into {:?} by {:?}",
                        next,
                        prior,
                        self.strategy
                    );
                    ResponseResult::Success(prior)
                }
            },
        });
    }

    /// Peeks at the merged result so far.
    #[inline]
    pub fn result(&self) -> Option<&ResponseResult> {
        self.merged.as_ref()
    }

    /// Consumes the merger and yields the final result, forced to RETRY if
    /// some contribution is known to be missing.
    pub fn finish(self, incomplete: bool) -> ResponseResult {
        if incomplete {
            return ResponseResult::Retry;
        }
        self.merged
            .unwrap_or(ResponseResult::Success(ResponseValue::Empty))
    }
}
