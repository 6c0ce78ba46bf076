//! GridMember -- operation fan-out and poll bookkeeping.

use super::*;

use crate::cluster::{key_partition, OwnershipService, RelayContext};
use crate::poll::{
    Completion, MergeStrategy, OutstandingPartitions, Poll, PollState,
    ResponseMerger, RetryInfo, RetryReason,
};
use crate::request::{
    GridResponse, KeyOp, MaskOp, PartitionRequest, ResponseResult,
    ResponseValue,
};
use crate::utils::{MemberSet, PartitionId, PartitionSet};

/// Logical operation ID type, local to the coordinating member.
pub(crate) type OpId = u64;

/// An open poll plus the operation it belongs to, if any. Relay polls
/// belong to no operation.
#[derive(Debug)]
pub(crate) struct PollEntry {
    poll: Poll,
    op: Option<OpId>,
}

/// Value answered when an operation covers nothing at all.
fn empty_value(kind: &RequestKind) -> ResponseValue {
    match kind {
        RequestKind::KeySet {
            op: KeyOp::Contains,
            ..
        } => ResponseValue::Keys(vec![]),
        RequestKind::KeySet { .. } => ResponseValue::Entries(vec![]),
        RequestKind::PartitionMask {
            op: MaskOp::Keys, ..
        } => ResponseValue::Keys(vec![]),
        RequestKind::PartitionMask {
            op: MaskOp::IsEmpty,
            ..
        } => ResponseValue::Flag(true),
        RequestKind::EntryMap { .. } | RequestKind::PartitionMask { .. } => {
            ResponseValue::Count(0)
        }
        RequestKind::StorageMetadata { .. } => ResponseValue::Empty,
    }
}

/// One caller submission fanned out into sibling requests, one per owner.
#[derive(Debug)]
pub(crate) struct Operation {
    /// Coordinating member, for logging.
    me: MemberId,

    /// Sibling polls not yet closed.
    open: usize,

    /// Shared with every sibling poll.
    accumulator: OutstandingPartitions,

    /// Merges successful and accepted values.
    merger: ResponseMerger,

    accepted_any: bool,

    /// First failure seen; wins over everything else.
    failure: Option<GridError>,

    retry_reasons: Vec<RetryReason>,

    /// Partitions reported owed by sibling retries.
    retry_parts: PartitionSet,

    /// Concatenated retry remainders.
    remainder: Option<RequestKind>,

    /// Set if some items had no owner at submission.
    orphaned: bool,

    tx_reply: oneshot::Sender<Outcome>,
}

impl Operation {
    fn new(
        me: MemberId,
        kind: &RequestKind,
        scope: PartitionSet,
        tx_reply: oneshot::Sender<Outcome>,
    ) -> Self {
        let count = scope.partition_count();
        Operation {
            me,
            open: 0,
            accumulator: OutstandingPartitions::new(scope),
            merger: ResponseMerger::new(me, MergeStrategy::for_kind(kind)),
            accepted_any: false,
            failure: None,
            retry_reasons: vec![],
            retry_parts: PartitionSet::empty(count),
            remainder: None,
            orphaned: false,
            tx_reply,
        }
    }

    fn absorb_remainder(&mut self, more: RequestKind) {
        match self.remainder.as_mut() {
            None => self.remainder = Some(more),
            Some(remainder) => {
                if let Err(more) = remainder.absorb(more) {
                    pf_error!(self.me; "cannot concatenate remainder {:?}", more);
                }
            }
        }
    }

    /// Items that no member owned in the coordinator's view.
    fn add_orphans(&mut self, orphans: RequestKind) {
        self.orphaned = true;
        self.absorb_remainder(orphans);
    }

    /// Folds in the outcome of one closed sibling poll.
    fn record(&mut self, outcome: Outcome) {
        self.open = self.open.saturating_sub(1);
        match outcome {
            Outcome::Success(value) => {
                self.accepted_any = true;
                self.merger.merge(ResponseResult::Success(value));
            }
            Outcome::Retry(info) => {
                self.retry_reasons.push(info.reason);
                self.retry_parts.add_set(&info.partitions);
                if let Some(value) = info.accepted {
                    self.accepted_any = true;
                    self.merger.merge(ResponseResult::Success(value));
                }
                if let Some(remainder) = info.remainder {
                    self.absorb_remainder(remainder);
                }
            }
            Outcome::Failure(e) => {
                if self.failure.is_none() {
                    self.failure = Some(e);
                }
            }
        }
    }

    /// Resolves the operation's single outcome from all of its siblings.
    fn resolve(self) -> Result<(Outcome, oneshot::Sender<Outcome>), GridError> {
        if let Some(e) = self.failure {
            return Ok((Outcome::Failure(e), self.tx_reply));
        }

        let outstanding = self.accumulator.remaining()?;
        let value = match self.merger.finish(false) {
            ResponseResult::Success(value) => value,
            _ => ResponseValue::Empty,
        };
        if self.retry_reasons.is_empty() && !self.orphaned {
            if !outstanding.is_empty() {
                pf_warn!(
                    self.me;
                    "partitions {:?} never reported processed",
                    outstanding
                );
            }
            return Ok((Outcome::Success(value), self.tx_reply));
        }

        let reason = if self.retry_reasons.contains(&RetryReason::IncompleteMembership)
        {
            RetryReason::IncompleteMembership
        } else if self.retry_reasons.contains(&RetryReason::Sentinel) {
            RetryReason::Sentinel
        } else if self.accepted_any {
            RetryReason::PartialRejection
        } else {
            RetryReason::FullRejection
        };
        let mut partitions = outstanding;
        partitions.add_set(&self.retry_parts);
        let info = RetryInfo {
            reason,
            accepted: self.accepted_any.then_some(value),
            partitions,
            remainder: self.remainder,
        };
        Ok((Outcome::Retry(info), self.tx_reply))
    }

    /// Resolves and delivers the outcome to the caller.
    fn finish(self) -> Result<(), GridError> {
        let me = self.me;
        let (outcome, tx_reply) = self.resolve()?;
        pf_debug!(me; "operation resolved {:?}", outcome);
        if tx_reply.send(outcome).is_err() {
            pf_warn!(me; "caller gone before operation resolved");
        }
        Ok(())
    }
}

// GridMember operation fan-out
impl GridMember {
    /// Partition derivation under my service's partition count.
    fn key_partition_fn(&self) -> impl Fn(&[u8]) -> PartitionId + Copy {
        let count = self.config.partition_count;
        move |key: &[u8]| key_partition(key, count)
    }

    /// Turns a caller submission into one logical operation: splits the
    /// payload by owner under my current view and dispatches one request per
    /// owner, all sharing one outstanding-partition accumulator.
    pub(super) fn submit_operation(
        &mut self,
        kind: RequestKind,
        tx_reply: oneshot::Sender<Outcome>,
    ) -> Result<(), GridError> {
        let me = self.me;
        let count = self.config.partition_count;
        let kp = self.key_partition_fn();

        let kind = match kind {
            // a whole-cache mask is split into explicit per-owner masks
            RequestKind::PartitionMask { op, mask: None } => {
                RequestKind::PartitionMask {
                    op,
                    mask: Some(PartitionSet::full(count)),
                }
            }
            RequestKind::StorageMetadata { relayed: true, .. } => {
                let _ = tx_reply.send(Outcome::Failure(GridError::msg(
                    "relayed metadata request submitted by caller",
                )));
                return logged_err!(me; "caller submitted a relayed request");
            }
            kind => kind,
        };

        let op_id = self.next_op;
        self.next_op += 1;

        if let RequestKind::StorageMetadata { .. } = kind {
            let senior = match self.ownership.ownership_senior() {
                Some(senior) => senior,
                None => {
                    pf_warn!(me; "no ownership senior for {:?}", kind);
                    let _ = tx_reply.send(Outcome::Retry(RetryInfo {
                        reason: RetryReason::IncompleteMembership,
                        accepted: None,
                        partitions: PartitionSet::empty(count),
                        remainder: Some(kind),
                    }));
                    return Ok(());
                }
            };
            let op = Operation::new(me, &kind, PartitionSet::empty(count), tx_reply);
            let request = PartitionRequest::new(me, MemberSet::single(senior), kind)
                .with_tracked(PartitionSet::empty(count));
            return self.launch_operation(op_id, op, vec![request]);
        }

        let scope = kind
            .scope(count, kp)
            .unwrap_or_else(|| PartitionSet::empty(count));
        if scope.is_empty() {
            let _ = tx_reply.send(Outcome::Success(empty_value(&kind)));
            return Ok(());
        }

        let mut op = Operation::new(me, &kind, scope.clone(), tx_reply);
        let mut rest = kind;
        let mut requests = vec![];
        for owner in self.ownership.ownership_members(false).iter() {
            let parts = scope.intersection(&self.ownership.owned_by(owner));
            if parts.is_empty() {
                continue;
            }
            if let Some(share) = rest.split_off(&parts, kp) {
                requests.push(
                    PartitionRequest::new(me, MemberSet::single(owner), share)
                        .with_tracked(parts),
                );
            }
        }

        let orphan_parts = rest
            .scope(count, kp)
            .unwrap_or_else(|| PartitionSet::empty(count));
        if !orphan_parts.is_empty() {
            pf_debug!(me; "partitions {:?} have no owner", orphan_parts);
            op.add_orphans(rest);
        }
        self.launch_operation(op_id, op, requests)
    }

    /// Registers an operation and dispatches its sibling requests.
    fn launch_operation(
        &mut self,
        op_id: OpId,
        mut op: Operation,
        requests: Vec<PartitionRequest>,
    ) -> Result<(), GridError> {
        if requests.is_empty() {
            return op.finish();
        }
        // counted upfront so that the operation cannot resolve before all of
        // its siblings are out
        op.open = requests.len();
        self.ops.insert(op_id, op);
        for request in requests {
            self.dispatch_request(request, Some(op_id))?;
        }
        Ok(())
    }

    /// Assigns a request ID, opens a poll, and sends the request to all of
    /// its targets. Unreachable targets count as departed.
    fn dispatch_request(
        &mut self,
        mut request: PartitionRequest,
        op: Option<OpId>,
    ) -> Result<RequestId, GridError> {
        let id = self.next_req;
        self.next_req += 1;
        request.set_id(id);

        let sends: Vec<(MemberId, PartitionRequest)> = request
            .to()
            .iter()
            .map(|target| {
                let mut wire = request.clone_for_dispatch();
                wire.set_id(id);
                (target, wire)
            })
            .collect();
        pf_trace!(self.me; "dispatching {:?}", request);

        let accumulator = op
            .and_then(|op_id| self.ops.get(&op_id))
            .map(|op| op.accumulator.clone());
        self.polls.insert(
            id,
            PollEntry {
                poll: Poll::new(self.me, request, accumulator),
                op,
            },
        );

        let mut unreachable = vec![];
        for (target, wire) in sends {
            if let Err(e) = self.transport.send_msg(GridMsg::Request(wire), target) {
                pf_warn!(self.me; "request {} to m{} not sent: {}", id, target, e);
                unreachable.push(target);
            }
        }
        if let Some(entry) = self.polls.get_mut(&id) {
            let mut state = entry.poll.state();
            for target in unreachable {
                state = entry.poll.on_member_left(target);
            }
            if state == PollState::Completing {
                self.finish_poll(id)?;
            }
        }
        Ok(id)
    }

    /// Closes a completing poll and routes its completion.
    fn finish_poll(&mut self, id: RequestId) -> Result<(), GridError> {
        let PollEntry { mut poll, op } = match self.polls.remove(&id) {
            Some(entry) => entry,
            None => return logged_err!(self.me; "no poll for request {}", id),
        };

        match poll.close(self.key_partition_fn())? {
            Completion::Relay {
                requestor,
                request_id,
                response,
            } => {
                pf_debug!(
                    self.me;
                    "relay {} done, answering m{} request {}",
                    id,
                    requestor,
                    request_id
                );
                let msg = GridMsg::Response {
                    id: request_id,
                    response,
                };
                if let Err(e) = self.post(requestor, msg) {
                    pf_warn!(self.me; "relay answer to m{} lost: {}", requestor, e);
                }
                Ok(())
            }
            Completion::Resolved(outcome) => match op {
                Some(op_id) => self.record_outcome(op_id, outcome),
                None => {
                    pf_warn!(self.me; "outcome of request {} has no operation", id);
                    Ok(())
                }
            },
        }
    }

    fn record_outcome(
        &mut self,
        op_id: OpId,
        outcome: Outcome,
    ) -> Result<(), GridError> {
        let op = match self.ops.get_mut(&op_id) {
            Some(op) => op,
            None => return logged_err!(self.me; "no operation {}", op_id),
        };
        op.record(outcome);
        if op.open == 0 {
            if let Some(op) = self.ops.remove(&op_id) {
                op.finish()?;
            }
        }
        Ok(())
    }

    /// Handler of a response to one of my requests.
    pub(super) fn handle_response(
        &mut self,
        peer: MemberId,
        id: RequestId,
        response: GridResponse,
    ) -> Result<(), GridError> {
        let kp = self.key_partition_fn();
        let entry = match self.polls.get_mut(&id) {
            Some(entry) => entry,
            None => {
                pf_warn!(self.me; "response from m{} to closed request {}", peer, id);
                return Ok(());
            }
        };
        if entry.poll.on_response(peer, response, kp)? == PollState::Completing {
            self.finish_poll(id)?;
        }
        Ok(())
    }

    /// Handler of a member departure: the member's partitions become
    /// orphaned in my view, and every poll awaiting it gives up on it.
    pub(super) fn handle_member_left(
        &mut self,
        peer: MemberId,
    ) -> Result<(), GridError> {
        pf_info!(self.me; "m{} left the cluster", peer);
        self.ownership.release_member(peer);

        let completing: Vec<RequestId> = self
            .polls
            .iter_mut()
            .filter_map(|(&id, entry)| {
                (entry.poll.on_member_left(peer) == PollState::Completing)
                    .then_some(id)
            })
            .collect();
        for id in completing {
            if let Err(e) = self.finish_poll(id) {
                pf_error!(self.me; "error closing poll {}: {}", id, e);
            }
        }
        Ok(())
    }
}

impl OwnershipService for GridMember {
    fn this_member(&self) -> MemberId {
        self.me
    }

    fn partition_count(&self) -> u32 {
        self.config.partition_count
    }

    fn key_partition(&self, key: &[u8]) -> PartitionId {
        self.ownership.key_partition(key)
    }

    fn ownership_members(&self, include_pending: bool) -> MemberSet {
        self.ownership.ownership_members(include_pending)
    }

    fn ownership_senior(&self) -> Option<MemberId> {
        self.ownership.ownership_senior()
    }

    fn owned_partitions(&self) -> PartitionSet {
        self.ownership.owned_by(self.me)
    }

    fn post(&mut self, to: MemberId, msg: GridMsg) -> Result<(), GridError> {
        self.transport.send_msg(msg, to)
    }
}

impl RelayContext for GridMember {
    fn dispatch(
        &mut self,
        request: PartitionRequest,
    ) -> Result<RequestId, GridError> {
        self.dispatch_request(request, None)
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use bytes::Bytes;

    fn operation(scope: &[u32]) -> Result<(Operation, oneshot::Receiver<Outcome>), GridError> {
        let kind = RequestKind::KeySet {
            op: KeyOp::Get,
            keys: vec![],
        };
        let (tx, rx) = oneshot::channel();
        let op = Operation::new(
            0,
            &kind,
            PartitionSet::from_ids(8, scope.iter().copied())?,
            tx,
        );
        Ok((op, rx))
    }

    fn entries(ids: &[u32]) -> ResponseValue {
        ResponseValue::Entries(
            ids.iter()
                .map(|i| (Bytes::from(format!("k{}", i)), None))
                .collect(),
        )
    }

    #[test]
    fn empty_values_by_kind() {
        assert_eq!(
            empty_value(&RequestKind::PartitionMask {
                op: MaskOp::Keys,
                mask: None
            }),
            ResponseValue::Keys(vec![])
        );
        assert_eq!(
            empty_value(&RequestKind::PartitionMask {
                op: MaskOp::Clear,
                mask: None
            }),
            ResponseValue::Count(0)
        );
        assert_eq!(
            empty_value(&RequestKind::PartitionMask {
                op: MaskOp::IsEmpty,
                mask: None
            }),
            ResponseValue::Flag(true)
        );
        assert_eq!(
            empty_value(&RequestKind::KeySet {
                op: KeyOp::Contains,
                keys: vec![]
            }),
            ResponseValue::Keys(vec![])
        );
    }

    #[test]
    fn siblings_all_succeed() -> Result<(), GridError> {
        let (mut op, _rx) = operation(&[0, 1])?;
        op.open = 2;
        op.accumulator.subtract(&PartitionSet::from_ids(8, [0, 1])?)?;
        op.record(Outcome::Success(entries(&[0])));
        op.record(Outcome::Success(entries(&[1])));
        assert_eq!(op.open, 0);
        let (outcome, _) = op.resolve()?;
        assert_eq!(outcome, Outcome::Success(entries(&[0, 1])));
        Ok(())
    }

    #[test]
    fn sibling_retry_keeps_accepted() -> Result<(), GridError> {
        let (mut op, _rx) = operation(&[0, 1, 2])?;
        op.open = 2;
        op.accumulator.subtract(&PartitionSet::from_ids(8, [0, 1])?)?;
        op.record(Outcome::Success(entries(&[0])));
        op.record(Outcome::Retry(RetryInfo {
            reason: RetryReason::PartialRejection,
            accepted: Some(entries(&[1])),
            partitions: PartitionSet::from_ids(8, [2])?,
            remainder: Some(RequestKind::KeySet {
                op: KeyOp::Get,
                keys: vec![Bytes::from_static(b"k2")],
            }),
        }));
        let (outcome, _) = op.resolve()?;
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::PartialRejection);
        assert_eq!(info.accepted, Some(entries(&[0, 1])));
        assert_eq!(info.partitions, PartitionSet::from_ids(8, [2])?);
        assert_eq!(info.remainder.map(|r| r.item_count()), Some(1));
        Ok(())
    }

    #[test]
    fn failure_wins_over_siblings() -> Result<(), GridError> {
        let (mut op, _rx) = operation(&[0, 1])?;
        op.open = 3;
        op.record(Outcome::Success(entries(&[0])));
        op.record(Outcome::Failure(GridError::msg("boom")));
        op.record(Outcome::Retry(RetryInfo {
            reason: RetryReason::Sentinel,
            accepted: None,
            partitions: PartitionSet::empty(8),
            remainder: None,
        }));
        let (outcome, _) = op.resolve()?;
        assert_eq!(outcome, Outcome::Failure(GridError::msg("boom")));
        Ok(())
    }

    #[test]
    fn orphans_only_is_full_rejection() -> Result<(), GridError> {
        let (mut op, mut rx) = operation(&[5])?;
        op.add_orphans(RequestKind::KeySet {
            op: KeyOp::Get,
            keys: vec![Bytes::from_static(b"k5")],
        });
        op.finish()?;
        let outcome = rx.try_recv().unwrap();
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::FullRejection);
        assert_eq!(info.partitions, PartitionSet::from_ids(8, [5])?);
        assert_eq!(info.accepted, None);
        Ok(())
    }
}
