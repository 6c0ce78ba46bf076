//! Storage metadata requests: relaying through the ownership senior.
//!
//! A metadata change (e.g. index registration) must reach every current and
//! pending owner. The requestor sends it to the senior, which applies it and
//! then relays a copy to all other owners, holding its own response back
//! until the relay poll completes. Retries and relays may apply the same
//! change more than once on a member, so every handler of these requests
//! must be idempotent.

use crate::cluster::RelayContext;
use crate::request::{
    DeferredResponse, GridMsg, GridResponse, PartitionRequest, RequestId,
    RequestKind, ResponseResult, ResponseValue,
};
use crate::utils::GridError;

/// Checks a metadata response result: the RETRY sentinel yields `Ok(None)`
/// and is never a usable value, a failure is raised as an error, anything
/// else is returned.
pub fn check_response(
    result: ResponseResult,
) -> Result<Option<ResponseValue>, GridError> {
    match result {
        ResponseResult::Success(value) => Ok(Some(value)),
        ResponseResult::Retry => Ok(None),
        ResponseResult::Failure(cause) => Err(GridError::msg(cause)),
    }
}

// PartitionRequest storage metadata relay implementation
impl PartitionRequest {
    /// True exactly on the senior's relay copy, which carries the deferred
    /// response owed to the original requestor.
    #[inline]
    pub fn is_relayed_request(&self) -> bool {
        self.deferred().is_some()
    }

    /// Relays this metadata request from the ownership senior to every other
    /// current or pending owner. If there is no one else, posts `original`
    /// to the requestor right away and returns `Ok(None)`; otherwise
    /// dispatches the relay copy, whose poll will post the merged response
    /// when it completes, and returns its request ID.
    pub fn relay_request(
        &self,
        original: GridResponse,
        ctx: &mut impl RelayContext,
    ) -> Result<Option<RequestId>, GridError> {
        let me = ctx.this_member();
        let op = match self.kind() {
            RequestKind::StorageMetadata {
                op,
                relayed: false,
            } => op.clone(),
            _ => {
                return logged_err!(me; "cannot relay request {:?}", self);
            }
        };
        if ctx.ownership_senior() != Some(me) {
            return logged_err!(
                me;
                "relay of {:?} attempted by non-senior",
                self
            );
        }

        // pending-join members may already know about the service, so they
        // must see the change too
        let mut targets = ctx.ownership_members(true);
        targets.remove(me);
        if targets.is_empty() {
            pf_debug!(me; "no relay targets for {:?}, answering directly", self);
            ctx.post(
                self.from(),
                GridMsg::Response {
                    id: self.id(),
                    response: original,
                },
            )?;
            return Ok(None);
        }

        let mut relay = self.clone_for_dispatch();
        *relay.payload_mut() = RequestKind::StorageMetadata { op, relayed: true };
        relay.retarget(me, targets);
        relay.set_deferred(DeferredResponse {
            requestor: self.from(),
            request_id: self.id(),
            response: original,
        });
        pf_debug!(me; "relaying {:?}", relay);
        ctx.dispatch(relay).map(Some)
    }
}
