//! GridMember -- request execution on the target side.

use super::*;

use crate::cluster::OwnershipService;
use crate::request::{
    EntryOp, GridResponse, KeyOp, MaskOp, MetadataOp, PartitionRequest,
    ResponseResult, ResponseValue,
};
use crate::utils::PartitionSet;

// GridMember request execution
impl GridMember {
    /// Sends a response back to a requestor. A requestor that has left is
    /// not an error.
    fn reply(
        &mut self,
        requestor: MemberId,
        id: RequestId,
        response: GridResponse,
    ) -> Result<(), GridError> {
        pf_trace!(self.me; "reply to m{} request {} {:?}", requestor, id, response);
        if let Err(e) = self.post(requestor, GridMsg::Response { id, response }) {
            pf_warn!(self.me; "reply to m{} dropped: {}", requestor, e);
        }
        Ok(())
    }

    /// Handler of an inbound request.
    pub(super) fn handle_request(
        &mut self,
        peer: MemberId,
        req: PartitionRequest,
    ) -> Result<(), GridError> {
        if peer != req.from() {
            pf_warn!(self.me; "request {:?} arrived via m{}", req, peer);
        }

        if let RequestKind::StorageMetadata { op, relayed } = req.kind() {
            let (op, relayed) = (op.clone(), *relayed);
            return self.handle_metadata(req, op, relayed);
        }

        let response = {
            let view = req.safe_view(self.me);
            self.execute(&view).unwrap_or_else(|e| GridResponse::failure(e))
        };
        self.reply(req.from(), req.id(), response)
    }

    /// Executes a data request against my store. Partitions I do not own
    /// are rejected and left untouched.
    fn execute(&mut self, kind: &RequestKind) -> Result<GridResponse, GridError> {
        let owned = self.owned_partitions();
        let count = self.config.partition_count;
        let mut processed = PartitionSet::empty(count);
        let mut rejected = PartitionSet::empty(count);

        let value = match kind {
            RequestKind::KeySet { op, keys } => {
                let mut entries = Vec::with_capacity(keys.len());
                let mut present = vec![];
                for key in keys {
                    let p = self.ownership.key_partition(key);
                    if !owned.contains(p) {
                        rejected.add(p)?;
                        continue;
                    }
                    processed.add(p)?;
                    match op {
                        KeyOp::Get => {
                            entries.push((key.clone(), self.store.get(p, key)?))
                        }
                        KeyOp::Remove => entries
                            .push((key.clone(), self.store.remove(p, key)?)),
                        KeyOp::Contains => {
                            if self.store.get(p, key)?.is_some() {
                                present.push(key.clone());
                            }
                        }
                    }
                }
                match op {
                    KeyOp::Contains => ResponseValue::Keys(present),
                    _ => ResponseValue::Entries(entries),
                }
            }

            RequestKind::EntryMap {
                op: EntryOp::PutAll,
                entries,
            } => {
                let mut written = 0;
                for (key, value) in entries {
                    let p = self.ownership.key_partition(key);
                    if !owned.contains(p) {
                        rejected.add(p)?;
                        continue;
                    }
                    processed.add(p)?;
                    match value {
                        Some(value) => {
                            self.store.put(p, key.clone(), value.clone())?;
                        }
                        None => {
                            self.store.remove(p, key)?;
                        }
                    }
                    written += 1;
                }
                ResponseValue::Count(written)
            }

            RequestKind::PartitionMask { op, mask } => {
                // null mask: everything I own right now
                let parts = mask.as_ref().unwrap_or(&owned);
                let mut total = 0;
                let mut listed = vec![];
                let mut empty = true;
                for p in parts.iter() {
                    if !owned.contains(p) {
                        rejected.add(p)?;
                        continue;
                    }
                    processed.add(p)?;
                    match op {
                        MaskOp::Size => total += self.store.partition_len(p)? as u64,
                        MaskOp::Keys => listed.extend(self.store.partition_keys(p)?),
                        MaskOp::Clear => {
                            total += self.store.clear_partition(p)? as u64
                        }
                        MaskOp::IsEmpty => {
                            empty &= self.store.partition_len(p)? == 0
                        }
                    }
                }
                match op {
                    MaskOp::Keys => ResponseValue::Keys(listed),
                    MaskOp::IsEmpty => ResponseValue::Flag(empty),
                    _ => ResponseValue::Count(total),
                }
            }

            RequestKind::StorageMetadata { .. } => {
                return logged_err!(self.me; "{:?} reached data execution", kind);
            }
        };

        pf_trace!(
            self.me;
            "executed {}: processed {:?} rejected {:?}",
            kind.flavor(),
            processed,
            rejected
        );
        Ok(GridResponse::success(value)
            .with_partitions(processed)
            .with_rejected(rejected))
    }

    /// Applies a metadata change to my index registry. Applying the same
    /// change again has no further effect.
    fn apply_metadata(&mut self, op: &MetadataOp) -> GridResponse {
        let changed = match op {
            MetadataOp::AddIndex(name) => self.store.add_index(name),
            MetadataOp::RemoveIndex(name) => self.store.remove_index(name),
        };
        match changed {
            Ok(changed) => {
                pf_debug!(self.me; "applied {:?}, changed {}", op, changed);
                GridResponse::success(ResponseValue::Partitions(
                    self.owned_partitions(),
                ))
            }
            Err(e) => {
                pf_warn!(self.me; "failed to apply {:?}: {}", op, e);
                GridResponse::failure(e)
            }
        }
    }

    /// Handler of an inbound metadata request. A relay copy is applied and
    /// answered. An original is applied and relayed onward if I am the
    /// senior, and answered with RETRY otherwise.
    fn handle_metadata(
        &mut self,
        req: PartitionRequest,
        op: MetadataOp,
        relayed: bool,
    ) -> Result<(), GridError> {
        if relayed {
            let response = self.apply_metadata(&op);
            return self.reply(req.from(), req.id(), response);
        }

        if self.ownership_senior() != Some(self.me) {
            pf_debug!(self.me; "not the senior, asking m{} to retry", req.from());
            return self.reply(req.from(), req.id(), GridResponse::retry());
        }

        let response = self.apply_metadata(&op);
        match response.result {
            ResponseResult::Success(_) => {
                req.relay_request(response, self)?;
                Ok(())
            }
            _ => self.reply(req.from(), req.id(), response),
        }
    }
}
