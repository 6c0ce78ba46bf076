//! Partition-scoped requests.
//!
//! A `PartitionRequest` carries one of four payload flavors (`RequestKind`):
//! an explicit key set, an explicit entry map, a partition mask, or a storage
//! metadata change. Only the payload and a small header cross the wire; the
//! tracked partitions, rejection state, and deferred relay response are kept
//! locally by whoever holds the request.

mod codec;
mod metadata;
mod response;

pub use codec::{decode_request, encode_request};
pub use metadata::check_response;
pub use response::{
    DeferredResponse, GridMsg, GridResponse, ResponseResult, ResponseValue,
};

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::utils::{GridError, MemberId, MemberSet, PartitionId, PartitionSet};

use bytes::Bytes;

use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};

/// Request ID type, unique per issuing member.
pub type RequestId = u64;

/// Binary key with nullable binary value.
pub type Entry = (Bytes, Option<Bytes>);

/// Operation over an explicit key set.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum KeyOp {
    /// Read values; absent keys answer `None`.
    Get,

    /// Remove keys, answering the removed values.
    Remove,

    /// Answers the subset of keys that are present.
    Contains,
}

/// Operation over an explicit entry map.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EntryOp {
    /// Write all entries; a `None` value removes the key.
    PutAll,
}

/// Operation over a partition mask.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MaskOp {
    Size,
    Keys,
    Clear,

    /// True if no entry lives in the masked partitions.
    IsEmpty,
}

/// Idempotent service-wide metadata change.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MetadataOp {
    AddIndex(String),
    RemoveIndex(String),
}

/// Request payload, one variant per request flavor.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RequestKind {
    KeySet { op: KeyOp, keys: Vec<Bytes> },

    EntryMap { op: EntryOp, entries: Vec<Entry> },

    /// `None` mask means all partitions the executing member owns.
    PartitionMask { op: MaskOp, mask: Option<PartitionSet> },

    /// `relayed` is set on the copies the ownership senior sends out.
    StorageMetadata { op: MetadataOp, relayed: bool },
}

impl RequestKind {
    /// Short flavor name for logging.
    pub fn flavor(&self) -> &'static str {
        match self {
            Self::KeySet { .. } => "KeySet",
            Self::EntryMap { .. } => "EntryMap",
            Self::PartitionMask { .. } => "PartitionMask",
            Self::StorageMetadata { .. } => "StorageMetadata",
        }
    }

    /// Number of explicit items carried (keys or entries); zero for the
    /// other flavors.
    pub fn item_count(&self) -> usize {
        match self {
            Self::KeySet { keys, .. } => keys.len(),
            Self::EntryMap { entries, .. } => entries.len(),
            _ => 0,
        }
    }

    /// Returns the partitions covered by the explicit items or mask, or
    /// `None` for flavors without an explicit scope.
    pub fn scope(
        &self,
        partition_count: u32,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) -> Option<PartitionSet> {
        let mut scope = PartitionSet::empty(partition_count);
        match self {
            Self::KeySet { keys, .. } => {
                for key in keys {
                    let _ = scope.add(key_partition(&key[..]));
                }
            }
            Self::EntryMap { entries, .. } => {
                for (key, _) in entries {
                    let _ = scope.add(key_partition(&key[..]));
                }
            }
            Self::PartitionMask { mask: Some(mask), .. } => {
                scope.add_set(mask);
            }
            _ => return None,
        }
        Some(scope)
    }

    /// Moves the items whose partition is in `parts` out of this payload,
    /// returning them as a payload of the same flavor. For masks the removed
    /// partitions are taken out of the mask. Returns `None` if nothing was
    /// removed.
    pub(crate) fn split_off(
        &mut self,
        parts: &PartitionSet,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) -> Option<RequestKind> {
        match self {
            Self::KeySet { op, keys } => {
                let (moved, kept): (Vec<_>, Vec<_>) = keys
                    .drain(..)
                    .partition(|k| parts.contains(key_partition(&k[..])));
                *keys = kept;
                (!moved.is_empty()).then(|| Self::KeySet {
                    op: *op,
                    keys: moved,
                })
            }
            Self::EntryMap { op, entries } => {
                let (moved, kept): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|(k, _)| parts.contains(key_partition(&k[..])));
                *entries = kept;
                (!moved.is_empty()).then(|| Self::EntryMap {
                    op: *op,
                    entries: moved,
                })
            }
            Self::PartitionMask { op, mask: Some(mask) } => {
                let moved = mask.intersection(parts);
                if moved.is_empty() {
                    return None;
                }
                mask.remove_set(&moved);
                Some(Self::PartitionMask {
                    op: *op,
                    mask: Some(moved),
                })
            }
            _ => None,
        }
    }

    /// Appends another payload of the same flavor and operation into this
    /// one. Returns the other payload back if they cannot be combined.
    pub(crate) fn absorb(&mut self, other: RequestKind) -> Result<(), RequestKind> {
        match (self, other) {
            (
                Self::KeySet { op, keys },
                Self::KeySet {
                    op: other_op,
                    keys: more,
                },
            ) if *op == other_op => {
                keys.extend(more);
                Ok(())
            }
            (
                Self::EntryMap { op, entries },
                Self::EntryMap {
                    op: other_op,
                    entries: more,
                },
            ) if *op == other_op => {
                entries.extend(more);
                Ok(())
            }
            (
                Self::PartitionMask {
                    op,
                    mask: Some(mask),
                },
                Self::PartitionMask {
                    op: other_op,
                    mask: Some(more),
                },
            ) if *op == other_op => {
                mask.add_set(&more);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }
}

/// Rejection state of a dispatched request.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Rejection {
    /// Nothing rejected so far.
    #[default]
    None,

    /// Some of the scope was rejected; the rest stands as delivered.
    Partial,

    /// The whole scope was rejected.
    Full,
}

/// Request scoped to a subset of the keyspace.
pub struct PartitionRequest {
    /// ID assigned by the issuing member at dispatch.
    id: RequestId,

    /// Issuing member.
    from: MemberId,

    /// Target members.
    to: MemberSet,

    /// Wire payload. Shared with same-member executors, hence behind an
    /// `Arc` and copied on write.
    payload: Arc<RequestKind>,

    /// Partitions this request is still responsible for. Local only.
    tracked: PartitionSet,

    /// Local only.
    rejection: Rejection,

    /// Set exactly on the senior's relay copy of a metadata request. Local
    /// only.
    deferred: Option<DeferredResponse>,
}

impl PartitionRequest {
    /// Creates a new request from `from` to the given targets. Tracked
    /// partitions start empty; see `with_tracked()`.
    pub fn new(from: MemberId, to: MemberSet, payload: RequestKind) -> Self {
        PartitionRequest {
            id: 0,
            from,
            to,
            payload: Arc::new(payload),
            tracked: PartitionSet::empty(0),
            rejection: Rejection::None,
            deferred: None,
        }
    }

    /// Sets the partitions this request is responsible for.
    pub fn with_tracked(mut self, tracked: PartitionSet) -> Self {
        self.tracked = tracked;
        self
    }

    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[inline]
    pub(crate) fn set_id(&mut self, id: RequestId) {
        self.id = id;
    }

    #[inline]
    pub fn from(&self) -> MemberId {
        self.from
    }

    #[inline]
    pub fn to(&self) -> &MemberSet {
        &self.to
    }

    #[inline]
    pub(crate) fn retarget(&mut self, from: MemberId, to: MemberSet) {
        self.from = from;
        self.to = to;
    }

    /// Payload as seen by the holder of this request instance.
    #[inline]
    pub fn kind(&self) -> &RequestKind {
        &self.payload
    }

    #[inline]
    pub fn tracked(&self) -> &PartitionSet {
        &self.tracked
    }

    #[inline]
    pub fn rejection(&self) -> Rejection {
        self.rejection
    }

    #[inline]
    pub fn deferred(&self) -> Option<&DeferredResponse> {
        self.deferred.as_ref()
    }

    #[inline]
    pub(crate) fn take_deferred(&mut self) -> Option<DeferredResponse> {
        self.deferred.take()
    }

    #[inline]
    pub(crate) fn set_deferred(&mut self, deferred: DeferredResponse) {
        self.deferred = Some(deferred);
    }

    #[inline]
    pub(crate) fn payload_mut(&mut self) -> &mut RequestKind {
        Arc::make_mut(&mut self.payload)
    }

    /// Produces a new request carrying the same wire payload, addressed the
    /// same way, with no tracked partitions, rejection state, or deferred
    /// response.
    pub fn clone_for_dispatch(&self) -> Self {
        PartitionRequest {
            id: 0,
            from: self.from,
            to: self.to.clone(),
            payload: self.payload.clone(),
            tracked: PartitionSet::empty(self.tracked.partition_count()),
            rejection: Rejection::None,
            deferred: None,
        }
    }

    /// Returns the payload for use by the executing member `me`. A request
    /// issued by `me` itself never crossed a serialization boundary and may
    /// still be referenced by the issuing side, so the executor gets its own
    /// deep copy; a request that arrived from another member is already an
    /// exclusive deserialized copy and is handed out directly.
    pub fn safe_view(&self, me: MemberId) -> Cow<'_, RequestKind> {
        if self.from == me {
            Cow::Owned(RequestKind::clone(&self.payload))
        } else {
            Cow::Borrowed(&self.payload)
        }
    }

    /// Applies a set of rejected partitions: removes them from the tracked
    /// scope and, for key and entry flavors, removes the items falling into
    /// them. Updates the rejection state and returns the removed items (or
    /// the removed mask share) if anything was removed.
    pub fn reject_partitions(
        &mut self,
        rejected: &PartitionSet,
        key_partition: impl Fn(&[u8]) -> PartitionId,
    ) -> Option<RequestKind> {
        let hit = self.tracked.intersection(rejected);
        if hit.is_empty() {
            return None;
        }
        self.tracked.remove_set(&hit);

        // a null mask has no explicit items to remove, so the rejected
        // share is reported as an explicit mask
        let open_mask_op = match self.payload.as_ref() {
            RequestKind::PartitionMask { op, mask: None } => Some(*op),
            _ => None,
        };
        let removed = match open_mask_op {
            Some(op) => Some(RequestKind::PartitionMask {
                op,
                mask: Some(hit),
            }),
            None => self.payload_mut().split_off(&hit, &key_partition),
        };

        self.rejection = if self.tracked.is_empty() {
            Rejection::Full
        } else {
            Rejection::Partial
        };
        removed
    }

    /// Wire-encodes this request.
    pub fn encode(&self) -> Result<Bytes, GridError> {
        encode_request(self)
    }
}

impl fmt::Debug for PartitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}#{}{{m{} -> {:?}, items {}, tracked {:?}, {:?}{}}}",
            self.payload.flavor(),
            self.id,
            self.from,
            self.to,
            self.payload.item_count(),
            self.tracked,
            self.rejection,
            if self.deferred.is_some() { ", relay" } else { "" }
        )
    }
}

// Only the codec output travels, so the local-only fields are never
// serialized.
impl Serialize for PartitionRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let frame = self.encode().map_err(ser::Error::custom)?;
        serializer.serialize_bytes(&frame)
    }
}

impl<'de> Deserialize<'de> for PartitionRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let frame = Bytes::deserialize(deserializer)?;
        decode_request(frame).map_err(de::Error::custom)
    }
}
