//! Caller-side handle to a member's service loop.

use super::*;

use crate::request::{Entry, EntryOp, KeyOp, MaskOp, MetadataOp};

use bytes::Bytes;

/// Cloneable handle through which callers submit operations to one member,
/// which then acts as the coordinator of those operations.
#[derive(Debug, Clone)]
pub struct GridHandle {
    /// ID of the member behind this handle.
    me: MemberId,

    /// Sender side of the member's API channel.
    tx_api: mpsc::Sender<ApiRequest>,
}

// GridHandle public API implementation
impl GridHandle {
    pub(crate) fn new(me: MemberId, tx_api: mpsc::Sender<ApiRequest>) -> Self {
        GridHandle { me, tx_api }
    }

    #[inline]
    pub fn member(&self) -> MemberId {
        self.me
    }

    /// Submits an operation and waits for its outcome. A retry outcome is
    /// returned as-is; resubmitting is up to the caller.
    pub async fn invoke(&self, kind: RequestKind) -> Result<Outcome, GridError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_api
            .send(ApiRequest::Invoke { kind, tx_reply })
            .await?;
        Ok(rx_reply.await?)
    }

    /// Blocking flavor of `invoke()` for callers outside the async runtime.
    /// Must not be called from within an async context.
    pub fn invoke_blocking(&self, kind: RequestKind) -> Result<Outcome, GridError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_api
            .blocking_send(ApiRequest::Invoke { kind, tx_reply })?;
        Ok(rx_reply.blocking_recv()?)
    }

    pub async fn get_all(
        &self,
        keys: impl IntoIterator<Item = Bytes>,
    ) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::KeySet {
            op: KeyOp::Get,
            keys: keys.into_iter().collect(),
        })
        .await
    }

    /// Answers the subset of the given keys that are present; all of them
    /// are present iff the answer has every key.
    pub async fn contains_all(
        &self,
        keys: impl IntoIterator<Item = Bytes>,
    ) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::KeySet {
            op: KeyOp::Contains,
            keys: keys.into_iter().collect(),
        })
        .await
    }

    /// Writes all entries; an entry with a `None` value removes its key.
    pub async fn put_all(
        &self,
        entries: impl IntoIterator<Item = Entry>,
    ) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::EntryMap {
            op: EntryOp::PutAll,
            entries: entries.into_iter().collect(),
        })
        .await
    }

    pub async fn remove_all(
        &self,
        keys: impl IntoIterator<Item = Bytes>,
    ) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::KeySet {
            op: KeyOp::Remove,
            keys: keys.into_iter().collect(),
        })
        .await
    }

    /// Counts entries across the whole cache.
    pub async fn size(&self) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::PartitionMask {
            op: MaskOp::Size,
            mask: None,
        })
        .await
    }

    /// Checks whether the whole cache holds no entry.
    pub async fn is_empty(&self) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::PartitionMask {
            op: MaskOp::IsEmpty,
            mask: None,
        })
        .await
    }

    /// Lists keys across the whole cache.
    pub async fn keys(&self) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::PartitionMask {
            op: MaskOp::Keys,
            mask: None,
        })
        .await
    }

    /// Empties the whole cache.
    pub async fn clear(&self) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::PartitionMask {
            op: MaskOp::Clear,
            mask: None,
        })
        .await
    }

    /// Registers an index on every owner through the ownership senior.
    pub async fn add_index(&self, name: &str) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::StorageMetadata {
            op: MetadataOp::AddIndex(name.into()),
            relayed: false,
        })
        .await
    }

    pub async fn remove_index(&self, name: &str) -> Result<Outcome, GridError> {
        self.invoke(RequestKind::StorageMetadata {
            op: MetadataOp::RemoveIndex(name.into()),
            relayed: false,
        })
        .await
    }

    /// Replaces the member's ownership view, waiting for it to take effect.
    pub async fn install_ownership(
        &self,
        map: OwnershipMap,
    ) -> Result<(), GridError> {
        let (tx_ack, rx_ack) = oneshot::channel();
        self.tx_api
            .send(ApiRequest::InstallOwnership { map, tx_ack })
            .await?;
        rx_ack.await?
    }

    /// Asks the member's service loop to stop.
    pub async fn shutdown(&self) -> Result<(), GridError> {
        self.tx_api.send(ApiRequest::Shutdown).await?;
        Ok(())
    }
}
