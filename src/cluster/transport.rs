//! In-process member-to-member transport.
//!
//! Every member registers an inbox on a shared `Fabric`. Messages between two
//! distinct members are serialized with MessagePack on send and deserialized
//! on receive, so the receiver always holds an exclusive copy. Messages a
//! member sends to itself are delivered as-is.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::utils::{GridError, MemberId, MemberSet};

use bytes::Bytes;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::mpsc;

/// What actually travels through an inbox channel.
#[derive(Debug)]
enum Delivery<Msg> {
    /// Same-member message, never serialized.
    Loopback(Msg),

    /// Serialized message from another member.
    Wire(Bytes),

    /// Notice that the sender has left the cluster.
    Left,
}

/// Item handed out by `TransportHub::recv_msg()`.
#[derive(Debug, PartialEq)]
pub enum Incoming<Msg> {
    /// A message from the paired member ID.
    Msg(Msg),

    /// The paired member ID has left the cluster.
    Left,
}

type Inbox<Msg> = mpsc::UnboundedSender<(MemberId, Delivery<Msg>)>;

/// Shared registry of member inboxes.
pub struct Fabric<Msg> {
    inboxes: Arc<RwLock<HashMap<MemberId, Inbox<Msg>>>>,
}

impl<Msg> Clone for Fabric<Msg> {
    fn clone(&self) -> Self {
        Fabric {
            inboxes: self.inboxes.clone(),
        }
    }
}

impl<Msg> Default for Fabric<Msg> {
    fn default() -> Self {
        Fabric {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<Msg> Fabric<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member and returns its transport hub.
    pub fn join(&self, me: MemberId) -> Result<TransportHub<Msg>, GridError> {
        let mut inboxes = self.inboxes.write()?;
        if inboxes.contains_key(&me) {
            return logged_err!(me; "member {} already joined the fabric", me);
        }
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        inboxes.insert(me, tx_recv);
        pf_debug!(me; "joined fabric");

        Ok(TransportHub {
            me,
            fabric: self.clone(),
            rx_recv,
        })
    }

    /// Unregisters a member, then notifies every remaining member of the
    /// departure. Messages already queued for the departed member are never
    /// handed out to it.
    pub fn depart(&self, member: MemberId) -> Result<(), GridError> {
        let mut inboxes = self.inboxes.write()?;
        if inboxes.remove(&member).is_none() {
            return logged_err!(member; "member {} not on the fabric", member);
        }
        for (&peer, inbox) in inboxes.iter() {
            if inbox.send((member, Delivery::Left)).is_err() {
                pf_warn!(member; "departure notice to m{} dropped", peer);
            }
        }
        pf_info!(member; "departed fabric");
        Ok(())
    }

    /// Returns the set of currently registered members.
    pub fn members(&self) -> Result<MemberSet, GridError> {
        Ok(self.inboxes.read()?.keys().copied().collect())
    }
}

/// Per-member transport endpoint.
pub struct TransportHub<Msg> {
    /// My member ID.
    me: MemberId,

    /// Shared registry to look peers up in.
    fabric: Fabric<Msg>,

    /// Receiver side of my inbox.
    rx_recv: mpsc::UnboundedReceiver<(MemberId, Delivery<Msg>)>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + 'static,
{
    #[inline]
    pub fn me(&self) -> MemberId {
        self.me
    }

    /// Sends a message to one peer. Fails if the peer is not (or no longer)
    /// on the fabric.
    pub fn send_msg(&self, msg: Msg, peer: MemberId) -> Result<(), GridError> {
        let inboxes = self.fabric.inboxes.read()?;
        let inbox = match inboxes.get(&peer) {
            Some(inbox) => inbox,
            None => {
                return Err(GridError::msg(format!(
                    "peer m{} not found on fabric",
                    peer
                )));
            }
        };

        let delivery = if peer == self.me {
            pf_trace!(self.me; "loopback msg {:?}", msg);
            Delivery::Loopback(msg)
        } else {
            pf_trace!(self.me; "send to m{} msg {:?}", peer, msg);
            Delivery::Wire(Bytes::from(encode_to_vec(&msg)?))
        };
        inbox.send((self.me, delivery))?;
        Ok(())
    }

    /// Returns true if I am no longer registered on the fabric.
    fn departed(&self) -> Result<bool, GridError> {
        Ok(!self.fabric.inboxes.read()?.contains_key(&self.me))
    }

    /// Receives the next message or departure notice. Returns a pair of
    /// `(peer_id, incoming)` on success. A departure notice carrying my own
    /// ID means I have been removed from the fabric; anything still queued
    /// for me is dropped then.
    pub async fn recv_msg(
        &mut self,
    ) -> Result<(MemberId, Incoming<Msg>), GridError> {
        if self.departed()? {
            return Ok((self.me, Incoming::Left));
        }
        let delivery = self.rx_recv.recv().await;
        // departure may have happened while waiting
        if self.departed()? {
            return Ok((self.me, Incoming::Left));
        }
        match delivery {
            Some((peer, Delivery::Loopback(msg))) => {
                Ok((peer, Incoming::Msg(msg)))
            }
            Some((peer, Delivery::Wire(bytes))) => {
                let msg = decode_from_slice(&bytes)?;
                pf_trace!(self.me; "recv from m{} msg {:?}", peer, msg);
                Ok((peer, Incoming::Msg(msg)))
            }
            Some((peer, Delivery::Left)) => Ok((peer, Incoming::Left)),
            // my inbox is gone, so I am the one who left
            None => Ok((self.me, Incoming::Left)),
        }
    }
}
