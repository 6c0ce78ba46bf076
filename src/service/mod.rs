//! Grid member service: one single-threaded event loop per member.
//!
//! A `GridMember` owns its ownership view, its partition store, the polls of
//! every request it dispatched, and the logical operations those polls belong
//! to. Callers talk to it through a `GridHandle`; peers talk to it through
//! the transport fabric.

mod cluster;
mod dispatch;
mod execution;
mod handle;
mod store;

pub use cluster::GridCluster;
pub use handle::GridHandle;
pub use store::PartitionStore;

use std::collections::HashMap;

use crate::cluster::{Fabric, Incoming, OwnershipMap, TransportHub};
use crate::poll::Outcome;
use crate::request::{GridMsg, RequestId, RequestKind};
use crate::utils::{GridError, MemberId};

use dispatch::{OpId, Operation, PollEntry};

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    /// Number of partitions of the service; identical on all members.
    pub partition_count: u32,

    /// Capacity of the caller API channel.
    pub api_chan_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for MemberConfig {
    fn default() -> Self {
        MemberConfig {
            partition_count: 257,
            api_chan_cap: 1024,
        }
    }
}

/// Request from a caller handle to its member's service loop.
#[derive(Debug)]
pub(crate) enum ApiRequest {
    /// Run one logical operation and reply with its outcome.
    Invoke {
        kind: RequestKind,
        tx_reply: oneshot::Sender<Outcome>,
    },

    /// Replace the member's ownership view.
    InstallOwnership {
        map: OwnershipMap,
        tx_ack: oneshot::Sender<Result<(), GridError>>,
    },

    /// Stop the service loop.
    Shutdown,
}

/// One member of the grid.
pub struct GridMember {
    /// My member ID.
    me: MemberId,

    /// Configuration parameters struct.
    config: MemberConfig,

    /// My current (possibly stale) view of partition ownership.
    ownership: OwnershipMap,

    /// Local data and metadata.
    store: PartitionStore,

    /// TransportHub module.
    transport: TransportHub<GridMsg>,

    /// Receiver side of the caller API channel.
    rx_api: mpsc::Receiver<ApiRequest>,

    /// Next request ID to assign.
    next_req: RequestId,

    /// Open polls of requests I dispatched.
    polls: HashMap<RequestId, PollEntry>,

    /// Next operation ID to assign.
    next_op: OpId,

    /// Logical operations awaiting their sibling polls.
    ops: HashMap<OpId, Operation>,
}

impl GridMember {
    /// Creates a member, joins it to the fabric, and returns it together
    /// with a caller handle. The member does nothing until `run()`.
    pub fn new_and_setup(
        me: MemberId,
        fabric: &Fabric<GridMsg>,
        config_str: Option<&str>,
    ) -> Result<(Self, GridHandle), GridError> {
        let config = parsed_config!(config_str => MemberConfig;
                                    partition_count, api_chan_cap)?;
        if config.partition_count == 0 {
            return logged_err!(
                me;
                "invalid config.partition_count '{}'",
                config.partition_count
            );
        }
        if config.api_chan_cap == 0 {
            return logged_err!(
                me;
                "invalid config.api_chan_cap '{}'",
                config.api_chan_cap
            );
        }

        let transport = fabric.join(me)?;
        let (tx_api, rx_api) = mpsc::channel(config.api_chan_cap);

        let member = GridMember {
            me,
            ownership: OwnershipMap::new(config.partition_count),
            store: PartitionStore::new(config.partition_count),
            config,
            transport,
            rx_api,
            next_req: 1,
            polls: HashMap::new(),
            next_op: 1,
            ops: HashMap::new(),
        };
        Ok((member, GridHandle::new(me, tx_api)))
    }

    #[inline]
    pub fn id(&self) -> MemberId {
        self.me
    }

    #[inline]
    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    /// Replaces my ownership view. Ownership changes do not touch stored
    /// data; requests for partitions I no longer own are rejected.
    fn install_ownership(&mut self, map: OwnershipMap) -> Result<(), GridError> {
        if map.partition_count() != self.config.partition_count {
            return logged_err!(
                self.me;
                "ownership map has {} partitions, expected {}",
                map.partition_count(),
                self.config.partition_count
            );
        }
        pf_debug!(self.me; "installed ownership version {}", map.version());
        self.ownership = map;
        Ok(())
    }

    /// Handler of caller API channel recv. Returns `true` on shutdown.
    fn handle_api_request(&mut self, req: ApiRequest) -> Result<bool, GridError> {
        match req {
            ApiRequest::Invoke { kind, tx_reply } => {
                self.submit_operation(kind, tx_reply)?;
            }
            ApiRequest::InstallOwnership { map, tx_ack } => {
                let result = self.install_ownership(map);
                if tx_ack.send(result).is_err() {
                    pf_warn!(self.me; "ownership install ack dropped");
                }
            }
            ApiRequest::Shutdown => return Ok(true),
        }
        Ok(false)
    }

    /// Handler of transport recv.
    fn handle_incoming(
        &mut self,
        peer: MemberId,
        incoming: Incoming<GridMsg>,
    ) -> Result<(), GridError> {
        match incoming {
            Incoming::Msg(GridMsg::Request(req)) => {
                self.handle_request(peer, req)
            }
            Incoming::Msg(GridMsg::Response { id, response }) => {
                self.handle_response(peer, id, response)
            }
            Incoming::Left => self.handle_member_left(peer),
        }
    }

    /// Runs the main event loop until shutdown or until I leave the fabric.
    pub async fn run(&mut self) -> Result<(), GridError> {
        pf_info!(self.me; "member service started");
        loop {
            tokio::select! {
                // caller API request
                api_req = self.rx_api.recv() => {
                    let api_req = match api_req {
                        Some(api_req) => api_req,
                        None => {
                            pf_warn!(self.me; "all caller handles dropped");
                            return Ok(());
                        }
                    };
                    match self.handle_api_request(api_req) {
                        Ok(true) => {
                            pf_info!(self.me; "member service shutting down");
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            pf_error!(self.me; "error handling api request: {}", e);
                        }
                    }
                },

                // message or departure notice from the fabric
                msg = self.transport.recv_msg() => {
                    let (peer, incoming) = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            pf_error!(self.me; "error receiving msg: {}", e);
                            continue;
                        }
                    };
                    if peer == self.me && matches!(incoming, Incoming::Left) {
                        pf_warn!(self.me; "removed from the fabric");
                        return Ok(());
                    }
                    if let Err(e) = self.handle_incoming(peer, incoming) {
                        pf_error!(self.me; "error handling msg from m{}: {}", peer, e);
                    }
                },
            }
        }
    }
}
