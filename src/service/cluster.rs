//! In-process cluster harness.

use std::collections::BTreeMap;

use super::*;

use tokio::task::JoinHandle;

/// A set of members running on one fabric inside the current runtime.
pub struct GridCluster {
    fabric: Fabric<GridMsg>,

    /// Caller handle of every running member.
    handles: BTreeMap<MemberId, GridHandle>,

    /// Join handle of every running member's service task.
    tasks: HashMap<MemberId, JoinHandle<Result<(), GridError>>>,
}

impl GridCluster {
    /// Launches one service task per member ID, all sharing the same
    /// configuration. Members start with an empty ownership view.
    pub async fn launch(
        members: &[MemberId],
        config_str: Option<&str>,
    ) -> Result<Self, GridError> {
        let mut cluster = GridCluster {
            fabric: Fabric::new(),
            handles: BTreeMap::new(),
            tasks: HashMap::new(),
        };
        for &id in members {
            cluster.spawn_member(id, config_str)?;
        }
        Ok(cluster)
    }

    /// Adds one more member to the cluster.
    pub fn spawn_member(
        &mut self,
        id: MemberId,
        config_str: Option<&str>,
    ) -> Result<&GridHandle, GridError> {
        let (mut member, handle) =
            GridMember::new_and_setup(id, &self.fabric, config_str)?;
        let task = tokio::spawn(async move { member.run().await });
        self.tasks.insert(id, task);
        Ok(self.handles.entry(id).or_insert(handle))
    }

    /// The fabric members talk over; lets tests join extra endpoints.
    #[inline]
    pub fn fabric(&self) -> &Fabric<GridMsg> {
        &self.fabric
    }

    /// IDs of running members, ascending.
    pub fn members(&self) -> Vec<MemberId> {
        self.handles.keys().copied().collect()
    }

    /// Returns the caller handle of a member.
    pub fn handle(&self, id: MemberId) -> Result<&GridHandle, GridError> {
        self.handles
            .get(&id)
            .ok_or_else(|| GridError::msg(format!("member m{} not running", id)))
    }

    /// Installs the same ownership view on every member.
    pub async fn install_ownership(
        &self,
        map: &OwnershipMap,
    ) -> Result<(), GridError> {
        for handle in self.handles.values() {
            handle.install_ownership(map.clone()).await?;
        }
        Ok(())
    }

    /// Installs an ownership view on one member only, leaving the others'
    /// views (possibly stale) as they are.
    pub async fn install_ownership_on(
        &self,
        id: MemberId,
        map: &OwnershipMap,
    ) -> Result<(), GridError> {
        self.handle(id)?.install_ownership(map.clone()).await
    }

    /// Makes a member leave: its service stops, then every remaining member
    /// is notified of the departure.
    pub async fn depart(&mut self, id: MemberId) -> Result<(), GridError> {
        let handle = match self.handles.remove(&id) {
            Some(handle) => handle,
            None => return logged_err!(id; "member not running"),
        };
        handle.shutdown().await?;
        if let Some(task) = self.tasks.remove(&id) {
            if let Err(e) = task.await {
                pf_error!(id; "service task join error: {}", e);
            }
        }
        self.fabric.depart(id)
    }

    /// Stops every member.
    pub async fn shutdown(mut self) -> Result<(), GridError> {
        for (id, handle) in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.shutdown().await {
                pf_warn!(id; "shutdown request failed: {}", e);
            }
        }
        for (id, task) in self.tasks.drain() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => pf_warn!(id; "service exited with error: {}", e),
                Err(e) => pf_error!(id; "service task join error: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::poll::RetryReason;
    use crate::request::{Entry, ResponseValue};
    use crate::utils::PartitionSet;
    use bytes::Bytes;

    const CONFIG: &str = "partition_count = 8";

    fn key(i: u32) -> Bytes {
        Bytes::from(format!("k{}", i))
    }

    fn entry(i: u32) -> Entry {
        (key(i), Some(Bytes::from(format!("v{}", i))))
    }

    fn sorted_entries(value: &ResponseValue) -> Vec<Entry> {
        match value {
            ResponseValue::Entries(entries) => {
                let mut entries = entries.clone();
                entries.sort();
                entries
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    async fn round_robin(
        members: &[MemberId],
    ) -> Result<(GridCluster, OwnershipMap), GridError> {
        let cluster = GridCluster::launch(members, Some(CONFIG)).await?;
        let mut map = OwnershipMap::new(8);
        map.assign_round_robin(members)?;
        cluster.install_ownership(&map).await?;
        Ok((cluster, map))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_put_get() -> Result<(), GridError> {
        let (cluster, _) = round_robin(&[0, 1, 2]).await?;
        let handle = cluster.handle(1)?.clone();

        let outcome = handle.put_all((0..8).map(entry)).await?;
        assert_eq!(outcome, Outcome::Success(ResponseValue::Count(8)));

        let outcome = handle.get_all((0..8).map(key)).await?;
        match outcome {
            Outcome::Success(value) => {
                assert_eq!(sorted_entries(&value), (0..8).map(entry).collect::<Vec<_>>());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(
            handle.size().await?,
            Outcome::Success(ResponseValue::Count(8))
        );
        assert_eq!(
            handle.remove_all([key(3)]).await?,
            Outcome::Success(ResponseValue::Entries(vec![entry(3)]))
        );
        assert_eq!(
            handle.clear().await?,
            Outcome::Success(ResponseValue::Count(7))
        );
        assert_eq!(
            handle.keys().await?,
            Outcome::Success(ResponseValue::Keys(vec![]))
        );
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn contains_and_emptiness() -> Result<(), GridError> {
        let (cluster, _) = round_robin(&[0, 1, 2]).await?;
        let handle = cluster.handle(2)?.clone();
        assert_eq!(
            handle.is_empty().await?,
            Outcome::Success(ResponseValue::Flag(true))
        );

        handle.put_all([entry(0), entry(4)]).await?;
        match handle.contains_all([key(0), key(4), key(5)]).await? {
            Outcome::Success(ResponseValue::Keys(mut present)) => {
                present.sort();
                assert_eq!(present, vec![key(0), key(4)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            handle.is_empty().await?,
            Outcome::Success(ResponseValue::Flag(false))
        );

        handle.clear().await?;
        assert_eq!(
            handle.is_empty().await?,
            Outcome::Success(ResponseValue::Flag(true))
        );
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_view_partial_rejection() -> Result<(), GridError> {
        let cluster = GridCluster::launch(&[0, 1, 2], Some(CONFIG)).await?;
        // coordinator m0 believes m1 owns partitions 0..4
        let mut stale = OwnershipMap::new(8);
        stale.assign_all(1);
        cluster.install_ownership(&stale).await?;
        let handle = cluster.handle(0)?.clone();
        handle.put_all((0..4).map(entry)).await?;

        // partitions 2 and 3 move to m2, but m0 is not told
        let mut fresh = stale.clone();
        fresh.move_partitions(&PartitionSet::from_ids(8, [2, 3])?, 2)?;
        cluster.install_ownership_on(1, &fresh).await?;
        cluster.install_ownership_on(2, &fresh).await?;

        let outcome = handle.get_all((0..4).map(key)).await?;
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::PartialRejection);
        assert_eq!(
            sorted_entries(info.accepted.as_ref().unwrap()),
            vec![entry(0), entry(1)]
        );
        assert_eq!(info.partitions.iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(
            info.remainder,
            Some(RequestKind::KeySet {
                op: crate::request::KeyOp::Get,
                keys: vec![key(2), key(3)]
            })
        );

        // with a fresh view the remainder goes through; m2 holds no data yet
        cluster.install_ownership_on(0, &fresh).await?;
        let outcome = handle.invoke(info.remainder.unwrap()).await?;
        assert_eq!(
            outcome,
            Outcome::Success(ResponseValue::Entries(vec![
                (key(2), None),
                (key(3), None)
            ]))
        );
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn orphaned_items_are_remainder() -> Result<(), GridError> {
        let cluster = GridCluster::launch(&[0], Some(CONFIG)).await?;
        let mut map = OwnershipMap::new(8);
        map.assign(0, 0)?;
        cluster.install_ownership(&map).await?;
        let outcome = cluster.handle(0)?.put_all([entry(0), entry(5)]).await?;
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::PartialRejection);
        assert_eq!(info.accepted, Some(ResponseValue::Count(1)));
        assert_eq!(info.partitions.iter().collect::<Vec<_>>(), vec![5]);
        assert_eq!(info.remainder.map(|r| r.item_count()), Some(1));
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metadata_relayed_to_all_owners() -> Result<(), GridError> {
        let (cluster, _) = round_robin(&[0, 1, 2]).await?;
        // submitted on a non-senior member, answered by the senior m0
        let outcome = cluster.handle(2)?.add_index("by_name").await?;
        assert_eq!(
            outcome,
            Outcome::Success(ResponseValue::Partitions(PartitionSet::full(8)))
        );
        // re-applying changes nothing observable
        let again = cluster.handle(1)?.add_index("by_name").await?;
        assert_eq!(again, outcome);

        let outcome = cluster.handle(1)?.add_index("").await?;
        assert!(matches!(outcome, Outcome::Failure(_)));
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metadata_to_stale_senior_retries() -> Result<(), GridError> {
        let cluster = GridCluster::launch(&[0, 1], Some(CONFIG)).await?;
        let mut map = OwnershipMap::new(8);
        map.assign_round_robin(&[0, 1])?;
        cluster.install_ownership_on(1, &map).await?;
        // m1 thinks m0 is the senior, m0 thinks m1 is
        let mut other = map.clone();
        other.set_senior(1);
        cluster.install_ownership_on(0, &other).await?;

        let outcome = cluster.handle(1)?.add_index("idx").await?;
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::Sentinel);
        assert!(info.remainder.is_some());
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn departure_before_answer() -> Result<(), GridError> {
        let cluster = GridCluster::launch(&[0], Some(CONFIG)).await?;
        // m9 is a bare endpoint that never answers
        let mut silent = cluster.fabric().join(9)?;
        let mut map = OwnershipMap::new(8);
        map.assign_round_robin(&[0, 9])?;
        cluster.install_ownership(&map).await?;

        let handle = cluster.handle(0)?.clone();
        let pending = tokio::spawn(async move {
            handle.put_all((0..4).map(entry)).await
        });
        match silent.recv_msg().await? {
            (0, Incoming::Msg(GridMsg::Request(req))) => {
                assert_eq!(req.from(), 0);
                assert_eq!(req.kind().item_count(), 2);
            }
            other => panic!("unexpected msg {:?}", other),
        }
        cluster.fabric().depart(9)?;

        let outcome = pending
            .await
            .map_err(|e| GridError::msg(e.to_string()))??;
        let info = outcome.retry_info().cloned().unwrap();
        assert_eq!(info.reason, RetryReason::IncompleteMembership);
        assert_eq!(info.accepted, Some(ResponseValue::Count(2)));
        assert_eq!(info.partitions.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(info.remainder.map(|r| r.item_count()), Some(2));
        cluster.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn depart_member() -> Result<(), GridError> {
        let (mut cluster, _) = round_robin(&[0, 1]).await?;
        cluster.depart(1).await?;
        assert_eq!(cluster.members(), vec![0]);
        assert!(cluster.handle(1).is_err());
        // depending on whether m0 saw the departure notice first, the key
        // is either orphaned or sent to a member that is gone
        let outcome = cluster.handle(0)?.get_all([key(1)]).await?;
        let info = outcome.retry_info().cloned().unwrap();
        assert!(matches!(
            info.reason,
            RetryReason::FullRejection | RetryReason::IncompleteMembership
        ));
        assert_eq!(info.accepted, None);
        assert_eq!(info.remainder.map(|r| r.item_count()), Some(1));
        cluster.shutdown().await
    }
}
