//! Partgrid cluster simulation: fills a cache, redistributes partitions
//! behind the coordinator's back, and drives operations to completion
//! through the retry outcomes.

use std::process::ExitCode;

use bytes::Bytes;
use clap::Parser;
use log::{self, LevelFilter};
use partgrid::{
    logged_err, logger_init, pf_error, pf_info, pf_warn, Entry, EntryOp,
    GridCluster, GridError, KeyOp, MemberId, Outcome, OwnershipMap,
    PartitionSet, RequestKind, ResponseValue,
};
use rand::Rng;
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Coordinator member whose ownership view is left stale.
const COORDINATOR: MemberId = 0;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of members in the simulated cluster.
    #[arg(short = 'n', long, default_value_t = 3)]
    members: u8,

    /// Number of partitions of the cache.
    #[arg(short, long, default_value_t = 16)]
    partitions: u32,

    /// Number of keys to write and read back.
    #[arg(short, long, default_value_t = 64)]
    keys: u32,

    /// Number of partitions moved while the coordinator is not looking.
    #[arg(short, long, default_value_t = 4)]
    moves: u32,

    /// Resubmissions allowed per operation before giving up.
    #[arg(short = 'r', long, default_value_t = 5)]
    max_retries: u32,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(GridError)` on any error.
    fn sanitize(&self) -> Result<(), GridError> {
        if self.members == 0 {
            Err(GridError::msg(format!(
                "invalid number of members {}",
                self.members
            )))
        } else if self.partitions == 0 {
            Err(GridError::msg(format!(
                "invalid number of partitions {}",
                self.partitions
            )))
        } else if self.keys == 0 {
            Err(GridError::msg(format!("invalid number of keys {}", self.keys)))
        } else if self.moves > self.partitions {
            Err(GridError::msg(format!(
                "moves {} exceed partitions {}",
                self.moves, self.partitions
            )))
        } else if self.threads < 2 {
            Err(GridError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

fn key(i: u32) -> Bytes {
    Bytes::from(format!("key{}", i))
}

fn entry(i: u32, generation: u32) -> Entry {
    (key(i), Some(Bytes::from(format!("val{}-{}", i, generation))))
}

/// Submits an operation through the coordinator and keeps resubmitting the
/// remainder until it succeeds. On every retry the coordinator's view is
/// refreshed first. Returns the values of every accepted share.
async fn run_to_completion(
    cluster: &GridCluster,
    fresh: &OwnershipMap,
    kind: RequestKind,
    max_retries: u32,
) -> Result<Vec<ResponseValue>, GridError> {
    let handle = cluster.handle(COORDINATOR)?;
    let mut accepted = vec![];
    let mut next = kind;

    for attempt in 0..=max_retries {
        match handle.invoke(next).await? {
            Outcome::Success(value) => {
                accepted.push(value);
                return Ok(accepted);
            }
            Outcome::Failure(e) => return Err(e),
            Outcome::Retry(info) => {
                pf_info!(
                    COORDINATOR;
                    "attempt {} needs retry: {:?} on partitions {:?}",
                    attempt,
                    info.reason,
                    info.partitions.iter().collect::<Vec<_>>()
                );
                accepted.extend(info.accepted);
                next = match info.remainder {
                    Some(remainder) => remainder,
                    None => {
                        return logged_err!(
                            COORDINATOR;
                            "retry outcome without a remainder"
                        )
                    }
                };
                handle.install_ownership(fresh.clone()).await?;
            }
        }
    }

    logged_err!(COORDINATOR; "gave up after {} retries", max_retries)
}

/// Picks distinct random partitions and hands each to a random new owner.
fn redistribute(args: &CliArgs, map: &OwnershipMap) -> Result<OwnershipMap, GridError> {
    let mut rng = rand::thread_rng();
    let mut fresh = map.clone();
    let mut moved = PartitionSet::empty(args.partitions);
    while moved.cardinality() < args.moves as usize {
        moved.add(rng.gen_range(0..args.partitions))?;
    }
    for p in moved.iter() {
        let to = rng.gen_range(0..args.members);
        fresh.move_partitions(&PartitionSet::from_ids(args.partitions, [p])?, to)?;
        pf_info!("-"; "partition {} now owned by m{}", p, to);
    }
    Ok(fresh)
}

/// Counts the entries holding the expected generation's value.
fn count_matching(values: &[ResponseValue], generation: u32) -> usize {
    values
        .iter()
        .flat_map(|value| match value {
            ResponseValue::Entries(entries) => entries.as_slice(),
            _ => &[] as &[Entry],
        })
        .filter(|(k, v)| {
            let expected = Bytes::from(format!(
                "val{}-{}",
                String::from_utf8_lossy(&k[3..]),
                generation
            ));
            v.as_ref() == Some(&expected)
        })
        .count()
}

/// The simulation scenario proper.
async fn simulate(
    args: &CliArgs,
    rx_term: watch::Receiver<bool>,
) -> Result<(), GridError> {
    let members: Vec<MemberId> = (0..args.members).collect();
    let config_str = format!("partition_count = {}", args.partitions);
    let cluster = GridCluster::launch(&members, Some(config_str.as_str())).await?;

    let mut map = OwnershipMap::new(args.partitions);
    map.assign_round_robin(&members)?;
    cluster.install_ownership(&map).await?;
    pf_info!("-"; "launched {} members over {} partitions", args.members, args.partitions);

    // first generation with everyone agreeing on ownership
    run_to_completion(
        &cluster,
        &map,
        RequestKind::EntryMap {
            op: EntryOp::PutAll,
            entries: (0..args.keys).map(|i| entry(i, 0)).collect(),
        },
        args.max_retries,
    )
    .await?;

    // move partitions on every view except the coordinator's
    let fresh = redistribute(args, &map)?;
    for &m in &members {
        if m != COORDINATOR {
            cluster.install_ownership_on(m, &fresh).await?;
        }
    }

    if *rx_term.borrow() {
        pf_warn!("-"; "terminated before second generation");
        return cluster.shutdown().await;
    }

    // second generation through the stale coordinator
    run_to_completion(
        &cluster,
        &fresh,
        RequestKind::EntryMap {
            op: EntryOp::PutAll,
            entries: (0..args.keys).map(|i| entry(i, 1)).collect(),
        },
        args.max_retries,
    )
    .await?;

    let values = run_to_completion(
        &cluster,
        &fresh,
        RequestKind::KeySet {
            op: KeyOp::Get,
            keys: (0..args.keys).map(key).collect(),
        },
        args.max_retries,
    )
    .await?;
    let matching = count_matching(&values, 1);
    pf_info!("-"; "read back {}/{} second-generation values", matching, args.keys);
    if matching != args.keys as usize {
        pf_warn!("-"; "{} values missing or stale", args.keys as usize - matching);
    }

    match cluster.handle(COORDINATOR)?.add_index("sim_index").await? {
        Outcome::Success(value) => {
            pf_info!("-"; "index registered on owners of {:?}", value)
        }
        other => pf_warn!("-"; "index registration: {:?}", other),
    }
    match cluster.handle(COORDINATOR)?.size().await? {
        Outcome::Success(ResponseValue::Count(n)) => {
            pf_info!("-"; "cache size {}", n)
        }
        other => pf_warn!("-"; "size: {:?}", other),
    }

    cluster.shutdown().await
}

/// Actual main function of the simulation.
fn sim_main() -> Result<(), GridError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("-"; "error sending to term channel: {}", e);
        }
    })
    .map_err(GridError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-sim")
            .build()?;

        runtime.block_on(async move {
            simulate(&args, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), GridError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the simulation.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = sim_main() {
        pf_error!("-"; "sim_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid() -> CliArgs {
        CliArgs {
            members: 3,
            partitions: 16,
            keys: 64,
            moves: 4,
            max_retries: 5,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid().sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_members() {
        let args = CliArgs {
            members: 0,
            ..valid()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_partitions() {
        let args = CliArgs {
            partitions: 0,
            moves: 0,
            ..valid()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_too_many_moves() {
        let args = CliArgs {
            moves: 17,
            ..valid()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            threads: 1,
            ..valid()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn redistribute_moves_requested_count() -> Result<(), GridError> {
        let args = valid();
        let mut map = OwnershipMap::new(args.partitions);
        map.assign_all(0);
        let fresh = redistribute(&args, &map)?;
        // a partition may land back on m0, so at most `moves` change owner
        let changed = (0..args.partitions)
            .filter(|&p| fresh.owner_of(p) != map.owner_of(p))
            .count();
        assert!(changed <= args.moves as usize);
        Ok(())
    }

    #[test]
    fn matching_counts_generation() {
        let values = vec![
            ResponseValue::Entries(vec![entry(0, 1), entry(1, 0)]),
            ResponseValue::Entries(vec![entry(2, 1), (key(3), None)]),
            ResponseValue::Count(2),
        ];
        assert_eq!(count_matching(&values, 1), 2);
    }
}
