/*!
# Work Splitting and Gathering

The design matrix is split across `P` ranks by contiguous index ranges. Each
rank computes its shard with no communication, then every rank meets at one
barrier, every non-coordinator rank sends its shard to rank 0 tagged with its
own rank, and rank 0 concatenates the shards in ascending rank order.

Ranks talk through the [`Communicator`] trait. [`LocalCluster`] provides an
in-process backend: one OS thread per rank, point-to-point channels between
every pair of ranks and a shared barrier. Nothing else is shared; each rank
builds its own simulator.

There is no timeout anywhere. A rank that dies before the barrier leaves the
others waiting on it forever.

```rust
use epi_calibrate::distributed::shard_range;

assert_eq!(shard_range(0, 2, 10), 0..5);
assert_eq!(shard_range(1, 2, 10), 5..10);
```
*/

use std::ops::Range;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread;

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Rank that gathers and persists the dataset.
pub const COORDINATOR: usize = 0;

/// Half-open index range `[floor(r·n/p), floor((r+1)·n/p))` handled by `rank`.
pub fn shard_range(rank: usize, size: usize, n: usize) -> Range<usize> {
    let low = rank * n / size;
    let high = (rank + 1) * n / size;
    low..high
}

/// Row-aligned block of generated samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub parameters: Array2<f64>,
    pub means: Array2<f64>,
    pub stds: Array2<f64>,
}

impl Shard {
    pub fn rows(&self) -> usize {
        self.parameters.nrows()
    }

    /// Appends `other` below `self`. Empty shards are skipped.
    pub fn append(&mut self, other: Shard) -> Result<()> {
        if other.rows() == 0 {
            return Ok(());
        }
        if self.rows() == 0 {
            *self = other;
            return Ok(());
        }
        let stack = |a: &Array2<f64>, b: &Array2<f64>| {
            concatenate(Axis(0), &[a.view(), b.view()])
                .map_err(|e| Error::DimensionMismatch(format!("cannot concatenate shards: {e}")))
        };
        self.parameters = stack(&self.parameters, &other.parameters)?;
        self.means = stack(&self.means, &other.means)?;
        self.stds = stack(&self.stds, &other.stds)?;
        Ok(())
    }
}

/// Blocking point-to-point messaging between ranks.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self);

    fn send(&self, shard: Shard, dest: usize, tag: usize) -> Result<()>;

    /// Blocks until a message from `source` arrives; its tag must equal `tag`.
    fn recv(&self, source: usize, tag: usize) -> Result<Shard>;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }
}

/// Barrier, then rank-tagged gather of every shard onto the coordinator.
///
/// Returns the concatenated dataset on the coordinator and `None` elsewhere.
/// Fails with [`Error::AggregationInvariant`] if the gathered row count is not
/// `expected_rows`.
pub fn gather_shards<C: Communicator>(
    comm: &C,
    shard: Shard,
    expected_rows: usize,
) -> Result<Option<Shard>> {
    comm.barrier();
    let rank = comm.rank();
    if rank != COORDINATOR {
        debug!(rank, rows = shard.rows(), "sending shard to coordinator");
        comm.send(shard, COORDINATOR, rank)?;
        return Ok(None);
    }
    let mut gathered = shard;
    for source in 1..comm.size() {
        let part = comm.recv(source, source)?;
        debug!(source, rows = part.rows(), "received shard");
        gathered.append(part)?;
    }
    if gathered.rows() != expected_rows {
        return Err(Error::AggregationInvariant {
            expected: expected_rows,
            actual: gathered.rows(),
        });
    }
    Ok(Some(gathered))
}

#[derive(Debug)]
struct Envelope {
    tag: usize,
    shard: Shard,
}

/// One rank's view of a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalEndpoint {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
    /// Indexed by destination rank.
    outboxes: Vec<Sender<Envelope>>,
    /// Indexed by source rank.
    inboxes: Vec<Receiver<Envelope>>,
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn send(&self, shard: Shard, dest: usize, tag: usize) -> Result<()> {
        let outbox = self
            .outboxes
            .get(dest)
            .ok_or_else(|| Error::Communication(format!("no rank {dest}")))?;
        outbox
            .send(Envelope { tag, shard })
            .map_err(|_| Error::Communication(format!("rank {dest} is gone")))
    }

    fn recv(&self, source: usize, tag: usize) -> Result<Shard> {
        let inbox = self
            .inboxes
            .get(source)
            .ok_or_else(|| Error::Communication(format!("no rank {source}")))?;
        let envelope = inbox.recv().map_err(|_| {
            Error::Communication(format!("rank {source} exited without sending"))
        })?;
        if envelope.tag != tag {
            return Err(Error::Communication(format!(
                "expected tag {tag} from rank {source}, got {}",
                envelope.tag
            )));
        }
        Ok(envelope.shard)
    }
}

/// Runs `size` ranks as OS threads inside the current process.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    size: usize,
}

impl LocalCluster {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Builds one endpoint per rank, wired to every other rank.
    pub fn endpoints(&self) -> Vec<LocalEndpoint> {
        let size = self.size;
        let barrier = Arc::new(Barrier::new(size));
        let mut outboxes: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::new()).collect();
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> = (0..size).map(|_| Vec::new()).collect();
        for dest in 0..size {
            for outbox in outboxes.iter_mut() {
                let (tx, rx) = channel();
                outbox.push(tx);
                inboxes[dest].push(rx);
            }
        }
        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalEndpoint {
                rank,
                size,
                barrier: Arc::clone(&barrier),
                outboxes,
                inboxes,
            })
            .collect()
    }

    /// Runs `f` on every rank concurrently and returns the results in rank order.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalEndpoint) -> Result<T> + Sync,
    {
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .endpoints()
                .into_iter()
                .map(|endpoint| {
                    let rank = endpoint.rank;
                    let handle = thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(endpoint))
                        .map_err(|e| Error::Communication(format!("cannot spawn rank {rank}: {e}")));
                    (rank, handle)
                })
                .collect();
            let mut results = Vec::with_capacity(handles.len());
            for (rank, handle) in handles {
                let result = handle?
                    .join()
                    .map_err(|_| Error::Communication(format!("rank {rank} panicked")))?;
                results.push(result?);
            }
            Ok(results)
        })
    }
}
