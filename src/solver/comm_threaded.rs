//! In-process communicator: one "rank" per thread over shared mailboxes.
//!
//! Sends are buffered and never block; receives block until the matching
//! message arrives (bounded by a timeout that surfaces as a transport
//! error). This gives the full multi-rank communication semantics without
//! an MPI installation, which is how the test suite and the demo binary
//! run several subdomains inside one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Result, SubdefError};

use super::comm::{Communicator, Phase};

/// How long a receive may wait before the exchange is declared lost.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Tag used by the collectives built on the point-to-point mailboxes.
/// Collectives run in program order on every rank and each queue is FIFO,
/// so a single tag cannot mispair successive collectives.
const TAG_COLLECTIVE: i32 = 9001;

/// Tag offset applied to a split sub-communicator so its traffic cannot
/// collide with the parent's.
const SPLIT_SHIFT: i32 = 1 << 16;

/// Message key: (source world rank, destination world rank, tag).
type Key = (usize, usize, i32);

struct Mailbox<T> {
    queues: Mutex<HashMap<Key, VecDeque<Vec<T>>>>,
    ready: Condvar,
}

impl<T: Clone> Mailbox<T> {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn post(&self, key: Key, data: Vec<T>) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(key).or_default().push_back(data);
        self.ready.notify_all();
    }

    fn take(&self, key: Key) -> Result<Vec<T>> {
        let mut queues = self.queues.lock().unwrap();
        loop {
            if let Some(msg) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return Ok(msg);
            }
            let (guard, timed_out) = self
                .ready
                .wait_timeout(queues, RECV_TIMEOUT)
                .map_err(|_| SubdefError::Transport("mailbox lock poisoned".into()))?;
            queues = guard;
            if timed_out.timed_out() {
                return Err(SubdefError::Transport(format!(
                    "receive from rank {} (tag {}) timed out",
                    key.0, key.2
                )));
            }
        }
    }
}

struct Mailboxes {
    indices: Mailbox<usize>,
    values: Mailbox<f64>,
}

/// Communicator handle for one in-process rank.
///
/// Create one handle per rank with [`universe`](ThreadedComm::universe)
/// and move each onto its own thread, or let [`spawn`] do both.
pub struct ThreadedComm {
    shared: Arc<Mailboxes>,
    /// Rank within this communicator.
    rank: usize,
    /// World ranks of this communicator's members, ascending.
    members: Arc<Vec<usize>>,
    tag_shift: i32,
}

impl ThreadedComm {
    /// Create the communicator handles for `ranks` in-process ranks.
    pub fn universe(ranks: usize) -> Vec<ThreadedComm> {
        assert!(ranks > 0, "need at least one rank");
        let shared = Arc::new(Mailboxes {
            indices: Mailbox::new(),
            values: Mailbox::new(),
        });
        let members = Arc::new((0..ranks).collect::<Vec<_>>());
        (0..ranks)
            .map(|rank| ThreadedComm {
                shared: Arc::clone(&shared),
                rank,
                members: Arc::clone(&members),
                tag_shift: 0,
            })
            .collect()
    }

    fn world_rank(&self, r: usize) -> usize {
        self.members[r]
    }

    fn me(&self) -> usize {
        self.members[self.rank]
    }

    fn tag(&self, raw: i32) -> i32 {
        raw + self.tag_shift
    }
}

/// Run `f(comm)` for every rank of a fresh universe on scoped threads and
/// collect the per-rank results in rank order.
pub fn spawn<F, R>(ranks: usize, f: F) -> Vec<R>
where
    F: Fn(ThreadedComm) -> R + Send + Sync,
    R: Send,
{
    let comms = ThreadedComm::universe(ranks);
    thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

impl Communicator for ThreadedComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn all_gather_usize(&self, value: usize) -> Result<Vec<usize>> {
        let tag = self.tag(TAG_COLLECTIVE);
        for r in 0..self.size() {
            self.shared
                .indices
                .post((self.me(), self.world_rank(r), tag), vec![value]);
        }
        let mut out = Vec::with_capacity(self.size());
        for r in 0..self.size() {
            let msg = self.shared.indices.take((self.world_rank(r), self.me(), tag))?;
            out.push(msg[0]);
        }
        Ok(out)
    }

    fn all_gather_matrix(&self, row: &[usize]) -> Result<Vec<usize>> {
        let tag = self.tag(TAG_COLLECTIVE);
        for r in 0..self.size() {
            self.shared
                .indices
                .post((self.me(), self.world_rank(r), tag), row.to_vec());
        }
        let mut out = Vec::with_capacity(self.size() * row.len());
        for r in 0..self.size() {
            let msg = self.shared.indices.take((self.world_rank(r), self.me(), tag))?;
            if msg.len() != row.len() {
                return Err(SubdefError::Transport("ragged all-gather rows".into()));
            }
            out.extend_from_slice(&msg);
        }
        Ok(out)
    }

    fn all_gather_varied_usize(&self, local: &[usize], counts: &[usize]) -> Result<Vec<usize>> {
        let tag = self.tag(TAG_COLLECTIVE);
        for r in 0..self.size() {
            self.shared
                .indices
                .post((self.me(), self.world_rank(r), tag), local.to_vec());
        }
        let mut out = Vec::with_capacity(counts.iter().sum());
        for r in 0..self.size() {
            let msg = self.shared.indices.take((self.world_rank(r), self.me(), tag))?;
            if msg.len() != counts[r] {
                return Err(SubdefError::Transport(format!(
                    "all-gather slab from rank {r} has length {}, expected {}",
                    msg.len(),
                    counts[r]
                )));
            }
            out.extend_from_slice(&msg);
        }
        Ok(out)
    }

    fn all_gather_varied_f64(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
        let tag = self.tag(TAG_COLLECTIVE);
        for r in 0..self.size() {
            self.shared
                .values
                .post((self.me(), self.world_rank(r), tag), local.to_vec());
        }
        let mut out = Vec::with_capacity(counts.iter().sum());
        for r in 0..self.size() {
            let msg = self.shared.values.take((self.world_rank(r), self.me(), tag))?;
            if msg.len() != counts[r] {
                return Err(SubdefError::Transport(format!(
                    "all-gather slab from rank {r} has length {}, expected {}",
                    msg.len(),
                    counts[r]
                )));
            }
            out.extend_from_slice(&msg);
        }
        Ok(out)
    }

    fn all_reduce_sum(&self, local: f64) -> Result<f64> {
        let tag = self.tag(TAG_COLLECTIVE);
        for r in 0..self.size() {
            self.shared
                .values
                .post((self.me(), self.world_rank(r), tag), vec![local]);
        }
        // Summing in rank order keeps the result bit-identical on every
        // rank, which the convergence checks rely on.
        let mut sum = 0.0;
        for r in 0..self.size() {
            let msg = self.shared.values.take((self.world_rank(r), self.me(), tag))?;
            sum += msg[0];
        }
        Ok(sum)
    }

    fn exchange_usize(
        &self,
        phase: Phase,
        sends: &[(usize, &[usize])],
        recvs: &mut [(usize, &mut [usize])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        let tag = self.tag(phase.tag());
        for (to, data) in sends {
            self.shared
                .indices
                .post((self.me(), self.world_rank(*to), tag), data.to_vec());
        }
        overlap();
        for (from, buf) in recvs.iter_mut() {
            let msg = self.shared.indices.take((self.world_rank(*from), self.me(), tag))?;
            if msg.len() != buf.len() {
                return Err(SubdefError::Transport(format!(
                    "exchange slab from rank {from} has length {}, expected {}",
                    msg.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&msg);
        }
        Ok(())
    }

    fn exchange_f64(
        &self,
        phase: Phase,
        sends: &[(usize, &[f64])],
        recvs: &mut [(usize, &mut [f64])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        let tag = self.tag(phase.tag());
        for (to, data) in sends {
            self.shared
                .values
                .post((self.me(), self.world_rank(*to), tag), data.to_vec());
        }
        overlap();
        for (from, buf) in recvs.iter_mut() {
            let msg = self.shared.values.take((self.world_rank(*from), self.me(), tag))?;
            if msg.len() != buf.len() {
                return Err(SubdefError::Transport(format!(
                    "exchange slab from rank {from} has length {}, expected {}",
                    msg.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&msg);
        }
        Ok(())
    }

    fn gather_slabs(
        &self,
        local: &[f64],
        counts: &[usize],
        root: usize,
        out: &mut [f64],
    ) -> Result<()> {
        let tag = self.tag(TAG_COLLECTIVE);
        if self.rank != root {
            self.shared
                .values
                .post((self.me(), self.world_rank(root), tag), local.to_vec());
            return Ok(());
        }

        let mut offset = 0;
        for r in 0..self.size() {
            if r == root {
                out[offset..offset + local.len()].copy_from_slice(local);
                offset += local.len();
            } else {
                let msg = self.shared.values.take((self.world_rank(r), self.me(), tag))?;
                if msg.len() != counts[r] {
                    return Err(SubdefError::Transport(format!(
                        "gather slab from rank {r} has length {}, expected {}",
                        msg.len(),
                        counts[r]
                    )));
                }
                out[offset..offset + msg.len()].copy_from_slice(&msg);
                offset += msg.len();
            }
        }
        Ok(())
    }

    fn broadcast_f64(&self, buf: &mut [f64], root: usize) -> Result<()> {
        let tag = self.tag(TAG_COLLECTIVE);
        if self.rank == root {
            for r in 0..self.size() {
                if r != root {
                    self.shared
                        .values
                        .post((self.me(), self.world_rank(r), tag), buf.to_vec());
                }
            }
        } else {
            let msg = self.shared.values.take((self.world_rank(root), self.me(), tag))?;
            if msg.len() != buf.len() {
                return Err(SubdefError::Transport("broadcast length mismatch".into()));
            }
            buf.copy_from_slice(&msg);
        }
        Ok(())
    }

    fn split(&self, member: bool) -> Result<Option<Arc<dyn Communicator>>> {
        let flags = self.all_gather_usize(member as usize)?;
        let members: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f != 0)
            .map(|(r, _)| self.world_rank(r))
            .collect();
        if !member {
            return Ok(None);
        }
        let me = self.me();
        let rank = members.iter().position(|&w| w == me).unwrap();
        Ok(Some(Arc::new(ThreadedComm {
            shared: Arc::clone(&self.shared),
            rank,
            members: Arc::new(members),
            tag_shift: self.tag_shift + SPLIT_SHIFT,
        })))
    }
}
