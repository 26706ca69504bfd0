//! Distributed call-tree unification.
//!
//! Processes may discover different call paths while reading their local
//! traces, so the per-process trees have to be merged into one tree that
//! every process agrees on. The merge runs as a hypercube-style reduction:
//! after round `k`, rank 0's tree is the union of the original trees of
//! ranks `0..2^(k+1)`. A flat all-to-one merge would serialize both the
//! communication and the merge work at rank 0; the hypercube schedule
//! spreads them over `ceil(log2(P))` rounds.

use log::{debug, info};

use crate::calltree::CallTree;
use crate::defs::GlobalDefs;
use crate::error::{Result, TraceError};

/// Channel tag for serialized call trees.
pub const CALL_TREE_TAG: u32 = 0;

/// Collective and point-to-point primitives required from the transport
/// layer. A process must not return from any collective before all ranks
/// have entered it; failures are not locally recoverable (the distributed
/// tree state would diverge) and abort the run.
pub trait Transport {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn allreduce_min(&mut self, value: f64) -> Result<f64>;
    fn allreduce_sum(&mut self, value: u32) -> Result<u32>;
    fn send(&mut self, dest: usize, tag: u32, data: &[u8]) -> Result<()>;
    fn recv(&mut self, source: usize, tag: u32) -> Result<Vec<u8>>;
    fn bcast(&mut self, root: usize, data: &mut Vec<u8>) -> Result<()>;
    fn barrier(&mut self) -> Result<()>;
}

/// Single-process backend: reductions are the identity and point-to-point
/// traffic is a protocol error.
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_min(&mut self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn allreduce_sum(&mut self, value: u32) -> Result<u32> {
        Ok(value)
    }

    fn send(&mut self, dest: usize, _tag: u32, _data: &[u8]) -> Result<()> {
        Err(TraceError::Protocol(format!(
            "send to rank {} in a single-process run",
            dest
        )))
    }

    fn recv(&mut self, source: usize, _tag: u32) -> Result<Vec<u8>> {
        Err(TraceError::Protocol(format!(
            "receive from rank {} in a single-process run",
            source
        )))
    }

    fn bcast(&mut self, _root: usize, _data: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Number of reduction rounds for `size` ranks: `ceil(log2(size))`. The
/// counting loop yields one round too many when `size` is an exact power
/// of two, because the accumulation then completes one round early.
pub fn reduction_rounds(size: usize) -> u32 {
    let mut rounds = 0;
    let mut n = size;
    while n > 0 {
        rounds += 1;
        n /= 2;
    }
    if size.is_power_of_two() {
        rounds -= 1;
    }
    rounds
}

/// Combines the process-local call trees into a global one and installs it
/// on every rank. Also establishes the global time origin (minimum of the
/// per-process offsets) — the merge result must not depend on clock skew.
///
/// The expensive path only runs if at least one rank's tree was modified
/// after reading; with a complete shared call tree this returns after one
/// reduction.
pub fn unify_call_tree(defs: &mut GlobalDefs, transport: &mut dyn Transport) -> Result<()> {
    // Determine the global time offset across processes
    let offset = defs.global_offset();
    let global = transport.allreduce_min(offset)?;
    defs.set_global_offset(global);

    // Determine whether call tree unification is necessary at all
    let local_mod = defs.call_tree().is_modified() as u32;
    let global_mod = transport.allreduce_sum(local_mod)?;
    if global_mod == 0 {
        return Ok(());
    }

    let rank = transport.rank();
    let size = transport.size();
    if rank == 0 {
        info!(
            "incomplete call-tree definitions on {} of {} ranks; \
             reconstructing global call tree from trace data",
            global_mod, size
        );
    }

    let max_iter = reduction_rounds(size);
    for iter in 0..max_iter {
        let dist = 1usize << iter; // rank offset sender/receiver
        let step = 2 * dist; // rank offset of two receivers
        let source = rank + dist;

        if rank % step == 0 && source < size {
            // Receive and merge the sender's tree
            let buffer = transport.recv(source, CALL_TREE_TAG)?;
            let other = CallTree::unpack(&buffer, defs)?;
            debug!(
                "round {}: merging {} call paths from rank {}",
                iter,
                other.num_callpaths(),
                source
            );
            defs.call_tree_mut().merge(&other);
        } else if rank % step == dist {
            // Hand the accumulated tree downward; this rank takes no
            // further part in later rounds
            let buffer = defs.call_tree().pack();
            transport.send(rank - dist, CALL_TREE_TAG, &buffer)?;
        }
    }

    // Broadcast the unified tree and install it everywhere
    let mut buffer = if rank == 0 {
        defs.call_tree().pack()
    } else {
        Vec::new()
    };
    transport.bcast(0, &mut buffer)?;
    let unified = CallTree::unpack(&buffer, defs)?;
    defs.set_call_tree(unified);
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::mpsc::{channel, Receiver, Sender};

    use super::*;

    const TAG_REDUCE: u32 = 0xffff_0001;
    const TAG_RESULT: u32 = 0xffff_0002;
    const TAG_BCAST: u32 = 0xffff_0003;

    type Message = (usize, u32, Vec<u8>);

    /// In-memory transport connecting the simulated ranks of one test;
    /// every rank runs on its own thread and blocks on channel receives.
    pub struct ChannelTransport {
        rank: usize,
        size: usize,
        peers: Vec<Sender<Message>>,
        inbox: Receiver<Message>,
        pending: Vec<Message>,
    }

    pub fn channel_mesh(size: usize) -> Vec<ChannelTransport> {
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank,
                size,
                peers: senders.clone(),
                inbox,
                pending: Vec::new(),
            })
            .collect()
    }

    impl ChannelTransport {
        fn reduce_with<T, F>(&mut self, value: T, fold: F) -> Result<T>
        where
            T: Copy + ReduceValue,
            F: Fn(T, T) -> T,
        {
            if self.rank == 0 {
                let mut accumulated = value;
                for source in 1..self.size {
                    let bytes = self.recv(source, TAG_REDUCE)?;
                    accumulated = fold(accumulated, T::from_bytes(&bytes));
                }
                for dest in 1..self.size {
                    self.send(dest, TAG_RESULT, &accumulated.to_bytes())?;
                }
                Ok(accumulated)
            } else {
                self.send(0, TAG_REDUCE, &value.to_bytes())?;
                let bytes = self.recv(0, TAG_RESULT)?;
                Ok(T::from_bytes(&bytes))
            }
        }
    }

    pub trait ReduceValue {
        fn to_bytes(&self) -> Vec<u8>;
        fn from_bytes(bytes: &[u8]) -> Self;
    }

    impl ReduceValue for f64 {
        fn to_bytes(&self) -> Vec<u8> {
            self.to_le_bytes().to_vec()
        }
        fn from_bytes(bytes: &[u8]) -> Self {
            f64::from_le_bytes(bytes.try_into().unwrap())
        }
    }

    impl ReduceValue for u32 {
        fn to_bytes(&self) -> Vec<u8> {
            self.to_le_bytes().to_vec()
        }
        fn from_bytes(bytes: &[u8]) -> Self {
            u32::from_le_bytes(bytes.try_into().unwrap())
        }
    }

    impl Transport for ChannelTransport {
        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn allreduce_min(&mut self, value: f64) -> Result<f64> {
            self.reduce_with(value, f64::min)
        }

        fn allreduce_sum(&mut self, value: u32) -> Result<u32> {
            self.reduce_with(value, |a, b| a + b)
        }

        fn send(&mut self, dest: usize, tag: u32, data: &[u8]) -> Result<()> {
            self.peers[dest]
                .send((self.rank, tag, data.to_vec()))
                .map_err(|_| TraceError::Protocol(format!("rank {} unreachable", dest)))
        }

        fn recv(&mut self, source: usize, tag: u32) -> Result<Vec<u8>> {
            if let Some(index) = self
                .pending
                .iter()
                .position(|(s, t, _)| *s == source && *t == tag)
            {
                return Ok(self.pending.remove(index).2);
            }
            loop {
                let message = self.inbox.recv().map_err(|_| {
                    TraceError::Protocol(format!("rank {} hung up", source))
                })?;
                if message.0 == source && message.1 == tag {
                    return Ok(message.2);
                }
                self.pending.push(message);
            }
        }

        fn bcast(&mut self, root: usize, data: &mut Vec<u8>) -> Result<()> {
            if self.rank == root {
                for dest in 0..self.size {
                    if dest != root {
                        self.send(dest, TAG_BCAST, data)?;
                    }
                }
            } else {
                *data = self.recv(root, TAG_BCAST)?;
            }
            Ok(())
        }

        fn barrier(&mut self) -> Result<()> {
            self.allreduce_sum(0).map(|_| ())
        }
    }
}
