//! Fully-typed, globally-identified events.
//!
//! These are the objects handed to the downstream replay engine: every
//! identifier has been translated to its global counterpart and every
//! timestamp has been corrected onto the global time axis.

use std::fmt;

use derive_more::{Add, From, Sub};
use serde::Serialize;

use crate::defs::{CallsiteId, CommId, GroupingSetId, LocationId, Paradigm, RegionId, WindowId};

/// Corrected global timestamp in seconds.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Default, Add, Sub, From, Serialize)]
pub struct Timestamp(pub f64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum CollectiveKind {
    Barrier,
    Bcast,
    Scatter,
    Scatterv,
    Reduce,
    Gather,
    Gatherv,
    Allgather,
    Allgatherv,
    Allreduce,
    Alltoall,
    Alltoallv,
    Alltoallw,
    ReduceScatter,
    ReduceScatterBlock,
    Scan,
    Exscan,
}

#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    Enter { region: RegionId },
    EnterCallsite { callsite: CallsiteId, region: RegionId },
    Leave { region: RegionId },

    MpiSend { comm: CommId, dest: u32, tag: u32, bytes: u32 },
    MpiSendRequest { comm: CommId, dest: u32, tag: u32, bytes: u32, request: u64 },
    MpiSendComplete { request: u64 },
    MpiRecv { comm: CommId, source: u32, tag: u32 },
    MpiRecvComplete { comm: CommId, source: u32, tag: u32, request: u64 },
    MpiRecvRequest { request: u64 },
    MpiRequestTested { request: u64 },
    MpiCancelled { request: u64 },

    MpiCollectiveBegin,
    MpiCollectiveEnd { kind: CollectiveKind, comm: CommId, root: Option<u32>, sent: u32, received: u32 },

    ThreadTeamBegin { team: CommId },
    ThreadTeamEnd { team: CommId },
    ThreadFork { team_size: u32, paradigm: Paradigm },
    ThreadJoin { paradigm: Paradigm },

    MpiRmaPutStart { rma: u32, target: u32, bytes: u32, window: WindowId },
    MpiRmaPutEnd { rma: u32 },
    MpiRmaGetStart { rma: u32, origin: u32, bytes: u32, window: WindowId },
    MpiRmaGetEnd { rma: u32 },
    MpiRmaGats { window: WindowId, group: GroupingSetId, sync: bool },
    MpiRmaCollectiveBegin,
    MpiRmaCollectiveEnd { window: WindowId },
    MpiRmaLock { peer: u32, window: WindowId, exclusive: bool },
    MpiRmaUnlock { peer: u32, window: WindowId },

    RmaPutStart { rma: u32, dest: u32, bytes: u32 },
    RmaPutEnd { rma: u32 },
    RmaGetStart { rma: u32, target: u32, bytes: u32 },
    RmaGetEnd { rma: u32 },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Enter { .. } => "Enter",
            EventKind::EnterCallsite { .. } => "EnterCallsite",
            EventKind::Leave { .. } => "Leave",
            EventKind::MpiSend { .. } => "MpiSend",
            EventKind::MpiSendRequest { .. } => "MpiSendRequest",
            EventKind::MpiSendComplete { .. } => "MpiSendComplete",
            EventKind::MpiRecv { .. } => "MpiRecv",
            EventKind::MpiRecvComplete { .. } => "MpiRecvComplete",
            EventKind::MpiRecvRequest { .. } => "MpiRecvRequest",
            EventKind::MpiRequestTested { .. } => "MpiRequestTested",
            EventKind::MpiCancelled { .. } => "MpiCancelled",
            EventKind::MpiCollectiveBegin => "MpiCollectiveBegin",
            EventKind::MpiCollectiveEnd { .. } => "MpiCollectiveEnd",
            EventKind::ThreadTeamBegin { .. } => "ThreadTeamBegin",
            EventKind::ThreadTeamEnd { .. } => "ThreadTeamEnd",
            EventKind::ThreadFork { .. } => "ThreadFork",
            EventKind::ThreadJoin { .. } => "ThreadJoin",
            EventKind::MpiRmaPutStart { .. } => "MpiRmaPutStart",
            EventKind::MpiRmaPutEnd { .. } => "MpiRmaPutEnd",
            EventKind::MpiRmaGetStart { .. } => "MpiRmaGetStart",
            EventKind::MpiRmaGetEnd { .. } => "MpiRmaGetEnd",
            EventKind::MpiRmaGats { .. } => "MpiRmaGats",
            EventKind::MpiRmaCollectiveBegin => "MpiRmaCollectiveBegin",
            EventKind::MpiRmaCollectiveEnd { .. } => "MpiRmaCollectiveEnd",
            EventKind::MpiRmaLock { .. } => "MpiRmaLock",
            EventKind::MpiRmaUnlock { .. } => "MpiRmaUnlock",
            EventKind::RmaPutStart { .. } => "RmaPutStart",
            EventKind::RmaPutEnd { .. } => "RmaPutEnd",
            EventKind::RmaGetStart { .. } => "RmaGetStart",
            EventKind::RmaGetEnd { .. } => "RmaGetEnd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub time: Timestamp,
    pub kind: EventKind,
}

/// Per-location ordered event buffer plus the counters used by the
/// cross-thread consistency checks after reading.
#[derive(Debug, Clone, Serialize)]
pub struct LocalTrace {
    pub location: LocationId,
    events: Vec<Event>,
    pub omp_parallel_enters: u32,
    pub mpi_region_enters: u32,
}

impl LocalTrace {
    pub fn new(location: LocationId) -> LocalTrace {
        LocalTrace {
            location,
            events: Vec::new(),
            omp_parallel_enters: 0,
            mpi_region_enters: 0,
        }
    }

    pub fn add_event(&mut self, time: Timestamp, kind: EventKind) {
        self.events.push(Event { time, kind });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [Event] {
        &mut self.events
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.events.first().map(|event| event.time)
    }
}
