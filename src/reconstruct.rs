//! Event-stream reconstruction.
//!
//! Decodes one location's event records into fully-typed, globally
//! identified events, maintaining the open call stack and the set of
//! outstanding non-blocking requests along the way. Records of other
//! locations sharing the same container are skipped; the stream must
//! enter and leave regions in balanced, properly nested order.

use std::collections::BTreeSet;

use crate::defs::{
    CallsiteId, CommId, GlobalDefs, GroupingSetId, LocationId, Paradigm, Region, RegionId,
    RegionRole, WindowId,
};
use crate::error::{Result, TraceError};
use crate::event::{CollectiveKind, EventKind, LocalTrace, Timestamp};
use crate::mapping::MappingTable;
use crate::serialize::{EventRecord, VERSION_LOCAL_RANKS};

/// Attribute kind carrying the request id for the next send/receive.
pub const ATTR_REQUEST: u8 = 0;

/// Constructs paradigm-specific events. The base behavior declines every
/// MPI event; the MPI factory overrides all of them. A factory is selected
/// once per analysis run via [`AnalysisContext`].
#[rustfmt::skip]
pub trait EventFactory: Send + Sync {
    fn mpi_send(&self, _comm: CommId, _dest: u32, _tag: u32, _bytes: u32) -> Option<EventKind> { None }
    fn mpi_send_request(&self, _comm: CommId, _dest: u32, _tag: u32, _bytes: u32, _request: u64) -> Option<EventKind> { None }
    fn mpi_send_complete(&self, _request: u64) -> Option<EventKind> { None }
    fn mpi_recv(&self, _comm: CommId, _source: u32, _tag: u32) -> Option<EventKind> { None }
    fn mpi_recv_complete(&self, _comm: CommId, _source: u32, _tag: u32, _request: u64) -> Option<EventKind> { None }
    fn mpi_recv_request(&self, _request: u64) -> Option<EventKind> { None }
    fn mpi_request_tested(&self, _request: u64) -> Option<EventKind> { None }
    fn mpi_cancelled(&self, _request: u64) -> Option<EventKind> { None }
    fn mpi_collective_begin(&self) -> Option<EventKind> { None }
    fn mpi_collective_end(&self, _kind: CollectiveKind, _comm: CommId, _root: Option<u32>, _sent: u32, _received: u32) -> Option<EventKind> { None }
    fn mpi_rma_put_start(&self, _rma: u32, _target: u32, _bytes: u32, _window: WindowId) -> Option<EventKind> { None }
    fn mpi_rma_put_end(&self, _rma: u32) -> Option<EventKind> { None }
    fn mpi_rma_get_start(&self, _rma: u32, _origin: u32, _bytes: u32, _window: WindowId) -> Option<EventKind> { None }
    fn mpi_rma_get_end(&self, _rma: u32) -> Option<EventKind> { None }
    fn mpi_rma_gats(&self, _window: WindowId, _group: GroupingSetId, _sync: bool) -> Option<EventKind> { None }
    fn mpi_rma_collective_begin(&self) -> Option<EventKind> { None }
    fn mpi_rma_collective_end(&self, _window: WindowId) -> Option<EventKind> { None }
    fn mpi_rma_lock(&self, _peer: u32, _window: WindowId, _exclusive: bool) -> Option<EventKind> { None }
    fn mpi_rma_unlock(&self, _peer: u32, _window: WindowId) -> Option<EventKind> { None }
}

/// Factory for traces without message passing.
pub struct GenericEventFactory;

impl EventFactory for GenericEventFactory {}

/// Factory for MPI (and hybrid) traces.
pub struct MpiEventFactory;

#[rustfmt::skip]
impl EventFactory for MpiEventFactory {
    fn mpi_send(&self, comm: CommId, dest: u32, tag: u32, bytes: u32) -> Option<EventKind> {
        Some(EventKind::MpiSend { comm, dest, tag, bytes })
    }
    fn mpi_send_request(&self, comm: CommId, dest: u32, tag: u32, bytes: u32, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiSendRequest { comm, dest, tag, bytes, request })
    }
    fn mpi_send_complete(&self, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiSendComplete { request })
    }
    fn mpi_recv(&self, comm: CommId, source: u32, tag: u32) -> Option<EventKind> {
        Some(EventKind::MpiRecv { comm, source, tag })
    }
    fn mpi_recv_complete(&self, comm: CommId, source: u32, tag: u32, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiRecvComplete { comm, source, tag, request })
    }
    fn mpi_recv_request(&self, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiRecvRequest { request })
    }
    fn mpi_request_tested(&self, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiRequestTested { request })
    }
    fn mpi_cancelled(&self, request: u64) -> Option<EventKind> {
        Some(EventKind::MpiCancelled { request })
    }
    fn mpi_collective_begin(&self) -> Option<EventKind> {
        Some(EventKind::MpiCollectiveBegin)
    }
    fn mpi_collective_end(&self, kind: CollectiveKind, comm: CommId, root: Option<u32>, sent: u32, received: u32) -> Option<EventKind> {
        Some(EventKind::MpiCollectiveEnd { kind, comm, root, sent, received })
    }
    fn mpi_rma_put_start(&self, rma: u32, target: u32, bytes: u32, window: WindowId) -> Option<EventKind> {
        Some(EventKind::MpiRmaPutStart { rma, target, bytes, window })
    }
    fn mpi_rma_put_end(&self, rma: u32) -> Option<EventKind> {
        Some(EventKind::MpiRmaPutEnd { rma })
    }
    fn mpi_rma_get_start(&self, rma: u32, origin: u32, bytes: u32, window: WindowId) -> Option<EventKind> {
        Some(EventKind::MpiRmaGetStart { rma, origin, bytes, window })
    }
    fn mpi_rma_get_end(&self, rma: u32) -> Option<EventKind> {
        Some(EventKind::MpiRmaGetEnd { rma })
    }
    fn mpi_rma_gats(&self, window: WindowId, group: GroupingSetId, sync: bool) -> Option<EventKind> {
        Some(EventKind::MpiRmaGats { window, group, sync })
    }
    fn mpi_rma_collective_begin(&self) -> Option<EventKind> {
        Some(EventKind::MpiRmaCollectiveBegin)
    }
    fn mpi_rma_collective_end(&self, window: WindowId) -> Option<EventKind> {
        Some(EventKind::MpiRmaCollectiveEnd { window })
    }
    fn mpi_rma_lock(&self, peer: u32, window: WindowId, exclusive: bool) -> Option<EventKind> {
        Some(EventKind::MpiRmaLock { peer, window, exclusive })
    }
    fn mpi_rma_unlock(&self, peer: u32, window: WindowId) -> Option<EventKind> {
        Some(EventKind::MpiRmaUnlock { peer, window })
    }
}

/// Run-wide context threaded through every component that constructs
/// paradigm-specific events, replacing process-global factory state.
pub struct AnalysisContext {
    factory: Box<dyn EventFactory>,
}

impl AnalysisContext {
    pub fn generic() -> AnalysisContext {
        AnalysisContext {
            factory: Box::new(GenericEventFactory),
        }
    }

    pub fn mpi() -> AnalysisContext {
        AnalysisContext {
            factory: Box::new(MpiEventFactory),
        }
    }

    pub fn factory(&self) -> &dyn EventFactory {
        &*self.factory
    }
}

/// Per-location decode state machine.
pub struct EventReader<'a> {
    defs: &'a GlobalDefs,
    table: &'a MappingTable,
    factory: &'a dyn EventFactory,
    version: u32,
    location: LocationId,
    rank: u32,
    thread_team: Option<CommId>,
    call_stack: Vec<RegionId>,
    request_id: Option<u64>,
    active_requests: BTreeSet<u64>,
    trace: LocalTrace,
}

impl<'a> EventReader<'a> {
    pub fn new(
        defs: &'a GlobalDefs,
        table: &'a MappingTable,
        factory: &'a dyn EventFactory,
        version: u32,
        location: LocationId,
        rank: u32,
        thread_team: Option<CommId>,
    ) -> EventReader<'a> {
        EventReader {
            defs,
            table,
            factory,
            version,
            location,
            rank,
            thread_team,
            call_stack: Vec::new(),
            request_id: None,
            active_requests: BTreeSet::new(),
            trace: LocalTrace::new(location),
        }
    }

    /// Processes one decoded record. Records whose mapped location differs
    /// from the location under reconstruction belong to another location in
    /// the same container and are skipped entirely.
    pub fn handle(&mut self, record: &EventRecord) -> Result<()> {
        if let EventRecord::Attribute { kind, value } = record {
            if *kind == ATTR_REQUEST {
                self.request_id = Some(*value);
            }
            return Ok(());
        }

        let raw_location = record.location().expect("non-attribute record");
        let mapped = LocationId(self.table.map_location_id(raw_location)?);
        if mapped != self.location {
            self.request_id = None;
            return Ok(());
        }

        let result = self.dispatch(record);
        self.request_id = None;
        result
    }

    /// End-of-stream check: the call stack must be empty.
    pub fn finish(self) -> Result<LocalTrace> {
        if !self.call_stack.is_empty() {
            return Err(TraceError::Unbalanced("too many ENTERs"));
        }
        Ok(self.trace)
    }

    fn dispatch(&mut self, record: &EventRecord) -> Result<()> {
        use EventRecord as R;
        let defs = self.defs;
        match record {
            R::Attribute { .. } => unreachable!("handled by caller"),

            R::Enter { time, region, .. } => {
                let region = RegionId(self.table.map_region_id(*region)?);
                self.enter_region(self.table.map_timestamp(*time), region, None)
            }
            R::EnterCallsite { time, callsite, .. } => {
                let callsite = CallsiteId(self.table.map_callsite_id(*callsite)?);
                let region = defs.callsite(callsite)?.callee;
                self.enter_region(self.table.map_timestamp(*time), region, Some(callsite))
            }
            R::Exit { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                self.trace.add_event(time, EventKind::Leave { region });
                self.close_thread_team(time, region)
            }

            R::MpiSend {
                time,
                dest,
                comm,
                tag,
                bytes,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let comm = CommId(self.table.map_communicator_id(*comm)?);
                // Pre-1.8 traces: convert global |-> local destination rank
                let mut dest = *dest;
                if self.version < VERSION_LOCAL_RANKS {
                    dest = self.comm_local_rank(comm, dest)?;
                }
                let kind = match self.request_id {
                    None => self.factory.mpi_send(comm, dest, *tag, *bytes),
                    Some(request) => {
                        self.active_requests.insert(request);
                        self.factory.mpi_send_request(comm, dest, *tag, *bytes, request)
                    }
                };
                self.emit(time, kind);
                Ok(())
            }
            R::MpiRecv {
                time,
                source,
                comm,
                tag,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let comm = CommId(self.table.map_communicator_id(*comm)?);
                // Pre-1.8 traces: convert global |-> local source rank
                let mut source = *source;
                if self.version < VERSION_LOCAL_RANKS {
                    source = self.comm_local_rank(comm, source)?;
                }
                let kind = match self.request_id {
                    None => self.factory.mpi_recv(comm, source, *tag),
                    Some(request) => {
                        self.active_requests.remove(&request);
                        self.factory.mpi_recv_complete(comm, source, *tag, request)
                    }
                };
                self.emit(time, kind);
                Ok(())
            }
            R::MpiCollectiveExit {
                time,
                root,
                comm,
                sent,
                received,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                let comm = CommId(self.table.map_communicator_id(*comm)?);
                let root = self.map_root_rank(comm, *root)?;
                let kind = collective_kind(defs, defs.region(region)?)?;
                let end = self
                    .factory
                    .mpi_collective_end(kind, comm, root, *sent, *received);
                self.emit(time, end);
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }
            R::MpiSendComplete { time, request, .. } => {
                let time = self.table.map_timestamp(*time);
                let request = *request as u64;
                let kind = self.factory.mpi_send_complete(request);
                self.active_requests.remove(&request);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiRecvRequest { time, request, .. } => {
                let time = self.table.map_timestamp(*time);
                let request = *request as u64;
                let kind = self.factory.mpi_recv_request(request);
                self.active_requests.insert(request);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiRequestTested { time, request, .. } => {
                let time = self.table.map_timestamp(*time);
                let request = *request as u64;
                // Only keep tests of requests that are still outstanding
                if self.active_requests.contains(&request) {
                    let kind = self.factory.mpi_request_tested(request);
                    self.emit(time, kind);
                }
                Ok(())
            }
            R::MpiCancelled { time, request, .. } => {
                let time = self.table.map_timestamp(*time);
                let request = *request as u64;
                let kind = self.factory.mpi_cancelled(request);
                self.active_requests.remove(&request);
                self.emit(time, kind);
                Ok(())
            }

            R::MpiRmaPutStart {
                time,
                target,
                window,
                rma,
                bytes,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let window = WindowId(self.table.map_window_id(*window)?);
                // Pre-1.8 traces: convert global |-> local target rank
                let mut target = *target;
                if self.version < VERSION_LOCAL_RANKS {
                    target = self.window_local_rank(window, target)?;
                }
                let kind = self.factory.mpi_rma_put_start(*rma, target, *bytes, window);
                self.emit(time, kind);
                Ok(())
            }
            // Legacy local-completion records; superseded by the _REMOTE
            // variants and retained only for format compatibility.
            R::MpiRmaPutEnd { .. } | R::MpiRmaGetStart { .. } => Ok(()),
            R::MpiRmaPutEndRemote { time, rma, .. } => {
                let time = self.table.map_timestamp(*time);
                let kind = self.factory.mpi_rma_put_end(*rma);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiRmaGetStartRemote {
                time,
                origin,
                window,
                rma,
                bytes,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let window = WindowId(self.table.map_window_id(*window)?);
                // Pre-1.8 traces: convert global |-> local origin rank
                let mut origin = *origin;
                if self.version < VERSION_LOCAL_RANKS {
                    origin = self.window_local_rank(window, origin)?;
                }
                let kind = self.factory.mpi_rma_get_start(*rma, origin, *bytes, window);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiRmaGetEnd { time, rma, .. } => {
                let time = self.table.map_timestamp(*time);
                let kind = self.factory.mpi_rma_get_end(*rma);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiWinExit {
                time,
                window,
                group,
                sync,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                // Pre-1.8 traces tag the access group with a communicator id
                let comm_set = if self.version < VERSION_LOCAL_RANKS {
                    self.table.map_communicator_id(*group)?
                } else {
                    self.table.map_group_id(*group)?
                };
                let window = WindowId(self.table.map_window_id(*window)?);
                let kind = self
                    .factory
                    .mpi_rma_gats(window, GroupingSetId(comm_set), *sync);
                self.emit(time, kind);
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }
            R::MpiWinCollectiveExit { time, window, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                let window = WindowId(self.table.map_window_id(*window)?);
                let kind = self.factory.mpi_rma_collective_end(window);
                self.emit(time, kind);
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }
            R::MpiWinLock {
                time,
                peer,
                window,
                exclusive,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                let window = WindowId(self.table.map_window_id(*window)?);
                // Pre-1.8 traces: convert global |-> local remote rank
                let mut peer = *peer;
                if self.version < VERSION_LOCAL_RANKS {
                    peer = self.window_local_rank(window, peer)?;
                }
                let kind = self.factory.mpi_rma_lock(peer, window, *exclusive);
                self.emit(time, kind);
                Ok(())
            }
            R::MpiWinUnlock {
                time, peer, window, ..
            } => {
                let time = self.table.map_timestamp(*time);
                let window = WindowId(self.table.map_window_id(*window)?);
                // Pre-1.8 traces: convert global |-> local remote rank
                let mut peer = *peer;
                if self.version < VERSION_LOCAL_RANKS {
                    peer = self.window_local_rank(window, peer)?;
                }
                let kind = self.factory.mpi_rma_unlock(peer, window);
                self.emit(time, kind);
                Ok(())
            }

            R::RmaPutStart {
                time,
                dest,
                rma,
                bytes,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                self.trace.add_event(
                    time,
                    EventKind::RmaPutStart {
                        rma: *rma,
                        dest: *dest,
                        bytes: *bytes,
                    },
                );
                Ok(())
            }
            // Legacy local-completion records, as above
            R::RmaPutEnd { .. } | R::RmaGetStart { .. } => Ok(()),
            R::RmaPutEndRemote { time, rma, .. } => {
                let time = self.table.map_timestamp(*time);
                self.trace.add_event(time, EventKind::RmaPutEnd { rma: *rma });
                Ok(())
            }
            R::RmaGetStartRemote {
                time,
                target,
                rma,
                bytes,
                ..
            } => {
                let time = self.table.map_timestamp(*time);
                self.trace.add_event(
                    time,
                    EventKind::RmaGetStart {
                        rma: *rma,
                        target: *target,
                        bytes: *bytes,
                    },
                );
                Ok(())
            }
            R::RmaGetEnd { time, rma, .. } => {
                let time = self.table.map_timestamp(*time);
                self.trace.add_event(time, EventKind::RmaGetEnd { rma: *rma });
                Ok(())
            }

            R::CollectiveExit { time, .. } => {
                // One-sided collectives carry no analysis-relevant payload,
                // but the EXIT must still be handled correctly.
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }

            R::Fork { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let location = defs.location(self.location)?;
                let team_size = defs.location_group(location.group)?.locations.len() as u32;
                self.trace.add_event(
                    time,
                    EventKind::ThreadFork {
                        team_size,
                        paradigm: Paradigm::OpenMp,
                    },
                );
                Ok(())
            }
            R::Join { time, .. } => {
                let time = self.table.map_timestamp(*time);
                self.trace.add_event(
                    time,
                    EventKind::ThreadJoin {
                        paradigm: Paradigm::OpenMp,
                    },
                );
                Ok(())
            }
            // The legacy format did not record the lock acquisition order;
            // forwarding these events would deadlock the lock analysis, so
            // they are discarded.
            R::OmpAcquireLock { .. } | R::OmpReleaseLock { .. } => Ok(()),
            R::OmpCollectiveExit { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                self.trace.add_event(time, EventKind::Leave { region });
                self.close_thread_team(time, region)
            }

            R::MeasurementOff { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = defs.pausing_region().ok_or_else(|| {
                    TraceError::Inconsistent("MEASUREMENT OFF region not defined".into())
                })?;
                self.call_stack.push(region);
                self.trace.add_event(time, EventKind::Enter { region });
                Ok(())
            }
            R::MeasurementOn { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }
            R::FlushStart { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = defs.flushing_region().ok_or_else(|| {
                    TraceError::Inconsistent("TRACE BUFFER FLUSH region not defined".into())
                })?;
                self.call_stack.push(region);
                self.trace.add_event(time, EventKind::Enter { region });
                Ok(())
            }
            R::FlushEnd { time, .. } => {
                let time = self.table.map_timestamp(*time);
                let region = self.pop_region()?;
                self.trace.add_event(time, EventKind::Leave { region });
                Ok(())
            }
        }
    }

    fn enter_region(
        &mut self,
        time: Timestamp,
        region_id: RegionId,
        callsite: Option<CallsiteId>,
    ) -> Result<()> {
        let defs = self.defs;
        self.call_stack.push(region_id);
        let region = defs.region(region_id)?;

        if region.is_mpi_api() {
            self.trace.mpi_region_enters += 1;
        }

        // Artificial ThreadTeamBegin on entering a parallel region
        if region.is_omp_parallel() {
            self.trace.omp_parallel_enters += 1;
            let team = self.thread_team()?;
            self.trace
                .add_event(time, EventKind::ThreadTeamBegin { team });
        }

        match callsite {
            Some(callsite) => self.trace.add_event(
                time,
                EventKind::EnterCallsite {
                    callsite,
                    region: region_id,
                },
            ),
            None => self
                .trace
                .add_event(time, EventKind::Enter { region: region_id }),
        }

        // Collective begin markers only follow plain enters
        if callsite.is_none() {
            if region.is_mpi_collective() {
                let kind = self.factory.mpi_collective_begin();
                self.emit(time, kind);
            } else if region.is_mpi_rma_collective() {
                let kind = self.factory.mpi_rma_collective_begin();
                self.emit(time, kind);
            }
        }
        Ok(())
    }

    /// Emits the artificial ThreadTeamEnd after leaving a parallel region.
    fn close_thread_team(&mut self, time: Timestamp, region_id: RegionId) -> Result<()> {
        if self.defs.region(region_id)?.is_omp_parallel() {
            let team = self.thread_team()?;
            self.trace.add_event(time, EventKind::ThreadTeamEnd { team });
        }
        Ok(())
    }

    fn pop_region(&mut self) -> Result<RegionId> {
        self.call_stack
            .pop()
            .ok_or(TraceError::Unbalanced("too many EXITs"))
    }

    fn emit(&mut self, time: Timestamp, kind: Option<EventKind>) {
        if let Some(kind) = kind {
            self.trace.add_event(time, kind);
        }
    }

    fn thread_team(&self) -> Result<CommId> {
        self.thread_team.ok_or_else(|| {
            TraceError::Inconsistent(format!(
                "OpenMP parallel region on rank {} but no thread-team communicators",
                self.rank
            ))
        })
    }

    fn map_root_rank(&self, comm: CommId, root: u32) -> Result<Option<u32>> {
        if root == crate::idmap::NO_ID {
            return Ok(None);
        }
        // Pre-1.8 traces: convert global |-> local root rank
        if self.version < VERSION_LOCAL_RANKS {
            return Ok(Some(self.comm_local_rank(comm, root)?));
        }
        Ok(Some(root))
    }

    fn comm_local_rank(&self, comm: CommId, global: u32) -> Result<u32> {
        let defs = self.defs;
        let comm = defs.communicator(comm)?;
        let set = defs.grouping_set(comm.comm_set)?;
        set.local_rank(global as u64)
            .ok_or(TraceError::UnknownId {
                category: "communicator rank",
                id: global,
            })
    }

    fn window_local_rank(&self, window: WindowId, global: u32) -> Result<u32> {
        let comm = self.defs.window(window)?.comm;
        self.comm_local_rank(comm, global)
    }
}

/// Maps a collective region onto the collective operation it implements.
pub fn collective_kind(defs: &GlobalDefs, region: &Region) -> Result<CollectiveKind> {
    if !region.is_mpi_collective() {
        return Err(TraceError::Inconsistent(
            "MPI collective event found in non-collective region".into(),
        ));
    }
    if region.role == RegionRole::Barrier {
        return Ok(CollectiveKind::Barrier);
    }

    let name = defs.string(region.canonical_name)?.value.as_str();
    let kind = match (region.role, name) {
        (RegionRole::Coll12N, "MPI_Bcast") => CollectiveKind::Bcast,
        (RegionRole::Coll12N, "MPI_Scatter") => CollectiveKind::Scatter,
        (RegionRole::Coll12N, "MPI_Scatterv") => CollectiveKind::Scatterv,
        (RegionRole::CollN21, "MPI_Reduce") => CollectiveKind::Reduce,
        (RegionRole::CollN21, "MPI_Gather") => CollectiveKind::Gather,
        (RegionRole::CollN21, "MPI_Gatherv") => CollectiveKind::Gatherv,
        (RegionRole::CollN2N, "MPI_Allgather") => CollectiveKind::Allgather,
        (RegionRole::CollN2N, "MPI_Allgatherv") => CollectiveKind::Allgatherv,
        (RegionRole::CollN2N, "MPI_Allreduce") => CollectiveKind::Allreduce,
        (RegionRole::CollN2N, "MPI_Alltoall") => CollectiveKind::Alltoall,
        (RegionRole::CollN2N, "MPI_Alltoallv") => CollectiveKind::Alltoallv,
        (RegionRole::CollN2N, "MPI_Alltoallw") => CollectiveKind::Alltoallw,
        (RegionRole::CollN2N, "MPI_Reduce_scatter") => CollectiveKind::ReduceScatter,
        (RegionRole::CollN2N, "MPI_Reduce_scatter_block") => CollectiveKind::ReduceScatterBlock,
        (RegionRole::CollScan, "MPI_Scan") => CollectiveKind::Scan,
        (RegionRole::CollScan, "MPI_Exscan") => CollectiveKind::Exscan,
        _ => {
            return Err(TraceError::Inconsistent(format!(
                "unknown collective region {:?} ({})",
                region.role, name
            )));
        }
    };
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{
        Communicator, GroupingSet, GroupingSetKind, Location, LocationGroup, StringDef, StringId,
        SystemNodeId,
    };
    use crate::serialize::{EventRecord as R, FORMAT_VERSION};

    struct Fixture {
        defs: GlobalDefs,
        table: MappingTable,
    }

    fn add_region(defs: &mut GlobalDefs, id: u32, name: &str, paradigm: Paradigm, role: RegionRole) {
        let string = StringId(defs.num_strings() as u32);
        defs.add_string(StringDef {
            id: string,
            value: name.to_owned(),
        });
        defs.add_region(crate::defs::Region {
            id: RegionId(id),
            name: string,
            canonical_name: string,
            file: None,
            line: None,
            role,
            paradigm,
        })
        .unwrap();
    }

    fn fixture() -> Fixture {
        let mut defs = GlobalDefs::new();
        defs.add_string(StringDef {
            id: StringId(100),
            value: "node".to_owned(),
        });
        defs.add_system_node(crate::defs::SystemNode {
            id: SystemNodeId(0),
            name: StringId(100),
            class: StringId(100),
            parent: None,
        });
        defs.add_location_group(LocationGroup {
            id: crate::defs::LocationGroupId(0),
            name: StringId(100),
            rank: 0,
            parent: SystemNodeId(0),
            locations: Vec::new(),
        });
        defs.add_location(Location {
            id: LocationId(0),
            name: StringId(100),
            group: crate::defs::LocationGroupId(0),
            thread: 0,
        })
        .unwrap();

        add_region(&mut defs, 0, "main", Paradigm::User, RegionRole::Function);
        add_region(&mut defs, 1, "work", Paradigm::User, RegionRole::Function);
        add_region(
            &mut defs,
            2,
            "MPI_Allreduce",
            Paradigm::Mpi,
            RegionRole::CollN2N,
        );
        add_region(
            &mut defs,
            3,
            "!$omp parallel",
            Paradigm::OpenMp,
            RegionRole::Parallel,
        );

        // COMM_WORLD over three single-location processes with comm-set
        // ranks 10, 0, 20 (location ids double as global ranks here)
        defs.add_grouping_set(GroupingSet {
            id: GroupingSetId(0),
            name: None,
            kind: GroupingSetKind::CommSet,
            paradigm: Paradigm::Mpi,
            members: vec![10, 0, 20],
        });
        defs.add_communicator(Communicator {
            id: CommId(0),
            name: None,
            comm_set: GroupingSetId(0),
            parent: None,
        });

        defs.setup().unwrap();
        Fixture {
            defs,
            table: MappingTable::new(),
        }
    }

    fn reader<'a>(fx: &'a Fixture, factory: &'a dyn EventFactory, version: u32) -> EventReader<'a> {
        EventReader::new(
            &fx.defs,
            &fx.table,
            factory,
            version,
            LocationId(0),
            0,
            Some(CommId(7)),
        )
    }

    #[test]
    fn test_balanced_stream() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        let events = [
            R::Enter { location: 0, time: 1.0, region: 0 },
            R::Enter { location: 0, time: 2.0, region: 1 },
            R::Exit { location: 0, time: 3.0 },
            R::Exit { location: 0, time: 4.0 },
        ];
        for event in &events {
            reader.handle(event).unwrap();
        }
        let trace = reader.finish().unwrap();
        assert_eq!(trace.len(), 4);
        assert_eq!(
            trace.events()[3].kind,
            EventKind::Leave { region: RegionId(0) }
        );
    }

    #[test]
    fn test_too_many_exits() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::Enter { location: 0, time: 1.0, region: 0 })
            .unwrap();
        reader.handle(&R::Exit { location: 0, time: 2.0 }).unwrap();
        let err = reader
            .handle(&R::Exit { location: 0, time: 3.0 })
            .unwrap_err();
        assert!(matches!(err, TraceError::Unbalanced("too many EXITs")));
    }

    #[test]
    fn test_too_many_enters() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::Enter { location: 0, time: 1.0, region: 0 })
            .unwrap();
        reader
            .handle(&R::Enter { location: 0, time: 2.0, region: 1 })
            .unwrap();
        reader.handle(&R::Exit { location: 0, time: 3.0 }).unwrap();
        let err = reader.finish().unwrap_err();
        assert!(matches!(err, TraceError::Unbalanced("too many ENTERs")));
    }

    #[test]
    fn test_request_tested_suppression() {
        let fx = fixture();
        let factory = MpiEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);

        // Stale test: request 9 was never initiated
        reader
            .handle(&R::MpiRequestTested { location: 0, time: 1.0, request: 9 })
            .unwrap();
        // Outstanding receive request 5, then a test of it
        reader
            .handle(&R::MpiRecvRequest { location: 0, time: 2.0, request: 5 })
            .unwrap();
        reader
            .handle(&R::MpiRequestTested { location: 0, time: 3.0, request: 5 })
            .unwrap();
        let trace = reader.finish().unwrap();
        let kinds: Vec<_> = trace.events().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::MpiRecvRequest { request: 5 },
                EventKind::MpiRequestTested { request: 5 },
            ]
        );
    }

    #[test]
    fn test_nonblocking_send_uses_request_attribute() {
        let fx = fixture();
        let factory = MpiEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);

        reader
            .handle(&R::Attribute { kind: ATTR_REQUEST, value: 11 })
            .unwrap();
        reader
            .handle(&R::MpiSend { location: 0, time: 1.0, dest: 1, comm: 0, tag: 0, bytes: 64 })
            .unwrap();
        // Attribute consumed; the next send is blocking
        reader
            .handle(&R::MpiSend { location: 0, time: 2.0, dest: 1, comm: 0, tag: 0, bytes: 64 })
            .unwrap();
        reader
            .handle(&R::MpiSendComplete { location: 0, time: 3.0, request: 11 })
            .unwrap();
        let trace = reader.finish().unwrap();
        assert!(matches!(
            trace.events()[0].kind,
            EventKind::MpiSendRequest { request: 11, .. }
        ));
        assert!(matches!(trace.events()[1].kind, EventKind::MpiSend { .. }));
        assert!(matches!(
            trace.events()[2].kind,
            EventKind::MpiSendComplete { request: 11 }
        ));
    }

    #[test]
    fn test_pre_v18_rank_conversion() {
        let fx = fixture();
        let factory = MpiEventFactory;

        // Version 1007: global rank 20 resolves to comm-local rank 2
        let mut old = reader(&fx, &factory, 1007);
        old.handle(&R::MpiSend { location: 0, time: 1.0, dest: 20, comm: 0, tag: 0, bytes: 8 })
            .unwrap();
        let trace = old.finish().unwrap();
        assert_eq!(
            trace.events()[0].kind,
            EventKind::MpiSend { comm: CommId(0), dest: 2, tag: 0, bytes: 8 }
        );

        // Version 1008: ranks are already communicator-local
        let mut new = reader(&fx, &factory, 1008);
        new.handle(&R::MpiSend { location: 0, time: 1.0, dest: 2, comm: 0, tag: 0, bytes: 8 })
            .unwrap();
        let trace = new.finish().unwrap();
        assert_eq!(
            trace.events()[0].kind,
            EventKind::MpiSend { comm: CommId(0), dest: 2, tag: 0, bytes: 8 }
        );
    }

    #[test]
    fn test_collective_exit_synthesis() {
        let fx = fixture();
        let factory = MpiEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::Enter { location: 0, time: 1.0, region: 2 })
            .unwrap();
        reader
            .handle(&R::MpiCollectiveExit {
                location: 0,
                time: 2.0,
                root: crate::idmap::NO_ID,
                comm: 0,
                sent: 16,
                received: 16,
            })
            .unwrap();
        let trace = reader.finish().unwrap();
        let kinds: Vec<_> = trace.events().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Enter { region: RegionId(2) },
                EventKind::MpiCollectiveBegin,
                EventKind::MpiCollectiveEnd {
                    kind: CollectiveKind::Allreduce,
                    comm: CommId(0),
                    root: None,
                    sent: 16,
                    received: 16,
                },
                EventKind::Leave { region: RegionId(2) },
            ]
        );
        assert_eq!(trace.mpi_region_enters, 1);
    }

    #[test]
    fn test_omp_parallel_synthesizes_team_events() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::Enter { location: 0, time: 1.0, region: 3 })
            .unwrap();
        reader.handle(&R::Exit { location: 0, time: 2.0 }).unwrap();
        let trace = reader.finish().unwrap();
        let kinds: Vec<_> = trace.events().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ThreadTeamBegin { team: CommId(7) },
                EventKind::Enter { region: RegionId(3) },
                EventKind::Leave { region: RegionId(3) },
                EventKind::ThreadTeamEnd { team: CommId(7) },
            ]
        );
        assert_eq!(trace.omp_parallel_enters, 1);
    }

    #[test]
    fn test_foreign_location_records_skipped() {
        let fx = fixture();
        let factory = MpiEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        // A pending request attribute must not leak across a skipped record
        reader
            .handle(&R::Attribute { kind: ATTR_REQUEST, value: 3 })
            .unwrap();
        reader
            .handle(&R::Enter { location: 1, time: 1.0, region: 0 })
            .unwrap();
        reader
            .handle(&R::MpiSend { location: 0, time: 2.0, dest: 1, comm: 0, tag: 0, bytes: 8 })
            .unwrap();
        let trace = reader.finish().unwrap();
        assert_eq!(trace.len(), 1);
        assert!(matches!(trace.events()[0].kind, EventKind::MpiSend { .. }));
    }

    #[test]
    fn test_omp_lock_events_dropped() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::OmpAcquireLock { location: 0, time: 1.0, lock: 0 })
            .unwrap();
        reader
            .handle(&R::OmpReleaseLock { location: 0, time: 2.0, lock: 0 })
            .unwrap();
        let trace = reader.finish().unwrap();
        assert!(trace.is_empty());
    }

    #[test]
    fn test_measurement_pause_uses_synthetic_region() {
        let fx = fixture();
        let factory = GenericEventFactory;
        let pausing = fx.defs.pausing_region().unwrap();
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::MeasurementOff { location: 0, time: 1.0 })
            .unwrap();
        reader
            .handle(&R::MeasurementOn { location: 0, time: 2.0 })
            .unwrap();
        let trace = reader.finish().unwrap();
        assert_eq!(
            trace.events()[0].kind,
            EventKind::Enter { region: pausing }
        );
        assert_eq!(
            trace.events()[1].kind,
            EventKind::Leave { region: pausing }
        );
    }

    #[test]
    fn test_legacy_rma_records_are_noops() {
        let fx = fixture();
        let factory = MpiEventFactory;
        let mut reader = reader(&fx, &factory, FORMAT_VERSION);
        reader
            .handle(&R::RmaPutEnd { location: 0, time: 1.0, source: 0, rma: 1 })
            .unwrap();
        reader
            .handle(&R::RmaGetStart { location: 0, time: 2.0, target: 0, rma: 1, bytes: 8 })
            .unwrap();
        let trace = reader.finish().unwrap();
        assert!(trace.is_empty());
    }
}
