//! Trace archive reading.
//!
//! An archive directory holds one global definition container
//! (`defs.uni`), an optional shared mapping container (`maps.uni`, one
//! section per rank) and one event container per rank (`rank<N>.uni`)
//! carrying the interleaved event streams of that rank's locations.
//!
//! The definition pass runs once; the mapping and event passes run once
//! per location and are independent of each other, so they are fanned out
//! across worker threads with one reader per location writing into its own
//! trace buffer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nonmax::NonMaxU32;
use rayon::prelude::*;

use crate::defs::{
    CallingContext, CallingContextId, Callsite, CallsiteId, CallpathId, CartDimension,
    CartDimensionId, CartTopology, CartTopologyId, CommId, Communicator, GlobalDefs, GroupingSet,
    GroupingSetId, GroupingSetKind, Location, LocationGroup, LocationGroupId, LocationId, Metric,
    MetricId, Paradigm, Region, RegionId, RegionRole, RmaWindow, SourceLocation, SourceLocationId,
    StringDef, StringId, SystemNode, SystemNodeId, WindowId,
};
use crate::error::{Result, TraceError};
use crate::event::LocalTrace;
use crate::idmap::NO_ID;
use crate::mapping::MappingTable;
use crate::reconstruct::{AnalysisContext, EventReader};
use crate::serialize::{Decoder, DefRecord};
use crate::verify::verify_call_tree;

pub const DEFS_FILE: &str = "defs.uni";
pub const MAPS_FILE: &str = "maps.uni";

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub time_correction: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            time_correction: true,
        }
    }
}

/// One opened trace archive.
pub struct Archive {
    path: PathBuf,
    version: u32,
    /// Byte offset of each rank's section in the shared mapping file.
    file_offsets: Vec<u32>,
    /// Communicator id of rank 0's OpenMP thread team; the team of rank
    /// `r` is `offset + r`.
    omp_team_offset: Option<u32>,
}

impl Archive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Archive> {
        let path = path.as_ref().to_path_buf();
        if !path.join(DEFS_FILE).is_file() {
            return Err(TraceError::Malformed(format!(
                "{} is not a trace archive (missing {})",
                path.display(),
                DEFS_FILE
            )));
        }
        Ok(Archive {
            path,
            version: 0,
            file_offsets: Vec::new(),
            omp_team_offset: None,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn thread_team(&self, rank: u32) -> Option<CommId> {
        self.omp_team_offset.map(|offset| CommId(offset + rank))
    }

    /// Reads the global definition container and finalizes the store
    /// (validation, lookup optimization, synthetic regions).
    pub fn read_definitions(&mut self) -> Result<GlobalDefs> {
        let mut decoder = Decoder::open(self.path.join(DEFS_FILE))?;
        self.version = decoder.version();

        let mut defs = GlobalDefs::new();
        let mut builder = DefsBuilder::new();
        while let Some(record) = decoder.next_def()? {
            builder.handle(&mut defs, &record)?;
        }
        self.file_offsets = builder.file_offsets;

        if builder.saw_openmp && defs.comm_location_set(Paradigm::OpenMp).is_err() {
            self.reconstruct_omp_comm_sets(&mut defs);
        }

        defs.validate()?;
        defs.setup()?;
        info!(
            "definitions: {} locations in {} groups, {} regions",
            defs.num_locations(),
            defs.num_location_groups(),
            defs.num_regions()
        );
        Ok(defs)
    }

    /// Reads one rank's section of the shared mapping file. A missing
    /// mapping file means the trace is already globalized and every map is
    /// the identity.
    pub fn read_id_maps(&self, rank: u32, options: &ArchiveOptions) -> Result<MappingTable> {
        let mut table = MappingTable::new();
        table.set_time_correction(options.time_correction);

        let path = self.path.join(MAPS_FILE);
        if !path.is_file() {
            debug!("no mapping file found, assuming already globalized trace");
            return Ok(table);
        }

        let mut decoder = Decoder::open(&path)?;
        if let Some(offset) = self.file_offsets.get(rank as usize).copied() {
            decoder.seek(offset)?;
        }

        // The first record must open this rank's section; anything else
        // means the offset table and the mapping file disagree
        match decoder.next_def()? {
            Some(record @ DefRecord::MapSection { .. }) => {
                table.handle_def_record(&record)?;
            }
            _ => {
                return Err(TraceError::Inconsistent(
                    "found unrelated mapping file section".into(),
                ));
            }
        }
        if table.section_rank() != Some(rank) {
            return Err(TraceError::Inconsistent(
                "found unrelated mapping file section".into(),
            ));
        }

        while let Some(record) = decoder.next_def()? {
            if let DefRecord::MapSection { rank: next } = &record {
                if *next != rank {
                    break;
                }
            }
            table.handle_def_record(&record)?;
        }
        Ok(table)
    }

    /// Decodes one location's event stream into a trace buffer. Records of
    /// sibling locations stored in the same rank container are skipped by
    /// the reader.
    pub fn read_trace(
        &self,
        defs: &GlobalDefs,
        ctx: &AnalysisContext,
        location: &Location,
        table: &MappingTable,
    ) -> Result<LocalTrace> {
        let rank = defs.location_group(location.group)?.rank;
        let path = self.path.join(format!("rank{}.uni", rank));
        let mut decoder = Decoder::open(&path)?;

        let mut reader = EventReader::new(
            defs,
            table,
            ctx.factory(),
            decoder.version(),
            location.id,
            rank,
            self.thread_team(rank),
        );
        while let Some(record) = decoder.next_event()? {
            reader.handle(&record)?;
        }
        reader.finish()
    }

    /// Traces recorded before communication sets existed carry no OpenMP
    /// team definitions; rebuild them from the location-group structure:
    /// one communication location set over all locations plus one
    /// communication set and communicator per location group.
    fn reconstruct_omp_comm_sets(&mut self, defs: &mut GlobalDefs) {
        let groups: Vec<Vec<LocationId>> = defs
            .location_groups()
            .map(|group| group.locations.clone())
            .collect();

        let mut global_ranks = BTreeMap::new();
        let mut members = Vec::with_capacity(defs.num_locations());
        for group in &groups {
            for location in group {
                global_ranks.insert(*location, members.len() as u64);
                members.push(location.0 as u64);
            }
        }

        defs.add_grouping_set(GroupingSet {
            id: GroupingSetId(defs.num_grouping_sets() as u32),
            name: None,
            kind: GroupingSetKind::CommLocationSet,
            paradigm: Paradigm::OpenMp,
            members,
        });

        self.omp_team_offset = Some(defs.num_communicators() as u32);
        for group in &groups {
            let team: Vec<u64> = group
                .iter()
                .map(|location| global_ranks[location])
                .collect();
            let comm_set = GroupingSetId(defs.num_grouping_sets() as u32);
            defs.add_grouping_set(GroupingSet {
                id: comm_set,
                name: None,
                kind: GroupingSetKind::CommSet,
                paradigm: Paradigm::OpenMp,
                members: team,
            });
            defs.add_communicator(Communicator {
                id: CommId(defs.num_communicators() as u32),
                name: None,
                comm_set,
                parent: None,
            });
        }
    }
}

/// Reconstructed state of one process: the global definitions and one
/// trace buffer per location, ready for unification and replay.
#[derive(Debug)]
pub struct Analysis {
    pub defs: GlobalDefs,
    pub traces: Vec<LocalTrace>,
    pub version: u32,
}

/// Runs the whole per-process ingestion: definitions, per-location id
/// maps and event streams (in parallel over locations), the cross-thread
/// consistency checks, and the local call-tree verification walk.
pub fn read_archive<P: AsRef<Path>>(
    path: P,
    ctx: &AnalysisContext,
    options: &ArchiveOptions,
) -> Result<Analysis> {
    let mut archive = Archive::open(path)?;
    let mut defs = archive.read_definitions()?;

    // Every recorded process must have its rank container present
    for group in defs.location_groups() {
        let rank_file = archive.path.join(format!("rank{}.uni", group.rank));
        if !rank_file.is_file() {
            return Err(TraceError::Inconsistent(format!(
                "experiment recorded {} processes but {} is missing",
                defs.num_location_groups(),
                rank_file.display()
            )));
        }
    }

    let locations: Vec<Location> = defs.locations().cloned().collect();
    info!("reading {} location traces", locations.len());
    let mut traces = locations
        .par_iter()
        .map(|location| {
            let rank = defs.location_group(location.group)?.rank;
            let table = archive.read_id_maps(rank, options)?;
            archive.read_trace(&defs, ctx, location, &table)
        })
        .collect::<Result<Vec<LocalTrace>>>()?;

    check_thread_consistency(&defs, &traces)?;

    for trace in &mut traces {
        verify_call_tree(&mut defs, trace)?;
    }

    Ok(Analysis {
        defs,
        traces,
        version: archive.version,
    })
}

/// Cross-thread checks after reading: inter-process communication is the
/// master thread's privilege, and all threads of one process must agree
/// on the number of parallel regions they entered.
fn check_thread_consistency(defs: &GlobalDefs, traces: &[LocalTrace]) -> Result<()> {
    let mut parallel_counts: BTreeMap<LocationGroupId, u32> = BTreeMap::new();
    for trace in traces {
        let location = defs.location(trace.location)?;
        if location.thread != 0 && trace.mpi_region_enters != 0 {
            return Err(TraceError::Inconsistent(format!(
                "{} MPI region enters on non-master thread location {}",
                trace.mpi_region_enters, location.id
            )));
        }
        match parallel_counts.get(&location.group) {
            Some(count) if *count != trace.omp_parallel_enters => {
                return Err(TraceError::Inconsistent(format!(
                    "mismatching OpenMP parallel region counts within location group {}",
                    location.group.0
                )));
            }
            Some(_) => {}
            None => {
                parallel_counts.insert(location.group, trace.omp_parallel_enters);
            }
        }
    }
    Ok(())
}

/// Builds global definitions from decoded definition records.
struct DefsBuilder {
    saw_openmp: bool,
    file_offsets: Vec<u32>,
}

impl DefsBuilder {
    fn new() -> DefsBuilder {
        DefsBuilder {
            saw_openmp: false,
            file_offsets: Vec::new(),
        }
    }

    fn handle(&mut self, defs: &mut GlobalDefs, record: &DefRecord) -> Result<()> {
        match record {
            DefRecord::String { id, value } => {
                defs.add_string(StringDef {
                    id: StringId(*id),
                    value: value.clone(),
                });
            }
            DefRecord::SystemNode {
                id,
                name,
                class,
                parent,
            } => {
                defs.add_system_node(SystemNode {
                    id: SystemNodeId(*id),
                    name: StringId(*name),
                    class: StringId(*class),
                    parent: opt(*parent).map(SystemNodeId),
                });
            }
            DefRecord::LocationGroup {
                id,
                name,
                rank,
                parent,
            } => {
                defs.add_location_group(LocationGroup {
                    id: LocationGroupId(*id),
                    name: StringId(*name),
                    rank: *rank,
                    parent: SystemNodeId(*parent),
                    locations: Vec::new(),
                });
            }
            DefRecord::Location {
                id,
                name,
                group,
                thread,
            } => {
                defs.add_location(Location {
                    id: LocationId(*id),
                    name: StringId(*name),
                    group: LocationGroupId(*group),
                    thread: *thread,
                })?;
            }
            DefRecord::Region {
                id,
                name,
                canonical_name,
                file,
                line,
                paradigm,
                role,
            } => {
                let paradigm = Paradigm::try_from(*paradigm).map_err(|_| {
                    TraceError::Malformed(format!("unknown region paradigm {}", paradigm))
                })?;
                let role = RegionRole::try_from(*role).map_err(|_| {
                    TraceError::Malformed(format!("unknown region role {}", role))
                })?;
                if paradigm == Paradigm::OpenMp {
                    self.saw_openmp = true;
                }
                defs.add_region(Region {
                    id: RegionId(*id),
                    name: StringId(*name),
                    canonical_name: StringId(*canonical_name),
                    file: opt(*file).map(StringId),
                    line: NonMaxU32::new(*line),
                    role,
                    paradigm,
                })?;
            }
            DefRecord::Callsite {
                id,
                file,
                line,
                callee,
            } => {
                defs.add_callsite(Callsite {
                    id: CallsiteId(*id),
                    file: StringId(*file),
                    line: *line,
                    callee: RegionId(*callee),
                });
            }
            DefRecord::Callpath {
                id,
                region,
                callsite,
                parent,
            } => {
                defs.call_tree_mut().add_callpath(
                    CallpathId(*id),
                    RegionId(*region),
                    opt(*callsite).map(CallsiteId),
                    opt(*parent).map(CallpathId),
                )?;
            }
            DefRecord::Group {
                id,
                name,
                kind,
                paradigm,
                members,
            } => {
                let kind = GroupingSetKind::try_from(*kind).map_err(|_| {
                    TraceError::Malformed(format!("unknown grouping set kind {}", kind))
                })?;
                let paradigm = Paradigm::try_from(*paradigm).map_err(|_| {
                    TraceError::Malformed(format!("unknown grouping set paradigm {}", paradigm))
                })?;
                defs.add_grouping_set(GroupingSet {
                    id: GroupingSetId(*id),
                    name: opt(*name).map(StringId),
                    kind,
                    paradigm,
                    members: members.clone(),
                });
            }
            DefRecord::Communicator {
                id,
                name,
                group,
                parent,
            } => {
                defs.add_communicator(Communicator {
                    id: CommId(*id),
                    name: opt(*name).map(StringId),
                    comm_set: GroupingSetId(*group),
                    parent: opt(*parent).map(CommId),
                });
            }
            DefRecord::Window { id, comm } => {
                defs.add_window(RmaWindow {
                    id: WindowId(*id),
                    comm: CommId(*comm),
                });
            }
            DefRecord::Metric { id, name } => {
                defs.add_metric(Metric {
                    id: MetricId(*id),
                    name: StringId(*name),
                });
            }
            DefRecord::CartTopology {
                id,
                comm,
                dimensions,
            } => {
                defs.add_cart_topology(CartTopology {
                    id: CartTopologyId(*id),
                    comm: opt(*comm).map(CommId),
                    dimensions: dimensions.iter().map(|d| CartDimensionId(*d)).collect(),
                });
            }
            DefRecord::CartDimension { id, size, periodic } => {
                defs.add_cart_dimension(CartDimension {
                    id: CartDimensionId(*id),
                    size: *size,
                    periodic: *periodic,
                });
            }
            DefRecord::SourceLocation { id, file, line } => {
                defs.add_source_location(SourceLocation {
                    id: SourceLocationId(*id),
                    file: StringId(*file),
                    line: NonMaxU32::new(*line),
                });
            }
            DefRecord::CallingContext {
                id,
                region,
                source,
                parent,
            } => {
                defs.add_calling_context(CallingContext {
                    id: CallingContextId(*id),
                    region: RegionId(*region),
                    source: opt(*source).map(SourceLocationId),
                    parent: opt(*parent).map(CallingContextId),
                });
            }
            DefRecord::MapFileOffset { rank, offset } => {
                let index = *rank as usize;
                if index >= self.file_offsets.len() {
                    self.file_offsets.resize(index + 1, 0);
                }
                self.file_offsets[index] = *offset;
            }
            DefRecord::MapSection { .. }
            | DefRecord::TimeOffset { .. }
            | DefRecord::IdMap { .. } => {
                return Err(TraceError::Malformed(
                    "mapping record in definition container".into(),
                ));
            }
        }
        Ok(())
    }
}

fn opt(id: u32) -> Option<u32> {
    if id == NO_ID {
        None
    } else {
        Some(id)
    }
}
