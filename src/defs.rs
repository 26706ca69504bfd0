//! Global definition storage.
//!
//! Every definition category has its own numeric identifier space starting
//! at 0. Categories are either flat (indexed container) or tree-shaped
//! (parent-linked items of the same category). All containers are arenas:
//! they exclusively own their items, and lookups hand out references or
//! plain ids, never ownership.

use std::fmt;

use nonmax::NonMaxU32;
use num_enum::TryFromPrimitive;
use serde::Serialize;

use crate::calltree::CallTree;
use crate::error::{Result, TraceError};

macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
        )]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(StringId);
define_id!(RegionId);
define_id!(CallsiteId);
define_id!(CallpathId);
define_id!(LocationId);
define_id!(LocationGroupId);
define_id!(SystemNodeId);
define_id!(GroupingSetId);
define_id!(CommId);
define_id!(WindowId);
define_id!(MetricId);
define_id!(CartTopologyId);
define_id!(CartDimensionId);
define_id!(SourceLocationId);
define_id!(CallingContextId);

// Make sure this is up to date with the tag values in serialize.rs
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum Paradigm {
    Unknown = 0,
    User = 1,
    Compiler = 2,
    OpenMp = 3,
    Mpi = 4,
    MeasurementSystem = 5,
    Pthread = 6,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum RegionRole {
    Unknown = 0,
    Function = 1,
    Wrapper = 2,
    UserRegion = 3,
    Loop = 4,
    Barrier = 5,
    Coll12N = 6,
    CollN21 = 7,
    CollN2N = 8,
    CollScan = 9,
    CollRma = 10,
    Parallel = 11,
    Task = 12,
    Artificial = 13,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum GroupingSetKind {
    Group = 0,
    CommLocationSet = 1,
    CommSet = 2,
}

#[derive(Debug, Clone, Serialize)]
pub struct StringDef {
    pub id: StringId,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Region {
    pub id: RegionId,
    pub name: StringId,
    pub canonical_name: StringId,
    pub file: Option<StringId>,
    pub line: Option<NonMaxU32>,
    pub role: RegionRole,
    pub paradigm: Paradigm,
}

impl Region {
    pub fn is_mpi_collective(&self) -> bool {
        self.paradigm == Paradigm::Mpi
            && matches!(
                self.role,
                RegionRole::Barrier
                    | RegionRole::Coll12N
                    | RegionRole::CollN21
                    | RegionRole::CollN2N
                    | RegionRole::CollScan
            )
    }

    pub fn is_mpi_rma_collective(&self) -> bool {
        self.paradigm == Paradigm::Mpi && self.role == RegionRole::CollRma
    }

    pub fn is_omp_parallel(&self) -> bool {
        self.paradigm == Paradigm::OpenMp && self.role == RegionRole::Parallel
    }

    pub fn is_mpi_api(&self) -> bool {
        self.paradigm == Paradigm::Mpi
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Callsite {
    pub id: CallsiteId,
    pub file: StringId,
    pub line: u32,
    pub callee: RegionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemNode {
    pub id: SystemNodeId,
    pub name: StringId,
    pub class: StringId,
    pub parent: Option<SystemNodeId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationGroup {
    pub id: LocationGroupId,
    pub name: StringId,
    pub rank: u32,
    pub parent: SystemNodeId,
    /// Member locations, in definition order. Amended as locations are read.
    pub locations: Vec<LocationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub id: LocationId,
    pub name: StringId,
    pub group: LocationGroupId,
    pub thread: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupingSet {
    pub id: GroupingSetId,
    pub name: Option<StringId>,
    pub kind: GroupingSetKind,
    pub paradigm: Paradigm,
    /// For a communication set: `members[local_rank]` is the rank within
    /// the paradigm's communication location set. For the other kinds the
    /// members are global location ids.
    pub members: Vec<u64>,
}

impl GroupingSet {
    pub fn local_rank(&self, global_rank: u64) -> Option<u32> {
        self.members
            .iter()
            .position(|m| *m == global_rank)
            .map(|index| index as u32)
    }

    pub fn global_rank(&self, local_rank: u32) -> Option<u64> {
        self.members.get(local_rank as usize).copied()
    }

    pub fn num_ranks(&self) -> u32 {
        self.members.len() as u32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Communicator {
    pub id: CommId,
    pub name: Option<StringId>,
    pub comm_set: GroupingSetId,
    pub parent: Option<CommId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RmaWindow {
    pub id: WindowId,
    pub comm: CommId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub id: MetricId,
    pub name: StringId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartDimension {
    pub id: CartDimensionId,
    pub size: u32,
    pub periodic: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartTopology {
    pub id: CartTopologyId,
    pub comm: Option<CommId>,
    pub dimensions: Vec<CartDimensionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceLocation {
    pub id: SourceLocationId,
    pub file: StringId,
    pub line: Option<NonMaxU32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallingContext {
    pub id: CallingContextId,
    pub region: RegionId,
    pub source: Option<SourceLocationId>,
    pub parent: Option<CallingContextId>,
}

/// Definitions stored in a [`DefinitionContainer`] expose their numeric id.
pub trait Definition {
    fn ident(&self) -> u32;
}

macro_rules! impl_definition {
    ($type:ident) => {
        impl Definition for $type {
            fn ident(&self) -> u32 {
                self.id.0
            }
        }
    };
}

impl_definition!(StringDef);
impl_definition!(Region);
impl_definition!(Callsite);
impl_definition!(SystemNode);
impl_definition!(LocationGroup);
impl_definition!(Location);
impl_definition!(GroupingSet);
impl_definition!(Communicator);
impl_definition!(RmaWindow);
impl_definition!(Metric);
impl_definition!(CartDimension);
impl_definition!(CartTopology);
impl_definition!(SourceLocation);
impl_definition!(CallingContext);

/// Append-only arena for one definition category.
///
/// Items added with monotonically increasing ids starting at 0 keep the
/// container "compact" and lookups are direct indexing. Once ids arrive
/// out of order, lookups degrade to binary or linear search until
/// [`optimize_lookups`](DefinitionContainer::optimize_lookups) restores the
/// sorted order.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionContainer<T> {
    items: Vec<T>,
    #[serde(skip)]
    is_compact: bool,
    #[serde(skip)]
    is_sorted: bool,
}

impl<T: Definition> DefinitionContainer<T> {
    pub fn new() -> Self {
        DefinitionContainer {
            items: Vec::new(),
            is_compact: true,
            is_sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add(&mut self, item: T) {
        let next_compact_id = self.items.len() as u32;
        let last_id = self.items.last().map(|last| last.ident());
        let id = item.ident();
        self.items.push(item);

        if self.is_compact && id != next_compact_id {
            self.is_compact = false;
        }
        if !self.is_compact && self.is_sorted {
            if let Some(last) = last_id {
                if id < last {
                    self.is_sorted = false;
                }
            }
        }
    }

    pub fn by_id(&self, id: u32, category: &'static str) -> Result<&T> {
        self.index_of(id)
            .map(|index| &self.items[index])
            .ok_or(TraceError::UnknownId { category, id })
    }

    pub fn by_id_mut(&mut self, id: u32, category: &'static str) -> Result<&mut T> {
        self.index_of(id)
            .map(move |index| &mut self.items[index])
            .ok_or(TraceError::UnknownId { category, id })
    }

    pub fn by_index(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Sorts the items by id so subsequent lookups can use binary search.
    pub fn optimize_lookups(&mut self) {
        if !self.is_sorted {
            self.items.sort_by_key(|item| item.ident());
            self.is_sorted = true;
        }
    }

    pub fn ensure_unique_ids(&self, category: &'static str) -> Result<()> {
        let mut ids: Vec<u32> = self.items.iter().map(|item| item.ident()).collect();
        ids.sort();
        for pair in ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(TraceError::Inconsistent(format!(
                    "duplicate {} identifier {}",
                    category, pair[0]
                )));
            }
        }
        Ok(())
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        // Compact ids: direct lookup
        if self.is_compact {
            if (id as usize) < self.items.len() {
                return Some(id as usize);
            }
            return None;
        }

        // Sorted ids: binary search
        if self.is_sorted {
            return self
                .items
                .binary_search_by_key(&id, |item| item.ident())
                .ok();
        }

        // Fallback: linear search
        self.items.iter().position(|item| item.ident() == id)
    }
}

impl<T: Definition> Default for DefinitionContainer<T> {
    fn default() -> Self {
        DefinitionContainer::new()
    }
}

/// The in-memory collection of all global definition categories, plus the
/// call tree.
#[derive(Debug, Default, Serialize)]
pub struct GlobalDefs {
    strings: DefinitionContainer<StringDef>,
    regions: DefinitionContainer<Region>,
    callsites: DefinitionContainer<Callsite>,
    system_nodes: DefinitionContainer<SystemNode>,
    location_groups: DefinitionContainer<LocationGroup>,
    locations: DefinitionContainer<Location>,
    grouping_sets: DefinitionContainer<GroupingSet>,
    communicators: DefinitionContainer<Communicator>,
    windows: DefinitionContainer<RmaWindow>,
    metrics: DefinitionContainer<Metric>,
    cart_dimensions: DefinitionContainer<CartDimension>,
    cart_topologies: DefinitionContainer<CartTopology>,
    source_locations: DefinitionContainer<SourceLocation>,
    calling_contexts: DefinitionContainer<CallingContext>,
    call_tree: CallTree,

    pausing_region: Option<RegionId>,
    flushing_region: Option<RegionId>,
    task_root_region: Option<RegionId>,
    thread_root_region: Option<RegionId>,

    /// Process-local measurement time origin; replaced by the global
    /// minimum during unification.
    global_offset: f64,
}

impl GlobalDefs {
    pub fn new() -> GlobalDefs {
        GlobalDefs {
            global_offset: f64::INFINITY,
            ..GlobalDefs::default()
        }
    }

    // --- Insertion ------------------------------------------------------

    pub fn add_string(&mut self, item: StringDef) {
        self.strings.add(item);
    }

    /// Adds a region definition. Artificial regions with one of the
    /// reserved names double as the pausing/flushing/task/thread roots;
    /// defining one of those twice is a fatal inconsistency.
    pub fn add_region(&mut self, item: Region) -> Result<()> {
        let id = item.id;
        let special = if item.role == RegionRole::Artificial {
            Some(self.string(item.name)?.value.clone())
        } else {
            None
        };
        self.regions.add(item);
        match special.as_deref() {
            Some("MEASUREMENT OFF") => self.set_pausing_region(id)?,
            Some("TRACE BUFFER FLUSH") => self.set_flushing_region(id)?,
            Some("TASKS") => self.set_task_root_region(id)?,
            Some("THREADS") => self.set_thread_root_region(id)?,
            _ => {}
        }
        Ok(())
    }

    pub fn add_callsite(&mut self, item: Callsite) {
        self.callsites.add(item);
    }

    pub fn add_system_node(&mut self, item: SystemNode) {
        self.system_nodes.add(item);
    }

    pub fn add_location_group(&mut self, item: LocationGroup) {
        self.location_groups.add(item);
    }

    /// Adds a location and amends its parent group's member list.
    pub fn add_location(&mut self, item: Location) -> Result<()> {
        let group = self
            .location_groups
            .by_id_mut(item.group.0, "LocationGroup")?;
        group.locations.push(item.id);
        self.locations.add(item);
        Ok(())
    }

    pub fn add_grouping_set(&mut self, item: GroupingSet) {
        self.grouping_sets.add(item);
    }

    pub fn add_communicator(&mut self, item: Communicator) {
        self.communicators.add(item);
    }

    pub fn add_window(&mut self, item: RmaWindow) {
        self.windows.add(item);
    }

    pub fn add_metric(&mut self, item: Metric) {
        self.metrics.add(item);
    }

    pub fn add_cart_dimension(&mut self, item: CartDimension) {
        self.cart_dimensions.add(item);
    }

    pub fn add_cart_topology(&mut self, item: CartTopology) {
        self.cart_topologies.add(item);
    }

    pub fn add_source_location(&mut self, item: SourceLocation) {
        self.source_locations.add(item);
    }

    pub fn add_calling_context(&mut self, item: CallingContext) {
        self.calling_contexts.add(item);
    }

    /// Amendment: attach a communicator to an already-defined topology.
    pub fn assign_cart_communicator(
        &mut self,
        topology: CartTopologyId,
        comm: CommId,
    ) -> Result<()> {
        let topo = self.cart_topologies.by_id_mut(topology.0, "CartTopology")?;
        topo.comm = Some(comm);
        Ok(())
    }

    // --- Lookup ---------------------------------------------------------

    pub fn string(&self, id: StringId) -> Result<&StringDef> {
        self.strings.by_id(id.0, "String")
    }

    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions.by_id(id.0, "Region")
    }

    pub fn callsite(&self, id: CallsiteId) -> Result<&Callsite> {
        self.callsites.by_id(id.0, "Callsite")
    }

    pub fn system_node(&self, id: SystemNodeId) -> Result<&SystemNode> {
        self.system_nodes.by_id(id.0, "SystemNode")
    }

    pub fn location_group(&self, id: LocationGroupId) -> Result<&LocationGroup> {
        self.location_groups.by_id(id.0, "LocationGroup")
    }

    pub fn location(&self, id: LocationId) -> Result<&Location> {
        self.locations.by_id(id.0, "Location")
    }

    pub fn grouping_set(&self, id: GroupingSetId) -> Result<&GroupingSet> {
        self.grouping_sets.by_id(id.0, "GroupingSet")
    }

    pub fn communicator(&self, id: CommId) -> Result<&Communicator> {
        self.communicators.by_id(id.0, "Communicator")
    }

    pub fn window(&self, id: WindowId) -> Result<&RmaWindow> {
        self.windows.by_id(id.0, "RmaWindow")
    }

    pub fn metric(&self, id: MetricId) -> Result<&Metric> {
        self.metrics.by_id(id.0, "Metric")
    }

    pub fn cart_dimension(&self, id: CartDimensionId) -> Result<&CartDimension> {
        self.cart_dimensions.by_id(id.0, "CartDimension")
    }

    pub fn cart_topology(&self, id: CartTopologyId) -> Result<&CartTopology> {
        self.cart_topologies.by_id(id.0, "CartTopology")
    }

    pub fn source_location(&self, id: SourceLocationId) -> Result<&SourceLocation> {
        self.source_locations.by_id(id.0, "SourceLocation")
    }

    pub fn calling_context(&self, id: CallingContextId) -> Result<&CallingContext> {
        self.calling_contexts.by_id(id.0, "CallingContext")
    }

    pub fn num_strings(&self) -> usize {
        self.strings.len()
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    pub fn num_location_groups(&self) -> usize {
        self.location_groups.len()
    }

    pub fn num_grouping_sets(&self) -> usize {
        self.grouping_sets.len()
    }

    pub fn num_communicators(&self) -> usize {
        self.communicators.len()
    }

    pub fn locations(&self) -> std::slice::Iter<'_, Location> {
        self.locations.iter()
    }

    pub fn location_groups(&self) -> std::slice::Iter<'_, LocationGroup> {
        self.location_groups.iter()
    }

    pub fn regions(&self) -> std::slice::Iter<'_, Region> {
        self.regions.iter()
    }

    /// Communication location set for the given paradigm, if any.
    pub fn comm_location_set(&self, paradigm: Paradigm) -> Result<&GroupingSet> {
        self.grouping_sets
            .iter()
            .find(|set| {
                set.kind == GroupingSetKind::CommLocationSet && set.paradigm == paradigm
            })
            .ok_or_else(|| {
                TraceError::Inconsistent(format!(
                    "no communication location set defined for {:?}",
                    paradigm
                ))
            })
    }

    // --- Special regions ------------------------------------------------

    pub fn pausing_region(&self) -> Option<RegionId> {
        self.pausing_region
    }

    pub fn flushing_region(&self) -> Option<RegionId> {
        self.flushing_region
    }

    pub fn task_root_region(&self) -> Option<RegionId> {
        self.task_root_region
    }

    pub fn thread_root_region(&self) -> Option<RegionId> {
        self.thread_root_region
    }

    fn set_pausing_region(&mut self, region: RegionId) -> Result<()> {
        if self.pausing_region.is_some() {
            return Err(TraceError::Inconsistent(
                "duplicate definition of MEASUREMENT OFF region".into(),
            ));
        }
        self.pausing_region = Some(region);
        Ok(())
    }

    fn set_flushing_region(&mut self, region: RegionId) -> Result<()> {
        if self.flushing_region.is_some() {
            return Err(TraceError::Inconsistent(
                "duplicate definition of TRACE BUFFER FLUSH region".into(),
            ));
        }
        self.flushing_region = Some(region);
        Ok(())
    }

    fn set_task_root_region(&mut self, region: RegionId) -> Result<()> {
        if self.task_root_region.is_some() {
            return Err(TraceError::Inconsistent(
                "duplicate definition of TASKS region".into(),
            ));
        }
        self.task_root_region = Some(region);
        Ok(())
    }

    fn set_thread_root_region(&mut self, region: RegionId) -> Result<()> {
        if self.thread_root_region.is_some() {
            return Err(TraceError::Inconsistent(
                "duplicate definition of THREADS region".into(),
            ));
        }
        self.thread_root_region = Some(region);
        Ok(())
    }

    // --- Call tree ------------------------------------------------------

    pub fn call_tree(&self) -> &CallTree {
        &self.call_tree
    }

    pub fn call_tree_mut(&mut self) -> &mut CallTree {
        &mut self.call_tree
    }

    pub fn set_call_tree(&mut self, tree: CallTree) {
        self.call_tree = tree;
    }

    // --- Time origin ----------------------------------------------------

    pub fn global_offset(&self) -> f64 {
        self.global_offset
    }

    pub fn set_global_offset(&mut self, offset: f64) {
        self.global_offset = offset;
    }

    pub fn update_global_offset(&mut self, offset: f64) {
        if offset < self.global_offset {
            self.global_offset = offset;
        }
    }

    // --- Validation & setup ---------------------------------------------

    /// Checks that every category's identifiers are unique and that at
    /// most one communication location set exists per paradigm.
    pub fn validate(&self) -> Result<()> {
        self.strings.ensure_unique_ids("String")?;
        self.regions.ensure_unique_ids("Region")?;
        self.callsites.ensure_unique_ids("Callsite")?;
        self.system_nodes.ensure_unique_ids("SystemNode")?;
        self.location_groups.ensure_unique_ids("LocationGroup")?;
        self.locations.ensure_unique_ids("Location")?;
        self.grouping_sets.ensure_unique_ids("GroupingSet")?;
        self.communicators.ensure_unique_ids("Communicator")?;
        self.windows.ensure_unique_ids("RmaWindow")?;
        self.metrics.ensure_unique_ids("Metric")?;
        self.cart_dimensions.ensure_unique_ids("CartDimension")?;
        self.cart_topologies.ensure_unique_ids("CartTopology")?;
        self.source_locations.ensure_unique_ids("SourceLocation")?;
        self.calling_contexts.ensure_unique_ids("CallingContext")?;

        let mut seen = Vec::new();
        for set in self.grouping_sets.iter() {
            if set.kind != GroupingSetKind::CommLocationSet {
                continue;
            }
            if seen.contains(&set.paradigm) {
                return Err(TraceError::Inconsistent(format!(
                    "duplicate communication location set for {:?}",
                    set.paradigm
                )));
            }
            seen.push(set.paradigm);
        }
        Ok(())
    }

    /// Finalizes the store after the definition read phase: restores
    /// sorted lookup order, creates the synthetic regions if the trace did
    /// not define them, and clears the call-tree modification flag.
    pub fn setup(&mut self) -> Result<()> {
        self.strings.optimize_lookups();
        self.regions.optimize_lookups();
        self.callsites.optimize_lookups();
        self.system_nodes.optimize_lookups();
        self.location_groups.optimize_lookups();
        self.locations.optimize_lookups();
        self.grouping_sets.optimize_lookups();
        self.communicators.optimize_lookups();
        self.windows.optimize_lookups();
        self.metrics.optimize_lookups();
        self.cart_dimensions.optimize_lookups();
        self.cart_topologies.optimize_lookups();
        self.source_locations.optimize_lookups();
        self.calling_contexts.optimize_lookups();

        if self.pausing_region.is_none() {
            let region = self.create_artificial_region("MEASUREMENT OFF", Paradigm::User)?;
            self.pausing_region = Some(region);
        }
        if self.flushing_region.is_none() {
            let region =
                self.create_artificial_region("TRACE BUFFER FLUSH", Paradigm::MeasurementSystem)?;
            self.flushing_region = Some(region);
        }
        if self.task_root_region.is_none() {
            let region = self.create_artificial_region("TASKS", Paradigm::OpenMp)?;
            self.task_root_region = Some(region);
        }
        if self.thread_root_region.is_none() {
            let region = self.create_artificial_region("THREADS", Paradigm::Pthread)?;
            self.thread_root_region = Some(region);
        }

        self.call_tree.set_modified(false);
        Ok(())
    }

    fn create_artificial_region(&mut self, name: &str, paradigm: Paradigm) -> Result<RegionId> {
        let string_id = StringId(self.next_string_id());
        self.strings.add(StringDef {
            id: string_id,
            value: name.to_owned(),
        });

        let region_id = RegionId(self.next_region_id());
        self.regions.add(Region {
            id: region_id,
            name: string_id,
            canonical_name: string_id,
            file: None,
            line: None,
            role: RegionRole::Artificial,
            paradigm,
        });
        Ok(region_id)
    }

    fn next_string_id(&self) -> u32 {
        self.strings
            .iter()
            .map(|s| s.id.0 + 1)
            .max()
            .unwrap_or(0)
    }

    fn next_region_id(&self) -> u32 {
        self.regions
            .iter()
            .map(|r| r.id.0 + 1)
            .max()
            .unwrap_or(0)
    }
}
