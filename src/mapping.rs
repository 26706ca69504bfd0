//! Per-location mapping tables.
//!
//! One location's section of the shared mapping file yields up to six
//! identifier maps (locations, regions, call sites, groups, communicators,
//! RMA windows) and a two-point linear time correction. A missing map
//! means the trace was recorded with global identifiers already, so the
//! identity mapping applies.

use log::debug;

use crate::error::{Result, TraceError};
use crate::event::Timestamp;
use crate::idmap::{IdMap, IdMapMode, NO_ID};
use crate::serialize::{DefRecord, IdMapCategory, IdMapModeTag};

#[derive(Debug)]
pub struct MappingTable {
    section_rank: Option<u32>,
    offset_count: usize,
    local_time: [f64; 2],
    time_offset: [f64; 2],
    time_correction: bool,
    location_map: Option<IdMap>,
    region_map: Option<IdMap>,
    callsite_map: Option<IdMap>,
    group_map: Option<IdMap>,
    communicator_map: Option<IdMap>,
    window_map: Option<IdMap>,
}

impl MappingTable {
    pub fn new() -> MappingTable {
        MappingTable {
            section_rank: None,
            offset_count: 0,
            local_time: [0.0, 1.0],
            time_offset: [0.0, 0.0],
            time_correction: true,
            location_map: None,
            region_map: None,
            callsite_map: None,
            group_map: None,
            communicator_map: None,
            window_map: None,
        }
    }

    pub fn set_time_correction(&mut self, enabled: bool) {
        self.time_correction = enabled;
    }

    pub fn section_rank(&self) -> Option<u32> {
        self.section_rank
    }

    /// Consumes one mapping-file record. Definition records that do not
    /// concern the mapping pass are ignored; the shared file may contain
    /// sections for many ranks back to back.
    pub fn handle_def_record(&mut self, record: &DefRecord) -> Result<()> {
        match record {
            DefRecord::MapSection { rank } => {
                self.section_rank = Some(*rank);
                Ok(())
            }
            DefRecord::TimeOffset { time, offset } => {
                if self.offset_count > 1 {
                    return Err(TraceError::InvalidArgument(
                        "found more than two time-offset records".into(),
                    ));
                }
                self.local_time[self.offset_count] = *time;
                self.time_offset[self.offset_count] = *offset;
                self.offset_count += 1;
                Ok(())
            }
            DefRecord::IdMap {
                category,
                mode,
                values,
            } => self.build_id_map(*category, *mode, values),
            _ => Ok(()),
        }
    }

    fn build_id_map(
        &mut self,
        category: IdMapCategory,
        mode: IdMapModeTag,
        values: &[u32],
    ) -> Result<()> {
        let slot = match category {
            IdMapCategory::Location => &mut self.location_map,
            IdMapCategory::Region => &mut self.region_map,
            IdMapCategory::Callsite => &mut self.callsite_map,
            IdMapCategory::Group => &mut self.group_map,
            IdMapCategory::Communicator => &mut self.communicator_map,
            IdMapCategory::Window => &mut self.window_map,
            // Ignore call-path mapping for backwards compatibility
            IdMapCategory::Callpath => {
                debug!("ignoring call-path id map (pre-unification trace)");
                return Ok(());
            }
        };
        if slot.is_some() {
            return Err(TraceError::InvalidArgument(format!(
                "id map for {:?} already defined",
                category
            )));
        }

        let map = match mode {
            IdMapModeTag::Dense => {
                let mut map = IdMap::new(IdMapMode::Dense, values.len());
                for (index, global) in values.iter().enumerate() {
                    map.add(index as u32, *global)?;
                }
                map
            }
            IdMapModeTag::Sparse => {
                if values.len() % 2 != 0 {
                    return Err(TraceError::Malformed(format!(
                        "sparse id map for {:?} has odd entry count {}",
                        category,
                        values.len()
                    )));
                }
                let mut map = IdMap::new(IdMapMode::Sparse, values.len() / 2);
                for pair in values.chunks_exact(2) {
                    map.add(pair[0], pair[1])?;
                }
                map
            }
        };
        *slot = Some(map);
        Ok(())
    }

    // --- Mapping routines -----------------------------------------------

    /// Applies the two-point linear time correction. The offset records
    /// bracket the measurement, so the sample times normally differ; a
    /// degenerate pair falls back to a pure offset shift.
    pub fn map_timestamp(&self, time: f64) -> Timestamp {
        if !self.time_correction {
            return Timestamp(time);
        }
        let dt = self.local_time[1] - self.local_time[0];
        let slope = if dt == 0.0 {
            0.0
        } else {
            (self.time_offset[1] - self.time_offset[0]) / dt
        };
        Timestamp(time + slope * (time - self.local_time[0]) + self.time_offset[0])
    }

    pub fn map_location_id(&self, id: u32) -> Result<u32> {
        find_id(&self.location_map, id, "Location")
    }

    pub fn map_region_id(&self, id: u32) -> Result<u32> {
        find_id(&self.region_map, id, "Region")
    }

    pub fn map_callsite_id(&self, id: u32) -> Result<u32> {
        find_id(&self.callsite_map, id, "Callsite")
    }

    pub fn map_group_id(&self, id: u32) -> Result<u32> {
        find_id(&self.group_map, id, "GroupingSet")
    }

    pub fn map_communicator_id(&self, id: u32) -> Result<u32> {
        find_id(&self.communicator_map, id, "Communicator")
    }

    pub fn map_window_id(&self, id: u32) -> Result<u32> {
        find_id(&self.window_map, id, "RmaWindow")
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        MappingTable::new()
    }
}

fn find_id(map: &Option<IdMap>, id: u32, category: &'static str) -> Result<u32> {
    let Some(map) = map else {
        // No map for this category: identity mapping
        return Ok(id);
    };
    let result = map.get(id);
    if result == NO_ID {
        return Err(TraceError::UnknownId { category, id });
    }
    Ok(result)
}
