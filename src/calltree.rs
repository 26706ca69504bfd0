//! Call-path definitions.
//!
//! A call path identifies a unique (region, callsite, parent) combination
//! encountered during execution. The call tree owns all call paths in an
//! id-indexed arena; parent/child links are ids into that arena, so the
//! tree survives a pack/unpack round trip without fixups.

use crate::defs::{CallpathId, CallsiteId, GlobalDefs, RegionId};
use crate::error::{Result, TraceError};
use crate::idmap::NO_ID;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Callpath {
    pub id: CallpathId,
    pub region: RegionId,
    pub callsite: Option<CallsiteId>,
    pub parent: Option<CallpathId>,
    children: Vec<CallpathId>,
}

impl Callpath {
    pub fn children(&self) -> &[CallpathId] {
        &self.children
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallTree {
    callpaths: Vec<Callpath>,
    roots: Vec<CallpathId>,
    #[serde(skip)]
    modified: bool,
}

impl CallTree {
    pub fn new() -> CallTree {
        CallTree::default()
    }

    pub fn num_callpaths(&self) -> u32 {
        self.callpaths.len() as u32
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    pub fn callpath(&self, id: CallpathId) -> Result<&Callpath> {
        self.callpaths
            .get(id.0 as usize)
            .ok_or(TraceError::UnknownId {
                category: "Callpath",
                id: id.0,
            })
    }

    pub fn callpaths(&self) -> std::slice::Iter<'_, Callpath> {
        self.callpaths.iter()
    }

    pub fn roots(&self) -> &[CallpathId] {
        &self.roots
    }

    /// Looks up the call path for (region, callsite) among the children of
    /// `parent`, or among the roots if `parent` is `None`.
    pub fn find_callpath(
        &self,
        region: RegionId,
        callsite: Option<CallsiteId>,
        parent: Option<CallpathId>,
    ) -> Option<CallpathId> {
        let candidates = match parent {
            Some(parent) => self.callpaths[parent.0 as usize].children(),
            None => self.roots.as_slice(),
        };
        candidates
            .iter()
            .copied()
            .find(|id| {
                let path = &self.callpaths[id.0 as usize];
                path.region == region && path.callsite == callsite
            })
    }

    /// Finds the call path for (region, callsite, parent), creating it
    /// with the next sequential id if it does not exist yet. This is the
    /// sole source of call-tree growth during trace reading.
    pub fn get_callpath(
        &mut self,
        region: RegionId,
        callsite: Option<CallsiteId>,
        parent: Option<CallpathId>,
    ) -> CallpathId {
        if let Some(existing) = self.find_callpath(region, callsite, parent) {
            return existing;
        }

        let id = CallpathId(self.callpaths.len() as u32);
        self.callpaths.push(Callpath {
            id,
            region,
            callsite,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => self.callpaths[parent.0 as usize].children.push(id),
            None => self.roots.push(id),
        }
        self.modified = true;
        id
    }

    /// Bulk insertion path used when deserializing; ids must arrive in
    /// strictly sequential order.
    pub fn add_callpath(
        &mut self,
        id: CallpathId,
        region: RegionId,
        callsite: Option<CallsiteId>,
        parent: Option<CallpathId>,
    ) -> Result<()> {
        if id.0 as usize != self.callpaths.len() {
            return Err(TraceError::InvalidArgument(format!(
                "call paths must be inserted in order (got {}, expected {})",
                id.0,
                self.callpaths.len()
            )));
        }
        if let Some(parent) = parent {
            if parent.0 >= id.0 {
                return Err(TraceError::InvalidArgument(format!(
                    "call path {} references undefined parent {}",
                    id.0, parent.0
                )));
            }
        }
        self.callpaths.push(Callpath {
            id,
            region,
            callsite,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => self.callpaths[parent.0 as usize].children.push(id),
            None => self.roots.push(id),
        }
        self.modified = true;
        Ok(())
    }

    /// Folds another tree's structure into this one. Walking the other
    /// tree top-down guarantees that a node's parent has already been
    /// mapped, so identical (region, callsite, equivalent-parent) triples
    /// fuse and structurally new ones are appended.
    pub fn merge(&mut self, other: &CallTree) {
        let mut idmap: Vec<CallpathId> = Vec::with_capacity(other.callpaths.len());
        for current in &other.callpaths {
            debug_assert!(current.parent.map_or(true, |p| p.0 < current.id.0));
            let parent = current.parent.map(|p| idmap[p.0 as usize]);
            let path = self.get_callpath(current.region, current.callsite, parent);
            idmap.push(path);
        }
    }

    /// Flattens the tree into a byte buffer: entry count followed by one
    /// (region, callsite-or-NO_ID, parent-or-NO_ID) triple per call path,
    /// in id order, all little-endian u32.
    pub fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(4 + self.callpaths.len() * 12);
        buffer.extend_from_slice(&(self.callpaths.len() as u32).to_le_bytes());
        for path in &self.callpaths {
            buffer.extend_from_slice(&path.region.0.to_le_bytes());
            let callsite = path.callsite.map_or(NO_ID, |c| c.0);
            buffer.extend_from_slice(&callsite.to_le_bytes());
            let parent = path.parent.map_or(NO_ID, |p| p.0);
            buffer.extend_from_slice(&parent.to_le_bytes());
        }
        buffer
    }

    /// Reconstructs a tree from a packed buffer, resolving region and
    /// callsite references against `defs`.
    pub fn unpack(buffer: &[u8], defs: &GlobalDefs) -> Result<CallTree> {
        let mut pos = 0usize;
        let count = read_u32(buffer, &mut pos)?;
        let mut tree = CallTree::new();
        for id in 0..count {
            let region = read_u32(buffer, &mut pos)?;
            let callsite = read_u32(buffer, &mut pos)?;
            let parent = read_u32(buffer, &mut pos)?;

            let region = RegionId(region);
            defs.region(region)?;
            let callsite = if callsite == NO_ID {
                None
            } else {
                let callsite = CallsiteId(callsite);
                defs.callsite(callsite)?;
                Some(callsite)
            };
            let parent = if parent == NO_ID {
                None
            } else {
                Some(CallpathId(parent))
            };
            tree.add_callpath(CallpathId(id), region, callsite, parent)?;
        }
        tree.set_modified(false);
        Ok(tree)
    }
}

fn read_u32(buffer: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = buffer
        .get(*pos..*pos + 4)
        .ok_or_else(|| TraceError::Malformed("truncated call-tree buffer".into()))?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}
