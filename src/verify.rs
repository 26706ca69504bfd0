//! Call-tree verification.
//!
//! After a location's event stream has been reconstructed, the shared call
//! tree is checked for completeness: replaying the enter/leave sequence
//! creates any call path the global definitions were missing (lazy region
//! discovery means different processes may have seen different paths).
//! The tree's modification flag afterwards tells whether the distributed
//! unification has to run at all.

use crate::defs::GlobalDefs;
use crate::error::{Result, TraceError};
use crate::event::{EventKind, LocalTrace};

/// Extends the process-local call tree with every call path occurring in
/// `trace`, and records the location's first timestamp as a candidate for
/// the global time origin.
pub fn verify_call_tree(defs: &mut GlobalDefs, trace: &mut LocalTrace) -> Result<()> {
    if let Some(first) = trace.first_timestamp() {
        defs.update_global_offset(first.0);
    }

    if rectify_flush_order(defs, trace) {
        defs.call_tree_mut().set_modified(true);
    }

    let mut current = None;
    let mut depth = 0i64;
    for index in 0..trace.len() {
        let kind = trace.events()[index].kind.clone();
        match kind {
            EventKind::Enter { region } => {
                current = Some(defs.call_tree_mut().get_callpath(region, None, current));
                depth += 1;
            }
            EventKind::EnterCallsite { callsite, region } => {
                current = Some(
                    defs.call_tree_mut()
                        .get_callpath(region, Some(callsite), current),
                );
                depth += 1;
            }
            EventKind::Leave { .. } => {
                depth -= 1;
                let Some(path) = current else {
                    return Err(TraceError::Unbalanced("too many EXITs"));
                };
                current = defs.call_tree().callpath(path)?.parent;
            }
            _ => {}
        }
    }

    if depth != 0 || current.is_some() {
        return Err(TraceError::Unbalanced("too many ENTERs"));
    }
    Ok(())
}

/// Buffer-flush events are written when the measurement buffer fills, so
/// their timestamps may overlap events recorded before the flush. Bubble
/// each flush enter/leave past every later event with an earlier or equal
/// timestamp, restoring per-location chronological order.
fn rectify_flush_order(defs: &GlobalDefs, trace: &mut LocalTrace) -> bool {
    let Some(flushing) = defs.flushing_region() else {
        return false;
    };
    let mut edited = false;
    let events = trace.events_mut();
    for index in (0..events.len()).rev() {
        let is_flush = match &events[index].kind {
            EventKind::Enter { region } | EventKind::Leave { region } => *region == flushing,
            _ => false,
        };
        if !is_flush {
            continue;
        }
        let time = events[index].time;
        let mut current = index;
        while current + 1 < events.len() && events[current + 1].time.0 <= time.0 {
            events.swap(current, current + 1);
            current += 1;
            edited = true;
        }
    }
    edited
}
