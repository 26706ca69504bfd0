//! Legacy binary trace container decoding.
//!
//! A container file is an optionally gzip-compressed stream of framed
//! records: a `u8` type tag, a `u32` payload length and the payload
//! itself. All integers are little-endian, timestamps are `f64` seconds,
//! strings are NUL-terminated UTF-8. The file starts with an 8-byte magic,
//! a byte-order mark and the `u32` format version (`1000 * major + minor`);
//! streams older than version 1.8 carry global instead of
//! communicator-local peer ranks in several record kinds, which the event
//! reconstruction compensates for.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use nom::{
    bytes::complete::take_till,
    number::complete::{le_f64, le_u32, le_u64, le_u8},
    IResult,
};
use num_enum::TryFromPrimitive;

use crate::error::{Result, TraceError};

pub const MAGIC: &[u8; 8] = b"UNITRACE";
pub const FORMAT_VERSION: u32 = 1008;

/// First format version that stores communicator-local peer ranks.
pub const VERSION_LOCAL_RANKS: u32 = 1008;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum DefTag {
    String = 1,
    SystemNode = 2,
    LocationGroup = 3,
    Location = 4,
    Region = 5,
    Callsite = 6,
    Callpath = 7,
    Group = 8,
    Communicator = 9,
    Window = 10,
    Metric = 11,
    CartTopology = 12,
    CartDimension = 13,
    SourceLocation = 14,
    CallingContext = 15,
    MapFileOffset = 20,
    MapSection = 21,
    TimeOffset = 22,
    IdMap = 23,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventTag {
    Enter = 64,
    EnterCallsite = 65,
    Exit = 66,
    Attribute = 67,
    MpiSend = 68,
    MpiRecv = 69,
    MpiCollectiveExit = 70,
    MpiSendComplete = 71,
    MpiRecvRequest = 72,
    MpiRequestTested = 73,
    MpiCancelled = 74,
    MpiRmaPutStart = 75,
    MpiRmaPutEnd = 76,
    MpiRmaPutEndRemote = 77,
    MpiRmaGetStart = 78,
    MpiRmaGetStartRemote = 79,
    MpiRmaGetEnd = 80,
    MpiWinExit = 81,
    MpiWinCollectiveExit = 82,
    MpiWinLock = 83,
    MpiWinUnlock = 84,
    RmaPutStart = 85,
    RmaPutEnd = 86,
    RmaPutEndRemote = 87,
    RmaGetStart = 88,
    RmaGetStartRemote = 89,
    RmaGetEnd = 90,
    CollectiveExit = 91,
    Fork = 92,
    Join = 93,
    OmpAcquireLock = 94,
    OmpReleaseLock = 95,
    OmpCollectiveExit = 96,
    MeasurementOff = 97,
    MeasurementOn = 98,
    FlushStart = 99,
    FlushEnd = 100,
}

/// Identifier-map definition categories.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum IdMapCategory {
    Location = 0,
    Region = 1,
    Callsite = 2,
    Group = 3,
    Communicator = 4,
    Window = 5,
    Callpath = 6,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum IdMapModeTag {
    Dense = 0,
    Sparse = 1,
}

#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq)]
pub enum DefRecord {
    String { id: u32, value: String },
    SystemNode { id: u32, name: u32, class: u32, parent: u32 },
    LocationGroup { id: u32, name: u32, rank: u32, parent: u32 },
    Location { id: u32, name: u32, group: u32, thread: u32 },
    Region { id: u32, name: u32, canonical_name: u32, file: u32, line: u32, paradigm: u8, role: u8 },
    Callsite { id: u32, file: u32, line: u32, callee: u32 },
    Callpath { id: u32, region: u32, callsite: u32, parent: u32 },
    Group { id: u32, name: u32, kind: u8, paradigm: u8, members: Vec<u64> },
    Communicator { id: u32, name: u32, group: u32, parent: u32 },
    Window { id: u32, comm: u32 },
    Metric { id: u32, name: u32 },
    CartTopology { id: u32, comm: u32, dimensions: Vec<u32> },
    CartDimension { id: u32, size: u32, periodic: bool },
    SourceLocation { id: u32, file: u32, line: u32 },
    CallingContext { id: u32, region: u32, source: u32, parent: u32 },
    MapFileOffset { rank: u32, offset: u32 },
    MapSection { rank: u32 },
    TimeOffset { time: f64, offset: f64 },
    IdMap { category: IdMapCategory, mode: IdMapModeTag, values: Vec<u32> },
}

#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Enter { location: u32, time: f64, region: u32 },
    EnterCallsite { location: u32, time: f64, callsite: u32 },
    Exit { location: u32, time: f64 },
    Attribute { kind: u8, value: u64 },
    MpiSend { location: u32, time: f64, dest: u32, comm: u32, tag: u32, bytes: u32 },
    MpiRecv { location: u32, time: f64, source: u32, comm: u32, tag: u32 },
    MpiCollectiveExit { location: u32, time: f64, root: u32, comm: u32, sent: u32, received: u32 },
    MpiSendComplete { location: u32, time: f64, request: u32 },
    MpiRecvRequest { location: u32, time: f64, request: u32 },
    MpiRequestTested { location: u32, time: f64, request: u32 },
    MpiCancelled { location: u32, time: f64, request: u32 },
    MpiRmaPutStart { location: u32, time: f64, target: u32, window: u32, rma: u32, bytes: u32 },
    MpiRmaPutEnd { location: u32, time: f64, dest: u32, window: u32, rma: u32 },
    MpiRmaPutEndRemote { location: u32, time: f64, dest: u32, window: u32, rma: u32 },
    MpiRmaGetStart { location: u32, time: f64, dest: u32, window: u32, rma: u32, bytes: u32 },
    MpiRmaGetStartRemote { location: u32, time: f64, origin: u32, window: u32, rma: u32, bytes: u32 },
    MpiRmaGetEnd { location: u32, time: f64, source: u32, window: u32, rma: u32 },
    MpiWinExit { location: u32, time: f64, window: u32, group: u32, sync: bool },
    MpiWinCollectiveExit { location: u32, time: f64, window: u32 },
    MpiWinLock { location: u32, time: f64, peer: u32, window: u32, exclusive: bool },
    MpiWinUnlock { location: u32, time: f64, peer: u32, window: u32 },
    RmaPutStart { location: u32, time: f64, dest: u32, rma: u32, bytes: u32 },
    RmaPutEnd { location: u32, time: f64, source: u32, rma: u32 },
    RmaPutEndRemote { location: u32, time: f64, dest: u32, rma: u32 },
    RmaGetStart { location: u32, time: f64, target: u32, rma: u32, bytes: u32 },
    RmaGetStartRemote { location: u32, time: f64, target: u32, rma: u32, bytes: u32 },
    RmaGetEnd { location: u32, time: f64, source: u32, rma: u32 },
    CollectiveExit { location: u32, time: f64, root: u32, comm: u32, sent: u32, received: u32 },
    Fork { location: u32, time: f64 },
    Join { location: u32, time: f64 },
    OmpAcquireLock { location: u32, time: f64, lock: u32 },
    OmpReleaseLock { location: u32, time: f64, lock: u32 },
    OmpCollectiveExit { location: u32, time: f64 },
    MeasurementOff { location: u32, time: f64 },
    MeasurementOn { location: u32, time: f64 },
    FlushStart { location: u32, time: f64 },
    FlushEnd { location: u32, time: f64 },
}

impl EventRecord {
    /// Raw (unmapped) location id, if the record carries one.
    pub fn location(&self) -> Option<u32> {
        use EventRecord::*;
        match self {
            Attribute { .. } => None,
            Enter { location, .. }
            | EnterCallsite { location, .. }
            | Exit { location, .. }
            | MpiSend { location, .. }
            | MpiRecv { location, .. }
            | MpiCollectiveExit { location, .. }
            | MpiSendComplete { location, .. }
            | MpiRecvRequest { location, .. }
            | MpiRequestTested { location, .. }
            | MpiCancelled { location, .. }
            | MpiRmaPutStart { location, .. }
            | MpiRmaPutEnd { location, .. }
            | MpiRmaPutEndRemote { location, .. }
            | MpiRmaGetStart { location, .. }
            | MpiRmaGetStartRemote { location, .. }
            | MpiRmaGetEnd { location, .. }
            | MpiWinExit { location, .. }
            | MpiWinCollectiveExit { location, .. }
            | MpiWinLock { location, .. }
            | MpiWinUnlock { location, .. }
            | RmaPutStart { location, .. }
            | RmaPutEnd { location, .. }
            | RmaPutEndRemote { location, .. }
            | RmaGetStart { location, .. }
            | RmaGetStartRemote { location, .. }
            | RmaGetEnd { location, .. }
            | CollectiveExit { location, .. }
            | Fork { location, .. }
            | Join { location, .. }
            | OmpAcquireLock { location, .. }
            | OmpReleaseLock { location, .. }
            | OmpCollectiveExit { location, .. }
            | MeasurementOff { location, .. }
            | MeasurementOn { location, .. }
            | FlushStart { location, .. }
            | FlushEnd { location, .. } => Some(*location),
        }
    }
}

///
/// Binary parsers for basic types used in records
///

#[inline]
fn is_nul(chr: u8) -> bool {
    chr == 0
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, value) = take_till(is_nul)(input)?;
    let (input, _terminator) = le_u8(input)?;
    Ok((input, String::from_utf8_lossy(value).into_owned()))
}

fn parse_bool(input: &[u8]) -> IResult<&[u8], bool> {
    let (input, value) = le_u8(input)?;
    Ok((input, value != 0))
}

fn parse_u32_vec(input: &[u8]) -> IResult<&[u8], Vec<u32>> {
    let (mut input, count) = le_u32(input)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, value) = le_u32(input)?;
        values.push(value);
        input = rest;
    }
    Ok((input, values))
}

fn parse_u64_vec(input: &[u8]) -> IResult<&[u8], Vec<u64>> {
    let (mut input, count) = le_u32(input)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, value) = le_u64(input)?;
        values.push(value);
        input = rest;
    }
    Ok((input, values))
}

///
/// Binary parsers for definition records
///

fn parse_string_def(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, value) = parse_string(input)?;
    Ok((input, DefRecord::String { id, value }))
}
fn parse_system_node(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, class) = le_u32(input)?;
    let (input, parent) = le_u32(input)?;
    Ok((
        input,
        DefRecord::SystemNode {
            id,
            name,
            class,
            parent,
        },
    ))
}
fn parse_location_group(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, rank) = le_u32(input)?;
    let (input, parent) = le_u32(input)?;
    Ok((
        input,
        DefRecord::LocationGroup {
            id,
            name,
            rank,
            parent,
        },
    ))
}
fn parse_location(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, group) = le_u32(input)?;
    let (input, thread) = le_u32(input)?;
    Ok((
        input,
        DefRecord::Location {
            id,
            name,
            group,
            thread,
        },
    ))
}
fn parse_region(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, canonical_name) = le_u32(input)?;
    let (input, file) = le_u32(input)?;
    let (input, line) = le_u32(input)?;
    let (input, paradigm) = le_u8(input)?;
    let (input, role) = le_u8(input)?;
    Ok((
        input,
        DefRecord::Region {
            id,
            name,
            canonical_name,
            file,
            line,
            paradigm,
            role,
        },
    ))
}
fn parse_callsite(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, file) = le_u32(input)?;
    let (input, line) = le_u32(input)?;
    let (input, callee) = le_u32(input)?;
    Ok((
        input,
        DefRecord::Callsite {
            id,
            file,
            line,
            callee,
        },
    ))
}
fn parse_callpath(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, region) = le_u32(input)?;
    let (input, callsite) = le_u32(input)?;
    let (input, parent) = le_u32(input)?;
    Ok((
        input,
        DefRecord::Callpath {
            id,
            region,
            callsite,
            parent,
        },
    ))
}
fn parse_group(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, kind) = le_u8(input)?;
    let (input, paradigm) = le_u8(input)?;
    let (input, members) = parse_u64_vec(input)?;
    Ok((
        input,
        DefRecord::Group {
            id,
            name,
            kind,
            paradigm,
            members,
        },
    ))
}
fn parse_communicator(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    let (input, group) = le_u32(input)?;
    let (input, parent) = le_u32(input)?;
    Ok((
        input,
        DefRecord::Communicator {
            id,
            name,
            group,
            parent,
        },
    ))
}
fn parse_window(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, comm) = le_u32(input)?;
    Ok((input, DefRecord::Window { id, comm }))
}
fn parse_metric(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, name) = le_u32(input)?;
    Ok((input, DefRecord::Metric { id, name }))
}
fn parse_cart_topology(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, comm) = le_u32(input)?;
    let (input, dimensions) = parse_u32_vec(input)?;
    Ok((
        input,
        DefRecord::CartTopology {
            id,
            comm,
            dimensions,
        },
    ))
}
fn parse_cart_dimension(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, size) = le_u32(input)?;
    let (input, periodic) = parse_bool(input)?;
    Ok((input, DefRecord::CartDimension { id, size, periodic }))
}
fn parse_source_location(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, file) = le_u32(input)?;
    let (input, line) = le_u32(input)?;
    Ok((input, DefRecord::SourceLocation { id, file, line }))
}
fn parse_calling_context(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, id) = le_u32(input)?;
    let (input, region) = le_u32(input)?;
    let (input, source) = le_u32(input)?;
    let (input, parent) = le_u32(input)?;
    Ok((
        input,
        DefRecord::CallingContext {
            id,
            region,
            source,
            parent,
        },
    ))
}
fn parse_map_file_offset(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, rank) = le_u32(input)?;
    let (input, offset) = le_u32(input)?;
    Ok((input, DefRecord::MapFileOffset { rank, offset }))
}
fn parse_map_section(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, rank) = le_u32(input)?;
    Ok((input, DefRecord::MapSection { rank }))
}
fn parse_time_offset(input: &[u8]) -> IResult<&[u8], DefRecord> {
    let (input, time) = le_f64(input)?;
    let (input, offset) = le_f64(input)?;
    Ok((input, DefRecord::TimeOffset { time, offset }))
}
fn parse_id_map(input: &[u8]) -> IResult<&[u8], (u8, u8, Vec<u32>)> {
    let (input, category) = le_u8(input)?;
    let (input, mode) = le_u8(input)?;
    let (input, values) = parse_u32_vec(input)?;
    Ok((input, (category, mode, values)))
}

fn parse_def_payload(tag: DefTag, payload: &[u8]) -> Result<DefRecord> {
    if tag == DefTag::IdMap {
        let (rest, (category, mode, values)) =
            parse_id_map(payload).map_err(|_| malformed(tag as u8, "IdMap"))?;
        check_consumed(rest, tag as u8, "IdMap")?;
        let category = IdMapCategory::try_from(category)
            .map_err(|_| TraceError::Malformed(format!("unknown id-map category {}", category)))?;
        let mode = IdMapModeTag::try_from(mode)
            .map_err(|_| TraceError::Malformed(format!("unknown id-map mode {}", mode)))?;
        return Ok(DefRecord::IdMap {
            category,
            mode,
            values,
        });
    }

    let parser = match tag {
        DefTag::String => parse_string_def,
        DefTag::SystemNode => parse_system_node,
        DefTag::LocationGroup => parse_location_group,
        DefTag::Location => parse_location,
        DefTag::Region => parse_region,
        DefTag::Callsite => parse_callsite,
        DefTag::Callpath => parse_callpath,
        DefTag::Group => parse_group,
        DefTag::Communicator => parse_communicator,
        DefTag::Window => parse_window,
        DefTag::Metric => parse_metric,
        DefTag::CartTopology => parse_cart_topology,
        DefTag::CartDimension => parse_cart_dimension,
        DefTag::SourceLocation => parse_source_location,
        DefTag::CallingContext => parse_calling_context,
        DefTag::MapFileOffset => parse_map_file_offset,
        DefTag::MapSection => parse_map_section,
        DefTag::TimeOffset => parse_time_offset,
        DefTag::IdMap => unreachable!(),
    };
    let name = def_tag_name(tag);
    let (rest, record) = parser(payload).map_err(|_| malformed(tag as u8, name))?;
    check_consumed(rest, tag as u8, name)?;
    Ok(record)
}

fn def_tag_name(tag: DefTag) -> &'static str {
    match tag {
        DefTag::String => "String",
        DefTag::SystemNode => "SystemNode",
        DefTag::LocationGroup => "LocationGroup",
        DefTag::Location => "Location",
        DefTag::Region => "Region",
        DefTag::Callsite => "Callsite",
        DefTag::Callpath => "Callpath",
        DefTag::Group => "Group",
        DefTag::Communicator => "Communicator",
        DefTag::Window => "Window",
        DefTag::Metric => "Metric",
        DefTag::CartTopology => "CartTopology",
        DefTag::CartDimension => "CartDimension",
        DefTag::SourceLocation => "SourceLocation",
        DefTag::CallingContext => "CallingContext",
        DefTag::MapFileOffset => "MapFileOffset",
        DefTag::MapSection => "MapSection",
        DefTag::TimeOffset => "TimeOffset",
        DefTag::IdMap => "IdMap",
    }
}

///
/// Binary parsers for event records
///

macro_rules! event_parser {
    ($name:ident, $variant:ident, { $($field:ident : $parser:ident),* }) => {
        fn $name(input: &[u8]) -> IResult<&[u8], EventRecord> {
            let (input, location) = le_u32(input)?;
            let (input, time) = le_f64(input)?;
            $(let (input, $field) = $parser(input)?;)*
            Ok((
                input,
                EventRecord::$variant {
                    location,
                    time,
                    $($field,)*
                },
            ))
        }
    };
}

event_parser!(parse_enter, Enter, { region: le_u32 });
event_parser!(parse_enter_callsite, EnterCallsite, { callsite: le_u32 });
event_parser!(parse_exit, Exit, {});
event_parser!(parse_mpi_send, MpiSend, { dest: le_u32, comm: le_u32, tag: le_u32, bytes: le_u32 });
event_parser!(parse_mpi_recv, MpiRecv, { source: le_u32, comm: le_u32, tag: le_u32 });
event_parser!(parse_mpi_collective_exit, MpiCollectiveExit, { root: le_u32, comm: le_u32, sent: le_u32, received: le_u32 });
event_parser!(parse_mpi_send_complete, MpiSendComplete, { request: le_u32 });
event_parser!(parse_mpi_recv_request, MpiRecvRequest, { request: le_u32 });
event_parser!(parse_mpi_request_tested, MpiRequestTested, { request: le_u32 });
event_parser!(parse_mpi_cancelled, MpiCancelled, { request: le_u32 });
event_parser!(parse_mpi_rma_put_start, MpiRmaPutStart, { target: le_u32, window: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_mpi_rma_put_end, MpiRmaPutEnd, { dest: le_u32, window: le_u32, rma: le_u32 });
event_parser!(parse_mpi_rma_put_end_remote, MpiRmaPutEndRemote, { dest: le_u32, window: le_u32, rma: le_u32 });
event_parser!(parse_mpi_rma_get_start, MpiRmaGetStart, { dest: le_u32, window: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_mpi_rma_get_start_remote, MpiRmaGetStartRemote, { origin: le_u32, window: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_mpi_rma_get_end, MpiRmaGetEnd, { source: le_u32, window: le_u32, rma: le_u32 });
event_parser!(parse_mpi_win_exit, MpiWinExit, { window: le_u32, group: le_u32, sync: parse_bool });
event_parser!(parse_mpi_win_collective_exit, MpiWinCollectiveExit, { window: le_u32 });
event_parser!(parse_mpi_win_lock, MpiWinLock, { peer: le_u32, window: le_u32, exclusive: parse_bool });
event_parser!(parse_mpi_win_unlock, MpiWinUnlock, { peer: le_u32, window: le_u32 });
event_parser!(parse_rma_put_start, RmaPutStart, { dest: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_rma_put_end, RmaPutEnd, { source: le_u32, rma: le_u32 });
event_parser!(parse_rma_put_end_remote, RmaPutEndRemote, { dest: le_u32, rma: le_u32 });
event_parser!(parse_rma_get_start, RmaGetStart, { target: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_rma_get_start_remote, RmaGetStartRemote, { target: le_u32, rma: le_u32, bytes: le_u32 });
event_parser!(parse_rma_get_end, RmaGetEnd, { source: le_u32, rma: le_u32 });
event_parser!(parse_collective_exit, CollectiveExit, { root: le_u32, comm: le_u32, sent: le_u32, received: le_u32 });
event_parser!(parse_fork, Fork, {});
event_parser!(parse_join, Join, {});
event_parser!(parse_omp_acquire_lock, OmpAcquireLock, { lock: le_u32 });
event_parser!(parse_omp_release_lock, OmpReleaseLock, { lock: le_u32 });
event_parser!(parse_omp_collective_exit, OmpCollectiveExit, {});
event_parser!(parse_measurement_off, MeasurementOff, {});
event_parser!(parse_measurement_on, MeasurementOn, {});
event_parser!(parse_flush_start, FlushStart, {});
event_parser!(parse_flush_end, FlushEnd, {});

fn parse_attribute(input: &[u8]) -> IResult<&[u8], EventRecord> {
    let (input, kind) = le_u8(input)?;
    let (input, value) = le_u64(input)?;
    Ok((input, EventRecord::Attribute { kind, value }))
}

fn parse_event_payload(tag: EventTag, payload: &[u8]) -> Result<EventRecord> {
    let parser = match tag {
        EventTag::Enter => parse_enter,
        EventTag::EnterCallsite => parse_enter_callsite,
        EventTag::Exit => parse_exit,
        EventTag::Attribute => parse_attribute,
        EventTag::MpiSend => parse_mpi_send,
        EventTag::MpiRecv => parse_mpi_recv,
        EventTag::MpiCollectiveExit => parse_mpi_collective_exit,
        EventTag::MpiSendComplete => parse_mpi_send_complete,
        EventTag::MpiRecvRequest => parse_mpi_recv_request,
        EventTag::MpiRequestTested => parse_mpi_request_tested,
        EventTag::MpiCancelled => parse_mpi_cancelled,
        EventTag::MpiRmaPutStart => parse_mpi_rma_put_start,
        EventTag::MpiRmaPutEnd => parse_mpi_rma_put_end,
        EventTag::MpiRmaPutEndRemote => parse_mpi_rma_put_end_remote,
        EventTag::MpiRmaGetStart => parse_mpi_rma_get_start,
        EventTag::MpiRmaGetStartRemote => parse_mpi_rma_get_start_remote,
        EventTag::MpiRmaGetEnd => parse_mpi_rma_get_end,
        EventTag::MpiWinExit => parse_mpi_win_exit,
        EventTag::MpiWinCollectiveExit => parse_mpi_win_collective_exit,
        EventTag::MpiWinLock => parse_mpi_win_lock,
        EventTag::MpiWinUnlock => parse_mpi_win_unlock,
        EventTag::RmaPutStart => parse_rma_put_start,
        EventTag::RmaPutEnd => parse_rma_put_end,
        EventTag::RmaPutEndRemote => parse_rma_put_end_remote,
        EventTag::RmaGetStart => parse_rma_get_start,
        EventTag::RmaGetStartRemote => parse_rma_get_start_remote,
        EventTag::RmaGetEnd => parse_rma_get_end,
        EventTag::CollectiveExit => parse_collective_exit,
        EventTag::Fork => parse_fork,
        EventTag::Join => parse_join,
        EventTag::OmpAcquireLock => parse_omp_acquire_lock,
        EventTag::OmpReleaseLock => parse_omp_release_lock,
        EventTag::OmpCollectiveExit => parse_omp_collective_exit,
        EventTag::MeasurementOff => parse_measurement_off,
        EventTag::MeasurementOn => parse_measurement_on,
        EventTag::FlushStart => parse_flush_start,
        EventTag::FlushEnd => parse_flush_end,
    };
    let (rest, record) = parser(payload).map_err(|_| malformed(tag as u8, "event"))?;
    check_consumed(rest, tag as u8, "event")?;
    Ok(record)
}

fn malformed(tag: u8, name: &str) -> TraceError {
    TraceError::Malformed(format!("undecodable {} record (tag {})", name, tag))
}

fn check_consumed(rest: &[u8], tag: u8, name: &str) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(TraceError::Malformed(format!(
            "{} trailing bytes after {} record (tag {})",
            rest.len(),
            name,
            tag
        )))
    }
}

/// Pull-based reader over one container file.
///
/// The whole (possibly gzip-compressed) file is slurped into memory up
/// front; `next_def`/`next_event` then step through the frames. Seeking is
/// by absolute byte offset, as recorded in map-file-offset tables.
pub struct Decoder {
    data: Vec<u8>,
    pos: usize,
    version: u32,
}

pub const HEADER_LEN: usize = 13;

impl Decoder {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Decoder> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| TraceError::io(path, e))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| TraceError::io(path, e))?;

        // Transparent gzip support
        let data = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut gz = GzDecoder::new(&raw[..]);
            let mut decompressed = Vec::new();
            gz.read_to_end(&mut decompressed)
                .map_err(|e| TraceError::io(path, e))?;
            decompressed
        } else {
            raw
        };

        Decoder::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Decoder> {
        if data.len() < HEADER_LEN || &data[..8] != MAGIC {
            return Err(TraceError::Malformed(
                "missing trace container magic".into(),
            ));
        }
        if data[8] != 1 {
            return Err(TraceError::Malformed(format!(
                "unsupported byte order mark {}",
                data[8]
            )));
        }
        let version = u32::from_le_bytes(data[9..13].try_into().unwrap());
        Ok(Decoder {
            data,
            pos: HEADER_LEN,
            version,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn seek(&mut self, offset: u32) -> Result<()> {
        let offset = offset as usize;
        if offset < HEADER_LEN || offset > self.data.len() {
            return Err(TraceError::Malformed(format!(
                "seek offset {} outside container",
                offset
            )));
        }
        self.pos = offset;
        Ok(())
    }

    /// Current byte offset, usable as a later `seek` target.
    pub fn offset(&self) -> u32 {
        self.pos as u32
    }

    pub fn next_def(&mut self) -> Result<Option<DefRecord>> {
        let Some((tag, payload)) = self.next_frame()? else {
            return Ok(None);
        };
        let tag = DefTag::try_from(tag)
            .map_err(|_| TraceError::Malformed(format!("unknown definition record tag {}", tag)))?;
        parse_def_payload(tag, payload).map(Some)
    }

    pub fn next_event(&mut self) -> Result<Option<EventRecord>> {
        let Some((tag, payload)) = self.next_frame()? else {
            return Ok(None);
        };
        let tag = EventTag::try_from(tag)
            .map_err(|_| TraceError::Malformed(format!("unknown event record tag {}", tag)))?;
        parse_event_payload(tag, payload).map(Some)
    }

    fn next_frame(&mut self) -> Result<Option<(u8, &[u8])>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.pos + 5 > self.data.len() {
            return Err(TraceError::Malformed("truncated record frame".into()));
        }
        let tag = self.data[self.pos];
        let len =
            u32::from_le_bytes(self.data[self.pos + 1..self.pos + 5].try_into().unwrap()) as usize;
        let start = self.pos + 5;
        if start + len > self.data.len() {
            return Err(TraceError::Malformed(format!(
                "record payload (tag {}, {} bytes) extends past end of file",
                tag, len
            )));
        }
        self.pos = start + len;
        Ok(Some((tag, &self.data[start..start + len])))
    }
}

/// Record encoding, used to produce container images in tests.
#[cfg(test)]
pub(crate) mod writer {
    use super::*;

    pub struct Encoder {
        data: Vec<u8>,
    }

    impl Encoder {
        pub fn new(version: u32) -> Encoder {
            let mut data = Vec::new();
            data.extend_from_slice(MAGIC);
            data.push(1);
            data.extend_from_slice(&version.to_le_bytes());
            Encoder { data }
        }

        pub fn offset(&self) -> u32 {
            self.data.len() as u32
        }

        pub fn finish(self) -> Vec<u8> {
            self.data
        }

        pub fn frame(&mut self, tag: u8, payload: &[u8]) {
            self.data.push(tag);
            self.data
                .extend_from_slice(&(payload.len() as u32).to_le_bytes());
            self.data.extend_from_slice(payload);
        }

        pub fn def(&mut self, record: &DefRecord) {
            let mut p = Vec::new();
            let tag = match record {
                DefRecord::String { id, value } => {
                    put_u32(&mut p, *id);
                    p.extend_from_slice(value.as_bytes());
                    p.push(0);
                    DefTag::String
                }
                DefRecord::SystemNode {
                    id,
                    name,
                    class,
                    parent,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    put_u32(&mut p, *class);
                    put_u32(&mut p, *parent);
                    DefTag::SystemNode
                }
                DefRecord::LocationGroup {
                    id,
                    name,
                    rank,
                    parent,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    put_u32(&mut p, *rank);
                    put_u32(&mut p, *parent);
                    DefTag::LocationGroup
                }
                DefRecord::Location {
                    id,
                    name,
                    group,
                    thread,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    put_u32(&mut p, *group);
                    put_u32(&mut p, *thread);
                    DefTag::Location
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
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    put_u32(&mut p, *canonical_name);
                    put_u32(&mut p, *file);
                    put_u32(&mut p, *line);
                    p.push(*paradigm);
                    p.push(*role);
                    DefTag::Region
                }
                DefRecord::Callsite {
                    id,
                    file,
                    line,
                    callee,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *file);
                    put_u32(&mut p, *line);
                    put_u32(&mut p, *callee);
                    DefTag::Callsite
                }
                DefRecord::Callpath {
                    id,
                    region,
                    callsite,
                    parent,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *region);
                    put_u32(&mut p, *callsite);
                    put_u32(&mut p, *parent);
                    DefTag::Callpath
                }
                DefRecord::Group {
                    id,
                    name,
                    kind,
                    paradigm,
                    members,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    p.push(*kind);
                    p.push(*paradigm);
                    put_u32(&mut p, members.len() as u32);
                    for member in members {
                        p.extend_from_slice(&member.to_le_bytes());
                    }
                    DefTag::Group
                }
                DefRecord::Communicator {
                    id,
                    name,
                    group,
                    parent,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    put_u32(&mut p, *group);
                    put_u32(&mut p, *parent);
                    DefTag::Communicator
                }
                DefRecord::Window { id, comm } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *comm);
                    DefTag::Window
                }
                DefRecord::Metric { id, name } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *name);
                    DefTag::Metric
                }
                DefRecord::CartTopology {
                    id,
                    comm,
                    dimensions,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *comm);
                    put_u32(&mut p, dimensions.len() as u32);
                    for dim in dimensions {
                        put_u32(&mut p, *dim);
                    }
                    DefTag::CartTopology
                }
                DefRecord::CartDimension { id, size, periodic } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *size);
                    p.push(*periodic as u8);
                    DefTag::CartDimension
                }
                DefRecord::SourceLocation { id, file, line } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *file);
                    put_u32(&mut p, *line);
                    DefTag::SourceLocation
                }
                DefRecord::CallingContext {
                    id,
                    region,
                    source,
                    parent,
                } => {
                    put_u32(&mut p, *id);
                    put_u32(&mut p, *region);
                    put_u32(&mut p, *source);
                    put_u32(&mut p, *parent);
                    DefTag::CallingContext
                }
                DefRecord::MapFileOffset { rank, offset } => {
                    put_u32(&mut p, *rank);
                    put_u32(&mut p, *offset);
                    DefTag::MapFileOffset
                }
                DefRecord::MapSection { rank } => {
                    put_u32(&mut p, *rank);
                    DefTag::MapSection
                }
                DefRecord::TimeOffset { time, offset } => {
                    p.extend_from_slice(&time.to_le_bytes());
                    p.extend_from_slice(&offset.to_le_bytes());
                    DefTag::TimeOffset
                }
                DefRecord::IdMap {
                    category,
                    mode,
                    values,
                } => {
                    p.push(*category as u8);
                    p.push(*mode as u8);
                    put_u32(&mut p, values.len() as u32);
                    for value in values {
                        put_u32(&mut p, *value);
                    }
                    DefTag::IdMap
                }
            };
            self.frame(tag as u8, &p);
        }

        #[rustfmt::skip]
        pub fn event(&mut self, record: &EventRecord) {
            use EventRecord::*;
            let mut p = Vec::new();
            let tag = match record {
                Attribute { kind, value } => {
                    p.push(*kind);
                    p.extend_from_slice(&value.to_le_bytes());
                    EventTag::Attribute
                }
                Enter { location, time, region } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *region);
                    EventTag::Enter
                }
                EnterCallsite { location, time, callsite } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *callsite);
                    EventTag::EnterCallsite
                }
                Exit { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::Exit
                }
                MpiSend { location, time, dest, comm, tag, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *comm);
                    put_u32(&mut p, *tag);
                    put_u32(&mut p, *bytes);
                    EventTag::MpiSend
                }
                MpiRecv { location, time, source, comm, tag } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *source);
                    put_u32(&mut p, *comm);
                    put_u32(&mut p, *tag);
                    EventTag::MpiRecv
                }
                MpiCollectiveExit { location, time, root, comm, sent, received } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *root);
                    put_u32(&mut p, *comm);
                    put_u32(&mut p, *sent);
                    put_u32(&mut p, *received);
                    EventTag::MpiCollectiveExit
                }
                MpiSendComplete { location, time, request } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *request);
                    EventTag::MpiSendComplete
                }
                MpiRecvRequest { location, time, request } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *request);
                    EventTag::MpiRecvRequest
                }
                MpiRequestTested { location, time, request } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *request);
                    EventTag::MpiRequestTested
                }
                MpiCancelled { location, time, request } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *request);
                    EventTag::MpiCancelled
                }
                MpiRmaPutStart { location, time, target, window, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *target);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::MpiRmaPutStart
                }
                MpiRmaPutEnd { location, time, dest, window, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    EventTag::MpiRmaPutEnd
                }
                MpiRmaPutEndRemote { location, time, dest, window, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    EventTag::MpiRmaPutEndRemote
                }
                MpiRmaGetStart { location, time, dest, window, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::MpiRmaGetStart
                }
                MpiRmaGetStartRemote { location, time, origin, window, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *origin);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::MpiRmaGetStartRemote
                }
                MpiRmaGetEnd { location, time, source, window, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *source);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *rma);
                    EventTag::MpiRmaGetEnd
                }
                MpiWinExit { location, time, window, group, sync } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *window);
                    put_u32(&mut p, *group);
                    p.push(*sync as u8);
                    EventTag::MpiWinExit
                }
                MpiWinCollectiveExit { location, time, window } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *window);
                    EventTag::MpiWinCollectiveExit
                }
                MpiWinLock { location, time, peer, window, exclusive } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *peer);
                    put_u32(&mut p, *window);
                    p.push(*exclusive as u8);
                    EventTag::MpiWinLock
                }
                MpiWinUnlock { location, time, peer, window } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *peer);
                    put_u32(&mut p, *window);
                    EventTag::MpiWinUnlock
                }
                RmaPutStart { location, time, dest, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::RmaPutStart
                }
                RmaPutEnd { location, time, source, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *source);
                    put_u32(&mut p, *rma);
                    EventTag::RmaPutEnd
                }
                RmaPutEndRemote { location, time, dest, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *dest);
                    put_u32(&mut p, *rma);
                    EventTag::RmaPutEndRemote
                }
                RmaGetStart { location, time, target, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *target);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::RmaGetStart
                }
                RmaGetStartRemote { location, time, target, rma, bytes } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *target);
                    put_u32(&mut p, *rma);
                    put_u32(&mut p, *bytes);
                    EventTag::RmaGetStartRemote
                }
                RmaGetEnd { location, time, source, rma } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *source);
                    put_u32(&mut p, *rma);
                    EventTag::RmaGetEnd
                }
                CollectiveExit { location, time, root, comm, sent, received } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *root);
                    put_u32(&mut p, *comm);
                    put_u32(&mut p, *sent);
                    put_u32(&mut p, *received);
                    EventTag::CollectiveExit
                }
                Fork { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::Fork
                }
                Join { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::Join
                }
                OmpAcquireLock { location, time, lock } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *lock);
                    EventTag::OmpAcquireLock
                }
                OmpReleaseLock { location, time, lock } => {
                    put_header(&mut p, *location, *time);
                    put_u32(&mut p, *lock);
                    EventTag::OmpReleaseLock
                }
                OmpCollectiveExit { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::OmpCollectiveExit
                }
                MeasurementOff { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::MeasurementOff
                }
                MeasurementOn { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::MeasurementOn
                }
                FlushStart { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::FlushStart
                }
                FlushEnd { location, time } => {
                    put_header(&mut p, *location, *time);
                    EventTag::FlushEnd
                }
            };
            self.frame(tag as u8, &p);
        }
    }

    fn put_u32(buffer: &mut Vec<u8>, value: u32) {
        buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_header(buffer: &mut Vec<u8>, location: u32, time: f64) {
        put_u32(buffer, location);
        buffer.extend_from_slice(&time.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::writer::Encoder;
    use super::*;
    use crate::idmap::NO_ID;

    #[test]
    fn test_def_records_round_trip() {
        let records = vec![
            DefRecord::String {
                id: 0,
                value: "main".to_owned(),
            },
            DefRecord::SystemNode {
                id: 0,
                name: 0,
                class: 0,
                parent: NO_ID,
            },
            DefRecord::LocationGroup {
                id: 0,
                name: 0,
                rank: 0,
                parent: 0,
            },
            DefRecord::Location {
                id: 0,
                name: 0,
                group: 0,
                thread: 0,
            },
            DefRecord::Region {
                id: 3,
                name: 0,
                canonical_name: 0,
                file: NO_ID,
                line: NO_ID,
                paradigm: 4,
                role: 8,
            },
            DefRecord::Group {
                id: 1,
                name: NO_ID,
                kind: 2,
                paradigm: 4,
                members: vec![0, 1, 2],
            },
            DefRecord::TimeOffset {
                time: 0.5,
                offset: -1.25,
            },
            DefRecord::IdMap {
                category: IdMapCategory::Region,
                mode: IdMapModeTag::Sparse,
                values: vec![4, 0, 9, 1],
            },
        ];

        let mut encoder = Encoder::new(FORMAT_VERSION);
        for record in &records {
            encoder.def(record);
        }
        let mut decoder = Decoder::from_bytes(encoder.finish()).unwrap();
        assert_eq!(decoder.version(), FORMAT_VERSION);
        for expected in &records {
            let record = decoder.next_def().unwrap().unwrap();
            assert_eq!(&record, expected);
        }
        assert!(decoder.next_def().unwrap().is_none());
    }

    #[test]
    fn test_event_records_round_trip() {
        let records = vec![
            EventRecord::Enter {
                location: 1,
                time: 0.25,
                region: 7,
            },
            EventRecord::Attribute { kind: 0, value: 42 },
            EventRecord::MpiSend {
                location: 1,
                time: 0.5,
                dest: 3,
                comm: 0,
                tag: 99,
                bytes: 4096,
            },
            EventRecord::Exit {
                location: 1,
                time: 0.75,
            },
        ];

        let mut encoder = Encoder::new(1007);
        for record in &records {
            encoder.event(record);
        }
        let mut decoder = Decoder::from_bytes(encoder.finish()).unwrap();
        assert_eq!(decoder.version(), 1007);
        for expected in &records {
            let record = decoder.next_event().unwrap().unwrap();
            assert_eq!(&record, expected);
        }
        assert!(decoder.next_event().unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let mut encoder = Encoder::new(FORMAT_VERSION);
        encoder.frame(250, &[]);
        let mut decoder = Decoder::from_bytes(encoder.finish()).unwrap();
        assert!(matches!(decoder.next_def(), Err(TraceError::Malformed(_))));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let mut encoder = Encoder::new(FORMAT_VERSION);
        encoder.event(&EventRecord::Exit {
            location: 0,
            time: 1.0,
        });
        let mut data = encoder.finish();
        data.truncate(data.len() - 4);
        let mut decoder = Decoder::from_bytes(data).unwrap();
        assert!(matches!(
            decoder.next_event(),
            Err(TraceError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let data = b"NOTATRACE____".to_vec();
        assert!(Decoder::from_bytes(data).is_err());
    }

    #[test]
    fn test_seek_and_offset() {
        let mut encoder = Encoder::new(FORMAT_VERSION);
        encoder.def(&DefRecord::MapSection { rank: 0 });
        let section1 = encoder.offset();
        encoder.def(&DefRecord::MapSection { rank: 1 });
        let mut decoder = Decoder::from_bytes(encoder.finish()).unwrap();
        decoder.seek(section1).unwrap();
        assert_eq!(
            decoder.next_def().unwrap().unwrap(),
            DefRecord::MapSection { rank: 1 }
        );
        assert!(decoder.seek(2).is_err());
    }
}
