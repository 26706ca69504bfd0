use std::io;
use std::io::Write;

use serde::Serialize;

use crate::archive::Analysis;
use crate::calltree::CallTree;
use crate::defs::GlobalDefs;
use crate::event::LocalTrace;

#[derive(Serialize)]
struct Dump<'a> {
    version: u32,
    defs: &'a GlobalDefs,
    call_tree: &'a CallTree,
    traces: &'a [LocalTrace],
}

/// Writes the reconstructed definitions, call tree and event streams as
/// JSON, for consumption by downstream tooling.
pub fn emit_json<W: Write>(analysis: &Analysis, writer: W) -> io::Result<()> {
    let dump = Dump {
        version: analysis.version,
        defs: &analysis.defs,
        call_tree: analysis.defs.call_tree(),
        traces: &analysis.traces,
    };
    serde_json::to_writer_pretty(writer, &dump).map_err(io::Error::other)
}
