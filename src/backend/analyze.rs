use std::collections::BTreeMap;

use crate::archive::Analysis;

/// Prints a summary of the reconstructed analysis state: per-kind event
/// totals ordered by frequency, per-location stream sizes, and the size of
/// the unified call tree.
pub fn print_statistics(analysis: &Analysis) {
    let mut kind_counts = BTreeMap::<&'static str, usize>::new();
    let mut total = 0usize;
    for trace in &analysis.traces {
        total += trace.len();
        for event in trace.events() {
            *kind_counts.entry(event.kind.name()).or_insert(0) += 1;
        }
    }

    println!("format version: {}", analysis.version);
    println!(
        "locations: {} in {} location groups",
        analysis.defs.num_locations(),
        analysis.defs.num_location_groups()
    );
    println!("events: {}", total);

    let mut ordering: Vec<(&'static str, usize)> = kind_counts.into_iter().collect();
    ordering.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    for (name, count) in ordering {
        println!("  {:<24} {}", name, count);
    }

    println!();
    for trace in &analysis.traces {
        let location = trace.location;
        println!(
            "location {}: {} events, {} parallel regions, {} MPI region enters",
            location.0,
            trace.len(),
            trace.omp_parallel_enters,
            trace.mpi_region_enters
        );
    }

    let tree = analysis.defs.call_tree();
    println!();
    println!(
        "call tree: {} call paths, {} roots",
        tree.num_callpaths(),
        tree.roots().len()
    );
}
