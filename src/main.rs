use std::error::Error;
use std::ffi::OsString;
use std::io;

use clap::Parser;

use log::info;

use unitrace::archive::{read_archive, ArchiveOptions};
use unitrace::backend::{analyze, dump};
use unitrace::reconstruct::AnalysisContext;
use unitrace::unify::{unify_call_tree, LocalTransport};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(required = true, help = "input trace archive directory")]
    archive: OsString,

    #[arg(short, long, help = "print statistics")]
    statistics: bool,

    #[arg(short, long, help = "emit JSON for the reconstructed analysis state")]
    dump: bool,

    #[arg(
        long = "no-time-correction",
        help = "keep local timestamps instead of applying the recorded time correction"
    )]
    no_time_correction: bool,

    #[arg(short, long, help = "number of worker threads (default: all cores)")]
    jobs: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(jobs) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()?;
    }

    let ctx = AnalysisContext::mpi();
    let options = ArchiveOptions {
        time_correction: !cli.no_time_correction,
    };

    println!("Reading trace archive {:?}...", cli.archive);
    let mut analysis = read_archive(&cli.archive, &ctx, &options)?;

    unify_call_tree(&mut analysis.defs, &mut LocalTransport)?;
    info!(
        "unified call tree holds {} call paths",
        analysis.defs.call_tree().num_callpaths()
    );

    if cli.statistics {
        analyze::print_statistics(&analysis);
    } else if cli.dump {
        dump::emit_json(&analysis, io::stdout().lock())?;
    } else {
        println!(
            "Matched {} events across {} locations; call tree holds {} call paths",
            analysis.traces.iter().map(|t| t.len()).sum::<usize>(),
            analysis.traces.len(),
            analysis.defs.call_tree().num_callpaths()
        );
    }

    Ok(())
}
