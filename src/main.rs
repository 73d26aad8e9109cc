// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The ingest pipeline binary.
//!
//! Runs one or more ranks of the pipeline. Multi-rank operation hosts
//! each rank on its own thread coupled by the in-process fabric; an MPI
//! launcher would instead run one process per rank with an MPI-backed
//! communicator, which is outside this binary's scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};

use vis_ingest::{Configuration, IngestError, IngestPipeline, LocalFabric, Parset};

#[derive(Parser)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration parset.
    #[clap(short, long)]
    config: std::path::PathBuf,

    /// The verbosity of the program. The default is to print info
    /// messages; -v prints debug, -vv prints trace.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Number of ranks to host in this process.
    #[clap(long, default_value = "1")]
    ranks: usize,
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {} line {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("logging set up only once");
}

fn run() -> Result<bool, IngestError> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGUSR1] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .expect("registering signal handlers");
    }

    let parset = Parset::from_file(&args.config)?;
    vis_ingest::monitoring::init();

    if args.ranks <= 1 {
        let config = Configuration::new(parset, 0, 1)?;
        let mut pipeline = IngestPipeline::new(config, LocalFabric::solo(), shutdown)?;
        pipeline.start()?;
        return Ok(pipeline.interrupted());
    }

    info!("Hosting {} ranks in this process", args.ranks);
    let world = LocalFabric::new_world(args.ranks);
    let handles: Vec<_> = world
        .into_iter()
        .map(|comm| {
            let parset = parset.clone();
            let shutdown = Arc::clone(&shutdown);
            let nprocs = args.ranks as i32;
            std::thread::Builder::new()
                .name(format!("rank-{}", comm.rank()))
                .spawn(move || -> Result<bool, IngestError> {
                    let config = Configuration::new(parset, comm.rank() as i32, nprocs)?;
                    let mut pipeline = IngestPipeline::new(config, comm, shutdown)?;
                    pipeline.start()?;
                    Ok(pipeline.interrupted())
                })
                .expect("spawning rank threads")
        })
        .collect();

    let mut interrupted = false;
    let mut first_error: Option<IngestError> = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(rank_interrupted)) => interrupted |= rank_interrupted,
            Ok(Err(e)) => {
                error!("Rank {rank} failed: {e}");
                // Make sure the peers unblock and wind down too.
                shutdown.store(true, Ordering::Relaxed);
                first_error.get_or_insert(e);
            }
            Err(_) => {
                error!("Rank {rank} panicked");
                first_error.get_or_insert(IngestError::RankPanicked(rank));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(interrupted),
    }
}

fn main() {
    std::process::exit(match run() {
        Ok(false) => 0,
        Ok(true) => {
            info!("Stopped by signal");
            3
        }
        Err(e) => {
            error!("FATAL: {e}");
            e.exit_code()
        }
    });
}
