// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The top-level driver: construct the task chain and turn the tick
//! loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::comms::Communicator;
use crate::config::{Configuration, TaskKind};
use crate::constants::DEFAULT_VIS_BUFFER_CAPACITY;
use crate::error::IngestError;
use crate::monitoring;
use crate::source::{
    MergedSource, MetadataSource, NoMetadataSource, ParallelMetadataSource, Source, SourceError,
    TcpMetadataSource, UdpVisSource, VisSource,
};
use crate::tasks::{Task, TaskFactory};

pub struct IngestPipeline {
    config: Configuration,
    shutdown: Arc<AtomicBool>,
    source: Box<dyn Source>,
    tasks: Vec<Box<dyn Task>>,
    /// Set when the loop stopped because of a delivered signal.
    interrupted: bool,
}

impl IngestPipeline {
    /// Build the source and the task chain from the configuration. The
    /// first task descriptor must name a source.
    pub fn new(
        config: Configuration,
        comm: Arc<dyn Communicator>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<IngestPipeline, IngestError> {
        let descriptors = config.tasks().to_vec();
        let first = descriptors
            .first()
            .ok_or_else(|| IngestError::NoTasks)?;

        let source: Box<dyn Source> = match first.kind {
            TaskKind::MergedSource => {
                let vis_src = build_vis_source(&first.params, &config)?;
                let metadata_src = build_metadata_source(&first.params, &config, &comm)?;
                Box::new(MergedSource::new(
                    &first.params,
                    &config,
                    metadata_src,
                    vis_src,
                    Arc::clone(&shutdown),
                )?)
            }
            TaskKind::NoMetadataSource => {
                let vis_src = build_vis_source(&first.params, &config)?
                    .ok_or(IngestError::SourceOnServiceRank)?;
                Box::new(NoMetadataSource::new(
                    &first.params,
                    &config,
                    vis_src,
                    (comm.size() > 1).then(|| Arc::clone(&comm)),
                    Arc::clone(&shutdown),
                )?)
            }
            _ => return Err(IngestError::FirstTaskNotASource(first.name.clone())),
        };

        let factory = TaskFactory::new(config.clone(), Arc::clone(&comm));
        let tasks = descriptors[1..]
            .iter()
            .map(|desc| factory.create(desc))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IngestPipeline {
            config,
            shutdown,
            source,
            tasks,
            interrupted: false,
        })
    }

    /// Assemble a pipeline around an already-built source and task list.
    /// Used by tests and mock tooling.
    pub fn with_source(
        config: Configuration,
        shutdown: Arc<AtomicBool>,
        source: Box<dyn Source>,
        tasks: Vec<Box<dyn Task>>,
    ) -> IngestPipeline {
        IngestPipeline {
            config,
            shutdown,
            source,
            tasks,
            interrupted: false,
        }
    }

    /// True if `start` returned because a shutdown signal arrived.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Process correlator integrations until the observation completes,
    /// a signal arrives, or an error unwinds the pipeline.
    pub fn start(&mut self) -> Result<(), IngestError> {
        let result = self.ingest();
        self.source = Box::new(FinishedSource);
        monitoring::invalidate("SourceTaskDuration");
        monitoring::invalidate("ProcessingDuration");
        monitoring::destroy();
        result
    }

    fn ingest(&mut self) -> Result<(), IngestError> {
        loop {
            let cycle = Instant::now();
            match self.ingest_one() {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if self.config.rank() == 0 {
                        info!(
                            "Total cycle execution time {:.3}s",
                            cycle.elapsed().as_secs_f64()
                        );
                    }
                }
                Err(IngestError::Source(SourceError::Interrupted)) => {
                    info!("Interrupted - shutting down after the current cycle");
                    self.interrupted = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if self.shutdown.load(Ordering::Relaxed) {
                self.interrupted = true;
                return Ok(());
            }
        }
    }

    /// One tick. Returns true when the observation is complete.
    fn ingest_one(&mut self) -> Result<bool, IngestError> {
        let started = Instant::now();
        let chunk = self.source.next()?;
        let source_duration = started.elapsed().as_secs_f64();
        if self.config.rank() == 0 {
            info!("Source task execution time {source_duration:.3}s");
        }
        monitoring::update("SourceTaskDuration", source_duration);

        let chunk = match chunk {
            None => return Ok(true), // Finished.
            Some(chunk) => chunk,
        };
        if self.config.rank() == 0 {
            info!("Received one VisChunk. Timestamp: {}", chunk.time);
        } else {
            debug!("Received one VisChunk. Timestamp: {}", chunk.time);
        }

        // A zero-dimension chunk is a service rank's way of keeping the
        // loop turning; downstream it reads as "no output this tick".
        let mut handle = if chunk.n_row() == 0 { None } else { Some(chunk) };

        let mut processing_time = 0.0;
        for task in &mut self.tasks {
            if handle.is_some() || task.is_always_active() {
                let started = Instant::now();
                task.process(&mut handle)?;
                let duration = started.elapsed().as_secs_f64();
                if self.config.rank() == 0 {
                    info!("{} execution time {duration:.3}s", task.name());
                }
                processing_time += duration;
            }
        }
        monitoring::update("ProcessingDuration", processing_time);
        Ok(false)
    }
}

/// Replaces the real source once the pipeline has stopped, so a stray
/// late call cannot touch torn-down stream plumbing.
struct FinishedSource;

impl Source for FinishedSource {
    fn next(&mut self) -> Result<Option<crate::chunk::VisChunk>, SourceError> {
        Ok(None)
    }
}

/// Receiving ranks get a UDP datagram source listening on the base port
/// plus their receiver id; service ranks get none.
fn build_vis_source(
    params: &crate::parset::Parset,
    config: &Configuration,
) -> Result<Option<Box<dyn VisSource>>, IngestError> {
    if !config.receiving_rank() {
        return Ok(None);
    }
    let base_port = params
        .u32_or("vis_source.port", 3000)
        .map_err(crate::config::ConfigError::from)?;
    let capacity = params
        .u32_or(
            "vis_source.buffer_size",
            DEFAULT_VIS_BUFFER_CAPACITY as u32,
        )
        .map_err(crate::config::ConfigError::from)? as usize;
    let rcvbuf = params
        .u32_or("vis_source.receive_buffer", 1 << 24)
        .map_err(crate::config::ConfigError::from)? as usize;
    let port = base_port + config.receiver_id() as u32;
    let addr = format!("0.0.0.0:{port}");
    info!(
        "Receiver id {} listening for datagrams on {addr}",
        config.receiver_id()
    );
    let source = UdpVisSource::new(&addr, capacity, rcvbuf).map_err(IngestError::VisSourceBind)?;
    Ok(Some(Box::new(source)))
}

/// Rank 0 subscribes to the metadata endpoint; with more than one rank
/// the records are shared through the parallel adapter.
fn build_metadata_source(
    params: &crate::parset::Parset,
    config: &Configuration,
    comm: &Arc<dyn Communicator>,
) -> Result<Box<dyn MetadataSource>, IngestError> {
    let endpoint = params
        .string("metadata.endpoint")
        .map_err(crate::config::ConfigError::from)?;
    if config.nprocs() > 1 {
        let inner: Option<Box<dyn MetadataSource>> =
            (comm.rank() == 0).then(|| Box::new(TcpMetadataSource::new(&endpoint)) as Box<_>);
        Ok(Box::new(ParallelMetadataSource::new(
            inner,
            Arc::clone(comm),
        )))
    } else {
        Ok(Box::new(TcpMetadataSource::new(&endpoint)))
    }
}
