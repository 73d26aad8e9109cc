// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The immutable configuration snapshot.
//!
//! Built once from the parset at startup; every task receives a shared
//! reference. Includes the rank-role classification: each rank is either a
//! receiving rank (bound to one correlator output stream) or a service
//! rank (no input, available as an activation target for redistribution
//! tasks).

mod antenna;
mod baseline_map;
mod correlator_mode;
mod error;
mod feeds;
mod task_desc;

pub use antenna::Antenna;
pub use baseline_map::BaselineMap;
pub use correlator_mode::{parse_frequency_hz, CorrelatorMode};
pub use error::ConfigError;
pub use feeds::FeedConfig;
pub use task_desc::{TaskDesc, TaskKind};

use std::collections::BTreeMap;

use log::warn;

use crate::parset::Parset;

#[derive(Clone, Debug)]
pub struct Configuration {
    rank: i32,
    nprocs: i32,
    receiver_id: i32,
    n_receiving_procs: i32,
    array_name: String,
    sbid: u32,
    antennas: Vec<Antenna>,
    feed: Option<FeedConfig>,
    correlator_modes: BTreeMap<String, CorrelatorMode>,
    baseline_map: BaselineMap,
    tasks: Vec<TaskDesc>,
    parset: Parset,
}

impl Configuration {
    pub fn new(parset: Parset, rank: i32, nprocs: i32) -> Result<Configuration, ConfigError> {
        let (receiver_id, n_receiving_procs) = classify_rank(&parset, rank, nprocs)?;

        let array_name = parset.string_or("array.name", "unknown");
        let sbid = parset.u32_or("sbid", 0)?;

        let tasks = parset
            .string_vector_or_empty("tasks.tasklist")?
            .iter()
            .map(|name| TaskDesc::from_parset(&parset, name))
            .collect::<Result<Vec<_>, _>>()?;

        let feed = if parset.is_defined("feeds.n_feeds") {
            Some(FeedConfig::from_parset(&parset.subset("feeds."))?)
        } else {
            None
        };

        let (antennas, baseline_map) = build_array_layout(&parset)?;

        let mut correlator_modes = BTreeMap::new();
        for name in parset.string_vector_or_empty("correlator.modes")? {
            let sub = parset.subset(&format!("correlator.mode.{name}."));
            correlator_modes.insert(name.clone(), CorrelatorMode::from_parset(&name, &sub)?);
        }

        Ok(Configuration {
            rank,
            nprocs,
            receiver_id,
            n_receiving_procs,
            array_name,
            sbid,
            antennas,
            feed,
            correlator_modes,
            baseline_map,
            tasks,
            parset,
        })
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn nprocs(&self) -> i32 {
        self.nprocs
    }

    /// Receiver id of this rank, or -1 for a service rank.
    pub fn receiver_id(&self) -> i32 {
        self.receiver_id
    }

    pub fn n_receiving_procs(&self) -> i32 {
        self.n_receiving_procs
    }

    /// True if this rank consumes a correlator output stream.
    pub fn receiving_rank(&self) -> bool {
        self.receiver_id >= 0
    }

    pub fn array_name(&self) -> &str {
        &self.array_name
    }

    pub fn scheduling_block_id(&self) -> u32 {
        self.sbid
    }

    pub fn antennas(&self) -> &[Antenna] {
        &self.antennas
    }

    pub fn feed(&self) -> Option<&FeedConfig> {
        self.feed.as_ref()
    }

    pub fn feed_info_defined(&self) -> bool {
        self.feed.is_some()
    }

    pub fn bmap(&self) -> &BaselineMap {
        &self.baseline_map
    }

    pub fn lookup_correlator_mode(&self, name: &str) -> Result<&CorrelatorMode, ConfigError> {
        self.correlator_modes
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCorrelatorMode(name.to_string()))
    }

    pub fn tasks(&self) -> &[TaskDesc] {
        &self.tasks
    }

    /// Descriptor for a named task, whether or not it is in the task list.
    /// The buffered adapter instantiates its child through this.
    pub fn task_by_name(&self, name: &str) -> Result<TaskDesc, ConfigError> {
        TaskDesc::from_parset(&self.parset, name)
    }
}

/// Determine the receiver id of this rank and the number of receiving
/// ranks. Service ranks are excluded from the receiver id counter: the
/// receiver id of the i-th non-service rank is the count of non-service
/// ranks with index < i.
fn classify_rank(parset: &Parset, rank: i32, nprocs: i32) -> Result<(i32, i32), ConfigError> {
    let service_ranks = parset.u32_vector_or_empty("service_ranks")?;

    if rank < 0 {
        // Serial case.
        if nprocs != 1 {
            return Err(ConfigError::SerialWithMultipleProcs(nprocs));
        }
        if !service_ranks.is_empty() {
            return Err(ConfigError::SerialWithServiceRanks);
        }
        return Ok((0, nprocs));
    }

    if rank >= nprocs {
        return Err(ConfigError::RankOutOfRange { rank, nprocs });
    }

    let mut n_receiving = nprocs;
    let mut this_is_receiver = true;
    let mut service_before_this = 0;
    let mut ignored = 0;
    for (i, &sr) in service_ranks.iter().enumerate() {
        if service_ranks[..i].contains(&sr) {
            return Err(ConfigError::DuplicateServiceRank(sr));
        }
        if sr as i32 >= nprocs {
            ignored += 1;
        } else {
            n_receiving -= 1;
            if (sr as i32) < rank {
                service_before_this += 1;
            } else if sr as i32 == rank {
                this_is_receiver = false;
            }
        }
    }
    if ignored > 0 && rank == 0 {
        warn!(
            "Given the number of ranks available ({nprocs}), {ignored} service rank(s) is/are ignored"
        );
    }
    let receiver_id = if this_is_receiver {
        rank - service_before_this
    } else {
        -1
    };
    Ok((receiver_id, n_receiving))
}

/// Build the antenna list and baseline map, applying the optional
/// `baselinemap.antennaidx` ordering and `baselinemap.antennaindices`
/// sparse-array slice.
fn build_array_layout(parset: &Parset) -> Result<(Vec<Antenna>, BaselineMap), ConfigError> {
    let bm_parset = parset.subset("baselinemap.");
    let mut baseline_map = BaselineMap::from_parset(&bm_parset)?;

    let names = if bm_parset.is_defined("antennaidx") {
        bm_parset.string_vector("antennaidx")?
    } else {
        parset.string_vector_or_empty("antennas")?
    };
    let mut antennas = names
        .iter()
        .map(|name| Antenna::from_parset(parset, name))
        .collect::<Result<Vec<_>, _>>()?;

    if bm_parset.is_defined("antennaindices") {
        let indices: Vec<u32> = bm_parset
            .i32_vector("antennaindices")?
            .into_iter()
            .map(|i| i as u32)
            .collect();
        baseline_map.slice(&indices)?;
        antennas = indices
            .iter()
            .filter_map(|&i| antennas.get(i as usize).cloned())
            .collect();
    }
    Ok((antennas, baseline_map))
}
