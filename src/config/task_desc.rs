// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::config::ConfigError;
use crate::parset::Parset;

/// The kinds of task the factory can instantiate. The first entry of the
/// task list must be one of the two source kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    MergedSource,
    NoMetadataSource,
    ChannelAvg,
    ChannelMerge,
    BeamScatter,
    CalcUVW,
    FringeRotation,
    Flag,
    Quack,
    ShadowFlag,
    MSSink,
    TCPSink,
    Buffered,
}

impl std::str::FromStr for TaskKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MergedSource" => Ok(TaskKind::MergedSource),
            "NoMetadataSource" => Ok(TaskKind::NoMetadataSource),
            "ChannelAvgTask" => Ok(TaskKind::ChannelAvg),
            "ChannelMergeTask" => Ok(TaskKind::ChannelMerge),
            "BeamScatterTask" => Ok(TaskKind::BeamScatter),
            "CalcUVWTask" => Ok(TaskKind::CalcUVW),
            "FringeRotationTask" => Ok(TaskKind::FringeRotation),
            "FlagTask" => Ok(TaskKind::Flag),
            "QuackTask" => Ok(TaskKind::Quack),
            "ShadowFlagTask" => Ok(TaskKind::ShadowFlag),
            "MSSink" => Ok(TaskKind::MSSink),
            "TCPSink" => Ok(TaskKind::TCPSink),
            "BufferedTask" => Ok(TaskKind::Buffered),
            other => Err(ConfigError::UnknownTaskKind(other.to_string())),
        }
    }
}

/// One entry of the ordered task list: a name, a kind tag and the task's
/// private parameters.
#[derive(Clone, Debug)]
pub struct TaskDesc {
    pub name: String,
    pub kind: TaskKind,
    pub params: Parset,
}

impl TaskDesc {
    /// Build the descriptor for `tasks.<name>.*`.
    pub fn from_parset(parset: &Parset, name: &str) -> Result<TaskDesc, ConfigError> {
        let prefix = format!("tasks.{name}.");
        let sub = parset.subset(&prefix);
        if !sub.is_defined("type") {
            return Err(ConfigError::UndefinedTask(name.to_string()));
        }
        let kind = sub.string("type")?.parse()?;
        Ok(TaskDesc {
            name: name.to_string(),
            kind,
            params: sub.subset("params."),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_desc() {
        let parset = Parset::from_str(
            "tasks.ChanAvg.type = ChannelAvgTask\n\
             tasks.ChanAvg.params.averaging = 54\n",
        )
        .unwrap();
        let desc = TaskDesc::from_parset(&parset, "ChanAvg").unwrap();
        assert_eq!(desc.kind, TaskKind::ChannelAvg);
        assert_eq!(desc.params.u32("averaging").unwrap(), 54);
    }

    #[test]
    fn undefined_task_rejected() {
        let parset = Parset::new();
        assert!(matches!(
            TaskDesc::from_parset(&parset, "Ghost"),
            Err(ConfigError::UndefinedTask(_))
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let parset = Parset::from_str("tasks.X.type = FluxCapacitor\n").unwrap();
        assert!(matches!(
            TaskDesc::from_parset(&parset, "X"),
            Err(ConfigError::UnknownTaskKind(_))
        ));
    }
}
