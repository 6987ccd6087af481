//! Status phases and per-kind lifecycles.
//!
//! A `Lifecycle` declares which phase transitions a kind allows and which
//! phases each direction may act on. The bridge validates North transitions
//! against it before any handler runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::lookup;
use crate::object::RawObject;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    #[default]
    Init,
    Update,
    Running,
    Sync,
    Delete,
    Fail,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Init => "INIT",
            Phase::Update => "UPDATE",
            Phase::Running => "RUNNING",
            Phase::Sync => "SYNC",
            Phase::Delete => "DELETE",
            Phase::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    pub kind: &'static str,
    /// Dotted path of the phase field inside the document.
    pub status_path: &'static str,
    transitions: &'static [(Phase, &'static [Phase])],
    north: &'static [Phase],
    south: &'static [Phase],
}

impl Lifecycle {
    pub const fn new(
        kind: &'static str,
        status_path: &'static str,
        transitions: &'static [(Phase, &'static [Phase])],
        north: &'static [Phase],
        south: &'static [Phase],
    ) -> Self {
        Self { kind, status_path, transitions, north, south }
    }

    /// Default table for cluster-backed workloads.
    pub const fn workload(kind: &'static str) -> Self {
        Self::new(kind, "spec.status", WORKLOAD_TRANSITIONS, WORKLOAD_NORTH, WORKLOAD_SOUTH)
    }

    /// Re-delivery of the same phase is always allowed.
    pub fn can_transition(&self, from: Phase, to: Phase) -> bool {
        from == to
            || self
                .transitions
                .iter()
                .find(|(f, _)| *f == from)
                .map(|(_, next)| next.contains(&to))
                .unwrap_or(false)
    }

    pub fn check(&self, from: Option<Phase>, to: Phase) -> Result<()> {
        match from {
            None => Ok(()),
            Some(from) if self.can_transition(from, to) => Ok(()),
            Some(from) => Err(Error::InvalidTransition { kind: self.kind.to_string(), from, to }),
        }
    }

    /// Phases in which control-plane intent must be pushed to clusters.
    pub fn north_actionable(&self, phase: Phase) -> bool {
        self.north.contains(&phase)
    }

    /// Phases in which observed cluster state may be written back.
    pub fn south_writable(&self, phase: Phase) -> bool {
        self.south.contains(&phase)
    }

    /// Read the phase of a stored object. Missing status counts as `Init`.
    pub fn phase_of(&self, obj: &RawObject) -> Result<Phase> {
        let rel = self.status_path.strip_prefix("spec.").unwrap_or(self.status_path);
        match lookup(&obj.spec, rel) {
            None | Some(serde_json::Value::Null) => Ok(Phase::Init),
            Some(v) => Ok(Phase::deserialize(v)?),
        }
    }
}

const WORKLOAD_TRANSITIONS: &[(Phase, &[Phase])] = &[
    (Phase::Init, &[Phase::Update, Phase::Running, Phase::Delete, Phase::Fail]),
    (Phase::Update, &[Phase::Running, Phase::Delete, Phase::Fail]),
    (Phase::Running, &[Phase::Update, Phase::Sync, Phase::Delete, Phase::Fail]),
    (Phase::Sync, &[Phase::Running, Phase::Update, Phase::Delete, Phase::Fail]),
    (Phase::Fail, &[Phase::Init, Phase::Update, Phase::Delete]),
    (Phase::Delete, &[]),
];
const WORKLOAD_NORTH: &[Phase] = &[Phase::Init, Phase::Update, Phase::Delete];
const WORKLOAD_SOUTH: &[Phase] = &[Phase::Running, Phase::Sync];
