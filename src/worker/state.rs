//! Worker lifecycle states.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a copy run.
///
/// ```text
/// initializing -> finding_targets -> copying -> cleaning_up -> done
///       \               \               \            \
///        +---------------+---------------+------------+--> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    FindingTargets,
    Copying,
    CleaningUp,
    Done,
    Error,
}

impl WorkerState {
    /// String exposed through the stats endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::FindingTargets => "finding_targets",
            Self::Copying => "copying",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// No transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Done | Error, _) => false,
            (_, Error) => true,
            (Initializing, FindingTargets) => true,
            (FindingTargets, Copying) => true,
            (Copying, Copying) => true,
            (Copying, CleaningUp) => true,
            (CleaningUp, Done) => true,
            _ => false,
        }
    }

    /// Validate a transition.
    pub fn check_transition(&self, next: WorkerState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::FindingTargets => 1,
            Self::Copying => 2,
            Self::CleaningUp => 3,
            Self::Done => 4,
            Self::Error => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::FindingTargets,
            2 => Self::Copying,
            3 => Self::CleaningUp,
            4 => Self::Done,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
