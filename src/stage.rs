//! Lifecycle stages of an averaging step.

use std::fmt;

use crate::error::{ControlError, Result};

/// Coarse-grained position of a step in its lifecycle, advanced by the
/// worker side only. The derived ordering follows semantic progression;
/// `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AveragingStage {
    /// Still initializing.
    Idle = 0,
    /// Decentralized matchmaking in progress.
    LookingForGroup = 1,
    /// Group assembled, blocked on the controller's trigger.
    AwaitingTrigger = 2,
    /// Exchanging tensors with groupmates; schedule fields are frozen.
    RunningAllreduce = 3,
    /// Done or failed; the result is available on the handle.
    Finished = 4,
}

impl AveragingStage {
    /// Byte tag stored in the shared schedule block.
    pub fn as_tag(self) -> u8 {
        self as u8
    }

    /// Decodes a byte tag read from shared memory.
    ///
    /// # Errors
    ///
    /// Returns a decode error for tags outside the closed set.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Idle),
            1 => Ok(Self::LookingForGroup),
            2 => Ok(Self::AwaitingTrigger),
            3 => Ok(Self::RunningAllreduce),
            4 => Ok(Self::Finished),
            other => Err(ControlError::decode(format!(
                "invalid averaging stage tag: {other}"
            ))),
        }
    }

    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for AveragingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LookingForGroup => "looking_for_group",
            Self::AwaitingTrigger => "awaiting_trigger",
            Self::RunningAllreduce => "running_allreduce",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}
