//! Step kinds emitted along the longest chain, usable as a filter mask.

use bitmask_enum::bitmask;
use thiserror::Error;

/// One step kind, or a mask of several when used as a filter.
///
/// The bit values are part of the cursor wire format and must not
/// change. Bit 8 is reserved (it belonged to a retired handoff step).
#[bitmask(u8)]
pub enum Step {
    New = 0b0000_0001,
    Undo = 0b0000_0010,
    Redo = 0b0000_0100,
    Irreversible = 0b0001_0000,
    Stalled = 0b0010_0000,

    // replay form used by hub sub-streams for already-final blocks
    NewIrreversible = 0b0001_0001,
}

#[derive(Debug, Error)]
#[error("unknown step wire value {0}")]
pub struct UnknownStep(pub u8);

impl Step {
    /// Every concrete step kind.
    pub fn all_steps() -> Self {
        Step::New | Step::Undo | Step::Redo | Step::Irreversible | Step::Stalled
    }

    /// Single digit used in cursors and stream requests.
    pub fn wire_value(self) -> u8 {
        self.bits()
    }

    pub fn from_wire(value: u8) -> Result<Self, UnknownStep> {
        match value {
            1 => Ok(Step::New),
            2 => Ok(Step::Undo),
            4 => Ok(Step::Redo),
            16 => Ok(Step::Irreversible),
            17 => Ok(Step::NewIrreversible),
            32 => Ok(Step::Stalled),
            other => Err(UnknownStep(other)),
        }
    }

    /// True when the mask admits `step`.
    pub fn matches(self, step: Step) -> bool {
        self.intersects(step)
    }
}
