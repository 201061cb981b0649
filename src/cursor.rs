//! Serialisable resumption token.
//!
//! A cursor means: the consumer has received `step` for `block`, the
//! producer's head at that moment was `head_block`, and `lib` is known
//! irreversible. Cursors round-trip through the `c1`/`c3` text forms.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::block::BlockRef;
use crate::step::Step;

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub step: Step,
    pub block: BlockRef,
    pub head_block: BlockRef,
    pub lib: BlockRef,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor is malformed: {0}")]
    Malformed(String),
    #[error("cursor carries an unknown step value {0}")]
    UnknownStep(u8),
}

impl Cursor {
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    /// True when the consumer sat exactly on an irreversible block,
    /// i.e. the cursor needs no reversible chain to resume.
    pub fn is_on_final_block(&self) -> bool {
        self.block == self.lib
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            step: Step::New,
            block: BlockRef::empty(),
            head_block: BlockRef::empty(),
            lib: BlockRef::empty(),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.block == self.head_block {
            write!(
                f,
                "c1:{}:{}:{}:{}:{}",
                self.step.wire_value(),
                self.block.num,
                self.block.id,
                self.lib.num,
                self.lib.id,
            )
        } else {
            write!(
                f,
                "c3:{}:{}:{}:{}:{}:{}:{}",
                self.step.wire_value(),
                self.block.num,
                self.block.id,
                self.head_block.num,
                self.head_block.id,
                self.lib.num,
                self.lib.id,
            )
        }
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let malformed = || CursorError::Malformed(s.to_string());

        let num = |p: &str| p.parse::<u64>().map_err(|_| malformed());
        let step_of = |p: &str| {
            let value = p.parse::<u8>().map_err(|_| malformed())?;
            Step::from_wire(value).map_err(|e| CursorError::UnknownStep(e.0))
        };

        match parts.as_slice() {
            ["c1", step, block_num, block_id, lib_num, lib_id] => {
                let block = BlockRef::new(*block_id, num(block_num)?);
                Ok(Cursor {
                    step: step_of(step)?,
                    head_block: block.clone(),
                    block,
                    lib: BlockRef::new(*lib_id, num(lib_num)?),
                })
            }
            ["c3", step, block_num, block_id, head_num, head_id, lib_num, lib_id] => Ok(Cursor {
                step: step_of(step)?,
                block: BlockRef::new(*block_id, num(block_num)?),
                head_block: BlockRef::new(*head_id, num(head_num)?),
                lib: BlockRef::new(*lib_id, num(lib_num)?),
            }),
            _ => Err(malformed()),
        }
    }
}
