//! Handler seams between sources, the forkable and consumers.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::block::{Block, BlockRef};
use crate::cursor::Cursor;
use crate::step::Step;

/// Consumer-attached artefact carried alongside a block, typically the
/// result of preprocessing. Opaque to the core.
pub type BlockObj = Arc<dyn Any + Send + Sync>;

/// A block together with its preprocessed artefact.
#[derive(Clone)]
pub struct PreprocessedBlock {
    pub block: Arc<Block>,
    pub obj: Option<BlockObj>,
}

impl std::fmt::Debug for PreprocessedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreprocessedBlock({})", self.block)
    }
}

/// Receives raw blocks from a source, in whatever order the source
/// produces them. Returning an error instructs the owning source to
/// shut down with that error.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()>;
}

/// One step event emitted by the forkable along the longest chain.
///
/// For batched steps (undo, redo, irreversible, stalled) the event
/// carries the whole ordered batch in `step_blocks` along with this
/// event's position in it.
#[derive(Clone)]
pub struct ForkableEvent {
    pub step: Step,
    /// The block this event is about.
    pub block: BlockRef,
    /// The observed chain tip at emission time.
    pub head_block: BlockRef,
    /// The last irreversible block announced to this consumer.
    pub lib: BlockRef,
    pub step_index: usize,
    pub step_count: usize,
    pub step_blocks: Vec<PreprocessedBlock>,
    /// Artefact attached to `block` when it entered the forkable.
    pub obj: Option<BlockObj>,
}

impl std::fmt::Debug for ForkableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkableEvent")
            .field("step", &self.step)
            .field("block", &self.block)
            .field("head_block", &self.head_block)
            .field("lib", &self.lib)
            .field("step_index", &self.step_index)
            .field("step_count", &self.step_count)
            .field("step_blocks", &self.step_blocks)
            .finish()
    }
}

impl ForkableEvent {
    /// Resumption token for the consumer that has just received this
    /// event. An irreversible step pins the cursor LIB to the emitted
    /// block itself so the token never claims finality above its block.
    pub fn cursor(&self) -> Cursor {
        let lib = if self.step.intersects(Step::Irreversible) {
            self.block.clone()
        } else {
            self.lib.clone()
        };
        Cursor {
            step: self.step,
            block: self.block.clone(),
            head_block: self.head_block.clone(),
            lib,
        }
    }
}

/// Receives ordered step events. Returning an error stops the owning
/// source; the error is propagated verbatim as the termination cause.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn process_step(&self, block: &Arc<Block>, event: &ForkableEvent) -> Result<()>;
}

/// Suppresses events for blocks below a configured start, so a stream
/// can resume "at block N" while the forkable still rebuilds its state
/// from the LIB below.
pub struct MinimalBlockNumFilter {
    min_block_num: u64,
    downstream: Arc<dyn StepHandler>,
}

impl MinimalBlockNumFilter {
    pub fn new(min_block_num: u64, downstream: Arc<dyn StepHandler>) -> Self {
        Self {
            min_block_num,
            downstream,
        }
    }
}

#[async_trait]
impl StepHandler for MinimalBlockNumFilter {
    async fn process_step(&self, block: &Arc<Block>, event: &ForkableEvent) -> Result<()> {
        if block.num < self.min_block_num {
            return Ok(());
        }
        self.downstream.process_step(block, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irreversible_cursor_pins_lib_to_block() {
        let event = ForkableEvent {
            step: Step::Irreversible,
            block: BlockRef::new("00000002a", 2),
            head_block: BlockRef::new("00000003a", 3),
            lib: BlockRef::new("00000001a", 1),
            step_index: 0,
            step_count: 1,
            step_blocks: vec![],
            obj: None,
        };
        assert_eq!(event.cursor().lib, BlockRef::new("00000002a", 2));

        let event = ForkableEvent {
            step: Step::New,
            ..event
        };
        assert_eq!(event.cursor().lib, BlockRef::new("00000001a", 1));
    }
}
