//! Test fixtures: scriptable sources, recording sinks and compact
//! block constructors. Shipped in the crate so integration tests and
//! downstream consumers can drive pipelines by hand.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::block::{Block, BlockRef};
use crate::handler::{BlockHandler, BlockObj, ForkableEvent, StepHandler};
use crate::shutter::Shutter;
use crate::sources::{Source, SourceFactory, SourceFromNumFactory};
use crate::step::Step;

/// Height encoded in the first 8 hex characters of a test id, e.g.
/// `00000004a` is block 4 on fork `a`.
pub fn block_num_of(id: &str) -> u64 {
    if id.len() < 8 {
        return 0;
    }
    u64::from_str_radix(&id[..8], 16).unwrap_or(0)
}

pub fn bref(id: &str) -> BlockRef {
    BlockRef::new(id, block_num_of(id))
}

pub fn bblock(id: &str, previous_id: &str) -> Arc<Block> {
    bblock_lib(id, previous_id, 0)
}

pub fn bblock_lib(id: &str, previous_id: &str, lib_num: u64) -> Arc<Block> {
    let num = block_num_of(id);
    Arc::new(Block {
        id: id.into(),
        previous_id: previous_id.into(),
        num,
        lib_num,
        timestamp: num,
        ..Default::default()
    })
}

/// Flattened step event for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStep {
    pub step: Step,
    pub block_id: String,
    pub block_num: u64,
    pub head_id: String,
    pub lib_id: String,
    pub step_index: usize,
    pub step_count: usize,
    pub step_block_ids: Vec<String>,
}

impl RecordedStep {
    pub fn new(step: Step, block: &str, head: &str, lib: &str) -> Self {
        Self {
            step,
            block_id: block.to_string(),
            block_num: block_num_of(block),
            head_id: head.to_string(),
            lib_id: lib.to_string(),
            step_index: 0,
            step_count: 0,
            step_block_ids: Vec::new(),
        }
    }

    /// Annotate the expected batch position and contents.
    pub fn batch(mut self, index: usize, count: usize, ids: &[&str]) -> Self {
        self.step_index = index;
        self.step_count = count;
        self.step_block_ids = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn from_event(event: &ForkableEvent) -> Self {
        Self {
            step: event.step,
            block_id: event.block.id.to_string(),
            block_num: event.block.num,
            head_id: event.head_block.id.to_string(),
            lib_id: event.lib.id.to_string(),
            step_index: event.step_index,
            step_count: event.step_count,
            step_block_ids: event
                .step_blocks
                .iter()
                .map(|pp| pp.block.id.to_string())
                .collect(),
        }
    }
}

/// Step handler recording everything it receives, optionally failing
/// on a chosen step kind.
pub struct TestSink {
    steps: Mutex<Vec<RecordedStep>>,
    cursors: Mutex<Vec<String>>,
    fail_on: Option<(Step, String)>,
}

impl TestSink {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            cursors: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    pub fn fail_on(mut self, step: Step, message: &str) -> Self {
        self.fail_on = Some((step, message.to_string()));
        self
    }

    pub fn steps(&self) -> Vec<RecordedStep> {
        self.steps.lock().expect("sink lock").clone()
    }

    pub fn cursors(&self) -> Vec<String> {
        self.cursors.lock().expect("sink lock").clone()
    }
}

#[async_trait]
impl StepHandler for TestSink {
    async fn process_step(&self, _block: &Arc<Block>, event: &ForkableEvent) -> Result<()> {
        if let Some((step, message)) = &self.fail_on {
            if event.step.intersects(*step) {
                bail!("{message}");
            }
        }
        self.steps
            .lock()
            .expect("sink lock")
            .push(RecordedStep::from_event(event));
        self.cursors
            .lock()
            .expect("sink lock")
            .push(event.cursor().to_string());
        Ok(())
    }
}

/// Block handler recording raw delivery order, optionally failing once
/// a configured id arrives.
pub struct BlockRecorder {
    seen: Mutex<Vec<String>>,
    fail_on: Option<(String, String)>,
}

impl BlockRecorder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    pub fn fail_on(mut self, id: &str, message: &str) -> Self {
        self.fail_on = Some((id.to_string(), message.to_string()));
        self
    }

    pub fn block_ids(&self) -> Vec<String> {
        self.seen.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl BlockHandler for BlockRecorder {
    async fn process_block(&self, block: &Arc<Block>, _obj: Option<&BlockObj>) -> Result<()> {
        if let Some((id, message)) = &self.fail_on {
            if block.id.as_str() == id {
                bail!("{message}");
            }
        }
        self.seen
            .lock()
            .expect("recorder lock")
            .push(block.id.to_string());
        Ok(())
    }
}

/// Hand-driven source: the test pushes blocks synchronously through
/// the handler and decides when the source ends.
pub struct TestSource {
    pub start_block_num: u64,
    handler: Arc<dyn BlockHandler>,
    shutter: Shutter,
}

impl TestSource {
    pub fn new(start_block_num: u64, handler: Arc<dyn BlockHandler>) -> Arc<Self> {
        Arc::new(Self {
            start_block_num,
            handler,
            shutter: Shutter::new(),
        })
    }

    /// Forward one block to the installed handler; the handler's error
    /// comes back to the caller, as a live push would.
    pub async fn push(&self, block: Arc<Block>, obj: Option<BlockObj>) -> Result<()> {
        if self.shutter.is_terminated() {
            bail!("source is terminated");
        }
        self.handler.process_block(&block, obj.as_ref()).await
    }
}

#[async_trait]
impl Source for TestSource {
    async fn run(self: Arc<Self>) {
        self.shutter.terminated().await;
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

/// Factory handing each created source back to the test through a
/// channel, so the test can script it.
pub struct TestSourceFactory {
    created: mpsc::UnboundedSender<Arc<TestSource>>,
}

impl TestSourceFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<TestSource>>) {
        let (created, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { created }), rx)
    }

    pub fn source_factory(self: &Arc<Self>) -> SourceFactory {
        let factory = self.clone();
        Arc::new(move |handler| {
            let source = TestSource::new(0, handler);
            let _ = factory.created.send(source.clone());
            source as Arc<dyn Source>
        })
    }

    pub fn source_from_num_factory(self: &Arc<Self>) -> SourceFromNumFactory {
        let factory = self.clone();
        Arc::new(move |start_block_num, handler| {
            let source = TestSource::new(start_block_num, handler);
            let _ = factory.created.send(source.clone());
            source as Arc<dyn Source>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_encode_their_height() {
        assert_eq!(block_num_of("00000004a"), 4);
        assert_eq!(block_num_of("0000000aa"), 10);
        assert_eq!(bref("00000008b").num, 8);
    }

    #[tokio::test]
    async fn test_source_forwards_pushes_and_errors() {
        let recorder = Arc::new(BlockRecorder::new().fail_on("00000003a", "boom"));
        let source = TestSource::new(0, recorder.clone());

        source.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        let err = source
            .push(bblock("00000003a", "00000002a"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(recorder.block_ids(), vec!["00000002a"]);

        source.shutdown(None);
        assert!(source.push(bblock("00000004a", "00000003a"), None).await.is_err());
    }
}
