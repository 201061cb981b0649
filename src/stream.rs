//! Single-consumer stream assembly: block stores, an optional live
//! tail, start/stop bounds, cursor resumption and step filtering wired
//! into one runnable source.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::block::{Block, BlockRef, ChainConfig};
use crate::cursor::Cursor;
use crate::error::{InvalidArg, StopBlockReached};
use crate::forkable::{relative_lib_num_getter, Forkable};
use crate::handler::{ForkableEvent, MinimalBlockNumFilter, StepHandler};
use crate::sources::{
    FileSource, FileSourceConfig, JoiningSource, JoiningSourceConfig, PreprocessFunc, Source,
    SourceFactory, SourceFromNumFactory,
};
use crate::step::Step;
use crate::store::ObjectStore;

/// Resolves the current chain head, for negative (head-relative) start
/// blocks.
pub type HeadRefGetter = Arc<dyn Fn() -> BoxFuture<'static, Result<BlockRef>> + Send + Sync>;

pub struct StreamBuilder {
    chain: Arc<ChainConfig>,
    handler: Arc<dyn StepHandler>,
    block_stores: Vec<Arc<dyn ObjectStore>>,
    live_source_factory: Option<SourceFactory>,
    start_block_num: i64,
    stop_block_num: u64,
    cursor: Option<Cursor>,
    steps: Step,
    confirmations: u64,
    head_ref_getter: Option<HeadRefGetter>,
    preprocess: Option<PreprocessFunc>,
    file_config: FileSourceConfig,
    joining_buffer_size: usize,
}

impl StreamBuilder {
    pub fn new(chain: Arc<ChainConfig>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            chain,
            handler,
            block_stores: Vec::new(),
            live_source_factory: None,
            start_block_num: 0,
            stop_block_num: 0,
            cursor: None,
            steps: Step::all_steps(),
            confirmations: 0,
            head_ref_getter: None,
            preprocess: None,
            file_config: FileSourceConfig::default(),
            joining_buffer_size: JoiningSourceConfig::default().buffer_size,
        }
    }

    /// Add one block store. The first is primary; later ones are
    /// probed for missing bundles.
    pub fn with_block_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.block_stores.push(store);
        self
    }

    pub fn with_block_stores(mut self, stores: Vec<Arc<dyn ObjectStore>>) -> Self {
        self.block_stores = stores;
        self
    }

    pub fn with_live_source_factory(mut self, factory: SourceFactory) -> Self {
        self.live_source_factory = Some(factory);
        self
    }

    /// Negative values are relative to the head resolved through the
    /// configured head getter.
    pub fn with_start_block(mut self, start_block_num: i64) -> Self {
        self.start_block_num = start_block_num;
        self
    }

    /// Delivery of the stop block is followed by the
    /// [`StopBlockReached`] sentinel. Zero disables the bound.
    pub fn with_stop_block(mut self, stop_block_num: u64) -> Self {
        self.stop_block_num = stop_block_num;
        self
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        if !cursor.is_empty() {
            self.cursor = Some(cursor);
        }
        self
    }

    pub fn with_steps(mut self, steps: Step) -> Self {
        self.steps = steps;
        self
    }

    /// Derive irreversibility as `head - confirmations` instead of the
    /// blocks' own declarations.
    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn with_head_ref_getter(mut self, getter: HeadRefGetter) -> Self {
        self.head_ref_getter = Some(getter);
        self
    }

    pub fn with_preprocess(mut self, preprocess: PreprocessFunc) -> Self {
        self.preprocess = Some(preprocess);
        self
    }

    pub fn with_file_config(mut self, config: FileSourceConfig) -> Self {
        self.file_config = config;
        self
    }

    /// Validate and assemble. Construction errors are immediate and
    /// never retried.
    pub async fn build(self) -> Result<Arc<dyn Source>> {
        if self.block_stores.is_empty() {
            return Err(InvalidArg("at least one block store is required".to_string()).into());
        }

        let absolute_start = self.resolve_start_block().await?;
        let absolute_start = absolute_start.max(self.chain.first_streamable_block);
        if self.stop_block_num > 0 && absolute_start > self.stop_block_num {
            return Err(InvalidArg(format!(
                "start block {absolute_start} is after stop block {}",
                self.stop_block_num
            ))
            .into());
        }

        let mut handler = self.handler.clone();
        if self.stop_block_num > 0 {
            handler = Arc::new(StopBlockHandler {
                stop_block_num: self.stop_block_num,
                downstream: handler,
            });
        }
        handler = Arc::new(MinimalBlockNumFilter::new(absolute_start, handler));

        let mut forkable = Forkable::builder(self.chain.clone(), handler).with_filters(self.steps);
        if self.confirmations > 0 {
            forkable = forkable.with_custom_libnum_getter(relative_lib_num_getter(
                self.chain.first_streamable_block,
                self.confirmations,
            ));
        }

        let (file_start_block, joining_config) = match &self.cursor {
            Some(cursor) => {
                // the forkable's gate does the heavy lifting; files
                // only need to restart at the cursor's irreversible
                // block
                forkable = forkable.from_cursor(cursor.clone());
                let file_start = cursor.lib.num.max(self.chain.first_streamable_block);
                let mut config = JoiningSourceConfig::with_target_block_id(cursor.lib.id.clone());
                config.buffer_size = self.joining_buffer_size;
                (file_start, config)
            }
            None => (
                absolute_start,
                JoiningSourceConfig {
                    buffer_size: self.joining_buffer_size,
                    ..Default::default()
                },
            ),
        };
        let forkable = forkable.build();

        info!(
            start_block = absolute_start,
            stop_block = self.stop_block_num,
            file_start_block,
            live = self.live_source_factory.is_some(),
            "stream assembled"
        );

        let stores = self.block_stores.clone();
        let file_config = self.file_config.clone();
        let preprocess = self.preprocess.clone();
        let file_source_factory: SourceFromNumFactory = Arc::new(move |start, handler| {
            let config = FileSourceConfig {
                start_block_num: start,
                ..file_config.clone()
            };
            let source = match &preprocess {
                Some(preprocess) => FileSource::with_preprocess(
                    stores[0].clone(),
                    config,
                    preprocess.clone(),
                    handler,
                ),
                None if stores.len() > 1 => FileSource::with_secondary_stores(
                    stores[0].clone(),
                    stores[1..].to_vec(),
                    config,
                    handler,
                ),
                None => FileSource::new(stores[0].clone(), config, handler),
            };
            source as Arc<dyn Source>
        });

        match self.live_source_factory {
            Some(live_source_factory) => Ok(JoiningSource::new(
                file_start_block,
                file_source_factory,
                live_source_factory,
                forkable,
                joining_config,
            ) as Arc<dyn Source>),
            None => Ok(file_source_factory(file_start_block, forkable)),
        }
    }

    async fn resolve_start_block(&self) -> Result<u64> {
        if self.start_block_num >= 0 {
            return Ok(self.start_block_num as u64);
        }
        let Some(getter) = &self.head_ref_getter else {
            return Err(InvalidArg(format!(
                "negative start block {} requires a head tracker",
                self.start_block_num
            ))
            .into());
        };
        let head = getter().await?;
        Ok(head.num.saturating_sub(self.start_block_num.unsigned_abs()))
    }
}

/// Terminates the stream once the stop block has been delivered.
struct StopBlockHandler {
    stop_block_num: u64,
    downstream: Arc<dyn StepHandler>,
}

#[async_trait]
impl StepHandler for StopBlockHandler {
    async fn process_step(&self, block: &Arc<Block>, event: &ForkableEvent) -> Result<()> {
        if block.num > self.stop_block_num {
            return Err(StopBlockReached.into());
        }
        self.downstream.process_step(block, event).await?;
        if block.num == self.stop_block_num {
            return Err(StopBlockReached.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::{bundle_name, encode_blocks};
    use crate::store::MemoryStore;
    use crate::testing::{bblock_lib, bref, RecordedStep, TestSink};

    fn chain() -> Arc<ChainConfig> {
        Arc::new(ChainConfig::new(1))
    }

    fn store_with_chain() -> Arc<MemoryStore> {
        // one bundle holding 1..6, each declaring its parent final
        let store = MemoryStore::new();
        let blocks: Vec<_> = (1..=6u64)
            .map(|num| {
                bblock_lib(
                    &format!("{num:08x}a"),
                    &format!("{:08x}a", num.saturating_sub(1)),
                    num.saturating_sub(1),
                )
            })
            .collect();
        store.put(
            &bundle_name(0),
            encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap(),
        );
        store
    }

    fn small_file_config() -> FileSourceConfig {
        FileSourceConfig {
            retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_after_stop_is_rejected() {
        let sink = Arc::new(TestSink::new());
        let err = StreamBuilder::new(chain(), sink)
            .with_block_store(store_with_chain())
            .with_start_block(10)
            .with_stop_block(5)
            .build()
            .await
            .err()
            .unwrap();
        assert!(err.is::<InvalidArg>());
    }

    #[tokio::test]
    async fn negative_start_without_tracker_is_rejected() {
        let sink = Arc::new(TestSink::new());
        let err = StreamBuilder::new(chain(), sink)
            .with_block_store(store_with_chain())
            .with_start_block(-10)
            .build()
            .await
            .err()
            .unwrap();
        assert!(err.is::<InvalidArg>());
    }

    #[tokio::test]
    async fn missing_stores_are_rejected() {
        let sink = Arc::new(TestSink::new());
        let err = StreamBuilder::new(chain(), Arc::clone(&sink) as Arc<dyn StepHandler>)
            .build()
            .await
            .err()
            .unwrap();
        assert!(err.is::<InvalidArg>());
    }

    #[tokio::test]
    async fn file_only_stream_stops_at_the_stop_block() {
        let sink = Arc::new(TestSink::new());
        let source = StreamBuilder::new(chain(), sink.clone())
            .with_block_store(store_with_chain())
            .with_start_block(1)
            .with_stop_block(4)
            .with_file_config(small_file_config())
            .build()
            .await
            .unwrap();

        source.clone().run().await;

        let cause = source.shutter().cause().unwrap();
        assert!(cause.is::<StopBlockReached>(), "cause: {cause:#}");
        assert_eq!(
            sink.steps(),
            vec![
                RecordedStep::new(Step::New, "00000001a", "00000001a", "00000001a"),
                RecordedStep::new(Step::Irreversible, "00000001a", "00000001a", "00000001a")
                    .batch(0, 1, &["00000001a"]),
                RecordedStep::new(Step::New, "00000002a", "00000002a", "00000001a"),
                RecordedStep::new(Step::New, "00000003a", "00000003a", "00000001a"),
                RecordedStep::new(Step::Irreversible, "00000002a", "00000003a", "00000002a")
                    .batch(0, 1, &["00000002a"]),
                RecordedStep::new(Step::New, "00000004a", "00000004a", "00000002a"),
            ]
        );
    }

    #[tokio::test]
    async fn negative_start_resolves_through_the_head_tracker() {
        let sink = Arc::new(TestSink::new());
        let getter: HeadRefGetter =
            Arc::new(|| Box::pin(async { Ok(bref("00000006a")) }));
        let source = StreamBuilder::new(chain(), sink.clone())
            .with_block_store(store_with_chain())
            .with_start_block(-2)
            .with_head_ref_getter(getter)
            .with_file_config(small_file_config())
            .build()
            .await
            .unwrap();

        source.clone().run().await;
        assert!(source.shutter().cause().is_none());

        assert_eq!(
            sink.steps(),
            vec![
                RecordedStep::new(Step::New, "00000004a", "00000004a", "00000003a"),
                RecordedStep::new(Step::New, "00000005a", "00000005a", "00000003a"),
                RecordedStep::new(Step::Irreversible, "00000004a", "00000005a", "00000004a")
                    .batch(0, 1, &["00000004a"]),
                RecordedStep::new(Step::New, "00000006a", "00000006a", "00000004a"),
                RecordedStep::new(Step::Irreversible, "00000005a", "00000006a", "00000005a")
                    .batch(0, 1, &["00000005a"]),
            ]
        );
    }

    #[tokio::test]
    async fn cursor_stream_replays_files_and_resumes_after_the_cursor() {
        let sink = Arc::new(TestSink::new());
        let cursor = Cursor {
            step: Step::New,
            block: bref("00000004a"),
            head_block: bref("00000004a"),
            lib: bref("00000002a"),
        };
        let source = StreamBuilder::new(chain(), sink.clone())
            .with_block_store(store_with_chain())
            .with_start_block(4)
            .with_cursor(cursor)
            .with_file_config(small_file_config())
            .build()
            .await
            .unwrap();

        source.clone().run().await;
        assert!(source.shutter().cause().is_none());

        let steps = sink.steps();
        let ids: Vec<&str> = steps
            .iter()
            .filter(|s| s.step == Step::New)
            .map(|s| s.block_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["00000005a", "00000006a"]);
    }
}
