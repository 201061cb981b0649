//! Splices a historical file stream into a live tail.
//!
//! Blocks flow from the file source until one of them matches a block
//! already sitting in the live ring buffer; the buffer is replayed
//! from just after the match and the file source is stopped. Every
//! downstream call is serialised through one lock, so file and live
//! producers never interleave.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use config::Config;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::block::{Block, BlockId, BlockRef};
use crate::error::{CannotJoin, JoinedToLive};
use crate::handler::{BlockHandler, BlockObj};
use crate::shutter::Shutter;
use crate::sources::{Source, SourceFactory, SourceFromNumFactory};

const DEFAULT_BUFFER_SIZE: usize = 300;

#[derive(Debug, Clone, serde::Serialize)]
pub struct JoiningSourceConfig {
    /// Ring buffer of the most recent live blocks.
    pub buffer_size: usize,
    /// Delay the live source until this id comes out of the file
    /// stream, typically the previous irreversible id.
    pub target_block_id: Option<BlockId>,
    pub start_live_immediately: bool,
}

impl Default for JoiningSourceConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            target_block_id: None,
            start_live_immediately: true,
        }
    }
}

impl JoiningSourceConfig {
    pub fn with_target_block_id(id: BlockId) -> Self {
        Self {
            target_block_id: Some(id),
            start_live_immediately: false,
            ..Self::default()
        }
    }
}

impl From<Arc<Config>> for JoiningSourceConfig {
    fn from(config: Arc<Config>) -> Self {
        let defaults = Self::default();
        let target_block_id = config.get_string("join-target-block-id").ok().map(BlockId::from);
        Self {
            buffer_size: config
                .get_int("join-buffer-size")
                .map(|size| size.max(1) as usize)
                .unwrap_or(defaults.buffer_size),
            start_live_immediately: config
                .get_bool("start-live-immediately")
                .unwrap_or(target_block_id.is_none()),
            target_block_id,
        }
    }
}

struct JoinState {
    buffer: VecDeque<(Arc<Block>, Option<BlockObj>)>,
    joined: bool,
    last_file_block: Option<BlockRef>,
}

#[derive(Default)]
struct ChildSources {
    file: Option<Arc<dyn Source>>,
    live: Option<Arc<dyn Source>>,
}

pub struct JoiningSource {
    file_start_block: u64,
    file_source_factory: SourceFromNumFactory,
    live_source_factory: SourceFactory,
    handler: Arc<dyn BlockHandler>,
    config: JoiningSourceConfig,
    state: Mutex<JoinState>,
    children: std::sync::Mutex<ChildSources>,
    live_started: AtomicBool,
    shutter: Shutter,
}

impl JoiningSource {
    pub fn new(
        file_start_block: u64,
        file_source_factory: SourceFromNumFactory,
        live_source_factory: SourceFactory,
        handler: Arc<dyn BlockHandler>,
        config: JoiningSourceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            file_start_block,
            file_source_factory,
            live_source_factory,
            handler,
            config,
            state: Mutex::new(JoinState {
                buffer: VecDeque::new(),
                joined: false,
                last_file_block: None,
            }),
            children: std::sync::Mutex::new(ChildSources::default()),
            live_started: AtomicBool::new(false),
            shutter: Shutter::new(),
        })
    }

    async fn on_file_block(
        self: &Arc<Self>,
        block: &Arc<Block>,
        obj: Option<&BlockObj>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.joined {
            return Err(JoinedToLive.into());
        }

        if let Some(pos) = state.buffer.iter().position(|(b, _)| b.id == block.id) {
            info!(
                block = %block,
                replayed = state.buffer.len() - pos - 1,
                "file stream reached the live buffer, switching to live"
            );
            self.handler.process_block(block, obj).await?;
            let tail: Vec<_> = state.buffer.drain(..).collect();
            for (b, o) in tail.into_iter().skip(pos + 1) {
                self.handler.process_block(&b, o.as_ref()).await?;
            }
            state.joined = true;
            // the sentinel stops the file source without marking the
            // stream as failed
            return Err(JoinedToLive.into());
        }

        self.handler.process_block(block, obj).await?;
        state.last_file_block = Some(Block::as_ref(block));

        let reached_target = self
            .config
            .target_block_id
            .as_ref()
            .is_some_and(|target| *target == block.id);
        drop(state);
        if reached_target {
            debug!(block = %block, "file stream reached target block, starting live source");
            self.start_live();
        }
        Ok(())
    }

    async fn on_live_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.joined {
            return self.handler.process_block(block, obj).await;
        }
        state.buffer.push_back((block.clone(), obj.cloned()));
        while state.buffer.len() > self.config.buffer_size.max(1) {
            state.buffer.pop_front();
        }
        Ok(())
    }

    /// The file source ended. Joined already: nothing to do. Clean
    /// end: splice the live buffer onto the last file block, or fail
    /// with cannot-join. Anything else is fatal for the stream.
    async fn on_file_done(&self, cause: Option<Arc<anyhow::Error>>) {
        match cause {
            Some(err) if err.is::<JoinedToLive>() => {}
            Some(err) => self.shutter.shutdown_shared(Some(err)),
            None => {
                if let Err(err) = self.join_from_buffer_tail().await {
                    self.shutter.shutdown(Some(err));
                }
            }
        }
    }

    async fn join_from_buffer_tail(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.joined {
            return Ok(());
        }

        let last = state
            .last_file_block
            .clone()
            .ok_or_else(|| anyhow!(CannotJoin("file stream produced no blocks".to_string())))?;

        let mut splice_from = None;
        for (pos, (b, _)) in state.buffer.iter().enumerate() {
            if b.id == last.id {
                splice_from = Some(pos + 1);
                break;
            }
            if b.previous_id == last.id {
                splice_from = Some(pos);
                break;
            }
        }
        let Some(pos) = splice_from else {
            return Err(CannotJoin(format!(
                "live buffer does not link to last file block {last}"
            ))
            .into());
        };

        info!(last_file_block = %last, replayed = state.buffer.len() - pos, "file stream ended, continuing from live buffer");
        let tail: Vec<_> = state.buffer.drain(..).collect();
        for (b, o) in tail.into_iter().skip(pos) {
            self.handler.process_block(&b, o.as_ref()).await?;
        }
        state.joined = true;
        Ok(())
    }

    fn start_live(self: &Arc<Self>) {
        if self.live_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let live_handler = Arc::new(LiveInput {
            joiner: Arc::downgrade(self),
        });
        let live = (self.live_source_factory)(live_handler);
        self.children.lock().expect("children lock").live = Some(live.clone());

        let joiner = self.clone();
        tokio::spawn(async move {
            live.clone().run().await;
            joiner.shutter.shutdown_shared(live.shutter().cause());
        });
    }
}

#[async_trait]
impl Source for JoiningSource {
    async fn run(self: Arc<Self>) {
        let file_handler = Arc::new(FileInput {
            joiner: Arc::downgrade(&self),
        });
        let file_source = (self.file_source_factory)(self.file_start_block, file_handler);
        self.children.lock().expect("children lock").file = Some(file_source.clone());

        if self.config.start_live_immediately || self.config.target_block_id.is_none() {
            self.start_live();
        }

        let joiner = self.clone();
        let file = file_source.clone();
        tokio::spawn(async move {
            file.clone().run().await;
            joiner.on_file_done(file.shutter().cause()).await;
        });

        self.shutter.terminated().await;

        let (file, live) = {
            let mut children = self.children.lock().expect("children lock");
            (children.file.take(), children.live.take())
        };
        if let Some(file) = file {
            file.shutdown(None);
        }
        if let Some(live) = live {
            live.shutdown(None);
        }
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

struct FileInput {
    joiner: Weak<JoiningSource>,
}

#[async_trait]
impl BlockHandler for FileInput {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        let Some(joiner) = self.joiner.upgrade() else {
            return Err(JoinedToLive.into());
        };
        joiner.on_file_block(block, obj).await
    }
}

struct LiveInput {
    joiner: Weak<JoiningSource>,
}

#[async_trait]
impl BlockHandler for LiveInput {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        let Some(joiner) = self.joiner.upgrade() else {
            return Err(anyhow!("joining source dropped"));
        };
        joiner.on_live_block(block, obj).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::codec::{bundle_name, encode_blocks};
    use crate::sources::{FileSource, FileSourceConfig};
    use crate::store::MemoryStore;
    use crate::testing::{bblock, BlockRecorder, TestSourceFactory};

    fn write_bundle(store: &MemoryStore, base: u64, blocks: &[Arc<Block>]) {
        let bytes = encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap();
        store.put(&bundle_name(base), bytes);
    }

    fn file_factory(store: Arc<MemoryStore>) -> SourceFromNumFactory {
        Arc::new(move |start_block_num, handler| {
            FileSource::new(
                store.clone(),
                FileSourceConfig {
                    start_block_num,
                    bundle_size: 2,
                    retry_delay: Duration::from_millis(5),
                    max_retry_delay: Duration::from_millis(10),
                    ..Default::default()
                },
                handler,
            ) as Arc<dyn Source>
        })
    }

    #[tokio::test]
    async fn handoff_delivers_every_block_exactly_once() {
        // S5: files produce 1..5 while the live buffer already holds
        // 4, 5, 6; the handoff must be invisible downstream
        let store = MemoryStore::unbounded();

        let (live_factory, mut created) = TestSourceFactory::new();
        let recorder = Arc::new(BlockRecorder::new());
        let joiner = JoiningSource::new(
            1,
            file_factory(store.clone()),
            live_factory.source_factory(),
            recorder.clone(),
            JoiningSourceConfig {
                buffer_size: 10,
                ..Default::default()
            },
        );
        let running = tokio::spawn(joiner.clone().run());

        let live = created.recv().await.unwrap();
        live.push(bblock("00000004a", "00000003a"), None).await.unwrap();
        live.push(bblock("00000005a", "00000004a"), None).await.unwrap();
        live.push(bblock("00000006a", "00000005a"), None).await.unwrap();

        // only now does history become available
        write_bundle(&store, 0, &[bblock("00000001a", "00000000a")]);
        write_bundle(
            &store,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );
        write_bundle(
            &store,
            4,
            &[
                bblock("00000004a", "00000003a"),
                bblock("00000005a", "00000004a"),
            ],
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while recorder.block_ids().len() < 6 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // once joined, live pushes flow straight through
        live.push(bblock("00000007a", "00000006a"), None).await.unwrap();

        joiner.shutdown(None);
        running.await.unwrap();

        assert_eq!(
            recorder.block_ids(),
            vec![
                "00000001a",
                "00000002a",
                "00000003a",
                "00000004a",
                "00000005a",
                "00000006a",
                "00000007a",
            ]
        );
    }

    #[tokio::test]
    async fn clean_file_end_splices_the_buffer_tail() {
        let (file_scripted, mut file_created) = TestSourceFactory::new();
        let (live_factory, mut created) = TestSourceFactory::new();
        let recorder = Arc::new(BlockRecorder::new());
        let joiner = JoiningSource::new(
            1,
            file_scripted.source_from_num_factory(),
            live_factory.source_factory(),
            recorder.clone(),
            JoiningSourceConfig::default(),
        );
        let running = tokio::spawn(joiner.clone().run());

        let file = file_created.recv().await.unwrap();
        let live = created.recv().await.unwrap();
        live.push(bblock("00000004a", "00000003a"), None).await.unwrap();
        live.push(bblock("00000005a", "00000004a"), None).await.unwrap();

        file.push(bblock("00000001a", "00000000a"), None).await.unwrap();
        file.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        file.push(bblock("00000003a", "00000002a"), None).await.unwrap();
        // clean end of the archive: the buffer's oldest block links to
        // the last file block, so the stream continues from the buffer
        file.shutdown(None);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while recorder.block_ids().len() < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        joiner.shutdown(None);
        running.await.unwrap();
        assert_eq!(
            recorder.block_ids(),
            vec![
                "00000001a",
                "00000002a",
                "00000003a",
                "00000004a",
                "00000005a",
            ]
        );
    }

    #[tokio::test]
    async fn unlinkable_buffer_fails_with_cannot_join() {
        let (file_scripted, mut file_created) = TestSourceFactory::new();
        let (live_factory, mut created) = TestSourceFactory::new();
        let recorder = Arc::new(BlockRecorder::new());
        let joiner = JoiningSource::new(
            1,
            file_scripted.source_from_num_factory(),
            live_factory.source_factory(),
            recorder.clone(),
            JoiningSourceConfig::default(),
        );
        let running = tokio::spawn(joiner.clone().run());

        let file = file_created.recv().await.unwrap();
        let live = created.recv().await.unwrap();
        // gap: 5's parent is 4, which files never produce
        live.push(bblock("00000005a", "00000004a"), None).await.unwrap();
        live.push(bblock("00000006a", "00000005a"), None).await.unwrap();

        file.push(bblock("00000001a", "00000000a"), None).await.unwrap();
        file.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        file.push(bblock("00000003a", "00000002a"), None).await.unwrap();
        file.shutdown(None);

        joiner.terminated().await;
        running.await.unwrap();

        let cause = joiner.shutter().cause().unwrap();
        assert!(cause.is::<CannotJoin>(), "unexpected cause: {cause:#}");
    }

    #[tokio::test]
    async fn live_starts_when_target_block_id_flows() {
        let store = MemoryStore::unbounded();
        write_bundle(&store, 0, &[bblock("00000001a", "00000000a")]);
        write_bundle(
            &store,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );

        let (live_factory, mut created) = TestSourceFactory::new();
        let recorder = Arc::new(BlockRecorder::new());
        let joiner = JoiningSource::new(
            1,
            file_factory(store.clone()),
            live_factory.source_factory(),
            recorder.clone(),
            JoiningSourceConfig::with_target_block_id("00000002a".into()),
        );
        let running = tokio::spawn(joiner.clone().run());

        // the live source is only created after block 2 flows from files
        let live = created.recv().await.unwrap();
        live.push(bblock("00000004a", "00000003a"), None).await.unwrap();

        write_bundle(
            &store,
            4,
            &[
                bblock("00000004a", "00000003a"),
                bblock("00000005a", "00000004a"),
            ],
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while recorder.block_ids().len() < 4 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        joiner.shutdown(None);
        running.await.unwrap();
        assert_eq!(
            recorder.block_ids(),
            vec!["00000001a", "00000002a", "00000003a", "00000004a"]
        );
    }
}
