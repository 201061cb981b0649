//! Source reading consecutive bundled block files from object storage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::Config;
use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::codec::{bundle_base, bundle_name, decode_blocks};
use crate::handler::{BlockHandler, BlockObj};
use crate::shutter::Shutter;
use crate::sources::Source;
use crate::store::{ObjectStore, StoreError};

const DEFAULT_BUNDLE_SIZE: u64 = 100;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 8_000;

/// Preprocessing applied to each decoded block, possibly in parallel.
pub type PreprocessFunc = Arc<dyn Fn(Arc<Block>) -> Result<BlockObj> + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileSourceConfig {
    pub start_block_num: u64,
    pub bundle_size: u64,
    /// Upper bound on concurrently preprocessed blocks.
    pub preprocess_parallelism: usize,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            start_block_num: 0,
            bundle_size: DEFAULT_BUNDLE_SIZE,
            preprocess_parallelism: 1,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
        }
    }
}

impl From<Arc<Config>> for FileSourceConfig {
    fn from(config: Arc<Config>) -> Self {
        let defaults = Self::default();
        Self {
            start_block_num: config.get_int("start-block-num").map(|n| n.max(0) as u64).unwrap_or(0),
            bundle_size: config
                .get_int("bundle-size")
                .map(|n| n.max(1) as u64)
                .unwrap_or(defaults.bundle_size),
            preprocess_parallelism: config
                .get_int("preprocess-parallelism")
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.preprocess_parallelism),
            retry_delay: config
                .get_int("retry-delay-ms")
                .map(|ms| Duration::from_millis(ms.max(1) as u64))
                .unwrap_or(defaults.retry_delay),
            max_retry_delay: config
                .get_int("max-retry-delay-ms")
                .map(|ms| Duration::from_millis(ms.max(1) as u64))
                .unwrap_or(defaults.max_retry_delay),
        }
    }
}

/// Streams bundles in ascending order, handing every block to the
/// handler strictly ordered. Missing bundles are polled with
/// exponential backoff unless every store is bounded, in which case
/// they end the stream.
pub struct FileSource {
    store: Arc<dyn ObjectStore>,
    secondary_stores: Vec<Arc<dyn ObjectStore>>,
    config: FileSourceConfig,
    preprocess: Option<PreprocessFunc>,
    handler: Arc<dyn BlockHandler>,
    shutter: Shutter,
}

impl FileSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: FileSourceConfig,
        handler: Arc<dyn BlockHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            secondary_stores: Vec::new(),
            config,
            preprocess: None,
            handler,
            shutter: Shutter::new(),
        })
    }

    pub fn with_secondary_stores(
        store: Arc<dyn ObjectStore>,
        secondary_stores: Vec<Arc<dyn ObjectStore>>,
        config: FileSourceConfig,
        handler: Arc<dyn BlockHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            secondary_stores,
            config,
            preprocess: None,
            handler,
            shutter: Shutter::new(),
        })
    }

    pub fn with_preprocess(
        store: Arc<dyn ObjectStore>,
        config: FileSourceConfig,
        preprocess: PreprocessFunc,
        handler: Arc<dyn BlockHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            secondary_stores: Vec::new(),
            config,
            preprocess: Some(preprocess),
            handler,
            shutter: Shutter::new(),
        })
    }

    async fn stream_bundles(&self) -> Result<()> {
        let mut base = bundle_base(self.config.start_block_num, self.config.bundle_size);
        info!(
            start_block = self.config.start_block_num,
            first_bundle = base,
            "file source starting"
        );

        loop {
            if self.shutter.is_terminated() {
                return Ok(());
            }
            let Some(bytes) = self.fetch_bundle(base).await? else {
                debug!(bundle = base, "no more bundles");
                return Ok(());
            };
            let blocks =
                decode_blocks(&bytes).with_context(|| format!("decoding bundle {base}"))?;
            self.deliver(blocks).await?;
            base += self.config.bundle_size;
        }
    }

    /// Fetch one bundle, polling while it is missing. `None` means the
    /// stream is over: every store is bounded and none has the bundle.
    async fn fetch_bundle(&self, base: u64) -> Result<Option<Vec<u8>>> {
        let name = bundle_name(base);
        let mut delay = self.config.retry_delay;
        loop {
            let mut all_bounded = true;
            for store in std::iter::once(&self.store).chain(self.secondary_stores.iter()) {
                match store.open_object(&name).await {
                    Ok(bytes) => return Ok(Some(bytes)),
                    Err(StoreError::NotFound(_)) => {
                        all_bounded &= store.is_bounded();
                    }
                    Err(err) => {
                        // transient storage trouble, retried like a
                        // missing file
                        warn!(bundle = %name, error = %err, "bundle read failed");
                        all_bounded = false;
                    }
                }
            }
            if all_bounded {
                return Ok(None);
            }

            debug!(bundle = %name, delay_ms = delay.as_millis() as u64, "bundle not found, waiting");
            tokio::select! {
                _ = self.shutter.terminated() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_retry_delay);
        }
    }

    /// Preprocess in parallel under an ordering barrier, then deliver
    /// strictly ascending.
    async fn deliver(&self, blocks: Vec<Block>) -> Result<()> {
        let blocks: Vec<Arc<Block>> = blocks
            .into_iter()
            .filter(|block| block.num >= self.config.start_block_num)
            .map(Arc::new)
            .collect();

        let objs: Vec<Option<BlockObj>> = match &self.preprocess {
            None => vec![None; blocks.len()],
            Some(preprocess) => {
                let semaphore = Arc::new(Semaphore::new(self.config.preprocess_parallelism.max(1)));
                let tasks = blocks.iter().cloned().map(|block| {
                    let preprocess = preprocess.clone();
                    let semaphore = semaphore.clone();
                    tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        preprocess(block)
                    })
                });
                try_join_all(tasks)
                    .await
                    .context("preprocess task panicked")?
                    .into_iter()
                    .map(|result| result.map(Some))
                    .collect::<Result<_>>()?
            }
        };

        for (block, obj) in blocks.into_iter().zip(objs) {
            if self.shutter.is_terminated() {
                return Ok(());
            }
            self.handler.process_block(&block, obj.as_ref()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Source for FileSource {
    async fn run(self: Arc<Self>) {
        let result = self.stream_bundles().await;
        self.shutter.shutdown(result.err());
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_blocks;
    use crate::store::MemoryStore;
    use crate::testing::{bblock, BlockRecorder};

    fn write_bundle(store: &MemoryStore, base: u64, blocks: &[Arc<Block>]) {
        let bytes = encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap();
        store.put(&bundle_name(base), bytes);
    }

    fn small_config(start: u64) -> FileSourceConfig {
        FileSourceConfig {
            start_block_num: start,
            bundle_size: 2,
            retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_bundles_in_order_until_store_runs_dry() {
        let store = MemoryStore::new();
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

        let recorder = Arc::new(BlockRecorder::new());
        let source = FileSource::new(store, small_config(2), recorder.clone());
        source.clone().run().await;

        assert!(source.shutter().cause().is_none());
        assert_eq!(
            recorder.block_ids(),
            vec!["00000002a", "00000003a", "00000004a", "00000005a"]
        );
    }

    #[tokio::test]
    async fn start_block_skips_the_bundle_prefix() {
        let store = MemoryStore::new();
        write_bundle(
            &store,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );

        let recorder = Arc::new(BlockRecorder::new());
        let source = FileSource::new(store, small_config(3), recorder.clone());
        source.clone().run().await;

        assert_eq!(recorder.block_ids(), vec!["00000003a"]);
    }

    #[tokio::test]
    async fn polls_until_the_missing_bundle_appears() {
        let store = MemoryStore::unbounded();
        write_bundle(
            &store,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );

        let recorder = Arc::new(BlockRecorder::new());
        let source = FileSource::new(store.clone(), small_config(2), recorder.clone());
        let running = tokio::spawn(source.clone().run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        write_bundle(
            &store,
            4,
            &[
                bblock("00000004a", "00000003a"),
                bblock("00000005a", "00000004a"),
            ],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.shutdown(None);
        running.await.unwrap();

        assert_eq!(
            recorder.block_ids(),
            vec!["00000002a", "00000003a", "00000004a", "00000005a"]
        );
    }

    #[tokio::test]
    async fn secondary_store_fills_gaps() {
        let primary = MemoryStore::new();
        let secondary = MemoryStore::new();
        write_bundle(
            &primary,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );
        write_bundle(
            &secondary,
            4,
            &[
                bblock("00000004a", "00000003a"),
                bblock("00000005a", "00000004a"),
            ],
        );

        let recorder = Arc::new(BlockRecorder::new());
        let source = FileSource::with_secondary_stores(
            primary,
            vec![secondary],
            small_config(2),
            recorder.clone(),
        );
        source.clone().run().await;

        assert_eq!(
            recorder.block_ids(),
            vec!["00000002a", "00000003a", "00000004a", "00000005a"]
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_the_termination_cause() {
        let store = MemoryStore::new();
        write_bundle(
            &store,
            2,
            &[
                bblock("00000002a", "00000001a"),
                bblock("00000003a", "00000002a"),
            ],
        );

        let recorder = Arc::new(BlockRecorder::new().fail_on("00000003a", "downstream failed"));
        let source = FileSource::new(store, small_config(2), recorder);
        source.clone().run().await;

        assert_eq!(
            source.shutter().cause().unwrap().to_string(),
            "downstream failed"
        );
    }

    #[tokio::test]
    async fn preprocess_results_arrive_in_block_order() {
        let store = MemoryStore::new();
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

        struct ObjRecorder {
            nums: std::sync::Mutex<Vec<u64>>,
        }
        #[async_trait]
        impl BlockHandler for ObjRecorder {
            async fn process_block(
                &self,
                _block: &Arc<Block>,
                obj: Option<&BlockObj>,
            ) -> Result<()> {
                let num = obj
                    .and_then(|obj| obj.downcast_ref::<u64>())
                    .copied()
                    .expect("preprocessed object");
                self.nums.lock().unwrap().push(num);
                Ok(())
            }
        }

        let recorder = Arc::new(ObjRecorder {
            nums: std::sync::Mutex::new(Vec::new()),
        });
        let preprocess: PreprocessFunc = Arc::new(|block| Ok(Arc::new(block.num) as BlockObj));
        let source = FileSource::with_preprocess(
            store,
            FileSourceConfig {
                preprocess_parallelism: 4,
                ..small_config(2)
            },
            preprocess,
            recorder.clone(),
        );
        source.clone().run().await;

        assert_eq!(*recorder.nums.lock().unwrap(), vec![2, 3, 4, 5]);
    }
}
