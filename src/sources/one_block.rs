//! Source over single-block archival files, used by the hub to
//! backfill the gap between bundles and the live tail.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::{decode_blocks, parse_one_block_name};
use crate::handler::BlockHandler;
use crate::shutter::Shutter;
use crate::sources::{Source, SourceFromNumFactory};
use crate::store::ObjectStore;

/// Walks the store's one-block files from a start height and feeds
/// them in name order, then terminates cleanly.
pub struct OneBlockSource {
    store: Arc<dyn ObjectStore>,
    start_block_num: u64,
    handler: Arc<dyn BlockHandler>,
    shutter: Shutter,
}

impl OneBlockSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        start_block_num: u64,
        handler: Arc<dyn BlockHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            start_block_num,
            handler,
            shutter: Shutter::new(),
        })
    }

    /// Factory shape the hub consumes.
    pub fn factory(store: Arc<dyn ObjectStore>) -> SourceFromNumFactory {
        Arc::new(move |start_block_num, handler| {
            OneBlockSource::new(store.clone(), start_block_num, handler) as Arc<dyn Source>
        })
    }

    async fn stream(&self) -> Result<()> {
        let start = format!("{:010}", self.start_block_num);
        let names = self.store.walk_from("", &start).await?;
        debug!(start = %start, files = names.len(), "one-block walk");

        for name in names {
            if self.shutter.is_terminated() {
                return Ok(());
            }
            if parse_one_block_name(&name).is_none() {
                warn!(file = %name, "skipping non one-block file");
                continue;
            }
            let bytes = self.store.open_object(&name).await?;
            let blocks =
                decode_blocks(&bytes).with_context(|| format!("decoding one-block file {name}"))?;
            for block in blocks {
                self.handler.process_block(&Arc::new(block), None).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Source for OneBlockSource {
    async fn run(self: Arc<Self>) {
        let result = self.stream().await;
        self.shutter.shutdown(result.err());
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_blocks, one_block_name};
    use crate::store::MemoryStore;
    use crate::testing::{bblock_lib, BlockRecorder};

    #[tokio::test]
    async fn feeds_one_block_files_in_order_then_stops() {
        let store = MemoryStore::new();
        for (id, prev) in [
            ("00000003a", "00000002a"),
            ("00000005a", "00000004a"),
            ("00000004a", "00000003a"),
        ] {
            let block = bblock_lib(id, prev, 2);
            store.put(
                &one_block_name(&block),
                encode_blocks([block.as_ref()]).unwrap(),
            );
        }
        store.put("not-a-block", vec![1, 2, 3]);

        let recorder = Arc::new(BlockRecorder::new());
        let source = OneBlockSource::new(store, 4, recorder.clone());
        source.clone().run().await;

        assert!(source.is_terminated());
        assert!(source.shutter().cause().is_none());
        // the walk starts at height 4; names sort by padded number
        assert_eq!(recorder.block_ids(), vec!["00000004a", "00000005a"]);
    }
}
