//! Push-driven live tail.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use config::Config;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::block::Block;
use crate::handler::{BlockHandler, BlockObj};
use crate::shutter::Shutter;
use crate::sources::Source;

const DEFAULT_BUFFER_SIZE: usize = 256;

/// What `push` does when the internal queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum OverflowPolicy {
    /// Apply backpressure to the producer.
    #[default]
    Block,
    /// Fail the push with an overflow error.
    Reject,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LiveSourceConfig {
    pub buffer_size: usize,
    pub overflow: OverflowPolicy,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl From<Arc<Config>> for LiveSourceConfig {
    fn from(config: Arc<Config>) -> Self {
        let defaults = Self::default();
        Self {
            buffer_size: config
                .get_int("live-buffer-size")
                .map(|size| size.max(1) as usize)
                .unwrap_or(defaults.buffer_size),
            overflow: match config.get_string("live-overflow").as_deref() {
                Ok("reject") => OverflowPolicy::Reject,
                _ => defaults.overflow,
            },
        }
    }
}

type QueueItem = (Arc<Block>, Option<BlockObj>);

/// The producer calls [`LiveSource::push`]; the run task drains the
/// bounded queue into the handler one block at a time.
pub struct LiveSource {
    handler: Arc<dyn BlockHandler>,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    overflow: OverflowPolicy,
    shutter: Shutter,
}

impl LiveSource {
    pub fn new(handler: Arc<dyn BlockHandler>, config: LiveSourceConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        Arc::new(Self {
            handler,
            tx,
            rx: Mutex::new(Some(rx)),
            overflow: config.overflow,
            shutter: Shutter::new(),
        })
    }

    /// Enqueue one block from the producer.
    pub async fn push(&self, block: Arc<Block>, obj: Option<BlockObj>) -> Result<()> {
        if self.shutter.is_terminated() {
            bail!("live source is terminated");
        }
        match self.overflow {
            OverflowPolicy::Block => {
                if self.tx.send((block, obj)).await.is_err() {
                    bail!("live source is terminated");
                }
            }
            OverflowPolicy::Reject => {
                use mpsc::error::TrySendError;
                match self.tx.try_send((block, obj)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => bail!("live source buffer overflow"),
                    Err(TrySendError::Closed(_)) => bail!("live source is terminated"),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Source for LiveSource {
    async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutter.terminated() => return,
                item = rx.recv() => {
                    let Some((block, obj)) = item else { return };
                    debug!(block = %block, "live block");
                    if let Err(err) = self.handler.process_block(&block, obj.as_ref()).await {
                        self.shutter.shutdown(Some(err));
                        return;
                    }
                }
            }
        }
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bblock, BlockRecorder};

    #[tokio::test]
    async fn pushes_flow_in_order() {
        let recorder = Arc::new(BlockRecorder::new());
        let source = LiveSource::new(recorder.clone(), LiveSourceConfig::default());
        let running = tokio::spawn(source.clone().run());

        source.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        source.push(bblock("00000003a", "00000002a"), None).await.unwrap();
        tokio::task::yield_now().await;

        source.shutdown(None);
        running.await.unwrap();
        assert_eq!(recorder.block_ids(), vec!["00000002a", "00000003a"]);
    }

    #[tokio::test]
    async fn handler_error_terminates_the_source() {
        let recorder = Arc::new(BlockRecorder::new().fail_on("00000003a", "sink failed"));
        let source = LiveSource::new(recorder, LiveSourceConfig::default());
        let running = tokio::spawn(source.clone().run());

        source.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        source.push(bblock("00000003a", "00000002a"), None).await.unwrap();
        running.await.unwrap();

        assert!(source.is_terminated());
        assert_eq!(
            source.shutter().cause().unwrap().to_string(),
            "sink failed"
        );
        assert!(source.push(bblock("00000004a", "00000003a"), None).await.is_err());
    }

    #[tokio::test]
    async fn reject_policy_reports_overflow() {
        let recorder = Arc::new(BlockRecorder::new());
        let source = LiveSource::new(
            recorder,
            LiveSourceConfig {
                buffer_size: 1,
                overflow: OverflowPolicy::Reject,
            },
        );
        // not running: the queue fills immediately
        source.push(bblock("00000002a", "00000001a"), None).await.unwrap();
        let err = source
            .push(bblock("00000003a", "00000002a"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }
}
