//! Long-lived multiplexer over one live source.
//!
//! The hub runs a single forkable fed by the live tail, backfilling
//! history from one-block files until the live chain links to the LIB.
//! Consumers attach sub-streams that replay the required segment from
//! the hub's fork DB and then follow live emissions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockRef, ChainConfig};
use crate::cursor::Cursor;
use crate::forkable::{Forkable, SharedForkDB};
use crate::forkdb::{ForkDB, ForkNode};
use crate::handler::{BlockHandler, BlockObj, ForkableEvent, PreprocessedBlock, StepHandler};
use crate::shutter::Shutter;
use crate::sources::{Source, SourceFactory, SourceFromNumFactory};
use crate::step::Step;

type HubEvent = (Arc<Block>, ForkableEvent);

struct Subscriber {
    tx: mpsc::Sender<HubEvent>,
}

pub struct ForkableHub {
    forkable: Arc<Forkable>,
    fork_db: SharedForkDB,
    live_source_factory: SourceFactory,
    one_block_source_factory: SourceFromNumFactory,
    subscribers: std::sync::Mutex<Vec<Subscriber>>,
    live_source: std::sync::Mutex<Option<Arc<dyn Source>>>,
    ready: AtomicBool,
    buffer_size: usize,
    shutter: Shutter,
}

impl ForkableHub {
    pub fn new(
        chain: Arc<ChainConfig>,
        live_source_factory: SourceFactory,
        one_block_source_factory: SourceFromNumFactory,
        buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ForkableHub>| {
            let fork_db: SharedForkDB = Arc::new(RwLock::new(ForkDB::with_kept_final_blocks(
                buffer_size as u64,
            )));
            let sink = Arc::new(HubSink { hub: weak.clone() });
            let forkable = Forkable::builder(chain, sink)
                .with_fork_db(fork_db.clone())
                .build();
            Self {
                forkable,
                fork_db,
                live_source_factory,
                one_block_source_factory,
                subscribers: std::sync::Mutex::new(Vec::new()),
                live_source: std::sync::Mutex::new(None),
                ready: AtomicBool::new(false),
                buffer_size,
                shutter: Shutter::new(),
            }
        })
    }

    /// True once the live chain has linked to the LIB through the
    /// backfill.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn process_live_block(
        self: &Arc<Self>,
        block: &Arc<Block>,
        obj: Option<&BlockObj>,
    ) -> Result<()> {
        self.forkable
            .process_block(block.clone(), obj.cloned())
            .await?;
        if !self.ready() {
            self.bootstrap(block).await;
        }
        Ok(())
    }

    /// One backfill pass: run a one-block source to completion into
    /// the forkable, then check whether the live chain links to the
    /// LIB. Retried on every live block until it does.
    async fn bootstrap(self: &Arc<Self>, live_block: &Arc<Block>) {
        let start = self
            .fork_db
            .read()
            .expect("forkdb lock poisoned")
            .lib_num();
        debug!(start, "hub backfilling from one-block files");

        let backfill = Arc::new(BackfillInput {
            forkable: self.forkable.clone(),
        });
        let source = (self.one_block_source_factory)(start, backfill);
        source.clone().run().await;
        if let Some(cause) = source.shutter().cause() {
            warn!(error = %cause, "one-block backfill pass failed");
        }

        let linked = {
            let db = self.fork_db.read().expect("forkdb lock poisoned");
            db.reversible_segment(&Block::as_ref(live_block)).1
        };
        if linked {
            info!(head = %live_block, "hub ready, live chain linked to LIB");
            self.ready.store(true, Ordering::SeqCst);
        }
    }

    fn broadcast(&self, block: &Arc<Block>, event: &ForkableEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|sub| match sub.tx.try_send((block.clone(), event.clone())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping hub subscriber lagging behind");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn subscribe(
        &self,
        handler: Arc<dyn StepHandler>,
        replay: Vec<HubEvent>,
        skip_at_or_below: Option<u64>,
    ) -> Arc<dyn Source> {
        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .push(Subscriber { tx });
        HubSource::new(replay, rx, handler, skip_at_or_below) as Arc<dyn Source>
    }

    /// Sub-stream replaying from `block` (inclusive) up to the hub
    /// head, then following live emissions. `None` when the block is
    /// not part of the hub's current chain.
    pub async fn source_from_final_block(
        &self,
        handler: Arc<dyn StepHandler>,
        block: &BlockRef,
    ) -> Option<Arc<dyn Source>> {
        if !self.ready() {
            warn!("hub not ready, refusing sub-stream");
            return None;
        }
        let block = block.clone();
        self.forkable
            .quiesce(move || {
                let db = self.fork_db.read().expect("forkdb lock poisoned");
                let head = db.head_ref().clone();
                let lib = db.lib_ref().clone();
                let (chain, _) = db.complete_segment(&head);
                let pos = chain.iter().position(|n| n.id == block.id)?;

                let replay: Vec<HubEvent> = chain[pos..]
                    .iter()
                    .map(|node| replay_event(node, &head, &lib))
                    .collect();
                Some(self.subscribe(handler, replay, None))
            })
            .await
    }

    /// Sub-stream resuming a consumer from its cursor: irreversible
    /// catch-up, unwinding of a forked cursor block, then the chain up
    /// to the hub head, then live emissions.
    ///
    /// `None` when the cursor block is unknown and not in the future;
    /// a cursor head beyond the hub head yields a subscribe-only
    /// source that waits for the stream to pass it.
    pub async fn source_from_cursor(
        &self,
        handler: Arc<dyn StepHandler>,
        cursor: &Cursor,
    ) -> Option<Arc<dyn Source>> {
        if !self.ready() {
            warn!("hub not ready, refusing sub-stream");
            return None;
        }
        let cursor = cursor.clone();
        self.forkable
            .quiesce(move || {
                let db = self.fork_db.read().expect("forkdb lock poisoned");
                let head = db.head_ref().clone();
                let lib = db.lib_ref().clone();
                let (chain, _) = db.complete_segment(&head);
                let chain_ids: HashSet<_> = chain.iter().map(|n| n.id.clone()).collect();

                let Some(node) = db.block_for_id(&cursor.block.id) else {
                    if cursor.block.num > head.num {
                        debug!(cursor = %cursor, head = %head, "cursor head in the future, waiting");
                        return Some(self.subscribe(handler, Vec::new(), Some(cursor.block.num)));
                    }
                    return None;
                };

                let mut replay: Vec<HubEvent> = Vec::new();
                let ancestor_pos = if chain_ids.contains(&node.id) {
                    chain.iter().position(|n| n.id == node.id)?
                } else {
                    // forked cursor: unwind down to the hub's chain
                    let mut undos: Vec<ForkNode<PreprocessedBlock>> = Vec::new();
                    let mut current = node;
                    let ancestor_id = loop {
                        if chain_ids.contains(&current.id) {
                            break current.id;
                        }
                        let previous = db.block_for_id(&current.previous_id);
                        undos.push(current);
                        current = previous?;
                    };
                    if cursor.step == Step::Undo && !undos.is_empty() {
                        // the consumer already undid the cursor block
                        undos.remove(0);
                    }

                    let step_blocks: Vec<PreprocessedBlock> =
                        undos.iter().map(|n| n.object.clone()).collect();
                    let count = undos.len();
                    for (index, n) in undos.iter().enumerate() {
                        let event = ForkableEvent {
                            step: Step::Undo,
                            block: n.as_ref(),
                            head_block: head.clone(),
                            lib: cursor.lib.clone(),
                            step_index: index,
                            step_count: count,
                            step_blocks: step_blocks.clone(),
                            obj: n.object.obj.clone(),
                        };
                        replay.push((n.object.block.clone(), event));
                    }
                    chain.iter().position(|n| n.id == ancestor_id)?
                };

                // irreversible notices the consumer has not seen for
                // blocks it already holds
                for n in &chain[..=ancestor_pos] {
                    if n.num <= lib.num && n.num > cursor.lib.num {
                        let event = ForkableEvent {
                            step: Step::Irreversible,
                            block: n.as_ref(),
                            head_block: head.clone(),
                            lib: n.as_ref(),
                            step_index: 0,
                            step_count: 1,
                            step_blocks: vec![n.object.clone()],
                            obj: n.object.obj.clone(),
                        };
                        replay.push((n.object.block.clone(), event));
                    }
                }
                for n in &chain[ancestor_pos + 1..] {
                    replay.push(replay_event(n, &head, &lib));
                }
                Some(self.subscribe(handler, replay, None))
            })
            .await
    }
}

#[async_trait]
impl Source for ForkableHub {
    async fn run(self: Arc<Self>) {
        let live = (self.live_source_factory)(Arc::new(LiveInput {
            hub: Arc::downgrade(&self),
        }));
        *self.live_source.lock().expect("live source lock") = Some(live.clone());

        let hub = self.clone();
        let source = live.clone();
        tokio::spawn(async move {
            source.clone().run().await;
            hub.shutter.shutdown_shared(source.shutter().cause());
        });

        self.shutter.terminated().await;
        if let Some(live) = self.live_source.lock().expect("live source lock").take() {
            live.shutdown(None);
        }
        // dropping the senders ends every sub-stream
        self.subscribers.lock().expect("subscribers lock").clear();
    }

    fn shutter(&self) -> &Shutter {
        &self.shutter
    }
}

/// Replay form of a hub chain block: already-final blocks carry the
/// combined new+irreversible step with the cursor LIB pinned to the
/// block itself.
fn replay_event(
    node: &ForkNode<PreprocessedBlock>,
    head: &BlockRef,
    hub_lib: &BlockRef,
) -> HubEvent {
    let is_final = node.num <= hub_lib.num;
    let event = ForkableEvent {
        step: if is_final {
            Step::NewIrreversible
        } else {
            Step::New
        },
        block: node.as_ref(),
        head_block: head.clone(),
        lib: if is_final {
            node.as_ref()
        } else {
            hub_lib.clone()
        },
        step_index: 0,
        step_count: usize::from(is_final),
        step_blocks: if is_final {
            vec![node.object.clone()]
        } else {
            Vec::new()
        },
        obj: node.object.obj.clone(),
    };
    (node.object.block.clone(), event)
}

/// The forkable's downstream: records nothing itself, the fork DB is
/// shared, so all that is left is fanning events out.
struct HubSink {
    hub: Weak<ForkableHub>,
}

#[async_trait]
impl StepHandler for HubSink {
    async fn process_step(&self, block: &Arc<Block>, event: &ForkableEvent) -> Result<()> {
        if let Some(hub) = self.hub.upgrade() {
            hub.broadcast(block, event);
        }
        Ok(())
    }
}

struct LiveInput {
    hub: Weak<ForkableHub>,
}

#[async_trait]
impl BlockHandler for LiveInput {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        let Some(hub) = self.hub.upgrade() else {
            return Err(anyhow!("hub dropped"));
        };
        hub.process_live_block(block, obj).await
    }
}

struct BackfillInput {
    forkable: Arc<Forkable>,
}

#[async_trait]
impl BlockHandler for BackfillInput {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        // a block the live tail already delivered is a no-op here: the
        // live copy is authoritative
        self.forkable.process_block(block.clone(), obj.cloned()).await
    }
}

/// A hub sub-stream: replays the prepared segment, then forwards live
/// hub emissions from its subscription.
pub struct HubSource {
    replay: std::sync::Mutex<Vec<HubEvent>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<HubEvent>>>,
    handler: Arc<dyn StepHandler>,
    skip_at_or_below: Option<u64>,
    shutter: Shutter,
}

impl HubSource {
    fn new(
        replay: Vec<HubEvent>,
        rx: mpsc::Receiver<HubEvent>,
        handler: Arc<dyn StepHandler>,
        skip_at_or_below: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replay: std::sync::Mutex::new(replay),
            rx: tokio::sync::Mutex::new(Some(rx)),
            handler,
            skip_at_or_below,
            shutter: Shutter::new(),
        })
    }
}

#[async_trait]
impl Source for HubSource {
    async fn run(self: Arc<Self>) {
        let replay = std::mem::take(&mut *self.replay.lock().expect("replay lock"));
        for (block, event) in replay {
            if self.shutter.is_terminated() {
                return;
            }
            if let Err(err) = self.handler.process_step(&block, &event).await {
                self.shutter.shutdown(Some(err));
                return;
            }
        }

        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutter.terminated() => return,
                received = rx.recv() => {
                    let Some((block, event)) = received else {
                        self.shutter.shutdown(Some(anyhow!("hub subscription closed")));
                        return;
                    };
                    if let Some(limit) = self.skip_at_or_below {
                        if event.block.num <= limit {
                            continue;
                        }
                    }
                    if let Err(err) = self.handler.process_step(&block, &event).await {
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
