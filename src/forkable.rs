//! The fork-aware transducer.
//!
//! Consumes blocks in arbitrary order through [`Forkable::process_block`]
//! and drives a [`StepHandler`] with ordered step events along the
//! longest chain: new, undo, redo, irreversible and stalled. Single
//! writer: all state lives behind one async mutex, held across the
//! downstream handler call.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::debug;

use crate::block::{Block, BlockId, BlockRef, ChainConfig};
use crate::cursor::Cursor;
use crate::error::ForkError;
use crate::forkdb::{ForkDB, ForkNode};
use crate::handler::{BlockHandler, BlockObj, ForkableEvent, PreprocessedBlock, StepHandler};
use crate::step::Step;

/// Overrides a block's declared `lib_num`; when configured, the getter
/// always wins. Receives the candidate head ref and the declared value.
pub type LibNumGetter = Arc<dyn Fn(&BlockRef, u64) -> u64 + Send + Sync>;

/// LIB follows the head at a fixed distance, clamped to the first
/// streamable block. The common "confirmations" policy.
pub fn relative_lib_num_getter(first_streamable_block: u64, confirmations: u64) -> LibNumGetter {
    Arc::new(move |head: &BlockRef, _declared: u64| {
        head.num
            .saturating_sub(confirmations)
            .max(first_streamable_block)
    })
}

/// The fork database as shared between a forkable and its owner.
/// Readers copy segments under the lock and never hold references in.
pub type SharedForkDB = Arc<RwLock<ForkDB<PreprocessedBlock>>>;

/// How the initial LIB is established.
#[derive(Clone, Debug, Default)]
enum LibMode {
    /// Discover the LIB from incoming blocks' `lib_num`.
    #[default]
    Unknown,
    /// The named ref is the LIB; it is not emitted.
    Exclusive(BlockRef),
    /// The named ref is the LIB and is itself emitted new then
    /// irreversible.
    Inclusive(BlockRef),
    /// Resume exactly after the cursor position.
    Cursor(Cursor),
}

pub struct ForkableBuilder {
    chain: Arc<ChainConfig>,
    handler: Arc<dyn StepHandler>,
    filter_steps: Step,
    lib_mode: LibMode,
    libnum_getter: Option<LibNumGetter>,
    ensure_block_flows: Option<BlockRef>,
    ensure_all_blocks_trigger_longest_chain: bool,
    hold_blocks_until_lib: bool,
    kept_final_blocks: u64,
    fork_db: Option<SharedForkDB>,
}

impl ForkableBuilder {
    /// Restrict which step kinds reach the handler. Undo/redo
    /// suppression elides the pair; internal state still advances.
    pub fn with_filters(mut self, steps: Step) -> Self {
        self.filter_steps = steps;
        self
    }

    pub fn with_exclusive_lib(mut self, lib: BlockRef) -> Self {
        self.lib_mode = LibMode::Exclusive(lib);
        self
    }

    pub fn with_inclusive_lib(mut self, lib: BlockRef) -> Self {
        self.lib_mode = LibMode::Inclusive(lib);
        self
    }

    /// Gate emission so the stream resumes exactly after the cursor
    /// position once the cursor's head is linkable again.
    pub fn from_cursor(mut self, cursor: Cursor) -> Self {
        if !cursor.is_empty() {
            self.lib_mode = LibMode::Cursor(cursor);
        }
        self
    }

    pub fn with_custom_libnum_getter(mut self, getter: LibNumGetter) -> Self {
        self.libnum_getter = Some(getter);
        self
    }

    /// Force the named block to flow even if it is not on the longest
    /// chain; emission is withheld until it is linkable.
    pub fn ensure_block_flows(mut self, block: BlockRef) -> Self {
        self.ensure_block_flows = Some(block);
        self
    }

    /// Treat every linkable block as the longest chain tip, so each
    /// appears as new at least once.
    pub fn ensure_all_blocks_trigger_longest_chain(mut self) -> Self {
        self.ensure_all_blocks_trigger_longest_chain = true;
        self
    }

    /// Whether blocks are buffered until a LIB is discovered (default
    /// true). When disabled, linkable blocks flow as new without reorg
    /// tracking until the LIB appears.
    pub fn hold_blocks_until_lib(mut self, hold: bool) -> Self {
        self.hold_blocks_until_lib = hold;
        self
    }

    /// Finalised blocks retained below the LIB for cursor questions.
    pub fn with_kept_final_blocks(mut self, count: u64) -> Self {
        self.kept_final_blocks = count;
        self
    }

    /// Share an externally owned fork database (the hub does this to
    /// read segments for its sub-streams).
    pub fn with_fork_db(mut self, fork_db: SharedForkDB) -> Self {
        self.fork_db = Some(fork_db);
        self
    }

    pub fn build(self) -> Arc<Forkable> {
        let fork_db = self.fork_db.unwrap_or_else(|| {
            Arc::new(RwLock::new(ForkDB::with_kept_final_blocks(
                self.kept_final_blocks,
            )))
        });

        let mut state = State {
            last_block_sent: None,
            last_lib_sent: BlockRef::empty(),
            include_initial_lib: None,
            gate: None,
            ensure_block_flows: self.ensure_block_flows,
            ensure_block_flowed: false,
        };

        {
            let mut db = fork_db.write().expect("forkdb lock poisoned");
            match &self.lib_mode {
                LibMode::Unknown => {}
                LibMode::Exclusive(lib) => {
                    db.init_lib(lib.clone());
                    state.last_lib_sent = lib.clone();
                }
                LibMode::Inclusive(lib) => {
                    db.init_lib(lib.clone());
                    state.last_lib_sent = lib.clone();
                    state.include_initial_lib = Some(lib.clone());
                }
                LibMode::Cursor(cursor) => {
                    db.init_lib(cursor.lib.clone());
                    state.last_lib_sent = cursor.lib.clone();
                    // a consumer sitting on an irreversible step at the
                    // LIB itself has nothing left to replay silently
                    let passed = cursor.step.intersects(Step::Irreversible | Step::Stalled)
                        && cursor.head_block.id == cursor.lib.id;
                    state.gate = Some(Gate {
                        cursor: cursor.clone(),
                        passed,
                        open: false,
                    });
                }
            }
        }

        Arc::new(Forkable {
            chain: self.chain,
            handler: self.handler,
            filter_steps: self.filter_steps,
            libnum_getter: self.libnum_getter,
            ensure_all: self.ensure_all_blocks_trigger_longest_chain,
            hold_blocks_until_lib: self.hold_blocks_until_lib,
            fork_db,
            state: tokio::sync::Mutex::new(state),
        })
    }
}

/// Cursor gate. While closed, regenerated events at or before the
/// cursor position are swallowed with their marks still applied;
/// events past the position are withheld entirely until the cursor's
/// head block is linkable, then the gate opens.
struct Gate {
    cursor: Cursor,
    /// The cursor position has been re-reached.
    passed: bool,
    /// Events flow to the handler again.
    open: bool,
}

impl Gate {
    fn matches_position(&self, step: Step, block_id: &BlockId) -> bool {
        if self
            .cursor
            .step
            .intersects(Step::Irreversible | Step::Stalled)
        {
            // the consumer saw new events up to the cursor head
            step.intersects(Step::New | Step::Redo) && *block_id == self.cursor.head_block.id
        } else if self.cursor.step == Step::Undo {
            step == Step::Undo && *block_id == self.cursor.block.id
        } else {
            step.intersects(Step::New | Step::Redo) && *block_id == self.cursor.block.id
        }
    }
}

struct State {
    last_block_sent: Option<BlockRef>,
    last_lib_sent: BlockRef,
    /// Set when the initial LIB must itself flow new + irreversible.
    include_initial_lib: Option<BlockRef>,
    gate: Option<Gate>,
    ensure_block_flows: Option<BlockRef>,
    ensure_block_flowed: bool,
}

enum EmitFlow {
    Continue,
    /// The gate swallowed the cursor position but its head is not
    /// linkable yet; stop without marking anything further.
    Hold,
}

pub struct Forkable {
    chain: Arc<ChainConfig>,
    handler: Arc<dyn StepHandler>,
    filter_steps: Step,
    libnum_getter: Option<LibNumGetter>,
    ensure_all: bool,
    hold_blocks_until_lib: bool,
    fork_db: SharedForkDB,
    state: tokio::sync::Mutex<State>,
}

impl Forkable {
    pub fn builder(chain: Arc<ChainConfig>, handler: Arc<dyn StepHandler>) -> ForkableBuilder {
        ForkableBuilder {
            chain,
            handler,
            filter_steps: Step::all_steps(),
            lib_mode: LibMode::default(),
            libnum_getter: None,
            ensure_block_flows: None,
            ensure_all_blocks_trigger_longest_chain: false,
            hold_blocks_until_lib: true,
            kept_final_blocks: 0,
            fork_db: None,
        }
    }

    pub fn fork_db(&self) -> SharedForkDB {
        self.fork_db.clone()
    }

    /// Run `f` while the processing lock is held, so no block can flow
    /// concurrently. The hub takes consistent fork-DB snapshots and
    /// registers sub-streams through this, leaving no gap between the
    /// snapshot and the subscription.
    pub async fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.state.lock().await;
        f()
    }

    /// Feed one block. Not re-entrant: the internal lock enforces the
    /// single-writer rule, and the call blocks on the downstream
    /// handler.
    pub async fn process_block(&self, block: Arc<Block>, obj: Option<BlockObj>) -> Result<()> {
        if !block.id.is_empty() && block.id == block.previous_id {
            return Err(ForkError::SelfReference(Block::as_ref(&block)).into());
        }

        let mut state = self.state.lock().await;
        self.process_locked(&mut state, block, obj).await
    }

    async fn process_locked(
        &self,
        state: &mut State,
        block: Arc<Block>,
        obj: Option<BlockObj>,
    ) -> Result<()> {
        let lib = self.db(|db| db.lib_ref().clone());

        if !lib.is_empty() {
            if block.id == lib.id {
                return self.process_initial_lib_block(state, block, obj).await;
            }
            if block.num < lib.num {
                return Ok(());
            }
        }

        let pp = PreprocessedBlock {
            block: block.clone(),
            obj: obj.clone(),
        };
        let is_new = self.db_mut(|db| db.add_link(&Block::as_ref(&block), &block.previous_id, pp));
        if !is_new {
            return Ok(());
        }

        if lib.is_empty() {
            if !self.try_discover_lib(state, &block) {
                if self.hold_blocks_until_lib {
                    return Ok(());
                }
                return self.send_unanchored_new(state, &block).await;
            }
            if block.id == self.db(|db| db.lib_ref().id.clone()) {
                // the first streamable block is its own LIB and flows
                // new then irreversible
                state.include_initial_lib = Some(Block::as_ref(&block));
                return self.process_initial_lib_block(state, block, obj).await;
            }
        }

        // a passed gate still waiting on its head: buffer silently
        if self.gate_held(state) {
            return Ok(());
        }

        self.emit_chain(state, &block).await
    }

    /// Full emission pass for one accepted block: longest-chain
    /// trigger, chain switch, redo/new segment, LIB advancement.
    async fn emit_chain(&self, state: &mut State, block: &Arc<Block>) -> Result<()> {
        let mut up_to = Block::as_ref(block);

        // a configured must-flow block withholds everything until it
        // is linkable, then flows as the segment tip
        if let Some(target) = state.ensure_block_flows.clone() {
            if !state.ensure_block_flowed {
                let Some(node) = self.db(|db| db.block_for_id(&target.id)) else {
                    return Ok(());
                };
                let target_ref = node.as_ref();
                let (_, reached) = self.db(|db| db.reversible_segment(&target_ref));
                if !reached {
                    return Ok(());
                }
                state.ensure_block_flowed = true;
                up_to = target_ref;
            }
        }

        if !self.triggers_longest_chain(state, &up_to) {
            return Ok(());
        }

        let (segment, reached) = self.db(|db| db.reversible_segment(&up_to));
        if !reached || segment.is_empty() {
            return Ok(());
        }
        self.db_mut(|db| db.set_head(up_to.clone()));

        // reorg: the previously sent tip is not on the accepted chain
        if let Some(last_sent) = state.last_block_sent.clone() {
            let on_chain = last_sent.id == self.db(|db| db.lib_ref().id.clone())
                || segment.iter().any(|n| n.id == last_sent.id);
            if !on_chain {
                if let EmitFlow::Hold = self.send_undos(state, &last_sent, block, &up_to).await? {
                    return Ok(());
                }
            }
        }

        if let EmitFlow::Hold = self.send_segment(state, &segment, &up_to).await? {
            return Ok(());
        }

        self.advance_lib(state, block, &up_to).await
    }

    /// Undo batch for a chain switch, walking down from the old tip.
    async fn send_undos(
        &self,
        state: &mut State,
        last_sent: &BlockRef,
        new_block: &Arc<Block>,
        up_to: &BlockRef,
    ) -> Result<EmitFlow> {
        let switch =
            self.db(|db| db.chain_switch_segments(&last_sent.id, &new_block.previous_id));
        let Some((undos, _)) = switch else {
            let lib = self.db(|db| db.lib_ref().clone());
            return Err(ForkError::InconsistentReorg {
                last_sent: last_sent.clone(),
                new_block: Block::as_ref(new_block),
                lib,
            }
            .into());
        };

        let sent: Vec<ForkNode<PreprocessedBlock>> =
            undos.into_iter().filter(|n| n.sent_as_new).collect();
        if sent.is_empty() {
            return Ok(EmitFlow::Continue);
        }

        let step_blocks: Vec<PreprocessedBlock> = sent.iter().map(|n| n.object.clone()).collect();
        let count = sent.len();
        for (index, node) in sent.iter().enumerate() {
            if self.gate_held(state) {
                return Ok(EmitFlow::Hold);
            }
            self.db_mut(|db| db.mark_undone(&node.id));
            let event = ForkableEvent {
                step: Step::Undo,
                block: node.as_ref(),
                head_block: up_to.clone(),
                lib: state.last_lib_sent.clone(),
                step_index: index,
                step_count: count,
                step_blocks: step_blocks.clone(),
                obj: node.object.obj.clone(),
            };
            self.emit(state, &node.object.block, event).await?;
        }
        Ok(EmitFlow::Continue)
    }

    /// Redo batch then new events for the unsent blocks of the
    /// accepted segment, in ascending order.
    async fn send_segment(
        &self,
        state: &mut State,
        segment: &[ForkNode<PreprocessedBlock>],
        up_to: &BlockRef,
    ) -> Result<EmitFlow> {
        let unsent: Vec<&ForkNode<PreprocessedBlock>> =
            segment.iter().filter(|n| !n.sent_as_new).collect();
        if unsent.is_empty() {
            return Ok(EmitFlow::Continue);
        }

        let redos: Vec<&ForkNode<PreprocessedBlock>> =
            unsent.iter().copied().filter(|n| n.ever_new).collect();
        let news: Vec<&ForkNode<PreprocessedBlock>> =
            unsent.iter().copied().filter(|n| !n.ever_new).collect();

        let step_blocks: Vec<PreprocessedBlock> = redos.iter().map(|n| n.object.clone()).collect();
        let count = redos.len();
        for (index, node) in redos.iter().enumerate() {
            if self.gate_held(state) {
                return Ok(EmitFlow::Hold);
            }
            self.db_mut(|db| db.mark_sent_as_new(&node.id));
            state.last_block_sent = Some(node.as_ref());
            let event = ForkableEvent {
                step: Step::Redo,
                block: node.as_ref(),
                head_block: up_to.clone(),
                lib: state.last_lib_sent.clone(),
                step_index: index,
                step_count: count,
                step_blocks: step_blocks.clone(),
                obj: node.object.obj.clone(),
            };
            self.emit(state, &node.object.block, event).await?;
        }

        for node in news {
            if self.gate_held(state) {
                return Ok(EmitFlow::Hold);
            }
            self.db_mut(|db| db.mark_sent_as_new(&node.id));
            state.last_block_sent = Some(node.as_ref());
            let event = ForkableEvent {
                step: Step::New,
                block: node.as_ref(),
                head_block: up_to.clone(),
                lib: state.last_lib_sent.clone(),
                step_index: 0,
                step_count: 0,
                step_blocks: Vec::new(),
                obj: node.object.obj.clone(),
            };
            self.emit(state, &node.object.block, event).await?;
        }
        Ok(EmitFlow::Continue)
    }

    /// Advance the LIB when the accepted chain declares a higher one,
    /// emitting the newly-irreversible segment then the stalled forks.
    async fn advance_lib(
        &self,
        state: &mut State,
        block: &Arc<Block>,
        up_to: &BlockRef,
    ) -> Result<()> {
        if self.gate_held(state) {
            return Ok(());
        }

        let declared = match &self.libnum_getter {
            Some(getter) => getter(up_to, block.lib_num),
            None => block.lib_num,
        };
        if declared <= self.db(|db| db.lib_num()) {
            return Ok(());
        }

        let Some(new_lib) = self.db(|db| resolve_lib_target(db, up_to, declared)) else {
            return Ok(());
        };

        let (segment, reached) = self.db(|db| db.reversible_segment(&new_lib));
        if !reached || segment.is_empty() {
            return Ok(());
        }

        let step_blocks: Vec<PreprocessedBlock> =
            segment.iter().map(|n| n.object.clone()).collect();
        let count = segment.len();
        for (index, node) in segment.iter().enumerate() {
            state.last_lib_sent = node.as_ref();
            let event = ForkableEvent {
                step: Step::Irreversible,
                block: node.as_ref(),
                head_block: up_to.clone(),
                lib: node.as_ref(),
                step_index: index,
                step_count: count,
                step_blocks: step_blocks.clone(),
                obj: node.object.obj.clone(),
            };
            self.emit(state, &node.object.block, event).await?;
        }

        let stalled = self.db_mut(|db| db.move_lib(&new_lib));
        if stalled.is_empty() {
            return Ok(());
        }
        let step_blocks: Vec<PreprocessedBlock> =
            stalled.iter().map(|n| n.object.clone()).collect();
        let count = stalled.len();
        for (index, node) in stalled.iter().enumerate() {
            let event = ForkableEvent {
                step: Step::Stalled,
                block: node.as_ref(),
                head_block: up_to.clone(),
                lib: state.last_lib_sent.clone(),
                step_index: index,
                step_count: count,
                step_blocks: step_blocks.clone(),
                obj: node.object.obj.clone(),
            };
            self.emit(state, &node.object.block, event).await?;
        }
        Ok(())
    }

    /// The initial LIB block itself arrived: flow it when inclusive,
    /// settle a cursor gate owing its irreversible notice, otherwise
    /// ignore it.
    async fn process_initial_lib_block(
        &self,
        state: &mut State,
        block: Arc<Block>,
        obj: Option<BlockObj>,
    ) -> Result<()> {
        let pp = PreprocessedBlock {
            block: block.clone(),
            obj,
        };

        if let Some(lib) = state.include_initial_lib.take() {
            self.db_mut(|db| {
                db.add_link(&lib, &block.previous_id, pp.clone());
                db.mark_sent_as_new(&lib.id);
                db.set_head(lib.clone());
            });
            state.last_block_sent = Some(lib.clone());
            state.last_lib_sent = lib.clone();

            let event = ForkableEvent {
                step: Step::New,
                block: lib.clone(),
                head_block: lib.clone(),
                lib: lib.clone(),
                step_index: 0,
                step_count: 0,
                step_blocks: Vec::new(),
                obj: pp.obj.clone(),
            };
            self.emit(state, &block, event).await?;

            let event = ForkableEvent {
                step: Step::Irreversible,
                block: lib.clone(),
                head_block: lib.clone(),
                lib: lib.clone(),
                step_index: 0,
                step_count: 1,
                step_blocks: vec![pp],
                obj: None,
            };
            self.emit(state, &block, event).await?;
            return Ok(());
        }

        // a cursor sitting on the LIB block with a non-irreversible
        // step still owes the consumer the irreversible notice
        let owes_irr = match &state.gate {
            Some(gate) => {
                !gate.open
                    && !gate
                        .cursor
                        .step
                        .intersects(Step::Irreversible | Step::Stalled)
                    && gate.cursor.block.id == block.id
            }
            None => false,
        };
        if owes_irr {
            let lib_ref = Block::as_ref(&block);
            self.db_mut(|db| {
                db.add_link(&lib_ref, &block.previous_id, pp.clone());
                db.mark_sent_as_new(&lib_ref.id);
                db.set_head(lib_ref.clone());
            });
            state.last_block_sent = Some(lib_ref.clone());
            if let Some(gate) = state.gate.as_mut() {
                gate.passed = true;
            }
            self.maybe_open_gate(state);

            let event = ForkableEvent {
                step: Step::Irreversible,
                block: lib_ref.clone(),
                head_block: lib_ref.clone(),
                lib: lib_ref.clone(),
                step_index: 0,
                step_count: 1,
                step_blocks: vec![pp],
                obj: None,
            };
            self.emit(state, &block, event).await?;
        }
        Ok(())
    }

    /// Without a LIB and with holding disabled, linkable blocks flow
    /// as plain new events; reorg tracking starts once a LIB appears.
    async fn send_unanchored_new(&self, state: &mut State, block: &Arc<Block>) -> Result<()> {
        let block_ref = Block::as_ref(block);
        if !self.triggers_longest_chain(state, &block_ref) {
            return Ok(());
        }
        let obj = self
            .db(|db| db.block_for_id(&block.id))
            .and_then(|n| n.object.obj.clone());
        self.db_mut(|db| {
            db.mark_sent_as_new(&block.id);
            db.set_head(block_ref.clone());
        });
        state.last_block_sent = Some(block_ref.clone());
        let event = ForkableEvent {
            step: Step::New,
            block: block_ref.clone(),
            head_block: block_ref,
            lib: state.last_lib_sent.clone(),
            step_index: 0,
            step_count: 0,
            step_blocks: Vec::new(),
            obj,
        };
        self.emit(state, block, event).await?;
        Ok(())
    }

    fn triggers_longest_chain(&self, state: &State, candidate: &BlockRef) -> bool {
        if self.ensure_all {
            return true;
        }
        match &state.last_block_sent {
            None => true,
            Some(last) => candidate.num > last.num,
        }
    }

    /// Discover the LIB from an incoming block, per the unknown-LIB
    /// bootstrap rules. Returns true when the LIB is now set.
    fn try_discover_lib(&self, state: &mut State, block: &Arc<Block>) -> bool {
        let declared = match &self.libnum_getter {
            Some(getter) => getter(&Block::as_ref(block), block.lib_num),
            None => block.lib_num,
        };

        if block.num == self.chain.first_streamable_block {
            self.db_mut(|db| db.init_lib(Block::as_ref(block)));
            state.last_lib_sent = Block::as_ref(block);
            return true;
        }

        let target = declared.max(self.chain.first_streamable_block);
        if target >= block.num {
            return false;
        }

        let lib = if target == block.num - 1 {
            Some(block.previous_ref())
        } else {
            self.db(|db| db.block_in_chain(&Block::as_ref(block), target))
        };
        match lib {
            Some(lib) => {
                debug!(lib = %lib, from = %block, "discovered LIB");
                self.db_mut(|db| db.init_lib(lib.clone()));
                state.last_lib_sent = lib;
                true
            }
            None => false,
        }
    }

    /// True while a passed-but-unopened gate keeps emission on hold.
    fn gate_held(&self, state: &mut State) -> bool {
        self.maybe_open_gate(state);
        match &state.gate {
            Some(gate) => gate.passed && !gate.open,
            None => false,
        }
    }

    fn maybe_open_gate(&self, state: &mut State) {
        let Some(gate) = state.gate.as_mut() else {
            return;
        };
        if gate.open || !gate.passed {
            return;
        }
        let (_, head_linkable) = self.db(|db| db.reversible_segment(&gate.cursor.head_block));
        if head_linkable {
            debug!(cursor = %gate.cursor, "cursor gate open");
            gate.open = true;
        }
    }

    /// Emission funnel: the cursor gate swallows replayed events, the
    /// filter mask decides what reaches the handler.
    async fn emit(&self, state: &mut State, block: &Arc<Block>, event: ForkableEvent) -> Result<()> {
        let swallowed = match state.gate.as_mut() {
            Some(gate) if !gate.open => {
                if gate.matches_position(event.step, &event.block.id) {
                    gate.passed = true;
                }
                true
            }
            _ => false,
        };
        if swallowed {
            self.maybe_open_gate(state);
            return Ok(());
        }

        if !self.filter_steps.matches(event.step) {
            return Ok(());
        }
        self.handler.process_step(block, &event).await
    }

    fn db<R>(&self, f: impl FnOnce(&ForkDB<PreprocessedBlock>) -> R) -> R {
        f(&self.fork_db.read().expect("forkdb lock poisoned"))
    }

    fn db_mut<R>(&self, f: impl FnOnce(&mut ForkDB<PreprocessedBlock>) -> R) -> R {
        f(&mut self.fork_db.write().expect("forkdb lock poisoned"))
    }
}

#[async_trait::async_trait]
impl BlockHandler for Forkable {
    async fn process_block(&self, block: &Arc<Block>, obj: Option<&BlockObj>) -> Result<()> {
        Forkable::process_block(self, block.clone(), obj.cloned()).await
    }
}

/// Resolve the block that covers the declared LIB height on the chain
/// of `head`: the lowest chain block at or above `declared`. Heights
/// may skip, so an exact match is not required.
fn resolve_lib_target(
    db: &ForkDB<PreprocessedBlock>,
    head: &BlockRef,
    declared: u64,
) -> Option<BlockRef> {
    if head.num < declared {
        return None;
    }
    let mut candidate: Option<BlockRef> = None;
    let mut current = head.id.clone();
    loop {
        if current == db.lib_ref().id {
            return candidate;
        }
        let node = db.block_for_id(&current)?;
        if node.num < declared {
            return candidate;
        }
        candidate = Some(node.as_ref());
        current = node.previous_id;
    }
}
