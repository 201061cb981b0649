//! In-memory DAG of observed blocks.
//!
//! Nodes are keyed by id and carry only the parent edge, the height, an
//! opaque payload and delivery flags; children are derived by transient
//! reverse scans. The DB tracks the current last irreversible block and
//! answers the segment queries the forkable and hub need. Readers get
//! copied segments, never references into the map.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::block::{BlockId, BlockRef};

/// Copied-out view of one DAG node.
#[derive(Debug, Clone)]
pub struct ForkNode<O> {
    pub id: BlockId,
    pub previous_id: BlockId,
    pub num: u64,
    pub object: O,
    pub ever_new: bool,
    pub sent_as_new: bool,
}

impl<O> ForkNode<O> {
    pub fn as_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id.clone(),
            num: self.num,
        }
    }
}

struct Node<O> {
    previous_id: BlockId,
    num: u64,
    object: O,
    /// FIFO insertion order; first-seen wins among equal heights.
    seq: u64,
    ever_new: bool,
    sent_as_new: bool,
}

/// The fork database. `O` is the consumer artefact attached to each
/// accepted block.
pub struct ForkDB<O> {
    nodes: HashMap<BlockId, Node<O>>,
    lib_ref: BlockRef,
    head_ref: BlockRef,
    kept_final_blocks: u64,
    next_seq: u64,
}

impl<O: Clone> ForkDB<O> {
    pub fn new() -> Self {
        Self::with_kept_final_blocks(0)
    }

    /// `kept_final_blocks` finalised ancestors are retained below the
    /// LIB so recently-final blocks stay addressable by cursors.
    pub fn with_kept_final_blocks(kept_final_blocks: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            lib_ref: BlockRef::empty(),
            head_ref: BlockRef::empty(),
            kept_final_blocks,
            next_seq: 0,
        }
    }

    pub fn has_lib(&self) -> bool {
        !self.lib_ref.is_empty()
    }

    pub fn lib_ref(&self) -> &BlockRef {
        &self.lib_ref
    }

    pub fn lib_num(&self) -> u64 {
        self.lib_ref.num
    }

    /// Tip of the longest observed linked chain, as recorded by the
    /// owner when it accepts a segment.
    pub fn head_ref(&self) -> &BlockRef {
        &self.head_ref
    }

    pub fn set_head(&mut self, head: BlockRef) {
        self.head_ref = head;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Set the LIB without pruning. Used at bootstrap, before any block
    /// is linked.
    pub fn init_lib(&mut self, lib: BlockRef) {
        self.lib_ref = lib;
    }

    /// Record `ref → previous_id`. Returns false when the id is already
    /// known; re-observation is a no-op and the first object sticks.
    pub fn add_link(&mut self, block_ref: &BlockRef, previous_id: &BlockId, object: O) -> bool {
        if self.nodes.contains_key(&block_ref.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            block_ref.id.clone(),
            Node {
                previous_id: previous_id.clone(),
                num: block_ref.num,
                object,
                seq,
                ever_new: false,
                sent_as_new: false,
            },
        );
        true
    }

    pub fn exists(&self, id: &BlockId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn block_for_id(&self, id: &BlockId) -> Option<ForkNode<O>> {
        self.nodes.get(id).map(|node| view(id, node))
    }

    /// Walk the parent chain from `from` looking for the block at
    /// height `num`. The walk tolerates height skips.
    pub fn block_in_chain(&self, from: &BlockRef, num: u64) -> Option<BlockRef> {
        if num == from.num {
            return self.nodes.contains_key(&from.id).then(|| from.clone());
        }
        let mut current = from.id.clone();
        while let Some(node) = self.nodes.get(&current) {
            if node.num < num {
                return None;
            }
            if node.num == num {
                return Some(BlockRef {
                    id: current,
                    num,
                });
            }
            current = node.previous_id.clone();
        }
        None
    }

    /// Delivery-state marks, kept on the node so they survive reorgs
    /// until the node is pruned.
    pub fn mark_sent_as_new(&mut self, id: &BlockId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.ever_new = true;
            node.sent_as_new = true;
        }
    }

    pub fn mark_undone(&mut self, id: &BlockId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.sent_as_new = false;
        }
    }

    /// Ordered nodes from the LIB (exclusive) up to `up_to` (inclusive),
    /// plus whether the walk reached the LIB. A walk cut short by an
    /// unlinked node, or diving below the LIB height on another branch,
    /// reports `false` and the caller treats the chain as not ready.
    pub fn reversible_segment(&self, up_to: &BlockRef) -> (Vec<ForkNode<O>>, bool) {
        let mut segment = Vec::new();
        if !self.has_lib() {
            return (segment, false);
        }
        if up_to.id == self.lib_ref.id {
            return (segment, true);
        }

        let mut current = up_to.id.clone();
        loop {
            if current == self.lib_ref.id {
                segment.reverse();
                return (segment, true);
            }
            let Some(node) = self.nodes.get(&current) else {
                return (Vec::new(), false);
            };
            if node.num <= self.lib_ref.num {
                debug!(block = %current, num = node.num, lib = %self.lib_ref, "segment walk went below LIB on a fork");
                return (Vec::new(), false);
            }
            segment.push(view(&current, node));
            current = node.previous_id.clone();
        }
    }

    /// Like [`Self::reversible_segment`] but also includes the
    /// finalised ancestors retained by the kept-final window. The walk
    /// ends at the first missing link.
    pub fn complete_segment(&self, up_to: &BlockRef) -> (Vec<ForkNode<O>>, bool) {
        let mut segment = Vec::new();
        let mut reached_lib = false;
        let mut current = up_to.id.clone();
        while let Some(node) = self.nodes.get(&current) {
            if current == self.lib_ref.id {
                reached_lib = true;
            }
            segment.push(view(&current, node));
            current = node.previous_id.clone();
        }
        segment.reverse();
        (segment, reached_lib)
    }

    /// Blocks to undo walking down from `from_head`, and blocks to redo
    /// walking up to `to_head`, around their common ancestor. `None`
    /// when no common ancestor exists in the DAG; the caller must not
    /// switch.
    #[allow(clippy::type_complexity)]
    pub fn chain_switch_segments(
        &self,
        from_head: &BlockId,
        to_head: &BlockId,
    ) -> Option<(Vec<ForkNode<O>>, Vec<ForkNode<O>>)> {
        if from_head == to_head {
            return Some((Vec::new(), Vec::new()));
        }

        let mut new_chain = HashSet::new();
        let mut current = to_head.clone();
        new_chain.insert(current.clone());
        while let Some(node) = self.nodes.get(&current) {
            current = node.previous_id.clone();
            new_chain.insert(current.clone());
        }

        let mut undos = Vec::new();
        let mut current = from_head.clone();
        let ancestor = loop {
            if new_chain.contains(&current) {
                break current;
            }
            let Some(node) = self.nodes.get(&current) else {
                return None;
            };
            undos.push(view(&current, node));
            current = node.previous_id.clone();
        };

        let mut redos = Vec::new();
        let mut current = to_head.clone();
        while current != ancestor {
            let Some(node) = self.nodes.get(&current) else {
                // to_head side is not linked down to the ancestor
                return None;
            };
            redos.push(view(&current, node));
            current = node.previous_id.clone();
        }
        redos.reverse();

        Some((undos, redos))
    }

    /// Advance the LIB, pruning finalised ancestors that fall out of
    /// the kept-final window and purging dead forks at or below the new
    /// LIB height. Returns the purged dead-fork nodes (the stalled
    /// candidates) ordered by `(num, id)`. Fork nodes above the LIB
    /// height stay until the LIB passes them.
    pub fn move_lib(&mut self, new_lib: &BlockRef) -> Vec<ForkNode<O>> {
        if self.has_lib() && new_lib.num < self.lib_ref.num {
            warn!(current = %self.lib_ref, requested = %new_lib, "refusing to move LIB backwards");
            return Vec::new();
        }

        let mut final_chain = HashSet::new();
        final_chain.insert(new_lib.id.clone());
        let mut current = new_lib.id.clone();
        while let Some(node) = self.nodes.get(&current) {
            current = node.previous_id.clone();
            final_chain.insert(current.clone());
        }

        let cutoff = new_lib.num.saturating_sub(self.kept_final_blocks);
        let mut stalled = Vec::new();
        let mut dropped_final = 0usize;

        let ids: Vec<BlockId> = self.nodes.keys().cloned().collect();
        for id in ids {
            let node = &self.nodes[&id];
            if final_chain.contains(&id) {
                if node.num < cutoff {
                    self.nodes.remove(&id);
                    dropped_final += 1;
                }
            } else if node.num <= new_lib.num {
                let node = self.nodes.remove(&id).expect("node present");
                stalled.push(view_owned(id, node));
            }
        }

        stalled.sort_by(|a, b| a.num.cmp(&b.num).then_with(|| a.id.cmp(&b.id)));
        debug!(
            lib = %new_lib,
            stalled = stalled.len(),
            pruned_final = dropped_final,
            remaining = self.nodes.len(),
            "moved LIB"
        );
        self.lib_ref = new_lib.clone();
        stalled
    }

    /// Insertion order of a node, used by the owner for first-seen
    /// tie-breaking among equal heights.
    pub fn seq(&self, id: &BlockId) -> Option<u64> {
        self.nodes.get(id).map(|node| node.seq)
    }
}

impl<O: Clone> Default for ForkDB<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn view<O: Clone>(id: &BlockId, node: &Node<O>) -> ForkNode<O> {
    ForkNode {
        id: id.clone(),
        previous_id: node.previous_id.clone(),
        num: node.num,
        object: node.object.clone(),
        ever_new: node.ever_new,
        sent_as_new: node.sent_as_new,
    }
}

fn view_owned<O>(id: BlockId, node: Node<O>) -> ForkNode<O> {
    ForkNode {
        id,
        previous_id: node.previous_id,
        num: node.num,
        object: node.object,
        ever_new: node.ever_new,
        sent_as_new: node.sent_as_new,
    }
}
