//! Error types shared across the library.
//!
//! Library data structures return typed errors; source run-loops carry
//! `anyhow::Error` and use downcasting to recognise the sentinels.

use thiserror::Error;

use crate::block::BlockRef;

/// Errors raised by [`Forkable`](crate::forkable::Forkable) processing.
#[derive(Debug, Error)]
pub enum ForkError {
    /// A block declared itself as its own parent.
    #[error("block {0} references itself as previous")]
    SelfReference(BlockRef),

    /// A chain switch would cross below the last irreversible block.
    #[error("inconsistent reorg: last sent {last_sent} does not join the chain of {new_block} above LIB {lib}")]
    InconsistentReorg {
        last_sent: BlockRef,
        new_block: BlockRef,
        lib: BlockRef,
    },
}

/// Stream construction rejected an argument; never retried.
#[derive(Debug, Error)]
#[error("invalid argument: {0}")]
pub struct InvalidArg(pub String);

/// The joining source could not bridge the file stream into the live
/// stream; fatal for the owning stream.
#[derive(Debug, Error)]
#[error("cannot join live stream: {0}")]
pub struct CannotJoin(pub String);

/// Sentinel: the configured stop block was delivered. A normal terminal
/// condition for the outer caller, detected with
/// `err.is::<StopBlockReached>()`.
#[derive(Debug, Error)]
#[error("stop block reached")]
pub struct StopBlockReached;

/// Sentinel: the file portion of a joining source was stopped because
/// the live buffer took over.
#[derive(Debug, Error)]
#[error("joined to live stream")]
pub struct JoinedToLive;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_survive_anyhow_round_trip() {
        let err: anyhow::Error = StopBlockReached.into();
        assert!(err.is::<StopBlockReached>());
        assert!(!err.is::<CannotJoin>());

        let wrapped = err.context("stream terminated");
        assert!(wrapped.downcast_ref::<StopBlockReached>().is_some());
    }
}
