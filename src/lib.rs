//! Fork-aware block streaming.
//!
//! From an unordered, possibly duplicated, potentially forked stream
//! of blocks, `rheos` delivers a linear sequence of step events (new,
//! undo, redo, irreversible, stalled) along the longest chain, with
//! resumable cursors. The pieces: the [`forkdb`] DAG, the [`forkable`]
//! transducer, [`sources`] producing blocks from archives and live
//! tails, the [`hub`] multiplexer serving sub-streams, and [`stream`]
//! gluing them together for a single consumer.

pub mod block;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod forkable;
pub mod forkdb;
pub mod handler;
pub mod hub;
pub mod shutter;
pub mod sources;
pub mod step;
pub mod store;
pub mod stream;
pub mod testing;

// Flattened re-exports
pub use self::block::{AnyPayload, Block, BlockId, BlockRef, ChainConfig, PayloadDecoder};
pub use self::cursor::{Cursor, CursorError};
pub use self::error::{CannotJoin, ForkError, InvalidArg, JoinedToLive, StopBlockReached};
pub use self::forkable::{
    relative_lib_num_getter, Forkable, ForkableBuilder, LibNumGetter, SharedForkDB,
};
pub use self::forkdb::{ForkDB, ForkNode};
pub use self::handler::{
    BlockHandler, BlockObj, ForkableEvent, MinimalBlockNumFilter, PreprocessedBlock, StepHandler,
};
pub use self::hub::{ForkableHub, HubSource};
pub use self::shutter::Shutter;
pub use self::sources::{
    FileSource, FileSourceConfig, JoiningSource, JoiningSourceConfig, LiveSource,
    LiveSourceConfig, OneBlockSource, OverflowPolicy, PreprocessFunc, Source, SourceFactory,
    SourceFromNumFactory,
};
pub use self::step::Step;
pub use self::store::{DirStore, MemoryStore, ObjectStore, StoreError};
pub use self::stream::{HeadRefGetter, StreamBuilder};
