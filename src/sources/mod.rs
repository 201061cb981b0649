//! Block sources: producers feeding a [`BlockHandler`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::BlockHandler;
use crate::shutter::Shutter;

mod file;
mod joining;
mod live;
mod one_block;

pub use file::{FileSource, FileSourceConfig, PreprocessFunc};
pub use joining::{JoiningSource, JoiningSourceConfig};
pub use live::{LiveSource, LiveSourceConfig, OverflowPolicy};
pub use one_block::OneBlockSource;

/// A running block producer.
///
/// `run` drives the source until it terminates; every exit path trips
/// the source's [`Shutter`], so `terminated`/`cause` always resolve.
/// Handler errors become the termination cause, propagated verbatim.
#[async_trait]
pub trait Source: Send + Sync {
    async fn run(self: Arc<Self>);

    fn shutter(&self) -> &Shutter;

    fn shutdown(&self, cause: Option<anyhow::Error>) {
        self.shutter().shutdown(cause);
    }

    async fn terminated(&self) {
        self.shutter().terminated().await;
    }

    fn is_terminated(&self) -> bool {
        self.shutter().is_terminated()
    }
}

/// Builds a source around a handler.
pub type SourceFactory = Arc<dyn Fn(Arc<dyn BlockHandler>) -> Arc<dyn Source> + Send + Sync>;

/// Builds a source starting at a given block number.
pub type SourceFromNumFactory =
    Arc<dyn Fn(u64, Arc<dyn BlockHandler>) -> Arc<dyn Source> + Send + Sync>;
