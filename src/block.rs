//! Block identity types and the chain configuration that decodes
//! their payloads.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use minicbor::{Decode, Encode};

/// Opaque textual block id. Producers choose the format; the core only
/// ever compares ids for equality.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    serde::Serialize,
    serde::Deserialize,
)]
#[cbor(transparent)]
#[serde(transparent)]
pub struct BlockId(#[n(0)] String);

impl BlockId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for BlockId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(id, num)` reference to a block. Two refs are equal iff their ids
/// are equal; the number is carried for display and range logic only.
#[derive(Debug, Clone, Default, Eq, Encode, Decode, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    #[n(0)]
    pub id: BlockId,
    #[n(1)]
    pub num: u64,
}

impl BlockRef {
    pub fn new(id: impl Into<BlockId>, num: u64) -> Self {
        Self {
            id: id.into(),
            num,
        }
    }

    /// The empty reference, used where Go-style nil refs would appear.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl PartialEq for BlockRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::hash::Hash for BlockRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// A block as it flows through the library. Immutable once constructed;
/// carried as `Arc<Block>` everywhere.
///
/// `lib_num` is the height the producer considered irreversible when it
/// produced this block. The payload is opaque to the core and decoded
/// on demand through the [`ChainConfig`] registry.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode, serde::Serialize, serde::Deserialize)]
pub struct Block {
    #[n(0)]
    pub id: BlockId,
    #[n(1)]
    pub previous_id: BlockId,
    #[n(2)]
    pub num: u64,
    #[n(3)]
    pub lib_num: u64,
    /// UNIX timestamp, seconds.
    #[n(4)]
    pub timestamp: u64,
    #[n(5)]
    pub payload_kind: u32,
    #[n(6)]
    pub payload_version: u32,
    #[cbor(n(7), with = "minicbor::bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    pub fn as_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id.clone(),
            num: self.num,
        }
    }

    /// Reference to the declared parent. Heights may skip, so the
    /// parent's number is only a `num - 1` estimate; id is what counts.
    pub fn previous_ref(&self) -> BlockRef {
        if self.num == 0 || self.previous_id.is_empty() {
            return BlockRef::empty();
        }
        BlockRef {
            id: self.previous_id.clone(),
            num: self.num - 1,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// Decoded payload, downcast by the consumer.
pub type AnyPayload = Arc<dyn Any + Send + Sync>;

/// Payload decoder for one `(payload_kind, payload_version)` pair.
pub type PayloadDecoder = Arc<dyn Fn(&Block) -> Result<AnyPayload> + Send + Sync>;

/// Chain-level configuration: the first height the protocol can stream
/// and the registry resolving payload decoders by kind and version.
#[derive(Clone)]
pub struct ChainConfig {
    pub first_streamable_block: u64,
    decoders: HashMap<(u32, u32), PayloadDecoder>,
}

impl ChainConfig {
    pub fn new(first_streamable_block: u64) -> Self {
        Self {
            first_streamable_block,
            decoders: HashMap::new(),
        }
    }

    pub fn register_decoder(&mut self, kind: u32, version: u32, decoder: PayloadDecoder) {
        self.decoders.insert((kind, version), decoder);
    }

    /// Decode a block's payload through the registry.
    pub fn decode_payload(&self, block: &Block) -> Result<AnyPayload> {
        let decoder = self
            .decoders
            .get(&(block.payload_kind, block.payload_version))
            .ok_or_else(|| {
                anyhow!(
                    "no payload decoder registered for kind {} version {}",
                    block.payload_kind,
                    block.payload_version
                )
            })?;
        decoder(block)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("first_streamable_block", &self.first_streamable_block)
            .field("decoders", &self.decoders.len())
            .finish()
    }
}
