//! Block-file framing: each block is a varint length prefix followed
//! by its CBOR encoding. Bundles hold consecutive blocks in ascending
//! height order; one-block files hold a single frame.

use anyhow::{anyhow, bail, Result};

use crate::block::Block;

/// Zero-padded base number, the bundle file name.
pub fn bundle_name(base_num: u64) -> String {
    format!("{base_num:010}")
}

/// `<padded num>-<id>`, the one-block file name.
pub fn one_block_name(block: &Block) -> String {
    format!("{:010}-{}", block.num, block.id)
}

/// Parse a one-block file name back into `(num, id)`.
pub fn parse_one_block_name(name: &str) -> Option<(u64, &str)> {
    let (num, id) = name.split_once('-')?;
    if id.is_empty() {
        return None;
    }
    Some((num.parse().ok()?, id))
}

/// First bundle base at or below `block_num` for a given bundle size.
pub fn bundle_base(block_num: u64, bundle_size: u64) -> u64 {
    (block_num / bundle_size) * bundle_size
}

fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut chunks = [0u8; 10];
    let mut filled = 0;
    loop {
        chunks[filled] = (value & 0x7f) as u8;
        filled += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    while filled > 1 {
        filled -= 1;
        out.push(chunks[filled] | 0x80);
    }
    out.push(chunks[0]);
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| anyhow!("truncated varint at offset {}", *pos))?;
        *pos += 1;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("varint too long at offset {}", *pos)
}

/// Encode blocks into one framed buffer. The caller is responsible for
/// feeding them in ascending order; decoding enforces it.
pub fn encode_blocks<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        let frame = minicbor::to_vec(block)?;
        push_varint(&mut out, frame.len() as u64);
        out.extend_from_slice(&frame);
    }
    Ok(out)
}

/// Decode a framed buffer. Frames must be complete and blocks must
/// ascend in height.
pub fn decode_blocks(bytes: &[u8]) -> Result<Vec<Block>> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let len = read_varint(bytes, &mut pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| anyhow!("truncated frame at offset {pos}"))?;
        let block: Block = minicbor::decode(&bytes[pos..end])?;
        if let Some(last) = blocks.last() {
            if block.num < last.num {
                bail!(
                    "blocks out of order in frame stream: {} after {}",
                    block.num,
                    last.num
                );
            }
        }
        blocks.push(block);
        pos = end;
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bblock_lib;

    #[test]
    fn names() {
        assert_eq!(bundle_name(100), "0000000100");
        assert_eq!(bundle_base(199, 100), 100);
        assert_eq!(bundle_base(200, 100), 200);

        let block = bblock_lib("00000004a", "00000003a", 2);
        assert_eq!(one_block_name(&block), "0000000004-00000004a");
        assert_eq!(
            parse_one_block_name("0000000004-00000004a"),
            Some((4, "00000004a"))
        );
        assert_eq!(parse_one_block_name("garbage"), None);
    }

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, u64::MAX] {
            let mut out = Vec::new();
            push_varint(&mut out, value);
            let mut pos = 0;
            assert_eq!(read_varint(&out, &mut pos).unwrap(), value);
            assert_eq!(pos, out.len());
        }
    }

    #[test]
    fn frames_round_trip() {
        let blocks = vec![
            bblock_lib("00000002a", "00000001a", 1),
            bblock_lib("00000003a", "00000002a", 1),
            bblock_lib("00000004a", "00000003a", 2),
        ];
        let encoded = encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap();
        let decoded = decode_blocks(&encoded).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].id.as_str(), "00000002a");
        assert_eq!(decoded[2].lib_num, 2);
    }

    #[test]
    fn out_of_order_frames_are_rejected() {
        let blocks = vec![
            bblock_lib("00000003a", "00000002a", 1),
            bblock_lib("00000002a", "00000001a", 1),
        ];
        let encoded = encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap();
        assert!(decode_blocks(&encoded).is_err());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let blocks = vec![bblock_lib("00000002a", "00000001a", 1)];
        let mut encoded = encode_blocks(blocks.iter().map(|b| b.as_ref())).unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(decode_blocks(&encoded).is_err());
    }
}
