//! Block layout planning
//!
//! Splits `[0, total_length)` into contiguous, non-overlapping blocks. The
//! layout is the only thing keeping concurrent writers apart (there is no lock
//! on the destination file), so [`validate`] is run on every context the
//! downloader adopts.

use crate::error::{Error, Result};
use crate::types::BlockDescriptor;

/// Plan a layout of at most `block_count` blocks, none smaller than
/// `min_block_size` unless the whole resource is.
///
/// Block sizes differ by at most one byte; the first `total_length % n`
/// blocks take the extra byte. An empty resource gets a single zero-length
/// block so the transfer still has something to complete.
pub fn plan(total_length: u64, block_count: usize, min_block_size: u64) -> Vec<BlockDescriptor> {
    if total_length == 0 {
        return vec![BlockDescriptor::new(0, 0)];
    }

    let by_min_size = total_length.div_ceil(min_block_size.max(1));
    let count = by_min_size.clamp(1, block_count.max(1) as u64);
    let base = total_length / count;
    let extra = total_length % count;

    let mut blocks = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for i in 0..count {
        let length = base + u64::from(i < extra);
        blocks.push(BlockDescriptor::new(offset, length));
        offset += length;
    }

    tracing::debug!(
        total_length,
        blocks = blocks.len(),
        block_size = base,
        "Planned block layout"
    );
    blocks
}

/// Check that `blocks` are in offset order and exactly cover `[0, total_length)`
pub fn validate(total_length: u64, blocks: &[BlockDescriptor]) -> Result<()> {
    if blocks.is_empty() {
        return Err(Error::InvalidLayout("layout has no blocks".to_string()));
    }

    let mut expected_offset = 0u64;
    for (i, block) in blocks.iter().enumerate() {
        if block.offset != expected_offset {
            return Err(Error::InvalidLayout(format!(
                "block {i} starts at {} but previous block ends at {expected_offset}",
                block.offset
            )));
        }
        if block.length == 0 && total_length != 0 {
            return Err(Error::InvalidLayout(format!("block {i} is empty")));
        }
        expected_offset = block
            .offset
            .checked_add(block.length)
            .ok_or_else(|| Error::InvalidLayout(format!("block {i} overflows")))?;
    }

    if expected_offset != total_length {
        return Err(Error::InvalidLayout(format!(
            "blocks cover {expected_offset} bytes, resource has {total_length}"
        )));
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;

    #[test]
    fn one_mib_in_eight_equal_blocks() {
        let blocks = plan(MIB, 8, 64 * KIB);

        assert_eq!(blocks.len(), 8);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.offset, i as u64 * 128 * KIB);
            assert_eq!(block.length, 128 * KIB);
        }
        validate(MIB, &blocks).unwrap();
    }

    #[test]
    fn remainder_is_spread_over_leading_blocks() {
        let blocks = plan(10, 3, 1);

        let lengths: Vec<_> = blocks.iter().map(|b| b.length).collect();
        assert_eq!(lengths, vec![4, 3, 3]);
        validate(10, &blocks).unwrap();
    }

    #[test]
    fn min_block_size_limits_block_count() {
        let blocks = plan(3 * MIB, 16, MIB);
        assert_eq!(blocks.len(), 3, "3 MiB with 1 MiB minimum gives 3 blocks");

        let blocks = plan(100, 16, MIB);
        assert_eq!(blocks.len(), 1, "small resource should be a single block");
        assert_eq!(blocks[0], BlockDescriptor::new(0, 100));
    }

    #[test]
    fn empty_resource_gets_one_zero_length_block() {
        let blocks = plan(0, 8, MIB);

        assert_eq!(blocks, vec![BlockDescriptor::new(0, 0)]);
        validate(0, &blocks).unwrap();
    }

    #[test]
    fn zero_block_count_is_treated_as_one() {
        let blocks = plan(1000, 0, 1);
        assert_eq!(blocks, vec![BlockDescriptor::new(0, 1000)]);
    }

    #[test]
    fn validate_rejects_gap() {
        let blocks = [BlockDescriptor::new(0, 10), BlockDescriptor::new(11, 9)];
        assert!(matches!(validate(20, &blocks), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn validate_rejects_overlap() {
        let blocks = [BlockDescriptor::new(0, 10), BlockDescriptor::new(9, 11)];
        assert!(matches!(validate(20, &blocks), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn validate_rejects_short_coverage() {
        let blocks = [BlockDescriptor::new(0, 10)];
        assert!(matches!(validate(20, &blocks), Err(Error::InvalidLayout(_))));
    }

    #[test]
    fn validate_rejects_empty_block_in_non_empty_resource() {
        let blocks = [BlockDescriptor::new(0, 10), BlockDescriptor::new(10, 0)];
        assert!(matches!(validate(10, &blocks), Err(Error::InvalidLayout(_))));
    }
}
