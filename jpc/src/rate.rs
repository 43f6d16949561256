use log::{debug, info};

use crate::block::CodedBlock;
use crate::precinct::NO_PASSES;

/// Bytes of coded data included when passes are cut at `threshold`.
pub(crate) fn bytes_at(blocks: &[&CodedBlock], threshold: u32) -> u64 {
    blocks
        .iter()
        .map(|block| block.bytes_for(block.passes_at(threshold)) as u64)
        .sum()
}

/// Smallest threshold not above `upper` whose included bytes fit `budget`.
fn fit_threshold(blocks: &[&CodedBlock], budget: u64, upper: u32) -> u32 {
    if bytes_at(blocks, upper) > budget {
        return upper;
    }
    let (mut low, mut high) = (0u32, upper);
    while low < high {
        let middle = low + (high - low) / 2;
        if bytes_at(blocks, middle) <= budget {
            high = middle;
        } else {
            low = middle + 1;
        }
    }
    high
}

/// Chooses one distortion-length slope threshold per quality layer.
///
/// `layer_bytes` holds cumulative byte targets; a zero (or missing) target
/// leaves the layer to be spaced evenly between its neighbours, the last
/// layer defaulting to every remaining pass. Targets are scaled by
/// `fraction`, the share of the image whose blocks are available, and
/// reduced by `overhead_per_layer` to leave room for packet headers.
pub(crate) fn allocate(
    blocks: &[&CodedBlock],
    layer_bytes: &[u64],
    layers: usize,
    overhead_per_layer: u64,
    fraction: f64,
) -> Vec<u32> {
    let mut thresholds: Vec<Option<u32>> = vec![None; layers];
    let mut upper = NO_PASSES;
    for (l, threshold) in thresholds.iter_mut().enumerate() {
        let target = layer_bytes.get(l).copied().unwrap_or(0);
        if target == 0 {
            continue;
        }
        let scaled = (target as f64 * fraction) as u64;
        let budget = scaled.saturating_sub(overhead_per_layer * (l as u64 + 1));
        let chosen = fit_threshold(blocks, budget, upper);
        debug!(
            "layer {} target {} bytes, budget {}, threshold {}",
            l, target, budget, chosen
        );
        *threshold = Some(chosen);
        upper = chosen;
    }
    if let Some(last) = thresholds.last_mut() {
        if last.is_none() {
            *last = Some(0);
        }
    }
    let resolved = interpolate(&thresholds);
    info!("layer thresholds {:?}", resolved);
    resolved
}

/// Fills unspecified thresholds linearly between their neighbours.
fn interpolate(thresholds: &[Option<u32>]) -> Vec<u32> {
    let mut out = Vec::with_capacity(thresholds.len());
    let mut previous = (-1i64, 0xFFFFu32);
    for (l, threshold) in thresholds.iter().enumerate() {
        match threshold {
            Some(value) => {
                out.push(*value);
                previous = (l as i64, *value);
            }
            None => {
                let (next_index, next_value) = thresholds[l..]
                    .iter()
                    .enumerate()
                    .find_map(|(i, t)| t.map(|v| ((l + i) as i64, v)))
                    .unwrap_or((thresholds.len() as i64, 0));
                let span = next_index - previous.0;
                let step = l as i64 - previous.0;
                let value = previous.1 as i64 + (next_value as i64 - previous.1 as i64) * step / span;
                out.push(value as u32);
            }
        }
    }
    out
}

/// Estimated size of all layers when keeping the first `kept` of the
/// layers recorded in pass slopes.
pub(crate) fn bytes_for_layers(blocks: &[&CodedBlock], kept: u16, overhead_per_layer: u64) -> u64 {
    if kept == 0 {
        return 0;
    }
    let threshold = 0xFFFF - (kept as u32 - 1);
    bytes_at(blocks, threshold) + overhead_per_layer * kept as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn coded(passes: &[(usize, u16)]) -> CodedBlock {
        let mut block = Block::default();
        for (length, slope) in passes {
            block.push_pass(&vec![0; *length], *slope);
        }
        CodedBlock::from_block(block)
    }

    #[test]
    fn test_allocation_respects_targets() {
        let a = coded(&[(100, 5000), (100, 4000), (100, 3000)]);
        let b = coded(&[(50, 4500), (50, 3500), (50, 2500)]);
        let blocks = vec![&a, &b];
        let thresholds = allocate(&blocks, &[160, 400], 2, 0, 1.0);
        assert_eq!(thresholds.len(), 2);
        assert!(bytes_at(&blocks, thresholds[0]) <= 160);
        assert_eq!(bytes_at(&blocks, thresholds[0]), 150);
        assert!(thresholds[1] <= thresholds[0]);
        assert!(bytes_at(&blocks, thresholds[1]) <= 400);
    }

    #[test]
    fn test_unspecified_layers_are_spaced() {
        let thresholds = interpolate(&[None, None, Some(0)]);
        assert_eq!(thresholds, vec![0xFFFF * 2 / 3, 0xFFFF / 3, 0]);
        let thresholds = interpolate(&[Some(900), None, Some(100)]);
        assert_eq!(thresholds, vec![900, 500, 100]);
    }
}
