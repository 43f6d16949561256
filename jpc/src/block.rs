use std::error;

use crate::geometry::{Coords, Rect};
use crate::packet::MAX_PASSES;
use crate::CodestreamError;

/// Subband orientation; the high-pass axes of each band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    LL,
    HL,
    LH,
    HH,
}

impl Orientation {
    pub(crate) fn new(high_x: bool, high_y: bool) -> Orientation {
        match (high_x, high_y) {
            (false, false) => Orientation::LL,
            (true, false) => Orientation::HL,
            (false, true) => Orientation::LH,
            (true, true) => Orientation::HH,
        }
    }

    pub fn high_x(self) -> bool {
        matches!(self, Orientation::HL | Orientation::HH)
    }

    pub fn high_y(self) -> bool {
        matches!(self, Orientation::LH | Orientation::HH)
    }

    pub fn transpose(self) -> Orientation {
        Orientation::new(self.high_y(), self.high_x())
    }
}

/// Where a checked-out block goes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BlockLocation {
    pub tile: u32,
    pub generation: u32,
    pub component: usize,
    pub resolution: usize,
    pub band: usize,
    pub precinct: usize,
    pub slot: usize,
    pub index: Coords,
}

/// A code-block checked out of the codestream.
///
/// The geometry describes the block in the codestream's own orientation;
/// `transpose`, `vflip` and `hflip` tell the block coder how samples must be
/// reoriented to match the current appearance. Coded data consists of
/// `num_passes` coding passes whose byte counts are `pass_lengths` and whose
/// distortion-length slopes are `pass_slopes`.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub size: Coords,
    /// Samples of interest within the block, relative to its top-left corner.
    pub region: Rect,
    pub orientation: Orientation,
    pub transpose: bool,
    pub vflip: bool,
    pub hflip: bool,
    /// Code-block style flags (SPcod), for the block coder.
    pub modes: u8,
    pub missing_msbs: u8,
    pub num_passes: usize,
    pub pass_lengths: Vec<u32>,
    pub pass_slopes: Vec<u16>,
    pub data: Vec<u8>,
    pub(crate) location: BlockLocation,
}

impl Block {
    /// Records one more coding pass.
    pub fn push_pass(&mut self, bytes: &[u8], slope: u16) {
        self.data.extend_from_slice(bytes);
        self.pass_lengths.push(bytes.len() as u32);
        self.pass_slopes.push(slope);
        self.num_passes += 1;
    }

    pub(crate) fn validate(&self) -> Result<(), Box<dyn error::Error>> {
        if self.pass_lengths.len() != self.num_passes || self.pass_slopes.len() != self.num_passes {
            return Err(invalid(format!(
                "{} passes but {} lengths and {} slopes",
                self.num_passes,
                self.pass_lengths.len(),
                self.pass_slopes.len()
            )));
        }
        if self.num_passes > MAX_PASSES {
            return Err(invalid(format!("{} coding passes", self.num_passes)));
        }
        let total: u64 = self.pass_lengths.iter().map(|l| *l as u64).sum();
        if total != self.data.len() as u64 {
            return Err(invalid(format!(
                "pass lengths add up to {} but {} bytes were supplied",
                total,
                self.data.len()
            )));
        }
        let mut previous: Option<u16> = None;
        for slope in self.pass_slopes.iter().filter(|s| **s != 0) {
            if let Some(previous) = previous {
                if *slope >= previous {
                    return Err(invalid("non-zero pass slopes must strictly decrease".to_string()));
                }
            }
            previous = Some(*slope);
        }
        Ok(())
    }
}

/// Coded data retained for one block inside a precinct.
#[derive(Debug, Clone, Default)]
pub(crate) struct CodedBlock {
    pub missing_msbs: u8,
    pub pass_lengths: Vec<u32>,
    pub pass_slopes: Vec<u16>,
    pub data: Vec<u8>,
    /// Output and interchange: data has been supplied through `close_block`.
    pub closed: bool,
    /// Checked out since the tile or precinct was last opened.
    pub opened: bool,
}

impl CodedBlock {
    pub fn from_block(block: Block) -> CodedBlock {
        CodedBlock {
            missing_msbs: block.missing_msbs,
            pass_lengths: block.pass_lengths,
            pass_slopes: block.pass_slopes,
            data: block.data,
            closed: true,
            opened: true,
        }
    }

    /// Number of leading passes whose slope reaches `threshold`. Passes with
    /// a zero slope only travel with a later pass that qualifies.
    pub fn passes_at(&self, threshold: u32) -> usize {
        self.pass_slopes
            .iter()
            .rposition(|slope| *slope != 0 && *slope as u32 >= threshold)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn bytes_for(&self, passes: usize) -> usize {
        self.pass_lengths[..passes].iter().map(|l| *l as usize).sum()
    }

    /// Appends the passes one packet contributes; all bytes are attributed
    /// to the final pass, which carries the layer's slope.
    pub fn append_layer(&mut self, passes: usize, bytes: &[u8], layer: u16) {
        for _ in 1..passes {
            self.pass_lengths.push(0);
            self.pass_slopes.push(0);
        }
        self.pass_lengths.push(bytes.len() as u32);
        self.pass_slopes.push(layer_slope(layer));
        self.data.extend_from_slice(bytes);
    }

    pub fn retained_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn release(&mut self) {
        self.pass_lengths = vec![];
        self.pass_slopes = vec![];
        self.data = vec![];
    }
}

/// Slope marking the last pass of quality layer `layer`.
pub(crate) fn layer_slope(layer: u16) -> u16 {
    0xFFFF - layer
}

fn invalid(reason: String) -> Box<dyn error::Error> {
    Box::new(CodestreamError::InvalidBlock { reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_increasing_slopes() {
        let mut block = Block::default();
        block.push_pass(&[1, 2], 900);
        block.push_pass(&[3], 0);
        block.push_pass(&[4], 901);
        assert!(block.validate().is_err());

        let mut block = Block::default();
        block.push_pass(&[1, 2], 900);
        block.push_pass(&[3], 0);
        block.push_pass(&[4], 899);
        assert!(block.validate().is_ok());
        block.data.pop();
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_passes_at_threshold() {
        let mut block = Block::default();
        block.push_pass(&[0; 4], 500);
        block.push_pass(&[0; 2], 0);
        block.push_pass(&[0; 3], 300);
        block.push_pass(&[0; 1], 0);
        let coded = CodedBlock::from_block(block);
        assert_eq!(coded.passes_at(600), 0);
        assert_eq!(coded.passes_at(400), 1);
        assert_eq!(coded.passes_at(300), 3);
        assert_eq!(coded.passes_at(0), 3);
        assert_eq!(coded.bytes_for(3), 9);
    }

    #[test]
    fn test_append_layer_marks_last_pass() {
        let mut coded = CodedBlock::default();
        coded.append_layer(3, &[1, 2, 3], 0);
        coded.append_layer(1, &[4], 1);
        assert_eq!(coded.pass_lengths, vec![0, 0, 3, 1]);
        assert_eq!(coded.pass_slopes, vec![0, 0, 0xFFFF, 0xFFFE]);
        assert_eq!(coded.passes_at(layer_slope(0) as u32), 3);
    }
}
