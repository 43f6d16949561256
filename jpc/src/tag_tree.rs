use log::debug;

use crate::packet::{BitReader, BitWriter};

/// A tag tree represents a 2d-array of natural numbers.
///
/// B.10.2 A tag tree is a way of representing a two-dimensional array of non-negative integers in
/// a hierarchical way. It successively creates reduced resolution levels of this two-dimensional
/// array, forming a tree. At every node of this tree the minimum integer of the (up to four) nodes
/// below it is recorded. Figure B.12 shows an example of this representation. The notation, qi(m,
/// n), is the value at the node that is mth from the left and nth from the top, at the ith level.
/// Level 0 is the lowest level of the tag tree; it contains the top node.
///
/// Values are coded against a threshold: each call communicates only as much as is needed to
/// tell whether a leaf is below the threshold, and later calls with higher thresholds continue
/// from where earlier ones stopped.
#[derive(Debug, Clone)]
pub struct TagTree {
    /// (width, height) of each level, leaves first.
    dims: Vec<(usize, usize)>,
    /// Offset of each level's first node in `nodes`.
    offsets: Vec<usize>,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    value: u32,
    /// Lower bound already communicated for this node.
    low: u32,
    /// Whether the terminating 1 bit has been coded.
    known: bool,
}

const UNKNOWN: u32 = u32::MAX;

impl TagTree {
    pub fn new(width: usize, height: usize) -> TagTree {
        let mut dims = vec![];
        let mut offsets = vec![];
        let mut total = 0;
        let (mut w, mut h) = (width.max(1), height.max(1));
        loop {
            dims.push((w, h));
            offsets.push(total);
            total += w * h;
            if w == 1 && h == 1 {
                break;
            }
            w = w.div_ceil(2);
            h = h.div_ceil(2);
        }
        debug!("tag tree {}x{} uses {} levels", width, height, dims.len());
        TagTree {
            dims,
            offsets,
            nodes: vec![
                Node {
                    value: UNKNOWN,
                    low: 0,
                    known: false
                };
                total
            ],
        }
    }

    pub fn depth(&self) -> usize {
        self.dims.len()
    }

    /// Forgets all coding progress, keeping leaf values.
    pub fn reset(&mut self) {
        for node in self.nodes.iter_mut() {
            node.low = 0;
            node.known = false;
        }
    }

    /// Sets the leaf values to be encoded and propagates minima upwards.
    pub fn set_values(&mut self, values: &[u32]) {
        let (width, height) = self.dims[0];
        assert_eq!(values.len(), width * height);
        for node in self.nodes.iter_mut() {
            node.value = UNKNOWN;
            node.low = 0;
            node.known = false;
        }
        for (i, value) in values.iter().enumerate() {
            self.nodes[i].value = *value;
        }
        for level in 1..self.dims.len() {
            let (child_width, child_height) = self.dims[level - 1];
            for y in 0..child_height {
                for x in 0..child_width {
                    let child = self.offsets[level - 1] + y * child_width + x;
                    let parent = self.parent_index(level, x / 2, y / 2);
                    self.nodes[parent].value = self.nodes[parent].value.min(self.nodes[child].value);
                }
            }
        }
    }

    /// Leaf value, if it has been fully decoded.
    pub fn value(&self, x: usize, y: usize) -> Option<u32> {
        let node = &self.nodes[y * self.dims[0].0 + x];
        if node.value == UNKNOWN {
            None
        } else {
            Some(node.value)
        }
    }

    fn parent_index(&self, level: usize, x: usize, y: usize) -> usize {
        self.offsets[level] + y * self.dims[level].0 + x
    }

    /// Node indices from the root down to leaf (x, y).
    fn path(&self, x: usize, y: usize) -> Vec<usize> {
        let mut path = Vec::with_capacity(self.dims.len());
        let (mut x, mut y) = (x, y);
        for level in 0..self.dims.len() {
            path.push(self.parent_index(level, x, y));
            x /= 2;
            y /= 2;
        }
        path.reverse();
        path
    }

    /// Emits the bits telling whether leaf (x, y) is below `threshold`.
    pub fn encode(&mut self, x: usize, y: usize, threshold: u32, bits: &mut BitWriter) {
        let mut low = 0;
        for index in self.path(x, y) {
            let node = &mut self.nodes[index];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        bits.put_bit(1);
                        node.known = true;
                    }
                    break;
                }
                bits.put_bit(0);
                low += 1;
            }
            node.low = low;
        }
    }

    /// Consumes bits until it is known whether leaf (x, y) is below
    /// `threshold`; `None` if the reader ran out first.
    pub fn decode(&mut self, x: usize, y: usize, threshold: u32, bits: &mut BitReader) -> Option<bool> {
        let mut low = 0;
        for index in self.path(x, y) {
            let node = &mut self.nodes[index];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if bits.get_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
        }
        let leaf = &self.nodes[y * self.dims[0].0 + x];
        Some(leaf.value < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Figure B.12 / B.10.2: the 6x3 array and the bits coding every leaf in
    // raster order with an unbounded threshold.
    const VALUES: [u32; 18] = [1, 3, 2, 3, 2, 3, 2, 2, 1, 4, 3, 2, 2, 2, 2, 2, 1, 2];
    const BITS: &str = "01111001101001101101010110001011011101111101";

    fn bits_of(text: &str) -> Vec<u8> {
        let mut writer = BitWriter::new();
        for c in text.chars() {
            writer.put_bit(if c == '1' { 1 } else { 0 });
        }
        writer.finish()
    }

    #[test]
    fn test_basic() {
        let mut tt = TagTree::new(6, 3);
        assert_eq!(4, tt.depth());

        let data = bits_of(BITS);
        let mut reader = BitReader::new(&data);
        for y in 0..3 {
            for x in 0..6 {
                assert_eq!(tt.decode(x, y, u32::MAX, &mut reader), Some(true));
                assert_eq!(tt.value(x, y), Some(VALUES[y * 6 + x]));
            }
        }
        assert_eq!(reader.bits_consumed(), BITS.len());
    }

    #[test]
    fn test_encoder_produces_standard_bits() {
        let mut tt = TagTree::new(6, 3);
        tt.set_values(&VALUES);
        let mut writer = BitWriter::new();
        for y in 0..3 {
            for x in 0..6 {
                tt.encode(x, y, u32::MAX, &mut writer);
            }
        }
        assert_eq!(writer.bits_written(), BITS.len());
        assert_eq!(writer.finish(), bits_of(BITS));
    }

    #[test]
    fn test_incremental_thresholds() {
        let values = [0, 2, 5, 1];
        let mut encoder = TagTree::new(2, 2);
        encoder.set_values(&values);
        let mut decoder = TagTree::new(2, 2);
        let mut writer = BitWriter::new();
        for threshold in 1..=6 {
            for i in 0..4 {
                encoder.encode(i % 2, i / 2, threshold, &mut writer);
            }
        }
        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        for threshold in 1..=6 {
            for (i, value) in values.iter().enumerate() {
                let below = decoder.decode(i % 2, i / 2, threshold, &mut reader);
                assert_eq!(below, Some(*value < threshold));
            }
        }
        for (i, value) in values.iter().enumerate() {
            assert_eq!(decoder.value(i % 2, i / 2), Some(*value));
        }
    }
}
