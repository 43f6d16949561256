use log::debug;
use std::error;

use crate::markers::{MARKER_SYMBOL_EPH, MARKER_SYMBOL_SOP};
use crate::tag_tree::TagTree;
use crate::CodestreamError;

/// B.10.1 Packet header bits are packed most significant bit first. A byte
/// following an 0xFF carries only seven bits, its most significant bit being
/// a stuffed zero.
#[derive(Debug)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    free: u8,
    capacity: u8,
    count: usize,
}

impl Default for BitWriter {
    fn default() -> Self {
        BitWriter::new()
    }
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter {
            bytes: vec![],
            current: 0,
            free: 8,
            capacity: 8,
            count: 0,
        }
    }

    pub fn put_bit(&mut self, bit: u8) {
        self.free -= 1;
        self.current |= (bit & 1) << self.free;
        self.count += 1;
        if self.free == 0 {
            self.bytes.push(self.current);
            self.capacity = if self.current == 0xFF { 7 } else { 8 };
            self.free = self.capacity;
            self.current = 0;
        }
    }

    pub fn put_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.put_bit(((value >> i) & 1) as u8);
        }
    }

    pub fn bits_written(&self) -> usize {
        self.count
    }

    /// Pads the last byte with zeros; a header never ends on 0xFF.
    pub fn finish(mut self) -> Vec<u8> {
        if self.free < self.capacity {
            self.bytes.push(self.current);
        }
        if self.bytes.last() == Some(&0xFF) {
            self.bytes.push(0);
        }
        self.bytes
    }
}

#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    current: u8,
    left: u8,
    last_was_ff: bool,
    consumed: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader {
            data,
            position: 0,
            current: 0,
            left: 0,
            last_was_ff: false,
            consumed: 0,
        }
    }

    /// `None` once the data runs out.
    pub fn get_bit(&mut self) -> Option<u8> {
        if self.left == 0 {
            let byte = *self.data.get(self.position)?;
            self.position += 1;
            self.left = if self.last_was_ff { 7 } else { 8 };
            self.last_was_ff = byte == 0xFF;
            self.current = byte;
        }
        self.left -= 1;
        self.consumed += 1;
        Some((self.current >> self.left) & 1)
    }

    pub fn get_bits(&mut self, count: u8) -> Option<u32> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.get_bit()? as u32;
        }
        Some(value)
    }

    pub fn bits_consumed(&self) -> usize {
        self.consumed
    }

    /// Discards the rest of the current byte, and the stuffed byte after a
    /// trailing 0xFF. Returns the number of bytes consumed.
    pub fn align(&mut self) -> Option<usize> {
        self.left = 0;
        if self.last_was_ff {
            if self.position >= self.data.len() {
                return None;
            }
            self.position += 1;
            self.last_was_ff = false;
        }
        Some(self.position)
    }
}

/// Table B.4 codewords for the number of new coding passes.
fn put_pass_count(bits: &mut BitWriter, passes: usize) {
    match passes {
        1 => bits.put_bit(0),
        2 => bits.put_bits(0b10, 2),
        3..=5 => {
            bits.put_bits(0b11, 2);
            bits.put_bits((passes - 3) as u32, 2);
        }
        6..=36 => {
            bits.put_bits(0b1111, 4);
            bits.put_bits((passes - 6) as u32, 5);
        }
        _ => {
            bits.put_bits(0b1_1111_1111, 9);
            bits.put_bits((passes - 37) as u32, 7);
        }
    }
}

fn get_pass_count(bits: &mut BitReader) -> Option<usize> {
    if bits.get_bit()? == 0 {
        return Some(1);
    }
    if bits.get_bit()? == 0 {
        return Some(2);
    }
    let value = bits.get_bits(2)?;
    if value < 3 {
        return Some(3 + value as usize);
    }
    let value = bits.get_bits(5)?;
    if value < 31 {
        return Some(6 + value as usize);
    }
    Some(37 + bits.get_bits(7)? as usize)
}

/// Most passes a code-block can carry (three per magnitude bit-plane).
pub const MAX_PASSES: usize = 164;

fn floor_log2(value: usize) -> u8 {
    (usize::BITS - 1 - value.leading_zeros()) as u8
}

#[derive(Debug, Clone, Copy)]
struct BlockCoding {
    included: bool,
    lblock: u8,
    passes: usize,
}

impl Default for BlockCoding {
    fn default() -> Self {
        BlockCoding {
            included: false,
            lblock: 3,
            passes: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct BandCoder {
    width: usize,
    height: usize,
    inclusion: TagTree,
    zero_planes: TagTree,
    blocks: Vec<BlockCoding>,
}

/// New coding passes one code-block contributes to a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub band: usize,
    pub block: usize,
    pub passes: usize,
    pub length: usize,
    /// Present on the block's first inclusion.
    pub missing_msbs: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Bytes of header consumed, including any SOP and EPH markers.
    pub header_length: usize,
    pub contributions: Vec<Contribution>,
}

impl DecodedPacket {
    pub fn body_length(&self) -> usize {
        self.contributions.iter().map(|c| c.length).sum()
    }
}

/// Inter-packet state of one precinct: tag trees and per-block `Lblock`
/// values evolve from one quality layer to the next.
#[derive(Debug, Clone)]
pub struct PrecinctCoder {
    bands: Vec<BandCoder>,
    layers_coded: u16,
}

impl PrecinctCoder {
    /// `band_dims` holds the code-block grid dimensions of each subband.
    pub fn new(band_dims: &[(usize, usize)]) -> PrecinctCoder {
        PrecinctCoder {
            bands: band_dims
                .iter()
                .map(|(width, height)| BandCoder {
                    width: *width,
                    height: *height,
                    inclusion: TagTree::new(*width, *height),
                    zero_planes: TagTree::new(*width, *height),
                    blocks: vec![BlockCoding::default(); width * height],
                })
                .collect(),
            layers_coded: 0,
        }
    }

    pub fn layers_coded(&self) -> u16 {
        self.layers_coded
    }

    /// Loads the values the encoder's tag trees will signal: the first layer
    /// in which each block contributes (`u32::MAX` if never) and its missing
    /// most significant bit-planes.
    pub fn prepare_encoding(&mut self, first_layers: &[Vec<u32>], missing_msbs: &[Vec<u32>]) {
        for (band, coder) in self.bands.iter_mut().enumerate() {
            if coder.blocks.is_empty() {
                continue;
            }
            coder.inclusion.set_values(&first_layers[band]);
            coder.zero_planes.set_values(&missing_msbs[band]);
        }
    }

    /// Produces one packet. `contributions[band][block]` holds the number of
    /// new passes and their bytes.
    pub fn encode_packet(
        &mut self,
        contributions: &[Vec<(usize, &[u8])>],
        sop_sequence: Option<u16>,
        use_eph: bool,
    ) -> Vec<u8> {
        let layer = self.layers_coded as u32;
        self.layers_coded += 1;

        let mut out = vec![];
        if let Some(sequence) = sop_sequence {
            out.extend_from_slice(&MARKER_SYMBOL_SOP);
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&sequence.to_be_bytes());
        }

        let non_empty = contributions
            .iter()
            .any(|band| band.iter().any(|(passes, _)| *passes > 0));
        let mut bits = BitWriter::new();
        let mut body = vec![];
        if !non_empty {
            bits.put_bit(0);
        } else {
            bits.put_bit(1);
            for (band, coder) in self.bands.iter_mut().enumerate() {
                for y in 0..coder.height {
                    for x in 0..coder.width {
                        let index = y * coder.width + x;
                        let (passes, data) = contributions[band][index];
                        let state = &mut coder.blocks[index];
                        if !state.included {
                            coder.inclusion.encode(x, y, layer + 1, &mut bits);
                            if passes == 0 {
                                continue;
                            }
                            coder.zero_planes.encode(x, y, u32::MAX, &mut bits);
                            state.included = true;
                        } else {
                            bits.put_bit((passes > 0) as u8);
                            if passes == 0 {
                                continue;
                            }
                        }
                        put_pass_count(&mut bits, passes);
                        let mut length_bits = state.lblock + floor_log2(passes);
                        while data.len() as u64 >= 1u64 << length_bits {
                            bits.put_bit(1);
                            state.lblock += 1;
                            length_bits += 1;
                        }
                        bits.put_bit(0);
                        bits.put_bits(data.len() as u32, length_bits);
                        state.passes += passes;
                        body.extend_from_slice(data);
                    }
                }
            }
        }
        out.extend(bits.finish());
        if use_eph {
            out.extend_from_slice(&MARKER_SYMBOL_EPH);
        }
        debug!(
            "packet for layer {} has {} header and {} body bytes",
            layer,
            out.len(),
            body.len()
        );
        out.extend(body);
        out
    }

    /// Parses one packet header from `data`. With `expect_sop` an SOP marker
    /// is skipped when present. Returns `Ok(None)` if `data` ends before the
    /// header does, leaving the coder state untouched.
    pub fn decode_packet(
        &mut self,
        data: &[u8],
        expect_sop: bool,
        use_eph: bool,
        tile: u32,
    ) -> Result<Option<DecodedPacket>, Box<dyn error::Error>> {
        let mut trial = self.clone();
        match trial.decode_in_place(data, expect_sop, use_eph, tile)? {
            Some(packet) => {
                *self = trial;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    fn decode_in_place(
        &mut self,
        data: &[u8],
        expect_sop: bool,
        use_eph: bool,
        tile: u32,
    ) -> Result<Option<DecodedPacket>, Box<dyn error::Error>> {
        let layer = self.layers_coded as u32;
        let mut offset = 0;
        if expect_sop {
            if data.len() < 2 {
                return Ok(None);
            }
            if data[0..2] == MARKER_SYMBOL_SOP {
                if data.len() < 6 {
                    return Ok(None);
                }
                offset = 6;
            }
        }

        let mut bits = BitReader::new(&data[offset..]);
        let mut contributions = vec![];
        let present = match bits.get_bit() {
            Some(bit) => bit == 1,
            None => return Ok(None),
        };
        if present {
            for (band, coder) in self.bands.iter_mut().enumerate() {
                for y in 0..coder.height {
                    for x in 0..coder.width {
                        let index = y * coder.width + x;
                        let state = &mut coder.blocks[index];
                        let mut missing_msbs = None;
                        if !state.included {
                            match coder.inclusion.decode(x, y, layer + 1, &mut bits) {
                                Some(true) => {}
                                Some(false) => continue,
                                None => return Ok(None),
                            }
                            let mut threshold = 1;
                            loop {
                                match coder.zero_planes.decode(x, y, threshold, &mut bits) {
                                    Some(true) => break,
                                    Some(false) => threshold += 1,
                                    None => return Ok(None),
                                }
                                if threshold > 74 {
                                    return Err(malformed(tile, "zero bit-plane count overflow"));
                                }
                            }
                            missing_msbs = coder.zero_planes.value(x, y).map(|v| v as u8);
                            state.included = true;
                        } else {
                            match bits.get_bit() {
                                Some(1) => {}
                                Some(_) => continue,
                                None => return Ok(None),
                            }
                        }
                        let passes = match get_pass_count(&mut bits) {
                            Some(passes) => passes,
                            None => return Ok(None),
                        };
                        if state.passes + passes > MAX_PASSES {
                            return Err(malformed(tile, "too many coding passes"));
                        }
                        loop {
                            match bits.get_bit() {
                                Some(1) => state.lblock += 1,
                                Some(_) => break,
                                None => return Ok(None),
                            }
                        }
                        let length_bits = state.lblock + floor_log2(passes);
                        if length_bits > 32 {
                            return Err(malformed(tile, "codeword segment length overflow"));
                        }
                        let length = match bits.get_bits(length_bits) {
                            Some(length) => length as usize,
                            None => return Ok(None),
                        };
                        state.passes += passes;
                        contributions.push(Contribution {
                            band,
                            block: index,
                            passes,
                            length,
                            missing_msbs,
                        });
                    }
                }
            }
        }
        let mut header_length = match bits.align() {
            Some(length) => offset + length,
            None => return Ok(None),
        };
        if use_eph {
            if data.len() < header_length + 2 {
                return Ok(None);
            }
            if data[header_length..header_length + 2] != MARKER_SYMBOL_EPH {
                return Err(malformed(tile, "missing EPH marker"));
            }
            header_length += 2;
        }
        self.layers_coded += 1;
        Ok(Some(DecodedPacket {
            header_length,
            contributions,
        }))
    }
}

fn malformed(tile: u32, reason: &str) -> Box<dyn error::Error> {
    Box::new(CodestreamError::PacketMalformed {
        tile,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_stuffing() {
        let mut writer = BitWriter::new();
        writer.put_bits(0xFF, 8);
        writer.put_bits(0b111_1111, 7);
        writer.put_bit(1);
        let data = writer.finish();
        assert_eq!(data, vec![0xFF, 0x7F, 0x80]);

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.get_bits(8), Some(0xFF));
        assert_eq!(reader.get_bits(7), Some(0x7F));
        assert_eq!(reader.get_bit(), Some(1));
        assert_eq!(reader.align(), Some(3));
    }

    #[test]
    fn test_trailing_ff_is_followed_by_zero() {
        let mut writer = BitWriter::new();
        writer.put_bits(0xFF, 8);
        let data = writer.finish();
        assert_eq!(data, vec![0xFF, 0x00]);
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.get_bits(8), Some(0xFF));
        assert_eq!(reader.align(), Some(2));
    }

    #[test]
    fn test_pass_count_codewords() {
        for passes in [1, 2, 3, 5, 6, 36, 37, 164] {
            let mut writer = BitWriter::new();
            put_pass_count(&mut writer, passes);
            let data = writer.finish();
            let mut reader = BitReader::new(&data);
            assert_eq!(get_pass_count(&mut reader), Some(passes));
        }
    }

    #[test]
    fn test_packets_decode_what_was_encoded() {
        let dims = [(2, 1), (1, 1)];
        let mut encoder = PrecinctCoder::new(&dims);
        encoder.prepare_encoding(&[vec![0, 1], vec![u32::MAX]], &[vec![3, 0], vec![0]]);
        let a = vec![7u8; 20];
        let b = vec![9u8; 300];
        let layer0 = encoder.encode_packet(&[vec![(3, &a[..]), (0, &[][..])], vec![(0, &[][..])]], Some(0), true);
        let layer1 = encoder.encode_packet(&[vec![(1, &a[..5]), (4, &b[..])], vec![(0, &[][..])]], Some(1), true);
        let layer2 = encoder.encode_packet(&[vec![(0, &[][..]), (0, &[][..])], vec![(0, &[][..])]], Some(2), true);

        let mut decoder = PrecinctCoder::new(&dims);
        let packet = decoder.decode_packet(&layer0, true, true, 0).unwrap().unwrap();
        assert_eq!(
            packet.contributions,
            vec![Contribution {
                band: 0,
                block: 0,
                passes: 3,
                length: 20,
                missing_msbs: Some(3)
            }]
        );
        assert_eq!(packet.header_length + packet.body_length(), layer0.len());

        // A truncated header leaves the decoder ready to retry.
        let short = &layer1[..7];
        assert!(decoder.decode_packet(short, true, true, 0).unwrap().is_none());
        let packet = decoder.decode_packet(&layer1, true, true, 0).unwrap().unwrap();
        assert_eq!(packet.contributions.len(), 2);
        assert_eq!(packet.contributions[1].length, 300);
        assert_eq!(packet.contributions[1].missing_msbs, Some(0));
        assert_eq!(packet.header_length + packet.body_length(), layer1.len());

        let packet = decoder.decode_packet(&layer2, true, true, 0).unwrap().unwrap();
        assert!(packet.contributions.is_empty());
        assert_eq!(packet.header_length, layer2.len());
        assert_eq!(decoder.layers_coded(), 3);
    }
}
