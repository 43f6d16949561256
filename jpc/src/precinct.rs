use log::debug;
use std::error;

use crate::block::CodedBlock;
use crate::geometry::Rect;
use crate::packet::{DecodedPacket, PrecinctCoder};
use crate::CodestreamError;

/// Threshold that admits no coding pass at all.
pub(crate) const NO_PASSES: u32 = 0x1_0000;

/// Code-blocks of one subband that fall inside a precinct.
#[derive(Debug, Clone)]
pub(crate) struct BandBlocks {
    /// Block indices, in the subband's block grid.
    pub indices: Rect,
    pub blocks: Vec<CodedBlock>,
}

impl BandBlocks {
    fn dims(&self) -> (usize, usize) {
        (self.indices.size.x as usize, self.indices.size.y as usize)
    }
}

/// Packet sizing or generation cursor for interchange use.
#[derive(Debug, Clone)]
pub(crate) struct PacketCursor {
    pub generating: bool,
    pub coder: PrecinctCoder,
    pub packets: u16,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct PrecinctState {
    pub bands: Vec<BandBlocks>,
    /// Input: packet parsing state and packets parsed so far.
    pub coder: Option<PrecinctCoder>,
    pub packets_parsed: u16,
    /// Input from a cache: whether the data-bin was complete when loaded.
    pub fully_loaded: bool,
    /// Output: packets generated ahead of emission, in layer order.
    pub pending_packets: Vec<Vec<u8>>,
    pub packets_emitted: u16,
    pub cursor: Option<PacketCursor>,
    pub released: bool,
    pub closed: bool,
}

impl PrecinctState {
    pub fn new(band_indices: Vec<Rect>) -> PrecinctState {
        let bands = band_indices
            .into_iter()
            .map(|indices| BandBlocks {
                indices,
                blocks: vec![CodedBlock::default(); indices.area() as usize],
            })
            .collect();
        PrecinctState {
            bands,
            coder: None,
            packets_parsed: 0,
            fully_loaded: false,
            pending_packets: vec![],
            packets_emitted: 0,
            cursor: None,
            released: false,
            closed: false,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.bands.iter().map(|b| b.blocks.len()).sum()
    }

    fn band_dims(&self) -> Vec<(usize, usize)> {
        self.bands.iter().map(|b| b.dims()).collect()
    }

    /// Output: every block has been closed.
    pub fn is_complete(&self) -> bool {
        self.bands
            .iter()
            .all(|band| band.blocks.iter().all(|block| block.closed))
    }

    pub fn all_opened(&self) -> bool {
        self.bands
            .iter()
            .all(|band| band.blocks.iter().all(|block| block.opened))
    }

    pub fn reset_opened(&mut self) {
        for band in self.bands.iter_mut() {
            for block in band.blocks.iter_mut() {
                block.opened = false;
            }
        }
    }

    pub fn retained_bytes(&self) -> usize {
        self.bands
            .iter()
            .flat_map(|band| band.blocks.iter())
            .map(|block| block.retained_bytes())
            .sum::<usize>()
            + self.pending_packets.iter().map(|p| p.len()).sum::<usize>()
    }

    pub fn release(&mut self) {
        for band in self.bands.iter_mut() {
            for block in band.blocks.iter_mut() {
                block.release();
            }
        }
        self.pending_packets = vec![];
        self.coder = None;
        self.cursor = None;
        self.released = true;
    }

    /// Cumulative pass counts per layer for every block, given per-layer
    /// thresholds.
    fn pass_counts(&self, thresholds: &[u32]) -> Vec<Vec<Vec<usize>>> {
        self.bands
            .iter()
            .map(|band| {
                band.blocks
                    .iter()
                    .map(|block| {
                        let mut passes = 0;
                        thresholds
                            .iter()
                            .map(|threshold| {
                                passes = passes.max(block.passes_at(*threshold));
                                passes
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    fn prepared_coder(&self, counts: &[Vec<Vec<usize>>]) -> PrecinctCoder {
        let mut coder = PrecinctCoder::new(&self.band_dims());
        let first_layers: Vec<Vec<u32>> = counts
            .iter()
            .map(|band| {
                band.iter()
                    .map(|layers| {
                        layers
                            .iter()
                            .position(|passes| *passes > 0)
                            .map(|l| l as u32)
                            .unwrap_or(u32::MAX)
                    })
                    .collect()
            })
            .collect();
        let missing_msbs: Vec<Vec<u32>> = self
            .bands
            .iter()
            .map(|band| band.blocks.iter().map(|b| b.missing_msbs as u32).collect())
            .collect();
        coder.prepare_encoding(&first_layers, &missing_msbs);
        coder
    }

    fn encode_layer(
        &self,
        coder: &mut PrecinctCoder,
        counts: &[Vec<Vec<usize>>],
        layer: usize,
        use_eph: bool,
    ) -> Vec<u8> {
        let contributions: Vec<Vec<(usize, &[u8])>> = self
            .bands
            .iter()
            .zip(counts.iter())
            .map(|(band, band_counts)| {
                band.blocks
                    .iter()
                    .zip(band_counts.iter())
                    .map(|(block, layers)| {
                        let before = if layer == 0 { 0 } else { layers[layer - 1] };
                        let after = layers[layer];
                        let start = block.bytes_for(before);
                        let end = block.bytes_for(after);
                        (after - before, &block.data[start..end])
                    })
                    .collect()
            })
            .collect();
        coder.encode_packet(&contributions, None, use_eph)
    }

    /// Generates every packet of the precinct (without SOP markers).
    pub fn encode_packets(&self, thresholds: &[u32], use_eph: bool) -> Vec<Vec<u8>> {
        let counts = self.pass_counts(thresholds);
        let mut coder = self.prepared_coder(&counts);
        (0..thresholds.len())
            .map(|layer| self.encode_layer(&mut coder, &counts, layer, use_eph))
            .collect()
    }

    /// Advances the interchange cursor by one packet, returning its bytes.
    fn next_packet(&mut self, thresholds: &[u32], use_eph: bool) -> Option<Vec<u8>> {
        let counts = self.pass_counts(thresholds);
        let mut cursor = self.cursor.take()?;
        let layer = cursor.packets as usize;
        if layer >= thresholds.len() {
            self.cursor = Some(cursor);
            return None;
        }
        let packet = self.encode_layer(&mut cursor.coder, &counts, layer, use_eph);
        cursor.packets += 1;
        cursor.bytes += packet.len() as u64;
        self.cursor = Some(cursor);
        Some(packet)
    }

    fn rewind_cursor(&mut self, generating: bool, thresholds: &[u32]) {
        let stale = match &self.cursor {
            Some(cursor) => cursor.generating != generating,
            None => true,
        };
        if stale {
            debug!("packet cursor rewound to layer 0");
            let counts = self.pass_counts(thresholds);
            self.cursor = Some(PacketCursor {
                generating,
                coder: self.prepared_coder(&counts),
                packets: 0,
                bytes: 0,
            });
        }
    }

    /// Sizes packets up to `*cumulative_packets` (and, if non-zero, without
    /// exceeding `*cumulative_bytes`), continuing from earlier sizing calls.
    pub fn size_packets(
        &mut self,
        thresholds: &[u32],
        use_eph: bool,
        cumulative_packets: &mut u16,
        cumulative_bytes: &mut u64,
    ) {
        self.rewind_cursor(false, thresholds);
        let byte_limit = *cumulative_bytes;
        let packet_limit = (*cumulative_packets as usize).min(thresholds.len()) as u16;
        if let Some(cursor) = &self.cursor {
            if cursor.packets > packet_limit {
                self.cursor = None;
                self.rewind_cursor(false, thresholds);
            }
        }
        loop {
            let (packets, bytes) = match &self.cursor {
                Some(cursor) => (cursor.packets, cursor.bytes),
                None => break,
            };
            if packets >= packet_limit {
                break;
            }
            let snapshot = self.cursor.clone();
            match self.next_packet(thresholds, use_eph) {
                Some(packet) => {
                    if byte_limit > 0 && bytes + packet.len() as u64 > byte_limit {
                        self.cursor = snapshot;
                        break;
                    }
                }
                None => break,
            }
        }
        if let Some(cursor) = &self.cursor {
            *cumulative_packets = cursor.packets;
            *cumulative_bytes = cursor.bytes;
        }
    }

    /// Generates packets through `*cumulative_packets`, appending to `out`
    /// every byte beyond the first `skip_bytes` of the precinct's packet
    /// stream. Returns the number of bytes appended.
    #[allow(clippy::too_many_arguments)]
    pub fn get_packets(
        &mut self,
        thresholds: &[u32],
        use_eph: bool,
        skip_packets: u16,
        skip_bytes: u64,
        cumulative_packets: &mut u16,
        cumulative_bytes: &mut u64,
        out: &mut Vec<u8>,
    ) -> usize {
        self.rewind_cursor(true, thresholds);
        let needs_restart = match &self.cursor {
            Some(cursor) => cursor.packets > skip_packets || cursor.bytes > skip_bytes,
            None => true,
        };
        if needs_restart {
            self.cursor = None;
            self.rewind_cursor(true, thresholds);
        }
        let byte_limit = *cumulative_bytes;
        let packet_limit = (*cumulative_packets as usize).min(thresholds.len()) as u16;
        let start = out.len();
        loop {
            let (packets, bytes) = match &self.cursor {
                Some(cursor) => (cursor.packets, cursor.bytes),
                None => break,
            };
            if packets >= packet_limit {
                break;
            }
            let snapshot = self.cursor.clone();
            let packet = match self.next_packet(thresholds, use_eph) {
                Some(packet) => packet,
                None => break,
            };
            if byte_limit > 0 && bytes + packet.len() as u64 > byte_limit && packets >= skip_packets {
                self.cursor = snapshot;
                break;
            }
            let packet_end = bytes + packet.len() as u64;
            if packet_end > skip_bytes {
                let from = skip_bytes.saturating_sub(bytes) as usize;
                out.extend_from_slice(&packet[from..]);
            }
        }
        if let Some(cursor) = &self.cursor {
            *cumulative_packets = cursor.packets;
            *cumulative_bytes = cursor.bytes;
        }
        out.len() - start
    }

    /// Input: stores the blocks' contributions of one parsed packet.
    pub fn store_packet(&mut self, packet: &DecodedPacket, body: &[u8], layer: u16, tile: u32) -> Result<(), Box<dyn error::Error>> {
        let mut offset = 0;
        for contribution in &packet.contributions {
            let band = self.bands.get_mut(contribution.band).ok_or_else(|| {
                Box::new(CodestreamError::PacketMalformed {
                    tile,
                    reason: "contribution to a missing subband".to_string(),
                }) as Box<dyn error::Error>
            })?;
            let block = &mut band.blocks[contribution.block];
            if let Some(missing_msbs) = contribution.missing_msbs {
                block.missing_msbs = missing_msbs;
            }
            let end = offset + contribution.length;
            block.append_layer(contribution.passes, &body[offset..end], layer);
            offset = end;
        }
        Ok(())
    }

    /// Input: parses as many complete packets as `data` holds, starting with
    /// the precinct's next packet. Returns the bytes consumed.
    pub fn parse_packets(
        &mut self,
        data: &[u8],
        layers: u16,
        use_sop: bool,
        use_eph: bool,
        tile: u32,
    ) -> Result<usize, Box<dyn error::Error>> {
        let mut coder = match self.coder.take() {
            Some(coder) => coder,
            None => PrecinctCoder::new(&self.band_dims()),
        };
        let mut offset = 0;
        let mut outcome = Ok(());
        while self.packets_parsed < layers {
            let snapshot = coder.clone();
            let packet = match coder.decode_packet(&data[offset..], use_sop, use_eph, tile) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            };
            let body_start = offset + packet.header_length;
            let body_end = body_start + packet.body_length();
            if body_end > data.len() {
                coder = snapshot;
                break;
            }
            if let Err(error) = self.store_packet(&packet, &data[body_start..body_end], self.packets_parsed, tile) {
                outcome = Err(error);
                break;
            }
            self.packets_parsed += 1;
            offset = body_end;
        }
        self.coder = Some(coder);
        outcome.map(|_| offset)
    }
}

impl PrecinctState {
    /// Input with packed packet headers: parses the next packet's header
    /// from `headers` and its body from `bodies`. Returns the bytes consumed
    /// from each, or `None` if either runs out.
    pub fn parse_split_packet(
        &mut self,
        headers: &[u8],
        bodies: &[u8],
        use_eph: bool,
        tile: u32,
    ) -> Result<Option<(usize, usize)>, Box<dyn error::Error>> {
        let mut coder = match self.coder.take() {
            Some(coder) => coder,
            None => PrecinctCoder::new(&self.band_dims()),
        };
        let snapshot = coder.clone();
        let packet = match coder.decode_packet(headers, false, use_eph, tile) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.coder = Some(coder);
                return Ok(None);
            }
            Err(error) => {
                self.coder = Some(coder);
                return Err(error);
            }
        };
        let body_start = if bodies.starts_with(&crate::markers::MARKER_SYMBOL_SOP) {
            6
        } else {
            0
        };
        let body_end = body_start + packet.body_length();
        if body_end > bodies.len() {
            self.coder = Some(snapshot);
            return Ok(None);
        }
        let stored = self.store_packet(&packet, &bodies[body_start..body_end], self.packets_parsed, tile);
        self.coder = Some(coder);
        stored?;
        self.packets_parsed += 1;
        Ok(Some((packet.header_length, body_end)))
    }
}

/// Thresholds that reproduce the layer assignment recorded in pass slopes.
pub(crate) fn layer_thresholds(layers: u16) -> Vec<u32> {
    (0..layers).map(|l| 0xFFFF - l as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{layer_slope, Block};

    fn precinct_with_data() -> PrecinctState {
        let mut precinct = PrecinctState::new(vec![Rect::new(0, 0, 2, 1)]);
        for (i, block) in precinct.bands[0].blocks.iter_mut().enumerate() {
            let mut coded = Block::default();
            for layer in 0..4u16 {
                coded.push_pass(&vec![i as u8 + layer as u8; 10 + layer as usize], layer_slope(layer));
            }
            *block = CodedBlock::from_block(coded);
        }
        precinct
    }

    #[test]
    fn test_size_then_get_matches_slicing() {
        let thresholds = layer_thresholds(5);
        let reference = precinct_with_data();
        let all: Vec<u8> = reference
            .encode_packets(&thresholds, false)
            .into_iter()
            .flatten()
            .collect();

        let mut precinct = precinct_with_data();
        let mut packets = 2;
        let mut bytes = 0;
        precinct.size_packets(&thresholds, false, &mut packets, &mut bytes);
        assert_eq!(packets, 2);

        let mut out = vec![];
        let mut cumulative_packets = 5;
        let mut cumulative_bytes = 0;
        precinct.get_packets(&thresholds, false, 2, bytes, &mut cumulative_packets, &mut cumulative_bytes, &mut out);
        assert_eq!(cumulative_packets, 5);
        assert_eq!(cumulative_bytes, all.len() as u64);
        assert_eq!(out, all[bytes as usize..].to_vec());
    }

    #[test]
    fn test_parse_packets_stops_at_incomplete_data() {
        let thresholds = layer_thresholds(4);
        let source = precinct_with_data();
        let stream: Vec<u8> = source
            .encode_packets(&thresholds, true)
            .into_iter()
            .flatten()
            .collect();

        let mut precinct = PrecinctState::new(vec![Rect::new(0, 0, 2, 1)]);
        let consumed = precinct.parse_packets(&stream[..stream.len() - 1], 4, false, true, 0).unwrap();
        assert_eq!(precinct.packets_parsed, 3);
        let rest = precinct.parse_packets(&stream[consumed..], 4, false, true, 0).unwrap();
        assert_eq!(consumed + rest, stream.len());
        assert_eq!(precinct.packets_parsed, 4);
        assert_eq!(precinct.bands[0].blocks[1].data, source.bands[0].blocks[1].data);
    }
}
