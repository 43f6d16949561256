use log::{debug, info};
use std::error;

use crate::block::CodedBlock;
use crate::codestream::{Codestream, FlushOptions, Mode};
use crate::markers::{
    StartOfTileSegment, MARKER_SYMBOL_EOC, MARKER_SYMBOL_SOD, MARKER_SYMBOL_SOP,
    SOT_SEGMENT_LENGTH,
};
use crate::precinct::NO_PASSES;
use crate::rate;
use crate::tile::{TileState, TileStatus};
use crate::CodestreamError;

const MAX_TILE_PARTS: u16 = 255;

#[derive(Debug, Default)]
pub(crate) struct OutputState {
    pub header_written: bool,
    /// Slope thresholds per layer, fixed by the first flush.
    pub thresholds: Option<Vec<u32>>,
    /// The last comment was generated to record the thresholds.
    pub recorded_comment: bool,
    pub bytes_written: u64,
    pub finished: bool,
}

fn sop_segment(sequence: u16) -> Vec<u8> {
    let mut out = MARKER_SYMBOL_SOP.to_vec();
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out
}

fn block_count(tile: &TileState) -> usize {
    tile.comps
        .iter()
        .flat_map(|c| c.resolutions.iter())
        .flat_map(|r| r.bands.iter())
        .map(|b| b.block_indices().area() as usize)
        .sum()
}

fn precinct_count(tile: &TileState) -> usize {
    tile.comps
        .iter()
        .flat_map(|c| c.resolutions.iter())
        .map(|r| r.num_precincts())
        .sum()
}

impl<'a> Codestream<'a> {
    /// Adds a comment to the main header; only possible before the first
    /// flush.
    pub fn add_comment(&mut self, text: &str) -> Result<(), Box<dyn error::Error>> {
        if self.mode != Mode::Output {
            return Err(self.wrong_mode("add_comment"));
        }
        if self.output.header_written {
            return Err(CodestreamError::InvalidParams {
                reason: "comments must be added before the main header is written".to_string(),
            }
            .into());
        }
        self.comments.push(text.to_string());
        Ok(())
    }

    /// Writes every packet that can be written so far.
    ///
    /// The first flush fixes the layer thresholds and writes the main header.
    /// Each tile then gets a tile-part holding the packets whose precincts are
    /// complete, up to the first precinct still waiting for blocks. Once all
    /// tiles are closed and written the codestream is terminated with EOC.
    pub fn flush(&mut self, options: FlushOptions) -> Result<(), Box<dyn error::Error>> {
        if self.mode != Mode::Output {
            return Err(self.wrong_mode("flush"));
        }
        if !self.params.is_finalized() {
            return Err(CodestreamError::ParamsNotFinalized.into());
        }
        if self.output.thresholds.is_none() {
            let thresholds = self.choose_thresholds(&options);
            if options.record_in_comment {
                let comment = threshold_comment(&thresholds, &options.layer_bytes);
                self.comments.push(comment);
                self.output.recorded_comment = true;
            }
            self.output.thresholds = Some(thresholds);
        }
        if !self.output.header_written {
            let header = self.params.main_header(&self.comments);
            self.write(&header)?;
            self.output.header_written = true;
        }

        let numbers: Vec<u32> = self.tiles.keys().copied().collect();
        for number in numbers {
            self.emit_tile_part(number)?;
        }

        if !self.output.finished && self.all_tiles_written() {
            self.write(&MARKER_SYMBOL_EOC)?;
            self.output.finished = true;
            info!("codestream complete, {} bytes", self.output.bytes_written);
        }
        Ok(())
    }

    /// Transcoding flush: keeps the layers recorded in the supplied blocks'
    /// pass slopes, dropping trailing layers until the estimated size fits
    /// `max_bytes` (0 for no limit).
    pub fn trans_out(&mut self, max_bytes: u64) -> Result<(), Box<dyn error::Error>> {
        if self.mode != Mode::Output {
            return Err(self.wrong_mode("trans_out"));
        }
        if self.output.thresholds.is_none() {
            let layers = self.params.max_layers();
            let blocks = self.closed_blocks();
            let overhead = self.layer_overhead();
            let fixed = self.params.main_header(&self.comments).len() as u64
                + 2
                + (SOT_SEGMENT_LENGTH as u64 + 2) * self.params.siz.num_tiles() as u64;
            let mut kept = layers;
            if max_bytes > 0 {
                while kept > 0 && fixed + rate::bytes_for_layers(&blocks, kept, overhead) > max_bytes {
                    kept -= 1;
                }
            }
            info!("transcoding keeps {} of {} layers", kept, layers);
            let thresholds = (0..layers)
                .map(|l| if l < kept { 0xFFFF - l as u32 } else { NO_PASSES })
                .collect();
            self.output.thresholds = Some(thresholds);
        }
        self.flush(FlushOptions::default())
    }

    /// Closes the compressed target. Returns false if it reported an error.
    pub fn finish(&mut self) -> bool {
        match self.target.as_mut() {
            Some(target) => target.close(),
            None => true,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Box<dyn error::Error>> {
        let target = match self.target.as_mut() {
            Some(target) => target,
            None => return Err(CodestreamError::WriteFailed.into()),
        };
        if !target.write(bytes) {
            return Err(CodestreamError::WriteFailed.into());
        }
        self.output.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn closed_blocks(&self) -> Vec<&CodedBlock> {
        self.tiles
            .values()
            .flat_map(|t| t.comps.iter())
            .flat_map(|c| c.resolutions.iter())
            .flat_map(|r| r.precincts.iter().flatten())
            .flat_map(|p| p.bands.iter())
            .flat_map(|b| b.blocks.iter())
            .filter(|b| b.closed)
            .collect()
    }

    /// Applies `count` to every tile of the image, built or not.
    fn count_over_tiles(&self, count: fn(&TileState) -> usize) -> usize {
        (0..self.params.siz.num_tiles())
            .map(|t| match self.tiles.get(&t).or_else(|| self.templates.get(&t)) {
                Some(tile) => count(tile),
                None => count(&TileState::new(&self.params, t, 0)),
            })
            .sum()
    }

    /// Estimated packet header bytes per quality layer.
    fn layer_overhead(&self) -> u64 {
        let markers = if self.params.coding.use_sop { 6 } else { 0 }
            + if self.params.coding.use_eph { 2 } else { 0 };
        self.count_over_tiles(precinct_count) as u64 * (1 + markers)
    }

    fn choose_thresholds(&self, options: &FlushOptions) -> Vec<u32> {
        let layers = self.params.max_layers() as usize;
        if !options.layer_thresholds.is_empty() {
            return (0..layers)
                .map(|l| options.layer_thresholds.get(l).copied().unwrap_or(0) as u32)
                .collect();
        }
        let blocks = self.closed_blocks();
        let total = self.count_over_tiles(block_count).max(1);
        let fraction = (blocks.len() as f64 / total as f64).min(1.0);
        debug!("{} of {} blocks available for rate allocation", blocks.len(), total);
        rate::allocate(&blocks, &options.layer_bytes, layers, self.layer_overhead(), fraction)
    }

    fn all_tiles_written(&self) -> bool {
        (0..self.params.siz.num_tiles()).all(|t| match self.tiles.get(&t) {
            Some(tile) => {
                tile.status == TileStatus::Closed
                    && tile.steps_emitted == tile.sequence.len()
                    && tile.tile_parts > 0
            }
            None => false,
        })
    }

    /// Writes one tile-part with the tile's next run of ready packets.
    fn emit_tile_part(&mut self, number: u32) -> Result<(), Box<dyn error::Error>> {
        let thresholds = self.output.thresholds.clone().unwrap_or_default();
        let tile = match self.tiles.get_mut(&number) {
            Some(tile) => tile,
            None => return Ok(()),
        };
        let layers = tile.layers() as usize;
        let tile_thresholds: Vec<u32> = (0..layers)
            .map(|l| thresholds.get(l).copied().unwrap_or(0))
            .collect();
        let use_sop = tile.coding.use_sop;
        let use_eph = tile.coding.use_eph;

        let mut end = tile.steps_emitted;
        while end < tile.sequence.len() {
            let step = tile.sequence[end];
            let resolution = &mut tile.comps[step.component].resolutions[step.resolution];
            if !resolution.precinct_mut(step.precinct).is_complete() {
                break;
            }
            end += 1;
        }
        if end == tile.steps_emitted && !(tile.sequence.is_empty() && tile.tile_parts == 0) {
            return Ok(());
        }
        if tile.tile_parts >= MAX_TILE_PARTS {
            return Err(CodestreamError::TilePartLimit { tile: number }.into());
        }

        let mut body = vec![];
        for i in tile.steps_emitted..end {
            let step = tile.sequence[i];
            let precinct = tile.comps[step.component].resolutions[step.resolution]
                .precinct_mut(step.precinct);
            if precinct.pending_packets.is_empty() && precinct.packets_emitted == 0 {
                precinct.pending_packets = precinct.encode_packets(&tile_thresholds, use_eph);
            }
            let packet = std::mem::take(&mut precinct.pending_packets[step.layer as usize]);
            precinct.packets_emitted += 1;
            if precinct.packets_emitted as usize == layers {
                precinct.release();
            }
            if use_sop {
                body.extend(sop_segment(tile.packets_emitted as u16));
            }
            tile.packets_emitted += 1;
            body.extend(packet);
        }

        let header = if tile.tile_parts == 0 {
            self.params.tile_header(number)
        } else {
            vec![]
        };
        let length = SOT_SEGMENT_LENGTH + header.len() + 2 + body.len();
        let length = u32::try_from(length).map_err(|_| CodestreamError::Unsupported {
            feature: format!("tile-part of {} bytes", length),
        })?;
        let parts = if end == tile.sequence.len() && tile.tile_parts == 0 { 1 } else { 0 };
        let sot = StartOfTileSegment::new(number as u16, length, tile.tile_parts as u8, parts);
        let packets = end - tile.steps_emitted;
        let part = tile.tile_parts;
        tile.tile_parts += 1;
        tile.steps_emitted = end;

        let mut out = sot.encode();
        out.extend(header);
        out.extend_from_slice(&MARKER_SYMBOL_SOD);
        out.extend(body);
        info!(
            "tile-part {} of tile {}: {} packets, {} bytes",
            part, number, packets, length
        );
        self.write(&out)
    }
}

fn threshold_comment(thresholds: &[u32], layer_bytes: &[u64]) -> String {
    let thresholds: Vec<String> = thresholds.iter().map(|t| t.to_string()).collect();
    let mut comment = format!(
        "jpc {}: layer thresholds {}",
        crate::VERSION,
        thresholds.join(",")
    );
    if !layer_bytes.is_empty() {
        let targets: Vec<String> = layer_bytes.iter().map(|b| b.to_string()).collect();
        comment.push_str(&format!("; layer bytes {}", targets.join(",")));
    }
    comment
}
