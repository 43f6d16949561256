use log::info;

use crate::block::Orientation;
use crate::geometry::{ceil_shift, Coords, Rect};
use crate::kernels::Kernel;
use crate::markers::ProgressionOrder;
use crate::params::{CodingParams, Params, Split};
use crate::precinct::PrecinctState;

#[derive(Debug, Clone)]
pub(crate) struct BandState {
    pub orientation: Orientation,
    pub rect: Rect,
    pub precinct_exp: (u32, u32),
    pub block_exp: (u32, u32),
}

impl BandState {
    /// Block indices of the whole subband.
    pub fn block_indices(&self) -> Rect {
        self.rect.cell_indices(self.block_exp.0, self.block_exp.1)
    }

    /// Block indices of the blocks inside precinct cell `index`.
    pub fn precinct_block_indices(&self, index: Coords) -> Rect {
        let cell = self.rect.cell(index, self.precinct_exp.0, self.precinct_exp.1);
        cell.cell_indices(self.block_exp.0, self.block_exp.1)
    }

    /// Precinct cell containing block `index`.
    pub fn precinct_of_block(&self, index: Coords) -> Coords {
        Coords::new(
            (index.x << self.block_exp.0) >> self.precinct_exp.0,
            (index.y << self.block_exp.1) >> self.precinct_exp.1,
        )
    }

    pub fn block_rect(&self, index: Coords) -> Rect {
        self.rect.cell(index, self.block_exp.0, self.block_exp.1)
    }
}

/// Maps a resolution-domain rectangle onto one of its subbands.
pub(crate) fn band_rect(rect: &Rect, split: Split, orientation: Orientation) -> Rect {
    let lim = rect.lim();
    let axis = |low: i64, high: i64, splits: bool, high_pass: bool| -> (i64, i64) {
        if !splits {
            (low, high)
        } else if high_pass {
            (ceil_shift(low - 1, 1), ceil_shift(high - 1, 1))
        } else {
            (ceil_shift(low, 1), ceil_shift(high, 1))
        }
    };
    let (x0, x1) = axis(rect.pos.x, lim.x, split.splits_x(), orientation.high_x());
    let (y0, y1) = axis(rect.pos.y, lim.y, split.splits_y(), orientation.high_y());
    Rect::from_bounds(x0, y0, x1, y1)
}

/// Maps a resolution-domain rectangle onto the next lower resolution.
pub(crate) fn reduce_rect(rect: &Rect, split: Split) -> Rect {
    rect.shrink(split.splits_x() as u32, split.splits_y() as u32)
}

#[derive(Debug, Clone)]
pub(crate) struct ResolutionState {
    pub rect: Rect,
    /// Decomposition level whose subbands this resolution adds; 0 for the
    /// lowest resolution.
    pub level: usize,
    pub split: Split,
    pub precinct_exp: (u32, u32),
    /// Precinct grid indices covering `rect`.
    pub precinct_indices: Rect,
    pub bands: Vec<BandState>,
    pub precincts: Vec<Option<PrecinctState>>,
    /// Sequence number, within the tile-component, of the first precinct.
    pub first_sequence: u64,
}

impl ResolutionState {
    pub fn num_precincts(&self) -> usize {
        self.precinct_indices.area() as usize
    }

    pub fn precinct_number(&self, index: Coords) -> usize {
        let relative = Coords::new(
            index.x - self.precinct_indices.pos.x,
            index.y - self.precinct_indices.pos.y,
        );
        (relative.y * self.precinct_indices.size.x + relative.x) as usize
    }

    pub fn precinct_index(&self, number: usize) -> Coords {
        let across = self.precinct_indices.size.x.max(1);
        Coords::new(
            self.precinct_indices.pos.x + number as i64 % across,
            self.precinct_indices.pos.y + number as i64 / across,
        )
    }

    /// Blank precinct state with the block ranges of every subband.
    pub fn new_precinct(&self, number: usize) -> PrecinctState {
        let index = self.precinct_index(number);
        PrecinctState::new(
            self.bands
                .iter()
                .map(|band| band.precinct_block_indices(index))
                .collect(),
        )
    }

    pub fn precinct_mut(&mut self, number: usize) -> &mut PrecinctState {
        let index = self.precinct_index(number);
        let bands = &self.bands;
        self.precincts[number].get_or_insert_with(|| {
            PrecinctState::new(
                bands
                    .iter()
                    .map(|band| band.precinct_block_indices(index))
                    .collect(),
            )
        })
    }

    /// Top-left corner of precinct `number`, clipped to the resolution.
    fn precinct_origin(&self, number: usize) -> Coords {
        let index = self.precinct_index(number);
        let cell = self
            .rect
            .cell(index, self.precinct_exp.0, self.precinct_exp.1);
        cell.pos
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TileCompState {
    pub rect: Rect,
    pub coding: CodingParams,
    pub kernel: Kernel,
    pub sub: (i64, i64),
    pub resolutions: Vec<ResolutionState>,
}

impl TileCompState {
    fn new(params: &Params, tile: u32, component: usize, canvas: &Rect) -> TileCompState {
        let coding = params.coding(Some(tile), component);
        let rect = params.siz.component_rect(component, *canvas);
        let levels = coding.levels as usize;

        let mut rects = vec![rect; levels + 1];
        for r in (0..levels).rev() {
            rects[r] = reduce_rect(&rects[r + 1], coding.split(levels - r));
        }

        let mut first_sequence = 0;
        let mut resolutions = Vec::with_capacity(levels + 1);
        for (r, rect) in rects.iter().enumerate() {
            let (ppx, ppy) = coding.precinct_exponents(r);
            let (ppx, ppy) = (ppx as u32, ppy as u32);
            let level = if r == 0 { 0 } else { levels + 1 - r };
            let split = coding.split(level);
            let orientations: Vec<Orientation> = if r == 0 {
                vec![Orientation::LL]
            } else {
                match split {
                    Split::Both => vec![Orientation::HL, Orientation::LH, Orientation::HH],
                    Split::Horizontal => vec![Orientation::HL],
                    Split::Vertical => vec![Orientation::LH],
                }
            };
            let bands = orientations
                .into_iter()
                .map(|orientation| {
                    let band_rect = if r == 0 {
                        *rect
                    } else {
                        band_rect(rect, split, orientation)
                    };
                    let precinct_exp = if r == 0 {
                        (ppx, ppy)
                    } else {
                        (
                            ppx - split.splits_x() as u32,
                            ppy - split.splits_y() as u32,
                        )
                    };
                    let block_exp = (
                        (coding.block_size.0 as u32).min(precinct_exp.0),
                        (coding.block_size.1 as u32).min(precinct_exp.1),
                    );
                    BandState {
                        orientation,
                        rect: band_rect,
                        precinct_exp,
                        block_exp,
                    }
                })
                .collect();
            let precinct_indices = rect.cell_indices(ppx, ppy);
            let count = precinct_indices.area() as usize;
            resolutions.push(ResolutionState {
                rect: *rect,
                level,
                split,
                precinct_exp: (ppx, ppy),
                precinct_indices,
                bands,
                precincts: vec![None; count],
                first_sequence,
            });
            first_sequence += count as u64;
        }

        let size = &params.siz.components[component];
        TileCompState {
            rect,
            kernel: Kernel::new(coding.kernel),
            coding,
            sub: (size.sub_x as i64, size.sub_y as i64),
            resolutions,
        }
    }

    pub fn levels(&self) -> usize {
        self.resolutions.len() - 1
    }

    /// Number of decomposition levels between resolution `r` and the full
    /// component that halve each axis.
    fn halvings(&self, r: usize) -> (u32, u32) {
        let levels = self.levels();
        (1..=levels - r).fold((0, 0), |(x, y), d| {
            let split = self.coding.split(d);
            (x + split.splits_x() as u32, y + split.splits_y() as u32)
        })
    }

    /// Reference grid position of precinct `number` at resolution `r`.
    pub fn precinct_canvas_origin(&self, r: usize, number: usize) -> Coords {
        let origin = self.resolutions[r].precinct_origin(number);
        let (hx, hy) = self.halvings(r);
        Coords::new((origin.x << hx) * self.sub.0, (origin.y << hy) * self.sub.1)
    }

    /// Region of interest mapped from component coordinates down to
    /// resolution `r`, widened at every level by the kernel support.
    pub fn resolution_region(&self, region: &Rect, r: usize) -> Rect {
        let support = self.kernel.low_support();
        let levels = self.levels();
        let mut current = *region;
        for d in 1..=levels - r {
            let split = self.coding.split(d);
            let grown = current.grow(
                if split.splits_x() { support } else { 0 },
                if split.splits_y() { support } else { 0 },
            );
            current = reduce_rect(&grown, split);
        }
        current.intersection(&self.resolutions[r].rect)
    }

    /// Region of interest within subband `b` of resolution `r`.
    pub fn band_region(&self, region: &Rect, r: usize, b: usize) -> Rect {
        let resolution = &self.resolutions[r];
        let band = &resolution.bands[b];
        if r == 0 {
            return self.resolution_region(region, 0);
        }
        let above = self.resolution_region(region, r);
        let support = self.kernel.low_support();
        let grown = above.grow(
            if resolution.split.splits_x() { support } else { 0 },
            if resolution.split.splits_y() { support } else { 0 },
        );
        band_rect(&grown, resolution.split, band.orientation).intersection(&band.rect)
    }
}

/// One step of a tile's packet progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketStep {
    pub layer: u16,
    pub resolution: usize,
    pub component: usize,
    pub precinct: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TileStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct TileState {
    pub number: u32,
    pub generation: u32,
    pub rect: Rect,
    pub coding: CodingParams,
    pub comps: Vec<TileCompState>,
    pub status: TileStatus,
    /// Output: packet sequence, steps already written and tile-parts used.
    pub sequence: Vec<PacketStep>,
    pub steps_emitted: usize,
    pub tile_parts: u16,
    pub packets_emitted: u32,
    /// Input: the tile header marker segments, for interchange-style access.
    pub header: Vec<u8>,
}

impl TileState {
    pub fn new(params: &Params, number: u32, generation: u32) -> TileState {
        let index = params.siz.tile_index(number);
        let rect = params.siz.tile_rect(index);
        let comps = (0..params.siz.num_components())
            .map(|c| TileCompState::new(params, number, c, &rect))
            .collect();
        let coding = params.coding(Some(number), 0);
        info!("tile {} built at {:?}", number, rect);
        let mut tile = TileState {
            number,
            generation,
            rect,
            coding,
            comps,
            status: TileStatus::Open,
            sequence: vec![],
            steps_emitted: 0,
            tile_parts: 0,
            packets_emitted: 0,
            header: vec![],
        };
        tile.sequence = tile.progression_sequence();
        tile
    }

    pub fn layers(&self) -> u16 {
        self.coding.layers
    }

    pub fn max_resolutions(&self) -> usize {
        self.comps
            .iter()
            .map(|c| c.resolutions.len())
            .max()
            .unwrap_or(0)
    }

    pub fn retained_bytes(&self) -> usize {
        self.comps
            .iter()
            .flat_map(|c| c.resolutions.iter())
            .flat_map(|r| r.precincts.iter().flatten())
            .map(|p| p.retained_bytes())
            .sum()
    }

    /// Precincts (component, resolution, number) in position order:
    /// canvas row, then column, then the `tie` order.
    fn positioned(&self, filter: impl Fn(usize, usize) -> bool) -> Vec<(Coords, usize, usize, usize)> {
        let mut all = vec![];
        for (c, comp) in self.comps.iter().enumerate() {
            for (r, resolution) in comp.resolutions.iter().enumerate() {
                if !filter(c, r) {
                    continue;
                }
                for p in 0..resolution.num_precincts() {
                    all.push((comp.precinct_canvas_origin(r, p), c, r, p));
                }
            }
        }
        all
    }

    /// Packet order of the whole tile under its progression order.
    pub fn progression_sequence(&self) -> Vec<PacketStep> {
        let layers = self.layers();
        let num_comps = self.comps.len();
        let max_res = self.max_resolutions();
        let mut steps = vec![];
        let step = |layer, resolution, component, precinct| PacketStep {
            layer,
            resolution,
            component,
            precinct,
        };
        match self.coding.progression {
            ProgressionOrder::LRLCPP | ProgressionOrder::Reserved { .. } => {
                for l in 0..layers {
                    for r in 0..max_res {
                        for c in 0..num_comps {
                            if let Some(resolution) = self.comps[c].resolutions.get(r) {
                                for p in 0..resolution.num_precincts() {
                                    steps.push(step(l, r, c, p));
                                }
                            }
                        }
                    }
                }
            }
            ProgressionOrder::RLLCPP => {
                for r in 0..max_res {
                    for l in 0..layers {
                        for c in 0..num_comps {
                            if let Some(resolution) = self.comps[c].resolutions.get(r) {
                                for p in 0..resolution.num_precincts() {
                                    steps.push(step(l, r, c, p));
                                }
                            }
                        }
                    }
                }
            }
            ProgressionOrder::RLPCLP => {
                for r in 0..max_res {
                    let mut precincts = self.positioned(|_, res| res == r);
                    precincts.sort_by_key(|(pos, c, _, p)| (pos.y, pos.x, *c, *p));
                    for (_, c, r, p) in precincts {
                        for l in 0..layers {
                            steps.push(step(l, r, c, p));
                        }
                    }
                }
            }
            ProgressionOrder::PCRLLP => {
                let mut precincts = self.positioned(|_, _| true);
                precincts.sort_by_key(|(pos, c, r, p)| (pos.y, pos.x, *c, *r, *p));
                for (_, c, r, p) in precincts {
                    for l in 0..layers {
                        steps.push(step(l, r, c, p));
                    }
                }
            }
            ProgressionOrder::CPRLLP => {
                for component in 0..num_comps {
                    let mut precincts = self.positioned(|c, _| c == component);
                    precincts.sort_by_key(|(pos, _, r, p)| (pos.y, pos.x, *r, *p));
                    for (_, c, r, p) in precincts {
                        for l in 0..layers {
                            steps.push(step(l, r, c, p));
                        }
                    }
                }
            }
        }
        steps
    }

    pub fn reset_opened(&mut self) {
        for comp in self.comps.iter_mut() {
            for resolution in comp.resolutions.iter_mut() {
                for precinct in resolution.precincts.iter_mut().flatten() {
                    precinct.reset_opened();
                    precinct.closed = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ComponentSize, SizParams};

    fn params(width: u32, height: u32, levels: u8) -> Params {
        let mut params = Params::new(SizParams::new(width, height, vec![ComponentSize::new(8, false)]));
        params.coding.levels = levels;
        params.coding.block_size = (4, 4);
        params.coding.precincts = vec![(5, 5)];
        params.finalize().unwrap();
        params
    }

    #[test]
    fn test_subband_geometry() {
        let tile = TileState::new(&params(37, 20, 2), 0, 0);
        let comp = &tile.comps[0];
        assert_eq!(comp.resolutions[2].rect, Rect::new(0, 0, 37, 20));
        assert_eq!(comp.resolutions[1].rect, Rect::new(0, 0, 19, 10));
        assert_eq!(comp.resolutions[0].rect, Rect::new(0, 0, 10, 5));
        let bands = &comp.resolutions[2].bands;
        assert_eq!(bands[0].orientation, Orientation::HL);
        assert_eq!(bands[0].rect, Rect::new(0, 0, 18, 10));
        assert_eq!(bands[2].rect, Rect::new(0, 0, 18, 10));
        assert_eq!(bands[0].precinct_exp, (4, 4));
        assert_eq!(bands[0].block_exp, (4, 4));
        assert_eq!(comp.resolutions[2].precinct_indices, Rect::new(0, 0, 2, 1));
        assert_eq!(comp.resolutions[1].first_sequence, 1);
        assert_eq!(comp.resolutions[2].first_sequence, 2);
    }

    #[test]
    fn test_directional_split_bands() {
        let mut params = params(32, 16, 2);
        params.coding.splits = vec![Split::Horizontal, Split::Both];
        params.finalize().unwrap();
        let tile = TileState::new(&params, 0, 0);
        let comp = &tile.comps[0];
        assert_eq!(comp.resolutions[1].rect, Rect::new(0, 0, 16, 16));
        assert_eq!(comp.resolutions[2].bands.len(), 1);
        assert_eq!(comp.resolutions[2].bands[0].rect, Rect::new(0, 0, 16, 16));
        assert_eq!(comp.resolutions[2].bands[0].precinct_exp, (4, 5));
        assert_eq!(comp.resolutions[1].bands.len(), 3);
    }

    #[test]
    fn test_sequence_covers_every_packet_once() {
        let mut params = params(70, 40, 2);
        for progression in [
            ProgressionOrder::LRLCPP,
            ProgressionOrder::RLLCPP,
            ProgressionOrder::RLPCLP,
            ProgressionOrder::PCRLLP,
            ProgressionOrder::CPRLLP,
        ] {
            params.coding.progression = progression;
            params.coding.layers = 3;
            let tile = TileState::new(&params, 0, 0);
            let mut steps = tile.sequence.clone();
            let total: usize = tile.comps[0]
                .resolutions
                .iter()
                .map(|r| r.num_precincts())
                .sum();
            assert_eq!(steps.len(), total * 3);
            steps.sort_by_key(|s| (s.layer, s.resolution, s.component, s.precinct));
            steps.dedup();
            assert_eq!(steps.len(), total * 3);
        }
    }
}
