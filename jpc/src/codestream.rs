use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::error;

use crate::block::{Block, BlockLocation, CodedBlock, Orientation};
use crate::geometry::{Appearance, Coords, Rect};
use crate::input::InputState;
use crate::output::OutputState;
use crate::params::{Params, SizParams};
use crate::precinct::layer_thresholds;
use crate::source::{Capabilities, CompressedSource, CompressedTarget};
use crate::tile::{TileState, TileStatus};
use crate::CodestreamError;

/// Closed tiles kept loaded in persistent mode before the oldest is unloaded.
const DEFAULT_UNLOADING_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Input,
    Output,
    Interchange,
}

/// Meaning of component indices passed to the tree accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentAccess {
    /// Components as they appear in the codestream.
    #[default]
    Codestream,
    /// Components produced after the inverse colour transform. Accessing any
    /// of the first three keeps all three available when a transform is used.
    Output,
}

/// View applied to an input codestream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewRestrictions {
    pub first_component: usize,
    /// `None` keeps every component from `first_component` on.
    pub max_components: Option<usize>,
    pub access: ComponentAccess,
    pub discard_levels: u8,
    pub max_layers: Option<u16>,
    /// Region of interest on the reference grid.
    pub region: Option<Rect>,
}

/// How `flush` chooses the content of each quality layer.
#[derive(Debug, Clone, Default)]
pub struct FlushOptions {
    /// Cumulative byte targets per layer; 0 leaves a layer unconstrained.
    pub layer_bytes: Vec<u64>,
    /// Explicit slope thresholds per layer, used instead of `layer_bytes`.
    pub layer_thresholds: Vec<u16>,
    /// Record the layer thresholds in a comment marker segment.
    pub record_in_comment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub(crate) number: u32,
    pub(crate) generation: u32,
}

impl Tile {
    pub fn number(&self) -> u32 {
        self.number
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileComp {
    pub(crate) tile: Tile,
    pub(crate) component: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub(crate) comp: TileComp,
    pub(crate) resolution: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subband {
    pub(crate) resolution: Resolution,
    pub(crate) band: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Precinct {
    pub(crate) resolution: Resolution,
    pub(crate) number: usize,
}

/// A JPEG 2000 codestream and its tree of tiles, tile-components,
/// resolutions, subbands, precincts and code-blocks.
///
/// Handles returned by the accessors are plain values naming a node; they
/// stay valid until the tile they belong to is closed.
pub struct Codestream<'a> {
    pub(crate) mode: Mode,
    pub(crate) params: Params,
    pub(crate) source: Option<Box<dyn CompressedSource + 'a>>,
    pub(crate) target: Option<Box<dyn CompressedTarget + 'a>>,
    pub(crate) view: ViewRestrictions,
    pub(crate) appearance: Appearance,
    pub(crate) persistent: bool,
    pub(crate) resilient: bool,
    pub(crate) tiles: BTreeMap<u32, TileState>,
    /// Structure of tiles already built once, reused while the parameters
    /// stay the same.
    pub(crate) templates: BTreeMap<u32, TileState>,
    pub(crate) generations: BTreeMap<u32, u32>,
    pub(crate) retired: BTreeSet<u32>,
    pub(crate) closed_order: VecDeque<u32>,
    pub(crate) unloading_threshold: usize,
    pub(crate) cache_threshold: usize,
    pub(crate) ever_opened: bool,
    pub(crate) comments: Vec<String>,
    pub(crate) input: Option<InputState>,
    pub(crate) output: OutputState,
}

impl<'a> Codestream<'a> {
    fn new(mode: Mode, params: Params) -> Codestream<'a> {
        Codestream {
            mode,
            params,
            source: None,
            target: None,
            view: ViewRestrictions::default(),
            appearance: Appearance::default(),
            persistent: false,
            resilient: false,
            tiles: BTreeMap::new(),
            templates: BTreeMap::new(),
            generations: BTreeMap::new(),
            retired: BTreeSet::new(),
            closed_order: VecDeque::new(),
            unloading_threshold: DEFAULT_UNLOADING_THRESHOLD,
            cache_threshold: 0,
            ever_opened: false,
            comments: vec![],
            input: None,
            output: OutputState::default(),
        }
    }

    /// Output codestream; coding parameters must be finalized through
    /// `params_mut` and `finalize_params` before any tile is opened.
    pub fn create_output<T: CompressedTarget + 'a>(siz: SizParams, target: T) -> Codestream<'a> {
        let mut codestream = Codestream::new(Mode::Output, Params::new(siz));
        codestream.target = Some(Box::new(target));
        codestream
    }

    /// Input codestream; reads the main header immediately. A cached source
    /// which does not yet hold the whole main header is an error here; use
    /// [`Codestream::try_create_input`] to wait for it.
    pub fn create_input<S: CompressedSource + 'a>(source: S) -> Result<Codestream<'a>, Box<dyn error::Error>> {
        Codestream::try_create_input(source)?.ok_or_else(|| CodestreamError::MainHeaderIncomplete.into())
    }

    /// Like [`Codestream::create_input`], but returns `Ok(None)` while a
    /// cached source lacks part of the main header. Pass the source by
    /// `&mut` to retry once more data has arrived.
    pub fn try_create_input<S: CompressedSource + 'a>(source: S) -> Result<Option<Codestream<'a>>, Box<dyn error::Error>> {
        let mut source: Box<dyn CompressedSource + 'a> = Box::new(source);
        let (params, input, comments) = match InputState::read_main_header(source.as_mut())? {
            Some(header) => header,
            None => return Ok(None),
        };
        let mut codestream = Codestream::new(Mode::Input, params);
        codestream.source = Some(source);
        codestream.input = Some(input);
        codestream.comments = comments;
        Ok(Some(codestream))
    }

    /// Interchange codestream, assembled precinct by precinct with no
    /// source or target.
    pub fn create_interchange(siz: SizParams) -> Codestream<'a> {
        Codestream::new(Mode::Interchange, Params::new(siz))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> Result<&mut Params, Box<dyn error::Error>> {
        if self.mode == Mode::Input {
            return Err(self.wrong_mode("params_mut"));
        }
        if self.ever_opened {
            return Err(CodestreamError::InvalidParams {
                reason: "parameters cannot change once tiles have been opened".to_string(),
            }
            .into());
        }
        Ok(&mut self.params)
    }

    pub fn finalize_params(&mut self) -> Result<(), Box<dyn error::Error>> {
        self.params.finalize()
    }

    /// Starts a new codestream on `target`, keeping the parameters. Tile
    /// structures are reused when the parameters are unchanged.
    pub fn restart_output<T: CompressedTarget + 'a>(&mut self, target: T) -> Result<(), Box<dyn error::Error>> {
        if self.mode != Mode::Output {
            return Err(self.wrong_mode("restart_output"));
        }
        if let Some(mut previous) = self.target.take() {
            previous.close();
        }
        self.target = Some(Box::new(target));
        self.reset_tiles();
        if self.output.recorded_comment {
            self.comments.pop();
        }
        self.output = OutputState::default();
        if !self.params.is_finalized() {
            self.templates.clear();
        }
        info!("output codestream restarted");
        Ok(())
    }

    /// Starts reading a new codestream from `source`. When its main header
    /// is byte-for-byte the previous one, parameters and tile structures are
    /// kept. Returns false, leaving the current codestream in place, while a
    /// cached source lacks part of the main header.
    pub fn restart_input<S: CompressedSource + 'a>(&mut self, source: S) -> Result<bool, Box<dyn error::Error>> {
        if self.mode != Mode::Input {
            return Err(self.wrong_mode("restart_input"));
        }
        let mut source: Box<dyn CompressedSource + 'a> = Box::new(source);
        let (params, input, comments) = match InputState::read_main_header(source.as_mut())? {
            Some(header) => header,
            None => return Ok(false),
        };
        if let Some(mut previous) = self.source.take() {
            previous.close();
        }
        let unchanged = self
            .input
            .as_ref()
            .map(|previous| previous.main_header == input.main_header)
            .unwrap_or(false);
        if unchanged {
            debug!("main header unchanged, keeping tile structures");
            self.params.clear_tile_overrides();
        } else {
            self.templates.clear();
            self.params = params;
        }
        self.source = Some(source);
        self.input = Some(input);
        self.comments = comments;
        self.reset_tiles();
        Ok(true)
    }

    fn reset_tiles(&mut self) {
        self.tiles.clear();
        self.generations.clear();
        self.retired.clear();
        self.closed_order.clear();
        self.ever_opened = false;
    }

    pub fn set_persistent(&mut self) {
        self.persistent = true;
    }

    /// Resilient input substitutes empty data for corrupt packets, with a
    /// warning, instead of failing.
    pub fn set_resilient(&mut self, resilient: bool) {
        self.resilient = resilient;
    }

    pub fn set_tile_unloading_threshold(&mut self, max_closed_tiles: usize) {
        self.unloading_threshold = max_closed_tiles;
        self.enforce_unloading();
    }

    /// Raises the bound on coded bytes retained by closed tiles of a
    /// persistent codestream; returns the new bound.
    pub fn augment_cache_threshold(&mut self, extra_bytes: usize) -> usize {
        self.cache_threshold += extra_bytes;
        self.enforce_unloading();
        self.cache_threshold
    }

    pub fn apply_input_restrictions(&mut self, view: ViewRestrictions) -> Result<(), Box<dyn error::Error>> {
        if self.mode == Mode::Output {
            return Err(self.wrong_mode("apply_input_restrictions"));
        }
        let any_open = self.tiles.values().any(|t| t.status == TileStatus::Open);
        if (self.persistent && any_open) || (!self.persistent && self.ever_opened) {
            return Err(CodestreamError::RestrictionsWhileTilesOpen.into());
        }
        if view.first_component >= self.params.siz.num_components() {
            return Err(CodestreamError::ComponentOutOfRange {
                index: view.first_component,
            }
            .into());
        }
        info!("input restrictions {:?}", view);
        self.view = view;
        Ok(())
    }

    pub fn change_appearance(&mut self, transpose: bool, vflip: bool, hflip: bool) {
        self.appearance = Appearance::new(transpose, vflip, hflip);
    }

    /// Whether flipping is possible for every tile-component.
    pub fn can_flip(&self) -> bool {
        let num_components = self.params.siz.num_components();
        let num_tiles = self.params.siz.num_tiles();
        (0..num_components).all(|c| !self.params.coding(None, c).has_directional_splits())
            && (0..num_tiles).all(|t| {
                !self.params.has_tile_overrides(t)
                    || (0..num_components)
                        .all(|c| !self.params.coding(Some(t), c).has_directional_splits())
            })
    }

    pub(crate) fn wrong_mode(&self, operation: &'static str) -> Box<dyn error::Error> {
        Box::new(CodestreamError::WrongMode {
            operation,
            mode: self.mode,
        })
    }

    // Global queries

    fn visible_components(&self) -> usize {
        let available = self.params.siz.num_components() - self.view.first_component;
        match self.view.max_components {
            Some(max) => available.min(max),
            None => available,
        }
    }

    pub(crate) fn real_component(&self, apparent: usize) -> Result<usize, Box<dyn error::Error>> {
        if apparent >= self.visible_components() {
            return Err(CodestreamError::ComponentOutOfRange { index: apparent }.into());
        }
        Ok(self.view.first_component + apparent)
    }

    /// Components whose packets must be retained under the current view.
    pub(crate) fn component_needed(&self, tile: &TileState, component: usize) -> bool {
        let first = self.view.first_component;
        let last = first + self.visible_components();
        if component >= first && component < last {
            return true;
        }
        self.view.access == ComponentAccess::Output
            && tile.coding.mct
            && component < 3
            && first < 3
    }

    pub fn get_num_components(&self, output: bool) -> usize {
        if output || self.mode != Mode::Output {
            self.visible_components()
        } else {
            self.params.siz.num_components()
        }
    }

    fn region(&self) -> Rect {
        match self.view.region {
            Some(region) => region.intersection(&self.params.siz.image),
            None => self.params.siz.image,
        }
    }

    fn discarded(&self, levels: usize) -> usize {
        (self.view.discard_levels as usize).min(levels)
    }

    /// Apparent dimensions of component `comp` (or of the reference grid
    /// region of interest when `comp` is `None`).
    pub fn get_dims(&self, comp: Option<usize>) -> Result<Rect, Box<dyn error::Error>> {
        let region = self.region();
        let rect = match comp {
            None => region,
            Some(apparent) => {
                let c = self.real_component(apparent)?;
                let coding = self.params.coding(None, c);
                let mut rect = self.params.siz.component_rect(c, region);
                let levels = coding.levels as usize;
                for d in 1..=self.discarded(levels) {
                    rect = crate::tile::reduce_rect(&rect, coding.split(d));
                }
                rect
            }
        };
        Ok(self.appearance.rect_to_apparent(rect))
    }

    pub fn get_tile_dims(&self, tile: Coords, comp: Option<usize>) -> Result<Rect, Box<dyn error::Error>> {
        let real = self.appearance.coords_to_real(tile);
        let grid = self.params.siz.tile_grid();
        if real.x < 0 || real.y < 0 || real.x >= grid.x || real.y >= grid.y {
            return Err(CodestreamError::TileOutOfRange { index: tile }.into());
        }
        let canvas = self.params.siz.tile_rect(real).intersection(&self.region());
        let rect = match comp {
            None => canvas,
            Some(apparent) => {
                let c = self.real_component(apparent)?;
                let number = self.params.siz.tile_number(real);
                let coding = self.params.coding(Some(number), c);
                let mut rect = self.params.siz.component_rect(c, canvas);
                for d in 1..=self.discarded(coding.levels as usize) {
                    rect = crate::tile::reduce_rect(&rect, coding.split(d));
                }
                rect
            }
        };
        Ok(self.appearance.rect_to_apparent(rect))
    }

    /// Apparent indices of the tiles that intersect the region of interest.
    pub fn get_valid_tiles(&self) -> Rect {
        let tiles = self.params.siz.tiles_intersecting(&self.region());
        self.appearance.rect_to_apparent(tiles)
    }

    pub fn get_subsampling(&self, comp: usize) -> Result<Coords, Box<dyn error::Error>> {
        let c = self.real_component(comp)?;
        let size = &self.params.siz.components[c];
        let coding = self.params.coding(None, c);
        let (mut x, mut y) = (size.sub_x as i64, size.sub_y as i64);
        for d in 1..=self.discarded(coding.levels as usize) {
            let split = coding.split(d);
            x <<= split.splits_x() as u32;
            y <<= split.splits_y() as u32;
        }
        Ok(self.appearance.size_to_apparent(Coords::new(x, y)))
    }

    pub fn get_bit_depth(&self, comp: usize) -> Result<u8, Box<dyn error::Error>> {
        let c = self.real_component(comp)?;
        Ok(self.params.siz.components[c].precision)
    }

    pub fn get_signed(&self, comp: usize) -> Result<bool, Box<dyn error::Error>> {
        let c = self.real_component(comp)?;
        Ok(self.params.siz.components[c].signed)
    }

    /// Apparent number of quality layers.
    pub fn num_layers(&self) -> u16 {
        let layers = self.params.max_layers();
        match self.view.max_layers {
            Some(max) if self.mode != Mode::Output => layers.min(max.max(1)),
            _ => layers,
        }
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Bytes read from the source or written to the target so far.
    pub fn total_bytes(&self) -> u64 {
        match self.mode {
            Mode::Input => self.input.as_ref().map(|i| i.bytes_read).unwrap_or(0),
            Mode::Output => self.output.bytes_written,
            Mode::Interchange => 0,
        }
    }

    /// Output: the end-of-codestream marker has been written.
    pub fn is_last_fragment(&self) -> bool {
        self.output.finished
    }

    /// Main header marker segments, from SOC on.
    pub fn main_header_bytes(&self) -> Vec<u8> {
        match &self.input {
            Some(input) => input.main_header.clone(),
            None => self.params.main_header(&self.comments),
        }
    }

    pub fn tile_header_bytes(&self, tile: Tile) -> Result<Vec<u8>, Box<dyn error::Error>> {
        let state = self.tile_state(tile)?;
        if self.mode == Mode::Input {
            Ok(state.header.clone())
        } else {
            Ok(self.params.tile_header(tile.number))
        }
    }

    // Tiles

    /// Opens the tile at apparent index `index`. `Ok(None)` means the tile
    /// header is not yet available from a cache; try again later.
    pub fn open_tile(&mut self, index: Coords) -> Result<Option<Tile>, Box<dyn error::Error>> {
        if !self.params.is_finalized() {
            return Err(CodestreamError::ParamsNotFinalized.into());
        }
        let real = self.appearance.coords_to_real(index);
        let grid = self.params.siz.tile_grid();
        if real.x < 0 || real.y < 0 || real.x >= grid.x || real.y >= grid.y {
            return Err(CodestreamError::TileOutOfRange { index }.into());
        }
        let number = self.params.siz.tile_number(real);
        if self.retired.contains(&number) {
            return Err(CodestreamError::TileUnavailable { tile: number }.into());
        }

        if let Some(state) = self.tiles.get_mut(&number) {
            match state.status {
                TileStatus::Open => {
                    return Ok(Some(Tile {
                        number,
                        generation: state.generation,
                    }))
                }
                TileStatus::Closed => {
                    let reopenable = self.mode == Mode::Interchange
                        || (self.mode == Mode::Input && self.persistent);
                    if !reopenable {
                        return Err(CodestreamError::TileUnavailable { tile: number }.into());
                    }
                    state.generation += 1;
                    state.status = TileStatus::Open;
                    state.reset_opened();
                    let generation = state.generation;
                    self.closed_order.retain(|t| *t != number);
                    self.generations.insert(number, generation);
                    info!("tile {} reopened", number);
                    return Ok(Some(Tile { number, generation }));
                }
            }
        }

        let generation = self.generations.get(&number).map(|g| g + 1).unwrap_or(0);
        let state = match self.mode {
            Mode::Input => match self.load_tile(number, generation)? {
                Some(state) => state,
                None => return Ok(None),
            },
            _ => self.build_tile(number, generation),
        };
        self.generations.insert(number, generation);
        self.tiles.insert(number, state);
        self.ever_opened = true;
        info!("tile {} opened", number);
        Ok(Some(Tile { number, generation }))
    }

    /// Tile structure from the current parameters, using a template when one
    /// exists.
    pub(crate) fn build_tile(&mut self, number: u32, generation: u32) -> TileState {
        if self.mode == Mode::Input && self.params.has_tile_overrides(number) {
            return TileState::new(&self.params, number, generation);
        }
        let mut state = match self.templates.get(&number) {
            Some(template) => template.clone(),
            None => {
                let template = TileState::new(&self.params, number, 0);
                self.templates.insert(number, template.clone());
                template
            }
        };
        state.generation = generation;
        state
    }

    pub fn close_tile(&mut self, tile: Tile) -> Result<(), Box<dyn error::Error>> {
        self.tile_state(tile)?;
        let number = tile.number;
        match self.mode {
            Mode::Input if !self.persistent => {
                self.tiles.remove(&number);
                self.retired.insert(number);
                info!("tile {} closed and released", number);
            }
            _ => {
                if let Some(state) = self.tiles.get_mut(&number) {
                    state.status = TileStatus::Closed;
                }
                if self.mode == Mode::Input {
                    self.closed_order.push_back(number);
                    self.enforce_unloading();
                }
                info!("tile {} closed", number);
            }
        }
        Ok(())
    }

    fn unloadable(&self) -> bool {
        self.source
            .as_ref()
            .map(|s| {
                let capabilities = s.capabilities();
                capabilities.contains(Capabilities::SEEKABLE)
                    || capabilities.contains(Capabilities::CACHED)
            })
            .unwrap_or(false)
    }

    /// Unloads the oldest closed tiles while too many are retained.
    fn enforce_unloading(&mut self) {
        if self.mode != Mode::Input || !self.persistent || !self.unloadable() {
            return;
        }
        loop {
            let retained: usize = self
                .closed_order
                .iter()
                .filter_map(|t| self.tiles.get(t))
                .map(|t| t.retained_bytes())
                .sum();
            let over_count = self.closed_order.len() > self.unloading_threshold;
            let over_bytes = self.cache_threshold > 0 && retained > self.cache_threshold;
            if !over_count && !over_bytes {
                break;
            }
            match self.closed_order.pop_front() {
                Some(number) => {
                    self.tiles.remove(&number);
                    debug!("tile {} unloaded", number);
                }
                None => break,
            }
        }
    }

    pub(crate) fn tile_state(&self, tile: Tile) -> Result<&TileState, Box<dyn error::Error>> {
        match self.tiles.get(&tile.number) {
            Some(state) if state.generation == tile.generation && state.status == TileStatus::Open => Ok(state),
            _ => Err(CodestreamError::TileNotOpen { tile: tile.number }.into()),
        }
    }

    pub(crate) fn tile_state_mut(&mut self, tile: Tile) -> Result<&mut TileState, Box<dyn error::Error>> {
        match self.tiles.get_mut(&tile.number) {
            Some(state) if state.generation == tile.generation && state.status == TileStatus::Open => Ok(state),
            _ => Err(CodestreamError::TileNotOpen { tile: tile.number }.into()),
        }
    }

    pub fn tile_index(&self, tile: Tile) -> Coords {
        self.appearance
            .coords_to_apparent(self.params.siz.tile_index(tile.number))
    }

    pub fn tile_comp(&self, tile: Tile, comp: usize) -> Result<TileComp, Box<dyn error::Error>> {
        self.tile_state(tile)?;
        let component = self.real_component(comp)?;
        Ok(TileComp { tile, component })
    }

    pub fn tile_comp_dims(&self, comp: TileComp) -> Result<Rect, Box<dyn error::Error>> {
        let state = self.tile_state(comp.tile)?;
        let tc = &state.comps[comp.component];
        let top = tc.levels() - self.discarded(tc.levels());
        Ok(self.appearance.rect_to_apparent(tc.resolutions[top].rect))
    }

    // Resolutions and subbands

    pub fn num_resolutions(&self, comp: TileComp) -> Result<usize, Box<dyn error::Error>> {
        let state = self.tile_state(comp.tile)?;
        let tc = &state.comps[comp.component];
        Ok(tc.levels() - self.discarded(tc.levels()) + 1)
    }

    pub fn resolution(&self, comp: TileComp, resolution: usize) -> Result<Resolution, Box<dyn error::Error>> {
        if resolution >= self.num_resolutions(comp)? {
            return Err(CodestreamError::ResolutionOutOfRange { index: resolution }.into());
        }
        let state = self.tile_state(comp.tile)?;
        let tc = &state.comps[comp.component];
        if self.appearance.is_flipped() && (tc.coding.has_directional_splits() || !tc.kernel.symmetric) {
            return Err(CodestreamError::FlipUnsupported {
                tile: comp.tile.number,
                component: comp.component as u16,
            }
            .into());
        }
        Ok(Resolution { comp, resolution })
    }

    fn resolution_state(&self, res: Resolution) -> Result<&crate::tile::ResolutionState, Box<dyn error::Error>> {
        let state = self.tile_state(res.comp.tile)?;
        Ok(&state.comps[res.comp.component].resolutions[res.resolution])
    }

    pub fn resolution_dims(&self, res: Resolution) -> Result<Rect, Box<dyn error::Error>> {
        Ok(self.appearance.rect_to_apparent(self.resolution_state(res)?.rect))
    }

    pub fn num_subbands(&self, res: Resolution) -> Result<usize, Box<dyn error::Error>> {
        Ok(self.resolution_state(res)?.bands.len())
    }

    /// Subband `band` of a resolution in apparent order: HL, LH, HH, or the
    /// single band of a one-directional split.
    pub fn subband(&self, res: Resolution, band: usize) -> Result<Subband, Box<dyn error::Error>> {
        let count = self.num_subbands(res)?;
        if band >= count {
            return Err(CodestreamError::SubbandOutOfRange { index: band }.into());
        }
        let real = if self.appearance.transpose && count == 3 && band < 2 {
            1 - band
        } else {
            band
        };
        Ok(Subband {
            resolution: res,
            band: real,
        })
    }

    pub fn subband_dims(&self, band: Subband) -> Result<Rect, Box<dyn error::Error>> {
        let res = self.resolution_state(band.resolution)?;
        Ok(self.appearance.rect_to_apparent(res.bands[band.band].rect))
    }

    pub fn subband_orientation(&self, band: Subband) -> Result<Orientation, Box<dyn error::Error>> {
        let res = self.resolution_state(band.resolution)?;
        let orientation = res.bands[band.band].orientation;
        Ok(if self.appearance.transpose {
            orientation.transpose()
        } else {
            orientation
        })
    }

    /// Region of interest in the component coordinates of a tile-component.
    fn component_region(&self, component: usize) -> Rect {
        self.params.siz.component_rect(component, self.region())
    }

    fn band_region(&self, band: Subband) -> Result<Rect, Box<dyn error::Error>> {
        let state = self.tile_state(band.resolution.comp.tile)?;
        let tc = &state.comps[band.resolution.comp.component];
        let region = self.component_region(band.resolution.comp.component);
        Ok(tc.band_region(&region, band.resolution.resolution, band.band))
    }

    // Precincts

    fn real_precinct_indices(&self, res: Resolution) -> Result<Rect, Box<dyn error::Error>> {
        let state = self.tile_state(res.comp.tile)?;
        let tc = &state.comps[res.comp.component];
        let resolution = &tc.resolutions[res.resolution];
        let region = self.component_region(res.comp.component);
        let mut valid: Option<Rect> = None;
        for b in 0..resolution.bands.len() {
            let band = &resolution.bands[b];
            let band_region = tc.band_region(&region, res.resolution, b);
            if band_region.is_empty() {
                continue;
            }
            let cells = band_region.cell_indices(band.precinct_exp.0, band.precinct_exp.1);
            valid = Some(match valid {
                None => cells,
                Some(v) => {
                    let (lim, cells_lim) = (v.lim(), cells.lim());
                    Rect::from_bounds(
                        v.pos.x.min(cells.pos.x),
                        v.pos.y.min(cells.pos.y),
                        lim.x.max(cells_lim.x),
                        lim.y.max(cells_lim.y),
                    )
                }
            });
        }
        Ok(valid
            .unwrap_or_default()
            .intersection(&resolution.precinct_indices))
    }

    /// Apparent indices of the precincts relevant to the region of interest.
    pub fn valid_precincts(&self, res: Resolution) -> Result<Rect, Box<dyn error::Error>> {
        Ok(self.appearance.rect_to_apparent(self.real_precinct_indices(res)?))
    }

    pub fn open_precinct(&mut self, res: Resolution, index: Coords) -> Result<Precinct, Box<dyn error::Error>> {
        let real = self.appearance.coords_to_real(index);
        let resolution = self.resolution_state(res)?;
        if !resolution.precinct_indices.contains(real) {
            return Err(CodestreamError::PrecinctOutOfRange { index }.into());
        }
        let number = resolution.precinct_number(real);
        let precinct = Precinct {
            resolution: res,
            number,
        };
        self.ensure_precinct(precinct)?;
        if let Some(state) = self.precinct_state_mut(precinct)? {
            state.closed = false;
        }
        Ok(precinct)
    }

    /// Makes sure the precinct exists, loading its packets from a cache.
    pub(crate) fn ensure_precinct(&mut self, precinct: Precinct) -> Result<(), Box<dyn error::Error>> {
        if self.mode == Mode::Input && self.input.as_ref().map(|i| i.cached).unwrap_or(false) {
            return self.load_cached_precinct(precinct);
        }
        let res = precinct.resolution;
        let state = self.tile_state_mut(res.comp.tile)?;
        state.comps[res.comp.component].resolutions[res.resolution].precinct_mut(precinct.number);
        Ok(())
    }

    fn precinct_state_mut(&mut self, precinct: Precinct) -> Result<Option<&mut crate::precinct::PrecinctState>, Box<dyn error::Error>> {
        let res = precinct.resolution;
        let state = self.tile_state_mut(res.comp.tile)?;
        Ok(state.comps[res.comp.component].resolutions[res.resolution].precincts[precinct.number].as_mut())
    }

    /// Data-bin identifier of a precinct in a JPIP-style cache.
    pub fn precinct_id(&self, precinct: Precinct) -> Result<u64, Box<dyn error::Error>> {
        let res = precinct.resolution;
        let resolution = self.resolution_state(res)?;
        let sequence = resolution.first_sequence + precinct.number as u64;
        Ok(precinct_id(
            sequence,
            res.comp.component,
            self.params.siz.num_components(),
            res.comp.tile.number,
            self.params.siz.num_tiles(),
        ))
    }

    /// Apparent block indices of subband `band` inside a precinct.
    pub fn precinct_blocks(&self, precinct: Precinct, band: usize) -> Result<Rect, Box<dyn error::Error>> {
        let subband = self.subband(precinct.resolution, band)?;
        let resolution = self.resolution_state(precinct.resolution)?;
        let index = resolution.precinct_index(precinct.number);
        let blocks = resolution.bands[subband.band].precinct_block_indices(index);
        Ok(self.appearance.rect_to_apparent(blocks))
    }

    // Code-blocks

    fn real_block_indices(&self, band: Subband) -> Result<Rect, Box<dyn error::Error>> {
        let res = self.resolution_state(band.resolution)?;
        let state = &res.bands[band.band];
        let region = self.band_region(band)?;
        if region.is_empty() {
            return Ok(Rect::default());
        }
        Ok(region.cell_indices(state.block_exp.0, state.block_exp.1))
    }

    /// Apparent indices of the code-blocks relevant to the region of interest.
    pub fn valid_blocks(&self, band: Subband) -> Result<Rect, Box<dyn error::Error>> {
        Ok(self.appearance.rect_to_apparent(self.real_block_indices(band)?))
    }

    /// Checks out a code-block of a subband. Input blocks carry their coded
    /// data; output blocks are filled by the caller and returned through
    /// `close_block`. A block may be opened once per tile opening.
    pub fn open_block(&mut self, band: Subband, index: Coords) -> Result<Block, Box<dyn error::Error>> {
        if self.mode == Mode::Interchange {
            return Err(self.wrong_mode("open_block"));
        }
        let real = self.appearance.coords_to_real(index);
        let res = self.resolution_state(band.resolution)?;
        let band_state = &res.bands[band.band];
        if !band_state.block_indices().contains(real) {
            return Err(CodestreamError::BlockOutOfRange { index }.into());
        }
        let precinct_index = band_state.precinct_of_block(real);
        let number = res.precinct_number(precinct_index);
        let precinct = Precinct {
            resolution: band.resolution,
            number,
        };
        self.ensure_precinct(precinct)?;
        self.checkout_block(precinct, band.band, real)
    }

    /// Interchange: checks out a block of one precinct, addressed by its
    /// apparent index within the subband.
    pub fn open_precinct_block(&mut self, precinct: Precinct, band: usize, index: Coords) -> Result<Block, Box<dyn error::Error>> {
        if self.mode != Mode::Interchange {
            return Err(self.wrong_mode("open_precinct_block"));
        }
        let subband = self.subband(precinct.resolution, band)?;
        let real = self.appearance.coords_to_real(index);
        let res = self.resolution_state(precinct.resolution)?;
        let precinct_index = res.precinct_index(precinct.number);
        if !res.bands[subband.band]
            .precinct_block_indices(precinct_index)
            .contains(real)
        {
            return Err(CodestreamError::BlockOutOfRange { index }.into());
        }
        self.ensure_precinct(precinct)?;
        self.checkout_block(precinct, subband.band, real)
    }

    fn checkout_block(&mut self, precinct: Precinct, band: usize, index: Coords) -> Result<Block, Box<dyn error::Error>> {
        let region = self.band_region(Subband {
            resolution: precinct.resolution,
            band,
        })?;
        let max_layers = match self.mode {
            Mode::Input => self.view.max_layers,
            _ => None,
        };
        let appearance = self.appearance;
        let release_when_done = self.mode == Mode::Input && !self.persistent;
        let res_handle = precinct.resolution;
        let tile = res_handle.comp.tile;
        let mode = self.mode;

        let state = self.tile_state_mut(tile)?;
        let tc = &mut state.comps[res_handle.comp.component];
        let modes = tc.coding.block_style;
        let resolution = &mut tc.resolutions[res_handle.resolution];
        let band_state = resolution.bands[band].clone();
        let block_rect = band_state.block_rect(index);
        let precinct_state = resolution.precinct_mut(precinct.number);
        let blocks = &mut precinct_state.bands[band];
        let relative = Coords::new(index.x - blocks.indices.pos.x, index.y - blocks.indices.pos.y);
        let slot = (relative.y * blocks.indices.size.x + relative.x) as usize;
        let coded = &mut blocks.blocks[slot];
        if coded.opened {
            return Err(CodestreamError::BlockAlreadyOpened {
                tile: tile.number,
                component: res_handle.comp.component as u16,
                resolution: res_handle.resolution as u8,
                band: band as u8,
                index,
            }
            .into());
        }
        coded.opened = true;

        let mut block = Block {
            size: block_rect.size,
            region: Rect::default(),
            orientation: band_state.orientation,
            transpose: appearance.transpose,
            vflip: appearance.vflip,
            hflip: appearance.hflip,
            modes,
            location: BlockLocation {
                tile: tile.number,
                generation: tile.generation,
                component: res_handle.comp.component,
                resolution: res_handle.resolution,
                band,
                precinct: precinct.number,
                slot,
                index,
            },
            ..Block::default()
        };
        let interest = block_rect.intersection(&region);
        if !interest.is_empty() {
            block.region = Rect::new(
                interest.pos.x - block_rect.pos.x,
                interest.pos.y - block_rect.pos.y,
                interest.size.x,
                interest.size.y,
            );
        }

        if mode == Mode::Input {
            let passes = match max_layers {
                Some(layers) => {
                    coded.passes_at(crate::block::layer_slope(layers.max(1) - 1) as u32)
                }
                None => coded.pass_slopes.len(),
            };
            block.missing_msbs = coded.missing_msbs;
            block.num_passes = passes;
            block.pass_lengths = coded.pass_lengths[..passes].to_vec();
            block.pass_slopes = coded.pass_slopes[..passes].to_vec();
            block.data = coded.data[..coded.bytes_for(passes)].to_vec();
            if release_when_done {
                coded.release();
            }
            if release_when_done && precinct_state.all_opened() {
                precinct_state.release();
                debug!("precinct {} released", precinct.number);
            }
        } else if coded.closed {
            block.missing_msbs = coded.missing_msbs;
            block.num_passes = coded.pass_slopes.len();
            block.pass_lengths = coded.pass_lengths.clone();
            block.pass_slopes = coded.pass_slopes.clone();
            block.data = coded.data.clone();
        }
        Ok(block)
    }

    /// Returns a checked-out block. Output and interchange blocks have their
    /// coded data validated and retained.
    pub fn close_block(&mut self, block: Block) -> Result<(), Box<dyn error::Error>> {
        let location = block.location;
        let tile = Tile {
            number: location.tile,
            generation: location.generation,
        };
        let mode = self.mode;
        let state = self.tile_state_mut(tile)?;
        if mode == Mode::Input {
            return Ok(());
        }
        block.validate()?;
        let resolution = &mut state.comps[location.component].resolutions[location.resolution];
        let precinct = resolution.precinct_mut(location.precinct);
        if precinct.released {
            return Err(CodestreamError::InvalidBlock {
                reason: "precinct has already been written".to_string(),
            }
            .into());
        }
        let slot = &mut precinct.bands[location.band].blocks[location.slot];
        *slot = CodedBlock::from_block(block);
        Ok(())
    }

    /// Interchange: marks a precinct closed. Returns whether all of its
    /// blocks have been supplied; repeated calls return the same answer.
    pub fn close_precinct(&mut self, precinct: Precinct) -> bool {
        match self.precinct_state_mut(precinct) {
            Ok(Some(state)) => {
                state.closed = true;
                state.is_complete()
            }
            _ => false,
        }
    }

    fn packet_thresholds(&self, tile: Tile) -> Result<(Vec<u32>, bool), Box<dyn error::Error>> {
        let state = self.tile_state(tile)?;
        let mut layers = state.layers();
        if self.mode == Mode::Input {
            if let Some(max) = self.view.max_layers {
                layers = layers.min(max.max(1));
            }
        }
        Ok((layer_thresholds(layers), state.coding.use_eph))
    }

    /// Sizes the precinct's packets without generating them; see
    /// `PrecinctState::size_packets`. On entry `cumulative_packets` is the
    /// number of packets wanted and a non-zero `cumulative_bytes` a byte
    /// limit; on exit both hold what has been sized.
    pub fn size_packets(&mut self, precinct: Precinct, cumulative_packets: &mut u16, cumulative_bytes: &mut u64) -> Result<(), Box<dyn error::Error>> {
        if self.mode == Mode::Output {
            return Err(self.wrong_mode("size_packets"));
        }
        self.ensure_precinct(precinct)?;
        let (thresholds, use_eph) = self.packet_thresholds(precinct.resolution.comp.tile)?;
        if let Some(state) = self.precinct_state_mut(precinct)? {
            state.size_packets(&thresholds, use_eph, cumulative_packets, cumulative_bytes);
        }
        Ok(())
    }

    /// Generates packets `skip_packets..*cumulative_packets`, appending them
    /// to `out` without their first `skip_bytes - size(skipped packets)`
    /// bytes. Returns the number of bytes appended.
    pub fn get_packets(
        &mut self,
        precinct: Precinct,
        skip_packets: u16,
        skip_bytes: u64,
        cumulative_packets: &mut u16,
        cumulative_bytes: &mut u64,
        out: &mut Vec<u8>,
    ) -> Result<usize, Box<dyn error::Error>> {
        if self.mode == Mode::Output {
            return Err(self.wrong_mode("get_packets"));
        }
        self.ensure_precinct(precinct)?;
        let (thresholds, use_eph) = self.packet_thresholds(precinct.resolution.comp.tile)?;
        Ok(match self.precinct_state_mut(precinct)? {
            Some(state) => state.get_packets(
                &thresholds,
                use_eph,
                skip_packets,
                skip_bytes,
                cumulative_packets,
                cumulative_bytes,
                out,
            ),
            None => 0,
        })
    }

    pub(crate) fn warn_or_fail(&self, error: Box<dyn error::Error>) -> Result<(), Box<dyn error::Error>> {
        if self.resilient {
            warn!("ignoring corrupt data: {}", error);
            Ok(())
        } else {
            Err(error)
        }
    }
}

pub(crate) fn precinct_id(sequence: u64, component: usize, num_components: usize, tile: u32, num_tiles: u32) -> u64 {
    (sequence * num_components as u64 + component as u64) * num_tiles as u64 + tile as u64
}
