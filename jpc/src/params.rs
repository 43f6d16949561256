use log::info;
use std::collections::BTreeMap;
use std::error;

use crate::geometry::{ceil_div, Coords, Rect};
use crate::kernels::KernelId;
use crate::markers::{
    CodingStyleComponentSegment, CodingStyleMarkerSegment, CodingStyleParameters,
    CommentMarkerSegment, DecompositionSplitSegment, ImageAndTileSizeMarkerSegment,
    ProgressionOrder, QuantizationSegment, CAPABILITY_EXTENDED, CODING_STYLE_EPH,
    CODING_STYLE_PRECINCTS_DEFINED, CODING_STYLE_SOP, MARKER_SYMBOL_SOC,
};
use crate::CodestreamError;

/// Precision, signedness and sub-sampling of one image component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSize {
    pub precision: u8,
    pub signed: bool,
    pub sub_x: u8,
    pub sub_y: u8,
}

impl ComponentSize {
    pub fn new(precision: u8, signed: bool) -> ComponentSize {
        ComponentSize {
            precision,
            signed,
            sub_x: 1,
            sub_y: 1,
        }
    }

    pub fn with_subsampling(mut self, sub_x: u8, sub_y: u8) -> ComponentSize {
        self.sub_x = sub_x;
        self.sub_y = sub_y;
        self
    }
}

/// Reference grid, tiling and component geometry (the SIZ marker segment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizParams {
    pub capabilities: u16,
    /// Image area on the reference grid.
    pub image: Rect,
    pub tile_origin: Coords,
    pub tile_size: Coords,
    pub components: Vec<ComponentSize>,
}

impl SizParams {
    /// A single tile covering a `width x height` image anchored at the origin.
    pub fn new(width: u32, height: u32, components: Vec<ComponentSize>) -> SizParams {
        SizParams {
            capabilities: 0,
            image: Rect::new(0, 0, width as i64, height as i64),
            tile_origin: Coords::new(0, 0),
            tile_size: Coords::new(width as i64, height as i64),
            components,
        }
    }

    pub fn with_tiles(mut self, tile_width: u32, tile_height: u32) -> SizParams {
        self.tile_size = Coords::new(tile_width as i64, tile_height as i64);
        self
    }

    pub fn with_offsets(mut self, image_origin: Coords, tile_origin: Coords) -> SizParams {
        let lim = self.image.lim();
        self.image = Rect::from_bounds(image_origin.x, image_origin.y, lim.x, lim.y);
        self.tile_origin = tile_origin;
        self
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Number of tiles across and down.
    pub fn tile_grid(&self) -> Coords {
        let lim = self.image.lim();
        Coords::new(
            ceil_div(lim.x - self.tile_origin.x, self.tile_size.x),
            ceil_div(lim.y - self.tile_origin.y, self.tile_size.y),
        )
    }

    pub fn num_tiles(&self) -> u32 {
        let grid = self.tile_grid();
        (grid.x * grid.y) as u32
    }

    pub fn tile_number(&self, index: Coords) -> u32 {
        (index.y * self.tile_grid().x + index.x) as u32
    }

    pub fn tile_index(&self, number: u32) -> Coords {
        let across = self.tile_grid().x;
        Coords::new(number as i64 % across, number as i64 / across)
    }

    /// Tile area on the reference grid, clipped to the image.
    pub fn tile_rect(&self, index: Coords) -> Rect {
        let cell = Rect::new(
            self.tile_origin.x + index.x * self.tile_size.x,
            self.tile_origin.y + index.y * self.tile_size.y,
            self.tile_size.x,
            self.tile_size.y,
        );
        cell.intersection(&self.image)
    }

    /// Maps a reference grid rectangle onto component `comp`'s sample grid.
    pub fn component_rect(&self, comp: usize, canvas: Rect) -> Rect {
        let size = &self.components[comp];
        let lim = canvas.lim();
        Rect::from_bounds(
            ceil_div(canvas.pos.x, size.sub_x as i64),
            ceil_div(canvas.pos.y, size.sub_y as i64),
            ceil_div(lim.x, size.sub_x as i64),
            ceil_div(lim.y, size.sub_y as i64),
        )
    }

    /// Tile indices whose area intersects `region` on the reference grid.
    pub fn tiles_intersecting(&self, region: &Rect) -> Rect {
        let clipped = region.intersection(&self.image);
        if clipped.is_empty() {
            return Rect::new(0, 0, 0, 0);
        }
        let lim = clipped.lim();
        Rect::from_bounds(
            (clipped.pos.x - self.tile_origin.x).div_euclid(self.tile_size.x),
            (clipped.pos.y - self.tile_origin.y).div_euclid(self.tile_size.y),
            ceil_div(lim.x - self.tile_origin.x, self.tile_size.x),
            ceil_div(lim.y - self.tile_origin.y, self.tile_size.y),
        )
    }

    pub(crate) fn validate(&self) -> Result<(), Box<dyn error::Error>> {
        if self.components.is_empty() || self.components.len() > 16384 {
            return Err(invalid(format!(
                "{} components, expected 1 to 16384",
                self.components.len()
            )));
        }
        for (i, c) in self.components.iter().enumerate() {
            if c.precision == 0 || c.precision > 38 || c.sub_x == 0 || c.sub_y == 0 {
                return Err(invalid(format!("component {} has invalid precision or sub-sampling", i)));
            }
        }
        if self.image.is_empty() || self.image.pos.x < 0 || self.image.pos.y < 0 {
            return Err(invalid("image area is empty or negative".to_string()));
        }
        if self.tile_size.x <= 0 || self.tile_size.y <= 0 {
            return Err(invalid("tile size must be positive".to_string()));
        }
        let lim = self.image.lim();
        if lim.x > u32::MAX as i64 || lim.y > u32::MAX as i64 {
            return Err(invalid("image exceeds the 32-bit reference grid".to_string()));
        }
        if self.tile_origin.x < 0
            || self.tile_origin.y < 0
            || self.tile_origin.x > self.image.pos.x
            || self.tile_origin.y > self.image.pos.y
        {
            return Err(CodestreamError::TileGridOffsetOverflow {
                tile_horizontal_offset: self.tile_origin.x as u32,
                tile_vertical_offset: self.tile_origin.y as u32,
                image_horizontal_offset: self.image.pos.x as u32,
                image_vertical_offset: self.image.pos.y as u32,
            }
            .into());
        }
        if self.tile_origin.x + self.tile_size.x <= self.image.pos.x
            || self.tile_origin.y + self.tile_size.y <= self.image.pos.y
        {
            return Err(CodestreamError::TileSizeOverflow {
                image_horizontal_offset: self.image.pos.x as u32,
                image_vertical_offset: self.image.pos.y as u32,
                tile_horizontal_offset: self.tile_origin.x as u32,
                tile_vertical_offset: self.tile_origin.y as u32,
                reference_tile_width: self.tile_size.x as u32,
                reference_tile_height: self.tile_size.y as u32,
            }
            .into());
        }
        if self.num_tiles() > 65535 {
            return Err(invalid(format!("{} tiles exceed the limit of 65535", self.num_tiles())));
        }
        Ok(())
    }

    pub(crate) fn to_segment(&self, extended: bool) -> ImageAndTileSizeMarkerSegment {
        let lim = self.image.lim();
        let capabilities = if extended {
            self.capabilities | CAPABILITY_EXTENDED
        } else {
            self.capabilities
        };
        let components: Vec<(u8, u8, u8)> = self
            .components
            .iter()
            .map(|c| (((c.signed as u8) << 7) | (c.precision - 1), c.sub_x, c.sub_y))
            .collect();
        ImageAndTileSizeMarkerSegment::new(
            capabilities,
            (lim.x as u32, lim.y as u32),
            (self.image.pos.x as u32, self.image.pos.y as u32),
            (self.tile_size.x as u32, self.tile_size.y as u32),
            (self.tile_origin.x as u32, self.tile_origin.y as u32),
            &components,
        )
    }

    pub(crate) fn from_segment(segment: &ImageAndTileSizeMarkerSegment) -> SizParams {
        let components = (0..segment.no_components() as usize)
            .map(|i| {
                let (precision, sub_x, sub_y) = segment.component(i);
                ComponentSize {
                    precision: (precision & 0x7f) + 1,
                    signed: precision & 0x80 != 0,
                    sub_x,
                    sub_y,
                }
            })
            .collect();
        SizParams {
            capabilities: segment.decoder_capabilities() & !CAPABILITY_EXTENDED,
            image: Rect::from_bounds(
                segment.image_horizontal_offset() as i64,
                segment.image_vertical_offset() as i64,
                segment.reference_grid_width() as i64,
                segment.reference_grid_height() as i64,
            ),
            tile_origin: Coords::new(
                segment.tile_horizontal_offset() as i64,
                segment.tile_vertical_offset() as i64,
            ),
            tile_size: Coords::new(
                segment.reference_tile_width() as i64,
                segment.reference_tile_height() as i64,
            ),
            components,
        }
    }
}

/// Direction in which one decomposition level splits its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Both,
    Horizontal,
    Vertical,
}

impl Split {
    fn marker_value(self) -> u8 {
        match self {
            Split::Both => 1,
            Split::Horizontal => 2,
            Split::Vertical => 3,
        }
    }

    fn from_marker(value: u8) -> Split {
        match value {
            2 => Split::Horizontal,
            3 => Split::Vertical,
            _ => Split::Both,
        }
    }

    pub fn splits_x(self) -> bool {
        self != Split::Vertical
    }

    pub fn splits_y(self) -> bool {
        self != Split::Horizontal
    }
}

/// Coding style of a tile-component: COD/COC fields plus split directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingParams {
    pub progression: ProgressionOrder,
    pub layers: u16,
    pub mct: bool,
    pub levels: u8,
    /// Code-block width and height exponents.
    pub block_size: (u8, u8),
    pub block_style: u8,
    pub kernel: KernelId,
    /// (PPx, PPy) per resolution, lowest first; the last entry repeats.
    /// Empty means maximal precincts.
    pub precincts: Vec<(u8, u8)>,
    pub use_sop: bool,
    pub use_eph: bool,
    /// Split direction per decomposition level, finest first; missing
    /// levels split both ways.
    pub splits: Vec<Split>,
    pub guard_bits: u8,
}

impl Default for CodingParams {
    fn default() -> CodingParams {
        CodingParams {
            progression: ProgressionOrder::LRLCPP,
            layers: 1,
            mct: false,
            levels: 5,
            block_size: (6, 6),
            block_style: 0,
            kernel: KernelId::W5X3,
            precincts: vec![],
            use_sop: false,
            use_eph: false,
            splits: vec![],
            guard_bits: 2,
        }
    }
}

impl CodingParams {
    pub fn precinct_exponents(&self, resolution: usize) -> (u8, u8) {
        match self.precincts.len() {
            0 => (15, 15),
            n => self.precincts[resolution.min(n - 1)],
        }
    }

    /// Split used by decomposition level `level`, counted from 1 at the
    /// finest level.
    pub fn split(&self, level: usize) -> Split {
        if level == 0 {
            return Split::Both;
        }
        self.splits.get(level - 1).copied().unwrap_or(Split::Both)
    }

    pub fn has_directional_splits(&self) -> bool {
        (1..=self.levels as usize).any(|d| self.split(d) != Split::Both)
    }

    /// Number of subbands across all resolutions.
    pub(crate) fn num_subbands(&self) -> usize {
        1 + (1..=self.levels as usize)
            .map(|d| if self.split(d) == Split::Both { 3 } else { 1 })
            .sum::<usize>()
    }

    fn validate(&self, context: &str) -> Result<(), Box<dyn error::Error>> {
        if self.layers == 0 {
            return Err(invalid(format!("{}: at least one quality layer is needed", context)));
        }
        if self.levels > 32 {
            return Err(invalid(format!("{}: {} decomposition levels", context, self.levels)));
        }
        let (xcb, ycb) = self.block_size;
        if !(2..=10).contains(&xcb) || !(2..=10).contains(&ycb) || xcb + ycb > 12 {
            return Err(invalid(format!(
                "{}: code-block exponents {}x{} out of range",
                context, xcb, ycb
            )));
        }
        if let ProgressionOrder::Reserved { value } = self.progression {
            return Err(invalid(format!("{}: reserved progression order {}", context, value)));
        }
        if self.splits.len() > self.levels as usize {
            return Err(invalid(format!(
                "{}: split directions given for more than {} levels",
                context, self.levels
            )));
        }
        for r in 0..=self.levels as usize {
            let (ppx, ppy) = self.precinct_exponents(r);
            if ppx > 15 || ppy > 15 {
                return Err(invalid(format!("{}: precinct exponent above 15", context)));
            }
            if r > 0 {
                let split = self.split(self.levels as usize + 1 - r);
                if (split.splits_x() && ppx == 0) || (split.splits_y() && ppy == 0) {
                    return Err(invalid(format!(
                        "{}: resolution {} needs precinct exponents of at least 1",
                        context, r
                    )));
                }
            }
        }
        Ok(())
    }

    fn style_parameters(&self) -> CodingStyleParameters {
        CodingStyleParameters::new(
            self.levels,
            self.block_size,
            self.block_style,
            self.kernel.marker_value(),
            if self.precincts.is_empty() {
                vec![]
            } else {
                (0..=self.levels as usize)
                    .map(|r| self.precinct_exponents(r))
                    .collect()
            },
        )
    }

    fn coding_style(&self) -> u8 {
        let mut style = 0;
        if !self.precincts.is_empty() {
            style |= CODING_STYLE_PRECINCTS_DEFINED;
        }
        if self.use_sop {
            style |= CODING_STYLE_SOP;
        }
        if self.use_eph {
            style |= CODING_STYLE_EPH;
        }
        style
    }

    pub(crate) fn cod_segment(&self) -> CodingStyleMarkerSegment {
        CodingStyleMarkerSegment::new(
            self.coding_style(),
            self.progression,
            self.layers,
            self.mct,
            self.style_parameters(),
        )
    }

    pub(crate) fn coc_segment(&self, component: u16) -> CodingStyleComponentSegment {
        CodingStyleComponentSegment::new(
            component,
            !self.precincts.is_empty(),
            self.style_parameters(),
        )
    }

    pub(crate) fn quantization_segment(&self, precision: u8) -> QuantizationSegment {
        // Nominal dynamic range per subband: precision plus the band gain.
        let mut gains = vec![0u8];
        for d in (1..=self.levels as usize).rev() {
            match self.split(d) {
                Split::Both => gains.extend_from_slice(&[1, 1, 2]),
                _ => gains.push(1),
            }
        }
        match self.kernel {
            KernelId::W5X3 => {
                let exponents: Vec<u8> = gains.iter().map(|g| (precision + g).min(31)).collect();
                QuantizationSegment::reversible(self.guard_bits, &exponents)
            }
            KernelId::W9X7 => {
                let steps: Vec<(u8, u16)> = gains
                    .iter()
                    .map(|g| ((precision + g).min(31), 0))
                    .collect();
                QuantizationSegment::expounded(self.guard_bits, &steps)
            }
        }
    }

    pub(crate) fn apply_cod(&mut self, segment: &CodingStyleMarkerSegment) -> Result<(), Box<dyn error::Error>> {
        self.progression = segment.progression_order();
        self.layers = segment.no_layers();
        self.mct = segment.multiple_component_transformation();
        self.use_sop = segment.coding_style() & CODING_STYLE_SOP != 0;
        self.use_eph = segment.coding_style() & CODING_STYLE_EPH != 0;
        self.apply_style_parameters(segment.coding_style_parameters())
    }

    pub(crate) fn apply_coc(&mut self, segment: &CodingStyleComponentSegment) -> Result<(), Box<dyn error::Error>> {
        self.apply_style_parameters(segment.coding_style_parameters())
    }

    fn apply_style_parameters(&mut self, parameters: &CodingStyleParameters) -> Result<(), Box<dyn error::Error>> {
        self.levels = parameters.no_decomposition_levels();
        self.block_size = (parameters.code_block_width(), parameters.code_block_height());
        self.block_style = parameters.code_block_style();
        self.kernel = KernelId::from_marker(parameters.transformation()).ok_or_else(|| {
            Box::new(CodestreamError::Unsupported {
                feature: format!("wavelet transformation {}", parameters.transformation()),
            }) as Box<dyn error::Error>
        })?;
        self.precincts = parameters.precinct_sizes();
        Ok(())
    }

    /// Takes the COD-only fields from `tile` and the per-component fields
    /// from `self`.
    fn with_tile_fields(&self, tile: &CodingParams) -> CodingParams {
        CodingParams {
            progression: tile.progression,
            layers: tile.layers,
            mct: tile.mct,
            use_sop: tile.use_sop,
            use_eph: tile.use_eph,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TileOverrides {
    pub coding: Option<CodingParams>,
    pub components: BTreeMap<u16, CodingParams>,
}

/// Complete parameter set of a codestream.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub siz: SizParams,
    pub coding: CodingParams,
    component_coding: BTreeMap<u16, CodingParams>,
    tile_coding: BTreeMap<u32, TileOverrides>,
    finalized: bool,
}

impl Params {
    pub fn new(siz: SizParams) -> Params {
        Params {
            siz,
            coding: CodingParams::default(),
            component_coding: BTreeMap::new(),
            tile_coding: BTreeMap::new(),
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Overrides the coding style of one component throughout the image.
    pub fn set_component_coding(&mut self, component: u16, coding: CodingParams) {
        self.finalized = false;
        self.component_coding.insert(component, coding);
    }

    /// Overrides the coding style of one tile.
    pub fn set_tile_coding(&mut self, tile: u32, coding: CodingParams) {
        self.finalized = false;
        self.tile_coding.entry(tile).or_default().coding = Some(coding);
    }

    pub fn set_tile_component_coding(&mut self, tile: u32, component: u16, coding: CodingParams) {
        self.finalized = false;
        self.tile_coding
            .entry(tile)
            .or_default()
            .components
            .insert(component, coding);
    }

    /// Effective coding style of a tile-component, or of the main header
    /// when `tile` is `None`. Tile-component overrides win over tile
    /// overrides, which win over main-header component overrides.
    pub fn coding(&self, tile: Option<u32>, component: usize) -> CodingParams {
        let component = component as u16;
        let overrides = tile.and_then(|t| self.tile_coding.get(&t));
        let tile_default = overrides
            .and_then(|o| o.coding.as_ref())
            .unwrap_or(&self.coding);
        if let Some(coding) = overrides.and_then(|o| o.components.get(&component)) {
            return coding.with_tile_fields(tile_default);
        }
        if let Some(coding) = overrides.and_then(|o| o.coding.as_ref()) {
            return coding.clone();
        }
        match self.component_coding.get(&component) {
            Some(coding) => coding.with_tile_fields(&self.coding),
            None => self.coding.clone(),
        }
    }

    /// Largest number of quality layers among all tiles.
    pub fn max_layers(&self) -> u16 {
        self.tile_coding
            .values()
            .filter_map(|o| o.coding.as_ref().map(|c| c.layers))
            .fold(self.coding.layers, u16::max)
    }

    /// Validates every parameter and freezes the set.
    pub fn finalize(&mut self) -> Result<(), Box<dyn error::Error>> {
        self.siz.validate()?;
        self.coding.validate("main header")?;
        let num_components = self.siz.num_components() as u16;
        for (component, coding) in &self.component_coding {
            if *component >= num_components {
                return Err(invalid(format!("override for missing component {}", component)));
            }
            coding.validate(&format!("component {}", component))?;
        }
        let num_tiles = self.siz.num_tiles();
        for (tile, overrides) in &self.tile_coding {
            if *tile >= num_tiles {
                return Err(invalid(format!("override for missing tile {}", tile)));
            }
            if let Some(coding) = &overrides.coding {
                coding.validate(&format!("tile {}", tile))?;
            }
            for (component, coding) in &overrides.components {
                if *component >= num_components {
                    return Err(invalid(format!("override for missing component {}", component)));
                }
                coding.validate(&format!("tile {} component {}", tile, component))?;
            }
        }
        if self.coding.mct && num_components < 3 {
            return Err(invalid("colour transform needs at least 3 components".to_string()));
        }
        self.finalized = true;
        Ok(())
    }

    pub(crate) fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    pub(crate) fn main_coding_mut(&mut self) -> &mut CodingParams {
        &mut self.coding
    }

    pub(crate) fn component_coding_mut(&mut self, component: u16) -> &mut CodingParams {
        let base = self.coding.clone();
        self.component_coding.entry(component).or_insert(base)
    }

    pub(crate) fn tile_coding_mut(&mut self, tile: u32) -> &mut CodingParams {
        let base = self.coding.clone();
        self.tile_coding
            .entry(tile)
            .or_default()
            .coding
            .get_or_insert(base)
    }

    pub(crate) fn tile_component_coding_mut(&mut self, tile: u32, component: u16) -> &mut CodingParams {
        let base = self.coding(Some(tile), component as usize);
        self.tile_coding
            .entry(tile)
            .or_default()
            .components
            .entry(component)
            .or_insert(base)
    }

    pub(crate) fn clear_tile_overrides(&mut self) {
        self.tile_coding.clear();
    }

    pub(crate) fn has_tile_overrides(&self, tile: u32) -> bool {
        self.tile_coding.contains_key(&tile)
    }

    fn uses_directional_splits(&self) -> bool {
        self.coding.has_directional_splits()
            || self.component_coding.values().any(|c| c.has_directional_splits())
    }

    /// SOC through the last main-header marker segment, optionally followed
    /// by comment segments.
    pub(crate) fn main_header(&self, comments: &[String]) -> Vec<u8> {
        let num_components = self.siz.num_components() as u16;
        let extended = self.uses_directional_splits();
        let mut out = MARKER_SYMBOL_SOC.to_vec();
        out.extend(self.siz.to_segment(extended).encode());
        if extended {
            let directions = (1..=self.coding.levels as usize)
                .map(|d| self.coding.split(d).marker_value())
                .collect();
            out.extend(DecompositionSplitSegment::new(directions).encode());
        }
        out.extend(self.coding.cod_segment().encode());
        for (component, coding) in &self.component_coding {
            out.extend(coding.coc_segment(*component).encode(num_components));
        }
        let precision = self.siz.components[0].precision;
        out.extend(self.coding.quantization_segment(precision).encode(num_components));
        for (component, coding) in &self.component_coding {
            let precision = self.siz.components[*component as usize].precision;
            out.extend(
                coding
                    .quantization_segment(precision)
                    .with_component(*component)
                    .encode(num_components),
            );
        }
        for comment in comments {
            out.extend(CommentMarkerSegment::latin(comment).encode());
        }
        info!("main header of {} bytes generated", out.len());
        out
    }

    /// Marker segments carried in the first tile-part header of `tile`.
    pub(crate) fn tile_header(&self, tile: u32) -> Vec<u8> {
        let mut out = vec![];
        let overrides = match self.tile_coding.get(&tile) {
            Some(overrides) => overrides,
            None => return out,
        };
        let num_components = self.siz.num_components() as u16;
        if let Some(coding) = &overrides.coding {
            out.extend(coding.cod_segment().encode());
            let precision = self.siz.components[0].precision;
            out.extend(coding.quantization_segment(precision).encode(num_components));
        }
        for (component, coding) in &overrides.components {
            out.extend(coding.coc_segment(*component).encode(num_components));
            let precision = self.siz.components[*component as usize].precision;
            out.extend(
                coding
                    .quantization_segment(precision)
                    .with_component(*component)
                    .encode(num_components),
            );
        }
        out
    }

    pub(crate) fn apply_splits(&mut self, segment: &DecompositionSplitSegment) {
        self.coding.splits = segment
            .directions()
            .iter()
            .map(|d| Split::from_marker(*d))
            .collect();
    }
}

fn invalid(reason: String) -> Box<dyn error::Error> {
    Box::new(CodestreamError::InvalidParams { reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(width: u32, height: u32) -> SizParams {
        SizParams::new(width, height, vec![ComponentSize::new(8, false)])
    }

    #[test]
    fn test_tile_grid_and_rects() {
        let siz = gray(100, 70)
            .with_tiles(32, 32)
            .with_offsets(Coords::new(10, 5), Coords::new(0, 0));
        assert_eq!(siz.tile_grid(), Coords::new(4, 3));
        assert_eq!(siz.num_tiles(), 12);
        assert_eq!(siz.tile_rect(Coords::new(0, 0)), Rect::from_bounds(10, 5, 32, 32));
        assert_eq!(siz.tile_rect(Coords::new(3, 2)), Rect::from_bounds(96, 64, 100, 70));
        assert_eq!(siz.tile_number(Coords::new(1, 2)), 9);
        assert_eq!(siz.tile_index(9), Coords::new(1, 2));
    }

    #[test]
    fn test_coding_precedence() {
        let mut params = Params::new(SizParams::new(
            64,
            64,
            vec![ComponentSize::new(8, false); 3],
        ));
        params.coding.levels = 3;
        params.set_component_coding(
            1,
            CodingParams {
                levels: 2,
                ..CodingParams::default()
            },
        );
        params.set_tile_coding(
            0,
            CodingParams {
                levels: 1,
                layers: 4,
                ..CodingParams::default()
            },
        );
        assert_eq!(params.coding(None, 1).levels, 2);
        assert_eq!(params.coding(None, 0).levels, 3);
        assert_eq!(params.coding(Some(0), 1).levels, 1);
        assert_eq!(params.coding(Some(0), 2).layers, 4);
        params.finalize().unwrap();
        assert!(params.is_finalized());
    }

    #[test]
    fn test_finalize_rejects_zero_precinct_exponents() {
        let mut params = Params::new(gray(64, 64));
        params.coding.levels = 1;
        params.coding.precincts = vec![(0, 0)];
        let error = params.finalize().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CodestreamError>(),
            Some(CodestreamError::InvalidParams { .. })
        ));
        assert!(!params.is_finalized());
    }

    #[test]
    fn test_siz_segment_round_trip_keeps_signedness() {
        let siz = SizParams::new(
            17,
            9,
            vec![
                ComponentSize::new(12, true),
                ComponentSize::new(8, false).with_subsampling(2, 1),
            ],
        );
        let segment = siz.to_segment(false);
        assert_eq!(SizParams::from_segment(&segment), siz);
    }
}
