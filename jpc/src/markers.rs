use log::info;
use std::error;
use std::io;
use std::io::prelude::*;
use std::str;

use crate::CodestreamError;

pub type MarkerSymbol = [u8; 2];

// Delimiting markers and marker segments
pub(crate) const MARKER_SYMBOL_SOC: MarkerSymbol = [255, 79]; // Start of code stream
pub(crate) const MARKER_SYMBOL_SOT: MarkerSymbol = [255, 144]; // Start of tile-part
pub(crate) const MARKER_SYMBOL_SOD: MarkerSymbol = [255, 147]; // Start of data
pub(crate) const MARKER_SYMBOL_EOC: MarkerSymbol = [255, 217]; // End of codestream

// Fixed information marker segments
pub(crate) const MARKER_SYMBOL_SIZ: MarkerSymbol = [255, 81]; // Image and tile size

// Functional marker segments
pub(crate) const MARKER_SYMBOL_COD: MarkerSymbol = [255, 82]; // Coding style default
pub(crate) const MARKER_SYMBOL_COC: MarkerSymbol = [255, 83]; // Coding style component
pub(crate) const MARKER_SYMBOL_RGN: MarkerSymbol = [255, 94]; // Region-of-interest
pub(crate) const MARKER_SYMBOL_QCD: MarkerSymbol = [255, 92]; // Quantization default
pub(crate) const MARKER_SYMBOL_QCC: MarkerSymbol = [255, 93]; // Quantization component
pub(crate) const MARKER_SYMBOL_POC: MarkerSymbol = [255, 95]; // Progression order change
pub(crate) const MARKER_SYMBOL_DFS: MarkerSymbol = [255, 114]; // Decomposition split directions

// Pointer marker segments
pub(crate) const MARKER_SYMBOL_TLM: MarkerSymbol = [255, 85]; // Tile-part lengths
pub(crate) const MARKER_SYMBOL_PLM: MarkerSymbol = [255, 87]; // Packet length, main header
pub(crate) const MARKER_SYMBOL_PLT: MarkerSymbol = [255, 88]; // Packet length, tile-part header
pub(crate) const MARKER_SYMBOL_PPM: MarkerSymbol = [255, 96]; // Packed packet headers, main header
pub(crate) const MARKER_SYMBOL_PPT: MarkerSymbol = [255, 97]; // Packed packet headers, tile-part header

// In bit stream markers and marker segments
pub(crate) const MARKER_SYMBOL_SOP: MarkerSymbol = [255, 145]; // Start of packet
pub(crate) const MARKER_SYMBOL_EPH: MarkerSymbol = [255, 146]; // End of packet header

// Informational marker segments
pub(crate) const MARKER_SYMBOL_CRG: MarkerSymbol = [255, 99]; // Component registration
pub(crate) const MARKER_SYMBOL_COM: MarkerSymbol = [255, 100]; // Comment

// Scod flags, Table A.13
pub(crate) const CODING_STYLE_PRECINCTS_DEFINED: u8 = 0b_0000_0001;
pub(crate) const CODING_STYLE_SOP: u8 = 0b_0000_0010;
pub(crate) const CODING_STYLE_EPH: u8 = 0b_0000_0100;

// Rsiz bit announcing extended (Part 2) capabilities such as split directions.
pub(crate) const CAPABILITY_EXTENDED: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
    // 0000 0000 Layer-resolution level-component-position progression
    LRLCPP,

    // 0000 0001 Resolution level-layer-component-position progression
    RLLCPP,

    // 0000 0010 Resolution level-position-component-layer progression
    RLPCLP,

    // 0000 0011 Position-component-resolution level-layer progression
    PCRLLP,

    // 0000 0100 Component-position-resolution level-layer progression
    CPRLLP,

    // All other values reserved
    Reserved { value: u8 },
}

impl ProgressionOrder {
    pub(crate) fn new(value: u8) -> ProgressionOrder {
        match value {
            0b0000_0000 => ProgressionOrder::LRLCPP,
            0b0000_0001 => ProgressionOrder::RLLCPP,
            0b0000_0010 => ProgressionOrder::RLPCLP,
            0b0000_0011 => ProgressionOrder::PCRLLP,
            0b0000_0100 => ProgressionOrder::CPRLLP,
            _ => ProgressionOrder::Reserved { value },
        }
    }

    pub(crate) fn value(&self) -> u8 {
        match self {
            ProgressionOrder::LRLCPP => 0,
            ProgressionOrder::RLLCPP => 1,
            ProgressionOrder::RLPCLP => 2,
            ProgressionOrder::PCRLLP => 3,
            ProgressionOrder::CPRLLP => 4,
            ProgressionOrder::Reserved { value } => *value,
        }
    }
}

/// Marker followed by the Lxxx length field covering `body_length` bytes.
pub(crate) fn segment_prefix(marker: MarkerSymbol, body_length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(body_length + 4);
    out.extend_from_slice(&marker);
    out.extend_from_slice(&((body_length + 2) as u16).to_be_bytes());
    out
}

fn read_component_index<R: io::Read>(
    reader: &mut R,
    no_components: u16,
) -> Result<u16, Box<dyn error::Error>> {
    // Either 8 or 16 bits depending on Csiz value.
    if no_components < 257 {
        let mut buffer: [u8; 1] = [0; 1];
        reader.read_exact(&mut buffer)?;
        Ok(buffer[0] as u16)
    } else {
        let mut buffer: [u8; 2] = [0; 2];
        reader.read_exact(&mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }
}

fn write_component_index(out: &mut Vec<u8>, component: u16, no_components: u16) {
    if no_components < 257 {
        out.push(component as u8);
    } else {
        out.extend_from_slice(&component.to_be_bytes());
    }
}

// A.5.1
//
// Image and tile size (SIZ)
//
// Provides the reference grid geometry, the tiling of that grid and the
// number, precision and sub-sampling of the image components.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImageAndTileSizeMarkerSegment {
    // Rsiz
    decoder_capabilities: [u8; 2],
    // Xsiz, Ysiz
    reference_grid_width: [u8; 4],
    reference_grid_height: [u8; 4],
    // XOsiz, YOsiz
    image_horizontal_offset: [u8; 4],
    image_vertical_offset: [u8; 4],
    // XTsiz, YTsiz
    reference_tile_width: [u8; 4],
    reference_tile_height: [u8; 4],
    // XTOsiz, YTOsiz
    tile_horizontal_offset: [u8; 4],
    tile_vertical_offset: [u8; 4],
    // Csiz
    no_components: [u8; 2],
    // Ssiz, XRsiz, YRsiz per component
    precision: Vec<u8>,
    horizontal_separation: Vec<u8>,
    vertical_separation: Vec<u8>,
}

impl ImageAndTileSizeMarkerSegment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        capabilities: u16,
        grid: (u32, u32),
        image_offset: (u32, u32),
        tile_size: (u32, u32),
        tile_offset: (u32, u32),
        components: &[(u8, u8, u8)],
    ) -> ImageAndTileSizeMarkerSegment {
        ImageAndTileSizeMarkerSegment {
            decoder_capabilities: capabilities.to_be_bytes(),
            reference_grid_width: grid.0.to_be_bytes(),
            reference_grid_height: grid.1.to_be_bytes(),
            image_horizontal_offset: image_offset.0.to_be_bytes(),
            image_vertical_offset: image_offset.1.to_be_bytes(),
            reference_tile_width: tile_size.0.to_be_bytes(),
            reference_tile_height: tile_size.1.to_be_bytes(),
            tile_horizontal_offset: tile_offset.0.to_be_bytes(),
            tile_vertical_offset: tile_offset.1.to_be_bytes(),
            no_components: (components.len() as u16).to_be_bytes(),
            precision: components.iter().map(|c| c.0).collect(),
            horizontal_separation: components.iter().map(|c| c.1).collect(),
            vertical_separation: components.iter().map(|c| c.2).collect(),
        }
    }

    pub fn decoder_capabilities(&self) -> u16 {
        u16::from_be_bytes(self.decoder_capabilities)
    }
    pub fn reference_grid_width(&self) -> u32 {
        u32::from_be_bytes(self.reference_grid_width)
    }
    pub fn reference_grid_height(&self) -> u32 {
        u32::from_be_bytes(self.reference_grid_height)
    }
    pub fn image_horizontal_offset(&self) -> u32 {
        u32::from_be_bytes(self.image_horizontal_offset)
    }
    pub fn image_vertical_offset(&self) -> u32 {
        u32::from_be_bytes(self.image_vertical_offset)
    }
    pub fn reference_tile_width(&self) -> u32 {
        u32::from_be_bytes(self.reference_tile_width)
    }
    pub fn reference_tile_height(&self) -> u32 {
        u32::from_be_bytes(self.reference_tile_height)
    }
    pub fn tile_horizontal_offset(&self) -> u32 {
        u32::from_be_bytes(self.tile_horizontal_offset)
    }
    pub fn tile_vertical_offset(&self) -> u32 {
        u32::from_be_bytes(self.tile_vertical_offset)
    }
    pub fn no_components(&self) -> u16 {
        u16::from_be_bytes(self.no_components)
    }

    /// Raw Ssiz, XRsiz and YRsiz of component `i`.
    pub(crate) fn component(&self, i: usize) -> (u8, u8, u8) {
        (
            self.precision[i],
            self.horizontal_separation[i],
            self.vertical_separation[i],
        )
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
        offset: u64,
    ) -> Result<ImageAndTileSizeMarkerSegment, Box<dyn error::Error>> {
        info!("SIZ start at byte offset {}", offset);
        let mut segment = ImageAndTileSizeMarkerSegment::default();

        reader.read_exact(&mut segment.decoder_capabilities)?;
        reader.read_exact(&mut segment.reference_grid_width)?;
        reader.read_exact(&mut segment.reference_grid_height)?;
        reader.read_exact(&mut segment.image_horizontal_offset)?;
        reader.read_exact(&mut segment.image_vertical_offset)?;
        reader.read_exact(&mut segment.reference_tile_width)?;
        reader.read_exact(&mut segment.reference_tile_height)?;
        reader.read_exact(&mut segment.tile_horizontal_offset)?;
        reader.read_exact(&mut segment.tile_vertical_offset)?;
        reader.read_exact(&mut segment.no_components)?;

        let no_components = segment.no_components() as usize;
        if no_components == 0 {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_SIZ,
                error: "Csiz must be at least 1".to_string(),
            }
            .into());
        }
        let mut component: [u8; 3] = [0; 3];
        for _ in 0..no_components {
            reader.read_exact(&mut component)?;
            segment.precision.push(component[0]);
            segment.horizontal_separation.push(component[1]);
            segment.vertical_separation.push(component[2]);
        }

        // 0 ≤ XTOsiz ≤ XOsiz and 0 ≤ YTOsiz ≤ YOsiz
        if segment.tile_horizontal_offset() > segment.image_horizontal_offset()
            || segment.tile_vertical_offset() > segment.image_vertical_offset()
        {
            return Err(CodestreamError::TileGridOffsetOverflow {
                tile_horizontal_offset: segment.tile_horizontal_offset(),
                image_horizontal_offset: segment.image_horizontal_offset(),
                tile_vertical_offset: segment.tile_vertical_offset(),
                image_vertical_offset: segment.image_vertical_offset(),
            }
            .into());
        }

        // XTsiz + XTOsiz > XOsiz and YTsiz + YTOsiz > YOsiz, so that tile 0
        // holds at least one image sample.
        if (segment.reference_tile_width() as u64 + segment.tile_horizontal_offset() as u64)
            <= segment.image_horizontal_offset() as u64
            || (segment.reference_tile_height() as u64 + segment.tile_vertical_offset() as u64)
                <= segment.image_vertical_offset() as u64
        {
            return Err(CodestreamError::TileSizeOverflow {
                reference_tile_width: segment.reference_tile_width(),
                tile_horizontal_offset: segment.tile_horizontal_offset(),
                image_horizontal_offset: segment.image_horizontal_offset(),
                reference_tile_height: segment.reference_tile_height(),
                tile_vertical_offset: segment.tile_vertical_offset(),
                image_vertical_offset: segment.image_vertical_offset(),
            }
            .into());
        }

        Ok(segment)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let components = self.precision.len();
        let mut out = segment_prefix(MARKER_SYMBOL_SIZ, 36 + 3 * components);
        out.extend_from_slice(&self.decoder_capabilities);
        out.extend_from_slice(&self.reference_grid_width);
        out.extend_from_slice(&self.reference_grid_height);
        out.extend_from_slice(&self.image_horizontal_offset);
        out.extend_from_slice(&self.image_vertical_offset);
        out.extend_from_slice(&self.reference_tile_width);
        out.extend_from_slice(&self.reference_tile_height);
        out.extend_from_slice(&self.tile_horizontal_offset);
        out.extend_from_slice(&self.tile_vertical_offset);
        out.extend_from_slice(&self.no_components);
        for i in 0..components {
            out.push(self.precision[i]);
            out.push(self.horizontal_separation[i]);
            out.push(self.vertical_separation[i]);
        }
        out
    }
}

// A.4.2
//
// Start of tile-part (SOT)
//
// Tile-parts of one tile appear in TPsot order, possibly interleaved with the
// tile-parts of other tiles.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StartOfTileSegment {
    // Isot
    tile_index: [u8; 2],
    // Psot: bytes from the first byte of the SOT marker to the end of the
    // tile-part data; 0 means "until EOC" and only on the last tile-part.
    tile_length: [u8; 4],
    // TPsot
    tile_part_index: [u8; 1],
    // TNsot: 0 when the tile-part count is not signalled here.
    no_tile_parts: [u8; 1],
}

/// SOT marker plus its fixed-length body.
pub(crate) const SOT_SEGMENT_LENGTH: usize = 12;

impl StartOfTileSegment {
    pub(crate) fn new(tile: u16, length: u32, part: u8, parts: u8) -> StartOfTileSegment {
        StartOfTileSegment {
            tile_index: tile.to_be_bytes(),
            tile_length: length.to_be_bytes(),
            tile_part_index: [part],
            no_tile_parts: [parts],
        }
    }

    pub fn tile_index(&self) -> u16 {
        u16::from_be_bytes(self.tile_index)
    }
    pub fn tile_length(&self) -> u32 {
        u32::from_be_bytes(self.tile_length)
    }
    pub fn tile_part_index(&self) -> u8 {
        self.tile_part_index[0]
    }
    pub fn no_tile_parts(&self) -> u8 {
        self.no_tile_parts[0]
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
    ) -> Result<StartOfTileSegment, Box<dyn error::Error>> {
        let mut segment = StartOfTileSegment::default();

        // LSot
        let mut marker_segment_length: [u8; 2] = [0; 2];
        reader.read_exact(&mut marker_segment_length)?;
        if u16::from_be_bytes(marker_segment_length) != 10 {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_SOT,
                error: format!("Lsot {} is not 10", u16::from_be_bytes(marker_segment_length)),
            }
            .into());
        }

        reader.read_exact(&mut segment.tile_index)?;
        reader.read_exact(&mut segment.tile_length)?;
        reader.read_exact(&mut segment.tile_part_index)?;
        reader.read_exact(&mut segment.no_tile_parts)?;

        Ok(segment)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = segment_prefix(MARKER_SYMBOL_SOT, 8);
        out.extend_from_slice(&self.tile_index);
        out.extend_from_slice(&self.tile_length);
        out.extend_from_slice(&self.tile_part_index);
        out.extend_from_slice(&self.no_tile_parts);
        out
    }
}

// SPcod / SPcoc, Table A.15
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodingStyleParameters {
    no_decomposition_levels: [u8; 1],
    code_block_width: [u8; 1],
    code_block_height: [u8; 1],
    code_block_style: [u8; 1],
    transformation: [u8; 1],
    // One byte per resolution, LL first: PPy in the high nibble, PPx low.
    precinct_size: Vec<u8>,
}

impl CodingStyleParameters {
    pub(crate) fn new(
        levels: u8,
        block_exponents: (u8, u8),
        block_style: u8,
        transformation: u8,
        precincts: Vec<(u8, u8)>,
    ) -> CodingStyleParameters {
        CodingStyleParameters {
            no_decomposition_levels: [levels],
            code_block_width: [block_exponents.0 - 2],
            code_block_height: [block_exponents.1 - 2],
            code_block_style: [block_style],
            transformation: [transformation],
            precinct_size: precincts.iter().map(|(x, y)| (y << 4) | (x & 0x0f)).collect(),
        }
    }

    pub fn no_decomposition_levels(&self) -> u8 {
        self.no_decomposition_levels[0]
    }

    /// Code-block width exponent, xcb.
    pub fn code_block_width(&self) -> u8 {
        self.code_block_width[0] + 2
    }

    pub fn code_block_height(&self) -> u8 {
        self.code_block_height[0] + 2
    }

    pub fn code_block_style(&self) -> u8 {
        self.code_block_style[0]
    }

    pub fn transformation(&self) -> u8 {
        self.transformation[0]
    }

    /// (PPx, PPy) for every resolution, or empty for maximal precincts.
    pub fn precinct_sizes(&self) -> Vec<(u8, u8)> {
        self.precinct_size
            .iter()
            .map(|b| (b & 0x0f, (b >> 4) & 0x0f))
            .collect()
    }

    fn decode<R: io::Read>(
        reader: &mut R,
        precincts_defined: bool,
    ) -> Result<CodingStyleParameters, Box<dyn error::Error>> {
        let mut parameters = CodingStyleParameters::default();
        reader.read_exact(&mut parameters.no_decomposition_levels)?;
        reader.read_exact(&mut parameters.code_block_width)?;
        reader.read_exact(&mut parameters.code_block_height)?;
        reader.read_exact(&mut parameters.code_block_style)?;
        reader.read_exact(&mut parameters.transformation)?;

        if precincts_defined {
            // The first parameter corresponds to the NL LL sub-band, each
            // successive one to the next resolution level.
            parameters.precinct_size = vec![0; parameters.no_decomposition_levels() as usize + 1];
            reader.read_exact(&mut parameters.precinct_size)?;
        }
        Ok(parameters)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.no_decomposition_levels);
        out.extend_from_slice(&self.code_block_width);
        out.extend_from_slice(&self.code_block_height);
        out.extend_from_slice(&self.code_block_style);
        out.extend_from_slice(&self.transformation);
        out.extend_from_slice(&self.precinct_size);
    }

    fn encoded_len(&self) -> usize {
        5 + self.precinct_size.len()
    }
}

// A.6.1
//
// Coding style default (COD)
//
// Default coding style for every component of the image (main header) or of
// a tile (tile-part header).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodingStyleMarkerSegment {
    coding_style: [u8; 1],
    progression_order: [u8; 1],
    no_layers: [u8; 2],
    multiple_component_transformation: [u8; 1],
    coding_style_parameters: CodingStyleParameters,
}

impl CodingStyleMarkerSegment {
    pub(crate) fn new(
        coding_style: u8,
        progression_order: ProgressionOrder,
        layers: u16,
        mct: bool,
        parameters: CodingStyleParameters,
    ) -> CodingStyleMarkerSegment {
        CodingStyleMarkerSegment {
            coding_style: [coding_style],
            progression_order: [progression_order.value()],
            no_layers: layers.to_be_bytes(),
            multiple_component_transformation: [mct as u8],
            coding_style_parameters: parameters,
        }
    }

    pub fn coding_style(&self) -> u8 {
        self.coding_style[0]
    }
    pub fn progression_order(&self) -> ProgressionOrder {
        ProgressionOrder::new(self.progression_order[0])
    }
    pub fn no_layers(&self) -> u16 {
        u16::from_be_bytes(self.no_layers)
    }
    pub fn multiple_component_transformation(&self) -> bool {
        self.multiple_component_transformation[0] == 1
    }
    pub fn coding_style_parameters(&self) -> &CodingStyleParameters {
        &self.coding_style_parameters
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
        offset: u64,
    ) -> Result<CodingStyleMarkerSegment, Box<dyn error::Error>> {
        info!("COD start at byte offset {}", offset);
        let mut segment = CodingStyleMarkerSegment::default();

        reader.read_exact(&mut segment.coding_style)?;
        reader.read_exact(&mut segment.progression_order)?;
        reader.read_exact(&mut segment.no_layers)?;
        reader.read_exact(&mut segment.multiple_component_transformation)?;

        segment.coding_style_parameters = CodingStyleParameters::decode(
            reader,
            segment.coding_style[0] & CODING_STYLE_PRECINCTS_DEFINED != 0,
        )?;
        Ok(segment)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = segment_prefix(
            MARKER_SYMBOL_COD,
            5 + self.coding_style_parameters.encoded_len(),
        );
        out.extend_from_slice(&self.coding_style);
        out.extend_from_slice(&self.progression_order);
        out.extend_from_slice(&self.no_layers);
        out.extend_from_slice(&self.multiple_component_transformation);
        self.coding_style_parameters.encode(&mut out);
        out
    }
}

// A.6.2
//
// Coding style component (COC)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodingStyleComponentSegment {
    component_index: u16,
    coding_style: [u8; 1],
    coding_style_parameters: CodingStyleParameters,
}

impl CodingStyleComponentSegment {
    pub(crate) fn new(
        component_index: u16,
        precincts_defined: bool,
        parameters: CodingStyleParameters,
    ) -> CodingStyleComponentSegment {
        CodingStyleComponentSegment {
            component_index,
            coding_style: [precincts_defined as u8],
            coding_style_parameters: parameters,
        }
    }

    pub fn component_index(&self) -> u16 {
        self.component_index
    }
    pub fn coding_style_parameters(&self) -> &CodingStyleParameters {
        &self.coding_style_parameters
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
        offset: u64,
        no_components: u16,
    ) -> Result<CodingStyleComponentSegment, Box<dyn error::Error>> {
        info!("COC start at byte offset {}", offset);
        let mut segment = CodingStyleComponentSegment {
            component_index: read_component_index(reader, no_components)?,
            ..Default::default()
        };
        reader.read_exact(&mut segment.coding_style)?;
        segment.coding_style_parameters = CodingStyleParameters::decode(
            reader,
            segment.coding_style[0] & CODING_STYLE_PRECINCTS_DEFINED != 0,
        )?;
        Ok(segment)
    }

    pub(crate) fn encode(&self, no_components: u16) -> Vec<u8> {
        let index_len = if no_components < 257 { 1 } else { 2 };
        let mut out = segment_prefix(
            MARKER_SYMBOL_COC,
            index_len + 1 + self.coding_style_parameters.encoded_len(),
        );
        write_component_index(&mut out, self.component_index, no_components);
        out.extend_from_slice(&self.coding_style);
        self.coding_style_parameters.encode(&mut out);
        out
    }
}

// A.6.4, A.6.5
//
// Quantization default (QCD) and quantization component (QCC). The structure
// layer carries the step sizes through untouched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QuantizationSegment {
    component_index: Option<u16>,
    quantization_style: [u8; 1],
    values: Vec<u8>,
}

impl QuantizationSegment {
    /// Reversible quantization: one exponent byte per subband.
    pub(crate) fn reversible(guard_bits: u8, exponents: &[u8]) -> QuantizationSegment {
        QuantizationSegment {
            component_index: None,
            quantization_style: [guard_bits << 5],
            values: exponents.iter().map(|e| e << 3).collect(),
        }
    }

    /// Scalar expounded quantization: exponent and mantissa per subband.
    pub(crate) fn expounded(guard_bits: u8, steps: &[(u8, u16)]) -> QuantizationSegment {
        let mut values = Vec::with_capacity(steps.len() * 2);
        for (exponent, mantissa) in steps {
            let step = ((*exponent as u16) << 11) | (mantissa & 0x07ff);
            values.extend_from_slice(&step.to_be_bytes());
        }
        QuantizationSegment {
            component_index: None,
            quantization_style: [(guard_bits << 5) | 2],
            values,
        }
    }

    pub fn guard_bits(&self) -> u8 {
        self.quantization_style[0] >> 5
    }

    pub fn quantization_style(&self) -> u8 {
        self.quantization_style[0] & 0x1f
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
        body_length: usize,
        component: Option<u16>,
    ) -> Result<QuantizationSegment, Box<dyn error::Error>> {
        let mut segment = QuantizationSegment {
            component_index: component,
            ..Default::default()
        };
        reader.read_exact(&mut segment.quantization_style)?;
        reader.read_to_end(&mut segment.values)?;
        if segment.values.len() + 1 > body_length {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_QCD,
                error: "quantization values overrun the segment".to_string(),
            }
            .into());
        }
        Ok(segment)
    }

    pub(crate) fn decode_component<R: io::Read>(
        reader: &mut R,
        body_length: usize,
        no_components: u16,
    ) -> Result<QuantizationSegment, Box<dyn error::Error>> {
        let component = read_component_index(reader, no_components)?;
        QuantizationSegment::decode(reader, body_length, Some(component))
    }

    pub(crate) fn encode(&self, no_components: u16) -> Vec<u8> {
        match self.component_index {
            None => {
                let mut out = segment_prefix(MARKER_SYMBOL_QCD, 1 + self.values.len());
                out.extend_from_slice(&self.quantization_style);
                out.extend_from_slice(&self.values);
                out
            }
            Some(component) => {
                let index_len = if no_components < 257 { 1 } else { 2 };
                let mut out =
                    segment_prefix(MARKER_SYMBOL_QCC, index_len + 1 + self.values.len());
                write_component_index(&mut out, component, no_components);
                out.extend_from_slice(&self.quantization_style);
                out.extend_from_slice(&self.values);
                out
            }
        }
    }

    pub(crate) fn with_component(mut self, component: u16) -> QuantizationSegment {
        self.component_index = Some(component);
        self
    }
}

// A.7.1
//
// Tile-part lengths (TLM)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TilePartLengthsSegment {
    index: u8,
    // Tile index (None when tiles are implicitly in order) and Ptlm.
    entries: Vec<(Option<u16>, u32)>,
}

impl TilePartLengthsSegment {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn entries(&self) -> &[(Option<u16>, u32)] {
        &self.entries
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
        body_length: usize,
    ) -> Result<TilePartLengthsSegment, Box<dyn error::Error>> {
        let mut segment = TilePartLengthsSegment::default();
        let mut buffer: [u8; 1] = [0; 1];
        reader.read_exact(&mut buffer)?;
        segment.index = buffer[0];
        // Stlm: ST in bits 4-5, SP in bit 6
        reader.read_exact(&mut buffer)?;
        let tile_bytes = ((buffer[0] >> 4) & 0b11) as usize;
        let length_bytes = if buffer[0] & 0b0100_0000 != 0 { 4 } else { 2 };
        if tile_bytes == 3 {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_TLM,
                error: "reserved ST value".to_string(),
            }
            .into());
        }

        let entry_length = tile_bytes + length_bytes;
        let count = (body_length.saturating_sub(2)) / entry_length;
        for _ in 0..count {
            let tile = match tile_bytes {
                0 => None,
                1 => {
                    let mut value: [u8; 1] = [0; 1];
                    reader.read_exact(&mut value)?;
                    Some(value[0] as u16)
                }
                _ => {
                    let mut value: [u8; 2] = [0; 2];
                    reader.read_exact(&mut value)?;
                    Some(u16::from_be_bytes(value))
                }
            };
            let length = if length_bytes == 2 {
                let mut value: [u8; 2] = [0; 2];
                reader.read_exact(&mut value)?;
                u16::from_be_bytes(value) as u32
            } else {
                let mut value: [u8; 4] = [0; 4];
                reader.read_exact(&mut value)?;
                u32::from_be_bytes(value)
            };
            segment.entries.push((tile, length));
        }
        Ok(segment)
    }
}

// A.7.4, A.7.5
//
// Packed packet headers, main header (PPM) and tile-part header (PPT).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PackedPacketHeaderSegment {
    index: u8,
    data: Vec<u8>,
}

impl PackedPacketHeaderSegment {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
    ) -> Result<PackedPacketHeaderSegment, Box<dyn error::Error>> {
        let mut segment = PackedPacketHeaderSegment::default();
        let mut index: [u8; 1] = [0; 1];
        reader.read_exact(&mut index)?;
        segment.index = index[0];
        reader.read_to_end(&mut segment.data)?;
        Ok(segment)
    }
}

/// Splits concatenated PPM data into one packet-header stream per tile-part,
/// in codestream order. Each stream is prefixed by its 4-byte Nppm length.
pub(crate) fn split_packed_headers(
    segments: &[PackedPacketHeaderSegment],
) -> Result<Vec<Vec<u8>>, Box<dyn error::Error>> {
    let mut ordered: Vec<&PackedPacketHeaderSegment> = segments.iter().collect();
    ordered.sort_by_key(|segment| segment.index);
    let data: Vec<u8> = ordered
        .iter()
        .flat_map(|segment| segment.data.iter().copied())
        .collect();

    let mut chunks = vec![];
    let mut position = 0;
    while position < data.len() {
        if position + 4 > data.len() {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_PPM,
                error: "truncated Nppm field".to_string(),
            }
            .into());
        }
        let mut length: [u8; 4] = [0; 4];
        length.copy_from_slice(&data[position..position + 4]);
        let length = u32::from_be_bytes(length) as usize;
        position += 4;
        if position + length > data.len() {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_PPM,
                error: "packed headers overrun the PPM data".to_string(),
            }
            .into());
        }
        chunks.push(data[position..position + length].to_vec());
        position += length;
    }
    Ok(chunks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentRegistrationValue {
    Binary,
    Latin,
    Reserved { value: [u8; 2] },
}

impl CommentRegistrationValue {
    fn new(value: [u8; 2]) -> CommentRegistrationValue {
        match u16::from_be_bytes(value) {
            0 => CommentRegistrationValue::Binary,
            1 => CommentRegistrationValue::Latin,
            _ => CommentRegistrationValue::Reserved { value },
        }
    }
}

// A.9.2
//
// Comment (COM)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommentMarkerSegment {
    registration_value: [u8; 2],
    comment: Vec<u8>,
}

impl CommentMarkerSegment {
    pub(crate) fn latin(text: &str) -> CommentMarkerSegment {
        CommentMarkerSegment {
            registration_value: [0, 1],
            comment: text.as_bytes().to_vec(),
        }
    }

    pub fn registration_value(&self) -> CommentRegistrationValue {
        CommentRegistrationValue::new(self.registration_value)
    }

    pub fn comment_utf8(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(&self.comment)
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
    ) -> Result<CommentMarkerSegment, Box<dyn error::Error>> {
        let mut segment = CommentMarkerSegment::default();
        reader.read_exact(&mut segment.registration_value)?;
        reader.read_to_end(&mut segment.comment)?;
        Ok(segment)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = segment_prefix(MARKER_SYMBOL_COM, 2 + self.comment.len());
        out.extend_from_slice(&self.registration_value);
        out.extend_from_slice(&self.comment);
        out
    }
}

// Decomposition split directions (DFS), one code per decomposition level,
// finest level first: 1 = both directions, 2 = horizontal only, 3 = vertical
// only.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecompositionSplitSegment {
    index: [u8; 2],
    directions: Vec<u8>,
}

impl DecompositionSplitSegment {
    pub(crate) fn new(directions: Vec<u8>) -> DecompositionSplitSegment {
        DecompositionSplitSegment {
            index: [0, 0],
            directions,
        }
    }

    pub fn directions(&self) -> &[u8] {
        &self.directions
    }

    pub(crate) fn decode<R: io::Read>(
        reader: &mut R,
    ) -> Result<DecompositionSplitSegment, Box<dyn error::Error>> {
        let mut segment = DecompositionSplitSegment::default();
        reader.read_exact(&mut segment.index)?;
        let mut count: [u8; 1] = [0; 1];
        reader.read_exact(&mut count)?;
        segment.directions = vec![0; count[0] as usize];
        reader.read_exact(&mut segment.directions)?;
        if let Some(direction) = segment.directions.iter().find(|d| !(1..=3).contains(*d)) {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_DFS,
                error: format!("unknown split direction {}", direction),
            }
            .into());
        }
        Ok(segment)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = segment_prefix(MARKER_SYMBOL_DFS, 3 + self.directions.len());
        out.extend_from_slice(&self.index);
        out.push(self.directions.len() as u8);
        out.extend_from_slice(&self.directions);
        out
    }
}

/// Reads the body of a marker segment whose marker has already been
/// consumed; `None` if the source ran dry first.
pub(crate) fn read_segment_body<R: io::Read>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, Box<dyn error::Error>> {
    let mut length: [u8; 2] = [0; 2];
    if read_fully(reader, &mut length)? < 2 {
        return Ok(None);
    }
    let length = u16::from_be_bytes(length) as usize;
    if length < 2 {
        return Err(CodestreamError::MarkerError {
            marker: [0, 0],
            error: format!("segment length {} below minimum", length),
        }
        .into());
    }
    let mut body = vec![0; length - 2];
    if read_fully(reader, &mut body)? < body.len() {
        return Ok(None);
    }
    Ok(Some(body))
}

fn read_fully<R: io::Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_siz_rejects_tile_offset_beyond_image_offset() {
        let segment = ImageAndTileSizeMarkerSegment::new(
            0,
            (64, 64),
            (4, 4),
            (32, 32),
            (8, 0),
            &[(7, 1, 1)],
        );
        let bytes = segment.encode();
        let result = ImageAndTileSizeMarkerSegment::decode(&mut Cursor::new(&bytes[4..]), 0);
        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CodestreamError>(),
            Some(CodestreamError::TileGridOffsetOverflow { .. })
        ));
    }

    #[test]
    fn test_cod_precinct_nibbles() {
        let parameters = CodingStyleParameters::new(2, (6, 5), 0, 1, vec![(7, 6), (8, 8), (15, 15)]);
        let segment =
            CodingStyleMarkerSegment::new(1, ProgressionOrder::RLPCLP, 3, false, parameters);
        let bytes = segment.encode();
        assert_eq!(&bytes[0..2], &MARKER_SYMBOL_COD);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len() - 2);
        let decoded = CodingStyleMarkerSegment::decode(&mut Cursor::new(&bytes[4..]), 0).unwrap();
        assert_eq!(decoded.progression_order(), ProgressionOrder::RLPCLP);
        assert_eq!(decoded.no_layers(), 3);
        let decoded_parameters = decoded.coding_style_parameters();
        assert_eq!(decoded_parameters.code_block_width(), 6);
        assert_eq!(decoded_parameters.code_block_height(), 5);
        assert_eq!(
            decoded_parameters.precinct_sizes(),
            vec![(7, 6), (8, 8), (15, 15)]
        );
    }

    #[test]
    fn test_split_packed_headers() {
        let first = PackedPacketHeaderSegment {
            index: 1,
            data: vec![0, 0, 0, 1, 0xcc],
        };
        let zeroth = PackedPacketHeaderSegment {
            index: 0,
            data: vec![0, 0, 0, 2, 0xaa, 0xbb],
        };
        let chunks = split_packed_headers(&[first, zeroth]).unwrap();
        assert_eq!(chunks, vec![vec![0xaa, 0xbb], vec![0xcc]]);
    }
}
