use std::error;
use std::fmt;

mod block;
mod codestream;
mod geometry;
mod input;
mod kernels;
mod markers;
mod output;
mod packet;
mod params;
mod precinct;
mod rate;
mod source;
mod tag_tree;
mod thread_env;
mod tile;

pub use block::{Block, Orientation};
pub use codestream::{
    Codestream, ComponentAccess, FlushOptions, Mode, Precinct, Resolution, Subband, Tile,
    TileComp, ViewRestrictions,
};
pub use geometry::{Appearance, Coords, Rect};
pub use kernels::{Kernel, KernelId, LiftingStep};
pub use markers::{MarkerSymbol, ProgressionOrder};
pub use params::{CodingParams, ComponentSize, Params, SizParams, Split};
pub use source::{
    Capabilities, CompressedSource, CompressedTarget, FileSource, FileTarget, MemorySource,
    MemoryTarget, Scope, SimulatedTarget, StreamSource, StreamTarget,
};
pub use thread_env::{LockId, ThreadEnv};

/// Version of the codestream engine, as recorded in generated comments.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub enum CodestreamError {
    MarkerError {
        marker: MarkerSymbol,
        error: String,
    },
    MarkerMissing {
        marker: MarkerSymbol,
    },
    MarkerUnexpected {
        marker: MarkerSymbol,
        offset: u64,
    },
    TileSizeOverflow {
        image_horizontal_offset: u32,
        image_vertical_offset: u32,
        tile_horizontal_offset: u32,
        tile_vertical_offset: u32,
        reference_tile_width: u32,
        reference_tile_height: u32,
    },
    TileGridOffsetOverflow {
        tile_horizontal_offset: u32,
        tile_vertical_offset: u32,
        image_horizontal_offset: u32,
        image_vertical_offset: u32,
    },
    InvalidParams {
        reason: String,
    },
    ParamsNotFinalized,
    WrongMode {
        operation: &'static str,
        mode: Mode,
    },
    MainHeaderIncomplete,
    Truncated {
        offset: u64,
    },
    Unsupported {
        feature: String,
    },
    TileOutOfRange {
        index: Coords,
    },
    TileNotOpen {
        tile: u32,
    },
    TileUnavailable {
        tile: u32,
    },
    ComponentOutOfRange {
        index: usize,
    },
    ResolutionOutOfRange {
        index: usize,
    },
    SubbandOutOfRange {
        index: usize,
    },
    PrecinctOutOfRange {
        index: Coords,
    },
    BlockOutOfRange {
        index: Coords,
    },
    BlockAlreadyOpened {
        tile: u32,
        component: u16,
        resolution: u8,
        band: u8,
        index: Coords,
    },
    InvalidBlock {
        reason: String,
    },
    RestrictionsWhileTilesOpen,
    FlipUnsupported {
        tile: u32,
        component: u16,
    },
    TilePartLimit {
        tile: u32,
    },
    PacketMalformed {
        tile: u32,
        reason: String,
    },
    WriteFailed,
    LockOutOfRange {
        index: u8,
    },
}

impl error::Error for CodestreamError {}
impl fmt::Display for CodestreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MarkerError { marker, error } => {
                write!(
                    f,
                    "marker 0x{:0>2X?}{:0>2X?} error {:?}",
                    marker[0], marker[1], error
                )
            }
            Self::MarkerMissing { marker } => {
                write!(f, "missing marker 0x{:0>2X?}{:0>2X?}", marker[0], marker[1])
            }
            Self::MarkerUnexpected { marker, offset } => {
                write!(
                    f,
                    "unexpected marker 0x{:0>2X?}{:0>2X?} at byte offset {}",
                    marker[0], marker[1], offset
                )
            }
            Self::TileGridOffsetOverflow {
                image_horizontal_offset,
                image_vertical_offset,
                tile_horizontal_offset,
                tile_vertical_offset,
            } => {
                write!(
                    f,
                    "tile grid offset overflow: XOSiz = {:?}, YOsiz = {:?}, XTOsiz = {:?}, YTOsiz = {:?}",
                    image_horizontal_offset,
                    image_vertical_offset,
                    tile_horizontal_offset,
                    tile_vertical_offset,
                )
            }
            Self::TileSizeOverflow {
                image_horizontal_offset,
                image_vertical_offset,
                tile_horizontal_offset,
                tile_vertical_offset,
                reference_tile_width,
                reference_tile_height,
            } => {
                write!(
                    f,
                    "tile size overflow: XOSiz = {:?}, YOsiz = {:?}, XTOsiz = {:?}, YTOsiz = {:?}, XTsize = {:?}, YTsize = {:?}",
                    image_horizontal_offset,
                    image_vertical_offset,
                    tile_horizontal_offset,
                    tile_vertical_offset,
                    reference_tile_width,
                    reference_tile_height,
                )
            }
            Self::InvalidParams { reason } => write!(f, "invalid coding parameters: {}", reason),
            Self::ParamsNotFinalized => {
                write!(f, "coding parameters must be finalized before tiles are opened")
            }
            Self::WrongMode { operation, mode } => {
                write!(f, "{} is not available on a codestream in {:?} mode", operation, mode)
            }
            Self::MainHeaderIncomplete => {
                write!(f, "main header is not yet completely available")
            }
            Self::Truncated { offset } => {
                write!(f, "codestream truncated at byte offset {}", offset)
            }
            Self::Unsupported { feature } => write!(f, "unsupported feature: {}", feature),
            Self::TileOutOfRange { index } => {
                write!(f, "tile index ({}, {}) outside the valid tile range", index.x, index.y)
            }
            Self::TileNotOpen { tile } => write!(f, "tile {} is not open", tile),
            Self::TileUnavailable { tile } => {
                write!(f, "tile {} has been closed and cannot be reopened", tile)
            }
            Self::ComponentOutOfRange { index } => {
                write!(f, "component {} outside the visible component range", index)
            }
            Self::ResolutionOutOfRange { index } => {
                write!(f, "resolution {} outside the visible resolution range", index)
            }
            Self::SubbandOutOfRange { index } => {
                write!(f, "subband {} does not exist at this resolution", index)
            }
            Self::PrecinctOutOfRange { index } => {
                write!(f, "precinct index ({}, {}) outside the valid range", index.x, index.y)
            }
            Self::BlockOutOfRange { index } => {
                write!(f, "block index ({}, {}) outside the valid range", index.x, index.y)
            }
            Self::BlockAlreadyOpened {
                tile,
                component,
                resolution,
                band,
                index,
            } => {
                write!(
                    f,
                    "block ({}, {}) of tile {}, component {}, resolution {}, band {} was already opened",
                    index.x, index.y, tile, component, resolution, band
                )
            }
            Self::InvalidBlock { reason } => write!(f, "invalid code-block: {}", reason),
            Self::RestrictionsWhileTilesOpen => {
                write!(f, "view restrictions cannot change while tiles are open")
            }
            Self::FlipUnsupported { tile, component } => {
                write!(
                    f,
                    "decomposition structure of tile {}, component {} cannot be flipped",
                    tile, component
                )
            }
            Self::TilePartLimit { tile } => {
                write!(f, "tile {} would need more than 255 tile-parts", tile)
            }
            Self::PacketMalformed { tile, reason } => {
                write!(f, "malformed packet in tile {}: {}", tile, reason)
            }
            Self::LockOutOfRange { index } => {
                write!(f, "application lock {} does not exist", index)
            }
            Self::WriteFailed => write!(f, "compressed target refused data"),
        }
    }
}
