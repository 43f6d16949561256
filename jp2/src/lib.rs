use std::error;
use std::fmt;

mod boxes;
mod cache;
mod family;
mod file;
mod input_box;
mod locator;
mod output_box;

pub use boxes::{
    BitDepth, BitsPerComponentBox, CaptureResolutionBox, Channel, ChannelDefinitionBox,
    ChannelTypes, ColourSpecificationBox, ColourSpecificationMethods, ComponentMap,
    ComponentMapType, ComponentMappingBox, DefaultDisplayResolutionBox, FileTypeBox,
    GeneratedComponent, HeaderSuperBox, ImageHeaderBox, JBox, PaletteBox, ResolutionSuperBox,
    SignatureBox, ENUMERATED_COLOUR_SPACE_GREYSCALE, ENUMERATED_COLOUR_SPACE_SRGB,
    ENUMERATED_COLOUR_SPACE_SYCC,
};
pub use cache::{BinClass, Cache};
pub use family::{ContainerSource, ContainerTarget};
pub use file::{Jp2Source, Jp2Target};
pub use input_box::BoxReader;
pub use locator::BoxLocator;
pub use output_box::BoxWriter;

#[derive(Debug)]
pub enum JP2Error {
    InvalidSignature {
        signature: [u8; 4],
        offset: u64,
    },
    InvalidBrand {
        brand: [u8; 4],
        offset: u64,
    },
    NotCompatible {
        compatibility_list: Vec<String>,
    },
    BoxUnexpected {
        box_type: BoxType,
        offset: u64,
    },
    BoxDuplicate {
        box_type: BoxType,
        offset: u64,
    },
    BoxMalformed {
        box_type: BoxType,
        offset: u64,
        reason: String,
    },
    BoxMissing {
        box_type: BoxType,
    },
    BoxLengthReserved {
        length: u32,
        offset: u64,
    },
    BoxLocked {
        box_type: BoxType,
    },
    BoxNotOpen,
    ReaderAlreadyOpen {
        box_type: BoxType,
    },
    PlaceholderMalformed {
        bin_id: u64,
        reason: String,
    },
    SeekBackwards {
        position: u64,
        requested: u64,
    },
    LocatorMismatch {
        reason: String,
    },
    RubberNotLast,
}

impl error::Error for JP2Error {}
impl fmt::Display for JP2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidSignature { signature, offset } => {
                write!(
                    f,
                    "invalid signature {:?} at offset {}",
                    String::from_utf8_lossy(signature),
                    offset
                )
            }
            Self::InvalidBrand { brand, offset } => {
                write!(
                    f,
                    "invalid brand {:?} at offset {}",
                    String::from_utf8_lossy(brand),
                    offset
                )
            }
            Self::NotCompatible { compatibility_list } => {
                write!(
                    f,
                    "'jp2 ' not found in compatibility list '{}'",
                    compatibility_list.join(", ")
                )
            }
            Self::BoxDuplicate { box_type, offset } => {
                write!(
                    f,
                    "unexpected duplicate box type {} at offset {}",
                    box_type_name(box_type),
                    offset
                )
            }
            Self::BoxUnexpected { box_type, offset } => {
                write!(
                    f,
                    "unexpected box type {} at offset {}",
                    box_type_name(box_type),
                    offset
                )
            }
            Self::BoxMalformed {
                box_type,
                offset,
                reason,
            } => {
                write!(
                    f,
                    "malformed box type {} at offset {}: {}",
                    box_type_name(box_type),
                    offset,
                    reason
                )
            }
            Self::BoxMissing { box_type } => {
                write!(f, "box type {} missing", box_type_name(box_type))
            }
            Self::BoxLengthReserved { length, offset } => {
                write!(f, "reserved box length {} at offset {}", length, offset)
            }
            Self::BoxLocked { box_type } => {
                write!(
                    f,
                    "box {} is locked by an open sub-box",
                    box_type_name(box_type)
                )
            }
            Self::BoxNotOpen => write!(f, "box is not open"),
            Self::ReaderAlreadyOpen { box_type } => {
                write!(
                    f,
                    "box reader still holds an open {} box",
                    box_type_name(box_type)
                )
            }
            Self::PlaceholderMalformed { bin_id, reason } => {
                write!(f, "malformed placeholder in data-bin {}: {}", bin_id, reason)
            }
            Self::SeekBackwards {
                position,
                requested,
            } => {
                write!(
                    f,
                    "sequential source at byte {} cannot go back to byte {}",
                    position, requested
                )
            }
            Self::LocatorMismatch { reason } => write!(f, "unusable box locator: {}", reason),
            Self::RubberNotLast => {
                write!(f, "no box may follow a top-level box of unbounded length")
            }
        }
    }
}

pub type BoxType = [u8; 4];

// jP\040\040 (0x6A50 2020)
pub const BOX_TYPE_SIGNATURE: BoxType = [106, 80, 32, 32];
pub const BOX_TYPE_FILE_TYPE: BoxType = [102, 116, 121, 112];
pub const BOX_TYPE_HEADER: BoxType = [106, 112, 50, 104];
pub const BOX_TYPE_IMAGE_HEADER: BoxType = [105, 104, 100, 114];
pub const BOX_TYPE_BITS_PER_COMPONENT: BoxType = [98, 112, 99, 99];
pub const BOX_TYPE_COLOUR_SPECIFICATION: BoxType = [99, 111, 108, 114];
pub const BOX_TYPE_PALETTE: BoxType = [112, 99, 108, 114];
pub const BOX_TYPE_COMPONENT_MAPPING: BoxType = [99, 109, 97, 112];
pub const BOX_TYPE_CHANNEL_DEFINITION: BoxType = [99, 100, 101, 102];
pub const BOX_TYPE_RESOLUTION: BoxType = [114, 101, 115, 32];
pub const BOX_TYPE_CAPTURE_RESOLUTION: BoxType = [114, 101, 115, 99];
pub const BOX_TYPE_DEFAULT_DISPLAY_RESOLUTION: BoxType = [114, 101, 115, 100];
pub const BOX_TYPE_CONTIGUOUS_CODESTREAM: BoxType = [106, 112, 50, 99];
// phld (0x7068 6C64)
pub const BOX_TYPE_PLACEHOLDER: BoxType = [112, 104, 108, 100];

/// Box types whose contents are a sequence of sub-boxes.
pub fn is_super_box(box_type: BoxType) -> bool {
    matches!(box_type, BOX_TYPE_HEADER | BOX_TYPE_RESOLUTION)
}

/// Four character code of a box type, with unprintable bytes escaped.
pub fn box_type_name(box_type: &BoxType) -> String {
    box_type
        .iter()
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                (*b as char).to_string()
            } else {
                format!("\\x{:02x}", b)
            }
        })
        .collect()
}
