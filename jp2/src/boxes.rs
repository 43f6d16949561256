use jpc::SizParams;
use log::{debug, info, warn};
use std::error;
use std::fmt;
use std::io::Read;

use crate::input_box::BoxReader;
use crate::output_box::BoxWriter;
use crate::{
    box_type_name, BoxType, JP2Error, BOX_TYPE_BITS_PER_COMPONENT, BOX_TYPE_CAPTURE_RESOLUTION,
    BOX_TYPE_CHANNEL_DEFINITION, BOX_TYPE_COLOUR_SPECIFICATION, BOX_TYPE_COMPONENT_MAPPING,
    BOX_TYPE_DEFAULT_DISPLAY_RESOLUTION, BOX_TYPE_FILE_TYPE, BOX_TYPE_HEADER,
    BOX_TYPE_IMAGE_HEADER, BOX_TYPE_PALETTE, BOX_TYPE_RESOLUTION, BOX_TYPE_SIGNATURE,
};

// jp2\040
const BRAND_JP2: [u8; 4] = [106, 112, 50, 32];

// <CR><LF><0x87><LF>
const SIGNATURE_MAGIC: [u8; 4] = [13, 10, 135, 10];

const COMPRESSION_TYPE_WAVELET: u8 = 7;

/// Largest leaf box decoded into memory.
const MAX_LEAF_BYTES: u64 = 1 << 24;

pub const ENUMERATED_COLOUR_SPACE_SRGB: u32 = 16;
pub const ENUMERATED_COLOUR_SPACE_GREYSCALE: u32 = 17;
pub const ENUMERATED_COLOUR_SPACE_SYCC: u32 = 18;

/// All information contained within a JP2 file is encapsulated in boxes.
///
/// Decoding works on an open [`BoxReader`]. A box whose contents have not
/// all arrived yet decodes to `Ok(false)`, and may be decoded again from a
/// freshly opened reader once more data is available.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.4.
pub trait JBox {
    fn identifier(&self) -> BoxType;
    fn length(&self) -> u64;
    fn offset(&self) -> u64;

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>>;
}

/// Total length and file offset of the box `reader` has open.
fn placement(reader: &BoxReader<'_>) -> (u64, u64) {
    let offset = reader.locator().file_pos().unwrap_or(0);
    (reader.box_bytes().unwrap_or(0), offset)
}

/// Pulls a leaf box into memory. Returns the contents length, or `None`
/// while the contents are incomplete.
fn load_leaf(reader: &mut BoxReader<'_>) -> Result<Option<usize>, Box<dyn error::Error>> {
    if !reader.load_in_memory(MAX_LEAF_BYTES)? {
        if reader.is_complete() {
            return Err(JP2Error::BoxMalformed {
                box_type: reader.box_type(),
                offset: reader.locator().file_pos().unwrap_or(0),
                reason: format!("contents exceed {} bytes", MAX_LEAF_BYTES),
            }
            .into());
        }
        return Ok(None);
    }
    Ok(reader.access_memory().map(|m| m.len()))
}

fn truncated(reader: &BoxReader<'_>, wanted: usize) -> Box<dyn error::Error> {
    JP2Error::BoxMalformed {
        box_type: reader.box_type(),
        offset: reader.locator().file_pos().unwrap_or(0),
        reason: format!("expected at least {} bytes of contents", wanted),
    }
    .into()
}

/// JPEG 2000 Signature box.
///
/// The Signature box identifies that the format of this file was defined by
/// the JPEG 2000 Recommendation | International Standard. It shall be the
/// first box in the file, and its contents are the fixed string
/// 0x0D0A 870A.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.1.
#[derive(Debug, Default)]
pub struct SignatureBox {
    length: u64,
    offset: u64,
}

impl SignatureBox {
    pub fn signature(&self) -> [u8; 4] {
        SIGNATURE_MAGIC
    }

    pub fn encode(&self) -> Vec<u8> {
        SIGNATURE_MAGIC.to_vec()
    }
}

impl JBox for SignatureBox {
    // The type of the JPEG 2000 Signature box shall be ‘jP\040\040’ (0x6A50 2020)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_SIGNATURE
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };

        let mut buffer: [u8; 4] = [0; 4];
        if length != buffer.len() {
            return Err(JP2Error::InvalidSignature {
                signature: buffer,
                offset: self.offset,
            }
            .into());
        }
        reader.read_exact(&mut buffer)?;

        if buffer != SIGNATURE_MAGIC {
            return Err(JP2Error::InvalidSignature {
                signature: buffer,
                offset: self.offset,
            }
            .into());
        };

        Ok(true)
    }
}

type CompatibilityList = Vec<[u8; 4]>;

/// File Type box.
///
/// Names the standard which completely defines this file, along with the
/// list of readers which can interpret it. It immediately follows the
/// Signature box.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.2.
#[derive(Debug, Default)]
pub struct FileTypeBox {
    length: u64,
    offset: u64,
    brand: [u8; 4],
    min_version: [u8; 4],
    compatibility_list: CompatibilityList,
}

impl FileTypeBox {
    /// A plain JP2 file type: brand and sole compatibility entry ‘jp2\040’.
    pub fn jp2() -> FileTypeBox {
        FileTypeBox {
            brand: BRAND_JP2,
            compatibility_list: vec![BRAND_JP2],
            ..Default::default()
        }
    }

    /// Brand.
    ///
    /// If the value of the Brand field is not ‘jp2\040’, then a value of
    /// ‘jp2\040’ in the Compatibility list indicates that a JP2 reader can
    /// interpret the file in some manner as intended by the creator of the
    /// file.
    pub fn brand(&self) -> String {
        String::from_utf8_lossy(&self.brand).into_owned()
    }

    /// Minor version. Should be zero, but readers carry on regardless.
    pub fn min_version(&self) -> u32 {
        u32::from_be_bytes(self.min_version)
    }

    pub fn compatibility_list(&self) -> Vec<String> {
        self.compatibility_list
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut contents = Vec::with_capacity(8 + 4 * self.compatibility_list.len());
        contents.extend_from_slice(&self.brand);
        contents.extend_from_slice(&self.min_version);
        for entry in &self.compatibility_list {
            contents.extend_from_slice(entry);
        }
        contents
    }
}

impl JBox for FileTypeBox {
    // The type of the File Type Box shall be ‘ftyp’ (0x6674 7970).
    fn identifier(&self) -> BoxType {
        BOX_TYPE_FILE_TYPE
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };
        if length < 8 || length % 4 != 0 {
            return Err(JP2Error::BoxMalformed {
                box_type: BOX_TYPE_FILE_TYPE,
                offset: self.offset,
                reason: format!("contents length {} is not 8 plus a multiple of 4", length),
            }
            .into());
        }

        reader.read_exact(&mut self.brand)?;
        if !self.brand.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(JP2Error::InvalidBrand {
                brand: self.brand,
                offset: self.offset,
            }
            .into());
        }
        reader.read_exact(&mut self.min_version)?;
        if self.min_version() != 0 {
            debug!("File type minor version {}", self.min_version());
        }

        // The number of CL fields is determined by the length of this box
        let mut buffer: [u8; 4] = [0; 4];
        self.compatibility_list.clear();
        for _ in 0..(length - 8) / 4 {
            reader.read_exact(&mut buffer)?;
            self.compatibility_list.push(buffer);
        }

        // All conforming readers shall properly interpret all files with
        // ‘jp2\040’ in one of the CL fields.
        if !self.compatibility_list.contains(&BRAND_JP2) {
            return Err(JP2Error::NotCompatible {
                compatibility_list: self.compatibility_list(),
            }
            .into());
        }
        if self.brand != BRAND_JP2 {
            info!("Reading {} file as JP2", self.brand());
        }

        Ok(true)
    }
}

/// JP2 Header box (superbox).
///
/// Generic information about the file, such as number of components,
/// colourspace, and grid resolution. The Image Header box comes first;
/// every other box may follow in any order. At least one Colour
/// Specification box is required, and all but the first are ignored by
/// conforming readers.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.
#[derive(Debug, Default)]
pub struct HeaderSuperBox {
    length: u64,
    offset: u64,
    pub image_header_box: ImageHeaderBox,
    pub bits_per_component_box: Option<BitsPerComponentBox>,
    pub colour_specification_boxes: Vec<ColourSpecificationBox>,
    pub palette_box: Option<PaletteBox>,
    pub component_mapping_box: Option<ComponentMappingBox>,
    pub channel_definition_box: Option<ChannelDefinitionBox>,
    pub resolution_box: Option<ResolutionSuperBox>,
}

impl HeaderSuperBox {
    /// Header describing a codestream with the given dimensions, in one
    /// enumerated colourspace.
    pub fn from_siz(siz: &SizParams, colour_space: u32) -> HeaderSuperBox {
        let depths: Vec<u8> = siz
            .components
            .iter()
            .map(|c| BitDepth::encode(c.precision, c.signed))
            .collect();
        let uniform = depths.windows(2).all(|w| w[0] == w[1]);
        let bits = match depths.first() {
            Some(depth) if uniform => *depth,
            _ => 255,
        };
        let image_header_box = ImageHeaderBox {
            height: (siz.image.size.y as u32).to_be_bytes(),
            width: (siz.image.size.x as u32).to_be_bytes(),
            components_num: (siz.components.len() as u16).to_be_bytes(),
            components_bits: [bits],
            compression_type: [COMPRESSION_TYPE_WAVELET],
            ..Default::default()
        };
        let bits_per_component_box = if bits == 255 {
            Some(BitsPerComponentBox {
                bits_per_component: depths,
                ..Default::default()
            })
        } else {
            None
        };
        HeaderSuperBox {
            image_header_box,
            bits_per_component_box,
            colour_specification_boxes: vec![ColourSpecificationBox::enumerated(colour_space)],
            ..Default::default()
        }
    }

    /// Writes the image header, bit depths and colour specifications as
    /// sub-boxes of `parent`.
    pub fn write(&self, parent: &mut BoxWriter<'_>) -> Result<(), Box<dyn error::Error>> {
        let mut contents = vec![(BOX_TYPE_IMAGE_HEADER, self.image_header_box.encode())];
        if let Some(bits_per_component_box) = &self.bits_per_component_box {
            contents.push((BOX_TYPE_BITS_PER_COMPONENT, bits_per_component_box.encode()));
        }
        for colour_specification_box in &self.colour_specification_boxes {
            contents.push((BOX_TYPE_COLOUR_SPECIFICATION, colour_specification_box.encode()));
        }
        for (box_type, bytes) in contents {
            let mut sub = parent.open_sub(box_type, false)?;
            if !sub.write(&bytes) || !sub.close() {
                return Err(JP2Error::BoxMalformed {
                    box_type,
                    offset: 0,
                    reason: "target refused the contents".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, box_type: BoxType, offset: u64) -> Result<(), JP2Error> {
    if slot.is_some() {
        return Err(JP2Error::BoxDuplicate { box_type, offset });
    }
    *slot = Some(value);
    Ok(())
}

impl JBox for HeaderSuperBox {
    // The type of the JP2 Header box shall be ‘jp2h’ (0x6A70 3268)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_HEADER
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        *self = HeaderSuperBox {
            length: self.length,
            offset: self.offset,
            ..Default::default()
        };
        let mut image_header_found = false;

        loop {
            let mut sub = BoxReader::new();
            if !sub.open_sub(reader)? {
                break;
            }
            let box_type = sub.box_type();
            let offset = sub.locator().file_pos().unwrap_or(0);

            if !image_header_found && box_type != BOX_TYPE_IMAGE_HEADER {
                return Err(JP2Error::BoxUnexpected { box_type, offset }.into());
            }
            info!("{} start at {:?}", box_type_name(&box_type), offset);

            let decoded = match box_type {
                BOX_TYPE_IMAGE_HEADER => {
                    if image_header_found {
                        return Err(JP2Error::BoxDuplicate { box_type, offset }.into());
                    }
                    image_header_found = true;
                    self.image_header_box.decode(&mut sub)?
                }
                BOX_TYPE_BITS_PER_COMPONENT => {
                    let mut bits_per_component_box = BitsPerComponentBox::default();
                    let decoded = bits_per_component_box.decode(&mut sub)?;
                    set_once(&mut self.bits_per_component_box, bits_per_component_box, box_type, offset)?;
                    decoded
                }
                BOX_TYPE_COLOUR_SPECIFICATION => {
                    let mut colour_specification_box = ColourSpecificationBox::default();
                    let decoded = colour_specification_box.decode(&mut sub)?;
                    self.colour_specification_boxes.push(colour_specification_box);
                    decoded
                }
                BOX_TYPE_PALETTE => {
                    let mut palette_box = PaletteBox::default();
                    let decoded = palette_box.decode(&mut sub)?;
                    set_once(&mut self.palette_box, palette_box, box_type, offset)?;
                    decoded
                }
                BOX_TYPE_COMPONENT_MAPPING => {
                    let mut component_mapping_box = ComponentMappingBox::default();
                    let decoded = component_mapping_box.decode(&mut sub)?;
                    set_once(&mut self.component_mapping_box, component_mapping_box, box_type, offset)?;
                    decoded
                }
                BOX_TYPE_CHANNEL_DEFINITION => {
                    let mut channel_definition_box = ChannelDefinitionBox::default();
                    let decoded = channel_definition_box.decode(&mut sub)?;
                    set_once(&mut self.channel_definition_box, channel_definition_box, box_type, offset)?;
                    decoded
                }
                BOX_TYPE_RESOLUTION => {
                    let mut resolution_box = ResolutionSuperBox::default();
                    let decoded = resolution_box.decode(&mut sub)?;
                    set_once(&mut self.resolution_box, resolution_box, box_type, offset)?;
                    decoded
                }
                // Other boxes may be defined in other standards and may be
                // ignored by conforming readers.
                _ => {
                    debug!("Skipping {} in header", box_type_name(&box_type));
                    true
                }
            };
            if !decoded {
                return Ok(false);
            }
            sub.close();
        }

        if reader.remaining_bytes() != 0 {
            return Ok(false);
        }
        if !image_header_found {
            return Err(JP2Error::BoxMissing {
                box_type: BOX_TYPE_IMAGE_HEADER,
            }
            .into());
        }
        if self.colour_specification_boxes.is_empty() {
            return Err(JP2Error::BoxMalformed {
                box_type: BOX_TYPE_HEADER,
                offset: self.offset,
                reason: "no colour specification".to_string(),
            }
            .into());
        }

        Ok(true)
    }
}

/// Image Header box.
///
/// Fixed length generic information about the image, such as the image size
/// and number of components. Its length is always 22 bytes including the
/// header. Much of it is redundant with the SIZ marker of the codestream.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.1.
#[derive(Debug, Default)]
pub struct ImageHeaderBox {
    length: u64,
    offset: u64,
    height: [u8; 4],
    width: [u8; 4],
    components_num: [u8; 2],
    components_bits: [u8; 1],
    compression_type: [u8; 1],
    colourspace_unknown: [u8; 1],
    intellectual_property: [u8; 1],
}

impl ImageHeaderBox {
    /// Image area height, Ysiz – YOsiz.
    pub fn height(&self) -> u32 {
        u32::from_be_bytes(self.height)
    }

    /// Image area width, Xsiz – XOsiz.
    pub fn width(&self) -> u32 {
        u32::from_be_bytes(self.width)
    }

    pub fn components_num(&self) -> u16 {
        u16::from_be_bytes(self.components_num)
    }

    /// Bit depth shared by all components, or 255 when the depths vary and
    /// a Bits Per Component box gives them.
    pub fn components_bits(&self) -> u8 {
        if self.components_bits[0] == 255 {
            255
        } else {
            BitDepth::new(self.components_bits[0]).value()
        }
    }

    /// Whether the components are signed. False when the depths vary.
    pub fn values_are_signed(&self) -> bool {
        self.components_bits[0] != 255 && (self.components_bits[0] & 0x80) == 0x80
    }

    /// Compression type. The value of this field shall be 7.
    pub fn compression_type(&self) -> u8 {
        self.compression_type[0]
    }

    pub fn colourspace_unknown(&self) -> u8 {
        self.colourspace_unknown[0]
    }

    pub fn intellectual_property(&self) -> u8 {
        self.intellectual_property[0]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut contents = Vec::with_capacity(14);
        contents.extend_from_slice(&self.height);
        contents.extend_from_slice(&self.width);
        contents.extend_from_slice(&self.components_num);
        contents.extend_from_slice(&self.components_bits);
        contents.extend_from_slice(&self.compression_type);
        contents.extend_from_slice(&self.colourspace_unknown);
        contents.extend_from_slice(&self.intellectual_property);
        contents
    }
}

impl JBox for ImageHeaderBox {
    // The type of the Image Header box shall be ‘ihdr’ (0x6968 6472)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_IMAGE_HEADER
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        match load_leaf(reader)? {
            Some(length) if length < 14 => return Err(truncated(reader, 14)),
            Some(_) => {}
            None => return Ok(false),
        }

        reader.read_exact(&mut self.height)?;
        reader.read_exact(&mut self.width)?;
        reader.read_exact(&mut self.components_num)?;
        reader.read_exact(&mut self.components_bits)?;
        reader.read_exact(&mut self.compression_type)?;
        reader.read_exact(&mut self.colourspace_unknown)?;
        reader.read_exact(&mut self.intellectual_property)?;

        if self.compression_type() != COMPRESSION_TYPE_WAVELET {
            warn!("Compression type {} unexpected", self.compression_type());
        }

        Ok(true)
    }
}

/// Channel Definition box.
///
/// Specifies the meaning of the samples in each channel in the image. Each
/// description gives the channel index, its type, and the colour it is
/// associated with.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.6.
#[derive(Debug, Default)]
pub struct ChannelDefinitionBox {
    length: u64,
    offset: u64,
    channels: Vec<Channel>,
}

impl ChannelDefinitionBox {
    pub fn channels(&self) -> &Vec<Channel> {
        &self.channels
    }
}

#[derive(Debug, Default)]
pub struct Channel {
    channel_index: [u8; 2],
    channel_type: [u8; 2],
    channel_association: [u8; 2],
}

impl Channel {
    pub fn channel_index(&self) -> u16 {
        u16::from_be_bytes(self.channel_index)
    }

    pub fn channel_type(&self) -> ChannelTypes {
        ChannelTypes::new(self.channel_type)
    }

    pub fn channel_type_u16(&self) -> u16 {
        u16::from_be_bytes(self.channel_type)
    }

    pub fn channel_association(&self) -> u16 {
        u16::from_be_bytes(self.channel_association)
    }
}

#[derive(Debug, PartialEq)]
pub enum ChannelTypes {
    ColourImageData,
    Opacity,
    PremultipliedOpacity,
    Reserved { value: u16 },
    Unspecified { value: u16 },
}

impl ChannelTypes {
    fn new(value: [u8; 2]) -> ChannelTypes {
        match u16::from_be_bytes(value) {
            0 => ChannelTypes::ColourImageData,
            1 => ChannelTypes::Opacity,
            2 => ChannelTypes::PremultipliedOpacity,
            u16::MAX => ChannelTypes::Unspecified { value: u16::MAX },
            value => ChannelTypes::Reserved { value },
        }
    }
}

impl JBox for ChannelDefinitionBox {
    // ‘cdef’ (0x6364 6566)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_CHANNEL_DEFINITION
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };

        // Number of channel descriptions, 2-byte big endian.
        let mut no_channel_descriptions: [u8; 2] = [0; 2];
        if length < 2 {
            return Err(truncated(reader, 2));
        }
        reader.read_exact(&mut no_channel_descriptions)?;
        let size = u16::from_be_bytes(no_channel_descriptions) as usize;
        if length < 2 + 6 * size {
            return Err(truncated(reader, 2 + 6 * size));
        }

        self.channels = Vec::with_capacity(size);
        for _ in 0..size {
            let mut channel = Channel::default();
            reader.read_exact(&mut channel.channel_index)?;
            reader.read_exact(&mut channel.channel_type)?;
            reader.read_exact(&mut channel.channel_association)?;

            debug!(
                "Found channel at index {:?} of type {:?} and association {:?}",
                channel.channel_index(),
                channel.channel_type(),
                channel.channel_association(),
            );

            self.channels.push(channel);
        }

        Ok(true)
    }
}

const COMPONENT_MAP_TYPE_DIRECT: u8 = 1;
const COMPONENT_MAP_TYPE_PALETTE: u8 = 2;

#[derive(Debug, PartialEq)]
pub enum ComponentMapType {
    /// The channel is an actual component of the codestream.
    Direct,

    /// The channel is created by applying the palette to a component.
    Palette,

    Reserved { value: u8 },
}

impl ComponentMapType {
    fn new(value: u8) -> ComponentMapType {
        match value {
            COMPONENT_MAP_TYPE_DIRECT => ComponentMapType::Direct,
            COMPONENT_MAP_TYPE_PALETTE => ComponentMapType::Palette,
            value => ComponentMapType::Reserved { value },
        }
    }
}

#[derive(Debug)]
pub struct ComponentMap {
    component: [u8; 2],
    mapping_type: ComponentMapType,
    palette: [u8; 1],
}

impl ComponentMap {
    /// Codestream component mapped to this channel.
    pub fn component(&self) -> u16 {
        u16::from_be_bytes(self.component)
    }

    pub fn mapping_type(&self) -> &ComponentMapType {
        &self.mapping_type
    }

    /// Palette column used for this channel; 0 for direct use.
    pub fn palette(&self) -> u8 {
        self.palette[0]
    }
}

/// Component Mapping box.
///
/// Defines how image channels are identified from the actual components
/// decoded from the codestream. Present if and only if a Palette box is.
///
/// See ISO/IEC 15444-1:2024 Section I.5.3.5.
#[derive(Debug, Default)]
pub struct ComponentMappingBox {
    length: u64,
    offset: u64,
    mapping: Vec<ComponentMap>,
}

impl ComponentMappingBox {
    pub fn component_map(&self) -> &Vec<ComponentMap> {
        &self.mapping
    }
}

impl JBox for ComponentMappingBox {
    fn identifier(&self) -> BoxType {
        BOX_TYPE_COMPONENT_MAPPING
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };

        self.mapping.clear();
        for _ in 0..length / 4 {
            let mut entry: [u8; 4] = [0; 4];
            reader.read_exact(&mut entry)?;
            self.mapping.push(ComponentMap {
                component: [entry[0], entry[1]],
                mapping_type: ComponentMapType::new(entry[2]),
                palette: [entry[3]],
            });
        }
        if length % 4 != 0 {
            warn!("{} trailing bytes in component mapping", length % 4);
        }

        Ok(true)
    }
}

#[derive(Clone, Debug, Default)]
pub struct GeneratedComponent {
    bit_depth: [u8; 1],
    values: Vec<u64>,
}

#[derive(Debug, PartialEq)]
pub enum BitDepth {
    Signed { value: u8 },
    Unsigned { value: u8 },
}

impl BitDepth {
    fn new(byte: u8) -> BitDepth {
        // The low 7-bits of the value indicate the bit depth, minus 1.
        let value = (byte & 0x7F) + 1;

        // The high-bit indicates whether the component is signed.
        if byte & 0x80 != 0 {
            BitDepth::Signed { value }
        } else {
            BitDepth::Unsigned { value }
        }
    }

    fn encode(precision: u8, signed: bool) -> u8 {
        let byte = precision.saturating_sub(1) & 0x7F;
        if signed {
            byte | 0x80
        } else {
            byte
        }
    }

    pub fn value(&self) -> u8 {
        match &self {
            Self::Signed { value } => *value,
            Self::Unsigned { value } => *value,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed { .. })
    }
}

impl GeneratedComponent {
    pub fn bit_depth(&self) -> BitDepth {
        BitDepth::new(self.bit_depth[0])
    }

    /// Palette entries for this component, one per palette row.
    pub fn values(&self) -> &Vec<u64> {
        &self.values
    }
}

/// Palette box.
///
/// The palette is applied to a single component to convert it into
/// multiple components, whose colourspace is then given by the Colour
/// Specification boxes. Entries are stored row by row, each value padded to
/// a whole number of bytes.
///
/// See Part 1 Section I.5.3.4 for more information.
#[derive(Debug, Default)]
pub struct PaletteBox {
    length: u64,
    offset: u64,
    num_entries: [u8; 2],
    num_components: [u8; 1],
    generated_components: Vec<GeneratedComponent>,
}

impl PaletteBox {
    /// Number of entries in the table, 1 to 1024.
    pub fn num_entries(&self) -> u16 {
        u16::from_be_bytes(self.num_entries)
    }

    /// Number of components created by the application of the palette.
    pub fn num_components(&self) -> u8 {
        self.num_components[0]
    }

    pub fn generated_components(&self) -> &Vec<GeneratedComponent> {
        &self.generated_components
    }
}

impl JBox for PaletteBox {
    fn identifier(&self) -> BoxType {
        BOX_TYPE_PALETTE
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };
        if length < 3 {
            return Err(truncated(reader, 3));
        }

        reader.read_exact(&mut self.num_entries)?;
        reader.read_exact(&mut self.num_components)?;

        let num_entries = self.num_entries() as usize;
        let num_components = self.num_components() as usize;
        self.generated_components = vec![GeneratedComponent::default(); num_components];
        let mut depths = vec![0u8; num_components];
        if length < 3 + num_components {
            return Err(truncated(reader, 3 + num_components));
        }
        reader.read_exact(&mut depths)?;

        let widths: Vec<usize> = depths
            .iter()
            .map(|d| (BitDepth::new(*d).value() as usize + 7) / 8)
            .collect();
        let wanted = 3 + num_components + num_entries * widths.iter().sum::<usize>();
        if length < wanted {
            return Err(truncated(reader, wanted));
        }

        for (component, depth) in self.generated_components.iter_mut().zip(&depths) {
            component.bit_depth = [*depth];
            component.values = Vec::with_capacity(num_entries);
        }
        for _ in 0..num_entries {
            for (component, width) in self.generated_components.iter_mut().zip(&widths) {
                let width = (*width).min(8);
                let mut buffer = [0u8; 8];
                reader.read_exact(&mut buffer[8 - width..])?;
                component.values.push(u64::from_be_bytes(buffer));
            }
        }

        Ok(true)
    }
}

/// Bits Per Component box.
///
/// Specifies the bit depth of each component, in codestream order. Present
/// only when the components do not all share one depth and signedness.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.2.
#[derive(Debug, Default)]
pub struct BitsPerComponentBox {
    length: u64,
    offset: u64,
    bits_per_component: Vec<u8>,
}

impl BitsPerComponentBox {
    pub fn bits_per_component(&self) -> Vec<BitDepth> {
        self.bits_per_component
            .iter()
            .map(|byte| BitDepth::new(*byte))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.bits_per_component.clone()
    }
}

impl JBox for BitsPerComponentBox {
    fn identifier(&self) -> BoxType {
        BOX_TYPE_BITS_PER_COMPONENT
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };
        self.bits_per_component = vec![0; length];
        reader.read_exact(&mut self.bits_per_component)?;
        Ok(true)
    }
}

const METHOD_ENUMERATED_COLOUR_SPACE: u8 = 1;
const METHOD_ENUMERATED_RESTRICTED_ICC_PROFILE: u8 = 2;

#[derive(Debug, PartialEq)]
pub enum ColourSpecificationMethods {
    EnumeratedColourSpace,
    RestrictedICCProfile,
    Reserved { value: u8 },
}

impl fmt::Display for ColourSpecificationMethods {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ColourSpecificationMethods::EnumeratedColourSpace => {
                write!(f, "{}", METHOD_ENUMERATED_COLOUR_SPACE)
            }
            ColourSpecificationMethods::RestrictedICCProfile => {
                write!(f, "{}", METHOD_ENUMERATED_RESTRICTED_ICC_PROFILE)
            }
            ColourSpecificationMethods::Reserved { value } => write!(f, "{}", value),
        }
    }
}

impl ColourSpecificationMethods {
    fn new(value: u8) -> ColourSpecificationMethods {
        match value {
            METHOD_ENUMERATED_COLOUR_SPACE => ColourSpecificationMethods::EnumeratedColourSpace,
            METHOD_ENUMERATED_RESTRICTED_ICC_PROFILE => {
                ColourSpecificationMethods::RestrictedICCProfile
            }
            value => ColourSpecificationMethods::Reserved { value },
        }
    }
}

/// Colour Specification box.
///
/// Defines one method by which an application can interpret the colourspace
/// of the decompressed image data: either an enumerated colourspace or a
/// restricted ICC profile.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.3.
#[derive(Debug, Default)]
pub struct ColourSpecificationBox {
    length: u64,
    offset: u64,
    method: [u8; 1],
    precedence: [u8; 1],
    colourspace_approximation: [u8; 1],
    enumerated_colour_space: Option<[u8; 4]>,
    restricted_icc_profile: Vec<u8>,
}

impl ColourSpecificationBox {
    pub fn enumerated(colour_space: u32) -> ColourSpecificationBox {
        ColourSpecificationBox {
            method: [METHOD_ENUMERATED_COLOUR_SPACE],
            enumerated_colour_space: Some(colour_space.to_be_bytes()),
            ..Default::default()
        }
    }

    pub fn method(&self) -> ColourSpecificationMethods {
        ColourSpecificationMethods::new(self.method[0])
    }

    /// Reserved; conforming readers ignore it.
    pub fn precedence(&self) -> i8 {
        self.precedence[0] as i8
    }

    pub fn colourspace_approximation(&self) -> u8 {
        self.colourspace_approximation[0]
    }

    /// Enumerated colourspace, present for method 1 only.
    pub fn enumerated_colour_space(&self) -> Option<u32> {
        self.enumerated_colour_space.map(u32::from_be_bytes)
    }

    pub fn restricted_icc_profile(&self) -> &[u8] {
        &self.restricted_icc_profile
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut contents = vec![
            self.method[0],
            self.precedence[0],
            self.colourspace_approximation[0],
        ];
        match self.method() {
            ColourSpecificationMethods::EnumeratedColourSpace => {
                contents.extend_from_slice(&self.enumerated_colour_space.unwrap_or_default())
            }
            ColourSpecificationMethods::RestrictedICCProfile => {
                contents.extend_from_slice(&self.restricted_icc_profile)
            }
            ColourSpecificationMethods::Reserved { .. } => {}
        }
        contents
    }
}

impl JBox for ColourSpecificationBox {
    // The type of a Colour Specification box shall be ‘colr’ (0x636F 6C72).
    fn identifier(&self) -> BoxType {
        BOX_TYPE_COLOUR_SPECIFICATION
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        let length = match load_leaf(reader)? {
            Some(length) => length,
            None => return Ok(false),
        };
        if length < 3 {
            return Err(truncated(reader, 3));
        }

        reader.read_exact(&mut self.method)?;
        reader.read_exact(&mut self.precedence)?;
        reader.read_exact(&mut self.colourspace_approximation)?;

        if self.precedence() != 0 {
            warn!("Precedence {:?} Unexpected", self.precedence());
        }
        if self.colourspace_approximation() != 0 {
            warn!(
                "Colourspace Approximation {:?} unexpected",
                self.colourspace_approximation()
            );
        }
        debug!("Method {}", self.method());

        match self.method() {
            // EnumCS is the last field of the box.
            ColourSpecificationMethods::EnumeratedColourSpace => {
                if length < 7 {
                    return Err(truncated(reader, 7));
                }
                let mut enumerated_colour_space = [0u8; 4];
                reader.read_exact(&mut enumerated_colour_space)?;
                self.enumerated_colour_space = Some(enumerated_colour_space);
                debug!("Enumerated Colour Space {:?}", self.enumerated_colour_space());
            }

            // The profile runs to the end of the box.
            ColourSpecificationMethods::RestrictedICCProfile => {
                self.restricted_icc_profile = vec![0; length - 3];
                reader.read_exact(&mut self.restricted_icc_profile)?;
                debug!("Restricted ICC Profile of {} bytes", length - 3);
            }

            // A conforming JP2 reader shall ignore the entire box.
            ColourSpecificationMethods::Reserved { value } => {
                debug!("Reserved method {}", value);
            }
        }

        Ok(true)
    }
}

/// Resolution box (superbox).
///
/// Capture and default display grid resolutions of this image. Contains
/// either a Capture Resolution box, or a Default Display Resolution box, or
/// both.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.7.
#[derive(Debug, Default)]
pub struct ResolutionSuperBox {
    length: u64,
    offset: u64,
    capture_resolution_box: Option<CaptureResolutionBox>,
    default_display_resolution_box: Option<DefaultDisplayResolutionBox>,
}

impl ResolutionSuperBox {
    pub fn capture_resolution_box(&self) -> &Option<CaptureResolutionBox> {
        &self.capture_resolution_box
    }

    pub fn default_display_resolution_box(&self) -> &Option<DefaultDisplayResolutionBox> {
        &self.default_display_resolution_box
    }
}

impl JBox for ResolutionSuperBox {
    // The type of a Resolution box shall be ‘res\040’ (0x7265 7320).
    fn identifier(&self) -> BoxType {
        BOX_TYPE_RESOLUTION
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        self.capture_resolution_box = None;
        self.default_display_resolution_box = None;

        let mut sub = BoxReader::new();
        let mut open = sub.open_sub(reader)?;
        while open {
            let box_type = sub.box_type();
            let offset = sub.locator().file_pos().unwrap_or(0);
            let decoded = match box_type {
                BOX_TYPE_CAPTURE_RESOLUTION => {
                    let mut capture_resolution_box = CaptureResolutionBox::default();
                    info!("CaptureResolutionBox start at {:?}", offset);
                    let decoded = capture_resolution_box.decode(&mut sub)?;
                    set_once(&mut self.capture_resolution_box, capture_resolution_box, box_type, offset)?;
                    decoded
                }
                BOX_TYPE_DEFAULT_DISPLAY_RESOLUTION => {
                    let mut default_display_resolution_box = DefaultDisplayResolutionBox::default();
                    info!("DisplayResolutionBox start at {:?}", offset);
                    let decoded = default_display_resolution_box.decode(&mut sub)?;
                    set_once(
                        &mut self.default_display_resolution_box,
                        default_display_resolution_box,
                        box_type,
                        offset,
                    )?;
                    decoded
                }
                _ => {
                    debug!("Skipping {} in resolution box", box_type_name(&box_type));
                    true
                }
            };
            if !decoded {
                return Ok(false);
            }
            open = sub.open_next()?;
        }
        sub.close();

        if reader.remaining_bytes() != 0 {
            return Ok(false);
        }
        if self.capture_resolution_box.is_none() && self.default_display_resolution_box.is_none() {
            return Err(JP2Error::BoxMalformed {
                box_type: BOX_TYPE_RESOLUTION,
                offset: self.offset,
                reason: "neither capture nor display resolution".to_string(),
            }
            .into());
        }

        Ok(true)
    }
}

/// Grid resolution in points per metre, as VRcN/VRcD · 10^VRcE vertically
/// and the same horizontally.
#[derive(Debug, Default)]
struct Resolution {
    vertical_numerator: [u8; 2],
    vertical_denominator: [u8; 2],
    horizontal_numerator: [u8; 2],
    horizontal_denominator: [u8; 2],
    vertical_exponent: [u8; 1],
    horizontal_exponent: [u8; 1],
}

impl Resolution {
    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        match load_leaf(reader)? {
            Some(length) if length < 10 => return Err(truncated(reader, 10)),
            Some(_) => {}
            None => return Ok(false),
        }
        reader.read_exact(&mut self.vertical_numerator)?;
        reader.read_exact(&mut self.vertical_denominator)?;
        reader.read_exact(&mut self.horizontal_numerator)?;
        reader.read_exact(&mut self.horizontal_denominator)?;
        reader.read_exact(&mut self.vertical_exponent)?;
        reader.read_exact(&mut self.horizontal_exponent)?;
        Ok(true)
    }

    fn points_per_metre(numerator: [u8; 2], denominator: [u8; 2], exponent: [u8; 1]) -> f64 {
        let denominator = u16::from_be_bytes(denominator);
        if denominator == 0 {
            return 0.0;
        }
        u16::from_be_bytes(numerator) as f64 / denominator as f64
            * 10f64.powi(exponent[0] as i8 as i32)
    }

    fn vertical(&self) -> f64 {
        Resolution::points_per_metre(
            self.vertical_numerator,
            self.vertical_denominator,
            self.vertical_exponent,
        )
    }

    fn horizontal(&self) -> f64 {
        Resolution::points_per_metre(
            self.horizontal_numerator,
            self.horizontal_denominator,
            self.horizontal_exponent,
        )
    }
}

/// Capture Resolution box.
///
/// The grid resolution at which this image was captured.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.7.1.
#[derive(Debug, Default)]
pub struct CaptureResolutionBox {
    length: u64,
    offset: u64,
    resolution: Resolution,
}

impl CaptureResolutionBox {
    pub fn vertical_capture_grid_resolution_numerator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.vertical_numerator)
    }

    pub fn vertical_capture_grid_resolution_denominator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.vertical_denominator)
    }

    pub fn horizontal_capture_grid_resolution_numerator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.horizontal_numerator)
    }

    pub fn horizontal_capture_grid_resolution_denominator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.horizontal_denominator)
    }

    pub fn vertical_capture_grid_resolution_exponent(&self) -> i8 {
        self.resolution.vertical_exponent[0] as i8
    }

    pub fn horizontal_capture_grid_resolution_exponent(&self) -> i8 {
        self.resolution.horizontal_exponent[0] as i8
    }

    /// Vertical capture resolution in points per metre.
    pub fn vertical_resolution_capture(&self) -> f64 {
        self.resolution.vertical()
    }

    /// Horizontal capture resolution in points per metre.
    pub fn horizontal_resolution_capture(&self) -> f64 {
        self.resolution.horizontal()
    }
}

impl JBox for CaptureResolutionBox {
    // ‘resc’ (0x7265 7363)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_CAPTURE_RESOLUTION
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        self.resolution.decode(reader)
    }
}

/// Default Display Resolution box.
///
/// A desired display grid resolution, for example to size the image on a
/// page. Applications are free to choose another.
///
/// For more information, see ISO/IEC 15444-1 / ITU T-800 Appendix I.5.3.7.2.
#[derive(Debug, Default)]
pub struct DefaultDisplayResolutionBox {
    length: u64,
    offset: u64,
    resolution: Resolution,
}

impl DefaultDisplayResolutionBox {
    pub fn vertical_display_grid_resolution_numerator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.vertical_numerator)
    }

    pub fn vertical_display_grid_resolution_denominator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.vertical_denominator)
    }

    pub fn horizontal_display_grid_resolution_numerator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.horizontal_numerator)
    }

    pub fn horizontal_display_grid_resolution_denominator(&self) -> u16 {
        u16::from_be_bytes(self.resolution.horizontal_denominator)
    }

    pub fn vertical_display_grid_resolution_exponent(&self) -> i8 {
        self.resolution.vertical_exponent[0] as i8
    }

    pub fn horizontal_display_grid_resolution_exponent(&self) -> i8 {
        self.resolution.horizontal_exponent[0] as i8
    }

    pub fn vertical_display_grid_resolution(&self) -> f64 {
        self.resolution.vertical()
    }

    pub fn horizontal_display_grid_resolution(&self) -> f64 {
        self.resolution.horizontal()
    }
}

impl JBox for DefaultDisplayResolutionBox {
    // ‘resd’ (0x7265 7364)
    fn identifier(&self) -> BoxType {
        BOX_TYPE_DEFAULT_DISPLAY_RESOLUTION
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn decode(&mut self, reader: &mut BoxReader<'_>) -> Result<bool, Box<dyn error::Error>> {
        (self.length, self.offset) = placement(reader);
        self.resolution.decode(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jpc::ComponentSize;

    #[test]
    fn test_bit_depth() {
        assert_eq!(BitDepth::new(7), BitDepth::Unsigned { value: 8 });
        assert_eq!(BitDepth::new(0x8F), BitDepth::Signed { value: 16 });
        assert_eq!(BitDepth::encode(12, true), 0x8B);
        assert_eq!(BitDepth::encode(8, false), 7);
    }

    #[test]
    fn test_header_from_siz() {
        let siz = SizParams::new(640, 480, vec![ComponentSize::new(8, false); 3]);
        let header = HeaderSuperBox::from_siz(&siz, ENUMERATED_COLOUR_SPACE_SRGB);
        assert_eq!(header.image_header_box.width(), 640);
        assert_eq!(header.image_header_box.height(), 480);
        assert_eq!(header.image_header_box.components_num(), 3);
        assert_eq!(header.image_header_box.components_bits(), 8);
        assert!(header.bits_per_component_box.is_none());
        assert_eq!(
            header.colour_specification_boxes[0].encode(),
            vec![1, 0, 0, 0, 0, 0, 16]
        );

        let siz = SizParams::new(
            16,
            16,
            vec![ComponentSize::new(8, false), ComponentSize::new(12, true)],
        );
        let header = HeaderSuperBox::from_siz(&siz, ENUMERATED_COLOUR_SPACE_GREYSCALE);
        assert_eq!(header.image_header_box.components_bits(), 255);
        assert!(!header.image_header_box.values_are_signed());
        let depths = header.bits_per_component_box.unwrap().bits_per_component();
        assert_eq!(depths[1], BitDepth::Signed { value: 12 });
    }

    #[test]
    fn test_file_type_encoding() {
        let file_type = FileTypeBox::jp2();
        assert_eq!(file_type.encode(), b"jp2 \0\0\0\0jp2 ".to_vec());
        assert_eq!(file_type.brand(), "jp2 ");
        assert_eq!(file_type.compatibility_list(), vec!["jp2 ".to_string()]);
    }
}
