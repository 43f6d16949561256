use jp2::{
    BinClass, BoxLocator, BoxReader, BoxWriter, Cache, ContainerSource, ContainerTarget,
    FileTypeBox, HeaderSuperBox, JP2Error, Jp2Source, Jp2Target, SignatureBox,
    BOX_TYPE_CONTIGUOUS_CODESTREAM, BOX_TYPE_FILE_TYPE, BOX_TYPE_HEADER, BOX_TYPE_IMAGE_HEADER,
    BOX_TYPE_PLACEHOLDER, BOX_TYPE_SIGNATURE, ENUMERATED_COLOUR_SPACE_GREYSCALE,
};
use jpc::{
    Block, Capabilities, CodingParams, Codestream, CodestreamError, ComponentSize, Coords,
    FlushOptions, MemorySource, MemoryTarget, Rect, SizParams,
};
use tempdir::TempDir;

const SLOPES: [u16; 3] = [60000, 40000, 20000];

fn gray(width: u32, height: u32) -> SizParams {
    SizParams::new(width, height, vec![ComponentSize::new(8, false)])
}

fn small_blocks(coding: &mut CodingParams) {
    coding.levels = 2;
    coding.block_size = (4, 4);
    coding.precincts = vec![(5, 5)];
    coding.layers = 3;
}

fn boxed(box_type: [u8; 4], contents: &[u8]) -> Vec<u8> {
    let mut bytes = ((contents.len() + 8) as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&box_type);
    bytes.extend_from_slice(contents);
    bytes
}

fn header_contents(siz: &SizParams) -> Vec<u8> {
    let mut writer = BoxWriter::open_detached(BOX_TYPE_HEADER);
    HeaderSuperBox::from_siz(siz, ENUMERATED_COLOUR_SPACE_GREYSCALE)
        .write(&mut writer)
        .unwrap();
    writer.contents().unwrap()
}

fn jp2_prefix() -> Vec<u8> {
    let mut bytes = boxed(BOX_TYPE_SIGNATURE, &SignatureBox::default().encode());
    bytes.extend(boxed(BOX_TYPE_FILE_TYPE, &FileTypeBox::jp2().encode()));
    bytes
}

fn fill(block: &mut Block, seed: usize) {
    block.missing_msbs = (seed % 3) as u8;
    for (pass, slope) in SLOPES.iter().enumerate() {
        let bytes: Vec<u8> = (0..2 + (seed + pass) % 3).map(|i| (seed + pass * 13 + i) as u8).collect();
        block.push_pass(&bytes, *slope);
    }
}

/// Visits every block of every tile, with a seed derived from its address.
fn each_block(codestream: &mut Codestream, mut visit: impl FnMut(&mut Codestream, Block, usize)) {
    let tiles = codestream.get_valid_tiles();
    for ty in tiles.pos.y..tiles.lim().y {
        for tx in tiles.pos.x..tiles.lim().x {
            let tile = codestream.open_tile(Coords::new(tx, ty)).unwrap().unwrap();
            let comp = codestream.tile_comp(tile, 0).unwrap();
            for r in 0..codestream.num_resolutions(comp).unwrap() {
                let res = codestream.resolution(comp, r).unwrap();
                for b in 0..codestream.num_subbands(res).unwrap() {
                    let band = codestream.subband(res, b).unwrap();
                    let blocks = codestream.valid_blocks(band).unwrap();
                    for y in blocks.pos.y..blocks.lim().y {
                        for x in blocks.pos.x..blocks.lim().x {
                            let block = codestream.open_block(band, Coords::new(x, y)).unwrap();
                            let seed = tile.number() as usize * 97 + r * 29 + b * 7 + (x * 3 + y * 5) as usize;
                            visit(codestream, block, seed);
                        }
                    }
                }
            }
            codestream.close_tile(tile).unwrap();
        }
    }
}

fn layered_options() -> FlushOptions {
    FlushOptions {
        layer_thresholds: vec![50000, 30000, 0],
        ..FlushOptions::default()
    }
}

#[test]
fn test_file_round_trip() {
    let dir = TempDir::new("jp2").unwrap();
    let path = dir.path().join("image.jp2");
    let siz = gray(40, 30).with_tiles(20, 20);
    {
        let mut jp2 = Jp2Target::new(ContainerTarget::open_file(&path).unwrap());
        let error = jp2.open_codestream(true).err().unwrap();
        assert!(matches!(
            error.downcast_ref::<JP2Error>(),
            Some(JP2Error::BoxMissing { .. })
        ));
        jp2.write_header(&HeaderSuperBox::from_siz(&siz, ENUMERATED_COLOUR_SPACE_GREYSCALE))
            .unwrap();
        assert!(jp2.write_header(&HeaderSuperBox::default()).is_err());

        let mut stream = jp2.open_codestream(true).unwrap();
        {
            let mut codestream = Codestream::create_output(siz, &mut stream);
            small_blocks(&mut codestream.params_mut().unwrap().coding);
            codestream.finalize_params().unwrap();
            each_block(&mut codestream, |codestream, mut block, seed| {
                fill(&mut block, seed);
                codestream.close_block(block).unwrap();
            });
            codestream.flush(layered_options()).unwrap();
            assert!(codestream.finish());
        }
        assert!(stream.close());
        assert!(jp2.close());
    }

    let mut jp2 = Jp2Source::new(ContainerSource::open_file(&path).unwrap());
    assert!(jp2.open().unwrap());
    assert!(jp2.open().unwrap());
    assert_eq!(jp2.signature_box().unwrap().signature(), [13, 10, 135, 10]);
    assert_eq!(jp2.file_type_box().unwrap().brand(), "jp2 ");
    let header = jp2.header_box().unwrap();
    assert_eq!(header.image_header_box.width(), 40);
    assert_eq!(header.image_header_box.height(), 30);
    assert_eq!(header.image_header_box.components_num(), 1);
    assert_eq!(header.image_header_box.components_bits(), 8);
    assert!(header.bits_per_component_box.is_none());
    assert_eq!(
        header.colour_specification_boxes[0].enumerated_colour_space(),
        Some(ENUMERATED_COLOUR_SPACE_GREYSCALE)
    );

    let mut stream = BoxReader::new();
    assert!(jp2.open_codestream(&mut stream).unwrap());
    assert_eq!(stream.box_type(), BOX_TYPE_CONTIGUOUS_CODESTREAM);
    assert_eq!(stream.box_bytes(), None);
    let mut codestream = Codestream::create_input(&mut stream).unwrap();
    assert_eq!(codestream.get_dims(None).unwrap(), Rect::new(0, 0, 40, 30));
    each_block(&mut codestream, |codestream, block, seed| {
        let mut expected = Block::default();
        fill(&mut expected, seed);
        assert_eq!(block.num_passes, 3);
        assert_eq!(block.missing_msbs, expected.missing_msbs);
        assert_eq!(block.data, expected.data);
        codestream.close_block(block).unwrap();
    });
}

#[test]
fn test_header_must_precede_codestream() {
    let mut bytes = jp2_prefix();
    bytes.extend(boxed(BOX_TYPE_CONTIGUOUS_CODESTREAM, &[0xFF, 0x4F]));
    let mut jp2 = Jp2Source::new(ContainerSource::open(MemorySource::new(bytes)));
    let error = jp2.open().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<JP2Error>(),
        Some(JP2Error::BoxMissing { box_type }) if *box_type == BOX_TYPE_HEADER
    ));
}

#[test]
fn test_signature_comes_first() {
    let mut bytes = boxed(BOX_TYPE_FILE_TYPE, &FileTypeBox::jp2().encode());
    bytes.extend(boxed(BOX_TYPE_SIGNATURE, &SignatureBox::default().encode()));
    let mut jp2 = Jp2Source::new(ContainerSource::open(MemorySource::new(bytes)));
    let error = jp2.open().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<JP2Error>(),
        Some(JP2Error::BoxUnexpected { offset: 0, .. })
    ));
}

#[test]
fn test_truncated_file_reports_missing_box() {
    let mut bytes = jp2_prefix();
    bytes.extend(boxed(*b"free", &[0; 3]));
    let mut jp2 = Jp2Source::new(ContainerSource::open(MemorySource::new(bytes)));
    let error = jp2.open().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<JP2Error>(),
        Some(JP2Error::BoxMissing { box_type }) if *box_type == BOX_TYPE_HEADER
    ));
}

#[test]
fn test_skips_unknown_boxes() {
    let siz = gray(16, 8);
    let mut bytes = jp2_prefix();
    bytes.extend(boxed(*b"xml ", b"<meta/>"));
    bytes.extend(boxed(BOX_TYPE_HEADER, &header_contents(&siz)));
    let codestream_pos = bytes.len() as u64;
    bytes.extend(boxed(BOX_TYPE_CONTIGUOUS_CODESTREAM, &[0xFF, 0x4F]));

    let mut jp2 = Jp2Source::new(ContainerSource::open(MemorySource::new(bytes)));
    assert!(jp2.open().unwrap());
    assert_eq!(jp2.header_box().unwrap().image_header_box.width(), 16);
    assert_eq!(
        jp2.codestream_locator(),
        Some(BoxLocator::at_file_pos(codestream_pos))
    );
}

fn placeholder(flags: u32, original_bin: u64, original_header: &[u8], codestream: Option<u64>) -> Vec<u8> {
    let mut contents = flags.to_be_bytes().to_vec();
    contents.extend_from_slice(&original_bin.to_be_bytes());
    contents.extend_from_slice(original_header);
    if let Some(id) = codestream {
        contents.extend_from_slice(&id.to_be_bytes());
        contents.extend_from_slice(&1u32.to_be_bytes());
    }
    boxed(BOX_TYPE_PLACEHOLDER, &contents)
}

/// Splits an interchange codestream into the data-bins of codestream 0:
/// the main header, the (single) tile header and the one precinct of the
/// highest resolution.
fn add_codestream_bins(cache: &Cache, siz: SizParams) {
    let mut codestream = Codestream::create_interchange(siz);
    small_blocks(&mut codestream.params_mut().unwrap().coding);
    codestream.finalize_params().unwrap();
    cache.add_to_databin(BinClass::MainHeader, 0, 0, &codestream.main_header_bytes(), 0, true);

    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let tile_header = codestream.tile_header_bytes(tile).unwrap();
    cache.add_to_databin(BinClass::TileHeader, 0, 0, &tile_header, 0, true);

    let comp = codestream.tile_comp(tile, 0).unwrap();
    let res = codestream.resolution(comp, 2).unwrap();
    let precinct = codestream.open_precinct(res, Coords::new(0, 0)).unwrap();
    for band in 0..3 {
        let blocks = codestream.precinct_blocks(precinct, band).unwrap();
        for y in blocks.pos.y..blocks.lim().y {
            for x in blocks.pos.x..blocks.lim().x {
                let mut block = codestream
                    .open_precinct_block(precinct, band, Coords::new(x, y))
                    .unwrap();
                for (layer, length) in [3usize, 2, 4].iter().enumerate() {
                    block.push_pass(&vec![band as u8 + layer as u8; *length], 0xFFFF - layer as u16);
                }
                codestream.close_block(block).unwrap();
            }
        }
    }
    assert!(codestream.close_precinct(precinct));
    let id = codestream.precinct_id(precinct).unwrap();

    let mut packets = vec![];
    let (mut num_packets, mut num_bytes) = (3, 0);
    codestream
        .get_packets(precinct, 0, 0, &mut num_packets, &mut num_bytes, &mut packets)
        .unwrap();
    cache.add_to_databin(BinClass::Precinct, 0, id, &packets, 0, true);
}

#[test]
fn test_cached_file() {
    let siz = gray(32, 32);
    let header = header_contents(&siz);
    let header_length = header.len() as u32 + 8;

    let mut top = jp2_prefix();
    let header_pos = top.len() as u64;
    let mut original = header_length.to_be_bytes().to_vec();
    original.extend_from_slice(&BOX_TYPE_HEADER);
    top.extend(placeholder(1, 1, &original, None));
    let stream_bin_pos = top.len() as u64;
    let mut original = vec![0, 0, 0, 0];
    original.extend_from_slice(&BOX_TYPE_CONTIGUOUS_CODESTREAM);
    top.extend(placeholder(4, 0, &original, Some(0)));

    let cache = Cache::new();
    let mut jp2 = Jp2Source::new(ContainerSource::open_cache(cache.clone()));
    assert!(!jp2.open().unwrap());
    cache.add_to_databin(BinClass::Meta, 0, 0, &top, 0, true);
    assert!(!jp2.open().unwrap());
    assert!(jp2.signature_box().is_some());
    assert!(jp2.header_box().is_none());

    cache.add_to_databin(BinClass::Meta, 0, 1, &header, 0, true);
    assert!(jp2.open().unwrap());
    assert_eq!(jp2.header_box().unwrap().image_header_box.width(), 32);
    let locator = jp2.codestream_locator().unwrap();
    assert_eq!(locator.databin_id(), Some(0));
    assert_eq!(locator.databin_pos(), stream_bin_pos);
    assert_eq!(locator.file_pos(), Some(header_pos + header_length as u64));

    let mut image_header = BoxReader::new();
    assert!(image_header
        .open(jp2.source(), BoxLocator::at_file_pos(header_pos + 8))
        .unwrap());
    assert_eq!(image_header.box_type(), BOX_TYPE_IMAGE_HEADER);
    assert_eq!(image_header.locator().databin_id(), Some(1));
    assert!(!image_header.close());

    let mut stream = BoxReader::new();
    assert!(jp2.open_codestream(&mut stream).unwrap());
    assert_eq!(stream.box_type(), BOX_TYPE_CONTIGUOUS_CODESTREAM);
    assert_eq!(stream.capabilities(), Capabilities::CACHED | Capabilities::SEEKABLE);
    assert_eq!(stream.remaining_bytes(), -1);
    assert!(!stream.is_complete());
    assert!(Codestream::try_create_input(&mut stream).unwrap().is_none());
    let error = Codestream::create_input(&mut stream).err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CodestreamError>(),
        Some(CodestreamError::MainHeaderIncomplete)
    ));

    add_codestream_bins(&cache, siz);

    let mut codestream = Codestream::create_input(&mut stream).unwrap();
    assert_eq!(codestream.get_dims(None).unwrap(), Rect::new(0, 0, 32, 32));
    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let comp = codestream.tile_comp(tile, 0).unwrap();
    let res = codestream.resolution(comp, 2).unwrap();
    let band = codestream.subband(res, 0).unwrap();
    let block = codestream.open_block(band, Coords::new(0, 0)).unwrap();
    assert_eq!(block.num_passes, 3);
    assert_eq!(block.data, vec![0, 0, 0, 1, 1, 2, 2, 2, 2]);
    codestream.close_block(block).unwrap();
    codestream.close_tile(tile).unwrap();
}

#[test]
fn test_detached_header_matches_written_file() {
    let siz = gray(24, 24);
    let mut target = MemoryTarget::new();
    {
        let mut jp2 = Jp2Target::new(ContainerTarget::open(&mut target));
        jp2.write_header(&HeaderSuperBox::from_siz(&siz, ENUMERATED_COLOUR_SPACE_GREYSCALE))
            .unwrap();
        assert!(jp2.close());
    }
    let mut expected = jp2_prefix();
    expected.extend(boxed(BOX_TYPE_HEADER, &header_contents(&siz)));
    assert_eq!(target.into_bytes(), expected);
}
