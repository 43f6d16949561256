use std::io::Cursor;

use jpc::{
    Block, CodingParams, Codestream, CodestreamError, ComponentSize, Coords, FileSource,
    FileTarget, FlushOptions, MemorySource, MemoryTarget, ProgressionOrder, SimulatedTarget,
    SizParams, StreamSource, Subband, ThreadEnv, Tile, ViewRestrictions,
};
use tempdir::TempDir;

type BlockKey = (u32, usize, usize, usize, i64, i64);

const SLOPES: [u16; 3] = [60000, 40000, 20000];

fn gray(width: u32, height: u32) -> SizParams {
    SizParams::new(width, height, vec![ComponentSize::new(8, false)])
}

fn two_components(width: u32, height: u32) -> SizParams {
    SizParams::new(
        width,
        height,
        vec![ComponentSize::new(8, false), ComponentSize::new(10, true)],
    )
}

fn small_blocks(coding: &mut CodingParams) {
    coding.levels = 2;
    coding.block_size = (4, 4);
    coding.precincts = vec![(5, 5)];
    coding.layers = 3;
}

/// Deterministic coded data for the block named by `key`: one pass per
/// entry of `SLOPES`.
fn fill(block: &mut Block, key: BlockKey) {
    let (t, c, r, b, x, y) = key;
    let seed = t as usize * 131 + c * 31 + r * 7 + b * 3 + x as usize * 5 + y as usize * 11;
    block.missing_msbs = (seed % 5) as u8;
    for (pass, slope) in SLOPES.iter().enumerate() {
        let length = 2 + (seed + pass) % 4;
        let bytes: Vec<u8> = (0..length).map(|i| (seed + pass * 17 + i) as u8).collect();
        block.push_pass(&bytes, *slope);
    }
}

fn expected_data(key: BlockKey, passes: usize) -> (u8, Vec<u8>) {
    let mut block = Block::default();
    fill(&mut block, key);
    let length: u32 = block.pass_lengths[..passes].iter().sum();
    (block.missing_msbs, block.data[..length as usize].to_vec())
}

fn block_list(codestream: &Codestream, tile: Tile) -> Vec<(Subband, Coords, BlockKey)> {
    let mut out = vec![];
    for c in 0..codestream.get_num_components(true) {
        let comp = codestream.tile_comp(tile, c).unwrap();
        for r in 0..codestream.num_resolutions(comp).unwrap() {
            let res = codestream.resolution(comp, r).unwrap();
            for b in 0..codestream.num_subbands(res).unwrap() {
                let band = codestream.subband(res, b).unwrap();
                let blocks = codestream.valid_blocks(band).unwrap();
                for y in blocks.pos.y..blocks.lim().y {
                    for x in blocks.pos.x..blocks.lim().x {
                        out.push((band, Coords::new(x, y), (tile.number(), c, r, b, x, y)));
                    }
                }
            }
        }
    }
    out
}

fn tile_indices(codestream: &Codestream) -> Vec<Coords> {
    let tiles = codestream.get_valid_tiles();
    let mut out = vec![];
    for y in tiles.pos.y..tiles.lim().y {
        for x in tiles.pos.x..tiles.lim().x {
            out.push(Coords::new(x, y));
        }
    }
    out
}

fn write_all_tiles(codestream: &mut Codestream) {
    for index in tile_indices(codestream) {
        let tile = codestream.open_tile(index).unwrap().unwrap();
        for (band, block_index, key) in block_list(codestream, tile) {
            let mut block = codestream.open_block(band, block_index).unwrap();
            fill(&mut block, key);
            codestream.close_block(block).unwrap();
        }
        codestream.close_tile(tile).unwrap();
    }
}

fn encode(siz: SizParams, configure: impl FnOnce(&mut CodingParams), options: FlushOptions) -> Vec<u8> {
    let mut target = MemoryTarget::new();
    {
        let mut codestream = Codestream::create_output(siz, &mut target);
        configure(&mut codestream.params_mut().unwrap().coding);
        codestream.finalize_params().unwrap();
        write_all_tiles(&mut codestream);
        codestream.flush(options).unwrap();
        assert!(codestream.is_last_fragment());
    }
    target.into_bytes()
}

fn layered_options() -> FlushOptions {
    FlushOptions {
        layer_thresholds: vec![50000, 30000, 0],
        record_in_comment: true,
        ..FlushOptions::default()
    }
}

/// Opens every tile and checks each block holds its first `passes` passes.
fn check_all_blocks(codestream: &mut Codestream, passes: usize) {
    for index in tile_indices(codestream) {
        let tile = codestream.open_tile(index).unwrap().unwrap();
        let blocks = block_list(codestream, tile);
        assert!(!blocks.is_empty());
        for (band, block_index, key) in blocks {
            let block = codestream.open_block(band, block_index).unwrap();
            let (missing_msbs, data) = expected_data(key, passes);
            assert_eq!(block.data, data, "block {:?}", key);
            assert_eq!(block.num_passes, passes);
            if passes > 0 {
                assert_eq!(block.missing_msbs, missing_msbs);
            }
            codestream.close_block(block).unwrap();
        }
        codestream.close_tile(tile).unwrap();
    }
}

#[test]
fn test_output_input_round_trip() {
    let bytes = encode(
        two_components(70, 50).with_tiles(32, 32),
        |coding| {
            small_blocks(coding);
            coding.use_sop = true;
            coding.use_eph = true;
        },
        layered_options(),
    );
    assert_eq!(bytes[..2], [0xFF, 0x4F]);
    assert_eq!(bytes[bytes.len() - 2..], [0xFF, 0xD9]);

    let mut codestream = Codestream::create_input(MemorySource::new(bytes.clone())).unwrap();
    assert_eq!(codestream.num_layers(), 3);
    assert_eq!(codestream.get_num_components(true), 2);
    assert_eq!(codestream.get_bit_depth(1).unwrap(), 10);
    assert!(codestream.get_signed(1).unwrap());
    assert_eq!(codestream.get_valid_tiles().size, Coords::new(3, 2));
    assert_eq!(codestream.get_dims(Some(0)).unwrap().size, Coords::new(70, 50));
    assert!(codestream.comments()[0].contains("layer thresholds 50000,30000,0"));
    assert_eq!(codestream.params().coding.layers, 3);
    assert!(codestream.params().coding.use_sop);
    check_all_blocks(&mut codestream, 3);
    assert!(codestream.total_bytes() <= bytes.len() as u64);
}

#[test]
fn test_sequential_source() {
    let bytes = encode(
        gray(40, 40).with_tiles(16, 16),
        small_blocks,
        layered_options(),
    );
    let mut codestream = Codestream::create_input(StreamSource::new(Cursor::new(bytes))).unwrap();
    check_all_blocks(&mut codestream, 3);
}

#[test]
fn test_progression_orders() {
    for progression in [
        ProgressionOrder::RLLCPP,
        ProgressionOrder::RLPCLP,
        ProgressionOrder::PCRLLP,
        ProgressionOrder::CPRLLP,
    ] {
        let bytes = encode(
            two_components(45, 30),
            |coding| {
                small_blocks(coding);
                coding.progression = progression;
            },
            layered_options(),
        );
        let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
        assert_eq!(codestream.params().coding.progression, progression);
        check_all_blocks(&mut codestream, 3);
    }
}

#[test]
fn test_layer_restriction() {
    let bytes = encode(gray(40, 24), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    codestream
        .apply_input_restrictions(ViewRestrictions {
            max_layers: Some(1),
            ..ViewRestrictions::default()
        })
        .unwrap();
    assert_eq!(codestream.num_layers(), 1);
    check_all_blocks(&mut codestream, 1);
}

#[test]
fn test_resolution_and_component_restriction() {
    let bytes = encode(two_components(64, 64), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    codestream
        .apply_input_restrictions(ViewRestrictions {
            first_component: 1,
            discard_levels: 1,
            ..ViewRestrictions::default()
        })
        .unwrap();
    assert_eq!(codestream.get_num_components(true), 1);
    assert_eq!(codestream.get_dims(Some(0)).unwrap().size, Coords::new(32, 32));
    assert_eq!(codestream.get_subsampling(0).unwrap(), Coords::new(2, 2));
    assert!(codestream.get_bit_depth(1).is_err());

    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let comp = codestream.tile_comp(tile, 0).unwrap();
    assert_eq!(codestream.num_resolutions(comp).unwrap(), 2);
    assert!(codestream.resolution(comp, 2).is_err());
    assert_eq!(codestream.tile_comp_dims(comp).unwrap().size, Coords::new(32, 32));
    for (band, index, (t, _, r, b, x, y)) in block_list(&codestream, tile) {
        let block = codestream.open_block(band, index).unwrap();
        let (_, data) = expected_data((t, 1, r, b, x, y), 3);
        assert_eq!(block.data, data);
    }
    assert!(codestream
        .apply_input_restrictions(ViewRestrictions::default())
        .is_err());
}

#[test]
fn test_region_of_interest() {
    let bytes = encode(gray(128, 128).with_tiles(64, 64), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    codestream
        .apply_input_restrictions(ViewRestrictions {
            region: Some(jpc::Rect::new(0, 0, 20, 20)),
            ..ViewRestrictions::default()
        })
        .unwrap();
    assert_eq!(codestream.get_valid_tiles().size, Coords::new(1, 1));
    assert_eq!(codestream.get_dims(None).unwrap().size, Coords::new(20, 20));
    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let comp = codestream.tile_comp(tile, 0).unwrap();
    let res = codestream.resolution(comp, 2).unwrap();
    let band = codestream.subband(res, 0).unwrap();
    let blocks = codestream.valid_blocks(band).unwrap();
    assert_eq!(blocks.pos, Coords::new(0, 0));
    assert!(blocks.size.x < 2);
    let block = codestream.open_block(band, Coords::new(0, 0)).unwrap();
    assert!(!block.region.is_empty());
    assert!(block.region.size.x <= block.size.x);
}

#[test]
fn test_block_opened_once() {
    let bytes = encode(gray(32, 32), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let blocks = block_list(&codestream, tile);
    let (band, index, _) = blocks[0];
    let block = codestream.open_block(band, index).unwrap();
    assert!(codestream.open_block(band, index).is_err());
    codestream.close_block(block).unwrap();
    codestream.close_tile(tile).unwrap();

    assert!(codestream.tile_comp(tile, 0).is_err());
    assert!(codestream.open_tile(Coords::new(0, 0)).is_err());
}

#[test]
fn test_persistent_reopen() {
    let bytes = encode(gray(32, 32).with_tiles(16, 16), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    codestream.set_persistent();
    codestream.set_tile_unloading_threshold(1);

    let first = codestream.open_tile(Coords::new(1, 0)).unwrap().unwrap();
    let (band, index, key) = block_list(&codestream, first)[0];
    codestream.open_block(band, index).unwrap();
    codestream.close_tile(first).unwrap();

    for index in [Coords::new(0, 0), Coords::new(0, 1), Coords::new(1, 1)] {
        let tile = codestream.open_tile(index).unwrap().unwrap();
        codestream.close_tile(tile).unwrap();
    }

    let again = codestream.open_tile(Coords::new(1, 0)).unwrap().unwrap();
    assert_ne!(again, first);
    assert!(codestream.tile_comp(first, 0).is_err());
    let (band, index, _) = block_list(&codestream, again)[0];
    let block = codestream.open_block(band, index).unwrap();
    assert_eq!(block.data, expected_data(key, 3).1);
    assert!(codestream
        .apply_input_restrictions(ViewRestrictions::default())
        .is_err());
    codestream.close_tile(again).unwrap();
    assert!(codestream
        .apply_input_restrictions(ViewRestrictions::default())
        .is_ok());
}

#[test]
fn test_transposed_appearance() {
    let bytes = encode(gray(48, 20), small_blocks, layered_options());
    let mut codestream = Codestream::create_input(MemorySource::new(bytes)).unwrap();
    assert!(codestream.can_flip());
    codestream.change_appearance(true, false, false);
    assert_eq!(codestream.get_dims(Some(0)).unwrap().size, Coords::new(20, 48));

    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let comp = codestream.tile_comp(tile, 0).unwrap();
    let res = codestream.resolution(comp, 2).unwrap();
    assert_eq!(codestream.resolution_dims(res).unwrap().size, Coords::new(20, 48));
    let first = codestream.subband(res, 0).unwrap();
    assert_eq!(codestream.subband_orientation(first).unwrap(), jpc::Orientation::HL);
    assert_eq!(codestream.subband_dims(first).unwrap().size, Coords::new(10, 24));

    let blocks = codestream.valid_blocks(first).unwrap();
    assert_eq!(blocks.size, Coords::new(1, 2));
    let block = codestream.open_block(first, Coords::new(0, 1)).unwrap();
    assert!(block.transpose);
    assert_eq!(block.size, Coords::new(8, 10));
}

#[test]
fn test_incremental_flush() {
    let mut target = MemoryTarget::new();
    {
        let mut codestream = Codestream::create_output(gray(64, 64), &mut target);
        let coding = &mut codestream.params_mut().unwrap().coding;
        small_blocks(coding);
        coding.progression = ProgressionOrder::RLLCPP;
        codestream.finalize_params().unwrap();

        let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
        let blocks = block_list(&codestream, tile);
        let (low, high): (Vec<_>, Vec<_>) = blocks.into_iter().partition(|(_, _, key)| key.2 == 0);
        for (band, index, key) in low {
            let mut block = codestream.open_block(band, index).unwrap();
            fill(&mut block, key);
            codestream.close_block(block).unwrap();
        }
        codestream.flush(layered_options()).unwrap();
        let partial = codestream.total_bytes();
        assert!(partial > 0);
        assert!(!codestream.is_last_fragment());

        for (band, index, key) in high {
            let mut block = codestream.open_block(band, index).unwrap();
            fill(&mut block, key);
            codestream.close_block(block).unwrap();
        }
        codestream.close_tile(tile).unwrap();
        assert!(codestream.open_tile(Coords::new(0, 0)).is_err());
        codestream.flush(FlushOptions::default()).unwrap();
        assert!(codestream.total_bytes() > partial);
        assert!(codestream.is_last_fragment());
    }
    let mut codestream = Codestream::create_input(MemorySource::new(target.into_bytes())).unwrap();
    check_all_blocks(&mut codestream, 3);
}

#[test]
fn test_tile_part_limit() {
    let mut codestream = Codestream::create_output(gray(68, 64), SimulatedTarget::new());
    let coding = &mut codestream.params_mut().unwrap().coding;
    coding.levels = 0;
    coding.block_size = (2, 2);
    coding.precincts = vec![(2, 2)];
    codestream.finalize_params().unwrap();

    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let blocks = block_list(&codestream, tile);
    assert_eq!(blocks.len(), 17 * 16);
    for (i, (band, index, key)) in blocks.into_iter().enumerate() {
        let mut block = codestream.open_block(band, index).unwrap();
        fill(&mut block, key);
        codestream.close_block(block).unwrap();
        let result = codestream.flush(FlushOptions::default());
        if i < 255 {
            assert!(result.is_ok(), "flush {} failed", i);
        } else {
            assert!(result.is_err());
            break;
        }
    }
}

#[test]
fn test_trans_out() {
    let bytes = encode(gray(40, 40), small_blocks, layered_options());
    for (max_bytes, passes) in [(0, 3), (1, 0)] {
        let mut source = Codestream::create_input(MemorySource::new(bytes.clone())).unwrap();
        let mut target = MemoryTarget::new();
        {
            let mut codestream = Codestream::create_output(gray(40, 40), &mut target);
            codestream.params_mut().unwrap().coding = source.params().coding.clone();
            codestream.finalize_params().unwrap();
            let input_tile = source.open_tile(Coords::new(0, 0)).unwrap().unwrap();
            let output_tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
            let inputs = block_list(&source, input_tile);
            let outputs = block_list(&codestream, output_tile);
            for ((in_band, index, _), (out_band, _, _)) in inputs.into_iter().zip(outputs) {
                let coded = source.open_block(in_band, index).unwrap();
                let mut block = codestream.open_block(out_band, index).unwrap();
                block.missing_msbs = coded.missing_msbs;
                block.num_passes = coded.num_passes;
                block.pass_lengths = coded.pass_lengths.clone();
                block.pass_slopes = coded.pass_slopes.clone();
                block.data = coded.data.clone();
                codestream.close_block(block).unwrap();
            }
            codestream.close_tile(output_tile).unwrap();
            codestream.trans_out(max_bytes).unwrap();
            assert!(codestream.is_last_fragment());
        }
        let mut transcoded = Codestream::create_input(MemorySource::new(target.into_bytes())).unwrap();
        check_all_blocks(&mut transcoded, passes);
    }
}

#[test]
fn test_resilient_input() {
    let bytes = encode(gray(32, 16).with_tiles(16, 16), small_blocks, layered_options());
    let header_length = Codestream::create_input(MemorySource::new(bytes.clone()))
        .unwrap()
        .main_header_bytes()
        .len();
    let mut psot = [0; 4];
    psot.copy_from_slice(&bytes[header_length + 6..header_length + 10]);
    let second = header_length + u32::from_be_bytes(psot) as usize;
    let mut corrupt = bytes.clone();
    corrupt[second] = 0x00;

    let mut strict = Codestream::create_input(MemorySource::new(corrupt.clone())).unwrap();
    assert!(strict.open_tile(Coords::new(0, 0)).unwrap().is_some());
    assert!(strict.open_tile(Coords::new(1, 0)).is_err());

    let mut resilient = Codestream::create_input(MemorySource::new(corrupt)).unwrap();
    resilient.set_resilient(true);
    let tile = resilient.open_tile(Coords::new(1, 0)).unwrap().unwrap();
    for (band, index, _) in block_list(&resilient, tile) {
        let block = resilient.open_block(band, index).unwrap();
        assert_eq!(block.num_passes, 0);
    }
}

/// Offset of the first occurrence of `pattern` in `bytes`.
fn find(bytes: &[u8], pattern: &[u8]) -> usize {
    bytes
        .windows(pattern.len())
        .position(|window| window == pattern)
        .unwrap()
}

#[test]
fn test_resilient_input_resumes_at_next_packet() {
    let bytes = encode(
        gray(16, 16),
        |coding| {
            small_blocks(coding);
            coding.use_sop = true;
            coding.use_eph = true;
        },
        layered_options(),
    );
    // Packet 4 is layer 1 of resolution 1. Spoil its EPH marker.
    let sop = find(&bytes, &[0xFF, 0x91, 0x00, 0x04, 0x00, 0x04]);
    let eph = sop + 6 + find(&bytes[sop + 6..], &[0xFF, 0x92]);
    let mut corrupt = bytes;
    corrupt[eph + 1] = 0x00;

    let mut strict = Codestream::create_input(MemorySource::new(corrupt.clone())).unwrap();
    assert!(strict.open_tile(Coords::new(0, 0)).is_err());

    let mut resilient = Codestream::create_input(MemorySource::new(corrupt)).unwrap();
    resilient.set_resilient(true);
    let tile = resilient.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    for (band, index, key) in block_list(&resilient, tile) {
        // Resolution 1 keeps only the layer before the damage; the others
        // are untouched.
        let passes = if key.2 == 1 { 1 } else { 3 };
        let block = resilient.open_block(band, index).unwrap();
        let (_, data) = expected_data(key, passes);
        assert_eq!(block.data, data, "block {:?}", key);
        assert_eq!(block.num_passes, passes);
        resilient.close_block(block).unwrap();
    }
}

#[test]
fn test_oversized_tile_part_length() {
    let bytes = encode(gray(16, 16), small_blocks, layered_options());
    let header_length = Codestream::create_input(MemorySource::new(bytes.clone()))
        .unwrap()
        .main_header_bytes()
        .len();
    let mut corrupt = bytes;
    corrupt[header_length + 6..header_length + 10].copy_from_slice(&0xFFFF_FFF0u32.to_be_bytes());

    let mut strict = Codestream::create_input(MemorySource::new(corrupt.clone())).unwrap();
    let error = strict.open_tile(Coords::new(0, 0)).err().unwrap();
    assert!(matches!(
        error.downcast_ref::<CodestreamError>(),
        Some(CodestreamError::Truncated { .. })
    ));

    let mut sequential = Codestream::create_input(StreamSource::new(Cursor::new(corrupt))).unwrap();
    sequential.set_resilient(true);
    check_all_blocks(&mut sequential, 3);
}

#[test]
fn test_params_locked_once_tiles_open() {
    let mut codestream = Codestream::create_output(gray(16, 16), SimulatedTarget::new());
    assert!(codestream.open_tile(Coords::new(0, 0)).is_err());
    codestream.finalize_params().unwrap();
    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    assert!(codestream.params_mut().is_err());
    assert!(codestream.open_tile(Coords::new(1, 0)).is_err());
    assert!(codestream
        .apply_input_restrictions(ViewRestrictions::default())
        .is_err());
    codestream.close_tile(tile).unwrap();
}

#[test]
fn test_restart_output() {
    let mut first = MemoryTarget::new();
    let mut second = MemoryTarget::new();
    {
        let mut codestream = Codestream::create_output(gray(24, 24), &mut first);
        small_blocks(&mut codestream.params_mut().unwrap().coding);
        codestream.finalize_params().unwrap();
        write_all_tiles(&mut codestream);
        codestream.flush(layered_options()).unwrap();

        codestream.restart_output(&mut second).unwrap();
        write_all_tiles(&mut codestream);
        codestream.flush(layered_options()).unwrap();
        assert!(codestream.is_last_fragment());
    }
    assert_eq!(first.bytes(), second.bytes());

    let mut codestream = Codestream::create_input(MemorySource::new(first.into_bytes())).unwrap();
    check_all_blocks(&mut codestream, 3);
    assert!(codestream
        .restart_input(MemorySource::new(second.into_bytes()))
        .unwrap());
    check_all_blocks(&mut codestream, 3);
}

#[test]
fn test_interchange_packets() {
    let mut codestream = Codestream::create_interchange(gray(32, 32));
    small_blocks(&mut codestream.params_mut().unwrap().coding);
    codestream.finalize_params().unwrap();

    let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
    let comp = codestream.tile_comp(tile, 0).unwrap();
    let res = codestream.resolution(comp, 2).unwrap();
    assert_eq!(codestream.valid_precincts(res).unwrap().size, Coords::new(1, 1));
    let precinct = codestream.open_precinct(res, Coords::new(0, 0)).unwrap();
    assert_eq!(codestream.precinct_id(precinct).unwrap(), 2);

    let mut held = None;
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
                if (band, x, y) == (2, 0, 0) {
                    held = Some(block);
                } else {
                    codestream.close_block(block).unwrap();
                }
            }
        }
    }
    assert!(!codestream.close_precinct(precinct));
    assert!(codestream
        .open_precinct_block(precinct, 2, Coords::new(0, 0))
        .is_err());
    let first_band = codestream.subband(res, 0).unwrap();
    assert!(codestream.open_block(first_band, Coords::new(0, 0)).is_err());

    let precinct = codestream.open_precinct(res, Coords::new(0, 0)).unwrap();
    codestream.close_block(held.unwrap()).unwrap();
    assert!(codestream.close_precinct(precinct));
    assert!(codestream.close_precinct(precinct));

    let mut all = vec![];
    let (mut packets, mut bytes) = (3, 0);
    codestream
        .get_packets(precinct, 0, 0, &mut packets, &mut bytes, &mut all)
        .unwrap();
    assert_eq!(packets, 3);
    assert_eq!(bytes, all.len() as u64);

    let (mut sized_packets, mut sized_bytes) = (1, 0);
    codestream
        .size_packets(precinct, &mut sized_packets, &mut sized_bytes)
        .unwrap();
    assert_eq!(sized_packets, 1);
    assert!(sized_bytes > 0 && sized_bytes < all.len() as u64);

    let mut rest = vec![];
    let (mut packets, mut bytes) = (3, 0);
    let appended = codestream
        .get_packets(precinct, sized_packets, sized_bytes, &mut packets, &mut bytes, &mut rest)
        .unwrap();
    assert_eq!(appended, rest.len());
    assert_eq!(rest, all[sized_bytes as usize..].to_vec());
}

#[test]
fn test_thread_env() {
    let mut target = MemoryTarget::new();
    {
        let mut codestream = Codestream::create_output(two_components(64, 48), &mut target);
        small_blocks(&mut codestream.params_mut().unwrap().coding);
        codestream.finalize_params().unwrap();
        let tile = codestream.open_tile(Coords::new(0, 0)).unwrap().unwrap();
        let blocks = block_list(&codestream, tile);

        let env = ThreadEnv::new(codestream);
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let env = &env;
                let blocks = &blocks;
                scope.spawn(move || {
                    for (band, index, key) in blocks.iter().skip(worker).step_by(4) {
                        let mut block = env.open_block(*band, *index).unwrap();
                        fill(&mut block, *key);
                        env.close_block(block).unwrap();
                    }
                });
            }
        });
        let mut codestream = env.into_inner();
        codestream.close_tile(tile).unwrap();
        codestream.flush(layered_options()).unwrap();
        assert!(codestream.is_last_fragment());
    }
    let mut codestream = Codestream::create_input(MemorySource::new(target.into_bytes())).unwrap();
    check_all_blocks(&mut codestream, 3);
}

#[test]
fn test_thread_env_tiles_in_parallel() {
    let mut target = MemoryTarget::new();
    {
        let mut codestream =
            Codestream::create_output(two_components(64, 48).with_tiles(32, 32), &mut target);
        small_blocks(&mut codestream.params_mut().unwrap().coding);
        codestream.finalize_params().unwrap();
        let tiles = tile_indices(&codestream);
        assert_eq!(tiles.len(), 4);

        let env = ThreadEnv::new(codestream);
        std::thread::scope(|scope| {
            for index in &tiles {
                let env = &env;
                scope.spawn(move || {
                    let tile = env.open_tile(*index).unwrap().unwrap();
                    let blocks = env.with(|codestream| block_list(codestream, tile));
                    for (band, block_index, key) in blocks {
                        let mut block = env.open_block(band, block_index).unwrap();
                        fill(&mut block, key);
                        env.close_block(block).unwrap();
                    }
                    env.close_tile(tile).unwrap();
                });
            }
        });
        env.flush(layered_options()).unwrap();
        assert!(env.total_bytes().unwrap() > 0);
        assert!(env.into_inner().is_last_fragment());
    }
    let mut codestream = Codestream::create_input(MemorySource::new(target.into_bytes())).unwrap();
    check_all_blocks(&mut codestream, 3);
}

#[test]
fn test_file_source_and_target() {
    let dir = TempDir::new("jpc").unwrap();
    let path = dir.path().join("image.j2c");
    {
        let target = FileTarget::create(&path).unwrap();
        let mut codestream = Codestream::create_output(gray(40, 30).with_tiles(20, 20), target);
        small_blocks(&mut codestream.params_mut().unwrap().coding);
        codestream.finalize_params().unwrap();
        write_all_tiles(&mut codestream);
        codestream.flush(layered_options()).unwrap();
        assert!(codestream.finish());
    }
    let mut codestream = Codestream::create_input(FileSource::open(&path).unwrap()).unwrap();
    check_all_blocks(&mut codestream, 3);

    let source = FileSource::open(&path).unwrap().without_seeking();
    let mut codestream = Codestream::create_input(source).unwrap();
    check_all_blocks(&mut codestream, 3);
}
