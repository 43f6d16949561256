use std::io::Cursor;

use jp2::{
    BinClass, BoxLocator, BoxReader, BoxWriter, Cache, ContainerSource, ContainerTarget,
    JP2Error, BOX_TYPE_CONTIGUOUS_CODESTREAM, BOX_TYPE_PLACEHOLDER,
};
use jpc::{Capabilities, MemorySource, MemoryTarget, SimulatedTarget, StreamSource};

fn write_boxes(write: impl FnOnce(&ContainerTarget<'_>)) -> Vec<u8> {
    let mut target = MemoryTarget::new();
    {
        let family = ContainerTarget::open(&mut target);
        write(&family);
        assert!(family.close());
    }
    target.into_bytes()
}

fn raw_box(box_type: &[u8; 4], contents: &[u8]) -> Vec<u8> {
    let mut bytes = ((contents.len() + 8) as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(box_type);
    bytes.extend_from_slice(contents);
    bytes
}

fn is_error(error: &Box<dyn std::error::Error>, check: impl Fn(&JP2Error) -> bool) -> bool {
    error.downcast_ref::<JP2Error>().map_or(false, check)
}

#[test]
fn test_nested_round_trip() {
    let bytes = write_boxes(|family| {
        let mut outer = BoxWriter::open(family, *b"asoc", false).unwrap();
        let mut first = outer.open_sub(*b"lbl ", false).unwrap();
        assert!(first.write(b"hello"));
        assert!(!outer.write(b"x"));
        assert!(first.close());
        let mut second = outer.open_sub(*b"xml ", false).unwrap();
        assert!(second.write(b"<a/>"));
        assert!(second.close());
        assert!(outer.close());
        assert!(outer.close());

        let mut leaf = BoxWriter::open(family, *b"free", false).unwrap();
        assert!(leaf.write_u32(7));
        assert!(leaf.close());
    });
    assert_eq!(bytes.len(), 45);
    assert_eq!(&bytes[..8], &[0, 0, 0, 33, b'a', b's', b'o', b'c']);

    let family = ContainerSource::open(MemorySource::new(bytes));
    let mut outer = BoxReader::new();
    assert!(outer.open_first(&family).unwrap());
    assert!(outer.open_first(&family).is_err());
    assert_eq!(outer.box_type(), *b"asoc");
    assert_eq!(outer.box_bytes(), Some(33));
    assert_eq!(outer.remaining_bytes(), 25);

    let mut sub = BoxReader::new();
    assert!(sub.open_sub(&mut outer).unwrap());
    assert_eq!(sub.box_type(), *b"lbl ");
    assert_eq!(sub.locator().file_pos(), Some(8));
    let error = outer.read_u8().unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::BoxLocked { .. })));
    assert_eq!(sub.read_to_end().unwrap(), b"hello".to_vec());

    assert!(sub.open_next().unwrap());
    assert_eq!(sub.box_type(), *b"xml ");
    assert_eq!(sub.locator().file_pos(), Some(21));
    assert_eq!(sub.read_to_end().unwrap(), b"<a/>".to_vec());
    assert!(!sub.open_next().unwrap());
    assert!(!sub.is_open());
    assert_eq!(outer.remaining_bytes(), 0);
    assert!(outer.close());
    assert!(outer.close());

    let mut leaf = BoxReader::new();
    assert!(leaf.open(&family, BoxLocator::at_file_pos(33)).unwrap());
    assert_eq!(leaf.box_type(), *b"free");
    assert_eq!(leaf.read_u32().unwrap(), Some(7));
    assert_eq!(leaf.read_u32().unwrap(), None);
}

#[test]
fn test_rubber_codestream_box() {
    let bytes = write_boxes(|family| {
        let mut first = BoxWriter::open(family, *b"free", false).unwrap();
        assert!(first.write(b"abc"));
        assert!(first.close());

        let mut stream = BoxWriter::open(family, BOX_TYPE_CONTIGUOUS_CODESTREAM, true).unwrap();
        assert!(stream.write(&[1, 2, 3, 4, 5, 6]));
        let error = BoxWriter::open(family, *b"free", false).err().unwrap();
        assert!(is_error(&error, |e| matches!(e, JP2Error::BoxLocked { .. })));
        assert!(stream.close());

        let error = BoxWriter::open(family, *b"free", false).err().unwrap();
        assert!(is_error(&error, |e| matches!(e, JP2Error::RubberNotLast)));
    });
    assert_eq!(bytes.len(), 25);
    assert_eq!(&bytes[11..19], &[0, 0, 0, 0, b'j', b'p', b'2', b'c']);

    let family = ContainerSource::open(StreamSource::new(Cursor::new(bytes)));
    assert_eq!(family.capabilities(), Capabilities::SEQUENTIAL);
    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert!(reader.open_next().unwrap());
    assert_eq!(reader.box_type(), BOX_TYPE_CONTIGUOUS_CODESTREAM);
    assert_eq!(reader.box_bytes(), None);
    assert_eq!(reader.remaining_bytes(), -1);
    assert!(!reader.is_complete());

    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(reader.remaining_bytes(), -1);
    let mut rest = [0u8; 8];
    assert_eq!(reader.read(&mut rest).unwrap(), 2);
    assert_eq!(&rest[..2], &[5, 6]);
    assert_eq!(reader.remaining_bytes(), 0);
    assert!(reader.is_complete());
    assert!(!reader.open_next().unwrap());
}

#[test]
fn test_sequential_source_cannot_go_back() {
    let mut bytes = raw_box(b"free", b"abcd");
    bytes.extend(raw_box(b"skip", b"efgh"));
    let family = ContainerSource::open(StreamSource::new(Cursor::new(bytes)));

    let mut second = BoxReader::new();
    assert!(second.open(&family, BoxLocator::at_file_pos(12)).unwrap());
    assert_eq!(second.read_to_end().unwrap(), b"efgh".to_vec());
    assert!(second.close());

    let mut first = BoxReader::new();
    let error = first.open_first(&family).unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::SeekBackwards { .. })));
}

#[test]
fn test_header_written_last() {
    let bytes = write_boxes(|family| {
        let mut writer = BoxWriter::open(family, *b"uuid", false).unwrap();
        assert!(writer.write_header_last());
        assert!(writer.write(&[9; 20]));
        assert!(writer.close());
    });
    assert_eq!(bytes.len(), 36);
    assert_eq!(&bytes[..8], &[0, 0, 0, 1, b'u', b'u', b'i', b'd']);
    assert_eq!(&bytes[8..16], &36u64.to_be_bytes());

    let family = ContainerSource::open(MemorySource::new(bytes));
    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert_eq!(reader.header_length(), 16);
    assert_eq!(reader.box_bytes(), Some(36));
    assert_eq!(reader.read_to_end().unwrap(), vec![9; 20]);
}

#[test]
fn test_declared_size_uses_extended_header() {
    let mut simulated = SimulatedTarget::new();
    {
        let family = ContainerTarget::open(&mut simulated);
        let mut writer = BoxWriter::open(&family, BOX_TYPE_CONTIGUOUS_CODESTREAM, false).unwrap();
        assert!(writer.set_target_size(1 << 32));
        assert_eq!(family.bytes_written(), 16);
        assert!(writer.write(&[0; 1024]));
        assert_eq!(family.bytes_written(), 16 + 1024);
        assert!(!writer.close());
    }

    let mut bytes = vec![0, 0, 0, 1, b'j', b'p', b'2', b'c'];
    bytes.extend_from_slice(&20u64.to_be_bytes());
    bytes.extend_from_slice(&[3, 1, 4, 1]);
    let family = ContainerSource::open(MemorySource::new(bytes));
    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert_eq!(reader.header_length(), 16);
    assert_eq!(reader.remaining_bytes(), 4);
    assert_eq!(reader.read_u32().unwrap(), Some(0x0301_0401));
}

#[test]
fn test_reserved_length_rejected() {
    let family = ContainerSource::open(MemorySource::new(vec![0, 0, 0, 4, b'b', b'a', b'd', b' ']));
    let mut reader = BoxReader::new();
    let error = reader.open_first(&family).unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::BoxLengthReserved { length: 4, .. })));
}

#[test]
fn test_rewrite_window() {
    let bytes = write_boxes(|family| {
        let mut writer = BoxWriter::open(family, BOX_TYPE_CONTIGUOUS_CODESTREAM, true).unwrap();
        assert!(writer.write(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(writer.start_rewrite(4));
        assert!(!writer.start_rewrite(2));
        assert!(writer.write(&[0xAA, 0xBB]));
        assert!(!writer.write(&[0, 0, 0]));
        assert!(writer.end_rewrite());
        assert!(!writer.end_rewrite());
        assert!(writer.write(b"!"));
        assert_eq!(writer.contents_length(), 9);
        assert!(writer.close());
    });
    assert_eq!(&bytes[8..], &[1, 2, 3, 4, 0xAA, 0xBB, 7, 8, b'!']);
}

#[test]
fn test_rubber_sub_box_streams_parents() {
    let bytes = write_boxes(|family| {
        let mut outer = BoxWriter::open(family, *b"asoc", false).unwrap();
        let mut inner = outer.open_sub(*b"xml ", true).unwrap();
        assert!(inner.write(b"<streamed/>"));
        assert!(inner.close());
        assert!(outer.close());
    });
    let mut expected = vec![0, 0, 0, 0, b'a', b's', b'o', b'c', 0, 0, 0, 0, b'x', b'm', b'l', b' '];
    expected.extend_from_slice(b"<streamed/>");
    assert_eq!(bytes, expected);
}

#[test]
fn test_transplant_unlocks_parent() {
    let mut bytes = raw_box(b"asoc", &raw_box(b"lbl ", b"name"));
    bytes.extend(raw_box(b"free", &[]));
    let family = ContainerSource::open(MemorySource::new(bytes));

    let mut outer = BoxReader::new();
    assert!(outer.open_first(&family).unwrap());
    let mut sub = BoxReader::new();
    assert!(sub.open_sub(&mut outer).unwrap());
    let mut kept = BoxReader::new();
    kept.transplant(&mut sub).unwrap();
    assert!(!sub.is_open());
    assert_eq!(kept.box_type(), *b"lbl ");

    assert_eq!(outer.remaining_bytes(), 0);
    assert_eq!(outer.read_u8().unwrap(), None);
    assert!(outer.close());
    assert_eq!(kept.read_to_end().unwrap(), b"name".to_vec());
}

#[test]
fn test_close_reports_unread_contents() {
    let mut bytes = raw_box(b"lbl ", b"abcd");
    bytes.extend(raw_box(b"lbl ", b"efgh"));
    let family = ContainerSource::open(MemorySource::new(bytes));

    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert_eq!(reader.read_u16().unwrap(), Some(0x6162));
    assert!(!reader.close());
    assert!(reader.close());

    assert!(reader.open(&family, BoxLocator::at_file_pos(12)).unwrap());
    assert_eq!(reader.read_to_end().unwrap(), b"efgh".to_vec());
    assert!(reader.close());
}

#[test]
fn test_truncated_header_is_malformed() {
    let family = ContainerSource::open(MemorySource::new(raw_box(b"asoc", &[0, 0, 0, 12, b'l'])));
    let mut outer = BoxReader::new();
    assert!(outer.open_first(&family).unwrap());
    let mut sub = BoxReader::new();
    let error = sub.open_sub(&mut outer).unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::BoxMalformed { .. })));

    let mut bytes = raw_box(b"free", &[]);
    bytes.extend_from_slice(&[0, 0, 0]);
    let family = ContainerSource::open(MemorySource::new(bytes));
    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    let error = reader.open_next().unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::BoxMalformed { offset: 8, .. })));
}

#[test]
fn test_in_memory_contents() {
    let family = ContainerSource::open(MemorySource::new(raw_box(b"xml ", b"<doc/>")));
    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert!(!reader.load_in_memory(4).unwrap());
    assert!(reader.load_in_memory(64).unwrap());
    assert!(reader.capabilities().contains(Capabilities::IN_MEMORY));
    assert_eq!(reader.access_memory(), Some(&b"<doc/>"[..]));
    assert!(reader.seek(1).unwrap());
    assert_eq!(reader.read_u8().unwrap(), Some(b'd'));
}

#[test]
fn test_cache_header_arrives_in_pieces() {
    let cache = Cache::new();
    let family = ContainerSource::open_cache(cache.clone());
    let bytes = raw_box(b"lbl ", b"abcdef");

    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes[..4], 0, false);
    let mut reader = BoxReader::new();
    assert!(!reader.open_first(&family).unwrap());
    assert!(!reader.is_open());

    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes[4..8], 4, false);
    assert!(reader.open_first(&family).unwrap());
    assert_eq!(reader.box_type(), *b"lbl ");
    assert_eq!(reader.remaining_bytes(), 6);
    assert!(!reader.is_complete());
    assert!(!family.is_top_level_complete());

    for (i, byte) in bytes[8..].iter().enumerate() {
        assert!(!reader.load_in_memory(64).unwrap());
        cache.add_to_databin(BinClass::Meta, 0, 0, &[*byte], 8 + i as u64, i == 5);
    }
    assert!(reader.is_complete());
    assert!(family.is_top_level_complete());
    assert!(reader.load_in_memory(64).unwrap());
    assert_eq!(reader.access_memory(), Some(&b"abcdef"[..]));
}

#[test]
fn test_cache_reads_resume_byte_by_byte() {
    let cache = Cache::new();
    let family = ContainerSource::open_cache(cache.clone());
    let bytes = raw_box(b"xml ", b"<a>text</a>");
    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes[..8], 0, false);

    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert_eq!(
        reader.capabilities(),
        Capabilities::SEQUENTIAL | Capabilities::SEEKABLE
    );
    let mut collected = vec![];
    let mut buf = [0u8; 3];
    for (i, byte) in bytes[8..].iter().enumerate() {
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        cache.add_to_databin(BinClass::Meta, 0, 0, &[*byte], 8 + i as u64, i + 9 == bytes.len());
        let count = reader.read(&mut buf).unwrap();
        assert_eq!(count, 1);
        collected.extend_from_slice(&buf[..count]);
    }
    assert_eq!(collected, b"<a>text</a>".to_vec());
    assert_eq!(reader.remaining_bytes(), 0);
}

#[test]
fn test_open_next_waits_for_sibling_header() {
    let cache = Cache::new();
    let family = ContainerSource::open_cache(cache.clone());
    let mut bytes = raw_box(b"free", b"ab");
    bytes.extend(raw_box(b"xml ", b"<x/>"));
    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes[..14], 0, false);

    let mut reader = BoxReader::new();
    assert!(reader.open_first(&family).unwrap());
    assert!(!reader.open_next().unwrap());
    assert!(!reader.is_open());
    assert!(!reader.open_next().unwrap());

    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes[14..], 14, true);
    assert!(reader.open_next().unwrap());
    assert_eq!(reader.box_type(), *b"xml ");
    assert_eq!(reader.locator().file_pos(), Some(10));
    assert_eq!(reader.read_to_end().unwrap(), b"<x/>".to_vec());
    assert!(!reader.open_next().unwrap());
}

#[test]
fn test_oversized_placeholder_rejected() {
    let cache = Cache::new();
    let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xF0];
    bytes.extend_from_slice(&BOX_TYPE_PLACEHOLDER);
    bytes.extend_from_slice(&[0; 16]);
    cache.add_to_databin(BinClass::Meta, 0, 0, &bytes, 0, true);

    let family = ContainerSource::open_cache(cache);
    let mut reader = BoxReader::new();
    let error = reader.open_first(&family).unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::PlaceholderMalformed { .. })));
}

/// Placeholder contents: flags, OrigID, OrigBH, then EquivID/EquivBH and
/// CSID/NCS when the flags call for them.
fn placeholder(
    flags: u32,
    original_bin: u64,
    original: &[u8],
    equivalent: Option<(u64, &[u8])>,
    codestream: Option<u64>,
) -> Vec<u8> {
    let mut contents = flags.to_be_bytes().to_vec();
    contents.extend_from_slice(&original_bin.to_be_bytes());
    contents.extend_from_slice(original);
    if let Some((bin, header)) = equivalent {
        contents.extend_from_slice(&bin.to_be_bytes());
        contents.extend_from_slice(header);
    }
    if let Some(id) = codestream {
        contents.extend_from_slice(&id.to_be_bytes());
        contents.extend_from_slice(&1u32.to_be_bytes());
    }
    raw_box(&BOX_TYPE_PLACEHOLDER, &contents)
}

fn header_bytes(box_type: &[u8; 4], length: u32) -> Vec<u8> {
    let mut bytes = length.to_be_bytes().to_vec();
    bytes.extend_from_slice(box_type);
    bytes
}

#[test]
fn test_placeholder_resolution() {
    let cache = Cache::new();
    let mut top = raw_box(b"free", b"xy");
    // Original "lbl " box of 14 bytes in bin 2, stream equivalent in bin 3.
    top.extend(placeholder(
        3,
        2,
        &header_bytes(b"lbl ", 14),
        Some((3, &header_bytes(b"xml ", 17))),
        None,
    ));
    // Nothing available: an empty box of the original type.
    top.extend(placeholder(0, 0, &header_bytes(b"uinf", 40), None, None));
    top.extend(raw_box(b"last", &[]));
    cache.add_to_databin(BinClass::Meta, 0, 0, &top, 0, true);
    cache.add_to_databin(BinClass::Meta, 0, 2, b"labels", 0, true);
    cache.add_to_databin(BinClass::Meta, 0, 3, b"<labels", 0, false);

    let family = ContainerSource::open_cache(cache.clone());
    let mut reader = BoxReader::new();
    assert!(reader.open(&family, BoxLocator::at_file_pos(10)).unwrap());
    assert_eq!(reader.box_type(), *b"xml ");
    assert_eq!(reader.box_bytes(), Some(14));
    assert_eq!(reader.locator().databin_id(), Some(0));
    assert_eq!(reader.contents_locator().databin_id(), Some(3));
    assert_eq!(reader.remaining_bytes(), 9);
    assert!(!reader.is_complete());
    assert!(!reader.close());

    family.set_prefer_originals(true);
    assert!(reader.open(&family, BoxLocator::at_file_pos(10)).unwrap());
    assert_eq!(reader.box_type(), *b"lbl ");
    assert_eq!(reader.contents_locator().databin_id(), Some(2));
    assert_eq!(reader.contents_locator().file_pos(), Some(18));
    assert_eq!(reader.read_to_end().unwrap(), b"labels".to_vec());

    assert!(reader.open_next().unwrap());
    assert_eq!(reader.box_type(), *b"uinf");
    assert_eq!(reader.locator().file_pos(), Some(24));
    assert_eq!(reader.remaining_bytes(), 0);
    assert!(reader.is_complete());

    assert!(reader.open_next().unwrap());
    assert_eq!(reader.box_type(), *b"last");
    assert_eq!(reader.locator().file_pos(), Some(64));
    let located = reader.locator();
    assert!(reader.close());
    assert!(reader.open(&family, located).unwrap());
    assert_eq!(reader.box_type(), *b"last");
}

#[test]
fn test_file_position_inside_placeholder() {
    let cache = Cache::new();
    let mut top = raw_box(b"jP  ", &[13, 10, 135, 10]);
    top.extend(placeholder(1, 1, &header_bytes(b"asoc", 8 + 27), None, None));
    cache.add_to_databin(BinClass::Meta, 0, 0, &top, 0, true);
    let mut contents = raw_box(b"lbl ", b"first");
    contents.extend(raw_box(b"lbl ", b"second"));
    cache.add_to_databin(BinClass::Meta, 0, 1, &contents, 0, true);

    let family = ContainerSource::open_cache(cache);
    let mut reader = BoxReader::new();
    assert!(reader.open(&family, BoxLocator::at_file_pos(12 + 8 + 13)).unwrap());
    assert_eq!(reader.box_type(), *b"lbl ");
    assert_eq!(reader.locator().databin_id(), Some(1));
    assert_eq!(reader.locator().databin_pos(), 13);
    assert_eq!(reader.read_to_end().unwrap(), b"second".to_vec());
    assert!(reader.close());

    let error = reader.open(&family, BoxLocator::at_file_pos(14)).unwrap_err();
    assert!(is_error(&error, |e| matches!(e, JP2Error::LocatorMismatch { .. })));
}
