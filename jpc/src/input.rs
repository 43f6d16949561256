use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::error;
use std::io;

use crate::codestream::{Codestream, Mode, Precinct};
use crate::markers::{
    read_segment_body, split_packed_headers, CodingStyleComponentSegment,
    CodingStyleMarkerSegment, CommentMarkerSegment, CommentRegistrationValue,
    DecompositionSplitSegment, ImageAndTileSizeMarkerSegment, MarkerSymbol,
    PackedPacketHeaderSegment, QuantizationSegment, StartOfTileSegment, TilePartLengthsSegment,
    MARKER_SYMBOL_COC, MARKER_SYMBOL_COD, MARKER_SYMBOL_COM, MARKER_SYMBOL_CRG,
    MARKER_SYMBOL_DFS, MARKER_SYMBOL_EOC, MARKER_SYMBOL_PLM, MARKER_SYMBOL_PLT,
    MARKER_SYMBOL_POC, MARKER_SYMBOL_PPM, MARKER_SYMBOL_PPT, MARKER_SYMBOL_QCC,
    MARKER_SYMBOL_QCD, MARKER_SYMBOL_RGN, MARKER_SYMBOL_SIZ, MARKER_SYMBOL_SOC,
    MARKER_SYMBOL_SOD, MARKER_SYMBOL_SOP, MARKER_SYMBOL_SOT, MARKER_SYMBOL_TLM, SOT_SEGMENT_LENGTH,
};
use crate::params::{Params, SizParams};
use crate::source::{Capabilities, CompressedSource, Scope};
use crate::tile::TileState;
use crate::CodestreamError;

const READ_CHUNK: usize = 4096;

/// `io::Read` view of a compressed source, counting (and optionally
/// recording) the bytes that pass through.
struct SourceReader<'s, S: CompressedSource + ?Sized> {
    source: &'s mut S,
    consumed: u64,
    record: Option<Vec<u8>>,
}

impl<'s, S: CompressedSource + ?Sized> SourceReader<'s, S> {
    fn new(source: &'s mut S) -> SourceReader<'s, S> {
        SourceReader {
            source,
            consumed: 0,
            record: None,
        }
    }

    fn recording(source: &'s mut S) -> SourceReader<'s, S> {
        SourceReader {
            source,
            consumed: 0,
            record: Some(vec![]),
        }
    }

    /// Reads until `buf` is full or the source has nothing more to give.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let mut total = 0;
        while total < buf.len() {
            let n = io::Read::read(self, &mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

impl<S: CompressedSource + ?Sized> io::Read for SourceReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .source
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.consumed += n as u64;
        if let Some(record) = &mut self.record {
            record.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// Reads whatever the source (or its current scope) holds.
fn read_all<S: CompressedSource + ?Sized>(source: &mut S) -> Result<Vec<u8>, Box<dyn error::Error>> {
    let mut out = vec![];
    let mut chunk = vec![0; READ_CHUNK];
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

enum TilePartData {
    /// Seekable source: location of everything after the SOT segment.
    Indexed { offset: u64, length: u64 },
    Buffered(Vec<u8>),
}

struct TilePart {
    part: u8,
    /// TNsot, or 0 if unknown.
    parts: u8,
    /// Index of the tile-part within the whole codestream.
    global: usize,
    data: TilePartData,
}

/// A tile-part read back: its header segments, the raw header bytes and the
/// packet data following SOD.
struct LoadedPart {
    global: usize,
    segments: Vec<(MarkerSymbol, Vec<u8>)>,
    header: Vec<u8>,
    body: Vec<u8>,
}

/// Reading state of an input codestream.
pub(crate) struct InputState {
    pub main_header: Vec<u8>,
    pub cached: bool,
    pub bytes_read: u64,
    seekable: bool,
    parts: BTreeMap<u32, Vec<TilePart>>,
    parts_seen: usize,
    /// Offset of the next tile-part not yet located.
    scan_offset: u64,
    /// The SOT marker at `scan_offset` has already been read.
    marker_consumed: bool,
    scan_done: bool,
    packed_headers: Vec<Vec<u8>>,
}

impl InputState {
    /// Reads and interprets the main header, leaving a non-cached source
    /// positioned just after the first SOT marker. `Ok(None)` means a
    /// cached source does not yet hold all of the main header.
    pub fn read_main_header<S: CompressedSource + ?Sized>(
        source: &mut S,
    ) -> Result<Option<(Params, InputState, Vec<String>)>, Box<dyn error::Error>> {
        let capabilities = source.capabilities();
        let cached = capabilities.contains(Capabilities::CACHED);
        let seekable = capabilities.contains(Capabilities::SEEKABLE);
        if cached {
            source.set_scope(Scope::MainHeader)?;
        }

        let mut reader = SourceReader::recording(source);
        let mut marker: MarkerSymbol = [0; 2];
        if reader.fill(&mut marker)? < 2 || marker != MARKER_SYMBOL_SOC {
            if cached && !reader.source.is_scope_complete() {
                debug!("main header not yet cached");
                return Ok(None);
            }
            return Err(CodestreamError::MarkerMissing {
                marker: MARKER_SYMBOL_SOC,
            }
            .into());
        }

        let mut siz: Option<SizParams> = None;
        let mut cod: Option<CodingStyleMarkerSegment> = None;
        let mut cocs: Vec<CodingStyleComponentSegment> = vec![];
        let mut dfs: Option<DecompositionSplitSegment> = None;
        let mut tlm: Vec<TilePartLengthsSegment> = vec![];
        let mut ppm: Vec<PackedPacketHeaderSegment> = vec![];
        let mut comments = vec![];
        let mut qcd_seen = false;
        let mut marker_consumed = false;
        let mut scan_done = cached;
        let header_end;

        loop {
            let offset = reader.consumed;
            let n = reader.fill(&mut marker)?;
            if n < 2 {
                if cached {
                    header_end = offset;
                    break;
                }
                return Err(CodestreamError::Truncated { offset }.into());
            }
            if marker == MARKER_SYMBOL_SOT {
                header_end = offset;
                marker_consumed = true;
                break;
            }
            if marker == MARKER_SYMBOL_EOC {
                warn!("codestream holds no tile-parts");
                header_end = offset;
                scan_done = true;
                break;
            }
            let body = match read_segment_body(&mut reader)? {
                Some(body) => body,
                None if cached => return Ok(None),
                None => return Err(CodestreamError::Truncated { offset }.into()),
            };
            if siz.is_none() && marker != MARKER_SYMBOL_SIZ {
                return Err(CodestreamError::MarkerUnexpected { marker, offset }.into());
            }
            let num_components = siz.as_ref().map(|s| s.num_components()).unwrap_or(0) as u16;
            let mut segment = body.as_slice();
            match marker {
                MARKER_SYMBOL_SIZ => {
                    let decoded = ImageAndTileSizeMarkerSegment::decode(&mut segment, offset)?;
                    siz = Some(SizParams::from_segment(&decoded));
                }
                MARKER_SYMBOL_COD => {
                    cod = Some(CodingStyleMarkerSegment::decode(&mut segment, offset)?);
                }
                MARKER_SYMBOL_COC => {
                    cocs.push(CodingStyleComponentSegment::decode(&mut segment, offset, num_components)?);
                }
                MARKER_SYMBOL_QCD => {
                    QuantizationSegment::decode(&mut segment, body.len(), None)?;
                    qcd_seen = true;
                }
                MARKER_SYMBOL_QCC => {
                    QuantizationSegment::decode_component(&mut segment, body.len(), num_components)?;
                }
                MARKER_SYMBOL_DFS => dfs = Some(DecompositionSplitSegment::decode(&mut segment)?),
                MARKER_SYMBOL_TLM => tlm.push(TilePartLengthsSegment::decode(&mut segment, body.len())?),
                MARKER_SYMBOL_PPM => ppm.push(PackedPacketHeaderSegment::decode(&mut segment)?),
                MARKER_SYMBOL_COM => {
                    let comment = CommentMarkerSegment::decode(&mut segment)?;
                    match (comment.registration_value(), comment.comment_utf8()) {
                        (CommentRegistrationValue::Latin, Ok(text)) => comments.push(text.to_string()),
                        _ => debug!("binary comment at byte offset {} skipped", offset),
                    }
                }
                MARKER_SYMBOL_RGN | MARKER_SYMBOL_CRG | MARKER_SYMBOL_PLM => {
                    info!(
                        "marker 0x{:02X}{:02X} at byte offset {} ignored",
                        marker[0], marker[1], offset
                    );
                }
                MARKER_SYMBOL_POC => {
                    return Err(CodestreamError::Unsupported {
                        feature: "progression order changes (POC)".to_string(),
                    }
                    .into())
                }
                _ => warn!(
                    "unknown marker 0x{:02X}{:02X} at byte offset {} skipped",
                    marker[0], marker[1], offset
                ),
            }
        }

        if cached && !reader.source.is_scope_complete() {
            debug!("main header not yet completely cached");
            return Ok(None);
        }
        let siz = siz.ok_or(CodestreamError::MarkerMissing {
            marker: MARKER_SYMBOL_SIZ,
        })?;
        let cod = cod.ok_or(CodestreamError::MarkerMissing {
            marker: MARKER_SYMBOL_COD,
        })?;
        if !qcd_seen {
            warn!("main header has no QCD segment");
        }

        let mut params = Params::new(siz);
        if let Some(dfs) = &dfs {
            params.apply_splits(dfs);
        }
        params.main_coding_mut().apply_cod(&cod)?;
        for coc in &cocs {
            params
                .component_coding_mut(coc.component_index())
                .apply_coc(coc)?;
        }
        params.mark_finalized();

        let mut main_header = reader.record.take().unwrap_or_default();
        main_header.truncate(header_end as usize);
        let bytes_read = reader.consumed;

        let mut input = InputState {
            main_header,
            cached,
            bytes_read,
            seekable,
            parts: BTreeMap::new(),
            parts_seen: 0,
            scan_offset: header_end,
            marker_consumed,
            scan_done,
            packed_headers: split_packed_headers(&ppm)?,
        };
        if !tlm.is_empty() && seekable && !cached {
            input.index_from_tlm(&mut tlm);
        }
        info!(
            "main header read: {} bytes, {} tiles, {} components",
            header_end,
            params.siz.num_tiles(),
            params.siz.num_components()
        );
        Ok(Some((params, input, comments)))
    }

    /// Locates every tile-part from TLM lengths, without scanning.
    fn index_from_tlm(&mut self, tlm: &mut [TilePartLengthsSegment]) {
        tlm.sort_by_key(|segment| segment.index());
        let mut offset = self.scan_offset;
        for (entry, (tile, length)) in tlm
            .iter()
            .flat_map(|segment| segment.entries().iter().copied())
            .enumerate()
        {
            let tile = tile.map(|t| t as u32).unwrap_or(entry as u32);
            let parts = self.parts.entry(tile).or_default();
            let part = parts.len() as u8;
            parts.push(TilePart {
                part,
                parts: 0,
                global: entry,
                data: TilePartData::Indexed {
                    offset: offset + SOT_SEGMENT_LENGTH as u64,
                    length: (length as u64).saturating_sub(SOT_SEGMENT_LENGTH as u64),
                },
            });
            offset += length as u64;
            self.parts_seen = entry + 1;
        }
        for parts in self.parts.values_mut() {
            let count = parts.len() as u8;
            for part in parts.iter_mut() {
                part.parts = count;
            }
        }
        self.marker_consumed = false;
        self.scan_done = true;
        debug!("{} tile-parts located from TLM", self.parts_seen);
    }

    fn tile_located(&self, tile: u32) -> bool {
        match self.parts.get(&tile) {
            Some(parts) => {
                let total = parts.iter().map(|p| p.parts).max().unwrap_or(0);
                total > 0 && parts.len() >= total as usize
            }
            None => false,
        }
    }

    /// Reads the next SOT segment and indexes (or buffers) its tile-part.
    fn scan_next_part<S: CompressedSource + ?Sized>(
        &mut self,
        source: &mut S,
        num_tiles: u32,
        resilient: bool,
    ) -> Result<(), Box<dyn error::Error>> {
        if self.seekable && !self.marker_consumed && !source.seek(self.scan_offset)? {
            self.seekable = false;
        }
        let mut reader = SourceReader::new(source);
        let mut marker: MarkerSymbol = MARKER_SYMBOL_SOT;
        if self.marker_consumed {
            self.marker_consumed = false;
        } else {
            if reader.fill(&mut marker)? < 2 {
                warn!("codestream ends at byte {} without EOC", self.scan_offset);
                self.scan_done = true;
                return Ok(());
            }
            if marker == MARKER_SYMBOL_EOC {
                debug!("EOC at byte offset {}", self.scan_offset);
                self.scan_done = true;
                self.bytes_read += 2;
                return Ok(());
            }
        }
        if marker != MARKER_SYMBOL_SOT {
            let error = CodestreamError::MarkerUnexpected {
                marker,
                offset: self.scan_offset,
            };
            self.scan_done = true;
            if resilient {
                warn!("{}; ignoring the rest of the codestream", error);
                return Ok(());
            }
            return Err(error.into());
        }

        let sot = StartOfTileSegment::decode(&mut reader)?;
        let tile = sot.tile_index() as u32;
        if tile >= num_tiles {
            self.scan_done = true;
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_SOT,
                error: format!("tile index {} out of range", tile),
            }
            .into());
        }
        let length = sot.tile_length() as u64;
        let data = if length == 0 {
            // Last tile-part, running up to EOC.
            let mut rest = vec![];
            io::Read::read_to_end(&mut reader, &mut rest)?;
            if rest.ends_with(&MARKER_SYMBOL_EOC) {
                rest.truncate(rest.len() - 2);
            }
            self.scan_done = true;
            TilePartData::Buffered(rest)
        } else if length < SOT_SEGMENT_LENGTH as u64 + 2 {
            self.scan_done = true;
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_SOT,
                error: format!("Psot {} too small", length),
            }
            .into());
        } else if self.seekable {
            TilePartData::Indexed {
                offset: self.scan_offset + SOT_SEGMENT_LENGTH as u64,
                length: length - SOT_SEGMENT_LENGTH as u64,
            }
        } else {
            let wanted = length - SOT_SEGMENT_LENGTH as u64;
            let mut buffer = vec![];
            io::Read::read_to_end(&mut io::Read::take(&mut reader, wanted), &mut buffer)?;
            if (buffer.len() as u64) < wanted {
                self.scan_done = true;
                short_tile_part(tile, self.scan_offset, buffer.len(), wanted, resilient)?;
            }
            TilePartData::Buffered(buffer)
        };
        self.bytes_read += reader.consumed;
        debug!(
            "tile-part {} of tile {} at byte offset {}, Psot {}",
            sot.tile_part_index(),
            tile,
            self.scan_offset,
            length
        );
        self.scan_offset += length;
        self.parts.entry(tile).or_default().push(TilePart {
            part: sot.tile_part_index(),
            parts: sot.no_tile_parts(),
            global: self.parts_seen,
            data,
        });
        self.parts_seen += 1;
        Ok(())
    }

    /// Reads back every tile-part of `tile`, scanning forward as needed.
    fn load_parts<S: CompressedSource + ?Sized>(
        &mut self,
        source: &mut S,
        tile: u32,
        num_tiles: u32,
        resilient: bool,
    ) -> Result<Vec<LoadedPart>, Box<dyn error::Error>> {
        while !self.scan_done && !self.tile_located(tile) {
            self.scan_next_part(source, num_tiles, resilient)?;
        }
        let mut parts = match self.parts.get_mut(&tile) {
            Some(parts) => parts.iter_mut().collect::<Vec<_>>(),
            None => vec![],
        };
        parts.sort_by_key(|p| p.part);
        let mut loaded = vec![];
        for part in parts {
            let bytes = match &mut part.data {
                TilePartData::Indexed { offset, length } => {
                    if !source.seek(*offset)? {
                        return Err(CodestreamError::MarkerError {
                            marker: MARKER_SYMBOL_SOT,
                            error: format!("source cannot seek to tile-part data at byte {}", offset),
                        }
                        .into());
                    }
                    let mut buffer = vec![];
                    let mut reader = SourceReader::new(source);
                    io::Read::read_to_end(&mut io::Read::take(&mut reader, *length), &mut buffer)?;
                    self.bytes_read += buffer.len() as u64;
                    if (buffer.len() as u64) < *length {
                        short_tile_part(tile, *offset, buffer.len(), *length, resilient)?;
                    }
                    buffer
                }
                TilePartData::Buffered(buffer) => std::mem::take(buffer),
            };
            let (segments, header, body) = split_tile_part(&bytes)?;
            loaded.push(LoadedPart {
                global: part.global,
                segments,
                header,
                body,
            });
        }
        Ok(loaded)
    }
}

/// A tile-part whose Psot (or TLM length) runs past the end of the data.
fn short_tile_part(tile: u32, offset: u64, found: usize, wanted: u64, resilient: bool) -> Result<(), Box<dyn error::Error>> {
    if !resilient {
        return Err(CodestreamError::Truncated {
            offset: offset + found as u64,
        }
        .into());
    }
    warn!(
        "tile-part of tile {} at byte {} holds {} of {} bytes",
        tile, offset, found, wanted
    );
    Ok(())
}

/// Finds the first SOP marker at or after `from` whose sequence number
/// names a packet after `after`. Returns its offset and packet index.
fn next_sop(body: &[u8], from: usize, after: usize, packets: usize) -> Option<(usize, usize)> {
    let mut offset = from;
    while offset + 6 <= body.len() {
        if body[offset..offset + 2] == MARKER_SYMBOL_SOP && body[offset + 2..offset + 4] == [0, 4] {
            let nsop = u16::from_be_bytes([body[offset + 4], body[offset + 5]]) as usize;
            let first = after + 1;
            let next = first + (nsop + 0x10000 - first % 0x10000) % 0x10000;
            if next < packets {
                return Some((offset, next));
            }
        }
        offset += 1;
    }
    None
}

/// Splits the bytes following an SOT segment into header marker segments
/// and packet data. Bytes without an SOD marker are all header.
fn split_tile_part(
    bytes: &[u8],
) -> Result<(Vec<(MarkerSymbol, Vec<u8>)>, Vec<u8>, Vec<u8>), Box<dyn error::Error>> {
    let mut segments = vec![];
    let mut rest = bytes;
    loop {
        if rest.len() < 2 {
            return Ok((segments, bytes.to_vec(), vec![]));
        }
        let marker: MarkerSymbol = [rest[0], rest[1]];
        rest = &rest[2..];
        if marker == MARKER_SYMBOL_SOD {
            let header_length = bytes.len() - rest.len() - 2;
            return Ok((segments, bytes[..header_length].to_vec(), rest.to_vec()));
        }
        match read_segment_body(&mut rest)? {
            Some(body) => segments.push((marker, body)),
            None => return Ok((segments, bytes.to_vec(), vec![])),
        }
    }
}

impl<'a> Codestream<'a> {
    /// Builds an input tile from its tile-parts. `Ok(None)` means a cached
    /// source does not yet hold the tile header.
    pub(crate) fn load_tile(&mut self, number: u32, generation: u32) -> Result<Option<TileState>, Box<dyn error::Error>> {
        let wrong_mode = || {
            Box::new(CodestreamError::WrongMode {
                operation: "open_tile",
                mode: Mode::Input,
            }) as Box<dyn error::Error>
        };
        if self.input.as_ref().ok_or_else(wrong_mode)?.cached {
            return self.load_cached_tile(number, generation);
        }

        let num_tiles = self.params.siz.num_tiles();
        let resilient = self.resilient;
        let (input, source) = match (self.input.as_mut(), self.source.as_mut()) {
            (Some(input), Some(source)) => (input, source),
            _ => return Err(wrong_mode()),
        };
        let parts = input.load_parts(source.as_mut(), number, num_tiles, resilient)?;
        if parts.is_empty() {
            warn!("no tile-parts found for tile {}", number);
        }
        let mut packed_from_main = vec![];
        let have_ppm = !input.packed_headers.is_empty();
        for part in &parts {
            if let Some(chunk) = input.packed_headers.get(part.global) {
                packed_from_main.extend_from_slice(chunk);
            }
        }

        let mut ppt = vec![];
        let mut body = vec![];
        for (i, part) in parts.iter().enumerate() {
            if i == 0 {
                ppt.extend(self.apply_tile_header(number, &part.segments)?);
            } else {
                for (marker, segment) in &part.segments {
                    if *marker == MARKER_SYMBOL_PPT {
                        ppt.push(PackedPacketHeaderSegment::decode(&mut segment.as_slice())?);
                    }
                }
            }
            body.extend_from_slice(&part.body);
        }

        let headers = if !ppt.is_empty() {
            ppt.sort_by_key(|segment| segment.index());
            Some(
                ppt.iter()
                    .flat_map(|segment| segment.data().iter().copied())
                    .collect::<Vec<u8>>(),
            )
        } else if have_ppm {
            Some(packed_from_main)
        } else {
            None
        };

        let mut state = self.build_tile(number, generation);
        state.header = parts.first().map(|p| p.header.clone()).unwrap_or_default();
        self.parse_tile_packets(&mut state, &body, headers.as_deref())?;
        self.discard_unneeded(&mut state);
        Ok(Some(state))
    }

    /// Applies COD and COC overrides of a first tile-part header; returns
    /// any PPT segments it carries.
    fn apply_tile_header(
        &mut self,
        number: u32,
        segments: &[(MarkerSymbol, Vec<u8>)],
    ) -> Result<Vec<PackedPacketHeaderSegment>, Box<dyn error::Error>> {
        let num_components = self.params.siz.num_components() as u16;
        let mut cod = None;
        let mut cocs = vec![];
        let mut ppt = vec![];
        for (marker, body) in segments {
            let mut segment = body.as_slice();
            match *marker {
                MARKER_SYMBOL_COD => cod = Some(CodingStyleMarkerSegment::decode(&mut segment, 0)?),
                MARKER_SYMBOL_COC => {
                    cocs.push(CodingStyleComponentSegment::decode(&mut segment, 0, num_components)?)
                }
                MARKER_SYMBOL_PPT => ppt.push(PackedPacketHeaderSegment::decode(&mut segment)?),
                MARKER_SYMBOL_POC => {
                    return Err(CodestreamError::Unsupported {
                        feature: "progression order changes (POC)".to_string(),
                    }
                    .into())
                }
                MARKER_SYMBOL_QCD | MARKER_SYMBOL_QCC | MARKER_SYMBOL_RGN | MARKER_SYMBOL_COM
                | MARKER_SYMBOL_PLT => {}
                _ => warn!(
                    "unknown marker 0x{:02X}{:02X} in header of tile {} skipped",
                    marker[0], marker[1], number
                ),
            }
        }
        if let Some(cod) = &cod {
            self.params.tile_coding_mut(number).apply_cod(cod)?;
        }
        for coc in &cocs {
            self.params
                .tile_component_coding_mut(number, coc.component_index())
                .apply_coc(coc)?;
        }
        if cod.is_some() || !cocs.is_empty() {
            debug!("tile {} overrides coding parameters", number);
        }
        Ok(ppt)
    }

    /// Walks the tile's packet sequence over `body`, taking packet headers
    /// from `headers` when they were packed elsewhere.
    ///
    /// In resilient mode a damaged packet is skipped by searching for the
    /// next SOP marker, when the tile has them. Packets skipped that way
    /// count as empty, and so do the remaining packets of every precinct
    /// which lost one.
    fn parse_tile_packets(
        &self,
        state: &mut TileState,
        body: &[u8],
        headers: Option<&[u8]>,
    ) -> Result<(), Box<dyn error::Error>> {
        let number = state.number;
        let use_sop = state.coding.use_sop;
        let use_eph = state.coding.use_eph;
        let can_resync = use_sop && headers.is_none();
        let mut damaged: HashSet<(usize, usize, usize)> = HashSet::new();
        let mut position = 0;
        let mut header_position = 0;
        let mut parsed = 0;
        let mut skipped = 0;
        let mut i = 0;
        while i < state.sequence.len() {
            let step = state.sequence[i];
            let key = (step.component, step.resolution, step.precinct);
            let outcome: Result<bool, Box<dyn error::Error>> = if damaged.contains(&key) {
                Err(CodestreamError::PacketMalformed {
                    tile: number,
                    reason: format!("packet {} belongs to a damaged precinct", i),
                }
                .into())
            } else {
                let precinct = state.comps[step.component].resolutions[step.resolution]
                    .precinct_mut(step.precinct);
                let before = precinct.packets_parsed;
                match headers {
                    None => precinct
                        .parse_packets(&body[position..], before + 1, use_sop, use_eph, number)
                        .map(|used| {
                            position += used;
                            precinct.packets_parsed > before
                        }),
                    Some(headers) => precinct
                        .parse_split_packet(&headers[header_position..], &body[position..], use_eph, number)
                        .map(|used| match used {
                            Some((header_used, body_used)) => {
                                header_position += header_used;
                                position += body_used;
                                true
                            }
                            None => false,
                        }),
                }
            };
            match outcome {
                Ok(true) => {
                    parsed += 1;
                    i += 1;
                }
                Ok(false) => {
                    debug!("tile {} data ends after {} packets", number, parsed);
                    break;
                }
                Err(error) => {
                    if !damaged.contains(&key) {
                        self.warn_or_fail(error)?;
                    }
                    let resumed = if can_resync {
                        next_sop(body, position + 1, i, state.sequence.len())
                    } else {
                        None
                    };
                    let (offset, next) = match resumed {
                        Some(found) => found,
                        None => {
                            warn!("tile {}: no packet to resume from after packet {}", number, i);
                            break;
                        }
                    };
                    for lost in i..next {
                        let step = state.sequence[lost];
                        damaged.insert((step.component, step.resolution, step.precinct));
                        state.comps[step.component].resolutions[step.resolution]
                            .precinct_mut(step.precinct)
                            .packets_parsed += 1;
                    }
                    debug!(
                        "tile {}: packets {} to {} skipped, resuming at byte {}",
                        number,
                        i,
                        next - 1,
                        offset
                    );
                    skipped += next - i;
                    position = offset;
                    i = next;
                }
            }
        }
        info!(
            "tile {}: {} of {} packets parsed ({} skipped) from {} bytes",
            number,
            parsed,
            state.sequence.len(),
            skipped,
            body.len()
        );
        Ok(())
    }

    /// Frees parsed data the current view can never reach.
    fn discard_unneeded(&self, state: &mut TileState) {
        let needed: Vec<bool> = (0..state.comps.len())
            .map(|c| self.component_needed(state, c))
            .collect();
        let discard = self.view.discard_levels as usize;
        for (c, comp) in state.comps.iter_mut().enumerate() {
            let levels = comp.levels();
            let top = levels - discard.min(levels);
            for (r, resolution) in comp.resolutions.iter_mut().enumerate() {
                if needed[c] && r <= top {
                    continue;
                }
                for precinct in resolution.precincts.iter_mut().flatten() {
                    precinct.release();
                }
            }
        }
    }

    fn load_cached_tile(&mut self, number: u32, generation: u32) -> Result<Option<TileState>, Box<dyn error::Error>> {
        let num_tiles = self.params.siz.num_tiles();
        let source = match self.source.as_mut() {
            Some(source) => source,
            None => return Err(self.wrong_mode("open_tile")),
        };
        source.set_scope(Scope::TileHeader {
            tile: number,
            num_tiles,
        })?;
        let bytes = read_all(source.as_mut())?;
        if !source.is_scope_complete() {
            debug!("header of tile {} not yet cached", number);
            return Ok(None);
        }
        if let Some(input) = self.input.as_mut() {
            input.bytes_read += bytes.len() as u64;
        }
        let (segments, header, _) = split_tile_part(&bytes)?;
        if !self.apply_tile_header(number, &segments)?.is_empty() {
            warn!("packed packet headers of cached tile {} ignored", number);
        }
        let mut state = self.build_tile(number, generation);
        state.header = header;
        Ok(Some(state))
    }

    /// Cached input: (re)loads a precinct data-bin unless it is already
    /// complete.
    pub(crate) fn load_cached_precinct(&mut self, precinct: Precinct) -> Result<(), Box<dyn error::Error>> {
        let res = precinct.resolution;
        let tile = res.comp.tile;
        let id = self.precinct_id(precinct)?;
        let (mut fresh, layers, use_sop, use_eph) = {
            let state = self.tile_state(tile)?;
            let resolution = &state.comps[res.comp.component].resolutions[res.resolution];
            if let Some(existing) = &resolution.precincts[precinct.number] {
                if existing.fully_loaded || existing.released {
                    return Ok(());
                }
            }
            (
                resolution.new_precinct(precinct.number),
                state.layers(),
                state.coding.use_sop,
                state.coding.use_eph,
            )
        };

        let source = match self.source.as_mut() {
            Some(source) => source,
            None => return Err(self.wrong_mode("open_precinct")),
        };
        source.set_scope(Scope::Precinct { id })?;
        let bytes = read_all(source.as_mut())?;
        let complete = source.is_scope_complete();
        if let Some(input) = self.input.as_mut() {
            input.bytes_read += bytes.len() as u64;
        }
        if let Err(error) = fresh.parse_packets(&bytes, layers, use_sop, use_eph, tile.number) {
            self.warn_or_fail(error)?;
        }
        fresh.fully_loaded = complete;
        debug!(
            "precinct data-bin {}: {} bytes, {} packets{}",
            id,
            bytes.len(),
            fresh.packets_parsed,
            if complete { ", complete" } else { "" }
        );

        let state = self.tile_state_mut(tile)?;
        let slot = &mut state.comps[res.comp.component].resolutions[res.resolution].precincts[precinct.number];
        if let Some(previous) = slot {
            for (band, previous_band) in fresh.bands.iter_mut().zip(previous.bands.iter()) {
                for (block, previous_block) in band.blocks.iter_mut().zip(previous_band.blocks.iter()) {
                    block.opened = previous_block.opened;
                }
            }
            fresh.closed = previous.closed;
        }
        *slot = Some(fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_tile_part() {
        let bytes = [0xFF, 0x64, 0x00, 0x04, 0x00, 0x01, 0xFF, 0x93, 0xAA, 0xBB];
        let (segments, header, body) = split_tile_part(&bytes).unwrap();
        assert_eq!(segments, vec![(MARKER_SYMBOL_COM, vec![0x00, 0x01])]);
        assert_eq!(header, bytes[..6].to_vec());
        assert_eq!(body, vec![0xAA, 0xBB]);

        let (segments, header, body) = split_tile_part(&bytes[..6]).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(header.len(), 6);
        assert!(body.is_empty());
    }
}
