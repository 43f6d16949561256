use jpc::{Capabilities, CompressedSource, Scope};
use log::{debug, info, warn};
use std::error;
use std::io;

use crate::cache::Cache;
use crate::family::{ContainerSource, Resume, SourceState};
use crate::locator::BoxLocator;
use crate::{box_type_name, BoxType, JP2Error, BOX_TYPE_PLACEHOLDER};

const PLACEHOLDER_ORIGINAL: u32 = 1;
const PLACEHOLDER_EQUIVALENT: u32 = 2;
const PLACEHOLDER_CODESTREAM: u32 = 4;
/// Flags, OrigID, OrigBH, EquivID, EquivBH, CSID and NCS at their longest.
const PLACEHOLDER_MAX_CONTENTS: u64 = 4 + 8 + 16 + 8 + 16 + 8 + 4;

/// LBox/TBox[/XLBox] as found in the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub box_type: BoxType,
    pub header_length: u64,
    /// Total box length, `None` for a box running to the end of its
    /// container.
    pub box_length: Option<u64>,
}

impl RawHeader {
    fn contents_length(&self) -> Option<u64> {
        self.box_length.map(|l| l - self.header_length)
    }
}

/// Parses a box header from the start of `bytes`. `Ok(None)` means more
/// bytes are needed.
pub(crate) fn parse_header(bytes: &[u8], offset: u64) -> Result<Option<RawHeader>, JP2Error> {
    if bytes.len() < 8 {
        return Ok(None);
    }
    let lbox = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let box_type = [bytes[4], bytes[5], bytes[6], bytes[7]];
    match lbox {
        0 => Ok(Some(RawHeader {
            box_type,
            header_length: 8,
            box_length: None,
        })),
        1 => {
            if bytes.len() < 16 {
                return Ok(None);
            }
            let mut xlbox = [0u8; 8];
            xlbox.copy_from_slice(&bytes[8..16]);
            let xlbox = u64::from_be_bytes(xlbox);
            if xlbox < 16 {
                return Err(JP2Error::BoxMalformed {
                    box_type,
                    offset,
                    reason: format!("extended length {} is shorter than its header", xlbox),
                });
            }
            Ok(Some(RawHeader {
                box_type,
                header_length: 16,
                box_length: Some(xlbox),
            }))
        }
        2..=7 => Err(JP2Error::BoxLengthReserved {
            length: lbox,
            offset,
        }),
        length => Ok(Some(RawHeader {
            box_type,
            header_length: 8,
            box_length: Some(length as u64),
        })),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placeholder {
    pub flags: u32,
    pub original_bin: u64,
    pub original: RawHeader,
    pub equivalent: Option<(u64, RawHeader)>,
    pub codestream: Option<(u64, u32)>,
}

fn take<'b>(contents: &'b [u8], offset: &mut usize, count: usize) -> Option<&'b [u8]> {
    let slice = contents.get(*offset..*offset + count)?;
    *offset += count;
    Some(slice)
}

fn take_u64(contents: &[u8], offset: &mut usize) -> Option<u64> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(take(contents, offset, 8)?);
    Some(u64::from_be_bytes(bytes))
}

pub(crate) fn parse_placeholder(contents: &[u8], bin_id: u64) -> Result<Placeholder, JP2Error> {
    let malformed = |reason: &str| JP2Error::PlaceholderMalformed {
        bin_id,
        reason: reason.to_string(),
    };
    let mut offset = 0;
    let flags = take(contents, &mut offset, 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed("missing flags"))?;
    let original_bin = take_u64(contents, &mut offset).ok_or_else(|| malformed("missing OrigID"))?;
    let embedded = |offset: &mut usize, what: &str| -> Result<RawHeader, JP2Error> {
        let header = parse_header(&contents[(*offset).min(contents.len())..], 0)
            .map_err(|e| malformed(&format!("{}: {}", what, e)))?
            .ok_or_else(|| malformed(&format!("truncated {}", what)))?;
        *offset += header.header_length as usize;
        Ok(header)
    };
    let original = embedded(&mut offset, "OrigBH")?;
    let equivalent = if flags & PLACEHOLDER_EQUIVALENT != 0 {
        let bin = take_u64(contents, &mut offset).ok_or_else(|| malformed("missing EquivID"))?;
        Some((bin, embedded(&mut offset, "EquivBH")?))
    } else {
        None
    };
    let codestream = if flags & PLACEHOLDER_CODESTREAM != 0 {
        let id = take_u64(contents, &mut offset).ok_or_else(|| malformed("missing CSID"))?;
        let count = take(contents, &mut offset, 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| malformed("missing NCS"))?;
        Some((id, count))
    } else {
        None
    };
    Ok(Placeholder {
        flags,
        original_bin,
        original,
        equivalent,
        codestream,
    })
}

/// A box header as it appears in its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoxHeader {
    Direct(RawHeader),
    Placeholder {
        header: RawHeader,
        placeholder: Placeholder,
    },
}

/// Where the bytes of a box's contents live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Contents {
    /// Meta data-bin holding the contents; `None` for a linear source.
    bin: Option<u64>,
    start: u64,
    limit: Option<u64>,
}

/// A box header resolved to the box it stands for.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    box_type: BoxType,
    /// Bytes the header and contents occupy in the container.
    span: Option<u64>,
    /// Header length and total length in the original file.
    header_length: u64,
    original_length: Option<u64>,
    contents: Contents,
    codestream: Option<u64>,
}

impl BoxHeader {
    fn resolve(&self, bin: Option<u64>, pos: u64, limit: Option<u64>, prefer_originals: bool) -> Resolved {
        match *self {
            BoxHeader::Direct(header) => Resolved {
                box_type: header.box_type,
                span: header.box_length,
                header_length: header.header_length,
                original_length: header.box_length,
                contents: Contents {
                    bin,
                    start: pos + header.header_length,
                    limit: header.box_length.map(|l| pos + l).or(limit),
                },
                codestream: None,
            },
            BoxHeader::Placeholder {
                header,
                placeholder,
            } => {
                let original = Contents {
                    bin: Some(placeholder.original_bin),
                    start: 0,
                    limit: placeholder.original.contents_length(),
                };
                let available = placeholder.flags & PLACEHOLDER_ORIGINAL != 0;
                let (box_type, contents, codestream) = if prefer_originals && available {
                    (placeholder.original.box_type, original, None)
                } else if let Some((id, _)) = placeholder.codestream {
                    (placeholder.original.box_type, Contents::default(), Some(id))
                } else if let Some((bin, equivalent)) = placeholder.equivalent {
                    let contents = Contents {
                        bin: Some(bin),
                        start: 0,
                        limit: equivalent.contents_length(),
                    };
                    (equivalent.box_type, contents, None)
                } else if available {
                    (placeholder.original.box_type, original, None)
                } else {
                    let contents = Contents {
                        bin: None,
                        start: 0,
                        limit: Some(0),
                    };
                    (placeholder.original.box_type, contents, None)
                };
                Resolved {
                    box_type,
                    span: header.box_length,
                    header_length: placeholder.original.header_length,
                    original_length: placeholder.original.box_length,
                    contents,
                    codestream,
                }
            }
        }
    }
}

fn read_at(
    state: &mut SourceState,
    bin: Option<u64>,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize, Box<dyn error::Error>> {
    match bin {
        Some(bin) => Ok(state.read_bin(bin, pos, buf)),
        None => state.read_stream(pos, buf),
    }
}

fn read_full(
    state: &mut SourceState,
    bin: Option<u64>,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize, Box<dyn error::Error>> {
    let mut total = 0;
    while total < buf.len() {
        let count = read_at(state, bin, pos + total as u64, &mut buf[total..])?;
        if count == 0 {
            break;
        }
        total += count;
    }
    Ok(total)
}

fn truncated_header(bytes: &[u8], pos: u64, count: usize) -> Box<dyn error::Error> {
    let mut box_type = [0u8; 4];
    if bytes.len() >= 8 {
        box_type.copy_from_slice(&bytes[4..8]);
    }
    JP2Error::BoxMalformed {
        box_type,
        offset: pos,
        reason: format!("header truncated after {} bytes", count),
    }
    .into()
}

/// Reads the header at `pos`, following a placeholder if there is one.
/// Only the header bytes are consumed, so sequential sources stay usable.
fn read_box_header(
    state: &mut SourceState,
    bin: Option<u64>,
    pos: u64,
    limit: Option<u64>,
) -> Result<Option<BoxHeader>, Box<dyn error::Error>> {
    let available = limit.map_or(16, |l| l.saturating_sub(pos).min(16)) as usize;
    if available < 8 {
        if available > 0 {
            return Err(truncated_header(&[], pos, available));
        }
        return Ok(None);
    }
    let mut bytes = [0u8; 16];
    let mut count = read_full(state, bin, pos, &mut bytes[..8])?;
    if count == 8 && bytes[..4] == [0, 0, 0, 1] && available == 16 {
        count += read_full(state, bin, pos + 8, &mut bytes[8..16])?;
    }
    let header = match parse_header(&bytes[..count], pos)? {
        Some(header) => header,
        None => {
            // Nothing more will arrive, so a partial header cannot be
            // completed, and neither can one which a known limit promised.
            let settled = match bin {
                Some(bin) => state.bin_length(bin).1,
                None => true,
            };
            if settled && (count > 0 || limit.is_some()) {
                return Err(truncated_header(&bytes[..count], pos, count));
            }
            return Ok(None);
        }
    };
    if let (Some(length), Some(limit)) = (header.box_length, limit) {
        if pos + length > limit {
            return Err(JP2Error::BoxMalformed {
                box_type: header.box_type,
                offset: pos,
                reason: format!("{} bytes overrun the enclosing box", pos + length - limit),
            }
            .into());
        }
    }
    let bin = match bin {
        Some(bin) if header.box_type == BOX_TYPE_PLACEHOLDER && state.is_cache() => bin,
        _ => return Ok(Some(BoxHeader::Direct(header))),
    };
    let contents_length = header.contents_length().ok_or_else(|| JP2Error::PlaceholderMalformed {
        bin_id: bin,
        reason: "placeholder without a length".to_string(),
    })?;
    if contents_length > PLACEHOLDER_MAX_CONTENTS {
        return Err(JP2Error::PlaceholderMalformed {
            bin_id: bin,
            reason: format!("{} bytes of contents", contents_length),
        }
        .into());
    }
    let mut contents = vec![0u8; contents_length as usize];
    if state.read_bin(bin, pos + header.header_length, &mut contents) < contents.len() {
        return Ok(None);
    }
    let placeholder = parse_placeholder(&contents, bin)?;
    debug!(
        "placeholder for {} box, flags {}",
        box_type_name(&placeholder.original.box_type),
        placeholder.flags
    );
    Ok(Some(BoxHeader::Placeholder {
        header,
        placeholder,
    }))
}

#[derive(Debug, Clone, Copy)]
struct Site {
    bin: Option<u64>,
    pos: u64,
    limit: Option<u64>,
    file_pos: Option<u64>,
    parent: Option<u64>,
}

/// Finds the header at an original-file offset by walking the top-level
/// boxes of a cache and descending into the ones which contain it.
fn resolve_file_pos(state: &mut SourceState, target: u64) -> Result<Option<Site>, Box<dyn error::Error>> {
    let mut site = Site {
        bin: Some(0),
        pos: 0,
        limit: None,
        file_pos: Some(0),
        parent: None,
    };
    loop {
        let file_pos = site.file_pos.unwrap_or(0);
        if file_pos == target {
            return Ok(Some(site));
        }
        let header = match read_box_header(state, site.bin, site.pos, site.limit)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let resolved = header.resolve(site.bin, site.pos, site.limit, state.prefer_originals);
        match (resolved.original_length, resolved.span) {
            (Some(length), Some(span)) if target >= file_pos + length => {
                site.pos += span;
                site.file_pos = Some(file_pos + length);
            }
            _ => {
                if target < file_pos + resolved.header_length || resolved.contents.bin.is_none() {
                    return Err(JP2Error::LocatorMismatch {
                        reason: format!("file offset {} does not start a box", target),
                    }
                    .into());
                }
                site = Site {
                    bin: resolved.contents.bin,
                    pos: resolved.contents.start,
                    limit: resolved.contents.limit,
                    file_pos: Some(file_pos + resolved.header_length),
                    parent: None,
                };
            }
        }
    }
}

/// Reads one box from a [`ContainerSource`].
///
/// A reader starts out closed. Opening may return `Ok(false)` when the
/// header is not yet available; the reader then stays closed and the open
/// can be retried once more data has arrived. Opening a sub-box locks the
/// super-box until the sub-box closes, and `open_next` on the sub-box keeps
/// the lock while moving to the next sibling.
#[derive(Default)]
pub struct BoxReader<'a> {
    source: Option<ContainerSource<'a>>,
    id: u64,
    parent: Option<u64>,
    box_type: BoxType,
    locator: BoxLocator,
    contents_locator: BoxLocator,
    header_length: u64,
    original_length: Option<u64>,
    file_pos: Option<u64>,
    /// Data-bin and limit of the container the header sits in.
    container: Contents,
    header_pos: u64,
    span: Option<u64>,
    contents: Contents,
    position: u64,
    /// A sub-box running to the end of this box has been opened.
    exhausted: bool,
    next_child_file_pos: Option<u64>,
    codestream: Option<Cache>,
    memory: Option<Vec<u8>>,
    /// Family and header position of a sibling `open_next` is waiting for.
    retry: Option<(ContainerSource<'a>, Site)>,
}

impl<'a> BoxReader<'a> {
    pub fn new() -> BoxReader<'a> {
        BoxReader::default()
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    fn family(&self) -> Result<ContainerSource<'a>, JP2Error> {
        self.source.clone().ok_or(JP2Error::BoxNotOpen)
    }

    fn ensure_closed(&self) -> Result<(), JP2Error> {
        if self.is_open() {
            return Err(JP2Error::ReaderAlreadyOpen {
                box_type: self.box_type,
            });
        }
        Ok(())
    }

    /// Picks up where a sub-box left this box, and fails if a sub-box still
    /// holds the focus.
    fn focus(&mut self) -> Result<ContainerSource<'a>, Box<dyn error::Error>> {
        let source = self.family()?;
        let mut state = source.lock();
        if let Some(resume) = state.take_resume(self.id) {
            match resume.position {
                Some(position) => self.position = position,
                None => self.exhausted = true,
            }
            self.next_child_file_pos = resume.file_pos;
        }
        if state.is_locked(self.id) {
            return Err(JP2Error::BoxLocked {
                box_type: self.box_type,
            }
            .into());
        }
        drop(state);
        Ok(source)
    }

    fn effective_limit(&self, state: &SourceState) -> Option<u64> {
        if self.contents.limit.is_some() {
            return self.contents.limit;
        }
        match self.contents.bin {
            Some(bin) => match state.bin_length(bin) {
                (length, true) => Some(length),
                _ => None,
            },
            None => None,
        }
    }

    fn open_at(&mut self, source: &ContainerSource<'a>, site: Site) -> Result<bool, Box<dyn error::Error>> {
        let mut state = source.lock();
        let header = match read_box_header(&mut state, site.bin, site.pos, site.limit)? {
            Some(header) => header,
            None => {
                debug!("box header at {} not yet available", site.pos);
                return Ok(false);
            }
        };
        let resolved = header.resolve(site.bin, site.pos, site.limit, state.prefer_originals);
        let codestream = match (resolved.codestream, state.cache()) {
            (Some(id), Some(cache)) => {
                let mut cache = cache.clone();
                cache.set_codestream(id);
                Some(cache)
            }
            _ => None,
        };
        let id = state.register(site.parent);
        drop(state);

        let contents_file_pos = site.file_pos.map(|p| p + resolved.header_length);
        let locator = match site.bin {
            Some(bin) => BoxLocator::in_bin(bin, site.pos, site.file_pos),
            None => BoxLocator::at_file_pos(site.pos),
        };
        let contents_locator = match resolved.contents.bin {
            Some(bin) => BoxLocator::in_bin(bin, resolved.contents.start, contents_file_pos),
            None if site.bin.is_none() => BoxLocator::at_file_pos(resolved.contents.start),
            None => contents_file_pos.map(BoxLocator::at_file_pos).unwrap_or_default(),
        };
        *self = BoxReader {
            source: Some(source.clone()),
            id,
            parent: site.parent,
            box_type: resolved.box_type,
            locator,
            contents_locator,
            header_length: resolved.header_length,
            original_length: resolved.original_length,
            file_pos: site.file_pos,
            container: Contents {
                bin: site.bin,
                start: 0,
                limit: site.limit,
            },
            header_pos: site.pos,
            span: resolved.span,
            contents: resolved.contents,
            position: resolved.contents.start,
            exhausted: false,
            next_child_file_pos: contents_file_pos,
            codestream,
            memory: None,
            retry: None,
        };
        info!(
            "{} box start at {:?}",
            box_type_name(&self.box_type),
            self.file_pos.unwrap_or(site.pos)
        );
        Ok(true)
    }

    /// Opens the box identified by `locator`, usually the first box of the
    /// source.
    pub fn open(&mut self, source: &ContainerSource<'a>, locator: BoxLocator) -> Result<bool, Box<dyn error::Error>> {
        self.ensure_closed()?;
        let site = {
            let mut state = source.lock();
            if state.is_cache() {
                match locator.databin_id() {
                    Some(bin) => Site {
                        bin: Some(bin),
                        pos: locator.databin_pos(),
                        limit: None,
                        file_pos: locator.file_pos(),
                        parent: None,
                    },
                    None => {
                        let target = locator.file_pos().unwrap_or(0);
                        match resolve_file_pos(&mut state, target)? {
                            Some(site) => site,
                            None => return Ok(false),
                        }
                    }
                }
            } else {
                if locator.databin_id().is_some() {
                    return Err(JP2Error::LocatorMismatch {
                        reason: "data-bin locator used on a linear source".to_string(),
                    }
                    .into());
                }
                let pos = locator.file_pos().unwrap_or(0);
                Site {
                    bin: None,
                    pos,
                    limit: None,
                    file_pos: Some(pos),
                    parent: None,
                }
            }
        };
        self.open_at(source, site)
    }

    /// Opens the first top-level box.
    pub fn open_first(&mut self, source: &ContainerSource<'a>) -> Result<bool, Box<dyn error::Error>> {
        self.open(source, BoxLocator::new())
    }

    /// Opens the next sub-box of `parent`, which stays locked until this box
    /// is closed.
    pub fn open_sub(&mut self, parent: &mut BoxReader<'a>) -> Result<bool, Box<dyn error::Error>> {
        self.ensure_closed()?;
        let source = parent.focus()?;
        if parent.exhausted || parent.codestream.is_some() {
            return Ok(false);
        }
        let site = Site {
            bin: parent.contents.bin,
            pos: parent.position,
            limit: parent.contents.limit,
            file_pos: parent.next_child_file_pos,
            parent: Some(parent.id),
        };
        if site.limit.map_or(false, |l| site.pos >= l) {
            return Ok(false);
        }
        if !self.open_at(&source, site)? {
            return Ok(false);
        }
        match self.span {
            Some(span) => parent.position = self.header_pos + span,
            None => parent.exhausted = true,
        }
        parent.next_child_file_pos = self.next_sibling_file_pos();
        Ok(true)
    }

    /// Where the header of the next sibling would be, if this box has a
    /// known length.
    pub(crate) fn sibling_locator(&self) -> Option<BoxLocator> {
        let pos = self.header_pos + self.span?;
        Some(match self.container.bin {
            Some(bin) => BoxLocator::in_bin(bin, pos, self.next_sibling_file_pos()),
            None => BoxLocator::at_file_pos(pos),
        })
    }

    fn next_sibling_file_pos(&self) -> Option<u64> {
        match (self.file_pos, self.original_length) {
            (Some(pos), Some(length)) => Some(pos + length),
            _ => None,
        }
    }

    /// Closes this box and opens the one following it, within the same
    /// super-box or at the top level. When the next header is not yet
    /// available the reader is left closed, and calling `open_next` again
    /// retries from the same place.
    pub fn open_next(&mut self) -> Result<bool, Box<dyn error::Error>> {
        let (source, site) = match self.retry.take() {
            Some(pending) if !self.is_open() => pending,
            _ => {
                let source = self.family()?;
                let span = self.span;
                let site = Site {
                    bin: self.container.bin,
                    pos: self.header_pos,
                    limit: self.container.limit,
                    file_pos: self.next_sibling_file_pos(),
                    parent: self.parent,
                };
                self.close();
                let site = match span {
                    Some(span) => Site {
                        pos: site.pos + span,
                        ..site
                    },
                    None => return Ok(false),
                };
                (source, site)
            }
        };
        if site.limit.map_or(false, |l| site.pos >= l) {
            return Ok(false);
        }
        if !self.open_at(&source, site)? {
            self.retry = Some((source, site));
            return Ok(false);
        }
        if let Some(parent) = self.parent {
            let resume = Resume {
                position: self.span.map(|s| self.header_pos + s),
                file_pos: self.next_sibling_file_pos(),
            };
            source.lock().set_resume(parent, resume);
        }
        Ok(true)
    }

    /// Takes over an open box from `other`, which is left closed. The box is
    /// detached from its super-box, which becomes usable again.
    pub fn transplant(&mut self, other: &mut BoxReader<'a>) -> Result<(), Box<dyn error::Error>> {
        self.ensure_closed()?;
        let source = other.family()?;
        source.lock().detach(other.id);
        *self = std::mem::take(other);
        self.parent = None;
        Ok(())
    }

    pub fn box_type(&self) -> BoxType {
        self.box_type
    }

    pub fn locator(&self) -> BoxLocator {
        self.locator
    }

    pub fn contents_locator(&self) -> BoxLocator {
        self.contents_locator
    }

    /// Header length in the original file: 8 or 16.
    pub fn header_length(&self) -> u64 {
        self.header_length
    }

    /// Total length of the box in the original file, header included; `None`
    /// for a box running to the end of its container.
    pub fn box_bytes(&self) -> Option<u64> {
        self.original_length
    }

    pub fn capabilities(&self) -> Capabilities {
        let base = if self.codestream.is_some() {
            Capabilities::CACHED | Capabilities::SEEKABLE
        } else {
            match &self.source {
                Some(source) if source.uses_cache() => {
                    Capabilities::SEQUENTIAL | Capabilities::SEEKABLE
                }
                Some(source) => source.capabilities(),
                None => Capabilities::default(),
            }
        };
        if self.memory.is_some() {
            base | Capabilities::IN_MEMORY
        } else {
            base
        }
    }

    /// Bytes left to read, or -1 if the end of the box is not yet known.
    pub fn remaining_bytes(&self) -> i64 {
        let source = match &self.source {
            Some(source) => source,
            None => return 0,
        };
        let state = source.lock();
        let mut position = self.position;
        let mut exhausted = self.exhausted;
        if let Some(resume) = state.peek_resume(self.id) {
            match resume.position {
                Some(resumed) => position = resumed,
                None => exhausted = true,
            }
        }
        if exhausted {
            return 0;
        }
        match self.effective_limit(&state) {
            Some(limit) => limit.saturating_sub(position) as i64,
            None => -1,
        }
    }

    /// Whether all of the box's contents are available.
    pub fn is_complete(&self) -> bool {
        let source = match &self.source {
            Some(source) => source,
            None => return false,
        };
        if self.memory.is_some() {
            return true;
        }
        if self.codestream.is_some() {
            return false;
        }
        match self.contents.bin {
            Some(bin) => {
                let (length, complete) = source.lock().bin_length(bin);
                complete || self.contents.limit.map_or(false, |l| length >= l)
            }
            None => self.contents.limit.is_some(),
        }
    }

    /// Position within the contents.
    pub fn position(&self) -> u64 {
        self.position.saturating_sub(self.contents.start)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        if let Some(memory) = &self.memory {
            let start = (self.position - self.contents.start).min(memory.len() as u64) as usize;
            let count = buf.len().min(memory.len() - start);
            buf[..count].copy_from_slice(&memory[start..start + count]);
            self.position += count as u64;
            return Ok(count);
        }
        let source = self.focus()?;
        if self.exhausted {
            return Ok(0);
        }
        let mut state = source.lock();
        let limit = self.effective_limit(&state);
        let wanted = match limit {
            Some(limit) => (limit.saturating_sub(self.position)).min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        if wanted == 0 {
            return Ok(0);
        }
        let count = read_at(&mut state, self.contents.bin, self.position, &mut buf[..wanted])?;
        self.position += count as u64;
        if count < wanted && limit.is_none() && self.contents.bin.is_none() && !state.is_cache() {
            debug!(
                "{} box ends at byte {}",
                box_type_name(&self.box_type),
                self.position
            );
            self.contents.limit = Some(self.position);
        }
        Ok(count)
    }

    fn read_array<const N: usize>(&mut self) -> Result<Option<[u8; N]>, Box<dyn error::Error>> {
        let mut bytes = [0u8; N];
        let mut total = 0;
        while total < N {
            let count = self.read(&mut bytes[total..])?;
            if count == 0 {
                return Ok(None);
            }
            total += count;
        }
        Ok(Some(bytes))
    }

    pub fn read_u8(&mut self) -> Result<Option<u8>, Box<dyn error::Error>> {
        Ok(self.read_array::<1>()?.map(|b| b[0]))
    }

    pub fn read_u16(&mut self) -> Result<Option<u16>, Box<dyn error::Error>> {
        Ok(self.read_array::<2>()?.map(u16::from_be_bytes))
    }

    pub fn read_u32(&mut self) -> Result<Option<u32>, Box<dyn error::Error>> {
        Ok(self.read_array::<4>()?.map(u32::from_be_bytes))
    }

    pub fn read_u64(&mut self) -> Result<Option<u64>, Box<dyn error::Error>> {
        Ok(self.read_array::<8>()?.map(u64::from_be_bytes))
    }

    /// Moves to `offset` within the contents. Seeking past the end is
    /// allowed; reads there return nothing.
    pub fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        let target = self.contents.start + offset;
        if self.memory.is_none() {
            let source = self.focus()?;
            if self.codestream.is_some() {
                return Ok(false);
            }
            let seekable = source.capabilities().contains(Capabilities::SEEKABLE);
            if !seekable && target < self.position {
                return Ok(false);
            }
        }
        self.position = target;
        Ok(true)
    }

    /// Reads the whole contents into memory, unless they exceed `max_bytes`
    /// or are not yet all available.
    pub fn load_in_memory(&mut self, max_bytes: u64) -> Result<bool, Box<dyn error::Error>> {
        if self.memory.is_some() {
            return Ok(true);
        }
        if self.codestream.is_some() {
            return Ok(false);
        }
        let source = self.focus()?;
        if source.uses_cache() && !self.is_complete() {
            return Ok(false);
        }
        if let Some(limit) = self.effective_limit(&source.lock()) {
            if limit.saturating_sub(self.contents.start) > max_bytes {
                return Ok(false);
            }
        }
        let saved = self.position;
        self.position = self.contents.start;
        let mut data = vec![];
        let mut chunk = [0u8; 4096];
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..count]);
            if data.len() as u64 > max_bytes {
                self.position = saved;
                return Ok(false);
            }
        }
        let end = self.contents.start + data.len() as u64;
        if let Some(limit) = self.contents.limit {
            if end < limit {
                warn!(
                    "{} box truncated to {} of {} bytes",
                    box_type_name(&self.box_type),
                    data.len(),
                    limit - self.contents.start
                );
            }
        }
        self.contents.limit = Some(end);
        self.position = saved.min(end);
        self.memory = Some(data);
        Ok(true)
    }

    pub fn access_memory(&self) -> Option<&[u8]> {
        self.memory.as_deref()
    }

    /// Reads the rest of the contents into a vector.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, Box<dyn error::Error>> {
        let mut data = vec![];
        let mut chunk = [0u8; 4096];
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..count]);
        }
    }

    /// Scopes reads of an incremental codestream held in a cache. Returns
    /// false for any other box.
    pub fn set_codestream_scope(&mut self, scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        match self.codestream.as_mut() {
            Some(cache) => cache.set_scope(scope),
            None => Ok(false),
        }
    }

    /// Closes the box, releasing its super-box. Returns false if the
    /// contents were not all read, or are not all available in a cache.
    /// Closing a reader which is not open returns true.
    pub fn close(&mut self) -> bool {
        self.retry = None;
        let consumed = match &self.source {
            Some(source) => {
                let cached = source.uses_cache() || self.codestream.is_some();
                self.remaining_bytes() == 0 && (!cached || self.is_complete())
            }
            None => true,
        };
        if let Some(source) = self.source.take() {
            source.lock().release(self.id);
            if consumed {
                debug!("{} box finish", box_type_name(&self.box_type));
            } else {
                debug!("{} box closed before its end", box_type_name(&self.box_type));
            }
        }
        self.codestream = None;
        self.memory = None;
        self.exhausted = false;
        consumed
    }
}

impl<'a> Drop for BoxReader<'a> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'a> io::Read for BoxReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BoxReader::read(self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl<'a> CompressedSource for BoxReader<'a> {
    fn capabilities(&self) -> Capabilities {
        BoxReader::capabilities(self)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        match self.codestream.as_mut() {
            Some(cache) => cache.read(buf),
            None => BoxReader::read(self, buf),
        }
    }

    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        match self.codestream.as_mut() {
            Some(cache) => cache.seek(offset),
            None => BoxReader::seek(self, offset),
        }
    }

    fn position(&self) -> u64 {
        match self.codestream.as_ref() {
            Some(cache) => cache.position(),
            None => BoxReader::position(self),
        }
    }

    fn access_memory(&self) -> Option<&[u8]> {
        BoxReader::access_memory(self)
    }

    fn set_scope(&mut self, scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        self.set_codestream_scope(scope)
    }

    fn is_scope_complete(&self) -> bool {
        match self.codestream.as_ref() {
            Some(cache) => cache.is_scope_complete(),
            None => true,
        }
    }

    fn close(&mut self) -> bool {
        BoxReader::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let header = parse_header(&[0, 0, 0, 20, b'f', b't', b'y', b'p'], 0).unwrap();
        assert_eq!(
            header,
            Some(RawHeader {
                box_type: *b"ftyp",
                header_length: 8,
                box_length: Some(20),
            })
        );
        let header = parse_header(&[0, 0, 0, 0, b'j', b'p', b'2', b'c'], 0).unwrap();
        assert_eq!(header.unwrap().box_length, None);
        assert_eq!(parse_header(&[0, 0, 0, 1, b'j', b'p', b'2', b'c'], 0).unwrap(), None);
        assert!(parse_header(&[0, 0, 0, 5, b'j', b'p', b'2', b'c'], 40).is_err());
        let mut extended = vec![0, 0, 0, 1, b'j', b'p', b'2', b'c'];
        extended.extend_from_slice(&(1u64 << 33).to_be_bytes());
        let header = parse_header(&extended, 0).unwrap().unwrap();
        assert_eq!(header.header_length, 16);
        assert_eq!(header.box_length, Some(1 << 33));
    }

    #[test]
    fn test_parse_placeholder() {
        let mut contents = vec![];
        contents.extend_from_slice(&(PLACEHOLDER_ORIGINAL | PLACEHOLDER_CODESTREAM).to_be_bytes());
        contents.extend_from_slice(&3u64.to_be_bytes());
        contents.extend_from_slice(&[0, 0, 0, 0, b'j', b'p', b'2', b'c']);
        contents.extend_from_slice(&9u64.to_be_bytes());
        contents.extend_from_slice(&1u32.to_be_bytes());
        let placeholder = parse_placeholder(&contents, 0).unwrap();
        assert_eq!(placeholder.original_bin, 3);
        assert_eq!(placeholder.original.box_type, *b"jp2c");
        assert_eq!(placeholder.equivalent, None);
        assert_eq!(placeholder.codestream, Some((9, 1)));

        assert!(parse_placeholder(&contents[..20], 0).is_err());
    }
}
