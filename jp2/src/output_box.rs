use jpc::CompressedTarget;
use log::{debug, info, warn};
use std::error;

use crate::family::{ContainerTarget, TargetState};
use crate::{box_type_name, BoxType, JP2Error};

const EXTENDED_HEADER_LENGTH: u64 = 16;

/// Box header for contents of the given length; `None` writes a box which
/// extends to the end of its container.
pub(crate) fn encode_header(box_type: BoxType, contents_length: Option<u64>) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    match contents_length {
        None => {
            header.extend_from_slice(&0u32.to_be_bytes());
            header.extend_from_slice(&box_type);
        }
        Some(length) if length + 8 <= u32::MAX as u64 => {
            header.extend_from_slice(&((length + 8) as u32).to_be_bytes());
            header.extend_from_slice(&box_type);
        }
        Some(length) => return encode_extended_header(box_type, length),
    }
    header
}

fn encode_extended_header(box_type: BoxType, contents_length: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&1u32.to_be_bytes());
    header.extend_from_slice(&box_type);
    header.extend_from_slice(&(contents_length + EXTENDED_HEADER_LENGTH).to_be_bytes());
    header
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Contents are held until the box closes and its length is known.
    Buffered,
    /// The header is out; contents pass straight to the container.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Local { cursor: u64, limit: u64 },
    Delegated,
}

#[derive(Debug)]
pub(crate) struct WriterRecord {
    box_type: BoxType,
    parent: Option<u64>,
    child: Option<u64>,
    mode: Mode,
    buffer: Vec<u8>,
    size: u64,
    target_size: Option<u64>,
    rubber: bool,
    header_last: bool,
    rewrite: Option<Rewrite>,
    failed: bool,
}

impl WriterRecord {
    fn new(box_type: BoxType, parent: Option<u64>) -> WriterRecord {
        WriterRecord {
            box_type,
            parent,
            child: None,
            mode: Mode::Buffered,
            buffer: vec![],
            size: 0,
            target_size: None,
            rubber: false,
            header_last: false,
            rewrite: None,
            failed: false,
        }
    }
}

impl<'a> TargetState<'a> {
    fn open_writer(&mut self, parent: Option<u64>, box_type: BoxType) -> Result<u64, JP2Error> {
        match parent {
            None => {
                if let Some(open) = self.top_open.and_then(|id| self.writers.get(&id)) {
                    return Err(JP2Error::BoxLocked {
                        box_type: open.box_type,
                    });
                }
                if self.rubber_closed {
                    return Err(JP2Error::RubberNotLast);
                }
            }
            Some(parent) => match self.writers.get(&parent) {
                None => return Err(JP2Error::BoxNotOpen),
                Some(record) if record.child.is_some() => {
                    return Err(JP2Error::BoxLocked {
                        box_type: record.box_type,
                    })
                }
                Some(_) => {}
            },
        }
        let id = self.next_id();
        self.writers.insert(id, WriterRecord::new(box_type, parent));
        match parent {
            None => self.top_open = Some(id),
            Some(parent) => {
                if let Some(record) = self.writers.get_mut(&parent) {
                    record.child = Some(id);
                }
            }
        }
        debug!("{} box opened for writing", box_type_name(&box_type));
        Ok(id)
    }

    /// Passes bytes to the container of a box: its parent, or the target.
    fn emit(&mut self, parent: Option<u64>, data: &[u8]) -> bool {
        match parent {
            None => self.sink_write(data),
            Some(parent) => self.append(parent, data),
        }
    }

    /// Adds bytes to the contents of a box, or overwrites them while a
    /// rewrite is in progress.
    fn append(&mut self, id: u64, data: &[u8]) -> bool {
        let record = match self.writers.get_mut(&id) {
            Some(record) => record,
            None => return false,
        };
        match record.rewrite {
            Some(Rewrite::Local { cursor, limit }) => {
                let end = cursor + data.len() as u64;
                if end > limit {
                    return false;
                }
                record.buffer[cursor as usize..end as usize].copy_from_slice(data);
                record.rewrite = Some(Rewrite::Local { cursor: end, limit });
                true
            }
            Some(Rewrite::Delegated) => {
                let parent = record.parent;
                self.emit(parent, data)
            }
            None => {
                record.size += data.len() as u64;
                match record.mode {
                    Mode::Buffered => {
                        record.buffer.extend_from_slice(data);
                        true
                    }
                    Mode::Streaming => {
                        let parent = record.parent;
                        self.emit(parent, data)
                    }
                }
            }
        }
    }

    fn write(&mut self, id: u64, data: &[u8]) -> bool {
        let record = match self.writers.get(&id) {
            Some(record) => record,
            None => return false,
        };
        if record.child.is_some() {
            warn!(
                "write to {} box while a sub-box is open",
                box_type_name(&record.box_type)
            );
            return false;
        }
        if record.failed {
            return false;
        }
        if let (None, Some(target)) = (record.rewrite, record.target_size) {
            if record.size + data.len() as u64 > target {
                warn!(
                    "{} box would exceed its declared {} bytes",
                    box_type_name(&record.box_type),
                    target
                );
                return false;
            }
        }
        let rewriting = record.rewrite.is_some();
        let ok = self.append(id, data);
        if !ok && !rewriting {
            if let Some(record) = self.writers.get_mut(&id) {
                record.failed = true;
            }
        }
        ok
    }

    /// Switches a buffered box to streaming after emitting `header` and
    /// whatever was buffered.
    fn start_streaming(&mut self, id: u64, header: Vec<u8>) -> bool {
        let (parent, buffer) = match self.writers.get_mut(&id) {
            Some(record) => {
                record.mode = Mode::Streaming;
                (record.parent, std::mem::take(&mut record.buffer))
            }
            None => return false,
        };
        let ok = self.emit(parent, &header) && self.emit(parent, &buffer);
        if !ok {
            if let Some(record) = self.writers.get_mut(&id) {
                record.failed = true;
            }
        }
        ok
    }

    fn set_rubber_length(&mut self, id: u64) -> bool {
        let (box_type, parent) = match self.writers.get(&id) {
            Some(record) if record.rubber => return true,
            Some(record) if record.mode == Mode::Streaming || record.rewrite.is_some() => {
                return false
            }
            Some(record) => (record.box_type, record.parent),
            None => return false,
        };
        if let Some(parent) = parent {
            if !self.set_rubber_length(parent) {
                return false;
            }
        }
        if let Some(record) = self.writers.get_mut(&id) {
            record.rubber = true;
        }
        info!("{} box extends to the end of its container", box_type_name(&box_type));
        self.start_streaming(id, encode_header(box_type, None))
    }

    fn set_target_size(&mut self, id: u64, size: u64) -> bool {
        let box_type = match self.writers.get_mut(&id) {
            Some(record)
                if record.mode == Mode::Buffered
                    && record.rewrite.is_none()
                    && record.size <= size =>
            {
                record.target_size = Some(size);
                record.box_type
            }
            _ => return false,
        };
        self.start_streaming(id, encode_header(box_type, Some(size)))
    }

    fn write_header_last(&mut self, id: u64) -> bool {
        let has_sink = self.has_sink();
        let box_type = match self.writers.get_mut(&id) {
            Some(record)
                if record.mode == Mode::Buffered
                    && record.rewrite.is_none()
                    && record.parent.is_none()
                    && has_sink =>
            {
                record.header_last = true;
                record.box_type
            }
            _ => return false,
        };
        self.start_streaming(id, encode_extended_header(box_type, 0))
    }

    fn start_rewrite(&mut self, id: u64, backtrack: u64) -> bool {
        let (mode, size, parent) = match self.writers.get(&id) {
            Some(record) if record.rewrite.is_none() && backtrack <= record.size => {
                (record.mode, record.size, record.parent)
            }
            _ => return false,
        };
        let rewrite = match mode {
            Mode::Buffered => Rewrite::Local {
                cursor: size - backtrack,
                limit: size,
            },
            Mode::Streaming => {
                let ok = match parent {
                    None => self.sink_start_rewrite(backtrack),
                    Some(parent) => self.start_rewrite(parent, backtrack),
                };
                if !ok {
                    return false;
                }
                Rewrite::Delegated
            }
        };
        if let Some(record) = self.writers.get_mut(&id) {
            record.rewrite = Some(rewrite);
        }
        true
    }

    fn end_rewrite(&mut self, id: u64) -> bool {
        let (rewrite, parent) = match self.writers.get_mut(&id) {
            Some(record) => (record.rewrite.take(), record.parent),
            None => return false,
        };
        match rewrite {
            None => false,
            Some(Rewrite::Local { .. }) => true,
            Some(Rewrite::Delegated) => match parent {
                None => self.sink_end_rewrite(),
                Some(parent) => self.end_rewrite(parent),
            },
        }
    }

    pub(crate) fn close_writer(&mut self, id: u64) -> bool {
        if let Some(outcome) = self.outcomes.get(&id) {
            return *outcome;
        }
        let child = match self.writers.get(&id) {
            Some(record) => record.child,
            None => return false,
        };
        if let Some(child) = child {
            warn!("closing a box with an open sub-box");
            self.close_writer(child);
        }
        if self.writers.get(&id).map_or(false, |r| r.rewrite.is_some()) {
            self.end_rewrite(id);
        }
        let record = match self.writers.remove(&id) {
            Some(record) => record,
            None => return false,
        };
        let mut ok = !record.failed;
        match record.mode {
            Mode::Buffered => {
                if record.parent.is_some() || self.has_sink() {
                    let header = encode_header(record.box_type, Some(record.size));
                    ok = ok
                        && self.emit(record.parent, &header)
                        && self.emit(record.parent, &record.buffer);
                }
            }
            Mode::Streaming => {
                if let Some(target) = record.target_size {
                    if record.size != target {
                        warn!(
                            "{} box holds {} bytes, {} were declared",
                            box_type_name(&record.box_type),
                            record.size,
                            target
                        );
                        ok = false;
                    }
                }
                if record.header_last {
                    let header = encode_extended_header(record.box_type, record.size);
                    ok = ok
                        && self.sink_start_rewrite(EXTENDED_HEADER_LENGTH + record.size)
                        && self.sink_write(&header)
                        && self.sink_end_rewrite();
                }
            }
        }
        match record.parent {
            None => {
                self.top_open = None;
                if record.rubber {
                    self.rubber_closed = true;
                }
            }
            Some(parent) => {
                if let Some(parent) = self.writers.get_mut(&parent) {
                    parent.child = None;
                }
            }
        }
        debug!(
            "{} box closed with {} bytes of contents",
            box_type_name(&record.box_type),
            record.size
        );
        self.outcomes.insert(id, ok);
        ok
    }
}

/// Writes one box into a container target or into an enclosing box.
///
/// Contents are buffered until the box closes, at which point the header is
/// written with the exact length. Boxes which are too large to buffer either
/// declare their size up front, switch to rubber length, or have their header
/// written last through a rewrite of the target.
pub struct BoxWriter<'a> {
    target: ContainerTarget<'a>,
    id: u64,
    parent: Option<u64>,
    box_type: BoxType,
    open: bool,
}

impl<'a> BoxWriter<'a> {
    /// Opens a top-level box. Only one top-level box may be open at a time;
    /// a `rubber` box streams straight to the target and must be the last.
    pub fn open(
        target: &ContainerTarget<'a>,
        box_type: BoxType,
        rubber: bool,
    ) -> Result<BoxWriter<'a>, Box<dyn error::Error>> {
        let id = target.lock().open_writer(None, box_type)?;
        let mut writer = BoxWriter {
            target: target.clone(),
            id,
            parent: None,
            box_type,
            open: true,
        };
        if rubber && !writer.set_rubber_length() {
            return Err(JP2Error::RubberNotLast.into());
        }
        Ok(writer)
    }

    /// Opens a box with no target, whose contents are collected with
    /// [`BoxWriter::contents`].
    pub fn open_detached(box_type: BoxType) -> BoxWriter<'a> {
        let target = ContainerTarget::detached();
        let id = target.lock().open_writer(None, box_type).unwrap_or_default();
        BoxWriter {
            target,
            id,
            parent: None,
            box_type,
            open: true,
        }
    }

    /// Opens a sub-box. This box accepts no writes of its own until the
    /// sub-box is closed.
    pub fn open_sub(
        &mut self,
        box_type: BoxType,
        rubber: bool,
    ) -> Result<BoxWriter<'a>, Box<dyn error::Error>> {
        if !self.open {
            return Err(JP2Error::BoxNotOpen.into());
        }
        let id = self.target.lock().open_writer(Some(self.id), box_type)?;
        let mut writer = BoxWriter {
            target: self.target.clone(),
            id,
            parent: Some(self.id),
            box_type,
            open: true,
        };
        if rubber && !writer.set_rubber_length() {
            return Err(JP2Error::RubberNotLast.into());
        }
        Ok(writer)
    }

    /// Closes this box and opens a sibling of the same type in its place.
    pub fn open_next(&mut self) -> Result<(), Box<dyn error::Error>> {
        if !self.close() {
            warn!("{} box did not close cleanly", box_type_name(&self.box_type));
        }
        self.id = self.target.lock().open_writer(self.parent, self.box_type)?;
        self.open = true;
        Ok(())
    }

    pub fn box_type(&self) -> BoxType {
        self.box_type
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Appends bytes to the contents. Returns false if they could not be
    /// written, or would overflow an active rewrite window or a declared
    /// size.
    pub fn write(&mut self, data: &[u8]) -> bool {
        self.open && self.target.lock().write(self.id, data)
    }

    pub fn write_u8(&mut self, value: u8) -> bool {
        self.write(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> bool {
        self.write(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> bool {
        self.write(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> bool {
        self.write(&value.to_be_bytes())
    }

    /// Makes the box extend to the end of its container. Enclosing boxes
    /// become rubber boxes too.
    pub fn set_rubber_length(&mut self) -> bool {
        self.open && self.target.lock().set_rubber_length(self.id)
    }

    /// Declares the final contents length so that the header can be written
    /// at once; closing with any other length fails.
    pub fn set_target_size(&mut self, size: u64) -> bool {
        self.open && self.target.lock().set_target_size(self.id, size)
    }

    /// Streams the contents behind a provisional header which is rewritten
    /// on close. Needs a top-level box and a target which supports rewrites.
    pub fn write_header_last(&mut self) -> bool {
        self.open && self.target.lock().write_header_last(self.id)
    }

    /// Moves the write position back `backtrack` bytes. Until
    /// [`BoxWriter::end_rewrite`] writes overwrite existing contents and may
    /// not go past the position where the rewrite started.
    pub fn start_rewrite(&mut self, backtrack: u64) -> bool {
        self.open && self.target.lock().start_rewrite(self.id, backtrack)
    }

    pub fn end_rewrite(&mut self) -> bool {
        self.open && self.target.lock().end_rewrite(self.id)
    }

    /// Number of contents bytes written so far.
    pub fn contents_length(&self) -> u64 {
        self.target
            .lock()
            .writers
            .get(&self.id)
            .map_or(0, |record| record.size)
    }

    /// Buffered contents of the box, if it has not switched to streaming.
    pub fn contents(&self) -> Option<Vec<u8>> {
        let state = self.target.lock();
        let record = state.writers.get(&self.id)?;
        match record.mode {
            Mode::Buffered => Some(record.buffer.clone()),
            Mode::Streaming => None,
        }
    }

    /// Writes out anything still buffered. Closing again returns the same
    /// result.
    pub fn close(&mut self) -> bool {
        let ok = self.target.lock().close_writer(self.id);
        self.open = false;
        ok
    }
}

impl<'a> Drop for BoxWriter<'a> {
    fn drop(&mut self) {
        if self.open {
            self.close();
        }
    }
}

impl<'a> CompressedTarget for BoxWriter<'a> {
    fn write(&mut self, data: &[u8]) -> bool {
        BoxWriter::write(self, data)
    }

    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        BoxWriter::start_rewrite(self, backtrack)
    }

    fn end_rewrite(&mut self) -> bool {
        BoxWriter::end_rewrite(self)
    }

    fn bytes_written(&self) -> u64 {
        self.contents_length()
    }

    fn close(&mut self) -> bool {
        BoxWriter::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BOX_TYPE_CONTIGUOUS_CODESTREAM;

    #[test]
    fn test_headers() {
        assert_eq!(
            encode_header(*b"test", Some(4)),
            vec![0, 0, 0, 12, b't', b'e', b's', b't']
        );
        assert_eq!(
            encode_header(BOX_TYPE_CONTIGUOUS_CODESTREAM, None),
            vec![0, 0, 0, 0, b'j', b'p', b'2', b'c']
        );
        let header = encode_header(*b"huge", Some(1 << 32));
        assert_eq!(header.len(), 16);
        assert_eq!(&header[..4], &[0, 0, 0, 1]);
        assert_eq!(&header[8..], &((1u64 << 32) + 16).to_be_bytes());
    }

    #[test]
    fn test_detached_box() {
        let mut writer = BoxWriter::open_detached(*b"xml ");
        assert!(writer.write(b"<a/>"));
        assert!(writer.start_rewrite(3));
        assert!(writer.write(b"b"));
        assert!(!writer.write(b"cde"));
        assert!(writer.end_rewrite());
        assert_eq!(writer.contents().unwrap(), b"<b/>".to_vec());
        assert!(writer.close());
        assert!(writer.close());
    }
}
