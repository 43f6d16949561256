use log::{debug, warn};
use std::error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::BitOr;
use std::path::Path;

/// Capability set advertised by a compressed data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const SEQUENTIAL: Capabilities = Capabilities(1);
    pub const SEEKABLE: Capabilities = Capabilities(2);
    pub const IN_MEMORY: Capabilities = Capabilities(4);
    pub const CACHED: Capabilities = Capabilities(8);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Named sub-region of a cached source.
///
/// Cached sources hold the codestream as independent data-bins rather than a
/// linear byte stream; a scope selects which bin subsequent reads come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    MainHeader,
    TileHeader { tile: u32, num_tiles: u32 },
    Precinct { id: u64 },
}

/// Byte provider consumed by the codestream model.
///
/// `read` never waits for data which has not yet arrived; short reads are
/// normal and the caller decides whether they mean exhaustion.
pub trait CompressedSource: Send {
    fn capabilities(&self) -> Capabilities;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>>;

    /// Repositions the read cursor, relative to the start of the source (or
    /// of the current scope). Returns false if the source cannot seek.
    fn seek(&mut self, _offset: u64) -> Result<bool, Box<dyn error::Error>> {
        Ok(false)
    }

    fn position(&self) -> u64;

    fn access_memory(&self) -> Option<&[u8]> {
        None
    }

    fn set_scope(&mut self, _scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        Ok(false)
    }

    /// True once the current scope can no longer grow.
    fn is_scope_complete(&self) -> bool {
        true
    }

    fn close(&mut self) -> bool {
        true
    }
}

impl<T: CompressedSource + ?Sized> CompressedSource for &mut T {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        (**self).read(buf)
    }
    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        (**self).seek(offset)
    }
    fn position(&self) -> u64 {
        (**self).position()
    }
    fn access_memory(&self) -> Option<&[u8]> {
        (**self).access_memory()
    }
    fn set_scope(&mut self, scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        (**self).set_scope(scope)
    }
    fn is_scope_complete(&self) -> bool {
        (**self).is_scope_complete()
    }
    fn close(&mut self) -> bool {
        (**self).close()
    }
}

impl<T: CompressedSource + ?Sized> CompressedSource for Box<T> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        (**self).read(buf)
    }
    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        (**self).seek(offset)
    }
    fn position(&self) -> u64 {
        (**self).position()
    }
    fn access_memory(&self) -> Option<&[u8]> {
        (**self).access_memory()
    }
    fn set_scope(&mut self, scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        (**self).set_scope(scope)
    }
    fn is_scope_complete(&self) -> bool {
        (**self).is_scope_complete()
    }
    fn close(&mut self) -> bool {
        (**self).close()
    }
}

/// Byte sink written by the codestream model and the box writer.
pub trait CompressedTarget: Send {
    /// Returns false if the sink refused the data.
    fn write(&mut self, data: &[u8]) -> bool;

    /// Opens a window over the last `backtrack` bytes written. Subsequent
    /// writes overwrite that window and may not run past its end.
    fn start_rewrite(&mut self, _backtrack: u64) -> bool {
        false
    }

    fn end_rewrite(&mut self) -> bool {
        false
    }

    fn bytes_written(&self) -> u64;

    fn close(&mut self) -> bool {
        true
    }
}

impl<T: CompressedTarget + ?Sized> CompressedTarget for &mut T {
    fn write(&mut self, data: &[u8]) -> bool {
        (**self).write(data)
    }
    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        (**self).start_rewrite(backtrack)
    }
    fn end_rewrite(&mut self) -> bool {
        (**self).end_rewrite()
    }
    fn bytes_written(&self) -> u64 {
        (**self).bytes_written()
    }
    fn close(&mut self) -> bool {
        (**self).close()
    }
}

impl<T: CompressedTarget + ?Sized> CompressedTarget for Box<T> {
    fn write(&mut self, data: &[u8]) -> bool {
        (**self).write(data)
    }
    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        (**self).start_rewrite(backtrack)
    }
    fn end_rewrite(&mut self) -> bool {
        (**self).end_rewrite()
    }
    fn bytes_written(&self) -> u64 {
        (**self).bytes_written()
    }
    fn close(&mut self) -> bool {
        (**self).close()
    }
}

#[derive(Debug)]
pub struct FileSource {
    reader: BufReader<File>,
    position: u64,
    seekable: bool,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileSource, Box<dyn error::Error>> {
        let file = File::open(path)?;
        Ok(FileSource {
            reader: BufReader::new(file),
            position: 0,
            seekable: true,
        })
    }

    /// Advertises the file as a purely sequential source.
    pub fn without_seeking(mut self) -> FileSource {
        self.seekable = false;
        self
    }
}

impl CompressedSource for FileSource {
    fn capabilities(&self) -> Capabilities {
        if self.seekable {
            Capabilities::SEQUENTIAL | Capabilities::SEEKABLE
        } else {
            Capabilities::SEQUENTIAL
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let mut total = 0;
        while total < buf.len() {
            match self.reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += total as u64;
        Ok(total)
    }

    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        if !self.seekable {
            return Ok(false);
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(true)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> MemorySource {
        MemorySource { data, position: 0 }
    }
}

impl CompressedSource for MemorySource {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SEQUENTIAL | Capabilities::SEEKABLE | Capabilities::IN_MEMORY
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let start = self.position.min(self.data.len());
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        self.position += count;
        Ok(count)
    }

    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        self.position = offset as usize;
        Ok(true)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn access_memory(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

/// Strictly forward source over any reader; may only be read once.
pub struct StreamSource<R: Read + Send> {
    reader: R,
    position: u64,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(reader: R) -> StreamSource<R> {
        StreamSource {
            reader,
            position: 0,
        }
    }
}

impl<R: Read + Send> CompressedSource for StreamSource<R> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::SEQUENTIAL
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let mut total = 0;
        while total < buf.len() {
            match self.reader.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += total as u64;
        Ok(total)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Tracks an active rewrite window: `[start, limit)` in absolute offsets.
#[derive(Debug, Clone, Copy)]
struct RewriteWindow {
    cursor: u64,
    limit: u64,
}

fn open_window(written: u64, backtrack: u64, window: &Option<RewriteWindow>) -> Option<RewriteWindow> {
    if window.is_some() || backtrack > written {
        return None;
    }
    Some(RewriteWindow {
        cursor: written - backtrack,
        limit: written,
    })
}

#[derive(Debug)]
pub struct FileTarget {
    writer: BufWriter<File>,
    written: u64,
    rewrite: Option<RewriteWindow>,
}

impl FileTarget {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<FileTarget, Box<dyn error::Error>> {
        let file = File::create(path)?;
        Ok(FileTarget {
            writer: BufWriter::new(file),
            written: 0,
            rewrite: None,
        })
    }
}

impl CompressedTarget for FileTarget {
    fn write(&mut self, data: &[u8]) -> bool {
        if let Some(window) = self.rewrite.as_mut() {
            if window.cursor + data.len() as u64 > window.limit {
                warn!("write of {} bytes runs past the rewrite window", data.len());
                return false;
            }
            if self.writer.write_all(data).is_err() {
                return false;
            }
            window.cursor += data.len() as u64;
            return true;
        }
        if self.writer.write_all(data).is_err() {
            return false;
        }
        self.written += data.len() as u64;
        true
    }

    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        match open_window(self.written, backtrack, &self.rewrite) {
            Some(window) => {
                if self.writer.seek(SeekFrom::Start(window.cursor)).is_err() {
                    return false;
                }
                self.rewrite = Some(window);
                true
            }
            None => false,
        }
    }

    fn end_rewrite(&mut self) -> bool {
        if self.rewrite.take().is_none() {
            return false;
        }
        self.writer.seek(SeekFrom::Start(self.written)).is_ok()
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> bool {
        if self.rewrite.is_some() && !self.end_rewrite() {
            return false;
        }
        self.writer.flush().is_ok()
    }
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    data: Vec<u8>,
    rewrite: Option<RewriteWindow>,
}

impl MemoryTarget {
    pub fn new() -> MemoryTarget {
        MemoryTarget::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl CompressedTarget for MemoryTarget {
    fn write(&mut self, data: &[u8]) -> bool {
        if let Some(window) = self.rewrite.as_mut() {
            let end = window.cursor + data.len() as u64;
            if end > window.limit {
                warn!("write of {} bytes runs past the rewrite window", data.len());
                return false;
            }
            self.data[window.cursor as usize..end as usize].copy_from_slice(data);
            window.cursor = end;
            return true;
        }
        self.data.extend_from_slice(data);
        true
    }

    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        match open_window(self.data.len() as u64, backtrack, &self.rewrite) {
            Some(window) => {
                self.rewrite = Some(window);
                true
            }
            None => false,
        }
    }

    fn end_rewrite(&mut self) -> bool {
        self.rewrite.take().is_some()
    }

    fn bytes_written(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Forward-only sink; rewriting is never possible.
pub struct StreamTarget<W: Write + Send> {
    writer: W,
    written: u64,
}

impl<W: Write + Send> StreamTarget<W> {
    pub fn new(writer: W) -> StreamTarget<W> {
        StreamTarget { writer, written: 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> CompressedTarget for StreamTarget<W> {
    fn write(&mut self, data: &[u8]) -> bool {
        if self.writer.write_all(data).is_err() {
            return false;
        }
        self.written += data.len() as u64;
        true
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> bool {
        self.writer.flush().is_ok()
    }
}

/// Sink which only counts bytes, used to size output without storing it.
#[derive(Debug, Default)]
pub struct SimulatedTarget {
    written: u64,
    rewrite: Option<RewriteWindow>,
}

impl SimulatedTarget {
    pub fn new() -> SimulatedTarget {
        SimulatedTarget::default()
    }
}

impl CompressedTarget for SimulatedTarget {
    fn write(&mut self, data: &[u8]) -> bool {
        if let Some(window) = self.rewrite.as_mut() {
            if window.cursor + data.len() as u64 > window.limit {
                return false;
            }
            window.cursor += data.len() as u64;
            return true;
        }
        self.written += data.len() as u64;
        true
    }

    fn start_rewrite(&mut self, backtrack: u64) -> bool {
        match open_window(self.written, backtrack, &self.rewrite) {
            Some(window) => {
                self.rewrite = Some(window);
                true
            }
            None => false,
        }
    }

    fn end_rewrite(&mut self) -> bool {
        self.rewrite.take().is_some()
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn close(&mut self) -> bool {
        debug!("simulated target closed after {} bytes", self.written);
        true
    }
}
