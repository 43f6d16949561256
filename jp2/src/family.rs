use jpc::{Capabilities, CompressedSource, CompressedTarget, FileSource, FileTarget};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::error;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{BinClass, Cache};
use crate::output_box::WriterRecord;
use crate::JP2Error;

pub(crate) enum Physical<'a> {
    Stream(Box<dyn CompressedSource + 'a>),
    Cache(Cache),
}

/// Where a super-box resumes once its open sub-box has moved on to a
/// sibling. A `position` of `None` means the sibling runs to the end of the
/// super-box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resume {
    pub position: Option<u64>,
    pub file_pos: Option<u64>,
}

/// Lock bookkeeping for one open box.
#[derive(Debug, Default)]
pub(crate) struct Lease {
    pub parent: Option<u64>,
    pub child: Option<u64>,
    pub resume: Option<Resume>,
}

pub(crate) struct SourceState<'a> {
    physical: Physical<'a>,
    position: u64,
    seekable: bool,
    leases: HashMap<u64, Lease>,
    next_id: u64,
    pub prefer_originals: bool,
}

impl<'a> SourceState<'a> {
    pub fn is_cache(&self) -> bool {
        matches!(self.physical, Physical::Cache(_))
    }

    pub fn cache(&self) -> Option<&Cache> {
        match &self.physical {
            Physical::Cache(cache) => Some(cache),
            Physical::Stream(_) => None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match &self.physical {
            Physical::Cache(_) => Capabilities::CACHED | Capabilities::SEEKABLE,
            Physical::Stream(_) if self.seekable => {
                Capabilities::SEQUENTIAL | Capabilities::SEEKABLE
            }
            Physical::Stream(_) => Capabilities::SEQUENTIAL,
        }
    }

    pub fn register(&mut self, parent: Option<u64>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.leases.insert(
            id,
            Lease {
                parent,
                ..Lease::default()
            },
        );
        if let Some(lease) = parent.and_then(|p| self.leases.get_mut(&p)) {
            lease.child = Some(id);
        }
        id
    }

    /// Forgets a closed box and hands focus back to its super-box, if that is
    /// still open.
    pub fn release(&mut self, id: u64) {
        if let Some(lease) = self.leases.remove(&id) {
            if let Some(parent) = lease.parent.and_then(|p| self.leases.get_mut(&p)) {
                if parent.child == Some(id) {
                    parent.child = None;
                }
            }
        }
    }

    pub fn is_locked(&self, id: u64) -> bool {
        self.leases.get(&id).map_or(false, |l| l.child.is_some())
    }

    pub fn set_resume(&mut self, id: u64, resume: Resume) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.resume = Some(resume);
        }
    }

    pub fn peek_resume(&self, id: u64) -> Option<Resume> {
        self.leases.get(&id).and_then(|l| l.resume)
    }

    pub fn take_resume(&mut self, id: u64) -> Option<Resume> {
        self.leases.get_mut(&id).and_then(|l| l.resume.take())
    }

    /// Detaches a box from its super-box, unlocking the super-box.
    pub fn detach(&mut self, id: u64) {
        let parent = match self.leases.get_mut(&id) {
            Some(lease) => lease.parent.take(),
            None => return,
        };
        if let Some(lease) = parent.and_then(|p| self.leases.get_mut(&p)) {
            if lease.child == Some(id) {
                lease.child = None;
            }
        }
    }

    /// Reads from the linear source at an absolute offset.
    pub fn read_stream(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let source = match &mut self.physical {
            Physical::Stream(source) => source,
            Physical::Cache(_) => return Ok(0),
        };
        if pos != self.position {
            let mut moved = false;
            if self.seekable {
                moved = source.seek(pos)?;
                if !moved {
                    debug!("source refused to seek, treating it as sequential");
                    self.seekable = false;
                }
            }
            if moved {
                self.position = pos;
            } else if pos > self.position {
                let mut scratch = [0u8; 4096];
                while self.position < pos {
                    let step = ((pos - self.position) as usize).min(scratch.len());
                    let count = source.read(&mut scratch[..step])?;
                    if count == 0 {
                        return Ok(0);
                    }
                    self.position += count as u64;
                }
            } else {
                return Err(JP2Error::SeekBackwards {
                    position: self.position,
                    requested: pos,
                }
                .into());
            }
        }
        let count = source.read(buf)?;
        self.position += count as u64;
        Ok(count)
    }

    pub fn read_bin(&self, bin: u64, pos: u64, buf: &mut [u8]) -> usize {
        match &self.physical {
            Physical::Cache(cache) => cache.read_databin(BinClass::Meta, 0, bin, pos, buf),
            Physical::Stream(_) => 0,
        }
    }

    pub fn bin_length(&self, bin: u64) -> (u64, bool) {
        match &self.physical {
            Physical::Cache(cache) => cache.get_databin_length(BinClass::Meta, 0, bin),
            Physical::Stream(_) => (0, false),
        }
    }

    fn close(&mut self) -> bool {
        match &mut self.physical {
            Physical::Stream(source) => source.close(),
            Physical::Cache(_) => true,
        }
    }
}

/// Shared handle on the physical source of a family of boxes.
///
/// Every box reader opened on the family holds a clone; all access to the
/// underlying bytes is serialised through one lock. A box which has an open
/// sub-box is locked until that sub-box closes or moves past it.
#[derive(Clone)]
pub struct ContainerSource<'a> {
    shared: Arc<Mutex<SourceState<'a>>>,
}

impl<'a> ContainerSource<'a> {
    fn with_physical(physical: Physical<'a>, seekable: bool) -> ContainerSource<'a> {
        ContainerSource {
            shared: Arc::new(Mutex::new(SourceState {
                physical,
                position: 0,
                seekable,
                leases: HashMap::new(),
                next_id: 0,
                prefer_originals: false,
            })),
        }
    }

    /// Opens a family over a linear source. Seeking is used when the source
    /// supports it; otherwise boxes must be visited strictly in order.
    pub fn open<S: CompressedSource + 'a>(source: S) -> ContainerSource<'a> {
        let capabilities = source.capabilities();
        let seekable = capabilities.contains(Capabilities::SEEKABLE);
        let position = source.position();
        let family = ContainerSource::with_physical(Physical::Stream(Box::new(source)), seekable);
        family.lock().position = position;
        family
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<ContainerSource<'a>, Box<dyn error::Error>> {
        let path = path.as_ref();
        info!("opening {}", path.display());
        Ok(ContainerSource::open(FileSource::open(path)?))
    }

    /// Opens a family over the meta data-bins of a cache. Top-level boxes
    /// live in meta data-bin 0.
    pub fn open_cache(cache: Cache) -> ContainerSource<'a> {
        ContainerSource::with_physical(Physical::Cache(cache), true)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SourceState<'a>> {
        self.shared.lock().unwrap_or_else(|e| {
            warn!("recovering box source lock poisoned by a panicked thread");
            e.into_inner()
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().capabilities()
    }

    pub fn uses_cache(&self) -> bool {
        self.lock().is_cache()
    }

    /// Whether the sequence of top-level boxes can no longer grow. Always
    /// true for linear sources.
    pub fn is_top_level_complete(&self) -> bool {
        let state = self.lock();
        if state.is_cache() {
            state.bin_length(0).1
        } else {
            true
        }
    }

    /// Chooses original box contents over stream equivalents when a
    /// placeholder offers both.
    pub fn set_prefer_originals(&self, prefer: bool) {
        self.lock().prefer_originals = prefer;
    }

    pub fn close(&self) -> bool {
        self.lock().close()
    }
}

pub(crate) struct TargetState<'a> {
    sink: Option<Box<dyn CompressedTarget + 'a>>,
    pub writers: HashMap<u64, WriterRecord>,
    /// Outcome of closing each writer, kept so that closing again gives
    /// the same answer.
    pub outcomes: HashMap<u64, bool>,
    next_id: u64,
    pub top_open: Option<u64>,
    pub rubber_closed: bool,
}

impl<'a> TargetState<'a> {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink_write(&mut self, data: &[u8]) -> bool {
        match self.sink.as_mut() {
            Some(sink) => sink.write(data),
            None => false,
        }
    }

    pub fn sink_start_rewrite(&mut self, backtrack: u64) -> bool {
        match self.sink.as_mut() {
            Some(sink) => sink.start_rewrite(backtrack),
            None => false,
        }
    }

    pub fn sink_end_rewrite(&mut self) -> bool {
        match self.sink.as_mut() {
            Some(sink) => sink.end_rewrite(),
            None => false,
        }
    }

    pub fn sink_bytes_written(&self) -> u64 {
        self.sink.as_ref().map_or(0, |s| s.bytes_written())
    }

    fn close_sink(&mut self) -> bool {
        match self.sink.as_mut() {
            Some(sink) => sink.close(),
            None => true,
        }
    }
}

/// Shared handle on the physical target of a family of boxes.
///
/// At most one top-level box is open at a time, and nothing may follow a
/// closed top-level box of unbounded length.
#[derive(Clone)]
pub struct ContainerTarget<'a> {
    shared: Arc<Mutex<TargetState<'a>>>,
}

impl<'a> ContainerTarget<'a> {
    fn with_sink(sink: Option<Box<dyn CompressedTarget + 'a>>) -> ContainerTarget<'a> {
        ContainerTarget {
            shared: Arc::new(Mutex::new(TargetState {
                sink,
                writers: HashMap::new(),
                outcomes: HashMap::new(),
                next_id: 0,
                top_open: None,
                rubber_closed: false,
            })),
        }
    }

    pub fn open<T: CompressedTarget + 'a>(target: T) -> ContainerTarget<'a> {
        ContainerTarget::with_sink(Some(Box::new(target)))
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<ContainerTarget<'a>, Box<dyn error::Error>> {
        let path = path.as_ref();
        info!("creating {}", path.display());
        Ok(ContainerTarget::open(FileTarget::create(path)?))
    }

    /// Family for boxes assembled in memory without a target.
    pub(crate) fn detached() -> ContainerTarget<'a> {
        ContainerTarget::with_sink(None)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TargetState<'a>> {
        self.shared.lock().unwrap_or_else(|e| {
            warn!("recovering box target lock poisoned by a panicked thread");
            e.into_inner()
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().sink_bytes_written()
    }

    /// Closes any box still open at the top level, then the target itself.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        let mut ok = true;
        if let Some(top) = state.top_open {
            warn!("closing target with a box still open");
            ok = state.close_writer(top);
        }
        state.close_sink() && ok
    }
}
