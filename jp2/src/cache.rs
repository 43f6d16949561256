use jpc::{Capabilities, CompressedSource, Scope};
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::error;
use std::sync::{Arc, Mutex, MutexGuard};

/// Classes of data-bin held by a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinClass {
    Precinct = 0,
    TileHeader = 1,
    Tile = 2,
    MainHeader = 3,
    Meta = 4,
}

type BinKey = (BinClass, u64, u64);

#[derive(Debug, Default)]
struct DataBin {
    /// Contiguous prefix of the bin.
    data: Vec<u8>,
    /// Segments which arrived ahead of the contiguous prefix, by offset.
    pending: BTreeMap<u64, Vec<u8>>,
    /// Length of the bin, once its final segment has been seen.
    final_length: Option<u64>,
}

impl DataBin {
    fn add(&mut self, data: &[u8], offset: u64, is_final: bool) {
        if is_final {
            self.final_length = Some(offset + data.len() as u64);
        }
        self.pending
            .entry(offset)
            .and_modify(|existing| {
                if existing.len() < data.len() {
                    *existing = data.to_vec();
                }
            })
            .or_insert_with(|| data.to_vec());
        self.merge();
    }

    fn merge(&mut self) {
        loop {
            let length = self.data.len() as u64;
            let offset = match self.pending.keys().next() {
                Some(offset) if *offset <= length => *offset,
                _ => break,
            };
            let segment = self.pending.remove(&offset).unwrap_or_default();
            let skip = (length - offset) as usize;
            if skip < segment.len() {
                self.data.extend_from_slice(&segment[skip..]);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.final_length == Some(self.data.len() as u64)
    }
}

#[derive(Debug, Default)]
struct Bins {
    bins: HashMap<BinKey, DataBin>,
    transferred: u64,
}

/// In-memory store of data-bins which arrive incrementally and out of order.
///
/// Clones share the same bins but keep their own read cursor, so a cache can
/// serve box readers and any number of codestreams at once. Reads only ever
/// see the contiguous prefix of a bin.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    bins: Arc<Mutex<Bins>>,
    codestream: u64,
    scope: Option<BinKey>,
    position: u64,
}

impl Cache {
    pub fn new() -> Cache {
        Cache::default()
    }

    fn lock(&self) -> MutexGuard<'_, Bins> {
        self.bins.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a segment of a data-bin. `is_final` marks the segment which ends
    /// the bin.
    pub fn add_to_databin(
        &self,
        class: BinClass,
        codestream: u64,
        id: u64,
        data: &[u8],
        offset: u64,
        is_final: bool,
    ) {
        let mut bins = self.lock();
        bins.transferred += data.len() as u64;
        let bin = bins.bins.entry((class, codestream, id)).or_default();
        bin.add(data, offset, is_final);
        trace!(
            "{:?} bin {} of codestream {}: {} bytes at {}, now {} contiguous",
            class,
            id,
            codestream,
            data.len(),
            offset,
            bin.data.len()
        );
    }

    /// Contiguous length of a data-bin and whether the bin is complete.
    pub fn get_databin_length(&self, class: BinClass, codestream: u64, id: u64) -> (u64, bool) {
        match self.lock().bins.get(&(class, codestream, id)) {
            Some(bin) => (bin.data.len() as u64, bin.is_complete()),
            None => (0, false),
        }
    }

    /// Copies bytes from the contiguous prefix of a data-bin.
    pub fn read_databin(
        &self,
        class: BinClass,
        codestream: u64,
        id: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> usize {
        let bins = self.lock();
        let bin = match bins.bins.get(&(class, codestream, id)) {
            Some(bin) => bin,
            None => return 0,
        };
        let start = (offset as usize).min(bin.data.len());
        let count = buf.len().min(bin.data.len() - start);
        buf[..count].copy_from_slice(&bin.data[start..start + count]);
        count
    }

    /// Total number of bytes added so far, overlaps included.
    pub fn transferred_bytes(&self) -> u64 {
        self.lock().transferred
    }

    /// Selects the codestream whose bins scoped reads come from.
    pub fn set_codestream(&mut self, codestream: u64) {
        self.codestream = codestream;
        self.scope = None;
        self.position = 0;
    }

    pub fn codestream(&self) -> u64 {
        self.codestream
    }
}

impl CompressedSource for Cache {
    fn capabilities(&self) -> Capabilities {
        Capabilities::CACHED | Capabilities::SEEKABLE
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Box<dyn error::Error>> {
        let (class, codestream, id) = match self.scope {
            Some(key) => key,
            None => return Ok(0),
        };
        let count = self.read_databin(class, codestream, id, self.position, buf);
        self.position += count as u64;
        Ok(count)
    }

    fn seek(&mut self, offset: u64) -> Result<bool, Box<dyn error::Error>> {
        self.position = offset;
        Ok(true)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_scope(&mut self, scope: Scope) -> Result<bool, Box<dyn error::Error>> {
        let key = match scope {
            Scope::MainHeader => (BinClass::MainHeader, self.codestream, 0),
            Scope::TileHeader { tile, .. } => (BinClass::TileHeader, self.codestream, tile as u64),
            Scope::Precinct { id } => (BinClass::Precinct, self.codestream, id),
        };
        debug!("cache scope {:?}", key);
        self.scope = Some(key);
        self.position = 0;
        Ok(true)
    }

    fn is_scope_complete(&self) -> bool {
        match self.scope {
            Some((class, codestream, id)) => self.get_databin_length(class, codestream, id).1,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_segments() {
        let cache = Cache::new();
        cache.add_to_databin(BinClass::Meta, 0, 0, b"world", 5, true);
        assert_eq!(cache.get_databin_length(BinClass::Meta, 0, 0), (0, false));
        cache.add_to_databin(BinClass::Meta, 0, 0, b"hel", 0, false);
        assert_eq!(cache.get_databin_length(BinClass::Meta, 0, 0), (3, false));
        cache.add_to_databin(BinClass::Meta, 0, 0, b"ello", 1, false);
        assert_eq!(cache.get_databin_length(BinClass::Meta, 0, 0), (10, true));

        let mut buf = [0u8; 16];
        let count = cache.read_databin(BinClass::Meta, 0, 0, 2, &mut buf);
        assert_eq!(&buf[..count], b"lloworld");
    }

    #[test]
    fn test_scoped_reads() {
        let cache = Cache::new();
        cache.add_to_databin(BinClass::MainHeader, 2, 0, &[0xFF, 0x4F], 0, false);
        cache.add_to_databin(BinClass::Precinct, 2, 7, &[1, 2, 3], 0, true);

        let mut source = cache.clone();
        source.set_codestream(2);
        assert!(source.set_scope(Scope::MainHeader).unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert!(!source.is_scope_complete());

        assert!(source.set_scope(Scope::Precinct { id: 7 }).unwrap());
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(source.is_scope_complete());

        cache.add_to_databin(BinClass::MainHeader, 2, 0, &[], 2, true);
        source.set_scope(Scope::MainHeader).unwrap();
        assert!(source.is_scope_complete());
        assert_eq!(cache.transferred_bytes(), 5);
    }
}
