/// Position of a box header, usable to open that box again.
///
/// Boxes read from a linear source are located by their byte offset.
/// Boxes read from a cache are located by the meta data-bin holding their
/// header and the offset within that bin; the offset the box would have in
/// the original file is carried along whenever it is known.
#[derive(Debug, Clone, Copy)]
pub struct BoxLocator {
    file_pos: i64,
    bin_id: i64,
    bin_pos: i64,
}

impl Default for BoxLocator {
    fn default() -> BoxLocator {
        BoxLocator::new()
    }
}

impl BoxLocator {
    /// Locator of the first box.
    pub fn new() -> BoxLocator {
        BoxLocator {
            file_pos: 0,
            bin_id: -1,
            bin_pos: 0,
        }
    }

    pub fn at_file_pos(pos: u64) -> BoxLocator {
        let mut locator = BoxLocator::new();
        locator.set_file_pos(pos);
        locator
    }

    pub(crate) fn in_bin(bin_id: u64, bin_pos: u64, file_pos: Option<u64>) -> BoxLocator {
        BoxLocator {
            file_pos: file_pos.map(|p| p as i64).unwrap_or(-1),
            bin_id: bin_id as i64,
            bin_pos: bin_pos as i64,
        }
    }

    /// Whether this locates the very first box of the source.
    pub fn is_null(&self) -> bool {
        if self.bin_id < 0 {
            self.file_pos == 0
        } else {
            self.bin_id == 0 && self.bin_pos == 0
        }
    }

    /// Offset of the box header in the original file, if known.
    pub fn file_pos(&self) -> Option<u64> {
        if self.file_pos < 0 {
            None
        } else {
            Some(self.file_pos as u64)
        }
    }

    /// Points the locator at an offset of the original file. On a cache the
    /// offset is resolved by walking the top-level boxes when the locator is
    /// used.
    pub fn set_file_pos(&mut self, pos: u64) {
        self.file_pos = pos as i64;
        self.bin_id = -1;
        self.bin_pos = 0;
    }

    pub fn databin_id(&self) -> Option<u64> {
        if self.bin_id < 0 {
            None
        } else {
            Some(self.bin_id as u64)
        }
    }

    pub fn databin_pos(&self) -> u64 {
        self.bin_pos.max(0) as u64
    }
}

impl PartialEq for BoxLocator {
    fn eq(&self, other: &BoxLocator) -> bool {
        if self.bin_id < 0 || other.bin_id < 0 {
            self.bin_id == other.bin_id && self.file_pos == other.file_pos
        } else {
            self.bin_id == other.bin_id && self.bin_pos == other.bin_pos
        }
    }
}

impl Eq for BoxLocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_locators() {
        assert!(BoxLocator::new().is_null());
        assert!(!BoxLocator::at_file_pos(12).is_null());
        assert!(BoxLocator::in_bin(0, 0, None).is_null());
        assert!(!BoxLocator::in_bin(0, 8, Some(8)).is_null());
        assert!(!BoxLocator::in_bin(3, 0, None).is_null());
    }

    #[test]
    fn test_equality_follows_bin_address() {
        assert_eq!(BoxLocator::in_bin(2, 8, Some(40)), BoxLocator::in_bin(2, 8, None));
        assert_ne!(BoxLocator::in_bin(2, 8, Some(40)), BoxLocator::at_file_pos(40));
        assert_eq!(BoxLocator::at_file_pos(40), BoxLocator::at_file_pos(40));
    }
}
