//! In-memory index of the newest record of each kind.
//!
//! Built from one header scan at mount time so last-by-kind lookups
//! (e.g. "newest property snapshot") need no further scanning. Later
//! records of a kind replace earlier ones during the scan, leaving the
//! newest.

use std::collections::HashMap;

use crate::storage::Storage;

use super::{BlockLog, RecordHeader, HEADER_LEN};

#[derive(Debug, Clone, Copy)]
struct IndexItem {
    start: usize,
    data_len: usize,
}

/// Kind-keyed record index.
#[derive(Debug, Default)]
pub struct LogIndex {
    items: HashMap<u8, IndexItem>,
}

impl LogIndex {
    /// Build an index by scanning every record header from the tail.
    #[must_use]
    pub fn build<S: Storage>(log: &mut BlockLog<S>) -> Self {
        let mut index = Self::default();

        log.read_init();
        while let Some((header, start)) = log.read_next_header() {
            log::trace!(
                "index: kind {} at {:#x}, {} bytes",
                header.kind,
                start,
                header.data_len
            );
            index.update(&header, start);
        }

        index
    }

    /// Record (or replace) the location of a record of `header.kind`.
    pub fn update(&mut self, header: &RecordHeader, start: usize) {
        self.items.insert(
            header.kind,
            IndexItem {
                start,
                data_len: header.data_len as usize,
            },
        );
    }

    /// Byte length of the newest record of `kind`, if any.
    #[must_use]
    pub fn data_len(&self, kind: u8) -> Option<usize> {
        self.items.get(&kind).map(|item| item.data_len)
    }

    /// Read the newest record of `kind`, re-validating its header.
    #[must_use]
    pub fn read<S: Storage>(
        &self,
        log: &BlockLog<S>,
        kind: u8,
    ) -> Option<(RecordHeader, Vec<u8>)> {
        let item = self.items.get(&kind)?;

        let mut header_bytes = [0u8; HEADER_LEN];
        if !log.read_raw(item.start, &mut header_bytes) {
            return None;
        }
        let header = RecordHeader::decode(&header_bytes)?;

        let mut data = vec![0u8; header.data_len as usize];
        if !log.read_raw(item.start + HEADER_LEN, &mut data) {
            return None;
        }
        Some((header, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{KIND_DEBUG2, KIND_DEBUG3, KIND_PROP_DB};
    use crate::storage::RamStorage;

    #[test]
    fn test_index_tracks_newest_per_kind() {
        let mut log = BlockLog::new(RamStorage::new(128, 3));
        log.format();
        log.append(KIND_PROP_DB, false, &[1; 8]).unwrap();
        log.append(KIND_DEBUG2, false, &[2; 8]).unwrap();
        log.append(KIND_PROP_DB, false, &[3; 8]).unwrap();

        let index = LogIndex::build(&mut log);
        let (header, data) = index.read(&log, KIND_PROP_DB).unwrap();
        assert_eq!(header.kind, KIND_PROP_DB);
        assert_eq!(data, vec![3; 8]);

        let (_, data) = index.read(&log, KIND_DEBUG2).unwrap();
        assert_eq!(data, vec![2; 8]);

        assert!(index.read(&log, KIND_DEBUG3).is_none());
        assert_eq!(index.data_len(KIND_PROP_DB), Some(8));
    }
}
