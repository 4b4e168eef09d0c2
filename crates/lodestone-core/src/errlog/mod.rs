//! Fixed-record error/event ring log on flash.
//!
//! Records are 8-byte `{ id, data }` cells written back to back. There
//! is no per-record CRC; a cell is valid iff its id is not the erased
//! pattern 0xFFFF_FFFF. Wear levelling works like the block log's, but
//! the head is found differently at mount: a sector that starts with a
//! valid cell and ends with an erased one holds the head. A sector is
//! never filled to its last cell without erasing the next sector first,
//! which guarantees such a sector exists in a non-empty multi-sector
//! log.

use crate::id::PropId;
use crate::msg;
use crate::storage::{verify_erased, Storage};

/// Encoded cell size.
pub const ENTRY_LEN: usize = 8;

/// One log cell: an error/event id and its datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    pub id: PropId,
    pub data: u32,
}

impl ErrorEntry {
    #[must_use]
    pub fn new(id: PropId, data: u32) -> Self {
        Self { id, data }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut bytes = [0u8; ENTRY_LEN];
        bytes[..4].copy_from_slice(&self.id.0.to_le_bytes());
        bytes[4..].copy_from_slice(&self.data.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn decode(bytes: &[u8; ENTRY_LEN]) -> Self {
        Self {
            id: PropId(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            data: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Erased flash is all ones; any other id marks a written cell.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id.0 != 0xFFFF_FFFF
    }
}

/// The fixed-record ring log.
pub struct ErrorLog<S: Storage> {
    store: S,
    entries_per_sector: usize,
    head_offset: usize,
    latest_offset: usize,
    tail_sector: usize,
    read_offset: usize,
    read_iter_start: bool,
}

impl<S: Storage> ErrorLog<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        let entries_per_sector = store.sector_size() / ENTRY_LEN;
        Self {
            store,
            entries_per_sector,
            head_offset: 0,
            latest_offset: 0,
            tail_sector: 0,
            read_offset: 0,
            read_iter_start: true,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.store.total_size()
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    #[must_use]
    pub fn tail_sector(&self) -> usize {
        self.tail_sector
    }

    fn sector_offset(&self, sector: usize, entry: usize) -> usize {
        sector * self.store.sector_size() + entry * ENTRY_LEN
    }

    fn entry_at(&self, offset: usize) -> ErrorEntry {
        let mut bytes = [0xFFu8; ENTRY_LEN];
        let _ = self.store.read_block(offset, &mut bytes);
        ErrorEntry::decode(&bytes)
    }

    /// Reset the read iterator to the oldest sector.
    pub fn read_init(&mut self) {
        self.read_offset = self.sector_offset(self.tail_sector, 0);
        self.read_iter_start = true;
    }

    /// Erase any non-empty sector and reset all offsets.
    pub fn format(&mut self) {
        let sector_size = self.store.sector_size();
        for i in 0..self.store.num_sectors() {
            if !verify_erased(&self.store, i * sector_size, sector_size) {
                self.store.erase_sector(i * sector_size);
            }
        }

        self.latest_offset = 0;
        self.head_offset = 0;
        self.tail_sector = 0;
        self.read_init();
    }

    /// Index of the last written cell in `sector`, or `None` when the
    /// sector is empty.
    fn last_entry_in(&self, sector: usize) -> Option<usize> {
        let mut last = None;
        for i in 0..self.entries_per_sector {
            if self.entry_at(self.sector_offset(sector, i)).is_valid() {
                last = Some(i);
            } else {
                break;
            }
        }
        last
    }

    /// First occupied sector after the head, walking the ring.
    fn find_tail_sector(&self) -> usize {
        let num_sectors = self.store.num_sectors();
        let head_sector = self.head_offset / self.store.sector_size();

        let mut sector = (head_sector + 1) % num_sectors;
        while sector != head_sector {
            if self.entry_at(self.sector_offset(sector, 0)).is_valid() {
                return sector;
            }
            sector = (sector + 1) % num_sectors;
        }
        head_sector
    }

    /// Locate the head and tail from whatever the flash holds.
    pub fn mount(&mut self) -> bool {
        let num_sectors = self.store.num_sectors();

        if num_sectors == 1 {
            match self.last_entry_in(0) {
                None => {
                    self.latest_offset = 0;
                    self.head_offset = 0;
                }
                Some(last) => {
                    self.latest_offset = self.sector_offset(0, last);
                    self.head_offset = self.latest_offset + ENTRY_LEN;
                }
            }
            self.tail_sector = 0;
            self.read_init();
            return true;
        }

        let last_entry = self.entries_per_sector - 1;
        let mut first_empty_sector = None;
        let mut empty_log = true;

        for sector in 0..num_sectors {
            let first_valid = self.entry_at(self.sector_offset(sector, 0)).is_valid();
            if first_valid {
                empty_log = false;
                let last_valid = self
                    .entry_at(self.sector_offset(sector, last_entry))
                    .is_valid();
                if !last_valid {
                    // Partially filled sector holds the head
                    let last = self.last_entry_in(sector).unwrap_or(0);
                    self.latest_offset = self.sector_offset(sector, last);
                    self.head_offset = self.latest_offset + ENTRY_LEN;
                    self.tail_sector = self.find_tail_sector();
                    self.read_init();
                    return true;
                }
            } else if first_empty_sector.is_none() {
                first_empty_sector = Some(sector);
            }
        }

        if empty_log {
            self.latest_offset = 0;
            self.head_offset = 0;
            self.tail_sector = 0;
        } else {
            // Every used sector is full: the last write ended on a
            // sector bound and the head is the first erased sector
            let head_sector = first_empty_sector.unwrap_or(0);
            let last_full = (head_sector + num_sectors - 1) % num_sectors;
            self.latest_offset = self.sector_offset(last_full, 0);
            self.head_offset = self.sector_offset(head_sector, 0);
            self.tail_sector = self.find_tail_sector();
        }

        self.read_init();
        true
    }

    fn prep_for_write(&mut self) {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        let mut write_offset = self.head_offset;
        let mut write_sector = write_offset / sector_size;

        if write_sector >= num_sectors {
            write_offset = 0;
            write_sector = 0;
        }

        let mut write_index = (write_offset - write_sector * sector_size) / ENTRY_LEN;

        // Skip any unusable tail when the sector size is not a multiple
        // of the cell size
        if write_index >= self.entries_per_sector {
            write_sector = (write_sector + 1) % num_sectors;
            write_offset = write_sector * sector_size;
            write_index = 0;
        }

        self.head_offset = write_offset;

        if write_index == self.entries_per_sector - 1 {
            // About to fill this sector; the next one must be erased
            // first so mount can always find a partial sector
            let next_sector = (write_sector + 1) % num_sectors;
            self.store.erase_sector(next_sector * sector_size);

            if next_sector == self.tail_sector {
                self.tail_sector = (self.tail_sector + 1) % num_sectors;
            }

            if num_sectors == 1 {
                // Just erased our only sector
                self.head_offset = 0;
                self.latest_offset = 0;
            }
        }
    }

    /// Append one cell.
    pub fn write(&mut self, entry: ErrorEntry) -> bool {
        self.prep_for_write();

        if self.store.write_block(self.head_offset, &entry.encode()) {
            self.latest_offset = self.head_offset;
            self.head_offset += ENTRY_LEN;
            return true;
        }

        msg::report_error(crate::id::ERROR_STORAGE_TARGET_UPDATE, self.head_offset as u32);
        false
    }

    /// Step the read iterator. Returns `None` at the first erased cell
    /// or after one full loop of the ring.
    pub fn read_next(&mut self) -> Option<ErrorEntry> {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        if self.read_offset == self.tail_sector * sector_size && !self.read_iter_start {
            return None;
        }

        let entry = self.entry_at(self.read_offset);
        if !entry.is_valid() {
            return None;
        }
        self.read_iter_start = false;

        self.read_offset += ENTRY_LEN;
        if self.read_offset >= self.store.total_size() {
            self.read_offset = 0;
        } else {
            let read_sector = self.read_offset / sector_size;
            let read_index = (self.read_offset - read_sector * sector_size) / ENTRY_LEN;
            if read_index >= self.entries_per_sector {
                self.read_offset = ((read_sector + 1) % num_sectors) * sector_size;
            }
        }

        Some(entry)
    }

    /// True when the read iterator has passed the newest cell.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.read_offset == self.latest_offset
    }

    /// Collect every valid cell, oldest first.
    #[must_use]
    pub fn read_all(&mut self) -> Vec<ErrorEntry> {
        self.read_init();
        let mut out = Vec::new();
        while let Some(e) = self.read_next() {
            out.push(e);
        }
        out
    }

    /// Raw store access for diagnostics.
    pub fn read_raw(&self, start: usize, dest: &mut [u8]) -> bool {
        self.store.read_block(start, dest)
    }
}
