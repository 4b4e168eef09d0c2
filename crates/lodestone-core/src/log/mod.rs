//! Wear-levelled circular block log on erase-before-write flash.
//!
//! Records are packed back to back within a sector and never straddle a
//! sector boundary; a record that would straddle is written at the start
//! of the next sector instead and the skipped tail is left erased. Each
//! record carries a CRC-8 over its header and a CRC-16 over its data.
//!
//! A one-bit *generation* flag flips every time the write head wraps
//! back to sector 0. During mount the wrap point is located by walking
//! sectors until the generation bit of the first record changes; that
//! sector is the tail (oldest data). Appends erase the tail sector ahead
//! of the head as the ring fills, levelling wear across the region.
//!
//! Record layout (all little-endian):
//!
//! ```text
//! [ kind:6 | compressed:1 | generation:1 ]  1 byte
//! [ header_crc: u8  ]                       CRC-8 over header, crc byte zeroed
//! [ data_crc:   u16 ]                       CRC-16 over data only
//! [ data_len:   u16 ]
//! [ data: data_len bytes ]
//! ```

pub mod compress;
pub mod index;
pub mod props;

use thiserror::Error;

use crate::id;
use crate::msg;
use crate::storage::{verify_erased, Storage};
use crate::util::crc::{crc16_init, crc16_update_block, crc8_init, crc8_update_block};

/// Encoded record header length.
pub const HEADER_LEN: usize = 6;

/// Record kind for property database snapshots.
pub const KIND_PROP_DB: u8 = 0x01;
/// Scratch record kinds used by debug tooling.
pub const KIND_DEBUG2: u8 = 0x02;
pub const KIND_DEBUG3: u8 = 0x03;

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u8,
    pub compressed: bool,
    pub generation: bool,
    pub data_crc: u16,
    pub data_len: u16,
}

impl RecordHeader {
    /// Serialise, computing the header CRC with its own byte zeroed.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = (self.kind & 0x3F)
            | u8::from(self.compressed) << 6
            | u8::from(self.generation) << 7;
        bytes[2..4].copy_from_slice(&self.data_crc.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data_len.to_le_bytes());
        bytes[1] = crc8_update_block(crc8_init(), &bytes);
        bytes
    }

    /// Deserialise and validate the header CRC.
    #[must_use]
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Option<Self> {
        let mut copy = *bytes;
        copy[1] = 0;
        if crc8_update_block(crc8_init(), &copy) != bytes[1] {
            return None;
        }

        Some(Self {
            kind: bytes[0] & 0x3F,
            compressed: bytes[0] & 0x40 != 0,
            generation: bytes[0] & 0x80 != 0,
            data_crc: u16::from_le_bytes([bytes[2], bytes[3]]),
            data_len: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Full record length including the header.
    #[must_use]
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.data_len as usize
    }
}

/// Append failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("record of {0} bytes cannot fit in one sector")]
    TooLarge(usize),
    #[error("storage device fault")]
    DeviceFault,
}

/// Result of one read-iterator step.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A record was read into the caller's buffer.
    Record(RecordInfo),
    /// The caller's buffer is too small; the record was not consumed.
    TooSmall { needed: usize },
    /// No further valid records.
    End,
}

/// Metadata of a successfully read record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    pub kind: u8,
    pub compressed: bool,
    pub generation: bool,
    pub len: usize,
}

enum RecordReadStatus {
    Valid(RecordHeader),
    TooSmall(RecordHeader),
    BadData(RecordHeader),
    BadHeader,
}

/// The block log over a flash-like store.
pub struct BlockLog<S: Storage> {
    store: S,
    head_offset: usize,
    latest_offset: usize,
    tail_sector: usize,
    generation: bool,
    tail_filled: bool,
    read_offset: usize,
    read_iter_start: bool,
}

impl<S: Storage> BlockLog<S> {
    /// Wrap a store. Call [`mount`](Self::mount) or
    /// [`format`](Self::format) before use.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            head_offset: 0,
            latest_offset: 0,
            tail_sector: 0,
            generation: false,
            tail_filled: false,
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

    #[must_use]
    pub fn head_offset(&self) -> usize {
        self.head_offset
    }

    #[must_use]
    pub fn latest_offset(&self) -> usize {
        self.latest_offset
    }

    /// Reset the read iterator to the oldest sector.
    pub fn read_init(&mut self) {
        self.read_offset = self.tail_sector * self.store.sector_size();
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
        self.generation = false;
        self.tail_filled = false;
        self.read_init();
    }

    fn header_at(&self, offset: usize) -> Option<RecordHeader> {
        let mut bytes = [0u8; HEADER_LEN];
        if !self.store.read_block(offset, &mut bytes) {
            return None;
        }
        RecordHeader::decode(&bytes)
    }

    /// Scan the store for the active record chain. Returns false when
    /// the area past the newest record is not fully erased.
    pub fn mount(&mut self) -> bool {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        // If any valid data exists, some sector starts with a valid header
        let mut head_sector = None;
        let mut head_header = None;
        for i in 0..num_sectors {
            if let Some(h) = self.header_at(i * sector_size) {
                head_sector = Some(i);
                head_header = Some(h);
                break;
            }
        }

        let (mut head_sector, first_header) = match (head_sector, head_header) {
            (Some(s), Some(h)) => (s, h),
            _ => {
                // Storage is empty
                self.format();
                return true;
            }
        };

        self.generation = first_header.generation;
        self.tail_sector = head_sector;

        // Walk forward until the generation bit flips; that sector holds
        // the oldest data
        for i in head_sector + 1..num_sectors {
            if let Some(h) = self.header_at(i * sector_size) {
                if h.generation != self.generation {
                    self.tail_sector = i;
                    break;
                }
                head_sector = i;
            }
        }

        self.tail_filled = head_sector != self.tail_sector;
        self.read_init();

        // Walk records in the head sector to find the write offset
        let mut head_offset = head_sector * sector_size;
        let mut record_len = 0;
        while let Some(h) = self.header_at(head_offset) {
            record_len = h.record_len();
            head_offset += record_len;
            if head_offset / sector_size > head_sector {
                break;
            }
        }

        self.head_offset = head_offset;
        self.latest_offset = head_offset - record_len;

        // The rest of the head sector must still be erased
        let remaining = (head_sector + 1) * sector_size - self.head_offset;
        if verify_erased(&self.store, self.head_offset, remaining) {
            return true;
        }

        log::debug!(
            "mount: residual area at {:#x}+{} not erased",
            self.head_offset,
            remaining
        );
        false
    }

    fn prep_for_write(&mut self, write_len: usize) {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        let mut write_offset = self.head_offset;
        let mut write_sector = write_offset / sector_size;
        let end_sector = (write_offset + write_len - 1) / sector_size;
        let mut need_erase = false;

        if end_sector != write_sector {
            // Skip the sector tail; records never straddle
            write_offset = end_sector * sector_size;
            write_sector = end_sector;
        }

        if write_sector >= num_sectors {
            // Wrap to sector 0 and flip the generation
            write_offset = 0;
            write_sector = 0;
            need_erase = true;
            self.generation = !self.generation;
        }

        if write_sector == self.tail_sector && self.tail_filled {
            need_erase = true;
        }

        if need_erase {
            self.store.erase_sector(write_sector * sector_size);
            if self.tail_sector == write_sector {
                self.tail_sector = (self.tail_sector + 1) % num_sectors;
                self.read_init();
            }
        }

        self.head_offset = write_offset;
    }

    /// Append one record.
    pub fn append(&mut self, kind: u8, compressed: bool, data: &[u8]) -> Result<(), LogError> {
        let record_len = HEADER_LEN + data.len();
        if record_len > self.store.sector_size() {
            msg::report_error(id::ERROR_STORAGE_LIMIT_VALUE, data.len() as u32);
            return Err(LogError::TooLarge(record_len));
        }

        self.prep_for_write(record_len);

        let header = RecordHeader {
            kind,
            compressed,
            generation: self.generation,
            data_crc: crc16_update_block(crc16_init(), data),
            data_len: data.len() as u16,
        };

        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(&header.encode());
        record.extend_from_slice(data);

        if self.store.write_block(self.head_offset, &record) {
            self.latest_offset = self.head_offset;
            self.head_offset += record_len;

            // Once the head leaves the tail sector the first sector is
            // complete and may be reclaimed on wrap
            if self.head_offset / self.store.sector_size() != self.tail_sector {
                self.tail_filled = true;
            }
            return Ok(());
        }

        msg::report_error(id::ERROR_STORAGE_TARGET_UPDATE, self.head_offset as u32);
        Err(LogError::DeviceFault)
    }

    fn read_record_at(&self, offset: usize, buf: &mut [u8]) -> RecordReadStatus {
        let Some(header) = self.header_at(offset) else {
            return RecordReadStatus::BadHeader;
        };

        let len = header.data_len as usize;
        if len > buf.len() {
            return RecordReadStatus::TooSmall(header);
        }

        if !self.store.read_block(offset + HEADER_LEN, &mut buf[..len]) {
            return RecordReadStatus::BadHeader;
        }

        if crc16_update_block(crc16_init(), &buf[..len]) != header.data_crc {
            return RecordReadStatus::BadData(header);
        }

        RecordReadStatus::Valid(header)
    }

    fn advance_read(&mut self, record_len: usize) {
        self.read_offset += record_len;
        if self.read_offset >= self.store.total_size() {
            // Newest record filled the final sector exactly
            self.read_offset = 0;
        }
    }

    /// Step the read iterator: read the next record into `buf`.
    ///
    /// Records with a corrupt body are skipped. On a corrupt header the
    /// iterator jumps to the next sector, or ends if that header was in
    /// the head sector. A too-small buffer reports the required size
    /// without consuming the record.
    pub fn read_next(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        while self.read_offset != self.tail_sector * sector_size || self.read_iter_start {
            match self.read_record_at(self.read_offset, buf) {
                RecordReadStatus::Valid(h) => {
                    self.read_iter_start = false;
                    self.advance_read(h.record_len());
                    return ReadOutcome::Record(RecordInfo {
                        kind: h.kind,
                        compressed: h.compressed,
                        generation: h.generation,
                        len: h.data_len as usize,
                    });
                }
                // Iterator state untouched so the caller can retry with
                // a larger buffer
                RecordReadStatus::TooSmall(h) => {
                    return ReadOutcome::TooSmall {
                        needed: h.data_len as usize,
                    };
                }
                RecordReadStatus::BadData(h) => {
                    log::debug!("read: bad data CRC at {:#x}, skipping", self.read_offset);
                    self.read_iter_start = false;
                    self.advance_read(h.record_len());
                }
                RecordReadStatus::BadHeader => {
                    self.read_iter_start = false;
                    let head_sector = self.head_offset / sector_size;
                    let read_sector = self.read_offset / sector_size;
                    if read_sector == head_sector {
                        return ReadOutcome::End;
                    }
                    self.read_offset = ((read_sector + 1) % num_sectors) * sector_size;
                }
            }
        }

        ReadOutcome::End
    }

    /// Step the read iterator over headers only. Returns the header and
    /// the byte offset of the record it belongs to.
    pub fn read_next_header(&mut self) -> Option<(RecordHeader, usize)> {
        let sector_size = self.store.sector_size();
        let num_sectors = self.store.num_sectors();

        while self.read_offset != self.tail_sector * sector_size || self.read_iter_start {
            self.read_iter_start = false;
            let start = self.read_offset;
            match self.header_at(start) {
                Some(h) => {
                    self.advance_read(h.record_len());
                    return Some((h, start));
                }
                None => {
                    let head_sector = self.head_offset / sector_size;
                    let read_sector = start / sector_size;
                    if read_sector == head_sector {
                        return None;
                    }
                    self.read_offset = ((read_sector + 1) % num_sectors) * sector_size;
                }
            }
        }

        None
    }

    /// Read the newest record into `buf`.
    pub fn read_last(&self, buf: &mut [u8]) -> ReadOutcome {
        match self.read_record_at(self.latest_offset, buf) {
            RecordReadStatus::Valid(h) => ReadOutcome::Record(RecordInfo {
                kind: h.kind,
                compressed: h.compressed,
                generation: h.generation,
                len: h.data_len as usize,
            }),
            RecordReadStatus::TooSmall(h) => ReadOutcome::TooSmall {
                needed: h.data_len as usize,
            },
            RecordReadStatus::BadData(_) | RecordReadStatus::BadHeader => ReadOutcome::End,
        }
    }

    /// Read the newest record into a fresh buffer.
    #[must_use]
    pub fn read_last_owned(&self) -> Option<(RecordHeader, Vec<u8>)> {
        let header = self.header_at(self.latest_offset)?;
        let mut data = vec![0u8; header.data_len as usize];
        match self.read_record_at(self.latest_offset, &mut data) {
            RecordReadStatus::Valid(h) => Some((h, data)),
            _ => None,
        }
    }

    /// True when the read iterator sits on the newest record.
    #[must_use]
    pub fn at_last_record(&self) -> bool {
        self.read_offset == self.latest_offset
    }

    /// Raw store access for diagnostics.
    pub fn read_raw(&self, start: usize, dest: &mut [u8]) -> bool {
        self.store.read_block(start, dest)
    }
}
