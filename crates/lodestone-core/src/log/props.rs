//! Property snapshot persistence: database to log and back.

use crate::propdb::PropDb;
use crate::storage::Storage;

use super::compress::{compress_block, decompress_block};
use super::index::LogIndex;
use super::{BlockLog, LogError, RecordHeader, KIND_PROP_DB};

/// Serialise the database into a single `PROP_DB` record, compressing
/// when that actually shrinks the payload.
pub fn save_props_to_log<S: Storage>(
    db: &PropDb,
    log: &mut BlockLog<S>,
    compress: bool,
) -> Result<(), LogError> {
    let data = db.serialize();

    if compress {
        if let Some(payload) = compress_block(&data) {
            log::debug!(
                "snapshot: writing compressed record {} -> {} bytes",
                data.len(),
                payload.len()
            );
            return log.append(KIND_PROP_DB, true, &payload);
        }
    }

    log::debug!("snapshot: writing record of {} bytes", data.len());
    log.append(KIND_PROP_DB, false, &data)
}

fn snapshot_payload(header: &RecordHeader, data: Vec<u8>) -> Option<Vec<u8>> {
    if header.compressed {
        decompress_block(&data)
    } else {
        Some(data)
    }
}

/// Restore the database from the newest `PROP_DB` record. Returns the
/// number of properties restored; restoration happens inside one silent
/// transaction so no storage-update event fires.
pub fn restore_props_from_log<S: Storage>(db: &PropDb, log: &mut BlockLog<S>) -> usize {
    // The newest record is usually the snapshot; fall back to an index
    // scan when other record kinds have been appended since.
    let newest = log.read_last_owned().filter(|(h, _)| h.kind == KIND_PROP_DB);
    let record = newest.or_else(|| {
        let index = LogIndex::build(log);
        index.read(log, KIND_PROP_DB)
    });

    let Some((header, data)) = record else {
        return 0;
    };
    let Some(payload) = snapshot_payload(&header, data) else {
        log::debug!("restore: snapshot payload corrupt, ignoring");
        return 0;
    };

    let count = db.deserialize(&payload);
    log::debug!("restore: {count} properties restored");
    count
}
