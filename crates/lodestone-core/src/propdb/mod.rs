//! Property database: identifier-keyed typed values with attributes.
//!
//! Entries live in a hash table keyed by the packed 32-bit identifier.
//! String and blob payloads are carried in reference-counted pool blocks
//! so a replaced value returns its storage once the last reader drops.
//!
//! Every successful mutation publishes a message on the attached hub
//! with the property id, letting subscribers react to configuration
//! changes. Mutations of persist-marked entries additionally arm a
//! deferred `EVENT.STORAGE.PROP.UPDATE`: transactions nest by counter,
//! and the event fires once when the outermost transaction closes. The
//! snapshot service debounces that event into a flash write.
//!
//! Attribute semantics on replacement: an entry keeps its original
//! `readonly` and `persist` flags no matter what the writer supplies,
//! and a `None` incoming value preserves the stored value. Read-only
//! entries refuse replacement outright.

pub mod flags;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::id::{self, namespace::NameRegistry, PropId};
use crate::msg::{Hub, Msg, MsgPayload, NO_TIMEOUT};
use crate::pool::{PoolSet, SharedPoolBuf};
use crate::serialize;

/// Wire discriminator bytes for property kinds.
pub mod kind {
    pub const NONE: u8 = 0x00;
    pub const UINT: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const BLOB: u8 = 0x04;
    /// Function-valued entries exist only in RAM; they serialise as
    /// empty and restore as `None`.
    pub const FUNC: u8 = 0x05;
}

/// Entry attribute bits.
pub const ATTR_READONLY: u8 = 0x01;
pub const ATTR_PERSIST: u8 = 0x02;
pub const ATTR_PROTECT: u8 = 0x04;

/// A typed property value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PropValue {
    #[default]
    None,
    Uint(u32),
    Int(i32),
    Str(SharedPoolBuf),
    Blob(SharedPoolBuf),
}

impl PropValue {
    /// Wire discriminator for this value.
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            PropValue::None => kind::NONE,
            PropValue::Uint(_) => kind::UINT,
            PropValue::Int(_) => kind::INT,
            PropValue::Str(_) => kind::STRING,
            PropValue::Blob(_) => kind::BLOB,
        }
    }

    #[must_use]
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            PropValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => s.as_str(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            PropValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// One database entry: a value plus its attribute flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropEntry {
    pub value: PropValue,
    /// `set` is denied.
    pub readonly: bool,
    /// Included in serialisation snapshots.
    pub persist: bool,
    /// User-originated writes denied; system writes allowed.
    pub protect: bool,
    /// Set on mutation, cleared when a snapshot is taken.
    pub dirty: bool,
}

impl PropEntry {
    #[must_use]
    pub fn new(value: PropValue) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn uint(v: u32) -> Self {
        Self::new(PropValue::Uint(v))
    }

    #[must_use]
    pub fn int(v: i32) -> Self {
        Self::new(PropValue::Int(v))
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: u8) -> Self {
        self.readonly = attrs & ATTR_READONLY != 0;
        self.persist = attrs & ATTR_PERSIST != 0;
        self.protect = attrs & ATTR_PROTECT != 0;
        self
    }

    #[must_use]
    pub fn attrs(&self) -> u8 {
        u8::from(self.readonly) * ATTR_READONLY
            | u8::from(self.persist) * ATTR_PERSIST
            | u8::from(self.protect) * ATTR_PROTECT
    }
}

/// A startup default: `(id, value, attributes)`.
#[derive(Debug, Clone, Copy)]
pub struct PropDefault {
    pub id: PropId,
    pub value: DefaultValue,
    pub attrs: u8,
}

/// Value forms a defaults table can seed.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Uint(u32),
    Int(i32),
    Str(&'static str),
}

impl PropDefault {
    #[must_use]
    pub const fn uint(id: PropId, v: u32, attrs: u8) -> Self {
        Self {
            id,
            value: DefaultValue::Uint(v),
            attrs,
        }
    }

    #[must_use]
    pub const fn int(id: PropId, v: i32, attrs: u8) -> Self {
        Self {
            id,
            value: DefaultValue::Int(v),
            attrs,
        }
    }

    #[must_use]
    pub const fn str(id: PropId, v: &'static str, attrs: u8) -> Self {
        Self {
            id,
            value: DefaultValue::Str(v),
            attrs,
        }
    }
}

struct DbInner {
    entries: HashMap<u32, PropEntry>,
    persist_updated: bool,
}

/// The property database.
pub struct PropDb {
    inner: Mutex<DbInner>,
    transactions: AtomicU32,
    pools: PoolSet,
    hub: Mutex<Option<Hub>>,
}

impl PropDb {
    /// A database drawing string/blob storage from `pools`.
    #[must_use]
    pub fn new(pools: PoolSet) -> Self {
        Self {
            inner: Mutex::new(DbInner {
                entries: HashMap::new(),
                persist_updated: false,
            }),
            transactions: AtomicU32::new(0),
            pools,
            hub: Mutex::new(None),
        }
    }

    /// Attach the hub used to announce property updates.
    pub fn set_msg_hub(&self, hub: Hub) {
        *self.hub.lock() = Some(hub);
    }

    #[must_use]
    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Open a transaction. Storage-update events are deferred until the
    /// outermost transaction ends.
    pub fn transact_begin(&self) {
        self.transactions.fetch_add(1, Ordering::AcqRel);
    }

    /// Close a transaction. When this was the outermost one and a
    /// persisted entry changed, emit `EVENT.STORAGE.PROP.UPDATE`.
    pub fn transact_end(&self) {
        self.transactions.fetch_sub(1, Ordering::AcqRel);
        if self.transactions.load(Ordering::Acquire) != 0 {
            return;
        }

        let fire = {
            let mut inner = self.inner.lock();
            let fire = inner.persist_updated;
            if fire {
                inner.persist_updated = false;
            }
            fire
        };

        if fire {
            if let Some(hub) = self.hub.lock().clone() {
                let _ = hub.send(
                    Msg::event(id::EVENT_STORAGE_PROP_UPDATE, PropId::NONE),
                    NO_TIMEOUT,
                );
            } else {
                // No hub yet; leave the event armed for later
                self.inner.lock().persist_updated = true;
            }
        }
    }

    /// Close a transaction without emitting a storage-update event.
    /// Used by bulk loads that must stay silent.
    pub fn transact_end_no_update(&self) {
        self.transactions.fetch_sub(1, Ordering::AcqRel);
    }

    /// Pending transaction depth; lock-free read.
    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        self.transactions.load(Ordering::Acquire)
    }

    /// Insert or replace an entry. Returns false for invalid ids and
    /// read-only targets. See the module docs for attribute inheritance.
    pub fn set_entry(&self, prop: PropId, mut entry: PropEntry, source: PropId) -> bool {
        if !prop.is_valid(false) {
            return false;
        }

        self.transact_begin();

        let payload = {
            let mut inner = self.inner.lock();

            if let Some(old) = inner.entries.get(&prop.0) {
                if old.readonly {
                    drop(inner);
                    self.transact_end();
                    return false;
                }
                entry.readonly = old.readonly;
                entry.persist = old.persist;
                if matches!(entry.value, PropValue::None) {
                    entry.value = old.value.clone();
                }
            }

            entry.dirty = true;
            let persist = entry.persist;
            let payload = match entry.value {
                PropValue::Uint(v) => MsgPayload::Value(v),
                PropValue::Int(v) => MsgPayload::Value(v as u32),
                _ => MsgPayload::None,
            };
            inner.entries.insert(prop.0, entry);
            if persist {
                inner.persist_updated = true;
            }
            payload
        };

        if let Some(hub) = self.hub.lock().clone() {
            let _ = hub.send(
                Msg {
                    id: prop,
                    source,
                    payload,
                },
                NO_TIMEOUT,
            );
        }

        self.transact_end();
        true
    }

    /// Store a string value, copying it into a pool block.
    pub fn set_str(&self, prop: PropId, value: &str, source: PropId) -> bool {
        let Some(buf) = self.pools.alloc_shared_from(value.as_bytes()) else {
            crate::msg::report_error(id::ERROR_SYS_MEM_ACCESS, value.len() as u32);
            return false;
        };
        self.set_entry(prop, PropEntry::new(PropValue::Str(buf)), source)
    }

    /// Store a blob value, copying it into a pool block.
    pub fn set_blob(&self, prop: PropId, value: &[u8], source: PropId) -> bool {
        let Some(buf) = self.pools.alloc_shared_from(value) else {
            crate::msg::report_error(id::ERROR_SYS_MEM_ACCESS, value.len() as u32);
            return false;
        };
        self.set_entry(prop, PropEntry::new(PropValue::Blob(buf)), source)
    }

    pub fn set_int(&self, prop: PropId, value: i32, source: PropId) -> bool {
        self.set_entry(prop, PropEntry::int(value), source)
    }

    pub fn set_uint(&self, prop: PropId, value: u32, source: PropId) -> bool {
        self.set_entry(prop, PropEntry::uint(value), source)
    }

    /// A `set_entry` on behalf of an interactive user: protected entries
    /// refuse the write.
    pub fn set_from_user(&self, prop: PropId, entry: PropEntry, source: PropId) -> bool {
        let protected = self
            .inner
            .lock()
            .entries
            .get(&prop.0)
            .is_some_and(|e| e.protect);
        if protected {
            return false;
        }
        self.set_entry(prop, entry, source)
    }

    /// Fetch a snapshot of an entry.
    #[must_use]
    pub fn get(&self, prop: PropId) -> Option<PropEntry> {
        self.inner.lock().entries.get(&prop.0).cloned()
    }

    /// Remove an entry. Removal of a persisted entry arms the
    /// storage-update event like any other mutation.
    pub fn remove(&self, prop: PropId) -> bool {
        self.transact_begin();
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.remove(&prop.0) {
                Some(old) => {
                    if old.persist {
                        inner.persist_updated = true;
                    }
                    true
                }
                None => false,
            }
        };
        self.transact_end();
        removed
    }

    /// Overwrite an entry's attribute flags.
    pub fn set_attributes(&self, prop: PropId, attrs: u8) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&prop.0) else {
            return false;
        };

        let newly_persisted = !entry.persist && attrs & ATTR_PERSIST != 0;
        entry.readonly = attrs & ATTR_READONLY != 0;
        entry.persist = attrs & ATTR_PERSIST != 0;
        entry.protect = attrs & ATTR_PROTECT != 0;
        if newly_persisted {
            inner.persist_updated = true;
        }
        true
    }

    #[must_use]
    pub fn get_attributes(&self, prop: PropId) -> Option<u8> {
        self.inner.lock().entries.get(&prop.0).map(PropEntry::attrs)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Seed the database from a defaults table inside one silent
    /// transaction.
    pub fn set_defaults(&self, defaults: &[PropDefault]) {
        self.transact_begin();
        for d in defaults {
            let entry = match d.value {
                DefaultValue::Uint(v) => PropEntry::uint(v).with_attrs(d.attrs),
                DefaultValue::Int(v) => PropEntry::int(v).with_attrs(d.attrs),
                DefaultValue::Str(s) => match self.pools.alloc_shared_from(s.as_bytes()) {
                    Some(buf) => PropEntry::new(PropValue::Str(buf)).with_attrs(d.attrs),
                    None => {
                        crate::msg::report_error(id::ERROR_SYS_MEM_ACCESS, s.len() as u32);
                        continue;
                    }
                },
            };
            self.set_entry(d.id, entry, PropId::NONE);
        }
        self.transact_end_no_update();
    }

    /// Marshal every persistable entry (persist set, readonly clear)
    /// into a snapshot byte stream and clear their dirty flags. Entries
    /// are written in ascending id order so identical databases produce
    /// identical snapshots.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut inner = self.inner.lock();

        let mut keys: Vec<u32> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.persist && !e.readonly)
            .map(|(&k, _)| k)
            .collect();
        keys.sort_unstable();

        let total: usize = keys
            .iter()
            .filter_map(|k| inner.entries.get(k))
            .map(serialize::prop_encoded_len)
            .sum();

        let mut out = vec![0u8; total];
        let mut pos = 0;
        for raw_id in keys {
            let Some(entry) = inner.entries.get_mut(&raw_id) else {
                continue;
            };
            match serialize::prop_encode(PropId(raw_id), entry, &mut out[pos..]) {
                Ok(n) => {
                    pos += n;
                    entry.dirty = false;
                }
                Err(err) => {
                    log::debug!("serialize: skipping {}: {err}", PropId(raw_id));
                }
            }
        }
        out.truncate(pos);
        out
    }

    /// Apply a snapshot byte stream inside one silent transaction.
    /// Returns the number of entries restored.
    pub fn deserialize(&self, data: &[u8]) -> usize {
        let mut count = 0;
        let mut pos = 0;

        self.transact_begin();
        while pos < data.len() {
            match serialize::prop_decode(&data[pos..], &self.pools) {
                Ok(decoded) => {
                    pos += decoded.consumed;
                    self.set_entry(decoded.id, decoded.entry, PropId::NONE);
                    count += 1;
                }
                Err(err) => {
                    log::debug!("deserialize: stopping at byte {pos}: {err}");
                    break;
                }
            }
        }
        self.transact_end_no_update();

        count
    }

    /// Snapshot of all keys, in table order.
    #[must_use]
    pub fn all_keys(&self) -> Vec<PropId> {
        self.inner.lock().entries.keys().map(|&k| PropId(k)).collect()
    }

    /// Sort keys by their dotted names.
    pub fn sort_keys(&self, registry: &NameRegistry, keys: &mut [PropId]) {
        keys.sort_by_key(|&k| registry.name_of(k));
    }

    /// Render the database for diagnostics, one property per line.
    #[must_use]
    pub fn dump(&self, registry: &NameRegistry) -> String {
        let mut keys = self.all_keys();
        self.sort_keys(registry, &mut keys);

        let mut out = String::new();
        for key in keys {
            let Some(entry) = self.get(key) else { continue };
            let mode = if entry.readonly { "ro" } else { "rw" };
            let persist = if entry.persist { ",p" } else { "" };
            let value = match &entry.value {
                PropValue::None => "?".to_string(),
                PropValue::Uint(v) => format!("{v} ({v:08X})"),
                PropValue::Int(v) => v.to_string(),
                PropValue::Str(s) => format!("'{}'", s.as_str().unwrap_or("<bad utf8>")),
                PropValue::Blob(b) => format!("[{} bytes]", b.len()),
            };
            out.push_str(&format!(
                "{key}  {:<24} ({mode}{persist}) = {value}\n",
                registry.name_of(key)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::fields::*;

    fn pools() -> PoolSet {
        let p = PoolSet::new();
        p.add_pool(8, 32);
        p.add_pool(4, 256);
        p
    }

    const P_VER: PropId = PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION);
    const P_NAME: PropId = PropId(P1_NET | P2_INFO | P3_LOCAL | P4_NAME);
    const P_CNT: PropId = PropId(P1_SYS | P2_STORAGE | P3_INFO | P4_COUNT);

    #[test]
    fn test_set_get_scalars() {
        let db = PropDb::new(pools());
        assert!(db.set_uint(P_VER, 42, PropId::NONE));
        assert!(db.set_int(P_CNT, -5, PropId::NONE));
        assert_eq!(db.get(P_VER).unwrap().value, PropValue::Uint(42));
        assert_eq!(db.get(P_CNT).unwrap().value, PropValue::Int(-5));
        assert_eq!(db.count(), 2);
        assert!(db.get(P_NAME).is_none());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let db = PropDb::new(pools());
        assert!(!db.set_uint(PropId::NONE, 1, PropId::NONE));
        assert!(!db.set_uint(PropId(P1_SYS | 0x7F << 16 | P3_INFO | P4_VALUE), 1, PropId::NONE));
    }

    #[test]
    fn test_replacement_inherits_attributes() {
        let db = PropDb::new(pools());
        let entry = PropEntry::uint(1).with_attrs(ATTR_PERSIST);
        assert!(db.set_entry(P_VER, entry, PropId::NONE));

        // Plain overwrite keeps persist
        assert!(db.set_uint(P_VER, 2, PropId::NONE));
        let got = db.get(P_VER).unwrap();
        assert!(got.persist);
        assert_eq!(got.value, PropValue::Uint(2));
    }

    #[test]
    fn test_readonly_refuses_replacement() {
        let db = PropDb::new(pools());
        let entry = PropEntry::uint(7).with_attrs(ATTR_READONLY);
        assert!(db.set_entry(P_VER, entry, PropId::NONE));
        assert!(!db.set_uint(P_VER, 8, PropId::NONE));
        assert_eq!(db.get(P_VER).unwrap().value, PropValue::Uint(7));
    }

    #[test]
    fn test_none_value_preserves_stored_value() {
        let db = PropDb::new(pools());
        assert!(db.set_uint(P_VER, 3, PropId::NONE));
        assert!(db.set_entry(P_VER, PropEntry::new(PropValue::None), PropId::NONE));
        assert_eq!(db.get(P_VER).unwrap().value, PropValue::Uint(3));
    }

    #[test]
    fn test_string_storage_returns_to_pool() {
        let p = pools();
        let db = PropDb::new(p.clone());
        assert!(db.set_str(P_NAME, "localhost", PropId::NONE));
        assert_eq!(p.free_blocks(32), 7);
        assert!(db.set_str(P_NAME, "example", PropId::NONE));
        assert_eq!(p.free_blocks(32), 7); // Old block released
        assert!(db.remove(P_NAME));
        assert_eq!(p.free_blocks(32), 8);
    }

    #[test]
    fn test_protect_denies_user_writes_only() {
        let db = PropDb::new(pools());
        let entry = PropEntry::uint(1).with_attrs(ATTR_PROTECT);
        assert!(db.set_entry(P_CNT, entry, PropId::NONE));
        assert!(!db.set_from_user(P_CNT, PropEntry::uint(2), PropId::NONE));
        assert!(db.set_entry(P_CNT, PropEntry::uint(3), PropId::NONE));
        assert_eq!(db.get(P_CNT).unwrap().value, PropValue::Uint(3));
    }

    #[test]
    fn test_attributes_round_trip() {
        let db = PropDb::new(pools());
        assert!(db.set_uint(P_VER, 1, PropId::NONE));
        assert!(db.set_attributes(P_VER, ATTR_PERSIST | ATTR_PROTECT));
        assert_eq!(
            db.get_attributes(P_VER),
            Some(ATTR_PERSIST | ATTR_PROTECT)
        );
        assert!(!db.set_attributes(P_NAME, ATTR_PERSIST));
    }

    #[test]
    fn test_serialize_skips_non_persist_and_readonly() {
        let db = PropDb::new(pools());
        db.set_entry(P_VER, PropEntry::uint(42).with_attrs(ATTR_READONLY), PropId::NONE);
        db.set_entry(P_CNT, PropEntry::uint(7).with_attrs(ATTR_PERSIST), PropId::NONE);
        db.set_uint(PropId(0x0002_0304), 0, PropId::NONE); // Invalid id, ignored
        db.set_uint(PropId(P1_SYS | P2_SYS | P3_LOCAL | P4_VALUE), 9, PropId::NONE);

        let bytes = db.serialize();
        let fresh = PropDb::new(pools());
        assert_eq!(fresh.deserialize(&bytes), 1);
        assert_eq!(fresh.get(P_CNT).unwrap().value, PropValue::Uint(7));
        assert!(fresh.get(P_VER).is_none());
    }

    #[test]
    fn test_snapshot_round_trip_with_strings() {
        let db = PropDb::new(pools());
        db.set_entry(
            PropId(P1_NET | P2_INFO | P3_LOCAL | P4_NAME),
            PropEntry::uint(0).with_attrs(ATTR_PERSIST),
            PropId::NONE,
        );
        db.set_str(PropId(P1_NET | P2_INFO | P3_LOCAL | P4_NAME), "node-7", PropId::NONE);
        db.set_entry(P_CNT, PropEntry::int(-12).with_attrs(ATTR_PERSIST), PropId::NONE);

        let bytes = db.serialize();
        let fresh = PropDb::new(pools());
        assert_eq!(fresh.deserialize(&bytes), 2);
        assert_eq!(
            fresh
                .get(PropId(P1_NET | P2_INFO | P3_LOCAL | P4_NAME))
                .unwrap()
                .value
                .as_str(),
            Some("node-7")
        );
        assert_eq!(fresh.get(P_CNT).unwrap().value, PropValue::Int(-12));
        // Restored entries are persistable and writable
        let attrs = fresh.get_attributes(P_CNT).unwrap();
        assert_eq!(attrs & (ATTR_PERSIST | ATTR_READONLY), ATTR_PERSIST);
    }

    #[test]
    fn test_defaults_seed_once() {
        let db = PropDb::new(pools());
        let defaults = [
            PropDefault::uint(P_VER, 42, ATTR_READONLY),
            PropDefault::uint(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX), 100, ATTR_PERSIST),
            PropDefault::str(P_NAME, "localhost", ATTR_PERSIST),
        ];
        db.set_defaults(&defaults);
        assert_eq!(db.count(), 3);
        assert!(db.get(P_VER).unwrap().readonly);
        assert_eq!(db.get(P_NAME).unwrap().value.as_str(), Some("localhost"));
    }

    #[test]
    fn test_dirty_flag_lifecycle() {
        let db = PropDb::new(pools());
        db.set_entry(P_CNT, PropEntry::uint(1).with_attrs(ATTR_PERSIST), PropId::NONE);
        assert!(db.get(P_CNT).unwrap().dirty);
        let _ = db.serialize();
        assert!(!db.get(P_CNT).unwrap().dirty);
    }

    #[test]
    fn test_sorted_dump_lists_by_name() {
        let reg = NameRegistry::new();
        let db = PropDb::new(pools());
        db.set_uint(P_VER, 1, PropId::NONE);
        db.set_str(P_NAME, "x", PropId::NONE);
        let dump = db.dump(&reg);
        let net_line = dump.find("NET.INFO.LOCAL.NAME").unwrap();
        let sys_line = dump.find("SYS.HW.INFO.VERSION").unwrap();
        assert!(net_line < sys_line);
    }
}
