//! Boolean property flags condensed into a bitmap.
//!
//! Boolean settings would otherwise each occupy a database entry. A
//! [`PropFlags`] set packs up to 256 of them under a shared prefix whose
//! P3 field is an array; the P4 position then carries the flag index.
//! Optional index names make the flags addressable from a console.

use crate::id::PropId;

/// Bitmap of boolean properties under one `P1.P2.P3[n]` prefix.
pub struct PropFlags {
    prefix: u32,
    index_names: &'static [&'static str],
    flags: [u8; 32],
}

/// The P4 byte is the flag index, not part of the prefix.
const FLAG_MASK: u32 = !0xFF;

impl PropFlags {
    /// Build a flag set. The prefix must mark P3 as an array so P4 can
    /// serve as the flag index. `initial` restores a bitmap previously
    /// captured with [`get_all`](Self::get_all).
    #[must_use]
    pub fn new(
        prefix: PropId,
        index_names: &'static [&'static str],
        initial: Option<&[u8; 32]>,
    ) -> Option<Self> {
        let p3 = prefix.field(3);
        if p3 & 0x80 == 0 || p3 == 0xFF {
            return None;
        }

        Some(Self {
            prefix: prefix.0 & FLAG_MASK,
            index_names,
            flags: initial.copied().unwrap_or([0; 32]),
        })
    }

    /// The shared prefix (index byte zeroed).
    #[must_use]
    pub fn prefix(&self) -> PropId {
        PropId(self.prefix)
    }

    fn valid_flag(&self, prop: PropId) -> bool {
        let p3 = prop.field(3);
        p3 & 0x80 != 0 && p3 != 0xFF && prop.0 & FLAG_MASK == self.prefix
    }

    /// Capture the whole bitmap.
    pub fn get_all(&self, out: &mut [u8; 32]) {
        *out = self.flags;
    }

    /// Set or clear one flag. False when `prop` is not under the
    /// prefix.
    pub fn set(&mut self, prop: PropId, value: bool) -> bool {
        if !self.valid_flag(prop) {
            return false;
        }

        let index = usize::from(prop.index(3));
        let mask = 1u8 << (index % 8);
        if value {
            self.flags[index / 8] |= mask;
        } else {
            self.flags[index / 8] &= !mask;
        }
        true
    }

    /// Read one flag. False for ids outside the prefix.
    #[must_use]
    pub fn get(&self, prop: PropId) -> bool {
        if !self.valid_flag(prop) {
            return false;
        }
        let index = usize::from(prop.index(3));
        self.flags[index / 8] & (1 << (index % 8)) != 0
    }

    /// Set a flag through its registered name.
    pub fn set_by_name(&mut self, name: &str, value: bool) -> bool {
        match self.lookup_name(name) {
            Some(index) => {
                let prop = PropId(self.prefix).with_index(3, index);
                self.set(prop, value)
            }
            None => false,
        }
    }

    /// Read a flag through its registered name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> bool {
        self.lookup_name(name)
            .map(|index| self.get(PropId(self.prefix).with_index(3, index)))
            .unwrap_or(false)
    }

    /// Index of a named flag.
    #[must_use]
    pub fn lookup_name(&self, name: &str) -> Option<u8> {
        self.index_names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|ix| ix as u8)
    }

    /// Name of a flag index, if registered.
    #[must_use]
    pub fn lookup_index(&self, index: u8) -> Option<&'static str> {
        self.index_names.get(usize::from(index)).copied()
    }

    /// List `(id, name, value)` for diagnostics; `set_only` limits the
    /// listing to raised flags.
    #[must_use]
    pub fn dump(&self, set_only: bool, max_flag: u8) -> Vec<(PropId, Option<&'static str>, bool)> {
        let mut out = Vec::new();
        for index in 0..=max_flag {
            let prop = PropId(self.prefix).with_index(3, index);
            let value = self.get(prop);
            if value || !set_only {
                out.push((prop, self.lookup_index(index), value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{fields::*, p3_arr};

    const FLAG_NAMES: &[&str] = &["ECHO", "TRACE", "VERBOSE"];

    fn prefix() -> PropId {
        PropId(P1_APP | P2_STORAGE | P3_LOCAL | p3_arr(0))
    }

    #[test]
    fn test_requires_p3_array_prefix() {
        assert!(PropFlags::new(prefix(), FLAG_NAMES, None).is_some());
        let plain = PropId(P1_APP | P2_STORAGE | P3_LOCAL | P4_VALUE);
        assert!(PropFlags::new(plain, FLAG_NAMES, None).is_none());
    }

    #[test]
    fn test_set_get_by_index() {
        let mut pf = PropFlags::new(prefix(), FLAG_NAMES, None).unwrap();
        let flag7 = prefix().with_index(3, 7);
        let flag200 = prefix().with_index(3, 200);

        assert!(pf.set(flag7, true));
        assert!(pf.set(flag200, true));
        assert!(pf.get(flag7));
        assert!(pf.get(flag200));
        assert!(!pf.get(prefix().with_index(3, 8)));

        assert!(pf.set(flag7, false));
        assert!(!pf.get(flag7));
    }

    #[test]
    fn test_foreign_prefix_rejected() {
        let mut pf = PropFlags::new(prefix(), FLAG_NAMES, None).unwrap();
        let foreign = PropId(P1_SYS | P2_STORAGE | P3_LOCAL | p3_arr(1));
        assert!(!pf.set(foreign, true));
        assert!(!pf.get(foreign));
    }

    #[test]
    fn test_names() {
        let mut pf = PropFlags::new(prefix(), FLAG_NAMES, None).unwrap();
        assert!(pf.set_by_name("trace", true));
        assert!(pf.get_by_name("TRACE"));
        assert!(!pf.set_by_name("missing", true));
        assert_eq!(pf.lookup_index(0), Some("ECHO"));
        assert_eq!(pf.lookup_index(200), None);
    }

    #[test]
    fn test_bitmap_round_trip() {
        let mut pf = PropFlags::new(prefix(), FLAG_NAMES, None).unwrap();
        pf.set_by_name("ECHO", true);
        pf.set(prefix().with_index(3, 31), true);

        let mut bitmap = [0u8; 32];
        pf.get_all(&mut bitmap);

        let restored = PropFlags::new(prefix(), FLAG_NAMES, Some(&bitmap)).unwrap();
        assert!(restored.get_by_name("ECHO"));
        assert!(restored.get(prefix().with_index(3, 31)));
        assert!(!restored.get_by_name("TRACE"));
    }

    #[test]
    fn test_dump_set_only() {
        let mut pf = PropFlags::new(prefix(), FLAG_NAMES, None).unwrap();
        pf.set_by_name("VERBOSE", true);
        let raised = pf.dump(true, 10);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].1, Some("VERBOSE"));
        let all = pf.dump(false, 10);
        assert_eq!(all.len(), 11);
    }
}
