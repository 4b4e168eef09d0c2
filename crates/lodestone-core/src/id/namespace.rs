//! Namespace registry and textual identifier conversion.
//!
//! Identifiers have two textual forms: the dotted name
//! `NET.IPV4.SUBNET.MASK` (with `[n]` array indices and `<n>` escapes for
//! unnamed field values) and the raw form `P` followed by eight hex
//! digits.
//!
//! Name conversion needs a registry of namespaces. Each namespace covers
//! a prefix of the identifier tree and maps field values to short
//! reusable component names; a full property name is assembled from one
//! component per level, which keeps static string storage small. The
//! global namespace (prefix 0) carries the standard fields; an
//! application may register one additional prefix-0 namespace that is
//! searched first, and any number of namespaces with non-zero prefixes
//! covering specific subtrees. Name resolution picks the most specific
//! covering namespace and falls back to the global one.

use std::collections::HashMap;

use super::PropId;

/// One field definition: a value for a given level and its display name.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub level: u8,
    pub value: u8,
    pub name: &'static str,
}

/// Shorthand for building field definition tables.
#[must_use]
pub const fn def(level: u8, value: u8, name: &'static str) -> FieldDef {
    FieldDef { level, value, name }
}

/// A group of field definitions covering a prefix of the id tree.
pub struct Namespace {
    prefix: u32,
    mask: u32,
    /// Sorted by (level, value) for binary search.
    defs: Vec<FieldDef>,
    /// Case-insensitive reverse index: (level, UPPER name) -> value.
    name_index: HashMap<(u8, String), u8>,
}

impl Namespace {
    /// Build a namespace. A zero prefix covers the whole tree; a non-zero
    /// prefix derives its mask from its own wildcard-free fields.
    #[must_use]
    pub fn new(prefix: PropId, defs: &[FieldDef]) -> Self {
        let mut defs: Vec<FieldDef> = defs.to_vec();
        defs.sort_by_key(|d| (d.level, d.value));

        let mut name_index = HashMap::with_capacity(defs.len());
        for d in &defs {
            name_index.insert((d.level, d.name.to_ascii_uppercase()), d.value);
        }

        let mask = if prefix.0 == 0 {
            0
        } else {
            prefix.match_mask()
        };

        Self {
            prefix: prefix.0 & mask,
            mask,
            defs,
            name_index,
        }
    }

    fn find_name(&self, level: u8, value: u8) -> Option<&'static str> {
        self.defs
            .binary_search_by_key(&(level, value), |d| (d.level, d.value))
            .ok()
            .map(|ix| self.defs[ix].name)
    }

    fn find_value(&self, level: u8, name: &str) -> Option<u8> {
        self.name_index
            .get(&(level, name.to_ascii_uppercase()))
            .copied()
    }
}

/// Ordered collection of namespaces with the global one always last.
pub struct NameRegistry {
    /// Sorted by descending mask specificity; ties keep insertion order
    /// reversed so an application prefix-0 namespace shadows the global.
    namespaces: Vec<Namespace>,
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NameRegistry {
    /// Registry holding only the global namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            namespaces: vec![Namespace::new(PropId::NONE, GLOBAL_FIELDS)],
        }
    }

    /// Register an additional namespace. More specific prefixes are
    /// consulted before less specific ones.
    pub fn add_namespace(&mut self, ns: Namespace) {
        let pos = self
            .namespaces
            .iter()
            .position(|cur| cur.mask <= ns.mask)
            .unwrap_or(self.namespaces.len());
        self.namespaces.insert(pos, ns);
    }

    /// Pick the namespace responsible for `level` of `id`: the first one
    /// whose prefix covers the id without also covering the level itself.
    fn namespace_for(&self, level: u8, id: PropId) -> &Namespace {
        self.namespaces
            .iter()
            .find(|ns| {
                ns.prefix == 0
                    || (id.0 & ns.mask == ns.prefix
                        && PropId::level_mask(u32::from(level)) & ns.mask == 0)
            })
            .unwrap_or(self.namespaces.last().expect("global namespace"))
    }

    fn global(&self) -> &Namespace {
        self.namespaces.last().expect("global namespace")
    }

    fn field_name(&self, level: u8, id: PropId, value: u8) -> Option<&'static str> {
        let ns = self.namespace_for(level, id);
        ns.find_name(level, value)
            .or_else(|| self.global().find_name(level, value))
    }

    fn field_value(&self, level: u8, prefix: PropId, name: &str) -> Option<u8> {
        let ns = self.namespace_for(level, prefix);
        ns.find_value(level, name)
            .or_else(|| self.global().find_value(level, name))
    }

    /// Construct the dotted name for `id`.
    ///
    /// Unknown field values render as `<n>`; an index after an array
    /// field renders as `[n]`.
    #[must_use]
    pub fn name_of(&self, id: PropId) -> String {
        let mut out = String::with_capacity(24);

        for level in 1..=4u8 {
            let prev_array = level > 1 && id.field(u32::from(level) - 1) & 0x80 != 0
                && id.field(u32::from(level) - 1) != 0xFF;
            let mut field = id.field(u32::from(level));
            let field_array = field & 0x80 != 0 && field != 0xFF;

            if prev_array {
                // This field holds the previous level's index
                out.push_str(&field.to_string());
                out.push(']');
                if level != 4 {
                    out.push('.');
                }
                continue;
            }

            if field_array {
                field &= 0x7F;
            }

            match self.field_name(level, id, field) {
                Some(name) => out.push_str(name),
                None => {
                    out.push('<');
                    out.push_str(&field.to_string());
                    out.push('>');
                }
            }

            if field_array {
                out.push('[');
            } else if level != 4 {
                out.push('.');
            }
        }

        out
    }

    /// Parse a dotted property name back into an identifier.
    ///
    /// Case-insensitive. Returns `None` on any unknown field, malformed
    /// index, or wrong level count.
    #[must_use]
    pub fn parse_name(&self, name: &str) -> Option<PropId> {
        let mut id = PropId::NONE;
        let mut level: u8 = 1;

        for token in name.split('.') {
            if level > 4 {
                return None;
            }
            let shift = (4 - u32::from(level)) * 8;

            if let Some(bracket) = token.find('[') {
                // Array field with index; P4 can never be an array
                if level >= 4 {
                    return None;
                }
                let field_name = &token[..bracket];
                let rest = &token[bracket + 1..];
                let close = rest.find(']')?;
                let index: u32 = rest[..close].parse().ok()?;
                if index > 254 || !rest[close + 1..].is_empty() {
                    return None;
                }

                let value = if let Some(num) = numeric_escape(field_name) {
                    if num == 0 || num >= 127 {
                        return None;
                    }
                    num
                } else {
                    self.field_value(level, id, field_name)?
                };

                id = PropId(id.0 | (u32::from(value) | 0x80) << shift);
                id = id.with_index(u32::from(level), index as u8);
                level += 2;
            } else {
                let value = if let Some(num) = numeric_escape(token) {
                    if num == 0 || num >= 255 {
                        return None;
                    }
                    num
                } else {
                    self.field_value(level, id, token)?
                };

                id = PropId(id.0 | u32::from(value) << shift);
                level += 1;
            }
        }

        if level != 5 || id == PropId::NONE {
            return None;
        }
        Some(id)
    }

    /// Parse either textual form.
    #[must_use]
    pub fn parse_any(&self, text: &str) -> Option<PropId> {
        parse_id(text).or_else(|| self.parse_name(text))
    }
}

/// `<n>` escape for fields with no registered name.
fn numeric_escape(token: &str) -> Option<u8> {
    let inner = token.strip_prefix('<')?.strip_suffix('>')?;
    inner.parse().ok()
}

/// Parse the raw form: `P` (or `p`) followed by exactly eight hex digits.
#[must_use]
pub fn parse_id(text: &str) -> Option<PropId> {
    let digits = text.strip_prefix(['P', 'p'])?;
    if digits.len() != 8 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok().map(PropId)
}

/// Format the raw identifier form.
#[must_use]
pub fn format_id(id: PropId) -> String {
    format!("{id}")
}

macro_rules! global_field_table {
    ($(($level:expr, $value:expr, $name:literal)),* $(,)?) => {
        &[$(FieldDef { level: $level, value: $value, name: $name }),*]
    };
}

/// Standard global field definitions.
///
/// The `MSK` entries let filter masks be written by name; `R120`..`R127`
/// cover the reserved P1 range so raw dumps stay readable.
const GLOBAL_FIELDS: &[FieldDef] = global_field_table![
    (1, 1, "APP"),
    (1, 2, "SYS"),
    (1, 3, "HW"),
    (1, 4, "STATS"),
    (1, 5, "NET"),
    (1, 6, "SENSOR"),
    (1, 7, "RSRC"),
    (1, 8, "CMD"),
    (1, 9, "EVENT"),
    (1, 10, "WARN"),
    (1, 11, "AUX_8_16"),
    (1, 12, "AUX_24"),
    (1, 13, "DEBUG"),
    (1, 14, "ERROR"),
    (1, 120, "R120"),
    (1, 121, "R121"),
    (1, 122, "R122"),
    (1, 123, "R123"),
    (1, 124, "R124"),
    (1, 125, "R125"),
    (1, 126, "R126"),
    (1, 127, "R127"),
    (1, 255, "MSK"),
    (2, 1, "INFO"),
    (2, 2, "SYS"),
    (2, 3, "HW"),
    (2, 4, "STORAGE"),
    (2, 5, "CON"),
    (2, 6, "USB"),
    (2, 7, "SPI"),
    (2, 8, "I2C"),
    (2, 9, "CRON"),
    (2, 10, "PRNG"),
    (2, 11, "BUTTON"),
    (2, 127, "R127"),
    (2, 255, "MSK"),
    (3, 1, "INFO"),
    (3, 2, "LOCAL"),
    (3, 3, "REMOTE"),
    (3, 4, "MESSAGE"),
    (3, 5, "PROP"),
    (3, 6, "TARGET"),
    (3, 7, "LIMIT"),
    (3, 8, "BUILD"),
    (3, 9, "CRON"),
    (3, 10, "MEM"),
    (3, 127, "R127"),
    (3, 255, "MSK"),
    (4, 1, "VALUE"),
    (4, 2, "KIND"),
    (4, 3, "NAME"),
    (4, 4, "COUNT"),
    (4, 5, "VERSION"),
    (4, 6, "MIN"),
    (4, 7, "MAX"),
    (4, 8, "FLAGS"),
    (4, 9, "TIMEOUT"),
    (4, 10, "INVALID"),
    (4, 11, "ACCESS"),
    (4, 12, "UPDATE"),
    (4, 13, "TASK"),
    (4, 14, "QUERY"),
    (4, 15, "SUSPEND"),
    (4, 16, "RESUME"),
    (4, 17, "ATTACH"),
    (4, 18, "DETACH"),
    (4, 19, "SIZE"),
    (4, 20, "LOC"),
    (4, 21, "PRESS"),
    (4, 22, "RELEASE"),
    (4, 23, "ON"),
    (4, 24, "OFF"),
    (4, 127, "R127"),
    (4, 255, "MSK"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{fields::*, p2_arr, ERROR_SYS_MEM_ACCESS};

    fn registry_with_app_ns() -> NameRegistry {
        // Application namespace shadowing parts of the tree the global
        // fields do not name. Searched before the global namespace.
        let mut reg = NameRegistry::new();
        reg.add_namespace(Namespace::new(
            PropId::NONE,
            &[
                def(2, 2, "IPV4"),
                def(3, 7, "SUBNET"),
                def(3, 12, "DOMAIN"),
                def(4, 25, "MASK"),
            ],
        ));
        reg
    }

    #[test]
    fn test_name_round_trip_global() {
        let reg = NameRegistry::new();
        let id = PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION);
        let name = reg.name_of(id);
        assert_eq!(name, "SYS.HW.INFO.VERSION");
        assert_eq!(reg.parse_name(&name), Some(id));
    }

    #[test]
    fn test_app_namespace_shadows_global() {
        let reg = registry_with_app_ns();
        let id = PropId(P1_NET | 2 << 16 | 7 << 8 | 25);
        assert_eq!(reg.name_of(id), "NET.IPV4.SUBNET.MASK");
        assert_eq!(reg.parse_name("NET.IPV4.SUBNET.MASK"), Some(id));
        assert_eq!(reg.parse_name("net.ipv4.subnet.mask"), Some(id));
        // Global names still resolve below the app namespace
        assert_eq!(
            reg.parse_name("SYS.HW.INFO.VERSION"),
            Some(PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION))
        );
    }

    #[test]
    fn test_array_name_round_trip() {
        let reg = NameRegistry::new();
        let id = PropId(P1_SYS | P2_HW | p2_arr(0) | P4_NAME).with_index(2, 1);
        let name = reg.name_of(id);
        assert_eq!(name, "SYS.HW[1].NAME");
        assert_eq!(reg.parse_name(&name), Some(id));
    }

    #[test]
    fn test_unknown_field_escape() {
        let reg = NameRegistry::new();
        let id = PropId(P1_SYS | P2_HW | 0x70 << 8 | P4_NAME);
        let name = reg.name_of(id);
        assert_eq!(name, "SYS.HW.<112>.NAME");
        assert_eq!(reg.parse_name(&name), Some(id));
    }

    #[test]
    fn test_array_with_numeric_escape() {
        let reg = NameRegistry::new();
        // NET[15].<63>.MASK: P1 array with index 15, unnamed P3, P4 mask name
        let id = reg.parse_name("NET[15].<63>.MSK").unwrap();
        assert_eq!(id.field(1), 0x80 | 5);
        assert_eq!(id.index(1), 15);
        assert_eq!(id.field(3), 63);
        assert_eq!(id.field(4), 0xFF);
    }

    #[test]
    fn test_parse_rejections() {
        let reg = NameRegistry::new();
        assert_eq!(reg.parse_name(""), None);
        assert_eq!(reg.parse_name("SYS.HW"), None); // Too few levels
        assert_eq!(reg.parse_name("SYS.HW.INFO.VERSION.EXTRA"), None);
        assert_eq!(reg.parse_name("SYS.NOPE.INFO.VERSION"), None);
        assert_eq!(reg.parse_name("SYS.HW[255].NAME"), None); // Index too big
        assert_eq!(reg.parse_name("SYS.<127>[3].NAME"), None); // Bad array field value
    }

    #[test]
    fn test_parse_id_forms() {
        assert_eq!(parse_id("P01020304"), Some(PropId(0x0102_0304)));
        assert_eq!(parse_id("p0e02040b"), Some(PropId(0x0E02_040B)));
        assert_eq!(parse_id("P0102030"), None); // Seven digits
        assert_eq!(parse_id("P010203040"), None); // Nine digits
        assert_eq!(parse_id("X01020304"), None);
        assert_eq!(format_id(ERROR_SYS_MEM_ACCESS), "P0E020A0B");
    }

    #[test]
    fn test_parse_any_prefers_raw() {
        let reg = NameRegistry::new();
        assert_eq!(reg.parse_any("P02030103"), Some(PropId(0x0203_0103)));
        assert_eq!(
            reg.parse_any("SYS.HW.INFO.NAME"),
            Some(PropId(P1_SYS | P2_HW | P3_INFO | P4_NAME))
        );
    }
}
