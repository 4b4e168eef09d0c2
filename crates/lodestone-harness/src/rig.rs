//! Shared test rig: pools, namespaces, defaults, and a booted stack.

use std::sync::Arc;

use lodestone_core::id::namespace::{def, NameRegistry, Namespace};
use lodestone_core::id::{fields::*, PropId};
use lodestone_core::log::BlockLog;
use lodestone_core::pool::PoolSet;
use lodestone_core::propdb::{PropDb, PropDefault, ATTR_PERSIST, ATTR_READONLY};
use lodestone_core::service::boot_restore;
use lodestone_core::storage::RamStorage;

/// Application identifiers for the demo network subtree.
pub const P_NET_IPV4_SUBNET_MASK: PropId = PropId(P1_NET | 2 << 16 | 7 << 8 | 25);
pub const P_NET_IPV4_DOMAIN_NAME: PropId = PropId(P1_NET | 2 << 16 | 12 << 8 | P4_NAME);
pub const P_SYS_HW_INFO_VERSION: PropId = PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION);

/// Flash geometry used by the demo image.
pub const SECTOR_SIZE: usize = 1024;
pub const NUM_SECTORS: usize = 4;

/// Pool layout shared by every harness run.
#[must_use]
pub fn standard_pools() -> PoolSet {
    let pools = PoolSet::new();
    pools.add_pool(32, 16);
    pools.add_pool(16, 64);
    pools.add_pool(8, 512);
    pools
}

/// Name registry with the demo application namespace installed.
#[must_use]
pub fn standard_registry() -> NameRegistry {
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

/// The demo defaults table.
#[must_use]
pub fn standard_defaults() -> Vec<PropDefault> {
    vec![
        PropDefault::uint(P_SYS_HW_INFO_VERSION, 42, ATTR_READONLY),
        PropDefault::uint(P_NET_IPV4_SUBNET_MASK, 0xFFFF_FF00, ATTR_PERSIST),
        PropDefault::str(P_NET_IPV4_DOMAIN_NAME, "localhost", ATTR_PERSIST),
    ]
}

/// A booted database plus its mounted log.
pub struct BootedStack {
    pub pools: PoolSet,
    pub db: Arc<PropDb>,
    pub log: BlockLog<RamStorage>,
    pub restored: usize,
}

/// Boot the stack over `image` (a fresh one when `None`): mount,
/// seed defaults, restore the newest snapshot.
#[must_use]
pub fn boot(image: Option<Vec<u8>>) -> BootedStack {
    let pools = standard_pools();
    let store = match image {
        Some(image) => RamStorage::from_image(SECTOR_SIZE, image),
        None => RamStorage::new(SECTOR_SIZE, NUM_SECTORS),
    };

    let mut log = BlockLog::new(store);
    if !log.mount() {
        log::debug!("boot: mount failed, reformatting");
        log.format();
    }

    let db = Arc::new(PropDb::new(pools.clone()));
    let restored = boot_restore(&db, &mut log, &standard_defaults());

    BootedStack {
        pools,
        db,
        log,
        restored,
    }
}
