//! # lodestone-core
//!
//! Safe Rust firmware support core: packed hierarchical property
//! identifiers, a property database with transactional updates, a
//! publish/subscribe message hub, and a wear-levelled flash block log,
//! together with the primitives they are built on (SPSC queue, bipartite
//! buffers, segregated block pools).
//!
//! No `unsafe` code is permitted at the crate level. Interrupt-style
//! lock-free paths use atomics; everything else uses `parking_lot` locks.

#![deny(unsafe_code)]

pub mod buffer;
pub mod cron;
pub mod errlog;
pub mod id;
pub mod log;
pub mod msg;
pub mod pool;
pub mod propdb;
pub mod queue;
pub mod random;
pub mod rtc;
pub mod serialize;
pub mod service;
pub mod storage;
pub mod util;
