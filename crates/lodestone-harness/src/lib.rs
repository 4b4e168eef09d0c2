//! # lodestone-harness
//!
//! Conformance and demo harness for the Lodestone firmware core. Runs
//! the whole stack against a RAM-backed flash image on the host:
//! property defaults, live mutation, snapshot persistence, simulated
//! reboots, hub routing, and cron schedules. Emits machine-readable
//! JSON evidence for comparison between runs.

#![forbid(unsafe_code)]

pub mod demo;
pub mod report;
pub mod rig;
pub mod scenarios;
