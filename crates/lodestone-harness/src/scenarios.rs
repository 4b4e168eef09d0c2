//! Conformance scenarios run by `lodestone roundtrip`.
//!
//! Each scenario exercises one slice of the core end to end with
//! literal values, so a failed check pins down the subsystem at fault.

use std::sync::Arc;
use std::time::Duration;

use lodestone_core::cron::{decode_schedule, CronMap};
use lodestone_core::id::namespace::{format_id, parse_id};
use lodestone_core::id::{fields::*, PropId, ERROR_SYS_MEM_ACCESS};
use lodestone_core::log::{BlockLog, ReadOutcome, KIND_DEBUG2};
use lodestone_core::msg::{Hub, Msg, Target, NO_TIMEOUT};
use lodestone_core::propdb::{PropDb, PropValue};
use lodestone_core::serialize::{varint_decode, varint_encode};
use lodestone_core::storage::RamStorage;

use crate::report::{Check, Report};
use crate::rig::{
    self, standard_registry, P_NET_IPV4_DOMAIN_NAME, P_NET_IPV4_SUBNET_MASK,
    P_SYS_HW_INFO_VERSION,
};

/// Run every scenario, returning the evidence report.
#[must_use]
pub fn run_all() -> Report {
    let mut report = Report::new("lodestone-roundtrip");
    identifier_roundtrip(&mut report);
    log_wrap(&mut report);
    property_snapshot(&mut report);
    hub_filtering(&mut report);
    varint_boundaries(&mut report);
    cron_decode(&mut report);
    report
}

fn identifier_roundtrip(report: &mut Report) {
    let reg = standard_registry();
    let name = reg.name_of(P_NET_IPV4_SUBNET_MASK);
    report.record(Check::new(
        "identifier.name",
        name == "NET.IPV4.SUBNET.MASK",
        name.clone(),
    ));

    let parsed = reg.parse_name(&name);
    report.record(Check::new(
        "identifier.parse_name",
        parsed == Some(P_NET_IPV4_SUBNET_MASK),
        format!("{parsed:?}"),
    ));

    let raw = format_id(P_NET_IPV4_SUBNET_MASK);
    report.record(Check::new(
        "identifier.parse_id",
        parse_id(&raw) == Some(P_NET_IPV4_SUBNET_MASK),
        raw,
    ));
}

fn log_wrap(report: &mut Report) {
    let mut log = BlockLog::new(RamStorage::new(128, 3));
    log.format();

    for i in 1..=9u8 {
        if log.append(KIND_DEBUG2, false, &[i; 16]).is_err() {
            report.record(Check::new("log.append", false, format!("record {i}")));
            return;
        }
    }

    let mut buf = [0u8; 128];
    let last_ok = matches!(
        log.read_last(&mut buf),
        ReadOutcome::Record(info) if buf[..info.len] == [9u8; 16]
    );
    report.record(Check::new("log.read_last", last_ok, "payload 9x16"));

    // A remount of the same image must find the same newest record
    let latest = log.latest_offset();
    let mut remounted = BlockLog::new(log.into_store());
    let mounted = remounted.mount();
    report.record(Check::new(
        "log.remount",
        mounted && remounted.latest_offset() == latest,
        format!("latest {:#x}", remounted.latest_offset()),
    ));

    // Iteration order
    let mut order = Vec::new();
    remounted.read_init();
    while let ReadOutcome::Record(info) = remounted.read_next(&mut buf) {
        order.push(buf[..info.len][0]);
    }
    report.record(Check::new(
        "log.read_order",
        order == (1..=9).collect::<Vec<u8>>(),
        format!("{order:?}"),
    ));
}

fn property_snapshot(report: &mut Report) {
    let stack = rig::boot(None);
    let bytes = stack.db.serialize();

    let fresh = PropDb::new(stack.pools.clone());
    let restored = fresh.deserialize(&bytes);
    report.record(Check::new(
        "snapshot.count",
        restored == 2 && fresh.count() == 2,
        format!("{restored} restored"),
    ));

    report.record(Check::new(
        "snapshot.values",
        fresh.get(P_NET_IPV4_SUBNET_MASK).map(|e| e.value) == Some(PropValue::Uint(0xFFFF_FF00))
            && fresh
                .get(P_NET_IPV4_DOMAIN_NAME)
                .and_then(|e| e.value.as_str().map(String::from))
                .as_deref()
                == Some("localhost"),
        "subnet mask and domain name",
    ));

    report.record(Check::new(
        "snapshot.readonly_excluded",
        fresh.get(P_SYS_HW_INFO_VERSION).is_none(),
        "SYS.HW.INFO.VERSION omitted",
    ));
}

fn hub_filtering(report: &mut Report) {
    let pools = rig::standard_pools();
    let hub = Hub::new(pools.clone(), 16);

    let errors = Arc::new(Target::queued(pools.clone(), 8));
    errors.add_filter(PropId(P1_ERROR | P2_MSK | P3_MSK | P4_MSK));
    let events = Arc::new(Target::queued(pools.clone(), 8));
    events.add_filter(PropId(P1_EVENT | P2_MSK | P3_MSK | P4_MSK));
    hub.subscribe(Arc::clone(&errors));
    hub.subscribe(Arc::clone(&events));

    hub.send(Msg::with_value(ERROR_SYS_MEM_ACCESS, PropId::NONE, 1), NO_TIMEOUT);
    hub.process_inbox(Duration::from_millis(10), NO_TIMEOUT);

    let delivered = errors.recv(NO_TIMEOUT).map(|m| m.id);
    report.record(Check::new(
        "hub.error_delivered",
        delivered == Some(ERROR_SYS_MEM_ACCESS),
        format!("{delivered:?}"),
    ));
    report.record(Check::new(
        "hub.event_not_delivered",
        events.recv(NO_TIMEOUT).is_none(),
        "EVENT subscriber stayed quiet",
    ));
}

fn varint_boundaries(report: &mut Report) {
    let cases: [(u32, &[u8]); 4] = [
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (0xFFFF_FFFF, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
    ];

    let mut buf = [0u8; 8];
    let mut all = true;
    let mut detail = String::new();
    for (value, expect) in cases {
        let ok = varint_encode(value, &mut buf).map(|n| &buf[..n] == expect) == Ok(true)
            && varint_decode(expect) == Ok((value, expect.len()));
        if !ok {
            all = false;
            detail.push_str(&format!("{value} "));
        }
    }
    report.record(Check::new(
        "varint.boundaries",
        all,
        if all { "0, 127, 128, u32::MAX".to_string() } else { detail },
    ));
}

fn cron_decode(report: &mut Report) {
    let decoded = decode_schedule("0 2 * * 1-5/2");
    let ok = decoded.is_some_and(|s| {
        let map = CronMap::from_schedule(&s);
        s.minute.start == 0
            && s.hour.start == 2
            && s.day_of_month.is_wildcard()
            && s.month.is_wildcard()
            && map.days_of_week == 0b0101010
    });
    report.record(Check::new(
        "cron.decode",
        ok,
        "\"0 2 * * 1-5/2\" -> Mon/Wed/Fri bitmap",
    ));
}
