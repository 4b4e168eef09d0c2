//! Hub routing: filter-selective delivery, property change fan-out,
//! and query round trips across threads.

use std::sync::Arc;
use std::time::Duration;

use lodestone_core::id::{fields::*, PropId, ERROR_SYS_MEM_ACCESS};
use lodestone_core::msg::{Hub, Msg, MsgPayload, Target, INFINITE_TIMEOUT, NO_TIMEOUT};
use lodestone_core::pool::PoolSet;
use lodestone_core::propdb::PropDb;

const ERROR_MASK: PropId = PropId(P1_ERROR | P2_MSK | P3_MSK | P4_MSK);
const EVENT_MASK: PropId = PropId(P1_EVENT | P2_MSK | P3_MSK | P4_MSK);

fn pools() -> PoolSet {
    let p = PoolSet::new();
    p.add_pool(16, 64);
    p
}

#[test]
fn errors_reach_only_the_error_subscriber() {
    let pools = pools();
    let hub = Hub::new(pools.clone(), 16);

    let error_sub = Arc::new(Target::queued(pools.clone(), 8));
    error_sub.add_filter(ERROR_MASK);
    let event_sub = Arc::new(Target::queued(pools.clone(), 8));
    event_sub.add_filter(EVENT_MASK);
    hub.subscribe(Arc::clone(&error_sub));
    hub.subscribe(Arc::clone(&event_sub));

    assert!(hub.send(Msg::with_value(ERROR_SYS_MEM_ACCESS, PropId::NONE, 1), NO_TIMEOUT));
    hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);

    assert_eq!(error_sub.recv(NO_TIMEOUT).map(|m| m.id), Some(ERROR_SYS_MEM_ACCESS));
    assert!(event_sub.recv(NO_TIMEOUT).is_none());
}

#[test]
fn delivery_iff_some_filter_matches() {
    // A message is delivered exactly when some filter mask matches
    let pools = pools();
    let ids = [
        PropId(P1_ERROR | P2_SYS | P3_MEM | P4_ACCESS),
        PropId(P1_EVENT | P2_STORAGE | P3_PROP | P4_UPDATE),
        PropId(P1_NET | P2_INFO | P3_LOCAL | P4_NAME),
    ];
    let masks = [
        ERROR_MASK,
        EVENT_MASK,
        PropId(P1_NET | P2_MSK | P3_MSK | P4_MSK),
        PropId(P1_EVENT | P2_STORAGE | P3_MSK | P4_MSK),
    ];

    for mask_set in [&masks[..1], &masks[..2], &masks[2..]] {
        let hub = Hub::new(pools.clone(), 16);
        let sub = Arc::new(Target::queued(pools.clone(), 8));
        for &m in mask_set {
            sub.add_filter(m);
        }
        hub.subscribe(Arc::clone(&sub));

        for &id in &ids {
            hub.send(Msg::event(id, PropId::NONE), NO_TIMEOUT);
            hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);
            let delivered = sub.recv(NO_TIMEOUT).is_some();
            let expected = mask_set.iter().any(|&m| id.matches(m));
            assert_eq!(delivered, expected, "id {id} against {mask_set:?}");
        }
    }
}

#[test]
fn property_sets_fan_out_to_subscribers() {
    let pools = pools();
    let hub = Hub::new(pools.clone(), 16);
    let db = PropDb::new(pools.clone());
    db.set_msg_hub(hub.clone());

    let net_watcher = Arc::new(Target::queued(pools.clone(), 8));
    net_watcher.add_filter(PropId(P1_NET | P2_MSK | P3_MSK | P4_MSK));
    hub.subscribe(Arc::clone(&net_watcher));

    let prop = PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX);
    let source = PropId(P1_RSRC | P2_CON | P3_LOCAL | P4_TASK);
    assert!(db.set_uint(prop, 1500, source));

    hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);
    let msg = net_watcher.recv(NO_TIMEOUT).unwrap();
    assert_eq!(msg.id, prop);
    assert_eq!(msg.source, source);
    assert_eq!(msg.payload.value(), Some(1500));
}

#[test]
fn query_round_trip_across_threads() {
    let pools = pools();
    let hub = Hub::new(pools.clone(), 16);

    let query_id = PropId(P1_CMD | P2_HW | P3_INFO | P4_QUERY);
    let responder_hub = hub.clone();
    let responder = Arc::new(Target::callback(pools.clone(), move |_t, msg| {
        // Reply to the transient address carried in `source`
        let _ = responder_hub.send(
            Msg::with_value(msg.source, PropId::NONE, 31_337),
            NO_TIMEOUT,
        );
    }));
    responder.add_filter(query_id);
    hub.subscribe(responder);

    let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);

    let reply = hub.query(query_id, Duration::from_secs(2));
    assert_eq!(reply, Some(MsgPayload::Value(31_337)));

    // Two queries get distinct reply addresses and both resolve
    let reply2 = hub.query(query_id, Duration::from_secs(2));
    assert_eq!(reply2, Some(MsgPayload::Value(31_337)));

    dispatcher.stop();
}

#[test]
fn consumer_thread_receives_in_order() {
    let pools = pools();
    let hub = Hub::new(pools.clone(), 64);

    let sub = Arc::new(Target::queued(pools.clone(), 64));
    sub.add_filter(EVENT_MASK);
    hub.subscribe(Arc::clone(&sub));

    let consumer = {
        let sub = Arc::clone(&sub);
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                if let Some(msg) = sub.recv(INFINITE_TIMEOUT) {
                    seen.push(msg.payload.value().unwrap_or(0));
                }
            }
            seen
        })
    };

    let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);
    for i in 0..20u32 {
        assert!(hub.send(
            Msg::with_value(PropId(P1_EVENT | P2_HW | P3_LOCAL | P4_VALUE), PropId::NONE, i),
            INFINITE_TIMEOUT,
        ));
    }

    let seen = consumer.join().unwrap();
    dispatcher.stop();
    assert_eq!(seen, (0..20).collect::<Vec<u32>>());
}
