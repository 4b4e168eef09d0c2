//! Identifier-filtered publish/subscribe message hub.
//!
//! A [`Msg`] is a property id plus a source id and an optional payload.
//! Scalar payloads ride inline; larger payloads are reference-counted
//! pool blocks, cloned once per queued delivery and released as each
//! consumer finishes.
//!
//! A [`Target`] is a message sink: either a bounded mailbox polled by a
//! consumer task, or a callback run synchronously on the dispatcher
//! thread. Targets hold a list of filter chunks, each with four mask
//! identifiers; a message matches when any non-zero mask matches its id.
//!
//! A [`Hub`] owns a bounded inbox and a subscriber list. A dispatcher
//! drains the inbox and relays each message to every matching target.
//! The hub never blocks on one subscriber longer than the configured
//! send timeout; failed deliveries bump the subscriber's drop counter
//! and raise `ERROR.SYS.MESSAGE.TIMEOUT`.
//!
//! The first hub constructed (or an explicit [`set_sys_hub`]) becomes
//! the process-wide hub behind the [`report_event`]/[`report_error`]
//! shortcuts used by code without a hub handle of its own.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{const_mutex, Mutex};

use crate::id::{self, new_global_id, PropId};
use crate::pool::{PoolBuf, PoolSet, SharedPoolBuf};

/// Fail immediately when the queue is full.
pub const NO_TIMEOUT: Duration = Duration::ZERO;
/// Block until space or a message is available.
pub const INFINITE_TIMEOUT: Duration = Duration::MAX;

/// Mask identifiers per filter chunk.
pub const FILTERS_PER_CHUNK: usize = 4;
const FILTER_CHUNK_BYTES: usize = FILTERS_PER_CHUNK * 4;

/// Message payload. `Bytes` is reference counted; every relay clones
/// it and every consumer drops its clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MsgPayload {
    #[default]
    None,
    Value(u32),
    Bytes(SharedPoolBuf),
}

impl MsgPayload {
    #[must_use]
    pub fn value(&self) -> Option<u32> {
        match self {
            MsgPayload::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// One hub message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Msg {
    /// What happened (a property id, event id, or error id).
    pub id: PropId,
    /// Who it happened to, or a reply address for queries.
    pub source: PropId,
    pub payload: MsgPayload,
}

impl Msg {
    /// A payload-free event message.
    #[must_use]
    pub fn event(id: PropId, source: PropId) -> Self {
        Self {
            id,
            source,
            payload: MsgPayload::None,
        }
    }

    /// An event carrying an inline scalar.
    #[must_use]
    pub fn with_value(id: PropId, source: PropId, value: u32) -> Self {
        Self {
            id,
            source,
            payload: MsgPayload::Value(value),
        }
    }
}

/// Four filter masks packed into one pool block.
struct FilterChunk {
    buf: PoolBuf,
}

impl FilterChunk {
    fn new(pools: &PoolSet) -> Option<Self> {
        let mut buf = pools.alloc(FILTER_CHUNK_BYTES)?;
        buf.copy_from(&[0u8; FILTER_CHUNK_BYTES]);
        Some(Self { buf })
    }

    fn get(&self, slot: usize) -> u32 {
        let at = slot * 4;
        u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    fn set(&mut self, slot: usize, mask: u32) {
        let at = slot * 4;
        self.buf[at..at + 4].copy_from_slice(&mask.to_le_bytes());
    }
}

enum Sink {
    Queue {
        tx: Sender<Msg>,
        rx: Receiver<Msg>,
    },
    Callback(Box<dyn Fn(&Target, &Msg) + Send + Sync>),
}

/// A message sink with its subscription filters.
pub struct Target {
    filters: Mutex<Vec<FilterChunk>>,
    dropped: AtomicU32,
    pools: PoolSet,
    sink: Sink,
}

impl Target {
    /// A target with a bounded mailbox of `depth` messages.
    #[must_use]
    pub fn queued(pools: PoolSet, depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            filters: Mutex::new(Vec::new()),
            dropped: AtomicU32::new(0),
            pools,
            sink: Sink::Queue { tx, rx },
        }
    }

    /// A target whose handler runs on the dispatcher's thread.
    #[must_use]
    pub fn callback<F>(pools: PoolSet, handler: F) -> Self
    where
        F: Fn(&Target, &Msg) + Send + Sync + 'static,
    {
        Self {
            filters: Mutex::new(Vec::new()),
            dropped: AtomicU32::new(0),
            pools,
            sink: Sink::Callback(Box::new(handler)),
        }
    }

    /// Subscribe to messages matching `mask`. Existing and empty filter
    /// slots are reused before a new chunk is allocated from the pool;
    /// chunk exhaustion raises `ERROR.SYS.MEM.ACCESS`.
    pub fn add_filter(&self, mask: PropId) -> bool {
        let mut chunks = self.filters.lock();

        // Already present?
        if chunks
            .iter()
            .any(|c| (0..FILTERS_PER_CHUNK).any(|s| c.get(s) == mask.0))
        {
            return true;
        }

        // An empty slot?
        for chunk in chunks.iter_mut() {
            for slot in 0..FILTERS_PER_CHUNK {
                if chunk.get(slot) == 0 {
                    chunk.set(slot, mask.0);
                    return true;
                }
            }
        }

        match FilterChunk::new(&self.pools) {
            Some(mut chunk) => {
                chunk.set(0, mask.0);
                chunks.push(chunk);
                true
            }
            None => {
                drop(chunks);
                report_error(id::ERROR_SYS_MEM_ACCESS, FILTER_CHUNK_BYTES as u32);
                false
            }
        }
    }

    /// Drop the filter equal to `mask`. The slot is zeroed for reuse.
    pub fn remove_filter(&self, mask: PropId) -> bool {
        let mut chunks = self.filters.lock();
        for chunk in chunks.iter_mut() {
            for slot in 0..FILTERS_PER_CHUNK {
                if chunk.get(slot) == mask.0 {
                    chunk.set(slot, 0);
                    return true;
                }
            }
        }
        false
    }

    /// True when any non-zero filter mask matches `id`.
    #[must_use]
    pub fn matches(&self, id: PropId) -> bool {
        let chunks = self.filters.lock();
        chunks.iter().any(|c| {
            (0..FILTERS_PER_CHUNK).any(|s| {
                let mask = c.get(s);
                mask != 0 && id.matches(PropId(mask))
            })
        })
    }

    /// Queue a message for this target. Only meaningful for queued
    /// targets; a timeout bumps the dropped counter.
    pub fn send(&self, msg: Msg, timeout: Duration) -> bool {
        let Sink::Queue { tx, .. } = &self.sink else {
            return false;
        };

        let ok = if timeout == Duration::ZERO {
            tx.try_send(msg).is_ok()
        } else if timeout == INFINITE_TIMEOUT {
            tx.send(msg).is_ok()
        } else {
            tx.send_timeout(msg, timeout).is_ok()
        };

        if !ok {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Receive the next queued message.
    #[must_use]
    pub fn recv(&self, timeout: Duration) -> Option<Msg> {
        let Sink::Queue { rx, .. } = &self.sink else {
            return None;
        };

        if timeout == Duration::ZERO {
            rx.try_recv().ok()
        } else if timeout == INFINITE_TIMEOUT {
            rx.recv().ok()
        } else {
            match rx.recv_timeout(timeout) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            }
        }
    }

    /// Messages dropped due to full-queue timeouts.
    #[must_use]
    pub fn dropped_messages(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, msg: &Msg, send_timeout: Duration) {
        match &self.sink {
            Sink::Callback(handler) => handler(self, msg),
            Sink::Queue { .. } => {
                // The clone is the subscriber's payload reference
                if !self.send(msg.clone(), send_timeout) {
                    report_error(id::ERROR_SYS_MESSAGE_TIMEOUT, msg.id.0);
                }
            }
        }
    }
}

struct HubInner {
    inbox: Target,
    subscribers: Mutex<Vec<Arc<Target>>>,
}

/// A message hub: an inbox plus filter-subscribed targets.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// A hub whose inbox holds `depth` undelivered messages. The first
    /// hub created becomes the system hub unless one was already set.
    #[must_use]
    pub fn new(pools: PoolSet, depth: usize) -> Self {
        let hub = Self {
            inner: Arc::new(HubInner {
                inbox: Target::queued(pools, depth),
                subscribers: Mutex::new(Vec::new()),
            }),
        };

        let mut sys = SYS_HUB.lock();
        if sys.is_none() {
            *sys = Some(hub.clone());
        }
        hub
    }

    /// Enqueue a message for dispatch.
    pub fn send(&self, msg: Msg, timeout: Duration) -> bool {
        self.inner.inbox.send(msg, timeout)
    }

    /// Messages refused by a full inbox.
    #[must_use]
    pub fn dropped_messages(&self) -> u32 {
        self.inner.inbox.dropped_messages()
    }

    pub fn subscribe(&self, target: Arc<Target>) {
        self.inner.subscribers.lock().push(target);
    }

    pub fn unsubscribe(&self, target: &Arc<Target>) -> bool {
        let mut subs = self.inner.subscribers.lock();
        match subs.iter().position(|t| Arc::ptr_eq(t, target)) {
            Some(ix) => {
                subs.swap_remove(ix);
                true
            }
            None => false,
        }
    }

    /// Pop one inbox message and relay it to matching subscribers.
    /// Returns false when the inbox stayed empty for `recv_timeout`.
    pub fn process_one(&self, recv_timeout: Duration, send_timeout: Duration) -> bool {
        let Some(msg) = self.inner.inbox.recv(recv_timeout) else {
            return false;
        };

        let subscribers: Vec<Arc<Target>> = self.inner.subscribers.lock().clone();
        for target in &subscribers {
            if target.matches(msg.id) {
                target.deliver(&msg, send_timeout);
            }
        }
        // The hub's own payload reference drops here
        true
    }

    /// Drain the inbox until it stays empty for `recv_timeout`.
    pub fn process_inbox(&self, recv_timeout: Duration, send_timeout: Duration) {
        while self.process_one(recv_timeout, send_timeout) {}
    }

    /// Run a dispatcher thread until the returned handle is stopped.
    #[must_use]
    pub fn spawn_dispatcher(&self, send_timeout: Duration) -> DispatcherHandle {
        let hub = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("msg-hub".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    hub.process_one(Duration::from_millis(20), send_timeout);
                }
            })
            .ok();

        DispatcherHandle { stop, handle }
    }

    /// Send `query_id` and wait for one reply addressed to a fresh
    /// reply identifier, passed to the responder as the source field.
    /// Requires a running dispatcher.
    #[must_use]
    pub fn query(&self, query_id: PropId, timeout: Duration) -> Option<MsgPayload> {
        let reply_id = new_global_id();
        let (tx, rx) = bounded::<MsgPayload>(1);

        let responder = Arc::new(Target::callback(
            self.inner.inbox.pools.clone(),
            move |_tgt, msg| {
                let _ = tx.try_send(msg.payload.clone());
            },
        ));
        if !responder.add_filter(reply_id) {
            return None;
        }
        self.subscribe(Arc::clone(&responder));

        let result = (|| {
            if !self.send(Msg::event(query_id, reply_id), timeout) {
                return None;
            }
            if timeout == INFINITE_TIMEOUT {
                rx.recv().ok()
            } else {
                rx.recv_timeout(timeout).ok()
            }
        })();

        self.unsubscribe(&responder);
        result
    }
}

/// Stop control for a dispatcher thread.
pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the dispatcher to exit and join it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static SYS_HUB: Mutex<Option<Hub>> = const_mutex(None);

/// Install the process-wide hub used by the reporting shortcuts.
pub fn set_sys_hub(hub: &Hub) {
    *SYS_HUB.lock() = Some(hub.clone());
}

/// The process-wide hub, if one exists.
#[must_use]
pub fn sys_hub() -> Option<Hub> {
    SYS_HUB.lock().clone()
}

/// Publish an event id with a scalar payload to the system hub. Never
/// blocks; returns false when no hub exists or its inbox is full.
pub fn report_event(event: PropId, data: u32) -> bool {
    match sys_hub() {
        Some(hub) => hub.send(
            Msg {
                id: event,
                source: id::RSRC_SYS_LOCAL_TASK,
                payload: MsgPayload::Value(data),
            },
            NO_TIMEOUT,
        ),
        None => false,
    }
}

/// Publish an error id to the system hub. Same contract as
/// [`report_event`].
pub fn report_error(error: PropId, data: u32) -> bool {
    report_event(error, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::fields::*;
    use crate::id::{ERROR_SYS_MEM_ACCESS, EVENT_STORAGE_PROP_UPDATE};

    fn pools() -> PoolSet {
        let p = PoolSet::new();
        p.add_pool(16, 16);
        p.add_pool(8, 64);
        p
    }

    const ERROR_MASK: PropId = PropId(P1_ERROR | P2_MSK | P3_MSK | P4_MSK);
    const EVENT_MASK: PropId = PropId(P1_EVENT | P2_MSK | P3_MSK | P4_MSK);

    #[test]
    fn test_filter_slot_reuse() {
        let tgt = Target::queued(pools(), 4);
        assert!(tgt.add_filter(ERROR_MASK));
        assert!(tgt.add_filter(ERROR_MASK)); // Idempotent
        assert!(tgt.add_filter(EVENT_MASK));
        assert!(tgt.remove_filter(ERROR_MASK));
        assert!(!tgt.remove_filter(ERROR_MASK));
        // Freed slot is reused, no new chunk
        assert!(tgt.add_filter(PropId(P1_WARN | P2_MSK | P3_MSK | P4_MSK)));
        assert_eq!(tgt.filters.lock().len(), 1);
    }

    #[test]
    fn test_chunk_growth_past_four_filters() {
        let tgt = Target::queued(pools(), 4);
        for p4 in 1..=6u32 {
            assert!(tgt.add_filter(PropId(P1_EVENT | P2_MSK | P3_MSK | p4)));
        }
        assert_eq!(tgt.filters.lock().len(), 2);
    }

    #[test]
    fn test_matching_follows_mask_rule() {
        let tgt = Target::queued(pools(), 4);
        tgt.add_filter(ERROR_MASK);
        assert!(tgt.matches(ERROR_SYS_MEM_ACCESS));
        assert!(!tgt.matches(EVENT_STORAGE_PROP_UPDATE));
    }

    #[test]
    fn test_dispatch_filters_subscribers() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);

        let errors = Arc::new(Target::queued(pools.clone(), 4));
        errors.add_filter(ERROR_MASK);
        let events = Arc::new(Target::queued(pools.clone(), 4));
        events.add_filter(EVENT_MASK);
        hub.subscribe(Arc::clone(&errors));
        hub.subscribe(Arc::clone(&events));

        assert!(hub.send(Msg::with_value(ERROR_SYS_MEM_ACCESS, PropId::NONE, 64), NO_TIMEOUT));
        hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);

        let got = errors.recv(NO_TIMEOUT).unwrap();
        assert_eq!(got.id, ERROR_SYS_MEM_ACCESS);
        assert_eq!(got.payload.value(), Some(64));
        assert!(events.recv(NO_TIMEOUT).is_none());
    }

    #[test]
    fn test_payload_reference_counting_across_delivery() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);

        let a = Arc::new(Target::queued(pools.clone(), 4));
        a.add_filter(EVENT_MASK);
        let b = Arc::new(Target::queued(pools.clone(), 4));
        b.add_filter(EVENT_MASK);
        hub.subscribe(Arc::clone(&a));
        hub.subscribe(Arc::clone(&b));

        let payload = pools.alloc_shared_from(b"shared payload bytes").unwrap();
        assert_eq!(payload.ref_count(), 1);
        hub.send(
            Msg {
                id: EVENT_STORAGE_PROP_UPDATE,
                source: PropId::NONE,
                payload: MsgPayload::Bytes(payload.clone()),
            },
            NO_TIMEOUT,
        );
        hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);

        // One reference here plus one per queued delivery
        assert_eq!(payload.ref_count(), 3);
        let got_a = a.recv(NO_TIMEOUT).unwrap();
        drop(got_a);
        assert_eq!(payload.ref_count(), 2);
        drop(b.recv(NO_TIMEOUT).unwrap());
        assert_eq!(payload.ref_count(), 1);
    }

    #[test]
    fn test_full_subscriber_queue_counts_drops() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);

        let slow = Arc::new(Target::queued(pools.clone(), 1));
        slow.add_filter(EVENT_MASK);
        hub.subscribe(Arc::clone(&slow));

        for _ in 0..3 {
            hub.send(Msg::event(EVENT_STORAGE_PROP_UPDATE, PropId::NONE), NO_TIMEOUT);
        }
        hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);

        assert_eq!(slow.dropped_messages(), 2);
        assert!(slow.recv(NO_TIMEOUT).is_some());
        assert!(slow.recv(NO_TIMEOUT).is_none());
    }

    #[test]
    fn test_callback_runs_on_dispatcher() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);
        let (tx, rx) = bounded::<PropId>(4);

        let cb = Arc::new(Target::callback(pools.clone(), move |_t, msg| {
            let _ = tx.try_send(msg.id);
        }));
        cb.add_filter(ERROR_MASK);
        hub.subscribe(cb);

        hub.send(Msg::event(ERROR_SYS_MEM_ACCESS, PropId::NONE), NO_TIMEOUT);
        hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);
        assert_eq!(rx.try_recv().ok(), Some(ERROR_SYS_MEM_ACCESS));
    }

    #[test]
    fn test_query_round_trip() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);

        // A responder that answers version queries
        let query_id = PropId(P1_CMD | P2_SYS | P3_INFO | P4_QUERY);
        let hub_for_responder = hub.clone();
        let responder = Arc::new(Target::callback(pools.clone(), move |_t, msg| {
            let _ = hub_for_responder.send(
                Msg::with_value(msg.source, PropId::NONE, 0xC0DE),
                NO_TIMEOUT,
            );
        }));
        responder.add_filter(query_id);
        hub.subscribe(responder);

        let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);
        let reply = hub.query(query_id, Duration::from_secs(2));
        dispatcher.stop();

        assert_eq!(reply, Some(MsgPayload::Value(0xC0DE)));
    }

    #[test]
    fn test_query_timeout_without_responder() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);
        let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);
        let reply = hub.query(
            PropId(P1_CMD | P2_SYS | P3_INFO | P4_QUERY),
            Duration::from_millis(50),
        );
        dispatcher.stop();
        assert_eq!(reply, None);
    }

    #[test]
    fn test_report_event_reaches_sys_hub() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 8);
        set_sys_hub(&hub);

        let monitor = Arc::new(Target::queued(pools.clone(), 4));
        monitor.add_filter(ERROR_MASK);
        hub.subscribe(Arc::clone(&monitor));

        assert!(report_error(ERROR_SYS_MEM_ACCESS, 128));
        hub.process_inbox(NO_TIMEOUT, NO_TIMEOUT);

        let got = monitor.recv(NO_TIMEOUT).unwrap();
        assert_eq!(got.id, ERROR_SYS_MEM_ACCESS);
        assert_eq!(got.source, crate::id::RSRC_SYS_LOCAL_TASK);
        assert_eq!(got.payload.value(), Some(128));
    }
}
