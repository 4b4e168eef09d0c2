//! Background services wiring the database, hub, and logs together.
//!
//! [`SnapshotService`] is the property persistence loop: a callback
//! target turns `EVENT.STORAGE.PROP.UPDATE` into a worker notification;
//! the worker debounces a burst of updates (default one second of
//! quiet), refreshes the PRNG seed and write-count properties, then
//! serialises, compresses, and appends a snapshot record.
//!
//! [`ErrorMonitor`] drains `ERROR.*` and `WARN.*` messages into the
//! fixed-record error log.
//!
//! [`boot_restore`] is the canonical boot order: seed defaults, then
//! overwrite them with the last snapshot, all without emitting events.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;

use crate::errlog::{ErrorEntry, ErrorLog};
use crate::id::{self, PropId};
use crate::log::props::{restore_props_from_log, save_props_to_log};
use crate::log::BlockLog;
use crate::msg::{Hub, Target};
use crate::propdb::{PropDb, PropDefault, ATTR_PERSIST, ATTR_PROTECT};
use crate::random::update_prng_seed;
use crate::rtc::RtcDevice;
use crate::storage::Storage;

/// Default debounce: a flurry of property writes becomes one record.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

const POLL: Duration = Duration::from_millis(50);

/// Seed defaults and then restore the newest snapshot over them.
/// Returns the number of restored properties. Run before the hub is
/// attached so nothing observes the boot-time churn.
pub fn boot_restore<S: Storage>(
    db: &PropDb,
    log: &mut BlockLog<S>,
    defaults: &[PropDefault],
) -> usize {
    db.set_defaults(defaults);
    restore_props_from_log(db, log)
}

/// The debounced snapshot writer.
pub struct SnapshotService {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    hub: Hub,
    target: Arc<Target>,
    snapshots: Arc<AtomicU32>,
}

impl SnapshotService {
    /// Subscribe to storage-update events and start the worker.
    #[must_use]
    pub fn start<S: Storage + Send + 'static>(
        db: Arc<PropDb>,
        log: Arc<Mutex<BlockLog<S>>>,
        hub: &Hub,
        rtc: Arc<dyn RtcDevice>,
        debounce: Duration,
    ) -> Self {
        let (notify_tx, notify_rx) = bounded::<()>(1);

        let target = Arc::new(Target::callback(db.pools().clone(), move |_t, _msg| {
            let _ = notify_tx.try_send(());
        }));
        target.add_filter(id::EVENT_STORAGE_PROP_UPDATE);
        hub.subscribe(Arc::clone(&target));

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let snapshots = Arc::new(AtomicU32::new(0));
        let snapshot_count = Arc::clone(&snapshots);

        let worker = std::thread::Builder::new()
            .name("prop-snapshot".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    // Wait for the first storage-update notification
                    match notify_rx.recv_timeout(POLL) {
                        Ok(()) => {}
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    // Bookkeeping properties change once per burst, up
                    // front; their own update events drain in the
                    // debounce below
                    update_prng_seed(&db, rtc.get_time() as u32);
                    let count = db
                        .get(id::SYS_STORAGE_INFO_COUNT)
                        .and_then(|e| e.value.as_uint())
                        .unwrap_or(0);
                    db.set_uint(id::SYS_STORAGE_INFO_COUNT, count + 1, PropId::NONE);
                    db.set_attributes(
                        id::SYS_STORAGE_INFO_COUNT,
                        ATTR_PERSIST | ATTR_PROTECT,
                    );

                    // Debounce: restart the quiet timer on every
                    // further update
                    loop {
                        if stop_flag.load(Ordering::Acquire) {
                            return;
                        }
                        match notify_rx.recv_timeout(debounce) {
                            Ok(()) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    while notify_rx.try_recv().is_ok() {}

                    let mut log = log.lock();
                    match save_props_to_log(&db, &mut log, true) {
                        Ok(()) => {
                            snapshot_count.fetch_add(1, Ordering::Release);
                        }
                        Err(err) => log::debug!("snapshot append failed: {err}"),
                    }
                }
            })
            .ok();

        Self {
            stop,
            worker,
            hub: hub.clone(),
            target,
            snapshots,
        }
    }

    /// Snapshot records written so far.
    #[must_use]
    pub fn snapshot_count(&self) -> u32 {
        self.snapshots.load(Ordering::Acquire)
    }

    /// Unsubscribe and stop the worker.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.hub.unsubscribe(&self.target);
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SnapshotService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes error and warning traffic into the flash event ring.
pub struct ErrorMonitor {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    hub: Hub,
    target: Arc<Target>,
}

impl ErrorMonitor {
    /// Subscribe to `ERROR.*` and `WARN.*` and start draining.
    #[must_use]
    pub fn start<S: Storage + Send + 'static>(
        errlog: Arc<Mutex<ErrorLog<S>>>,
        hub: &Hub,
        pools: crate::pool::PoolSet,
    ) -> Self {
        let target = Arc::new(Target::queued(pools, 8));
        target.add_filter(PropId(
            id::fields::P1_ERROR | id::fields::P2_MSK | id::fields::P3_MSK | id::fields::P4_MSK,
        ));
        target.add_filter(PropId(
            id::fields::P1_WARN | id::fields::P2_MSK | id::fields::P3_MSK | id::fields::P4_MSK,
        ));
        hub.subscribe(Arc::clone(&target));

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let drain = Arc::clone(&target);

        let worker = std::thread::Builder::new()
            .name("error-mon".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    if let Some(msg) = drain.recv(POLL) {
                        let data = msg.payload.value().unwrap_or(0);
                        errlog.lock().write(ErrorEntry::new(msg.id, data));
                    }
                }
            })
            .ok();

        Self {
            stop,
            worker,
            hub: hub.clone(),
            target,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.hub.unsubscribe(&self.target);
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ErrorMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::fields::*;
    use crate::log::KIND_PROP_DB;
    use crate::msg::{report_error, set_sys_hub, NO_TIMEOUT};
    use crate::pool::PoolSet;
    use crate::propdb::PropValue;
    use crate::rtc::ManualRtc;
    use crate::storage::RamStorage;

    fn pools() -> PoolSet {
        let p = PoolSet::new();
        p.add_pool(16, 64);
        p.add_pool(4, 1024);
        p
    }

    fn wait_for<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_snapshot_service_debounces_updates() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 32);
        let db = Arc::new(PropDb::new(pools.clone()));
        db.set_msg_hub(hub.clone());

        let mut raw_log = BlockLog::new(RamStorage::new(1024, 3));
        raw_log.format();
        let log = Arc::new(Mutex::new(raw_log));

        let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);
        let service = SnapshotService::start(
            Arc::clone(&db),
            Arc::clone(&log),
            &hub,
            Arc::new(ManualRtc::new(1_700_000_000)),
            Duration::from_millis(100),
        );

        // A burst of persisted writes becomes one snapshot
        for i in 0..5u32 {
            db.set_uint(
                PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX),
                1000 + i,
                PropId::NONE,
            );
            db.set_attributes(
                PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX),
                ATTR_PERSIST,
            );
        }

        assert!(wait_for(|| service.snapshot_count() == 1, Duration::from_secs(5)));
        // Quiet period: still exactly one
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(service.snapshot_count(), 1);

        service.stop();
        dispatcher.stop();

        // The record restores the final value plus bookkeeping props
        let fresh = PropDb::new(pools.clone());
        let mut log = Arc::try_unwrap(log)
            .map_err(|_| ())
            .expect("no other log handles")
            .into_inner();
        let restored = restore_props_from_log(&fresh, &mut log);
        assert!(restored >= 2);
        assert_eq!(
            fresh
                .get(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX))
                .unwrap()
                .value,
            PropValue::Uint(1004)
        );
        assert_eq!(
            fresh
                .get(id::SYS_STORAGE_INFO_COUNT)
                .unwrap()
                .value
                .as_uint(),
            Some(1)
        );
        let (header, _) = log.read_last_owned().unwrap();
        assert_eq!(header.kind, KIND_PROP_DB);
    }

    #[test]
    fn test_boot_restore_prefers_snapshot_over_defaults() {
        let pools = pools();
        let defaults = [
            PropDefault::uint(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX), 1500, ATTR_PERSIST),
            PropDefault::uint(PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION), 7, 0),
        ];

        // First boot: defaults only, then a snapshot with a changed value
        let db = PropDb::new(pools.clone());
        let mut log = BlockLog::new(RamStorage::new(1024, 3));
        log.format();
        assert_eq!(boot_restore(&db, &mut log, &defaults), 0);
        db.set_uint(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX), 9000, PropId::NONE);
        save_props_to_log(&db, &mut log, true).unwrap();

        // Second boot: the snapshot overrides the default
        let db2 = PropDb::new(pools.clone());
        assert!(boot_restore(&db2, &mut log, &defaults) >= 1);
        assert_eq!(
            db2.get(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_MAX))
                .unwrap()
                .value
                .as_uint(),
            Some(9000)
        );
        // Non-persisted default still present
        assert_eq!(
            db2.get(PropId(P1_SYS | P2_HW | P3_INFO | P4_VERSION))
                .unwrap()
                .value
                .as_uint(),
            Some(7)
        );
    }

    #[test]
    fn test_error_monitor_lands_in_errlog() {
        let pools = pools();
        let hub = Hub::new(pools.clone(), 32);
        set_sys_hub(&hub);

        let mut raw = ErrorLog::new(RamStorage::new(64, 2));
        raw.format();
        let errlog = Arc::new(Mutex::new(raw));

        let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);
        let monitor = ErrorMonitor::start(Arc::clone(&errlog), &hub, pools.clone());

        assert!(report_error(id::ERROR_SYS_MEM_ACCESS, 77));

        let logged = || {
            errlog
                .lock()
                .read_all()
                .iter()
                .any(|e| e.id == id::ERROR_SYS_MEM_ACCESS && e.data == 77)
        };
        assert!(wait_for(logged, Duration::from_secs(5)));
        monitor.stop();
        dispatcher.stop();
    }
}
