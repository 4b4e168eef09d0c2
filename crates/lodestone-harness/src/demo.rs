//! The `demo` subcommand: a full boot/mutate/snapshot/reboot cycle.

use std::sync::Arc;
use std::time::Duration;

use lodestone_core::cron::{describe_schedule, CronScheduler, FLAG_PERSIST};
use lodestone_core::errlog::ErrorLog;
use lodestone_core::id::{fields::*, PropId};
use lodestone_core::log::props::save_props_to_log;
use lodestone_core::msg::{set_sys_hub, Hub, Msg, NO_TIMEOUT};
use lodestone_core::propdb::ATTR_PERSIST;
use lodestone_core::rtc::{HostedRtc, RtcDevice};
use lodestone_core::service::{ErrorMonitor, SnapshotService};
use lodestone_core::storage::RamStorage;
use parking_lot::Mutex;

use crate::rig::{self, P_NET_IPV4_DOMAIN_NAME, P_NET_IPV4_SUBNET_MASK};

const EV_NIGHT_MODE: PropId = PropId(P1_EVENT | P2_HW | P3_LOCAL | P4_ON);
const EV_DAY_MODE: PropId = PropId(P1_EVENT | P2_HW | P3_LOCAL | P4_OFF);

/// Run the demo, printing the stack's state as it evolves. Returns
/// false if any stage misbehaved.
pub fn run(use_services: bool) -> bool {
    let registry = rig::standard_registry();

    // First boot on blank flash
    let stack = rig::boot(None);
    println!("== first boot: {} properties restored", stack.restored);
    print!("{}", stack.db.dump(&registry));

    let hub = Hub::new(stack.pools.clone(), 64);
    set_sys_hub(&hub);
    stack.db.set_msg_hub(hub.clone());
    let dispatcher = hub.spawn_dispatcher(NO_TIMEOUT);

    // Mutate configuration
    let source = PropId(P1_RSRC | P2_CON | P3_LOCAL | P4_TASK);
    stack.db.set_uint(P_NET_IPV4_SUBNET_MASK, 0xFFFF_FE00, source);
    stack.db.set_str(P_NET_IPV4_DOMAIN_NAME, "bench.local", source);
    stack
        .db
        .set_uint(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_TIMEOUT), 30, source);
    stack
        .db
        .set_attributes(PropId(P1_NET | P2_SYS | P3_LIMIT | P4_TIMEOUT), ATTR_PERSIST);

    // A persistent cron schedule rides along in the database
    let cron = CronScheduler::new(hub.clone(), Arc::clone(&stack.db));
    cron.add_event_by_schedule("0 22 * * *", EV_NIGHT_MODE, FLAG_PERSIST, EV_DAY_MODE, 480);
    for def in cron.entries() {
        println!("cron: {}", describe_schedule(&def.schedule));
    }

    let mut log = stack.log;
    let snapshot_ok = if use_services {
        // Let the real persistence loop write the record
        let log_shared = Arc::new(Mutex::new(log));
        let rtc: Arc<dyn RtcDevice> = Arc::new(HostedRtc::new());
        let service = SnapshotService::start(
            Arc::clone(&stack.db),
            Arc::clone(&log_shared),
            &hub,
            rtc,
            Duration::from_millis(200),
        );

        let errlog = Arc::new(Mutex::new({
            let mut el = ErrorLog::new(RamStorage::new(64, 2));
            el.format();
            el
        }));
        let monitor = ErrorMonitor::start(Arc::clone(&errlog), &hub, stack.pools.clone());

        // Trigger one more persisted write, then wait out the debounce
        stack.db.set_uint(P_NET_IPV4_SUBNET_MASK, 0xFFFF_FC00, source);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while service.snapshot_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let wrote = service.snapshot_count() > 0;
        println!("== snapshot service wrote {} record(s)", service.snapshot_count());

        // Raise an error so the monitor has something to log
        hub.send(
            Msg::with_value(
                lodestone_core::id::ERROR_SYS_MEM_ACCESS,
                source,
                512,
            ),
            NO_TIMEOUT,
        );
        std::thread::sleep(Duration::from_millis(100));
        for entry in errlog.lock().read_all() {
            println!("errlog: {} = {}", registry.name_of(entry.id), entry.data);
        }

        monitor.stop();
        service.stop();
        log = match Arc::try_unwrap(log_shared) {
            Ok(lock) => lock.into_inner(),
            Err(_) => {
                println!("!! log still shared after service stop");
                return false;
            }
        };
        wrote
    } else {
        save_props_to_log(&stack.db, &mut log, true).is_ok()
    };
    dispatcher.stop();

    if !snapshot_ok {
        println!("!! snapshot was not written");
        return false;
    }

    // Simulated reboot from the same flash image
    let image = log.into_store().image().to_vec();
    let stack2 = rig::boot(Some(image));
    println!("== second boot: {} properties restored", stack2.restored);
    print!("{}", stack2.db.dump(&registry));

    let restored_cron = CronScheduler::new(hub.clone(), Arc::clone(&stack2.db));
    if restored_cron.load_from_db() {
        println!("== cron entries restored: {}", restored_cron.entries().len());
    }

    stack2
        .db
        .get(P_NET_IPV4_DOMAIN_NAME)
        .and_then(|e| e.value.as_str().map(|s| s == "bench.local"))
        .unwrap_or(false)
        && stack2.restored >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_without_services() {
        assert!(run(false));
    }

    #[test]
    fn test_demo_with_services() {
        assert!(run(true));
    }
}
