//! Calendar-time event scheduler.
//!
//! Cron entries bind a [`CronSchedule`] to a start event id, optionally
//! paired with an end event sent a fixed number of minutes later (up to
//! 24 hours), which covers on/off behaviours with one entry. Event
//! generation is synchronised to the top of each RTC minute; the sweep
//! re-tests every minute between two wakeups so short scheduler stalls
//! lose no events.
//!
//! Clock shifts: a forward jump of up to an hour (DST spring-forward)
//! replays the skipped minutes; a backward jump of up to an hour sleeps
//! through the repeated span; larger jumps are anomalies and ignored.
//!
//! Persist-flagged entries are packed into a CRC-16-guarded blob under
//! `SYS.CRON.LOCAL.VALUE` so schedules survive a reboot.

pub mod schedule;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::id::{self, PropId};
use crate::msg::{report_error, Hub, Msg, NO_TIMEOUT};
use crate::propdb::{PropDb, PropEntry, PropValue, ATTR_PERSIST, ATTR_PROTECT};
use crate::rtc::{epoch_to_civil, RtcDevice};
use crate::util::crc::{crc16_finish, crc16_init, crc16_update_block};

pub use schedule::{
    decode_schedule, describe_schedule, encode_schedule, CronField, CronMap, CronSchedule,
};

/// Entry survives reboot via the property database.
pub const FLAG_PERSIST: u8 = 0x01;
/// Entry cannot be removed from a console.
pub const FLAG_PROTECT: u8 = 0x02;
/// Entry is removed after it fires (never persisted).
pub const FLAG_ONE_SHOT: u8 = 0x04;

const FLAG_USER_MASK: u8 = 0x7F;
/// Internal: the start event fired and the map now aims at the end event.
const FLAG_STARTED: u8 = 0x80;

/// Packed size of one serialised entry definition.
const DEF_LEN: usize = 21;

const SWEEP_PERIOD_SECS: i64 = 60;

/// One schedule-to-event binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronDef {
    pub event: PropId,
    pub event_end: PropId,
    pub schedule: CronSchedule,
    /// Minutes until `event_end` fires; 0 for no end event.
    pub duration_minutes: i16,
    pub flags: u8,
}

impl CronDef {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.event.0.to_le_bytes());
        out.extend_from_slice(&self.event_end.0.to_le_bytes());
        for field in [
            &self.schedule.minute,
            &self.schedule.hour,
            &self.schedule.day_of_month,
            &self.schedule.month,
            &self.schedule.day_of_week,
        ] {
            let packed = u16::from(field.start & 0x3F)
                | u16::from(field.end & 0x3F) << 6
                | u16::from(field.step & 0x0F) << 12;
            out.extend_from_slice(&packed.to_le_bytes());
        }
        out.extend_from_slice(&self.duration_minutes.to_le_bytes());
        out.push(self.flags);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEF_LEN {
            return None;
        }

        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let field = |at: usize| {
            let packed = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
            CronField {
                start: (packed & 0x3F) as u8,
                end: (packed >> 6 & 0x3F) as u8,
                step: (packed >> 12) as u8,
            }
        };

        Some(Self {
            event: PropId(word(0)),
            event_end: PropId(word(4)),
            schedule: CronSchedule {
                minute: field(8),
                hour: field(10),
                day_of_month: field(12),
                month: field(14),
                day_of_week: field(16),
            },
            duration_minutes: i16::from_le_bytes([bytes[18], bytes[19]]),
            flags: bytes[20],
        })
    }
}

struct CronEntry {
    def: CronDef,
    active_map: CronMap,
}

struct CronInner {
    entries: Mutex<Vec<CronEntry>>,
    hub: Hub,
    db: Arc<PropDb>,
}

/// The scheduler: a shared entry list plus its sweep and persistence.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<CronInner>,
}

impl CronScheduler {
    /// A scheduler publishing through `hub` and persisting into `db`.
    #[must_use]
    pub fn new(hub: Hub, db: Arc<PropDb>) -> Self {
        Self {
            inner: Arc::new(CronInner {
                entries: Mutex::new(Vec::new()),
                hub,
                db,
            }),
        }
    }

    fn add_def(&self, mut def: CronDef, db_update: bool) {
        def.flags &= FLAG_USER_MASK;
        if def.flags & FLAG_ONE_SHOT != 0 {
            // A one-shot that outlived its own firing makes no sense
            def.flags &= !FLAG_PERSIST;
        }

        let entry = CronEntry {
            active_map: CronMap::from_schedule(&def.schedule),
            def,
        };
        self.inner.entries.lock().push(entry);

        if db_update && def.flags & FLAG_PERSIST != 0 {
            self.save_to_db();
        }
    }

    /// Bind a schedule to a start event, with an optional end event
    /// `duration_minutes` after each start.
    pub fn add_event(
        &self,
        schedule: &CronSchedule,
        event: PropId,
        flags: u8,
        event_end: PropId,
        duration_minutes: i16,
    ) {
        self.add_def(
            CronDef {
                event,
                event_end,
                schedule: *schedule,
                duration_minutes,
                flags,
            },
            true,
        );
    }

    /// Parse `schedule_text` and bind it. False on a malformed schedule.
    pub fn add_event_by_schedule(
        &self,
        schedule_text: &str,
        event: PropId,
        flags: u8,
        event_end: PropId,
        duration_minutes: i16,
    ) -> bool {
        match decode_schedule(schedule_text) {
            Some(schedule) => {
                self.add_event(&schedule, event, flags, event_end, duration_minutes);
                true
            }
            None => false,
        }
    }

    /// One-shot event at a specific wall-clock time.
    pub fn add_event_at(&self, epoch_secs: i64, event: PropId) {
        let t = epoch_to_civil(epoch_secs);
        let schedule = CronSchedule {
            minute: CronField::at(t.minute),
            hour: CronField::at(t.hour),
            day_of_month: CronField::at(t.day),
            month: CronField::at(t.month),
            day_of_week: CronField::ANY,
        };
        self.add_def(
            CronDef {
                event,
                event_end: PropId::NONE,
                schedule,
                duration_minutes: 0,
                flags: FLAG_ONE_SHOT,
            },
            true,
        );
    }

    /// Remove the entry bound to `event`.
    pub fn remove_event(&self, event: PropId) -> bool {
        let removed = {
            let mut entries = self.inner.entries.lock();
            match entries.iter().position(|e| e.def.event == event) {
                Some(ix) => {
                    let entry = entries.swap_remove(ix);
                    Some(entry.def.flags & FLAG_PERSIST != 0)
                }
                None => None,
            }
        };

        match removed {
            Some(persisted) => {
                if persisted {
                    self.save_to_db();
                }
                true
            }
            None => false,
        }
    }

    /// Current entry definitions, internal flags masked off.
    #[must_use]
    pub fn entries(&self) -> Vec<CronDef> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|e| CronDef {
                flags: e.def.flags & FLAG_USER_MASK,
                ..e.def
            })
            .collect()
    }

    fn send_event(&self, event: PropId) {
        let _ = self.inner.hub.send(
            Msg::event(event, id::RSRC_SYS_CRON_TASK),
            NO_TIMEOUT,
        );
    }

    /// Test every whole minute in `(from, until]` against all entries,
    /// publishing start and end events as they match.
    pub fn run_pending(&self, from: i64, until: i64) {
        // Align to the first whole minute after `from`
        let mut now = from + SWEEP_PERIOD_SECS - from.rem_euclid(SWEEP_PERIOD_SECS);

        while now <= until {
            let t = epoch_to_civil(now);
            let mut fired: Vec<PropId> = Vec::new();

            {
                let mut entries = self.inner.entries.lock();
                let mut ix = 0;
                while ix < entries.len() {
                    let entry = &mut entries[ix];
                    let mut remove = false;

                    if entry.active_map.matches(&t) {
                        if entry.def.flags & FLAG_STARTED == 0 {
                            fired.push(entry.def.event);

                            if entry.def.duration_minutes > 0 {
                                // Re-aim the map at start + duration
                                let total = i64::from(t.hour) * 60
                                    + i64::from(t.minute)
                                    + i64::from(entry.def.duration_minutes);
                                let end_hour = (total / 60 % 24) as u8;
                                let end_minute = (total % 60) as u8;
                                entry.active_map = CronMap::at_time(end_hour, end_minute);
                                entry.def.flags |= FLAG_STARTED;
                            } else if entry.def.flags & FLAG_ONE_SHOT != 0 {
                                remove = true;
                            }
                        } else {
                            fired.push(entry.def.event_end);
                            entry.active_map = CronMap::from_schedule(&entry.def.schedule);
                            entry.def.flags &= !FLAG_STARTED;
                            if entry.def.flags & FLAG_ONE_SHOT != 0 {
                                remove = true;
                            }
                        }
                    }

                    if remove {
                        entries.swap_remove(ix);
                    } else {
                        ix += 1;
                    }
                }
            }

            for event in fired {
                self.send_event(event);
            }

            now += SWEEP_PERIOD_SECS;
        }
    }

    fn serialize_entries(&self) -> Option<Vec<u8>> {
        let entries = self.inner.entries.lock();
        let persisted: Vec<&CronEntry> = entries
            .iter()
            .filter(|e| e.def.flags & FLAG_PERSIST != 0)
            .collect();
        if persisted.is_empty() {
            return None;
        }

        let mut defs = Vec::with_capacity(persisted.len() * DEF_LEN);
        for entry in &persisted {
            let clean = CronDef {
                flags: entry.def.flags & FLAG_USER_MASK,
                ..entry.def
            };
            clean.encode(&mut defs);
        }

        let crc = crc16_finish(crc16_update_block(crc16_init(), &defs));

        let mut blob = Vec::with_capacity(4 + defs.len());
        blob.extend_from_slice(&(persisted.len() as u16).to_le_bytes());
        blob.extend_from_slice(&crc.to_le_bytes());
        blob.extend_from_slice(&defs);
        Some(blob)
    }

    /// Write persist-flagged entries into `SYS.CRON.LOCAL.VALUE`. With
    /// no such entries left the property is dropped instead.
    pub fn save_to_db(&self) -> bool {
        let Some(blob) = self.serialize_entries() else {
            self.inner.db.remove(id::SYS_CRON_LOCAL_VALUE);
            return true;
        };

        let Some(buf) = self.inner.db.pools().alloc_shared_from(&blob) else {
            report_error(id::ERROR_SYS_MEM_ACCESS, blob.len() as u32);
            return false;
        };

        self.inner.db.set_entry(
            id::SYS_CRON_LOCAL_VALUE,
            PropEntry::new(PropValue::Blob(buf)).with_attrs(ATTR_PERSIST | ATTR_PROTECT),
            PropId::NONE,
        )
    }

    /// Replace persist-flagged entries with the saved set from the
    /// database. A CRC mismatch discards the blob and reports
    /// `ERROR.CRON.PROP.INVALID`.
    pub fn load_from_db(&self) -> bool {
        let Some(entry) = self.inner.db.get(id::SYS_CRON_LOCAL_VALUE) else {
            return false;
        };
        let Some(blob) = entry.value.as_blob() else {
            return false;
        };
        if blob.len() < 4 {
            return false;
        }

        let count = usize::from(u16::from_le_bytes([blob[0], blob[1]]));
        let stored_crc = u16::from_le_bytes([blob[2], blob[3]]);
        let defs = &blob[4..];

        if defs.len() != count * DEF_LEN {
            report_error(id::ERROR_CRON_PROP_INVALID, stored_crc.into());
            return false;
        }
        let crc = crc16_finish(crc16_update_block(crc16_init(), defs));
        if crc != stored_crc {
            report_error(id::ERROR_CRON_PROP_INVALID, crc.into());
            return false;
        }

        // Drop the current persistent entries before loading
        self.inner
            .entries
            .lock()
            .retain(|e| e.def.flags & FLAG_PERSIST == 0);

        for chunk in defs.chunks_exact(DEF_LEN) {
            if let Some(def) = CronDef::decode(chunk) {
                self.add_def(def, false);
            }
        }
        true
    }

    /// Run the minute sweep on a dedicated thread driven by `rtc`.
    #[must_use]
    pub fn spawn(&self, rtc: Arc<dyn RtcDevice>) -> CronTaskHandle {
        let scheduler = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("cron".into())
            .spawn(move || {
                let mut until = rtc.get_time();
                while !stop_flag.load(Ordering::Acquire) {
                    let from = until;

                    // Sleep to the top of the next minute, staying
                    // responsive to stop requests
                    let elapsed = rtc.get_time().rem_euclid(SWEEP_PERIOD_SECS);
                    let mut remaining = SWEEP_PERIOD_SECS - elapsed;
                    while remaining > 0 && !stop_flag.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(200));
                        let at = rtc.get_time().rem_euclid(SWEEP_PERIOD_SECS);
                        remaining = if at < elapsed { 0 } else { SWEEP_PERIOD_SECS - at };
                    }
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }

                    until = rtc.get_time();
                    let delta = until - from;

                    if delta > 0 && delta <= 3600 + SWEEP_PERIOD_SECS {
                        // Normal advance, or a DST-sized forward jump:
                        // generate everything in between
                        scheduler.run_pending(from, until);
                    } else if delta < SWEEP_PERIOD_SECS
                        && delta >= -3600 - SWEEP_PERIOD_SECS
                    {
                        // Backward shift: sleep out the replayed span
                        let skip_ms = (-delta).max(0) as u64 * 1000;
                        let mut slept_ms = 0u64;
                        while slept_ms < skip_ms && !stop_flag.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_millis(200));
                            slept_ms += 200;
                        }
                    }
                    // Larger shifts are anomalies; ignore them
                }
            })
            .ok();

        CronTaskHandle { stop, handle }
    }
}

/// Stop control for the cron sweep thread.
pub struct CronTaskHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CronTaskHandle {
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

impl Drop for CronTaskHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
