//! Crontab-style schedule parsing, formatting, and description.
//!
//! A schedule has five fields: minute, hour, day of month, month, and
//! day of week. Each field is a single value, an inclusive range
//! (`n-m`), or a wildcard (`*`); ranges and wildcards may carry a step
//! (`/n`). Ranges cannot wrap at zero.
//!
//! ```text
//!                        "* * * * *"
//! Minute        (0-59) ---' | | | |
//! Hour          (0-23) -----' | | |
//! Day of month  (1-31) -------' | |
//! Month         (1-12) ---------' |
//! Day of week   (0-6)  -----------'
//! ```
//!
//! Day of month and month are 1-based in the text form and 0-based in
//! [`CronField`], unlike civil time where only the day of month is
//! 1-based. A specific day of week takes precedence over a specific day
//! of month; see [`CronMap`].

use crate::rtc::CivilTime;

/// Field start value standing for `*`.
pub const WILDCARD_START: u8 = 63;

/// One schedule field: an inclusive range with an optional step. A zero
/// step means the same as a step of one; a zero end means a single
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CronField {
    pub start: u8,
    pub end: u8,
    pub step: u8,
}

impl CronField {
    /// The wildcard field.
    pub const ANY: CronField = CronField {
        start: WILDCARD_START,
        end: 0,
        step: 0,
    };

    #[must_use]
    pub const fn at(value: u8) -> Self {
        Self {
            start: value,
            end: value,
            step: 0,
        }
    }

    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        self.start == WILDCARD_START
    }
}

/// A full five-field schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CronSchedule {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl CronSchedule {
    /// Every minute of every day.
    pub const EVERY_MINUTE: CronSchedule = CronSchedule {
        minute: CronField::ANY,
        hour: CronField::ANY,
        day_of_month: CronField::ANY,
        month: CronField::ANY,
        day_of_week: CronField::ANY,
    };
}

fn decode_field(token: &str, offset: u8) -> Option<CronField> {
    let (range, step) = match token.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<u8>().ok()?)),
        None => (token, None),
    };

    let field = if range == "*" {
        CronField {
            start: WILDCARD_START,
            end: 0,
            step: step.unwrap_or(0),
        }
    } else if let Some((start, end)) = range.split_once('-') {
        let start: u8 = start.parse().ok()?;
        let end: u8 = end.parse().ok()?;
        if start < offset || end < start {
            return None; // Ranges cannot wrap
        }
        CronField {
            start: start - offset,
            end: end - offset,
            step: step.unwrap_or(0),
        }
    } else {
        // A bare value takes no step
        if step.is_some() {
            return None;
        }
        let value: u8 = range.parse().ok()?;
        if value < offset {
            return None;
        }
        CronField {
            start: value - offset,
            end: 0,
            step: 0,
        }
    };

    Some(field)
}

/// Parse the five-field text form.
#[must_use]
pub fn decode_schedule(text: &str) -> Option<CronSchedule> {
    let mut tokens = text.split_whitespace();
    let schedule = CronSchedule {
        minute: decode_field(tokens.next()?, 0)?,
        hour: decode_field(tokens.next()?, 0)?,
        day_of_month: decode_field(tokens.next()?, 1)?,
        month: decode_field(tokens.next()?, 1)?,
        day_of_week: decode_field(tokens.next()?, 0)?,
    };

    if tokens.next().is_some() {
        return None;
    }
    Some(schedule)
}

fn encode_field(out: &mut String, field: &CronField, offset: u8, last: bool) {
    if field.is_wildcard() {
        out.push('*');
    } else {
        out.push_str(&(field.start + offset).to_string());
        if field.end > field.start {
            out.push('-');
            out.push_str(&(field.end + offset).to_string());
        }
    }
    if field.step > 1 {
        out.push('/');
        out.push_str(&field.step.to_string());
    }
    if !last {
        out.push(' ');
    }
}

/// Render a schedule back into the text form.
#[must_use]
pub fn encode_schedule(schedule: &CronSchedule) -> String {
    let mut out = String::new();
    encode_field(&mut out, &schedule.minute, 0, false);
    encode_field(&mut out, &schedule.hour, 0, false);
    encode_field(&mut out, &schedule.day_of_month, 1, false);
    encode_field(&mut out, &schedule.month, 1, false);
    encode_field(&mut out, &schedule.day_of_week, 0, true);
    out
}

/// Expanded bitmaps for minute-by-minute matching.
///
/// When day of week is specific, day of month is cleared, and vice
/// versa, so a schedule never requires both to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronMap {
    pub minutes: u64,
    pub hours: u32,
    pub days_of_month: u32,
    pub months: u16,
    pub days_of_week: u16,
}

fn field_bitmap(field: &CronField) -> u64 {
    let step = u64::from(field.step.max(1));

    if field.is_wildcard() && step == 1 {
        return u64::MAX;
    }

    // A stepped wildcard covers the widest field (minutes); callers
    // truncate for narrower ones
    let start = if field.is_wildcard() { 0 } else { field.start };
    let end = if field.is_wildcard() {
        59
    } else {
        field.end.max(field.start)
    };

    let mut bitmap = 0u64;
    let mut pos = u64::from(start);
    while pos <= u64::from(end) {
        bitmap |= 1 << pos;
        pos += step;
    }
    bitmap
}

impl CronMap {
    /// Expand a schedule into match bitmaps.
    #[must_use]
    pub fn from_schedule(schedule: &CronSchedule) -> Self {
        let mut map = Self {
            minutes: field_bitmap(&schedule.minute),
            hours: field_bitmap(&schedule.hour) as u32,
            days_of_month: field_bitmap(&schedule.day_of_month) as u32,
            months: field_bitmap(&schedule.month) as u16,
            days_of_week: field_bitmap(&schedule.day_of_week) as u16,
        };

        // Only one of day-of-month / day-of-week participates in
        // matching; a specific day of week wins
        if map.days_of_week != 0xFFFF && map.days_of_week != 0 {
            map.days_of_month = 0;
        } else if map.days_of_month != 0 {
            map.days_of_week = 0;
        }

        map
    }

    /// Bitmaps that match exactly one hour:minute, any day.
    #[must_use]
    pub fn at_time(hour: u8, minute: u8) -> Self {
        Self {
            minutes: 1 << minute,
            hours: 1 << hour,
            days_of_month: u32::MAX,
            months: u16::MAX,
            days_of_week: u16::MAX,
        }
    }

    /// Test one civil minute against the bitmaps.
    #[must_use]
    pub fn matches(&self, t: &CivilTime) -> bool {
        self.minutes & (1 << t.minute) != 0
            && self.hours & (1 << t.hour) != 0
            && self.months & (1 << t.month) != 0
            && (self.days_of_month & (1 << t.day) != 0
                || self.days_of_week & (1 << t.weekday) != 0)
    }
}

fn describe_list(out: &mut String, field: &CronField, max_value: u8, fmt: impl Fn(u8) -> String) {
    let step = field.step.max(1);
    let start = if field.is_wildcard() { 0 } else { field.start };
    let end = if field.is_wildcard() {
        max_value
    } else {
        field.end.max(field.start)
    };

    if step <= 1 && end > start {
        out.push_str(&fmt(start));
        out.push_str(" to ");
        out.push_str(&fmt(end));
        return;
    }

    let items: Vec<String> = (start..=end.min(max_value))
        .step_by(usize::from(step))
        .map(fmt)
        .collect();
    for (ix, item) in items.iter().enumerate() {
        out.push_str(item);
        if ix + 2 == items.len() {
            out.push_str(if items.len() > 2 { ", and " } else { " and " });
        } else if ix + 1 < items.len() {
            out.push_str(", ");
        }
    }
}

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Human-readable description, one clause per meaningful field.
#[must_use]
pub fn describe_schedule(schedule: &CronSchedule) -> String {
    let mut clauses: Vec<String> = Vec::new();

    // Days
    let dow_specific = !schedule.day_of_week.is_wildcard();
    let dom_specific = !schedule.day_of_month.is_wildcard();
    if dow_specific {
        let mut s = String::from("every week on ");
        describe_list(&mut s, &schedule.day_of_week, 6, |v| {
            DAY_NAMES[usize::from(v.min(6))].to_string()
        });
        clauses.push(s);
    } else if dom_specific {
        let mut s = String::from("on date ");
        describe_list(&mut s, &schedule.day_of_month, 30, |v| (v + 1).to_string());
        clauses.push(s);
    } else {
        clauses.push("every day".to_string());
    }

    // Months
    if schedule.month.is_wildcard() && schedule.month.step <= 1 {
        clauses.push("every month".to_string());
    } else {
        let mut s = String::from("in ");
        describe_list(&mut s, &schedule.month, 11, |v| {
            MONTH_NAMES[usize::from(v.min(11))].to_string()
        });
        clauses.push(s);
    }

    // Hours
    if schedule.hour.is_wildcard() && schedule.hour.step <= 1 {
        clauses.push("every hour".to_string());
    } else {
        let mut s = String::from("at hour ");
        describe_list(&mut s, &schedule.hour, 23, |v| {
            let (display, half) = match v {
                0 => (12, 'A'),
                1..=11 => (v, 'A'),
                12 => (12, 'P'),
                _ => (v - 12, 'P'),
            };
            format!("{display}{half}")
        });
        clauses.push(s);
    }

    // Minutes
    if schedule.minute.is_wildcard() && schedule.minute.step <= 1 {
        clauses.push("every minute".to_string());
    } else {
        let mut s = String::from("at ");
        describe_list(&mut s, &schedule.minute, 59, |v| v.to_string());
        s.push_str(" minutes past");
        clauses.push(s);
    }

    clauses.join(", ")
}
