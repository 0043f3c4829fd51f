//! Six-field CRON expression parsing and evaluation.
//!
//! Expressions have the form `S M H DoM Mo DoW` (seconds through weekday)
//! and are evaluated strictly in UTC. Each field accepts `*`, single values,
//! `A-B` ranges, `/K` steps, and comma unions of those forms.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead of the reference instant a match is searched for before the
/// expression is declared unschedulable.
const HORIZON_YEARS: i32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 6 fields (sec min hour day month weekday), got {0}")]
    FieldCount(usize),
    #[error("invalid token `{token}` in {field} field")]
    BadToken { field: &'static str, token: String },
    #[error("value {value} out of range {min}-{max} in {field} field")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("descending range {start}-{end} in {field} field")]
    BadRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
    #[error("step must be greater than zero in {field} field")]
    ZeroStep { field: &'static str },
    #[error("no occurrence within {HORIZON_YEARS} years of the reference instant")]
    Unschedulable,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 6,
};

/// A parsed CRON schedule: one permitted-value bitmask per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Whether the DoM / DoW fields were written as anything other than `*`.
    /// Both restricted means Vixie OR semantics: a day matches if either
    /// field is satisfied.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    /// Parse a six-field expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        Ok(Self {
            seconds: parse_field(fields[0], SECONDS)?,
            minutes: parse_field(fields[1], MINUTES)?,
            hours: parse_field(fields[2], HOURS)?,
            days_of_month: parse_field(fields[3], DAYS_OF_MONTH)?,
            months: parse_field(fields[4], MONTHS)?,
            days_of_week: parse_field(fields[5], DAYS_OF_WEEK)?,
            dom_restricted: fields[3] != "*",
            dow_restricted: fields[5] != "*",
        })
    }

    /// The smallest instant strictly after `after` matching every field.
    ///
    /// Sub-second precision is discarded: candidates are whole UTC seconds.
    /// Searching stops [`HORIZON_YEARS`] past `after` and yields
    /// [`ScheduleError::Unschedulable`] (e.g. `0 0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let start = after
            .with_nanosecond(0)
            .unwrap_or(after)
            .checked_add_signed(chrono::Duration::seconds(1))
            .ok_or(ScheduleError::Unschedulable)?;

        let horizon_year = after.year() + HORIZON_YEARS;
        let mut date = start.date_naive();
        // Only the first candidate day is constrained by the reference time;
        // every later day is searched from midnight.
        let mut floor = Some(start.time());

        loop {
            if date.year() > horizon_year {
                return Err(ScheduleError::Unschedulable);
            }
            if self.date_matches(date)
                && let Some(time) = self.first_time_at_or_after(floor)
            {
                return Ok(Utc.from_utc_datetime(&date.and_time(time)));
            }
            date = date.succ_opt().ok_or(ScheduleError::Unschedulable)?;
            floor = None;
        }
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !bit_set(self.months, date.month()) {
            return false;
        }
        let dom_ok = bit_set(self.days_of_month, date.day());
        let dow_ok = bit_set(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Earliest permitted time-of-day at or after `floor` (midnight if `None`).
    fn first_time_at_or_after(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (floor_hour, floor_min, floor_sec) = match floor {
            Some(t) => (t.hour(), t.minute(), t.second()),
            None => (0, 0, 0),
        };

        let mut hour = next_bit(self.hours, floor_hour, HOURS.max)?;
        loop {
            let min_floor = if hour == floor_hour { floor_min } else { 0 };
            let mut minute = match next_bit(self.minutes, min_floor, MINUTES.max) {
                Some(m) => m,
                None => {
                    hour = next_bit(self.hours, hour + 1, HOURS.max)?;
                    continue;
                }
            };
            loop {
                let sec_floor = if hour == floor_hour && minute == floor_min {
                    floor_sec
                } else {
                    0
                };
                match next_bit(self.seconds, sec_floor, SECONDS.max) {
                    Some(second) => return NaiveTime::from_hms_opt(hour, minute, second),
                    None => match next_bit(self.minutes, minute + 1, MINUTES.max) {
                        Some(m) => minute = m,
                        None => {
                            hour = next_bit(self.hours, hour + 1, HOURS.max)?;
                            break;
                        }
                    },
                }
            }
        }
    }
}

fn bit_set(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

/// Smallest set bit in `mask` within `from..=max`.
fn next_bit(mask: u64, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|&v| bit_set(mask, v))
}

/// Parse one field (a comma union of parts) into a bitmask.
fn parse_field(token: &str, spec: FieldSpec) -> Result<u64, ScheduleError> {
    let mut mask = 0u64;
    for part in token.split(',') {
        mask |= parse_part(part, spec)?;
    }
    Ok(mask)
}

/// Parse a single `*`, `N`, `A-B`, `*/K`, `A-B/K`, or `N/K` part.
fn parse_part(part: &str, spec: FieldSpec) -> Result<u64, ScheduleError> {
    let bad_token = || ScheduleError::BadToken {
        field: spec.name,
        token: part.to_string(),
    };
    if part.is_empty() {
        return Err(bad_token());
    }

    let (range, step) = match part.split_once('/') {
        Some((range, step_str)) => {
            let step: u32 = step_str.parse().map_err(|_| bad_token())?;
            if step == 0 {
                return Err(ScheduleError::ZeroStep { field: spec.name });
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((lo, hi)) = range.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| bad_token())?;
        let hi: u32 = hi.parse().map_err(|_| bad_token())?;
        if lo > hi {
            return Err(ScheduleError::BadRange {
                field: spec.name,
                start: lo,
                end: hi,
            });
        }
        (lo, hi)
    } else {
        let value: u32 = range.parse().map_err(|_| bad_token())?;
        // `N/K` steps from N to the field maximum, Vixie-style.
        if part.contains('/') {
            (value, spec.max)
        } else {
            (value, value)
        }
    };

    for bound in [start, end] {
        if bound < spec.min || bound > spec.max {
            return Err(ScheduleError::OutOfRange {
                field: spec.name,
                value: bound,
                min: spec.min,
                max: spec.max,
            });
        }
    }

    let mut mask = 0u64;
    let mut value = start;
    while value <= end {
        mask |= 1 << value;
        value += step;
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        Schedule::parse(expr).unwrap().next_after(after).unwrap()
    }

    // -- parsing --

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            Schedule::parse("0 * * * *"),
            Err(ScheduleError::FieldCount(5))
        );
        assert_eq!(
            Schedule::parse("0 * * * * * *"),
            Err(ScheduleError::FieldCount(7))
        );
        assert_eq!(Schedule::parse(""), Err(ScheduleError::FieldCount(0)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            Schedule::parse("60 * * * * *"),
            Err(ScheduleError::OutOfRange { field: "second", value: 60, .. })
        ));
        assert!(matches!(
            Schedule::parse("* * 24 * * *"),
            Err(ScheduleError::OutOfRange { field: "hour", .. })
        ));
        assert!(matches!(
            Schedule::parse("* * * 0 * *"),
            Err(ScheduleError::OutOfRange { field: "day-of-month", value: 0, .. })
        ));
        assert!(matches!(
            Schedule::parse("* * * * 13 *"),
            Err(ScheduleError::OutOfRange { field: "month", .. })
        ));
        assert!(matches!(
            Schedule::parse("* * * * * 7"),
            Err(ScheduleError::OutOfRange { field: "day-of-week", .. })
        ));
    }

    #[test]
    fn rejects_bad_tokens() {
        assert!(matches!(
            Schedule::parse("x * * * * *"),
            Err(ScheduleError::BadToken { field: "second", .. })
        ));
        assert!(matches!(
            Schedule::parse("1,,2 * * * * *"),
            Err(ScheduleError::BadToken { .. })
        ));
        assert!(matches!(
            Schedule::parse("*/0 * * * * *"),
            Err(ScheduleError::ZeroStep { field: "second" })
        ));
        assert!(matches!(
            Schedule::parse("30-10 * * * * *"),
            Err(ScheduleError::BadRange { start: 30, end: 10, .. })
        ));
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        // 0,15,30,45 via list and via step should be the same mask
        let list = Schedule::parse("0,15,30,45 * * * * *").unwrap();
        let step = Schedule::parse("*/15 * * * * *").unwrap();
        assert_eq!(list, step);

        let ranged = Schedule::parse("10-30/10 * * * * *").unwrap();
        let explicit = Schedule::parse("10,20,30 * * * * *").unwrap();
        assert_eq!(ranged, explicit);
    }

    // -- evaluation --

    #[test]
    fn every_second_advances_by_one() {
        let t = utc(2024, 3, 10, 12, 0, 0);
        assert_eq!(next("* * * * * *", t), utc(2024, 3, 10, 12, 0, 1));
    }

    #[test]
    fn strict_future_even_on_exact_match() {
        // Reference instant itself satisfies the expression; ties advance.
        let t = utc(2024, 3, 10, 12, 0, 0);
        assert_eq!(next("0 0 12 * * *", t), utc(2024, 3, 11, 12, 0, 0));
    }

    #[test]
    fn subsecond_reference_rounds_up() {
        let t = utc(2024, 3, 10, 12, 0, 0) + chrono::Duration::milliseconds(250);
        assert_eq!(next("* * * * * *", t), utc(2024, 3, 10, 12, 0, 1));
    }

    #[test]
    fn carries_through_minute_hour_day() {
        let t = utc(2024, 1, 31, 23, 59, 59);
        assert_eq!(next("0 0 0 * * *", t), utc(2024, 2, 1, 0, 0, 0));
    }

    #[test]
    fn month_carry_into_next_year() {
        let t = utc(2024, 12, 31, 23, 59, 59);
        assert_eq!(next("0 0 0 1 1 *", t), utc(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn respects_leap_years() {
        let t = utc(2023, 3, 1, 0, 0, 0);
        assert_eq!(next("0 0 0 29 2 *", t), utc(2024, 2, 29, 0, 0, 0));
    }

    #[test]
    fn feb_31_is_unschedulable() {
        let schedule = Schedule::parse("0 0 0 31 2 *").unwrap();
        assert_eq!(
            schedule.next_after(utc(2024, 1, 1, 0, 0, 0)),
            Err(ScheduleError::Unschedulable)
        );
    }

    #[test]
    fn dom_dow_or_semantics() {
        // 2024-01-01 is a Monday, so it matches both `1` (DoM) and `1` (DoW).
        let t = utc(2023, 12, 31, 12, 0, 0);
        assert_eq!(next("0 0 0 1 * 1", t), utc(2024, 1, 1, 0, 0, 0));

        // One second past midnight: the next match is the following Monday,
        // not Feb 1 — either restricted field may satisfy the day.
        let t = utc(2024, 1, 1, 0, 0, 1);
        assert_eq!(next("0 0 0 1 * 1", t), utc(2024, 1, 8, 0, 0, 0));
    }

    #[test]
    fn dow_only_restriction() {
        // Sundays only (0). 2024-03-10 is a Sunday.
        let t = utc(2024, 3, 8, 0, 0, 0);
        assert_eq!(next("0 0 9 * * 0", t), utc(2024, 3, 10, 9, 0, 0));
    }

    #[test]
    fn dom_only_restriction() {
        let t = utc(2024, 3, 8, 0, 0, 0);
        assert_eq!(next("0 30 6 15 * *", t), utc(2024, 3, 15, 6, 30, 0));
    }

    #[test]
    fn monotone_in_reference_instant() {
        let schedule = Schedule::parse("*/7 2-40/3 */5 * * *").unwrap();
        let mut t = utc(2024, 6, 1, 0, 0, 0);
        for _ in 0..200 {
            let a = schedule.next_after(t).unwrap();
            let b = schedule.next_after(t + chrono::Duration::seconds(13)).unwrap();
            assert!(a > t);
            assert!(a <= b, "next_after must be monotone: {a} > {b}");
            t = a;
        }
    }

    #[test]
    fn consecutive_occurrences_all_match() {
        // Walking the schedule forward always lands on permitted values.
        let schedule = Schedule::parse("30 */5 8-17 * * 1-5").unwrap();
        let mut t = utc(2024, 5, 1, 0, 0, 0);
        for _ in 0..50 {
            t = schedule.next_after(t).unwrap();
            assert_eq!(t.second(), 30);
            assert_eq!(t.minute() % 5, 0);
            assert!((8..=17).contains(&t.hour()));
            let dow = t.weekday().num_days_from_sunday();
            assert!((1..=5).contains(&dow));
        }
    }
}
