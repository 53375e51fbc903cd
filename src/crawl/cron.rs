//! Recurrence expressions for scheduled jobs.
//!
//! Two forms are accepted: `@every <duration>` (e.g. `@every 15m`) and
//! standard cron with 5, 6, or 7 fields. A 6-field expression has a leading
//! seconds field; a 7-field one adds a trailing year. Day-of-month and
//! day-of-week combine the usual cron way: when both are restricted, a time
//! matches if either does.

use std::time::Duration;

use time::{Date, Month, OffsetDateTime, Time};

use crate::error::{Error, Result};

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Fixed interval from the previous fire time.
    Every(Duration),
    /// Cron field sets.
    Cron(CronExpr),
}

/// Bitmask field sets for one cron expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    seconds: u64,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    years: Option<Vec<i32>>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl Schedule {
    /// Parses a recurrence expression.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("@every") {
            let spec = rest.trim();
            if spec.is_empty() {
                return Err(Error::Validation("@every requires a duration".into()));
            }
            return Ok(Schedule::Every(parse_duration(spec)?));
        }
        Ok(Schedule::Cron(CronExpr::parse(raw)?))
    }

    /// The first fire time strictly after `now`.
    pub fn next_after(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Schedule::Every(interval) => Some(now + *interval),
            Schedule::Cron(expr) => expr.next_after(now),
        }
    }
}

fn parse_duration(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, unit) = spec.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("bad duration {spec:?}")))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        other => return Err(Error::Validation(format!("bad duration unit {other:?}"))),
    };
    if seconds == 0 {
        return Err(Error::Validation("duration must be positive".into()));
    }
    Ok(Duration::from_secs(seconds))
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<(u64, bool)> {
    if raw == "*" {
        return Ok((mask_range(min, max, 1, min, max)?, false));
    }
    let mut mask = 0u64;
    let mut restricted = false;
    for atom in raw.split(',') {
        restricted = true;
        let (range, step) = match atom.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad cron step {atom:?}")))?;
                if step == 0 {
                    return Err(Error::Validation("cron step must be positive".into()));
                }
                (range, step)
            }
            None => (atom, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else {
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_bound(lo, min, max)?;
                    let hi = parse_bound(hi, min, max)?;
                    if lo > hi {
                        return Err(Error::Validation(format!("inverted cron range {atom:?}")));
                    }
                    (lo, hi)
                }
                None => {
                    let value = parse_bound(range, min, max)?;
                    (value, value)
                }
            }
        };
        mask |= mask_range(lo, hi, step, min, max)?;
    }
    Ok((mask, restricted))
}

fn parse_bound(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| Error::Validation(format!("bad cron value {raw:?}")))?;
    // Cron allows 7 for Sunday alongside 0.
    let value = if max == 6 && value == 7 { 0 } else { value };
    if value < min || value > max {
        return Err(Error::Validation(format!(
            "cron value {value} outside {min}..={max}"
        )));
    }
    Ok(value)
}

fn mask_range(lo: u32, hi: u32, step: u32, min: u32, max: u32) -> Result<u64> {
    if lo < min || hi > max {
        return Err(Error::Validation(format!(
            "cron range {lo}-{hi} outside {min}..={max}"
        )));
    }
    let mut mask = 0u64;
    let mut value = lo;
    while value <= hi {
        mask |= 1 << value;
        value += step;
    }
    Ok(mask)
}

impl CronExpr {
    fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let (seconds_field, rest, years_field) = match fields.len() {
            5 => (None, &fields[0..5], None),
            6 => (Some(fields[0]), &fields[1..6], None),
            7 => (Some(fields[0]), &fields[1..6], Some(fields[6])),
            n => {
                return Err(Error::Validation(format!(
                    "cron expression must have 5-7 fields, got {n}"
                )))
            }
        };
        let seconds = match seconds_field {
            Some(field) => parse_field(field, 0, 59)?.0,
            None => 1,
        };
        let (minutes, _) = parse_field(rest[0], 0, 59)?;
        let (hours, _) = parse_field(rest[1], 0, 23)?;
        let (days_of_month, dom_restricted) = parse_field(rest[2], 1, 31)?;
        let (months, _) = parse_field(rest[3], 1, 12)?;
        let (days_of_week, dow_restricted) = parse_field(rest[4], 0, 6)?;
        let years = match years_field {
            Some(field) if field != "*" => {
                let mut years = Vec::new();
                for atom in field.split(',') {
                    match atom.split_once('-') {
                        Some((lo, hi)) => {
                            let lo: i32 = lo.parse().map_err(|_| {
                                Error::Validation(format!("bad cron year {atom:?}"))
                            })?;
                            let hi: i32 = hi.parse().map_err(|_| {
                                Error::Validation(format!("bad cron year {atom:?}"))
                            })?;
                            years.extend(lo..=hi);
                        }
                        None => years.push(atom.parse().map_err(|_| {
                            Error::Validation(format!("bad cron year {atom:?}"))
                        })?),
                    }
                }
                years.sort_unstable();
                Some(years)
            }
            _ => None,
        };
        Ok(Self {
            seconds,
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            years,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, date: Date) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().number_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn year_matches(&self, year: i32) -> bool {
        match &self.years {
            Some(years) => years.binary_search(&year).is_ok(),
            None => true,
        }
    }

    /// The first matching instant strictly after `now` within an eight-year
    /// horizon (None past it, e.g. an exhausted year list).
    fn next_after(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let mut candidate = (now + Duration::from_secs(1)).replace_nanosecond(0).ok()?;
        let horizon = now.year() + 8;
        while candidate.year() <= horizon {
            if !self.year_matches(candidate.year()) {
                candidate = jump_to_next_year(candidate)?;
                continue;
            }
            if self.months & (1 << u8::from(candidate.month())) == 0 {
                candidate = jump_to_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = jump_to_next_day(candidate)?;
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = jump_to_next_hour(candidate)?;
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate = (candidate + Duration::from_secs(60))
                    .replace_second(0)
                    .ok()?;
                continue;
            }
            if self.seconds & (1 << candidate.second()) == 0 {
                candidate += Duration::from_secs(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

fn jump_to_next_year(at: OffsetDateTime) -> Option<OffsetDateTime> {
    let date = Date::from_calendar_date(at.year() + 1, Month::January, 1).ok()?;
    Some(at.replace_date(date).replace_time(Time::MIDNIGHT))
}

fn jump_to_next_month(at: OffsetDateTime) -> Option<OffsetDateTime> {
    let (year, month) = match at.month() {
        Month::December => (at.year() + 1, Month::January),
        month => (at.year(), month.next()),
    };
    let date = Date::from_calendar_date(year, month, 1).ok()?;
    Some(at.replace_date(date).replace_time(Time::MIDNIGHT))
}

fn jump_to_next_day(at: OffsetDateTime) -> Option<OffsetDateTime> {
    let date = at.date().next_day()?;
    Some(at.replace_date(date).replace_time(Time::MIDNIGHT))
}

fn jump_to_next_hour(at: OffsetDateTime) -> Option<OffsetDateTime> {
    let bumped = at + Duration::from_secs(3_600);
    bumped.replace_minute(0).ok()?.replace_second(0).ok()
}
