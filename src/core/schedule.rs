//! Time windows for rules
//!
//! A rule's `Time` field is `{Days, Start, End, CronExpr}`. `Days` is a 7-slot
//! Sunday-first flag array, `Start`/`End` are `HH:MM`. A window with no days
//! and no times is "always".
//!
//! The cron encoding is `minute hour * * day-of-week`:
//!
//! ```
//! use pfw::core::schedule::{DaySet, decode, encode};
//!
//! let cron = encode(DaySet::WEEKDAYS, "10:00", "11:00").unwrap();
//! assert_eq!(cron, "0 10-11 * * 1,2,3,4,5");
//!
//! let (days, start, end) = decode(&cron).unwrap();
//! assert_eq!(days.to_string(), "weekdays");
//! assert_eq!((start.as_str(), end.as_str()), ("10:00", "11:00"));
//! ```

use crate::core::error::{Error, Result};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

const WEEKDAYS_SUN_FIRST: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Wire form of a rule schedule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TimeWindow {
    #[serde(default)]
    pub days: Vec<u8>,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    #[serde(default)]
    pub cron_expr: String,
}

impl TimeWindow {
    /// The "always" window: no days, no start, no end.
    pub fn always() -> Self {
        Self::default()
    }

    pub fn new(days: DaySet, start: &str, end: &str) -> Self {
        Self {
            days: days.to_flags().to_vec(),
            start: start.to_string(),
            end: end.to_string(),
            cron_expr: String::new(),
        }
    }

    pub fn is_always(&self) -> bool {
        self.days.iter().all(|d| *d == 0)
            && self.start.is_empty()
            && self.end.is_empty()
            && self.cron_expr.is_empty()
    }

    /// Validates the window and fills in whichever representation is missing.
    ///
    /// A window given only as `CronExpr` gets its `Days/Start/End` derived;
    /// a window given as `Days/Start/End` gets its `CronExpr` derived.
    pub fn normalize(&mut self) -> Result<()> {
        let days_empty = self.days.iter().all(|d| *d == 0);
        if days_empty && self.start.is_empty() && self.end.is_empty() {
            if self.cron_expr.is_empty() {
                self.days.clear();
                return Ok(());
            }
            let (days, start, end) = decode(&self.cron_expr)?;
            self.days = days.to_flags().to_vec();
            self.start = start;
            self.end = end;
            return Ok(());
        }

        let days = DaySet::from_flags(&self.days)?;
        if self.start.is_empty() != self.end.is_empty() {
            return Err(Error::validation(
                "Time",
                "Start and End must both be set or both be empty",
            ));
        }
        if self.start.is_empty() {
            // Days without hours: the whole day
            self.start = "00:00".to_string();
            self.end = "23:59".to_string();
        }
        self.cron_expr = encode(days, &self.start, &self.end)?;
        Ok(())
    }

    /// Parses the window into its evaluable form.
    pub fn schedule(&self) -> Result<Schedule> {
        let days = DaySet::from_flags(&self.days)?;
        if days.is_empty() && self.start.is_empty() && self.end.is_empty() {
            if self.cron_expr.is_empty() {
                return Ok(Schedule::Always);
            }
            let (days, start, end) = decode(&self.cron_expr)?;
            return Ok(Schedule::Window {
                days,
                start: parse_clock(&start)?,
                end: parse_clock(&end)?,
            });
        }
        let (start, end) = if self.start.is_empty() {
            (NaiveTime::MIN, end_of_day())
        } else {
            (parse_clock(&self.start)?, parse_clock(&self.end)?)
        };
        Ok(Schedule::Window { days, start, end })
    }
}

/// A set of weekdays, Sunday = bit 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DaySet(u8);

impl DaySet {
    pub const EMPTY: Self = Self(0);
    pub const WEEKDAYS: Self = Self(0b011_1110);
    pub const WEEKEND: Self = Self(0b100_0001);
    pub const EVERY_DAY: Self = Self(0b111_1111);

    /// Builds a set from the wire flag array (empty or exactly 7 slots of 0/1).
    pub fn from_flags(flags: &[u8]) -> Result<Self> {
        if flags.is_empty() {
            return Ok(Self::EMPTY);
        }
        if flags.len() != 7 {
            return Err(Error::validation(
                "Time.Days",
                format!("expected 7 entries, got {}", flags.len()),
            ));
        }
        let mut bits = 0u8;
        for (i, flag) in flags.iter().enumerate() {
            match flag {
                0 => {}
                1 => bits |= 1 << i,
                other => {
                    return Err(Error::validation(
                        "Time.Days",
                        format!("entries must be 0 or 1, got {other}"),
                    ));
                }
            }
        }
        Ok(Self(bits))
    }

    pub fn to_flags(self) -> [u8; 7] {
        let mut flags = [0u8; 7];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = (self.0 >> i) & 1;
        }
        flags
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_sunday();
    }

    /// Days in Sunday-first order.
    pub fn iter(self) -> impl Iterator<Item = Weekday> {
        WEEKDAYS_SUN_FIRST
            .into_iter()
            .filter(move |d| self.contains(*d))
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::WEEKDAYS => write!(f, "weekdays"),
            Self::WEEKEND => write!(f, "weekend"),
            Self::EVERY_DAY => write!(f, "every day"),
            days => {
                let names: Vec<&str> = days
                    .iter()
                    .map(|d| DAY_NAMES[d.num_days_from_sunday() as usize])
                    .collect();
                write!(f, "{}", names.join(","))
            }
        }
    }
}

impl FromStr for DaySet {
    type Err = Error;

    /// Accepts `weekdays`, `weekend`, `every day` or a comma list of
    /// three-letter day names in any order.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "weekdays" {
            return Ok(Self::WEEKDAYS);
        }
        if s.starts_with("weekend") {
            return Ok(Self::WEEKEND);
        }
        if s == "every day" {
            return Ok(Self::EVERY_DAY);
        }

        let mut set = Self::EMPTY;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let idx = DAY_NAMES
                .iter()
                .position(|d| *d == name)
                .ok_or_else(|| Error::validation("Time.Days", format!("unknown day '{name}'")))?;
            set.insert(WEEKDAYS_SUN_FIRST[idx]);
        }
        Ok(set)
    }
}

/// Evaluable form of a [`TimeWindow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Always,
    Window {
        /// Empty means every day
        days: DaySet,
        start: NaiveTime,
        end: NaiveTime,
    },
}

impl Schedule {
    /// Whether the window is open at `now` (local wall-clock time).
    ///
    /// `end <= start` is an overnight window: it opens on a listed day and
    /// closes the following morning.
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        match *self {
            Schedule::Always => true,
            Schedule::Window { days, start, end } => {
                let day_listed = |d: Weekday| days.is_empty() || days.contains(d);
                let t = now.time();
                let today = now.weekday();
                if start < end {
                    day_listed(today) && t >= start && t < end_exclusive(end)
                } else {
                    (day_listed(today) && t >= start)
                        || (day_listed(today.pred()) && t < end_exclusive(end))
                }
            }
        }
    }
}

// "23:59" as an end means through the end of that minute
fn end_exclusive(end: NaiveTime) -> NaiveTime {
    if end == end_of_day() {
        NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(end)
    } else {
        end
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

fn parse_clock(s: &str) -> Result<NaiveTime> {
    crate::validators::validate_clock(s).map_err(|e| Error::validation("Time", e))?;
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| Error::validation("Time", format!("invalid time '{s}': {e}")))
}

fn split_clock(s: &str) -> Result<(&str, &str)> {
    crate::validators::validate_clock(s).map_err(|e| Error::validation("Time", e))?;
    Ok((&s[..2], &s[3..]))
}

/// Encodes a window as `minute hour * * dow`.
///
/// The minute field is `0` when both times are on the hour, the literal
/// `from-to` minute range when both times share an hour, and `*` otherwise.
pub fn encode(days: DaySet, start: &str, end: &str) -> Result<String> {
    let (from_h, from_m) = split_clock(start)?;
    let (to_h, to_m) = split_clock(end)?;

    let minute = if from_m == "00" && to_m == "00" {
        "0".to_string()
    } else if from_h == to_h {
        format!("{from_m}-{to_m}")
    } else {
        "*".to_string()
    };

    let dow = if days.is_empty() {
        "*".to_string()
    } else {
        days.iter()
            .map(|d| d.num_days_from_sunday().to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    Ok(format!("{minute} {from_h}-{to_h} * * {dow}"))
}

/// Decodes a window cron expression back into `(days, start, end)`.
///
/// Only day SET membership survives the round trip, not the original order.
pub fn decode(expr: &str) -> Result<(DaySet, String, String)> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = fields.as_slice() else {
        return Err(Error::validation(
            "Time.CronExpr",
            format!("expected 5 fields, got {}", fields.len()),
        ));
    };

    if *dom != "*" || *month != "*" {
        return Err(Error::validation(
            "Time.CronExpr",
            "day-of-month and month must be '*' for rule windows",
        ));
    }

    let (from_h, to_h) = parse_range(hour, 23, "hour")?;
    let (from_m, to_m) = match *minute {
        "*" => (0, 59),
        m => parse_range(m, 59, "minute")?,
    };

    let days = if *dow == "*" {
        DaySet::EMPTY
    } else {
        let mut set = DaySet::EMPTY;
        for part in dow.split(',') {
            let (a, b) = parse_range(part, 7, "day-of-week")?;
            for n in a..=b {
                set.insert(WEEKDAYS_SUN_FIRST[(n % 7) as usize]);
            }
        }
        set
    };

    Ok((
        days,
        format!("{from_h:02}:{from_m:02}"),
        format!("{to_h:02}:{to_m:02}"),
    ))
}

fn parse_range(field: &str, max: u32, name: &str) -> Result<(u32, u32)> {
    let parse = |s: &str| {
        s.parse::<u32>()
            .ok()
            .filter(|n| *n <= max)
            .ok_or_else(|| Error::validation("Time.CronExpr", format!("invalid {name} '{s}'")))
    };
    match field.split_once('-') {
        Some((a, b)) => Ok((parse(a)?, parse(b)?)),
        None => {
            let n = parse(field)?;
            Ok((n, n))
        }
    }
}

/// Checks a general 5-field cron expression (task schedules such as `*/5 * * * *`).
pub fn validate_cron(expr: &str) -> Result<()> {
    const BOUNDS: [(u32, u32, &str); 5] = [
        (0, 59, "minute"),
        (0, 23, "hour"),
        (1, 31, "day-of-month"),
        (1, 12, "month"),
        (0, 7, "day-of-week"),
    ];

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != BOUNDS.len() {
        return Err(Error::validation(
            "CronExpr",
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }

    for (field, (lo, hi, name)) in fields.iter().zip(BOUNDS) {
        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (item, None),
            };
            if let Some(step) = step
                && step.parse::<u32>().map_or(true, |s| s == 0)
            {
                return Err(Error::validation("CronExpr", format!("invalid {name} step '{step}'")));
            }
            if range == "*" {
                continue;
            }
            let bounds_ok = |s: &str| s.parse::<u32>().is_ok_and(|n| (lo..=hi).contains(&n));
            let ok = match range.split_once('-') {
                Some((a, b)) => bounds_ok(a) && bounds_ok(b),
                None => bounds_ok(range),
            };
            if !ok {
                return Err(Error::validation("CronExpr", format!("invalid {name} '{item}'")));
            }
        }
    }
    Ok(())
}
