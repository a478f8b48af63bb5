//! Conversion between local wall-clock strings and UTC instants for a named zone.
//!
//! Wall-clock strings are what a `datetime-local` input produces: `YYYY-MM-DDTHH:MM`,
//! optionally with seconds, with a space instead of `T`, or with the time left out
//! entirely (midnight).

use crate::domain::elapsed::NowProvider;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_ZONE: &str = "UTC";
pub const WALL_CLOCK_FORMAT: &str = "%Y-%m-%dT%H:%M";

const ACCEPTED_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

/// A zone identifier known to the zone database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneId(Tz);

impl ZoneId {
    pub fn parse(raw: &str) -> Result<Self, InfraError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InfraError::InvalidZone("zone id must not be empty".to_string()));
        }
        trimmed
            .parse::<Tz>()
            .map(Self)
            .map_err(|_| InfraError::InvalidZone(format!("'{trimmed}'")))
    }

    pub fn utc() -> Self {
        Self(Tz::UTC)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn tz(&self) -> Tz {
        self.0
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for ZoneId {
    type Err = InfraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the user's zone at detection time, falling back to [`DEFAULT_ZONE`].
///
/// This is the only place an unknown zone is replaced; conversions never substitute.
pub fn detect_zone(candidate: Option<&str>) -> ZoneId {
    let Some(candidate) = candidate.map(str::trim).filter(|value| !value.is_empty()) else {
        return ZoneId::utc();
    };
    match ZoneId::parse(candidate) {
        Ok(zone) => zone,
        Err(error) => {
            tracing::warn!(candidate, %error, "unrecognized zone, falling back to {DEFAULT_ZONE}");
            ZoneId::utc()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetStrategy {
    /// Offset in effect at the converted instant, from the zone database.
    #[default]
    Exact,
    /// Offset in effect right now, applied to every instant. Wrong across a DST boundary.
    CurrentOffset,
}

pub fn parse_wall_clock(value: &str) -> Result<NaiveDateTime, InfraError> {
    let trimmed = value.trim();
    for format in ACCEPTED_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    let date_part = trimmed.trim_end_matches(['T', ' ']);
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    Err(InfraError::InvalidInput(format!(
        "wall-clock value must be YYYY-MM-DDTHH:MM: '{trimmed}'"
    )))
}

pub fn format_wall_clock(value: NaiveDateTime) -> String {
    value.format(WALL_CLOCK_FORMAT).to_string()
}

pub struct TimeZoneConverter {
    zone: ZoneId,
    strategy: OffsetStrategy,
    now_provider: NowProvider,
}

impl TimeZoneConverter {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            strategy: OffsetStrategy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_strategy(mut self, strategy: OffsetStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    /// Offset from UTC right now, found by reading the same instant as a naive
    /// wall clock in UTC and in the zone and subtracting.
    pub fn current_offset(&self) -> Duration {
        let now = (self.now_provider)();
        let zoned = now.with_timezone(&self.zone.tz()).naive_local();
        zoned - now.naive_utc()
    }

    pub fn to_utc(&self, local_wall_clock: &str) -> Result<DateTime<Utc>, InfraError> {
        let naive = parse_wall_clock(local_wall_clock)?;
        Ok(self.naive_to_utc(naive))
    }

    pub fn from_utc(&self, instant: DateTime<Utc>) -> String {
        format_wall_clock(self.utc_to_naive(instant))
    }

    pub fn naive_to_utc(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.strategy {
            OffsetStrategy::CurrentOffset => Utc.from_utc_datetime(&(naive - self.current_offset())),
            OffsetStrategy::Exact => exact_local_to_utc(self.zone.tz(), naive),
        }
    }

    pub fn utc_to_naive(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self.strategy {
            OffsetStrategy::CurrentOffset => instant.naive_utc() + self.current_offset(),
            OffsetStrategy::Exact => instant.with_timezone(&self.zone.tz()).naive_local(),
        }
    }

    pub fn local_date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.utc_to_naive(instant).date()
    }

    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        self.naive_to_utc(date.and_time(NaiveTime::MIN))
    }

    /// Exclusive end: the start of the following local day.
    pub fn end_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        match date.succ_opt() {
            Some(next) => self.start_of_day(next),
            None => self.start_of_day(date) + Duration::days(1),
        }
    }

    pub fn day_bounds(&self, local_date: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), InfraError> {
        let date = parse_wall_clock(local_date)?.date();
        Ok((self.start_of_day(date), self.end_of_day(date)))
    }
}

pub fn to_utc(local_wall_clock: &str, zone: ZoneId) -> Result<DateTime<Utc>, InfraError> {
    TimeZoneConverter::new(zone).to_utc(local_wall_clock)
}

pub fn from_utc(instant: DateTime<Utc>, zone: ZoneId) -> String {
    TimeZoneConverter::new(zone).from_utc(instant)
}

fn exact_local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(resolved) = tz.from_local_datetime(&naive).earliest() {
        return resolved.with_timezone(&Utc);
    }
    // Skipped by a forward transition: use the offset from the day before the gap so
    // the result lands just after it, the way browsers resolve such inputs.
    let offset = tz
        .from_local_datetime(&(naive - Duration::days(1)))
        .earliest()
        .map(|before_gap| before_gap.offset().fix().local_minus_utc())
        .unwrap_or(0);
    Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(offset))))
}
