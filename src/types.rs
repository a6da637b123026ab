//! Shared value types: timestamps, actors and entity kinds
use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::error::{self, LedgerError};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// The instant `delta` after this one, if it can still be stored.
    ///
    /// Rows carry nanoseconds since the epoch as an `i64`, so anything past
    /// 2262 is as unusable as an outright overflow.
    pub fn after(&self, delta: TimeDelta) -> Option<Self> {
        self.0
            .checked_add_signed(delta)
            .filter(|at| at.timestamp_nanos_opt().is_some())
            .map(TimeStamp)
    }
    /// Time elapsed from `earlier` to this instant. Negative if `earlier` is later.
    pub fn since(&self, earlier: &TimeStamp<Utc>) -> TimeDelta {
        self.0.signed_duration_since(earlier.0)
    }
    /// True once `now` has reached this instant.
    pub fn has_passed(&self, now: &TimeStamp<Utc>) -> bool {
        self.0 <= now.0
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Deadline `window` after `now`. The window must be positive and the
/// deadline storable.
pub(crate) fn expiry(now: &TimeStamp<Utc>, window: TimeDelta) -> error::Result<TimeStamp<Utc>> {
    if window <= TimeDelta::zero() {
        return Err(LedgerError::InvalidWindow { window });
    }
    now.after(window)
        .ok_or(LedgerError::InvalidWindow { window })
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// The role an authenticated caller acts under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Courier,
    Site,
}

/// An already-authenticated caller. Identity resolution happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
    pub fn producer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Producer)
    }
    pub fn courier(id: impl Into<String>) -> Self {
        Self::new(id, Role::Courier)
    }
    pub fn site(id: impl Into<String>) -> Self {
        Self::new(id, Role::Site)
    }
    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Batch,
    Delivery,
    Request,
    Item,
    Reservation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Batch => "batch",
            EntityKind::Delivery => "delivery",
            EntityKind::Request => "request",
            EntityKind::Item => "item",
            EntityKind::Reservation => "reservation",
        };
        f.write_str(name)
    }
}
