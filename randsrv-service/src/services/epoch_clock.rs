//! Epoch schedule arithmetic.
//!
//! This module provides [`EpochSchedule`], a pure mapping from wall-clock time
//! to epochs. A schedule is defined by a base time, an [`EpochDuration`] and
//! the range of epoch ordinals a single key covers. The same schedule is used
//! by the epoch driver (to know when to puncture) and by request handlers (to
//! report the next rotation).
//!
//! Durations are either calendar durations (`1w`, `1mon`, `1y2mon3d`, backed by
//! [`CalendarDuration`]) or fixed durations `humantime` understands (`1ms`,
//! `250ms`). Boundaries of schedules with months or years are found by
//! repeatedly adding the duration to the base time, so a monthly schedule
//! based on the 31st lands on the 29th of February and stays on the 29th.
//! Everything else has a constant length and is computed directly.

use std::{fmt, str::FromStr, time::Duration};

use calendar_duration::CalendarDuration;
use time::OffsetDateTime;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Calendar units in the order they are written.
const UNITS: [(&str, i128); 7] = [
    ("y", 0),
    ("mon", 0),
    ("w", 7 * 86_400),
    ("d", 86_400),
    ("h", 3_600),
    ("m", 60),
    ("s", 1),
];

/// Errors of the epoch clock.
///
/// All variants describe an invalid schedule or an invalid use of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EpochClockError {
    /// The reference time lies before the base time of the schedule.
    #[error("invalid schedule: reference time {reference} precedes base time {base}")]
    ReferenceBeforeBase {
        /// The requested reference time.
        reference: OffsetDateTime,
        /// The base time of the schedule.
        base: OffsetDateTime,
    },
    /// The epoch duration is zero.
    #[error("invalid schedule: epoch duration must be positive")]
    NonPositiveDuration,
    /// The epoch range is empty.
    #[error("invalid schedule: first epoch {first} is after last epoch {last}")]
    EmptyEpochRange {
        /// First epoch of the range.
        first: u8,
        /// Last epoch of the range.
        last: u8,
    },
    /// A boundary cannot be represented.
    #[error("invalid schedule: epoch boundary is out of range")]
    OutOfRange,
    /// The duration string cannot be parsed.
    #[error("invalid epoch duration \"{0}\"")]
    InvalidDuration(String),
}

/// A calendar duration such as `1mon` or `2w3d`.
///
/// Keeps the unit counts next to the [`CalendarDuration`] so schedules can
/// be compared and printed.
#[derive(Clone, Copy)]
pub struct CalendarSpan {
    counts: [u32; UNITS.len()],
    duration: CalendarDuration,
}

/// The length of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochDuration {
    /// A fixed number of (fractional) seconds.
    Fixed(Duration),
    /// A calendar duration.
    Calendar(CalendarSpan),
}

/// Position of a reference time within an [`EpochSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPosition {
    /// Number of epoch boundaries crossed since the base time.
    pub elapsed: u64,
    /// The epoch ordinal derived from `elapsed`.
    pub epoch: u8,
    /// The first boundary after the reference time.
    pub next_boundary: OffsetDateTime,
}

/// An immutable epoch schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSchedule {
    base_time: OffsetDateTime,
    duration: EpochDuration,
    first_epoch: u8,
    last_epoch: u8,
}

impl CalendarSpan {
    /// Parses `<count><unit>` groups with the units `y`, `mon`, `w`, `d`,
    /// `h`, `m` and `s`. Returns `None` for anything else.
    fn parse_counts(s: &str) -> Option<[u32; UNITS.len()]> {
        let mut counts = [0u32; UNITS.len()];
        let mut rest = s;
        if rest.is_empty() {
            return None;
        }
        while !rest.is_empty() {
            let split = rest.find(|c: char| !c.is_ascii_digit())?;
            if split == 0 {
                return None;
            }
            let (digits, tail) = rest.split_at(split);
            let unit_len = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);
            let idx = UNITS.iter().position(|(name, _)| *name == unit)?;
            counts[idx] = counts[idx].checked_add(digits.parse().ok()?)?;
            rest = tail;
        }
        Some(counts)
    }

    /// `counts` must not be all zero.
    fn from_counts(counts: [u32; UNITS.len()]) -> Self {
        Self {
            counts,
            duration: CalendarDuration::from(Self::format(&counts).as_str()),
        }
    }

    fn format(counts: &[u32; UNITS.len()]) -> String {
        counts
            .iter()
            .zip(UNITS)
            .filter(|(count, _)| **count > 0)
            .map(|(count, (unit, _))| format!("{count}{unit}"))
            .collect()
    }

    fn is_zero(&self) -> bool {
        self.counts.iter().all(|count| *count == 0)
    }

    fn has_months(&self) -> bool {
        self.counts[0] > 0 || self.counts[1] > 0
    }

    /// Constant length in seconds, if there are no months or years.
    fn fixed_seconds(&self) -> Option<i128> {
        if self.has_months() {
            return None;
        }
        Some(
            self.counts
                .iter()
                .zip(UNITS)
                .map(|(count, (_, seconds))| i128::from(*count) * seconds)
                .sum(),
        )
    }
}

impl PartialEq for CalendarSpan {
    fn eq(&self, other: &Self) -> bool {
        self.counts == other.counts
    }
}

impl Eq for CalendarSpan {}

impl fmt::Debug for CalendarSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CalendarSpan")
            .field(&Self::format(&self.counts))
            .finish()
    }
}

impl fmt::Display for CalendarSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Self::format(&self.counts))
    }
}

impl EpochDuration {
    /// Length in nanoseconds if the duration is constant.
    fn fixed_nanos(&self) -> Option<i128> {
        match self {
            EpochDuration::Fixed(duration) => i128::try_from(duration.as_nanos()).ok(),
            EpochDuration::Calendar(span) => span
                .fixed_seconds()
                .map(|seconds| seconds * NANOS_PER_SECOND),
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            EpochDuration::Fixed(duration) => duration.is_zero(),
            EpochDuration::Calendar(span) => span.is_zero(),
        }
    }
}

impl FromStr for EpochDuration {
    type Err = EpochClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match CalendarSpan::parse_counts(s) {
            Some(counts) if counts.iter().all(|count| *count == 0) => {
                Err(EpochClockError::NonPositiveDuration)
            }
            Some(counts) => Ok(EpochDuration::Calendar(CalendarSpan::from_counts(counts))),
            None => {
                let duration = humantime::parse_duration(s)
                    .map_err(|err| EpochClockError::InvalidDuration(format!("{s}: {err}")))?;
                if duration.is_zero() {
                    return Err(EpochClockError::NonPositiveDuration);
                }
                Ok(EpochDuration::Fixed(duration))
            }
        }
    }
}

impl fmt::Display for EpochDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochDuration::Fixed(duration) => {
                write!(f, "{}", humantime::format_duration(*duration))
            }
            EpochDuration::Calendar(span) => fmt::Display::fmt(span, f),
        }
    }
}

impl EpochSchedule {
    /// Creates a schedule starting at `base_time`.
    ///
    /// Fails if the duration is zero or if `first_epoch > last_epoch`.
    pub fn new(
        base_time: OffsetDateTime,
        duration: EpochDuration,
        first_epoch: u8,
        last_epoch: u8,
    ) -> Result<Self, EpochClockError> {
        if duration.is_zero() {
            return Err(EpochClockError::NonPositiveDuration);
        }
        if first_epoch > last_epoch {
            return Err(EpochClockError::EmptyEpochRange {
                first: first_epoch,
                last: last_epoch,
            });
        }
        Ok(Self {
            base_time,
            duration,
            first_epoch,
            last_epoch,
        })
    }

    /// The base time of the schedule.
    pub fn base_time(&self) -> OffsetDateTime {
        self.base_time
    }

    /// The epoch duration.
    pub fn duration(&self) -> EpochDuration {
        self.duration
    }

    /// The first epoch of a key.
    pub fn first_epoch(&self) -> u8 {
        self.first_epoch
    }

    /// The last epoch of a key. Puncturing it exhausts the key.
    pub fn last_epoch(&self) -> u8 {
        self.last_epoch
    }

    /// Number of epochs a single key covers.
    pub fn epochs_per_key(&self) -> u64 {
        u64::from(self.last_epoch - self.first_epoch) + 1
    }

    /// The epoch ordinal after `elapsed` boundaries.
    pub fn epoch_at_elapsed(&self, elapsed: u64) -> u8 {
        // the remainder is smaller than `epochs_per_key` which fits into a u8 offset
        self.first_epoch + (elapsed % self.epochs_per_key()) as u8
    }

    /// Returns the epoch ordinal at `reference` and the next boundary.
    pub fn epoch_for(
        &self,
        reference: OffsetDateTime,
    ) -> Result<(u8, OffsetDateTime), EpochClockError> {
        let position = self.position_at(reference)?;
        Ok((position.epoch, position.next_boundary))
    }

    /// Returns the full [`EpochPosition`] of `reference`.
    pub fn position_at(&self, reference: OffsetDateTime) -> Result<EpochPosition, EpochClockError> {
        if reference < self.base_time {
            return Err(EpochClockError::ReferenceBeforeBase {
                reference,
                base: self.base_time,
            });
        }
        let (elapsed, next_boundary) = match (self.duration, self.duration.fixed_nanos()) {
            (_, Some(duration_nanos)) => {
                let diff = (reference - self.base_time).whole_nanoseconds();
                let elapsed = u64::try_from(diff / duration_nanos)
                    .map_err(|_| EpochClockError::OutOfRange)?;
                let next_boundary = self.boundary(
                    elapsed
                        .checked_add(1)
                        .ok_or(EpochClockError::OutOfRange)?,
                )?;
                (elapsed, next_boundary)
            }
            (EpochDuration::Calendar(span), None) => {
                let mut elapsed = 0u64;
                let mut next_boundary = self.base_time + span.duration;
                while next_boundary <= reference {
                    next_boundary = next_boundary + span.duration;
                    elapsed += 1;
                }
                (elapsed, next_boundary)
            }
            (EpochDuration::Fixed(_), None) => return Err(EpochClockError::OutOfRange),
        };
        Ok(EpochPosition {
            elapsed,
            epoch: self.epoch_at_elapsed(elapsed),
            next_boundary,
        })
    }

    /// The `n`-th boundary of the schedule. Boundary `0` is the base time.
    pub fn boundary(&self, n: u64) -> Result<OffsetDateTime, EpochClockError> {
        match (self.duration, self.duration.fixed_nanos()) {
            (_, Some(duration_nanos)) => {
                let total = duration_nanos
                    .checked_mul(i128::from(n))
                    .ok_or(EpochClockError::OutOfRange)?;
                let seconds = i64::try_from(total / NANOS_PER_SECOND)
                    .map_err(|_| EpochClockError::OutOfRange)?;
                let nanos = (total % NANOS_PER_SECOND) as i32;
                self.base_time
                    .checked_add(time::Duration::new(seconds, nanos))
                    .ok_or(EpochClockError::OutOfRange)
            }
            (EpochDuration::Calendar(span), None) => {
                Ok((0..n).fold(self.base_time, |boundary, _| boundary + span.duration))
            }
            (EpochDuration::Fixed(_), None) => Err(EpochClockError::OutOfRange),
        }
    }
}
