//! Hourly time buckets relative to a fixed reference instant.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::wire::DecodeError;

/// Default reference instant on the JST wall clock.
pub const DEFAULT_REFERENCE: &str = "2016-01-01 00:00:00";

/// Default number of hourly buckets (`T`).
pub const DEFAULT_BUCKETS: usize = 74_160;

/// Bucket value for instants before the reference.
pub const OUT_OF_RANGE: i64 = -1;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SECS_PER_HOUR: i64 = 3_600;

/// Hourly bucketing against a fixed reference instant.
///
/// The reference is parsed once at construction. All arithmetic is on
/// whole seconds, so bucketing never allocates.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    reference: DateTime<Utc>,
    offset: FixedOffset,
    buckets: usize,
}

impl Timeline {
    /// Create a timeline whose bucket 0 starts at `reference`
    /// (`YYYY-MM-DD HH:MM:SS` on the `offset` wall clock).
    pub fn new(reference: &str, offset: FixedOffset, buckets: usize) -> Result<Self, DecodeError> {
        let reference = parse_wall_clock(reference, offset)?;
        Ok(Self {
            reference,
            offset,
            buckets,
        })
    }

    /// The JST timeline starting 2016-01-01 with 74,160 buckets.
    pub fn jst_default() -> Result<Self, DecodeError> {
        let offset = FixedOffset::east_opt(crate::wire::JST_OFFSET_SECS)
            .ok_or_else(|| DecodeError::MalformedDatetime("+09:00".into()))?;
        Self::new(DEFAULT_REFERENCE, offset, DEFAULT_BUCKETS)
    }

    /// The reference instant (start of bucket 0).
    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Number of buckets (`T`).
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Whole hours from the reference to `instant`, or [`OUT_OF_RANGE`]
    /// when `instant` precedes the reference.
    #[inline]
    pub fn bucket(&self, instant: DateTime<Utc>) -> i64 {
        let delta = instant.timestamp() - self.reference.timestamp();
        if delta < 0 {
            return OUT_OF_RANGE;
        }
        delta / SECS_PER_HOUR
    }

    /// Row of `instant` in a `[T, N]` array, or `None` outside `[0, T)`.
    #[inline]
    pub fn row(&self, instant: DateTime<Utc>) -> Option<usize> {
        let bucket = self.bucket(instant);
        if bucket < 0 || bucket as u64 >= self.buckets as u64 {
            None
        } else {
            Some(bucket as usize)
        }
    }

    /// Bucket of a `YYYY-MM-DD HH:MM:SS` wall-clock string.
    pub fn bucket_from_string(&self, text: &str) -> Result<i64, DecodeError> {
        Ok(self.bucket(parse_wall_clock(text, self.offset)?))
    }

    /// Start instant of `bucket`.
    pub fn bucket_start(&self, bucket: usize) -> Option<DateTime<Utc>> {
        let hours = i64::try_from(bucket).ok()?;
        self.reference
            .checked_add_signed(Duration::try_hours(hours)?)
    }

    /// Start of `bucket` formatted as a `YYYY-MM-DD HH:MM:SS` wall-clock string.
    pub fn bucket_label(&self, bucket: usize) -> Option<String> {
        self.bucket_start(bucket).map(|t| {
            t.with_timezone(&self.offset)
                .format(DATETIME_FORMAT)
                .to_string()
        })
    }
}

fn parse_wall_clock(text: &str, offset: FixedOffset) -> Result<DateTime<Utc>, DecodeError> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
        .map_err(|_| DecodeError::MalformedDatetime(text.to_string()))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| DecodeError::MalformedDatetime(text.to_string()))
}
