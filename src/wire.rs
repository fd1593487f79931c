//! Binary tuple decoding for population rows.
//!
//! The row store returns each column in its binary send format: `int4`
//! values as 4 big-endian bytes and `timestamp` values as 8 big-endian
//! bytes counting microseconds since 2000-01-01 00:00:00. The timestamp
//! column holds wall-clock readings of the reference timeline, so the
//! decoder shifts them by a fixed UTC offset instead of consulting the
//! host time zone.
//!
//! Decoding is a length check plus a fixed-width copy per field; nothing
//! on this path allocates.

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

/// Seconds between the Unix epoch and the source epoch (2000-01-01).
pub const SOURCE_EPOCH_UNIX: i64 = 946_684_800;

/// UTC offset of the reference timeline (JST) in seconds.
pub const JST_OFFSET_SECS: i32 = 9 * 3600;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Errors that can occur while decoding one row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reading {field}: {len} bytes, need {need}")]
    Truncated {
        field: &'static str,
        len: usize,
        need: usize,
    },

    #[error("reading {field}: {len} bytes, expected exactly {need}")]
    Oversized {
        field: &'static str,
        len: usize,
        need: usize,
    },

    #[error("timestamp out of range: {micros}us since source epoch")]
    TimestampOutOfRange { micros: i64 },

    #[error("malformed datetime {0:?}, expected YYYY-MM-DD HH:MM:SS")]
    MalformedDatetime(String),
}

impl DecodeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::Oversized { .. } => "oversized",
            Self::TimestampOutOfRange { .. } => "timestamp_range",
            Self::MalformedDatetime(_) => "malformed_datetime",
        }
    }
}

/// One decoded source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRow {
    pub identifier: u32,
    pub instant: DateTime<Utc>,
    pub value: i32,
}

/// Decoder for the three fixed-width columns of a population row.
#[derive(Debug, Clone, Copy)]
pub struct WireDecoder {
    offset_secs: i64,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self {
            offset_secs: JST_OFFSET_SECS as i64,
        }
    }
}

impl WireDecoder {
    /// Decoder whose timestamps are wall-clock readings in `offset`.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset_secs: offset.local_minus_utc() as i64,
        }
    }

    /// Decode all three columns of one row.
    #[inline]
    pub fn decode_row(
        &self,
        identifier: &[u8],
        instant: &[u8],
        value: &[u8],
    ) -> Result<DecodedRow, DecodeError> {
        Ok(DecodedRow {
            identifier: self.decode_identifier(identifier)?,
            instant: self.decode_instant(instant)?,
            value: self.decode_value(value)?,
        })
    }

    /// Decode a 4-byte big-endian signed identifier.
    ///
    /// Identifiers are stored as `int4`; the bit pattern is reinterpreted
    /// as unsigned.
    #[inline(always)]
    pub fn decode_identifier(&self, bytes: &[u8]) -> Result<u32, DecodeError> {
        Ok(i32::from_be_bytes(read_exact::<4>(bytes, "identifier")?) as u32)
    }

    /// Decode an 8-byte big-endian microsecond timestamp.
    #[inline(always)]
    pub fn decode_instant(&self, bytes: &[u8]) -> Result<DateTime<Utc>, DecodeError> {
        let micros = i64::from_be_bytes(read_exact::<8>(bytes, "timestamp")?);
        let unix_secs = (micros / MICROS_PER_SEC)
            .checked_add(SOURCE_EPOCH_UNIX)
            .and_then(|s| s.checked_sub(self.offset_secs))
            .ok_or(DecodeError::TimestampOutOfRange { micros })?;
        DateTime::from_timestamp(unix_secs, 0).ok_or(DecodeError::TimestampOutOfRange { micros })
    }

    /// Decode a 4-byte big-endian signed measurement.
    #[inline(always)]
    pub fn decode_value(&self, bytes: &[u8]) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(read_exact::<4>(bytes, "value")?))
    }

    /// Inverse of [`WireDecoder::decode_instant`] at whole-second precision.
    ///
    /// Used by in-memory sources and tests to produce wire-identical rows.
    pub fn encode_instant(&self, instant: DateTime<Utc>) -> [u8; 8] {
        let secs = instant.timestamp() + self.offset_secs - SOURCE_EPOCH_UNIX;
        secs.saturating_mul(MICROS_PER_SEC).to_be_bytes()
    }
}

#[inline(always)]
fn read_exact<const N: usize>(bytes: &[u8], field: &'static str) -> Result<[u8; N], DecodeError> {
    if bytes.len() < N {
        return Err(DecodeError::Truncated {
            field,
            len: bytes.len(),
            need: N,
        });
    }
    if bytes.len() > N {
        return Err(DecodeError::Oversized {
            field,
            len: bytes.len(),
            need: N,
        });
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(JST_OFFSET_SECS).unwrap()
    }

    #[test]
    fn test_decode_identifier() {
        let d = WireDecoder::default();
        assert_eq!(
            d.decode_identifier(&533_946_113i32.to_be_bytes()).unwrap(),
            533_946_113
        );
    }

    #[test]
    fn test_decode_value_negative() {
        let d = WireDecoder::default();
        assert_eq!(d.decode_value(&(-5i32).to_be_bytes()).unwrap(), -5);
    }

    #[test]
    fn test_decode_source_epoch() {
        // 2000-01-01 00:00:00 on the JST wall clock is 1999-12-31 15:00 UTC.
        let d = WireDecoder::new(jst());
        let instant = d.decode_instant(&0i64.to_be_bytes()).unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(1999, 12, 31, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_decode_truncates_sub_second() {
        let d = WireDecoder::new(jst());
        let a = d.decode_instant(&1_999_999i64.to_be_bytes()).unwrap();
        let b = d.decode_instant(&1_000_000i64.to_be_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_row_round_trip() {
        let d = WireDecoder::new(jst());
        let wall = NaiveDate::from_ymd_opt(2016, 3, 1)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap();
        let instant = jst().from_local_datetime(&wall).unwrap().with_timezone(&Utc);

        let row = d
            .decode_row(
                &533_900_001i32.to_be_bytes(),
                &d.encode_instant(instant),
                &1234i32.to_be_bytes(),
            )
            .unwrap();

        assert_eq!(
            row,
            DecodedRow {
                identifier: 533_900_001,
                instant,
                value: 1234,
            }
        );
    }

    #[test]
    fn test_offset_is_not_taken_from_host() {
        let utc = WireDecoder::new(FixedOffset::east_opt(0).unwrap());
        let jst = WireDecoder::new(jst());
        let bytes = 3_600_000_000i64.to_be_bytes();
        let diff = utc.decode_instant(&bytes).unwrap() - jst.decode_instant(&bytes).unwrap();
        assert_eq!(diff.num_hours(), 9);
    }

    #[test]
    fn test_short_timestamp_is_error() {
        let d = WireDecoder::default();
        let err = d.decode_instant(&[0u8; 7]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                field: "timestamp",
                len: 7,
                need: 8
            }
        );
        assert_eq!(err.kind(), "truncated");
    }

    #[test]
    fn test_short_and_long_int_fields() {
        let d = WireDecoder::default();
        assert!(matches!(
            d.decode_identifier(&[0u8; 3]),
            Err(DecodeError::Truncated {
                field: "identifier",
                ..
            })
        ));
        assert!(matches!(
            d.decode_value(&[0u8; 8]),
            Err(DecodeError::Oversized { field: "value", .. })
        ));
        assert!(matches!(
            d.decode_row(&[0u8; 4], &[0u8; 8], &[]),
            Err(DecodeError::Truncated { field: "value", .. })
        ));
    }

    #[test]
    fn test_timestamp_out_of_range() {
        let d = WireDecoder::default();
        let err = d.decode_instant(&i64::MAX.to_be_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::TimestampOutOfRange { .. }));
    }
}
