//! Conversion of raw coordination-store offsets into comparable [`Cursor`]s.

use crate::error::{Error, Result};
use crate::model::{Cursor, EventTypePartition};

/// Raw offset value of a partition with no commits yet. Converts to the
/// cursor that precedes every real offset.
pub const BEGIN_OFFSET: &str = "BEGIN";

/// Width the decimal offset is padded to so that per-partition ordering is a
/// plain string comparison.
const OFFSET_WIDTH: usize = 18;

/// Converts an opaque offset string read from the coordination store into a
/// [`Cursor`]. Pure; may fail with [`Error::CursorParse`].
pub trait CursorConverter: Send + Sync {
    fn convert(&self, key: &EventTypePartition, raw: &str) -> Result<Cursor>;
}

/// Default converter: offsets are decimal strings, normalized by zero-padding
/// to a fixed width. `BEGIN` converts to the empty offset, which sorts before
/// any padded number.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaddedOffsetConverter;

impl CursorConverter for PaddedOffsetConverter {
    fn convert(&self, key: &EventTypePartition, raw: &str) -> Result<Cursor> {
        if raw == BEGIN_OFFSET {
            return Ok(Cursor::new(key.event_type.clone(), key.partition.clone(), ""));
        }
        let value: u64 = raw.trim().parse().map_err(|_| {
            Error::CursorParse(format!("invalid offset {raw:?} for partition {key}"))
        })?;
        Ok(Cursor::new(
            key.event_type.clone(),
            key.partition.clone(),
            format!("{value:0width$}", width = OFFSET_WIDTH),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_pads_offset() {
        let key = EventTypePartition::new("orders", "0");
        let cursor = PaddedOffsetConverter.convert(&key, "42").unwrap();
        assert_eq!(cursor.offset, "000000000000000042");
        assert_eq!(cursor.key(), key);
    }

    #[test]
    fn test_begin_sorts_before_everything() {
        let key = EventTypePartition::new("orders", "0");
        let begin = PaddedOffsetConverter.convert(&key, BEGIN_OFFSET).unwrap();
        let zero = PaddedOffsetConverter.convert(&key, "0").unwrap();
        assert!(begin < zero);
    }

    #[test]
    fn test_non_numeric_offset_is_parse_error() {
        let key = EventTypePartition::new("orders", "0");
        let err = PaddedOffsetConverter.convert(&key, "not-a-number").unwrap_err();
        assert!(matches!(err, Error::CursorParse(_)));
    }

    #[test]
    fn test_padded_comparison_is_numeric() {
        let key = EventTypePartition::new("orders", "0");
        let nine = PaddedOffsetConverter.convert(&key, "9").unwrap();
        let ten = PaddedOffsetConverter.convert(&key, "10").unwrap();
        assert!(nine < ten);
    }
}
