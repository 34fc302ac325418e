use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// An index row as stored: the value is still JSON-encoded.
#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) created_at: i64,
}

/// A decoded row with its timestamp converted, but its value still raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) created_at: UtcDateTime,
}
impl TryFrom<EntryRow> for RawEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self { key: row.key, value: row.value, created_at: from_nanos(row.created_at)? })
    }
}

pub(crate) fn to_nanos(timestamp: UtcDateTime) -> Result<i64, Error> {
    i64::try_from(timestamp.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_nanos(nanos: i64) -> Result<UtcDateTime, Error> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_entry_keeps_nanoseconds() {
        let now = UtcDateTime::now();
        let row = EntryRow {
            key: "https://example.com/manga/issue-1".to_string(),
            value: "[]".to_string(),
            created_at: to_nanos(now).unwrap(),
        };
        let entry = RawEntry::try_from(row).unwrap();
        assert_eq!(entry.created_at, now);
        assert_eq!(entry.value, "[]");
    }
}
