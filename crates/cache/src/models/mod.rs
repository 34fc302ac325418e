mod entry;

pub(crate) use self::entry::{EntryRow, RawEntry, from_nanos, to_nanos};
