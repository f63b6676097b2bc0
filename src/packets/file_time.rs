//! FileTime is a wrapper around a u64 that represents a file time:
//! 100-nanosecond intervals since January 1, 1601 (UTC).

use std::fmt::Display;
use std::ops::Deref;

use time::macros::datetime;
use time::OffsetDateTime;

use super::wire::{Reader, Writer};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FileTime {
    value: u64,
}

impl FileTime {
    const EPOCH: OffsetDateTime = datetime!(1601-01-01 00:00:00 UTC);
    const SCALE: u64 = 100;

    pub fn now() -> Self {
        OffsetDateTime::now_utc().into()
    }

    pub fn date_time(&self) -> OffsetDateTime {
        let duration = core::time::Duration::from_nanos(self.value * Self::SCALE);
        Self::EPOCH + duration
    }

    pub fn read(reader: &mut Reader) -> Self {
        FileTime {
            value: reader.read_u64(),
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u64(self.value);
    }
}

impl Display for FileTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.date_time().fmt(f)
    }
}

impl std::fmt::Debug for FileTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileTime").field(&self.date_time()).finish()
    }
}

impl From<u64> for FileTime {
    fn from(value: u64) -> Self {
        Self { value }
    }
}

impl From<OffsetDateTime> for FileTime {
    fn from(dt: OffsetDateTime) -> Self {
        let duration = dt - Self::EPOCH;
        Self {
            value: duration.whole_nanoseconds() as u64 / Self::SCALE,
        }
    }
}

impl Deref for FileTime {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    const TEST_VAL1_U64: u64 = 133818609802776324;
    const TEST_VAL1_DT: OffsetDateTime = datetime!(2025-01-20 15:36:20.277632400 UTC);

    #[test]
    pub fn test_file_time_from_u64_correct() {
        assert_eq!(FileTime::from(TEST_VAL1_U64).date_time(), TEST_VAL1_DT)
    }

    #[test]
    pub fn test_file_time_from_datetime_correct() {
        assert_eq!(*FileTime::from(TEST_VAL1_DT), TEST_VAL1_U64)
    }
}
