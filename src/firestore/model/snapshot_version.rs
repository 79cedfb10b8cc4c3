use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Server commit time of a document or of a consistent watch snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// The version of documents that were never written.
    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_precedes_everything() {
        assert!(SnapshotVersion::min() < SnapshotVersion::from_micros(1));
        assert!(SnapshotVersion::from_micros(1) < SnapshotVersion::max());
        assert!(SnapshotVersion::default().is_min());
    }
}
