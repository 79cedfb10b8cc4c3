use crate::firestore::core::target::Target;
use crate::firestore::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch with no usable Bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a Bloom filter false positive.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

impl TargetPurpose {
    /// Value of the `goog-listen-tags` label sent with the target, if any.
    pub fn listen_label(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// Cached state of a target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    /// Listen sequence number of the last use, consulted by LRU collection.
    pub sequence_number: i64,
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot at which the target's view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Documents the backend should report, sent so it can return a Bloom filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: TargetPurpose, sequence_number: i64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: i64) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Records a newer resume point; the expected count no longer applies.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
