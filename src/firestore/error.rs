use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical status codes shared by the backend and the client.
///
/// The numeric values follow the gRPC status codes carried by the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Maps a numeric RPC status code onto the client taxonomy.
    ///
    /// Unrecognised values collapse to [`FirestoreErrorCode::Unknown`].
    pub fn from_rpc_code(code: i32) -> Option<Self> {
        let mapped = match code {
            0 => return None,
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        };
        Some(mapped)
    }

    pub fn rpc_code(&self) -> i32 {
        match self {
            FirestoreErrorCode::Cancelled => 1,
            FirestoreErrorCode::Unknown => 2,
            FirestoreErrorCode::InvalidArgument => 3,
            FirestoreErrorCode::DeadlineExceeded => 4,
            FirestoreErrorCode::NotFound => 5,
            FirestoreErrorCode::AlreadyExists => 6,
            FirestoreErrorCode::PermissionDenied => 7,
            FirestoreErrorCode::ResourceExhausted => 8,
            FirestoreErrorCode::FailedPrecondition => 9,
            FirestoreErrorCode::Aborted => 10,
            FirestoreErrorCode::OutOfRange => 11,
            FirestoreErrorCode::Unimplemented => 12,
            FirestoreErrorCode::Internal => 13,
            FirestoreErrorCode::Unavailable => 14,
            FirestoreErrorCode::DataLoss => 15,
            FirestoreErrorCode::Unauthenticated => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

/// Whether an RPC failing with `code` should be given up on instead of retried.
///
/// Transient transport conditions (and authentication, which is retried after a
/// credential refresh) are not permanent.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Write-stream variant of [`is_permanent_error`]: an aborted commit is replayed.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

/// Returns an internal error when `condition` does not hold.
///
/// Used for invariant violations that indicate a logic defect rather than an
/// environmental condition; the failing operation is terminated with a diagnostic.
pub fn hard_assert(condition: bool, message: impl FnOnce() -> String) -> FirestoreResult<()> {
    if condition {
        Ok(())
    } else {
        let message = message();
        log::error!("INTERNAL ASSERTION FAILED: {message}");
        Err(internal_error(format!("INTERNAL ASSERTION FAILED: {message}")))
    }
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_round_trip() {
        for code in 1..=16 {
            let mapped = FirestoreErrorCode::from_rpc_code(code).unwrap();
            assert_eq!(mapped.rpc_code(), code);
        }
        assert_eq!(FirestoreErrorCode::from_rpc_code(0), None);
        assert_eq!(
            FirestoreErrorCode::from_rpc_code(99),
            Some(FirestoreErrorCode::Unknown)
        );
    }

    #[test]
    fn aborted_is_permanent_but_not_for_writes() {
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::PermissionDenied));
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
    }

    #[test]
    fn hard_assert_reports_internal() {
        assert!(hard_assert(true, || "unused".into()).is_ok());
        let err = hard_assert(false, || "batch id must be positive".into()).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        assert!(err.message().contains("batch id must be positive"));
    }

    #[test]
    fn display_includes_code() {
        let err = aborted("Document version changed between two reads.");
        assert_eq!(
            err.to_string(),
            "Document version changed between two reads. (firestore/aborted)"
        );
    }
}
