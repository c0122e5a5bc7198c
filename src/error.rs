/// Error Types for the Delta-Update Engine
///
/// Every failure the engine can hit maps onto one of these kinds. The
/// coordinator uses `is_transient()` to decide whether a retry with backoff
/// is allowed and `exit_code()` to translate a run result into the process
/// exit status (0 = success / nothing to do, 1 = fatal, 2 = invariant
/// violation found by `validate`).

use std::fmt;

#[derive(Debug)]
pub enum UpdateError {
    /// A block expected in the raw keyspace is missing. Heights must be
    /// contiguous from genesis, so this always needs operator intervention.
    GapInRaw { height: i64 },

    /// No exchange rate exists at or before a block's date. Fatal unless
    /// forward-fill is enabled.
    RateMissing { date: String },

    /// Transient store timeout. The write batcher retries these with
    /// exponential backoff up to a bounded number of attempts.
    WriteTimeout { attempts: u32, detail: String },

    /// The store rejected a write outright (schema mismatch, oversized
    /// row). Retrying cannot help.
    WriteRejected { detail: String },

    /// An internal invariant broke: allocator collision, relation
    /// asymmetry, non-monotone history. Fatal, with a diagnostic.
    InvariantViolation { detail: String },

    /// Validator sample mismatch between stored and re-derived aggregates.
    Divergence {
        address: String,
        expected: String,
        got: String,
    },

    /// Clean shutdown requested; the in-flight batch was discarded before
    /// its status row advanced.
    Cancelled,

    /// Another updater holds the advisory lock for this keyspace.
    LockHeld { path: String },

    /// Raw record failed to decode (schema mismatch between ingest and
    /// this engine). Fatal.
    Corrupt { detail: String },

    /// Underlying store error that is neither a timeout nor a rejection.
    Store { detail: String },

    Io(std::io::Error),
    Config { detail: String },
}

impl UpdateError {
    /// Whether the retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpdateError::WriteTimeout { .. })
    }

    /// Process exit code for a run that ended with this error.
    ///
    /// LockHeld and Cancelled map to 0: a second updater racing the
    /// first, or a clean shutdown, is a normal operational situation.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateError::LockHeld { .. } | UpdateError::Cancelled => 0,
            UpdateError::Divergence { .. } | UpdateError::InvariantViolation { .. } => 2,
            _ => 1,
        }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        UpdateError::InvariantViolation {
            detail: detail.into(),
        }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        UpdateError::Corrupt {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::GapInRaw { height } => {
                write!(f, "gap in raw keyspace: block {} is missing", height)
            }
            UpdateError::RateMissing { date } => {
                write!(f, "no exchange rate at or before {}", date)
            }
            UpdateError::WriteTimeout { attempts, detail } => {
                write!(f, "write timed out after {} attempts: {}", attempts, detail)
            }
            UpdateError::WriteRejected { detail } => write!(f, "write rejected: {}", detail),
            UpdateError::InvariantViolation { detail } => {
                write!(f, "invariant violation: {}", detail)
            }
            UpdateError::Divergence {
                address,
                expected,
                got,
            } => write!(
                f,
                "divergence at address {}: expected {}, got {}",
                address, expected, got
            ),
            UpdateError::Cancelled => write!(f, "cancelled"),
            UpdateError::LockHeld { path } => {
                write!(f, "another updater holds the lock at {}", path)
            }
            UpdateError::Corrupt { detail } => write!(f, "corrupt raw record: {}", detail),
            UpdateError::Store { detail } => write!(f, "store error: {}", detail),
            UpdateError::Io(e) => write!(f, "io error: {}", e),
            UpdateError::Config { detail } => write!(f, "config error: {}", detail),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<std::io::Error> for UpdateError {
    fn from(e: std::io::Error) -> Self {
        UpdateError::Io(e)
    }
}

impl From<rocksdb::Error> for UpdateError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::TryAgain | ErrorKind::Busy => {
                UpdateError::WriteTimeout {
                    attempts: 1,
                    detail: e.to_string(),
                }
            }
            ErrorKind::InvalidArgument | ErrorKind::NotSupported => UpdateError::WriteRejected {
                detail: e.to_string(),
            },
            ErrorKind::Corruption => UpdateError::Corrupt {
                detail: e.to_string(),
            },
            _ => UpdateError::Store {
                detail: e.to_string(),
            },
        }
    }
}

impl From<bincode::Error> for UpdateError {
    fn from(e: bincode::Error) -> Self {
        UpdateError::Corrupt {
            detail: format!("decode failed: {}", e),
        }
    }
}
