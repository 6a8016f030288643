use std::fmt;

/// Failure talking to the remote ledger.
#[derive(Debug)]
pub enum RemoteError {
    /// Timeout, connection reset, DNS failure. Only the next scheduled poll retries.
    Transient(String),
    /// The endpoint answered with a non-success status or an explicit refusal.
    Rejected { status: u16, body: String },
    /// The body could not be parsed or an expected field was missing.
    Malformed(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn missing_field(endpoint: &str, field: &str) -> Self {
        RemoteError::Malformed(format!("{endpoint} response is missing `{field}`"))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Transient(reason) => write!(f, "network failure: {reason}"),
            RemoteError::Rejected { status, body } => {
                write!(f, "remote rejected request ({status}): {body}")
            }
            RemoteError::Malformed(reason) => write!(f, "malformed response: {reason}"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else {
            RemoteError::Transient(err.to_string())
        }
    }
}

/// Rejections from local wager bookkeeping. All are recoverable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerError {
    UnknownDenomination(u64),
    NoChipSelected,
    InsufficientBalance { required: u64, available: u64 },
    EmptyBatch,
    SubmissionInFlight,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::UnknownDenomination(d) => write!(f, "no chip with denomination {d}"),
            LedgerError::NoChipSelected => write!(f, "select a chip before placing a wager"),
            LedgerError::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: wagers need {required} but only {available} is available"
            ),
            LedgerError::EmptyBatch => write!(f, "nothing to submit"),
            LedgerError::SubmissionInFlight => {
                write!(f, "a wager submission is already in flight")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// Failure reading or writing the persisted cycle boundary.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "cycle state I/O error: {e}"),
            StoreError::Json(e) => write!(f, "cycle state is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json(err)
    }
}
