// Error handling framework for the automation driver, dataset model and ledger client.

use thiserror::Error;

/// A daemon `/submit` response carried a non-empty `error` field.
#[derive(Error, Debug)]
#[error("submit failed: {0}")]
pub struct SubmitError(pub String);

/// One element of `last_error` surfaced while polling `/status`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{method} ({jobid}) failed: {status}")]
pub struct JobError {
    pub jobid: String,
    pub method: String,
    pub status: String,
}

impl JobError {
    pub fn new(jobid: impl Into<String>, method: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            jobid: jobid.into(),
            method: method.into(),
            status: status.into(),
        }
    }

    /// Multi-line rendering for terminal output, one failure per line.
    pub fn format_msg(&self) -> String {
        format!("  {}  {}  {}", self.jobid, self.method, self.status)
    }
}

/// Network or malformed-JSON failure talking to the ledger. Retried up to
/// three times with a 4s back-off; HTTP 401/409 are not transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to urd failed: {0}")]
    Request(String),
    #[error("malformed response from urd: {0}")]
    Decode(String),
}

/// HTTP 401 from the ledger. Never retried.
#[derive(Error, Debug)]
#[error("urd authentication failed")]
pub struct AuthError;

/// HTTP 409 from the ledger. Never retried.
#[derive(Error, Debug)]
#[error("urd conflict: {0}")]
pub struct ConflictError(pub String);

/// Structural violation detected client-side: duplicate writer name,
/// mismatched slice line counts, hashlabel mismatch on append, unknown
/// column type, corrupt version tuple, columns/filenames key mismatch,
/// lines length != SLICES.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate dataset writer name: {0}")]
    DuplicateWriterName(String),
    #[error("slice {sliceno}: columns have mismatched line counts: {detail}")]
    MismatchedLineCounts { sliceno: usize, detail: String },
    #[error("hashlabel mismatch {existing} != {requested} (pass hashlabel_override to replace it)")]
    HashlabelMismatch { existing: String, requested: String },
    #[error("unknown column type: {0}")]
    UnknownColumnType(String),
    #[error("unsupported dataset version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("columns and filenames have different key sets")]
    ColumnsFilenamesMismatch,
    #[error("lines has length {actual}, expected {expected} (SLICES)")]
    WrongLineVectorLength { actual: usize, expected: usize },
    #[error("column name is not unique or collides with a reserved word: {0}")]
    InvalidColumnName(String),
}

/// Misuse of the Urd transaction lifecycle: begin-within-begin,
/// finish-without-begin, duplicate dependency registration under one path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("urd transaction already open for {0}")]
    TransactionAlreadyOpen(String),
    #[error("no urd transaction is open")]
    NoTransactionOpen,
    #[error("finish for {expected} called while transaction {actual} is open")]
    WrongTransaction { expected: String, actual: String },
    #[error("duplicate urd dependency registered for path {0}")]
    DuplicateDependency(String),
    #[error("build_chained requires a name")]
    MissingChainName,
    #[error("build_chained without a prior dependency fetch to chain from")]
    NothingToChainFrom,
    #[error("no timestamp specified for finish of {0}")]
    MissingTimestamp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_formats_multiline_entry() {
        let e = JobError::new("j1", "csvexport", "crashed");
        assert_eq!(e.format_msg(), "  j1  csvexport  crashed");
    }

    #[test]
    fn submit_error_carries_message() {
        let e = SubmitError("no such method".into());
        assert_eq!(e.to_string(), "submit failed: no such method");
    }

    #[test]
    fn validation_error_messages_are_specific() {
        let e = ValidationError::HashlabelMismatch {
            existing: "h1".into(),
            requested: "h2".into(),
        };
        assert!(e.to_string().contains("h1"));
        assert!(e.to_string().contains("h2"));
    }
}
