//! Error types for the update engine.

use thiserror::Error;

/// Errors that can occur while planning, installing or rolling back.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// No credential could be obtained from the identity endpoint
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote endpoint answered with a non-success status
    #[error("HTTP {status}{}", format_body(.body))]
    Http { status: u16, body: String },

    /// Server refused a byte-range request (anything but 206)
    #[error("range request not supported (HTTP {status})")]
    RangeUnsupported { status: u16 },

    /// MD5 digest did not match after exhausting the gzip fallback
    #[error("checksum mismatch for {subject}: expected {expected}, raw {raw}{detail}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        raw: String,
        detail: MismatchDetail,
    },

    /// CRC32 of an extracted ZIP entry did not match the central directory
    #[error("CRC32 mismatch after extraction for {path} (expected {expected}, got {actual})")]
    Crc32Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Downloaded package does not belong to the plan it is installed against
    #[error("checksum mismatch and ZIP does not match plan: {0}")]
    PackageMismatch(String),

    /// Server-supplied path escapes the installation root
    #[error("unsafe path: {0}")]
    PathSafety(String),

    /// User-initiated stop; not a failure
    #[error("installation cancelled by user")]
    Cancelled,

    /// Request deadline elapsed
    #[error("request timed out after {timeout_ms}ms for {url}")]
    Timeout { url: String, timeout_ms: u64 },

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Malformed or unsupported ZIP structure
    #[error("ZIP format error: {0}")]
    ZipFormat(String),

    /// Catalog payload could not be interpreted
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Plan id is unknown or expired
    #[error("update plan not found; run an update check first")]
    PlanNotFound,

    /// Plan was created for another profile
    #[error("plan does not belong to the selected profile")]
    PlanProfileMismatch,

    /// Plan has nothing to install
    #[error("no install actions found; run an update check again")]
    EmptyPlan,

    /// No rollback snapshot for the profile
    #[error("no rollback snapshot available")]
    NoSnapshot,

    /// Snapshot metadata is missing or invalid
    #[error("rollback snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    /// Configuration or profile error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether this error is a clean user stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpdateError::Http { status, .. } | UpdateError::RangeUnsupported { status } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// What happened after the raw digest mismatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchDetail {
    /// No fallback was attempted
    None,
    /// Payload was gunzipped and re-hashed
    Unpacked(String),
    /// Gunzip itself failed
    GunzipFailed(String),
}

impl std::fmt::Display for MismatchDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchDetail::None => Ok(()),
            MismatchDetail::Unpacked(digest) => write!(f, ", unpacked {}", digest),
            MismatchDetail::GunzipFailed(reason) => write!(f, ", gunzip failed: {}", reason),
        }
    }
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {}", body)
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::Network(err.to_string())
    }
}
