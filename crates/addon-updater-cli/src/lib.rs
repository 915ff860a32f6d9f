//! Command-line driver for the addon update engine.
//!
//! Loads a profile and an engine configuration from TOML and runs the
//! check, update and rollback operations against them.

pub mod cli;
pub mod output;

pub use cli::Cli;

use addon_updater::UpdateError;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Authentication failed (exit code 2)
    AuthenticationFailed = 2,
    /// Network failure or timeout (exit code 3)
    NetworkFailed = 3,
    /// Download or archive failed verification (exit code 4)
    VerificationFailed = 4,
    /// Invalid profile, configuration or arguments (exit code 5)
    InvalidInput = 5,
    /// Stopped by the user (exit code 6)
    Cancelled = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::NetworkFailed => "NETWORK_FAILED",
            ExitCode::VerificationFailed => "VERIFICATION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::Cancelled => "CANCELLED",
        }
    }

    /// Exit code for an engine error.
    pub fn for_error(error: &UpdateError) -> Self {
        match error {
            UpdateError::Auth(_) => ExitCode::AuthenticationFailed,
            UpdateError::Http { status, .. } if *status == 401 || *status == 403 => {
                ExitCode::AuthenticationFailed
            }
            UpdateError::Http { .. }
            | UpdateError::Network(_)
            | UpdateError::Timeout { .. }
            | UpdateError::RangeUnsupported { .. } => ExitCode::NetworkFailed,
            UpdateError::ChecksumMismatch { .. }
            | UpdateError::Crc32Mismatch { .. }
            | UpdateError::PackageMismatch(_)
            | UpdateError::ZipFormat(_) => ExitCode::VerificationFailed,
            UpdateError::Config(_) | UpdateError::PathSafety(_) => ExitCode::InvalidInput,
            UpdateError::Cancelled => ExitCode::Cancelled,
            _ => ExitCode::GeneralError,
        }
    }
}
