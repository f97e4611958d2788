#![forbid(unsafe_code)]
//! Error types for RawSpool.
//!
//! Defines `RspError` and a `Result<T>` alias used throughout the workspace.
//! The construction-error variants render the exact messages callers of
//! `PartialFile::create`/`open` surface to the user.

use rsp_types::ParseError;
use thiserror::Error;

/// Unified error type for all RawSpool operations.
#[derive(Debug, Error)]
pub enum RspError {
    // ── Partial-file construction errors (caller-visible strings) ─────────
    #[error("Failed to write to location")]
    WriteLocation,

    #[error("Failed to prepare file for writing")]
    PrepareFile,

    #[error("USB drive full")]
    DriveFull,

    #[error("Failed to open file")]
    OpenFile,

    #[error("Failed to check file contiguity")]
    ContiguityCheck,

    #[error("File is not contiguous")]
    NotContiguous,

    #[error("Can't lock file in place")]
    LockFile,

    // ── Ambient errors ────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("timed out waiting for a sector slot")]
    Timeout,

    #[error("medium identity changed since the file was locked")]
    MediumChanged,

    #[error("device refused the request: {0}")]
    DeviceFault(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("no space left on device")]
    NoSpace,

    #[error("file is pinned: {0}")]
    Pinned(String),
}

/// Result alias using `RspError`.
pub type Result<T> = std::result::Result<T, RspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_errors_render_caller_visible_strings() {
        assert_eq!(RspError::WriteLocation.to_string(), "Failed to write to location");
        assert_eq!(
            RspError::PrepareFile.to_string(),
            "Failed to prepare file for writing"
        );
        assert_eq!(RspError::DriveFull.to_string(), "USB drive full");
        assert_eq!(RspError::OpenFile.to_string(), "Failed to open file");
        assert_eq!(
            RspError::ContiguityCheck.to_string(),
            "Failed to check file contiguity"
        );
        assert_eq!(RspError::NotContiguous.to_string(), "File is not contiguous");
        assert_eq!(RspError::LockFile.to_string(), "Can't lock file in place");
    }
}
