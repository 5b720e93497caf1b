//! Error taxonomy shared by the signer, the verifier and the CLI.
//!
//! Two enums live here:
//! - [`LogSigError`] is returned by operations that cannot proceed (I/O,
//!   malformed structures, invalid state transitions, notarizer outages).
//! - [`FailureKind`] classifies a *verification finding*. The verifier
//!   collects these into a report instead of aborting.
//!
//! Both expose a stable numeric [`code`](LogSigError::code). Codes 1..=17
//! keep their historical signature-file tooling values.

use crate::notary::NotaryError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = LogSigError> = std::result::Result<T, E>;

/// Errors raised by signing, parsing and persistence operations.
#[derive(Debug, Error)]
pub enum LogSigError {
    /// Underlying read/write/seek/rename failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A structure could not be decoded (bad child layout, unknown hash id...).
    #[error("format error: {0}")]
    Format(String),

    /// A critical TLV record of a type the reader does not understand.
    #[error("unexpected TLV record type {0:#06x}")]
    InvalidTlvType(u16),

    /// A hard capacity limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A declared length disagrees with the bytes available or allowed.
    #[error("length error: {0}")]
    Length(String),

    /// TLV records were found but the stream ended before a block signature.
    #[error("block signature record is missing")]
    NoBlockSig,

    /// File magic did not match.
    #[error("invalid file header: expected {expected:?}, found {found:?}")]
    InvalidHeader {
        /// Expected magic (lossy UTF-8).
        expected: String,
        /// Bytes actually found (lossy UTF-8).
        found: String,
    },

    /// A mandatory record was requested but the stream ended cleanly.
    #[error("unexpected end of file")]
    Eof,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The notarizer could not produce or check a signature.
    #[error("notarizer error: {0}")]
    Notary(#[from] NotaryError),

    /// Operation not permitted in the current session state.
    #[error("operation `{op}` not allowed while session is {state}")]
    InvalidState {
        /// Operation name.
        op: &'static str,
        /// State the session was in.
        state: &'static str,
    },

    /// Record rejected by the caller-facing limits (empty or too long).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The record was added and filled its block, but signing that block
    /// failed. The block is pending; retry `finish` instead of resubmitting.
    #[error("record accepted, block rollover pending: {0}")]
    RolloverPending(NotaryError),
}

impl LogSigError {
    /// Stable numeric code for this error.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Io(_) => 1,
            Self::Format(_) => 2,
            Self::InvalidTlvType(_) => 3,
            Self::ResourceExhausted(_) => 4,
            Self::Length(_) => 5,
            Self::NoBlockSig => 6,
            Self::InvalidHeader { .. } => 8,
            Self::Eof => 9,
            Self::Config(_) => 20,
            Self::Notary(_) => 21,
            Self::InvalidState { .. } => 22,
            Self::InvalidRecord(_) => 23,
            Self::RolloverPending(_) => 24,
        }
    }

    /// Build an [`InvalidHeader`](Self::InvalidHeader) from raw bytes.
    #[must_use]
    pub fn invalid_header(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidHeader {
            expected: String::from_utf8_lossy(expected).into_owned(),
            found: String::from_utf8_lossy(found).into_owned(),
        }
    }

    /// Map a structural error hit while reading a signature file to the
    /// verification finding it represents. Returns `None` for errors that are
    /// not findings about the file itself (I/O, config, state...).
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Format(_) => Some(FailureKind::Format),
            Self::InvalidTlvType(_) => Some(FailureKind::InvalidTlvType),
            Self::Length(_) => Some(FailureKind::Length),
            Self::NoBlockSig | Self::Eof => Some(FailureKind::MissingBlockSig),
            Self::InvalidHeader { .. } => Some(FailureKind::InvalidHeader),
            _ => None,
        }
    }
}

/// Classification of a single verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed record or block signature.
    Format,
    /// Critical record of unknown type.
    InvalidTlvType,
    /// Truncated or oversized record.
    Length,
    /// Replayed record count differs from the block signature.
    RecordCount,
    /// Signature file magic mismatch.
    InvalidHeader,
    /// A record hash was expected but not present.
    MissingRecordHash,
    /// A tree hash was expected but not present.
    MissingTreeHash,
    /// Stored record hash differs from the recomputed one.
    InvalidRecordHash,
    /// Stored tree hash differs from the recomputed one.
    InvalidTreeHash,
    /// Stored record hash uses a different algorithm id.
    InvalidRecordHashId,
    /// Stored tree hash uses a different algorithm id.
    InvalidTreeHashId,
    /// Records (or hashes) present with no closing block signature.
    MissingBlockSig,
    /// Notarizer rejected the block signature blob.
    InvalidTimestamp,
    /// Block IV does not derive from the previous block's last hash.
    ChainBreak,
    /// Recomputed block root differs from the stored last hash.
    FinalHash,
}

impl FailureKind {
    /// Stable numeric code, shared with [`LogSigError::code`] where both exist.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Format => 2,
            Self::InvalidTlvType => 3,
            Self::Length => 5,
            Self::RecordCount => 7,
            Self::InvalidHeader => 8,
            Self::MissingRecordHash => 10,
            Self::MissingTreeHash => 11,
            Self::InvalidRecordHash => 12,
            Self::InvalidTreeHash => 13,
            Self::InvalidRecordHashId => 14,
            Self::InvalidTreeHashId => 15,
            Self::MissingBlockSig => 16,
            Self::InvalidTimestamp => 17,
            Self::ChainBreak => 18,
            Self::FinalHash => 19,
        }
    }

    /// Short human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Format => "format error",
            Self::InvalidTlvType => "invalid TLV type",
            Self::Length => "length error",
            Self::RecordCount => "record count mismatch",
            Self::InvalidHeader => "invalid file header",
            Self::MissingRecordHash => "missing record hash",
            Self::MissingTreeHash => "missing tree hash",
            Self::InvalidRecordHash => "invalid record hash",
            Self::InvalidTreeHash => "invalid tree hash",
            Self::InvalidRecordHashId => "record hash algorithm mismatch",
            Self::InvalidTreeHashId => "tree hash algorithm mismatch",
            Self::MissingBlockSig => "missing block signature",
            Self::InvalidTimestamp => "invalid timestamp signature",
            Self::ChainBreak => "chain break",
            Self::FinalHash => "final hash mismatch",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
