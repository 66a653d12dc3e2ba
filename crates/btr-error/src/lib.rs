#![forbid(unsafe_code)]
//! Error types for btrescue.
//!
//! # Error Taxonomy
//!
//! btrescue uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `btr-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `BtrError` | `btr-error` (this crate) | Errors for tree operations, rescue flows, and the CLI |
//!
//! ## Mapping Policy: ParseError → BtrError
//!
//! `btr-error` is intentionally independent of `btr-types` and `btr-ondisk` to
//! avoid cyclic dependencies. Conversions happen at the crate boundaries that
//! see both types (`btr-ondisk`, `btr-tree`).
//!
//! | ParseError Variant | BtrError Variant | Rationale |
//! |--------------------|------------------|-----------|
//! | `InsufficientData` | `CorruptBlock { bytenr, detail }` | Truncated metadata indicates corruption or a truncated image |
//! | `InvalidMagic` | `Parse(detail)` | Wrong magic means a wrong or missing filesystem, not block corruption |
//! | `InvalidField` | `CorruptBlock` / `Parse` | Block-level reads carry the bytenr; boundary code adds it |
//! | `IntegerConversion` | `CorruptBlock { bytenr, detail }` | Arithmetic overflow in parsed values suggests corruption |
//!
//! ## Design Constraints
//!
//! - `btr-error` MUST NOT depend on `btr-types` or `btr-ondisk` (no cyclic deps).
//! - `BtrError` is the single error type crossing crate boundaries; internal
//!   errors convert into it at their respective boundaries.
//! - All string payloads are owned (`String`) so errors can outlive the
//!   borrowed buffers they were derived from.

use thiserror::Error;

/// Unified error type for all btrescue operations.
#[derive(Debug, Error)]
pub enum BtrError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A tree block failed structural or checksum validation.
    ///
    /// The `bytenr` is the logical address of the offending block, enabling
    /// rescue triage. Mutating tree operations guarantee the block is left
    /// byte-identical to its pre-call state when this is returned.
    #[error("corrupt tree block at bytenr {bytenr}: {detail}")]
    CorruptBlock { bytenr: u64, detail: String },

    /// Parse-layer failure with no block address to pin it to.
    ///
    /// Carries the string form of a `ParseError` from `btr-types`. Prefer
    /// `CorruptBlock` when the bytenr is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// A leaf lacks the free bytes an insert or extend needs.
    ///
    /// The caller may split the leaf and retry; the failing operation has not
    /// modified the block.
    #[error("no space left in tree block")]
    NoSpace,

    /// A key, item, or named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied arguments are invalid for the requested operation.
    ///
    /// Returned before any device I/O is attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target device is mounted or otherwise in use.
    #[error("device busy: {0}")]
    Busy(String),

    /// A rescue workflow ran to completion but could not repair the damage.
    #[error("rescue failed: {0}")]
    RescueFailed(String),
}

impl BtrError {
    /// True when retrying after freeing space in the target leaf could
    /// succeed. Used by insert paths that split and retry.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `BtrError`.
pub type Result<T> = std::result::Result<T, BtrError>;
