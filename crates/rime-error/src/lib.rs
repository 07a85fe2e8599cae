#![forbid(unsafe_code)]
//! Error types for RimeFS.
//!
//! # Error Taxonomy
//!
//! RimeFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rime-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `RimeError` | `rime-error` (this crate) | Typed results for every fallible engine operation |
//!
//! ## Mapping policy: ParseError → RimeError
//!
//! Parsing crates return `ParseError`; the I/O and mount layers convert at
//! their boundaries:
//!
//! | Situation | RimeError variant |
//! |-----------|-------------------|
//! | Block-structure violation at a known logical address | `Structural { logical, detail }` |
//! | Stored digest does not match the recomputed one | `Checksum { logical, mirror }` |
//! | Tree block older/newer than the referencing pointer | `GenerationMismatch` |
//! | Failed or short device read | `Io { logical, devid, mirror, detail }` |
//! | RAID profile needs parity reconstruction to answer | `UnsupportedLayout` |
//! | Format feature this build does not verify/decode | `UnsupportedFeature` |
//! | Compressed extent failed to inflate | `Decode` |
//! | Parse failure with no better context | `Parse` (via `From<ParseError>`) |
//!
//! ## Fatality rules
//!
//! `Structural` is always fatal to the operation that discovered it and is
//! never repaired in place. `Checksum` drives mirror fallback inside tree
//! block I/O and only escapes once every mirror is exhausted.
//! `GenerationMismatch` is soft: permissive callers may keep the block and
//! flag it. `UnsupportedLayout` signals a missing capability (parity
//! reconstruction), distinct from a missing device, and must never be
//! papered over with zeroed data. `Decode` is fatal to the single extent
//! being inflated and leaves the containing tree block valid.

use rime_types::{DeviceId, Generation, Logical, ParseError};
use thiserror::Error;

/// Unified error type for all RimeFS engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RimeError {
    /// Tree-block or item structure violates a format invariant.
    #[error("structural corruption at logical {logical}: {detail}")]
    Structural { logical: Logical, detail: String },

    /// Stored checksum does not match the block contents.
    ///
    /// Carries the mirror index (1-based) that failed, for logging; the
    /// read path retries remaining mirrors before surfacing this.
    #[error("checksum mismatch at logical {logical} (mirror {mirror})")]
    Checksum { logical: Logical, mirror: u16 },

    /// Block generation differs from the referencing pointer's.
    #[error("generation mismatch at logical {logical}: expected {expected}, found {found}")]
    GenerationMismatch {
        logical: Logical,
        expected: Generation,
        found: Generation,
    },

    /// Device read failed or came up short.
    #[error("io error at logical {logical} (device {devid}, mirror {mirror}): {detail}")]
    Io {
        logical: Logical,
        devid: DeviceId,
        mirror: u16,
        detail: String,
    },

    /// The layout requires a capability this read-only engine lacks.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// The image uses a feature this build does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A compressed extent payload failed to decode.
    #[error("decode failure: {0}")]
    Decode(String),

    /// A requested key, chunk, or tree does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Parse-layer error surfaced without more specific context.
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<ParseError> for RimeError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

impl RimeError {
    /// Build a `Structural` error from a parse failure at a known address.
    #[must_use]
    pub fn structural(logical: Logical, err: &ParseError) -> Self {
        Self::Structural {
            logical,
            detail: err.to_string(),
        }
    }

    /// True for errors the mirror-fallback loop treats as "try the next
    /// copy": bad checksum, bad structure, failed read, stale generation.
    #[must_use]
    pub fn is_mirror_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Checksum { .. }
                | Self::Structural { .. }
                | Self::Io { .. }
                | Self::GenerationMismatch { .. }
        )
    }
}

/// Result alias using `RimeError`.
pub type Result<T> = std::result::Result<T, RimeError>;
