//! Error types for layout operations

use thiserror::Error;

/// Layout operation result type
pub type LayoutResult<T> = Result<T, LayoutError>;

/// Errors raised while computing an archive layout
///
/// Every variant is local to the computation: no manifest is produced when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Object size handed to the part solver was negative
    #[error("Invalid object size: {0} (must not be negative)")]
    NegativeObjectSize(i64),

    /// Part limits are inconsistent
    #[error("Invalid part limits: {reason}")]
    InvalidPartLimits {
        /// Which limit is out of range
        reason: String,
    },

    /// No part count satisfies the limits for this object
    #[error("Object of {size} bytes cannot be split within {max_part_count} parts of at most {max_part_size} bytes")]
    ObjectTooLarge {
        /// Object size in bytes
        size: u64,
        /// Configured part ceiling
        max_part_count: u64,
        /// Configured maximum part size
        max_part_size: u64,
    },

    /// The archive needs more parts than the store accepts
    #[error("Archive needs {parts} parts, limit is {limit}")]
    TooManyParts {
        /// Parts required by the plan
        parts: usize,
        /// Configured part ceiling
        limit: u64,
    },

    /// A buffered part would exceed the maximum part size
    #[error("Buffered part of {size} bytes exceeds the maximum part size {max_part_size}")]
    PartTooLarge {
        /// Size of the buffered part
        size: u64,
        /// Configured maximum part size
        max_part_size: u64,
    },

    /// Two entries share a name
    #[error("Duplicate entry name: {0}")]
    DuplicateName(String),

    /// Entry name cannot be stored in a tar header
    #[error("Invalid entry name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// The manifest size did not stabilize
    #[error("Manifest layout did not converge after {iterations} iterations (last estimate {estimate} bytes)")]
    Convergence {
        /// Iterations performed
        iterations: usize,
        /// Last manifest span estimate
        estimate: u64,
    },

    /// Manifest text could not be parsed
    #[error("Invalid manifest at line {line}: {reason}")]
    InvalidManifest {
        /// 1-based line number
        line: usize,
        /// Parse failure description
        reason: String,
    },

    /// Tar header encoding failed
    #[error("Header encoding failed: {0}")]
    Header(#[from] std::io::Error),
}

impl LayoutError {
    /// Check if this error comes from invalid sizes or limits
    ///
    /// These are reported before any store call is made.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NegativeObjectSize(_)
                | Self::InvalidPartLimits { .. }
                | Self::ObjectTooLarge { .. }
                | Self::TooManyParts { .. }
                | Self::PartTooLarge { .. }
        )
    }

    /// Check if this error indicates the fixed point failed
    pub fn is_convergence_error(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }

    /// Check if this error is about archive member names
    pub fn is_name_error(&self) -> bool {
        matches!(self, Self::DuplicateName(_) | Self::InvalidName { .. })
    }
}
