//! Multipart upload sizing
//!
//! Object stores bound multipart uploads by a minimum part size (except for
//! the last part), a maximum part size and a maximum part count. The solver
//! finds the range of part counts that split an object evenly within those
//! bounds.

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, LayoutResult};

const KIB: u64 = 1024;
const MIB: u64 = KIB * KIB;
const GIB: u64 = MIB * KIB;

/// Minimum size of every part except the last
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Maximum size of a single part
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// Maximum number of parts in one upload
pub const MAX_PART_COUNT: u64 = 10_000;

/// Store-imposed multipart bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLimits {
    /// Minimum part size in bytes (all parts but the last)
    pub min_part_size: u64,
    /// Maximum part size in bytes
    pub max_part_size: u64,
    /// Maximum number of parts per upload
    pub max_part_count: u64,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self::S3
    }
}

/// How many parts to use for a copy that could be split several ways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitStrategy {
    /// Half of the maximum part count, balancing parallelism and overhead
    #[default]
    Midpoint,
    /// Fewest parts allowed by the maximum part size
    Minimum,
}

/// Result of solving the part range for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// Smallest count whose even split is at most the maximum part size
    pub min_parts: u64,
    /// Largest count whose even split is at least the minimum part size
    pub max_parts: u64,
    /// `max_parts / 2`
    pub midpoint: u64,
}

impl PartRange {
    /// Part count to use under the given strategy
    ///
    /// Always within `[min_parts, max_parts]`.
    pub fn chosen(&self, strategy: SplitStrategy) -> u64 {
        match strategy {
            SplitStrategy::Midpoint => self.midpoint.clamp(self.min_parts, self.max_parts),
            SplitStrategy::Minimum => self.min_parts,
        }
    }
}

impl PartLimits {
    /// Limits of the S3 multipart API
    pub const S3: Self = Self {
        min_part_size: MIN_PART_SIZE,
        max_part_size: MAX_PART_SIZE,
        max_part_count: MAX_PART_COUNT,
    };

    /// Create custom limits
    pub const fn new(min_part_size: u64, max_part_size: u64, max_part_count: u64) -> Self {
        Self {
            min_part_size,
            max_part_size,
            max_part_count,
        }
    }

    /// Check that the limits describe a usable store
    pub fn validate(&self) -> LayoutResult<()> {
        if self.min_part_size == 0 {
            return Err(LayoutError::InvalidPartLimits {
                reason: "minimum part size must be positive".to_string(),
            });
        }
        if self.min_part_size > self.max_part_size {
            return Err(LayoutError::InvalidPartLimits {
                reason: format!(
                    "minimum part size {} exceeds maximum part size {}",
                    self.min_part_size, self.max_part_size
                ),
            });
        }
        if self.max_part_count == 0 {
            return Err(LayoutError::InvalidPartLimits {
                reason: "part count limit must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Solve the part range for an object of `object_size` bytes
    ///
    /// Objects smaller than the minimum part size, including empty ones,
    /// resolve to a single part.
    pub fn solve(&self, object_size: i64) -> LayoutResult<PartRange> {
        self.validate()?;
        let size =
            u64::try_from(object_size).map_err(|_| LayoutError::NegativeObjectSize(object_size))?;

        let mut max_parts = self.max_part_count;
        while max_parts > 1 && size / max_parts < self.min_part_size {
            max_parts -= 1;
        }

        let mut min_parts = 1;
        while size / min_parts > self.max_part_size {
            if min_parts >= self.max_part_count {
                return Err(LayoutError::ObjectTooLarge {
                    size,
                    max_part_count: self.max_part_count,
                    max_part_size: self.max_part_size,
                });
            }
            min_parts += 1;
        }

        if min_parts > max_parts {
            return Err(LayoutError::InvalidPartLimits {
                reason: format!(
                    "no part count splits {size} bytes between {} and {} bytes",
                    self.min_part_size, self.max_part_size
                ),
            });
        }

        Ok(PartRange {
            min_parts,
            max_parts,
            midpoint: max_parts / 2,
        })
    }

    /// Solve for a size already known to be non-negative
    pub fn solve_unsigned(&self, object_size: u64) -> LayoutResult<PartRange> {
        let size = i64::try_from(object_size).map_err(|_| LayoutError::ObjectTooLarge {
            size: object_size,
            max_part_count: self.max_part_count,
            max_part_size: self.max_part_size,
        })?;
        self.solve(size)
    }
}
