//! Packing archive segments into multipart parts
//!
//! The archive is a run of in-memory bytes (manifest, headers, padding,
//! end-of-archive marker) interleaved with ranges of stored objects. Large
//! ranges become server-side copy parts. Everything else is gathered into
//! upload parts that the assembler builds in memory, fetching any small
//! remote ranges first. Every part except the last is at least the minimum
//! part size, and no part exceeds the maximum.

use bytes::Bytes;
use tracing::debug;

use tarstitch_formats::{
    ArchiveSegment, ByteRange, LayoutError, LayoutResult, PartLimits, SourceFingerprint,
    SplitStrategy,
};

use crate::types::ObjectRef;

/// One slice of an upload part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartPiece {
    /// Bytes already in memory
    Inline(Bytes),
    /// Bytes fetched from a source object before upload
    Remote {
        /// Source object
        source: ObjectRef,
        /// Range within the source
        range: ByteRange,
        /// Source state recorded at layout time
        expected: SourceFingerprint,
    },
}

impl PartPiece {
    /// Length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Remote { range, .. } => range.len,
        }
    }

    /// Check if the piece carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn split_off_front(&mut self, len: u64) -> Self {
        match self {
            Self::Inline(bytes) => Self::Inline(bytes.split_to(len as usize)),
            Self::Remote {
                source,
                range,
                expected,
            } => {
                let head = range.head(len);
                *range = range.tail(len);
                Self::Remote {
                    source: source.clone(),
                    range: head,
                    expected: expected.clone(),
                }
            }
        }
    }
}

/// How a part's bytes reach the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSource {
    /// Server-side copy of one source range
    Copy {
        /// Source object
        source: ObjectRef,
        /// Range within the source
        range: ByteRange,
        /// Source state recorded at layout time
        expected: SourceFingerprint,
    },
    /// Bytes concatenated in memory and uploaded
    Upload(Vec<PartPiece>),
}

/// One part of the destination upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPart {
    /// 1-based part number
    pub part_number: u32,
    /// Archive offset of the part's first byte
    pub offset: u64,
    /// Part length in bytes
    pub len: u64,
    /// Where the bytes come from
    pub source: PartSource,
}

impl PlannedPart {
    /// Check if the part is a server-side copy
    pub fn is_copy(&self) -> bool {
        matches!(self.source, PartSource::Copy { .. })
    }
}

/// Ordered parts covering the whole archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyPlan {
    parts: Vec<PlannedPart>,
    total_len: u64,
    strategy: SplitStrategy,
}

impl AssemblyPlan {
    /// Parts in part-number order
    pub fn parts(&self) -> &[PlannedPart] {
        &self.parts
    }

    /// Consume the plan, yielding its parts
    pub fn into_parts(self) -> Vec<PlannedPart> {
        self.parts
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the plan has no parts
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Archive length covered by the plan
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Split strategy the plan was built with
    pub fn strategy(&self) -> SplitStrategy {
        self.strategy
    }

    /// Number of server-side copy parts
    pub fn copy_count(&self) -> usize {
        self.parts.iter().filter(|part| part.is_copy()).count()
    }

    /// Check the plan against multipart limits
    ///
    /// Parts must be numbered from 1, contiguous from offset 0 and within the
    /// size bounds, the last part excepted from the minimum.
    pub fn validate(&self, limits: &PartLimits) -> LayoutResult<()> {
        if self.parts.len() as u64 > limits.max_part_count {
            return Err(LayoutError::TooManyParts {
                parts: self.parts.len(),
                limit: limits.max_part_count,
            });
        }

        let mut offset = 0;
        let last = self.parts.len().saturating_sub(1);
        for (index, part) in self.parts.iter().enumerate() {
            if part.offset != offset || u64::from(part.part_number) != index as u64 + 1 {
                return Err(LayoutError::InvalidPartLimits {
                    reason: format!(
                        "part {} at offset {} does not follow offset {offset}",
                        part.part_number, part.offset
                    ),
                });
            }
            if part.len > limits.max_part_size {
                return Err(LayoutError::PartTooLarge {
                    size: part.len,
                    max_part_size: limits.max_part_size,
                });
            }
            if index != last && part.len < limits.min_part_size {
                return Err(LayoutError::InvalidPartLimits {
                    reason: format!(
                        "part {} has {} bytes, below the minimum {}",
                        part.part_number, part.len, limits.min_part_size
                    ),
                });
            }
            offset += part.len;
        }

        if offset != self.total_len {
            return Err(LayoutError::InvalidPartLimits {
                reason: format!("parts cover {offset} of {} bytes", self.total_len),
            });
        }
        Ok(())
    }
}

/// Turns archive segments into an [`AssemblyPlan`]
#[derive(Debug, Clone, Copy)]
pub struct PartPlanner {
    limits: PartLimits,
    strategy: SplitStrategy,
}

impl PartPlanner {
    /// Create a planner for the given limits and copy split strategy
    pub fn new(limits: PartLimits, strategy: SplitStrategy) -> Self {
        Self { limits, strategy }
    }

    /// Plan the parts for `segments`
    ///
    /// When the chosen strategy produces more parts than the store allows,
    /// planning is repeated with [`SplitStrategy::Minimum`].
    pub fn plan(&self, segments: &[ArchiveSegment]) -> LayoutResult<AssemblyPlan> {
        self.limits.validate()?;

        let plan = self.plan_with(segments, self.strategy)?;
        if plan.len() as u64 <= self.limits.max_part_count {
            plan.validate(&self.limits)?;
            return Ok(plan);
        }

        if self.strategy != SplitStrategy::Minimum {
            debug!(
                "{} parts exceed the limit of {}, retrying with the minimum split",
                plan.len(),
                self.limits.max_part_count
            );
            let plan = self.plan_with(segments, SplitStrategy::Minimum)?;
            plan.validate(&self.limits)?;
            return Ok(plan);
        }

        Err(LayoutError::TooManyParts {
            parts: plan.len(),
            limit: self.limits.max_part_count,
        })
    }

    fn plan_with(
        &self,
        segments: &[ArchiveSegment],
        strategy: SplitStrategy,
    ) -> LayoutResult<AssemblyPlan> {
        let mut builder = PlanBuilder::new(self.limits, strategy);
        for segment in segments {
            match segment {
                ArchiveSegment::Inline(bytes) => builder.buffer(PartPiece::Inline(bytes.clone())),
                ArchiveSegment::Remote {
                    bucket,
                    key,
                    range,
                    expected,
                } => {
                    let source = ObjectRef::new(bucket.as_str(), key.as_str());
                    builder.remote(source, *range, expected)?;
                }
            }
        }
        builder.finish()
    }
}

struct PlanBuilder {
    limits: PartLimits,
    strategy: SplitStrategy,
    parts: Vec<PlannedPart>,
    pending: Vec<PartPiece>,
    pending_len: u64,
    offset: u64,
}

impl PlanBuilder {
    fn new(limits: PartLimits, strategy: SplitStrategy) -> Self {
        Self {
            limits,
            strategy,
            parts: Vec::new(),
            pending: Vec::new(),
            pending_len: 0,
            offset: 0,
        }
    }

    fn remote(
        &mut self,
        source: ObjectRef,
        range: ByteRange,
        expected: &SourceFingerprint,
    ) -> LayoutResult<()> {
        let min = self.limits.min_part_size;
        let mut piece = PartPiece::Remote {
            source: source.clone(),
            range,
            expected: expected.clone(),
        };

        if range.len < min {
            self.buffer(piece);
            return Ok(());
        }

        let mut copy = range;
        if self.pending_len > 0 {
            let needed = min - self.pending_len;
            if range.len - needed < min {
                self.buffer(piece);
                return Ok(());
            }
            // Top the buffered bytes up to a full part with the head of the range
            let head = piece.split_off_front(needed);
            self.buffer(head);
            copy = range.tail(needed);
        }

        self.copy(source, copy, expected)
    }

    /// Add bytes to the pending upload part, emitting parts as it fills
    fn buffer(&mut self, mut piece: PartPiece) {
        while !piece.is_empty() {
            let room = self.limits.max_part_size - self.pending_len;
            let chunk = if piece.len() > room {
                piece.split_off_front(room)
            } else {
                std::mem::replace(&mut piece, PartPiece::Inline(Bytes::new()))
            };
            self.pending_len += chunk.len();
            self.pending.push(chunk);
            if self.pending_len >= self.limits.min_part_size {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        if self.pending_len == 0 {
            return;
        }
        let pieces = std::mem::take(&mut self.pending);
        let len = std::mem::take(&mut self.pending_len);
        self.push(len, PartSource::Upload(pieces));
    }

    fn copy(
        &mut self,
        source: ObjectRef,
        range: ByteRange,
        expected: &SourceFingerprint,
    ) -> LayoutResult<()> {
        let mut parts = self.limits.solve_unsigned(range.len)?.chosen(self.strategy);
        while range.len.div_ceil(parts) > self.limits.max_part_size {
            parts += 1;
        }
        if range.len / parts < self.limits.min_part_size {
            return Err(LayoutError::InvalidPartLimits {
                reason: format!(
                    "no part count splits {} bytes between {} and {} bytes",
                    range.len, self.limits.min_part_size, self.limits.max_part_size
                ),
            });
        }

        for piece in range.split(parts) {
            self.push(
                piece.len,
                PartSource::Copy {
                    source: source.clone(),
                    range: piece,
                    expected: expected.clone(),
                },
            );
        }
        Ok(())
    }

    fn push(&mut self, len: u64, source: PartSource) {
        let part_number = u32::try_from(self.parts.len() + 1).unwrap_or(u32::MAX);
        self.parts.push(PlannedPart {
            part_number,
            offset: self.offset,
            len,
            source,
        });
        self.offset += len;
    }

    fn finish(mut self) -> LayoutResult<AssemblyPlan> {
        self.flush();
        Ok(AssemblyPlan {
            parts: self.parts,
            total_len: self.offset,
            strategy: self.strategy,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const LIMITS: PartLimits = PartLimits::new(100, 250, 10_000);

    fn inline(len: usize) -> ArchiveSegment {
        ArchiveSegment::Inline(Bytes::from(vec![7u8; len]))
    }

    fn remote(key: &str, len: u64) -> ArchiveSegment {
        ArchiveSegment::Remote {
            bucket: "src".to_string(),
            key: key.to_string(),
            range: ByteRange::whole(len),
            expected: SourceFingerprint {
                size: len,
                checksum: format!("etag-{key}"),
            },
        }
    }

    fn lens(plan: &AssemblyPlan) -> Vec<(u64, bool)> {
        plan.parts().iter().map(|p| (p.len, p.is_copy())).collect()
    }

    #[test]
    fn test_small_archive_single_upload() {
        let plan = PartPlanner::new(LIMITS, SplitStrategy::Midpoint)
            .plan(&[inline(30), remote("a", 20), inline(40)])
            .expect("plan should succeed");
        assert_eq!(lens(&plan), vec![(90, false)]);
        let PartSource::Upload(pieces) = &plan.parts()[0].source else {
            panic!("expected upload part");
        };
        assert_eq!(pieces.len(), 3);
    }

    #[test]
    fn test_head_borrowed_to_reach_minimum() {
        let plan = PartPlanner::new(LIMITS, SplitStrategy::Minimum)
            .plan(&[inline(30), remote("big", 230), inline(10)])
            .expect("plan should succeed");
        // 30 inline + 70 borrowed, 160 copied, 10 trailing
        assert_eq!(lens(&plan), vec![(100, false), (160, true), (10, false)]);
        let PartSource::Copy { range, .. } = &plan.parts()[1].source else {
            panic!("expected copy part");
        };
        assert_eq!(*range, ByteRange::new(70, 160));
    }

    #[test]
    fn test_range_absorbed_when_remainder_too_small() {
        let plan = PartPlanner::new(LIMITS, SplitStrategy::Minimum)
            .plan(&[inline(30), remote("mid", 150), inline(10)])
            .expect("plan should succeed");
        // Borrowing 70 would leave 80, below the minimum
        assert_eq!(lens(&plan), vec![(180, false), (10, false)]);
    }

    #[test]
    fn test_large_range_split_evenly() {
        let plan = PartPlanner::new(LIMITS, SplitStrategy::Minimum)
            .plan(&[inline(100), remote("huge", 1000), inline(5)])
            .expect("plan should succeed");
        assert_eq!(
            lens(&plan),
            vec![(100, false), (250, true), (250, true), (250, true), (250, true), (5, false)]
        );
        assert_eq!(plan.copy_count(), 4);
    }

    #[test]
    fn test_large_inline_bounded_by_maximum() {
        let plan = PartPlanner::new(LIMITS, SplitStrategy::Midpoint)
            .plan(&[inline(600)])
            .expect("plan should succeed");
        assert_eq!(lens(&plan), vec![(250, false), (250, false), (100, false)]);
    }

    #[test]
    fn test_too_many_parts() {
        let limits = PartLimits::new(100, 250, 3);
        let err = PartPlanner::new(limits, SplitStrategy::Midpoint)
            .plan(&[inline(1000)])
            .expect_err("plan must fail");
        assert!(matches!(err, LayoutError::TooManyParts { parts: 4, .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_falls_back_to_minimum_split() {
        let limits = PartLimits::new(100, 1000, 5);
        let segments = [
            inline(100),
            remote("a", 800),
            inline(100),
            remote("b", 800),
            inline(5),
        ];
        // Midpoint copies each range in 2 parts (7 total), minimum in 1 (5 total)
        let plan = PartPlanner::new(limits, SplitStrategy::Midpoint)
            .plan(&segments)
            .expect("plan should succeed");
        assert_eq!(plan.strategy(), SplitStrategy::Minimum);
        assert_eq!(
            lens(&plan),
            vec![(100, false), (800, true), (100, false), (800, true), (5, false)]
        );
    }

    fn segment_strategy() -> impl Strategy<Value = ArchiveSegment> {
        prop_oneof![
            (1usize..400).prop_map(inline),
            (1u64..2000).prop_map(|len| remote("obj", len)),
        ]
    }

    proptest! {
        #[test]
        fn prop_parts_cover_archive(
            segments in prop::collection::vec(segment_strategy(), 1..20),
            minimum in any::<bool>(),
        ) {
            let strategy = if minimum { SplitStrategy::Minimum } else { SplitStrategy::Midpoint };
            let plan = PartPlanner::new(LIMITS, strategy)
                .plan(&segments)
                .expect("plan should succeed");
            let total: u64 = segments.iter().map(ArchiveSegment::len).sum();
            prop_assert_eq!(plan.total_len(), total);
            prop_assert!(plan.validate(&LIMITS).is_ok());

            for part in plan.parts() {
                let len = match &part.source {
                    PartSource::Copy { range, .. } => range.len,
                    PartSource::Upload(pieces) => pieces.iter().map(PartPiece::len).sum(),
                };
                prop_assert_eq!(len, part.len);
            }
        }
    }
}
