//! Fixed-size chunk planning for multipart uploads.

use std::ops::{Range, RangeInclusive};

/// Most parts a single multipart upload may have.
pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("file is empty")]
    EmptyFile,
    #[error("part size must be greater than zero")]
    ZeroPartSize,
    #[error("file needs {needed} parts of {part_size} bytes; at most {MAX_PARTS} are allowed")]
    TooManyParts { needed: u64, part_size: u64 },
}

/// Split of a file into `part_count` chunks of `part_size` bytes.
/// Only the last part may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    pub fn new(file_size: u64, part_size: u64) -> Result<Self, PlanError> {
        if part_size == 0 {
            return Err(PlanError::ZeroPartSize);
        }
        if file_size == 0 {
            return Err(PlanError::EmptyFile);
        }
        let needed = file_size.div_ceil(part_size);
        if needed > u64::from(MAX_PARTS) {
            return Err(PlanError::TooManyParts { needed, part_size });
        }
        Ok(Self {
            file_size,
            part_size,
            part_count: needed as u32,
        })
    }

    /// Part numbers `1..=part_count`.
    pub fn part_numbers(&self) -> RangeInclusive<u32> {
        1..=self.part_count
    }

    /// Byte range covered by `part_number`, or `None` when out of range.
    pub fn byte_range(&self, part_number: u32) -> Option<Range<u64>> {
        if !self.part_numbers().contains(&part_number) {
            return None;
        }
        let start = u64::from(part_number - 1) * self.part_size;
        let end = (start + self.part_size).min(self.file_size);
        Some(start..end)
    }

    pub fn part_len(&self, part_number: u32) -> u64 {
        self.byte_range(part_number)
            .map(|r| r.end - r.start)
            .unwrap_or(0)
    }
}
