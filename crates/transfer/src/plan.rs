//! The chunk plan: a pure, deterministic decomposition of a file into
//! main chunks and sub-chunks.
//!
//! Both peers derive the same plan independently. The sender builds it
//! from the source size; the receiver rebuilds it from the `file-start`
//! totals and rejects the session if the announced counts disagree.

use beamdrop_protocol::constants::{MAIN_CHUNK_SIZE, SUB_CHUNK_SIZE};

/// Chunking parameters, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Size of a main chunk in bytes.
    pub main_size: u64,
    /// Size of a sub-chunk in bytes.
    pub sub_size: u64,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            main_size: MAIN_CHUNK_SIZE,
            sub_size: SUB_CHUNK_SIZE,
        }
    }
}

impl ChunkParams {
    fn validate(&self) -> Result<(), PlanError> {
        if self.main_size == 0 || self.sub_size == 0 {
            return Err(PlanError::ZeroSize);
        }
        // The two-level decomposition and the flat count formula
        // N = ceil(size / sub_size) are only mutually consistent when
        // main chunks hold a whole number of sub-chunks.
        if self.main_size % self.sub_size != 0 {
            return Err(PlanError::Misaligned {
                main: self.main_size,
                sub: self.sub_size,
            });
        }
        Ok(())
    }

    /// Sub-chunks per full main chunk.
    pub fn subs_per_main(&self) -> u32 {
        (self.main_size / self.sub_size) as u32
    }
}

/// Errors from plan construction or cross-peer verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("chunk sizes must be positive")]
    ZeroSize,

    #[error("main chunk size {main} is not a multiple of sub-chunk size {sub}")]
    Misaligned { main: u64, sub: u64 },

    #[error("plan mismatch: announced {announced} {what}, derived {derived}")]
    Mismatch {
        what: &'static str,
        announced: u32,
        derived: u32,
    },
}

/// A contiguous span of the file, the unit of integrity verification
/// and acknowledgement. Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubChunk {
    /// Globally unique ordinal in (main index, sub index) order.
    pub flat_index: u32,
    pub main_index: u32,
    /// Position within the owning main chunk.
    pub sub_index: u32,
    pub start: u64,
    pub end: u64,
}

impl SubChunk {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A contiguous span of the file, the coarse unit of progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainChunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub sub_chunks: Vec<SubChunk>,
}

/// The full two-level decomposition of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    size: u64,
    params: ChunkParams,
    main_chunks: Vec<MainChunk>,
    sub_count: u32,
}

impl ChunkPlan {
    /// Builds the plan for a file of `size` bytes.
    pub fn build(size: u64, params: ChunkParams) -> Result<Self, PlanError> {
        params.validate()?;

        let mut main_chunks = Vec::with_capacity(size.div_ceil(params.main_size) as usize);
        let mut flat_index = 0u32;

        let mut main_start = 0u64;
        while main_start < size {
            let main_end = (main_start + params.main_size).min(size);
            let main_index = main_chunks.len() as u32;

            let mut sub_chunks = Vec::new();
            let mut sub_start = main_start;
            let mut sub_index = 0u32;
            while sub_start < main_end {
                let sub_end = (sub_start + params.sub_size).min(main_end);
                sub_chunks.push(SubChunk {
                    flat_index,
                    main_index,
                    sub_index,
                    start: sub_start,
                    end: sub_end,
                });
                flat_index += 1;
                sub_index += 1;
                sub_start = sub_end;
            }

            main_chunks.push(MainChunk {
                index: main_index,
                start: main_start,
                end: main_end,
                sub_chunks,
            });
            main_start = main_end;
        }

        Ok(Self {
            size,
            params,
            main_chunks,
            sub_count: flat_index,
        })
    }

    /// Checks announced `file-start` totals against a locally derived
    /// plan. The counts must match exactly.
    pub fn verify_announced(
        size: u64,
        main_count: u32,
        sub_count: u32,
        params: ChunkParams,
    ) -> Result<(), PlanError> {
        params.validate()?;
        let derived_mains = size.div_ceil(params.main_size) as u32;
        let derived_subs = size.div_ceil(params.sub_size) as u32;
        if main_count != derived_mains {
            return Err(PlanError::Mismatch {
                what: "main chunks",
                announced: main_count,
                derived: derived_mains,
            });
        }
        if sub_count != derived_subs {
            return Err(PlanError::Mismatch {
                what: "sub-chunks",
                announced: sub_count,
                derived: derived_subs,
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn params(&self) -> ChunkParams {
        self.params
    }

    pub fn main_count(&self) -> u32 {
        self.main_chunks.len() as u32
    }

    pub fn sub_count(&self) -> u32 {
        self.sub_count
    }

    pub fn main_chunks(&self) -> &[MainChunk] {
        &self.main_chunks
    }

    /// Looks up a sub-chunk by flat index.
    pub fn sub(&self, flat_index: u32) -> Option<&SubChunk> {
        let per_main = self.params.subs_per_main();
        let main = self.main_chunks.get((flat_index / per_main) as usize)?;
        main.sub_chunks.get((flat_index % per_main) as usize)
    }

    /// All sub-chunks in flat-index order.
    pub fn iter_subs(&self) -> impl Iterator<Item = &SubChunk> + '_ {
        self.main_chunks.iter().flat_map(|m| m.sub_chunks.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(main: u64, sub: u64) -> ChunkParams {
        ChunkParams {
            main_size: main,
            sub_size: sub,
        }
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let plan = ChunkPlan::build(0, ChunkParams::default()).unwrap();
        assert_eq!(plan.main_count(), 0);
        assert_eq!(plan.sub_count(), 0);
        assert!(plan.sub(0).is_none());
    }

    #[test]
    fn single_exact_sub_chunk() {
        let plan = ChunkPlan::build(1_048_576, ChunkParams::default()).unwrap();
        assert_eq!(plan.main_count(), 1);
        assert_eq!(plan.sub_count(), 1);
        let sub = plan.sub(0).unwrap();
        assert_eq!(sub.start, 0);
        assert_eq!(sub.end, 1_048_576);
    }

    #[test]
    fn short_tail_sub_chunk() {
        // 2 full sub-chunks plus 37 bytes.
        let size = 2 * 1_048_576 + 37;
        let plan = ChunkPlan::build(size, ChunkParams::default()).unwrap();
        assert_eq!(plan.sub_count(), 3);
        let sizes: Vec<u64> = plan.iter_subs().map(|s| s.size()).collect();
        assert_eq!(sizes, vec![1_048_576, 1_048_576, 37]);
        let flats: Vec<u32> = plan.iter_subs().map(|s| s.flat_index).collect();
        assert_eq!(flats, vec![0, 1, 2]);
    }

    #[test]
    fn main_boundary_splits_at_one_byte() {
        let size = MAIN_CHUNK_SIZE + 1;
        let plan = ChunkPlan::build(size, ChunkParams::default()).unwrap();
        assert_eq!(plan.main_count(), 2);
        let per_main = ChunkParams::default().subs_per_main();
        assert_eq!(plan.sub_count(), per_main + 1);

        let first_main = &plan.main_chunks()[0];
        assert_eq!(first_main.sub_chunks.len(), per_main as usize);
        assert!(first_main.sub_chunks.iter().all(|s| s.size() == SUB_CHUNK_SIZE));

        let second_main = &plan.main_chunks()[1];
        assert_eq!(second_main.sub_chunks.len(), 1);
        assert_eq!(second_main.sub_chunks[0].size(), 1);
        assert_eq!(second_main.sub_chunks[0].flat_index, per_main);
    }

    #[test]
    fn coverage_is_exact_and_ordered() {
        let plan = ChunkPlan::build(10_000, params(4096, 1024)).unwrap();

        let total: u64 = plan.iter_subs().map(|s| s.size()).sum();
        assert_eq!(total, 10_000);

        // Contiguous, strictly increasing, flat indexes sequential.
        let mut expected_start = 0u64;
        for (i, sub) in plan.iter_subs().enumerate() {
            assert_eq!(sub.flat_index as usize, i);
            assert_eq!(sub.start, expected_start);
            assert!(sub.end > sub.start);
            assert!(sub.size() <= 1024);
            expected_start = sub.end;
        }
        assert_eq!(expected_start, 10_000);
    }

    #[test]
    fn counts_match_ceil_formulas() {
        for size in [0u64, 1, 1023, 1024, 1025, 4096, 4097, 10_000, 12_288] {
            let plan = ChunkPlan::build(size, params(4096, 1024)).unwrap();
            assert_eq!(plan.main_count() as u64, size.div_ceil(4096));
            assert_eq!(plan.sub_count() as u64, size.div_ceil(1024));
        }
    }

    #[test]
    fn main_bounds_follow_their_subs() {
        let plan = ChunkPlan::build(9000, params(4096, 1024)).unwrap();
        for main in plan.main_chunks() {
            assert_eq!(main.start, main.sub_chunks[0].start);
            assert_eq!(
                main.end,
                main.sub_chunks[main.sub_chunks.len() - 1].end
            );
        }
    }

    #[test]
    fn sub_lookup_matches_iteration() {
        let plan = ChunkPlan::build(10_000, params(4096, 1024)).unwrap();
        for sub in plan.iter_subs() {
            assert_eq!(plan.sub(sub.flat_index), Some(sub));
        }
        assert!(plan.sub(plan.sub_count()).is_none());
    }

    #[test]
    fn misaligned_params_rejected() {
        let result = ChunkPlan::build(100, params(1000, 300));
        assert_eq!(
            result.unwrap_err(),
            PlanError::Misaligned {
                main: 1000,
                sub: 300
            }
        );
    }

    #[test]
    fn zero_params_rejected() {
        assert_eq!(
            ChunkPlan::build(100, params(0, 0)).unwrap_err(),
            PlanError::ZeroSize
        );
    }

    #[test]
    fn verify_announced_accepts_matching_counts() {
        let size = 2 * 1_048_576 + 37;
        ChunkPlan::verify_announced(size, 1, 3, ChunkParams::default()).unwrap();
    }

    #[test]
    fn verify_announced_rejects_bad_sub_count() {
        let result = ChunkPlan::verify_announced(2_097_189, 1, 5, ChunkParams::default());
        assert!(matches!(
            result,
            Err(PlanError::Mismatch {
                what: "sub-chunks",
                announced: 5,
                derived: 3,
            })
        ));
    }

    #[test]
    fn verify_announced_rejects_bad_main_count() {
        let result =
            ChunkPlan::verify_announced(MAIN_CHUNK_SIZE + 1, 1, 51, ChunkParams::default());
        assert!(matches!(
            result,
            Err(PlanError::Mismatch {
                what: "main chunks",
                ..
            })
        ));
    }
}
