//! Time-based chunk planning.
//!
//! Duration is estimated from file size alone (16 MB per minute of video,
//! explicitly approximate) and partitioned into consecutive windows of the
//! configured target length. The Analysis Service is later asked to describe
//! what it actually sees, so an estimate overshooting the real duration only
//! produces empty trailing sections.

use crate::timecode::format_timestamp;
use serde::{Deserialize, Serialize};

/// Size heuristic: one minute of footage per 16 MB
pub const BYTES_PER_ESTIMATED_MINUTE: u64 = 16 * 1024 * 1024;

/// One contiguous analysis window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Dense, zero-based position in the plan
    pub index: usize,
    /// Window start, seconds from video start
    pub start_s: u64,
    /// Window end; non-terminal chunks include the overlap
    pub end_s: u64,
    /// Analyzed window length (`end_s - start_s`)
    pub duration_s: u64,
}

impl Chunk {
    /// Human-readable absolute window, for prompts and placeholders.
    pub fn window_label(&self) -> String {
        format!(
            "{} - {}",
            format_timestamp(self.start_s),
            format_timestamp(self.end_s)
        )
    }
}

/// Ordered partition of the estimated duration into chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub estimated_duration_s: u64,
    pub target_s: u64,
    pub overlap_s: u64,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Estimate duration in seconds from file size.
pub fn estimated_duration_secs(size_bytes: u64) -> u64 {
    size_bytes * 60 / BYTES_PER_ESTIMATED_MINUTE
}

/// Partition `[0, estimated_duration_s)` into windows of `target_s` seconds.
///
/// Non-terminal chunks extend their end by `overlap_s` of read-only context;
/// the following chunk's start is unaffected. The final chunk is truncated to
/// the estimate. An estimate at or below the target yields a single chunk.
pub fn plan(estimated_duration_s: u64, target_s: u64, overlap_s: u64) -> ChunkPlan {
    let target_s = target_s.max(1);
    let mut chunks = Vec::new();

    if estimated_duration_s <= target_s {
        chunks.push(Chunk {
            index: 0,
            start_s: 0,
            end_s: estimated_duration_s,
            duration_s: estimated_duration_s,
        });
        return ChunkPlan {
            chunks,
            estimated_duration_s,
            target_s,
            overlap_s,
        };
    }

    let count = estimated_duration_s.div_ceil(target_s);
    for index in 0..count {
        let start_s = index * target_s;
        let terminal = index == count - 1;
        let end_s = if terminal {
            estimated_duration_s
        } else {
            start_s + target_s + overlap_s
        };
        chunks.push(Chunk {
            index: index as usize,
            start_s,
            end_s,
            duration_s: end_s - start_s,
        });
    }

    ChunkPlan {
        chunks,
        estimated_duration_s,
        target_s,
        overlap_s,
    }
}

/// Plan directly from a file size.
pub fn plan_for_size(size_bytes: u64, target_s: u64, overlap_s: u64) -> ChunkPlan {
    plan(estimated_duration_secs(size_bytes), target_s, overlap_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn estimate_tracks_sixteen_mb_per_minute() {
        assert_eq!(estimated_duration_secs(16 * MB), 60);
        assert_eq!(estimated_duration_secs(160 * MB), 600);
        assert_eq!(estimated_duration_secs(350 * MB), 1312);
        assert_eq!(estimated_duration_secs(0), 0);
    }

    #[test]
    fn short_video_is_a_single_chunk() {
        let plan = plan(900, 1200, 5);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].start_s, 0);
        assert_eq!(plan.chunks[0].end_s, 900);
        assert_eq!(plan.chunks[0].duration_s, 900);
    }

    #[test]
    fn exact_multiple_stays_at_target_count() {
        let plan = plan(2400, 1200, 0);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks[1].start_s, 1200);
        assert_eq!(plan.chunks[1].end_s, 2400);
    }

    #[test]
    fn chunk_count_matches_ceiling_and_partition_is_gapless() {
        for (estimated, target) in [(1312u64, 1200u64), (2625, 1200), (7000, 1200), (1201, 1200)] {
            let plan = plan(estimated, target, 5);
            assert_eq!(plan.len() as u64, estimated.div_ceil(target));

            // Without overlap the starts partition the estimate exactly
            let mut covered = 0;
            for pair in plan.chunks.windows(2) {
                assert_eq!(pair[1].start_s, pair[0].start_s + target);
                covered += pair[1].start_s - pair[0].start_s;
            }
            covered += estimated - plan.chunks.last().unwrap().start_s;
            assert_eq!(covered, estimated);
        }
    }

    #[test]
    fn overlap_extends_only_non_terminal_chunks() {
        let plan = plan(2625, 1200, 5);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.chunks[0].end_s, 1205);
        assert_eq!(plan.chunks[1].start_s, 1200);
        assert_eq!(plan.chunks[1].end_s, 2405);
        assert_eq!(plan.chunks[2].start_s, 2400);
        assert_eq!(plan.chunks[2].end_s, 2625);
        assert_eq!(plan.chunks[2].duration_s, 225);
    }

    #[test]
    fn indexes_are_dense_and_zero_based() {
        let plan = plan(7000, 1200, 5);
        for (expected, chunk) in plan.chunks.iter().enumerate() {
            assert_eq!(chunk.index, expected);
        }
    }

    #[test]
    fn serde_round_trip_preserves_plan() {
        let original = plan_for_size(350 * MB, 1200, 5);
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: ChunkPlan = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn window_label_is_absolute() {
        let plan = plan(2625, 1200, 5);
        assert_eq!(plan.chunks[1].window_label(), "00:20:00 - 00:40:05");
    }
}
