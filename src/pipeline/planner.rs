use serde::{Deserialize, Serialize};

use crate::error::PlanningError;

/// One contiguous frame range of the input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub start_frame: u64,
    /// Exclusive
    pub end_frame: u64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    /// Starts at frame 0 or on a random-access point
    pub is_random_access_aligned: bool,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end_frame - self.start_frame
    }

    pub fn is_empty(&self) -> bool {
        self.end_frame == self.start_frame
    }
}

/// The ordered chunk list for one input
///
/// Chunks are contiguous and non-overlapping and cover `[0, total_frames)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkSpec>,
    pub total_frames: u64,
    pub fps: f64,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// (start, end) pairs, mostly for logging and tests
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.chunks.iter().map(|c| (c.start_frame, c.end_frame)).collect()
    }
}

/// Split `[0, total_frames)` into chunks of roughly `target_chunk_seconds`
///
/// Boundaries only ever land on random-access points so every chunk can be
/// decoded on its own. A boundary snaps back to the latest point at or before
/// the ideal position; when there is none after the chunk start, the chunk
/// stretches forward to the next point, or to the end of the input.
pub fn plan(
    total_frames: u64,
    fps: f64,
    target_chunk_seconds: f64,
    random_access_points: &[u64],
) -> Result<ChunkPlan, PlanningError> {
    if total_frames == 0 {
        return Err(PlanningError::EmptyInput);
    }
    if !fps.is_finite() || fps <= 0.0 {
        return Err(PlanningError::InvalidParameters {
            details: format!("fps must be positive and finite, got {}", fps),
        });
    }
    if !target_chunk_seconds.is_finite() || target_chunk_seconds <= 0.0 {
        return Err(PlanningError::InvalidParameters {
            details: format!(
                "target chunk duration must be positive and finite, got {}",
                target_chunk_seconds
            ),
        });
    }

    let target = ((target_chunk_seconds * fps).round() as u64).max(1);

    let mut points: Vec<u64> = random_access_points.to_vec();
    points.sort_unstable();
    points.dedup();

    let make = |index: usize, start: u64, end: u64, points: &[u64]| ChunkSpec {
        index,
        start_frame: start,
        end_frame: end,
        start_timestamp: start as f64 / fps,
        end_timestamp: end as f64 / fps,
        is_random_access_aligned: start == 0 || points.binary_search(&start).is_ok(),
    };

    if total_frames <= target {
        return Ok(ChunkPlan {
            chunks: vec![make(0, 0, total_frames, &points)],
            total_frames,
            fps,
        });
    }

    if points.is_empty() {
        return Err(PlanningError::NoRandomAccessPoints { total_frames });
    }

    let mut chunks = Vec::new();
    let mut start = 0u64;

    while start < total_frames {
        let ideal = start.saturating_add(target);

        let end = if ideal >= total_frames {
            total_frames
        } else {
            let before = points.iter().rev().find(|&&p| p > start && p <= ideal);
            let after = points.iter().find(|&&p| p > start);
            match (before, after) {
                (Some(&p), _) => p,
                (None, Some(&p)) => p,
                (None, None) => total_frames,
            }
        }
        .min(total_frames);

        chunks.push(make(chunks.len(), start, end, &points));
        start = end;
    }

    Ok(ChunkPlan {
        chunks,
        total_frames,
        fps,
    })
}
