//! Chunk analysis document model.
//!
//! This is the JSON shape the Analysis Service is prompted to return for one
//! chunk. Every field is defaulted: the model omits sections freely when a
//! chunk lands past the real end of the video.

use crate::analyzer::repair;
use crate::planner::Chunk;
use crate::timecode::format_timestamp;
use serde::{Deserialize, Serialize};

/// One chunk's analysis, with timestamps relative to the chunk start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkAnalysis {
    #[serde(default)]
    pub clean_script: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub practice: Vec<String>,
    #[serde(default)]
    pub content_metadata: ContentMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default)]
    pub original_duration_estimate: String,
    #[serde(default)]
    pub essential_content_duration: String,
    #[serde(default)]
    pub removed_percentage: f64,
    #[serde(default)]
    pub filtered_categories: Vec<FilteredCategory>,
    #[serde(default)]
    pub main_content_timestamps: Vec<TimeRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilteredCategory {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

/// Scheduler output for one chunk; `analysis` timestamps stay relative
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub chunk_start_offset_s: u64,
    pub analysis: ChunkAnalysis,
}

impl ChunkAnalysis {
    /// Parse model output: strip a surrounding code fence, parse, and on
    /// failure run one bracket-balance repair pass before giving up.
    pub fn from_model_text(raw: &str) -> Result<Self, serde_json::Error> {
        let stripped = repair::strip_code_fence(raw);
        match serde_json::from_str(stripped) {
            Ok(analysis) => Ok(analysis),
            Err(err) => match repair::repair_json(stripped) {
                Some(repaired) => serde_json::from_str(&repaired),
                None => Err(err),
            },
        }
    }

    /// Minimally-valid analysis substituted for a failed chunk.
    ///
    /// Keeps index density and merger invariants: one chapter spanning the
    /// chunk window, empty aggregates, and a script line naming the gap.
    pub fn placeholder(chunk: &Chunk, reason: &str) -> Self {
        let start = format_timestamp(chunk.start_s);
        let end = format_timestamp(chunk.end_s);
        Self {
            clean_script: format!("[Content from {start} to {end} - {reason}]"),
            chapters: vec![Chapter {
                title: "Analysis failed for this section".to_string(),
                start_time: "00:00".to_string(),
                end_time: format_timestamp(chunk.duration_s),
                description: reason.to_string(),
            }],
            summary: format!("Section {start} to {end} could not be analyzed: {reason}"),
            ..Default::default()
        }
    }
}
