//! Folds per-chunk analyses into one artifact with absolute timestamps.
//!
//! Chunk analyses arrive with timestamps relative to their own start. The
//! merger shifts chapters and content ranges by each chunk's absolute offset,
//! concatenates scripts and summaries with continuation markers, dedupes
//! concept lists, and aggregates the content metadata.

use crate::analyzer::{Chapter, ChunkResult, FilteredCategory, TimeRange};
use crate::timecode::{format_timestamp, parse_duration_secs, translate_timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Final merged output of one job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedArtifact {
    pub clean_script: String,
    pub chapters: Vec<Chapter>,
    pub summary: String,
    pub concepts: Vec<String>,
    pub practice: Vec<String>,
    pub content_metadata: MergedContentMetadata,
    pub processing_metadata: ProcessingMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedContentMetadata {
    /// Total original footage, `HH:MM:SS`
    pub original_duration: String,
    /// Total footage worth keeping, `HH:MM:SS`
    pub essential_content_duration: String,
    /// Rounded mean of the per-chunk removal percentages
    pub removed_percentage: u32,
    pub filtered_categories: Vec<FilteredCategory>,
    /// Keep-ranges in absolute time, input order preserved
    pub main_content_timestamps: Vec<TimeRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    pub model_id: String,
    pub analysis_elapsed_s: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trimmed_video: Option<String>,
}

/// Merge chunk results (already sorted by `chunk_index`) into one artifact.
///
/// Processing metadata is initialized with the chunk count only; the worker
/// fills in the run-level fields it owns.
pub fn merge(results: &[ChunkResult]) -> MergedArtifact {
    let mut script_parts: Vec<String> = Vec::with_capacity(results.len());
    let mut summary_parts: Vec<String> = Vec::with_capacity(results.len());
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut concepts: Vec<String> = Vec::new();
    let mut practice: Vec<String> = Vec::new();
    let mut seen_concepts: HashSet<String> = HashSet::new();
    let mut seen_practice: HashSet<String> = HashSet::new();

    let mut original_secs = 0u64;
    let mut essential_secs = 0u64;
    let mut removed_sum = 0.0f64;
    let mut categories: Vec<(String, u64, String)> = Vec::new();
    let mut main_content: Vec<TimeRange> = Vec::new();

    for result in results {
        let offset = result.chunk_start_offset_s;
        let offset_label = format_timestamp(offset);
        let analysis = &result.analysis;

        if result.chunk_index == 0 {
            script_parts.push(analysis.clean_script.clone());
        } else {
            script_parts.push(format!(
                "(continuing from {offset_label})\n\n{}",
                analysis.clean_script
            ));
        }

        summary_parts.push(format!(
            "Part {} ({offset_label} onwards)\n{}",
            result.chunk_index + 1,
            analysis.summary
        ));

        for chapter in &analysis.chapters {
            chapters.push(Chapter {
                title: chapter.title.clone(),
                start_time: translate_timestamp(&chapter.start_time, offset),
                end_time: translate_timestamp(&chapter.end_time, offset),
                description: chapter.description.clone(),
            });
        }

        dedup_into(&mut concepts, &mut seen_concepts, &analysis.concepts);
        dedup_into(&mut practice, &mut seen_practice, &analysis.practice);

        let meta = &analysis.content_metadata;
        original_secs += parse_duration_secs(&meta.original_duration_estimate);
        essential_secs += parse_duration_secs(&meta.essential_content_duration);
        removed_sum += meta.removed_percentage;

        for category in &meta.filtered_categories {
            let secs = parse_duration_secs(&category.duration);
            match categories
                .iter_mut()
                .find(|(name, _, _)| *name == category.category)
            {
                Some((_, total, _)) => *total += secs,
                None => categories.push((
                    category.category.clone(),
                    secs,
                    category.description.clone(),
                )),
            }
        }

        for range in &meta.main_content_timestamps {
            main_content.push(TimeRange {
                start: translate_timestamp(&range.start, offset),
                end: translate_timestamp(&range.end, offset),
            });
        }
    }

    let removed_percentage = if results.is_empty() {
        0
    } else {
        (removed_sum / results.len() as f64).round() as u32
    };

    debug!(
        target: "merger",
        chunks = results.len(),
        chapters = chapters.len(),
        concepts = concepts.len(),
        "Merged chunk analyses"
    );

    MergedArtifact {
        clean_script: script_parts.join("\n\n"),
        chapters,
        summary: summary_parts.join("\n\n"),
        concepts,
        practice,
        content_metadata: MergedContentMetadata {
            original_duration: format_timestamp(original_secs),
            essential_content_duration: format_timestamp(essential_secs),
            removed_percentage,
            filtered_categories: categories
                .into_iter()
                .map(|(category, secs, description)| FilteredCategory {
                    category,
                    duration: format_timestamp(secs),
                    description,
                })
                .collect(),
            main_content_timestamps: main_content,
        },
        processing_metadata: ProcessingMetadata {
            total_chunks: results.len(),
            ..Default::default()
        },
    }
}

/// Case-insensitive, trim-normalized first-occurrence-wins dedup.
fn dedup_into(out: &mut Vec<String>, seen: &mut HashSet<String>, items: &[String]) {
    for item in items {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
        }
    }
}
