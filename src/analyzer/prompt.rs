//! Prompt construction for chunk-scoped generate calls.

use crate::planner::Chunk;

/// Base instruction shared by every chunk call.
///
/// Timestamps are requested RELATIVE to the chunk start; the merger shifts
/// them to absolute time afterwards. The absolute window is included only as
/// context so the model can reference it in prose.
const ANALYSIS_INSTRUCTIONS: &str = r#"You are an expert video editor and educator. Analyze this video segment and produce a structured breakdown.

Return ONLY a JSON object, no surrounding prose and no Markdown fence, with these fields:
- "clean_script": the spoken content as a cleaned transcript, with filler words, false starts and repeated sentences removed
- "chapters": array of {"title", "start_time", "end_time", "description"} covering the segment
- "summary": 2-4 sentence summary of the segment
- "concepts": array of key concepts or terms introduced
- "practice": array of exercises or action items a viewer could try
- "content_metadata": {
    "original_duration_estimate": length of the footage you actually saw,
    "essential_content_duration": length of the content worth keeping,
    "removed_percentage": number 0-100, share of the footage that is filler,
    "filtered_categories": array of {"category", "duration", "description"} for the filler you excluded,
    "main_content_timestamps": array of {"start", "end"} ranges worth keeping
  }

All timestamps MUST be relative to the start of THIS segment, beginning at 00:00, in MM:SS or HH:MM:SS form. If the segment contains no footage (it may lie past the end of the video), return the same JSON shape with empty strings and arrays."#;

/// Build the prompt for one chunk.
pub fn chunk_prompt(chunk: &Chunk, total_chunks: usize) -> String {
    format!(
        "{ANALYSIS_INSTRUCTIONS}\n\nThis is segment {part} of {total}, covering {window} of the full recording. Describe only what you see in this segment.",
        part = chunk.index + 1,
        total = total_chunks,
        window = chunk.window_label(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;

    #[test]
    fn prompt_names_the_absolute_window() {
        let plan = planner::plan(2625, 1200, 5);
        let prompt = chunk_prompt(&plan.chunks[1], plan.len());
        assert!(prompt.contains("segment 2 of 3"));
        assert!(prompt.contains("00:20:00 - 00:40:05"));
        assert!(prompt.contains("relative to the start of THIS segment"));
    }
}
