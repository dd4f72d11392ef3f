//! Cross-pattern loops: resolving a loop definition into playable steps

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pattern::{Pattern, PatternId};

/// User-selected loop spanning one or more saved patterns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossPatternLoop {
    pub start_pattern_name: String,
    pub start_bar: u32,
    pub end_pattern_name: String,
    pub end_bar: u32,
}

/// Where a step's pattern data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSource {
    /// The unsaved pattern being edited
    Draft,
    /// A catalog entry played as last saved
    Saved(PatternId),
    /// The live, possibly unsaved, edit of a catalog entry
    UnsavedEditOf(PatternId),
}

/// A contiguous bar range of one pattern within the loop
#[derive(Debug, Clone)]
pub struct PlayStep {
    pub pattern_name: String,
    pub pattern: Arc<Pattern>,
    pub source: PatternSource,
    pub start_bar: u32,
    pub end_bar: u32,
    /// Summed length of the full patterns of all earlier steps
    pub timeline_offset_secs: f64,
    pub timeline_offset_subdivisions: u32,
}

impl PlayStep {
    pub fn start_subdivision(&self) -> u32 {
        self.start_bar * self.pattern.subdivisions_per_bar()
    }

    /// Exclusive end of the step
    pub fn end_subdivision(&self) -> u32 {
        (self.end_bar + 1) * self.pattern.subdivisions_per_bar()
    }

    pub fn contains(&self, subdivision: u32) -> bool {
        (self.start_subdivision()..self.end_subdivision()).contains(&subdivision)
    }
}

struct CatalogEntry {
    name: String,
    pattern: Arc<Pattern>,
    source: PatternSource,
}

/// Resolve the playback loop into steps.
///
/// Without a loop (or when the loop can't be resolved) the result is one
/// step over the whole current pattern. The result is never empty.
pub fn build_steps(
    current: &Arc<Pattern>,
    saved: &[Arc<Pattern>],
    loop_range: Option<&CrossPatternLoop>,
    is_draft_mode: bool,
) -> Vec<PlayStep> {
    let Some(loop_range) = loop_range else {
        return single_step(current, is_draft_mode);
    };

    let catalog = build_catalog(current, saved, is_draft_mode);

    let start = catalog.iter().position(|e| e.name == loop_range.start_pattern_name);
    let end = catalog.iter().position(|e| e.name == loop_range.end_pattern_name);
    let (Some(start), Some(end)) = (start, end) else {
        warn!(
            start = %loop_range.start_pattern_name,
            end = %loop_range.end_pattern_name,
            "Loop references an unknown pattern, playing current pattern only"
        );
        return single_step(current, is_draft_mode);
    };

    if start > end {
        warn!(start, end, "Loop start pattern sorts after its end, playing current pattern only");
        return single_step(current, is_draft_mode);
    }

    let mut steps = Vec::with_capacity(end - start + 1);
    let mut offset_secs = 0.0;
    let mut offset_subdivisions = 0;

    for (idx, entry) in catalog.iter().enumerate().take(end + 1).skip(start) {
        let last_bar = entry.pattern.bars - 1;
        let start_bar = if idx == start { loop_range.start_bar.min(last_bar) } else { 0 };
        let end_bar = if idx == end { loop_range.end_bar.min(last_bar) } else { last_bar };

        steps.push(PlayStep {
            pattern_name: entry.name.clone(),
            pattern: entry.pattern.clone(),
            source: entry.source,
            start_bar,
            end_bar,
            timeline_offset_secs: offset_secs,
            timeline_offset_subdivisions: offset_subdivisions,
        });

        offset_secs += entry.pattern.duration_secs();
        offset_subdivisions += entry.pattern.total_subdivisions();
    }

    if steps.len() == 1 && steps[0].start_bar > steps[0].end_bar {
        warn!(
            start_bar = steps[0].start_bar,
            end_bar = steps[0].end_bar,
            "Loop range is reversed, playing current pattern only"
        );
        return single_step(current, is_draft_mode);
    }

    steps
}

fn single_step(current: &Arc<Pattern>, is_draft_mode: bool) -> Vec<PlayStep> {
    let (pattern_name, source) = if is_draft_mode {
        (String::new(), PatternSource::Draft)
    } else {
        (current.name.clone(), PatternSource::UnsavedEditOf(current.id))
    };

    vec![PlayStep {
        pattern_name,
        pattern: current.clone(),
        source,
        start_bar: 0,
        end_bar: current.bars - 1,
        timeline_offset_secs: 0.0,
        timeline_offset_subdivisions: 0,
    }]
}

fn build_catalog(current: &Arc<Pattern>, saved: &[Arc<Pattern>], is_draft_mode: bool) -> Vec<CatalogEntry> {
    let mut sorted: Vec<&Arc<Pattern>> = saved.iter().collect();
    sorted.sort_by(|a, b| collate(&a.name, &b.name));

    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            // Lookup takes the first match in catalog order
            warn!(name = %pair[0].name, "Duplicate pattern name in loop catalog");
        }
    }

    let mut catalog = Vec::with_capacity(sorted.len() + 1);

    if is_draft_mode {
        catalog.push(CatalogEntry {
            name: String::new(),
            pattern: current.clone(),
            source: PatternSource::Draft,
        });
    }

    for pattern in sorted {
        let is_live_edit = !is_draft_mode && pattern.id == current.id && pattern.name == current.name;
        let entry = if is_live_edit {
            CatalogEntry {
                name: pattern.name.clone(),
                pattern: current.clone(),
                source: PatternSource::UnsavedEditOf(pattern.id),
            }
        } else {
            CatalogEntry {
                name: pattern.name.clone(),
                pattern: pattern.clone(),
                source: PatternSource::Saved(pattern.id),
            }
        };
        catalog.push(entry);
    }

    catalog
}

/// Case-folded order, byte order as tie-break
fn collate(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
