//! Pattern files: a single pattern or a saved library with a loop

use std::path::Path;

use anyhow::{Context, Result};
use backbeat_core::{CellState, CrossPatternLoop, Instrument, Pattern, PatternId, TimeSignature};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct Library {
    pub patterns: Vec<Pattern>,
    /// Name of the pattern being edited; first pattern when absent
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default, rename = "loop")]
    pub loop_range: Option<CrossPatternLoop>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatternFile {
    Library(Library),
    Single(Pattern),
}

/// What the player needs to start
#[derive(Debug)]
pub(crate) struct Session {
    pub current: Pattern,
    pub saved: Vec<Pattern>,
    pub loop_range: Option<CrossPatternLoop>,
    pub is_draft: bool,
}

impl Session {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let file: PatternFile = serde_json::from_str(text)?;

        match file {
            PatternFile::Single(pattern) => {
                pattern.validate()?;
                let is_draft = pattern.name.is_empty();
                Ok(Self {
                    current: pattern,
                    saved: Vec::new(),
                    loop_range: None,
                    is_draft,
                })
            }
            PatternFile::Library(library) => {
                for pattern in &library.patterns {
                    pattern.validate().with_context(|| format!("pattern {:?}", pattern.name))?;
                }
                let current = match &library.current {
                    Some(name) => library
                        .patterns
                        .iter()
                        .find(|p| &p.name == name)
                        .with_context(|| format!("no pattern named {:?}", name))?,
                    None => library.patterns.first().context("library has no patterns")?,
                }
                .clone();

                Ok(Self {
                    current,
                    saved: library.patterns,
                    loop_range: library.loop_range,
                    is_draft: false,
                })
            }
        }
    }

    /// One-bar rock beat with a ghosted snare, played as a draft
    pub(crate) fn builtin() -> Result<Self> {
        let mut pattern = Pattern::new(PatternId(0), 100.0, TimeSignature::four_four(), 1)?;

        for sub in (0..16).step_by(2) {
            pattern.set_cell(Instrument::ClosedHat, sub, CellState::On);
        }
        pattern.set_cell(Instrument::ClosedHat, 0, CellState::Accent);
        for sub in [0, 6, 10] {
            pattern.set_cell(Instrument::Kick, sub, CellState::On);
        }
        pattern.set_cell(Instrument::Snare, 4, CellState::Accent);
        pattern.set_cell(Instrument::Snare, 12, CellState::Accent);
        pattern.set_cell(Instrument::Snare, 15, CellState::Ghost);
        pattern.set_cell(Instrument::Crash, 0, CellState::On);

        Ok(Self {
            current: pattern,
            saved: Vec::new(),
            loop_range: None,
            is_draft: true,
        })
    }
}
