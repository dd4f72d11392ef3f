//! Drum grid patterns

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackbeatError, Result};
use crate::timing;

/// Grid resolution: sixteenth notes when the beat unit is a quarter
pub const SUBDIVISIONS_PER_BEAT: u32 = 4;

/// Gain applied to ghost notes
pub const GHOST_GAIN: f32 = 0.3;

/// Stable identity of a pattern, shared by the saved copy and its live edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub u64);

/// Time signature (beats per bar / beat unit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub beats_per_bar: u8,
    pub beat_unit: u8,
}

impl TimeSignature {
    pub fn new(beats_per_bar: u8, beat_unit: u8) -> Result<Self> {
        if beats_per_bar == 0 || !beat_unit.is_power_of_two() {
            return Err(BackbeatError::InvalidTimeSignature(beats_per_bar, beat_unit));
        }
        Ok(Self { beats_per_bar, beat_unit })
    }

    pub const fn four_four() -> Self {
        Self { beats_per_bar: 4, beat_unit: 4 }
    }

    /// Beat length relative to a quarter note (6/8 -> 0.5)
    pub fn beat_duration_multiplier(&self) -> f64 {
        4.0 / self.beat_unit as f64
    }

    pub fn subdivisions_per_bar(&self) -> u32 {
        self.beats_per_bar as u32 * SUBDIVISIONS_PER_BEAT
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::four_four()
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.beats_per_bar, self.beat_unit)
    }
}

/// Drum kit rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instrument {
    Kick,
    Snare,
    ClosedHat,
    OpenHat,
    HighTom,
    MidTom,
    FloorTom,
    Crash,
    Ride,
}

impl Instrument {
    pub const ALL: [Instrument; 9] = [
        Self::Kick,
        Self::Snare,
        Self::ClosedHat,
        Self::OpenHat,
        Self::HighTom,
        Self::MidTom,
        Self::FloorTom,
        Self::Crash,
        Self::Ride,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Kick => "Kick",
            Self::Snare => "Snare",
            Self::ClosedHat => "Closed Hat",
            Self::OpenHat => "Open Hat",
            Self::HighTom => "High Tom",
            Self::MidTom => "Mid Tom",
            Self::FloorTom => "Floor Tom",
            Self::Crash => "Crash",
            Self::Ride => "Ride",
        }
    }
}

/// State of a single grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CellState {
    #[default]
    Off,
    On,
    Accent,
    Ghost,
}

impl CellState {
    pub fn is_active(&self) -> bool {
        !matches!(self, CellState::Off)
    }

    /// Trigger gain for this state
    pub fn gain(&self) -> f32 {
        match self {
            CellState::Off => 0.0,
            CellState::Ghost => GHOST_GAIN,
            CellState::On | CellState::Accent => 1.0,
        }
    }
}

/// A drum grid: one row of cells per instrument, one cell per subdivision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    /// Empty for an unsaved draft
    #[serde(default)]
    pub name: String,
    pub bpm: f64,
    #[serde(default)]
    pub time_signature: TimeSignature,
    pub bars: u32,
    #[serde(default)]
    pub grid: BTreeMap<Instrument, Vec<CellState>>,
    /// Sparse per-bar tempo changes (bar index -> bpm)
    #[serde(default)]
    pub bar_bpm_overrides: BTreeMap<u32, f64>,
}

impl Pattern {
    pub fn new(id: PatternId, bpm: f64, time_signature: TimeSignature, bars: u32) -> Result<Self> {
        validate_bpm(bpm)?;
        if bars == 0 {
            return Err(BackbeatError::NoBars);
        }
        Ok(Self {
            id,
            name: String::new(),
            bpm,
            time_signature,
            bars,
            grid: BTreeMap::new(),
            bar_bpm_overrides: BTreeMap::new(),
        })
    }

    /// Check what `new` and `set_bar_bpm` enforce. Deserialized patterns
    /// bypass both.
    pub fn validate(&self) -> Result<()> {
        let ts = self.time_signature;
        TimeSignature::new(ts.beats_per_bar, ts.beat_unit)?;
        validate_bpm(self.bpm)?;
        if self.bars == 0 {
            return Err(BackbeatError::NoBars);
        }
        for (&bar, &bpm) in &self.bar_bpm_overrides {
            validate_bpm(bpm)?;
            if bar >= self.bars {
                return Err(BackbeatError::BarOutOfRange { bar, bars: self.bars });
            }
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn subdivisions_per_bar(&self) -> u32 {
        self.time_signature.subdivisions_per_bar()
    }

    pub fn total_subdivisions(&self) -> u32 {
        self.bars * self.subdivisions_per_bar()
    }

    /// Bar containing the given subdivision
    pub fn bar_of(&self, subdivision: u32) -> u32 {
        subdivision / self.subdivisions_per_bar()
    }

    pub fn cell(&self, instrument: Instrument, subdivision: u32) -> CellState {
        self.grid
            .get(&instrument)
            .and_then(|row| row.get(subdivision as usize))
            .copied()
            .unwrap_or_default()
    }

    /// Set a cell, growing the instrument row to the pattern length if needed
    pub fn set_cell(&mut self, instrument: Instrument, subdivision: u32, state: CellState) {
        let len = self.total_subdivisions().max(subdivision + 1) as usize;
        let row = self.grid.entry(instrument).or_default();
        if row.len() < len {
            row.resize(len, CellState::Off);
        }
        row[subdivision as usize] = state;
    }

    /// Instruments with an active cell at this subdivision
    pub fn active_cells(&self, subdivision: u32) -> impl Iterator<Item = (Instrument, CellState)> + '_ {
        self.grid.iter().filter_map(move |(&instrument, row)| {
            let state = row.get(subdivision as usize).copied()?;
            state.is_active().then_some((instrument, state))
        })
    }

    pub fn set_bar_bpm(&mut self, bar: u32, bpm: f64) -> Result<()> {
        validate_bpm(bpm)?;
        if bar >= self.bars {
            return Err(BackbeatError::BarOutOfRange { bar, bars: self.bars });
        }
        self.bar_bpm_overrides.insert(bar, bpm);
        Ok(())
    }

    pub fn clear_bar_bpm(&mut self, bar: u32) {
        self.bar_bpm_overrides.remove(&bar);
    }

    /// Effective tempo of a bar (override or pattern tempo)
    pub fn bpm_at_bar(&self, bar: u32) -> f64 {
        self.bar_bpm_overrides.get(&bar).copied().unwrap_or(self.bpm)
    }

    /// Duration of the subdivision at this index, honoring bar overrides
    pub fn subdivision_duration_at(&self, subdivision: u32) -> f64 {
        timing::subdivision_duration(self.bpm_at_bar(self.bar_of(subdivision)), &self.time_signature)
    }

    /// Length of the whole pattern in seconds
    pub fn duration_secs(&self) -> f64 {
        timing::elapsed_seconds(self, self.total_subdivisions())
    }
}

fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(BackbeatError::InvalidTempo(bpm))
    }
}
