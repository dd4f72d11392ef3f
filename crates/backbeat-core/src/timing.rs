//! Tempo math shared by the scheduler and the BGM synchronizer

use crate::pattern::{Pattern, TimeSignature, SUBDIVISIONS_PER_BEAT};

/// Seconds per subdivision: `60/bpm * 4/beat_unit / 4`
pub fn subdivision_duration(bpm: f64, time_signature: &TimeSignature) -> f64 {
    60.0 / bpm * time_signature.beat_duration_multiplier() / SUBDIVISIONS_PER_BEAT as f64
}

pub fn bar_duration(bpm: f64, time_signature: &TimeSignature) -> f64 {
    subdivision_duration(bpm, time_signature) * time_signature.subdivisions_per_bar() as f64
}

/// Real time from bar 0 to the start of `subdivision`.
///
/// Every full bar is summed at its own tempo so bar overrides shift
/// everything after them.
pub fn elapsed_seconds(pattern: &Pattern, subdivision: u32) -> f64 {
    let ts = &pattern.time_signature;
    let per_bar = ts.subdivisions_per_bar();
    let bar = subdivision / per_bar;
    let within = subdivision % per_bar;

    let full_bars: f64 = (0..bar)
        .map(|b| bar_duration(pattern.bpm_at_bar(b), ts))
        .sum();

    full_bars + within as f64 * subdivision_duration(pattern.bpm_at_bar(bar), ts)
}

pub fn bar_start_seconds(pattern: &Pattern, bar: u32) -> f64 {
    elapsed_seconds(pattern, bar * pattern.subdivisions_per_bar())
}
