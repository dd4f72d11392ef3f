//! Drum sound dispatch: grid cells to timed triggers

use backbeat_core::{Instrument, Pattern};
use tracing::trace;

/// Sound source for the drum rows.
///
/// `time` is on the audio clock's timeline; the kit must start the hit at
/// that time even if it is already in the past by a few milliseconds.
pub trait DrumKit: Send {
    fn trigger(&mut self, instrument: Instrument, time: f64, gain: f32);
}

/// Trigger every active cell at `subdivision`. Returns the number of hits.
pub fn dispatch(kit: &mut dyn DrumKit, pattern: &Pattern, subdivision: u32, time: f64) -> usize {
    let mut hits = 0;
    for (instrument, state) in pattern.active_cells(subdivision) {
        kit.trigger(instrument, time, state.gain());
        hits += 1;
    }
    if hits > 0 {
        trace!(subdivision, time, hits, "Dispatched hits");
    }
    hits
}
