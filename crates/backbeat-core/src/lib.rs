//! backbeat-core: Domain types for the backbeat pattern player

mod error;
pub mod loop_steps;
pub mod pattern;
pub mod timing;
mod transport;

pub use error::{BackbeatError, Result};
pub use loop_steps::{build_steps, CrossPatternLoop, PatternSource, PlayStep};
pub use pattern::{
    CellState, Instrument, Pattern, PatternId, TimeSignature, GHOST_GAIN, SUBDIVISIONS_PER_BEAT,
};
pub use transport::TransportState;
