//! Error types for backbeat

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BackbeatError {
    #[error("Invalid tempo: {0} BPM")]
    InvalidTempo(f64),
    #[error("Invalid time signature: {0}/{1}")]
    InvalidTimeSignature(u8, u8),
    #[error("Pattern must have at least one bar")]
    NoBars,
    #[error("Bar {bar} out of range (pattern has {bars} bars)")]
    BarOutOfRange { bar: u32, bars: u32 },
}

pub type Result<T> = std::result::Result<T, BackbeatError>;
