//! Engine tuning, deserializable from the app's config file

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How far ahead of the audio clock hits are scheduled
    pub lookahead_secs: f64,
    /// Timer period between scheduler ticks
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 0.1,
            tick_interval_ms: 25,
        }
    }
}

/// Initial background track settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BgmConfig {
    /// Track position that lines up with pattern time zero
    pub offset_ms: f64,
    pub volume: f32,
    pub playback_rate: f64,
}

impl Default for BgmConfig {
    fn default() -> Self {
        Self {
            offset_ms: 0.0,
            volume: 1.0,
            playback_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub bgm: BgmConfig,
    /// Display refresh period for deferred callbacks. `None` runs them as
    /// soon as their time arrives.
    pub frame_interval_ms: Option<u64>,
}

impl EngineConfig {
    /// Clamp out-of-range values instead of refusing to start
    pub fn sanitized(mut self) -> Self {
        if !(self.scheduler.lookahead_secs.is_finite() && self.scheduler.lookahead_secs > 0.0) {
            self.scheduler.lookahead_secs = SchedulerConfig::default().lookahead_secs;
        }
        self.scheduler.tick_interval_ms = self.scheduler.tick_interval_ms.clamp(1, 1000);
        if !(self.bgm.playback_rate.is_finite() && self.bgm.playback_rate > 0.0) {
            self.bgm.playback_rate = 1.0;
        }
        if !self.bgm.offset_ms.is_finite() {
            self.bgm.offset_ms = 0.0;
        }
        self.bgm.volume = if self.bgm.volume.is_finite() { self.bgm.volume.max(0.0) } else { 1.0 };
        self
    }
}
