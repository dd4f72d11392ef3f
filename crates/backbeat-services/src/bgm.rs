//! Background track synchronization
//!
//! The BGM runs on its own clock at its own rate. Instead of nudging it
//! continuously, it is re-anchored to the pattern timeline at a handful of
//! discontinuities (play, source change, loop wrap, offset change) and left
//! free-running in between.

use std::sync::Arc;

use backbeat_core::timing::elapsed_seconds;
use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::clock::AudioClock;
use crate::config::BgmConfig;
use crate::scheduler::PositionSnapshot;

/// Keeps clamped offsets inside the buffer and start times strictly ordered
pub const ANCHOR_EPSILON: f64 = 0.001;

/// Decoded mono track
#[derive(Debug, Clone)]
pub struct BgmBuffer {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl BgmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Output voice for the background track
pub trait BgmPlayer: Send {
    fn load(&mut self, buffer: BgmBuffer);
    /// Play from `buffer_offset` seconds into the buffer starting at clock
    /// time `when`. Whatever is already playing continues until then, so a
    /// re-anchor sent ahead of time switches over without a gap.
    fn start(&mut self, when: f64, buffer_offset: f64);
    fn stop(&mut self);
    fn set_playback_rate(&mut self, rate: f64);
    fn set_volume(&mut self, volume: f32);
    fn buffer_duration(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub when: f64,
    pub buffer_offset: f64,
}

/// Where the track must start so that `position` (pattern seconds) lines up
/// with clock time `base`
pub fn compute_anchor(position: f64, offset_secs: f64, rate: f64, buffer_duration: f64, base: f64) -> Anchor {
    let adjusted = position - offset_secs;
    let (delay, buffer_offset) = if adjusted < 0.0 {
        (-adjusted, 0.0)
    } else {
        (0.0, adjusted / rate)
    };
    let max_offset = (buffer_duration - ANCHOR_EPSILON).max(0.0);

    Anchor {
        when: base + delay,
        buffer_offset: buffer_offset.clamp(0.0, max_offset),
    }
}

/// Real seconds from bar 0 of the first step to the snapshot's subdivision
pub fn playback_position(snapshot: &PositionSnapshot) -> f64 {
    snapshot.step_offset_secs + elapsed_seconds(&snapshot.pattern, snapshot.subdivision)
}

#[derive(Debug, Clone)]
pub enum BgmCommand {
    Position(PositionSnapshot),
    Playing(bool),
    Source(Option<BgmBuffer>),
    OffsetMs(f64),
    Rate(f64),
    Volume(f32),
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    position: f64,
    play_time: f64,
    timeline_subdivision: u32,
}

pub struct BgmSynchronizer {
    player: Box<dyn BgmPlayer>,
    clock: Arc<dyn AudioClock>,
    has_source: bool,
    offset_ms: f64,
    rate: f64,
    playing: bool,
    /// Re-anchor on the next snapshot
    armed: bool,
    started: bool,
    last: Option<Observed>,
    last_start: Option<f64>,
}

impl BgmSynchronizer {
    pub fn new(mut player: Box<dyn BgmPlayer>, clock: Arc<dyn AudioClock>, config: &BgmConfig) -> Self {
        player.set_playback_rate(config.playback_rate);
        player.set_volume(config.volume);
        Self {
            player,
            clock,
            has_source: false,
            offset_ms: config.offset_ms,
            rate: config.playback_rate,
            playing: false,
            armed: false,
            started: false,
            last: None,
            last_start: None,
        }
    }

    /// Process commands until every sender is gone
    pub fn run(mut self, rx: Receiver<BgmCommand>) {
        while let Ok(command) = rx.recv() {
            self.handle(command);
        }
        self.halt_player();
    }

    pub fn handle(&mut self, command: BgmCommand) {
        match command {
            BgmCommand::Position(snapshot) => self.observe(&snapshot),
            BgmCommand::Playing(true) => {
                self.playing = true;
                self.armed = true;
                self.last = None;
            }
            BgmCommand::Playing(false) => {
                self.playing = false;
                self.armed = false;
                self.halt_player();
            }
            BgmCommand::Source(buffer) => {
                self.halt_player();
                match buffer {
                    Some(buffer) => {
                        info!(duration = buffer.duration_secs(), "BGM source loaded");
                        self.player.load(buffer);
                        self.has_source = true;
                        if self.playing {
                            self.reanchor_now();
                        }
                    }
                    None => self.has_source = false,
                }
            }
            BgmCommand::OffsetMs(offset_ms) => {
                self.offset_ms = offset_ms;
                if self.playing {
                    self.reanchor_now();
                }
            }
            BgmCommand::Rate(rate) => {
                if rate.is_finite() && rate > 0.0 {
                    self.rate = rate;
                    self.player.set_playback_rate(rate);
                }
            }
            BgmCommand::Volume(volume) => self.player.set_volume(volume),
        }
    }

    fn observe(&mut self, snapshot: &PositionSnapshot) {
        if !self.playing {
            return;
        }

        let position = playback_position(snapshot);
        let wrapped = self
            .last
            .is_some_and(|last| snapshot.timeline_subdivision < last.timeline_subdivision);
        self.last = Some(Observed {
            position,
            play_time: snapshot.play_time,
            timeline_subdivision: snapshot.timeline_subdivision,
        });

        if self.armed || wrapped {
            if wrapped {
                debug!(position, "Loop wrapped, re-anchoring BGM");
            }
            self.armed = !self.reanchor(position, snapshot.play_time);
        }
    }

    /// Re-anchor from the last snapshot, carried forward to the present.
    /// Without one the next snapshot does it.
    fn reanchor_now(&mut self) {
        let Some(last) = self.last else {
            self.armed = true;
            return;
        };
        let base = self.clock.current_time().max(last.play_time);
        let position = last.position + (base - last.play_time);
        self.armed = !self.reanchor(position, base);
    }

    /// Returns false when there is nothing to play yet
    fn reanchor(&mut self, position: f64, base: f64) -> bool {
        if !self.has_source {
            return false;
        }
        let Some(duration) = self.player.buffer_duration() else {
            return false;
        };

        let anchor = compute_anchor(position, self.offset_ms / 1000.0, self.rate, duration, base);
        let when = match self.last_start {
            Some(previous) if anchor.when <= previous => previous + ANCHOR_EPSILON,
            _ => anchor.when,
        };

        self.player.start(when, anchor.buffer_offset);
        self.started = true;
        self.last_start = Some(when);

        debug!(position, when, buffer_offset = anchor.buffer_offset, rate = self.rate, "BGM re-anchored");
        true
    }

    fn halt_player(&mut self) {
        if self.started {
            self.player.stop();
            self.started = false;
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum PlayerCall {
        Load(f64),
        Start { when: f64, buffer_offset: f64 },
        Stop,
        Rate(f64),
        Volume(f32),
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingPlayer {
        pub calls: Arc<Mutex<Vec<PlayerCall>>>,
        duration: Arc<Mutex<Option<f64>>>,
    }

    impl RecordingPlayer {
        pub(crate) fn take(&self) -> Vec<PlayerCall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        pub(crate) fn starts(&self) -> Vec<(f64, f64)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    PlayerCall::Start { when, buffer_offset } => Some((*when, *buffer_offset)),
                    _ => None,
                })
                .collect()
        }
    }

    impl BgmPlayer for RecordingPlayer {
        fn load(&mut self, buffer: BgmBuffer) {
            let duration = buffer.duration_secs();
            *self.duration.lock().unwrap() = Some(duration);
            self.calls.lock().unwrap().push(PlayerCall::Load(duration));
        }

        fn start(&mut self, when: f64, buffer_offset: f64) {
            self.calls.lock().unwrap().push(PlayerCall::Start { when, buffer_offset });
        }

        fn stop(&mut self) {
            self.calls.lock().unwrap().push(PlayerCall::Stop);
        }

        fn set_playback_rate(&mut self, rate: f64) {
            self.calls.lock().unwrap().push(PlayerCall::Rate(rate));
        }

        fn set_volume(&mut self, volume: f32) {
            self.calls.lock().unwrap().push(PlayerCall::Volume(volume));
        }

        fn buffer_duration(&self) -> Option<f64> {
            *self.duration.lock().unwrap()
        }
    }
}
