//! cpal output backend: audio clock, drum kit and BGM voice on one stream
//!
//! The clock is the stream's own frame counter, so a hit scheduled for time
//! `t` lands on frame `t * sample_rate` no matter when the scheduler sent it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use backbeat_core::Instrument;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{error, info};

use crate::bgm::{BgmBuffer, BgmPlayer};
use crate::clock::{AudioClock, ClockError, ClockState};
use crate::dispatcher::DrumKit;
use crate::voice::DrumSynth;

#[derive(Debug, Error)]
pub enum AudioOutputError {
    #[error("No audio output devices found")]
    NoDevices,
    #[error("Failed to get default output config: {0}")]
    ConfigError(String),
    #[error("Failed to build output stream: {0}")]
    StreamError(String),
}

/// Frame counter advanced by the output callback while running
#[derive(Debug)]
pub struct OutputClock {
    frames: AtomicU64,
    sample_rate: AtomicU32,
    running: AtomicBool,
    failed: AtomicBool,
}

impl OutputClock {
    fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn frame_at(&self, time: f64) -> u64 {
        (time.max(0.0) * self.sample_rate() as f64).round() as u64
    }
}

impl AudioClock for OutputClock {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / self.sample_rate().max(1) as f64
    }

    fn state(&self) -> ClockState {
        if self.running.load(Ordering::Acquire) {
            ClockState::Running
        } else {
            ClockState::Suspended
        }
    }

    fn resume(&self) -> Result<(), ClockError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ClockError::ResumeFailed("output stream failed".into()));
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }
}

/// Hits a lookahead window can hold without reallocating
const PENDING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct ScheduledHit {
    instrument: Instrument,
    frame: u64,
    gain: f32,
}

#[derive(Debug)]
enum VoiceCommand {
    Load(BgmBuffer),
    Start { frame: u64, buffer_offset: f64 },
    Stop,
    Rate(f64),
    Volume(f32),
}

/// Kit that forwards hits to the output stream
#[derive(Clone)]
pub struct OutputKit {
    clock: Arc<OutputClock>,
    tx: Sender<ScheduledHit>,
}

impl DrumKit for OutputKit {
    fn trigger(&mut self, instrument: Instrument, time: f64, gain: f32) {
        let frame = self.clock.frame_at(time);
        let _ = self.tx.send(ScheduledHit { instrument, frame, gain });
    }
}

/// BGM voice rendered by the output stream
pub struct OutputBgmPlayer {
    clock: Arc<OutputClock>,
    tx: Sender<VoiceCommand>,
    duration: Option<f64>,
}

impl BgmPlayer for OutputBgmPlayer {
    fn load(&mut self, buffer: BgmBuffer) {
        self.duration = Some(buffer.duration_secs());
        let _ = self.tx.send(VoiceCommand::Load(buffer));
    }

    fn start(&mut self, when: f64, buffer_offset: f64) {
        let frame = self.clock.frame_at(when);
        let _ = self.tx.send(VoiceCommand::Start { frame, buffer_offset });
    }

    fn stop(&mut self) {
        let _ = self.tx.send(VoiceCommand::Stop);
    }

    fn set_playback_rate(&mut self, rate: f64) {
        let _ = self.tx.send(VoiceCommand::Rate(rate));
    }

    fn set_volume(&mut self, volume: f32) {
        let _ = self.tx.send(VoiceCommand::Volume(volume));
    }

    fn buffer_duration(&self) -> Option<f64> {
        self.duration
    }
}

/// Start that takes over from the current read position at `frame`
#[derive(Debug, Clone, Copy)]
struct Cue {
    frame: u64,
    position: f64,
}

#[derive(Debug)]
struct BgmVoice {
    buffer: Option<BgmBuffer>,
    start_frame: Option<u64>,
    /// Read position in buffer samples
    position: f64,
    cue: Option<Cue>,
    rate: f64,
    volume: f32,
}

impl BgmVoice {
    fn new() -> Self {
        Self {
            buffer: None,
            start_frame: None,
            position: 0.0,
            cue: None,
            rate: 1.0,
            volume: 1.0,
        }
    }

    fn stop(&mut self) {
        self.start_frame = None;
        self.cue = None;
    }

    fn render(&mut self, frame: u64, device_rate: f64) -> f32 {
        if let Some(cue) = self.cue.filter(|cue| frame >= cue.frame) {
            self.start_frame = Some(cue.frame);
            self.position = cue.position;
            self.cue = None;
        }

        let (Some(buffer), Some(start)) = (&self.buffer, self.start_frame) else {
            return 0.0;
        };
        if frame < start {
            return 0.0;
        }

        let idx = self.position as usize;
        let Some(&a) = buffer.samples.get(idx) else {
            self.start_frame = None;
            return 0.0;
        };
        let b = buffer.samples.get(idx + 1).copied().unwrap_or(a);
        let frac = (self.position - idx as f64) as f32;

        self.position += self.rate * buffer.sample_rate as f64 / device_rate;
        (a + (b - a) * frac) * self.volume
    }
}

/// Everything the output callback owns
struct Renderer {
    clock: Arc<OutputClock>,
    hits_rx: Receiver<ScheduledHit>,
    voice_rx: Receiver<VoiceCommand>,
    pending: Vec<ScheduledHit>,
    synth: DrumSynth,
    bgm: BgmVoice,
}

impl Renderer {
    fn new(clock: Arc<OutputClock>, hits_rx: Receiver<ScheduledHit>, voice_rx: Receiver<VoiceCommand>) -> Self {
        let synth = DrumSynth::new(clock.sample_rate());
        Self {
            clock,
            hits_rx,
            voice_rx,
            pending: Vec::with_capacity(PENDING_CAPACITY),
            synth,
            bgm: BgmVoice::new(),
        }
    }

    fn drain_commands(&mut self) {
        // Only grows past the reserve on a backlog
        self.pending.extend(self.hits_rx.try_iter());
        self.pending.sort_unstable_by_key(|h| h.frame);

        let device_rate = self.clock.sample_rate() as f64;
        for command in self.voice_rx.try_iter() {
            match command {
                VoiceCommand::Load(buffer) => {
                    self.bgm.buffer = Some(buffer);
                    self.bgm.stop();
                }
                // The running track keeps playing until the cue frame
                VoiceCommand::Start { frame, buffer_offset } => {
                    let buffer_rate = self.bgm.buffer.as_ref().map_or(device_rate, |b| b.sample_rate as f64);
                    self.bgm.cue = Some(Cue {
                        frame,
                        position: buffer_offset * buffer_rate,
                    });
                }
                VoiceCommand::Stop => self.bgm.stop(),
                VoiceCommand::Rate(rate) => self.bgm.rate = rate,
                VoiceCommand::Volume(volume) => self.bgm.volume = volume,
            }
        }
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        if self.clock.state() == ClockState::Suspended {
            data.fill(0.0);
            return;
        }

        self.drain_commands();

        let device_rate = self.clock.sample_rate() as f64;
        let mut frame = self.clock.frames.load(Ordering::Acquire);
        let mut next_hit = 0;

        for out in data.chunks_mut(channels.max(1)) {
            // Late hits play immediately
            while next_hit < self.pending.len() && self.pending[next_hit].frame <= frame {
                let hit = self.pending[next_hit];
                self.synth.strike(hit.instrument, hit.gain);
                next_hit += 1;
            }

            let sample = (self.synth.render() + self.bgm.render(frame, device_rate)).clamp(-1.0, 1.0);
            out.fill(sample);
            frame += 1;
        }

        self.pending.drain(..next_hit);
        self.clock.frames.store(frame, Ordering::Release);
    }
}

/// Open output stream plus the handles that feed it
pub struct AudioOutput {
    clock: Arc<OutputClock>,
    hits_tx: Sender<ScheduledHit>,
    voice_tx: Sender<VoiceCommand>,
    stop_flag: Arc<AtomicBool>,
    _stream: cpal::Stream,
}

impl AudioOutput {
    /// Open the default output device. The clock stays suspended until
    /// resumed.
    pub fn open() -> Result<Self, AudioOutputError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioOutputError::NoDevices)?;

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioOutputError::ConfigError(e.to_string()))?;

        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels();

        let clock = Arc::new(OutputClock::new(sample_rate));
        let (hits_tx, hits_rx) = unbounded();
        let (voice_tx, voice_rx) = unbounded();
        let mut renderer = Renderer::new(clock.clone(), hits_rx, voice_rx);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let error_clock = clock.clone();

        let config: StreamConfig = supported_config.into();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if stop_clone.load(Ordering::SeqCst) {
                        data.fill(0.0);
                        return;
                    }
                    renderer.render(data, channels as usize);
                },
                move |err| {
                    error!("Output stream error: {}", err);
                    error_clock.failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| AudioOutputError::StreamError(e.to_string()))?;

        stream.play().map_err(|e| AudioOutputError::StreamError(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "Opened output stream"
        );

        Ok(Self {
            clock,
            hits_tx,
            voice_tx,
            stop_flag,
            _stream: stream,
        })
    }

    pub fn clock(&self) -> Arc<OutputClock> {
        self.clock.clone()
    }

    pub fn kit(&self) -> OutputKit {
        OutputKit {
            clock: self.clock.clone(),
            tx: self.hits_tx.clone(),
        }
    }

    pub fn bgm_player(&self) -> OutputBgmPlayer {
        OutputBgmPlayer {
            clock: self.clock.clone(),
            tx: self.voice_tx.clone(),
            duration: None,
        }
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rig {
        clock: Arc<OutputClock>,
        kit: OutputKit,
        player: OutputBgmPlayer,
        renderer: Renderer,
    }

    fn rig(sample_rate: u32) -> Rig {
        let clock = Arc::new(OutputClock::new(sample_rate));
        let (hits_tx, hits_rx) = unbounded();
        let (voice_tx, voice_rx) = unbounded();
        Rig {
            kit: OutputKit { clock: clock.clone(), tx: hits_tx },
            player: OutputBgmPlayer { clock: clock.clone(), tx: voice_tx, duration: None },
            renderer: Renderer::new(clock.clone(), hits_rx, voice_rx),
            clock,
        }
    }

    fn first_sound(data: &[f32]) -> Option<usize> {
        data.iter().position(|s| s.abs() > 1e-6)
    }

    #[test]
    fn test_suspended_clock_is_silent_and_frozen() {
        let mut rig = rig(1000);
        rig.kit.trigger(Instrument::Kick, 0.0, 1.0);

        let mut data = vec![1.0; 64];
        rig.renderer.render(&mut data, 2);
        assert!(data.iter().all(|s| *s == 0.0));
        assert_eq!(rig.clock.current_time(), 0.0);

        rig.clock.resume().unwrap();
        rig.renderer.render(&mut data, 2);
        assert_eq!(rig.clock.current_time(), 0.032);
    }

    #[test]
    fn test_hit_lands_on_its_frame() {
        let mut rig = rig(1000);
        rig.clock.resume().unwrap();
        rig.kit.trigger(Instrument::Kick, 0.05, 1.0);

        // Mono, 100 frames
        let mut data = vec![0.0; 100];
        rig.renderer.render(&mut data, 1);
        let onset = first_sound(&data).unwrap();
        // The kick's first sample is sin(small phase), so allow one frame
        assert!((50..=51).contains(&onset), "onset at {}", onset);
    }

    #[test]
    fn test_channels_carry_the_same_sample() {
        let mut rig = rig(1000);
        rig.clock.resume().unwrap();
        rig.kit.trigger(Instrument::Snare, 0.0, 1.0);

        let mut data = vec![0.0; 64];
        rig.renderer.render(&mut data, 2);
        for frame in data.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_bgm_starts_at_offset_and_rate() {
        let mut rig = rig(100);
        rig.clock.resume().unwrap();

        // Ramp so the read position is visible in the output
        let ramp: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        rig.player.load(BgmBuffer::new(ramp, 100));
        assert_eq!(rig.player.buffer_duration(), Some(1.0));

        rig.player.set_playback_rate(2.0);
        rig.player.start(0.1, 0.25);

        let mut data = vec![0.0; 20];
        rig.renderer.render(&mut data, 1);
        assert!(data[..10].iter().all(|s| *s == 0.0));
        assert!((data[10] - 0.25).abs() < 1e-6);
        assert!((data[11] - 0.27).abs() < 1e-6);
    }

    #[test]
    fn test_bgm_stop_silences() {
        let mut rig = rig(100);
        rig.clock.resume().unwrap();
        rig.player.load(BgmBuffer::new(vec![0.5; 100], 100));
        rig.player.set_volume(0.5);
        rig.player.start(0.0, 0.0);

        let mut data = vec![0.0; 10];
        rig.renderer.render(&mut data, 1);
        assert!((data[0] - 0.25).abs() < 1e-6);

        rig.player.stop();
        rig.renderer.render(&mut data, 1);
        assert!(data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_reanchor_switches_over_without_gap() {
        let mut rig = rig(1000);
        rig.clock.resume().unwrap();
        // Second half of the track is quieter so the jump back is audible
        let mut track = vec![0.5; 1000];
        track[500..].fill(0.25);
        rig.player.load(BgmBuffer::new(track, 1000));
        rig.player.start(0.0, 0.0);

        let mut data = vec![0.0; 900];
        rig.renderer.render(&mut data, 1);
        assert_eq!(data[899], 0.25);

        // Loop wraps at t=1.0 but the anchor arrives a lookahead early
        rig.player.start(1.0, 0.0);
        let mut data = vec![0.0; 200];
        rig.renderer.render(&mut data, 1);

        assert!(data.iter().all(|s| *s != 0.0), "silent frames across the wrap");
        assert!(data[..100].iter().all(|s| *s == 0.25));
        assert!(data[100..].iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_stop_cancels_pending_start() {
        let mut rig = rig(100);
        rig.clock.resume().unwrap();
        rig.player.load(BgmBuffer::new(vec![0.5; 100], 100));
        rig.player.start(0.1, 0.0);
        rig.player.stop();

        let mut data = vec![0.0; 20];
        rig.renderer.render(&mut data, 1);
        assert!(data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_pending_hits_keep_their_reserve() {
        let mut rig = rig(1000);
        rig.clock.resume().unwrap();
        for i in 0..64 {
            rig.kit.trigger(Instrument::ClosedHat, 1.0 + i as f64 * 0.01, 1.0);
        }
        rig.kit.trigger(Instrument::Kick, 0.0, 1.0);

        let mut data = vec![0.0; 32];
        rig.renderer.render(&mut data, 1);
        assert_eq!(rig.renderer.pending.len(), 64);
        assert_eq!(rig.renderer.pending.capacity(), PENDING_CAPACITY);
        assert!(rig.renderer.pending.windows(2).all(|w| w[0].frame <= w[1].frame));
    }

    #[test]
    fn test_failed_stream_refuses_resume() {
        let clock = OutputClock::new(48_000);
        clock.failed.store(true, Ordering::Release);
        assert!(clock.resume().is_err());
        assert_eq!(clock.state(), ClockState::Suspended);
    }
}
