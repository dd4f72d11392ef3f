//! Synthesized one-shot drum voices for the output backend

use std::f64::consts::TAU;

use backbeat_core::Instrument;

const MAX_VOICES: usize = 16;
const SILENCE: f64 = 0.0001;

#[derive(Debug, Clone)]
struct Voice {
    instrument: Instrument,
    active: bool,
    age: usize,
    phase: f64,
    amp_env: f64,
    pitch_env: f64,
    noise_env: f64,
    filter_state: f64,
    filter_state2: f64,
    gain: f64,
}

impl Voice {
    fn idle() -> Self {
        Self {
            instrument: Instrument::Kick,
            active: false,
            age: 0,
            phase: 0.0,
            amp_env: 0.0,
            pitch_env: 0.0,
            noise_env: 0.0,
            filter_state: 0.0,
            filter_state2: 0.0,
            gain: 0.0,
        }
    }

    fn strike(&mut self, instrument: Instrument, gain: f32) {
        *self = Self {
            instrument,
            active: true,
            amp_env: 1.0,
            pitch_env: 1.0,
            noise_env: 1.0,
            gain: gain as f64,
            ..Self::idle()
        };
    }

    fn render(&mut self, dt: f64) -> f64 {
        if !self.active {
            return 0.0;
        }
        self.age += 1;

        let sample = match self.instrument {
            Instrument::Kick => self.kick(dt),
            Instrument::Snare => self.snare(dt),
            Instrument::ClosedHat => self.metal(dt, 0.3, 0.035),
            Instrument::OpenHat => self.metal(dt, 0.3, 0.3),
            Instrument::Crash => self.metal(dt, 0.25, 1.2),
            Instrument::Ride => self.ride(dt),
            Instrument::HighTom => self.tom(dt, 180.0),
            Instrument::MidTom => self.tom(dt, 130.0),
            Instrument::FloorTom => self.tom(dt, 90.0),
        };

        if self.amp_env < SILENCE && self.noise_env < SILENCE {
            self.active = false;
        }
        sample * self.gain
    }

    fn kick(&mut self, dt: f64) -> f64 {
        self.pitch_env *= (-dt / 0.035).exp();
        self.phase += 55.0 * (1.0 + self.pitch_env * 3.0) * dt;
        self.amp_env *= (-dt / 0.3).exp();
        self.noise_env = 0.0;
        (self.phase * TAU).sin() * self.amp_env * 0.9
    }

    fn snare(&mut self, dt: f64) -> f64 {
        self.phase += 190.0 * dt;
        let tone = (self.phase * TAU).sin();
        self.amp_env *= (-dt / 0.03).exp();

        // Two-pole bandpass on white noise for the wires
        let noise = fastrand::f64() * 2.0 - 1.0;
        self.filter_state += 0.15 * (noise - self.filter_state);
        self.filter_state2 += 0.1 * (self.filter_state - self.filter_state2);
        self.noise_env *= (-dt / 0.1).exp();

        let wires = (self.filter_state - self.filter_state2) * self.noise_env * 1.5;
        (tone * self.amp_env * 0.5 + wires) * 0.8
    }

    fn metal(&mut self, dt: f64, cutoff: f64, decay: f64) -> f64 {
        let noise = fastrand::f64() * 2.0 - 1.0;
        self.filter_state += cutoff * (noise - self.filter_state);
        self.amp_env *= (-dt / decay).exp();
        self.noise_env = 0.0;
        (noise - self.filter_state) * self.amp_env * 0.6
    }

    fn ride(&mut self, dt: f64) -> f64 {
        self.phase += 3200.0 * dt;
        let ping = (self.phase * TAU).sin() * 0.3;
        let wash = self.metal(dt, 0.35, 0.8);
        ping * self.amp_env + wash
    }

    fn tom(&mut self, dt: f64, freq: f64) -> f64 {
        self.pitch_env *= (-dt / 0.05).exp();
        self.phase += freq * (1.0 + self.pitch_env * 0.5) * dt;
        self.amp_env *= (-dt / 0.3).exp();
        self.noise_env = 0.0;
        (self.phase * TAU).sin() * self.amp_env * 0.7
    }
}

fn is_hat(instrument: Instrument) -> bool {
    matches!(instrument, Instrument::ClosedHat | Instrument::OpenHat)
}

/// Fixed pool of drum voices rendered one sample at a time
pub struct DrumSynth {
    sample_rate: f64,
    voices: Vec<Voice>,
}

impl std::fmt::Debug for DrumSynth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrumSynth")
            .field("sample_rate", &self.sample_rate)
            .field("active_voices", &self.active_voices())
            .finish()
    }
}

impl DrumSynth {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f64,
            voices: (0..MAX_VOICES).map(|_| Voice::idle()).collect(),
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    pub fn strike(&mut self, instrument: Instrument, gain: f32) {
        // Open and closed hat choke each other
        if is_hat(instrument) {
            for voice in self.voices.iter_mut().filter(|v| v.active && is_hat(v.instrument)) {
                voice.active = false;
            }
        }

        let idx = self
            .voices
            .iter()
            .position(|v| v.active && v.instrument == instrument)
            .or_else(|| self.voices.iter().position(|v| !v.active))
            .or_else(|| {
                self.voices
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, v)| v.age)
                    .map(|(i, _)| i)
            })
            .unwrap_or(0);
        self.voices[idx].strike(instrument, gain);
    }

    pub fn render(&mut self) -> f32 {
        let dt = 1.0 / self.sample_rate;
        let mix: f64 = self.voices.iter_mut().map(|v| v.render(dt)).sum();
        mix.tanh() as f32
    }
}
