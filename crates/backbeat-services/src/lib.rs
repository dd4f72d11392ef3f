//! backbeat-services: Scheduling, audio output, and BGM sync for the pattern player

pub mod audio_output;
pub mod bgm;
pub mod clock;
pub mod config;
pub mod deferred;
pub mod dispatcher;
pub mod engine;
pub mod scheduler;
mod voice;
pub mod wake_lock;

pub use audio_output::{AudioOutput, AudioOutputError, OutputBgmPlayer, OutputClock, OutputKit};
pub use bgm::{compute_anchor, playback_position, Anchor, BgmBuffer, BgmCommand, BgmPlayer, BgmSynchronizer};
pub use clock::{AudioClock, ClockError, ClockState};
pub use config::{BgmConfig, EngineConfig, SchedulerConfig};
pub use deferred::FrameDeferrer;
pub use dispatcher::{dispatch, DrumKit};
pub use engine::{EngineError, PlaybackEngine};
pub use scheduler::{Cursor, PlaybackListener, PositionSnapshot, Scheduler, StartOutcome};
pub use voice::DrumSynth;
pub use wake_lock::{NoWakeLock, WakeLock, WakeLockError, WakeLockHandle};
