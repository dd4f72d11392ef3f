//! Playback engine: owns the scheduler, its timer thread and the BGM worker

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use backbeat_core::{build_steps, BackbeatError, CrossPatternLoop, Pattern, PlayStep, TransportState};
use crossbeam_channel::{bounded, select, tick, unbounded, Sender};
use thiserror::Error;
use tracing::{debug, info};

use crate::bgm::{BgmBuffer, BgmCommand, BgmPlayer, BgmSynchronizer};
use crate::clock::{AudioClock, ClockError};
use crate::config::EngineConfig;
use crate::deferred::FrameDeferrer;
use crate::dispatcher::DrumKit;
use crate::scheduler::{Cursor, PlaybackListener, PositionSnapshot, Scheduler, StartOutcome};
use crate::wake_lock::WakeLock;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Audio clock error: {0}")]
    Clock(#[from] ClockError),
    #[error("Invalid pattern {name:?}: {source}")]
    InvalidPattern {
        name: String,
        source: BackbeatError,
    },
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

pub type SubdivisionCallback = Box<dyn FnMut(u32) + Send>;
pub type PatternCallback = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
struct Callbacks {
    subdivision: Option<SubdivisionCallback>,
    pattern: Option<PatternCallback>,
}

fn validate(pattern: &Pattern) -> Result<(), EngineError> {
    pattern.validate().map_err(|source| EngineError::InvalidPattern {
        name: pattern.name.clone(),
        source,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the deferred worker hands to the user callbacks
enum UiEvent {
    Subdivision(u32),
    Pattern(String),
}

impl Callbacks {
    fn deliver(&mut self, event: UiEvent) {
        match event {
            UiEvent::Subdivision(subdivision) => {
                if let Some(cb) = self.subdivision.as_mut() {
                    cb(subdivision);
                }
            }
            UiEvent::Pattern(name) => {
                if let Some(cb) = self.pattern.as_mut() {
                    cb(&name);
                }
            }
        }
    }
}

/// Fans scheduler output out to the BGM worker and the deferred callbacks.
/// Nothing user-supplied runs under the scheduler lock.
struct EngineListener {
    bgm_tx: Sender<BgmCommand>,
    deferrer: FrameDeferrer<UiEvent>,
}

impl PlaybackListener for EngineListener {
    fn on_pattern_change(&mut self, name: &str) {
        self.deferrer.defer(Duration::ZERO, UiEvent::Pattern(name.to_string()));
    }

    fn on_subdivision(&mut self, snapshot: &PositionSnapshot) {
        let _ = self.bgm_tx.send(BgmCommand::Position(snapshot.clone()));
        self.deferrer.defer(snapshot.delay, UiEvent::Subdivision(snapshot.subdivision));
    }
}

struct Timer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Timer {
    fn spawn(scheduler: Arc<Mutex<Scheduler>>, interval: Duration) -> Result<Self, EngineError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("backbeat-scheduler".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => lock(&scheduler).tick(),
                    recv(stop_rx) -> _ => return,
                }
            })
            .map_err(|source| EngineError::Spawn { name: "scheduler", source })?;

        Ok(Self { stop_tx, handle })
    }

    /// Returns once the thread is gone, so no tick runs afterwards
    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

/// Drum pattern player driven by an audio clock.
///
/// Control calls are synchronous: when `set_playing(false)` returns, the
/// timer thread has exited.
pub struct PlaybackEngine {
    scheduler: Arc<Mutex<Scheduler>>,
    timer: Option<Timer>,
    tick_interval: Duration,
    bgm_tx: Sender<BgmCommand>,
    _bgm_worker: JoinHandle<()>,
    callbacks: Arc<Mutex<Callbacks>>,
    current: Arc<Pattern>,
    saved: Vec<Arc<Pattern>>,
    loop_range: Option<CrossPatternLoop>,
    is_draft_mode: bool,
}

impl PlaybackEngine {
    pub fn new(
        clock: Arc<dyn AudioClock>,
        kit: Box<dyn DrumKit>,
        bgm_player: Box<dyn BgmPlayer>,
        wake_lock: Box<dyn WakeLock>,
        current: Pattern,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        validate(&current)?;
        let config = config.clone().sanitized();
        let callbacks = Arc::new(Mutex::new(Callbacks::default()));

        let (bgm_tx, bgm_rx) = unbounded();
        let synchronizer = BgmSynchronizer::new(bgm_player, clock.clone(), &config.bgm);
        let bgm_worker = thread::Builder::new()
            .name("backbeat-bgm".into())
            .spawn(move || synchronizer.run(bgm_rx))
            .map_err(|source| EngineError::Spawn { name: "bgm", source })?;

        let ui_callbacks = callbacks.clone();
        let deferrer = FrameDeferrer::new(
            config.frame_interval_ms.map(Duration::from_millis),
            move |event: UiEvent| lock(&ui_callbacks).deliver(event),
        );

        let listener = EngineListener {
            bgm_tx: bgm_tx.clone(),
            deferrer,
        };
        let scheduler = Scheduler::new(clock, kit, Box::new(listener), wake_lock, &config.scheduler);

        let mut engine = Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            timer: None,
            tick_interval: Duration::from_millis(config.scheduler.tick_interval_ms),
            bgm_tx,
            _bgm_worker: bgm_worker,
            callbacks,
            current: Arc::new(current),
            saved: Vec::new(),
            loop_range: None,
            is_draft_mode: false,
        };
        engine.rebuild_steps();
        Ok(engine)
    }

    pub fn is_playing(&self) -> bool {
        self.timer.is_some()
    }

    pub fn transport_state(&self) -> TransportState {
        lock(&self.scheduler).state()
    }

    pub fn cursor(&self) -> Cursor {
        lock(&self.scheduler).cursor()
    }

    pub fn steps(&self) -> Vec<PlayStep> {
        lock(&self.scheduler).steps().to_vec()
    }

    pub fn current_pattern(&self) -> &Pattern {
        &self.current
    }

    /// Start or stop playback. Starting may need to resume the audio clock,
    /// which can fail.
    pub fn set_playing(&mut self, playing: bool) -> Result<(), EngineError> {
        if playing {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.timer.is_some() {
            return Ok(());
        }

        let _ = self.bgm_tx.send(BgmCommand::Playing(true));
        let outcome = lock(&self.scheduler).begin();

        match outcome {
            Ok(StartOutcome::Started | StartOutcome::AlreadyRunning) => {}
            Ok(StartOutcome::NoSteps) => {
                let _ = self.bgm_tx.send(BgmCommand::Playing(false));
                return Ok(());
            }
            Err(e) => {
                let _ = self.bgm_tx.send(BgmCommand::Playing(false));
                return Err(e.into());
            }
        }

        match Timer::spawn(self.scheduler.clone(), self.tick_interval) {
            Ok(timer) => self.timer = Some(timer),
            Err(e) => {
                lock(&self.scheduler).halt();
                let _ = self.bgm_tx.send(BgmCommand::Playing(false));
                return Err(e);
            }
        }

        info!(pattern = %self.current.name, bpm = self.current.bpm, "Playback started");
        Ok(())
    }

    fn stop(&mut self) {
        let Some(timer) = self.timer.take() else { return };
        timer.stop();
        lock(&self.scheduler).halt();
        let _ = self.bgm_tx.send(BgmCommand::Playing(false));
        info!("Playback stopped");
    }

    /// Replace the pattern being edited. A tempo or length change while
    /// playing restarts from the loop start.
    pub fn set_current_pattern(&mut self, pattern: Pattern) -> Result<(), EngineError> {
        validate(&pattern)?;
        let restart = self.is_playing() && (pattern.bpm != self.current.bpm || pattern.bars != self.current.bars);

        self.current = Arc::new(pattern);
        self.rebuild_steps();

        if restart {
            debug!(bpm = self.current.bpm, bars = self.current.bars, "Tempo or length changed, restarting");
            self.stop();
            lock(&self.scheduler).reset_cursor();
            self.start()?;
        }
        Ok(())
    }

    /// Replace the saved library. One bad pattern rejects the whole list.
    pub fn set_saved_patterns(&mut self, saved: Vec<Pattern>) -> Result<(), EngineError> {
        saved.iter().try_for_each(validate)?;
        self.saved = saved.into_iter().map(Arc::new).collect();
        self.rebuild_steps();
        Ok(())
    }

    pub fn set_loop(&mut self, loop_range: Option<CrossPatternLoop>) {
        self.loop_range = loop_range;
        self.rebuild_steps();
    }

    pub fn set_draft_mode(&mut self, is_draft_mode: bool) {
        self.is_draft_mode = is_draft_mode;
        self.rebuild_steps();
    }

    pub fn set_bgm_source(&self, buffer: Option<BgmBuffer>) {
        let _ = self.bgm_tx.send(BgmCommand::Source(buffer));
    }

    pub fn set_bgm_offset_ms(&self, offset_ms: f64) {
        let _ = self.bgm_tx.send(BgmCommand::OffsetMs(offset_ms));
    }

    pub fn set_bgm_rate(&self, rate: f64) {
        let _ = self.bgm_tx.send(BgmCommand::Rate(rate));
    }

    pub fn set_bgm_volume(&self, volume: f32) {
        let _ = self.bgm_tx.send(BgmCommand::Volume(volume));
    }

    /// Called with each subdivision index when it becomes audible
    pub fn on_subdivision_change<F>(&self, callback: F)
    where
        F: FnMut(u32) + Send + 'static,
    {
        lock(&self.callbacks).subdivision = Some(Box::new(callback));
    }

    /// Called with the step's pattern name on every step transition. Runs on
    /// the callback thread as soon as the step is scheduled, so it may call
    /// back into the engine.
    pub fn on_pattern_change<F>(&self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        lock(&self.callbacks).pattern = Some(Box::new(callback));
    }

    fn rebuild_steps(&mut self) {
        let steps = build_steps(&self.current, &self.saved, self.loop_range.as_ref(), self.is_draft_mode);
        debug!(steps = steps.len(), draft = self.is_draft_mode, "Rebuilt play steps");
        lock(&self.scheduler).set_steps(steps);
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
