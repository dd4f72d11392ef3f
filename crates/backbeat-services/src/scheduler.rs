//! Lookahead scheduler
//!
//! Each tick dispatches every subdivision that falls inside the lookahead
//! window against the audio clock. The audio subsystem plays those hits at
//! their exact times, so a late or skipped tick only shrinks the margin
//! instead of shifting the groove.

use std::sync::Arc;
use std::time::Duration;

use backbeat_core::{Pattern, PlayStep, TransportState};
use tracing::{debug, info, warn};

use crate::clock::{AudioClock, ClockError, ClockState};
use crate::config::SchedulerConfig;
use crate::dispatcher::{dispatch, DrumKit};
use crate::wake_lock::{WakeLock, WakeLockHandle};

/// Immutable view of one dispatched subdivision, shared with every consumer
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub step_index: usize,
    pub pattern: Arc<Pattern>,
    /// Subdivision within the step's pattern
    pub subdivision: u32,
    /// Subdivision counted from bar 0 of the first step's pattern
    pub timeline_subdivision: u32,
    pub step_offset_secs: f64,
    /// Audio clock time the subdivision sounds at
    pub play_time: f64,
    /// How far ahead of the clock it was scheduled
    pub delay: Duration,
}

/// Receives scheduler notifications on the ticking thread. Implementations
/// must return quickly.
pub trait PlaybackListener: Send {
    /// A new step became active; `""` is the draft pattern
    fn on_pattern_change(&mut self, name: &str);
    fn on_subdivision(&mut self, snapshot: &PositionSnapshot);
}

/// Playback cursor, written only by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cursor {
    pub next_event_time: f64,
    pub step_index: usize,
    /// `None` until the first start
    pub subdivision: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Nothing to play
    NoSteps,
}

pub struct Scheduler {
    clock: Arc<dyn AudioClock>,
    kit: Box<dyn DrumKit>,
    listener: Box<dyn PlaybackListener>,
    wake_lock: Box<dyn WakeLock>,
    wake_handle: Option<WakeLockHandle>,
    steps: Vec<PlayStep>,
    cursor: Cursor,
    state: TransportState,
    lookahead: f64,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn AudioClock>,
        kit: Box<dyn DrumKit>,
        listener: Box<dyn PlaybackListener>,
        wake_lock: Box<dyn WakeLock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            clock,
            kit,
            listener,
            wake_lock,
            wake_handle: None,
            steps: Vec::new(),
            cursor: Cursor::default(),
            state: TransportState::Stopped,
            lookahead: config.lookahead_secs,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn steps(&self) -> &[PlayStep] {
        &self.steps
    }

    /// Replace the loop. A running scheduler re-validates its cursor on the
    /// next tick.
    pub fn set_steps(&mut self, steps: Vec<PlayStep>) {
        self.steps = steps;
    }

    /// Forget the playback position; the next start begins at the loop start
    pub fn reset_cursor(&mut self) {
        self.cursor = Cursor::default();
    }

    /// Start playback and run the first tick. The caller owns the repeating
    /// timer.
    pub fn begin(&mut self) -> Result<StartOutcome, ClockError> {
        if self.state.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if self.clock.state() == ClockState::Suspended {
            self.clock.resume()?;
        }

        self.acquire_wake_lock();

        let Some(first) = self.steps.first() else {
            self.release_wake_lock();
            return Ok(StartOutcome::NoSteps);
        };

        if !self.cursor_in_range() {
            self.cursor.step_index = 0;
            self.cursor.subdivision = Some(first.start_subdivision());
            self.listener.on_pattern_change(&first.pattern_name);
        }

        self.cursor.next_event_time = self.clock.current_time();
        self.state = TransportState::Running;
        info!(
            steps = self.steps.len(),
            step = self.cursor.step_index,
            subdivision = ?self.cursor.subdivision,
            "Scheduler started"
        );

        self.tick();
        Ok(StartOutcome::Started)
    }

    /// Stop dispatching; the cursor is kept so the next start resumes
    pub fn halt(&mut self) {
        if !self.state.is_running() {
            return;
        }
        self.state = TransportState::Stopped;
        self.release_wake_lock();
        info!(step = self.cursor.step_index, subdivision = ?self.cursor.subdivision, "Scheduler stopped");
    }

    /// Dispatch everything inside the lookahead window
    pub fn tick(&mut self) {
        if !self.state.is_running() || self.steps.is_empty() {
            return;
        }

        let now = self.clock.current_time();
        // Step advances and wraps since the last dispatch. A loop that can
        // play anything dispatches within two of them.
        let mut idle = 0;

        while self.cursor.next_event_time < now + self.lookahead {
            if idle > 2 * self.steps.len() {
                warn!(steps = self.steps.len(), "No step has a playable subdivision");
                return;
            }

            let Some(step) = self.steps.get(self.cursor.step_index) else {
                idle += 1;
                let first = &self.steps[0];
                self.cursor.step_index = 0;
                self.cursor.subdivision = Some(first.start_subdivision());
                debug!(pattern = %first.pattern_name, "Loop wrapped");
                self.listener.on_pattern_change(&first.pattern_name);
                if self.cursor.next_event_time < now {
                    self.cursor.next_event_time = now;
                }
                continue;
            };

            let subdivision = self.cursor.subdivision.unwrap_or_else(|| step.start_subdivision());

            if subdivision >= step.end_subdivision() {
                idle += 1;
                self.cursor.step_index += 1;
                if let Some(next) = self.steps.get(self.cursor.step_index) {
                    self.cursor.subdivision = Some(next.start_subdivision());
                    debug!(step = self.cursor.step_index, pattern = %next.pattern_name, "Step changed");
                    self.listener.on_pattern_change(&next.pattern_name);
                }
                continue;
            }

            let subdivision = subdivision.max(step.start_subdivision());
            let play_time = self.cursor.next_event_time.max(now);

            dispatch(self.kit.as_mut(), &step.pattern, subdivision, play_time);

            let snapshot = PositionSnapshot {
                step_index: self.cursor.step_index,
                pattern: step.pattern.clone(),
                subdivision,
                timeline_subdivision: step.timeline_offset_subdivisions + subdivision,
                step_offset_secs: step.timeline_offset_secs,
                play_time,
                delay: Duration::from_secs_f64((play_time - now).max(0.0)),
            };
            self.listener.on_subdivision(&snapshot);

            self.cursor.subdivision = Some(subdivision + 1);
            self.cursor.next_event_time += step.pattern.subdivision_duration_at(subdivision);
            idle = 0;
        }
    }

    fn cursor_in_range(&self) -> bool {
        let Some(subdivision) = self.cursor.subdivision else {
            return false;
        };
        self.steps
            .get(self.cursor.step_index)
            .is_some_and(|step| step.contains(subdivision))
    }

    fn acquire_wake_lock(&mut self) {
        if self.wake_handle.is_some() {
            return;
        }
        match self.wake_lock.request() {
            Ok(handle) => self.wake_handle = Some(handle),
            Err(e) => debug!("Wake lock unavailable: {}", e),
        }
    }

    fn release_wake_lock(&mut self) {
        let Some(handle) = self.wake_handle.take() else { return };
        if let Err(e) = self.wake_lock.release(handle) {
            debug!("Wake lock release failed: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::recording::{Event, RecordingListener};
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::dispatcher::recording::RecordingKit;
    use crate::wake_lock::{NoWakeLock, WakeLockError};
    use backbeat_core::{
        build_steps, CellState, CrossPatternLoop, Instrument, PatternId, TimeSignature,
    };

    fn pattern(name: &str, bpm: f64, bars: u32) -> Pattern {
        Pattern::new(PatternId(1), bpm, TimeSignature::four_four(), bars)
            .unwrap()
            .with_name(name)
    }

    fn scheduler(clock: &Arc<ManualClock>) -> (Scheduler, RecordingKit, RecordingListener) {
        let kit = RecordingKit::default();
        let listener = RecordingListener::default();
        let scheduler = Scheduler::new(
            clock.clone(),
            Box::new(kit.clone()),
            Box::new(listener.clone()),
            Box::new(NoWakeLock),
            &SchedulerConfig::default(),
        );
        (scheduler, kit, listener)
    }

    fn subdivisions(events: &[Event]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Subdivision(s, _) => Some(*s),
                Event::Pattern(_) => None,
            })
            .collect()
    }

    /// Drive the scheduler in 25ms timer steps
    fn run_for(scheduler: &mut Scheduler, clock: &ManualClock, secs: f64) {
        let ticks = (secs / 0.025).round() as usize;
        for _ in 0..ticks {
            clock.advance(0.025);
            scheduler.tick();
        }
    }

    #[test]
    fn test_single_kick_on_first_tick() {
        let clock = Arc::new(ManualClock::running(5.0));
        let (mut scheduler, kit, listener) = scheduler(&clock);

        let mut p = pattern("", 120.0, 1);
        p.set_cell(Instrument::Kick, 0, CellState::On);
        scheduler.set_steps(build_steps(&Arc::new(p), &[], None, true));

        assert_eq!(scheduler.begin().unwrap(), StartOutcome::Started);

        let hits = kit.take();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].instrument, Instrument::Kick);
        assert!((hits[0].time - 5.0).abs() < 1e-9);

        let events = listener.take();
        assert_eq!(events, vec![Event::Pattern(String::new()), Event::Subdivision(0, 5.0)]);
    }

    #[test]
    fn test_subdivision_duration_law() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 100.0, 2)), &[], None, false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 3.0);

        let times: Vec<f64> = listener
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Event::Subdivision(_, t) => Some(t),
                Event::Pattern(_) => None,
            })
            .collect();
        assert!(times.len() > 10);

        let expected = 60.0 / 100.0 * (4.0 / 4.0) / 4.0;
        for pair in times.windows(2) {
            assert!((pair[1] - pair[0] - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_never_schedules_beyond_lookahead() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, _listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 1)), &[], None, false));

        scheduler.begin().unwrap();
        for _ in 0..40 {
            clock.advance(0.025);
            scheduler.tick();
            let cursor = scheduler.cursor();
            assert!(cursor.next_event_time >= clock.current_time() + 0.1);
            assert!(cursor.next_event_time < clock.current_time() + 0.1 + 0.125 + 1e-9);
        }
    }

    #[test]
    fn test_loop_wraps_to_first_step() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        // 1 bar at 240 BPM = 1s, 16 subdivisions
        scheduler.set_steps(build_steps(&Arc::new(pattern("Solo", 240.0, 1)), &[], None, false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 2.5);

        let events = listener.take();
        let subs = subdivisions(&events);
        let expected: Vec<u32> = (0..16).chain(0..16).chain(0..8).collect();
        assert_eq!(&subs[..40], &expected[..]);

        // One notification for the start plus one per wrap
        let wraps = events.iter().filter(|e| matches!(e, Event::Pattern(_))).count();
        assert_eq!(wraps, 3);

        let first_wrap = events.iter().position(|e| *e == Event::Subdivision(15, 0.9375)).unwrap();
        assert_eq!(events[first_wrap + 1], Event::Pattern("Solo".into()));
        assert!(matches!(events[first_wrap + 2], Event::Subdivision(0, _)));
    }

    #[test]
    fn test_cross_pattern_steps_in_order() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);

        let a = Arc::new(pattern("A", 240.0, 2));
        let b = Arc::new(Pattern { id: PatternId(2), ..pattern("B", 240.0, 1) });
        let loop_range = CrossPatternLoop {
            start_pattern_name: "A".into(),
            start_bar: 1,
            end_pattern_name: "B".into(),
            end_bar: 0,
        };
        scheduler.set_steps(build_steps(&a, &[a.clone(), b], Some(&loop_range), false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 2.05);

        let events = listener.take();
        let names: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::Pattern(n) => Some(n.as_str()),
                Event::Subdivision(..) => None,
            })
            .collect();
        assert_eq!(names, vec!["A", "B", "A"]);

        let subs = subdivisions(&events);
        assert_eq!(subs[0], 16);
        assert_eq!(subs[15], 31);
        assert_eq!(subs[16], 0);
        assert_eq!(subs[31], 15);
        assert_eq!(subs[32], 16);
    }

    #[test]
    fn test_stop_is_idempotent_and_resumes_in_place() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 2)), &[], None, false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 0.5);
        scheduler.halt();
        assert_eq!(scheduler.state(), TransportState::Stopped);
        scheduler.halt();
        assert_eq!(scheduler.state(), TransportState::Stopped);

        let held = scheduler.cursor().subdivision.unwrap();
        assert!(held > 0);

        // Ticks while stopped do nothing
        listener.take();
        run_for(&mut scheduler, &clock, 0.5);
        assert!(listener.take().is_empty());

        scheduler.begin().unwrap();
        let events = listener.take();
        assert_eq!(subdivisions(&events)[0], held);
        assert!(!events.iter().any(|e| matches!(e, Event::Pattern(_))));
    }

    #[test]
    fn test_start_twice_is_noop() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, kit, _listener) = scheduler(&clock);
        let mut p = pattern("A", 120.0, 1);
        p.set_cell(Instrument::Kick, 0, CellState::On);
        scheduler.set_steps(build_steps(&Arc::new(p), &[], None, false));

        assert_eq!(scheduler.begin().unwrap(), StartOutcome::Started);
        assert_eq!(scheduler.begin().unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(kit.take().len(), 1);
    }

    #[test]
    fn test_reset_cursor_restarts_at_loop_start() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 2)), &[], None, false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 1.0);
        scheduler.halt();
        scheduler.reset_cursor();
        listener.take();

        scheduler.begin().unwrap();
        let events = listener.take();
        assert_eq!(events[0], Event::Pattern("A".into()));
        assert_eq!(subdivisions(&events)[0], 0);
    }

    #[test]
    fn test_empty_steps_do_nothing() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, kit, listener) = scheduler(&clock);
        assert_eq!(scheduler.begin().unwrap(), StartOutcome::NoSteps);
        assert_eq!(scheduler.state(), TransportState::Stopped);
        scheduler.tick();
        assert!(kit.take().is_empty());
        assert!(listener.take().is_empty());
    }

    #[test]
    fn test_suspended_clock_is_resumed() {
        let clock = Arc::new(ManualClock::suspended(false));
        let (mut scheduler, _kit, _listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 1)), &[], None, false));

        assert_eq!(scheduler.begin().unwrap(), StartOutcome::Started);
        assert_eq!(clock.state(), ClockState::Running);
    }

    #[test]
    fn test_resume_failure_is_returned() {
        let clock = Arc::new(ManualClock::suspended(true));
        let (mut scheduler, _kit, _listener) = scheduler(&clock);
        scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 1)), &[], None, false));

        assert!(matches!(scheduler.begin(), Err(ClockError::ResumeFailed(_))));
        assert_eq!(scheduler.state(), TransportState::Stopped);
    }

    #[test]
    fn test_shrinking_loop_revalidates_cursor() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);

        let current = Arc::new(pattern("A", 120.0, 4));
        scheduler.set_steps(build_steps(&current, &[], None, false));
        scheduler.begin().unwrap();
        // Into bar 2
        run_for(&mut scheduler, &clock, 4.5);
        assert!(scheduler.cursor().subdivision.unwrap() >= 32);
        listener.take();

        let loop_range = CrossPatternLoop {
            start_pattern_name: "A".into(),
            start_bar: 0,
            end_pattern_name: "A".into(),
            end_bar: 0,
        };
        scheduler.set_steps(build_steps(&current, &[current.clone()], Some(&loop_range), false));
        clock.advance(0.1);
        scheduler.tick();

        let events = listener.take();
        assert_eq!(events[0], Event::Pattern("A".into()));
        assert_eq!(subdivisions(&events)[0], 0);
        assert_eq!(scheduler.state(), TransportState::Running);
    }

    #[test]
    fn test_bar_override_changes_spacing() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        let mut p = pattern("A", 120.0, 2);
        p.set_bar_bpm(1, 240.0).unwrap();
        scheduler.set_steps(build_steps(&Arc::new(p), &[], None, false));

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 3.1);

        let events = listener.take();
        let times: Vec<(u32, f64)> = events
            .iter()
            .filter_map(|e| match e {
                Event::Subdivision(s, t) => Some((*s, *t)),
                Event::Pattern(_) => None,
            })
            .collect();
        // Bar 1 starts after 2s and runs twice as fast
        assert_eq!(times[16].0, 16);
        assert!((times[16].1 - 2.0).abs() < 1e-9);
        assert!((times[17].1 - 2.0625).abs() < 1e-9);
        // Wrapped back to bar 0 after 3s
        assert_eq!(times[32].0, 0);
        assert!((times[32].1 - 3.0).abs() < 1e-9);
    }

    struct CountingWakeLock {
        requests: Arc<Mutex<(u32, u32)>>,
        fail: bool,
    }

    impl WakeLock for CountingWakeLock {
        fn request(&mut self) -> Result<WakeLockHandle, WakeLockError> {
            self.requests.lock().unwrap().0 += 1;
            if self.fail {
                return Err(WakeLockError::Denied("battery saver".into()));
            }
            Ok(WakeLockHandle(1))
        }

        fn release(&mut self, _handle: WakeLockHandle) -> Result<(), WakeLockError> {
            self.requests.lock().unwrap().1 += 1;
            Ok(())
        }
    }

    #[test]
    fn test_empty_range_step_does_not_spin() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, kit, listener) = scheduler(&clock);
        let p = Arc::new(pattern("Rock", 120.0, 2));

        let mut steps = build_steps(&p, &[], None, false);
        steps[0].start_bar = 1;
        steps[0].end_bar = 0;
        scheduler.set_steps(steps);

        assert_eq!(scheduler.begin().unwrap(), StartOutcome::Started);
        let cursor = scheduler.cursor();
        clock.advance(0.1);
        scheduler.tick();

        assert!(kit.take().is_empty());
        assert!(subdivisions(&listener.take()).is_empty());
        assert_eq!(scheduler.cursor().next_event_time, cursor.next_event_time);
    }

    #[test]
    fn test_empty_range_step_is_skipped() {
        let clock = Arc::new(ManualClock::running(0.0));
        let (mut scheduler, _kit, listener) = scheduler(&clock);
        let mut verse = pattern("Verse", 120.0, 1);
        verse.set_cell(Instrument::Kick, 0, CellState::On);
        let verse = Arc::new(verse);
        let broken = Arc::new(pattern("Broken", 120.0, 2));

        let mut steps = build_steps(&broken, &[], None, false);
        steps[0].start_bar = 1;
        steps[0].end_bar = 0;
        steps.extend(build_steps(&verse, &[], None, false));
        scheduler.set_steps(steps);

        scheduler.begin().unwrap();
        run_for(&mut scheduler, &clock, 2.0);

        let played = subdivisions(&listener.take());
        assert!(played.len() > 16);
        assert_eq!(&played[..3], &[0, 1, 2]);
        assert_eq!(scheduler.cursor().step_index, 1);
    }

    #[test]
    fn test_wake_lock_is_best_effort() {
        for fail in [false, true] {
            let counts = Arc::new(Mutex::new((0, 0)));
            let clock = Arc::new(ManualClock::running(0.0));
            let mut scheduler = Scheduler::new(
                clock.clone(),
                Box::new(RecordingKit::default()),
                Box::new(RecordingListener::default()),
                Box::new(CountingWakeLock { requests: counts.clone(), fail }),
                &SchedulerConfig::default(),
            );
            scheduler.set_steps(build_steps(&Arc::new(pattern("A", 120.0, 1)), &[], None, false));

            assert_eq!(scheduler.begin().unwrap(), StartOutcome::Started);
            scheduler.halt();

            let (requested, released) = *counts.lock().unwrap();
            assert_eq!(requested, 1);
            assert_eq!(released, if fail { 0 } else { 1 });
        }
    }
}
