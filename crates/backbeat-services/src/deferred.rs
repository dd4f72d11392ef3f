//! Deferred callback delivery
//!
//! Hits are scheduled ahead of time on the audio clock, so anything the user
//! sees (the playhead) has to be postponed until the sound is heard.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use tracing::{debug, error};

struct Pending<T> {
    due: Instant,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline first
impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Round `due` up to the next frame boundary counted from `epoch`
pub fn align_to_frame(epoch: Instant, due: Instant, frame: Duration) -> Instant {
    if frame.is_zero() {
        return due;
    }
    let since = due.saturating_duration_since(epoch).as_nanos();
    let frame_ns = frame.as_nanos();
    let frames = since.div_ceil(frame_ns);
    let aligned = frames * frame_ns;
    epoch + Duration::from_nanos(u64::try_from(aligned).unwrap_or(u64::MAX))
}

/// Worker thread that hands values to a callback once their delay elapses.
/// Values with equal deadlines arrive in the order they were deferred.
pub struct FrameDeferrer<T: Send + 'static> {
    tx: Option<Sender<Pending<T>>>,
    worker: Option<JoinHandle<()>>,
    epoch: Instant,
    frame: Option<Duration>,
    seq: u64,
}

impl<T: Send + 'static> FrameDeferrer<T> {
    pub fn new<F>(frame: Option<Duration>, mut callback: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = unbounded::<Pending<T>>();

        let worker = thread::Builder::new()
            .name("backbeat-deferred".into())
            .spawn(move || {
                let mut heap: BinaryHeap<Pending<T>> = BinaryHeap::new();
                loop {
                    let received = match heap.peek() {
                        Some(next) => rx.recv_timeout(next.due.saturating_duration_since(Instant::now())),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(pending) => heap.push(pending),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let now = Instant::now();
                    while heap.peek().is_some_and(|p| p.due <= now) {
                        if let Some(pending) = heap.pop() {
                            callback(pending.value);
                        }
                    }
                }
                debug!(dropped = heap.len(), "Deferred worker exiting");
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn deferred callback worker: {}", e);
                None
            }
        };

        Self {
            tx: Some(tx),
            worker,
            epoch: Instant::now(),
            frame,
            seq: 0,
        }
    }

    /// Deliver `value` after `delay`, rounded up to a frame boundary when
    /// frame alignment is on
    pub fn defer(&mut self, delay: Duration, value: T) {
        let Some(tx) = &self.tx else { return };
        let due = Instant::now() + delay;
        let due = match self.frame {
            Some(frame) => align_to_frame(self.epoch, due, frame),
            None => due,
        };
        self.seq += 1;
        let _ = tx.send(Pending { due, seq: self.seq, value });
    }
}

impl<T: Send + 'static> Drop for FrameDeferrer<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
