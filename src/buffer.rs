//! Fixed-cadence buffer engine.
//!
//! Cameras deliver frames irregularly: jitter, bursts, occasional stalls. The
//! encoder wants exactly one frame every `1 / fps`. `BufferEngine::buffer`
//! sits between the two:
//!
//! - A producer thread drains the upstream feed into a bounded queue.
//! - The consumer (`PacedFeed`, an iterator running in the caller's thread)
//!   wakes on accumulated deadlines and emits the newest queued frame,
//!   discarding older ones.
//! - When nothing arrives within one period, the last emitted frame is
//!   emitted again (frame hold) so the output never shows a gap.
//!
//! Latency is bounded by the queue capacity (`fps * buffer_seconds`). When a
//! push would exceed it the queue is emptied before the new frame goes in:
//! the freshest frame always wins.
//!
//! Queue, held frame, counters and lifecycle flags share one mutex/condvar
//! pair. Nothing else crosses the thread boundary.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::PipelineError;

/// How long `stop` waits for the producer thread before detaching it.
pub const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSettings {
    /// Output cadence.
    pub target_fps: u32,
    /// Queue depth in seconds of output; also the encoder GOP length.
    pub buffer_seconds: u32,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            target_fps: 30,
            buffer_seconds: 1,
        }
    }
}

impl BufferSettings {
    pub fn capacity(&self) -> usize {
        (self.target_fps as usize * self.buffer_seconds as usize).max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_fps == 0 {
            return Err(anyhow!("buffer target fps must be >= 1"));
        }
        if self.buffer_seconds == 0 {
            return Err(anyhow!("buffer_seconds must be >= 1"));
        }
        Ok(())
    }
}

/// Counters for one buffering session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames pulled from the upstream feed.
    pub received: u64,
    /// Frames emitted, holds included.
    pub emitted: u64,
    /// Emissions that repeated the previous frame.
    pub held: u64,
    /// Frames discarded without being emitted.
    pub dropped: u64,
    /// Ticks with nothing to emit (no frame seen yet).
    pub skipped_ticks: u64,
    /// Deepest queue observed.
    pub max_depth: usize,
}

pub struct BufferEngine {
    settings: BufferSettings,
}

impl BufferEngine {
    pub fn new(settings: BufferSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> BufferSettings {
        self.settings
    }

    /// Start a buffering session over `feed`.
    ///
    /// Each call spawns a fresh producer; a `PacedFeed` cannot be restarted.
    /// An `Err` item from `feed` ends the session: it is re-raised from the
    /// paced feed on the next tick as `PipelineError::ProducerFailure`.
    pub fn buffer<I>(&self, feed: I) -> Result<PacedFeed>
    where
        I: Iterator<Item = Result<Frame>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::new(self.settings.capacity())),
            ready: Condvar::new(),
        });
        let producer_shared = shared.clone();
        let producer = std::thread::Builder::new()
            .name("buffer-producer".to_string())
            .spawn(move || run_producer(producer_shared, feed))?;

        log::debug!(
            "buffer: started at {} fps, capacity {} frames",
            self.settings.target_fps,
            self.settings.capacity()
        );

        Ok(PacedFeed {
            shared,
            producer: Some(producer),
            interval: self.settings.interval(),
            next_deadline: Instant::now(),
            finished: false,
        })
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    // Every mutation leaves the state consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct QueueState {
    queue: VecDeque<Frame>,
    capacity: usize,
    last_frame: Option<Frame>,
    active: bool,
    producer_done: bool,
    failure: Option<anyhow::Error>,
    stats: BufferStats,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            last_frame: None,
            active: true,
            producer_done: false,
            failure: None,
            stats: BufferStats::default(),
        }
    }

    fn push(&mut self, frame: Frame) {
        self.stats.received += 1;
        if self.queue.len() >= self.capacity {
            self.stats.dropped += self.queue.len() as u64;
            self.queue.clear();
        }
        self.queue.push_back(frame);
        self.stats.max_depth = self.stats.max_depth.max(self.queue.len());
    }

    /// Newest queued frame; everything older is discarded.
    fn take_newest(&mut self) -> Option<Frame> {
        let newest = self.queue.pop_back()?;
        self.stats.dropped += self.queue.len() as u64;
        self.queue.clear();
        self.last_frame = Some(newest.clone());
        self.stats.emitted += 1;
        Some(newest)
    }

    fn hold(&mut self) -> Option<Frame> {
        let held = self.last_frame.clone()?;
        self.stats.emitted += 1;
        self.stats.held += 1;
        Some(held)
    }

    fn starved(&self) -> bool {
        self.queue.is_empty() && self.active && !self.producer_done && self.failure.is_none()
    }
}

// ----------------------------------------------------------------------------
// Producer
// ----------------------------------------------------------------------------

/// Marks the producer finished on every exit path, panics included.
struct ProducerExit(Arc<Shared>);

impl Drop for ProducerExit {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if std::thread::panicking() && state.failure.is_none() {
            state.failure = Some(anyhow!("feed panicked"));
        }
        state.producer_done = true;
        drop(state);
        self.0.ready.notify_all();
    }
}

fn run_producer<I>(shared: Arc<Shared>, mut feed: I)
where
    I: Iterator<Item = Result<Frame>>,
{
    let _exit = ProducerExit(shared.clone());
    loop {
        if !shared.lock().active {
            break;
        }
        // Upstream reads block; never hold the lock across them.
        let item = feed.next();
        let mut state = shared.lock();
        match item {
            Some(Ok(frame)) => {
                state.push(frame);
                drop(state);
                shared.ready.notify_all();
            }
            Some(Err(err)) => {
                log::error!("buffer: producer failed: {:#}", err);
                state.failure = Some(err);
                break;
            }
            None => {
                log::debug!("buffer: feed exhausted");
                break;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Consumer
// ----------------------------------------------------------------------------

/// Paced, infinite-while-active frame sequence returned by `BufferEngine::buffer`.
///
/// Dropping it stops the session.
pub struct PacedFeed {
    shared: Arc<Shared>,
    producer: Option<JoinHandle<()>>,
    interval: Duration,
    next_deadline: Instant,
    finished: bool,
}

impl PacedFeed {
    pub fn stats(&self) -> BufferStats {
        self.shared.lock().stats
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn is_active(&self) -> bool {
        !self.finished && self.shared.lock().active
    }

    /// Deactivate, wake any waiter, and join the producer for at most
    /// `PRODUCER_JOIN_TIMEOUT`. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.finished = true;
        self.shared.lock().active = false;
        self.shared.ready.notify_all();

        let Some(handle) = self.producer.take() else {
            return;
        };
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .ready
            .wait_timeout_while(state, PRODUCER_JOIN_TIMEOUT, |s| !s.producer_done)
            .unwrap_or_else(PoisonError::into_inner);
        let done = state.producer_done;
        let stats = state.stats;
        drop(state);

        if done {
            if handle.join().is_err() {
                log::error!("buffer: producer thread panicked");
            }
        } else {
            log::warn!(
                "buffer: producer still blocked after {:?}; detaching",
                PRODUCER_JOIN_TIMEOUT
            );
        }
        log::info!(
            "buffer: stopped received={} emitted={} held={} dropped={} max_depth={}",
            stats.received,
            stats.emitted,
            stats.held,
            stats.dropped,
            stats.max_depth
        );
    }

    /// Sleep to the current deadline, then advance it by exactly one period.
    fn wait_for_tick(&mut self) {
        let now = Instant::now();
        if self.next_deadline > now {
            std::thread::sleep(self.next_deadline - now);
        }
        self.next_deadline += self.interval;
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<Frame>> {
        self.stop();
        let reason = format!("{:#}", err);
        Some(Err(anyhow::Error::new(PipelineError::ProducerFailure(reason))))
    }

    fn end(&mut self) -> Option<Result<Frame>> {
        self.stop();
        None
    }
}

impl Iterator for PacedFeed {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            self.wait_for_tick();

            let mut state = self.shared.lock();
            if let Some(err) = state.failure.take() {
                drop(state);
                return self.fail(err);
            }
            if let Some(frame) = state.take_newest() {
                return Some(Ok(frame));
            }
            if state.producer_done || !state.active {
                drop(state);
                return self.end();
            }

            // Underflow: give the producer up to one period.
            let (mut state, _) = self
                .shared
                .ready
                .wait_timeout_while(state, self.interval, |s| s.starved())
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = state.failure.take() {
                drop(state);
                return self.fail(err);
            }
            if let Some(frame) = state.take_newest() {
                return Some(Ok(frame));
            }
            if state.producer_done || !state.active {
                drop(state);
                return self.end();
            }
            if let Some(frame) = state.hold() {
                return Some(Ok(frame));
            }
            state.stats.skipped_ticks += 1;
        }
    }
}

impl Drop for PacedFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn frame(i: u8) -> Frame {
        Frame::solid(4, 4, PixelFormat::Bgr24, [i, i, i], i as f64)
    }

    fn settings(fps: u32, seconds: u32) -> BufferSettings {
        BufferSettings {
            target_fps: fps,
            buffer_seconds: seconds,
        }
    }

    #[test]
    fn capacity_is_fps_times_seconds() {
        assert_eq!(settings(30, 5).capacity(), 150);
        assert!(BufferEngine::new(settings(0, 1)).is_err());
        assert!(BufferEngine::new(settings(30, 0)).is_err());
    }

    #[test]
    fn push_over_capacity_keeps_only_newest() {
        let mut state = QueueState::new(3);
        for i in 0..3 {
            state.push(frame(i));
        }
        state.push(frame(9));
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.stats.dropped, 3);
        assert_eq!(state.stats.max_depth, 3);
        assert_eq!(state.take_newest().map(|f| f.timestamp), Some(9.0));
    }

    #[test]
    fn take_newest_discards_older_frames() {
        let mut state = QueueState::new(10);
        for i in 0..4 {
            state.push(frame(i));
        }
        let newest = state.take_newest().expect("frame");
        assert_eq!(newest.timestamp, 3.0);
        assert!(state.queue.is_empty());
        assert_eq!(state.stats.dropped, 3);
        assert!(state.last_frame.is_some());
    }

    #[test]
    fn exhausted_feed_ends_the_sequence() -> Result<()> {
        let engine = BufferEngine::new(settings(100, 1))?;
        let paced = engine.buffer((0..3u8).map(|i| Ok(frame(i))))?;
        let out: Vec<Frame> = paced.collect::<Result<_>>()?;
        assert!(!out.is_empty());
        assert_eq!(out.last().map(|f| f.timestamp), Some(2.0));
        Ok(())
    }

    #[test]
    fn empty_feed_emits_nothing() -> Result<()> {
        let engine = BufferEngine::new(settings(100, 1))?;
        let mut paced = engine.buffer(std::iter::empty::<Result<Frame>>())?;
        assert!(paced.next().is_none());
        Ok(())
    }

    #[test]
    fn producer_error_is_reraised_once() -> Result<()> {
        let engine = BufferEngine::new(settings(100, 1))?;
        let feed = vec![Ok(frame(1)), Err(anyhow!("sensor unplugged"))].into_iter();
        let mut paced = engine.buffer(feed)?;

        let mut saw_failure = false;
        for item in paced.by_ref() {
            if let Err(err) = item {
                assert!(matches!(
                    PipelineError::classify(&err),
                    Some(PipelineError::ProducerFailure(reason)) if reason.contains("sensor unplugged")
                ));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert!(paced.next().is_none());
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let engine = BufferEngine::new(settings(100, 1))?;
        let mut paced = engine.buffer(std::iter::repeat_with(|| Ok(frame(1))))?;
        assert!(paced.next().is_some());
        paced.stop();
        paced.stop();
        assert!(paced.next().is_none());
        assert!(!paced.is_active());
        Ok(())
    }
}
