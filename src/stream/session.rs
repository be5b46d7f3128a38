use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{open_sink, EncoderSettings, MuxSink, StreamProtocol};
use crate::frame::Frame;
use crate::PipelineError;

/// How long `stop` waits for the worker before detaching it.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of leading pts values logged at debug level.
const LOGGED_PTS: i64 = 3;

/// Presentation timestamps at time base `1 / fps`: one tick per frame.
#[derive(Clone, Copy, Debug)]
pub struct PtsClock {
    fps: u32,
    next: i64,
}

impl PtsClock {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            next: 0,
        }
    }

    /// (numerator, denominator) of the stream time base.
    pub fn time_base(&self) -> (i32, i32) {
        (1, self.fps as i32)
    }

    pub fn next_pts(&mut self) -> i64 {
        let pts = self.next;
        self.next += 1;
        pts
    }

    pub fn seconds(&self, pts: i64) -> f64 {
        pts as f64 / self.fps as f64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Feed exhausted; encoder flushed and container closed.
    Completed,
    /// The muxer hit end of stream (peer went away).
    EndedByPeer,
    /// Upstream or mux failure.
    Aborted(String),
    /// `stop` was called.
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub frames: u64,
    pub packets: u64,
    pub last_pts: Option<i64>,
    pub outcome: SessionOutcome,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: mpsc::Receiver<SessionReport>,
    target: String,
}

/// One live encode/mux session. At most one worker at a time.
pub struct StreamSession {
    settings: EncoderSettings,
    worker: Option<Worker>,
    last_report: Option<SessionReport>,
}

impl StreamSession {
    pub fn new(settings: EncoderSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            worker: None,
            last_report: None,
        })
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// True while a worker is running.
    pub fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.handle.is_finished())
    }

    /// Report of the most recently finished worker.
    pub fn last_report(&self) -> Option<&SessionReport> {
        self.last_report.as_ref()
    }

    /// Stream `feed` to `url`. A no-op while a worker is already running.
    pub fn start<I>(&mut self, feed: I, url: &str) -> Result<()>
    where
        I: Iterator<Item = Result<Frame>> + Send + 'static,
    {
        if self.is_active() {
            log::warn!("stream session already active; ignoring start for {}", url);
            return Ok(());
        }
        let protocol = StreamProtocol::from_url(url)?;
        let sink = open_sink(url, &self.settings)?;
        log::info!(
            "stream session: {} {}x{} @ {} fps, {} bps, gop {} -> {} ({})",
            sink.name(),
            self.settings.resolution.0,
            self.settings.resolution.1,
            self.settings.fps,
            self.settings.bitrate,
            self.settings.gop_size(),
            url,
            protocol.name()
        );
        self.start_with_sink(feed, sink, url)
    }

    /// Like `start`, with a caller-supplied sink.
    pub fn start_with_sink<I>(&mut self, feed: I, sink: Box<dyn MuxSink>, target: &str) -> Result<()>
    where
        I: Iterator<Item = Result<Frame>> + Send + 'static,
    {
        if self.is_active() {
            log::warn!("stream session already active; ignoring start for {}", target);
            return Ok(());
        }
        // Collect whatever a previous worker left behind.
        self.reap();

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let worker_stop = stop.clone();
        let fps = self.settings.fps;
        let handle = std::thread::Builder::new()
            .name("stream-session".to_string())
            .spawn(move || {
                let report = run_session(feed, sink, PtsClock::new(fps), &worker_stop);
                let _ = done_tx.send(report);
            })?;

        self.worker = Some(Worker {
            stop,
            handle,
            done: done_rx,
            target: target.to_string(),
        });
        Ok(())
    }

    /// Request cancellation and join the worker for at most
    /// `WORKER_JOIN_TIMEOUT`. Idempotent; returns the last report.
    pub fn stop(&mut self) -> Option<SessionReport> {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            self.finish(worker, Some(WORKER_JOIN_TIMEOUT));
        }
        self.last_report.clone()
    }

    /// Block until the worker ends on its own.
    pub fn wait(&mut self) -> Option<SessionReport> {
        if let Some(worker) = self.worker.take() {
            self.finish(worker, None);
        }
        self.last_report.clone()
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.finish(worker, Some(Duration::ZERO));
        }
    }

    fn finish(&mut self, worker: Worker, timeout: Option<Duration>) {
        let received = match timeout {
            Some(timeout) => worker.done.recv_timeout(timeout),
            None => worker.done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(report) => {
                if worker.handle.join().is_err() {
                    log::error!("stream session: worker thread panicked");
                }
                log::info!(
                    "stream session to {} ended: {:?} frames={} packets={}",
                    worker.target,
                    report.outcome,
                    report.frames,
                    report.packets
                );
                self.last_report = Some(report);
            }
            Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("stream session: worker thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "stream session to {}: worker still busy after {:?}; detaching",
                    worker.target,
                    timeout.unwrap_or_default()
                );
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_session<I>(
    mut feed: I,
    mut sink: Box<dyn MuxSink>,
    mut clock: PtsClock,
    stop: &AtomicBool,
) -> SessionReport
where
    I: Iterator<Item = Result<Frame>>,
{
    let mut frames = 0u64;
    let mut packets = 0u64;
    let mut last_pts = None;

    let mut outcome = loop {
        if stop.load(Ordering::SeqCst) {
            break SessionOutcome::Cancelled;
        }
        let frame = match feed.next() {
            None => break SessionOutcome::Completed,
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                log::error!("stream session: feed failed: {:#}", err);
                break SessionOutcome::Aborted(format!("{:#}", err));
            }
        };
        let pts = clock.next_pts();
        if pts < LOGGED_PTS {
            log::debug!("stream session: pts={} t={:.6}s", pts, clock.seconds(pts));
        }
        match sink.encode(&frame, pts) {
            Ok(written) => {
                frames += 1;
                packets += written as u64;
                last_pts = Some(pts);
            }
            Err(err) => break failure_outcome("encode", &err),
        }
    };
    // Release the upstream (and its threads) before the potentially slow flush.
    drop(feed);

    // Flush precedes close on every path.
    match sink.flush() {
        Ok(written) => packets += written as u64,
        Err(err) => {
            let flushed = failure_outcome("flush", &err);
            if matches!(outcome, SessionOutcome::Completed | SessionOutcome::Cancelled) {
                outcome = flushed;
            }
        }
    }
    if let Err(err) = sink.close() {
        log::error!("stream session: close failed: {:#}", err);
        if outcome == SessionOutcome::Completed {
            outcome = SessionOutcome::Aborted(format!("close: {:#}", err));
        }
    }

    SessionReport {
        frames,
        packets,
        last_pts,
        outcome,
    }
}

fn failure_outcome(step: &str, err: &anyhow::Error) -> SessionOutcome {
    match PipelineError::classify(err) {
        Some(PipelineError::EncoderEof) => {
            log::warn!("stream session: stream ended by peer during {}", step);
            SessionOutcome::EndedByPeer
        }
        _ => {
            log::error!("stream session: {} failed: {:#}", step, err);
            SessionOutcome::Aborted(format!("{}: {:#}", step, err))
        }
    }
}
