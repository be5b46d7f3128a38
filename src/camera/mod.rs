//! Camera capture.
//!
//! A camera is split in two layers:
//!
//! - `FrameGrabber`: the device-specific, blocking "give me the next frame"
//!   primitive (synthetic generator, GStreamer appsink).
//! - `Camera`: the capability interface the rest of the pipeline uses
//!   (`start` / `stop` / `status` / `focus` / `capture`).
//!
//! `ThreadedCamera` joins the two: one capture thread per camera drains the
//! grabber into a single-slot `FrameSlot`, so `capture` never observes a frame
//! older than one capture interval.
//!
//! The capture layer MUST NOT:
//! - Block `capture` past its configured timeout
//! - Queue more than one frame per camera

pub mod profile;
mod slot;
mod synthetic;

#[cfg(feature = "capture-gstreamer")]
mod gstreamer;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::PipelineError;

pub use profile::CameraProfile;
use profile::Device;
pub use slot::{FrameSlot, SlotRead};
pub use synthetic::{SyntheticConfig, SyntheticGrabber};

#[cfg(feature = "capture-gstreamer")]
pub use self::gstreamer::GstreamerGrabber;

/// Default wait for one `capture` call.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long `stop` waits for the capture thread before detaching it.
pub const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Back-off after a failed grab, so a dead device does not spin the thread.
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Blocking, device-specific frame source. Driven from a single thread.
pub trait FrameGrabber: Send {
    fn name(&self) -> &'static str;

    /// Acquire the device. Called on every `Camera::start`.
    fn open(&mut self) -> Result<()>;

    /// Block until the next frame. Implementations bound the wait themselves.
    fn grab(&mut self) -> Result<Frame>;

    /// Release the device.
    fn close(&mut self) {}

    /// Trigger autofocus where the lens supports it.
    fn focus(&mut self) -> Result<()> {
        Ok(())
    }
}

/// What the pipeline needs from a camera.
pub trait Camera: Send + Sync {
    /// Position in the rig: 0 = left, 1 = right.
    fn index(&self) -> usize;

    fn profile(&self) -> &CameraProfile;

    /// Start capturing. No-op when already running.
    fn start(&self) -> Result<()>;

    /// Stop capturing. Idempotent.
    fn stop(&self);

    fn status(&self) -> bool;

    fn focus(&self) -> Result<()>;

    /// Newest frame, waiting at most the capture timeout.
    ///
    /// Fails with `PipelineError::CaptureTimeout` when nothing arrives in time.
    fn capture(&self) -> Result<Frame>;

    fn restart(&self) -> Result<()> {
        self.stop();
        self.start()
    }
}

/// Capture counters for one camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_replaced: u64,
    pub grab_errors: u64,
}

#[derive(Default)]
struct CaptureCounters {
    captured: AtomicU64,
    replaced: AtomicU64,
    errors: AtomicU64,
}

/// The grabber plus the capture run that currently holds it open.
struct GrabberCell {
    grabber: Box<dyn FrameGrabber>,
    owner: Option<u64>,
}

impl GrabberCell {
    /// Close the device if `run` still owns it.
    fn release(&mut self, run: u64) {
        if self.owner == Some(run) {
            self.grabber.close();
            self.owner = None;
        }
    }
}

/// Per-run state shared with one capture thread.
struct CaptureRun {
    id: u64,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// `Camera` backed by a `FrameGrabber` running on its own thread.
///
/// Only the capture thread touches the grabber while a run is live; `stop`
/// never waits on it past `CAPTURE_JOIN_TIMEOUT`.
pub struct ThreadedCamera {
    index: usize,
    profile: CameraProfile,
    grabber_name: &'static str,
    grabber: Arc<Mutex<GrabberCell>>,
    slot: Arc<FrameSlot>,
    active: AtomicBool,
    focus_requested: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    runs: AtomicU64,
    worker: Mutex<Option<CaptureRun>>,
    capture_timeout: Duration,
}

impl ThreadedCamera {
    pub fn new<G: FrameGrabber + 'static>(index: usize, profile: CameraProfile, grabber: G) -> Self {
        Self {
            index,
            profile,
            grabber_name: grabber.name(),
            grabber: Arc::new(Mutex::new(GrabberCell {
                grabber: Box::new(grabber),
                owner: None,
            })),
            slot: Arc::new(FrameSlot::new()),
            active: AtomicBool::new(false),
            focus_requested: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CaptureCounters::default()),
            runs: AtomicU64::new(0),
            worker: Mutex::new(None),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_replaced: self.counters.replaced.load(Ordering::Relaxed),
            grab_errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<CaptureRun>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_grabber(grabber: &Mutex<GrabberCell>) -> MutexGuard<'_, GrabberCell> {
    grabber.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Camera for ThreadedCamera {
    fn index(&self) -> usize {
        self.index
    }

    fn profile(&self) -> &CameraProfile {
        &self.profile
    }

    fn start(&self) -> Result<()> {
        let mut worker = self.worker();
        if self.active.load(Ordering::SeqCst) {
            log::debug!("camera {}: already running", self.index);
            return Ok(());
        }

        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        {
            // A detached run from an earlier stop releases the device when
            // its grab returns; this waits for that grab at most.
            let mut cell = lock_grabber(&self.grabber);
            if let Some(previous) = cell.owner {
                cell.release(previous);
            }
            cell.grabber
                .open()
                .map_err(|e| anyhow!("camera {}: failed to open: {:#}", self.index, e))?;
            cell.owner = Some(run);
        }
        self.slot.reopen();
        self.focus_requested.store(false, Ordering::SeqCst);

        let running = Arc::new(AtomicBool::new(true));
        let context = CaptureContext {
            index: self.index,
            run,
            grabber: self.grabber.clone(),
            slot: self.slot.clone(),
            running: running.clone(),
            focus_requested: self.focus_requested.clone(),
            counters: self.counters.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("camera-{}", self.index))
            .spawn(move || capture_loop(context));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                lock_grabber(&self.grabber).release(run);
                return Err(err.into());
            }
        };
        *worker = Some(CaptureRun {
            id: run,
            running,
            handle,
        });
        self.active.store(true, Ordering::SeqCst);

        log::info!(
            "camera {}: started {} ({}x{} @ {} fps, {})",
            self.index,
            self.grabber_name,
            self.profile.mode.width,
            self.profile.mode.height,
            self.profile.mode.fps,
            self.profile.format.name()
        );
        Ok(())
    }

    fn stop(&self) {
        let mut worker = self.worker();
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.slot.close();

        if let Some(capture) = worker.take() {
            capture.running.store(false, Ordering::SeqCst);
            let deadline = Instant::now() + CAPTURE_JOIN_TIMEOUT;
            while !capture.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if capture.handle.is_finished() {
                if capture.handle.join().is_err() {
                    log::error!("camera {}: capture thread panicked", self.index);
                    lock_grabber(&self.grabber).release(capture.id);
                }
            } else {
                // The thread closes the device itself once its grab returns.
                log::warn!(
                    "camera {}: capture thread still blocked after {:?}; detaching",
                    self.index,
                    CAPTURE_JOIN_TIMEOUT
                );
            }
        }

        let stats = self.stats();
        log::info!(
            "camera {}: stopped frames={} replaced={} errors={}",
            self.index,
            stats.frames_captured,
            stats.frames_replaced,
            stats.grab_errors
        );
    }

    fn status(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Queues an autofocus; the capture thread runs it before its next grab.
    fn focus(&self) -> Result<()> {
        if !self.status() {
            return Err(anyhow!("camera {} is not running", self.index));
        }
        self.focus_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn capture(&self) -> Result<Frame> {
        if !self.status() {
            return Err(anyhow!("camera {} is not running", self.index));
        }
        match self.slot.take(self.capture_timeout) {
            SlotRead::Frame(frame) => Ok(frame),
            SlotRead::Timeout => Err(PipelineError::CaptureTimeout {
                camera: self.index,
                waited: self.capture_timeout,
            }
            .into()),
            SlotRead::Closed => Err(anyhow!("camera {} stopped", self.index)),
        }
    }
}

impl Drop for ThreadedCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Camera for `profile` at rig position `index`, backed by the grabber its
/// device calls for.
pub fn open_camera(
    profile: CameraProfile,
    index: usize,
    capture_timeout: Duration,
) -> Result<ThreadedCamera> {
    let camera = match profile.device {
        Device::Synthetic => {
            let grabber = SyntheticGrabber::new(SyntheticConfig {
                width: profile.mode.width,
                height: profile.mode.height,
                fps: profile.mode.fps,
                format: profile.format,
                jitter: 0.1,
                ..SyntheticConfig::default()
            });
            ThreadedCamera::new(index, profile, grabber)
        }
        #[cfg(feature = "capture-gstreamer")]
        Device::Jetson | Device::RaspberryPi => {
            let grabber = GstreamerGrabber::new(&profile, index)?;
            ThreadedCamera::new(index, profile, grabber)
        }
        #[cfg(not(feature = "capture-gstreamer"))]
        device => {
            return Err(crate::PipelineError::config(format!(
                "{} capture requires the capture-gstreamer feature",
                device.name()
            )))
        }
    };
    Ok(camera.with_capture_timeout(capture_timeout))
}

struct CaptureContext {
    index: usize,
    run: u64,
    grabber: Arc<Mutex<GrabberCell>>,
    slot: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
    focus_requested: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
}

fn capture_loop(ctx: CaptureContext) {
    let index = ctx.index;
    let mut last_timestamp = f64::NEG_INFINITY;
    loop {
        let grabbed = {
            let mut cell = lock_grabber(&ctx.grabber);
            if !ctx.running.load(Ordering::SeqCst) {
                cell.release(ctx.run);
                break;
            }
            if ctx.focus_requested.swap(false, Ordering::SeqCst) {
                match cell.grabber.focus() {
                    Ok(()) => log::info!("camera {}: autofocus triggered", index),
                    Err(err) => log::warn!("camera {}: autofocus failed: {:#}", index, err),
                }
            }
            let grabbed = cell.grabber.grab();
            // Checked under the same lock, so a later run's open is never closed here.
            if !ctx.running.load(Ordering::SeqCst) {
                cell.release(ctx.run);
                break;
            }
            grabbed
        };
        match grabbed {
            Ok(frame) => {
                if frame.timestamp <= last_timestamp {
                    log::warn!(
                        "camera {}: dropping frame with non-increasing timestamp {:.6}",
                        index,
                        frame.timestamp
                    );
                    continue;
                }
                last_timestamp = frame.timestamp;
                ctx.counters.captured.fetch_add(1, Ordering::Relaxed);
                if ctx.slot.put(frame) {
                    ctx.counters.replaced.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                ctx.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("camera {}: grab failed: {:#}", index, err);
                std::thread::sleep(GRAB_RETRY_DELAY);
            }
        }
    }
    log::debug!("camera {}: capture loop exited", index);
}
