//! dualcamd - dual-camera live streaming daemon
//!
//! This daemon:
//! 1. Loads the rig configuration (file + DUALCAM_* environment)
//! 2. Opens both cameras and starts capture
//! 3. Streams the fused, paced feed to the configured URL
//! 4. Optionally accepts controller commands on stdin
//! 5. Stops the session, then the cameras, on Ctrl-C or when the stream ends

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dualcam::detect::SweepDetections;
use dualcam::pipeline::DetectorFactory;
use dualcam::service::ServiceStatus;
use dualcam::{CenterDetections, DetectionProvider, RigConfig, StreamCommand, StreamService};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DetectorKind {
    /// Ball fixed at the frame centre.
    Center,
    /// Ball sweeping across both cameras.
    Sweep,
}

#[derive(Parser, Debug)]
#[command(
    name = "dualcamd",
    version,
    about = "Dual-camera ball-following live streamer"
)]
struct Args {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, env = "DUALCAM_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stream target; overrides the configured URL for the first session.
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Detection source feeding the tracker.
    #[arg(long, value_enum, default_value = "sweep")]
    detector: DetectorKind,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Read controller commands (start, stop, restart, status, focus,
    /// stream [url]) from stdin instead of streaming immediately.
    #[arg(long)]
    interactive: bool,
}

enum Event {
    Shutdown,
    Command(String),
    InputClosed,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = RigConfig::load_from(args.config.as_deref())?;
    let detector = detector_factory(args.detector, &config)?;
    let mut service = StreamService::from_config(&config, detector)?;

    let (tx, rx) = mpsc::channel();
    let shutdown_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(Event::Shutdown);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    if args.interactive {
        spawn_command_reader(tx)?;
        log::info!("dualcamd waiting for commands on stdin");
    } else {
        service.start()?;
        service.stream(args.url.as_deref())?;
        log::info!("dualcamd streaming; Ctrl-C to stop");
    }

    let deadline = args.duration.map(|s| Instant::now() + Duration::from_secs(s));
    let mut last_health_log = Instant::now();
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Event::Shutdown) => {
                log::info!("shutdown signal received");
                break;
            }
            Ok(Event::Command(line)) => match line.parse::<StreamCommand>() {
                Ok(command) => match service.handle(command) {
                    Ok(status) => print_status(&status),
                    Err(e) => log::error!("command '{}' failed: {:#}", line.trim(), e),
                },
                Err(e) => log::warn!("{:#}", e),
            },
            Ok(Event::InputClosed) => {
                log::info!("stdin closed");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            log::info!("duration elapsed");
            break;
        }
        let status = service.status();
        if !args.interactive && !status.streaming {
            log::warn!("stream session ended on its own");
            break;
        }
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!(
                "health: active={} streaming={} left={} right={}",
                status.active,
                status.streaming,
                status.left_camera,
                status.right_camera
            );
            last_health_log = Instant::now();
        }
    }

    match service.stop() {
        Some(report) => log::info!(
            "last session: {:?} frames={} packets={} last_pts={:?}",
            report.outcome,
            report.frames,
            report.packets,
            report.last_pts
        ),
        None => log::info!("no stream session ran"),
    }
    Ok(())
}

fn detector_factory(kind: DetectorKind, config: &RigConfig) -> Result<DetectorFactory> {
    let factory: DetectorFactory = match kind {
        DetectorKind::Center => {
            Arc::new(|| Box::new(CenterDetections) as Box<dyn DetectionProvider>)
        }
        DetectorKind::Sweep => {
            let width = config.camera_profile()?.mode.width;
            let overlap = config.geometry.overlap_px(width, &config.lens)?;
            let step = (width as f64 / 120.0).max(1.0);
            Arc::new(move || {
                Box::new(SweepDetections::new(overlap, step, 4)) as Box<dyn DetectionProvider>
            })
        }
    };
    Ok(factory)
}

fn spawn_command_reader(tx: mpsc::Sender<Event>) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(Event::Command(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Event::InputClosed);
        })?;
    Ok(())
}

fn print_status(status: &ServiceStatus) {
    println!(
        "active={} streaming={} left={} right={}",
        status.active, status.streaming, status.left_camera, status.right_camera
    );
    if let Some(report) = &status.last_session {
        println!(
            "last_session outcome={:?} frames={} packets={}",
            report.outcome, report.frames, report.packets
        );
    }
}
