//! demo - end-to-end synthetic run of the dual-camera streamer
//!
//! Two synthetic cameras (with jitter, and stalls on the right one) feed the
//! fusion pipeline; the fused feed is paced by the buffer engine and handed
//! to a stream session. Defaults to `null://`, which needs no FFmpeg.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use dualcam::camera::SyntheticConfig;
use dualcam::detect::SweepDetections;
use dualcam::pipeline::{DetectorFactory, FusionSettings};
use dualcam::{
    BufferEngine, Camera, CameraProfile, DetectionProvider, Device, EncoderSettings, Lens,
    RigGeometry, StreamSession, SyntheticGrabber, ThreadedCamera, VideoService,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration of the run in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Output frames per second.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Output width (even).
    #[arg(long, default_value_t = 640)]
    width: u32,
    /// Output height (even).
    #[arg(long, default_value_t = 360)]
    height: u32,
    /// Stream target: null://, file:///path.flv or rtmp://host/app/key.
    #[arg(long, default_value = "null://")]
    url: String,
    /// Right camera freezes for 150 ms every N frames (0 disables).
    #[arg(long, default_value_t = 45)]
    stall_every: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    stage("open synthetic cameras");
    let profile = CameraProfile::resolve(Device::Synthetic, None, None)?;
    let (width, height) = profile.resolution();
    let camera_config = SyntheticConfig {
        width,
        height,
        fps: profile.mode.fps,
        format: profile.format,
        jitter: 0.2,
        ..SyntheticConfig::default()
    };
    let left = Arc::new(ThreadedCamera::new(
        0,
        profile,
        SyntheticGrabber::new(camera_config.clone()),
    ));
    let right = Arc::new(ThreadedCamera::new(
        1,
        profile,
        SyntheticGrabber::new(SyntheticConfig {
            stall_every: args.stall_every,
            stall: Duration::from_millis(150),
            ..camera_config
        }),
    ));

    let lens = Lens::default();
    let overlap = RigGeometry::default().overlap_px(width, &lens)?;
    let output = (args.width, args.height);
    let fusion = FusionSettings::new(output, profile.mode.fps, width, overlap)?;
    let step = (width as f64 / 90.0).max(1.0);
    let detector: DetectorFactory = Arc::new(move || {
        Box::new(SweepDetections::new(overlap, step, 3)) as Box<dyn DetectionProvider>
    });
    let video = VideoService::new(left.clone(), right.clone(), fusion, detector);

    let encoder = EncoderSettings {
        resolution: output,
        fps: args.fps,
        buffer_seconds: 1,
        ..EncoderSettings::default()
    };
    let mut session = StreamSession::new(encoder.clone())?;

    stage("start capture");
    video.start()?;

    stage("stream fused feed");
    let paced = BufferEngine::new(encoder.buffer_settings())?.buffer(video.frames()?)?;
    session.start(paced, &args.url)?;
    std::thread::sleep(Duration::from_secs(args.seconds));

    stage("stop");
    let report = session.stop();
    video.stop();

    println!("demo summary:");
    println!("  overlap band: {} px of {}", overlap, width);
    for (name, camera) in [("left", &left), ("right", &right)] {
        let stats = camera.stats();
        println!(
            "  {} camera {}: captured={} replaced={} errors={}",
            name,
            camera.index(),
            stats.frames_captured,
            stats.frames_replaced,
            stats.grab_errors
        );
    }
    match report {
        Some(report) => {
            println!("  stream target: {}", args.url);
            println!("  outcome: {:?}", report.outcome);
            println!("  frames encoded: {}", report.frames);
            println!("  packets written: {}", report.packets);
            println!(
                "  expected at {} fps: ~{}",
                args.fps,
                args.seconds * args.fps as u64
            );
        }
        None => println!("  stream session produced no report"),
    }
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
