use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use dualcam::pipeline::DetectorFactory;
use dualcam::{
    CenterDetections, DetectionProvider, RigConfig, SessionOutcome, StreamCommand, StreamService,
};

fn small_rig() -> Result<RigConfig> {
    let mut file = NamedTempFile::new()?;
    file.write_all(
        br#"
        [camera]
        device = "synthetic"
        mode = "640x360_30"

        [stream]
        url = "null://"
        width = 64
        height = 36
        fps = 15
        buffer_seconds = 1
        "#,
    )?;
    RigConfig::load_from(Some(file.path()))
}

fn detector() -> DetectorFactory {
    Arc::new(|| Box::new(CenterDetections) as Box<dyn DetectionProvider>)
}

fn command(service: &mut StreamService, line: &str) -> Result<dualcam::service::ServiceStatus> {
    service.handle(line.parse::<StreamCommand>()?)
}

#[test]
fn commands_drive_cameras_and_stream() -> Result<()> {
    let mut service = StreamService::from_config(&small_rig()?, detector())?;

    let status = command(&mut service, "status")?;
    assert!(!status.active && !status.streaming);
    assert!(!status.left_camera && !status.right_camera);

    // Inactive: focus is ignored, streaming is refused.
    assert!(!service.focus()?);
    assert!(command(&mut service, "stream").is_err());

    let status = command(&mut service, "start")?;
    assert!(status.active && status.left_camera && status.right_camera);
    assert!(service.focus()?);

    let status = command(&mut service, "stream")?;
    assert!(status.streaming);
    // A second request while streaming is a no-op.
    let status = command(&mut service, "stream null://")?;
    assert!(status.streaming);

    std::thread::sleep(Duration::from_millis(600));

    let status = command(&mut service, "stop")?;
    assert!(!status.active && !status.streaming);
    assert!(!status.left_camera && !status.right_camera);
    let report = status.last_session.expect("session report");
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert!(report.frames > 0, "{:?}", report);

    // Stop again: nothing left to do.
    let status = command(&mut service, "stop")?;
    assert!(!status.active);
    Ok(())
}

#[test]
fn restart_brings_cameras_back() -> Result<()> {
    let mut service = StreamService::from_config(&small_rig()?, detector())?;
    command(&mut service, "start")?;
    let status = command(&mut service, "restart")?;
    assert!(status.active && status.left_camera && status.right_camera);

    command(&mut service, "stream")?;
    std::thread::sleep(Duration::from_millis(300));
    let report = service.stop().expect("report");
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert!(!service.status().active);
    Ok(())
}

#[test]
fn unknown_commands_are_rejected() {
    assert!("zoom in".parse::<StreamCommand>().is_err());
    assert_eq!(
        "Restart".parse::<StreamCommand>().ok(),
        Some(StreamCommand::Restart)
    );
}
