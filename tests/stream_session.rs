use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use dualcam::stream::SinkCall;
use dualcam::{
    EncoderSettings, Frame, MuxSink, NullSink, PipelineError, PixelFormat, SessionOutcome,
    StreamSession,
};

fn settings() -> EncoderSettings {
    EncoderSettings {
        resolution: (16, 8),
        fps: 10,
        buffer_seconds: 1,
        ..EncoderSettings::default()
    }
}

fn frame(i: u64) -> Frame {
    Frame::solid(16, 8, PixelFormat::Bgr24, [0, 128, 255], i as f64 / 10.0)
}

fn frames(n: u64) -> impl Iterator<Item = Result<Frame>> + Send + 'static {
    (0..n).map(|i| Ok(frame(i)))
}

/// Frames forever, at roughly the stream rate.
fn live_feed() -> impl Iterator<Item = Result<Frame>> + Send + 'static {
    (0..).map(|i| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(frame(i))
    })
}

/// Fails `encode` after `ok_frames` frames with the given error.
struct FailingSink {
    ok_frames: usize,
    error: PipelineError,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl FailingSink {
    fn new(ok_frames: usize, error: PipelineError) -> (Self, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                ok_frames,
                error,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl MuxSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn encode(&mut self, _frame: &Frame, _pts: i64) -> Result<usize> {
        let mut calls = self.calls.lock().unwrap();
        if calls.len() >= self.ok_frames {
            return Err(self.error.clone().into());
        }
        calls.push("encode");
        Ok(1)
    }

    fn flush(&mut self) -> Result<usize> {
        self.calls.lock().unwrap().push("flush");
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push("close");
        Ok(())
    }
}

#[test]
fn pts_are_monotonic_with_keyframes_every_gop() -> Result<()> {
    let settings = settings();
    let sink = NullSink::new(settings.gop_size());
    let recorder = sink.recorder();
    let mut session = StreamSession::new(settings)?;

    session.start_with_sink(frames(35), Box::new(sink), "null://")?;
    let report = session.wait().expect("report");

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.frames, 35);
    assert_eq!(report.last_pts, Some(34));
    assert_eq!(recorder.pts(), (0..35).collect::<Vec<i64>>());
    assert_eq!(recorder.keyframe_indices(), vec![0, 10, 20, 30]);
    let calls = recorder.calls();
    assert_eq!(&calls[35..], &[SinkCall::Flush, SinkCall::Close]);
    Ok(())
}

#[test]
fn peer_eof_ends_session_after_flush_and_close() -> Result<()> {
    let (sink, calls) = FailingSink::new(3, PipelineError::EncoderEof);
    let mut session = StreamSession::new(settings())?;
    session.start_with_sink(frames(20), Box::new(sink), "rtmp://peer/live/key")?;
    let report = session.wait().expect("report");

    assert_eq!(report.outcome, SessionOutcome::EndedByPeer);
    assert_eq!(report.frames, 3);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["encode", "encode", "encode", "flush", "close"]
    );
    Ok(())
}

#[test]
fn muxer_io_error_aborts_session() -> Result<()> {
    let (sink, calls) = FailingSink::new(1, PipelineError::MuxerIo("broken pipe".into()));
    let mut session = StreamSession::new(settings())?;
    session.start_with_sink(frames(5), Box::new(sink), "rtmp://peer/live/key")?;
    let report = session.wait().expect("report");

    match &report.outcome {
        SessionOutcome::Aborted(reason) => assert!(reason.contains("broken pipe"), "{}", reason),
        other => panic!("expected abort, got {:?}", other),
    }
    assert_eq!(calls.lock().unwrap().last(), Some(&"close"));
    Ok(())
}

#[test]
fn second_start_while_active_is_ignored() -> Result<()> {
    let first = NullSink::new(10);
    let first_calls = first.recorder();
    let second = NullSink::new(10);
    let second_calls = second.recorder();

    let mut session = StreamSession::new(settings())?;
    session.start_with_sink(live_feed(), Box::new(first), "null://")?;
    assert!(session.is_active());
    session.start_with_sink(live_feed(), Box::new(second), "null://")?;
    std::thread::sleep(Duration::from_millis(100));

    let report = session.stop().expect("report");
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert!(report.frames > 0);
    assert!(!session.is_active());
    assert_eq!(first_calls.calls().last(), Some(&SinkCall::Close));
    assert!(second_calls.calls().is_empty());

    // Stop is idempotent and keeps the last report.
    assert_eq!(session.stop(), Some(report));
    Ok(())
}

#[test]
fn session_can_run_again_after_stop() -> Result<()> {
    let mut session = StreamSession::new(settings())?;
    session.start(live_feed(), "null://")?;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        session.stop().map(|r| r.outcome),
        Some(SessionOutcome::Cancelled)
    );

    session.start(frames(4), "null://")?;
    let report = session.wait().expect("report");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.frames, 4);
    assert_eq!(report.last_pts, Some(3));
    Ok(())
}

#[test]
fn invalid_targets_and_settings_are_configuration_errors() {
    let mut session = StreamSession::new(settings()).expect("session");
    let err = session
        .start(frames(1), "gopher://nowhere")
        .expect_err("unsupported scheme");
    assert!(matches!(
        PipelineError::classify(&err),
        Some(PipelineError::Configuration(_))
    ));
    assert!(!session.is_active());

    let odd = EncoderSettings {
        resolution: (15, 8),
        ..settings()
    };
    let err = StreamSession::new(odd).err().expect("odd width");
    assert!(matches!(
        PipelineError::classify(&err),
        Some(PipelineError::Configuration(_))
    ));
}
