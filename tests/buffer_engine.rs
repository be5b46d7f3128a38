use std::time::{Duration, Instant};

use anyhow::Result;

use dualcam::{BufferEngine, BufferSettings, Frame, PipelineError, PixelFormat};

fn frame(timestamp: f64) -> Frame {
    Frame::solid(8, 8, PixelFormat::Bgr24, [10, 20, 30], timestamp)
}

fn settings(target_fps: u32, buffer_seconds: u32) -> BufferSettings {
    BufferSettings {
        target_fps,
        buffer_seconds,
    }
}

/// Endless feed with a fixed delay between frames.
fn steady_feed(delay: Duration) -> impl Iterator<Item = Result<Frame>> + Send + 'static {
    let mut t = 0.0;
    std::iter::repeat_with(move || {
        std::thread::sleep(delay);
        t += delay.as_secs_f64();
        Ok(frame(t))
    })
}

#[test]
fn output_follows_target_cadence() -> Result<()> {
    let engine = BufferEngine::new(settings(50, 1))?;
    let mut paced = engine.buffer(steady_feed(Duration::from_millis(2)))?;

    let start = Instant::now();
    let mut timestamps = Vec::new();
    for item in paced.by_ref().take(25) {
        timestamps.push(item?.timestamp);
    }
    let elapsed = start.elapsed();

    // 25 ticks at 20 ms, the first one immediate.
    assert!(elapsed >= Duration::from_millis(460), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "too slow: {:?}", elapsed);
    assert!(timestamps.windows(2).all(|w| w[1] >= w[0]));
    Ok(())
}

#[test]
fn slow_producer_repeats_the_same_frame() -> Result<()> {
    let engine = BufferEngine::new(settings(50, 1))?;
    let mut first = true;
    let feed = std::iter::repeat_with(move || {
        if !first {
            std::thread::sleep(Duration::from_secs(1));
        }
        first = false;
        Ok(frame(0.0))
    });
    let mut paced = engine.buffer(feed)?;

    let out: Vec<Frame> = paced.by_ref().take(8).collect::<Result<_>>()?;
    assert_eq!(out.len(), 8);
    // Held frames share the original buffer; nothing is copied.
    assert!(out.iter().all(|f| Frame::same_buffer(f, &out[0])));

    let stats = paced.stats();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.emitted, 8);
    assert_eq!(stats.held, 7);
    Ok(())
}

#[test]
fn fast_producer_is_bounded_by_capacity() -> Result<()> {
    let engine = BufferEngine::new(settings(10, 1))?;
    let mut paced = engine.buffer(steady_feed(Duration::from_micros(200)))?;
    assert_eq!(paced.capacity(), 10);

    let mut last = f64::NEG_INFINITY;
    for _ in 0..5 {
        let frame = paced.next().expect("paced frame")?;
        assert!(frame.timestamp > last);
        last = frame.timestamp;
        assert!(paced.queue_len() <= paced.capacity());
    }

    let stats = paced.stats();
    assert!(stats.max_depth <= 10);
    assert!(stats.dropped > 0, "older frames should be discarded: {:?}", stats);
    assert!(stats.received > stats.emitted);
    Ok(())
}

#[test]
fn failing_feed_surfaces_producer_failure() -> Result<()> {
    let engine = BufferEngine::new(settings(100, 1))?;
    let feed = (0..3)
        .map(|i| Ok(frame(i as f64)))
        .chain(std::iter::once(Err(anyhow::anyhow!("camera 1 unplugged"))));
    let paced = engine.buffer(feed)?;

    let items: Vec<Result<Frame>> = paced.collect();
    let err = items
        .iter()
        .find_map(|item| item.as_ref().err())
        .expect("failure item");
    assert_eq!(
        PipelineError::classify(err).map(PipelineError::code),
        Some("PRODUCER_FAILURE")
    );
    assert!(items.last().map_or(false, Result::is_err));
    Ok(())
}

#[test]
fn each_buffer_call_is_a_fresh_session() -> Result<()> {
    let engine = BufferEngine::new(settings(100, 1))?;
    let first: Vec<Frame> = engine
        .buffer((0..2).map(|i| Ok(frame(i as f64))))?
        .collect::<Result<_>>()?;
    let second: Vec<Frame> = engine
        .buffer((10..12).map(|i| Ok(frame(i as f64))))?
        .collect::<Result<_>>()?;
    assert!(!first.is_empty());
    assert!(second.iter().all(|f| f.timestamp >= 10.0));
    Ok(())
}
