#![cfg(feature = "stream-ffmpeg")]

use anyhow::Result;
use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling;
use ffmpeg::util::format::pixel::Pixel;

use dualcam::{EncoderSettings, Frame, PixelFormat, SessionOutcome, StreamSession};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 90;
const FPS: u32 = 10;

/// BGR colours, switching every five frames.
const PALETTE: [[u8; 3]; 3] = [[0, 0, 230], [0, 230, 0], [230, 0, 0]];

fn colour_for(index: u64) -> [u8; 3] {
    PALETTE[(index / 5) as usize % PALETTE.len()]
}

fn solid(index: u64) -> Frame {
    Frame::solid(
        WIDTH,
        HEIGHT,
        PixelFormat::Bgr24,
        colour_for(index),
        index as f64 / FPS as f64,
    )
}

fn close_to(actual: &[u8], expected: [u8; 3]) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(&a, e)| (a as i32 - e as i32).abs() <= 40)
}

#[test]
fn flv_file_keeps_colours_order_and_fixed_gop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("roundtrip.flv");
    let settings = EncoderSettings {
        resolution: (WIDTH, HEIGHT),
        fps: FPS,
        bitrate: 500_000,
        buffer_seconds: 1,
        ..EncoderSettings::default()
    };
    assert_eq!(settings.gop_size(), 10);

    let mut session = StreamSession::new(settings)?;
    let feed = (0..35u64).map(|i| Ok(solid(i)));
    session.start(feed, &path.to_string_lossy())?;
    let report = session.wait().expect("report");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.frames, 35);

    ffmpeg::init()?;
    let mut input = ffmpeg::format::input(&path)?;
    let stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .expect("video stream");
    let index = stream.index();
    let time_base = f64::from(stream.time_base());
    let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .video()?;
    assert_eq!((decoder.width(), decoder.height()), (WIDTH, HEIGHT));
    let mut to_bgr = scaling::Context::get(
        decoder.format(),
        WIDTH,
        HEIGHT,
        Pixel::BGR24,
        WIDTH,
        HEIGHT,
        scaling::Flags::BILINEAR,
    )?;

    let mut keyframes = Vec::new();
    let mut packets = 0usize;
    let mut decoded: Vec<(i64, Vec<u8>)> = Vec::new();
    let mut picture = ffmpeg::frame::Video::empty();
    let mut bgr = ffmpeg::frame::Video::empty();
    let mut collect = |picture: &ffmpeg::frame::Video, decoded: &mut Vec<(i64, Vec<u8>)>| -> Result<()> {
        to_bgr.run(picture, &mut bgr)?;
        let centre = (HEIGHT as usize / 2) * bgr.stride(0) + (WIDTH as usize / 2) * 3;
        let pts = picture.pts().expect("decoded pts");
        decoded.push((pts, bgr.data(0)[centre..centre + 3].to_vec()));
        Ok(())
    };

    for (stream, packet) in input.packets() {
        if stream.index() != index {
            continue;
        }
        if packet.is_key() {
            keyframes.push(packets);
        }
        packets += 1;
        decoder.send_packet(&packet)?;
        while decoder.receive_frame(&mut picture).is_ok() {
            collect(&picture, &mut decoded)?;
        }
    }
    decoder.send_eof()?;
    while decoder.receive_frame(&mut picture).is_ok() {
        collect(&picture, &mut decoded)?;
    }

    assert!(decoded.len().abs_diff(35) <= 1, "decoded {} frames", decoded.len());
    assert_eq!(keyframes, vec![0, 10, 20, 30]);
    assert!(
        decoded.windows(2).all(|w| w[1].0 > w[0].0),
        "decoded pts must increase"
    );
    for (pts, pixel) in &decoded {
        let frame_index = (*pts as f64 * time_base * FPS as f64).round() as u64;
        assert!(
            close_to(pixel, colour_for(frame_index)),
            "frame {}: got {:?}, expected about {:?}",
            frame_index,
            pixel,
            colour_for(frame_index)
        );
    }
    Ok(())
}
