//! libx264 + FLV sink using FFmpeg.
//!
//! Tuned for glass-to-glass latency: no container buffering, zero-latency
//! tune, no B-frames or lookahead, fixed GOP, CBR HRD with a half-second VBV.
//! Every packet the encoder returns is muxed immediately.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling;
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::Rational;

use super::settings::EncoderSettings;
use super::{file_target_path, MuxSink, StreamProtocol};
use crate::frame::{Frame, PixelFormat};
use crate::PipelineError;

pub struct FfmpegSink {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    scaler: Option<Scaler>,
    trailer_written: bool,
}

struct Scaler {
    context: scaling::Context,
    input: (Pixel, u32, u32),
}

/// Map an FFmpeg error onto the session taxonomy.
fn mux_error(step: &str, err: ffmpeg::Error) -> anyhow::Error {
    match err {
        ffmpeg::Error::Eof => PipelineError::EncoderEof.into(),
        other => PipelineError::MuxerIo(format!("{}: {}", step, other)).into(),
    }
}

fn source_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Rgb24 => Pixel::RGB24,
    }
}

impl FfmpegSink {
    pub fn open(url: &str, protocol: StreamProtocol, settings: &EncoderSettings) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let target = match protocol {
            StreamProtocol::File => file_target_path(url)?.to_string_lossy().into_owned(),
            _ => url.to_string(),
        };
        let mut container_options = ffmpeg::Dictionary::new();
        if protocol == StreamProtocol::Rtmp {
            container_options.set("rtmp_live", "live");
        }
        let mut output = ffmpeg::format::output_as_with(&target, "flv", container_options)
            .map_err(|e| mux_error("open output", e))
            .with_context(|| format!("open FLV output {}", target))?;
        // SAFETY: `output` owns a valid AVFormatContext; only the flag bits change.
        unsafe {
            (*output.as_mut_ptr()).flags |= ffmpeg::ffi::AVFMT_FLAG_NOBUFFER as i32;
        }

        let codec = ffmpeg::encoder::find_by_name("libx264")
            .ok_or_else(|| PipelineError::config("ffmpeg was built without libx264"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let (width, height) = settings.resolution;
        let fps = settings.fps as i32;
        let encoder_time_base = Rational(1, fps);

        let mut stream = output
            .add_stream(codec)
            .map_err(|e| mux_error("add video stream", e))?;
        let stream_index = stream.index();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create libx264 encoder")?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational(fps, 1)));
        encoder.set_time_base(encoder_time_base);
        encoder.set_gop(settings.gop_size());
        encoder.set_max_b_frames(0);
        encoder.set_bit_rate(settings.bitrate as usize);
        encoder.set_max_bit_rate(settings.bitrate as usize);
        encoder.set_colorspace(ffmpeg::color::Space::BT709);
        encoder.set_color_range(ffmpeg::color::Range::MPEG);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let mut encoder_options = ffmpeg::Dictionary::new();
        encoder_options.set("preset", &settings.preset);
        encoder_options.set("tune", "zerolatency");
        encoder_options.set("profile", "high");
        let x264_params = format!(
            "{}:colorprim=bt709:transfer=bt709:colormatrix=bt709",
            settings.x264_params()
        );
        encoder_options.set("x264-params", &x264_params);

        let encoder = encoder
            .open_with(encoder_options)
            .map_err(|e| PipelineError::config(format!("open libx264 encoder: {}", e)))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        let mut header_options = ffmpeg::Dictionary::new();
        header_options.set("flvflags", "no_duration_filesize");
        output
            .write_header_with(header_options)
            .map_err(|e| mux_error("write FLV header", e))?;

        // The muxer may pick its own time base while writing the header.
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("video stream vanished after header"))?;

        log::debug!(
            "ffmpeg sink: {} x264-params {} (stream time base {}/{})",
            target,
            x264_params,
            stream_time_base.numerator(),
            stream_time_base.denominator()
        );

        Ok(Self {
            output,
            encoder,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width,
            height,
            scaler: None,
            trailer_written: false,
        })
    }

    fn scaler_for(&mut self, frame: &Frame) -> Result<&mut scaling::Context> {
        let input = (source_pixel(frame.format), frame.width, frame.height);
        let stale = self.scaler.as_ref().map_or(true, |s| s.input != input);
        if stale {
            let context = scaling::Context::get(
                input.0,
                input.1,
                input.2,
                Pixel::YUV420P,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )
            .context("create ffmpeg scaler")?;
            self.scaler = Some(Scaler { context, input });
        }
        self.scaler
            .as_mut()
            .map(|s| &mut s.context)
            .ok_or_else(|| anyhow!("scaler missing"))
    }

    /// Mux every packet the encoder has ready.
    fn drain(&mut self) -> Result<usize> {
        let mut written = 0;
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.set_stream(self.stream_index);
                    packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
                    packet
                        .write_interleaved(&mut self.output)
                        .map_err(|e| mux_error("write packet", e))?;
                    written += 1;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    break
                }
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(mux_error("receive packet", e)),
            }
        }
        Ok(written)
    }
}

impl MuxSink for FfmpegSink {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn encode(&mut self, frame: &Frame, pts: i64) -> Result<usize> {
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("cannot encode an empty {}x{} frame", frame.width, frame.height));
        }
        let mut source = ffmpeg::frame::Video::new(
            source_pixel(frame.format),
            frame.width,
            frame.height,
        );
        let row_bytes = frame.stride();
        let stride = source.stride(0);
        let plane = source.data_mut(0);
        for (row, pixels) in frame.data().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            plane
                .get_mut(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?
                .copy_from_slice(pixels);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler_for(frame)?
            .run(&source, &mut yuv)
            .context("convert frame to yuv420p")?;
        yuv.set_pts(Some(pts));

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| mux_error("send frame", e))?;
        self.drain()
    }

    fn flush(&mut self) -> Result<usize> {
        self.encoder
            .send_eof()
            .map_err(|e| mux_error("flush encoder", e))?;
        self.drain()
    }

    fn close(&mut self) -> Result<()> {
        if self.trailer_written {
            return Ok(());
        }
        self.trailer_written = true;
        self.output
            .write_trailer()
            .map_err(|e| mux_error("write FLV trailer", e))
    }
}
