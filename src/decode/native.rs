extern crate ffmpeg_next;

use std::path::Path;

use super::Decoder;
use crate::task::CancellationToken;
use crate::wave::WaveFormat;
use crate::{Error, Result};

const OUTPUT_SAMPLE: ffmpeg_next::format::Sample =
    ffmpeg_next::format::Sample::I16(ffmpeg_next::format::sample::Type::Packed);

/// Thin wrapper around the native `FFmpeg` audio decoder.
struct AudioDecoder {
    decoder: ffmpeg_next::codec::decoder::Audio,
}

impl AudioDecoder {
    fn build_threading_config() -> ffmpeg_next::codec::threading::Config {
        let mut config = ffmpeg_next::codec::threading::Config::default();
        config.count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        config.kind = ffmpeg_next::codec::threading::Type::Frame;
        config
    }

    fn from_stream(stream: &ffmpeg_next::format::stream::Stream, threaded: bool) -> Result<Self> {
        let ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let mut decoder = ctx.decoder();

        if threaded {
            decoder.set_threading(Self::build_threading_config());
        }

        let decoder = decoder.audio()?;

        Ok(Self { decoder })
    }
}

// Resamples a decoded frame to mono S16 and appends the samples to `writer`.
fn write_frame<W: std::io::Write + std::io::Seek>(
    resampler: &mut ffmpeg_next::software::resampling::Context,
    frame: &ffmpeg_next::frame::Audio,
    resampled: &mut ffmpeg_next::frame::Audio,
    sample_rate: u32,
    writer: &mut hound::WavWriter<W>,
) -> Result<()> {
    let mut delay = match resampler.run(frame, resampled) {
        Ok(v) => v,
        // The input layout changed mid-stream; build a new resampler for the new input.
        Err(ffmpeg_next::Error::InputChanged) => {
            *resampler = frame.resampler(OUTPUT_SAMPLE, ffmpeg_next::ChannelLayout::MONO, sample_rate)?;
            resampler.run(frame, resampled)?
        }
        Err(e) => return Err(e.into()),
    };

    loop {
        // One channel of packed S16: two bytes per sample.
        let raw = &resampled.data(0)[..resampled.samples() * 2];
        for sample in raw.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }

        if delay.is_none() {
            break;
        }
        delay = resampler.flush(resampled)?;
    }

    Ok(())
}

/// Decodes media in-process with the `FFmpeg` libraries.
///
/// The best audio stream is downmixed to mono 16-bit PCM and resampled to the target
/// sample rate (or kept at its native rate).
#[derive(Clone, Debug, Default)]
pub struct NativeDecoder {
    threaded: bool,
}

impl NativeDecoder {
    pub fn new() -> Result<Self> {
        ffmpeg_next::init()?;
        Ok(Self::default())
    }

    /// Returns a new [NativeDecoder] with threaded decoding set to the provided value.
    pub fn with_threaded_decoding(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }
}

impl Decoder for NativeDecoder {
    fn decode(
        &self,
        source: &Path,
        dest: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<WaveFormat> {
        let span = tracing::span!(tracing::Level::TRACE, "native_decode");
        let _enter = span.enter();

        let mut ctx = ffmpeg_next::format::input(&source)?;
        let stream = ctx
            .streams()
            .best(ffmpeg_next::media::Type::Audio)
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!("'{}' has no audio stream", source.display()))
            })?;
        let stream_idx = stream.index();
        let mut decoder = AudioDecoder::from_stream(&stream, self.threaded)?;

        let sample_rate = target
            .map(|t| t.sample_rate)
            .unwrap_or_else(|| decoder.decoder.rate());
        let mut resampler = decoder.decoder.resampler(
            OUTPUT_SAMPLE,
            ffmpeg_next::ChannelLayout::MONO,
            sample_rate,
        )?;

        let format = WaveFormat::new(sample_rate, 1, 16);
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(dest, spec)?;

        tracing::debug!(sample_rate, "starting native decode of {}", source.display());

        let mut frame = ffmpeg_next::frame::Audio::empty();
        let mut resampled = ffmpeg_next::frame::Audio::empty();

        let audio_packets = ctx
            .packets()
            .filter(|(s, _)| s.index() == stream_idx)
            .map(|(_, p)| p);

        for p in audio_packets {
            cancel.check()?;

            decoder.decoder.send_packet(&p)?;
            while decoder.decoder.receive_frame(&mut frame).is_ok() {
                write_frame(&mut resampler, &frame, &mut resampled, sample_rate, &mut writer)?;
            }
        }

        decoder.decoder.send_eof()?;
        while decoder.decoder.receive_frame(&mut frame).is_ok() {
            write_frame(&mut resampler, &frame, &mut resampled, sample_rate, &mut writer)?;
        }

        writer.finalize()?;

        tracing::debug!("completed native decode of {}", source.display());

        Ok(format)
    }
}
