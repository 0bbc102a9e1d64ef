use std::io::Cursor;

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::warn;

use crate::CodecError;

const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// A synthesized clip reduced to mono f32 PCM.
#[derive(Debug, Clone)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedClip {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Decode a self-contained clip (MP3, WAV, ...) into mono PCM.
///
/// The container is probed, so callers need not know what the synthesizer
/// returned. Multi-channel audio is averaged down to one channel. A corrupt
/// frame in the middle of the clip is skipped; anything that prevents the
/// clip from being opened at all is an error.
pub fn decode_clip(bytes: &[u8]) -> Result<DecodedClip, CodecError> {
    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(CodecError::NoAudioTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(CodecError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("skipping corrupt frame: {e}");
                continue;
            }
            Err(e) => return Err(CodecError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        let channels = spec.channels.count().max(1);

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend(
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    let sample_rate = sample_rate
        .ok_or_else(|| CodecError::Decode("clip does not declare a sample rate".into()))?;
    if samples.is_empty() {
        return Err(CodecError::Decode("clip contains no audio frames".into()));
    }

    Ok(DecodedClip {
        samples,
        sample_rate,
    })
}

/// Resample mono PCM from `from` Hz to `to` Hz.
///
/// The resampler's output delay is trimmed and the result truncated to the
/// exact expected length so consecutive clips butt up without padding.
pub fn resample_mono(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>, CodecError> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(
        from as usize,
        to as usize,
        RESAMPLE_CHUNK,
        RESAMPLE_SUB_CHUNKS,
        1,
    )
    .map_err(|e| CodecError::Resample(e.to_string()))?;

    let chunk = resampler.input_frames_next();
    let delay = resampler.output_delay();
    let expected = (input.len() as u64 * to as u64 / from as u64) as usize;
    let mut out = Vec::with_capacity(expected + delay + chunk);

    // Zero blocks past the end of the input push the delayed tail out.
    let delay_in = (delay as u64 * from as u64 / to as u64) as usize;
    let max_blocks = (input.len() + delay_in) / chunk + 3;
    let mut pos = 0usize;
    for _ in 0..max_blocks {
        if out.len() >= expected + delay {
            break;
        }
        let mut block = vec![0.0f32; chunk];
        if pos < input.len() {
            let end = (pos + chunk).min(input.len());
            block[..end - pos].copy_from_slice(&input[pos..end]);
        }
        pos += chunk;

        let frames = resampler
            .process(&[block], None)
            .map_err(|e| CodecError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }

    let delay = delay.min(out.len());
    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}
