use mp3lame_encoder::{Bitrate, Builder, Encoder, FlushNoGap, MonoPcm, Quality};

use crate::decode::{decode_clip, resample_mono};
use crate::wav::to_i16;
use crate::CodecError;

/// LAME needs at least this much room for the final flush.
const FLUSH_BUFFER_BYTES: usize = 7200;

/// Canonical output of the narration stream: mono MPEG-1/2 Layer III.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub sample_rate: u32,
    pub bitrate_kbps: u16,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            bitrate_kbps: 64,
        }
    }
}

impl EncoderSettings {
    fn bitrate(&self) -> Result<Bitrate, CodecError> {
        let bitrate = match self.bitrate_kbps {
            32 => Bitrate::Kbps32,
            48 => Bitrate::Kbps48,
            64 => Bitrate::Kbps64,
            96 => Bitrate::Kbps96,
            128 => Bitrate::Kbps128,
            192 => Bitrate::Kbps192,
            other => {
                return Err(CodecError::Encode(format!(
                    "unsupported bitrate {other} kbps"
                )))
            }
        };
        Ok(bitrate)
    }
}

/// Normalizes independently encoded clips into one appendable stream.
///
/// A transcoder is owned by exactly one consumer and is not required to be
/// `Send`; it is created on the thread that drives it.
pub trait Transcoder {
    /// Decode `clip` and return the encoded bytes to append to the stream.
    /// On error no state is changed, so the caller may skip the clip and
    /// carry on with the next one.
    fn transcode(&mut self, clip: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Drain whatever the encoder still buffers. Called once, at end of stream.
    fn finish(&mut self) -> Result<Vec<u8>, CodecError>;
}

/// A single LAME encoder fed with every clip of a session.
///
/// Clips are decoded to PCM and resampled to the canonical rate before they
/// reach the encoder, so frame boundaries and the bit reservoir run across
/// clips exactly as they would for one continuous encode.
pub struct Mp3Transcoder {
    encoder: Encoder,
    settings: EncoderSettings,
    finished: bool,
}

impl Mp3Transcoder {
    pub fn new(settings: EncoderSettings) -> Result<Self, CodecError> {
        let mut builder = Builder::new()
            .ok_or_else(|| CodecError::Encode("failed to allocate LAME encoder".into()))?;
        builder.set_num_channels(1).map_err(encode_err)?;
        builder
            .set_sample_rate(settings.sample_rate)
            .map_err(encode_err)?;
        builder.set_brate(settings.bitrate()?).map_err(encode_err)?;
        builder.set_quality(Quality::Good).map_err(encode_err)?;
        let encoder = builder.build().map_err(encode_err)?;

        Ok(Self {
            encoder,
            settings,
            finished: false,
        })
    }

    pub fn settings(&self) -> EncoderSettings {
        self.settings
    }

    fn encode_pcm(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
        self.encoder
            .encode_to_vec(MonoPcm(pcm), &mut out)
            .map_err(encode_err)?;
        Ok(out)
    }
}

impl Transcoder for Mp3Transcoder {
    fn transcode(&mut self, clip: &[u8]) -> Result<Vec<u8>, CodecError> {
        if self.finished {
            return Err(CodecError::Finished);
        }
        let decoded = decode_clip(clip)?;
        let samples = resample_mono(
            &decoded.samples,
            decoded.sample_rate,
            self.settings.sample_rate,
        )?;
        let pcm: Vec<i16> = samples.iter().copied().map(to_i16).collect();
        self.encode_pcm(&pcm)
    }

    fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.finished {
            return Err(CodecError::Finished);
        }
        self.finished = true;
        let mut out = Vec::with_capacity(FLUSH_BUFFER_BYTES);
        self.encoder
            .flush_to_vec::<FlushNoGap>(&mut out)
            .map_err(encode_err)?;
        Ok(out)
    }
}

fn encode_err<E: std::fmt::Debug>(e: E) -> CodecError {
    CodecError::Encode(format!("{e:?}"))
}

/// Index of the first MPEG audio frame sync word, if any.
pub fn find_frame_sync(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(2)
        .position(|w| w[0] == 0xFF && (w[1] & 0xE0) == 0xE0)
}
