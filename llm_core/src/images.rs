use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType};

/// Bounds applied to every image before it is sent to the model.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptions {
    pub width: u32,
    pub quality: u8,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            width: 128,
            quality: 85,
        }
    }
}

/// Strip an optional `data:image/...;base64,` prefix.
fn base64_payload(input: &str) -> &str {
    match input.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => input,
    }
}

/// Decoded size of a base64 image in MiB.
pub fn payload_size_mb(input: &str) -> f64 {
    let bytes = base64_payload(input).trim().len() as f64 * 3.0 / 4.0;
    bytes / (1024.0 * 1024.0)
}

/// Resize a base64 image to `options.width` (keeping aspect ratio) and
/// re-encode it as a JPEG data URL.
pub fn compress_data_url(input: &str, options: ImageOptions) -> anyhow::Result<String> {
    let raw = STANDARD
        .decode(base64_payload(input).trim())
        .context("image is not valid base64")?;
    let img = image::load_from_memory(&raw).context("unrecognized image format")?;

    let resized = img.resize(options.width, u32::MAX, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, options.quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .context("jpeg encode failed")?;

    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(out)))
}
