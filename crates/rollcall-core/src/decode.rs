//! Image input decoding: base64 text (optionally a data URI) to an RGB raster.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;
use thiserror::Error;

const DATA_URI_MARKER: &str = "base64,";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("undecodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Drop a `data:image/...;base64,` prefix if present.
pub fn strip_data_uri(input: &str) -> &str {
    match input.split_once(DATA_URI_MARKER) {
        Some((_, payload)) => payload,
        None => input,
    }
}

/// Decode a base64 string (data URI prefix allowed) into raw bytes.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, DecodeError> {
    let payload = strip_data_uri(input.trim()).trim();
    Ok(STANDARD.decode(payload)?)
}

/// Decode encoded image bytes (PNG, JPEG, ...) into an 8-bit RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}
