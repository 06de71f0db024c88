use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::error::CodecError;

/// Encode an RGB image as baseline JPEG. `quality` is clamped to 1..=100.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, CodecError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CodecError::EmptyImage);
    }

    let mut buffer = Vec::with_capacity((width * height) as usize / 4);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(Bytes::from(buffer))
}
