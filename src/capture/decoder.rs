use image::{ImageFormat, RgbImage};

use super::frame::{Frame, PixelFormat};
use crate::error::CodecError;

/// Convert a device frame into an RGB image suitable for annotation
pub fn decode_frame(frame: &Frame) -> Result<RgbImage, CodecError> {
    let meta = &frame.meta;
    if meta.format != PixelFormat::Mjpeg && (meta.width == 0 || meta.height == 0) {
        return Err(CodecError::EmptyImage);
    }

    match meta.format {
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?;
            Ok(image.into_rgb8())
        }
        PixelFormat::Rgb24 => packed_rgb(frame, false),
        PixelFormat::Bgr24 => packed_rgb(frame, true),
        PixelFormat::Yuyv4 => yuyv_to_rgb(frame),
        PixelFormat::Nv12 => nv12_to_rgb(frame),
    }
}

fn stride_of(frame: &Frame) -> usize {
    let meta = &frame.meta;
    let packed = meta.format.packed_stride(meta.width);
    meta.stride.max(packed) as usize
}

fn check_len(frame: &Frame, expected: usize) -> Result<(), CodecError> {
    if frame.data.len() < expected {
        return Err(CodecError::ShortBuffer {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn packed_rgb(frame: &Frame, swap: bool) -> Result<RgbImage, CodecError> {
    let (width, height) = (frame.meta.width as usize, frame.meta.height as usize);
    let stride = stride_of(frame);
    check_len(frame, stride * (height - 1) + width * 3)?;

    let mut out = Vec::with_capacity(width * height * 3);
    for row in frame.data.chunks(stride).take(height) {
        for px in row[..width * 3].chunks_exact(3) {
            if swap {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            } else {
                out.extend_from_slice(px);
            }
        }
    }
    RgbImage::from_raw(width as u32, height as u32, out).ok_or(CodecError::EmptyImage)
}

fn yuyv_to_rgb(frame: &Frame) -> Result<RgbImage, CodecError> {
    let (width, height) = (frame.meta.width as usize, frame.meta.height as usize);
    let stride = stride_of(frame);
    check_len(frame, stride * (height - 1) + width * 2)?;

    let mut out = Vec::with_capacity(width * height * 3);
    for row in frame.data.chunks(stride).take(height) {
        // Y0 U Y1 V covers two pixels
        for (i, quad) in row[..width * 2].chunks(4).enumerate() {
            if quad.len() < 4 {
                out.extend_from_slice(&yuv_to_rgb(quad[0], 128, 128));
                continue;
            }
            let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
            out.extend_from_slice(&yuv_to_rgb(y0, u, v));
            if i * 2 + 1 < width {
                out.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
        }
    }
    RgbImage::from_raw(width as u32, height as u32, out).ok_or(CodecError::EmptyImage)
}

fn nv12_to_rgb(frame: &Frame) -> Result<RgbImage, CodecError> {
    let (width, height) = (frame.meta.width as usize, frame.meta.height as usize);
    if width % 2 != 0 {
        return Err(CodecError::Unsupported(PixelFormat::Nv12));
    }
    let stride = stride_of(frame);
    let luma_len = stride * height;
    let chroma_rows = height.div_ceil(2);
    check_len(frame, luma_len + stride * chroma_rows)?;

    let (luma, chroma) = frame.data.split_at(luma_len);
    let mut out = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let luma_row = &luma[y * stride..];
        let chroma_row = &chroma[(y / 2) * stride..];
        for x in 0..width {
            let uv = (x / 2) * 2;
            out.extend_from_slice(&yuv_to_rgb(luma_row[x], chroma_row[uv], chroma_row[uv + 1]));
        }
    }
    RgbImage::from_raw(width as u32, height as u32, out).ok_or(CodecError::EmptyImage)
}

/// BT.601 limited-range conversion
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let clamp = |value: i32| value.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}
