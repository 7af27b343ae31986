use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::PixelFormat;
use crate::error::{Error, Result};

/// Convert a device buffer to packed RGB24.
pub fn decode_frame(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| Error::Grab(format!("MJPEG decode failed: {e}")))?;
            let info = decoder
                .info()
                .ok_or_else(|| Error::Grab("MJPEG frame has no header".into()))?;
            match info.pixel_format {
                JpegPixelFormat::RGB24 => Ok(pixels),
                JpegPixelFormat::L8 => Ok(pixels.iter().flat_map(|&l| [l, l, l]).collect()),
                other => Err(Error::Grab(format!("unsupported JPEG pixel format {other:?}"))),
            }
        }
        PixelFormat::Rgb24 => {
            // Already in RGB format
            Ok(data.to_vec())
        }
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height),
        other => Err(Error::Grab(format!("cannot decode {other:?} to RGB"))),
    }
}

/// YUYV 4:2:2 to RGB24, ITU-R BT.601
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 {
        return Err(Error::Grab(format!(
            "YUYV buffer has {} bytes, expected {}",
            data.len(),
            pixels * 2
        )));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    [r, g, b].map(|c| c.clamp(0.0, 255.0) as u8)
}
