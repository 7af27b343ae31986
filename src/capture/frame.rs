use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame as published by the acquisition loop
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable pixel buffer in the camera's configured input pixel format
    pub data: Bytes,

    /// Sequence number, 1 for the first successful grab
    pub number: u64,

    /// Device clock reading in seconds
    pub timestamp: f64,
}

/// Pixel formats we support, on the device side and on the encoder input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "rgb24")]
    Rgb24,
    #[serde(rename = "bgr24")]
    Bgr24,
    #[serde(rename = "yuyv422", alias = "yuyv", alias = "yuyv4")]
    Yuyv4,
    #[serde(rename = "mjpeg")]
    Mjpeg,
    #[serde(rename = "nv12")]
    Nv12,
    #[serde(rename = "gray")]
    Gray8,
    #[serde(rename = "bayer_bggr8")]
    BayerBggr8,
    #[serde(rename = "bayer_rggb8")]
    BayerRggb8,
    #[serde(rename = "bayer_gbrg8")]
    BayerGbrg8,
    #[serde(rename = "bayer_grbg8")]
    BayerGrbg8,
}

impl PixelFormat {
    const ALL: [PixelFormat; 10] = [
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Yuyv4,
        PixelFormat::Mjpeg,
        PixelFormat::Nv12,
        PixelFormat::Gray8,
        PixelFormat::BayerBggr8,
        PixelFormat::BayerRggb8,
        PixelFormat::BayerGbrg8,
        PixelFormat::BayerGrbg8,
    ];

    /// Name of the matching ffmpeg raw pixel format. Compressed formats have none.
    pub fn ffmpeg_name(self) -> Option<&'static str> {
        match self {
            Self::Rgb24 => Some("rgb24"),
            Self::Bgr24 => Some("bgr24"),
            Self::Yuyv4 => Some("yuyv422"),
            Self::Mjpeg => None,
            Self::Nv12 => Some("nv12"),
            Self::Gray8 => Some("gray"),
            Self::BayerBggr8 => Some("bayer_bggr8"),
            Self::BayerRggb8 => Some("bayer_rggb8"),
            Self::BayerGbrg8 => Some("bayer_gbrg8"),
            Self::BayerGrbg8 => Some("bayer_grbg8"),
        }
    }

    pub fn from_ffmpeg(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.ffmpeg_name() == Some(name))
    }

    /// V4L2 fourcc code for this format
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Rgb24 => *b"RGB3",
            Self::Bgr24 => *b"BGR3",
            Self::Yuyv4 => *b"YUYV",
            Self::Mjpeg => *b"MJPG",
            Self::Nv12 => *b"NV12",
            Self::Gray8 => *b"GREY",
            Self::BayerBggr8 => *b"BA81",
            Self::BayerRggb8 => *b"RGGB",
            Self::BayerGbrg8 => *b"GBRG",
            Self::BayerGrbg8 => *b"GRBG",
        }
    }

    /// Size in bytes of one uncompressed frame
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgb24 | Self::Bgr24 => Some(pixels * 3),
            Self::Yuyv4 => Some(pixels * 2),
            Self::Nv12 => Some(pixels * 3 / 2),
            Self::Gray8
            | Self::BayerBggr8
            | Self::BayerRggb8
            | Self::BayerGbrg8
            | Self::BayerGrbg8 => Some(pixels),
            Self::Mjpeg => None,
        }
    }

    /// Channel (0=R, 1=G, 2=B) at each position of a 2x2 Bayer cell,
    /// ordered top-left, top-right, bottom-left, bottom-right.
    fn bayer_cell(self) -> Option<[usize; 4]> {
        match self {
            Self::BayerBggr8 => Some([2, 1, 1, 0]),
            Self::BayerRggb8 => Some([0, 1, 1, 2]),
            Self::BayerGbrg8 => Some([1, 2, 0, 1]),
            Self::BayerGrbg8 => Some([1, 0, 2, 1]),
            _ => None,
        }
    }
}

/// Downsampled RGB24 image sent to the display relay
#[derive(Debug, Clone)]
pub struct PreviewImage {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl PreviewImage {
    /// Build a color-corrected RGB24 preview by keeping every `factor`-th
    /// pixel in both directions.
    ///
    /// Returns `None` for compressed input or a buffer shorter than the
    /// frame geometry requires.
    pub fn downsample(
        data: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        factor: u32,
    ) -> Option<Self> {
        if data.len() < format.frame_size(width, height)? {
            return None;
        }

        if let Some(cell) = format.bayer_cell() {
            return Self::downsample_bayer(data, width, height, cell, factor);
        }

        let step = factor.max(1) as usize;
        let (w, h) = (width as usize, height as usize);
        let out_w = w.div_ceil(step);
        let out_h = h.div_ceil(step);
        let mut out = BytesMut::with_capacity(out_w * out_h * 3);

        for y in (0..h).step_by(step) {
            for x in (0..w).step_by(step) {
                let i = y * w + x;
                let rgb = match format {
                    PixelFormat::Rgb24 => [data[i * 3], data[i * 3 + 1], data[i * 3 + 2]],
                    PixelFormat::Bgr24 => [data[i * 3 + 2], data[i * 3 + 1], data[i * 3]],
                    PixelFormat::Yuyv4 => [data[i * 2]; 3],
                    PixelFormat::Gray8 | PixelFormat::Nv12 => [data[i]; 3],
                    _ => return None,
                };
                out.put_slice(&rgb);
            }
        }

        Some(Self {
            width: out_w as u32,
            height: out_h as u32,
            data: out.freeze(),
        })
    }

    fn downsample_bayer(
        data: &[u8],
        width: u32,
        height: u32,
        cell: [usize; 4],
        factor: u32,
    ) -> Option<Self> {
        // One output pixel per sampled 2x2 cell
        let step = (factor.max(1) as usize).max(2) & !1;
        let (w, h) = (width as usize, height as usize);
        if w < 2 || h < 2 {
            return None;
        }
        let out_w = (w - 1).div_ceil(step);
        let out_h = (h - 1).div_ceil(step);
        let mut out = BytesMut::with_capacity(out_w * out_h * 3);

        for y in (0..h - 1).step_by(step) {
            for x in (0..w - 1).step_by(step) {
                let samples = [
                    data[y * w + x],
                    data[y * w + x + 1],
                    data[(y + 1) * w + x],
                    data[(y + 1) * w + x + 1],
                ];
                let mut sum = [0u16; 3];
                let mut count = [0u16; 3];
                for (channel, value) in cell.iter().zip(samples) {
                    sum[*channel] += u16::from(value);
                    count[*channel] += 1;
                }
                for c in 0..3 {
                    out.put_u8((sum[c] / count[c].max(1)) as u8);
                }
            }
        }

        Some(Self {
            width: out_w as u32,
            height: out_h as u32,
            data: out.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_names_round_trip() {
        for format in PixelFormat::ALL {
            if let Some(name) = format.ffmpeg_name() {
                assert_eq!(PixelFormat::from_ffmpeg(name), Some(format));
            }
        }
        assert_eq!(PixelFormat::from_ffmpeg("bgr0"), None);
    }

    #[test]
    fn rgb_downsample_keeps_every_other_pixel() {
        // 4x2 image, pixel value encodes its x coordinate
        let mut data = Vec::new();
        for _y in 0..2 {
            for x in 0..4u8 {
                data.extend_from_slice(&[x, x, x]);
            }
        }
        let preview = PreviewImage::downsample(&data, 4, 2, PixelFormat::Rgb24, 2).unwrap();
        assert_eq!((preview.width, preview.height), (2, 1));
        assert_eq!(&preview.data[..], &[0, 0, 0, 2, 2, 2]);
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let data = [1u8, 2, 3];
        let preview = PreviewImage::downsample(&data, 1, 1, PixelFormat::Bgr24, 1).unwrap();
        assert_eq!(&preview.data[..], &[3, 2, 1]);
    }

    #[test]
    fn gray_expands_to_rgb() {
        let data = [7u8, 9, 11, 13];
        let preview = PreviewImage::downsample(&data, 2, 2, PixelFormat::Gray8, 1).unwrap();
        assert_eq!(preview.data.len(), 12);
        assert_eq!(&preview.data[..3], &[7, 7, 7]);
    }

    #[test]
    fn bayer_cell_becomes_one_pixel() {
        // BGGR: B=10 G=20 G=40 R=90
        let data = [10u8, 20, 40, 90];
        let preview = PreviewImage::downsample(&data, 2, 2, PixelFormat::BayerBggr8, 1).unwrap();
        assert_eq!((preview.width, preview.height), (1, 1));
        assert_eq!(&preview.data[..], &[90, 30, 10]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(PreviewImage::downsample(&[0u8; 5], 2, 2, PixelFormat::Rgb24, 1).is_none());
        assert!(PreviewImage::downsample(&[0u8; 5], 2, 2, PixelFormat::Mjpeg, 1).is_none());
    }
}
