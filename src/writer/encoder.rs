//! Encoder invocation parameters
//!
//! Everything here is a pure function of a [`CameraConfig`]: the same
//! configuration always yields the same codec, options and output path.

use std::path::{Path, PathBuf};

use crate::config::{CameraConfig, Codec, GpuMake};
use crate::error::{Error, Result};
use crate::utils::format_hms;

/// Where the stream is compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeTarget {
    Cpu,
    Nvidia(i32),
    Amd(i32),
    Intel(i32),
}

impl EncodeTarget {
    /// `gpu_id == -1` selects the CPU, any other non-negative id the GPU of
    /// `gpu_make`.
    pub fn new(gpu_id: i32, gpu_make: GpuMake) -> Result<Self> {
        match (gpu_id, gpu_make) {
            (-1, _) => Ok(Self::Cpu),
            (id, _) if id < -1 => Err(Error::config(format!(
                "gpu_id must be -1 (CPU) or a device index, got {id}"
            ))),
            (id, GpuMake::Nvidia) => Ok(Self::Nvidia(id)),
            (id, GpuMake::Amd) => Ok(Self::Amd(id)),
            (id, GpuMake::Intel) => Ok(Self::Intel(id)),
            (id, GpuMake::None) => Err(Error::config(format!(
                "gpu_id {id} selects a GPU but gpu_make is none"
            ))),
        }
    }

    /// ffmpeg encoder name for `codec` on this target
    pub fn codec_name(self, codec: Codec) -> &'static str {
        match (self, codec) {
            (Self::Cpu, Codec::H264) => "libx264",
            (Self::Cpu, Codec::H265) => "libx265",
            (Self::Nvidia(_), Codec::H264) => "h264_nvenc",
            (Self::Nvidia(_), Codec::H265) => "hevc_nvenc",
            (Self::Amd(_), Codec::H264) => "h264_amf",
            (Self::Amd(_), Codec::H265) => "hevc_amf",
            (Self::Intel(_), Codec::H264) => "h264_qsv",
            (Self::Intel(_), Codec::H265) => "hevc_qsv",
        }
    }
}

/// Derived encoder settings for one camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub target: EncodeTarget,
    pub codec: &'static str,
    pub pixel_format_out: String,
    pub output_params: Vec<String>,
    pub output_path: PathBuf,
}

impl EncoderParams {
    pub fn derive(config: &CameraConfig) -> Result<Self> {
        let target = EncodeTarget::new(config.gpu_id, config.gpu_make)?;
        let codec = target.codec_name(config.codec);

        let frame_rate = config.frame_rate.to_string();
        let quality = config.quality.to_string();
        let preset = |fallback: &str| config.preset.clone().unwrap_or_else(|| fallback.into());

        let mut pixel_format_out = config.pixel_format_output.clone();
        let padded_rgb = matches!(pixel_format_out.as_str(), "rgb0" | "bgr0");

        let mut output_params: Vec<String> = match target {
            EncodeTarget::Cpu => {
                if padded_rgb {
                    pixel_format_out = "yuv420p".into();
                }
                let mut params = args([
                    "-r:v", &frame_rate,
                    "-preset", &preset("fast"),
                    "-tune", "fastdecode",
                    "-crf", &quality,
                    "-bufsize", "20M",
                    "-maxrate", "10M",
                    "-bf:v", "4",
                    "-vsync", "0",
                ]);
                if config.codec == Codec::H264 {
                    params.extend(args(["-x264-params", "nal-hrd=cbr"]));
                }
                params
            }
            EncodeTarget::Nvidia(gpu) => args([
                "-r:v", &frame_rate,
                "-preset", &preset("fast"),
                "-qp", &quality,
                "-bf:v", "0",
                "-vsync", "0",
                "-2pass", "0",
                "-gpu", &gpu.to_string(),
            ]),
            EncodeTarget::Amd(gpu) => {
                if padded_rgb {
                    pixel_format_out = "yuv420p".into();
                }
                // AMF has no presets
                args([
                    "-r:v", &frame_rate,
                    "-usage", "lowlatency",
                    "-rc", "cqp",
                    "-qp_i", &quality,
                    "-qp_p", &quality,
                    "-qp_b", &quality,
                    "-bf:v", "0",
                    "-hwaccel", "auto",
                    "-hwaccel_device", &gpu.to_string(),
                ])
            }
            EncodeTarget::Intel(_) => {
                if padded_rgb {
                    pixel_format_out = "nv12".into();
                }
                args([
                    "-r:v", &frame_rate,
                    "-bf:v", "0",
                    "-preset", &preset("faster"),
                    "-q", &(config.quality + 1).to_string(),
                ])
            }
        };

        let mut filename = config.video_filename.clone();
        if config.video_segment_length_in_sec > 0 {
            output_params.extend(args([
                "-segment_time",
                &format_hms(config.video_segment_length_in_sec as f64),
                "-f",
                "segment",
                "-reset_timestamps",
                "1",
            ]));
            filename = segmented_filename(&filename);
        }

        Ok(Self {
            target,
            codec,
            pixel_format_out,
            output_params,
            output_path: config.output_folder().join(filename),
        })
    }

    /// Full ffmpeg argument list, program name excluded.
    ///
    /// Raw frames arrive on stdin at the resolved geometry and rate; audio is
    /// disabled on both sides.
    pub fn command_args(&self, config: &CameraConfig) -> Vec<String> {
        let mut cmd = args([
            "-y",
            "-f", "rawvideo",
            "-vcodec", "rawvideo",
            "-s", &format!("{}x{}", config.frame_width, config.frame_height),
            "-pix_fmt", &config.pixel_format_input,
            "-r", &format!("{:.2}", config.frame_rate),
            "-an",
            "-i", "-",
            "-an",
            "-vcodec", self.codec,
            "-pix_fmt", &self.pixel_format_out,
        ]);
        cmd.extend(self.output_params.iter().cloned());
        cmd.extend(args(["-v", &config.ffmpeg_log_level]));
        cmd.push(self.output_path.to_string_lossy().into_owned());
        cmd
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `name.ext` → `name.%05d.ext`
pub fn segmented_filename(filename: &str) -> String {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.%05d.{}", ext.to_string_lossy()),
        None => format!("{stem}.%05d"),
    };
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.join(name).to_string_lossy().into_owned(),
        None => name,
    }
}

/// Number of files the segment muxer produces for a recording.
pub fn segment_count(duration_in_sec: f64, segment_length_in_sec: u64) -> u64 {
    if segment_length_in_sec == 0 || duration_in_sec <= 0.0 {
        return 1;
    }
    (duration_in_sec / segment_length_in_sec as f64).ceil() as u64
}
