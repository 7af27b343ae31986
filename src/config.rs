//! Recording configuration
//!
//! A [`RecordingConfig`] is loaded once per run from a TOML or YAML file (plus
//! `ARGUS_*` environment overrides) and is read-only afterwards. Each camera
//! gets its own [`CameraConfig`], expanded from the recording configuration
//! and later updated with the values the device actually accepted.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::registry;
use crate::capture::PixelFormat;
use crate::error::{Error, Result};
use crate::writer::encoder::EncoderParams;

/// A value given once for all cameras, or once per camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerCamera<T> {
    Each(Vec<T>),
    All(T),
}

impl<T: Clone> PerCamera<T> {
    /// Value for camera `n`.
    ///
    /// Lists whose length differs from the camera count are still indexed,
    /// with a warning; indexing past the end is a configuration error.
    pub fn pick(&self, key: &str, n: usize, num_cams: usize) -> Result<T> {
        match self {
            Self::All(value) => Ok(value.clone()),
            Self::Each(values) => {
                if values.len() != num_cams {
                    warn!(
                        "{} has {} entries for {} cameras, using entry {}",
                        key,
                        values.len(),
                        num_cams,
                        n
                    );
                }
                values.get(n).cloned().ok_or_else(|| {
                    Error::config(format!(
                        "{key} has {} entries, no value for camera {n}",
                        values.len()
                    ))
                })
            }
        }
    }

    fn values_mut(&mut self) -> Box<dyn Iterator<Item = &mut T> + '_> {
        match self {
            Self::All(value) => Box::new(std::iter::once(value)),
            Self::Each(values) => Box::new(values.iter_mut()),
        }
    }
}

impl<T> From<T> for PerCamera<T> {
    fn from(value: T) -> Self {
        Self::All(value)
    }
}

/// Requested codec family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    #[serde(alias = "hevc")]
    H265,
}

/// GPU vendor used for hardware encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMake {
    None,
    Nvidia,
    Amd,
    Intel,
}

/// Whole-run configuration, as loaded from disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    // Recording
    pub num_cams: usize,
    pub camera_names: Option<Vec<String>>,
    pub camera_selection: Option<Vec<usize>>,
    pub video_folder: PathBuf,
    pub video_filename: PerCamera<String>,
    pub frame_rate: f64,
    pub rec_time_in_sec: f64,

    // Camera
    pub camera_make: PerCamera<String>,
    pub frame_width: PerCamera<u32>,
    pub frame_height: PerCamera<u32>,
    pub camera_debug: bool,
    pub buffer_size: PerCamera<u32>,
    pub camera_exposure_time_in_us: PerCamera<f64>,
    pub camera_gain: PerCamera<f64>,
    pub capture_format: PerCamera<PixelFormat>,

    // Compression
    pub ffmpeg_path: String,
    pub ffmpeg_log_level: String,
    pub pixel_format_input: PerCamera<String>,
    pub pixel_format_output: PerCamera<String>,
    pub gpu_id: PerCamera<i32>,
    pub gpu_make: PerCamera<GpuMake>,
    pub codec: PerCamera<Codec>,
    pub quality: PerCamera<u32>,
    pub preset: Option<PerCamera<String>>,
    pub video_segment_length_in_sec: u64,

    // Display and progress reporting
    pub chunk_length_in_sec: f64,
    pub display_frame_rate: f64,
    pub display_downsample: PerCamera<u32>,

    // Triggering
    pub trigger_controller: String,
    pub start_triggers: bool,

    // Pipeline bounds
    pub write_queue_seconds: f64,
    pub grab_retry_limit: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            num_cams: 1,
            camera_names: None,
            camera_selection: None,
            video_folder: PathBuf::from("./test"),
            video_filename: "0.mp4".to_string().into(),
            frame_rate: 100.0,
            rec_time_in_sec: 10.0,
            camera_make: "v4l2".to_string().into(),
            frame_width: 1152.into(),
            frame_height: 1024.into(),
            camera_debug: false,
            buffer_size: 100.into(),
            camera_exposure_time_in_us: 1500.0.into(),
            camera_gain: 1.0.into(),
            capture_format: PixelFormat::Mjpeg.into(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_log_level: "quiet".to_string(),
            pixel_format_input: "rgb24".to_string().into(),
            pixel_format_output: "rgb0".to_string().into(),
            gpu_id: (-1).into(),
            gpu_make: GpuMake::Nvidia.into(),
            codec: Codec::H264.into(),
            quality: 21.into(),
            preset: None,
            video_segment_length_in_sec: 0,
            chunk_length_in_sec: 5.0,
            display_frame_rate: 10.0,
            display_downsample: 2.into(),
            trigger_controller: "none".to_string(),
            start_triggers: false,
            write_queue_seconds: 10.0,
            grab_retry_limit: 1000,
        }
    }
}

fn reset_scalar<T: PartialOrd + Default + Copy + Display>(key: &str, value: &mut T, default: T) {
    if *value <= T::default() {
        warn!("{key} set to invalid value in config, using default ({default})");
        *value = default;
    }
}

fn reset_each<T: PartialOrd + Default + Copy + Display>(
    key: &str,
    values: &mut PerCamera<T>,
    default: &PerCamera<T>,
) {
    let PerCamera::All(default) = *default else {
        return;
    };
    for value in values.values_mut() {
        reset_scalar(key, value, default);
    }
}

const ENV_PREFIX: &str = "ARGUS";

/// `ARGUS_*` variables that name a configuration key. Other variables with
/// the prefix are ignored instead of failing `deny_unknown_fields`.
fn env_overrides(
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<config::Map<String, String>> {
    let defaults = serde_json::to_value(RecordingConfig::default())
        .map_err(|e| Error::config(format!("cannot list configuration keys: {e}")))?;
    let keys = defaults
        .as_object()
        .ok_or_else(|| Error::config("configuration is not a map"))?;

    let prefix = format!("{ENV_PREFIX}_");
    Ok(vars
        .into_iter()
        .filter(|(name, _)| match name.strip_prefix(&prefix) {
            Some(key) if keys.contains_key(&key.to_lowercase()) => true,
            Some(_) => {
                debug!("Ignoring {}, not a configuration key", name);
                false
            }
            None => false,
        })
        .collect())
}

impl RecordingConfig {
    /// Load, sanitize and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());

        let mut config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(Some(env_overrides(std::env::vars())?)),
            )
            .build()?
            .try_deserialize()?;

        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Reset out-of-range values to their defaults.
    ///
    /// `display_frame_rate` is left alone: zero or below disables preview.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.num_cams == 0 {
            warn!("num_cams set to 0 in config, using default ({})", defaults.num_cams);
            self.num_cams = defaults.num_cams;
        }
        reset_scalar("frame_rate", &mut self.frame_rate, defaults.frame_rate);
        reset_scalar("rec_time_in_sec", &mut self.rec_time_in_sec, defaults.rec_time_in_sec);
        reset_scalar(
            "chunk_length_in_sec",
            &mut self.chunk_length_in_sec,
            defaults.chunk_length_in_sec,
        );
        reset_each("frame_width", &mut self.frame_width, &defaults.frame_width);
        reset_each("frame_height", &mut self.frame_height, &defaults.frame_height);
        reset_each("buffer_size", &mut self.buffer_size, &defaults.buffer_size);
        reset_each("camera_gain", &mut self.camera_gain, &defaults.camera_gain);
        reset_each(
            "camera_exposure_time_in_us",
            &mut self.camera_exposure_time_in_us,
            &defaults.camera_exposure_time_in_us,
        );
        reset_each("quality", &mut self.quality, &defaults.quality);
        reset_each(
            "display_downsample",
            &mut self.display_downsample,
            &defaults.display_downsample,
        );
        if self.write_queue_seconds < 0.0 {
            warn!("write_queue_seconds is negative, using an unbounded write queue");
            self.write_queue_seconds = 0.0;
        }
    }

    /// Check every camera's configuration before any device is touched.
    pub fn validate(&self) -> Result<()> {
        for n in 0..self.num_cams {
            self.camera_config(n)?;
        }
        Ok(())
    }

    /// Distinct camera makes, in first-seen order
    pub fn makes(&self) -> Result<Vec<String>> {
        let mut makes = Vec::new();
        for n in 0..self.num_cams {
            let make = self.camera_make.pick("camera_make", n, self.num_cams)?;
            if !makes.contains(&make) {
                makes.push(make);
            }
        }
        Ok(makes)
    }

    /// Expand the configuration for camera `n` and validate it.
    pub fn camera_config(&self, n: usize) -> Result<CameraConfig> {
        let num_cams = self.num_cams;
        if n >= num_cams {
            return Err(Error::config(format!(
                "camera index {n} out of range for {num_cams} cameras"
            )));
        }

        let camera_name = match &self.camera_names {
            Some(names) => PerCamera::Each(names.clone()).pick("camera_names", n, num_cams)?,
            None => format!("Camera{n}"),
        };
        let camera_selection = match &self.camera_selection {
            Some(selection) => {
                PerCamera::Each(selection.clone()).pick("camera_selection", n, num_cams)?
            }
            None => n,
        };
        let preset = match &self.preset {
            Some(preset) => Some(preset.pick("preset", n, num_cams)?)
                .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("none")),
            None => None,
        };

        let camera_make = self.camera_make.pick("camera_make", n, num_cams)?;
        registry::ensure_registered(&camera_make)?;

        let config = CameraConfig {
            n_cam: n,
            num_cams,
            camera_name,
            camera_make,
            camera_selection,
            camera_serial_no: None,
            camera_model: None,
            video_folder: self.video_folder.clone(),
            video_filename: self.video_filename.pick("video_filename", n, num_cams)?,
            frame_rate: self.frame_rate,
            rec_time_in_sec: self.rec_time_in_sec,
            frame_width: self.frame_width.pick("frame_width", n, num_cams)?,
            frame_height: self.frame_height.pick("frame_height", n, num_cams)?,
            buffer_size: self.buffer_size.pick("buffer_size", n, num_cams)?,
            camera_exposure_time_in_us: self.camera_exposure_time_in_us.pick(
                "camera_exposure_time_in_us",
                n,
                num_cams,
            )?,
            camera_gain: self.camera_gain.pick("camera_gain", n, num_cams)?,
            camera_debug: self.camera_debug,
            capture_format: self.capture_format.pick("capture_format", n, num_cams)?,
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffmpeg_log_level: self.ffmpeg_log_level.clone(),
            pixel_format_input: self
                .pixel_format_input
                .pick("pixel_format_input", n, num_cams)?,
            pixel_format_output: self
                .pixel_format_output
                .pick("pixel_format_output", n, num_cams)?,
            gpu_id: self.gpu_id.pick("gpu_id", n, num_cams)?,
            gpu_make: self.gpu_make.pick("gpu_make", n, num_cams)?,
            codec: self.codec.pick("codec", n, num_cams)?,
            quality: self.quality.pick("quality", n, num_cams)?,
            preset,
            video_segment_length_in_sec: self.video_segment_length_in_sec,
            chunk_length_in_sec: self.chunk_length_in_sec,
            display_frame_rate: self.display_frame_rate,
            display_downsample: self.display_downsample.pick("display_downsample", n, num_cams)?,
            write_queue_seconds: self.write_queue_seconds,
            grab_retry_limit: self.grab_retry_limit,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration of one camera stream.
///
/// Produced by [`RecordingConfig::camera_config`], completed by the device
/// layer (serial number, model) and finally resolved by
/// [`crate::capture::CameraSystem::open_camera`], which overwrites the geometry,
/// frame rate and buffer values with what the device accepted. The resolved
/// value is what the write stage and the metadata files see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub n_cam: usize,
    pub num_cams: usize,
    pub camera_name: String,
    pub camera_make: String,
    pub camera_selection: usize,
    pub camera_serial_no: Option<String>,
    pub camera_model: Option<String>,

    pub video_folder: PathBuf,
    pub video_filename: String,
    pub frame_rate: f64,
    pub rec_time_in_sec: f64,

    pub frame_width: u32,
    pub frame_height: u32,
    pub buffer_size: u32,
    pub camera_exposure_time_in_us: f64,
    pub camera_gain: f64,
    pub camera_debug: bool,
    pub capture_format: PixelFormat,

    pub ffmpeg_path: String,
    pub ffmpeg_log_level: String,
    pub pixel_format_input: String,
    pub pixel_format_output: String,
    pub gpu_id: i32,
    pub gpu_make: GpuMake,
    pub codec: Codec,
    pub quality: u32,
    pub preset: Option<String>,
    pub video_segment_length_in_sec: u64,

    pub chunk_length_in_sec: f64,
    pub display_frame_rate: f64,
    pub display_downsample: u32,

    pub write_queue_seconds: f64,
    pub grab_retry_limit: u32,
}

impl CameraConfig {
    /// Folder holding every artifact of this camera
    pub fn output_folder(&self) -> PathBuf {
        self.video_folder.join(&self.camera_name)
    }

    /// Capacity of the frame channel, `None` for unbounded
    pub fn write_queue_capacity(&self) -> Option<usize> {
        if self.write_queue_seconds <= 0.0 {
            return None;
        }
        let frames = (self.frame_rate * self.write_queue_seconds).ceil();
        Some((frames as usize).max(1))
    }

    /// Encoder input pixel format as a typed value, when it is one we can preview
    pub fn input_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_ffmpeg(&self.pixel_format_input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_rate <= 0.0 || !self.frame_rate.is_finite() {
            return Err(Error::config(format!(
                "{}: frame rate must be positive, got {}",
                self.camera_name, self.frame_rate
            )));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(Error::config(format!(
                "{}: frame size {}x{} is empty",
                self.camera_name, self.frame_width, self.frame_height
            )));
        }
        if self.video_filename.is_empty() {
            return Err(Error::config(format!(
                "{}: video_filename is empty",
                self.camera_name
            )));
        }
        EncoderParams::derive(self).map(|_| ())
    }
}
