//! Synthetic camera make for running pipelines without hardware.
//!
//! Frames are a moving gradient in the configured encoder input format. The
//! device clock is virtual: frame `k` carries timestamp `k / frame_rate`, and
//! grabs are paced against the wall clock so the camera delivers at its
//! nominal rate.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::{Camera, CameraSystem, DeviceInfo, PixelFormat, RawFrame};
use crate::config::{CameraConfig, RecordingConfig};
use crate::error::{Error, Result};

pub const MAKE: &str = "emu";

const DEVICE_COUNT: usize = 8;
const MODEL_NAME: &str = "Emulated_Camera";

pub struct EmulatedSystem;

impl EmulatedSystem {
    pub fn load(_config: &RecordingConfig) -> Result<Arc<dyn CameraSystem>> {
        Ok(Arc::new(Self))
    }
}

impl CameraSystem for EmulatedSystem {
    fn make(&self) -> &'static str {
        MAKE
    }

    fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        Ok((0..DEVICE_COUNT)
            .map(|i| DeviceInfo {
                selector: i.to_string(),
                serial_number: format!("EMU-{i:04}"),
                model_name: MODEL_NAME.to_string(),
            })
            .collect())
    }

    fn open_camera(
        &self,
        device: &DeviceInfo,
        config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)> {
        let camera = EmulatedCamera::new(config)?;
        info!(
            "Opened emulated camera {} ({}x{} @ {} fps)",
            device.serial_number, config.frame_width, config.frame_height, config.frame_rate
        );

        let mut resolved = config.clone();
        resolved.camera_model = Some(MODEL_NAME.to_string());
        resolved.buffer_size = config.buffer_size.max(1);
        Ok((Box::new(camera), resolved))
    }
}

pub struct EmulatedCamera {
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_size: usize,
    period: Duration,
    frame_rate: f64,
    ticks: u64,
    started: Option<Instant>,
}

impl EmulatedCamera {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let format = config.input_format().ok_or_else(|| {
            Error::device(
                "open camera",
                format!(
                    "emulated camera cannot produce pixel format {}",
                    config.pixel_format_input
                ),
            )
        })?;
        let frame_size = format
            .frame_size(config.frame_width, config.frame_height)
            .ok_or_else(|| Error::device("open camera", "compressed formats are not emulated"))?;

        Ok(Self {
            format,
            width: config.frame_width,
            height: config.frame_height,
            frame_size,
            period: Duration::from_secs_f64(1.0 / config.frame_rate),
            frame_rate: config.frame_rate,
            ticks: 0,
            started: None,
        })
    }

    /// Moving diagonal gradient, shifted by one step per frame
    fn render(&self) -> Bytes {
        let row = self.frame_size / self.height.max(1) as usize;
        let shift = self.ticks as usize;
        let data: Vec<u8> = (0..self.frame_size)
            .map(|i| ((i % row.max(1)) + i / row.max(1) + shift) as u8)
            .collect();
        Bytes::from(data)
    }
}

impl Camera for EmulatedCamera {
    fn model_name(&self) -> String {
        MODEL_NAME.to_string()
    }

    fn start_grabbing(&mut self) -> Result<bool> {
        self.started = Some(Instant::now());
        Ok(true)
    }

    fn grab_frame(&mut self, frame_number: u64) -> Result<RawFrame> {
        let started = self
            .started
            .ok_or_else(|| Error::Grab("grab before start_grabbing".into()))?;

        self.ticks += 1;
        let due = started + self.period.mul_f64(self.ticks as f64);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        debug!("emulated frame {} (tick {})", frame_number, self.ticks);

        Ok(RawFrame {
            data: self.render(),
            format: self.format,
            width: self.width,
            height: self.height,
            timestamp: self.ticks as f64 / self.frame_rate,
        })
    }

    fn close(self: Box<Self>, config: &CameraConfig) -> Result<()> {
        info!("Closing {}... Please wait.", config.camera_name);
        Ok(())
    }
}
