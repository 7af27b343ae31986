//! V4L2 camera make with mmap streaming

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder;
use super::{Camera, CameraSystem, DeviceInfo, PixelFormat, RawFrame};
use crate::config::{CameraConfig, RecordingConfig};
use crate::error::{Error, Result};

pub const MAKE: &str = "v4l2";

const MAX_DEVICES: usize = 64;
/// Upper bound of mmap buffers a V4L2 driver hands out
const MAX_BUFFERS: u32 = 32;

const V4L2_CID_GAIN: u32 = 0x0098_0913;
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_EXPOSURE_MANUAL: i64 = 1;

/// Formats we can turn into RGB24 for the encoder
const DECODABLE: [PixelFormat; 3] = [PixelFormat::Mjpeg, PixelFormat::Yuyv4, PixelFormat::Rgb24];

/// Enumerates `/dev/video*` capture nodes
pub struct V4l2System;

impl V4l2System {
    pub fn load(_config: &RecordingConfig) -> Result<Arc<dyn CameraSystem>> {
        Ok(Arc::new(Self))
    }
}

impl CameraSystem for V4l2System {
    fn make(&self) -> &'static str {
        MAKE
    }

    fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();

        for i in 0..MAX_DEVICES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            // Check for capture capability
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                debug!("Found capture device: {} - {}", path, caps.card);
                devices.push(DeviceInfo {
                    selector: path,
                    serial_number: caps.bus,
                    model_name: caps.card,
                });
            }
        }

        Ok(devices)
    }

    fn open_camera(
        &self,
        device: &DeviceInfo,
        config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)> {
        let (camera, resolved) = V4l2Camera::open(device, config)?;
        Ok((Box::new(camera), resolved))
    }
}

/// Open V4L2 capture device
pub struct V4l2Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    format: PixelFormat,
    width: u32,
    height: u32,
    buffer_count: u32,
    model: String,
}

impl V4l2Camera {
    /// Open the device, apply the requested settings and read back what the
    /// driver accepted.
    #[instrument(skip(config), fields(camera = %config.camera_name))]
    pub fn open(info: &DeviceInfo, config: &CameraConfig) -> Result<(Self, CameraConfig)> {
        info!("Initializing V4L2 capture: {}", info.selector);

        let device = Device::with_path(&info.selector).map_err(|e| Error::device("open camera", e))?;

        // Query capabilities
        let caps = device
            .query_caps()
            .map_err(|e| Error::device("query capabilities", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::device(
                "open camera",
                format!("{} does not support video capture", info.selector),
            ));
        }

        // Set format
        let mut fmt = device.format().map_err(|e| Error::device("get format", e))?;
        fmt.width = config.frame_width;
        fmt.height = config.frame_height;
        fmt.fourcc = FourCC::new(&config.capture_format.fourcc());
        device
            .set_format(&fmt)
            .map_err(|e| Error::device("set format", e))?;

        let fps = config.frame_rate.round().max(1.0) as u32;
        device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| Error::device("set frame rate", e))?;

        let mut resolved = config.clone();
        apply_exposure(&device, config, &mut resolved);
        apply_gain(&device, config, &mut resolved);

        // Query back what actually took effect
        let fmt = device.format().map_err(|e| Error::device("get format", e))?;
        let format = DECODABLE
            .into_iter()
            .find(|f| FourCC::new(&f.fourcc()) == fmt.fourcc)
            .ok_or_else(|| {
                Error::device(
                    "set format",
                    format!("driver selected unsupported fourcc {}", fmt.fourcc),
                )
            })?;
        let params = device.params().map_err(|e| Error::device("get frame rate", e))?;
        if params.interval.numerator > 0 {
            resolved.frame_rate =
                f64::from(params.interval.denominator) / f64::from(params.interval.numerator);
        }

        resolved.frame_width = fmt.width;
        resolved.frame_height = fmt.height;
        resolved.capture_format = format;
        resolved.buffer_size = config.buffer_size.clamp(1, MAX_BUFFERS);
        resolved.camera_model = Some(caps.card.clone());
        // Frames are handed to the encoder as decoded RGB
        resolved.pixel_format_input = "rgb24".to_string();

        if resolved.frame_width != config.frame_width
            || resolved.frame_height != config.frame_height
            || resolved.frame_rate != config.frame_rate
        {
            warn!(
                "Device adjusted {}x{} @ {} fps to {}x{} @ {} fps",
                config.frame_width,
                config.frame_height,
                config.frame_rate,
                resolved.frame_width,
                resolved.frame_height,
                resolved.frame_rate
            );
        }

        let camera = Self {
            device,
            stream: None,
            format,
            width: fmt.width,
            height: fmt.height,
            buffer_count: resolved.buffer_size,
            model: caps.card,
        };
        Ok((camera, resolved))
    }
}

fn apply_exposure(device: &Device, config: &CameraConfig, resolved: &mut CameraConfig) {
    // V4L2 absolute exposure is in units of 100 µs
    let units = (config.camera_exposure_time_in_us / 100.0).round().max(1.0) as i64;
    let applied = device
        .set_control(Control {
            id: V4L2_CID_EXPOSURE_AUTO,
            value: Value::Integer(V4L2_EXPOSURE_MANUAL),
        })
        .and_then(|_| {
            device.set_control(Control {
                id: V4L2_CID_EXPOSURE_ABSOLUTE,
                value: Value::Integer(units),
            })
        })
        .and_then(|_| device.control(V4L2_CID_EXPOSURE_ABSOLUTE));

    match applied {
        Ok(Control {
            value: Value::Integer(units),
            ..
        }) => resolved.camera_exposure_time_in_us = units as f64 * 100.0,
        Ok(_) => {}
        Err(e) => warn!("Exposure control not applied: {}", e),
    }
}

fn apply_gain(device: &Device, config: &CameraConfig, resolved: &mut CameraConfig) {
    let applied = device
        .set_control(Control {
            id: V4L2_CID_GAIN,
            value: Value::Integer(config.camera_gain.round() as i64),
        })
        .and_then(|_| device.control(V4L2_CID_GAIN));

    match applied {
        Ok(Control {
            value: Value::Integer(gain),
            ..
        }) => resolved.camera_gain = gain as f64,
        Ok(_) => {}
        Err(e) => debug!("Gain control not applied: {}", e),
    }
}

impl Camera for V4l2Camera {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn start_grabbing(&mut self) -> Result<bool> {
        // Request buffers
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| Error::device("start grabbing", e))?;

        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(true)
    }

    fn grab_frame(&mut self, _frame_number: u64) -> Result<RawFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Grab("stream not started".into()))?;

        let (buf, meta) = stream.next().map_err(|e| Error::Grab(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };

        Ok(RawFrame {
            data: Bytes::copy_from_slice(&buf[..used]),
            format: self.format,
            width: self.width,
            height: self.height,
            timestamp: meta.timestamp.sec as f64 + meta.timestamp.usec as f64 * 1e-6,
        })
    }

    fn image_array(&self, raw: &RawFrame) -> Result<Bytes> {
        if raw.format == PixelFormat::Rgb24 {
            return Ok(raw.data.clone());
        }
        decoder::decode_frame(&raw.data, raw.format, raw.width, raw.height).map(Bytes::from)
    }

    fn close(mut self: Box<Self>, config: &CameraConfig) -> Result<()> {
        info!("Closing {}... Please wait.", config.camera_name);
        // Dropping the stream turns streaming off and unmaps the buffers
        self.stream.take();
        Ok(())
    }
}
