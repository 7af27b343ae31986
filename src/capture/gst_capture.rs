//! GStreamer appsink camera make with hardware JPEG decoding when available

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::v4l2::V4l2System;
use super::{Camera, CameraSystem, DeviceInfo, PixelFormat, RawFrame};
use crate::config::{CameraConfig, RecordingConfig};
use crate::error::{Error, Result};

pub const MAKE: &str = "gstreamer";

const NEGOTIATE_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(5);

/// Enumerates the same capture nodes as the V4L2 make, but reads them
/// through a `v4l2src` pipeline.
pub struct GstSystem;

impl GstSystem {
    pub fn load(_config: &RecordingConfig) -> Result<Arc<dyn CameraSystem>> {
        gst::init().map_err(|e| Error::device("initialize GStreamer", e))?;
        Ok(Arc::new(Self))
    }
}

impl CameraSystem for GstSystem {
    fn make(&self) -> &'static str {
        MAKE
    }

    fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        V4l2System.device_list()
    }

    fn open_camera(
        &self,
        device: &DeviceInfo,
        config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)> {
        let mut camera = GstCamera::new(device, config)?;
        let caps = camera.negotiate()?;

        let mut resolved = config.clone();
        resolve_from_caps(&mut resolved, &caps)?;
        resolved.pixel_format_input = "rgb24".to_string();
        resolved.camera_model = Some(device.model_name.clone());
        Ok((Box::new(camera), resolved))
    }
}

/// Overwrite geometry and rate with what the appsink actually receives.
/// A variable rate (`0/1`) keeps the requested one.
fn resolve_from_caps(config: &mut CameraConfig, caps: &gst::CapsRef) -> Result<()> {
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|_| Error::device("open camera", format!("unusable caps {caps}")))?;
    config.frame_width = info.width();
    config.frame_height = info.height();

    let fps = info.fps();
    if fps.numer() > 0 && fps.denom() > 0 {
        config.frame_rate = fps.numer() as f64 / fps.denom() as f64;
    } else {
        warn!("{} negotiated a variable frame rate", config.camera_name);
    }
    Ok(())
}

pub struct GstCamera {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    model: String,
    started: Instant,
    // Sample pulled while negotiating, handed out by the first grab
    pending: Option<gst::Sample>,
}

impl GstCamera {
    pub fn new(device: &DeviceInfo, config: &CameraConfig) -> Result<Self> {
        info!("Initializing GStreamer capture pipeline for {}", device.selector);

        let pipeline_str = Self::build_pipeline_string(&device.selector, config)?;
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| Error::device("open camera", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::device("open camera", "failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| Error::device("open camera", "failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::device("open camera", "failed to cast to AppSink"))?;

        // Every buffer has to reach the writer, so the sink never drops
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", config.buffer_size.max(1));
        appsink.set_property("drop", false);
        appsink.set_property("sync", false);

        Ok(Self {
            pipeline,
            appsink,
            model: device.model_name.clone(),
            started: Instant::now(),
            pending: None,
        })
    }

    /// Run the pipeline until the first sample arrives and return its caps.
    fn negotiate(&mut self) -> Result<gst::Caps> {
        self.play("open camera")?;
        let sample = self
            .appsink
            .try_pull_sample(NEGOTIATE_TIMEOUT)
            .ok_or_else(|| Error::device("open camera", "no sample before timeout"))?;
        let caps = sample
            .caps_owned()
            .ok_or_else(|| Error::device("open camera", "sample has no caps"))?;
        debug!("Negotiated {}", caps);
        self.pending = Some(sample);
        Ok(caps)
    }

    fn play(&self, operation: &'static str) -> Result<bool> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::device(operation, format!("{e:?}")))?;

        let (state_change, _, _) = self.pipeline.state(Some(NEGOTIATE_TIMEOUT));
        Ok(matches!(
            state_change,
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::Async)
        ))
    }

    /// `v4l2src` → caps filter → decode/convert to RGB → `appsink`
    fn build_pipeline_string(device: &str, config: &CameraConfig) -> Result<String> {
        let geometry = format!(
            "width={},height={},framerate={}/1",
            config.frame_width,
            config.frame_height,
            config.frame_rate.round().max(1.0) as u32
        );

        let (source_caps, convert) = match config.capture_format {
            PixelFormat::Mjpeg => {
                let jpeg_decoder = Self::detect_jpeg_decoder();
                info!("Using JPEG decoder: {}", jpeg_decoder);
                (
                    format!("image/jpeg,{geometry}"),
                    format!("{jpeg_decoder} ! videoconvert ! video/x-raw,format=RGB ! "),
                )
            }
            PixelFormat::Yuyv4 => (
                format!("video/x-raw,format=YUY2,{geometry}"),
                "videoconvert ! video/x-raw,format=RGB ! ".to_string(),
            ),
            PixelFormat::Rgb24 => (format!("video/x-raw,format=RGB,{geometry}"), String::new()),
            other => {
                return Err(Error::config(format!(
                    "capture format {other:?} is not supported by the gstreamer make"
                )))
            }
        };

        Ok(format!(
            "v4l2src device={device} name=source ! {source_caps} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             {convert}appsink name=appsink"
        ))
    }

    /// Best available JPEG decoder, hardware first
    fn detect_jpeg_decoder() -> &'static str {
        let decoders = ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec", "jpegdec"];

        for decoder in decoders {
            if let Some(factory) = gst::ElementFactory::find(decoder) {
                debug!(
                    "Found decoder: {} - {}",
                    decoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return decoder;
            }
        }

        warn!("No hardware JPEG decoder found, using software decoder");
        "jpegdec"
    }
}

impl Camera for GstCamera {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn start_grabbing(&mut self) -> Result<bool> {
        info!("Starting GStreamer pipeline");
        let playing = self.play("start grabbing")?;
        self.started = Instant::now();
        Ok(playing)
    }

    fn grab_frame(&mut self, _frame_number: u64) -> Result<RawFrame> {
        let sample = match self.pending.take() {
            Some(sample) => sample,
            None => self
                .appsink
                .pull_sample()
                .map_err(|_| Error::Grab("failed to pull sample from pipeline".into()))?,
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::Grab("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| Error::Grab("failed to map buffer".into()))?;

        let caps = sample
            .caps()
            .ok_or_else(|| Error::Grab("sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| Error::Grab("failed to parse video info from caps".into()))?;

        let timestamp = match buffer.pts() {
            Some(pts) => pts.nseconds() as f64 * 1e-9,
            None => self.started.elapsed().as_secs_f64(),
        };

        Ok(RawFrame {
            data: Bytes::copy_from_slice(map.as_slice()),
            format: PixelFormat::Rgb24,
            width: video_info.width(),
            height: video_info.height(),
            timestamp,
        })
    }

    fn close(self: Box<Self>, config: &CameraConfig) -> Result<()> {
        info!("Closing {}... Please wait.", config.camera_name);
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| Error::device("close camera", format!("{e:?}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(width: u32, height: u32, fps: gst::Fraction) -> gst::Caps {
        gst::init().unwrap();
        gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
            .fps(fps)
            .build()
            .unwrap()
            .to_caps()
            .unwrap()
    }

    fn requested() -> CameraConfig {
        let config = RecordingConfig {
            camera_make: "emu".to_string().into(),
            frame_rate: 30.0,
            frame_width: 1920.into(),
            frame_height: 1080.into(),
            ..Default::default()
        };
        config.camera_config(0).unwrap()
    }

    #[test]
    fn negotiated_caps_replace_the_request() {
        let mut config = requested();
        resolve_from_caps(&mut config, &caps(1280, 720, gst::Fraction::new(30000, 1001))).unwrap();

        assert_eq!((config.frame_width, config.frame_height), (1280, 720));
        assert!((config.frame_rate - 29.97).abs() < 0.01);
    }

    #[test]
    fn variable_rate_keeps_the_requested_rate() {
        let mut config = requested();
        resolve_from_caps(&mut config, &caps(640, 480, gst::Fraction::new(0, 1))).unwrap();

        assert_eq!((config.frame_width, config.frame_height), (640, 480));
        assert_eq!(config.frame_rate, 30.0);
    }
}
