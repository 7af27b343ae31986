//! Camera device layer
//!
//! Every camera family implements the same two traits: a [`CameraSystem`]
//! (one per make, enumerates devices and opens cameras) and a [`Camera`]
//! (one per recording stream, grabs frames). The acquisition loop only ever
//! talks to these traits.

pub mod decoder;
pub mod emulated;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod registry;
pub mod v4l2;

use bytes::Bytes;

pub use frame::{Frame, PixelFormat, PreviewImage};
pub use registry::Systems;

use crate::config::CameraConfig;
use crate::error::Result;

/// A device found by a camera system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver-specific selector: device path, pipeline source, index
    pub selector: String,
    pub serial_number: String,
    pub model_name: String,
}

/// Result of one grab, before conversion to the encoder's pixel format
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Device clock reading in seconds
    pub timestamp: f64,
}

/// Vendor-level entry point, loaded once per make
pub trait CameraSystem: Send + Sync {
    /// Make identifier this system was registered under
    fn make(&self) -> &'static str;

    /// Enumerate the devices this system can open, in selection order.
    fn device_list(&self) -> Result<Vec<DeviceInfo>>;

    /// Attach device-specific data to a camera's configuration before it is
    /// opened.
    fn load_device(&self, device: &DeviceInfo, config: &mut CameraConfig) -> Result<()> {
        config.camera_serial_no = Some(device.serial_number.clone());
        Ok(())
    }

    /// Open and configure a camera.
    ///
    /// The returned configuration carries the values the device accepted
    /// (resolution, frame rate, buffer size, exposure), queried back after
    /// they were set.
    fn open_camera(
        &self,
        device: &DeviceInfo,
        config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)>;

    /// Release system-wide resources once every camera is closed.
    fn close(&self, _devices: &[DeviceInfo]) -> Result<()> {
        Ok(())
    }
}

/// An open camera, owned by exactly one acquisition loop
pub trait Camera: Send {
    fn model_name(&self) -> String;

    /// Start the device stream. Returns `false` if the camera is not ready.
    fn start_grabbing(&mut self) -> Result<bool>;

    /// Block until the next frame is available or the driver times out.
    fn grab_frame(&mut self, frame_number: u64) -> Result<RawFrame>;

    /// Pixel buffer in the encoder's input format.
    fn image_array(&self, raw: &RawFrame) -> Result<Bytes> {
        Ok(raw.data.clone())
    }

    fn timestamp(&self, raw: &RawFrame) -> f64 {
        raw.timestamp
    }

    fn release_frame(&mut self, raw: RawFrame) {
        drop(raw);
    }

    /// Whether the driver shows its own preview window, in which case no
    /// preview stream is produced for this camera.
    fn owns_display(&self) -> bool {
        false
    }

    /// Downsampled preview of an already converted pixel buffer.
    fn display_image(&mut self, pixels: &[u8], config: &CameraConfig) -> Option<PreviewImage> {
        PreviewImage::downsample(
            pixels,
            config.frame_width,
            config.frame_height,
            config.input_format()?,
            config.display_downsample,
        )
    }

    fn close(self: Box<Self>, config: &CameraConfig) -> Result<()>;
}
