//! Acquisition loop: one camera, from open to close

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::Sender;
use metrics::{counter, gauge};
use tracing::{debug, error, info, instrument, warn};

use super::channel::{FrameSender, PreviewSender};
use super::signal::{StopListener, StopReason, StopSignal};
use crate::capture::{Camera, CameraSystem, DeviceInfo, Frame};
use crate::config::CameraConfig;
use crate::error::Result;
use crate::metadata::SessionMetadata;
use crate::utils::{format_hms, frames_in, interval_fps};

/// Pause before retrying a failed grab
pub const GRAB_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Upper bound of frames reserved up front; longer recordings grow the
/// vectors as they go
const MAX_RESERVED_FRAMES: u64 = 1 << 20;

/// Frame bookkeeping of one acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct GrabStats {
    /// Every n-th frame is previewed, `None` disables preview
    pub frame_ratio: Option<u64>,
    pub num_images_to_grab: u64,
    pub chunk_length_in_frames: u64,
    pub frame_numbers: Vec<u64>,
    pub time_stamps: Vec<f64>,
}

impl GrabStats {
    pub fn new(config: &CameraConfig) -> Self {
        let num_images_to_grab = frames_in(config.rec_time_in_sec, config.frame_rate);
        let reserved = num_images_to_grab.min(MAX_RESERVED_FRAMES) as usize;
        Self {
            frame_ratio: display_ratio(config.display_frame_rate, config.frame_rate),
            num_images_to_grab,
            chunk_length_in_frames: frames_in(config.chunk_length_in_sec, config.frame_rate)
                .max(1),
            frame_numbers: Vec::with_capacity(reserved),
            time_stamps: Vec::with_capacity(reserved),
        }
    }

    pub fn record(&mut self, frame_number: u64, time_stamp: f64) {
        self.frame_numbers.push(frame_number);
        self.time_stamps.push(time_stamp);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_numbers.len() as u64
    }

    pub fn should_preview(&self, frame_number: u64) -> bool {
        self.frame_ratio
            .is_some_and(|ratio| frame_number % ratio == 0)
    }

    pub fn is_chunk_boundary(&self, frame_number: u64) -> bool {
        frame_number % self.chunk_length_in_frames == 0
    }

    /// Frame rate mean and std over the last chunk
    pub fn chunk_fps(&self) -> Option<(f64, f64)> {
        let n = self.time_stamps.len();
        let from = n.saturating_sub(self.chunk_length_in_frames as usize + 1);
        interval_fps(&self.time_stamps[from..])
    }

    /// Seconds between the first and the latest frame
    pub fn elapsed(&self) -> f64 {
        match (self.time_stamps.first(), self.time_stamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    /// Target frame count reached, or recording time used up
    pub fn is_complete(&self, rec_time_in_sec: f64) -> bool {
        self.frame_count() >= self.num_images_to_grab || self.elapsed() >= rec_time_in_sec
    }
}

/// Preview decimation for a display rate.
///
/// A display rate of zero or below disables preview; a display rate at or
/// above the capture rate previews every frame.
pub fn display_ratio(display_frame_rate: f64, frame_rate: f64) -> Option<u64> {
    if display_frame_rate <= 0.0 || !display_frame_rate.is_finite() {
        return None;
    }
    Some(((frame_rate / display_frame_rate).round() as u64).max(1))
}

/// Channels and signals the grab loop drives
pub struct GrabLinks {
    pub frames: FrameSender,
    pub preview: PreviewSender,
    /// Receives the resolved configuration once the camera is open
    pub resolved: Sender<CameraConfig>,
    /// Stops raised by the user or the write stage
    pub stop_read: StopListener,
    /// Tells the write stage no more frames follow
    pub stop_write: StopSignal,
}

/// What a finished acquisition leaves behind
#[derive(Debug)]
pub struct GrabOutcome {
    pub config: CameraConfig,
    pub stats: GrabStats,
    pub metadata: SessionMetadata,
    pub stop_reason: StopReason,
}

/// Open the camera, grab until a stop condition, then close and finalize.
///
/// Only a failure to open the camera is returned as an error; every later
/// problem ends the loop and is reported through the outcome's stop reason.
/// Downstream stages are always told to stop.
#[instrument(skip_all)]
pub fn grab_frames(
    system: Arc<dyn CameraSystem>,
    device: &DeviceInfo,
    config: CameraConfig,
    mut links: GrabLinks,
) -> Result<GrabOutcome> {
    info!("Opening {} ({})", config.camera_name, device.selector);
    let (mut camera, config) = match system.open_camera(device, &config) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open {}: {}", config.camera_name, e);
            links.stop_write.raise(StopReason::CameraFailed);
            links.preview.stop();
            return Err(e);
        }
    };
    info!(
        "Opened {}: {} {}x{} @ {} fps",
        config.camera_name,
        camera.model_name(),
        config.frame_width,
        config.frame_height,
        config.frame_rate
    );

    if links.resolved.send(config.clone()).is_err() {
        warn!("Write stage is gone before the first frame");
    }

    let mut stats = GrabStats::new(&config);
    let owns_display = camera.owns_display();

    let stop_reason = match camera.start_grabbing() {
        Ok(true) => {
            info!(
                "{} ready to grab {} frames",
                config.camera_name, stats.num_images_to_grab
            );
            grab_loop(camera.as_mut(), &config, &mut stats, &mut links)
        }
        Ok(false) => {
            error!("{} is not ready to grab", config.camera_name);
            StopReason::CameraFailed
        }
        Err(e) => {
            error!("Failed to start grabbing on {}: {}", config.camera_name, e);
            StopReason::CameraFailed
        }
    };

    // Closing
    if let Err(e) = camera.close(&config) {
        error!("Failed to close {}: {}", config.camera_name, e);
    }

    let metadata = SessionMetadata::new(&stats.frame_numbers, &stats.time_stamps, stop_reason);
    if let Err(e) = metadata.save(&config) {
        error!("Failed to save metadata for {}: {}", config.camera_name, e);
    }

    if !owns_display {
        links.preview.stop();
    }
    links.stop_write.raise(stop_reason);
    info!(
        "{} stopped ({}) after {} frames, write queue was full {} times",
        config.camera_name,
        stop_reason,
        stats.frame_count(),
        links.frames.blocked()
    );

    Ok(GrabOutcome {
        config,
        stats,
        metadata,
        stop_reason,
    })
}

fn grab_loop(
    camera: &mut dyn Camera,
    config: &CameraConfig,
    stats: &mut GrabStats,
    links: &mut GrabLinks,
) -> StopReason {
    let mut frame_number = 0u64;
    let mut consecutive_errors = 0u32;
    let mut preview_disabled = camera.owns_display();

    loop {
        if let Some(reason) = links.stop_read.poll() {
            return reason;
        }

        let grabbed = camera.grab_frame(frame_number + 1).and_then(|raw| {
            match camera.image_array(&raw) {
                Ok(pixels) => Ok((raw, pixels)),
                Err(e) => {
                    camera.release_frame(raw);
                    Err(e)
                }
            }
        });

        let (raw, pixels) = match grabbed {
            Ok(grabbed) => grabbed,
            Err(e) => {
                consecutive_errors += 1;
                counter!("argus_grab_errors_total").increment(1);
                if config.camera_debug {
                    warn!("Grab failed ({} in a row): {}", consecutive_errors, e);
                }
                if config.grab_retry_limit > 0 && consecutive_errors >= config.grab_retry_limit {
                    error!(
                        "{} failed {} grabs in a row, stopping",
                        config.camera_name, consecutive_errors
                    );
                    return StopReason::GrabErrors;
                }
                thread::sleep(GRAB_RETRY_DELAY);
                continue;
            }
        };
        consecutive_errors = 0;

        let timestamp = camera.timestamp(&raw);
        frame_number += 1;

        let frame = Frame {
            data: pixels.clone(),
            number: frame_number,
            timestamp,
        };
        if let Err(e) = links.frames.send(frame) {
            error!("{}", e);
            camera.release_frame(raw);
            return StopReason::WriterFailed;
        }
        stats.record(frame_number, timestamp);
        counter!("argus_frames_grabbed_total").increment(1);

        if !preview_disabled && stats.should_preview(frame_number) {
            match camera.display_image(&pixels, config) {
                Some(image) => links.preview.push(image),
                None => {
                    debug!("Pixel format {} cannot be previewed", config.pixel_format_input);
                    preview_disabled = true;
                }
            }
        }

        if stats.is_chunk_boundary(frame_number) {
            report_chunk(config, stats);
        }

        camera.release_frame(raw);

        if stats.is_complete(config.rec_time_in_sec) {
            return StopReason::Completed;
        }
    }
}

fn report_chunk(config: &CameraConfig, stats: &GrabStats) {
    let elapsed = format_hms(stats.elapsed());
    match stats.chunk_fps() {
        Some((mean, std)) => {
            gauge!("argus_capture_fps").set(mean);
            info!(
                "{} {} collected {} frames at {:.2} ± {:.2} fps",
                elapsed,
                config.camera_name,
                stats.frame_count(),
                mean,
                std
            );
        }
        None => info!(
            "{} {} collected {} frames",
            elapsed,
            config.camera_name,
            stats.frame_count()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordingConfig;

    fn camera_config(frame_rate: f64, rec_time_in_sec: f64) -> CameraConfig {
        let config = RecordingConfig {
            camera_make: "emu".to_string().into(),
            frame_rate,
            rec_time_in_sec,
            ..Default::default()
        };
        config.camera_config(0).unwrap()
    }

    #[test]
    fn display_ratio_bounds() {
        assert_eq!(display_ratio(0.0, 100.0), None);
        assert_eq!(display_ratio(-1.0, 100.0), None);
        assert_eq!(display_ratio(100.0, 100.0), Some(1));
        assert_eq!(display_ratio(10.0, 100.0), Some(10));
        assert_eq!(display_ratio(500.0, 100.0), Some(1));
    }

    #[test]
    fn disabled_preview_never_fires() {
        let mut config = camera_config(30.0, 2.0);
        config.display_frame_rate = 0.0;
        let stats = GrabStats::new(&config);
        assert!((1..=1000).all(|n| !stats.should_preview(n)));
    }

    #[test]
    fn targets_follow_frame_rate() {
        let mut config = camera_config(30.0, 2.0);
        config.chunk_length_in_sec = 5.0;
        let stats = GrabStats::new(&config);
        assert_eq!(stats.num_images_to_grab, 60);
        assert_eq!(stats.chunk_length_in_frames, 150);
        assert_eq!(stats.frame_ratio, Some(3));
    }

    #[test]
    fn open_ended_recording_reserves_bounded_memory() {
        let stats = GrabStats::new(&camera_config(100.0, 1e8));
        assert_eq!(stats.num_images_to_grab, 10_000_000_000);
        assert!(stats.frame_numbers.capacity() as u64 <= MAX_RESERVED_FRAMES);
        assert!(stats.time_stamps.capacity() as u64 <= MAX_RESERVED_FRAMES);

        let stats = GrabStats::new(&camera_config(100.0, 1e17));
        assert!(!stats.is_complete(1e17));
    }

    #[test]
    fn completes_on_frame_count_or_elapsed_time() {
        let config = camera_config(30.0, 2.0);

        let mut stats = GrabStats::new(&config);
        for n in 1..=59 {
            stats.record(n, n as f64 / 30.0);
        }
        assert!(!stats.is_complete(config.rec_time_in_sec));
        stats.record(60, 2.0);
        assert!(stats.is_complete(config.rec_time_in_sec));

        // Dropped frames on the device: the clock runs out first
        let mut stats = GrabStats::new(&config);
        stats.record(1, 0.0);
        stats.record(2, 2.5);
        assert!(stats.is_complete(config.rec_time_in_sec));
    }

    #[test]
    fn chunk_fps_uses_last_chunk_only() {
        let mut config = camera_config(10.0, 10.0);
        config.chunk_length_in_sec = 0.5;
        let mut stats = GrabStats::new(&config);
        assert_eq!(stats.chunk_length_in_frames, 5);

        // slow start, then steady 10 fps
        stats.record(1, 0.0);
        stats.record(2, 1.0);
        for n in 3..=8 {
            stats.record(n, 1.0 + (n - 2) as f64 * 0.1);
        }
        let (mean, std) = stats.chunk_fps().unwrap();
        assert!((mean - 10.0).abs() < 1e-6);
        assert!(std < 1e-6);
    }
}
