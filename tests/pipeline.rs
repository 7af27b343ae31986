#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use argus::capture::{
    Camera, CameraSystem, DeviceInfo, PixelFormat, PreviewImage, RawFrame, Systems,
};
use argus::display::DisplayRelay;
use argus::metadata::{read_summary, METADATA_CSV};
use argus::writer::timestamps::{read_camera_params, read_timestamps, CAM_PARAMS_CSV, TIMESTAMPS_CSV};
use argus::{CameraConfig, CameraPipeline, Error, RecordingConfig, Result, StopReason};
use bytes::Bytes;
use tempfile::{tempdir, TempDir};

/// Stand-in for ffmpeg that reads and discards stdin
fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("ffmpeg");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    dir: TempDir,
    config: RecordingConfig,
}

impl Fixture {
    fn new(frame_rate: f64, rec_time_in_sec: f64, encoder: &str) -> Self {
        let dir = tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), encoder);
        let config = RecordingConfig {
            camera_make: "emu".to_string().into(),
            video_folder: dir.path().join("videos"),
            frame_rate,
            rec_time_in_sec,
            frame_width: 16.into(),
            frame_height: 8.into(),
            ffmpeg_path: ffmpeg.display().to_string(),
            ..Default::default()
        };
        Self { dir, config }
    }

    fn camera(&self) -> CameraConfig {
        self.config.camera_config(0).unwrap()
    }

    fn emulated(&self) -> CameraPipeline {
        let systems = Systems::load(&self.config).unwrap();
        let (system, device, camera) = systems.prepare_camera(self.camera()).unwrap();
        CameraPipeline::new(system, device, camera)
    }

    fn folder(&self) -> PathBuf {
        self.dir.path().join("videos").join("Camera0")
    }
}

fn device() -> DeviceInfo {
    DeviceInfo {
        selector: "0".into(),
        serial_number: "TEST-0".into(),
        model_name: "Test".into(),
    }
}

/// Camera that fails every `fail_every`-th grab, or every grab when 1
struct FlakyCamera {
    calls: u64,
    delivered: u64,
    fail_every: u64,
    frame_size: usize,
    frame_rate: f64,
    owns_display: bool,
}

impl Camera for FlakyCamera {
    fn model_name(&self) -> String {
        "Flaky".into()
    }

    fn owns_display(&self) -> bool {
        self.owns_display
    }

    fn start_grabbing(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn grab_frame(&mut self, _frame_number: u64) -> Result<RawFrame> {
        self.calls += 1;
        if self.calls % self.fail_every == 0 {
            return Err(Error::Grab("timeout".into()));
        }
        self.delivered += 1;
        Ok(RawFrame {
            data: Bytes::from(vec![0u8; self.frame_size]),
            format: PixelFormat::Rgb24,
            width: 16,
            height: 8,
            timestamp: self.delivered as f64 / self.frame_rate,
        })
    }

    fn close(self: Box<Self>, _config: &CameraConfig) -> Result<()> {
        Ok(())
    }
}

struct FlakySystem {
    fail_every: u64,
    owns_display: bool,
}

impl FlakySystem {
    fn failing_every(fail_every: u64) -> Self {
        Self {
            fail_every,
            owns_display: false,
        }
    }
}

impl CameraSystem for FlakySystem {
    fn make(&self) -> &'static str {
        "emu"
    }

    fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![device()])
    }

    fn open_camera(
        &self,
        _device: &DeviceInfo,
        config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)> {
        let camera = FlakyCamera {
            calls: 0,
            delivered: 0,
            fail_every: self.fail_every,
            frame_size: (config.frame_width * config.frame_height * 3) as usize,
            frame_rate: config.frame_rate,
            owns_display: self.owns_display,
        };
        Ok((Box::new(camera), config.clone()))
    }
}

struct UnpluggedSystem;

impl CameraSystem for UnpluggedSystem {
    fn make(&self) -> &'static str {
        "emu"
    }

    fn device_list(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![device()])
    }

    fn open_camera(
        &self,
        _device: &DeviceInfo,
        _config: &CameraConfig,
    ) -> Result<(Box<dyn Camera>, CameraConfig)> {
        Err(Error::device("open camera", "no such device"))
    }
}

/// Relay that counts what it is shown and remembers being closed
#[derive(Default, Clone)]
struct CountingRelay {
    shown: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl CountingRelay {
    fn shown(&self) -> u64 {
        self.shown.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DisplayRelay for CountingRelay {
    fn show(&mut self, _image: &PreviewImage) -> Result<()> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn emulated_session_records_every_frame() {
    let fixture = Fixture::new(30.0, 2.0, "cat > /dev/null");
    let report = fixture.emulated().run().unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.frames_grabbed, 60);
    assert_eq!(report.frames_written, 60);

    let folder = fixture.folder();
    let rows = read_timestamps(&folder.join(TIMESTAMPS_CSV)).unwrap();
    let numbers: Vec<u64> = rows.iter().map(|r| r.frame_number).collect();
    assert_eq!(numbers, (1..=60).collect::<Vec<_>>());
    assert_eq!(rows[0].time_stamp, 0.0);
    assert!(rows.windows(2).all(|w| w[1].time_stamp >= w[0].time_stamp));

    let summary = read_summary(&folder.join(METADATA_CSV)).unwrap();
    assert_eq!(summary["total_frames"], "60");
    assert_eq!(summary["stop_reason"], "completed");
    assert_eq!(summary["camera_model"], "Emulated_Camera");

    assert!(folder.join("frametimes.npy").is_file());
    assert!(folder.join("frametimes.mat").is_file());
}

#[test]
fn cam_params_hold_the_resolved_configuration() {
    let fixture = Fixture::new(100.0, 0.1, "cat > /dev/null");
    fixture.emulated().run().unwrap();

    let saved = read_camera_params(&fixture.folder().join(CAM_PARAMS_CSV)).unwrap();
    let requested = fixture.camera();
    assert_eq!(saved.codec, requested.codec);
    assert_eq!(saved.frame_rate, requested.frame_rate);
    assert_eq!((saved.frame_width, saved.frame_height), (16, 8));
    assert_eq!(saved.camera_serial_no.as_deref(), Some("EMU-0000"));
    assert_eq!(saved.camera_model.as_deref(), Some("Emulated_Camera"));
}

#[test]
fn transient_grab_errors_keep_frame_numbers_contiguous() {
    let fixture = Fixture::new(100.0, 0.2, "cat > /dev/null");
    let system: Arc<dyn CameraSystem> = Arc::new(FlakySystem::failing_every(3));
    let report = CameraPipeline::new(system, device(), fixture.camera())
        .run()
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.frames_grabbed, 20);

    let rows = read_timestamps(&fixture.folder().join(TIMESTAMPS_CSV)).unwrap();
    let numbers: Vec<u64> = rows.iter().map(|r| r.frame_number).collect();
    assert_eq!(numbers, (1..=20).collect::<Vec<_>>());
}

#[test]
fn grab_error_limit_ends_the_session() {
    let mut fixture = Fixture::new(100.0, 1.0, "cat > /dev/null");
    fixture.config.grab_retry_limit = 5;
    let system: Arc<dyn CameraSystem> = Arc::new(FlakySystem::failing_every(1));
    let report = CameraPipeline::new(system, device(), fixture.camera())
        .run()
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::GrabErrors);
    assert!(!report.is_success());
    assert_eq!(report.frames_grabbed, 0);

    let summary = read_summary(&fixture.folder().join(METADATA_CSV)).unwrap();
    assert_eq!(summary["stop_reason"], "grab_errors");
    assert_eq!(summary["total_frames"], "0");
}

#[test]
fn camera_open_failure_stops_downstream_stages() {
    let fixture = Fixture::new(100.0, 1.0, "cat > /dev/null");
    let system: Arc<dyn CameraSystem> = Arc::new(UnpluggedSystem);
    let result = CameraPipeline::new(system, device(), fixture.camera()).run();

    assert!(matches!(result, Err(Error::Device { .. })));
    // the write stage never started
    assert!(!fixture.folder().join(TIMESTAMPS_CSV).exists());
}

#[test]
fn requested_stop_drains_queued_frames() {
    let fixture = Fixture::new(100.0, 60.0, "cat > /dev/null");
    let pipeline = fixture.emulated();
    let stop = pipeline.stop_handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop.raise(StopReason::Requested)
    });
    let report = pipeline.run().unwrap();
    assert!(stopper.join().unwrap());

    assert_eq!(report.stop_reason, StopReason::Requested);
    assert!(report.frames_grabbed > 0);
    assert!(report.frames_grabbed < 6000);
    assert_eq!(report.frames_written, report.frames_grabbed);

    let summary = read_summary(&fixture.folder().join(METADATA_CSV)).unwrap();
    assert_eq!(summary["stop_reason"], "requested");
}

#[test]
fn failing_encoder_is_never_reported_as_completed() {
    let fixture = Fixture::new(100.0, 0.2, "exit 1");
    let result = fixture.emulated().run();

    assert!(matches!(result, Err(Error::Encoder(_))));
    let summary = read_summary(&fixture.folder().join(METADATA_CSV)).unwrap();
    assert_eq!(summary["stop_reason"], "writer_failed");
}

#[test]
fn preview_is_decimated_to_the_display_rate() {
    let fixture = Fixture::new(30.0, 2.0, "cat > /dev/null");
    assert_eq!(fixture.camera().display_frame_rate, 10.0);
    let relay = CountingRelay::default();

    let report = fixture
        .emulated()
        .with_display(Box::new(relay.clone()))
        .run()
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.frames_written, 60);
    assert_eq!(relay.shown(), 20);
    assert!(relay.closed());
}

#[test]
fn relay_is_closed_when_the_camera_cannot_open() {
    let fixture = Fixture::new(100.0, 1.0, "cat > /dev/null");
    let system: Arc<dyn CameraSystem> = Arc::new(UnpluggedSystem);
    let relay = CountingRelay::default();

    let result = CameraPipeline::new(system, device(), fixture.camera())
        .with_display(Box::new(relay.clone()))
        .run();

    assert!(matches!(result, Err(Error::Device { .. })));
    assert_eq!(relay.shown(), 0);
    assert!(relay.closed());
}

#[test]
fn camera_with_its_own_display_bypasses_the_relay() {
    let fixture = Fixture::new(100.0, 0.2, "cat > /dev/null");
    let system: Arc<dyn CameraSystem> = Arc::new(FlakySystem {
        fail_every: u64::MAX,
        owns_display: true,
    });
    let relay = CountingRelay::default();

    let report = CameraPipeline::new(system, device(), fixture.camera())
        .with_display(Box::new(relay.clone()))
        .run()
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.frames_grabbed, 20);
    // no stop message is sent, the relay ends when the preview sender goes away
    assert_eq!(relay.shown(), 0);
    assert!(relay.closed());
}

#[test]
fn failing_camera_does_not_disturb_its_sibling() {
    let good = Fixture::new(30.0, 2.0, "cat > /dev/null");
    let bad = Fixture::new(30.0, 2.0, "cat > /dev/null");
    let good_relay = CountingRelay::default();
    let bad_relay = CountingRelay::default();

    let good_pipeline = good.emulated().with_display(Box::new(good_relay.clone()));
    let unplugged: Arc<dyn CameraSystem> = Arc::new(UnpluggedSystem);
    let bad_pipeline = CameraPipeline::new(unplugged, device(), bad.camera())
        .with_display(Box::new(bad_relay.clone()));

    let good_run = thread::spawn(move || good_pipeline.run());
    let bad_run = thread::spawn(move || bad_pipeline.run());
    let bad_result = bad_run.join().unwrap();
    let good_report = good_run.join().unwrap().unwrap();

    assert!(matches!(bad_result, Err(Error::Device { .. })));
    assert!(bad_relay.closed());
    assert!(!bad.folder().join(TIMESTAMPS_CSV).exists());

    assert_eq!(good_report.stop_reason, StopReason::Completed);
    assert_eq!(good_report.frames_grabbed, 60);
    assert_eq!(good_report.frames_written, 60);
    assert!(good_relay.closed());
    let rows = read_timestamps(&good.folder().join(TIMESTAMPS_CSV)).unwrap();
    assert_eq!(rows.len(), 60);
}
