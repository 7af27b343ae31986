//! Per-camera session metadata
//!
//! Written once when the grab loop ends. `frametimes.npy` and
//! `frametimes.mat` hold the frame numbers and zeroed timestamps,
//! `metadata.csv` the resolved camera configuration plus totals.

pub mod mat;
pub mod npy;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use csv::{QuoteStyle, WriterBuilder};
use serde_json::Value;
use tracing::info;

use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::pipeline::StopReason;

pub const FRAMETIMES_NPY: &str = "frametimes.npy";
pub const FRAMETIMES_MAT: &str = "frametimes.mat";
pub const METADATA_CSV: &str = "metadata.csv";

/// Final statistics of one camera's recording
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetadata {
    pub frame_numbers: Vec<u64>,
    /// Seconds since the first grabbed frame
    pub time_stamps: Vec<f64>,
    pub total_frames: u64,
    pub total_time: f64,
    pub fps: f64,
    pub stop_reason: StopReason,
}

impl SessionMetadata {
    pub fn new(frame_numbers: &[u64], time_stamps: &[f64], stop_reason: StopReason) -> Self {
        let first = time_stamps.first().copied().unwrap_or(0.0);
        let time_stamps: Vec<f64> = time_stamps.iter().map(|t| t - first).collect();

        let total_frames = frame_numbers.last().copied().unwrap_or(0);
        let total_time = time_stamps.last().copied().unwrap_or(0.0);
        let fps = if total_time > 0.0 {
            total_frames as f64 / total_time
        } else {
            0.0
        };

        Self {
            frame_numbers: frame_numbers.to_vec(),
            time_stamps,
            total_frames,
            total_time,
            fps,
            stop_reason,
        }
    }

    /// Write all three metadata files into the camera's output folder.
    pub fn save(&self, config: &CameraConfig) -> Result<()> {
        let folder = config.output_folder();
        fs::create_dir_all(&folder).map_err(|e| metadata_error(&folder, e))?;

        info!(
            "Camera {} saved {} frames at {:.2} fps.",
            config.camera_name, self.total_frames, self.fps
        );

        let path = folder.join(FRAMETIMES_NPY);
        let numbers: Vec<f64> = self.frame_numbers.iter().map(|&n| n as f64).collect();
        File::create(&path)
            .and_then(|file| {
                let mut w = BufWriter::new(file);
                npy::write_f64_rows(&mut w, &[numbers.as_slice(), self.time_stamps.as_slice()])?;
                w.flush()
            })
            .map_err(|e| metadata_error(&path, e))?;

        let path = folder.join(FRAMETIMES_MAT);
        let numbers: Vec<i64> = self.frame_numbers.iter().map(|&n| n as i64).collect();
        File::create(&path)
            .and_then(|file| {
                let mut w = BufWriter::new(file);
                mat::write_mat(
                    &mut w,
                    &[
                        mat::Variable::Int64("frameNumber", &numbers),
                        mat::Variable::Double("timeStamp", &self.time_stamps),
                    ],
                )?;
                w.flush()
            })
            .map_err(|e| metadata_error(&path, e))?;

        self.write_summary(config)?;
        info!("Saved metadata for {}", config.camera_name);
        Ok(())
    }

    /// (Re)write `metadata.csv` only.
    pub fn write_summary(&self, config: &CameraConfig) -> Result<()> {
        let path = config.output_folder().join(METADATA_CSV);
        self.write_summary_to(&path, config)
            .map_err(|e| metadata_error(&path, e))
    }

    fn write_summary_to(&self, path: &Path, config: &CameraConfig) -> Result<()> {
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::Always)
            .from_path(path)?;

        if let Value::Object(fields) = serde_json::to_value(config)? {
            for (key, value) in &fields {
                if let Some(text) = flat_value(value) {
                    wtr.write_record([key.as_str(), text.as_str()])?;
                }
            }
        }

        wtr.write_record(["total_frames", self.total_frames.to_string().as_str()])?;
        wtr.write_record(["total_time", self.total_time.to_string().as_str()])?;
        wtr.write_record(["fps", self.fps.to_string().as_str()])?;
        wtr.write_record(["stop_reason", self.stop_reason.as_str()])?;
        wtr.flush()?;
        Ok(())
    }
}

fn metadata_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Metadata(format!("{}: {err}", path.display()))
}

/// Scalars and lists of scalars; everything else is skipped
fn flat_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) if items.iter().all(is_scalar) => Some(value.to_string()),
        _ => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Read `metadata.csv` back into key/value pairs.
pub fn read_summary(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;

    let mut summary = BTreeMap::new();
    for record in rdr.records() {
        let record = record?;
        if let (Some(key), Some(value)) = (record.get(0), record.get(1)) {
            summary.insert(key.to_string(), value.to_string());
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordingConfig;

    fn camera_config(folder: &Path) -> CameraConfig {
        let config = RecordingConfig {
            camera_make: "emu".to_string().into(),
            video_folder: folder.to_path_buf(),
            ..Default::default()
        };
        config.camera_config(0).unwrap()
    }

    #[test]
    fn timestamps_are_zeroed_to_first_frame() {
        let meta = SessionMetadata::new(&[1, 2, 3], &[10.0, 10.5, 11.0], StopReason::Completed);
        assert_eq!(meta.time_stamps, vec![0.0, 0.5, 1.0]);
        assert_eq!(meta.total_frames, 3);
        assert_eq!(meta.total_time, 1.0);
        assert_eq!(meta.fps, 3.0);
    }

    #[test]
    fn empty_session_has_zero_totals() {
        let meta = SessionMetadata::new(&[], &[], StopReason::CameraFailed);
        assert_eq!(meta.total_frames, 0);
        assert_eq!(meta.fps, 0.0);
    }

    #[test]
    fn flat_values_skip_nested_data() {
        assert_eq!(flat_value(&serde_json::json!(3)), Some("3".into()));
        assert_eq!(flat_value(&serde_json::json!("x")), Some("x".into()));
        assert_eq!(flat_value(&serde_json::json!([1, 2])), Some("[1,2]".into()));
        assert_eq!(flat_value(&serde_json::json!(null)), None);
        assert_eq!(flat_value(&serde_json::json!({"a": 1})), None);
        assert_eq!(flat_value(&serde_json::json!([{"a": 1}])), None);
    }

    #[test]
    fn save_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = camera_config(dir.path());
        let meta = SessionMetadata::new(&[1, 2], &[5.0, 5.01], StopReason::Requested);
        meta.save(&config).unwrap();

        let folder = config.output_folder();
        assert!(folder.join(FRAMETIMES_NPY).is_file());
        assert!(folder.join(FRAMETIMES_MAT).is_file());

        let summary = read_summary(&folder.join(METADATA_CSV)).unwrap();
        assert_eq!(summary["camera_name"], "Camera0");
        assert_eq!(summary["total_frames"], "2");
        assert_eq!(summary["stop_reason"], "requested");
        // None fields are skipped
        assert!(!summary.contains_key("preset"));

        let raw = fs::read_to_string(folder.join(METADATA_CSV)).unwrap();
        assert!(raw.lines().all(|line| line.starts_with('"')));
    }

    #[test]
    fn unwritable_folder_is_a_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-folder");
        fs::write(&blocker, b"").unwrap();

        let config = camera_config(&blocker);
        let meta = SessionMetadata::new(&[1], &[0.0], StopReason::Completed);
        assert!(matches!(meta.save(&config), Err(Error::Metadata(_))));
        assert!(matches!(meta.write_summary(&config), Err(Error::Metadata(_))));
    }
}
