//! Per-frame timestamp log and configuration snapshot of the write stage

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CameraConfig;
use crate::error::Result;

pub const TIMESTAMPS_CSV: &str = "timestamps.csv";
pub const CAM_PARAMS_CSV: &str = "cam_params.csv";

/// Rows between flushes
const FLUSH_EVERY: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampRow {
    #[serde(rename = "frameNumber")]
    pub frame_number: u64,
    #[serde(rename = "timeStamp")]
    pub time_stamp: f64,
}

/// Save the resolved configuration the encoder is started with.
///
/// The file holds a single JSON record despite its extension, which keeps
/// the artifact names stable for downstream tooling.
pub fn write_camera_params(folder: &Path, config: &CameraConfig) -> Result<PathBuf> {
    let path = folder.join(CAM_PARAMS_CSV);
    fs::write(&path, serde_json::to_vec(config)?)?;
    info!("Saved camera params to: {}", path.display());
    Ok(path)
}

pub fn read_camera_params(path: &Path) -> Result<CameraConfig> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Append-only `frameNumber,timeStamp` log, zeroed to the first frame it sees
pub struct TimestampLog {
    wtr: csv::Writer<File>,
    path: PathBuf,
    t0: Option<f64>,
}

impl TimestampLog {
    /// Create (or truncate) the log in `folder`.
    pub fn create(folder: &Path) -> Result<Self> {
        let path = folder.join(TIMESTAMPS_CSV);
        info!("Writing timestamps to: {}", path.display());

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        wtr.write_record(["frameNumber", "timeStamp"])?;
        wtr.flush()?;

        Ok(Self { wtr, path, t0: None })
    }

    pub fn append(&mut self, frame_number: u64, time_stamp: f64) -> Result<()> {
        let t0 = *self.t0.get_or_insert(time_stamp);
        self.wtr.serialize(TimestampRow {
            frame_number,
            time_stamp: time_stamp - t0,
        })?;
        if frame_number % FLUSH_EVERY == 0 {
            self.wtr.flush()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.wtr.flush()?;
        info!("Closed metadata writer for: {}", self.path.display());
        Ok(())
    }
}

/// Read a timestamp log back.
pub fn read_timestamps(path: &Path) -> Result<Vec<TimestampRow>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let rows = rdr.deserialize().collect::<Result<Vec<TimestampRow>, csv::Error>>()?;
    Ok(rows)
}
