//! Synchronized multi-camera recording
//!
//! Each configured camera gets its own pipeline: an acquisition loop that
//! grabs numbered, timestamped frames, a write stage that streams them into
//! an external encoder next to a timestamp log, and an optional preview
//! relay. Session metadata is written when the acquisition loop ends.

pub mod capture;
pub mod config;
pub mod display;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod trigger;
pub mod utils;
pub mod writer;

pub use crate::config::{CameraConfig, RecordingConfig};
pub use crate::error::{Error, Result};
pub use crate::pipeline::{CameraPipeline, Recording, SessionReport, StopReason};
