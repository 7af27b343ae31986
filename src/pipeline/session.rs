//! One camera's recording session: wiring and thread lifecycle

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, info_span, Span};

use super::channel::{frame_channel, preview_channel, PREVIEW_CAPACITY};
use super::grab::{grab_frames, GrabLinks};
use super::signal::{stop_signal, StopListener, StopReason, StopSignal};
use crate::capture::{CameraSystem, DeviceInfo};
use crate::config::CameraConfig;
use crate::display::{relay_previews, DisplayRelay};
use crate::error::{Error, Result};
use crate::writer::{write_frames, WriteReport};

/// How one camera's session ended
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub camera_name: String,
    pub stop_reason: StopReason,
    pub frames_grabbed: u64,
    pub frames_written: u64,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.stop_reason.is_success()
    }
}

/// A camera ready to record
pub struct CameraPipeline {
    system: Arc<dyn CameraSystem>,
    device: DeviceInfo,
    config: CameraConfig,
    display: Option<Box<dyn DisplayRelay>>,
    stop: StopSignal,
    stop_read: StopListener,
    span: Span,
}

impl CameraPipeline {
    pub fn new(system: Arc<dyn CameraSystem>, device: DeviceInfo, config: CameraConfig) -> Self {
        let (stop, stop_read) = stop_signal();
        let span = info_span!("camera", name = %config.camera_name);
        Self {
            system,
            device,
            config,
            display: None,
            stop,
            stop_read,
            span,
        }
    }

    /// Send previews of this camera to `relay`.
    pub fn with_display(mut self, relay: Box<dyn DisplayRelay>) -> Self {
        self.display = Some(relay);
        self
    }

    /// Handle that stops the grab loop from outside, e.g. on Ctrl-C.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn camera_name(&self) -> &str {
        &self.config.camera_name
    }

    /// Record until a stop condition, then wait for the write stage and the
    /// display relay to finish.
    ///
    /// Fails if the camera cannot be opened or the write stage fails. A grab
    /// loop that gives up on a camera still returns a report, carrying the
    /// stop reason.
    pub fn run(self) -> Result<SessionReport> {
        let Self {
            system,
            device,
            config,
            display,
            stop,
            stop_read,
            span,
        } = self;
        let _entered = span.enter();
        let name = config.camera_name.clone();

        let (frames, frames_rx) = frame_channel(config.write_queue_capacity());
        let (preview, preview_rx) = preview_channel(PREVIEW_CAPACITY);
        let (stop_write, stop_write_rx) = stop_signal();
        let (resolved, resolved_rx) = flume::bounded::<CameraConfig>(1);

        let writer: JoinHandle<Result<Option<WriteReport>>> = thread::Builder::new()
            .name(format!("{name}-write"))
            .spawn({
                let span = span.clone();
                move || {
                    span.in_scope(|| match resolved_rx.recv() {
                        Ok(resolved) => {
                            write_frames(&resolved, frames_rx, stop_write_rx, &stop).map(Some)
                        }
                        // Camera never opened
                        Err(_) => Ok(None),
                    })
                }
            })?;

        let relay = match display {
            Some(mut relay) => Some(
                thread::Builder::new()
                    .name(format!("{name}-display"))
                    .spawn({
                        let span = span.clone();
                        move || span.in_scope(|| relay_previews(relay.as_mut(), preview_rx))
                    })?,
            ),
            None => {
                drop(preview_rx);
                None
            }
        };

        let links = GrabLinks {
            frames,
            preview,
            resolved,
            stop_read,
            stop_write,
        };
        let grabbed = grab_frames(system, &device, config, links);

        let written = writer
            .join()
            .unwrap_or_else(|_| Err(Error::Encoder("write thread panicked".into())));
        if let Some(relay) = relay {
            if relay.join().is_err() {
                error!("Display relay for {} panicked", name);
            }
        }

        let outcome = grabbed?;
        let report = match written {
            Ok(report) => report.unwrap_or_default(),
            Err(e) => {
                // The encoder can fail on close, after the grab loop has
                // already saved a successful stop reason.
                if outcome.stop_reason != StopReason::WriterFailed {
                    let mut metadata = outcome.metadata;
                    metadata.stop_reason = StopReason::WriterFailed;
                    if let Err(me) = metadata.write_summary(&outcome.config) {
                        error!("Failed to update metadata for {}: {}", name, me);
                    }
                }
                return Err(e);
            }
        };

        let frames_grabbed = outcome.stats.frame_count();
        if report.frames_written != frames_grabbed {
            error!(
                "{} grabbed {} frames but wrote {}",
                name, frames_grabbed, report.frames_written
            );
        }
        info!(
            "{} finished ({}): {} frames grabbed, {} written",
            name, outcome.stop_reason, frames_grabbed, report.frames_written
        );

        Ok(SessionReport {
            camera_name: name,
            stop_reason: outcome.stop_reason,
            frames_grabbed,
            frames_written: report.frames_written,
        })
    }
}
