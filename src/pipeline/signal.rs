//! Single-slot stop sentinels between the stages of one camera pipeline

use std::fmt;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

/// Why a camera stopped recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Frame count or recording duration reached
    Completed,
    /// Stopped from outside, e.g. Ctrl-C
    Requested,
    /// Camera could not be opened or started
    CameraFailed,
    /// Too many consecutive grab failures
    GrabErrors,
    /// Encoder or timestamp log failed
    WriterFailed,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Requested => "requested",
            Self::CameraFailed => "camera_failed",
            Self::GrabErrors => "grab_errors",
            Self::WriterFailed => "writer_failed",
        }
    }

    /// Whether the recording ended the way the user asked for
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create a connected signal/listener pair.
pub fn stop_signal() -> (StopSignal, StopListener) {
    let (tx, rx) = flume::bounded(1);
    (StopSignal { tx }, StopListener { rx, seen: None })
}

/// Raising side. The first reason raised wins, later ones are ignored.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Sender<StopReason>,
}

impl StopSignal {
    /// Returns `false` if a stop was already pending or nobody listens.
    pub fn raise(&self, reason: StopReason) -> bool {
        self.tx.try_send(reason).is_ok()
    }
}

/// Observing side, remembers the first reason it saw
#[derive(Debug)]
pub struct StopListener {
    rx: Receiver<StopReason>,
    seen: Option<StopReason>,
}

impl StopListener {
    /// Non-blocking check.
    pub fn poll(&mut self) -> Option<StopReason> {
        if self.seen.is_none() {
            self.seen = self.rx.try_recv().ok();
        }
        self.seen
    }

    /// Wait up to `timeout` for a stop.
    pub fn wait(&mut self, timeout: Duration) -> Option<StopReason> {
        if self.seen.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(reason) => self.seen = Some(reason),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
        self.seen
    }
}
