//! Per-camera recording pipeline
//!
//! A camera runs three stages: the grab loop on the caller's thread, the
//! write stage and the display relay on their own threads. They are joined
//! by the frame and preview channels and by two stop signals.

pub mod channel;
pub mod grab;
pub mod recording;
pub mod session;
pub mod signal;

pub use channel::{frame_channel, preview_channel, FrameSender, PreviewMessage, PREVIEW_CAPACITY};
pub use grab::{grab_frames, GrabLinks, GrabOutcome, GrabStats};
pub use recording::Recording;
pub use session::{CameraPipeline, SessionReport};
pub use signal::{stop_signal, StopListener, StopReason, StopSignal};
