//! Channels between the grab loop and its consumers
//!
//! The frame channel never loses a frame: when the encoder falls behind the
//! grab loop waits for a free slot. The preview channel never waits: it keeps
//! the newest images and drops the oldest.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use metrics::counter;
use tracing::warn;

use crate::capture::{Frame, PreviewImage};
use crate::error::{Error, Result};

/// Number of preview images buffered ahead of the display relay
pub const PREVIEW_CAPACITY: usize = 2;

/// Create the frame channel. `None` means unbounded.
pub fn frame_channel(capacity: Option<usize>) -> (FrameSender, Receiver<Frame>) {
    let (tx, rx) = match capacity {
        Some(capacity) => flume::bounded(capacity),
        None => flume::unbounded(),
    };
    (FrameSender { tx, blocked: 0 }, rx)
}

/// Producer side of the frame channel
pub struct FrameSender {
    tx: Sender<Frame>,
    blocked: u64,
}

impl FrameSender {
    /// Queue a frame, waiting for the writer if the queue is full.
    ///
    /// Fails only when the write stage has gone away.
    pub fn send(&mut self, frame: Frame) -> Result<()> {
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(frame)) => frame,
            Err(TrySendError::Disconnected(_)) => return Err(writer_gone()),
        };

        self.blocked += 1;
        counter!("argus_write_queue_blocked_total").increment(1);
        if self.blocked == 1 || self.blocked % 100 == 0 {
            warn!(
                "Write queue full at frame {}, waiting for the encoder ({} times so far)",
                frame.number, self.blocked
            );
        }
        self.tx.send(frame).map_err(|_| writer_gone())
    }

    /// How often the producer had to wait for a free slot
    pub fn blocked(&self) -> u64 {
        self.blocked
    }
}

fn writer_gone() -> Error {
    Error::Encoder("write stage stopped receiving frames".into())
}

/// Item on the preview channel
#[derive(Debug, Clone)]
pub enum PreviewMessage {
    Image(PreviewImage),
    /// No more images will follow
    Stop,
}

#[derive(Default)]
struct Stats {
    images_sent: AtomicUsize,
    images_read: AtomicUsize,
    images_dropped: AtomicUsize,
}

/// Snapshot of preview channel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewStats {
    pub sent: usize,
    pub read: usize,
    pub dropped: usize,
}

/// Create the preview channel with room for `capacity` images.
pub fn preview_channel(capacity: usize) -> (PreviewSender, PreviewReceiver) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let stats = Arc::new(CachePadded::new(Stats::default()));
    (
        PreviewSender {
            tx,
            oldest: rx.clone(),
            stats: Arc::clone(&stats),
        },
        PreviewReceiver { rx, stats },
    )
}

/// Producer side of the preview channel, never blocks
pub struct PreviewSender {
    tx: Sender<PreviewMessage>,
    /// Receiver handle used to evict the oldest image when full
    oldest: Receiver<PreviewMessage>,
    stats: Arc<CachePadded<Stats>>,
}

impl PreviewSender {
    pub fn push(&self, image: PreviewImage) {
        self.put(PreviewMessage::Image(image));
    }

    /// Tell the relay that no more images follow.
    pub fn stop(&self) {
        self.put(PreviewMessage::Stop);
    }

    fn put(&self, mut message: PreviewMessage) {
        loop {
            match self.tx.try_send(message) {
                Ok(()) => {
                    self.stats.images_sent.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(rejected)) => {
                    // Drop oldest
                    if self.oldest.try_recv().is_ok() {
                        self.stats.images_dropped.fetch_add(1, Ordering::Relaxed);
                        counter!("argus_preview_dropped_total").increment(1);
                    }
                    message = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn stats(&self) -> PreviewStats {
        self.stats.snapshot()
    }
}

/// Consumer side of the preview channel
pub struct PreviewReceiver {
    rx: Receiver<PreviewMessage>,
    stats: Arc<CachePadded<Stats>>,
}

impl PreviewReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PreviewMessage, RecvTimeoutError> {
        let message = self.rx.recv_timeout(timeout)?;
        if matches!(message, PreviewMessage::Image(_)) {
            self.stats.images_read.fetch_add(1, Ordering::Relaxed);
        }
        Ok(message)
    }

    pub fn stats(&self) -> PreviewStats {
        self.stats.snapshot()
    }
}

impl Stats {
    fn snapshot(&self) -> PreviewStats {
        PreviewStats {
            sent: self.images_sent.load(Ordering::Relaxed),
            read: self.images_read.load(Ordering::Relaxed),
            dropped: self.images_dropped.load(Ordering::Relaxed),
        }
    }
}
