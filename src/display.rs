//! Display relay boundary
//!
//! The on-screen renderer lives outside this crate. A relay receives the
//! downsampled RGB previews of one camera and is told when the stream ends.

use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::capture::PreviewImage;
use crate::error::Result;
use crate::pipeline::channel::{PreviewMessage, PreviewReceiver};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Consumer of preview images
pub trait DisplayRelay: Send {
    fn show(&mut self, image: &PreviewImage) -> Result<()>;

    /// Called once after the last image.
    fn close(&mut self) {}
}

/// Feed `relay` until the preview stream ends. Returns the number of images
/// shown.
///
/// A relay that fails is not fed again; recording is unaffected.
pub fn relay_previews(relay: &mut dyn DisplayRelay, previews: PreviewReceiver) -> u64 {
    let mut shown = 0;
    let mut failed = false;

    loop {
        match previews.recv_timeout(RECV_TIMEOUT) {
            Ok(PreviewMessage::Image(image)) => {
                if failed {
                    continue;
                }
                match relay.show(&image) {
                    Ok(()) => shown += 1,
                    Err(e) => {
                        warn!("Display relay failed, preview disabled: {}", e);
                        failed = true;
                    }
                }
            }
            Ok(PreviewMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    relay.close();
    let stats = previews.stats();
    info!(
        "Preview closed after {} images ({} dropped)",
        shown, stats.dropped
    );
    shown
}

/// Relay for runs without a screen; logs what it would show
#[derive(Debug, Default)]
pub struct HeadlessRelay {
    shown: u64,
}

impl HeadlessRelay {
    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl DisplayRelay for HeadlessRelay {
    fn show(&mut self, image: &PreviewImage) -> Result<()> {
        self.shown += 1;
        debug!(
            "preview {} ({}x{}, {} bytes)",
            self.shown,
            image.width,
            image.height,
            image.data.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::Error;
    use crate::pipeline::channel::preview_channel;

    fn image() -> PreviewImage {
        PreviewImage {
            width: 2,
            height: 2,
            data: Bytes::from_static(&[0; 12]),
        }
    }

    struct FailingRelay {
        calls: u32,
    }

    impl DisplayRelay for FailingRelay {
        fn show(&mut self, _image: &PreviewImage) -> Result<()> {
            self.calls += 1;
            Err(Error::Config("no screen".into()))
        }
    }

    #[test]
    fn relay_runs_until_stop() {
        let (tx, rx) = preview_channel(4);
        tx.push(image());
        tx.push(image());
        tx.stop();

        let mut relay = HeadlessRelay::default();
        assert_eq!(relay_previews(&mut relay, rx), 2);
        assert_eq!(relay.shown(), 2);
    }

    #[test]
    fn failing_relay_is_not_fed_again() {
        let (tx, rx) = preview_channel(4);
        tx.push(image());
        tx.push(image());
        tx.push(image());
        drop(tx);

        let mut relay = FailingRelay { calls: 0 };
        assert_eq!(relay_previews(&mut relay, rx), 0);
        assert_eq!(relay.calls, 1);
    }
}
