//! External encoder process fed raw frames over stdin

use std::io::{BufWriter, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::encoder::EncoderParams;
use super::FrameSink;
use crate::capture::{Frame, PixelFormat};
use crate::config::CameraConfig;
use crate::error::{Error, Result};

/// How long the encoder may take to finish after stdin is closed
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Build the encoder command for one camera.
pub fn build_command(config: &CameraConfig, params: &EncoderParams) -> Command {
    let mut cmd = Command::new(&config.ffmpeg_path);
    // Own session, so a terminal Ctrl-C reaches only the recorder, which then
    // closes the encoder cleanly.
    unsafe {
        cmd.pre_exec(|| {
            if let Err(e) = nix::unistd::setsid() {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
            }
            Ok(())
        });
    }
    cmd.args(params.command_args(config));
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    cmd
}

/// A running encoder process
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    frame_size: Option<usize>,
    frames: u64,
}

impl FfmpegEncoder {
    pub fn spawn(config: &CameraConfig, params: &EncoderParams) -> Result<Self> {
        let mut cmd = build_command(config, params);
        debug!("Encoder command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Encoder(format!("failed to start {}: {e}", config.ffmpeg_path))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("encoder stdin not captured".into()))?;

        info!(
            "Opened: {} using {} ({:?})",
            params.output_path.display(),
            params.codec,
            params.target
        );

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            frame_size: config
                .input_format()
                .and_then(|f: PixelFormat| f.frame_size(config.frame_width, config.frame_height)),
            frames: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Wait for the process, killing it after `timeout`.
    fn wait(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(Error::Encoder(format!("encoder exited with {status}")))
                };
            }
            if Instant::now() >= deadline {
                warn!("Encoder did not exit within {:?}, killing it", timeout);
                self.child.kill()?;
                self.child.wait()?;
                return Err(Error::Encoder(format!(
                    "encoder did not finish within {timeout:?}"
                )));
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

impl FrameSink for FfmpegEncoder {
    fn submit(&mut self, frame: &Frame) -> Result<()> {
        if let Some(expected) = self.frame_size {
            if frame.data.len() != expected {
                return Err(Error::Encoder(format!(
                    "frame {} has {} bytes, encoder expects {}",
                    frame.number,
                    frame.data.len(),
                    expected
                )));
            }
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encoder("encoder already closed".into()))?;
        stdin.write_all(&frame.data).map_err(|e| {
            Error::Encoder(format!("failed to write frame {}: {e}", frame.number))
        })?;
        self.frames += 1;
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };
        // stdin is dropped here, the encoder sees end of input

        let waited = self.wait(CLOSE_TIMEOUT);
        flushed.map_err(|e| Error::Encoder(format!("failed to flush encoder input: {e}")))?;
        waited?;

        info!("Encoder finished after {} frames", self.frames);
        Ok(())
    }
}
