//! Write stage: frames to the encoder, numbers and timestamps to the log

pub mod encoder;
pub mod process;
pub mod timestamps;

use std::fs;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use metrics::counter;
use tracing::{error, info, instrument};

use crate::capture::Frame;
use crate::config::CameraConfig;
use crate::error::Result;
use crate::pipeline::{StopListener, StopReason, StopSignal};

use self::encoder::EncoderParams;
use self::process::FfmpegEncoder;
use self::timestamps::TimestampLog;

/// Wait per poll of an empty frame channel
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Destination of encoded frames
pub trait FrameSink {
    fn submit(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and release the sink.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub frames_written: u64,
    pub last_frame: Option<u64>,
}

/// Run the write stage for one camera until the grab loop has stopped and
/// every queued frame is written.
///
/// Any failure raises [`StopReason::WriterFailed`] towards the grab loop
/// before it is returned.
#[instrument(skip_all)]
pub fn write_frames(
    config: &CameraConfig,
    frames: Receiver<Frame>,
    mut stop_write: StopListener,
    stop_read: &StopSignal,
) -> Result<WriteReport> {
    let result = open_writer(config).and_then(|(encoder, log)| {
        drain(encoder, log, &frames, &mut stop_write)
    });

    if let Err(e) = &result {
        error!("Write stage for {} failed: {}", config.camera_name, e);
        stop_read.raise(StopReason::WriterFailed);
    }
    result
}

fn open_writer(config: &CameraConfig) -> Result<(FfmpegEncoder, TimestampLog)> {
    let params = EncoderParams::derive(config)?;
    let folder = config.output_folder();
    if !folder.is_dir() {
        fs::create_dir_all(&folder)?;
        info!("Made directory {}.", folder.display());
    }

    if let Err(e) = timestamps::write_camera_params(&folder, config) {
        error!("Failed to save camera params: {}", e);
    }
    if config.video_segment_length_in_sec > 0 {
        info!(
            "Splitting video into {} segments of {} s",
            encoder::segment_count(config.rec_time_in_sec, config.video_segment_length_in_sec),
            config.video_segment_length_in_sec
        );
    }
    let log = TimestampLog::create(&folder)?;
    let encoder = FfmpegEncoder::spawn(config, &params)?;
    Ok((encoder, log))
}

/// Forward frames to `sink` and `log` in channel order.
///
/// Returns once a stop has been seen and the channel is empty, or the
/// producer is gone. The sink is closed before the log, on success and on
/// failure.
pub fn drain<S: FrameSink>(
    mut sink: S,
    mut log: TimestampLog,
    frames: &Receiver<Frame>,
    stop: &mut StopListener,
) -> Result<WriteReport> {
    let mut report = WriteReport::default();

    let outcome = loop {
        match frames.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                let written = sink
                    .submit(&frame)
                    .and_then(|_| log.append(frame.number, frame.timestamp));
                if let Err(e) = written {
                    break Err(e);
                }
                report.frames_written += 1;
                report.last_frame = Some(frame.number);
                counter!("argus_frames_written_total").increment(1);
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.poll().is_some() && frames.is_empty() {
                    break Ok(());
                }
            }
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    info!("Closing video writer. Please wait...");
    let closed = sink.close();
    let logged = log.close();

    outcome?;
    closed?;
    logged?;
    info!("Wrote {} frames", report.frames_written);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::error::Error;
    use crate::pipeline::stop_signal;

    #[derive(Clone, Default)]
    struct VecSink {
        frames: Arc<Mutex<Vec<u64>>>,
        fail_at: Option<u64>,
        closed: Arc<Mutex<bool>>,
    }

    impl FrameSink for VecSink {
        fn submit(&mut self, frame: &Frame) -> Result<()> {
            if self.fail_at == Some(frame.number) {
                return Err(Error::Encoder("broken pipe".into()));
            }
            self.frames.lock().unwrap().push(frame.number);
            Ok(())
        }

        fn close(self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn frame(number: u64) -> Frame {
        Frame {
            data: Bytes::new(),
            number,
            timestamp: number as f64 * 0.01,
        }
    }

    #[test]
    fn queued_frames_are_written_before_stop_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let (signal, mut listener) = stop_signal();

        for n in 1..=5 {
            tx.send(frame(n)).unwrap();
        }
        signal.raise(StopReason::Completed);

        let sink = VecSink::default();
        let log = TimestampLog::create(dir.path()).unwrap();
        let report = drain(sink.clone(), log, &rx, &mut listener).unwrap();

        assert_eq!(report.frames_written, 5);
        assert_eq!(report.last_frame, Some(5));
        assert_eq!(*sink.frames.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(*sink.closed.lock().unwrap());
        drop(tx);
    }

    #[test]
    fn producer_going_away_ends_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let (_signal, mut listener) = stop_signal();
        tx.send(frame(1)).unwrap();
        drop(tx);

        let log = TimestampLog::create(dir.path()).unwrap();
        let report = drain(VecSink::default(), log, &rx, &mut listener).unwrap();
        assert_eq!(report.frames_written, 1);
    }

    #[test]
    fn sink_failure_propagates_and_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let (_signal, mut listener) = stop_signal();
        for n in 1..=3 {
            tx.send(frame(n)).unwrap();
        }

        let sink = VecSink {
            fail_at: Some(2),
            ..Default::default()
        };
        let log = TimestampLog::create(dir.path()).unwrap();
        let result = drain(sink.clone(), log, &rx, &mut listener);

        assert!(matches!(result, Err(Error::Encoder(_))));
        assert_eq!(*sink.frames.lock().unwrap(), vec![1]);
        assert!(*sink.closed.lock().unwrap());
    }
}
