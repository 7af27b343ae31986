//! Small numeric helpers shared by the grab and write stages

/// Format a duration in whole seconds as `HH:MM:SS`.
///
/// Hours are not wrapped, so 100 hours renders as `100:00:00`.
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let (mins, secs) = (total / 60, total % 60);
    let (hours, mins) = (mins / 60, mins % 60);
    format!("{hours:02}:{mins:02}:{secs:02}")
}

/// Round a product of seconds and frames-per-second to a frame count.
pub fn frames_in(seconds: f64, frame_rate: f64) -> u64 {
    let frames = (seconds * frame_rate).round();
    if frames.is_finite() && frames > 0.0 {
        frames as u64
    } else {
        0
    }
}

/// Mean and population standard deviation of the instantaneous frame rate
/// implied by consecutive timestamps.
///
/// Zero-length intervals are skipped. Returns `None` when fewer than two
/// usable timestamps are available.
pub fn interval_fps(timestamps: &[f64]) -> Option<(f64, f64)> {
    let rates: Vec<f64> = timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .filter(|dt| *dt > 0.0)
        .map(|dt| 1.0 / dt)
        .collect();

    if rates.is_empty() {
        return None;
    }

    let n = rates.len() as f64;
    let mean = rates.iter().sum::<f64>() / n;
    let var = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}
