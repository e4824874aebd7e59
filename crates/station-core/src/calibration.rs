//! Two-tone marker detection and the offset correction derived from it.
//!
//! The broadcast carries a short tone A followed immediately by tone B at the
//! top of each hour.  A recording of a slot ending on the hour should finish a
//! fixed distance after the marker; any difference is clock drift.

use tracing::{debug, info, warn};

use crate::clock::{normalize_offset, round_tenth};
use crate::config::CalibrationConfig;

const FRAME_SECS: f64 = 0.05;
/// Share of a frame's energy that must sit in the tone bin.
const TONE_DOMINANCE: f64 = 0.5;
const SILENCE_FLOOR: f64 = 1e-6;

/// Mono signed 16-bit little-endian PCM to samples in [-1, 1).
pub fn decode_s16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Goertzel power of `freq` in `frame`, relative to the frame's energy.
/// A pure sine on the bin reads close to 1.0; silence reads 0.0.
fn tone_share(frame: &[f32], freq: f64, sample_rate: u32) -> f64 {
    let n = frame.len() as f64;
    let energy: f64 = frame.iter().map(|&x| (x as f64) * (x as f64)).sum();
    if energy < SILENCE_FLOOR {
        return 0.0;
    }
    let k = (n * freq / sample_rate as f64).round();
    let coeff = 2.0 * (2.0 * std::f64::consts::PI * k / n).cos();
    let (mut s1, mut s2) = (0.0f64, 0.0f64);
    for &x in frame {
        let s0 = x as f64 + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    power / (energy * n / 2.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameClass {
    A,
    B,
    Other,
}

/// Scan `samples` for tone A followed by tone B, each lasting at least
/// `min_tone_secs`.  Returns the time (seconds from the start of `samples`)
/// at which the last such B tone ends.
pub fn detect_two_tone(samples: &[f32], sample_rate: u32, config: &CalibrationConfig) -> Option<f64> {
    let frame_len = ((sample_rate as f64 * FRAME_SECS) as usize).max(1);
    let min_frames = ((config.min_tone_secs / FRAME_SECS).ceil() as usize).max(1);

    let classes: Vec<FrameClass> = samples
        .chunks_exact(frame_len)
        .map(|frame| {
            let a = tone_share(frame, config.tone_a_hz, sample_rate);
            let b = tone_share(frame, config.tone_b_hz, sample_rate);
            if a >= TONE_DOMINANCE && a > b {
                FrameClass::A
            } else if b >= TONE_DOMINANCE && b > a {
                FrameClass::B
            } else {
                FrameClass::Other
            }
        })
        .collect();

    // Run-length encode, then look for an A run directly followed by a B run.
    let mut runs: Vec<(FrameClass, usize, usize)> = Vec::new();
    for (idx, class) in classes.iter().enumerate() {
        match runs.last_mut() {
            Some((c, _, len)) if c == class => *len += 1,
            _ => runs.push((*class, idx, 1)),
        }
    }

    runs.windows(2)
        .rev()
        .find(|pair| {
            let (a, b) = (pair[0], pair[1]);
            a.0 == FrameClass::A && b.0 == FrameClass::B && a.2 >= min_frames && b.2 >= min_frames
        })
        .map(|pair| {
            let (_, start, len) = pair[1];
            ((start + len) * frame_len) as f64 / sample_rate as f64
        })
}

/// Drift implied by a marker ending `distance_from_end` seconds before the end
/// of the file.
pub fn compute_drift(distance_from_end: f64, config: &CalibrationConfig) -> f64 {
    distance_from_end - config.expected_distance_secs
}

/// New offset after applying `drift`, or `None` if the drift is implausible.
pub fn apply_drift(current: f64, drift: f64, max_drift: f64) -> Option<f64> {
    if !drift.is_finite() || drift.abs() > max_drift {
        return None;
    }
    Some(round_tenth(normalize_offset(round_tenth(current + drift))))
}

/// Full calibration of one decoded tail.  `samples` cover the last part of a
/// recording and end exactly where the file ends.
pub fn calibrate_tail(samples: &[f32], current_offset: f64, config: &CalibrationConfig) -> Option<f64> {
    let sample_rate = config.sample_rate.max(1);
    let tail_secs = samples.len() as f64 / sample_rate as f64;
    let Some(tone_end) = detect_two_tone(samples, sample_rate, config) else {
        debug!("calibration: no marker in the last {:.1}s", tail_secs);
        return None;
    };

    let distance = tail_secs - tone_end;
    let drift = compute_drift(distance, config);
    match apply_drift(current_offset, drift, config.max_drift_secs) {
        Some(updated) => {
            info!(
                "calibration: marker {:.2}s before end, drift {:+.2}s, offset {:.1} → {:.1}",
                distance, drift, current_offset, updated
            );
            Some(updated)
        }
        None => {
            warn!(
                "calibration: drift {:+.2}s exceeds ±{:.0}s, ignoring",
                drift, config.max_drift_secs
            );
            None
        }
    }
}
