//! Multi-tone sine synthesis with fade envelope and volume ramp
//!
//! Generates one or more superposed sine tones as interleaved PCM frames.
//! A quarter-sine fade is applied at tone start and end to avoid audible
//! clicks and spectral leakage into neighboring carriers, and the overall
//! level ramps linearly from a start volume to an end volume across the
//! tone.
//!
//! A controller thread may retarget frequencies or volumes while a playback
//! thread is generating frames; all mutable state sits behind one mutex held
//! only for the duration of each call.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::sync::Mutex;
use std::time::Instant;

use super::format::{encode_magnitude, SampleFormat};

/// Fade-in/fade-out window duration in seconds
const FADE_TIME_SEC: f64 = 0.005;

/// Mutable synthesis state, guarded by the generator's mutex
#[derive(Debug)]
struct ToneState {
    /// Frequencies currently superposed, in Hz
    frequencies: Vec<f64>,
    /// One phase accumulator per active frequency, in radians
    phases: Vec<f64>,
    /// Frames generated since the last reset
    frames_generated: usize,
    /// Current volume on the linear ramp
    cur_volume: f64,
    /// Instant the first frame after the last reset was generated
    started_at: Option<Instant>,
}

/// Generator of superposed sine tones with fade envelope and volume ramp
#[derive(Debug)]
pub struct MultiToneGenerator {
    sample_rate: u32,
    /// Total frames per tone, from the requested duration
    frames_wanted: usize,
    /// Fade window length in frames, capped at half the tone length
    fade_frames: usize,
    start_volume: Mutex<f64>,
    end_volume: Mutex<f64>,
    state: Mutex<ToneState>,
}

impl MultiToneGenerator {
    /// Create a generator for tones of `tone_length_sec` at `sample_rate`
    pub fn new(sample_rate: u32, tone_length_sec: f64) -> Self {
        let frames_wanted = (tone_length_sec * f64::from(sample_rate)) as usize;
        let fade_frames =
            ((FADE_TIME_SEC * f64::from(sample_rate)) as usize).min(frames_wanted / 2);
        Self {
            sample_rate,
            frames_wanted,
            fade_frames,
            start_volume: Mutex::new(1.0),
            end_volume: Mutex::new(1.0),
            state: Mutex::new(ToneState {
                frequencies: Vec::new(),
                phases: Vec::new(),
                frames_generated: 0,
                cur_volume: 1.0,
                started_at: None,
            }),
        }
    }

    /// Set the linear volume ramp endpoints, applied from the next reset
    pub fn set_volumes(&self, start: f64, end: f64) {
        *lock(&self.start_volume) = start.clamp(0.0, 1.0);
        *lock(&self.end_volume) = end.clamp(0.0, 1.0);
    }

    /// Retarget the generator to a new set of frequencies.
    ///
    /// Restarts the frame counter, the fade envelope, and the volume ramp.
    /// An empty slice produces silence.
    pub fn reset(&self, frequencies: &[f64]) {
        let start_volume = *lock(&self.start_volume);
        let mut state = lock(&self.state);
        state.frequencies = frequencies.to_vec();
        state.phases = vec![0.0; frequencies.len()];
        state.frames_generated = 0;
        state.cur_volume = start_volume;
        state.started_at = None;
        tracing::debug!(frequencies = ?frequencies, "tone generator retargeted");
    }

    /// Whether the current tone still has frames to generate
    pub fn has_more_frames(&self) -> bool {
        lock(&self.state).frames_generated < self.frames_wanted
    }

    /// Instant the first frame of the current tone was generated
    pub fn started_at(&self) -> Option<Instant> {
        lock(&self.state).started_at
    }

    /// Configured tone length in frames
    pub fn frames_wanted(&self) -> usize {
        self.frames_wanted
    }

    /// Fade window length in frames
    pub fn fade_frames(&self) -> usize {
        self.fade_frames
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Generate interleaved PCM frames into `out`.
    ///
    /// Channels absent from `active_channels` are written as exact silence,
    /// preserving frame alignment. Returns the number of frames written,
    /// bounded by the output buffer size and the frames remaining in the
    /// current tone.
    pub fn get_frames(
        &self,
        format: SampleFormat,
        channels: usize,
        active_channels: &BTreeSet<usize>,
        out: &mut [u8],
    ) -> usize {
        let width = format.bytes_per_sample();
        let stride = format.frame_bytes(channels);
        let start_volume = *lock(&self.start_volume);
        let end_volume = *lock(&self.end_volume);

        let mut state = lock(&self.state);
        let remaining = self.frames_wanted.saturating_sub(state.frames_generated);
        let frames = (out.len() / stride).min(remaining);
        if frames == 0 {
            return 0;
        }
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }

        let vol_step = if self.frames_wanted > 0 {
            (end_volume - start_volume) / self.frames_wanted as f64
        } else {
            0.0
        };
        let tone_count = state.frequencies.len();
        let phase_steps: Vec<f64> = state
            .frequencies
            .iter()
            .map(|f| 2.0 * PI * f / f64::from(self.sample_rate))
            .collect();

        for n in 0..frames {
            let index = state.frames_generated;
            let fade = fade_factor(index, self.frames_wanted, self.fade_frames);

            let mut magnitude = 0.0;
            for (phase, step) in state.phases.iter_mut().zip(&phase_steps) {
                magnitude += phase.sin();
                *phase += step;
                if *phase >= 2.0 * PI {
                    *phase -= 2.0 * PI;
                }
            }
            if tone_count > 1 {
                magnitude /= tone_count as f64;
            }
            magnitude *= fade * state.cur_volume;
            state.cur_volume += vol_step;
            state.frames_generated += 1;

            let frame = &mut out[n * stride..(n + 1) * stride];
            for (c, sample) in frame.chunks_exact_mut(width).enumerate() {
                let m = if active_channels.contains(&c) {
                    magnitude
                } else {
                    0.0
                };
                encode_magnitude(format, m, sample);
            }
        }

        frames
    }
}

/// Fade envelope multiplier for frame `index` of a `total`-frame tone.
///
/// Quarter-sine ease over the first and last `fade` frames, 1.0 in the
/// steady region. Symmetric: frame k and frame total-1-k share a value.
fn fade_factor(index: usize, total: usize, fade: usize) -> f64 {
    if fade == 0 || total == 0 {
        return 1.0;
    }
    let position = if index < fade {
        index
    } else if index >= total - fade {
        total - 1 - index
    } else {
        return 1.0;
    };
    (PI / 2.0 * position as f64 / fade as f64).sin()
}

/// Lock a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
