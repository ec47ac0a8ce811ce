//! Loopback measurement orchestration
//!
//! The controller wires the pipeline together: a playback thread feeds the
//! tone generator into a sink, a capture thread fills the cell ring from a
//! source, and the controller thread decodes each cell, scores the targeted
//! carrier, and drives an explicit detection state machine. Confidence is
//! accumulated across consecutive frames so a single noisy frame cannot
//! fake a detection; a frame-count timeout turns a stuck trial into a
//! recorded miss rather than a hang.
//!
//! Round-trip latency is the gap between the instant the first frame of a
//! tone was generated and the instant that tone arrived in the capture
//! stream, both drawn from the same monotonic clock. The arrival instant is
//! back-shifted by the tone's onset position within its cell, so the
//! measurement is not quantized to whole cells.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::format::{cell_to_magnitudes, SampleFormat};
use super::io::{CaptureSource, PlaybackSink};
use super::loops::{CaptureLoop, LoopState, PlaybackLoop};
use super::ring::RingBuffer;
use super::spectral::{find_onset, CarrierPlan, SpectralAnalyzer};
use super::tone::MultiToneGenerator;

/// Cells in the capture ring
const RING_CELLS: usize = 4;

/// How long one ring read may stall before the capture thread is checked
const CELL_WAIT: Duration = Duration::from_millis(500);

/// Configuration errors, all fatal before any thread starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tone length {0}s too short, must be at least 0.01s")]
    ToneTooShort(f64),

    #[error("sample rate {0} out of range")]
    InvalidSampleRate(u32),

    #[error("channel count must be at least 1")]
    NoChannels,

    #[error("active channel {channel} out of range for {channels} channels")]
    ActiveChannelOutOfRange { channel: usize, channels: usize },

    #[error("fft size {0} too small for spectral analysis")]
    FftSizeTooSmall(usize),

    #[error("volume {0} outside [0.0, 1.0]")]
    InvalidVolume(f64),

    #[error("no carriers fit between {low_cutoff_hz} Hz and {high_cutoff_hz} Hz")]
    EmptyCarrierBand {
        low_cutoff_hz: f64,
        high_cutoff_hz: f64,
    },
}

/// Measurement run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: usize,
    /// Channels carrying the tone; the rest are written as silence
    pub active_channels: BTreeSet<usize>,
    /// Length of each generated tone in seconds
    pub tone_length_sec: f64,
    /// Samples per analysis frame; also the capture cell size in frames
    pub fft_size: usize,
    pub low_cutoff_hz: f64,
    pub high_cutoff_hz: f64,
    pub start_volume: f64,
    pub end_volume: f64,
    /// Accumulated confidence needed to declare a detection
    pub confidence_threshold: f64,
    /// Analysis frames before a trial is declared a miss
    pub timeout_frames: usize,
    /// Number of carrier trials to run
    pub trials: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            format: SampleFormat::S16Le,
            channels: 2,
            active_channels: (0..2).collect(),
            tone_length_sec: 10.0,
            fft_size: crate::DEFAULT_FFT_SIZE,
            low_cutoff_hz: crate::DEFAULT_LOW_CUTOFF_HZ,
            high_cutoff_hz: crate::DEFAULT_HIGH_CUTOFF_HZ,
            start_volume: 1.0,
            end_volume: 1.0,
            confidence_threshold: 3.0,
            timeout_frames: 15,
            trials: 20,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tone_length_sec < 0.01 {
            return Err(ConfigError::ToneTooShort(self.tone_length_sec));
        }
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.channels == 0 {
            return Err(ConfigError::NoChannels);
        }
        for &channel in &self.active_channels {
            if channel >= self.channels {
                return Err(ConfigError::ActiveChannelOutOfRange {
                    channel,
                    channels: self.channels,
                });
            }
        }
        if self.fft_size < 64 {
            return Err(ConfigError::FftSizeTooSmall(self.fft_size));
        }
        for volume in [self.start_volume, self.end_volume] {
            if !(0.0..=1.0).contains(&volume) {
                return Err(ConfigError::InvalidVolume(volume));
            }
        }
        Ok(())
    }

    /// Bytes in one capture cell
    pub fn cell_bytes(&self) -> usize {
        self.fft_size * self.format.frame_bytes(self.channels)
    }
}

/// Per-trial detection progress as an explicit tagged state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionState {
    /// Still collecting confidence
    Accumulating {
        frames_elapsed: usize,
        confidence_sum: f64,
    },
    /// Accumulated confidence crossed the threshold
    Success {
        frames_elapsed: usize,
        confidence_sum: f64,
    },
    /// The timeout elapsed before the threshold was reached
    TimedOut {
        frames_elapsed: usize,
        confidence_sum: f64,
    },
}

impl DetectionState {
    pub fn new() -> Self {
        DetectionState::Accumulating {
            frames_elapsed: 0,
            confidence_sum: 0.0,
        }
    }

    /// Fold one analysis frame's confidence into the state.
    ///
    /// Negative confidences (anti-matching shapes) do not drain the
    /// accumulator. Terminal states are returned unchanged.
    pub fn observe(self, confidence: f64, threshold: f64, timeout_frames: usize) -> Self {
        let DetectionState::Accumulating {
            frames_elapsed,
            confidence_sum,
        } = self
        else {
            return self;
        };
        let frames_elapsed = frames_elapsed + 1;
        let confidence_sum = confidence_sum + confidence.max(0.0);
        if confidence_sum >= threshold {
            DetectionState::Success {
                frames_elapsed,
                confidence_sum,
            }
        } else if frames_elapsed >= timeout_frames {
            DetectionState::TimedOut {
                frames_elapsed,
                confidence_sum,
            }
        } else {
            DetectionState::Accumulating {
                frames_elapsed,
                confidence_sum,
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DetectionState::Accumulating { .. })
    }
}

impl Default for DetectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one carrier trial
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    /// Index of the targeted carrier
    pub carrier: usize,
    /// Frequency of the targeted carrier in Hz
    pub frequency_hz: f64,
    pub detected: bool,
    /// Analysis frames consumed before the trial ended
    pub frames_waited: usize,
    /// Accumulated confidence at trial end
    pub confidence: f64,
    /// Emission-to-arrival time, when the tone's onset was observed
    pub latency_us: Option<u64>,
}

/// Aggregate result of a measurement run
#[derive(Debug, Clone, Serialize)]
pub struct LatencyReport {
    /// Round-trip latency of the first detected tone, in microseconds
    pub measured_latency_us: Option<u64>,
    pub success: usize,
    pub fail: usize,
    /// Fraction of trials detected, 0.0 to 1.0
    pub success_rate: f64,
    /// Mean accumulated confidence across all trials
    pub mean_confidence: f64,
    pub trials: Vec<TrialResult>,
}

impl LatencyReport {
    fn from_trials(trials: Vec<TrialResult>) -> Self {
        let success = trials.iter().filter(|t| t.detected).count();
        let fail = trials.len() - success;
        let success_rate = if trials.is_empty() {
            0.0
        } else {
            success as f64 / trials.len() as f64
        };
        let mean_confidence = if trials.is_empty() {
            0.0
        } else {
            trials.iter().map(|t| t.confidence).sum::<f64>() / trials.len() as f64
        };
        let measured_latency_us = trials
            .iter()
            .find(|t| t.detected && t.latency_us.is_some())
            .and_then(|t| t.latency_us);
        Self {
            measured_latency_us,
            success,
            fail,
            success_rate,
            mean_confidence,
            trials,
        }
    }
}

/// Pseudo-random carrier selection (glibc LCG constants)
struct Lcg(u32);

impl Lcg {
    fn seeded() -> Self {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x5EED);
        Self(nanos | 1)
    }

    fn with_seed(seed: u32) -> Self {
        Self(seed | 1)
    }

    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        (self.0 >> 16) & 0x7FFF
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() as usize) % n.max(1)
    }
}

/// Orchestrates playback, capture, detection, and latency measurement
pub struct LoopController {
    config: LoopConfig,
    plan: CarrierPlan,
    generator: Arc<MultiToneGenerator>,
    ring: Arc<RingBuffer<u8>>,
    stop: Arc<AtomicBool>,
    rng: Lcg,
}

impl LoopController {
    /// Validate the configuration and derive the carrier plan.
    ///
    /// All configuration errors surface here, before any thread starts.
    pub fn new(config: LoopConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut plan = CarrierPlan::new(
            config.sample_rate,
            config.fft_size,
            config.low_cutoff_hz,
            config.high_cutoff_hz,
        )?;
        plan.estimate_filters();

        let generator = Arc::new(MultiToneGenerator::new(
            config.sample_rate,
            config.tone_length_sec,
        ));
        generator.set_volumes(config.start_volume, config.end_volume);
        let ring = Arc::new(RingBuffer::new(RING_CELLS, config.cell_bytes()));

        tracing::info!(
            sample_rate = config.sample_rate,
            format = %config.format,
            channels = config.channels,
            fft_size = config.fft_size,
            carriers = plan.num_carriers(),
            "loop controller configured"
        );

        Ok(Self {
            config,
            plan,
            generator,
            ring,
            stop: Arc::new(AtomicBool::new(false)),
            rng: Lcg::seeded(),
        })
    }

    /// Flag that ends the run cooperatively at the next trial boundary
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// The derived carrier plan, for diagnostics
    pub fn plan(&self) -> &CarrierPlan {
        &self.plan
    }

    /// Fix the carrier-selection seed, for reproducible runs
    pub fn seed_rng(&mut self, seed: u32) {
        self.rng = Lcg::with_seed(seed);
    }

    /// One-shot measurement with the default observer
    pub fn measure_latency(
        config: LoopConfig,
        sink: Box<dyn PlaybackSink>,
        source: Box<dyn CaptureSource>,
    ) -> Result<LatencyReport> {
        let mut controller = LoopController::new(config)?;
        controller.run(sink, source, |_| {})
    }

    /// Run the measurement loop.
    ///
    /// Spawns the playback and capture threads, analyzes capture cells until
    /// the configured number of trials has completed (or the stop flag is
    /// raised), then terminates and joins both threads before reporting.
    /// `observer` is called once per completed trial.
    pub fn run(
        &mut self,
        sink: Box<dyn PlaybackSink>,
        source: Box<dyn CaptureSource>,
        mut observer: impl FnMut(&TrialResult),
    ) -> Result<LatencyReport> {
        let config = &self.config;
        let frame_bytes = config.format.frame_bytes(config.channels);

        let playback = PlaybackLoop::new(config.fft_size, frame_bytes);
        let capture = CaptureLoop::new();
        playback.state().set(LoopState::Ready);
        capture.state().set(LoopState::Ready);
        let playback_handle = playback.spawn_tones(
            sink,
            Arc::clone(&self.generator),
            config.format,
            config.channels,
            config.active_channels.clone(),
        );
        let capture_handle = capture.spawn(source, Arc::clone(&self.ring));

        let mut target = self.rng.below(self.plan.num_carriers());
        self.plan.set_target(target);
        self.generator.reset(&[self.plan.target_frequency()]);
        tracing::debug!(
            carrier = target,
            frequency_hz = self.plan.target_frequency(),
            "first target selected"
        );

        let mut analyzer = SpectralAnalyzer::new(config.fft_size);
        let mut power = vec![0.0; analyzer.num_bins()];
        let mut state = DetectionState::new();
        let mut onset_mark: Option<Instant> = None;
        let mut trials: Vec<TrialResult> = Vec::new();

        while trials.len() < config.trials && !self.stop.load(Ordering::Relaxed) {
            let Some(cell) = self.ring.lock_cell_to_read_timeout(CELL_WAIT) else {
                if capture_handle.is_finished() || playback_handle.is_finished() {
                    tracing::error!("pipeline thread exited mid-run");
                    break;
                }
                continue;
            };
            let cell_read_at = Instant::now();
            let samples = cell_to_magnitudes(config.format, config.channels, &cell);
            drop(cell);

            // Arrival instant of the tone within this cell, if it starts here
            if onset_mark.is_none() {
                if let Some(onset) = find_onset(&samples) {
                    let tail = (samples.len() - onset) as f64 / f64::from(config.sample_rate);
                    onset_mark = Some(cell_read_at - Duration::from_secs_f64(tail));
                }
            }

            analyzer.power_spectrum(&samples, &mut power);
            let confidence = self.plan.target_confidence(&power);
            state = state.observe(
                confidence,
                config.confidence_threshold,
                config.timeout_frames,
            );

            let (detected, frames_waited, confidence_sum) = match state {
                DetectionState::Accumulating { .. } => continue,
                DetectionState::Success {
                    frames_elapsed,
                    confidence_sum,
                } => (true, frames_elapsed, confidence_sum),
                DetectionState::TimedOut {
                    frames_elapsed,
                    confidence_sum,
                } => (false, frames_elapsed, confidence_sum),
            };

            let latency_us = if detected {
                self.generator.started_at().zip(onset_mark).map(|(t0, t1)| {
                    t1.saturating_duration_since(t0).as_micros() as u64
                })
            } else {
                None
            };

            let trial = TrialResult {
                carrier: target,
                frequency_hz: self.plan.target_frequency(),
                detected,
                frames_waited,
                confidence: confidence_sum,
                latency_us,
            };
            tracing::info!(
                carrier = trial.carrier,
                detected = trial.detected,
                frames = trial.frames_waited,
                confidence = trial.confidence,
                latency_us = trial.latency_us,
                "trial complete"
            );
            observer(&trial);
            trials.push(trial);

            // Next trial: fresh accumulator, a different carrier
            state = DetectionState::new();
            onset_mark = None;
            if self.plan.num_carriers() > 1 {
                let mut next = self.rng.below(self.plan.num_carriers());
                while next == target {
                    next = self.rng.below(self.plan.num_carriers());
                }
                target = next;
            }
            self.plan.set_target(target);
            self.generator.reset(&[self.plan.target_frequency()]);
        }

        playback.state().set(LoopState::Terminated);
        capture.state().set(LoopState::Terminated);
        if let Err(e) = playback_handle.join().map_err(|_| anyhow!("playback thread panicked"))? {
            tracing::warn!(error = %e, "playback loop ended with stream error");
        }
        if let Err(e) = capture_handle.join().map_err(|_| anyhow!("capture thread panicked"))? {
            tracing::warn!(error = %e, "capture loop ended with stream error");
        }

        let report = LatencyReport::from_trials(trials);
        tracing::info!(
            success = report.success,
            fail = report.fail,
            success_rate = report.success_rate,
            measured_latency_us = report.measured_latency_us,
            "measurement run finished"
        );
        Ok(report)
    }

    /// Replace the analytic kernels with measured spectral footprints.
    ///
    /// Plays each carrier alone for `settle`, captures its spectrum through
    /// the live pipeline, and rebuilds that carrier's matched filter from
    /// the measurement. Only useful in a silent environment or under static
    /// noise.
    pub fn calibrate_filters(
        &mut self,
        sink: Box<dyn PlaybackSink>,
        source: Box<dyn CaptureSource>,
        settle: Duration,
    ) -> Result<()> {
        let config = &self.config;
        let frame_bytes = config.format.frame_bytes(config.channels);

        let playback = PlaybackLoop::new(config.fft_size, frame_bytes);
        let capture = CaptureLoop::new();
        playback.state().set(LoopState::Ready);
        capture.state().set(LoopState::Ready);
        let playback_handle = playback.spawn_tones(
            sink,
            Arc::clone(&self.generator),
            config.format,
            config.channels,
            config.active_channels.clone(),
        );
        let capture_handle = capture.spawn(source, Arc::clone(&self.ring));

        let mut analyzer = SpectralAnalyzer::new(config.fft_size);
        let mut power = vec![0.0; analyzer.num_bins()];

        for index in 0..self.plan.num_carriers() {
            self.plan.set_target(index);
            self.generator.reset(&[self.plan.target_frequency()]);
            std::thread::sleep(settle);

            // Drain to the freshest cell so the spectrum reflects this tone
            while self.ring.pending() > 1 {
                drop(self.ring.lock_cell_to_read_timeout(CELL_WAIT));
            }
            let Some(cell) = self.ring.lock_cell_to_read_timeout(CELL_WAIT) else {
                playback.state().set(LoopState::Terminated);
                capture.state().set(LoopState::Terminated);
                let _ = playback_handle.join();
                let _ = capture_handle.join();
                return Err(anyhow!("capture stalled during filter calibration"));
            };
            let samples = cell_to_magnitudes(config.format, config.channels, &cell);
            drop(cell);

            analyzer.power_spectrum(&samples, &mut power);
            self.plan.measure_filter(index, &power);
            tracing::debug!(carrier = index, "filter measured");
        }

        playback.state().set(LoopState::Terminated);
        capture.state().set(LoopState::Terminated);
        playback_handle
            .join()
            .map_err(|_| anyhow!("playback thread panicked"))?
            .ok();
        capture_handle
            .join()
            .map_err(|_| anyhow!("capture thread panicked"))?
            .ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_state_success_path() {
        let mut state = DetectionState::new();
        state = state.observe(1.4, 3.0, 15);
        assert!(!state.is_terminal());
        state = state.observe(1.4, 3.0, 15);
        assert!(!state.is_terminal());
        state = state.observe(1.4, 3.0, 15);
        let DetectionState::Success {
            frames_elapsed,
            confidence_sum,
        } = state
        else {
            panic!("expected success, got {:?}", state);
        };
        assert_eq!(frames_elapsed, 3);
        assert!((confidence_sum - 4.2).abs() < 1e-9);
    }

    #[test]
    fn test_detection_state_times_out_after_exact_frame_count() {
        let mut state = DetectionState::new();
        for frame in 1..=15 {
            state = state.observe(0.0, 3.0, 15);
            if frame < 15 {
                assert!(!state.is_terminal(), "terminal early at frame {}", frame);
            }
        }
        assert!(matches!(
            state,
            DetectionState::TimedOut {
                frames_elapsed: 15,
                ..
            }
        ));
    }

    #[test]
    fn test_detection_state_negative_confidence_does_not_drain() {
        let mut state = DetectionState::new();
        state = state.observe(2.0, 3.0, 15);
        state = state.observe(-5.0, 3.0, 15);
        state = state.observe(1.5, 3.0, 15);
        assert!(matches!(state, DetectionState::Success { .. }));
    }

    #[test]
    fn test_detection_state_terminal_is_sticky() {
        let success = DetectionState::Success {
            frames_elapsed: 2,
            confidence_sum: 3.5,
        };
        assert_eq!(success.observe(10.0, 3.0, 15), success);
    }

    #[test]
    fn test_config_validation() {
        assert!(LoopConfig::default().validate().is_ok());

        let mut config = LoopConfig::default();
        config.tone_length_sec = 0.001;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ToneTooShort(_))
        ));

        let mut config = LoopConfig::default();
        config.active_channels = [5].into_iter().collect();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ActiveChannelOutOfRange { channel: 5, .. })
        ));

        let mut config = LoopConfig::default();
        config.start_volume = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidVolume(_))));

        let mut config = LoopConfig::default();
        config.fft_size = 16;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FftSizeTooSmall(16))
        ));
    }

    #[test]
    fn test_controller_rejects_empty_band_before_starting() {
        let mut config = LoopConfig::default();
        config.low_cutoff_hz = 9000.0;
        config.high_cutoff_hz = 9001.0;
        assert!(matches!(
            LoopController::new(config),
            Err(ConfigError::EmptyCarrierBand { .. })
        ));
    }

    #[test]
    fn test_lcg_below_is_bounded_and_varies() {
        let mut rng = Lcg::with_seed(7);
        let values: Vec<usize> = (0..100).map(|_| rng.below(13)).collect();
        assert!(values.iter().all(|&v| v < 13));
        assert!(values.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_report_aggregation() {
        let trials = vec![
            TrialResult {
                carrier: 3,
                frequency_hz: 2000.0,
                detected: true,
                frames_waited: 2,
                confidence: 6.0,
                latency_us: Some(48_000),
            },
            TrialResult {
                carrier: 7,
                frequency_hz: 4000.0,
                detected: false,
                frames_waited: 15,
                confidence: 1.0,
                latency_us: None,
            },
        ];
        let report = LatencyReport::from_trials(trials);
        assert_eq!(report.success, 1);
        assert_eq!(report.fail, 1);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.mean_confidence, 3.5);
        assert_eq!(report.measured_latency_us, Some(48_000));
    }
}
