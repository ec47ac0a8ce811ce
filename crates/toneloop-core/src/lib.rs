//! Toneloop Core - Audio pipeline, tone synthesis, and spectral detection
//!
//! This library provides the engine behind the toneloop loopback tester: a
//! realtime capture/playback pipeline synchronized through cell ring
//! buffers, a multi-tone generator, and a matched-filter spectral detector
//! used to measure round-trip audio latency and verify playback/capture
//! ordering.

pub mod audio;

pub use audio::controller::{
    ConfigError, DetectionState, LatencyReport, LoopConfig, LoopController, TrialResult,
};
pub use audio::format::SampleFormat;
pub use audio::io::{CaptureSource, PlaybackSink, SoftwareLoopback, StreamError};
pub use audio::ring::RingBuffer;
pub use audio::spectral::{Carrier, CarrierPlan, SpectralAnalyzer};
pub use audio::tone::MultiToneGenerator;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for audio processing
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default samples per analysis frame; longer frames fit more carriers but
/// add detection latency
pub const DEFAULT_FFT_SIZE: usize = 1024;

/// Default lower edge of the carrier band in Hz
pub const DEFAULT_LOW_CUTOFF_HZ: f64 = 1600.0;

/// Default upper edge of the carrier band in Hz
pub const DEFAULT_HIGH_CUTOFF_HZ: f64 = 10000.0;
