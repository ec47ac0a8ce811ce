//! Toneloop - audio loopback latency tester
//!
//! Measures round-trip audio latency by playing pseudo-randomly chosen sine
//! carriers through a playback path and detecting them in the capture path
//! with matched filters over an FFT power spectrum. The engine lives in
//! [`toneloop_core`]; this crate is the command-line harness.

pub use toneloop_core::*;
