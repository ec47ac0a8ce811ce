//! E2E tests for the synthesis-to-detection path
//!
//! Runs synthesized tones through the PCM codec and the spectral detector
//! with no hardware in the loop: codec round-trip laws, fade envelope
//! shape, matched-filter normalization, and carrier discrimination.

use std::collections::BTreeSet;
use std::time::Duration;

use toneloop::audio::format::{cell_to_magnitudes, decode_sample, encode_magnitude};
use toneloop::{
    CarrierPlan, LoopConfig, LoopController, MultiToneGenerator, SampleFormat, SoftwareLoopback,
    SpectralAnalyzer,
};

const SAMPLE_RATE: u32 = 48000;
const FFT_SIZE: usize = 1024;

fn mono() -> BTreeSet<usize> {
    [0].into_iter().collect()
}

/// Synthesize a tone and hand back the decoded steady-state analysis frame
fn steady_tone_frame(frequency: f64) -> Vec<f64> {
    let generator = MultiToneGenerator::new(SAMPLE_RATE, 0.5);
    generator.reset(&[frequency]);

    // Skip past the fade-in so the analysis window sees the steady tone
    let lead = generator.fade_frames();
    let mut pcm = vec![0u8; (lead + FFT_SIZE) * 2];
    let frames = generator.get_frames(SampleFormat::S16Le, 1, &mono(), &mut pcm);
    assert_eq!(frames, lead + FFT_SIZE);

    let samples = cell_to_magnitudes(SampleFormat::S16Le, 1, &pcm);
    samples[lead..].to_vec()
}

// ============================================================================
// CODEC LAWS
// ============================================================================

/// decode(encode(m)) stays within one quantization step for every format
#[test]
fn test_codec_round_trip_law() {
    let cases = [
        (SampleFormat::U8, 2.0 / 255.0),
        (SampleFormat::S16Le, 1.0 / 32767.0),
        (SampleFormat::S24Le, 1.0 / 8388607.0),
        (SampleFormat::S32Le, 1.0 / 2147483647.0),
    ];
    for (format, step) in cases {
        let mut buf = vec![0u8; format.bytes_per_sample()];
        for i in -100..=100 {
            let m = f64::from(i) / 100.0;
            encode_magnitude(format, m, &mut buf);
            let decoded = decode_sample(format, &buf);
            assert!(
                (decoded - m).abs() <= step,
                "{}: {} round-tripped to {}",
                format,
                m,
                decoded
            );
        }
    }
}

// ============================================================================
// FADE ENVELOPE
// ============================================================================

/// Fade rises from 0 to full scale, holds, and falls symmetrically.
///
/// Uses a tone at a quarter of the sample rate so every fourth sample is a
/// sine peak carrying the bare envelope value.
#[test]
fn test_fade_envelope_shape() {
    let tone_frames = 4800;
    let generator = MultiToneGenerator::new(SAMPLE_RATE, tone_frames as f64 / SAMPLE_RATE as f64);
    generator.reset(&[f64::from(SAMPLE_RATE) / 4.0]);
    let fade = generator.fade_frames();
    assert!(fade < tone_frames / 4, "fade window too wide for this test");

    let mut pcm = vec![0u8; tone_frames * 2];
    assert_eq!(
        generator.get_frames(SampleFormat::S16Le, 1, &mono(), &mut pcm),
        tone_frames
    );
    let samples = cell_to_magnitudes(SampleFormat::S16Le, 1, &pcm);

    // Envelope probes: |sin| = 1 at frames 1, 5, 9, ...
    let envelope: Vec<(usize, f64)> = (0..tone_frames)
        .skip(1)
        .step_by(4)
        .map(|i| (i, samples[i].abs()))
        .collect();

    // Frame 0 is exact silence
    assert_eq!(samples[0], 0.0);

    // Monotonic rise through the fade-in, then full scale
    let mut prev = -1.0;
    for &(i, value) in envelope.iter().take_while(|(i, _)| *i < fade) {
        assert!(value >= prev - 1e-4, "fade-in not monotonic at frame {}", i);
        prev = value;
    }
    for &(i, value) in envelope
        .iter()
        .filter(|(i, _)| *i >= fade && *i < tone_frames - fade)
    {
        assert!(value > 0.999, "steady region below full scale at {}", i);
    }

    // Symmetric fall: fade-out probes follow the mirrored quarter-sine
    use std::f64::consts::PI;
    for &(i, value) in envelope.iter().filter(|(i, _)| *i >= tone_frames - fade) {
        let expected = (PI / 2.0 * (tone_frames - 1 - i) as f64 / fade as f64).sin();
        assert!(
            (value - expected).abs() < 1e-3,
            "fade-out off-curve: frame {} = {}, expected {}",
            i,
            value,
            expected
        );
    }

    // Last frame back at silence (within one quantization step of the ramp)
    assert!(samples[tone_frames - 1].abs() < 1e-2);
}

// ============================================================================
// MATCHED FILTERS
// ============================================================================

/// Every estimated kernel has mean 0 and standard deviation 1
#[test]
fn test_matched_filter_normalization() {
    let mut plan = CarrierPlan::new(SAMPLE_RATE, FFT_SIZE, 1600.0, 10000.0).expect("plan");
    plan.estimate_filters();
    for (i, carrier) in plan.carriers().iter().enumerate() {
        let filter = carrier.matched_filter();
        let len = filter.len() as f64;
        let mean = filter.iter().sum::<f64>() / len;
        let std = (filter.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / len).sqrt();
        assert!(mean.abs() < 1e-9, "carrier {} kernel mean {}", i, mean);
        assert!((std - 1.0).abs() < 1e-9, "carrier {} kernel std {}", i, std);
    }
}

/// A synthesized tone at carrier b scores at least 3x every other carrier
#[test]
fn test_tone_discrimination_across_carriers() {
    let mut plan = CarrierPlan::new(SAMPLE_RATE, FFT_SIZE, 1600.0, 10000.0).expect("plan");
    plan.estimate_filters();

    let target = plan.num_carriers() / 3;
    let frequency = plan.frequency_of(target);
    let frame = steady_tone_frame(frequency);

    let mut analyzer = SpectralAnalyzer::new(FFT_SIZE);
    let mut power = vec![0.0; analyzer.num_bins()];
    analyzer.power_spectrum(&frame, &mut power);

    let on_target = plan.carriers()[target].confidence(&power);
    assert!(
        on_target > 3.0,
        "tone at its own carrier only scored {}",
        on_target
    );
    for (i, carrier) in plan.carriers().iter().enumerate() {
        if i == target {
            continue;
        }
        let other = carrier.confidence(&power);
        assert!(
            on_target >= 3.0 * other,
            "carrier {} scored {} vs target {}",
            i,
            other,
            on_target
        );
    }
}

/// Empirically calibrated kernels, measured through a live loopback
/// pipeline, keep the matched-filter normalization and peak at the center
#[test]
fn test_calibrated_filters_through_loopback() {
    let config = LoopConfig {
        sample_rate: SAMPLE_RATE,
        format: SampleFormat::S16Le,
        channels: 1,
        active_channels: mono(),
        tone_length_sec: 2.0,
        fft_size: 256,
        low_cutoff_hz: 3000.0,
        high_cutoff_hz: 4200.0,
        ..LoopConfig::default()
    };
    let frame_bytes = config.format.frame_bytes(config.channels);
    let mut controller = LoopController::new(config).expect("config");
    let carrier_count = controller.plan().num_carriers();
    assert!(carrier_count >= 2, "band should fit a few carriers");

    let (sink, source) = SoftwareLoopback::with_delay(SAMPLE_RATE, frame_bytes, 0);
    controller
        .calibrate_filters(Box::new(sink), Box::new(source), Duration::from_millis(80))
        .expect("calibration");

    for (i, carrier) in controller.plan().carriers().iter().enumerate() {
        let filter = carrier.matched_filter();
        assert!(!filter.is_empty(), "carrier {} never calibrated", i);

        let len = filter.len() as f64;
        let mean = filter.iter().sum::<f64>() / len;
        assert!(mean.abs() < 1e-9, "carrier {} kernel mean {}", i, mean);

        let center_coeff = filter[carrier.center_bin - carrier.lo_bin()];
        for v in filter {
            assert!(
                center_coeff >= *v,
                "carrier {} kernel does not peak at its center bin",
                i
            );
        }
    }
}
