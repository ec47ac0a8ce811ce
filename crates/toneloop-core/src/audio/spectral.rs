//! Spectral tone detection via matched filters over an FFT power spectrum
//!
//! A capture cell is transformed to a power spectrum; each candidate
//! carrier holds a z-score-normalized kernel of the spectral shape expected
//! around its center bin. Confidence combines how much the center bin
//! dominates its neighborhood with how well the neighborhood matches the
//! kernel shape, which rejects both broadband noise (high dominance, poor
//! shape match) and narrowband noise at the wrong bin (poor dominance).

use std::io::{self, Write};
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::controller::ConfigError;

/// Bins included on each side of a carrier's center in its filter window
pub const FILTER_HALF_WIDTH: usize = 3;

/// Windows whose mean power sits at or below this are treated as empty.
/// Confidence is otherwise scale-invariant, so without a floor the shape
/// match would fire on quantization and FFT rounding noise.
const POWER_FLOOR: f64 = 1e-9;

/// Real-input FFT with a reusable plan and scratch buffers
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    fft_size: usize,
    buf: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Self {
            fft,
            fft_size,
            buf: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
        }
    }

    /// Number of time-domain samples per analysis frame
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of meaningful bins in the power spectrum
    pub fn num_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Compute the per-bin power of one analysis frame.
    ///
    /// Power per bin is `(re^2 + im^2) / N`, the periodogram scaled by the
    /// frame length. `samples` must be exactly `fft_size` long and `power`
    /// at least `num_bins` long.
    pub fn power_spectrum(&mut self, samples: &[f64], power: &mut [f64]) {
        assert_eq!(
            samples.len(),
            self.fft_size,
            "analysis frame does not match the FFT size"
        );
        let bins = self.num_bins();
        assert!(power.len() >= bins, "power buffer too small");

        for (slot, &s) in self.buf.iter_mut().zip(samples) {
            *slot = Complex::new(s, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buf, &mut self.scratch);

        let n = self.fft_size as f64;
        for (p, c) in power[..bins].iter_mut().zip(&self.buf) {
            *p = (c.re * c.re + c.im * c.im) / n;
        }
    }
}

/// One detectable tone frequency with its matched-filter kernel
#[derive(Debug, Clone)]
pub struct Carrier {
    /// FFT bin holding the carrier frequency
    pub center_bin: usize,
    lo_bin: usize,
    hi_bin: usize,
    matched_filter: Vec<f64>,
}

impl Carrier {
    pub fn new(center_bin: usize) -> Self {
        Self {
            center_bin,
            lo_bin: 0,
            hi_bin: 0,
            matched_filter: Vec::new(),
        }
    }

    /// First bin of the filter window
    pub fn lo_bin(&self) -> usize {
        self.lo_bin
    }

    /// Last bin of the filter window (inclusive)
    pub fn hi_bin(&self) -> usize {
        self.hi_bin
    }

    /// Kernel coefficients, one per window bin
    pub fn matched_filter(&self) -> &[f64] {
        &self.matched_filter
    }

    /// Build the matched-filter kernel from a spectral footprint.
    ///
    /// Extracts bins `[lo, hi]` of `power`, subtracts their mean, and
    /// divides by their standard deviation, leaving a unit-variance kernel:
    /// the detector matches spectral shape, not absolute level, so it is
    /// robust to overall gain changes.
    pub fn init_matched_filter(&mut self, lo: usize, hi: usize, power: &[f64]) {
        self.lo_bin = lo;
        self.hi_bin = hi;
        self.matched_filter.clear();
        self.matched_filter.extend_from_slice(&power[lo..=hi]);

        let len = self.matched_filter.len() as f64;
        let mean = self.matched_filter.iter().sum::<f64>() / len;
        let var = self
            .matched_filter
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / len;
        let std = var.sqrt();
        for v in &mut self.matched_filter {
            *v = (*v - mean) / std;
        }
    }

    /// Score how strongly this carrier is present in `power`.
    ///
    /// `power_ratio` (center bin over window mean) measures dominance; the
    /// z-normalized dot product against the kernel measures shape match.
    /// Their product is the confidence. A window at or below the noise
    /// floor scores zero.
    pub fn confidence(&self, power: &[f64]) -> f64 {
        let window = &power[self.lo_bin..=self.hi_bin];
        let len = window.len() as f64;

        let mut dot = 0.0;
        let mut sum = 0.0;
        let mut sq_sum = 0.0;
        for (sample, coeff) in window.iter().zip(&self.matched_filter) {
            dot += sample * coeff;
            sum += sample;
            sq_sum += sample * sample;
        }

        let mean = sum / len;
        let std = (sq_sum / len - mean * mean).max(0.0).sqrt();
        if mean <= POWER_FLOOR || std <= f64::EPSILON {
            return 0.0;
        }

        let power_ratio = power[self.center_bin] / mean;
        power_ratio * dot / (std * len)
    }
}

/// Derived detection parameters: the usable band and its carriers
#[derive(Debug, Clone)]
pub struct CarrierPlan {
    num_frames: usize,
    num_freq: usize,
    freq_resolution: f64,
    bin_start: usize,
    bin_end: usize,
    carriers: Vec<Carrier>,
    target: usize,
}

impl CarrierPlan {
    /// Derive the plan for `fft_size`-frame analysis at `sample_rate`.
    ///
    /// Carriers span `[low_cutoff_hz, high_cutoff_hz]` spaced two bins
    /// apart so adjacent-bin leakage cannot reach a neighboring carrier's
    /// window center.
    pub fn new(
        sample_rate: u32,
        fft_size: usize,
        low_cutoff_hz: f64,
        high_cutoff_hz: f64,
    ) -> Result<Self, ConfigError> {
        let num_freq = fft_size / 2 + 1;
        let freq_resolution = f64::from(sample_rate) / fft_size as f64;
        let bin_start = (low_cutoff_hz / freq_resolution).ceil() as usize;
        let bin_end =
            (((high_cutoff_hz / freq_resolution).ceil() as usize).min(num_freq - 1)).max(bin_start);
        let num_used_bins = bin_end - bin_start;

        let carriers: Vec<Carrier> = (0..num_used_bins / 2)
            .map(|i| Carrier::new(bin_start + 2 * i))
            .collect();
        if carriers.is_empty() {
            return Err(ConfigError::EmptyCarrierBand {
                low_cutoff_hz,
                high_cutoff_hz,
            });
        }

        Ok(Self {
            num_frames: fft_size,
            num_freq,
            freq_resolution,
            bin_start,
            bin_end,
            carriers,
            target: 0,
        })
    }

    /// Build every carrier's kernel analytically: a unit impulse at the
    /// center bin, zero elsewhere, then z-score normalized. The result is a
    /// unit-length expected shape without needing a calibration capture.
    pub fn estimate_filters(&mut self) {
        let mut footprint = vec![0.0; self.num_freq];
        let max_bin = self.num_freq - 1;
        for carrier in &mut self.carriers {
            let lo = carrier.center_bin.saturating_sub(FILTER_HALF_WIDTH);
            let hi = (carrier.center_bin + FILTER_HALF_WIDTH).min(max_bin);
            footprint[carrier.center_bin] = 1.0;
            carrier.init_matched_filter(lo, hi, &footprint);
            footprint[carrier.center_bin] = 0.0;
        }
    }

    /// Build one carrier's kernel from a measured power spectrum, captured
    /// while that carrier played alone.
    pub fn measure_filter(&mut self, index: usize, power: &[f64]) {
        let max_bin = self.num_freq - 1;
        let carrier = &mut self.carriers[index];
        let lo = carrier.center_bin.saturating_sub(FILTER_HALF_WIDTH);
        let hi = (carrier.center_bin + FILTER_HALF_WIDTH).min(max_bin);
        carrier.init_matched_filter(lo, hi, power);
    }

    /// Select the carrier the detector watches for. Returns false if the
    /// index is out of range.
    pub fn set_target(&mut self, index: usize) -> bool {
        if index >= self.carriers.len() {
            return false;
        }
        self.target = index;
        true
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Frequency of the targeted carrier in Hz
    pub fn target_frequency(&self) -> f64 {
        self.frequency_of(self.target)
    }

    /// Confidence that the targeted carrier is present in `power`
    pub fn target_confidence(&self, power: &[f64]) -> f64 {
        self.carriers[self.target].confidence(power)
    }

    pub fn frequency_of(&self, index: usize) -> f64 {
        self.carriers[index].center_bin as f64 * self.freq_resolution
    }

    pub fn carriers(&self) -> &[Carrier] {
        &self.carriers
    }

    pub fn num_carriers(&self) -> usize {
        self.carriers.len()
    }

    /// Time-domain samples per analysis frame
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Hz per FFT bin
    pub fn freq_resolution(&self) -> f64 {
        self.freq_resolution
    }

    pub fn bin_start(&self) -> usize {
        self.bin_start
    }

    pub fn bin_end(&self) -> usize {
        self.bin_end
    }

    /// Dump the carrier table for detector debugging
    pub fn dump(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "CarrierPlan:")?;
        writeln!(out, "  num_frames      = {}", self.num_frames)?;
        writeln!(out, "  num_freq        = {}", self.num_freq)?;
        writeln!(out, "  freq_resolution = {:.3} Hz/bin", self.freq_resolution)?;
        writeln!(out, "  bin_start       = {}", self.bin_start)?;
        writeln!(out, "  bin_end         = {}", self.bin_end)?;
        writeln!(out, "  target          = {}", self.target)?;
        writeln!(out, "  carriers = {{")?;
        for (i, c) in self.carriers.iter().enumerate() {
            write!(
                out,
                "    {}: @{}({:.0} Hz) ({}, {}): {{",
                i,
                c.center_bin,
                c.center_bin as f64 * self.freq_resolution,
                c.lo_bin,
                c.hi_bin
            )?;
            for (j, v) in c.matched_filter.iter().enumerate() {
                write!(out, " {}:{:.3}", c.lo_bin + j, v)?;
            }
            writeln!(out, " }}")?;
        }
        writeln!(out, "  }}")
    }
}

/// Index of the first sample that rises clearly out of the cell's floor.
///
/// The threshold is half the cell's peak magnitude, with an absolute floor
/// so silence never produces an onset. Used to back-shift a detection
/// timestamp to the arrival of the tone within the cell.
pub fn find_onset(samples: &[f64]) -> Option<usize> {
    let peak = samples.iter().fold(0.0f64, |a, &s| a.max(s.abs()));
    let threshold = (peak * 0.5).max(1e-4);
    samples.iter().position(|&s| s.abs() >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn sine_frame(fft_size: usize, bin: usize) -> Vec<f64> {
        (0..fft_size)
            .map(|n| (2.0 * PI * bin as f64 * n as f64 / fft_size as f64).sin())
            .collect()
    }

    #[test]
    fn test_power_spectrum_concentrates_at_tone_bin() {
        let fft_size = 1024;
        let bin = 99;
        let mut analyzer = SpectralAnalyzer::new(fft_size);
        let mut power = vec![0.0; analyzer.num_bins()];
        analyzer.power_spectrum(&sine_frame(fft_size, bin), &mut power);

        // Full-scale sine at an exact bin: |X[k]|^2 / N = N/4
        assert_abs_diff_eq!(power[bin], fft_size as f64 / 4.0, epsilon = 1e-6);
        let rest: f64 = power
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != bin)
            .map(|(_, p)| p)
            .sum();
        assert!(rest < 1e-6, "energy should concentrate in one bin: {}", rest);
    }

    #[test]
    fn test_matched_filter_is_zero_mean_unit_variance() {
        let mut plan = CarrierPlan::new(48000, 1024, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();
        for carrier in plan.carriers() {
            let filter = carrier.matched_filter();
            let len = filter.len() as f64;
            let mean = filter.iter().sum::<f64>() / len;
            let var = filter.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / len;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(var.sqrt(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_plan_band_derivation() {
        let plan = CarrierPlan::new(48000, 1024, 1600.0, 10000.0).expect("plan");
        assert_abs_diff_eq!(plan.freq_resolution(), 46.875);
        assert_eq!(plan.bin_start(), 35);
        assert_eq!(plan.bin_end(), 214);
        // Carriers every 2 bins across the usable band
        assert_eq!(plan.num_carriers(), (214 - 35) / 2);
        let carriers = plan.carriers();
        for pair in carriers.windows(2) {
            assert_eq!(pair[1].center_bin - pair[0].center_bin, 2);
        }
        assert!(carriers.last().expect("nonempty").center_bin < 214);
    }

    #[test]
    fn test_plan_rejects_empty_band() {
        let err = CarrierPlan::new(48000, 1024, 9000.0, 9001.0);
        assert!(err.is_err(), "band narrower than two bins has no carriers");
    }

    #[test]
    fn test_confidence_prefers_the_sounding_carrier() {
        let fft_size = 1024;
        let mut plan = CarrierPlan::new(48000, fft_size, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();

        let target = plan.num_carriers() / 2;
        let center = plan.carriers()[target].center_bin;

        let mut analyzer = SpectralAnalyzer::new(fft_size);
        let mut power = vec![0.0; analyzer.num_bins()];
        analyzer.power_spectrum(&sine_frame(fft_size, center), &mut power);

        let on_target = plan.carriers()[target].confidence(&power);
        assert!(on_target > 3.0, "clean tone confidence {}", on_target);
        for (i, carrier) in plan.carriers().iter().enumerate() {
            if i == target {
                continue;
            }
            let other = carrier.confidence(&power);
            assert!(
                on_target >= 3.0 * other,
                "carrier {} scored {} against target {}",
                i,
                other,
                on_target
            );
        }
    }

    #[test]
    fn test_confidence_is_gain_invariant_in_shape() {
        let fft_size = 1024;
        let mut plan = CarrierPlan::new(48000, fft_size, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();
        let target = 10;
        let center = plan.carriers()[target].center_bin;

        let mut analyzer = SpectralAnalyzer::new(fft_size);
        let mut loud = vec![0.0; analyzer.num_bins()];
        analyzer.power_spectrum(&sine_frame(fft_size, center), &mut loud);
        let quiet: Vec<f64> = loud.iter().map(|p| p * 1e-4).collect();

        let c_loud = plan.carriers()[target].confidence(&loud);
        let c_quiet = plan.carriers()[target].confidence(&quiet);
        assert_abs_diff_eq!(c_loud, c_quiet, epsilon = 1e-6 * c_loud.abs());
    }

    #[test]
    fn test_silence_scores_zero() {
        let mut plan = CarrierPlan::new(48000, 1024, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();
        let power = vec![0.0; 513];
        for carrier in plan.carriers() {
            assert_eq!(carrier.confidence(&power), 0.0);
        }
    }

    #[test]
    fn test_noise_floor_window_scores_zero() {
        let mut plan = CarrierPlan::new(48000, 1024, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();
        // A perfectly matching shape at rounding-noise level must not fire
        let mut power = vec![1e-13; 513];
        let carrier = &plan.carriers()[4];
        power[carrier.center_bin] = 1e-10;
        assert_eq!(carrier.confidence(&power), 0.0);
    }

    #[test]
    fn test_measured_filter_matches_footprint_shape() {
        let fft_size = 1024;
        let mut plan = CarrierPlan::new(48000, fft_size, 1600.0, 10000.0).expect("plan");
        let target = 5;
        let center = plan.carriers()[target].center_bin;

        let mut analyzer = SpectralAnalyzer::new(fft_size);
        let mut power = vec![0.0; analyzer.num_bins()];
        analyzer.power_spectrum(&sine_frame(fft_size, center), &mut power);

        plan.measure_filter(target, &power);
        let carrier = &plan.carriers()[target];
        // The measured kernel peaks at the center bin
        let center_coeff = carrier.matched_filter()[center - carrier.lo_bin()];
        for v in carrier.matched_filter() {
            assert!(center_coeff >= *v);
        }
        // And scores the live spectrum highly
        assert!(carrier.confidence(&power) > 3.0);
    }

    #[test]
    fn test_find_onset() {
        let mut samples = vec![0.0; 100];
        for (i, s) in samples.iter_mut().enumerate().skip(40) {
            *s = 0.8 * ((i - 40) as f64 / 10.0).min(1.0);
        }
        let onset = find_onset(&samples).expect("onset in ramped signal");
        assert!((40..=50).contains(&onset), "onset at {}", onset);

        assert_eq!(find_onset(&vec![0.0; 64]), None, "silence has no onset");
    }

    #[test]
    fn test_dump_lists_every_carrier() {
        let mut plan = CarrierPlan::new(48000, 1024, 1600.0, 10000.0).expect("plan");
        plan.estimate_filters();
        let mut out = Vec::new();
        plan.dump(&mut out).expect("dump");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("freq_resolution"));
        assert_eq!(
            text.matches("@").count(),
            plan.num_carriers(),
            "one table row per carrier"
        );
    }
}
