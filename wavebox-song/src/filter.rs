//! Filter design math: biquad coefficients and frequency response
//!
//! A filter stack is an ordered list of control points, each deriving one
//! standard biquad section. The same math serves three callers: the editor
//! (out of scope here), the legacy-format conversion in the codec, and the
//! synthesizer's per-tick coefficient snapshots.

use serde::{Deserialize, Serialize};

use crate::MAX_FILTER_POINTS;

/// Number of frequency settings (quarter-octave steps up to the reference)
pub const FILTER_FREQ_COUNT: u8 = 34;

/// Frequency of the highest setting, in Hz
pub const FILTER_FREQ_REFERENCE_HZ: f64 = 8000.0;

/// Number of gain settings
pub const FILTER_GAIN_COUNT: u8 = 15;

/// Neutral gain setting (unity)
pub const FILTER_GAIN_CENTER: u8 = 7;

/// Convert a frequency setting (0..=33) to Hz on the quarter-octave scale
pub fn freq_setting_to_hz(setting: f64) -> f64 {
    FILTER_FREQ_REFERENCE_HZ * 2.0f64.powf((setting - (FILTER_FREQ_COUNT - 1) as f64) / 4.0)
}

/// Convert a gain setting (0..=14) to linear gain (half-octave steps)
pub fn gain_setting_to_linear(setting: f64) -> f64 {
    2.0f64.powf((setting - FILTER_GAIN_CENTER as f64) / 2.0)
}

/// Filter section type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    LowPass,
    HighPass,
    Peak,
}

/// Normalized biquad coefficients (a0 divided out)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FilterCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

/// One control point of a filter stack: (type, frequency setting, gain setting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterControlPoint {
    pub kind: FilterType,
    /// Frequency setting, 0..=33
    pub freq: u8,
    /// Gain setting, 0..=14 (7 = unity)
    pub gain: u8,
}

impl FilterControlPoint {
    pub fn new(kind: FilterType, freq: u8, gain: u8) -> Self {
        Self { kind, freq, gain }
    }

    /// Derive biquad coefficients at the given sample rate
    ///
    /// Low/high pass sections are 2nd-order designs where the gain setting
    /// scales the resonance around the Butterworth Q; peak sections are
    /// standard peaking EQ with the gain setting as peak gain. Optional
    /// overrides substitute a modulated frequency/gain for the stored
    /// settings.
    pub fn to_coefficients(
        &self,
        sample_rate: f64,
        freq_override: Option<f64>,
        gain_override: Option<f64>,
    ) -> FilterCoefficients {
        let freq_setting = freq_override.unwrap_or(self.freq as f64);
        let gain_setting = gain_override.unwrap_or(self.gain as f64);
        let hz = freq_setting_to_hz(freq_setting).min(sample_rate * 0.499);
        let linear_gain = gain_setting_to_linear(gain_setting);
        let omega = std::f64::consts::TAU * hz / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();

        match self.kind {
            FilterType::LowPass => {
                let q = std::f64::consts::FRAC_1_SQRT_2 * linear_gain;
                let alpha = sin_omega / (2.0 * q);
                let a0 = 1.0 + alpha;
                FilterCoefficients {
                    b0: (1.0 - cos_omega) / 2.0 / a0,
                    b1: (1.0 - cos_omega) / a0,
                    b2: (1.0 - cos_omega) / 2.0 / a0,
                    a1: -2.0 * cos_omega / a0,
                    a2: (1.0 - alpha) / a0,
                }
            }
            FilterType::HighPass => {
                let q = std::f64::consts::FRAC_1_SQRT_2 * linear_gain;
                let alpha = sin_omega / (2.0 * q);
                let a0 = 1.0 + alpha;
                FilterCoefficients {
                    b0: (1.0 + cos_omega) / 2.0 / a0,
                    b1: -(1.0 + cos_omega) / a0,
                    b2: (1.0 + cos_omega) / 2.0 / a0,
                    a1: -2.0 * cos_omega / a0,
                    a2: (1.0 - alpha) / a0,
                }
            }
            FilterType::Peak => {
                let a = linear_gain.sqrt();
                let q = std::f64::consts::FRAC_1_SQRT_2;
                let alpha = sin_omega / (2.0 * q);
                let a0 = 1.0 + alpha / a;
                FilterCoefficients {
                    b0: (1.0 + alpha * a) / a0,
                    b1: -2.0 * cos_omega / a0,
                    b2: (1.0 - alpha * a) / a0,
                    a1: -2.0 * cos_omega / a0,
                    a2: (1.0 - alpha / a) / a0,
                }
            }
        }
    }
}

/// Evaluate |H(e^jω)| for a coefficient set at `radians` per sample
pub fn frequency_response(coefs: &FilterCoefficients, radians: f64) -> f64 {
    let c1 = radians.cos();
    let s1 = radians.sin();
    let c2 = (2.0 * radians).cos();
    let s2 = (2.0 * radians).sin();
    let num_re = coefs.b0 + coefs.b1 * c1 + coefs.b2 * c2;
    let num_im = coefs.b1 * s1 + coefs.b2 * s2;
    let den_re = 1.0 + coefs.a1 * c1 + coefs.a2 * c2;
    let den_im = coefs.a1 * s1 + coefs.a2 * s2;
    ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
}

/// A filter stack: an ordered list of control points (≤ 8)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSettings {
    pub points: Vec<FilterControlPoint>,
}

impl FilterSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct a filter stack from the quantized legacy
    /// (cutoff, resonance) pair stored by format versions before 5
    ///
    /// The legacy filter was a resonant low-pass with cutoff on a
    /// three-quarter-octave scale. The frequency maps directly; the gain
    /// setting is chosen so the new section's response magnitude at the
    /// cutoff matches the legacy resonance peak.
    pub fn from_legacy(cutoff: u8, resonance: u8) -> Self {
        let cutoff = cutoff.min(10);
        let resonance = resonance.min(10);
        let freq_setting = 3 + cutoff * 3;
        let hz = freq_setting_to_hz(freq_setting as f64);
        // Legacy resonance 0 was a plain Butterworth knee; 10 peaked at ~+9dB.
        let target = 2.0f64.powf(resonance as f64 * 0.2 - 0.5);

        let reference_rate = 48000.0;
        let radians = std::f64::consts::TAU * hz / reference_rate;
        let mut best_gain = FILTER_GAIN_CENTER;
        let mut best_error = f64::INFINITY;
        for gain in FILTER_GAIN_CENTER..FILTER_GAIN_COUNT {
            let point = FilterControlPoint::new(FilterType::LowPass, freq_setting, gain);
            let coefs = point.to_coefficients(reference_rate, None, None);
            let magnitude = frequency_response(&coefs, radians);
            let error = (magnitude - target).abs();
            if error < best_error {
                best_error = error;
                best_gain = gain;
            }
        }

        Self {
            points: vec![FilterControlPoint::new(
                FilterType::LowPass,
                freq_setting,
                best_gain,
            )],
        }
    }

    /// Loudness compensation factor for this stack
    ///
    /// Keeps perceived volume roughly stable as filters move: the magnitude
    /// response is sampled at a few perceptually-weighted frequencies and the
    /// mean is inverted, clamped to a modest range.
    pub fn volume_compensation(&self, sample_rate: f64) -> f64 {
        if self.points.is_empty() {
            return 1.0;
        }
        let probes_hz = [250.0, 1000.0, 4000.0];
        let mut mean_power = 0.0;
        for &hz in &probes_hz {
            let radians = std::f64::consts::TAU * hz / sample_rate;
            let mut magnitude = 1.0;
            for point in &self.points {
                let coefs = point.to_coefficients(sample_rate, None, None);
                magnitude *= frequency_response(&coefs, radians);
            }
            mean_power += magnitude * magnitude;
        }
        mean_power /= probes_hz.len() as f64;
        (1.0 / mean_power.sqrt()).clamp(0.5, 2.0)
    }

    /// Whether `points` is within the allowed size and all settings in range
    pub fn is_valid(&self) -> bool {
        self.points.len() <= MAX_FILTER_POINTS
            && self
                .points
                .iter()
                .all(|p| p.freq < FILTER_FREQ_COUNT && p.gain < FILTER_GAIN_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficients_are_finite_for_all_settings() {
        for kind in [FilterType::LowPass, FilterType::HighPass, FilterType::Peak] {
            for freq in 0..FILTER_FREQ_COUNT {
                for gain in 0..FILTER_GAIN_COUNT {
                    let point = FilterControlPoint::new(kind, freq, gain);
                    let coefs = point.to_coefficients(48000.0, None, None);
                    for v in [coefs.b0, coefs.b1, coefs.b2, coefs.a1, coefs.a2] {
                        assert!(v.is_finite(), "{kind:?} freq={freq} gain={gain}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_lowpass_magnitude_at_cutoff_matches_design_q() {
        // For the 2nd-order design, |H| at the cutoff equals the Q used.
        let sample_rate = 48000.0;
        let point = FilterControlPoint::new(FilterType::LowPass, 24, FILTER_GAIN_CENTER);
        let coefs = point.to_coefficients(sample_rate, None, None);
        let hz = freq_setting_to_hz(24.0);
        let radians = std::f64::consts::TAU * hz / sample_rate;
        let magnitude = frequency_response(&coefs, radians);
        assert!(
            (magnitude - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.02,
            "got {magnitude}"
        );
    }

    #[test]
    fn test_peak_magnitude_at_center_matches_gain() {
        let sample_rate = 48000.0;
        for gain in [3u8, 7, 11, 14] {
            let point = FilterControlPoint::new(FilterType::Peak, 20, gain);
            let coefs = point.to_coefficients(sample_rate, None, None);
            let hz = freq_setting_to_hz(20.0);
            let radians = std::f64::consts::TAU * hz / sample_rate;
            let magnitude = frequency_response(&coefs, radians);
            let expected = gain_setting_to_linear(gain as f64);
            assert!(
                (magnitude / expected - 1.0).abs() < 0.05,
                "gain={gain}: got {magnitude}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_legacy_conversion_tracks_resonance() {
        let mellow = FilterSettings::from_legacy(5, 0);
        let resonant = FilterSettings::from_legacy(5, 10);
        assert_eq!(mellow.points.len(), 1);
        assert_eq!(resonant.points.len(), 1);
        assert_eq!(mellow.points[0].freq, resonant.points[0].freq);
        assert!(resonant.points[0].gain > mellow.points[0].gain);
    }

    #[test]
    fn test_volume_compensation_is_bounded() {
        let mut settings = FilterSettings::new();
        settings
            .points
            .push(FilterControlPoint::new(FilterType::LowPass, 0, 7));
        let compensation = settings.volume_compensation(48000.0);
        assert!((0.5..=2.0).contains(&compensation));
        assert!(compensation > 1.0, "heavy lowpass should compensate upward");
    }
}
