//! Per-sample biquad filtering with coefficient interpolation
//!
//! Filter settings only change at tick boundaries, but jumping coefficients
//! once per tick produces zipper noise. Each filter instead receives a start
//! and end coefficient set per tick and slides between them every sample,
//! additively for small moves and multiplicatively when a coefficient spans
//! orders of magnitude (frequency sweeps).

use wavebox_song::FilterCoefficients;

/// Values at or below this magnitude are treated as silence and reset to
/// exact zero, keeping denormals out of the feedback paths
pub const SILENCE_EPSILON: f64 = 1e-24;

/// Flush a feedback value: non-finite or sub-threshold becomes exact 0.0
#[inline]
pub fn sanitize(value: f64) -> f64 {
    if !value.is_finite() || value.abs() < SILENCE_EPSILON {
        0.0
    } else {
        value
    }
}

/// A biquad section whose coefficients glide per sample
///
/// Direct Form II transposed; state is two delay registers. `process` is
/// meant for tight loops, so it does no sanitizing of its own. Callers run
/// [`DynamicBiquadFilter::settle`] once per rendered run.
#[derive(Debug, Clone, Default)]
pub struct DynamicBiquadFilter {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    db0: f64,
    db1: f64,
    db2: f64,
    da1: f64,
    da2: f64,
    /// Multiplicative deltas glide exponentially instead of linearly
    multiplicative: bool,
    s1: f64,
    s2: f64,
}

impl DynamicBiquadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump directly to a coefficient set, holding it constant
    pub fn reset_to(&mut self, coefs: &FilterCoefficients) {
        self.b0 = coefs.b0;
        self.b1 = coefs.b1;
        self.b2 = coefs.b2;
        self.a1 = coefs.a1;
        self.a2 = coefs.a2;
        self.db0 = 0.0;
        self.db1 = 0.0;
        self.db2 = 0.0;
        self.da1 = 0.0;
        self.da2 = 0.0;
        self.multiplicative = false;
    }

    /// Begin gliding from `start` to `end` over `samples` samples
    ///
    /// Uses a multiplicative glide when every coefficient keeps its sign and
    /// stays away from zero, which tracks frequency sweeps far better than a
    /// linear ramp; otherwise falls back to additive.
    pub fn set_transition(
        &mut self,
        start: &FilterCoefficients,
        end: &FilterCoefficients,
        samples: usize,
    ) {
        let samples = samples.max(1) as f64;
        self.b0 = start.b0;
        self.b1 = start.b1;
        self.b2 = start.b2;
        self.a1 = start.a1;
        self.a2 = start.a2;

        let pairs = [
            (start.b0, end.b0),
            (start.b1, end.b1),
            (start.b2, end.b2),
            (start.a1, end.a1),
            (start.a2, end.a2),
        ];
        let multiplicative_safe = pairs.iter().all(|&(s, e)| {
            s != 0.0 && e != 0.0 && (s > 0.0) == (e > 0.0) && (e / s) > 1e-6 && (e / s) < 1e6
        });

        if multiplicative_safe {
            self.multiplicative = true;
            self.db0 = (end.b0 / start.b0).powf(1.0 / samples);
            self.db1 = (end.b1 / start.b1).powf(1.0 / samples);
            self.db2 = (end.b2 / start.b2).powf(1.0 / samples);
            self.da1 = (end.a1 / start.a1).powf(1.0 / samples);
            self.da2 = (end.a2 / start.a2).powf(1.0 / samples);
        } else {
            self.multiplicative = false;
            self.db0 = (end.b0 - start.b0) / samples;
            self.db1 = (end.b1 - start.b1) / samples;
            self.db2 = (end.b2 - start.b2) / samples;
            self.da1 = (end.a1 - start.a1) / samples;
            self.da2 = (end.a2 - start.a2) / samples;
        }
    }

    /// Filter one sample and advance the coefficient glide
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.s1;
        self.s1 = self.b1 * input - self.a1 * output + self.s2;
        self.s2 = self.b2 * input - self.a2 * output;
        if self.multiplicative {
            self.b0 *= self.db0;
            self.b1 *= self.db1;
            self.b2 *= self.db2;
            self.a1 *= self.da1;
            self.a2 *= self.da2;
        } else {
            self.b0 += self.db0;
            self.b1 += self.db1;
            self.b2 += self.db2;
            self.a1 += self.da1;
            self.a2 += self.da2;
        }
        output
    }

    /// Flush denormal or non-finite state after a rendered run
    pub fn settle(&mut self) {
        self.s1 = sanitize(self.s1);
        self.s2 = sanitize(self.s2);
    }

    /// Clear the delay registers without touching coefficients
    pub fn clear_state(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebox_song::{FilterControlPoint, FilterType};

    fn lowpass_coefs(freq: u8) -> FilterCoefficients {
        FilterControlPoint::new(FilterType::LowPass, freq, 7).to_coefficients(48000.0, None, None)
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let mut filter = DynamicBiquadFilter::new();
        filter.reset_to(&lowpass_coefs(20));
        let mut output = 0.0;
        for _ in 0..2000 {
            output = filter.process(1.0);
        }
        assert!((output - 1.0).abs() < 1e-3, "dc gain was {output}");
    }

    #[test]
    fn test_transition_reaches_end_coefficients() {
        let start = lowpass_coefs(10);
        let end = lowpass_coefs(30);
        let mut filter = DynamicBiquadFilter::new();
        filter.set_transition(&start, &end, 128);
        for _ in 0..128 {
            filter.process(0.0);
        }
        assert!((filter.b0 / end.b0 - 1.0).abs() < 0.05);
        assert!((filter.a2 / end.a2 - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_settle_flushes_denormals() {
        let mut filter = DynamicBiquadFilter::new();
        filter.reset_to(&lowpass_coefs(20));
        filter.s1 = 1e-30;
        filter.s2 = f64::NAN;
        filter.settle();
        assert_eq!(filter.s1, 0.0);
        assert_eq!(filter.s2, 0.0);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(f64::INFINITY), 0.0);
        assert_eq!(sanitize(-1e-30), 0.0);
        assert_eq!(sanitize(0.25), 0.25);
        assert_eq!(sanitize(-0.25), -0.25);
    }
}
