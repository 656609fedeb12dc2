//! Karplus-Strong picked string kernel
//!
//! Each voice is a delay line tuned to the pitch period, excited with a
//! noise burst. A first-order all-pass handles the fractional part of the
//! period so tuning stays exact; a one-pole shelf inside the loop damps high
//! frequencies faster than low ones, which is what makes it sound plucked.
//! Unison uses two independent lines at slightly different periods.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::filtering::sanitize;
use crate::tone::Tone;

use super::run_ramp;

/// One Karplus-Strong delay loop
#[derive(Debug, Clone, Default)]
pub struct PickedString {
    buffer: Vec<f32>,
    pos: usize,
    /// Fractional part of the period, realized by the all-pass
    fraction: f64,
    allpass_prev_in: f64,
    allpass_prev_out: f64,
    shelf_state: f64,
    active: bool,
}

impl PickedString {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Silence the string, keeping the buffer allocation
    pub fn clear(&mut self) {
        for sample in &mut self.buffer {
            *sample = 0.0;
        }
        self.pos = 0;
        self.allpass_prev_in = 0.0;
        self.allpass_prev_out = 0.0;
        self.shelf_state = 0.0;
        self.active = false;
    }

    /// Excite the string at the given period in samples
    ///
    /// The burst is seeded from the period so replaying the same note is
    /// deterministic.
    pub fn pluck(&mut self, period_samples: f64) {
        let period = period_samples.max(2.0);
        let whole = period.floor() as usize;
        self.fraction = period - whole as f64;
        self.buffer.clear();
        self.buffer.resize(whole, 0.0);
        let mut rng = Pcg32::seed_from_u64(period.to_bits());
        for sample in &mut self.buffer {
            *sample = rng.random_range(-1.0f32..1.0);
        }
        self.pos = 0;
        self.allpass_prev_in = 0.0;
        self.allpass_prev_out = 0.0;
        self.shelf_state = 0.0;
        self.active = true;
    }

    /// Advance the loop one sample
    ///
    /// `damping` is the shelf's tracking coefficient (lower = duller decay);
    /// `feedback` is the loop gain, just under 1.
    #[inline]
    pub fn process(&mut self, damping: f64, feedback: f64) -> f64 {
        if self.buffer.is_empty() {
            return 0.0;
        }
        let x = self.buffer[self.pos] as f64;
        let eta = (1.0 - self.fraction) / (1.0 + self.fraction);
        let y = eta * (x - self.allpass_prev_out) + self.allpass_prev_in;
        self.allpass_prev_in = x;
        self.allpass_prev_out = y;
        self.shelf_state += (y - self.shelf_state) * damping;
        self.buffer[self.pos] = (self.shelf_state * feedback) as f32;
        self.pos += 1;
        if self.pos >= self.buffer.len() {
            self.pos = 0;
        }
        y
    }

    /// Flush denormal or non-finite loop state
    pub fn settle(&mut self) {
        self.allpass_prev_in = sanitize(self.allpass_prev_in);
        self.allpass_prev_out = sanitize(self.allpass_prev_out);
        self.shelf_state = sanitize(self.shelf_state);
    }
}

/// Render a picked-string tone; `periods` holds this tick's target period
/// per voice, re-plucking any voice that is not yet ringing
pub fn render_string(
    tone: &mut Tone,
    voice_count: usize,
    periods: [f64; 2],
    second_sign: f64,
    scratch: &mut [f32],
    span: (f64, f64),
) {
    let samples = scratch.len();
    if samples == 0 {
        return;
    }
    let (mut expression, expression_inc) = run_ramp(tone.expression, span, samples);
    let (mut damping, damping_inc) = run_ramp(tone.string_damping, span, samples);
    let (mut feedback, feedback_inc) = run_ramp(tone.string_feedback, span, samples);
    let signs = [1.0, second_sign];

    for voice in 0..voice_count {
        if !tone.strings[voice].is_active() {
            tone.strings[voice].pluck(periods[voice]);
        }
    }

    let Tone {
        strings,
        note_filters,
        note_filter_count,
        ..
    } = tone;
    for out in scratch.iter_mut() {
        let mut sample = 0.0;
        for voice in 0..voice_count {
            sample += strings[voice].process(damping.clamp(0.0, 1.0), feedback) * signs[voice];
        }
        damping += damping_inc;
        feedback += feedback_inc;
        for filter in note_filters[..*note_filter_count].iter_mut() {
            sample = filter.process(sample);
        }
        *out += (sample * expression) as f32;
        expression += expression_inc;
    }
    for filter in note_filters[..*note_filter_count].iter_mut() {
        filter.settle();
    }
    for voice in 0..voice_count {
        strings[voice].settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluck_rings_then_decays() {
        let mut string = PickedString::default();
        string.pluck(48000.0 / 440.0);
        let early: f64 = (0..512).map(|_| string.process(0.6, 0.98).abs()).sum();
        for _ in 0..48000 {
            string.process(0.6, 0.98);
        }
        let late: f64 = (0..512).map(|_| string.process(0.6, 0.98).abs()).sum();
        assert!(early > 1.0, "string never rang: {early}");
        assert!(late < early * 0.1, "string did not decay: {late} vs {early}");
    }

    #[test]
    fn test_higher_feedback_sustains_longer() {
        let tail_energy = |feedback: f64| {
            let mut string = PickedString::default();
            string.pluck(100.0);
            for _ in 0..20000 {
                string.process(0.5, feedback);
            }
            (0..500).map(|_| string.process(0.5, feedback).powi(2)).sum::<f64>()
        };
        assert!(tail_energy(0.999) > tail_energy(0.95) * 10.0);
    }

    #[test]
    fn test_render_plucks_inactive_voices() {
        let mut tone = Tone::default();
        tone.expression = (1.0, 1.0);
        tone.string_damping = (0.6, 0.6);
        tone.string_feedback = (0.98, 0.98);
        let mut scratch = vec![0.0f32; 256];
        render_string(
            &mut tone,
            2,
            [109.0, 110.0],
            1.0,
            &mut scratch,
            (0.0, 1.0),
        );
        assert!(tone.strings[0].is_active());
        assert!(tone.strings[1].is_active());
        assert!(scratch.iter().any(|&s| s != 0.0));
    }
}
