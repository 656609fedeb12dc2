//! Noise, spectrum, and drumset kernel
//!
//! All three index a precomputed table at a pitch-dependent rate and pass
//! the raw value through a one-pole smoothing filter whose coefficient
//! tracks the fundamental, so low notes are duller than high notes. The
//! drumset only differs in which table the scheduler hands over (one per
//! drum pitch).

use crate::filtering::sanitize;
use crate::tone::Tone;

use super::run_ramp;

/// Render from a raw (non-integrated) table; `table.len()` must be a power
/// of two
pub fn render_noise(tone: &mut Tone, table: &[f32], scratch: &mut [f32], span: (f64, f64)) {
    let samples = scratch.len();
    if samples == 0 {
        return;
    }
    debug_assert!(table.len().is_power_of_two());
    let mask = table.len() - 1;
    let (mut expression, expression_inc) = run_ramp(tone.expression, span, samples);
    let (mut delta, delta_inc) = run_ramp(tone.phase_deltas[0], span, samples);
    let (mut smoothing, smoothing_inc) = run_ramp(tone.noise_smoothing, span, samples);

    let Tone {
        phases,
        noise_values,
        note_filters,
        note_filter_count,
        ..
    } = tone;
    for out in scratch.iter_mut() {
        let raw = table[(phases[0] as usize) & mask] as f64;
        noise_values[0] += (raw - noise_values[0]) * smoothing.clamp(0.0, 1.0);
        phases[0] += delta;
        delta += delta_inc;
        smoothing += smoothing_inc;

        let mut sample = noise_values[0];
        for filter in note_filters[..*note_filter_count].iter_mut() {
            sample = filter.process(sample);
        }
        *out += (sample * expression) as f32;
        expression += expression_inc;
    }
    for filter in note_filters[..*note_filter_count].iter_mut() {
        filter.settle();
    }
    phases[0] = phases[0].rem_euclid(table.len() as f64);
    noise_values[0] = sanitize(noise_values[0]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavetables::noise_table;

    fn noise_tone(delta: f64, smoothing: f64) -> Tone {
        let mut tone = Tone::default();
        tone.expression = (1.0, 1.0);
        tone.phase_deltas[0] = (delta, delta);
        tone.noise_smoothing = (smoothing, smoothing);
        tone
    }

    #[test]
    fn test_noise_render_is_nonsilent_and_bounded() {
        let table = noise_table(1);
        let mut tone = noise_tone(1.0, 1.0);
        let mut scratch = vec![0.0f32; 1024];
        render_noise(&mut tone, &table, &mut scratch, (0.0, 1.0));
        let peak = scratch.iter().fold(0.0f32, |p, &s| p.max(s.abs()));
        assert!(peak > 0.05);
        assert!(peak <= 1.0);
    }

    #[test]
    fn test_heavy_smoothing_dulls_the_output() {
        let table = noise_table(1);
        let energy = |smoothing: f64| {
            let mut tone = noise_tone(1.0, smoothing);
            let mut scratch = vec![0.0f32; 4096];
            render_noise(&mut tone, &table, &mut scratch, (0.0, 1.0));
            // Mean squared step between adjacent samples tracks brightness
            scratch
                .windows(2)
                .map(|w| ((w[1] - w[0]) as f64).powi(2))
                .sum::<f64>()
        };
        assert!(energy(0.05) < energy(1.0) * 0.5);
    }

    #[test]
    fn test_phase_stays_bounded() {
        let table = noise_table(0);
        let mut tone = noise_tone(3.7, 0.8);
        let mut scratch = vec![0.0f32; 64];
        for _ in 0..100 {
            render_noise(&mut tone, &table, &mut scratch, (0.0, 1.0));
        }
        assert!(tone.phases[0] >= 0.0);
        assert!(tone.phases[0] < table.len() as f64);
    }
}
