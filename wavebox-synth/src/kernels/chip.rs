//! Wavetable kernels: chip, harmonics, and pulse width
//!
//! All three sample an integrated table; see the wavetables module for why
//! the integral form band-limits the output. Pulse width is the difference
//! of two sawtooth reads half a duty cycle apart.

use crate::tone::Tone;
use crate::wavetables::sample_integrated;

use super::run_ramp;

/// Smallest phase step the integral read will divide by
const MIN_DELTA: f64 = 1e-9;

/// Render a chip or harmonics tone from an integrated wavetable
///
/// `voice_count` is 1 or 2 (unison); the second voice is scaled by
/// `second_sign` so "bowed" style unisons can subtract.
pub fn render_wavetable(
    tone: &mut Tone,
    table: &[f32],
    voice_count: usize,
    second_sign: f64,
    scratch: &mut [f32],
    span: (f64, f64),
) {
    let samples = scratch.len();
    if samples == 0 {
        return;
    }
    let (mut expression, expression_inc) = run_ramp(tone.expression, span, samples);
    let mut deltas = [0.0f64; 2];
    let mut delta_incs = [0.0f64; 2];
    for voice in 0..voice_count {
        let (delta, inc) = run_ramp(tone.phase_deltas[voice], span, samples);
        deltas[voice] = delta;
        delta_incs[voice] = inc;
    }
    let signs = [1.0, second_sign];

    let Tone {
        phases,
        note_filters,
        note_filter_count,
        ..
    } = tone;
    for out in scratch.iter_mut() {
        let mut sample = 0.0;
        for voice in 0..voice_count {
            let delta = deltas[voice].max(MIN_DELTA);
            sample += sample_integrated(table, phases[voice], delta) * signs[voice];
            phases[voice] += deltas[voice];
            deltas[voice] += delta_incs[voice];
        }
        for filter in note_filters[..*note_filter_count].iter_mut() {
            sample = filter.process(sample);
        }
        *out += (sample * expression) as f32;
        expression += expression_inc;
    }
    for filter in note_filters[..*note_filter_count].iter_mut() {
        filter.settle();
    }
    let length = (table.len() - 1) as f64;
    for phase in phases.iter_mut() {
        *phase = phase.rem_euclid(length);
    }
}

/// Render a pulse-width tone as the difference of two sawtooth reads
pub fn render_pulse(tone: &mut Tone, saw_table: &[f32], scratch: &mut [f32], span: (f64, f64)) {
    let samples = scratch.len();
    if samples == 0 {
        return;
    }
    let (mut expression, expression_inc) = run_ramp(tone.expression, span, samples);
    let (mut delta, delta_inc) = run_ramp(tone.phase_deltas[0], span, samples);
    let (mut width, width_inc) = run_ramp(tone.pulse_width, span, samples);
    let length = (saw_table.len() - 1) as f64;

    let Tone {
        phases,
        note_filters,
        note_filter_count,
        ..
    } = tone;
    for out in scratch.iter_mut() {
        let step = delta.max(MIN_DELTA);
        let mut sample = sample_integrated(saw_table, phases[0], step)
            - sample_integrated(saw_table, phases[0] + width * length, step);
        phases[0] += delta;
        delta += delta_inc;
        width += width_inc;
        for filter in note_filters[..*note_filter_count].iter_mut() {
            sample = filter.process(sample);
        }
        *out += (sample * expression) as f32;
        expression += expression_inc;
    }
    for filter in note_filters[..*note_filter_count].iter_mut() {
        filter.settle();
    }
    phases[0] = phases[0].rem_euclid(length);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavetables::{chip_table, saw_table};

    fn test_tone(cycles_per_sample: f64, table_len: usize) -> Tone {
        let mut tone = Tone::default();
        let delta = cycles_per_sample * table_len as f64;
        tone.expression = (1.0, 1.0);
        tone.phase_deltas[0] = (delta, delta);
        tone
    }

    #[test]
    fn test_chip_render_is_nonsilent_and_bounded() {
        let table = chip_table(2);
        let mut tone = test_tone(440.0 / 48000.0, table.len() - 1);
        let mut scratch = vec![0.0f32; 512];
        render_wavetable(&mut tone, &table, 1, 1.0, &mut scratch, (0.0, 1.0));
        let peak = scratch.iter().fold(0.0f32, |p, &s| p.max(s.abs()));
        assert!(peak > 0.1, "silent output");
        assert!(peak <= 1.5, "clipping output: {peak}");
    }

    #[test]
    fn test_chip_phase_continues_across_runs() {
        let table = chip_table(1);
        let mut tone = test_tone(100.0 / 48000.0, table.len() - 1);
        let mut split = vec![0.0f32; 256];
        render_wavetable(&mut tone, &table, 1, 1.0, &mut split[..128], (0.0, 0.5));
        let mid_phase = tone.phases[0];
        assert!(mid_phase > 0.0);
        render_wavetable(&mut tone, &table, 1, 1.0, &mut split[128..], (0.5, 1.0));

        let mut whole_tone = test_tone(100.0 / 48000.0, table.len() - 1);
        let mut whole = vec![0.0f32; 256];
        render_wavetable(&mut whole_tone, &table, 1, 1.0, &mut whole, (0.0, 1.0));
        for (a, b) in split.iter().zip(whole.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pulse_width_output_changes_with_duty() {
        let table = saw_table();
        let mut scratch_narrow = vec![0.0f32; 256];
        let mut scratch_square = vec![0.0f32; 256];
        let mut tone = test_tone(220.0 / 48000.0, table.len() - 1);
        tone.pulse_width = (0.1, 0.1);
        render_pulse(&mut tone, &table, &mut scratch_narrow, (0.0, 1.0));
        let mut tone = test_tone(220.0 / 48000.0, table.len() - 1);
        tone.pulse_width = (0.5, 0.5);
        render_pulse(&mut tone, &table, &mut scratch_square, (0.0, 1.0));
        assert_ne!(scratch_narrow, scratch_square);
    }
}
