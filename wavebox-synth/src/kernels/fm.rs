//! Four-operator FM kernel
//!
//! The algorithm table fixes which operators are carriers and which feed
//! which phases; the feedback table routes previous-sample outputs back into
//! phases. Both are closed const tables, so the per-sample loop is pure
//! arithmetic over fixed topology slices.

use wavebox_song::{FmAlgorithm, FmFeedback};

use crate::filtering::sanitize;
use crate::tone::Tone;

use super::run_ramp;

pub fn render_fm(
    tone: &mut Tone,
    algorithm: &FmAlgorithm,
    feedback: &FmFeedback,
    scratch: &mut [f32],
    span: (f64, f64),
) {
    let samples = scratch.len();
    if samples == 0 {
        return;
    }
    let (mut expression, expression_inc) = run_ramp(tone.expression, span, samples);
    let (mut feedback_amp, feedback_inc) = run_ramp(tone.fm_feedback, span, samples);
    let mut deltas = [0.0f64; 4];
    let mut delta_incs = [0.0f64; 4];
    let mut amps = [0.0f64; 4];
    let mut amp_incs = [0.0f64; 4];
    for op in 0..4 {
        let (delta, delta_inc) = run_ramp(tone.fm_phase_deltas[op], span, samples);
        deltas[op] = delta;
        delta_incs[op] = delta_inc;
        let (amp, amp_inc) = run_ramp(tone.fm_amplitudes[op], span, samples);
        amps[op] = amp;
        amp_incs[op] = amp_inc;
    }
    let carrier_count = algorithm.carrier_count;
    let carrier_scale = 1.0 / (carrier_count as f64).sqrt();

    let Tone {
        fm_phases,
        fm_prev_outputs,
        note_filters,
        note_filter_count,
        ..
    } = tone;
    for out in scratch.iter_mut() {
        let mut outputs = [0.0f64; 4];
        // Modulators always have higher indices than the operators they
        // drive, so a reverse sweep sees them already computed
        for op in (0..4).rev() {
            let mut phase_offset = 0.0;
            for &modulator in algorithm.modulated_by[op] {
                phase_offset += outputs[modulator];
            }
            for &source in feedback.modulated_by[op] {
                phase_offset += fm_prev_outputs[source] * feedback_amp;
            }
            let phase = fm_phases[op] + phase_offset;
            outputs[op] = (std::f64::consts::TAU * phase).sin() * amps[op];
            fm_phases[op] += deltas[op];
            deltas[op] += delta_incs[op];
            amps[op] += amp_incs[op];
        }
        *fm_prev_outputs = outputs;

        let mut sample: f64 = outputs[..carrier_count].iter().sum::<f64>() * carrier_scale;
        for filter in note_filters[..*note_filter_count].iter_mut() {
            sample = filter.process(sample);
        }
        *out += (sample * expression) as f32;
        expression += expression_inc;
        feedback_amp += feedback_inc;
    }
    for filter in note_filters[..*note_filter_count].iter_mut() {
        filter.settle();
    }
    for phase in fm_phases.iter_mut() {
        *phase = phase.rem_euclid(1.0);
    }
    for output in fm_prev_outputs.iter_mut() {
        *output = sanitize(*output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebox_song::{FM_ALGORITHMS, FM_FEEDBACKS};

    fn fm_tone(carrier_amp: f64) -> Tone {
        let mut tone = Tone::default();
        tone.expression = (0.5, 0.5);
        let delta = 220.0 / 48000.0;
        for op in 0..4 {
            tone.fm_phase_deltas[op] = (delta * (op + 1) as f64, delta * (op + 1) as f64);
        }
        tone.fm_amplitudes[0] = (carrier_amp, carrier_amp);
        tone
    }

    #[test]
    fn test_single_carrier_is_a_sine() {
        let mut tone = fm_tone(1.0);
        let mut scratch = vec![0.0f32; 512];
        render_fm(
            &mut tone,
            &FM_ALGORITHMS[3],
            &FM_FEEDBACKS[0],
            &mut scratch,
            (0.0, 1.0),
        );
        // No modulator amplitude, no feedback amplitude: pure sine at the
        // carrier frequency
        for (i, &sample) in scratch.iter().enumerate() {
            let expected = 0.5 * (std::f64::consts::TAU * 220.0 / 48000.0 * i as f64).sin();
            assert!((sample as f64 - expected).abs() < 1e-4, "sample {i}");
        }
    }

    #[test]
    fn test_modulation_changes_the_waveform() {
        let mut plain = fm_tone(1.0);
        let mut modulated = fm_tone(1.0);
        modulated.fm_amplitudes[1] = (0.8, 0.8);
        let mut scratch_plain = vec![0.0f32; 256];
        let mut scratch_mod = vec![0.0f32; 256];
        // Algorithm 3 chains 1←2←3←4
        render_fm(
            &mut plain,
            &FM_ALGORITHMS[3],
            &FM_FEEDBACKS[0],
            &mut scratch_plain,
            (0.0, 1.0),
        );
        render_fm(
            &mut modulated,
            &FM_ALGORITHMS[3],
            &FM_FEEDBACKS[0],
            &mut scratch_mod,
            (0.0, 1.0),
        );
        assert_ne!(scratch_plain, scratch_mod);
    }

    #[test]
    fn test_all_topologies_stay_finite() {
        for algorithm in FM_ALGORITHMS {
            for feedback in FM_FEEDBACKS {
                let mut tone = fm_tone(1.0);
                for op in 0..4 {
                    tone.fm_amplitudes[op] = (0.9, 0.9);
                }
                tone.fm_feedback = (0.7, 0.7);
                let mut scratch = vec![0.0f32; 128];
                render_fm(&mut tone, algorithm, feedback, &mut scratch, (0.0, 1.0));
                assert!(scratch.iter().all(|s| s.is_finite()));
            }
        }
    }
}
