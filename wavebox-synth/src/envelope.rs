//! Envelope evaluation
//!
//! Envelopes are pure functions of how long a tone has been sounding (in
//! seconds and in beats) and of the note's current size. The scheduler
//! evaluates every bound envelope twice per tick, at the tick's start and
//! end, and kernels interpolate between the two values per sample.

use wavebox_song::{
    ENVELOPES, EnvelopeCurve, EnvelopeTarget, Instrument, MAX_FILTER_POINTS, MAX_NOTE_SIZE,
};

/// Evaluate one envelope preset
///
/// `seconds` and `beats` measure time since the tone started; `note_size` is
/// the note's current size normalized to 0..=1.
pub fn envelope_value(curve: EnvelopeCurve, speed: f64, seconds: f64, beats: f64, note_size: f64) -> f64 {
    match curve {
        EnvelopeCurve::None => 1.0,
        EnvelopeCurve::NoteSize => note_size,
        // Short boost at the attack, fading over roughly 60ms
        EnvelopeCurve::Punch => 1.0 + (1.0 - seconds * 16.0).max(0.0),
        EnvelopeCurve::Flare => {
            let x = seconds * speed;
            if x < 1.0 {
                x
            } else {
                2.0f64.powf(-(x - 1.0) * 0.25)
            }
        }
        EnvelopeCurve::Twang => 1.0 / (1.0 + seconds * speed),
        EnvelopeCurve::Swell => 1.0 - 1.0 / (1.0 + seconds * speed),
        EnvelopeCurve::Tremolo => 0.5 + 0.5 * (std::f64::consts::TAU * beats * speed).cos(),
        EnvelopeCurve::Decay => 2.0f64.powf(-speed * beats),
    }
}

/// Start/end multiplier pair for one tick
pub type TickPair = (f64, f64);

fn unit() -> TickPair {
    (1.0, 1.0)
}

/// Envelope products for every automatable target, for one tone, one tick
///
/// Each field starts at 1 and accumulates the product of all envelopes bound
/// to that target.
#[derive(Debug, Clone)]
pub struct EnvelopeValues {
    pub note_volume: TickPair,
    pub pitch_shift: TickPair,
    pub vibrato_depth: TickPair,
    pub pulse_width: TickPair,
    pub string_sustain: TickPair,
    pub fm_amplitude: [TickPair; 4],
    pub fm_frequency: [TickPair; 4],
    pub feedback_amplitude: TickPair,
    pub note_filter_freq: [TickPair; MAX_FILTER_POINTS],
    pub note_filter_gain: [TickPair; MAX_FILTER_POINTS],
}

impl Default for EnvelopeValues {
    fn default() -> Self {
        Self {
            note_volume: unit(),
            pitch_shift: unit(),
            vibrato_depth: unit(),
            pulse_width: unit(),
            string_sustain: unit(),
            fm_amplitude: [unit(); 4],
            fm_frequency: [unit(); 4],
            feedback_amplitude: unit(),
            note_filter_freq: [unit(); MAX_FILTER_POINTS],
            note_filter_gain: [unit(); MAX_FILTER_POINTS],
        }
    }
}

/// Inputs to a tick's envelope evaluation, at the tick's start and end
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeClock {
    pub seconds: TickPair,
    pub beats: TickPair,
    /// Note size already normalized to 0..=1
    pub note_size: TickPair,
}

impl EnvelopeClock {
    /// Normalize a raw pitch/noise note size to the 0..=1 range
    pub fn normalize_size(size: f64) -> f64 {
        (size / MAX_NOTE_SIZE as f64).clamp(0.0, 1.0)
    }
}

/// Evaluate every envelope bound on `instrument` for one tick
pub fn compute_envelopes(instrument: &Instrument, clock: &EnvelopeClock) -> EnvelopeValues {
    let mut values = EnvelopeValues::default();
    for binding in &instrument.envelopes {
        let preset = match ENVELOPES.get(binding.envelope as usize) {
            Some(preset) => preset,
            None => continue,
        };
        let start = envelope_value(
            preset.curve,
            preset.speed,
            clock.seconds.0,
            clock.beats.0,
            clock.note_size.0,
        );
        let end = envelope_value(
            preset.curve,
            preset.speed,
            clock.seconds.1,
            clock.beats.1,
            clock.note_size.1,
        );
        let slot: &mut TickPair = match binding.target {
            EnvelopeTarget::NoteVolume => &mut values.note_volume,
            EnvelopeTarget::PitchShift => &mut values.pitch_shift,
            EnvelopeTarget::VibratoDepth => &mut values.vibrato_depth,
            EnvelopeTarget::PulseWidth => &mut values.pulse_width,
            EnvelopeTarget::StringSustain => &mut values.string_sustain,
            EnvelopeTarget::FeedbackAmplitude => &mut values.feedback_amplitude,
            EnvelopeTarget::FmOperatorAmplitude => {
                match values.fm_amplitude.get_mut(binding.index as usize) {
                    Some(slot) => slot,
                    None => continue,
                }
            }
            EnvelopeTarget::FmOperatorFrequency => {
                match values.fm_frequency.get_mut(binding.index as usize) {
                    Some(slot) => slot,
                    None => continue,
                }
            }
            EnvelopeTarget::NoteFilterFreq => {
                match values.note_filter_freq.get_mut(binding.index as usize) {
                    Some(slot) => slot,
                    None => continue,
                }
            }
            EnvelopeTarget::NoteFilterGain => {
                match values.note_filter_gain.get_mut(binding.index as usize) {
                    Some(slot) => slot,
                    None => continue,
                }
            }
        };
        slot.0 *= start;
        slot.1 *= end;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebox_song::{EnvelopeBinding, InstrumentType};

    #[test]
    fn test_none_is_always_unity() {
        for seconds in [0.0, 0.5, 10.0] {
            assert_eq!(
                envelope_value(EnvelopeCurve::None, 0.0, seconds, seconds * 2.0, 0.3),
                1.0
            );
        }
    }

    #[test]
    fn test_note_size_passes_through() {
        assert_eq!(
            envelope_value(EnvelopeCurve::NoteSize, 0.0, 1.0, 2.0, 0.75),
            0.75
        );
    }

    #[test]
    fn test_decay_is_monotonically_decreasing() {
        let mut previous = f64::INFINITY;
        for step in 0..50 {
            let beats = step as f64 * 0.1;
            let value = envelope_value(EnvelopeCurve::Decay, 7.0, beats, beats, 1.0);
            assert!(value < previous);
            assert!(value > 0.0);
            previous = value;
        }
    }

    #[test]
    fn test_twang_starts_at_one_and_decays() {
        assert_eq!(envelope_value(EnvelopeCurve::Twang, 8.0, 0.0, 0.0, 1.0), 1.0);
        let late = envelope_value(EnvelopeCurve::Twang, 8.0, 1.0, 2.0, 1.0);
        assert!(late < 0.2);
    }

    #[test]
    fn test_tremolo_is_bounded() {
        for step in 0..100 {
            let beats = step as f64 * 0.03;
            let value = envelope_value(EnvelopeCurve::Tremolo, 4.0, beats, beats, 1.0);
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_bound_envelopes_multiply_into_targets() {
        let mut instrument = Instrument::new(InstrumentType::Chip);
        // twang 2 on volume, twice: the products should square the value
        for _ in 0..2 {
            instrument.envelopes.push(EnvelopeBinding {
                target: wavebox_song::EnvelopeTarget::NoteVolume,
                index: 0,
                envelope: 7,
            });
        }
        let clock = EnvelopeClock {
            seconds: (0.125, 0.25),
            beats: (0.25, 0.5),
            note_size: (1.0, 1.0),
        };
        let values = compute_envelopes(&instrument, &clock);
        let single = envelope_value(EnvelopeCurve::Twang, 8.0, 0.125, 0.25, 1.0);
        assert!((values.note_volume.0 - single * single).abs() < 1e-12);
        assert_eq!(values.pitch_shift, (1.0, 1.0));
    }
}
