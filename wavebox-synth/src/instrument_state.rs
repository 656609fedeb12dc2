//! Runtime state carried per channel and per instrument
//!
//! The `Song` stays immutable during rendering; everything a modulator can
//! touch lives in an [`InstrumentState`] snapshot instead. Mod channels are
//! evaluated into [`ModCommand`] values each tick and the scheduler applies
//! them here, which keeps cross-instrument mutation on a single path.

use wavebox_song::{
    DRUM_COUNT, FilterCoefficients, Instrument, InstrumentType, MAX_FILTER_POINTS,
    MAX_MOD_NOTE_SIZE, MAX_PAN_SETTING, MAX_TEMPO, MAX_VOLUME_SETTING, MIN_TEMPO, ModSlot,
    ModTarget, Song,
};

use crate::effects::{EffectParams, EffectsState};
use crate::wavetables::{chip_table, harmonics_table, noise_table, saw_table, spectrum_table};

/// A scheduler-applied modulation, produced by evaluating a mod channel's
/// note size at the current tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModCommand {
    SetTempo(f64),
    SetMasterGain(f64),
    SetInstrumentVolume {
        channel: usize,
        instrument: usize,
        value: f64,
    },
    SetPan {
        channel: usize,
        instrument: usize,
        value: f64,
    },
    SetEqFilterFreq {
        channel: usize,
        instrument: usize,
        point: usize,
        value: f64,
    },
    SetEqFilterGain {
        channel: usize,
        instrument: usize,
        point: usize,
        value: f64,
    },
    SetNoteFilterFreq {
        channel: usize,
        instrument: usize,
        point: usize,
        value: f64,
    },
    SetNoteFilterGain {
        channel: usize,
        instrument: usize,
        point: usize,
        value: f64,
    },
    NextBar,
    ResetArpeggio {
        channel: usize,
        instrument: usize,
    },
}

/// Map a mod note's size (0..=63) onto a slot's target, in the target's own
/// setting units
///
/// Sizes interpolate between pins, so `size` is fractional here even though
/// stored sizes are integers.
pub fn mod_command(slot: &ModSlot, size: f64) -> Option<ModCommand> {
    let normalized = (size / MAX_MOD_NOTE_SIZE as f64).clamp(0.0, 1.0);
    let channel = slot.channel as usize;
    let instrument = slot.instrument as usize;
    let point = slot.point as usize;
    match slot.target {
        ModTarget::None => None,
        ModTarget::Tempo => Some(ModCommand::SetTempo(
            MIN_TEMPO as f64 + normalized * (MAX_TEMPO - MIN_TEMPO) as f64,
        )),
        ModTarget::MasterGain => Some(ModCommand::SetMasterGain(normalized * 8.0)),
        ModTarget::InstrumentVolume => Some(ModCommand::SetInstrumentVolume {
            channel,
            instrument,
            value: -(MAX_VOLUME_SETTING as f64) + normalized * (2 * MAX_VOLUME_SETTING) as f64,
        }),
        ModTarget::Pan => Some(ModCommand::SetPan {
            channel,
            instrument,
            value: normalized * MAX_PAN_SETTING as f64,
        }),
        ModTarget::EqFilterFreq => Some(ModCommand::SetEqFilterFreq {
            channel,
            instrument,
            point,
            value: normalized * 33.0,
        }),
        ModTarget::EqFilterGain => Some(ModCommand::SetEqFilterGain {
            channel,
            instrument,
            point,
            value: normalized * 14.0,
        }),
        ModTarget::NoteFilterFreq => Some(ModCommand::SetNoteFilterFreq {
            channel,
            instrument,
            point,
            value: normalized * 33.0,
        }),
        ModTarget::NoteFilterGain => Some(ModCommand::SetNoteFilterGain {
            channel,
            instrument,
            point,
            value: normalized * 14.0,
        }),
        ModTarget::NextBar => Some(ModCommand::NextBar),
        ModTarget::ResetArpeggio => Some(ModCommand::ResetArpeggio {
            channel,
            instrument,
        }),
    }
}

/// Everything mutable the renderer keeps for one instrument
#[derive(Debug, Default)]
pub struct InstrumentState {
    /// Volume setting override from a modulator, in setting units
    pub volume_override: Option<f64>,
    /// Pan setting override, 0..=100
    pub pan_override: Option<f64>,
    /// Per-control-point EQ frequency overrides, in freq setting units
    pub eq_freq_overrides: [Option<f64>; MAX_FILTER_POINTS],
    pub eq_gain_overrides: [Option<f64>; MAX_FILTER_POINTS],
    pub note_freq_overrides: [Option<f64>; MAX_FILTER_POINTS],
    pub note_gain_overrides: [Option<f64>; MAX_FILTER_POINTS],

    /// Pool indices of tones currently voicing notes
    pub active_tones: Vec<usize>,
    /// Pool indices fading out after release
    pub released_tones: Vec<usize>,

    pub effects: EffectsState,
    /// This tick's effect parameter targets, rewritten at every tick boundary
    pub effect_params: EffectParams,
    /// Last tick's EQ coefficient targets, the start point of the next glide
    pub eq_targets: [FilterCoefficients; MAX_FILTER_POINTS],

    /// Integrated (or raw, for noise types) wavetable for this instrument's
    /// kind, built once at song load
    pub wavetable: Vec<f32>,
    /// One table per drum pitch bucket (drumset only)
    pub drum_tables: Vec<Vec<f32>>,
}

impl InstrumentState {
    /// Build the state for one instrument, precomputing its wavetables and
    /// sizing the effect delay lines
    pub fn build(instrument: &Instrument, sample_rate: f64, max_echo_delay: usize) -> Self {
        let mut state = Self::default();
        state.effects.configure(instrument, sample_rate, max_echo_delay);
        match instrument.kind {
            InstrumentType::Chip => {
                state.wavetable = chip_table(instrument.chip_wave);
            }
            InstrumentType::PulseWidth => {
                state.wavetable = saw_table();
            }
            InstrumentType::Harmonics => {
                state.wavetable = harmonics_table(&instrument.harmonics);
            }
            InstrumentType::Noise => {
                state.wavetable = noise_table(instrument.noise_wave);
            }
            InstrumentType::Spectrum => {
                state.wavetable = spectrum_table(&instrument.spectrum, 0);
            }
            InstrumentType::Drumset => {
                state.drum_tables = (0..DRUM_COUNT)
                    .map(|drum| {
                        spectrum_table(&instrument.drumset.spectra[drum], drum as u64 + 1)
                    })
                    .collect();
            }
            InstrumentType::Fm | InstrumentType::PickedString | InstrumentType::Mod => {}
        }
        state
    }

    /// Drop every modulator override, restoring the song's stored settings
    pub fn clear_overrides(&mut self) {
        self.volume_override = None;
        self.pan_override = None;
        self.eq_freq_overrides = [None; MAX_FILTER_POINTS];
        self.eq_gain_overrides = [None; MAX_FILTER_POINTS];
        self.note_freq_overrides = [None; MAX_FILTER_POINTS];
        self.note_gain_overrides = [None; MAX_FILTER_POINTS];
    }
}

/// Runtime state for one channel: one [`InstrumentState`] per instrument
#[derive(Debug, Default)]
pub struct ChannelState {
    pub instruments: Vec<InstrumentState>,
}

/// Build all channel states for a song
pub fn build_channel_states(song: &Song, sample_rate: f64) -> Vec<ChannelState> {
    // Echo delay is in half-beat steps; size lines for the slowest tempo a
    // modulator could set
    let samples_per_half_beat = sample_rate * 60.0 / (MIN_TEMPO as f64 * 2.0);
    song.channels
        .iter()
        .map(|channel| ChannelState {
            instruments: channel
                .instruments
                .iter()
                .map(|instrument| {
                    let max_echo_delay =
                        ((instrument.echo_delay as usize + 1) as f64 * samples_per_half_beat)
                            as usize;
                    InstrumentState::build(instrument, sample_rate, max_echo_delay)
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebox_song::Instrument;

    #[test]
    fn test_mod_command_mapping_endpoints() {
        let slot = ModSlot {
            target: ModTarget::Tempo,
            ..ModSlot::default()
        };
        assert_eq!(
            mod_command(&slot, 0.0),
            Some(ModCommand::SetTempo(MIN_TEMPO as f64))
        );
        assert_eq!(
            mod_command(&slot, MAX_MOD_NOTE_SIZE as f64),
            Some(ModCommand::SetTempo(MAX_TEMPO as f64))
        );
        let none = ModSlot::default();
        assert_eq!(mod_command(&none, 40.0), None);
    }

    #[test]
    fn test_build_selects_table_by_kind() {
        let chip = InstrumentState::build(&Instrument::new(InstrumentType::Chip), 48000.0, 0);
        assert!(!chip.wavetable.is_empty());
        assert!(chip.drum_tables.is_empty());

        let drums = InstrumentState::build(&Instrument::new(InstrumentType::Drumset), 48000.0, 0);
        assert!(drums.wavetable.is_empty());
        assert_eq!(drums.drum_tables.len(), DRUM_COUNT);

        let fm = InstrumentState::build(&Instrument::new(InstrumentType::Fm), 48000.0, 0);
        assert!(fm.wavetable.is_empty());
    }

    #[test]
    fn test_clear_overrides() {
        let mut state = InstrumentState::default();
        state.volume_override = Some(-10.0);
        state.eq_freq_overrides[2] = Some(20.0);
        state.clear_overrides();
        assert_eq!(state.volume_override, None);
        assert_eq!(state.eq_freq_overrides[2], None);
    }

    #[test]
    fn test_build_channel_states_shapes() {
        let song = Song::default();
        let states = build_channel_states(&song, 48000.0);
        assert_eq!(states.len(), song.channels.len());
        for (state, channel) in states.iter().zip(song.channels.iter()) {
            assert_eq!(state.instruments.len(), channel.instruments.len());
        }
    }
}
