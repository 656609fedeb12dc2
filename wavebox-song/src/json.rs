//! JSON song codec
//!
//! A structured, human-editable alternative to the compact binary form.
//! Reading is lenient: every missing field falls back to its default, and
//! unrecognized preset names fall back to the default preset. Only JSON that
//! fails to parse at all, or that violates structural limits, is an error.

use serde::{Deserialize, Serialize};

use crate::filter::{FilterControlPoint, FilterSettings, FilterType};
use crate::instrument::{
    ChordKind, DRUM_COUNT, EffectFlags, EnvelopeBinding, EnvelopeTarget, FmOperator, Instrument,
    InstrumentType, ModSlot, ModTarget, Transition, Vibrato,
};
use crate::notes::{Note, NotePin, Pattern};
use crate::song::{Channel, ChannelKind, Song};
use crate::SongError;

// =============================================================================
// Document structs
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct JsonSong {
    title: String,
    scale: u8,
    key: u8,
    tempo: u32,
    beats_per_bar: u32,
    bar_count: usize,
    pattern_count: usize,
    instrument_count: usize,
    loop_start: usize,
    loop_length: usize,
    master_gain: u32,
    channels: Vec<JsonChannel>,
}

impl Default for JsonSong {
    fn default() -> Self {
        let song = Song::default();
        Self {
            title: String::new(),
            scale: song.scale,
            key: song.key,
            tempo: song.tempo,
            beats_per_bar: song.beats_per_bar,
            bar_count: song.bar_count,
            pattern_count: song.pattern_count,
            instrument_count: song.instrument_count,
            loop_start: song.loop_start,
            loop_length: song.loop_length,
            master_gain: song.master_gain,
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonChannel {
    kind: String,
    octave: u8,
    muted: bool,
    name: String,
    instruments: Vec<JsonInstrument>,
    patterns: Vec<JsonPattern>,
    bars: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct JsonInstrument {
    #[serde(rename = "type")]
    kind: String,
    volume: i32,
    pan: u32,
    effects: Vec<String>,
    transition: String,
    chord: String,
    arpeggio_speed: u8,
    fade_out: u8,
    vibrato: String,
    eq_filter: Vec<JsonFilterPoint>,
    note_filter: Vec<JsonFilterPoint>,
    envelopes: Vec<JsonEnvelope>,
    chip_wave: u8,
    unison: u8,
    pulse_width: u8,
    harmonics: Vec<u8>,
    fm_algorithm: u8,
    fm_feedback_type: u8,
    fm_feedback_amplitude: u8,
    fm_operators: Vec<JsonFmOperator>,
    string_sustain: u8,
    noise_wave: u8,
    spectrum: Vec<u8>,
    drumset: Vec<JsonDrum>,
    mod_slots: Vec<JsonModSlot>,
    distortion: u8,
    bitcrusher_freq: u8,
    bitcrusher_quantization: u8,
    chorus: u8,
    echo_sustain: u8,
    echo_delay: u8,
    reverb: u8,
}

impl Default for JsonInstrument {
    fn default() -> Self {
        JsonInstrument::from(&Instrument::default())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonFilterPoint {
    #[serde(rename = "type")]
    kind: Option<FilterType>,
    freq: u8,
    gain: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonEnvelope {
    target: u8,
    index: u8,
    envelope: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonFmOperator {
    frequency: u8,
    amplitude: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonDrum {
    spectrum: Vec<u8>,
    envelope: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonModSlot {
    target: u8,
    channel: u8,
    instrument: u8,
    point: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonPattern {
    instruments: Vec<u8>,
    notes: Vec<JsonNote>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonNote {
    pitches: Vec<i32>,
    start: i32,
    end: i32,
    continues: bool,
    points: Vec<JsonPin>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JsonPin {
    time: i32,
    interval: i32,
    size: i32,
}

// =============================================================================
// Name tables
// =============================================================================

const EFFECT_NAMES: &[(&str, EffectFlags)] = &[
    ("note filter", EffectFlags::NOTE_FILTER),
    ("panning", EffectFlags::PANNING),
    ("distortion", EffectFlags::DISTORTION),
    ("bitcrusher", EffectFlags::BITCRUSHER),
    ("chorus", EffectFlags::CHORUS),
    ("echo", EffectFlags::ECHO),
    ("reverb", EffectFlags::REVERB),
];

fn kind_from_name(name: &str) -> InstrumentType {
    match name {
        "FM" => InstrumentType::Fm,
        "harmonics" => InstrumentType::Harmonics,
        "pulse width" => InstrumentType::PulseWidth,
        "picked string" => InstrumentType::PickedString,
        "noise" => InstrumentType::Noise,
        "spectrum" => InstrumentType::Spectrum,
        "drumset" => InstrumentType::Drumset,
        "mod" => InstrumentType::Mod,
        _ => InstrumentType::Chip,
    }
}

fn transition_name(transition: Transition) -> &'static str {
    match transition {
        Transition::Normal => "normal",
        Transition::Interrupt => "interrupt",
        Transition::Slide => "slide",
        Transition::Seamless => "seamless",
    }
}

fn transition_from_name(name: &str) -> Transition {
    match name {
        "interrupt" => Transition::Interrupt,
        "slide" => Transition::Slide,
        "seamless" => Transition::Seamless,
        _ => Transition::Normal,
    }
}

fn chord_name(chord: ChordKind) -> &'static str {
    match chord {
        ChordKind::Simultaneous => "simultaneous",
        ChordKind::Strum => "strum",
        ChordKind::Arpeggio => "arpeggio",
    }
}

fn chord_from_name(name: &str) -> ChordKind {
    match name {
        "simultaneous" => ChordKind::Simultaneous,
        "strum" => ChordKind::Strum,
        _ => ChordKind::Arpeggio,
    }
}

fn vibrato_name(vibrato: Vibrato) -> &'static str {
    match vibrato {
        Vibrato::None => "none",
        Vibrato::Light => "light",
        Vibrato::Delayed => "delayed",
        Vibrato::Heavy => "heavy",
        Vibrato::Shaky => "shaky",
    }
}

fn vibrato_from_name(name: &str) -> Vibrato {
    match name {
        "light" => Vibrato::Light,
        "delayed" => Vibrato::Delayed,
        "heavy" => Vibrato::Heavy,
        "shaky" => Vibrato::Shaky,
        _ => Vibrato::None,
    }
}

fn kind_name(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Pitch => "pitch",
        ChannelKind::Noise => "noise",
        ChannelKind::Mod => "mod",
    }
}

// =============================================================================
// Model -> document
// =============================================================================

impl From<&Instrument> for JsonInstrument {
    fn from(instrument: &Instrument) -> Self {
        let effects = EFFECT_NAMES
            .iter()
            .filter(|(_, flag)| instrument.effects.contains(*flag))
            .map(|(name, _)| name.to_string())
            .collect();
        let filter_points = |filter: &FilterSettings| {
            filter
                .points
                .iter()
                .map(|p| JsonFilterPoint {
                    kind: Some(p.kind),
                    freq: p.freq,
                    gain: p.gain,
                })
                .collect()
        };
        Self {
            kind: instrument.kind.name().to_string(),
            volume: instrument.volume,
            pan: instrument.pan,
            effects,
            transition: transition_name(instrument.transition).to_string(),
            chord: chord_name(instrument.chord).to_string(),
            arpeggio_speed: instrument.arpeggio_speed,
            fade_out: instrument.fade_out,
            vibrato: vibrato_name(instrument.vibrato).to_string(),
            eq_filter: filter_points(&instrument.eq_filter),
            note_filter: filter_points(&instrument.note_filter),
            envelopes: instrument
                .envelopes
                .iter()
                .map(|binding| JsonEnvelope {
                    target: binding.target.index(),
                    index: binding.index,
                    envelope: binding.envelope,
                })
                .collect(),
            chip_wave: instrument.chip_wave,
            unison: instrument.unison,
            pulse_width: instrument.pulse_width,
            harmonics: instrument.harmonics.controls.to_vec(),
            fm_algorithm: instrument.fm.algorithm,
            fm_feedback_type: instrument.fm.feedback_type,
            fm_feedback_amplitude: instrument.fm.feedback_amplitude,
            fm_operators: instrument
                .fm
                .operators
                .iter()
                .map(|op| JsonFmOperator {
                    frequency: op.frequency,
                    amplitude: op.amplitude,
                })
                .collect(),
            string_sustain: instrument.string_sustain,
            noise_wave: instrument.noise_wave,
            spectrum: instrument.spectrum.controls.to_vec(),
            drumset: (0..DRUM_COUNT)
                .map(|drum| JsonDrum {
                    spectrum: instrument.drumset.spectra[drum].controls.to_vec(),
                    envelope: instrument.drumset.envelopes[drum],
                })
                .collect(),
            mod_slots: instrument
                .mod_slots
                .iter()
                .map(|slot| JsonModSlot {
                    target: slot.target.index(),
                    channel: slot.channel,
                    instrument: slot.instrument,
                    point: slot.point,
                })
                .collect(),
            distortion: instrument.distortion,
            bitcrusher_freq: instrument.bitcrusher_freq,
            bitcrusher_quantization: instrument.bitcrusher_quantization,
            chorus: instrument.chorus,
            echo_sustain: instrument.echo_sustain,
            echo_delay: instrument.echo_delay,
            reverb: instrument.reverb,
        }
    }
}

/// Serialize a song to pretty-printed JSON
pub fn song_to_json(song: &Song) -> String {
    let doc = JsonSong {
        title: song.title.clone(),
        scale: song.scale,
        key: song.key,
        tempo: song.tempo,
        beats_per_bar: song.beats_per_bar,
        bar_count: song.bar_count,
        pattern_count: song.pattern_count,
        instrument_count: song.instrument_count,
        loop_start: song.loop_start,
        loop_length: song.loop_length,
        master_gain: song.master_gain,
        channels: song
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| JsonChannel {
                kind: kind_name(song.channel_kind(index)).to_string(),
                octave: channel.octave,
                muted: channel.muted,
                name: channel.name.clone(),
                instruments: channel.instruments.iter().map(JsonInstrument::from).collect(),
                patterns: channel
                    .patterns
                    .iter()
                    .map(|pattern| JsonPattern {
                        instruments: pattern.instruments.clone(),
                        notes: pattern
                            .notes
                            .iter()
                            .map(|note| JsonNote {
                                pitches: note.pitches.to_vec(),
                                start: note.start,
                                end: note.end,
                                continues: note.continues_last_pattern,
                                points: note
                                    .pins
                                    .iter()
                                    .map(|pin| JsonPin {
                                        time: pin.time,
                                        interval: pin.interval,
                                        size: pin.size,
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
                bars: channel.bars.clone(),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&doc).unwrap_or_default()
}

// =============================================================================
// Document -> model
// =============================================================================

fn instrument_from_json(doc: &JsonInstrument) -> Instrument {
    let mut instrument = Instrument::new(kind_from_name(&doc.kind));
    instrument.volume = doc.volume.clamp(-crate::MAX_VOLUME_SETTING, crate::MAX_VOLUME_SETTING);
    instrument.pan = doc.pan.min(crate::MAX_PAN_SETTING);
    instrument.effects = EffectFlags::empty();
    for name in &doc.effects {
        if let Some((_, flag)) = EFFECT_NAMES.iter().find(|(n, _)| n == name) {
            instrument.effects.insert(*flag);
        }
    }
    instrument.transition = transition_from_name(&doc.transition);
    instrument.chord = chord_from_name(&doc.chord);
    instrument.arpeggio_speed = doc.arpeggio_speed.min(8);
    instrument.fade_out = doc
        .fade_out
        .min(crate::instrument::FADE_OUT_TICKS.len() as u8 - 1);
    instrument.vibrato = vibrato_from_name(&doc.vibrato);
    let filter = |points: &[JsonFilterPoint]| FilterSettings {
        points: points
            .iter()
            .take(crate::MAX_FILTER_POINTS)
            .map(|p| FilterControlPoint::new(p.kind.unwrap_or(FilterType::LowPass), p.freq, p.gain))
            .collect(),
    };
    instrument.eq_filter = filter(&doc.eq_filter);
    instrument.note_filter = filter(&doc.note_filter);
    instrument.envelopes = doc
        .envelopes
        .iter()
        .filter_map(|e| {
            Some(EnvelopeBinding {
                target: EnvelopeTarget::from_index(e.target)?,
                index: e.index,
                envelope: e.envelope,
            })
        })
        .collect();
    instrument.chip_wave = doc.chip_wave.min(crate::instrument::CHIP_WAVES.len() as u8 - 1);
    instrument.unison = doc.unison.min(crate::instrument::UNISONS.len() as u8 - 1);
    instrument.pulse_width = doc.pulse_width.clamp(1, 50);
    for (control, &value) in instrument
        .harmonics
        .controls
        .iter_mut()
        .zip(doc.harmonics.iter().chain(std::iter::repeat(&0)))
    {
        *control = value.min(crate::instrument::HARMONICS_CONTROL_MAX);
    }
    instrument.fm.algorithm = doc
        .fm_algorithm
        .min(crate::instrument::FM_ALGORITHMS.len() as u8 - 1);
    instrument.fm.feedback_type = doc
        .fm_feedback_type
        .min(crate::instrument::FM_FEEDBACKS.len() as u8 - 1);
    instrument.fm.feedback_amplitude = doc.fm_feedback_amplitude.min(15);
    for (op, doc_op) in instrument.fm.operators.iter_mut().zip(doc.fm_operators.iter()) {
        *op = FmOperator {
            frequency: doc_op
                .frequency
                .min(crate::instrument::FM_FREQUENCY_RATIOS.len() as u8 - 1),
            amplitude: doc_op.amplitude.min(15),
        };
    }
    instrument.string_sustain = doc.string_sustain.min(10);
    instrument.noise_wave = doc.noise_wave.min(crate::instrument::NOISE_WAVES.len() as u8 - 1);
    for (control, &value) in instrument
        .spectrum
        .controls
        .iter_mut()
        .zip(doc.spectrum.iter().chain(std::iter::repeat(&0)))
    {
        *control = value.min(crate::instrument::SPECTRUM_CONTROL_MAX);
    }
    for (drum, doc_drum) in doc.drumset.iter().enumerate().take(DRUM_COUNT) {
        for (control, &value) in instrument.drumset.spectra[drum]
            .controls
            .iter_mut()
            .zip(doc_drum.spectrum.iter().chain(std::iter::repeat(&0)))
        {
            *control = value.min(crate::instrument::SPECTRUM_CONTROL_MAX);
        }
        instrument.drumset.envelopes[drum] = doc_drum
            .envelope
            .min(crate::instrument::ENVELOPES.len() as u8 - 1);
    }
    for (slot, doc_slot) in instrument.mod_slots.iter_mut().zip(doc.mod_slots.iter()) {
        *slot = ModSlot {
            target: ModTarget::from_index(doc_slot.target).unwrap_or_default(),
            channel: doc_slot.channel,
            instrument: doc_slot.instrument,
            point: doc_slot.point,
        };
    }
    instrument.distortion = doc.distortion.min(7);
    instrument.bitcrusher_freq = doc.bitcrusher_freq.min(7);
    instrument.bitcrusher_quantization = doc.bitcrusher_quantization.min(7);
    instrument.chorus = doc.chorus.min(7);
    instrument.echo_sustain = doc.echo_sustain.min(7);
    instrument.echo_delay = doc.echo_delay.min(11);
    instrument.reverb = doc.reverb.min(11);
    instrument
}

fn note_from_json(doc: &JsonNote) -> Result<Note, SongError> {
    let mut note = Note::new(0, doc.start, doc.end, 3);
    note.pitches.clear();
    for &pitch in doc.pitches.iter().take(crate::MAX_CHORD_PITCHES) {
        note.pitches.push(pitch);
    }
    if note.pitches.is_empty() {
        note.pitches.push(0);
    }
    note.continues_last_pattern = doc.continues;
    if !doc.points.is_empty() {
        note.pins = doc
            .points
            .iter()
            .map(|p| NotePin::new(p.interval, p.time, p.size))
            .collect();
    }
    if !note.is_well_formed() {
        return Err(SongError::ValueOutOfRange {
            field: "note points",
            value: doc.start as i64,
        });
    }
    Ok(note)
}

/// Deserialize a song from JSON, defaulting every missing field
pub fn song_from_json(data: &str) -> Result<Song, SongError> {
    let doc: JsonSong = serde_json::from_str(data)?;
    let mut song = Song {
        title: doc.title,
        scale: doc.scale,
        key: doc.key.min(11),
        tempo: doc.tempo.clamp(crate::MIN_TEMPO, crate::MAX_TEMPO),
        beats_per_bar: doc.beats_per_bar,
        bar_count: doc.bar_count,
        pattern_count: doc.pattern_count,
        instrument_count: doc.instrument_count,
        loop_start: doc.loop_start,
        loop_length: doc.loop_length,
        master_gain: doc.master_gain.min(8),
        pitch_channel_count: 0,
        noise_channel_count: 0,
        mod_channel_count: 0,
        channels: Vec::new(),
    };

    if doc.channels.is_empty() {
        let default = Song::default();
        song.pitch_channel_count = default.pitch_channel_count;
        song.noise_channel_count = default.noise_channel_count;
    } else {
        // Channels must be grouped pitch, noise, mod; counts derive from the
        // kind labels
        for channel in &doc.channels {
            match channel.kind.as_str() {
                "noise" => song.noise_channel_count += 1,
                "mod" => song.mod_channel_count += 1,
                _ => song.pitch_channel_count += 1,
            }
        }
        for (index, doc_channel) in doc.channels.iter().enumerate() {
            let kind = song.channel_kind(index);
            let mut channel = Channel::new(kind, song.pattern_count, song.bar_count);
            channel.octave = doc_channel.octave.min(7);
            channel.muted = doc_channel.muted;
            channel.name = doc_channel.name.clone();
            channel.bars = doc_channel.bars.clone();
            channel.instruments = doc_channel
                .instruments
                .iter()
                .map(instrument_from_json)
                .collect();
            if channel.instruments.is_empty() {
                channel.instruments = Channel::new(kind, 1, 1).instruments;
            }
            channel.patterns = doc_channel
                .patterns
                .iter()
                .map(|doc_pattern| {
                    let notes = doc_pattern
                        .notes
                        .iter()
                        .map(note_from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut pattern = Pattern::new();
                    if !doc_pattern.instruments.is_empty() {
                        pattern.instruments = doc_pattern.instruments.clone();
                    }
                    pattern.notes = notes;
                    Ok(pattern)
                })
                .collect::<Result<Vec<_>, SongError>>()?;
            song.channels.push(channel);
        }
    }

    song.rebuild_channels();
    song.validate()?;
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let mut song = Song::default();
        song.title = "json test".to_string();
        song.tempo = 96;
        song.channels[0].name = "lead".to_string();
        song.channels[0].muted = true;
        song.channels[0].bars[0] = 1;
        let mut note = Note::new(40, 0, 48, 4);
        note.pins = vec![
            NotePin::new(0, 0, 4),
            NotePin::new(2, 24, 6),
            NotePin::new(2, 48, 0),
        ];
        song.channels[0].patterns[0].notes.push(note);
        let instrument = &mut song.channels[0].instruments[0];
        instrument.kind = InstrumentType::Fm;
        instrument.fm.algorithm = 2;
        instrument.effects.insert(EffectFlags::CHORUS);

        let text = song_to_json(&song);
        let decoded = song_from_json(&text).expect("json decode failed");
        assert_eq!(decoded, song);
    }

    #[test]
    fn test_missing_fields_default() {
        let song = song_from_json("{}").expect("empty object should decode");
        assert_eq!(song, Song::default());
    }

    #[test]
    fn test_partial_document_defaults_the_rest() {
        let song = song_from_json(r#"{ "tempo": 90, "title": "sketch" }"#).unwrap();
        assert_eq!(song.tempo, 90);
        assert_eq!(song.title, "sketch");
        assert_eq!(song.channels.len(), Song::default().channels.len());
    }

    #[test]
    fn test_unknown_preset_names_fall_back() {
        let song = song_from_json(
            r#"{ "channels": [ { "kind": "pitch", "instruments": [
                { "type": "theremin", "transition": "wobbly" } ] } ] }"#,
        )
        .unwrap();
        let instrument = &song.channels[0].instruments[0];
        assert_eq!(instrument.kind, InstrumentType::Chip);
        assert_eq!(instrument.transition, Transition::Normal);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(matches!(
            song_from_json("not json"),
            Err(SongError::Json(_))
        ));
    }
}
