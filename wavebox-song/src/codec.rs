//! Versioned binary song codec
//!
//! The compact text form is `<variant><version>{tag,payload}*` over the
//! URL-safe base64 alphabet. Most payloads are whole 6-bit characters; the
//! bar map and the note patterns embed nested bit-stream regions built with
//! [`BitWriter`]. The encoder always emits [`CURRENT_VERSION`]; the decoder
//! accepts every version back to [`OLDEST_VERSION`], routing historical
//! layout differences through the `legacy` strategy functions.
//!
//! Decoding is asymmetric about failure: a version outside the supported
//! range means "nothing to load" (`Ok(None)`), while an unknown tag inside a
//! supported version means the data is corrupt (`Err`). Callers treat any
//! `Err` as "fall back to a default song"; no partially-decoded song ever
//! escapes.

use crate::bits::{BitReader, BitWriter, base64_char, base64_value};
use crate::filter::{FilterControlPoint, FilterSettings, FilterType};
use crate::instrument::{
    CHIP_WAVES, ChordKind, DRUM_COUNT, EffectFlags, ENVELOPES, EnvelopeBinding, EnvelopeTarget,
    FADE_OUT_TICKS, FM_ALGORITHMS, FM_FEEDBACKS, FM_FREQUENCY_RATIOS, HARMONICS_CONTROL_MAX,
    InstrumentType, ModTarget, NOISE_WAVES, SPECTRUM_CONTROL_MAX, Transition, UNISONS, Vibrato,
};
use crate::notes::{Note, NotePin};
use crate::song::{ChannelKind, Song};
use crate::{
    CURRENT_VERSION, FORMAT_VARIANT, MAX_CHORD_PITCHES, MAX_FILTER_POINTS,
    MAX_INSTRUMENTS_PER_PATTERN, MAX_MOD_NOTE_SIZE, MAX_NOTE_SIZE, MAX_PAN_SETTING, MAX_PITCH,
    MAX_TEMPO, MAX_VOLUME_SETTING, MIN_TEMPO, MOD_SLOT_COUNT, NOISE_PITCH_COUNT, OLDEST_VERSION,
    SongError,
};

// =============================================================================
// Tags
// =============================================================================

/// Single-character tags of the binary format
///
/// Per-instrument tags carry one payload per instrument, iterated in channel
/// order then instrument order; kind-gated tags only visit instruments of the
/// matching type, so both sides walk the same sequence.
mod tag {
    pub const CHANNEL_COUNTS: u8 = b'n';
    pub const SCALE: u8 = b's';
    pub const KEY: u8 = b'k';
    pub const LOOP: u8 = b'l';
    pub const TEMPO: u8 = b't';
    pub const BEATS_PER_BAR: u8 = b'a';
    pub const BAR_COUNT: u8 = b'g';
    pub const PATTERN_COUNT: u8 = b'j';
    pub const INSTRUMENT_COUNT: u8 = b'i';
    pub const MASTER_GAIN: u8 = b'L';
    pub const TITLE: u8 = b'N';
    pub const CHANNEL_OCTAVES: u8 = b'o';
    pub const INSTRUMENT_TYPE: u8 = b'T';
    pub const VOLUME: u8 = b'v';
    pub const PAN: u8 = b'p';
    pub const EFFECTS: u8 = b'q';
    pub const EQ_FILTER: u8 = b'f';
    pub const NOTE_FILTER: u8 = b'F';
    pub const LEGACY_FILTER: u8 = b'K';
    pub const LEGACY_SONG_REVERB: u8 = b'C';
    pub const TRANSITION: u8 = b'd';
    pub const CHORD: u8 = b'c';
    pub const ARPEGGIO_SPEED: u8 = b'y';
    pub const CHIP_WAVE: u8 = b'W';
    pub const UNISON: u8 = b'h';
    pub const HARMONICS: u8 = b'H';
    pub const PULSE_WIDTH: u8 = b'P';
    pub const FM_ALGORITHM: u8 = b'A';
    pub const FM_FEEDBACK_TYPE: u8 = b'Y';
    pub const FM_FEEDBACK_AMPLITUDE: u8 = b'Z';
    pub const FM_OPERATOR_FREQUENCIES: u8 = b'Q';
    pub const FM_OPERATOR_AMPLITUDES: u8 = b'R';
    pub const STRING_SUSTAIN: u8 = b'S';
    pub const NOISE_WAVE: u8 = b'X';
    pub const SPECTRUM: u8 = b'M';
    pub const DRUMSET: u8 = b'D';
    pub const ENVELOPES: u8 = b'E';
    pub const VIBRATO: u8 = b'V';
    pub const FADE_OUT: u8 = b'O';
    pub const DISTORTION: u8 = b'x';
    pub const BITCRUSHER: u8 = b'z';
    pub const CHORUS: u8 = b'u';
    pub const ECHO: u8 = b'e';
    pub const REVERB: u8 = b'r';
    pub const MOD_SLOTS: u8 = b'm';
    pub const BAR_MAP: u8 = b'G';
    pub const PATTERNS: u8 = b'J';
}

// =============================================================================
// Legacy strategies
// =============================================================================

/// Conversions for payload layouts older versions stored differently
///
/// Each function is keyed by the version range it serves; the decoder calls
/// them instead of the modern path when the header version falls in range.
mod legacy {
    use super::*;

    /// v < 4: volume was a 0..=5 attenuation setting, 0 = loudest
    pub fn volume(setting: u32) -> i32 {
        -(setting.min(5) as i32 * 5)
    }

    /// v < 7: pan was stored 0..=8; rescale to the 0..=100 range
    pub fn pan(setting: u32) -> u32 {
        (setting.min(8) * MAX_PAN_SETTING).div_ceil(8).min(MAX_PAN_SETTING)
    }

    /// v < 6: reverb was one song-global scalar; spread it onto every
    /// audible instrument as a per-instrument reverb effect
    pub fn spread_song_reverb(song: &mut Song, amount: u32) {
        let amount = amount.min(11) as u8;
        for index in 0..song.channel_count() {
            if song.channel_kind(index) == ChannelKind::Mod {
                continue;
            }
            for instrument in &mut song.channels[index].instruments {
                instrument.reverb = amount;
                if amount > 0 {
                    instrument.effects.insert(EffectFlags::REVERB);
                }
            }
        }
    }

    /// v < 5: filters were a quantized (cutoff, resonance) pair
    pub fn filter(cutoff: u32, resonance: u32) -> FilterSettings {
        FilterSettings::from_legacy(cutoff.min(255) as u8, resonance.min(255) as u8)
    }
}

// =============================================================================
// Note shapes and de-duplication rings
// =============================================================================

/// A note's pin pattern and chord size, independent of absolute pitch
///
/// Shapes repeat constantly in real songs, so the pattern stream keeps a
/// ring of recent ones and encodes repeats as short indices.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NoteShape {
    pitch_count: usize,
    initial_size: i32,
    pins: Vec<ShapePin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShapePin {
    /// Parts since the previous pin
    time_delta: i32,
    size: i32,
    /// Pitch bend in semitones relative to the note's base pitches
    interval: i32,
}

impl NoteShape {
    fn of(note: &Note) -> Self {
        let mut pins = Vec::with_capacity(note.pins.len() - 1);
        let mut prev_time = 0;
        for pin in &note.pins[1..] {
            pins.push(ShapePin {
                time_delta: pin.time - prev_time,
                size: pin.size,
                interval: pin.interval,
            });
            prev_time = pin.time;
        }
        Self {
            pitch_count: note.pitches.len(),
            initial_size: note.pins[0].size,
            pins,
        }
    }
}

/// Number of note shapes the de-duplication ring remembers
const SHAPE_RING_SIZE: usize = 10;

/// Number of pitches the de-duplication ring remembers
const PITCH_RING_SIZE: usize = 16;

/// FIFO ring of recently seen values
///
/// A lookup hit does not reorder the ring; only misses append, evicting the
/// oldest entry once full. The decoder replays the same operations and so
/// reconstructs identical ring states without any side information.
struct RecentRing<T: PartialEq> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: PartialEq> RecentRing<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn find(&self, value: &T) -> Option<usize> {
        self.items.iter().position(|item| item == value)
    }

    fn push(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.remove(0);
        }
        self.items.push(value);
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }
}

// =============================================================================
// Character-level reader/writer
// =============================================================================

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn tag(&mut self, tag: u8) {
        self.out.push(tag);
    }

    /// One character holding a 6-bit value
    fn put6(&mut self, value: u32) {
        debug_assert!(value < 64);
        self.out.push(base64_char(value as u8));
    }

    /// Two characters holding a 12-bit value
    fn put12(&mut self, value: u32) {
        debug_assert!(value < 4096);
        self.put6(value >> 6);
        self.put6(value & 0x3F);
    }

    fn put_digits(&mut self, digits: &[u8]) {
        self.out.extend(digits.iter().map(|&d| base64_char(d)));
    }

    fn finish(self) -> String {
        // The alphabet is pure ASCII
        String::from_utf8(self.out).unwrap_or_default()
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn next_byte(&mut self) -> Result<u8, SongError> {
        let byte = *self.data.get(self.pos).ok_or(SongError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read6(&mut self) -> Result<u32, SongError> {
        Ok(base64_value(self.next_byte()?)? as u32)
    }

    fn read12(&mut self) -> Result<u32, SongError> {
        let high = self.read6()?;
        let low = self.read6()?;
        Ok((high << 6) | low)
    }

    /// Take the next `count` characters as raw 6-bit digits
    fn read_digits(&mut self, count: usize) -> Result<Vec<u8>, SongError> {
        let end = self.pos.checked_add(count).ok_or(SongError::UnexpectedEnd)?;
        if end > self.data.len() {
            return Err(SongError::UnexpectedEnd);
        }
        let digits = self.data[self.pos..end]
            .iter()
            .map(|&c| base64_value(c))
            .collect::<Result<Vec<u8>, _>>()?;
        self.pos = end;
        Ok(digits)
    }
}

fn range_check(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), SongError> {
    if value < min || value > max {
        return Err(SongError::ValueOutOfRange { field, value });
    }
    Ok(())
}

/// Bits needed to represent values 0..=max
fn bits_for_max(max: u32) -> u32 {
    32 - max.leading_zeros()
}

fn size_bits(kind: ChannelKind) -> u32 {
    match kind {
        ChannelKind::Mod => 6,
        _ => 3,
    }
}

fn pitch_bits(kind: ChannelKind) -> u32 {
    match kind {
        ChannelKind::Pitch => 7,
        ChannelKind::Noise => 4,
        ChannelKind::Mod => 3,
    }
}

fn max_pitch(kind: ChannelKind) -> i32 {
    match kind {
        ChannelKind::Pitch => MAX_PITCH,
        ChannelKind::Noise => NOISE_PITCH_COUNT - 1,
        ChannelKind::Mod => MOD_SLOT_COUNT as i32 - 1,
    }
}

fn max_size(kind: ChannelKind) -> i32 {
    match kind {
        ChannelKind::Mod => MAX_MOD_NOTE_SIZE,
        _ => MAX_NOTE_SIZE,
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a song into its compact text form at the current version
pub fn encode_song(song: &Song) -> String {
    let mut enc = Encoder::new();
    enc.out.push(FORMAT_VARIANT);
    enc.out.push(b'0' + CURRENT_VERSION);

    enc.tag(tag::CHANNEL_COUNTS);
    enc.put6(song.pitch_channel_count as u32);
    enc.put6(song.noise_channel_count as u32);
    enc.put6(song.mod_channel_count as u32);

    enc.tag(tag::SCALE);
    enc.put6(song.scale as u32);
    enc.tag(tag::KEY);
    enc.put6(song.key as u32);

    enc.tag(tag::LOOP);
    enc.put12(song.loop_start as u32);
    enc.put12(song.loop_length as u32 - 1);

    enc.tag(tag::TEMPO);
    enc.put12(song.tempo);
    enc.tag(tag::BEATS_PER_BAR);
    enc.put6(song.beats_per_bar);
    enc.tag(tag::BAR_COUNT);
    enc.put12(song.bar_count as u32 - 1);
    enc.tag(tag::PATTERN_COUNT);
    enc.put6(song.pattern_count as u32 - 1);
    enc.tag(tag::INSTRUMENT_COUNT);
    enc.put6(song.instrument_count as u32 - 1);
    enc.tag(tag::MASTER_GAIN);
    enc.put6(song.master_gain);

    if !song.title.is_empty() {
        enc.tag(tag::TITLE);
        let bytes = song.title.as_bytes();
        let mut len = bytes.len().min(63);
        while !song.title.is_char_boundary(len) {
            len -= 1;
        }
        enc.put6(len as u32);
        for &byte in &bytes[..len] {
            enc.put6((byte >> 6) as u32);
            enc.put6((byte & 0x3F) as u32);
        }
    }

    enc.tag(tag::CHANNEL_OCTAVES);
    for channel in &song.channels {
        enc.put6(channel.octave as u32);
    }

    enc.tag(tag::INSTRUMENT_TYPE);
    for channel in &song.channels {
        for instrument in &channel.instruments {
            enc.put6(instrument.kind.index() as u32);
        }
    }

    // Per-instrument settings for audible (non-mod) instruments
    fn audible(song: &Song) -> Vec<&crate::instrument::Instrument> {
        song.channels
            .iter()
            .enumerate()
            .filter(|(i, _)| song.channel_kind(*i) != ChannelKind::Mod)
            .flat_map(|(_, c)| c.instruments.iter())
            .collect()
    }

    enc.tag(tag::VOLUME);
    for instrument in audible(song) {
        enc.put6((instrument.volume + MAX_VOLUME_SETTING) as u32);
    }

    enc.tag(tag::PAN);
    for instrument in audible(song) {
        enc.put12(instrument.pan);
    }

    enc.tag(tag::EFFECTS);
    for instrument in audible(song) {
        enc.put12(instrument.effects.bits() as u32);
    }

    for (filter_tag, pick) in [
        (tag::EQ_FILTER, true),
        (tag::NOTE_FILTER, false),
    ] {
        enc.tag(filter_tag);
        for instrument in audible(song) {
            let filter = if pick {
                &instrument.eq_filter
            } else {
                &instrument.note_filter
            };
            enc.put6(filter.points.len() as u32);
            for point in &filter.points {
                let kind = match point.kind {
                    FilterType::LowPass => 0,
                    FilterType::HighPass => 1,
                    FilterType::Peak => 2,
                };
                enc.put6(kind);
                enc.put6(point.freq as u32);
                enc.put6(point.gain as u32);
            }
        }
    }

    enc.tag(tag::TRANSITION);
    for instrument in audible(song) {
        enc.put6(instrument.transition.index() as u32);
    }
    enc.tag(tag::CHORD);
    for instrument in audible(song) {
        enc.put6(instrument.chord.index() as u32);
    }
    enc.tag(tag::ARPEGGIO_SPEED);
    for instrument in audible(song) {
        enc.put6(instrument.arpeggio_speed as u32);
    }
    enc.tag(tag::VIBRATO);
    for instrument in audible(song) {
        enc.put6(instrument.vibrato.index() as u32);
    }
    enc.tag(tag::FADE_OUT);
    for instrument in audible(song) {
        enc.put6(instrument.fade_out as u32);
    }

    // Kind-gated parameter blocks
    enc.tag(tag::CHIP_WAVE);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Chip {
            enc.put6(instrument.chip_wave as u32);
        }
    }
    enc.tag(tag::UNISON);
    for instrument in audible(song) {
        if matches!(
            instrument.kind,
            InstrumentType::Chip | InstrumentType::Harmonics | InstrumentType::PickedString
        ) {
            enc.put6(instrument.unison as u32);
        }
    }
    enc.tag(tag::HARMONICS);
    for instrument in audible(song) {
        if matches!(
            instrument.kind,
            InstrumentType::Harmonics | InstrumentType::PickedString
        ) {
            for &control in &instrument.harmonics.controls {
                enc.put6(control as u32);
            }
        }
    }
    enc.tag(tag::PULSE_WIDTH);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::PulseWidth {
            enc.put6(instrument.pulse_width as u32);
        }
    }
    enc.tag(tag::FM_ALGORITHM);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Fm {
            enc.put6(instrument.fm.algorithm as u32);
        }
    }
    enc.tag(tag::FM_FEEDBACK_TYPE);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Fm {
            enc.put6(instrument.fm.feedback_type as u32);
        }
    }
    enc.tag(tag::FM_FEEDBACK_AMPLITUDE);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Fm {
            enc.put6(instrument.fm.feedback_amplitude as u32);
        }
    }
    enc.tag(tag::FM_OPERATOR_FREQUENCIES);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Fm {
            for op in &instrument.fm.operators {
                enc.put6(op.frequency as u32);
            }
        }
    }
    enc.tag(tag::FM_OPERATOR_AMPLITUDES);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Fm {
            for op in &instrument.fm.operators {
                enc.put6(op.amplitude as u32);
            }
        }
    }
    enc.tag(tag::STRING_SUSTAIN);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::PickedString {
            enc.put6(instrument.string_sustain as u32);
        }
    }
    enc.tag(tag::NOISE_WAVE);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Noise {
            enc.put6(instrument.noise_wave as u32);
        }
    }
    enc.tag(tag::SPECTRUM);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Spectrum {
            for &control in &instrument.spectrum.controls {
                enc.put6(control as u32);
            }
        }
    }
    enc.tag(tag::DRUMSET);
    for instrument in audible(song) {
        if instrument.kind == InstrumentType::Drumset {
            for drum in 0..DRUM_COUNT {
                for &control in &instrument.drumset.spectra[drum].controls {
                    enc.put6(control as u32);
                }
                enc.put6(instrument.drumset.envelopes[drum] as u32);
            }
        }
    }

    enc.tag(tag::ENVELOPES);
    for instrument in audible(song) {
        enc.put6(instrument.envelopes.len() as u32);
        for binding in &instrument.envelopes {
            enc.put6(binding.target.index() as u32);
            enc.put6(binding.index as u32);
            enc.put6(binding.envelope as u32);
        }
    }

    enc.tag(tag::DISTORTION);
    for instrument in audible(song) {
        enc.put6(instrument.distortion as u32);
    }
    enc.tag(tag::BITCRUSHER);
    for instrument in audible(song) {
        enc.put6(instrument.bitcrusher_freq as u32);
        enc.put6(instrument.bitcrusher_quantization as u32);
    }
    enc.tag(tag::CHORUS);
    for instrument in audible(song) {
        enc.put6(instrument.chorus as u32);
    }
    enc.tag(tag::ECHO);
    for instrument in audible(song) {
        enc.put6(instrument.echo_sustain as u32);
        enc.put6(instrument.echo_delay as u32);
    }
    enc.tag(tag::REVERB);
    for instrument in audible(song) {
        enc.put6(instrument.reverb as u32);
    }

    if song.mod_channel_count > 0 {
        enc.tag(tag::MOD_SLOTS);
        for index in 0..song.channel_count() {
            if song.channel_kind(index) != ChannelKind::Mod {
                continue;
            }
            for instrument in &song.channels[index].instruments {
                for slot in &instrument.mod_slots {
                    enc.put6(slot.target.index() as u32);
                    enc.put6(slot.channel as u32);
                    enc.put6(slot.instrument as u32);
                    enc.put6(slot.point as u32);
                }
            }
        }
    }

    // Bar-to-pattern map: a headerless bit region, its size fully determined
    // by the counts written above
    enc.tag(tag::BAR_MAP);
    let map_bits = bits_for_max(song.pattern_count as u32);
    let mut writer = BitWriter::new();
    for channel in &song.channels {
        for &bar in &channel.bars {
            writer.write(map_bits, bar);
        }
    }
    enc.put_digits(&writer.finish());

    // Patterns block: nested bit region with an explicit character count
    enc.tag(tag::PATTERNS);
    let digits = encode_patterns(song);
    enc.put6((digits.len() >> 12) as u32 & 0x3F);
    enc.put6((digits.len() >> 6) as u32 & 0x3F);
    enc.put6(digits.len() as u32 & 0x3F);
    enc.put_digits(&digits);

    enc.finish()
}

fn write_shape(writer: &mut BitWriter, shape: &NoteShape, size_bits: u32) {
    writer.write(2, shape.pitch_count as u32 - 1);
    writer.write_long_tail(1, 2, shape.pins.len() as u32);
    writer.write(size_bits, shape.initial_size as u32);
    for pin in &shape.pins {
        writer.write_long_tail(1, 4, pin.time_delta as u32);
        writer.write(size_bits, pin.size as u32);
        if pin.interval < 0 {
            writer.write(1, 1);
            writer.write_long_tail(0, 2, (-pin.interval) as u32);
        } else {
            writer.write(1, 0);
            writer.write_long_tail(0, 2, pin.interval as u32);
        }
    }
}

fn encode_patterns(song: &Song) -> Vec<u8> {
    let mut writer = BitWriter::new();
    let parts_per_bar = song.parts_per_bar();
    let instrument_bits = bits_for_max(song.instrument_count as u32 - 1);

    for (index, channel) in song.channels.iter().enumerate() {
        let kind = song.channel_kind(index);
        let size_bits = size_bits(kind);
        let pitch_bits = pitch_bits(kind);
        let mut shapes = RecentRing::new(SHAPE_RING_SIZE);
        let mut pitches = RecentRing::new(PITCH_RING_SIZE);

        for pattern in &channel.patterns {
            writer.write(2, pattern.instruments.len() as u32 - 1);
            for &instrument in &pattern.instruments {
                writer.write(instrument_bits, instrument as u32);
            }

            let mut current = 0;
            for note in &pattern.notes {
                if note.start > current {
                    writer.write(1, 0);
                    writer.write_long_tail(1, 4, (note.start - current) as u32);
                }
                writer.write(1, 1);
                writer.write(1, note.continues_last_pattern as u32);

                let shape = NoteShape::of(note);
                match shapes.find(&shape) {
                    Some(hit) => {
                        writer.write(1, 1);
                        writer.write(4, hit as u32);
                    }
                    None => {
                        writer.write(1, 0);
                        write_shape(&mut writer, &shape, size_bits);
                        shapes.push(shape);
                    }
                }

                for &pitch in &note.pitches {
                    match pitches.find(&pitch) {
                        Some(hit) => {
                            writer.write(1, 1);
                            writer.write(4, hit as u32);
                        }
                        None => {
                            writer.write(1, 0);
                            writer.write(pitch_bits, pitch as u32);
                            pitches.push(pitch);
                        }
                    }
                }
                current = note.end;
            }
            if current < parts_per_bar {
                writer.write(1, 0);
                writer.write_long_tail(1, 4, (parts_per_bar - current) as u32);
            }
        }
    }
    writer.finish()
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a song from its compact text form
///
/// Returns `Ok(None)` when the data carries an unsupported variant or
/// version; structural damage inside a supported version is an `Err`.
pub fn decode_song(data: &str) -> Result<Option<Song>, SongError> {
    let bytes = data.as_bytes();
    if bytes.len() < 2 || bytes[0] != FORMAT_VARIANT {
        return Ok(None);
    }
    let version = bytes[1].wrapping_sub(b'0');
    if !(OLDEST_VERSION..=CURRENT_VERSION).contains(&version) {
        return Ok(None);
    }

    let mut dec = Decoder::new(&bytes[2..]);
    let mut song = Song::default();

    while !dec.done() {
        let tag_byte = dec.next_byte()?;
        decode_tag(&mut dec, &mut song, version, tag_byte)?;
    }
    song.validate()?;
    Ok(Some(song))
}

/// Apply `f` to every audible (non-mod) instrument, in encoding order
fn for_each_audible<F>(song: &mut Song, mut f: F) -> Result<(), SongError>
where
    F: FnMut(&mut crate::instrument::Instrument) -> Result<(), SongError>,
{
    for index in 0..song.channel_count() {
        if song.channel_kind(index) == ChannelKind::Mod {
            continue;
        }
        for instrument in &mut song.channels[index].instruments {
            f(instrument)?;
        }
    }
    Ok(())
}

/// Like [`for_each_audible`] but only visiting instruments passing `gate`
fn for_each_audible_of<F>(
    song: &mut Song,
    gate: fn(InstrumentType) -> bool,
    mut f: F,
) -> Result<(), SongError>
where
    F: FnMut(&mut crate::instrument::Instrument) -> Result<(), SongError>,
{
    for_each_audible(song, |instrument| {
        if gate(instrument.kind) {
            f(instrument)?;
        }
        Ok(())
    })
}

fn decode_filter(dec: &mut Decoder) -> Result<FilterSettings, SongError> {
    let count = dec.read6()? as usize;
    range_check("filter point count", count as i64, 0, MAX_FILTER_POINTS as i64)?;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = match dec.read6()? {
            0 => FilterType::LowPass,
            1 => FilterType::HighPass,
            2 => FilterType::Peak,
            other => {
                return Err(SongError::ValueOutOfRange {
                    field: "filter type",
                    value: other as i64,
                });
            }
        };
        let freq = dec.read6()? as u8;
        let gain = dec.read6()? as u8;
        points.push(FilterControlPoint::new(kind, freq, gain));
    }
    let settings = FilterSettings { points };
    if !settings.is_valid() {
        return Err(SongError::ValueOutOfRange {
            field: "filter point",
            value: -1,
        });
    }
    Ok(settings)
}

fn decode_tag(
    dec: &mut Decoder,
    song: &mut Song,
    version: u8,
    tag_byte: u8,
) -> Result<(), SongError> {
    match tag_byte {
        tag::CHANNEL_COUNTS => {
            song.pitch_channel_count = dec.read6()? as usize;
            song.noise_channel_count = dec.read6()? as usize;
            song.mod_channel_count = dec.read6()? as usize;
            song.rebuild_channels();
        }
        tag::SCALE => song.scale = dec.read6()? as u8,
        tag::KEY => {
            let key = dec.read6()?;
            range_check("key", key as i64, 0, 11)?;
            song.key = key as u8;
        }
        tag::LOOP => {
            song.loop_start = dec.read12()? as usize;
            song.loop_length = dec.read12()? as usize + 1;
        }
        tag::TEMPO => {
            song.tempo = dec.read12()?.clamp(MIN_TEMPO, MAX_TEMPO);
        }
        tag::BEATS_PER_BAR => {
            song.beats_per_bar = dec.read6()?;
        }
        tag::BAR_COUNT => {
            song.bar_count = dec.read12()? as usize + 1;
            song.rebuild_channels();
        }
        tag::PATTERN_COUNT => {
            song.pattern_count = dec.read6()? as usize + 1;
            song.rebuild_channels();
        }
        tag::INSTRUMENT_COUNT => {
            song.instrument_count = dec.read6()? as usize + 1;
            song.rebuild_channels();
        }
        tag::MASTER_GAIN => {
            let gain = dec.read6()?;
            range_check("master gain", gain as i64, 0, 8)?;
            song.master_gain = gain;
        }
        tag::TITLE => {
            let len = dec.read6()? as usize;
            let mut bytes = Vec::with_capacity(len);
            for _ in 0..len {
                let high = dec.read6()?;
                range_check("title byte", high as i64, 0, 3)?;
                let low = dec.read6()?;
                bytes.push(((high as u8) << 6) | low as u8);
            }
            song.title = String::from_utf8_lossy(&bytes).into_owned();
        }
        tag::CHANNEL_OCTAVES => {
            for index in 0..song.channel_count() {
                let octave = dec.read6()?;
                range_check("channel octave", octave as i64, 0, 7)?;
                song.channels[index].octave = octave as u8;
            }
        }
        tag::INSTRUMENT_TYPE => {
            for index in 0..song.channel_count() {
                let channel_kind = song.channel_kind(index);
                for instrument in &mut song.channels[index].instruments {
                    let raw = dec.read6()?;
                    let kind = InstrumentType::from_index(raw as u8).ok_or(
                        SongError::ValueOutOfRange {
                            field: "instrument type",
                            value: raw as i64,
                        },
                    )?;
                    let fits = match channel_kind {
                        ChannelKind::Pitch => {
                            !kind.is_noise_type() && kind != InstrumentType::Mod
                        }
                        ChannelKind::Noise => kind.is_noise_type(),
                        ChannelKind::Mod => kind == InstrumentType::Mod,
                    };
                    if !fits {
                        return Err(SongError::ValueOutOfRange {
                            field: "instrument type",
                            value: raw as i64,
                        });
                    }
                    instrument.kind = kind;
                }
            }
        }
        tag::VOLUME => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                instrument.volume = if version < 4 {
                    legacy::volume(raw)
                } else {
                    range_check("volume", raw as i64, 0, 2 * MAX_VOLUME_SETTING as i64)?;
                    raw as i32 - MAX_VOLUME_SETTING
                };
                Ok(())
            })?;
        }
        tag::PAN => {
            for_each_audible(song, |instrument| {
                instrument.pan = if version < 7 {
                    legacy::pan(dec.read6()?)
                } else {
                    let pan = dec.read12()?;
                    range_check("pan", pan as i64, 0, MAX_PAN_SETTING as i64)?;
                    pan
                };
                Ok(())
            })?;
        }
        tag::EFFECTS => {
            for_each_audible(song, |instrument| {
                instrument.effects = EffectFlags::from_bits(dec.read12()? as u16);
                Ok(())
            })?;
        }
        tag::EQ_FILTER => {
            for_each_audible(song, |instrument| {
                instrument.eq_filter = decode_filter(dec)?;
                Ok(())
            })?;
        }
        tag::NOTE_FILTER => {
            for_each_audible(song, |instrument| {
                instrument.note_filter = decode_filter(dec)?;
                Ok(())
            })?;
        }
        tag::LEGACY_FILTER => {
            // Only written by versions before 5
            for_each_audible(song, |instrument| {
                let cutoff = dec.read6()?;
                let resonance = dec.read6()?;
                instrument.eq_filter = legacy::filter(cutoff, resonance);
                Ok(())
            })?;
        }
        tag::LEGACY_SONG_REVERB => {
            // Only written by versions before 6
            let amount = dec.read6()?;
            legacy::spread_song_reverb(song, amount);
        }
        tag::TRANSITION => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                instrument.transition = Transition::from_index(raw as u8).ok_or(
                    SongError::ValueOutOfRange {
                        field: "transition",
                        value: raw as i64,
                    },
                )?;
                Ok(())
            })?;
        }
        tag::CHORD => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                instrument.chord = ChordKind::from_index(raw as u8).ok_or(
                    SongError::ValueOutOfRange {
                        field: "chord kind",
                        value: raw as i64,
                    },
                )?;
                Ok(())
            })?;
        }
        tag::ARPEGGIO_SPEED => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                range_check("arpeggio speed", raw as i64, 0, 8)?;
                instrument.arpeggio_speed = raw as u8;
                Ok(())
            })?;
        }
        tag::VIBRATO => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                instrument.vibrato = Vibrato::from_index(raw as u8).ok_or(
                    SongError::ValueOutOfRange {
                        field: "vibrato",
                        value: raw as i64,
                    },
                )?;
                Ok(())
            })?;
        }
        tag::FADE_OUT => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                range_check("fade out", raw as i64, 0, FADE_OUT_TICKS.len() as i64 - 1)?;
                instrument.fade_out = raw as u8;
                Ok(())
            })?;
        }
        tag::CHIP_WAVE => {
            for_each_audible_of(song, |k| k == InstrumentType::Chip, |instrument| {
                let raw = dec.read6()?;
                range_check("chip wave", raw as i64, 0, CHIP_WAVES.len() as i64 - 1)?;
                instrument.chip_wave = raw as u8;
                Ok(())
            })?;
        }
        tag::UNISON => {
            for_each_audible_of(
                song,
                |k| {
                    matches!(
                        k,
                        InstrumentType::Chip
                            | InstrumentType::Harmonics
                            | InstrumentType::PickedString
                    )
                },
                |instrument| {
                    let raw = dec.read6()?;
                    range_check("unison", raw as i64, 0, UNISONS.len() as i64 - 1)?;
                    instrument.unison = raw as u8;
                    Ok(())
                },
            )?;
        }
        tag::HARMONICS => {
            for_each_audible_of(
                song,
                |k| matches!(k, InstrumentType::Harmonics | InstrumentType::PickedString),
                |instrument| {
                    for control in &mut instrument.harmonics.controls {
                        let raw = dec.read6()?;
                        range_check("harmonics control", raw as i64, 0, HARMONICS_CONTROL_MAX as i64)?;
                        *control = raw as u8;
                    }
                    Ok(())
                },
            )?;
        }
        tag::PULSE_WIDTH => {
            for_each_audible_of(song, |k| k == InstrumentType::PulseWidth, |instrument| {
                let raw = dec.read6()?;
                range_check("pulse width", raw as i64, 1, 50)?;
                instrument.pulse_width = raw as u8;
                Ok(())
            })?;
        }
        tag::FM_ALGORITHM => {
            for_each_audible_of(song, |k| k == InstrumentType::Fm, |instrument| {
                let raw = dec.read6()?;
                range_check("FM algorithm", raw as i64, 0, FM_ALGORITHMS.len() as i64 - 1)?;
                instrument.fm.algorithm = raw as u8;
                Ok(())
            })?;
        }
        tag::FM_FEEDBACK_TYPE => {
            for_each_audible_of(song, |k| k == InstrumentType::Fm, |instrument| {
                let raw = dec.read6()?;
                range_check("FM feedback", raw as i64, 0, FM_FEEDBACKS.len() as i64 - 1)?;
                instrument.fm.feedback_type = raw as u8;
                Ok(())
            })?;
        }
        tag::FM_FEEDBACK_AMPLITUDE => {
            for_each_audible_of(song, |k| k == InstrumentType::Fm, |instrument| {
                let raw = dec.read6()?;
                range_check("FM feedback amplitude", raw as i64, 0, 15)?;
                instrument.fm.feedback_amplitude = raw as u8;
                Ok(())
            })?;
        }
        tag::FM_OPERATOR_FREQUENCIES => {
            for_each_audible_of(song, |k| k == InstrumentType::Fm, |instrument| {
                for op in &mut instrument.fm.operators {
                    let raw = dec.read6()?;
                    range_check(
                        "FM operator frequency",
                        raw as i64,
                        0,
                        FM_FREQUENCY_RATIOS.len() as i64 - 1,
                    )?;
                    op.frequency = raw as u8;
                }
                Ok(())
            })?;
        }
        tag::FM_OPERATOR_AMPLITUDES => {
            for_each_audible_of(song, |k| k == InstrumentType::Fm, |instrument| {
                for op in &mut instrument.fm.operators {
                    let raw = dec.read6()?;
                    range_check("FM operator amplitude", raw as i64, 0, 15)?;
                    op.amplitude = raw as u8;
                }
                Ok(())
            })?;
        }
        tag::STRING_SUSTAIN => {
            for_each_audible_of(song, |k| k == InstrumentType::PickedString, |instrument| {
                let raw = dec.read6()?;
                range_check("string sustain", raw as i64, 0, 10)?;
                instrument.string_sustain = raw as u8;
                Ok(())
            })?;
        }
        tag::NOISE_WAVE => {
            for_each_audible_of(song, |k| k == InstrumentType::Noise, |instrument| {
                let raw = dec.read6()?;
                range_check("noise wave", raw as i64, 0, NOISE_WAVES.len() as i64 - 1)?;
                instrument.noise_wave = raw as u8;
                Ok(())
            })?;
        }
        tag::SPECTRUM => {
            for_each_audible_of(song, |k| k == InstrumentType::Spectrum, |instrument| {
                for control in &mut instrument.spectrum.controls {
                    let raw = dec.read6()?;
                    range_check("spectrum control", raw as i64, 0, SPECTRUM_CONTROL_MAX as i64)?;
                    *control = raw as u8;
                }
                Ok(())
            })?;
        }
        tag::DRUMSET => {
            for_each_audible_of(song, |k| k == InstrumentType::Drumset, |instrument| {
                for drum in 0..DRUM_COUNT {
                    for control in &mut instrument.drumset.spectra[drum].controls {
                        let raw = dec.read6()?;
                        range_check("drumset control", raw as i64, 0, SPECTRUM_CONTROL_MAX as i64)?;
                        *control = raw as u8;
                    }
                    let envelope = dec.read6()?;
                    range_check("drumset envelope", envelope as i64, 0, ENVELOPES.len() as i64 - 1)?;
                    instrument.drumset.envelopes[drum] = envelope as u8;
                }
                Ok(())
            })?;
        }
        tag::ENVELOPES => {
            for_each_audible(song, |instrument| {
                let count = dec.read6()? as usize;
                range_check("envelope count", count as i64, 0, 12)?;
                instrument.envelopes.clear();
                for _ in 0..count {
                    let raw = dec.read6()?;
                    let target = EnvelopeTarget::from_index(raw as u8).ok_or(
                        SongError::ValueOutOfRange {
                            field: "envelope target",
                            value: raw as i64,
                        },
                    )?;
                    let index = dec.read6()? as u8;
                    let envelope = dec.read6()?;
                    range_check("envelope preset", envelope as i64, 0, ENVELOPES.len() as i64 - 1)?;
                    instrument.envelopes.push(EnvelopeBinding {
                        target,
                        index,
                        envelope: envelope as u8,
                    });
                }
                Ok(())
            })?;
        }
        tag::DISTORTION => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                range_check("distortion", raw as i64, 0, 7)?;
                instrument.distortion = raw as u8;
                Ok(())
            })?;
        }
        tag::BITCRUSHER => {
            for_each_audible(song, |instrument| {
                let freq = dec.read6()?;
                let quantization = dec.read6()?;
                range_check("bitcrusher freq", freq as i64, 0, 7)?;
                range_check("bitcrusher quantization", quantization as i64, 0, 7)?;
                instrument.bitcrusher_freq = freq as u8;
                instrument.bitcrusher_quantization = quantization as u8;
                Ok(())
            })?;
        }
        tag::CHORUS => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                range_check("chorus", raw as i64, 0, 7)?;
                instrument.chorus = raw as u8;
                Ok(())
            })?;
        }
        tag::ECHO => {
            for_each_audible(song, |instrument| {
                let sustain = dec.read6()?;
                let delay = dec.read6()?;
                range_check("echo sustain", sustain as i64, 0, 7)?;
                range_check("echo delay", delay as i64, 0, 11)?;
                instrument.echo_sustain = sustain as u8;
                instrument.echo_delay = delay as u8;
                Ok(())
            })?;
        }
        tag::REVERB => {
            for_each_audible(song, |instrument| {
                let raw = dec.read6()?;
                range_check("reverb", raw as i64, 0, 11)?;
                instrument.reverb = raw as u8;
                Ok(())
            })?;
        }
        tag::MOD_SLOTS => {
            for index in 0..song.channel_count() {
                if song.channel_kind(index) != ChannelKind::Mod {
                    continue;
                }
                for instrument in &mut song.channels[index].instruments {
                    for slot in &mut instrument.mod_slots {
                        let raw = dec.read6()?;
                        slot.target = ModTarget::from_index(raw as u8).ok_or(
                            SongError::ValueOutOfRange {
                                field: "mod target",
                                value: raw as i64,
                            },
                        )?;
                        slot.channel = dec.read6()? as u8;
                        slot.instrument = dec.read6()? as u8;
                        slot.point = dec.read6()? as u8;
                    }
                }
            }
        }
        tag::BAR_MAP => {
            let map_bits = bits_for_max(song.pattern_count as u32);
            let total_bits = song.channel_count() * song.bar_count * map_bits as usize;
            let digits = dec.read_digits(total_bits.div_ceil(6))?;
            let mut reader = BitReader::new(&digits);
            for index in 0..song.channel_count() {
                for bar in 0..song.bar_count {
                    let value = reader.read(map_bits)?;
                    range_check("bar pattern index", value as i64, 0, song.pattern_count as i64)?;
                    song.channels[index].bars[bar] = value;
                }
            }
        }
        tag::PATTERNS => {
            let length = ((dec.read6()? << 12) | (dec.read6()? << 6) | dec.read6()?) as usize;
            let digits = dec.read_digits(length)?;
            decode_patterns(song, version, &digits)?;
        }
        other => return Err(SongError::UnknownTag(other as char)),
    }
    Ok(())
}

fn read_shape(
    reader: &mut BitReader,
    size_bits: u32,
    size_limit: i32,
) -> Result<NoteShape, SongError> {
    let pitch_count = reader.read(2)? as usize + 1;
    let pin_count = reader.read_long_tail(1, 2)? as usize;
    let initial_size = reader.read(size_bits)? as i32;
    range_check("note size", initial_size as i64, 0, size_limit as i64)?;
    let mut pins = Vec::with_capacity(pin_count);
    for _ in 0..pin_count {
        let time_delta = reader.read_long_tail(1, 4)? as i32;
        let size = reader.read(size_bits)? as i32;
        range_check("note size", size as i64, 0, size_limit as i64)?;
        let negative = reader.read(1)? != 0;
        let magnitude = reader.read_long_tail(0, 2)? as i32;
        let interval = if negative { -magnitude } else { magnitude };
        pins.push(ShapePin {
            time_delta,
            size,
            interval,
        });
    }
    Ok(NoteShape {
        pitch_count,
        initial_size,
        pins,
    })
}

fn note_from_shape(shape: &NoteShape, start: i32) -> Note {
    let mut pins = Vec::with_capacity(shape.pins.len() + 1);
    pins.push(NotePin::new(0, 0, shape.initial_size));
    let mut time = 0;
    for pin in &shape.pins {
        time += pin.time_delta;
        pins.push(NotePin::new(pin.interval, time, pin.size));
    }
    Note {
        pitches: smallvec::SmallVec::new(),
        pins,
        start,
        end: start + time,
        continues_last_pattern: false,
    }
}

fn decode_patterns(song: &mut Song, version: u8, digits: &[u8]) -> Result<(), SongError> {
    let mut reader = BitReader::new(digits);
    let parts_per_bar = song.parts_per_bar();
    let instrument_bits = bits_for_max(song.instrument_count as u32 - 1);

    for index in 0..song.channel_count() {
        let kind = song.channel_kind(index);
        let size_bits = size_bits(kind);
        let pitch_bits = pitch_bits(kind);
        let pitch_limit = max_pitch(kind);
        let size_limit = max_size(kind);
        let mut shapes: RecentRing<NoteShape> = RecentRing::new(SHAPE_RING_SIZE);
        let mut pitches: RecentRing<i32> = RecentRing::new(PITCH_RING_SIZE);

        for pattern_index in 0..song.pattern_count {
            let instrument_count = reader.read(2)? as usize + 1;
            range_check(
                "pattern instrument count",
                instrument_count as i64,
                1,
                MAX_INSTRUMENTS_PER_PATTERN as i64,
            )?;
            let mut instruments = Vec::with_capacity(instrument_count);
            for _ in 0..instrument_count {
                let value = reader.read(instrument_bits)?;
                range_check(
                    "pattern instrument index",
                    value as i64,
                    0,
                    song.instrument_count as i64 - 1,
                )?;
                instruments.push(value as u8);
            }

            let mut notes = Vec::new();
            let mut current = 0;
            while current < parts_per_bar {
                if reader.read(1)? == 0 {
                    current += reader.read_long_tail(1, 4)? as i32;
                    if current > parts_per_bar {
                        return Err(SongError::BitStreamOverrun);
                    }
                    continue;
                }

                let continues = version >= 8 && reader.read(1)? != 0;
                let shape = if reader.read(1)? != 0 {
                    let hit = reader.read(4)? as usize;
                    shapes
                        .get(hit)
                        .cloned()
                        .ok_or(SongError::BitStreamOverrun)?
                } else {
                    let shape = read_shape(&mut reader, size_bits, size_limit)?;
                    shapes.push(shape.clone());
                    shape
                };

                let mut note = note_from_shape(&shape, current);
                note.continues_last_pattern = continues;
                range_check("chord size", shape.pitch_count as i64, 1, MAX_CHORD_PITCHES as i64)?;
                for _ in 0..shape.pitch_count {
                    let pitch = if reader.read(1)? != 0 {
                        let hit = reader.read(4)? as usize;
                        *pitches.get(hit).ok_or(SongError::BitStreamOverrun)?
                    } else {
                        let pitch = reader.read(pitch_bits)? as i32;
                        pitches.push(pitch);
                        pitch
                    };
                    range_check("pitch", pitch as i64, 0, pitch_limit as i64)?;
                    note.pitches.push(pitch);
                }

                if note.end > parts_per_bar || !note.is_well_formed() {
                    return Err(SongError::BitStreamOverrun);
                }
                current = note.end;
                notes.push(note);
            }

            let pattern = &mut song.channels[index].patterns[pattern_index];
            pattern.instruments = instruments;
            pattern.notes = notes;
        }
    }
    if reader.bits_read() > digits.len() * 6 {
        return Err(SongError::BitStreamOverrun);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{FmOperator, Instrument, ModSlot};

    fn roundtrip(song: &Song) -> Song {
        let text = encode_song(song);
        decode_song(&text)
            .expect("decode failed")
            .expect("version rejected")
    }

    #[test]
    fn test_default_song_roundtrip() {
        let song = Song::default();
        assert_eq!(roundtrip(&song), song);
    }

    #[test]
    fn test_out_of_range_version_is_silent_no_load() {
        assert!(decode_song("").unwrap().is_none());
        assert!(decode_song("w1t0a").unwrap().is_none());
        assert!(decode_song("x9").unwrap().is_none());
        assert!(decode_song("wZ").unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        match decode_song("w9~") {
            Err(SongError::UnknownTag('~')) => {}
            other => panic!("expected unknown tag error, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_fatal() {
        // Tempo tag declares two characters but only one follows
        assert!(matches!(
            decode_song("w9t0"),
            Err(SongError::UnexpectedEnd)
        ));
    }

    #[test]
    fn test_song_with_notes_roundtrips() {
        let mut song = Song::default();
        song.title = "test song".to_string();
        song.tempo = 120;
        song.channels[0].bars[0] = 1;
        song.channels[0].bars[1] = 1;
        let pattern = &mut song.channels[0].patterns[0];
        pattern.notes.push(Note::new(36, 0, 24, 3));
        let mut chord = Note::new(40, 24, 96, 4);
        chord.pitches.push(43);
        chord.pitches.push(47);
        chord.pins = vec![
            NotePin::new(0, 0, 4),
            NotePin::new(-2, 48, 6),
            NotePin::new(0, 72, 0),
        ];
        pattern.notes.push(chord);
        assert_eq!(roundtrip(&song), song);
    }

    #[test]
    fn test_shape_ring_hit_shrinks_encoding() {
        let mut unique = Song::default();
        let mut repeated = Song::default();
        for (i, song) in [&mut unique, &mut repeated].into_iter().enumerate() {
            let pattern = &mut song.channels[0].patterns[0];
            for n in 0..8 {
                let size = if i == 0 { (n % 6) as i32 } else { 3 };
                pattern.notes.push(Note::new(30 + n, n * 24, (n + 1) * 24, size));
            }
        }
        // Same pitches, but the repeated song reuses one shape throughout
        let unique_len = encode_song(&unique).len();
        let repeated_len = encode_song(&repeated).len();
        assert!(repeated_len < unique_len);
        assert_eq!(roundtrip(&repeated), repeated);
    }

    #[test]
    fn test_overflowed_rings_evict_oldest_and_roundtrip() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 1;
        song.channels[0].bars[1] = 2;
        // More distinct pitches (20) and shapes (12 durations) than either
        // ring holds, so both evict while this pattern encodes
        let mut start = 0;
        for n in 0..20i32 {
            let duration = (n % 12) + 1;
            song.channels[0].patterns[0]
                .notes
                .push(Note::new(2 * n, start, start + duration, 3));
            start += duration;
        }
        // The next pattern re-references evicted entries (pitch 0, the
        // earliest shapes) and surviving ones; the decoder only stays in
        // sync if it replays the same evictions
        let second = &mut song.channels[0].patterns[1];
        second.notes.push(Note::new(0, 0, 1, 3));
        second.notes.push(Note::new(38, 1, 13, 3));
        second.notes.push(Note::new(8, 13, 18, 3));
        assert_eq!(roundtrip(&song), song);
    }

    #[test]
    fn test_title_byte_out_of_range_is_fatal() {
        // Length 1, high digit 63: no byte has a high part above 3
        assert!(matches!(
            decode_song("w9N1_0"),
            Err(SongError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn test_long_title_truncates_on_a_char_boundary() {
        let mut song = Song::default();
        // 32 two-byte characters: 64 bytes, one past the limit
        song.title = "é".repeat(32);
        let decoded = roundtrip(&song);
        assert_eq!(decoded.title, "é".repeat(31));
    }

    #[test]
    fn test_continuation_flag_roundtrips() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 1;
        song.channels[0].bars[1] = 2;
        let mut note = Note::new(40, 0, 48, 3);
        note.continues_last_pattern = true;
        song.channels[0].patterns[1].notes.push(note);
        assert_eq!(roundtrip(&song), song);
    }

    #[test]
    fn test_instrument_settings_roundtrip() {
        let mut song = Song::default();
        song.instrument_count = 2;
        song.mod_channel_count = 1;
        song.rebuild_channels();

        let fm = &mut song.channels[0].instruments[0];
        *fm = Instrument::new(InstrumentType::Fm);
        fm.fm.algorithm = 3;
        fm.fm.feedback_type = 4;
        fm.fm.feedback_amplitude = 9;
        fm.fm.operators[1] = FmOperator { frequency: 5, amplitude: 12 };
        fm.volume = -7;
        fm.pan = 80;
        fm.effects.insert(EffectFlags::REVERB);
        fm.effects.insert(EffectFlags::NOTE_FILTER);
        fm.reverb = 6;
        fm.note_filter.points.push(FilterControlPoint::new(FilterType::LowPass, 20, 7));
        fm.envelopes.push(EnvelopeBinding {
            target: EnvelopeTarget::FmOperatorAmplitude,
            index: 1,
            envelope: 7,
        });

        let string = &mut song.channels[1].instruments[1];
        *string = Instrument::new(InstrumentType::PickedString);
        string.string_sustain = 4;
        string.unison = 6;
        string.harmonics.controls[5] = 7;

        let drums = &mut song.channels[3].instruments[0];
        *drums = Instrument::new(InstrumentType::Drumset);
        drums.drumset.spectra[3].controls[10] = 6;
        drums.drumset.envelopes[3] = 15;

        let modulator = &mut song.channels[4].instruments[0];
        modulator.mod_slots[0] = ModSlot {
            target: ModTarget::NoteFilterFreq,
            channel: 0,
            instrument: 0,
            point: 0,
        };
        modulator.mod_slots[1] = ModSlot {
            target: ModTarget::Tempo,
            channel: 0,
            instrument: 0,
            point: 0,
        };

        assert_eq!(roundtrip(&song), song);
    }

    #[test]
    fn test_legacy_pan_rescales() {
        // v6 pan payloads are one character, 0..=8
        let data = format!(
            "w6p{}{}{}{}",
            base64_char(8) as char,
            base64_char(4) as char,
            base64_char(0) as char,
            base64_char(8) as char,
        );
        let song = decode_song(&data).unwrap().unwrap();
        assert_eq!(song.channels[0].instruments[0].pan, 100);
        assert_eq!(song.channels[1].instruments[0].pan, 50);
        assert_eq!(song.channels[2].instruments[0].pan, 0);
    }

    #[test]
    fn test_legacy_volume_is_attenuation() {
        let data = format!(
            "w3v{}{}{}{}",
            base64_char(5) as char,
            base64_char(0) as char,
            base64_char(2) as char,
            base64_char(0) as char,
        );
        let song = decode_song(&data).unwrap().unwrap();
        assert_eq!(song.channels[0].instruments[0].volume, -25);
        assert_eq!(song.channels[1].instruments[0].volume, 0);
        assert_eq!(song.channels[2].instruments[0].volume, -10);
    }

    #[test]
    fn test_legacy_song_reverb_spreads_to_instruments() {
        let data = format!("w5C{}", base64_char(7) as char);
        let song = decode_song(&data).unwrap().unwrap();
        for index in 0..song.channel_count() {
            let instrument = &song.channels[index].instruments[0];
            assert_eq!(instrument.reverb, 7);
            assert!(instrument.effects.contains(EffectFlags::REVERB));
        }
    }

    #[test]
    fn test_legacy_filter_becomes_control_point() {
        let mut data = String::from("w4K");
        for _ in 0..4 {
            data.push(base64_char(6) as char);
            data.push(base64_char(4) as char);
        }
        let song = decode_song(&data).unwrap().unwrap();
        let filter = &song.channels[0].instruments[0].eq_filter;
        assert_eq!(filter.points.len(), 1);
        assert_eq!(filter.points[0].kind, FilterType::LowPass);
        assert_eq!(filter.points[0].freq, 3 + 6 * 3);
    }

    #[test]
    fn test_decoded_tempo_is_clamped() {
        let data = format!(
            "w9t{}{}",
            base64_char((1000 >> 6) as u8) as char,
            base64_char((1000 & 63) as u8) as char,
        );
        let song = decode_song(&data).unwrap().unwrap();
        assert_eq!(song.tempo, MAX_TEMPO);
    }
}
