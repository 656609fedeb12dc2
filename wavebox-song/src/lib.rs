//! Wavebox-Song: composition model and compact song codec for Wavebox
//!
//! This crate holds the static, serializable description of a piece of music
//! (channels of instruments playing time-stamped notes) plus the two codecs
//! that move it in and out of memory:
//!
//! - A versioned **binary codec** producing a bit-packed, URL-safe text
//!   format (`<variant><version>{tag,payload}*`). Decoding reproduces every
//!   historical format generation without breaking old data.
//! - A **JSON codec** for human/tool interchange, defaulting any missing
//!   field rather than failing.
//!
//! The filter design math (biquad coefficient derivation and frequency
//! response analysis) also lives here because the legacy-format conversion
//! needs it at decode time; the synthesizer crate reuses the same types at
//! render time.
//!
//! # Time model
//!
//! Musical time is hierarchical, coarsest to finest: bar → beat → part →
//! tick. A "part" is the smallest schedulable note-timing unit; a "tick" is
//! the smallest unit at which the synthesizer resamples modulatable
//! parameters. Notes store their start/end in parts.
//!
//! # Usage
//!
//! ```ignore
//! use wavebox_song::Song;
//!
//! let song = Song::from_string("w9t1Ea07g02...")?.unwrap_or_default();
//! let text = song.to_string();
//! ```

mod bits;
mod codec;
mod error;
mod filter;
mod instrument;
mod json;
mod notes;
mod song;

pub use bits::{BitReader, BitWriter, base64_char, base64_value};
pub use codec::{decode_song, encode_song};
pub use error::SongError;
pub use filter::{
    FILTER_FREQ_COUNT, FILTER_FREQ_REFERENCE_HZ, FILTER_GAIN_CENTER, FILTER_GAIN_COUNT,
    FilterCoefficients, FilterControlPoint, FilterSettings, FilterType, frequency_response,
    gain_setting_to_linear, freq_setting_to_hz,
};
pub use instrument::{
    CHIP_WAVES, ChipWave, ChordKind, DRUM_COUNT, DrumsetSettings, EffectFlags, EnvelopeBinding,
    EnvelopeCurve, EnvelopeDef, EnvelopeTarget, ENVELOPES, FADE_OUT_TICKS, FM_ALGORITHMS,
    FM_FEEDBACKS, FM_FREQUENCY_RATIOS, FmAlgorithm, FmFeedback, FmOperator, FmSettings,
    HARMONICS_CONTROL_COUNT, HARMONICS_CONTROL_MAX, HarmonicsSettings, Instrument, InstrumentType,
    ModSlot, ModTarget, NOISE_WAVES, NoiseWave, SLIDE_PARTS, SPECTRUM_CONTROL_COUNT,
    SPECTRUM_CONTROL_MAX, STRUM_PARTS, SpectrumSettings, Transition, UNISONS, Unison, Vibrato,
};
pub use json::{song_from_json, song_to_json};
pub use notes::{Note, NotePin, Pattern};
pub use song::{Channel, ChannelKind, Song};

// =============================================================================
// Time Constants
// =============================================================================

/// Parts per beat (the smallest schedulable note-timing subdivision)
pub const PARTS_PER_BEAT: u32 = 24;

/// Ticks per part (the parameter-resampling subdivision)
pub const TICKS_PER_PART: u32 = 2;

// =============================================================================
// Limits
// =============================================================================

/// Pitch channel count range
pub const MIN_PITCH_CHANNELS: usize = 1;
pub const MAX_PITCH_CHANNELS: usize = 10;

/// Noise channel count range
pub const MAX_NOISE_CHANNELS: usize = 5;

/// Modulation channel count range
pub const MAX_MOD_CHANNELS: usize = 4;

/// Highest pitch value in a pitch channel (7 octaves)
pub const MAX_PITCH: i32 = 84;

/// Number of distinct noise-channel pitches (drum slots)
pub const NOISE_PITCH_COUNT: i32 = 12;

/// Number of modulator slots per mod-channel instrument
pub const MOD_SLOT_COUNT: usize = 6;

/// Note size (volume keyframe) range for pitch/noise channels
pub const MAX_NOTE_SIZE: i32 = 6;

/// Note size range for modulation channels (mod setting values)
pub const MAX_MOD_NOTE_SIZE: i32 = 63;

/// Maximum concurrent pitches in one note (chord size)
pub const MAX_CHORD_PITCHES: usize = 4;

/// Tempo range in beats per minute
pub const MIN_TEMPO: u32 = 30;
pub const MAX_TEMPO: u32 = 320;

/// Beats per bar range
pub const MIN_BEATS_PER_BAR: u32 = 3;
pub const MAX_BEATS_PER_BAR: u32 = 16;

/// Bar count range
pub const MAX_BAR_COUNT: usize = 256;

/// Patterns per channel range
pub const MAX_PATTERNS_PER_CHANNEL: usize = 64;

/// Instruments per channel range
pub const MAX_INSTRUMENTS_PER_CHANNEL: usize = 8;

/// Instruments that may layer in a single pattern
pub const MAX_INSTRUMENTS_PER_PATTERN: usize = 4;

/// Maximum control points in one filter stack
pub const MAX_FILTER_POINTS: usize = 8;

/// Instrument volume setting range (symmetric around 0)
pub const MAX_VOLUME_SETTING: i32 = 25;

/// Pan setting range (0 = hard left, 50 = center, 100 = hard right)
pub const MAX_PAN_SETTING: u32 = 100;

// =============================================================================
// Format Constants
// =============================================================================

/// Leading variant character of the binary format
pub const FORMAT_VARIANT: u8 = b'w';

/// Oldest binary format version this crate can decode
pub const OLDEST_VERSION: u8 = 2;

/// Version emitted by the encoder
pub const CURRENT_VERSION: u8 = 9;

/// Beats per minute assumed when a tempo tag is missing
pub const DEFAULT_TEMPO: u32 = 150;
