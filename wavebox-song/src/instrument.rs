//! Instrument definitions: type tags, parameter blocks, and preset tables
//!
//! An instrument's type tag selects which parameter subset and which DSP
//! kernel apply. All preset tables (chip waves, unisons, envelopes, FM
//! algorithms) are fixed by design; indices into them are what the song
//! formats store.

use crate::filter::FilterSettings;
use crate::{MAX_PAN_SETTING, MOD_SLOT_COUNT};

// =============================================================================
// Instrument Type
// =============================================================================

/// Which synthesis kernel and parameter subset an instrument uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentType {
    #[default]
    Chip,
    Fm,
    Harmonics,
    PulseWidth,
    PickedString,
    Noise,
    Spectrum,
    Drumset,
    Mod,
}

impl InstrumentType {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Chip),
            1 => Some(Self::Fm),
            2 => Some(Self::Harmonics),
            3 => Some(Self::PulseWidth),
            4 => Some(Self::PickedString),
            5 => Some(Self::Noise),
            6 => Some(Self::Spectrum),
            7 => Some(Self::Drumset),
            8 => Some(Self::Mod),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Chip => 0,
            Self::Fm => 1,
            Self::Harmonics => 2,
            Self::PulseWidth => 3,
            Self::PickedString => 4,
            Self::Noise => 5,
            Self::Spectrum => 6,
            Self::Drumset => 7,
            Self::Mod => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Chip => "chip",
            Self::Fm => "FM",
            Self::Harmonics => "harmonics",
            Self::PulseWidth => "pulse width",
            Self::PickedString => "picked string",
            Self::Noise => "noise",
            Self::Spectrum => "spectrum",
            Self::Drumset => "drumset",
            Self::Mod => "mod",
        }
    }

    /// Types available in noise channels
    pub fn is_noise_type(self) -> bool {
        matches!(self, Self::Noise | Self::Spectrum | Self::Drumset)
    }
}

// =============================================================================
// Effect Flags
// =============================================================================

/// Bitmask of enabled effect stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectFlags(u16);

impl EffectFlags {
    pub const NOTE_FILTER: Self = Self(0x0001);
    pub const PANNING: Self = Self(0x0002);
    pub const DISTORTION: Self = Self(0x0004);
    pub const BITCRUSHER: Self = Self(0x0008);
    pub const CHORUS: Self = Self(0x0010);
    pub const ECHO: Self = Self(0x0020);
    pub const REVERB: Self = Self(0x0040);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & 0x007F)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

// =============================================================================
// Transition / Chord / Vibrato
// =============================================================================

/// How a note hands off to an adjacent note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transition {
    /// Retrigger with a short crossfade
    #[default]
    Normal,
    /// Retrigger with a hard cut
    Interrupt,
    /// Continue the tone and glide pitch across the boundary
    Slide,
    /// Continue the tone with no pitch glide (legato)
    Seamless,
}

impl Transition {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Normal),
            1 => Some(Self::Interrupt),
            2 => Some(Self::Slide),
            3 => Some(Self::Seamless),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Interrupt => 1,
            Self::Slide => 2,
            Self::Seamless => 3,
        }
    }

    /// Whether adjacent notes keep the tone alive instead of retriggering
    pub fn is_seamless(self) -> bool {
        matches!(self, Self::Slide | Self::Seamless)
    }
}

/// Length of the pitch glide window for sliding transitions, in parts
pub const SLIDE_PARTS: i32 = 3;

/// How a chord's pitches are voiced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChordKind {
    /// One tone voices every pitch with reduced per-voice expression
    #[default]
    Simultaneous,
    /// One tone per pitch, start times staggered
    Strum,
    /// One tone cycles its pitch across the chord
    Arpeggio,
}

impl ChordKind {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Simultaneous),
            1 => Some(Self::Strum),
            2 => Some(Self::Arpeggio),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Simultaneous => 0,
            Self::Strum => 1,
            Self::Arpeggio => 2,
        }
    }
}

/// Stagger between strummed chord voices, in parts
pub const STRUM_PARTS: i32 = 1;

/// Vibrato preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vibrato {
    #[default]
    None,
    Light,
    Delayed,
    Heavy,
    Shaky,
}

impl Vibrato {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::None),
            1 => Some(Self::Light),
            2 => Some(Self::Delayed),
            3 => Some(Self::Heavy),
            4 => Some(Self::Shaky),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Light => 1,
            Self::Delayed => 2,
            Self::Heavy => 3,
            Self::Shaky => 4,
        }
    }

    /// Peak depth in semitones
    pub fn depth(self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Light => 0.15,
            Self::Delayed => 0.3,
            Self::Heavy => 0.45,
            Self::Shaky => 0.1,
        }
    }

    /// Oscillation rate in periods per second
    pub fn speed(self) -> f64 {
        match self {
            Self::Shaky => 11.0,
            _ => 6.0,
        }
    }

    /// Parts to wait before the vibrato ramps in
    pub fn delay_parts(self) -> i32 {
        match self {
            Self::Delayed => 18,
            _ => 0,
        }
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// Shape family of a modulation envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeCurve {
    /// Constant 1
    None,
    /// Pass through the note's own size envelope
    NoteSize,
    /// Clipped-linear burst at note start
    Punch,
    /// Two-segment attack/decay
    Flare,
    /// Inverse-linear decay
    Twang,
    /// Inverse-linear rise
    Swell,
    /// Cosine oscillation
    Tremolo,
    /// Exponential decay
    Decay,
}

/// One envelope preset: a curve family at a fixed speed
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeDef {
    pub name: &'static str,
    pub curve: EnvelopeCurve,
    pub speed: f64,
}

/// The fixed envelope preset table; song formats store indices into this
pub const ENVELOPES: &[EnvelopeDef] = &[
    EnvelopeDef { name: "none", curve: EnvelopeCurve::None, speed: 0.0 },
    EnvelopeDef { name: "note size", curve: EnvelopeCurve::NoteSize, speed: 0.0 },
    EnvelopeDef { name: "punch", curve: EnvelopeCurve::Punch, speed: 0.0 },
    EnvelopeDef { name: "flare 1", curve: EnvelopeCurve::Flare, speed: 32.0 },
    EnvelopeDef { name: "flare 2", curve: EnvelopeCurve::Flare, speed: 8.0 },
    EnvelopeDef { name: "flare 3", curve: EnvelopeCurve::Flare, speed: 2.0 },
    EnvelopeDef { name: "twang 1", curve: EnvelopeCurve::Twang, speed: 32.0 },
    EnvelopeDef { name: "twang 2", curve: EnvelopeCurve::Twang, speed: 8.0 },
    EnvelopeDef { name: "twang 3", curve: EnvelopeCurve::Twang, speed: 2.0 },
    EnvelopeDef { name: "swell 1", curve: EnvelopeCurve::Swell, speed: 32.0 },
    EnvelopeDef { name: "swell 2", curve: EnvelopeCurve::Swell, speed: 8.0 },
    EnvelopeDef { name: "swell 3", curve: EnvelopeCurve::Swell, speed: 2.0 },
    EnvelopeDef { name: "tremolo 1", curve: EnvelopeCurve::Tremolo, speed: 4.0 },
    EnvelopeDef { name: "tremolo 2", curve: EnvelopeCurve::Tremolo, speed: 2.0 },
    EnvelopeDef { name: "tremolo 3", curve: EnvelopeCurve::Tremolo, speed: 1.0 },
    EnvelopeDef { name: "decay 1", curve: EnvelopeCurve::Decay, speed: 10.0 },
    EnvelopeDef { name: "decay 2", curve: EnvelopeCurve::Decay, speed: 7.0 },
    EnvelopeDef { name: "decay 3", curve: EnvelopeCurve::Decay, speed: 4.0 },
];

/// What an envelope modulates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeTarget {
    NoteVolume,
    PitchShift,
    VibratoDepth,
    PulseWidth,
    StringSustain,
    /// `index` selects the FM operator
    FmOperatorAmplitude,
    /// `index` selects the FM operator
    FmOperatorFrequency,
    FeedbackAmplitude,
    /// `index` selects the note-filter control point
    NoteFilterFreq,
    /// `index` selects the note-filter control point
    NoteFilterGain,
}

impl EnvelopeTarget {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::NoteVolume),
            1 => Some(Self::PitchShift),
            2 => Some(Self::VibratoDepth),
            3 => Some(Self::PulseWidth),
            4 => Some(Self::StringSustain),
            5 => Some(Self::FmOperatorAmplitude),
            6 => Some(Self::FmOperatorFrequency),
            7 => Some(Self::FeedbackAmplitude),
            8 => Some(Self::NoteFilterFreq),
            9 => Some(Self::NoteFilterGain),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::NoteVolume => 0,
            Self::PitchShift => 1,
            Self::VibratoDepth => 2,
            Self::PulseWidth => 3,
            Self::StringSustain => 4,
            Self::FmOperatorAmplitude => 5,
            Self::FmOperatorFrequency => 6,
            Self::FeedbackAmplitude => 7,
            Self::NoteFilterFreq => 8,
            Self::NoteFilterGain => 9,
        }
    }
}

/// An envelope attached to one automatable target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeBinding {
    pub target: EnvelopeTarget,
    /// Operator or filter-point index where the target needs one
    pub index: u8,
    /// Index into [`ENVELOPES`]
    pub envelope: u8,
}

// =============================================================================
// Chip Waves and Unison
// =============================================================================

/// A chip waveform: step values for one cycle, plus a loudness trim
#[derive(Debug, Clone, Copy)]
pub struct ChipWave {
    pub name: &'static str,
    pub expression: f64,
    pub samples: &'static [f32],
}

pub const CHIP_WAVES: &[ChipWave] = &[
    ChipWave {
        name: "rounded",
        expression: 0.94,
        samples: &[
            0.0, 0.2, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
            1.0, 1.0, 0.95, 0.9, 0.85, 0.8, 0.7, 0.6, 0.5, 0.4, 0.2, 0.0, -0.2, -0.4, -0.5, -0.6,
            -0.7, -0.8, -0.85, -0.9, -0.95, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -0.95,
            -0.9, -0.85, -0.8, -0.7, -0.6, -0.5, -0.4, -0.2,
        ],
    },
    ChipWave {
        name: "triangle",
        expression: 1.0,
        samples: &[
            0.0, 0.25, 0.5, 0.75, 1.0, 0.75, 0.5, 0.25, 0.0, -0.25, -0.5, -0.75, -1.0, -0.75,
            -0.5, -0.25,
        ],
    },
    ChipWave {
        name: "square",
        expression: 0.5,
        samples: &[1.0, -1.0],
    },
    ChipWave {
        name: "1/4 pulse",
        expression: 0.5,
        samples: &[1.0, -1.0, -1.0, -1.0],
    },
    ChipWave {
        name: "1/8 pulse",
        expression: 0.5,
        samples: &[1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0],
    },
    ChipWave {
        name: "sawtooth",
        expression: 0.65,
        samples: &[-0.875, -0.625, -0.375, -0.125, 0.125, 0.375, 0.625, 0.875],
    },
    ChipWave {
        name: "double saw",
        expression: 0.5,
        samples: &[-0.875, -0.375, 0.125, 0.625, -0.625, -0.125, 0.375, 0.875],
    },
    ChipWave {
        name: "double pulse",
        expression: 0.4,
        samples: &[1.0, -1.0, 1.0, 1.0, -1.0, -1.0],
    },
    ChipWave {
        name: "spiky",
        expression: 0.4,
        samples: &[1.0, -1.0, 1.0, -1.0, 1.0, 0.0],
    },
];

/// A unison preset: how a second detuned voice layers onto the first
#[derive(Debug, Clone, Copy)]
pub struct Unison {
    pub name: &'static str,
    pub voices: u8,
    /// Detune of the voices away from center, in semitones
    pub spread: f64,
    /// Pitch offset of the second voice, in semitones
    pub offset: f64,
    /// Loudness trim for the combined voices
    pub expression: f64,
    /// Polarity of the second voice
    pub sign: f64,
}

pub const UNISONS: &[Unison] = &[
    Unison { name: "none", voices: 1, spread: 0.0, offset: 0.0, expression: 1.4, sign: 1.0 },
    Unison { name: "shimmer", voices: 2, spread: 0.018, offset: 0.0, expression: 0.8, sign: 1.0 },
    Unison { name: "hum", voices: 2, spread: 0.045, offset: 0.0, expression: 1.0, sign: 1.0 },
    Unison { name: "honky tonk", voices: 2, spread: 0.09, offset: 0.0, expression: 1.0, sign: 1.0 },
    Unison { name: "dissonant", voices: 2, spread: 0.25, offset: 0.0, expression: 0.9, sign: 1.0 },
    Unison { name: "fifth", voices: 2, spread: 3.5, offset: 3.5, expression: 0.9, sign: 1.0 },
    Unison { name: "octave", voices: 2, spread: 6.0, offset: 6.0, expression: 0.8, sign: 1.0 },
    Unison { name: "bowed", voices: 2, spread: 0.02, offset: 0.0, expression: 1.0, sign: -1.0 },
];

// =============================================================================
// FM Tables
// =============================================================================

/// One FM operator's settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FmOperator {
    /// Index into [`FM_FREQUENCY_RATIOS`]
    pub frequency: u8,
    /// Amplitude setting, 0..=15
    pub amplitude: u8,
}

/// Frequency ratios selectable per operator
pub const FM_FREQUENCY_RATIOS: &[f64] = &[
    0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 11.0, 13.0, 16.0, 20.0,
];

/// An FM routing: how many of the four operators are carriers, and which
/// operators modulate each operator's phase
#[derive(Debug, Clone, Copy)]
pub struct FmAlgorithm {
    pub name: &'static str,
    pub carrier_count: usize,
    pub modulated_by: [&'static [usize]; 4],
}

pub const FM_ALGORITHMS: &[FmAlgorithm] = &[
    FmAlgorithm { name: "1←(2 3 4)", carrier_count: 1, modulated_by: [&[1, 2, 3], &[], &[], &[]] },
    FmAlgorithm { name: "1←(2 3←4)", carrier_count: 1, modulated_by: [&[1, 2], &[], &[3], &[]] },
    FmAlgorithm { name: "1←2←(3 4)", carrier_count: 1, modulated_by: [&[1], &[2, 3], &[], &[]] },
    FmAlgorithm { name: "1←2←3←4", carrier_count: 1, modulated_by: [&[1], &[2], &[3], &[]] },
    FmAlgorithm { name: "(1 2)←(3 4)", carrier_count: 2, modulated_by: [&[2, 3], &[2, 3], &[], &[]] },
    FmAlgorithm { name: "1←3 2←4", carrier_count: 2, modulated_by: [&[2], &[3], &[], &[]] },
    FmAlgorithm { name: "(1 2 3)←4", carrier_count: 3, modulated_by: [&[3], &[3], &[3], &[]] },
    FmAlgorithm { name: "1 2 3 4", carrier_count: 4, modulated_by: [&[], &[], &[], &[]] },
];

/// A feedback topology: which operators' previous outputs feed which phases
#[derive(Debug, Clone, Copy)]
pub struct FmFeedback {
    pub name: &'static str,
    pub modulated_by: [&'static [usize]; 4],
}

pub const FM_FEEDBACKS: &[FmFeedback] = &[
    FmFeedback { name: "1⟲", modulated_by: [&[0], &[], &[], &[]] },
    FmFeedback { name: "2⟲", modulated_by: [&[], &[1], &[], &[]] },
    FmFeedback { name: "3⟲", modulated_by: [&[], &[], &[2], &[]] },
    FmFeedback { name: "4⟲", modulated_by: [&[], &[], &[], &[3]] },
    FmFeedback { name: "1⟲ 2⟲ 3⟲ 4⟲", modulated_by: [&[0], &[1], &[2], &[3]] },
    FmFeedback { name: "1▶2▶3▶4", modulated_by: [&[], &[0], &[1], &[2]] },
];

/// FM parameter block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmSettings {
    /// Index into [`FM_ALGORITHMS`]
    pub algorithm: u8,
    /// Index into [`FM_FEEDBACKS`]
    pub feedback_type: u8,
    /// Feedback amplitude setting, 0..=15
    pub feedback_amplitude: u8,
    pub operators: [FmOperator; 4],
}

impl Default for FmSettings {
    fn default() -> Self {
        Self {
            algorithm: 0,
            feedback_type: 0,
            feedback_amplitude: 0,
            operators: [
                FmOperator { frequency: 2, amplitude: 15 },
                FmOperator { frequency: 2, amplitude: 0 },
                FmOperator { frequency: 2, amplitude: 0 },
                FmOperator { frequency: 2, amplitude: 0 },
            ],
        }
    }
}

// =============================================================================
// Noise / Spectrum / Harmonics
// =============================================================================

/// A noise-channel waveform preset
#[derive(Debug, Clone, Copy)]
pub struct NoiseWave {
    pub name: &'static str,
    pub expression: f64,
    /// How strongly the one-pole smoothing filter tracks the fundamental
    pub pitch_filter_mult: f64,
    /// Soft noises use a gentler smoothing response
    pub is_soft: bool,
}

pub const NOISE_WAVES: &[NoiseWave] = &[
    NoiseWave { name: "retro", expression: 0.25, pitch_filter_mult: 1.0, is_soft: false },
    NoiseWave { name: "white", expression: 1.0, pitch_filter_mult: 8.0, is_soft: true },
    NoiseWave { name: "clang", expression: 0.4, pitch_filter_mult: 1.0, is_soft: false },
    NoiseWave { name: "buzz", expression: 0.3, pitch_filter_mult: 1.0, is_soft: false },
    NoiseWave { name: "hollow", expression: 1.5, pitch_filter_mult: 1.0, is_soft: true },
];

/// Number of harmonics controls
pub const HARMONICS_CONTROL_COUNT: usize = 28;

/// Maximum value of one harmonics control
pub const HARMONICS_CONTROL_MAX: u8 = 7;

/// Additive-synthesis harmonic amplitudes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarmonicsSettings {
    pub controls: [u8; HARMONICS_CONTROL_COUNT],
}

impl Default for HarmonicsSettings {
    fn default() -> Self {
        let mut controls = [0; HARMONICS_CONTROL_COUNT];
        controls[0] = HARMONICS_CONTROL_MAX;
        controls[3] = 2;
        controls[6] = 1;
        Self { controls }
    }
}

/// Number of spectrum controls
pub const SPECTRUM_CONTROL_COUNT: usize = 30;

/// Maximum value of one spectrum control
pub const SPECTRUM_CONTROL_MAX: u8 = 7;

/// Spectral-band amplitudes for the spectrum and drumset kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumSettings {
    pub controls: [u8; SPECTRUM_CONTROL_COUNT],
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        let mut controls = [0; SPECTRUM_CONTROL_COUNT];
        for (i, control) in controls.iter_mut().enumerate() {
            *control = if i % 6 == 0 { 5 } else { 2 };
        }
        Self { controls }
    }
}

/// Number of drums in a drumset
pub const DRUM_COUNT: usize = 12;

/// Drumset parameter block: one spectrum and one envelope preset per drum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrumsetSettings {
    pub spectra: [SpectrumSettings; DRUM_COUNT],
    /// Index into [`ENVELOPES`] per drum
    pub envelopes: [u8; DRUM_COUNT],
}

impl Default for DrumsetSettings {
    fn default() -> Self {
        Self {
            spectra: [SpectrumSettings::default(); DRUM_COUNT],
            // twang 2 approximates a natural drum decay
            envelopes: [7; DRUM_COUNT],
        }
    }
}

// =============================================================================
// Modulation
// =============================================================================

/// What a modulation slot writes to, each tick, at tick boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModTarget {
    #[default]
    None,
    Tempo,
    MasterGain,
    InstrumentVolume,
    Pan,
    EqFilterFreq,
    EqFilterGain,
    NoteFilterFreq,
    NoteFilterGain,
    NextBar,
    ResetArpeggio,
}

impl ModTarget {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::None),
            1 => Some(Self::Tempo),
            2 => Some(Self::MasterGain),
            3 => Some(Self::InstrumentVolume),
            4 => Some(Self::Pan),
            5 => Some(Self::EqFilterFreq),
            6 => Some(Self::EqFilterGain),
            7 => Some(Self::NoteFilterFreq),
            8 => Some(Self::NoteFilterGain),
            9 => Some(Self::NextBar),
            10 => Some(Self::ResetArpeggio),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Tempo => 1,
            Self::MasterGain => 2,
            Self::InstrumentVolume => 3,
            Self::Pan => 4,
            Self::EqFilterFreq => 5,
            Self::EqFilterGain => 6,
            Self::NoteFilterFreq => 7,
            Self::NoteFilterGain => 8,
            Self::NextBar => 9,
            Self::ResetArpeggio => 10,
        }
    }

    /// Whether this target addresses a specific channel/instrument
    pub fn is_per_instrument(self) -> bool {
        !matches!(self, Self::None | Self::Tempo | Self::MasterGain | Self::NextBar)
    }
}

/// One of a mod instrument's six modulator slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModSlot {
    pub target: ModTarget,
    /// Target channel index (for per-instrument targets)
    pub channel: u8,
    /// Target instrument index within the channel
    pub instrument: u8,
    /// Target filter control point index (for filter targets)
    pub point: u8,
}

// =============================================================================
// Instrument
// =============================================================================

/// Ticks of release fade-out per fade setting index
pub const FADE_OUT_TICKS: &[u32] = &[3, 6, 12, 24, 48, 72, 96, 128];

/// A complete instrument definition
///
/// Only the parameter subset selected by `kind` is meaningful; the rest keep
/// their defaults so switching types in an editor is non-destructive.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub kind: InstrumentType,
    /// Volume setting, -25..=25 (0 = unity)
    pub volume: i32,
    /// Pan setting, 0..=100 (50 = center)
    pub pan: u32,
    pub effects: EffectFlags,
    pub transition: Transition,
    pub chord: ChordKind,
    /// Arpeggio rate setting, 0..=8 (ticks per step halves as it rises)
    pub arpeggio_speed: u8,
    /// Index into [`FADE_OUT_TICKS`]
    pub fade_out: u8,
    pub vibrato: Vibrato,
    /// Always-on output EQ stack
    pub eq_filter: FilterSettings,
    /// Per-note filter stack (gated by [`EffectFlags::NOTE_FILTER`])
    pub note_filter: FilterSettings,
    pub envelopes: Vec<EnvelopeBinding>,

    // Per-type parameter blocks
    /// Index into [`CHIP_WAVES`]
    pub chip_wave: u8,
    /// Index into [`UNISONS`]
    pub unison: u8,
    /// Pulse duty setting, 1..=50 (percent of the cycle)
    pub pulse_width: u8,
    pub harmonics: HarmonicsSettings,
    pub fm: FmSettings,
    /// Sustain setting for the picked string, 0..=10
    pub string_sustain: u8,
    /// Index into [`NOISE_WAVES`]
    pub noise_wave: u8,
    pub spectrum: SpectrumSettings,
    pub drumset: Box<DrumsetSettings>,
    pub mod_slots: [ModSlot; MOD_SLOT_COUNT],

    // Effect stage scalars
    /// Distortion drive setting, 0..=7
    pub distortion: u8,
    /// Bitcrusher sample-rate reduction setting, 0..=7
    pub bitcrusher_freq: u8,
    /// Bitcrusher amplitude quantization setting, 0..=7
    pub bitcrusher_quantization: u8,
    /// Chorus depth setting, 0..=7
    pub chorus: u8,
    /// Echo feedback setting, 0..=7
    pub echo_sustain: u8,
    /// Echo delay setting in half-beats, 0..=11
    pub echo_delay: u8,
    /// Reverb send setting, 0..=11
    pub reverb: u8,
}

impl Instrument {
    /// A fresh instrument of the given type with sensible defaults
    pub fn new(kind: InstrumentType) -> Self {
        Self {
            kind,
            volume: 0,
            pan: MAX_PAN_SETTING / 2,
            effects: EffectFlags::PANNING,
            transition: Transition::Normal,
            chord: if kind.is_noise_type() {
                ChordKind::Simultaneous
            } else {
                ChordKind::Arpeggio
            },
            arpeggio_speed: 4,
            fade_out: 2,
            vibrato: Vibrato::None,
            eq_filter: FilterSettings::new(),
            note_filter: FilterSettings::new(),
            envelopes: Vec::new(),
            chip_wave: 1,
            unison: 0,
            pulse_width: 25,
            harmonics: HarmonicsSettings::default(),
            fm: FmSettings::default(),
            string_sustain: 7,
            noise_wave: 0,
            spectrum: SpectrumSettings::default(),
            drumset: Box::new(DrumsetSettings::default()),
            mod_slots: [ModSlot::default(); MOD_SLOT_COUNT],
            distortion: 2,
            bitcrusher_freq: 3,
            bitcrusher_quantization: 3,
            chorus: 3,
            echo_sustain: 3,
            echo_delay: 3,
            reverb: 2,
        }
    }

    /// Linear gain multiplier for the volume setting
    pub fn volume_multiplier(&self) -> f64 {
        if self.volume <= -crate::MAX_VOLUME_SETTING {
            0.0
        } else {
            2.0f64.powf(self.volume as f64 / 10.0)
        }
    }
}

impl Default for Instrument {
    fn default() -> Self {
        Self::new(InstrumentType::Chip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_indices_roundtrip() {
        for index in 0..9u8 {
            let kind = InstrumentType::from_index(index).unwrap();
            assert_eq!(kind.index(), index);
        }
        assert!(InstrumentType::from_index(9).is_none());
    }

    #[test]
    fn test_effect_flags() {
        let mut flags = EffectFlags::empty();
        flags.insert(EffectFlags::REVERB);
        flags.insert(EffectFlags::CHORUS);
        assert!(flags.contains(EffectFlags::REVERB));
        assert!(!flags.contains(EffectFlags::ECHO));
        flags.remove(EffectFlags::REVERB);
        assert!(!flags.contains(EffectFlags::REVERB));
        assert_eq!(EffectFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_fm_algorithm_topology_is_consistent() {
        for algorithm in FM_ALGORITHMS {
            assert!(algorithm.carrier_count >= 1 && algorithm.carrier_count <= 4);
            for (op, modulators) in algorithm.modulated_by.iter().enumerate() {
                for &m in modulators.iter() {
                    assert!(m > op, "{}: modulators must be later operators", algorithm.name);
                    assert!(m < 4);
                }
            }
        }
    }

    #[test]
    fn test_volume_multiplier_extremes() {
        let mut instrument = Instrument::new(InstrumentType::Chip);
        instrument.volume = -25;
        assert_eq!(instrument.volume_multiplier(), 0.0);
        instrument.volume = 0;
        assert!((instrument.volume_multiplier() - 1.0).abs() < 1e-12);
        instrument.volume = 10;
        assert!((instrument.volume_multiplier() - 2.0).abs() < 1e-12);
    }
}
