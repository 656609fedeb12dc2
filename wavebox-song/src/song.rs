//! The song model: channels, bar-to-pattern maps, and song-level settings

use std::fmt;

use crate::instrument::{Instrument, InstrumentType};
use crate::notes::{Pattern, parts_per_bar};
use crate::{
    DEFAULT_TEMPO, MAX_BAR_COUNT, MAX_BEATS_PER_BAR, MAX_INSTRUMENTS_PER_CHANNEL,
    MAX_MOD_CHANNELS, MAX_NOISE_CHANNELS, MAX_PATTERNS_PER_CHANNEL, MAX_PITCH_CHANNELS,
    MAX_TEMPO, MIN_BEATS_PER_BAR, MIN_PITCH_CHANNELS, MIN_TEMPO, SongError,
};

/// What kind of content a channel holds, derived from its index range
///
/// Channels are stored in one list ordered pitch, then noise, then mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pitch,
    Noise,
    Mod,
}

/// One channel: instruments, a pattern library, and a per-bar pattern map
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Octave shift applied to every note (pitch channels only)
    pub octave: u8,
    pub instruments: Vec<Instrument>,
    pub patterns: Vec<Pattern>,
    /// One entry per bar: a 1-based index into `patterns`, 0 = empty bar
    pub bars: Vec<u32>,
    pub muted: bool,
    pub name: String,
}

impl Channel {
    pub fn new(kind: ChannelKind, pattern_count: usize, bar_count: usize) -> Self {
        let instrument_kind = match kind {
            ChannelKind::Pitch => InstrumentType::Chip,
            ChannelKind::Noise => InstrumentType::Noise,
            ChannelKind::Mod => InstrumentType::Mod,
        };
        Self {
            octave: if kind == ChannelKind::Pitch { 3 } else { 0 },
            instruments: vec![Instrument::new(instrument_kind)],
            patterns: (0..pattern_count).map(|_| Pattern::new()).collect(),
            bars: vec![0; bar_count],
            muted: false,
            name: String::new(),
        }
    }

    /// The pattern mapped to `bar`, or `None` for an empty bar
    pub fn pattern_at_bar(&self, bar: usize) -> Option<&Pattern> {
        match self.bars.get(bar).copied().unwrap_or(0) {
            0 => None,
            index => self.patterns.get(index as usize - 1),
        }
    }
}

/// A complete composition
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub title: String,
    /// Scale preset index (which pitch classes the editor highlights)
    pub scale: u8,
    /// Key as a pitch class, 0..=11 (0 = C)
    pub key: u8,
    /// Beats per minute
    pub tempo: u32,
    pub beats_per_bar: u32,
    pub bar_count: usize,
    /// Patterns available per channel
    pub pattern_count: usize,
    /// Instruments available per channel
    pub instrument_count: usize,
    /// First bar of the loop region
    pub loop_start: usize,
    /// Length of the loop region in bars
    pub loop_length: usize,
    /// Master limiter drive, 0..=8 (5 = neutral)
    pub master_gain: u32,
    pub pitch_channel_count: usize,
    pub noise_channel_count: usize,
    pub mod_channel_count: usize,
    /// All channels, ordered pitch then noise then mod
    pub channels: Vec<Channel>,
}

impl Default for Song {
    fn default() -> Self {
        let mut song = Self {
            title: String::new(),
            scale: 0,
            key: 0,
            tempo: DEFAULT_TEMPO,
            beats_per_bar: 8,
            bar_count: 16,
            pattern_count: 8,
            instrument_count: 1,
            loop_start: 0,
            loop_length: 16,
            master_gain: 5,
            pitch_channel_count: 3,
            noise_channel_count: 1,
            mod_channel_count: 0,
            channels: Vec::new(),
        };
        song.rebuild_channels();
        song
    }
}

impl Song {
    /// Total channel count
    pub fn channel_count(&self) -> usize {
        self.pitch_channel_count + self.noise_channel_count + self.mod_channel_count
    }

    /// Kind of the channel at `index`, by position in the channel list
    pub fn channel_kind(&self, index: usize) -> ChannelKind {
        if index < self.pitch_channel_count {
            ChannelKind::Pitch
        } else if index < self.pitch_channel_count + self.noise_channel_count {
            ChannelKind::Noise
        } else {
            ChannelKind::Mod
        }
    }

    /// Parts in one bar at the current meter
    pub fn parts_per_bar(&self) -> i32 {
        parts_per_bar(self.beats_per_bar)
    }

    /// Rebuild the channel list to match the declared counts and sizes,
    /// preserving existing channels where they survive
    pub fn rebuild_channels(&mut self) {
        let total = self.channel_count();
        for index in 0..total {
            let kind = self.channel_kind(index);
            if index >= self.channels.len() {
                self.channels
                    .push(Channel::new(kind, self.pattern_count, self.bar_count));
            }
            let channel = &mut self.channels[index];
            channel.bars.resize(self.bar_count, 0);
            while channel.patterns.len() < self.pattern_count {
                channel.patterns.push(Pattern::new());
            }
            channel.patterns.truncate(self.pattern_count);
            let default_kind = match kind {
                ChannelKind::Pitch => InstrumentType::Chip,
                ChannelKind::Noise => InstrumentType::Noise,
                ChannelKind::Mod => InstrumentType::Mod,
            };
            while channel.instruments.len() < self.instrument_count {
                channel.instruments.push(Instrument::new(default_kind));
            }
        }
        self.channels.truncate(total);
    }

    /// Whether every count and index is inside its allowed range
    pub fn validate(&self) -> Result<(), SongError> {
        fn check(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), SongError> {
            if value < min || value > max {
                return Err(SongError::ValueOutOfRange { field, value });
            }
            Ok(())
        }
        check(
            "pitch channel count",
            self.pitch_channel_count as i64,
            MIN_PITCH_CHANNELS as i64,
            MAX_PITCH_CHANNELS as i64,
        )?;
        check(
            "noise channel count",
            self.noise_channel_count as i64,
            0,
            MAX_NOISE_CHANNELS as i64,
        )?;
        check(
            "mod channel count",
            self.mod_channel_count as i64,
            0,
            MAX_MOD_CHANNELS as i64,
        )?;
        check("tempo", self.tempo as i64, MIN_TEMPO as i64, MAX_TEMPO as i64)?;
        check(
            "beats per bar",
            self.beats_per_bar as i64,
            MIN_BEATS_PER_BAR as i64,
            MAX_BEATS_PER_BAR as i64,
        )?;
        check("bar count", self.bar_count as i64, 1, MAX_BAR_COUNT as i64)?;
        check(
            "pattern count",
            self.pattern_count as i64,
            1,
            MAX_PATTERNS_PER_CHANNEL as i64,
        )?;
        check(
            "instrument count",
            self.instrument_count as i64,
            1,
            MAX_INSTRUMENTS_PER_CHANNEL as i64,
        )?;
        check("loop start", self.loop_start as i64, 0, self.bar_count as i64 - 1)?;
        check(
            "loop length",
            self.loop_length as i64,
            1,
            (self.bar_count - self.loop_start) as i64,
        )?;
        Ok(())
    }

    /// Decode a song from its compact text form
    ///
    /// `Ok(None)` means the data carried a version this build does not
    /// understand, which is not an error: there is simply nothing to load.
    pub fn from_string(data: &str) -> Result<Option<Song>, SongError> {
        crate::codec::decode_song(data)
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::codec::encode_song(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_song_is_valid() {
        let song = Song::default();
        assert!(song.validate().is_ok());
        assert_eq!(song.channels.len(), 4);
        assert_eq!(song.channel_kind(0), ChannelKind::Pitch);
        assert_eq!(song.channel_kind(3), ChannelKind::Noise);
    }

    #[test]
    fn test_rebuild_preserves_and_resizes() {
        let mut song = Song::default();
        song.channels[0].name = "lead".to_string();
        song.bar_count = 32;
        song.mod_channel_count = 1;
        song.rebuild_channels();
        assert_eq!(song.channels.len(), 5);
        assert_eq!(song.channels[0].name, "lead");
        assert_eq!(song.channels[0].bars.len(), 32);
        assert_eq!(song.channel_kind(4), ChannelKind::Mod);
        assert_eq!(
            song.channels[4].instruments[0].kind,
            InstrumentType::Mod
        );
    }

    #[test]
    fn test_pattern_at_bar() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 2;
        assert!(song.channels[0].pattern_at_bar(0).is_some());
        assert!(song.channels[0].pattern_at_bar(1).is_none());
        // Out-of-range bars read as empty
        assert!(song.channels[0].pattern_at_bar(500).is_none());
    }

    #[test]
    fn test_validation_catches_bad_loop() {
        let mut song = Song::default();
        song.loop_start = 10;
        song.loop_length = 10;
        assert!(song.validate().is_err());
    }
}
