//! Note and pattern data structures

use smallvec::SmallVec;

use crate::{MAX_CHORD_PITCHES, PARTS_PER_BEAT};

/// A keyframe within a note
///
/// `time` is in parts relative to the note's start; `interval` is a pitch
/// offset in semitones from the note's base pitches; `size` is the note's
/// volume level at this keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotePin {
    pub interval: i32,
    pub time: i32,
    pub size: i32,
}

impl NotePin {
    pub fn new(interval: i32, time: i32, size: i32) -> Self {
        Self {
            interval,
            time,
            size,
        }
    }
}

/// One note: a chord of concurrent pitches shaped by a sequence of pins
///
/// Invariants: pins are strictly time-ascending, the first pin is at time 0
/// with interval 0, there are at least two pins, and the last pin's time
/// equals `end - start`.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Ordered set of concurrent pitches (a chord)
    pub pitches: SmallVec<[i32; MAX_CHORD_PITCHES]>,
    /// Volume/bend keyframes
    pub pins: Vec<NotePin>,
    /// Start time in parts from the beginning of the pattern
    pub start: i32,
    /// End time in parts
    pub end: i32,
    /// Seamlessly stitch to the previous pattern's trailing note
    pub continues_last_pattern: bool,
}

impl Note {
    /// Create a note with flat pins at the given size
    pub fn new(pitch: i32, start: i32, end: i32, size: i32) -> Self {
        let mut pitches = SmallVec::new();
        pitches.push(pitch);
        Self {
            pitches,
            pins: vec![NotePin::new(0, 0, size), NotePin::new(0, end - start, size)],
            start,
            end,
            continues_last_pattern: false,
        }
    }

    /// Duration in parts
    pub fn duration(&self) -> i32 {
        self.end - self.start
    }

    /// Interpolated (interval, size) at `time` parts into the note
    pub fn pin_values_at(&self, time: f64) -> (f64, f64) {
        let mut prev = self.pins[0];
        for &pin in &self.pins[1..] {
            if time <= pin.time as f64 {
                let span = (pin.time - prev.time) as f64;
                let t = if span > 0.0 {
                    (time - prev.time as f64) / span
                } else {
                    0.0
                };
                return (
                    prev.interval as f64 + (pin.interval - prev.interval) as f64 * t,
                    prev.size as f64 + (pin.size - prev.size) as f64 * t,
                );
            }
            prev = pin;
        }
        let last = self.pins[self.pins.len() - 1];
        (last.interval as f64, last.size as f64)
    }

    /// Check the structural invariants (pins ascending, first at zero, …)
    pub fn is_well_formed(&self) -> bool {
        if self.pins.len() < 2 || self.pitches.is_empty() {
            return false;
        }
        if self.pins[0].time != 0 || self.pins[0].interval != 0 {
            return false;
        }
        if self.pins[self.pins.len() - 1].time != self.duration() {
            return false;
        }
        self.pins.windows(2).all(|w| w[0].time < w[1].time)
    }
}

/// An ordered list of notes plus the instruments active in this pattern
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    /// Notes ordered by start time, non-overlapping per instrument timeline
    pub notes: Vec<Note>,
    /// Instrument indices layered in this pattern (at least one)
    pub instruments: Vec<u8>,
}

impl Pattern {
    pub fn new() -> Self {
        Self {
            notes: Vec::new(),
            instruments: vec![0],
        }
    }

    /// Find the note covering `part`, if any
    pub fn note_at(&self, part: i32) -> Option<usize> {
        self.notes
            .iter()
            .position(|n| n.start <= part && part < n.end)
    }

    /// Find the note ending exactly at `part`, if any
    pub fn note_ending_at(&self, part: i32) -> Option<usize> {
        self.notes.iter().position(|n| n.end == part)
    }

    /// Find the note starting exactly at `part`, if any
    pub fn note_starting_at(&self, part: i32) -> Option<usize> {
        self.notes.iter().position(|n| n.start == part)
    }
}

/// Total parts in one bar for the given beat count
pub(crate) fn parts_per_bar(beats_per_bar: u32) -> i32 {
    (beats_per_bar * PARTS_PER_BEAT) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_note_is_well_formed() {
        let note = Note::new(40, 0, 24, 3);
        assert!(note.is_well_formed());
        assert_eq!(note.duration(), 24);
    }

    #[test]
    fn test_pin_interpolation() {
        let mut note = Note::new(40, 0, 24, 0);
        note.pins = vec![
            NotePin::new(0, 0, 0),
            NotePin::new(4, 12, 6),
            NotePin::new(4, 24, 3),
        ];
        let (interval, size) = note.pin_values_at(6.0);
        assert!((interval - 2.0).abs() < 1e-9);
        assert!((size - 3.0).abs() < 1e-9);
        let (interval, size) = note.pin_values_at(18.0);
        assert!((interval - 4.0).abs() < 1e-9);
        assert!((size - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_misordered_pins_are_rejected() {
        let mut note = Note::new(40, 0, 24, 3);
        note.pins = vec![NotePin::new(0, 0, 3), NotePin::new(0, 30, 3)];
        assert!(!note.is_well_formed());
        note.pins = vec![NotePin::new(0, 4, 3), NotePin::new(0, 24, 3)];
        assert!(!note.is_well_formed());
    }

    #[test]
    fn test_note_lookup_in_pattern() {
        let mut pattern = Pattern::new();
        pattern.notes.push(Note::new(40, 0, 24, 3));
        pattern.notes.push(Note::new(45, 24, 48, 3));
        assert_eq!(pattern.note_at(0), Some(0));
        assert_eq!(pattern.note_at(23), Some(0));
        assert_eq!(pattern.note_at(24), Some(1));
        assert_eq!(pattern.note_at(48), None);
        assert_eq!(pattern.note_ending_at(24), Some(0));
        assert_eq!(pattern.note_starting_at(24), Some(1));
    }
}
