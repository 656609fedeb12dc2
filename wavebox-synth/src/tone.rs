//! Tone voices and the tone pool
//!
//! A tone is one sounding voice: the union of every kernel's oscillator
//! state plus the per-tick parameter targets the scheduler computes for it.
//! Tones are pooled; starting a note reuses a previously released tone's
//! allocation (pin buffer, filter vector, string delay lines), so steady
//! state rendering performs no heap allocation.

use wavebox_song::{FilterCoefficients, MAX_CHORD_PITCHES, MAX_FILTER_POINTS, NotePin};

use crate::filtering::DynamicBiquadFilter;
use crate::kernels::string::PickedString;

/// Lifecycle: a pooled tone is invisible; an active tone tracks a note; a
/// released tone fades out for its instrument's fade-out duration and then
/// returns to the pool.
#[derive(Debug, Clone)]
pub struct Tone {
    pub channel: usize,
    pub instrument_index: usize,

    /// Chord pitches this tone voices
    pub pitches: [i32; MAX_CHORD_PITCHES],
    pub pitch_count: usize,
    /// Copy of the driving note's pins (reused buffer)
    pub pins: Vec<NotePin>,
    /// Note start/end in parts within the bar
    pub note_start: i32,
    pub note_end: i32,
    /// For strummed chords: which chord voice this tone is
    pub strum_voice: usize,

    pub ticks_alive: u32,
    pub seconds_alive: f64,
    pub released: bool,
    pub ticks_since_release: u32,
    /// Ticks of fade-out remaining once released
    pub release_ticks_total: u32,
    pub arpeggio_index: u32,
    /// Pitch this tone is sliding away from, and the tick the slide began
    pub slide_from: Option<(i32, u32)>,

    // Per-tick parameter targets (start, end), written by the scheduler and
    // interpolated per sample by the kernels
    pub expression: (f64, f64),
    /// Phase step per sample in wavetable cycles, one per unison voice
    pub phase_deltas: [(f64, f64); 2],
    pub pulse_width: (f64, f64),
    pub fm_phase_deltas: [(f64, f64); 4],
    pub fm_amplitudes: [(f64, f64); 4],
    pub fm_feedback: (f64, f64),
    /// One-pole smoothing coefficient for the noise kernels
    pub noise_smoothing: (f64, f64),
    /// Loop damping for the picked string, 0..1 per sample
    pub string_damping: (f64, f64),
    /// Picked string loop gain, just below 1
    pub string_feedback: (f64, f64),
    /// Target delay-line period per string voice, in samples
    pub string_periods: [f64; 2],

    // Oscillator state, persisted across runs and across seamless handoffs
    pub phases: [f64; 2],
    pub fm_phases: [f64; 4],
    pub fm_prev_outputs: [f64; 4],
    pub noise_values: [f64; 2],
    pub strings: [PickedString; 2],
    pub note_filters: Vec<DynamicBiquadFilter>,
    pub note_filter_count: usize,
    /// Last tick's target coefficients, the start point of the next glide
    pub note_filter_targets: [FilterCoefficients; MAX_FILTER_POINTS],
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            channel: 0,
            instrument_index: 0,
            pitches: [0; MAX_CHORD_PITCHES],
            pitch_count: 0,
            pins: Vec::new(),
            note_start: 0,
            note_end: 0,
            strum_voice: 0,
            ticks_alive: 0,
            seconds_alive: 0.0,
            released: false,
            ticks_since_release: 0,
            release_ticks_total: 0,
            arpeggio_index: 0,
            slide_from: None,
            expression: (0.0, 0.0),
            phase_deltas: [(0.0, 0.0); 2],
            pulse_width: (0.25, 0.25),
            fm_phase_deltas: [(0.0, 0.0); 4],
            fm_amplitudes: [(0.0, 0.0); 4],
            fm_feedback: (0.0, 0.0),
            noise_smoothing: (1.0, 1.0),
            string_damping: (0.5, 0.5),
            string_feedback: (0.99, 0.99),
            string_periods: [0.0; 2],
            phases: [0.0; 2],
            fm_phases: [0.0; 4],
            fm_prev_outputs: [0.0; 4],
            noise_values: [0.0; 2],
            strings: [PickedString::default(), PickedString::default()],
            note_filters: vec![DynamicBiquadFilter::new(); MAX_FILTER_POINTS],
            note_filter_count: 0,
            note_filter_targets: [FilterCoefficients::default(); MAX_FILTER_POINTS],
        }
    }
}

impl Tone {
    /// Prepare a pooled tone for a fresh note, clearing oscillator state but
    /// keeping allocations
    pub fn reset(&mut self, channel: usize, instrument_index: usize) {
        self.channel = channel;
        self.instrument_index = instrument_index;
        self.pitch_count = 0;
        self.pins.clear();
        self.strum_voice = 0;
        self.ticks_alive = 0;
        self.seconds_alive = 0.0;
        self.released = false;
        self.ticks_since_release = 0;
        self.release_ticks_total = 0;
        self.arpeggio_index = 0;
        self.slide_from = None;
        self.phases = [0.0; 2];
        self.fm_phases = [0.0; 4];
        self.fm_prev_outputs = [0.0; 4];
        self.noise_values = [0.0; 2];
        for string in &mut self.strings {
            string.clear();
        }
        for filter in &mut self.note_filters {
            filter.clear_state();
        }
        self.note_filter_count = 0;
        self.note_filter_targets = [FilterCoefficients::default(); MAX_FILTER_POINTS];
    }

    /// Seconds/beats clock advanced by the scheduler each tick
    pub fn advance_clock(&mut self, seconds_per_tick: f64) {
        self.ticks_alive += 1;
        self.seconds_alive += seconds_per_tick;
        if self.released {
            self.ticks_since_release += 1;
        }
    }

    /// Whether the fade-out has fully elapsed
    pub fn release_finished(&self) -> bool {
        self.released && self.ticks_since_release >= self.release_ticks_total
    }
}

/// Arena of tone voices with a free list
///
/// Indices stay stable for a tone's whole lifetime; the scheduler stores
/// them in per-instrument active/released lists.
#[derive(Debug, Default)]
pub struct TonePool {
    tones: Vec<Tone>,
    free: Vec<usize>,
}

impl TonePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a tone out of the pool, reusing a freed slot when available
    pub fn acquire(&mut self, channel: usize, instrument_index: usize) -> usize {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.tones.push(Tone::default());
                self.tones.len() - 1
            }
        };
        self.tones[index].reset(channel, instrument_index);
        index
    }

    /// Return a tone to the pool
    pub fn release(&mut self, index: usize) {
        debug_assert!(!self.free.contains(&index));
        self.free.push(index);
    }

    pub fn get(&self, index: usize) -> &Tone {
        &self.tones[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Tone {
        &mut self.tones[index]
    }

    /// Total voices ever allocated
    pub fn capacity(&self) -> usize {
        self.tones.len()
    }

    /// Voices currently checked out
    pub fn live_count(&self) -> usize {
        self.tones.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_released_slots() {
        let mut pool = TonePool::new();
        let first: Vec<usize> = (0..4).map(|_| pool.acquire(0, 0)).collect();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.live_count(), 4);
        for &index in &first {
            pool.release(index);
        }
        assert_eq!(pool.live_count(), 0);
        for _ in 0..4 {
            pool.acquire(1, 0);
        }
        // No new allocations: every voice came from the free list
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.live_count(), 4);
    }

    #[test]
    fn test_acquire_resets_state_but_keeps_buffers() {
        let mut pool = TonePool::new();
        let index = pool.acquire(0, 0);
        {
            let tone = pool.get_mut(index);
            tone.pins.push(wavebox_song::NotePin::new(0, 0, 3));
            tone.phases[0] = 0.7;
            tone.ticks_alive = 99;
        }
        pool.release(index);
        let again = pool.acquire(2, 1);
        assert_eq!(again, index);
        let tone = pool.get(again);
        assert_eq!(tone.channel, 2);
        assert!(tone.pins.is_empty());
        assert_eq!(tone.phases[0], 0.0);
        assert_eq!(tone.ticks_alive, 0);
    }

    #[test]
    fn test_release_clock() {
        let mut tone = Tone::default();
        tone.release_ticks_total = 3;
        tone.released = true;
        for _ in 0..3 {
            assert!(!tone.release_finished());
            tone.advance_clock(0.01);
        }
        assert!(tone.release_finished());
    }
}
