//! The rendering engine: transport, tick scheduler, and tone lifecycle
//!
//! Time runs bar → beat → part → tick. A tick is the atomic scheduling unit:
//! at each tick boundary the engine applies pending mod commands, reconciles
//! which tones are sounding, and computes start/end parameter targets; inside
//! a tick every parameter is linearly interpolated per sample. A render call
//! chops the caller's buffer into runs of `min(remaining buffer, remaining
//! tick)` samples, so ticks split across buffers without drift.

#[cfg(test)]
mod tests;

use tracing::debug;

use wavebox_song::{
    CHIP_WAVES, ChannelKind, ChordKind, DRUM_COUNT, ENVELOPES, EffectFlags, FADE_OUT_TICKS,
    FM_ALGORITHMS, FM_FEEDBACKS, FM_FREQUENCY_RATIOS, FilterSettings, Instrument, InstrumentType,
    MAX_CHORD_PITCHES, MAX_FILTER_POINTS, MAX_TEMPO, MIN_TEMPO, NOISE_WAVES, Note, NotePin,
    PARTS_PER_BEAT, Pattern, SLIDE_PARTS, STRUM_PARTS, Song, TICKS_PER_PART, Transition, UNISONS,
};

use crate::effects::{EffectParams, Limiter};
use crate::envelope::{EnvelopeClock, compute_envelopes, envelope_value};
use crate::instrument_state::{ChannelState, InstrumentState, ModCommand, build_channel_states, mod_command};
use crate::kernels::{chip, fm, noise, string};
use crate::tone::{Tone, TonePool};

/// Ticks in one beat
const TICKS_PER_BEAT: u32 = PARTS_PER_BEAT * TICKS_PER_PART;

/// Pitch 57 (A above middle C when pitch 0 is C0) sounds at 440Hz
fn pitch_to_hz(semitone: f64) -> f64 {
    440.0 * 2.0f64.powf((semitone - 57.0) / 12.0)
}

/// Noise pitches step by half an octave; the top pitch reads its table at
/// the native sample rate
fn noise_rate(pitch: f64) -> f64 {
    2.0f64.powf((pitch - 11.0) * 0.5)
}

/// Ticks per arpeggio step for a speed setting; each speed step roughly
/// halves the duration
fn arpeggio_step_ticks(speed: u8) -> u32 {
    (48u32 >> speed.min(5)).max(1)
}

/// Interpolate a tone's copied pins at `time` parts into the note
fn pin_values(pins: &[NotePin], time: f64) -> (f64, f64) {
    let Some(&first) = pins.first() else {
        return (0.0, 0.0);
    };
    let mut prev = first;
    for &pin in &pins[1..] {
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
    let last = pins[pins.len() - 1];
    (last.interval as f64, last.size as f64)
}

fn find_note(pattern: &Pattern, part: i32) -> Option<&Note> {
    pattern
        .notes
        .iter()
        .find(|note| note.start <= part && part < note.end)
}

/// Fixed per-tick context shared by every tone's target computation
struct TickContext {
    sample_rate: f64,
    tempo: f64,
    seconds_per_tick: f64,
    tick_samples: usize,
    /// Part position at the tick's start and end, bar-relative
    part: (f64, f64),
    octave: u8,
    key: u8,
    kind: ChannelKind,
}

// =============================================================================
// Engine state
// =============================================================================

/// All mutable rendering state, kept apart from the immutable `Song`
#[derive(Default)]
struct EngineState {
    bar: usize,
    /// Tick within the bar
    tick: u32,
    /// Whether the first tick of the current playback has begun
    started: bool,
    tick_samples_total: usize,
    tick_sample_countdown: usize,
    samples_per_tick: f64,
    tempo: f64,
    master_gain_override: Option<f64>,
    loop_repeats: u32,
    next_bar_requested: bool,
    channels: Vec<ChannelState>,
    pool: TonePool,
    limiter: Limiter,
    scratch: Vec<f32>,
    mod_commands: Vec<ModCommand>,
}

impl EngineState {
    /// Drop every live tone back into the pool
    fn flush_tones(&mut self) {
        for channel in &mut self.channels {
            for state in &mut channel.instruments {
                for index in state.active_tones.drain(..).chain(state.released_tones.drain(..)) {
                    self.pool.release(index);
                }
            }
        }
    }

    /// Render into `left`/`right`, returning true when the song played out
    fn render(
        &mut self,
        song: &Song,
        sample_rate: f64,
        enable_outro: bool,
        left: &mut [f32],
        right: &mut [f32],
    ) -> bool {
        let total = left.len().min(right.len());
        let mut offset = 0;
        let mut finished = false;
        while offset < total {
            if self.tick_sample_countdown == 0 {
                if self.begin_tick(song, sample_rate, enable_outro) {
                    finished = true;
                    break;
                }
            }
            let run = (total - offset).min(self.tick_sample_countdown);
            let tick_total = self.tick_samples_total.max(1) as f64;
            let done = (self.tick_samples_total - self.tick_sample_countdown) as f64;
            let span = (done / tick_total, (done + run as f64) / tick_total);
            self.render_run(song, offset, run, span, left, right);
            self.tick_sample_countdown -= run;
            offset += run;
        }

        let gain_setting = self
            .master_gain_override
            .unwrap_or(song.master_gain as f64);
        let master_gain = 2.0f64.powf((gain_setting - 5.0) / 2.0);
        self.limiter.process(master_gain, left, right);
        finished
    }

    /// Advance to the next tick and recompute every per-tick target
    fn begin_tick(&mut self, song: &Song, sample_rate: f64, enable_outro: bool) -> bool {
        let ticks_per_bar = song.beats_per_bar * TICKS_PER_BEAT;
        if self.started {
            self.tick += 1;
            if self.tick >= ticks_per_bar || self.next_bar_requested {
                self.tick = 0;
                self.next_bar_requested = false;
                if self.advance_bar(song, enable_outro) {
                    return true;
                }
            }
        } else {
            self.started = true;
        }

        // Mod channels run first so this tick's targets already see their
        // overrides
        let mut commands = std::mem::take(&mut self.mod_commands);
        commands.clear();
        self.collect_mod_commands(song, &mut commands);
        for &command in &commands {
            self.apply_mod_command(song, command);
        }
        self.mod_commands = commands;

        self.samples_per_tick =
            sample_rate * 60.0 / (self.tempo * (PARTS_PER_BEAT * TICKS_PER_PART) as f64);
        let tick_samples = (self.samples_per_tick.round() as usize).max(1);
        self.tick_samples_total = tick_samples;
        self.tick_sample_countdown = tick_samples;
        let seconds_per_tick = tick_samples as f64 / sample_rate;

        let part = (self.tick / TICKS_PER_PART) as i32;
        let parts_per_bar = (song.beats_per_bar * PARTS_PER_BEAT) as i32;

        for (c, channel) in song.channels.iter().enumerate() {
            if song.channel_kind(c) == ChannelKind::Mod {
                continue;
            }
            let pattern = channel.pattern_at_bar(self.bar);
            for ii in 0..channel.instruments.len() {
                // External edits can change the channel layout between
                // renders; stale runtime state is rebuilt by set_song
                if self
                    .channels
                    .get(c)
                    .is_none_or(|cs| cs.instruments.get(ii).is_none())
                {
                    continue;
                }
                let instrument = &channel.instruments[ii];
                let listed = pattern.is_some_and(|p| p.instruments.contains(&(ii as u8)));
                let note = if channel.muted || !listed {
                    None
                } else {
                    pattern.and_then(|p| find_note(p, part))
                };
                reconcile_tones(
                    &mut self.pool,
                    &mut self.channels[c].instruments[ii],
                    instrument,
                    note,
                    c,
                    ii,
                    part,
                    parts_per_bar,
                );
            }
        }

        for (c, channel) in song.channels.iter().enumerate() {
            let kind = song.channel_kind(c);
            if kind == ChannelKind::Mod {
                continue;
            }
            let ctx = TickContext {
                sample_rate,
                tempo: self.tempo,
                seconds_per_tick,
                tick_samples,
                part: (
                    self.tick as f64 / TICKS_PER_PART as f64,
                    (self.tick + 1) as f64 / TICKS_PER_PART as f64,
                ),
                octave: channel.octave,
                key: song.key,
                kind,
            };
            for ii in 0..channel.instruments.len() {
                if self
                    .channels
                    .get(c)
                    .is_none_or(|cs| cs.instruments.get(ii).is_none())
                {
                    continue;
                }
                update_instrument_tick(
                    &mut self.pool,
                    &mut self.channels[c].instruments[ii],
                    &channel.instruments[ii],
                    &ctx,
                );
            }
        }
        false
    }

    /// Move to the next bar, honoring the loop region; returns true once the
    /// song has played past its final bar
    fn advance_bar(&mut self, song: &Song, enable_outro: bool) -> bool {
        let loop_end = (song.loop_start + song.loop_length)
            .min(song.bar_count)
            .max(1);
        let next = self.bar + 1;
        if next >= loop_end && !enable_outro {
            self.loop_repeats += 1;
            self.bar = song.loop_start.min(song.bar_count.saturating_sub(1));
            return false;
        }
        if next >= song.bar_count {
            return true;
        }
        self.bar = next;
        false
    }

    fn collect_mod_commands(&self, song: &Song, out: &mut Vec<ModCommand>) {
        let part = (self.tick / TICKS_PER_PART) as i32;
        let part_f = self.tick as f64 / TICKS_PER_PART as f64;
        for (c, channel) in song.channels.iter().enumerate() {
            if song.channel_kind(c) != ChannelKind::Mod || channel.muted {
                continue;
            }
            let Some(pattern) = channel.pattern_at_bar(self.bar) else {
                continue;
            };
            for &ii in &pattern.instruments {
                let Some(instrument) = channel.instruments.get(ii as usize) else {
                    continue;
                };
                for note in pattern.notes.iter() {
                    if !(note.start <= part && part < note.end) {
                        continue;
                    }
                    let slot_index = note.pitches.first().copied().unwrap_or(0).max(0) as usize;
                    let Some(slot) = instrument.mod_slots.get(slot_index) else {
                        continue;
                    };
                    let (_, size) = note.pin_values_at(part_f - note.start as f64);
                    if let Some(command) = mod_command(slot, size) {
                        out.push(command);
                    }
                }
            }
        }
    }

    fn apply_mod_command(&mut self, song: &Song, command: ModCommand) {
        match command {
            ModCommand::SetTempo(value) => {
                self.tempo = value.clamp(MIN_TEMPO as f64, MAX_TEMPO as f64);
            }
            ModCommand::SetMasterGain(value) => {
                self.master_gain_override = Some(value);
            }
            ModCommand::SetInstrumentVolume {
                channel,
                instrument,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument) {
                    state.volume_override = Some(value);
                }
            }
            ModCommand::SetPan {
                channel,
                instrument,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument) {
                    state.pan_override = Some(value);
                }
            }
            ModCommand::SetEqFilterFreq {
                channel,
                instrument,
                point,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument)
                    && point < MAX_FILTER_POINTS
                {
                    state.eq_freq_overrides[point] = Some(value);
                }
            }
            ModCommand::SetEqFilterGain {
                channel,
                instrument,
                point,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument)
                    && point < MAX_FILTER_POINTS
                {
                    state.eq_gain_overrides[point] = Some(value);
                }
            }
            ModCommand::SetNoteFilterFreq {
                channel,
                instrument,
                point,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument)
                    && point < MAX_FILTER_POINTS
                {
                    state.note_freq_overrides[point] = Some(value);
                }
            }
            ModCommand::SetNoteFilterGain {
                channel,
                instrument,
                point,
                value,
            } => {
                if let Some(state) = self.instrument_state(channel, instrument)
                    && point < MAX_FILTER_POINTS
                {
                    state.note_gain_overrides[point] = Some(value);
                }
            }
            ModCommand::NextBar => {
                self.next_bar_requested = true;
            }
            ModCommand::ResetArpeggio {
                channel,
                instrument,
            } => {
                let speed = song
                    .channels
                    .get(channel)
                    .and_then(|ch| ch.instruments.get(instrument))
                    .map_or(4, |i| i.arpeggio_speed);
                let step_ticks = arpeggio_step_ticks(speed);
                if let Some(state) = self.channels.get(channel).and_then(|c| c.instruments.get(instrument)) {
                    for &index in &state.active_tones {
                        let tone = self.pool.get_mut(index);
                        tone.arpeggio_index = tone.ticks_alive / step_ticks;
                    }
                }
            }
        }
    }

    fn instrument_state(&mut self, channel: usize, instrument: usize) -> Option<&mut InstrumentState> {
        self.channels
            .get_mut(channel)?
            .instruments
            .get_mut(instrument)
    }

    /// Render one run (a tick or a fraction of one) for every instrument
    fn render_run(
        &mut self,
        song: &Song,
        offset: usize,
        run: usize,
        span: (f64, f64),
        left: &mut [f32],
        right: &mut [f32],
    ) {
        if self.scratch.len() < run {
            self.scratch.resize(run, 0.0);
        }
        let EngineState {
            channels,
            pool,
            scratch,
            ..
        } = self;
        let left_run = &mut left[offset..offset + run];
        let right_run = &mut right[offset..offset + run];

        for (c, channel) in song.channels.iter().enumerate() {
            if song.channel_kind(c) == ChannelKind::Mod {
                continue;
            }
            for (ii, instrument) in channel.instruments.iter().enumerate() {
                let Some(state) = channels.get_mut(c).and_then(|cs| cs.instruments.get_mut(ii))
                else {
                    continue;
                };
                let has_tones =
                    !state.active_tones.is_empty() || !state.released_tones.is_empty();
                if !has_tones && state.effects.is_silent() {
                    continue;
                }
                let buffer = &mut scratch[..run];
                buffer.fill(0.0);
                for &index in state.active_tones.iter().chain(state.released_tones.iter()) {
                    render_tone(pool.get_mut(index), instrument, state, buffer, span);
                }
                state
                    .effects
                    .process(instrument, &state.effect_params, span, buffer, left_run, right_run);
            }
        }
    }
}

/// Dispatch one tone to its instrument type's kernel
fn render_tone(
    tone: &mut Tone,
    instrument: &Instrument,
    state: &InstrumentState,
    buffer: &mut [f32],
    span: (f64, f64),
) {
    let unison = &UNISONS[(instrument.unison as usize).min(UNISONS.len() - 1)];
    match instrument.kind {
        InstrumentType::Chip | InstrumentType::Harmonics => {
            chip::render_wavetable(
                tone,
                &state.wavetable,
                unison.voices as usize,
                unison.sign,
                buffer,
                span,
            );
        }
        InstrumentType::PulseWidth => {
            chip::render_pulse(tone, &state.wavetable, buffer, span);
        }
        InstrumentType::Fm => {
            let algorithm =
                &FM_ALGORITHMS[(instrument.fm.algorithm as usize).min(FM_ALGORITHMS.len() - 1)];
            let feedback = &FM_FEEDBACKS
                [(instrument.fm.feedback_type as usize).min(FM_FEEDBACKS.len() - 1)];
            fm::render_fm(tone, algorithm, feedback, buffer, span);
        }
        InstrumentType::PickedString => {
            let periods = tone.string_periods;
            string::render_string(tone, unison.voices as usize, periods, unison.sign, buffer, span);
        }
        InstrumentType::Noise | InstrumentType::Spectrum => {
            noise::render_noise(tone, &state.wavetable, buffer, span);
        }
        InstrumentType::Drumset => {
            let voice = tone.strum_voice.min(tone.pitch_count.saturating_sub(1));
            let drum = (tone.pitches[voice].max(0) as usize).min(DRUM_COUNT - 1);
            if let Some(table) = state.drum_tables.get(drum) {
                noise::render_noise(tone, table, buffer, span);
            }
        }
        InstrumentType::Mod => {}
    }
}

// =============================================================================
// Tone lifecycle
// =============================================================================

fn release_tone(pool: &mut TonePool, state: &mut InstrumentState, instrument: &Instrument, index: usize) {
    let tone = pool.get_mut(index);
    tone.released = true;
    tone.ticks_since_release = 0;
    tone.release_ticks_total =
        FADE_OUT_TICKS[(instrument.fade_out as usize).min(FADE_OUT_TICKS.len() - 1)];
    state.released_tones.push(index);
}

fn release_active(pool: &mut TonePool, state: &mut InstrumentState, instrument: &Instrument) {
    while let Some(index) = state.active_tones.pop() {
        release_tone(pool, state, instrument, index);
    }
}

fn spawn_voice(
    pool: &mut TonePool,
    state: &mut InstrumentState,
    note: &Note,
    channel: usize,
    instrument_index: usize,
    voice: usize,
) {
    let index = pool.acquire(channel, instrument_index);
    let tone = pool.get_mut(index);
    let count = note.pitches.len().min(MAX_CHORD_PITCHES);
    for (slot, &pitch) in tone.pitches.iter_mut().zip(note.pitches.iter()) {
        *slot = pitch;
    }
    tone.pitch_count = count;
    tone.pins.extend_from_slice(&note.pins);
    tone.note_start = note.start;
    tone.note_end = note.end;
    tone.strum_voice = voice;
    state.active_tones.push(index);
}

/// How many tones a chord of `pitch_count` pitches wants under this chord
/// mode
fn chord_voice_count(instrument: &Instrument, pitch_count: usize) -> usize {
    match instrument.chord {
        ChordKind::Arpeggio => 1,
        ChordKind::Simultaneous | ChordKind::Strum => pitch_count.max(1),
    }
}

/// Whether a chord voice has reached its (strummed) start part
fn voice_started(instrument: &Instrument, note: &Note, voice: usize, part: i32) -> bool {
    match instrument.chord {
        ChordKind::Strum => part >= note.start + voice as i32 * STRUM_PARTS,
        _ => true,
    }
}

fn spawn_missing_voices(
    pool: &mut TonePool,
    state: &mut InstrumentState,
    instrument: &Instrument,
    note: &Note,
    channel: usize,
    instrument_index: usize,
    part: i32,
) {
    let wanted = chord_voice_count(instrument, note.pitches.len());
    for voice in 0..wanted {
        let present = state
            .active_tones
            .iter()
            .any(|&t| pool.get(t).strum_voice == voice);
        if !present && voice_started(instrument, note, voice, part) {
            spawn_voice(pool, state, note, channel, instrument_index, voice);
        }
    }
}

/// Hand the active tones over to a new note without resetting phase
///
/// A tone whose sounding pitch also appears in the new chord keeps that
/// pitch (matched-pitch reassignment); leftovers take the remaining chord
/// voices or get released.
fn retarget_tones(
    pool: &mut TonePool,
    state: &mut InstrumentState,
    instrument: &Instrument,
    note: &Note,
) {
    let wanted = chord_voice_count(instrument, note.pitches.len());
    let slide = instrument.transition == Transition::Slide;
    let mut assigned: [Option<usize>; MAX_CHORD_PITCHES] = [None; MAX_CHORD_PITCHES];

    for &index in state.active_tones.iter() {
        let tone = pool.get(index);
        let old_pitch = tone.pitches[tone.strum_voice.min(tone.pitch_count.saturating_sub(1))];
        for voice in 0..wanted {
            if assigned[voice].is_none() && note.pitches.get(voice) == Some(&old_pitch) {
                assigned[voice] = Some(index);
                break;
            }
        }
    }
    let mut extras = [0usize; MAX_CHORD_PITCHES];
    let mut extra_count = 0;
    for &index in state.active_tones.iter() {
        if assigned.iter().flatten().any(|&a| a == index) {
            continue;
        }
        match (0..wanted).find(|&voice| assigned[voice].is_none()) {
            Some(voice) => assigned[voice] = Some(index),
            None => {
                if extra_count < extras.len() {
                    extras[extra_count] = index;
                    extra_count += 1;
                }
            }
        }
    }

    state.active_tones.clear();
    let channel;
    let instrument_index;
    {
        // All retargeted tones share one origin
        let any = assigned.iter().flatten().next().copied().or(extras[..extra_count].first().copied());
        let probe = any.map(|i| pool.get(i));
        channel = probe.map_or(0, |t| t.channel);
        instrument_index = probe.map_or(0, |t| t.instrument_index);
    }
    for voice in 0..wanted {
        match assigned[voice] {
            Some(index) => {
                let tone = pool.get_mut(index);
                let old_pitch =
                    tone.pitches[tone.strum_voice.min(tone.pitch_count.saturating_sub(1))];
                let new_pitch = note.pitches.get(voice).copied().unwrap_or(old_pitch);
                if slide && new_pitch != old_pitch {
                    tone.slide_from = Some((old_pitch, tone.ticks_alive));
                }
                for (slot, &pitch) in tone.pitches.iter_mut().zip(note.pitches.iter()) {
                    *slot = pitch;
                }
                tone.pitch_count = note.pitches.len().min(MAX_CHORD_PITCHES);
                tone.pins.clear();
                tone.pins.extend_from_slice(&note.pins);
                tone.note_start = note.start;
                tone.note_end = note.end;
                tone.strum_voice = voice;
                state.active_tones.push(index);
            }
            None => {
                spawn_voice(pool, state, note, channel, instrument_index, voice);
            }
        }
    }
    for &index in &extras[..extra_count] {
        release_tone(pool, state, instrument, index);
    }
}

#[allow(clippy::too_many_arguments)]
fn reconcile_tones(
    pool: &mut TonePool,
    state: &mut InstrumentState,
    instrument: &Instrument,
    note: Option<&Note>,
    channel: usize,
    instrument_index: usize,
    part: i32,
    parts_per_bar: i32,
) {
    let Some(note) = note else {
        release_active(pool, state, instrument);
        return;
    };

    let voicing_current = state
        .active_tones
        .first()
        .is_some_and(|&t| pool.get(t).note_start == note.start && pool.get(t).note_end == note.end);
    if voicing_current {
        spawn_missing_voices(pool, state, instrument, note, channel, instrument_index, part);
        return;
    }

    let continuing = state.active_tones.first().is_some_and(|&t| {
        let tone = pool.get(t);
        (instrument.transition.is_seamless() && tone.note_end == note.start)
            || (note.continues_last_pattern
                && note.start == 0
                && tone.note_end == parts_per_bar)
    });

    if continuing {
        retarget_tones(pool, state, instrument, note);
    } else {
        release_active(pool, state, instrument);
        spawn_missing_voices(pool, state, instrument, note, channel, instrument_index, part);
    }
}

// =============================================================================
// Per-tick targets
// =============================================================================

fn update_instrument_tick(
    pool: &mut TonePool,
    state: &mut InstrumentState,
    instrument: &Instrument,
    ctx: &TickContext,
) {
    // Return fully faded tones to the pool
    let mut i = 0;
    while i < state.released_tones.len() {
        let index = state.released_tones[i];
        if pool.get(index).release_finished() {
            state.released_tones.swap_remove(i);
            pool.release(index);
        } else {
            i += 1;
        }
    }

    for i in 0..state.active_tones.len() + state.released_tones.len() {
        let index = if i < state.active_tones.len() {
            state.active_tones[i]
        } else {
            state.released_tones[i - state.active_tones.len()]
        };
        let tone = pool.get_mut(index);
        compute_tone_targets(tone, instrument, state, ctx);
        tone.advance_clock(ctx.seconds_per_tick);
    }

    compute_effect_params(state, instrument, ctx);
}

/// Glide a filter stack toward freshly designed coefficients for this tick
///
/// `targets` remembers the previous tick's end coefficients so consecutive
/// ticks chain smoothly; an all-default entry marks a filter that has not
/// run yet (real designs never produce `b0 == 0`).
#[allow(clippy::too_many_arguments)]
fn glide_filters(
    filters: &mut [crate::filtering::DynamicBiquadFilter],
    targets: &mut [wavebox_song::FilterCoefficients],
    settings: &FilterSettings,
    freq_overrides: &[Option<f64>],
    gain_overrides: &[Option<f64>],
    freq_env: &[(f64, f64)],
    gain_env: &[(f64, f64)],
    sample_rate: f64,
    tick_samples: usize,
) {
    for (i, point) in settings.points.iter().enumerate().take(MAX_FILTER_POINTS) {
        let freq_setting = freq_overrides[i].unwrap_or(point.freq as f64);
        let gain_setting = gain_overrides[i].unwrap_or(point.gain as f64);
        // Envelopes multiply in Hz / linear-gain space; the settings scales
        // are log2-based, so fold the multiplier in as a setting offset
        let freq_at = |mult: f64| freq_setting + 4.0 * mult.max(1e-6).log2();
        let gain_at = |mult: f64| gain_setting + 2.0 * mult.max(1e-6).log2();
        let end = point.to_coefficients(
            sample_rate,
            Some(freq_at(freq_env[i].1)),
            Some(gain_at(gain_env[i].1)),
        );
        let start = if targets[i].b0 == 0.0 {
            end
        } else {
            point.to_coefficients(
                sample_rate,
                Some(freq_at(freq_env[i].0)),
                Some(gain_at(gain_env[i].0)),
            )
        };
        filters[i].set_transition(&start, &end, tick_samples);
        targets[i] = end;
    }
}

fn compute_tone_targets(
    tone: &mut Tone,
    instrument: &Instrument,
    state: &InstrumentState,
    ctx: &TickContext,
) {
    let n = tone.pitch_count.max(1);
    let time = (
        ctx.part.0 - tone.note_start as f64,
        ctx.part.1 - tone.note_start as f64,
    );
    let (interval0, size0) = pin_values(&tone.pins, time.0);
    let (interval1, size1) = pin_values(&tone.pins, time.1);

    let seconds = (tone.seconds_alive, tone.seconds_alive + ctx.seconds_per_tick);
    let beats = (seconds.0 * ctx.tempo / 60.0, seconds.1 * ctx.tempo / 60.0);
    let clock = EnvelopeClock {
        seconds,
        beats,
        note_size: (
            EnvelopeClock::normalize_size(size0),
            EnvelopeClock::normalize_size(size1),
        ),
    };
    let env = compute_envelopes(instrument, &clock);

    // Which chord pitch this tone is sounding right now
    let voice = if instrument.chord == ChordKind::Arpeggio && n > 1 {
        let step_ticks = arpeggio_step_ticks(instrument.arpeggio_speed);
        let step = tone.ticks_alive / step_ticks;
        step.wrapping_sub(tone.arpeggio_index) as usize % n
    } else {
        tone.strum_voice.min(n - 1)
    };
    let mut base = tone.pitches[voice] as f64;
    if let Some((from, start_tick)) = tone.slide_from {
        let slide_ticks = (SLIDE_PARTS as u32 * TICKS_PER_PART) as f64;
        let progress = tone.ticks_alive.saturating_sub(start_tick) as f64 / slide_ticks;
        if progress >= 1.0 {
            tone.slide_from = None;
        } else {
            base += (from as f64 - base) * (1.0 - progress);
        }
    }

    let vibrato_ready =
        tone.ticks_alive >= instrument.vibrato.delay_parts() as u32 * TICKS_PER_PART;
    let vibrato_at = |s: f64, depth_env: f64| {
        if vibrato_ready {
            instrument.vibrato.depth()
                * depth_env
                * (std::f64::consts::TAU * s * instrument.vibrato.speed()).sin()
        } else {
            0.0
        }
    };
    let vibrato = (
        vibrato_at(seconds.0, env.vibrato_depth.0),
        vibrato_at(seconds.1, env.vibrato_depth.1),
    );

    let mut expression = (
        clock.note_size.0 * env.note_volume.0,
        clock.note_size.1 * env.note_volume.1,
    );
    if n > 1 && instrument.chord != ChordKind::Arpeggio {
        let scale = 1.0 / ((n - 1) as f64 * 0.25 + 1.0);
        expression.0 *= scale;
        expression.1 *= scale;
    }
    if tone.released {
        let total = tone.release_ticks_total.max(1) as f64;
        expression.0 *= (1.0 - tone.ticks_since_release as f64 / total).max(0.0);
        expression.1 *= (1.0 - (tone.ticks_since_release + 1) as f64 / total).max(0.0);
    }

    match ctx.kind {
        ChannelKind::Pitch => {
            let offset = ctx.octave as f64 * 12.0 + ctx.key as f64;
            let hz = (
                pitch_to_hz(base + interval0 + vibrato.0 + offset) * env.pitch_shift.0,
                pitch_to_hz(base + interval1 + vibrato.1 + offset) * env.pitch_shift.1,
            );
            let unison = &UNISONS[(instrument.unison as usize).min(UNISONS.len() - 1)];
            match instrument.kind {
                InstrumentType::Chip | InstrumentType::Harmonics => {
                    let length = state.wavetable.len().saturating_sub(1).max(1) as f64;
                    let delta = |hz: f64, semis: f64| {
                        hz * 2.0f64.powf(semis / 12.0) * length / ctx.sample_rate
                    };
                    tone.phase_deltas[0] = (
                        delta(hz.0, unison.offset + unison.spread),
                        delta(hz.1, unison.offset + unison.spread),
                    );
                    tone.phase_deltas[1] = (
                        delta(hz.0, unison.offset - unison.spread),
                        delta(hz.1, unison.offset - unison.spread),
                    );
                    expression.0 *= unison.expression;
                    expression.1 *= unison.expression;
                    if instrument.kind == InstrumentType::Chip {
                        let wave =
                            &CHIP_WAVES[(instrument.chip_wave as usize).min(CHIP_WAVES.len() - 1)];
                        expression.0 *= wave.expression;
                        expression.1 *= wave.expression;
                    }
                }
                InstrumentType::PulseWidth => {
                    let length = state.wavetable.len().saturating_sub(1).max(1) as f64;
                    tone.phase_deltas[0] = (
                        hz.0 * length / ctx.sample_rate,
                        hz.1 * length / ctx.sample_rate,
                    );
                    let width = instrument.pulse_width as f64 / 100.0;
                    tone.pulse_width = (
                        (width * env.pulse_width.0).clamp(0.01, 0.5),
                        (width * env.pulse_width.1).clamp(0.01, 0.5),
                    );
                }
                InstrumentType::Fm => {
                    for op in 0..4 {
                        let operator = &instrument.fm.operators[op];
                        let ratio = FM_FREQUENCY_RATIOS
                            [(operator.frequency as usize).min(FM_FREQUENCY_RATIOS.len() - 1)];
                        tone.fm_phase_deltas[op] = (
                            hz.0 * ratio / ctx.sample_rate * env.fm_frequency[op].0,
                            hz.1 * ratio / ctx.sample_rate * env.fm_frequency[op].1,
                        );
                        let amplitude = operator.amplitude as f64 / 15.0;
                        tone.fm_amplitudes[op] = (
                            amplitude * env.fm_amplitude[op].0,
                            amplitude * env.fm_amplitude[op].1,
                        );
                    }
                    let feedback = instrument.fm.feedback_amplitude as f64 / 15.0;
                    tone.fm_feedback = (
                        feedback * env.feedback_amplitude.0,
                        feedback * env.feedback_amplitude.1,
                    );
                }
                InstrumentType::PickedString => {
                    let period = |hz: f64, semis: f64| {
                        ctx.sample_rate / (hz * 2.0f64.powf(semis / 12.0)).max(1.0)
                    };
                    tone.string_periods = [
                        period(hz.0, unison.offset + unison.spread),
                        period(hz.0, unison.offset - unison.spread),
                    ];
                    let sustain = instrument.string_sustain as f64 / 10.0;
                    let level = (
                        (sustain * env.string_sustain.0).clamp(0.0, 1.0),
                        (sustain * env.string_sustain.1).clamp(0.0, 1.0),
                    );
                    tone.string_feedback = (
                        (0.88 + 0.11 * level.0).min(0.999),
                        (0.88 + 0.11 * level.1).min(0.999),
                    );
                    tone.string_damping = (0.2 + 0.6 * level.0, 0.2 + 0.6 * level.1);
                    expression.0 *= unison.expression;
                    expression.1 *= unison.expression;
                }
                _ => {}
            }
        }
        ChannelKind::Noise => {
            let rate = (
                noise_rate(base + interval0) * env.pitch_shift.0,
                noise_rate(base + interval1) * env.pitch_shift.1,
            );
            match instrument.kind {
                InstrumentType::Noise => {
                    let wave =
                        &NOISE_WAVES[(instrument.noise_wave as usize).min(NOISE_WAVES.len() - 1)];
                    tone.phase_deltas[0] = rate;
                    let cap = if wave.is_soft { 0.5 } else { 1.0 };
                    tone.noise_smoothing = (
                        (rate.0 * wave.pitch_filter_mult).clamp(0.0, cap),
                        (rate.1 * wave.pitch_filter_mult).clamp(0.0, cap),
                    );
                    expression.0 *= wave.expression;
                    expression.1 *= wave.expression;
                }
                InstrumentType::Spectrum => {
                    tone.phase_deltas[0] = rate;
                    tone.noise_smoothing = (rate.0.clamp(0.0, 1.0), rate.1.clamp(0.0, 1.0));
                    expression.0 *= 0.3;
                    expression.1 *= 0.3;
                }
                InstrumentType::Drumset => {
                    tone.phase_deltas[0] = (1.0, 1.0);
                    tone.noise_smoothing = (1.0, 1.0);
                    let drum = (tone.pitches[voice].max(0) as usize).min(DRUM_COUNT - 1);
                    let preset = &ENVELOPES[(instrument.drumset.envelopes[drum] as usize)
                        .min(ENVELOPES.len() - 1)];
                    expression.0 *= envelope_value(
                        preset.curve,
                        preset.speed,
                        seconds.0,
                        beats.0,
                        clock.note_size.0,
                    );
                    expression.1 *= envelope_value(
                        preset.curve,
                        preset.speed,
                        seconds.1,
                        beats.1,
                        clock.note_size.1,
                    );
                }
                _ => {}
            }
        }
        ChannelKind::Mod => {}
    }

    tone.expression = expression;

    if instrument.effects.contains(EffectFlags::NOTE_FILTER) {
        let point_count = instrument.note_filter.points.len().min(MAX_FILTER_POINTS);
        glide_filters(
            &mut tone.note_filters,
            &mut tone.note_filter_targets,
            &instrument.note_filter,
            &state.note_freq_overrides,
            &state.note_gain_overrides,
            &env.note_filter_freq,
            &env.note_filter_gain,
            ctx.sample_rate,
            ctx.tick_samples,
        );
        tone.note_filter_count = point_count;
    } else {
        tone.note_filter_count = 0;
    }
}

/// Unity envelope pairs for filter stacks without envelope bindings
const UNIT_ENV: [(f64, f64); MAX_FILTER_POINTS] = [(1.0, 1.0); MAX_FILTER_POINTS];

fn compute_effect_params(state: &mut InstrumentState, instrument: &Instrument, ctx: &TickContext) {
    let volume_setting = state.volume_override.unwrap_or(instrument.volume as f64);
    let mut volume = if volume_setting <= -25.0 {
        0.0
    } else {
        2.0f64.powf(volume_setting / 10.0)
    };
    if instrument.effects.contains(EffectFlags::NOTE_FILTER) {
        volume *= instrument.note_filter.volume_compensation(ctx.sample_rate);
    }
    let pan = state.pan_override.unwrap_or(instrument.pan as f64) / 100.0;

    let previous = state.effect_params.clone();
    state.effect_params = EffectParams {
        volume: (previous.volume.1, volume),
        distortion: (
            previous.distortion.1,
            instrument.distortion as f64 / 7.0 * 0.9,
        ),
        crush_rate: (
            previous.crush_rate.1,
            2.0f64.powf(-(instrument.bitcrusher_freq as f64) * 0.6),
        ),
        crush_scale: (
            previous.crush_scale.1,
            2.0f64.powf(7.0 - instrument.bitcrusher_quantization as f64),
        ),
        pan: (previous.pan.1, pan.clamp(0.0, 1.0)),
        chorus: (previous.chorus.1, instrument.chorus as f64 / 7.0),
        echo_feedback: (
            previous.echo_feedback.1,
            instrument.echo_sustain as f64 / 7.0 * 0.9,
        ),
        reverb: (previous.reverb.1, instrument.reverb as f64 / 11.0),
    };
    if instrument.effects.contains(EffectFlags::ECHO) {
        let samples_per_half_beat = ctx.sample_rate * 60.0 / (ctx.tempo * 2.0);
        state
            .effects
            .set_echo_delay(((instrument.echo_delay as f64 + 1.0) * samples_per_half_beat) as usize);
    }

    let eq_count = instrument.eq_filter.points.len().min(MAX_FILTER_POINTS);
    if eq_count > 0 {
        let InstrumentState {
            effects,
            eq_targets,
            eq_freq_overrides,
            eq_gain_overrides,
            ..
        } = state;
        glide_filters(
            &mut effects.eq_filters,
            eq_targets,
            &instrument.eq_filter,
            eq_freq_overrides,
            eq_gain_overrides,
            &UNIT_ENV,
            &UNIT_ENV,
            ctx.sample_rate,
            ctx.tick_samples,
        );
        effects.eq_count = eq_count;
    } else {
        state.effects.eq_count = 0;
    }
}

// =============================================================================
// Public interface
// =============================================================================

/// A complete software synthesizer for one song
///
/// Owns all rendering state; `synthesize` fills caller-provided stereo
/// slices synchronously and performs no allocation in steady state. The
/// song may be swapped or edited between calls.
pub struct Synth {
    sample_rate: f64,
    song: Option<Song>,
    playing: bool,
    enable_intro: bool,
    enable_outro: bool,
    state: EngineState,
}

impl Synth {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            song: None,
            playing: false,
            enable_intro: true,
            enable_outro: true,
            state: EngineState {
                tempo: wavebox_song::DEFAULT_TEMPO as f64,
                ..EngineState::default()
            },
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Install a song, resetting playback to the start
    pub fn set_song(&mut self, song: Song) {
        debug!(
            title = song.title.as_str(),
            tempo = song.tempo,
            bars = song.bar_count,
            "song loaded"
        );
        self.state.flush_tones();
        self.state.channels = build_channel_states(&song, self.sample_rate);
        self.state.tempo = song.tempo as f64;
        self.state.master_gain_override = None;
        self.state.loop_repeats = 0;
        self.song = Some(song);
        self.rewind();
    }

    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    /// Mute or unmute a channel; takes effect at the next tick
    pub fn set_muted(&mut self, channel: usize, muted: bool) {
        if let Some(song) = self.song.as_mut()
            && let Some(channel) = song.channels.get_mut(channel)
        {
            channel.muted = muted;
        }
    }

    pub fn set_intro_enabled(&mut self, enabled: bool) {
        self.enable_intro = enabled;
    }

    pub fn set_outro_enabled(&mut self, enabled: bool) {
        self.enable_outro = enabled;
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    /// Completed passes through the loop region
    pub fn loop_repeat_count(&self) -> u32 {
        self.state.loop_repeats
    }

    pub fn current_bar(&self) -> usize {
        self.state.bar
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    /// Stop rendering, leaving every tone and delay line resumable
    pub fn pause(&mut self) {
        self.playing = false;
    }

    /// Jump back to the song's beginning (or the loop start when the intro
    /// is disabled)
    pub fn snap_to_start(&mut self) {
        let start = match &self.song {
            Some(song) if !self.enable_intro => song.loop_start.min(song.bar_count.saturating_sub(1)),
            _ => 0,
        };
        self.seek_to_bar(start);
        self.state.loop_repeats = 0;
    }

    /// Jump to a bar, cutting all sounding tones
    pub fn seek_to_bar(&mut self, bar: usize) {
        let limit = self.song.as_ref().map_or(0, |s| s.bar_count.saturating_sub(1));
        self.state.bar = bar.min(limit);
        self.state.tick = 0;
        self.state.started = false;
        self.state.tick_sample_countdown = 0;
        self.state.tick_samples_total = 0;
        self.state.next_bar_requested = false;
        self.state.master_gain_override = None;
        if let Some(song) = &self.song {
            self.state.tempo = song.tempo as f64;
        }
        self.state.flush_tones();
        for channel in &mut self.state.channels {
            for state in &mut channel.instruments {
                state.clear_overrides();
            }
        }
    }

    pub fn go_to_next_bar(&mut self) {
        let bar = self.state.bar + 1;
        self.seek_to_bar(bar);
    }

    pub fn go_to_prev_bar(&mut self) {
        let bar = self.state.bar.saturating_sub(1);
        self.seek_to_bar(bar);
    }

    fn rewind(&mut self) {
        let start = match &self.song {
            Some(_) if self.enable_intro => 0,
            Some(song) => song.loop_start.min(song.bar_count.saturating_sub(1)),
            None => 0,
        };
        self.seek_to_bar(start);
    }

    /// Fill the stereo slices with the next `left.len()` samples
    ///
    /// Both slices must be the same length. When paused or without a song
    /// the output is silence and no state advances.
    pub fn synthesize(&mut self, left: &mut [f32], right: &mut [f32]) {
        debug_assert_eq!(left.len(), right.len());
        left.fill(0.0);
        right.fill(0.0);
        let Some(song) = &self.song else {
            return;
        };
        if !self.playing {
            return;
        }
        let finished = self
            .state
            .render(song, self.sample_rate, self.enable_outro, left, right);
        if finished {
            debug!("song finished");
            self.playing = false;
            self.rewind();
        }
    }
}
