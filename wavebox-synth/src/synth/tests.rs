use super::*;

use wavebox_song::{FilterControlPoint, FilterType, ModSlot, ModTarget};

const SAMPLE_RATE: f64 = 48000.0;

fn render(synth: &mut Synth, samples: usize) -> (Vec<f32>, Vec<f32>) {
    let mut left = vec![0.0f32; samples];
    let mut right = vec![0.0f32; samples];
    synth.synthesize(&mut left, &mut right);
    (left, right)
}

fn song_with_chip_note() -> Song {
    let mut song = Song::default();
    song.channels[0].patterns[0].notes.push(Note::new(48, 0, 24, 3));
    song.channels[0].bars[0] = 1;
    song
}

#[test]
fn test_chip_note_renders_nonsilent_nonclipping() {
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song_with_chip_note());
    synth.play();
    let (left, right) = render(&mut synth, 8192);
    let peak = left
        .iter()
        .chain(right.iter())
        .fold(0.0f32, |p, &s| p.max(s.abs()));
    assert!(peak > 0.01, "note rendered silence");
    assert!(peak <= 1.2, "output clipped: {peak}");
    assert!(left.iter().all(|s| s.is_finite()));
}

#[test]
fn test_silence_without_a_song_or_when_paused() {
    let mut synth = Synth::new(SAMPLE_RATE);
    let (left, _) = render(&mut synth, 256);
    assert!(left.iter().all(|&s| s == 0.0));

    synth.set_song(song_with_chip_note());
    // A song alone does not start playback
    let (left, _) = render(&mut synth, 256);
    assert!(left.iter().all(|&s| s == 0.0));

    synth.play();
    let tick_before = synth.state.tick;
    synth.pause();
    let (left, _) = render(&mut synth, 256);
    assert!(left.iter().all(|&s| s == 0.0));
    assert_eq!(synth.state.tick, tick_before, "pause advanced the clock");
}

#[test]
fn test_pool_empties_after_the_note_fades() {
    let mut song = Song::default();
    song.channels[0].patterns[0].notes.push(Note::new(48, 0, 6, 3));
    song.channels[0].bars[0] = 1;
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song);
    synth.play();
    // A full bar at 150 BPM is well past the note plus its fade-out
    let bar_samples = (SAMPLE_RATE * 60.0 / 150.0 * 8.0) as usize;
    render(&mut synth, bar_samples + 4096);
    assert_eq!(synth.state.pool.live_count(), 0);
    // One note, one chord voice: the pool never needed a second slot
    assert_eq!(synth.state.pool.capacity(), 1);
}

#[test]
fn test_seamless_transition_reuses_the_voice() {
    let mut song = Song::default();
    song.channels[0].instruments[0].transition = Transition::Seamless;
    song.channels[0].patterns[0].notes.push(Note::new(48, 0, 12, 3));
    song.channels[0].patterns[0].notes.push(Note::new(50, 12, 24, 3));
    song.channels[0].bars[0] = 1;
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song);
    synth.play();
    // Render through the note boundary at part 12
    let boundary_samples = (SAMPLE_RATE * 60.0 / 150.0 / 24.0 * 14.0) as usize;
    render(&mut synth, boundary_samples);
    // The second note took over the first note's tone without a retrigger
    assert_eq!(synth.state.pool.capacity(), 1);
    assert_eq!(synth.state.pool.live_count(), 1);
    let state = &synth.state.channels[0].instruments[0];
    assert_eq!(state.active_tones.len(), 1);
    let tone = synth.state.pool.get(state.active_tones[0]);
    assert_eq!(tone.pitches[0], 50);
    assert!(tone.phases[0] != 0.0, "phase was reset at the boundary");
    // A retriggered tone would have restarted its clock at part 12
    assert!(tone.ticks_alive > 24, "tone was retriggered: {}", tone.ticks_alive);
}

#[test]
fn test_mod_note_retargets_eq_filter_within_one_tick() {
    let mut song = Song::default();
    song.mod_channel_count = 1;
    song.rebuild_channels();
    song.channels[0].instruments[0]
        .eq_filter
        .points
        .push(FilterControlPoint::new(FilterType::LowPass, 20, 7));
    let mod_channel = song.channels.len() - 1;
    song.channels[mod_channel].instruments[0].mod_slots[0] = ModSlot {
        target: ModTarget::EqFilterFreq,
        channel: 0,
        instrument: 0,
        point: 0,
    };
    song.channels[mod_channel].patterns[0].notes.push(Note::new(0, 0, 24, 42));
    song.channels[mod_channel].bars[0] = 1;

    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song);
    synth.play();
    // One small buffer is enough: the first tick boundary runs immediately
    render(&mut synth, 64);
    let state = &synth.state.channels[0].instruments[0];
    let expected = 42.0 / 63.0 * 33.0;
    let value = state.eq_freq_overrides[0].expect("override not applied");
    assert!((value - expected).abs() < 1e-9, "{value} != {expected}");
}

#[test]
fn test_loop_wraps_and_counts_repeats() {
    let mut song = song_with_chip_note();
    song.loop_start = 0;
    song.loop_length = 1;
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_outro_enabled(false);
    synth.set_song(song);
    synth.play();
    let bar_samples = (SAMPLE_RATE * 60.0 / 150.0 * 8.0) as usize;
    render(&mut synth, bar_samples * 2 + 4096);
    assert!(synth.loop_repeat_count() >= 2);
    assert_eq!(synth.current_bar(), 0);
    assert!(synth.playing());
}

#[test]
fn test_outro_plays_to_the_end_and_stops() {
    let mut song = song_with_chip_note();
    song.bar_count = 2;
    song.loop_start = 0;
    song.loop_length = 1;
    for channel in &mut song.channels {
        channel.bars.truncate(2);
    }
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_outro_enabled(true);
    synth.set_song(song);
    synth.play();
    let bar_samples = (SAMPLE_RATE * 60.0 / 150.0 * 8.0) as usize;
    render(&mut synth, bar_samples * 3);
    assert!(!synth.playing(), "song should stop after the final bar");
}

#[test]
fn test_transport_seeks() {
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song_with_chip_note());
    synth.seek_to_bar(5);
    assert_eq!(synth.current_bar(), 5);
    synth.go_to_next_bar();
    assert_eq!(synth.current_bar(), 6);
    synth.go_to_prev_bar();
    assert_eq!(synth.current_bar(), 5);
    synth.snap_to_start();
    assert_eq!(synth.current_bar(), 0);
    // Seeking never leaves tones behind
    assert_eq!(synth.state.pool.live_count(), 0);
}

#[test]
fn test_muted_channel_is_silent() {
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song_with_chip_note());
    synth.set_muted(0, true);
    synth.play();
    let (left, right) = render(&mut synth, 8192);
    assert!(left.iter().chain(right.iter()).all(|&s| s == 0.0));
}

#[test]
fn test_arpeggio_cycles_chord_pitches() {
    let mut song = Song::default();
    let mut note = Note::new(48, 0, 24, 3);
    note.pitches.push(52);
    note.pitches.push(55);
    song.channels[0].patterns[0].notes.push(note);
    song.channels[0].bars[0] = 1;
    // Chip instruments arpeggiate by default; a single tone voices the chord
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song);
    synth.play();
    render(&mut synth, 8192);
    assert_eq!(synth.state.pool.live_count(), 1);
    let tone = synth.state.pool.get(synth.state.channels[0].instruments[0].active_tones[0]);
    assert_eq!(tone.pitch_count, 3);
}

#[test]
fn test_strum_staggers_voice_starts() {
    let mut song = Song::default();
    song.channels[0].instruments[0].chord = wavebox_song::ChordKind::Strum;
    let mut note = Note::new(48, 0, 24, 3);
    note.pitches.push(52);
    note.pitches.push(55);
    song.channels[0].patterns[0].notes.push(note);
    song.channels[0].bars[0] = 1;
    let mut synth = Synth::new(SAMPLE_RATE);
    synth.set_song(song);
    synth.play();
    // Render less than one strum offset: only the first voice has started
    let part_samples = (SAMPLE_RATE * 60.0 / 150.0 / 24.0) as usize;
    render(&mut synth, part_samples / 2);
    assert_eq!(synth.state.pool.live_count(), 1);
    // After two more parts all three voices sound
    render(&mut synth, part_samples * 3);
    assert_eq!(synth.state.pool.live_count(), 3);
}
