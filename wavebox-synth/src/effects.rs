//! Per-instrument effects chain and the master limiter
//!
//! Stage order is fixed: distortion, bitcrusher, EQ cascade, panning,
//! chorus, echo, reverb. Mono stages run on the kernel scratch buffer;
//! panning fans out to stereo and the remaining stages run per side before
//! accumulating into the caller's output. Every stage's scalar parameters
//! interpolate sample-by-sample between tick start and end values.
//!
//! All delay lines and filter histories are flushed after each run: any
//! non-finite or sub-threshold value becomes exact 0.0, so a chain fed
//! silence converges to true silence instead of grinding denormals.

use wavebox_song::{EffectFlags, Instrument};

use crate::filtering::{DynamicBiquadFilter, SILENCE_EPSILON, sanitize};
use crate::kernels::run_ramp;

/// Reverb feedback line lengths at the 48kHz reference rate, co-prime-ish
/// so the tail stays dense
const REVERB_LINE_LENGTHS: [usize; 4] = [1687, 1601, 2053, 2251];

/// Per-tick effect parameter targets, computed by the scheduler
#[derive(Debug, Clone)]
pub struct EffectParams {
    /// Overall instrument gain applied after the mono stages
    pub volume: (f64, f64),
    /// Distortion drive, 0..1
    pub distortion: (f64, f64),
    /// Bitcrusher hold-phase increment per sample (1 = no reduction)
    pub crush_rate: (f64, f64),
    /// Bitcrusher quantization scale (levels per unit amplitude)
    pub crush_scale: (f64, f64),
    /// Pan position 0..1 (0.5 = center)
    pub pan: (f64, f64),
    /// Chorus depth, 0..1
    pub chorus: (f64, f64),
    /// Echo loop gain, 0..1
    pub echo_feedback: (f64, f64),
    /// Reverb send, 0..1
    pub reverb: (f64, f64),
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            volume: (1.0, 1.0),
            distortion: (0.0, 0.0),
            crush_rate: (1.0, 1.0),
            crush_scale: (16.0, 16.0),
            pan: (0.5, 0.5),
            chorus: (0.0, 0.0),
            echo_feedback: (0.0, 0.0),
            reverb: (0.0, 0.0),
        }
    }
}

/// All mutable effect state for one instrument
#[derive(Debug, Default)]
pub struct EffectsState {
    // distortion keeps one sample of history for its fractional taps
    distortion_prev: f64,
    crush_phase: f64,
    crush_held: f64,
    pub eq_filters: Vec<DynamicBiquadFilter>,
    pub eq_count: usize,
    pan_buffer: Vec<f32>,
    pan_pos: usize,
    chorus_buffer: [Vec<f32>; 2],
    chorus_pos: usize,
    chorus_phase: f64,
    echo_buffer: [Vec<f32>; 2],
    echo_pos: usize,
    echo_delay: usize,
    echo_shelf: [f64; 2],
    reverb_lines: [Vec<f32>; 4],
    reverb_pos: [usize; 4],
    reverb_shelf: [f64; 4],
}

/// Interaural pan delay line length
const PAN_BUFFER_LENGTH: usize = 256;

/// Chorus delay line length per side
const CHORUS_BUFFER_LENGTH: usize = 2048;

/// Chorus LFO rates per tap, in Hz
const CHORUS_TAP_RATES: [f64; 3] = [0.55, 0.74, 0.97];

impl EffectsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the delay lines for this instrument's enabled stages
    ///
    /// Called on song load; buffers are kept (and reused) for the life of
    /// the instrument state. `max_echo_delay` is the largest echo delay the
    /// song can request, in samples.
    pub fn configure(&mut self, instrument: &Instrument, sample_rate: f64, max_echo_delay: usize) {
        let rate_scale = sample_rate / 48000.0;
        self.eq_filters
            .resize_with(wavebox_song::MAX_FILTER_POINTS, DynamicBiquadFilter::new);
        self.eq_count = instrument.eq_filter.points.len();
        if instrument.effects.contains(EffectFlags::PANNING) {
            self.pan_buffer.resize(PAN_BUFFER_LENGTH, 0.0);
        }
        if instrument.effects.contains(EffectFlags::CHORUS) {
            for side in &mut self.chorus_buffer {
                side.resize(CHORUS_BUFFER_LENGTH, 0.0);
            }
        }
        if instrument.effects.contains(EffectFlags::ECHO) {
            let length = max_echo_delay.next_power_of_two();
            for side in &mut self.echo_buffer {
                side.resize(length, 0.0);
            }
        }
        if instrument.effects.contains(EffectFlags::REVERB) {
            for (line, &length) in self.reverb_lines.iter_mut().zip(REVERB_LINE_LENGTHS.iter()) {
                line.resize(((length as f64 * rate_scale) as usize).max(4), 0.0);
            }
        }
    }

    /// Set the echo delay for the coming run, clamped to the buffer
    pub fn set_echo_delay(&mut self, samples: usize) {
        let capacity = self.echo_buffer[0].len();
        self.echo_delay = if capacity == 0 {
            0
        } else {
            samples.clamp(1, capacity - 1)
        };
    }

    /// Run the chain over one rendered run, accumulating into `left`/`right`
    pub fn process(
        &mut self,
        instrument: &Instrument,
        params: &EffectParams,
        span: (f64, f64),
        scratch: &mut [f32],
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let samples = scratch.len();
        if samples == 0 {
            return;
        }
        let effects = instrument.effects;

        if effects.contains(EffectFlags::DISTORTION) {
            self.process_distortion(params, span, scratch);
        }
        if effects.contains(EffectFlags::BITCRUSHER) {
            self.process_bitcrusher(params, span, scratch);
        }
        if self.eq_count > 0 {
            for filter in self.eq_filters[..self.eq_count].iter_mut() {
                for sample in scratch.iter_mut() {
                    *sample = filter.process(*sample as f64) as f32;
                }
                filter.settle();
            }
        }

        let (mut volume, volume_inc) = run_ramp(params.volume, span, samples);
        for sample in scratch.iter_mut() {
            *sample *= volume as f32;
            volume += volume_inc;
        }

        // Stereo from here on
        let (mut pan, pan_inc) = run_ramp(params.pan, span, samples);
        let (mut chorus, chorus_inc) = run_ramp(params.chorus, span, samples);
        let (mut echo_feedback, echo_inc) = run_ramp(params.echo_feedback, span, samples);
        let (mut reverb, reverb_inc) = run_ramp(params.reverb, span, samples);
        let use_pan_delay = effects.contains(EffectFlags::PANNING) && !self.pan_buffer.is_empty();
        let use_chorus = effects.contains(EffectFlags::CHORUS) && !self.chorus_buffer[0].is_empty();
        let use_echo = effects.contains(EffectFlags::ECHO)
            && !self.echo_buffer[0].is_empty()
            && self.echo_delay > 0;
        let use_reverb = effects.contains(EffectFlags::REVERB) && !self.reverb_lines[0].is_empty();
        let chorus_phase_inc = std::f64::consts::TAU / 48000.0;

        for i in 0..samples {
            let mono = scratch[i] as f64;
            let angle = pan.clamp(0.0, 1.0) * std::f64::consts::FRAC_PI_2;
            let mut l = mono * angle.cos() * std::f64::consts::SQRT_2;
            let mut r = mono * angle.sin() * std::f64::consts::SQRT_2;

            if use_pan_delay {
                // The far ear hears the signal a fraction of a millisecond
                // late; delay whichever side pan points away from
                let mask = self.pan_buffer.len() - 1;
                self.pan_buffer[self.pan_pos & mask] = mono as f32;
                let offset = (pan - 0.5).abs() * 2.0 * 40.0;
                let delayed = fractional_tap(&self.pan_buffer, self.pan_pos, offset);
                if pan > 0.5 {
                    l = delayed * angle.cos() * std::f64::consts::SQRT_2;
                } else {
                    r = delayed * angle.sin() * std::f64::consts::SQRT_2;
                }
                self.pan_pos = self.pan_pos.wrapping_add(1);
            }

            if use_chorus {
                let depth = chorus.clamp(0.0, 1.0);
                let mask = CHORUS_BUFFER_LENGTH - 1;
                self.chorus_buffer[0][self.chorus_pos & mask] = l as f32;
                self.chorus_buffer[1][self.chorus_pos & mask] = r as f32;
                let mut wet = [0.0f64; 2];
                for (tap, &rate) in CHORUS_TAP_RATES.iter().enumerate() {
                    for (side, wet_side) in wet.iter_mut().enumerate() {
                        // Opposite LFO phase per side widens the image
                        let lfo = (self.chorus_phase * rate
                            + tap as f64 * 2.1
                            + side as f64 * std::f64::consts::PI)
                            .sin();
                        let offset = 300.0 + 250.0 * lfo;
                        *wet_side +=
                            fractional_tap(&self.chorus_buffer[side], self.chorus_pos, offset);
                    }
                }
                l = l * (1.0 - depth * 0.5) + wet[0] / 3.0 * depth;
                r = r * (1.0 - depth * 0.5) + wet[1] / 3.0 * depth;
                self.chorus_pos = self.chorus_pos.wrapping_add(1);
                self.chorus_phase += chorus_phase_inc;
            }

            if use_echo {
                let mask = self.echo_buffer[0].len() - 1;
                let read = (self.echo_pos + self.echo_buffer[0].len() - self.echo_delay) & mask;
                for (side, sample) in [&mut l, &mut r].into_iter().enumerate() {
                    let tail = self.echo_buffer[side][read] as f64;
                    // one-pole shelf inside the loop
                    self.echo_shelf[side] += (tail - self.echo_shelf[side]) * 0.6;
                    let looped = self.echo_shelf[side] * echo_feedback;
                    self.echo_buffer[side][self.echo_pos & mask] = (*sample + looped) as f32;
                    *sample += looped;
                }
                self.echo_pos = self.echo_pos.wrapping_add(1);
            }

            if use_reverb {
                let send = (l + r) * 0.5 * reverb;
                let mut taps = [0.0f64; 4];
                for line in 0..4 {
                    taps[line] = self.reverb_lines[line][self.reverb_pos[line]] as f64;
                    self.reverb_shelf[line] += (taps[line] - self.reverb_shelf[line]) * 0.5;
                    taps[line] = self.reverb_shelf[line];
                }
                // Hadamard feedback matrix, scaled to stay stable
                let gain = 0.5 * 0.88;
                let mixed = [
                    (taps[0] + taps[1] + taps[2] + taps[3]) * gain,
                    (taps[0] - taps[1] + taps[2] - taps[3]) * gain,
                    (taps[0] + taps[1] - taps[2] - taps[3]) * gain,
                    (taps[0] - taps[1] - taps[2] + taps[3]) * gain,
                ];
                for line in 0..4 {
                    self.reverb_lines[line][self.reverb_pos[line]] = (mixed[line] + send) as f32;
                    self.reverb_pos[line] += 1;
                    if self.reverb_pos[line] >= self.reverb_lines[line].len() {
                        self.reverb_pos[line] = 0;
                    }
                }
                l += taps[0] + taps[2];
                r += taps[1] + taps[3];
            }

            left[i] += l as f32;
            right[i] += r as f32;
            pan += pan_inc;
            chorus += chorus_inc;
            echo_feedback += echo_inc;
            reverb += reverb_inc;
        }

        self.settle();
    }

    fn process_distortion(&mut self, params: &EffectParams, span: (f64, f64), scratch: &mut [f32]) {
        let samples = scratch.len();
        let (mut drive, drive_inc) = run_ramp(params.distortion, span, samples);
        for sample in scratch.iter_mut() {
            let input = *sample as f64;
            let amount = drive.clamp(0.0, 0.95);
            let shape = |x: f64| x / ((1.0 - amount) * x.abs() + amount.max(1e-3));
            // Three taps across the previous sample interval, waveshaped
            // independently and recombined with a triangular kernel; cheap
            // oversampling that tames the worst aliasing
            let taps = [
                shape(self.distortion_prev + (input - self.distortion_prev) / 3.0),
                shape(self.distortion_prev + (input - self.distortion_prev) * 2.0 / 3.0),
                shape(input),
            ];
            let shaped = taps[0] * 0.25 + taps[1] * 0.5 + taps[2] * 0.25;
            self.distortion_prev = input;
            *sample = (input * (1.0 - amount) + shaped * amount) as f32;
            drive += drive_inc;
        }
        self.distortion_prev = sanitize(self.distortion_prev);
    }

    fn process_bitcrusher(&mut self, params: &EffectParams, span: (f64, f64), scratch: &mut [f32]) {
        let samples = scratch.len();
        let (mut rate, rate_inc) = run_ramp(params.crush_rate, span, samples);
        let (mut scale, scale_inc) = run_ramp(params.crush_scale, span, samples);
        for sample in scratch.iter_mut() {
            self.crush_phase += rate.clamp(0.0, 1.0);
            if self.crush_phase >= 1.0 {
                let overshoot = self.crush_phase.fract();
                self.crush_phase = overshoot;
                let quantized = quantize_fold(*sample as f64, scale.max(1.0));
                // crossfade proportional to how far into the new hold period
                // the boundary landed
                self.crush_held = self.crush_held * (1.0 - overshoot) + quantized * overshoot.max(0.5);
            }
            *sample = self.crush_held as f32;
            rate += rate_inc;
            scale += scale_inc;
        }
        self.crush_held = sanitize(self.crush_held);
    }

    /// Flush all delay lines and histories after a run
    fn settle(&mut self) {
        for value in self
            .echo_shelf
            .iter_mut()
            .chain(self.reverb_shelf.iter_mut())
        {
            *value = sanitize(*value);
        }
        let flush = |buffer: &mut [f32]| {
            for sample in buffer.iter_mut() {
                if !sample.is_finite() || (*sample as f64).abs() < SILENCE_EPSILON {
                    *sample = 0.0;
                }
            }
        };
        flush(&mut self.pan_buffer);
        for side in &mut self.chorus_buffer {
            flush(side);
        }
        for side in &mut self.echo_buffer {
            flush(side);
        }
        for line in &mut self.reverb_lines {
            flush(line);
        }
    }

    /// Whether every piece of retained state is exactly zero
    pub fn is_silent(&self) -> bool {
        let buffer_silent = |buffer: &[f32]| buffer.iter().all(|&s| s == 0.0);
        self.distortion_prev == 0.0
            && self.crush_held == 0.0
            && self.echo_shelf.iter().all(|&s| s == 0.0)
            && self.reverb_shelf.iter().all(|&s| s == 0.0)
            && buffer_silent(&self.pan_buffer)
            && self.chorus_buffer.iter().all(|side| buffer_silent(side))
            && self.echo_buffer.iter().all(|side| buffer_silent(side))
            && self.reverb_lines.iter().all(|line| buffer_silent(line))
    }
}

/// Read `offset` samples behind `write_pos` with linear interpolation
#[inline]
fn fractional_tap(buffer: &[f32], write_pos: usize, offset: f64) -> f64 {
    let length = buffer.len();
    let mask = length - 1;
    // The current sample is written before any tap is read, so offset 0 is
    // a valid read of the just-written value
    let offset = offset.clamp(0.0, (length - 2) as f64);
    let whole = offset as usize;
    let fraction = offset - whole as f64;
    let a = buffer[(write_pos + length - whole) & mask] as f64;
    let b = buffer[(write_pos + length - whole - 1) & mask] as f64;
    a + (b - a) * fraction
}

/// Quantize to `scale` levels per unit, folding overflow back into range
fn quantize_fold(value: f64, scale: f64) -> f64 {
    let scaled = value * scale;
    let quantized = scaled.round() / scale;
    // fold anything beyond ±1 back inward
    let wrapped = (quantized + 1.0).rem_euclid(4.0);
    if wrapped < 2.0 {
        wrapped - 1.0
    } else {
        3.0 - wrapped
    }
}

/// Soft master limiter driven by the song's master gain setting
///
/// An envelope follower tracks the stereo peak; gain dips as the envelope
/// exceeds unity, with fast attack and slow release.
#[derive(Debug, Default)]
pub struct Limiter {
    envelope: f64,
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, master_gain: f64, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = (*l as f64).abs().max((*r as f64).abs()) * master_gain;
            if peak > self.envelope {
                self.envelope += (peak - self.envelope) * 0.25;
            } else {
                self.envelope += (peak - self.envelope) * 0.005;
            }
            let gain = master_gain / self.envelope.max(1.0);
            *l = (*l as f64 * gain) as f32;
            *r = (*r as f64 * gain) as f32;
        }
        self.envelope = sanitize(self.envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavebox_song::InstrumentType;

    fn stereo_buffers(n: usize) -> (Vec<f32>, Vec<f32>) {
        (vec![0.0; n], vec![0.0; n])
    }

    fn loaded_instrument() -> Instrument {
        let mut instrument = Instrument::new(InstrumentType::Chip);
        instrument.effects.insert(EffectFlags::DISTORTION);
        instrument.effects.insert(EffectFlags::ECHO);
        instrument.effects.insert(EffectFlags::REVERB);
        instrument
    }

    #[test]
    fn test_center_pan_is_balanced() {
        let instrument = Instrument::new(InstrumentType::Chip);
        let mut state = EffectsState::new();
        state.configure(&instrument, 48000.0, 0);
        let params = EffectParams::default();
        let mut scratch = vec![0.5f32; 64];
        let (mut left, mut right) = stereo_buffers(64);
        state.process(&instrument, &params, (0.0, 1.0), &mut scratch, &mut left, &mut right);
        for (l, r) in left.iter().zip(right.iter()) {
            assert!((l - r).abs() < 1e-4);
        }
    }

    #[test]
    fn test_hard_pan_moves_energy() {
        let instrument = Instrument::new(InstrumentType::Chip);
        let mut state = EffectsState::new();
        state.configure(&instrument, 48000.0, 0);
        let params = EffectParams {
            pan: (1.0, 1.0),
            ..EffectParams::default()
        };
        let mut scratch = vec![0.5f32; 64];
        let (mut left, mut right) = stereo_buffers(64);
        state.process(&instrument, &params, (0.0, 1.0), &mut scratch, &mut left, &mut right);
        let left_energy: f32 = left.iter().map(|s| s * s).sum();
        let right_energy: f32 = right.iter().map(|s| s * s).sum();
        assert!(right_energy > left_energy * 100.0);
    }

    #[test]
    fn test_state_converges_to_exact_zero_on_silence() {
        let instrument = loaded_instrument();
        let mut state = EffectsState::new();
        state.configure(&instrument, 48000.0, 4800);
        state.set_echo_delay(2400);
        let params = EffectParams {
            distortion: (0.6, 0.6),
            echo_feedback: (0.5, 0.5),
            reverb: (0.8, 0.8),
            ..EffectParams::default()
        };

        let mut scratch = vec![0.0f32; 256];
        scratch[0] = 1.0;
        let (mut left, mut right) = stereo_buffers(256);
        state.process(&instrument, &params, (0.0, 1.0), &mut scratch, &mut left, &mut right);
        assert!(!state.is_silent(), "impulse should leave tails behind");

        // Keep feeding silence; the tails decay below threshold and flush
        for _ in 0..4000 {
            let mut scratch = vec![0.0f32; 256];
            let (mut left, mut right) = stereo_buffers(256);
            state.process(&instrument, &params, (0.0, 1.0), &mut scratch, &mut left, &mut right);
        }
        assert!(state.is_silent());
    }

    #[test]
    fn test_echo_repeats_an_impulse() {
        let mut instrument = Instrument::new(InstrumentType::Chip);
        instrument.effects.insert(EffectFlags::ECHO);
        let mut state = EffectsState::new();
        state.configure(&instrument, 48000.0, 512);
        state.set_echo_delay(100);
        let params = EffectParams {
            echo_feedback: (0.7, 0.7),
            ..EffectParams::default()
        };
        let mut scratch = vec![0.0f32; 400];
        scratch[0] = 1.0;
        let (mut left, mut right) = stereo_buffers(400);
        state.process(&instrument, &params, (0.0, 1.0), &mut scratch, &mut left, &mut right);
        let tail: f32 = left[90..130].iter().map(|s| s.abs()).sum();
        assert!(tail > 0.01, "no echo arrived near the delay time");
    }

    #[test]
    fn test_limiter_tames_hot_signal() {
        let mut limiter = Limiter::new();
        let mut left = vec![4.0f32; 4096];
        let mut right = vec![4.0f32; 4096];
        limiter.process(1.0, &mut left, &mut right);
        let settled = *left.last().unwrap();
        assert!(settled.abs() <= 1.1, "limiter let {settled} through");
    }

    #[test]
    fn test_quantize_fold_stays_in_range() {
        for i in -40..=40 {
            let value = i as f64 * 0.1;
            let folded = quantize_fold(value, 8.0);
            assert!((-1.0..=1.0).contains(&folded), "{value} -> {folded}");
        }
    }
}
