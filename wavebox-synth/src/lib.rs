//! Real-time synthesizer runtime for wavebox songs
//!
//! [`wavebox_song`] holds the immutable composition model and its codecs;
//! this crate turns a [`wavebox_song::Song`] into audio. The pieces:
//!
//! - [`synth`]: the [`Synth`] engine — transport, the bar/beat/part/tick
//!   scheduler, tone lifecycle, and the render loop.
//! - [`kernels`]: one DSP routine per instrument type (integrated-wavetable
//!   chip/harmonics/pulse, 4-op FM, noise tables, Karplus-Strong string).
//! - [`effects`]: the per-instrument effect chain and the master limiter.
//! - [`filtering`]: biquad filters with per-sample coefficient glides.
//! - [`envelope`]: per-tick envelope evaluation.
//! - [`wavetables`]: precomputed integrated and pseudo-random tables.
//!
//! Rendering is synchronous and deterministic: `synthesize` fills two
//! caller-owned `f32` slices and allocates nothing in steady state.

pub mod effects;
pub mod envelope;
pub mod filtering;
pub mod instrument_state;
pub mod kernels;
pub mod synth;
pub mod tone;
pub mod wavetables;

pub use synth::Synth;
