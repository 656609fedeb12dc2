//! Per-instrument-type DSP kernels
//!
//! Every kernel shares one contract: render `scratch.len()` samples
//! additively into the mono scratch buffer, interpolating its parameters
//! from the tone's per-tick start/end targets, applying the tone's
//! note-filter cascade, and leaving all oscillator state ready for the next
//! run. `span` is the fraction of the current tick this run covers, so a
//! tick split across two output buffers still interpolates seamlessly.
//!
//! Dispatch is a match on the instrument type enum in the scheduler; there
//! is no per-sample configuration branching inside any kernel.

pub mod chip;
pub mod fm;
pub mod noise;
pub mod string;

/// Interpolate a per-tick (start, end) pair at tick fraction `t`
#[inline]
pub(crate) fn span_lerp(pair: (f64, f64), t: f64) -> f64 {
    pair.0 + (pair.1 - pair.0) * t
}

/// Per-run interpolation setup: value at the run's start and its per-sample
/// increment
#[inline]
pub(crate) fn run_ramp(pair: (f64, f64), span: (f64, f64), samples: usize) -> (f64, f64) {
    let start = span_lerp(pair, span.0);
    let end = span_lerp(pair, span.1);
    (start, (end - start) / samples.max(1) as f64)
}
