//! Wavetable construction
//!
//! All tables are built when a song is loaded, never on the render path.
//! Periodic tables (chip, harmonics, the saw used by pulse width) are stored
//! in integrated form: entry `k` holds the running sum of the zero-mean wave
//! up to `k`. Sampling the difference of two integral reads divided by the
//! phase step is a cheap band-limiting trick; making the wave zero-mean
//! first keeps the integral from drifting across wrap-around.
//!
//! Noise and spectrum tables are plain sample data, generated from fixed PCG
//! seeds so the same settings always produce the same table.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use wavebox_song::{CHIP_WAVES, HarmonicsSettings, SpectrumSettings};

/// Length of generated noise and spectrum tables
pub const NOISE_TABLE_LENGTH: usize = 32768;

/// Length of the additive harmonics table
pub const HARMONICS_TABLE_LENGTH: usize = 2048;

/// Steps in the synthetic sawtooth used by the pulse-width kernel
const SAW_TABLE_LENGTH: usize = 64;

/// Integrate a single cycle, returning `samples.len() + 1` entries
///
/// The mean is removed first so the integral returns to its start value at
/// the wrap point.
pub fn integrate(samples: &[f32]) -> Vec<f32> {
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    let mut table = Vec::with_capacity(samples.len() + 1);
    let mut sum = 0.0f64;
    table.push(0.0);
    for &sample in samples {
        sum += sample as f64 - mean;
        table.push(sum as f32);
    }
    table
}

/// Read an integrated table with band-limiting: average value of the wave
/// over `[phase, phase + delta)`, in table units
#[inline]
pub fn sample_integrated(table: &[f32], phase: f64, delta: f64) -> f64 {
    let length = (table.len() - 1) as f64;
    let read = |p: f64| -> f64 {
        let wrapped = p.rem_euclid(length);
        let index = wrapped as usize;
        let fraction = wrapped - index as f64;
        // The integral grows by the full-cycle sum (zero) each wrap, so the
        // wrapped read is exact
        table[index] as f64 + (table[index + 1] as f64 - table[index] as f64) * fraction
    };
    (read(phase + delta) - read(phase)) / delta
}

/// Integrated table for a chip wave preset
pub fn chip_table(wave: u8) -> Vec<f32> {
    let wave = &CHIP_WAVES[wave as usize % CHIP_WAVES.len()];
    integrate(wave.samples)
}

/// Integrated sawtooth; two offset reads of this make a pulse wave
pub fn saw_table() -> Vec<f32> {
    let samples: Vec<f32> = (0..SAW_TABLE_LENGTH)
        .map(|i| -1.0 + 2.0 * (i as f32 + 0.5) / SAW_TABLE_LENGTH as f32)
        .collect();
    integrate(&samples)
}

/// Integrated additive table from harmonics controls
pub fn harmonics_table(settings: &HarmonicsSettings) -> Vec<f32> {
    let mut samples = vec![0.0f32; HARMONICS_TABLE_LENGTH];
    let mut peak = 0.0f32;
    for (harmonic, &control) in settings.controls.iter().enumerate() {
        if control == 0 {
            continue;
        }
        let order = (harmonic + 1) as f64;
        let amplitude = (control as f64 / 7.0).powi(2) / order.sqrt();
        for (i, sample) in samples.iter_mut().enumerate() {
            let phase = std::f64::consts::TAU * order * i as f64 / HARMONICS_TABLE_LENGTH as f64;
            *sample += (amplitude * phase.sin()) as f32;
        }
    }
    for &sample in &samples {
        peak = peak.max(sample.abs());
    }
    if peak > 0.0 {
        for sample in &mut samples {
            *sample /= peak;
        }
    }
    integrate(&samples)
}

/// Raw noise table for a noise wave preset
pub fn noise_table(wave: u8) -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(0x9E3779B97F4A7C15 ^ wave as u64);
    let mut samples = vec![0.0f32; NOISE_TABLE_LENGTH];
    match wave {
        // retro: 1-bit noise
        0 => {
            for sample in &mut samples {
                *sample = if rng.random::<bool>() { 1.0 } else { -1.0 };
            }
        }
        // white: uniform
        1 => {
            for sample in &mut samples {
                *sample = rng.random_range(-1.0f32..1.0);
            }
        }
        // clang: metallic, 1-bit noise with values held in short runs
        2 => {
            let mut value = 1.0f32;
            let mut hold = 0;
            for sample in &mut samples {
                if hold == 0 {
                    value = if rng.random::<bool>() { 1.0 } else { -1.0 };
                    hold = rng.random_range(1..5);
                }
                hold -= 1;
                *sample = value;
            }
        }
        // buzz: mostly periodic square with random phase flips
        3 => {
            let mut sign = 1.0f32;
            for (i, sample) in samples.iter_mut().enumerate() {
                if i % 6 == 0 && rng.random_range(0.0f32..1.0) < 0.2 {
                    sign = -sign;
                }
                *sample = if (i / 3) % 2 == 0 { sign } else { -sign };
            }
        }
        // hollow: white noise dulled by two passes of a short running average
        _ => {
            for sample in &mut samples {
                *sample = rng.random_range(-1.0f32..1.0);
            }
            for _ in 0..2 {
                let mut previous = samples[NOISE_TABLE_LENGTH - 1];
                for sample in &mut samples {
                    let current = *sample;
                    *sample = (current + previous) * 0.5;
                    previous = current;
                }
            }
            let peak = samples.iter().fold(0.0f32, |p, &s| p.max(s.abs()));
            if peak > 0.0 {
                for sample in &mut samples {
                    *sample /= peak;
                }
            }
        }
    }
    samples
}

/// Spectral table: a sum of sinusoids at quarter-octave-spaced bands with
/// amplitudes from the spectrum controls and fixed pseudo-random phases
pub fn spectrum_table(settings: &SpectrumSettings, seed: u64) -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(0xD1B54A32D192ED03 ^ seed);
    let mut samples = vec![0.0f32; NOISE_TABLE_LENGTH];
    let mut total_amplitude = 0.0f64;
    for (band, &control) in settings.controls.iter().enumerate() {
        let phase_offset = rng.random_range(0.0f64..std::f64::consts::TAU);
        if control == 0 {
            continue;
        }
        // Band 0 sits a few octaves below the table's nominal pitch
        let cycles = (8.0 * 2.0f64.powf(band as f64 / 4.0)).round();
        let amplitude = (control as f64 / 7.0).powi(3);
        total_amplitude += amplitude;
        for (i, sample) in samples.iter_mut().enumerate() {
            let phase =
                std::f64::consts::TAU * cycles * i as f64 / NOISE_TABLE_LENGTH as f64 + phase_offset;
            *sample += (amplitude * phase.sin()) as f32;
        }
    }
    if total_amplitude > 0.0 {
        let scale = (1.0 / total_amplitude.sqrt()) as f32;
        for sample in &mut samples {
            *sample *= scale;
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_returns_to_zero_at_wrap() {
        for wave in 0..CHIP_WAVES.len() as u8 {
            let table = chip_table(wave);
            let last = *table.last().unwrap();
            assert!(last.abs() < 1e-3, "wave {wave} drifted by {last}");
        }
    }

    #[test]
    fn test_sample_integrated_recovers_square_wave() {
        // With a tiny delta the integral difference approximates the wave
        let table = chip_table(2);
        let high = sample_integrated(&table, 0.3, 0.01);
        let low = sample_integrated(&table, 1.3, 0.01);
        assert!(high > 0.9, "got {high}");
        assert!(low < -0.9, "got {low}");
    }

    #[test]
    fn test_sample_integrated_handles_wraparound() {
        let table = chip_table(1);
        let value = sample_integrated(&table, 15.9, 0.2);
        assert!(value.is_finite());
        assert!(value.abs() <= 1.5);
    }

    #[test]
    fn test_noise_tables_are_deterministic_and_bounded() {
        for wave in 0..5u8 {
            let a = noise_table(wave);
            let b = noise_table(wave);
            assert_eq!(a, b);
            assert!(a.iter().all(|s| s.abs() <= 1.0));
        }
    }

    #[test]
    fn test_spectrum_table_is_deterministic() {
        let settings = SpectrumSettings::default();
        assert_eq!(spectrum_table(&settings, 3), spectrum_table(&settings, 3));
        // Different seeds give different phase sets
        assert_ne!(spectrum_table(&settings, 3), spectrum_table(&settings, 4));
    }

    #[test]
    fn test_harmonics_table_silent_when_all_controls_zero() {
        let settings = HarmonicsSettings {
            controls: [0; wavebox_song::HARMONICS_CONTROL_COUNT],
        };
        let table = harmonics_table(&settings);
        assert!(table.iter().all(|&s| s == 0.0));
    }
}
