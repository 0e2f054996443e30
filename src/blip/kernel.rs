//! Windowed-sinc impulse kernels
//!
//! A kernel is a table of `PHASES` rows, one per sub-sample position, each
//! `width` taps long. Every row is the integral of a band-limited step over
//! one output sample, so an amplitude change lands in the buffer as a short
//! burst of deltas instead of a single aliasing jump.

use super::{BASE_KERNEL_UNIT, PHASES};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Kernel width selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// 8 taps
    Low,
    /// 12 taps
    #[default]
    Medium,
    /// 16 taps
    High,
}

impl Quality {
    /// Kernel width in taps.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            Quality::Low => 8,
            Quality::Medium => 12,
            Quality::High => 16,
        }
    }
}

/// Treble equalization parameters
///
/// `treble` is the attenuation in dB reached at half the sample rate,
/// applied progressively above `rolloff_freq`. `cutoff_freq` of 0 selects an
/// automatic cutoff suited to the kernel width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Equalizer {
    /// Attenuation at Nyquist in dB (negative values darken)
    pub treble: f64,
    /// Frequency where the rolloff starts, in Hz
    pub rolloff_freq: u32,
    /// Sample rate the curve is designed for, in Hz
    pub sample_rate: u32,
    /// Explicit low-pass cutoff in Hz (0 = automatic)
    pub cutoff_freq: u32,
}

impl Equalizer {
    /// Create an equalizer with the given treble and default frequencies.
    pub fn new(treble: f64) -> Self {
        Self {
            treble,
            ..Self::default()
        }
    }

    /// Same curve, designed for another sample rate.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Fill `out` with the left half of the impulse, ending at its center.
    fn generate(&self, out: &mut [f64]) {
        let count = out.len();
        let mut oversample = PHASES as f64 * 2.25 / count as f64 + 0.85;
        let half_rate = self.sample_rate.max(1) as f64 * 0.5;
        if self.cutoff_freq != 0 {
            oversample = half_rate / self.cutoff_freq as f64;
        }
        let cutoff = self.rolloff_freq as f64 * oversample / half_rate;
        gen_sinc(out, PHASES as f64 * oversample, self.treble, cutoff);

        // half of a Hamming window
        let to_fraction = PI / (count as f64 - 1.0);
        for (i, value) in out.iter_mut().enumerate() {
            *value *= 0.54 - 0.46 * (i as f64 * to_fraction).cos();
        }
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self {
            treble: -8.0,
            rolloff_freq: 0,
            sample_rate: 44_100,
            cutoff_freq: 0,
        }
    }
}

/// Closed-form sum of a treble-shaped cosine series (band-limited impulse).
fn gen_sinc(out: &mut [f64], oversample: f64, treble: f64, cutoff: f64) {
    let count = out.len() as f64;
    let cutoff = cutoff.min(0.999);
    let treble = treble.clamp(-300.0, 5.0);

    let maxh = 4096.0;
    let rolloff = 10f64.powf(1.0 / (maxh * 20.0) * treble / (1.0 - cutoff));
    let pow_a_n = rolloff.powf(maxh - maxh * cutoff);
    let to_angle = PI / 2.0 / maxh / oversample;

    for (i, value) in out.iter_mut().enumerate() {
        let angle = ((i as f64 - count) * 2.0 + 1.0) * to_angle;
        let cos_angle = angle.cos();
        let cos_nc_angle = (maxh * cutoff * angle).cos();
        let cos_nc1_angle = ((maxh * cutoff - 1.0) * angle).cos();

        let mut c = rolloff * ((maxh - 1.0) * angle).cos() - (maxh * angle).cos();
        c = c * pow_a_n - rolloff * cos_nc1_angle + cos_nc_angle;
        let d = 1.0 + rolloff * (rolloff - cos_angle - cos_angle);
        let b = 2.0 - cos_angle - cos_angle;
        let a = 1.0 - cos_angle - cos_nc_angle + cos_nc1_angle;

        *value = (a * d + c * b) / (b * d);
    }
}

/// Phase-indexed step kernel quantized to an integer unit
#[derive(Debug, Clone)]
pub struct ImpulseKernel {
    width: usize,
    /// Normalized rows, each summing to 1.0
    shape: Vec<f64>,
    /// Integer rows, each summing exactly to `unit`
    table: Vec<i32>,
    unit: i32,
}

impl ImpulseKernel {
    /// Build a kernel for `quality` shaped by `eq`.
    pub fn new(quality: Quality, eq: &Equalizer) -> Self {
        let width = quality.width();
        let mut kernel = Self {
            width,
            shape: Vec::new(),
            table: vec![0; PHASES * width],
            unit: BASE_KERNEL_UNIT,
        };
        kernel.reshape(eq);
        kernel
    }

    /// Regenerate the kernel shape, keeping the current unit.
    pub fn reshape(&mut self, eq: &Equalizer) {
        let width = self.width;
        let half = PHASES / 2 * (width - 1);

        let mut fine = vec![0.0; half * 2];
        eq.generate(&mut fine[..half]);
        for i in 0..half {
            fine[half + i] = fine[half - 1 - i];
        }
        let total: f64 = fine.iter().sum();

        let mut shape = vec![0.0; PHASES * width];
        for phase in 0..PHASES {
            for tap in 0..width {
                let start = tap * PHASES;
                let sum: f64 = (start..start + PHASES)
                    .filter_map(|pos| pos.checked_sub(phase))
                    .filter_map(|idx| fine.get(idx))
                    .sum();
                shape[phase * width + tap] = sum / total;
            }
        }
        self.shape = shape;
        self.quantize(self.unit);
    }

    /// Re-quantize every row so it sums exactly to `unit`.
    pub fn quantize(&mut self, unit: i32) {
        self.unit = unit;
        let width = self.width;
        for (row, shape) in self
            .table
            .chunks_exact_mut(width)
            .zip(self.shape.chunks_exact(width))
        {
            for (tap, &s) in row.iter_mut().zip(shape) {
                *tap = (s * unit as f64).round() as i32;
            }
            let error = unit - row.iter().sum::<i32>();
            if let Some(peak) = row.iter_mut().max_by_key(|v| v.abs()) {
                *peak += error;
            }
        }
    }

    /// Taps for one sub-sample phase.
    #[inline]
    pub fn row(&self, phase: usize) -> &[i32] {
        let start = phase * self.width;
        &self.table[start..start + self.width]
    }

    /// Kernel width in taps.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Sum of every row.
    #[inline]
    pub fn unit(&self) -> i32 {
        self.unit
    }
}
