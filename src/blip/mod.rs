//! Band-limited step synthesis
//!
//! Amplitude changes are stored as differences in a [`buffer::SynthesisBuffer`]
//! delay line, each spread over a few output samples by a windowed-sinc
//! kernel chosen for the event's sub-sample phase. Reading a sample integrates
//! those differences with a leaky accumulator, which reconstructs the
//! band-limited waveform and removes DC drift at the same time.
//!
//! Time is fixed-point throughout:
//! - chip time is counted in clock cycles since the last frame boundary
//! - resampled time is Q16.16 output samples (`BUFFER_ACCURACY` fractional bits)
//! - the top [`PHASE_BITS`] of the fraction select one of [`PHASES`] kernels

pub mod buffer;
pub mod kernel;
pub mod synth;

/// Chip clock cycles since the last `end_frame`.
pub type BlipTime = u32;

/// Fractional bits of resampled time.
pub const BUFFER_ACCURACY: u32 = 16;

/// Sub-sample phase resolution in bits.
pub const PHASE_BITS: u32 = 6;

/// Number of kernel phases.
pub const PHASES: usize = 1 << PHASE_BITS;

/// Widest supported kernel, in taps.
pub const WIDEST_KERNEL: usize = 16;

/// Fixed-point bits of the accumulator.
pub const SAMPLE_BITS: u32 = 30;

/// Kernel unit before any volume attenuation.
pub const BASE_KERNEL_UNIT: i32 = 1 << 15;

pub use buffer::SynthesisBuffer;
pub use kernel::{Equalizer, ImpulseKernel, Quality};
pub use synth::StepSynthesizer;
