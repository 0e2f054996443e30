//! Band-limited sound-chip synthesis
//!
//! A BLIP ("band-limited impulse") synthesis engine plus clock-exact
//! emulations of the oscillators found in classic sound chips. Oscillators
//! never produce samples themselves: every amplitude change is injected into a
//! [`SynthesisBuffer`] as a band-limited step, so waveforms stay alias-free
//! at any output sample rate.
//!
//! # Layers
//! - [`blip`]: synthesis buffer, windowed-sinc kernels and step synthesizers
//! - [`oscillator`]: the shared delay/phase bookkeeping every voice uses
//! - [`backend`]: the [`SoundChip`] trait and the per-chip buffer bank
//! - [`chips`]: NES APU, VRC6, Sunsoft 5B, Namco 163, SCC, Game Boy, POKEY,
//!   SN76489, AY-3-8910 and HuC6280 emulations
//! - [`config`]: serde-backed synthesis settings
//! - [`export`]: offline rendering (WAV output behind `export-wav`)
//!
//! # Crate feature flags
//! - `export-wav` (optional): WAV file rendering via hound
//!
//! # Quick start
//! ```
//! use blipsynth::chips::ChipKind;
//!
//! # fn main() -> blipsynth::Result<()> {
//! let mut chip = ChipKind::NesApu.build()?;
//! chip.set_sample_rate(48_000)?;
//! chip.write(0x4015, 0x01)?; // enable pulse 1
//! chip.write(0x4000, 0xBF)?; // 50% duty, constant volume 15
//! chip.write(0x4002, 0xFD)?; // timer low
//! chip.write(0x4003, 0x00)?; // timer high, length load
//!
//! let cycles = chip.buffer_mut(0)?.cycles_per_sample();
//! let mut samples = Vec::new();
//! for _ in 0..480 {
//!     chip.end_frame(cycles)?;
//!     samples.push(chip.buffer_mut(0)?.read_sample());
//! }
//! assert!(samples.iter().any(|s| s.abs() > 0.01));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend; // SoundChip trait and buffer bank
pub mod blip; // Band-limited synthesis core
pub mod chips; // Chip emulations
pub mod config; // Synthesis configuration
pub mod export; // Offline rendering
pub mod oscillator; // Shared voice bookkeeping

/// Error types for synthesis and chip emulation
#[derive(thiserror::Error, Debug)]
pub enum BlipError {
    /// Sample rate or clock rate unusable for resampling
    #[error("Invalid rate: sample rate {sample_rate} Hz, clock rate {clock_rate} Hz")]
    InvalidRate {
        /// Requested output sample rate
        sample_rate: u32,
        /// Requested chip clock rate
        clock_rate: u32,
    },

    /// Volume so small that the impulse kernel lost all precision
    #[error("Volume {0} is too low to represent")]
    VolumeTooLow(f32),

    /// Negative or non-finite volume level
    #[error("Invalid volume level: {0}")]
    InvalidVolume(f32),

    /// Amplitude range a synthesizer cannot map onto full scale
    #[error("Invalid amplitude range: {0}")]
    InvalidAmpRange(i32),

    /// Event lands beyond the end of the buffer's delay line
    #[error("Time out of range: sample {sample} does not fit a {capacity}-slot delay line")]
    TimeOutOfRange {
        /// Output sample index the event resolved to
        sample: u64,
        /// Delay-line length in slots
        capacity: usize,
    },

    /// Time moved backwards within a frame
    #[error("Time regression: {to} is earlier than {from}")]
    TimeRegression {
        /// Time already reached
        from: u32,
        /// Requested earlier time
        to: u32,
    },

    /// Register address outside the chip's window
    #[error("Address {addr:#06x} is outside the {chip} register window")]
    AddressOutOfRange {
        /// Offending address
        addr: u16,
        /// Chip name
        chip: &'static str,
    },

    /// Oscillator or buffer index out of range
    #[error("Channel {index} out of range (count {count})")]
    ChannelOutOfRange {
        /// Requested index
        index: usize,
        /// Number of valid entries
        count: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// IO error from filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio file writing error
    #[error("Audio file error: {0}")]
    AudioFileError(String),
}

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, BlipError>;

// Public API exports
pub use backend::{OutputBank, SoundChip};
pub use blip::buffer::SynthesisBuffer;
pub use blip::kernel::{Equalizer, Quality};
pub use blip::synth::StepSynthesizer;
pub use blip::BlipTime;
pub use chips::ChipKind;
pub use config::SynthConfig;
pub use oscillator::Voice;
