//! Offline rendering
//!
//! Drives a chip one output sample at a time and mixes all of its buffers.
//! With the `export-wav` feature the mix can be written to a 16-bit WAV file.
//!
//! # Example
//!
//! ```
//! use blipsynth::{chips::ChipKind, export::render_mix, SoundChip};
//!
//! # fn main() -> blipsynth::Result<()> {
//! let mut chip = ChipKind::Ay8910.build()?;
//! chip.set_sample_rate(44_100)?;
//! chip.write(0x07, 0x3E)?; // tone A only
//! chip.write(0x08, 0x0F)?;
//! chip.write(0x00, 0xFE)?;
//! let mix = render_mix(chip.as_mut(), 4410)?;
//! assert_eq!(mix.len(), 4410);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "export-wav")]
pub mod wav;

use crate::backend::SoundChip;
use crate::Result;

/// Render `samples` output samples and return the sum of every buffer.
///
/// The chip's frame ends after each sample, so register writes made between
/// calls land on sample boundaries.
pub fn render_mix(chip: &mut dyn SoundChip, samples: usize) -> Result<Vec<f32>> {
    let cycles = chip.buffer_mut(0)?.cycles_per_sample();
    let mut mix = Vec::with_capacity(samples);
    for _ in 0..samples {
        chip.end_frame(cycles)?;
        mix.push(chip.outputs_mut().read_mixed());
    }
    log::debug!("{}: rendered {} samples", chip.name(), samples);
    Ok(mix)
}

/// Scale the mix down when its peak leaves less than 5% headroom.
pub fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
    if peak > 0.95 {
        let scale = 0.95 / peak;
        samples.iter_mut().for_each(|s| *s *= scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::ChipKind;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_only_scales_hot_mixes() {
        let mut quiet = vec![0.2, -0.5, 0.9];
        normalize(&mut quiet);
        assert_eq!(quiet, vec![0.2, -0.5, 0.9]);

        let mut hot = vec![0.5, 1.9, -1.2];
        normalize(&mut hot);
        assert_relative_eq!(hot[1], 0.95, epsilon = 1e-6);
        assert_relative_eq!(hot[0], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_silent_chip_renders_zeros() {
        for kind in ChipKind::ALL {
            let mut chip = kind.build().unwrap();
            chip.set_sample_rate(48_000).unwrap();
            let mix = render_mix(chip.as_mut(), 256).unwrap();
            assert_eq!(mix.len(), 256);
            assert!(mix.iter().all(|&s| s == 0.0), "{kind} is not silent");
        }
    }
}
