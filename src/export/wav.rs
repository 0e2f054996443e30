//! WAV file rendering

use super::{normalize, render_mix};
use crate::backend::SoundChip;
use crate::config::SynthConfig;
use crate::{BlipError, Result};
use std::path::Path;

/// Configure `chip`, render `samples` output samples and write them as
/// 16-bit mono PCM to `path`.
///
/// The mix is scaled down if it would clip.
///
/// # Example
///
/// ```no_run
/// use blipsynth::{chips::ChipKind, export::wav::render_to_wav, SoundChip, SynthConfig};
///
/// # fn main() -> blipsynth::Result<()> {
/// let mut chip = ChipKind::Sn76489.build()?;
/// chip.write(0x00, 0x80)?;
/// chip.write(0x00, 0x10)?;
/// chip.write(0x00, 0x90)?;
/// render_to_wav(chip.as_mut(), 44_100, "tone.wav", &SynthConfig::default())?;
/// # Ok(())
/// # }
/// ```
pub fn render_to_wav<P: AsRef<Path>>(
    chip: &mut dyn SoundChip,
    samples: usize,
    path: P,
    config: &SynthConfig,
) -> Result<()> {
    chip.configure(config)?;
    let mut mix = render_mix(chip, samples)?;
    normalize(&mut mix);
    write_wav(path.as_ref(), &mix, config.sample_rate)?;
    log::info!(
        "{}: wrote {} samples to {}",
        chip.name(),
        mix.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Write floating-point samples as 16-bit mono PCM.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| BlipError::AudioFileError(format!("cannot create {}: {e}", path.display())))?;
    for &sample in samples {
        writer
            .write_sample(to_pcm16(sample))
            .map_err(|e| BlipError::AudioFileError(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| BlipError::AudioFileError(e.to_string()))
}

#[inline]
fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_pcm16_clamps() {
        assert_eq!(to_pcm16(0.0), 0);
        assert_eq!(to_pcm16(1.5), i16::MAX);
        assert_eq!(to_pcm16(-3.0), -i16::MAX);
    }

    #[test]
    fn test_write_wav_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav(&path, &[0.0, 0.5, -0.5], 22_050).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 22_050);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16383, -16383]);
    }
}
