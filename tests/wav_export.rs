//! WAV rendering end to end
#![cfg(feature = "export-wav")]

use blipsynth::chips::ChipKind;
use blipsynth::export::wav::render_to_wav;
use blipsynth::{SoundChip, SynthConfig};

#[test]
fn renders_tone_to_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("square.wav");

    let mut chip = ChipKind::Sn76489.build().unwrap();
    chip.write(0x00, 0x8E).unwrap();
    chip.write(0x00, 0x0F).unwrap();
    chip.write(0x00, 0x90).unwrap();
    let config = SynthConfig {
        sample_rate: 22_050,
        ..SynthConfig::default()
    };
    render_to_wav(chip.as_mut(), 2205, &path, &config).unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().sample_rate, 22_050);
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.len(), 2205);
    let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!(peak > 1000, "peak {peak}");
    assert!(peak <= (0.95 * i16::MAX as f32) as u16 + 1);
}

#[test]
fn rejects_invalid_config_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.wav");
    let mut chip = ChipKind::Ay8910.build().unwrap();
    let config = SynthConfig {
        sample_rate: 0,
        ..SynthConfig::default()
    };
    assert!(render_to_wav(chip.as_mut(), 100, &path, &config).is_err());
    assert!(!path.exists());
}
