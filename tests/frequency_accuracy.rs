//! Pitch of rendered tones measured from the output waveform

use blipsynth::chips::NesApu;
use blipsynth::export::render_mix;
use blipsynth::SoundChip;

const CLOCK: u32 = 768_000;
const SAMPLE_RATE: u32 = 48_000;

/// Render pulse 1 at 50% duty with an 11-bit timer of `divider`.
fn render_pulse(divider: u16, samples: usize) -> Vec<f32> {
    let mut chip = NesApu::new().unwrap();
    chip.outputs_mut().set_sample_rate(SAMPLE_RATE, CLOCK).unwrap();
    chip.outputs_mut().set_bass_freq(0);
    chip.write(0x4015, 0x01).unwrap();
    chip.write(0x4000, 0xBF).unwrap(); // 50% duty, halt, constant volume 15
    chip.write(0x4001, 0x00).unwrap();
    chip.write(0x4002, divider as u8).unwrap();
    chip.write(0x4003, (divider >> 8) as u8 & 7).unwrap();
    render_mix(&mut chip, samples).unwrap()
}

/// Sample indices where the signal rises through its mean.
fn rising_crossings(samples: &[f32]) -> Vec<usize> {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    samples
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] < mean && w[1] >= mean)
        .map(|(i, _)| i + 1)
        .collect()
}

#[test]
fn pulse_period_matches_divider() {
    for divider in [49u16, 99, 255, 511] {
        let samples = render_pulse(divider, 24_000);
        let crossings = rising_crossings(&samples[64..]);

        // (N + 1) * 16 clocks per cycle, 16 clocks per sample
        let expected = (divider as usize + 1) * 16 / (CLOCK / SAMPLE_RATE) as usize;
        assert!(crossings.len() > 10, "divider {divider}: too few cycles");

        for pair in crossings.windows(2) {
            let period = pair[1] - pair[0];
            assert!(
                period.abs_diff(expected) <= 1,
                "divider {divider}: period {period} samples, expected {expected}"
            );
        }

        let span = crossings[crossings.len() - 1] - crossings[0];
        let cycles = crossings.len() - 1;
        assert!(
            span.abs_diff(cycles * expected) <= 1,
            "divider {divider}: {cycles} cycles over {span} samples"
        );
    }
}

#[test]
fn cycle_count_over_one_second() {
    // 100-sample period at 48 kHz is 480 Hz
    let samples = render_pulse(99, SAMPLE_RATE as usize);
    let crossings = rising_crossings(&samples[64..]);
    let expected = (SAMPLE_RATE as usize - 64) / 100;
    assert!(crossings.len().abs_diff(expected) <= 1, "{} cycles", crossings.len());
}
