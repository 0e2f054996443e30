//! Rendering split across frames of different lengths

use blipsynth::chips::{nes_apu, NesApu};
use blipsynth::SoundChip;

const CLOCK: u32 = 768_000;
const SAMPLE_RATE: u32 = 48_000;
const CYCLES: u32 = CLOCK / SAMPLE_RATE;
const TOTAL: usize = 8050;
/// Past the triangle's start-up step
const SETTLED: usize = 1000;

/// Output rate paired with the APU's real clock (41 clocks per sample).
const REAL_SAMPLE_RATE: u32 = 44_100;

/// Triangle with timer 0x100, length counter halted.
fn triangle_chip(frame_samples: usize, sample_rate: u32, clock: u32) -> NesApu {
    let mut chip = NesApu::new().unwrap();
    chip.outputs_mut().set_capacity(frame_samples);
    chip.outputs_mut().set_sample_rate(sample_rate, clock).unwrap();
    chip.outputs_mut().set_bass_freq(0);
    chip.write(0x4015, 0x04).unwrap();
    chip.write(0x4008, 0xFF).unwrap();
    chip.write(0x400A, 0x00).unwrap();
    chip.write(0x400B, 0x01).unwrap();
    chip
}

/// Render `TOTAL` samples in frames of `frame_samples`, reading after each.
fn render(frame_samples: usize) -> Vec<f32> {
    // 514 samples per triangle cycle at this rate
    let mut chip = triangle_chip(frame_samples, SAMPLE_RATE, CLOCK);
    let mut out = Vec::with_capacity(TOTAL + frame_samples);
    while out.len() < TOTAL {
        chip.end_frame(CYCLES * frame_samples as u32).unwrap();
        let buf = chip.buffer_mut(2).unwrap();
        assert_eq!(buf.samples_avail(), frame_samples);
        for _ in 0..frame_samples {
            out.push(buf.read_sample());
        }
    }
    out.truncate(TOTAL);
    out
}

/// Render `total` samples at the real APU clock, ending a frame every
/// `frame_clocks` cycles and draining whatever each frame completed.
fn render_real_clock(frame_clocks: u32, total: usize) -> Vec<f32> {
    let mut chip = triangle_chip(512, REAL_SAMPLE_RATE, nes_apu::CLOCK_RATE);
    let mut out = vec![0.0f32; total + 512];
    let mut filled = 0;
    while filled < total {
        chip.end_frame(frame_clocks).unwrap();
        filled += chip.buffer_mut(2).unwrap().read_samples(&mut out[filled..]);
    }
    out.truncate(total);
    out
}

fn second_difference(samples: &[f32], i: usize) -> f32 {
    (samples[i + 1] - 2.0 * samples[i] + samples[i - 1]).abs()
}

#[test]
fn frame_length_does_not_change_output() {
    let reference = render(1);
    assert!(reference.iter().any(|s| s.abs() > 0.05), "triangle never started");
    for frame_samples in [7, 50, 441] {
        assert_eq!(render(frame_samples), reference, "{frame_samples}-sample frames diverge");
    }
}

#[test]
fn frame_boundaries_have_no_discontinuity() {
    // over 1000 frames; 7 is coprime to the 514-sample cycle, so the
    // boundaries visit every point of the waveform
    let frame_samples = 7;
    let samples = render(frame_samples);
    assert!(TOTAL / frame_samples >= 1000);

    let (boundary, interior): (Vec<usize>, Vec<usize>) =
        (SETTLED..TOTAL - 1).partition(|i| i % frame_samples == 0);
    let peak = |indices: &[usize]| {
        indices
            .iter()
            .map(|&i| second_difference(&samples, i))
            .fold(0.0f32, f32::max)
    };
    let boundary_peak = peak(&boundary[..]);
    let interior_peak = peak(&interior[..]);

    assert!(interior_peak > 0.0);
    assert!(
        boundary_peak <= interior_peak,
        "boundary {boundary_peak} exceeds interior {interior_peak}"
    );
}

#[test]
fn real_clock_output_ignores_frame_length() {
    let cycles = {
        let mut chip = triangle_chip(1, REAL_SAMPLE_RATE, nes_apu::CLOCK_RATE);
        chip.buffer_mut(2).unwrap().cycles_per_sample()
    };
    assert_eq!(cycles, 41);

    let reference = render_real_clock(cycles, TOTAL);
    assert!(reference.iter().any(|s| s.abs() > 0.05), "triangle never started");
    // 441-sample frames, and frames that never end on a sample boundary
    for frame_clocks in [cycles * 441, 1000, 997, 4096] {
        let split = render_real_clock(frame_clocks, TOTAL);
        let differing = split.iter().zip(&reference).filter(|(a, b)| a != b).count();
        assert_eq!(differing, 0, "{frame_clocks}-clock frames diverge");
    }
}

#[test]
fn real_clock_delivers_one_sample_per_quantized_period() {
    let mut chip = triangle_chip(64, REAL_SAMPLE_RATE, nes_apu::CLOCK_RATE);
    let clock = chip.buffer_mut(2).unwrap().clock_rate();
    let mut out = [0.0f32; 64];
    let mut delivered = 0;
    let mut elapsed = 0;
    while elapsed < clock {
        let frame = 1000.min(clock - elapsed);
        chip.end_frame(frame).unwrap();
        elapsed += frame;
        delivered += chip.buffer_mut(2).unwrap().read_samples(&mut out);
    }
    assert_eq!(delivered, REAL_SAMPLE_RATE as usize);
}
