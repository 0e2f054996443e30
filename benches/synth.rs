//! Benchmarks for the synthesis hot path
//!
//! Run with: cargo bench --bench synth

use blipsynth::chips::ChipKind;
use blipsynth::export::render_mix;
use blipsynth::{Quality, SoundChip, StepSynthesizer, SynthesisBuffer};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

fn bench_offset(c: &mut Criterion) {
    let mut group = c.benchmark_group("offset");

    for quality in [Quality::Low, Quality::Medium, Quality::High] {
        let synth = StepSynthesizer::new(quality, 15).unwrap();
        let mut buf = SynthesisBuffer::with_capacity(1024);
        buf.set_sample_rate(48_000, 1_789_773).unwrap();
        let cycles = buf.cycles_per_sample();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{quality:?}")),
            &quality,
            |b, _| {
                b.iter(|| {
                    for i in 0..512u32 {
                        let delta = if i & 1 == 0 { 15 } else { -15 };
                        synth.offset(black_box(i * cycles), delta, &mut buf).unwrap();
                    }
                    buf.flush();
                });
            },
        );
    }

    group.finish();
}

fn bench_read_samples(c: &mut Criterion) {
    let mut buf = SynthesisBuffer::with_capacity(882);
    buf.set_sample_rate(44_100, 1_773_400).unwrap();
    let cycles = buf.cycles_per_sample();
    let mut out = vec![0.0f32; 882];

    c.bench_function("read_882_samples", |b| {
        b.iter(|| {
            buf.end_frame(cycles * 882);
            black_box(buf.read_samples(&mut out));
        });
    });
}

/// Set up an audible square or pulse wave on the chip's first voice.
fn start_tone(kind: ChipKind, chip: &mut dyn SoundChip) {
    let writes: &[(u16, u8)] = match kind {
        ChipKind::NesApu => &[(0x4015, 0x01), (0x4000, 0xBF), (0x4002, 0xFD), (0x4003, 0x00)],
        ChipKind::Vrc6 => &[(0x9000, 0x7F), (0x9001, 0xFD), (0x9002, 0x80)],
        ChipKind::Fme7 => &[(0xC000, 0x07), (0xE000, 0x3E), (0xC000, 0x08), (0xE000, 0x0F)],
        ChipKind::Namco163 => &[
            (0xF800, 0x80),
            (0x4800, 0xFF),
            (0xF800, 0xF8),
            (0x4800, 0x1B),
            (0xF800, 0xFA),
            (0x4800, 0x0F),
            (0xF800, 0xFC),
            (0x4800, 0xF0),
            (0xF800, 0xFF),
            (0x4800, 0x0F),
        ],
        ChipKind::Scc => &[(0x00, 0x7F), (0x80, 0xFE), (0x8A, 0x0F), (0x8F, 0x01)],
        ChipKind::GameBoy => &[(0xFF12, 0xF0), (0xFF13, 0x00), (0xFF14, 0x87)],
        ChipKind::Pokey => &[(0x00, 0x40), (0x01, 0xAF)],
        ChipKind::Sn76489 => &[(0x00, 0x80), (0x00, 0x10), (0x00, 0x90)],
        ChipKind::Ay8910 => &[(0x00, 0xFE), (0x07, 0x3E), (0x08, 0x0F)],
        ChipKind::Huc6280 => &[
            (0x800, 0x00),
            (0x801, 0xFF),
            (0x802, 0x00),
            (0x803, 0x01),
            (0x805, 0xFF),
            (0x804, 0x9F),
        ],
    };
    for &(addr, data) in writes {
        chip.write(addr, data).unwrap();
    }
}

fn bench_chip_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_882_samples");

    for kind in ChipKind::ALL {
        let mut chip = kind.build().unwrap();
        chip.set_sample_rate(44_100).unwrap();
        start_tone(kind, chip.as_mut());

        group.bench_with_input(BenchmarkId::from_parameter(kind), &kind, |b, _| {
            b.iter(|| black_box(render_mix(chip.as_mut(), 882).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_offset, bench_read_samples, bench_chip_render);
criterion_main!(benches);
