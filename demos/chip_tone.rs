//! Render a test tone from any emulated chip to a WAV file.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example chip_tone --features export-wav -- nes_apu tone.wav
//! cargo run --example chip_tone --features export-wav -- sn76489 tone.wav --seconds 2 --config synth.json
//! ```

use anyhow::{bail, Context, Result};
use blipsynth::chips::ChipKind;
use blipsynth::export::wav::render_to_wav;
use blipsynth::{SoundChip, SynthConfig};
use std::env;
use std::path::PathBuf;

fn print_usage() {
    println!("Chip tone renderer");
    println!();
    println!("USAGE:");
    println!("  chip_tone <CHIP> <OUTPUT.wav> [--seconds <n>] [--config <synth.json>]");
    println!();
    println!("CHIPS:");
    for kind in ChipKind::ALL {
        println!("  {kind}");
    }
}

struct Options {
    kind: ChipKind,
    output: PathBuf,
    seconds: f32,
    config: SynthConfig,
}

fn parse_args(args: &[String]) -> Result<Options> {
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(0);
    }

    let kind: ChipKind = args[0].parse()?;
    let output = PathBuf::from(&args[1]);
    let mut seconds = 1.0;
    let mut config = SynthConfig::default();

    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        let value = rest
            .next()
            .with_context(|| format!("{flag} needs a value"))?;
        match flag.as_str() {
            "--seconds" => seconds = value.parse().context("invalid --seconds")?,
            "--config" => {
                let json = std::fs::read_to_string(value)
                    .with_context(|| format!("cannot read {value}"))?;
                config = SynthConfig::from_json(&json)?;
            }
            other => bail!("unknown option {other}"),
        }
    }

    Ok(Options {
        kind,
        output,
        seconds,
        config,
    })
}

/// Program a roughly 440 Hz tone on the chip's first voice.
fn program_tone(kind: ChipKind, chip: &mut dyn SoundChip) -> Result<()> {
    let writes: &[(u16, u8)] = match kind {
        // 1789773 / (16 * 254) Hz
        ChipKind::NesApu => &[(0x4015, 0x01), (0x4000, 0xBF), (0x4002, 0xFD), (0x4003, 0x08)],
        ChipKind::Vrc6 => &[(0x9000, 0x7F), (0x9001, 0xFD), (0x9002, 0x80)],
        ChipKind::Fme7 => &[
            (0xC000, 0x00),
            (0xE000, 0xFE),
            (0xC000, 0x07),
            (0xE000, 0x3E),
            (0xC000, 0x08),
            (0xE000, 0x0F),
        ],
        ChipKind::Namco163 => &[
            // square wave in the first 8 bytes
            (0xF800, 0x80),
            (0x4800, 0xFF),
            (0x4800, 0xFF),
            (0x4800, 0xFF),
            (0x4800, 0xFF),
            (0x4800, 0x00),
            (0x4800, 0x00),
            (0x4800, 0x00),
            (0x4800, 0x00),
            // voice 7: frequency 0x0F1B, length 16, wave at 0, volume 15
            (0xF800, 0xF8),
            (0x4800, 0x1B),
            (0x4800, 0x00),
            (0x4800, 0x0F),
            (0x4800, 0x00),
            (0x4800, 0xF0),
            (0x4800, 0x00),
            (0x4800, 0x00),
            (0x4800, 0x0F),
        ],
        ChipKind::Scc => &[(0x00, 0x7F), (0x10, 0x80), (0x80, 0xFE), (0x8A, 0x0F), (0x8F, 0x01)],
        ChipKind::GameBoy => &[(0xFF11, 0x80), (0xFF12, 0xF0), (0xFF13, 0xD6), (0xFF14, 0x86)],
        ChipKind::Pokey => &[(0x00, 0x47), (0x01, 0xAF)],
        ChipKind::Sn76489 => &[(0x00, 0x8E), (0x00, 0x0F), (0x00, 0x90)],
        ChipKind::Ay8910 => &[(0x00, 0xFE), (0x07, 0x3E), (0x08, 0x0F)],
        ChipKind::Huc6280 => &[
            (0x800, 0x00),
            (0x801, 0xFF),
            (0x802, 0xFE),
            (0x803, 0x00),
            (0x805, 0xFF),
            (0x804, 0x9F),
        ],
    };
    for &(addr, data) in writes {
        chip.write(addr, data)
            .with_context(|| format!("{kind}: write {addr:#06x}"))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let opts = parse_args(&args)?;

    let mut chip = opts.kind.build()?;
    program_tone(opts.kind, chip.as_mut())?;

    if opts.seconds <= 0.0 {
        bail!("--seconds must be positive");
    }
    let samples = (opts.seconds * opts.config.sample_rate as f32) as usize;
    render_to_wav(chip.as_mut(), samples, &opts.output, &opts.config)?;

    println!(
        "Wrote {:.2}s of {} to {}",
        opts.seconds,
        opts.kind,
        opts.output.display()
    );
    Ok(())
}
