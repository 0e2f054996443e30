//! Namco 163 wavetable expansion
//!
//! Up to eight voices play 4-bit samples out of 128 bytes of internal RAM
//! that also holds their registers. The upper half of RAM holds the
//! register blocks (eight bytes per voice, voice 7 last); the high nibble of
//! $7F selects how many voices run, counting down from voice 7. The chip
//! services one voice every 15 clocks, so each voice advances once per
//! `15 * active` clocks.

use super::check_osc;
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer};
use crate::oscillator::{ensure_forward, Voice};
use crate::{BlipError, Result};

/// Chip name
pub const NAME: &str = "namco163";

/// NES CPU clock in Hz
pub const CLOCK_RATE: u32 = 1_789_773;

/// Number of voices
pub const OSC_COUNT: usize = 8;

/// Bytes of internal RAM
pub const RAM_SIZE: usize = 128;

/// Data port (mirrored through $4FFF)
pub const DATA_ADDR: u16 = 0x4800;

/// Address latch (mirrored through $FFFF)
pub const LATCH_ADDR: u16 = 0xF800;

const REG_BASE: usize = 0x40;
const CLOCKS_PER_VOICE: BlipTime = 15;
const MAX_AMP: i32 = 8 * 15;

/// Read a 4-bit sample; even addresses take the low nibble.
#[inline]
fn sample_at(ram: &[u8; RAM_SIZE], addr: u32) -> i32 {
    let byte = ram[(addr as usize >> 1) & (RAM_SIZE - 1)];
    let nibble = if addr & 1 != 0 { byte >> 4 } else { byte & 0x0F };
    nibble as i32
}

/// Register block of one voice, decoded from RAM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct VoiceRegs {
    freq: u32,
    phase: u32,
    /// Wave length in samples
    length: u32,
    wave_addr: u32,
    volume: i32,
}

impl VoiceRegs {
    fn read(ram: &[u8; RAM_SIZE], voice: usize) -> Self {
        let r = &ram[REG_BASE + voice * 8..REG_BASE + voice * 8 + 8];
        Self {
            freq: (r[4] as u32 & 0x03) << 16 | (r[2] as u32) << 8 | r[0] as u32,
            phase: (r[5] as u32) << 16 | (r[3] as u32) << 8 | r[1] as u32,
            length: 256 - (r[4] as u32 & 0xFC),
            wave_addr: r[6] as u32,
            volume: (r[7] & 0x0F) as i32,
        }
    }

    fn store_phase(ram: &mut [u8; RAM_SIZE], voice: usize, phase: u32) {
        let base = REG_BASE + voice * 8;
        ram[base + 1] = phase as u8;
        ram[base + 3] = (phase >> 8) as u8;
        ram[base + 5] = (phase >> 16) as u8;
    }

    #[inline]
    fn wrap(&self) -> u32 {
        self.length << 16
    }

    #[inline]
    fn advance(&self, phase: u32, ticks: u64) -> u32 {
        ((phase as u64 + self.freq as u64 * ticks) % self.wrap() as u64) as u32
    }

    #[inline]
    fn amp(&self, ram: &[u8; RAM_SIZE], phase: u32) -> i32 {
        (sample_at(ram, (phase >> 16) + self.wave_addr) - 8) * self.volume
    }

    /// Average level over one pass of the wave.
    fn mean(&self, ram: &[u8; RAM_SIZE]) -> i32 {
        let sum: i32 = (0..self.length)
            .map(|i| sample_at(ram, i + self.wave_addr) - 8)
            .sum();
        sum * self.volume / self.length as i32
    }
}

/// Namco 163
#[derive(Clone, Debug)]
pub struct Namco163 {
    ram: [u8; RAM_SIZE],
    addr: u8,
    voices: [Voice; OSC_COUNT],
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Namco163 {
    /// Create a chip with cleared RAM, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            ram: [0; RAM_SIZE],
            addr: 0,
            voices: std::array::from_fn(|osc| Voice::new(Some(osc))),
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// Number of voices currently serviced.
    pub fn active_voices(&self) -> usize {
        ((self.ram[0x7F] >> 4) & 7) as usize + 1
    }

    /// Internal RAM.
    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    /// Latched RAM address, with bit 7 set when auto-increment is on.
    pub fn address(&self) -> u8 {
        self.addr
    }
}

impl SoundChip for Namco163 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn clock_rate(&self) -> u32 {
        CLOCK_RATE
    }

    fn oscillator_count(&self) -> usize {
        OSC_COUNT
    }

    fn reset(&mut self) {
        self.ram = [0; RAM_SIZE];
        self.addr = 0;
        self.voices.iter_mut().for_each(Voice::reset);
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_port(addr)?;
        if addr >= LATCH_ADDR {
            log::trace!("{NAME}: address {data:#04x} at {time}");
            self.run_until(time)?;
            self.addr = data;
            return Ok(());
        }
        self.run_until(time)?;
        let index = (self.addr & 0x7F) as usize;
        log::trace!("{NAME}: ram[{index:#04x}] = {data:#04x} at {time}");
        self.ram[index] = data;
        if self.addr & 0x80 != 0 {
            self.addr = 0x80 | (self.addr.wrapping_add(1) & 0x7F);
        }
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let active = self.active_voices();
        let period = CLOCKS_PER_VOICE * active as BlipTime;
        let Self {
            ram,
            voices,
            synth,
            outputs,
            ..
        } = self;

        for (index, voice) in voices.iter_mut().enumerate() {
            let out = outputs.route(voice.output);
            if index < OSC_COUNT - active {
                if let Some(out) = out {
                    voice.silence(synth, out, from)?;
                }
                voice.delay = 0;
                continue;
            }

            let regs = VoiceRegs::read(ram, index);
            let audible = regs.volume != 0 && regs.freq != 0;
            let out = match out {
                Some(out) if audible => out,
                out => {
                    if let Some(out) = out {
                        voice.silence(synth, out, from)?;
                    }
                    let ticks = voice.skip(from, time, period)?;
                    VoiceRegs::store_phase(ram, index, regs.advance(regs.phase, ticks as u64));
                    continue;
                }
            };

            let cycle = (regs.wrap() as u64 / regs.freq as u64).max(1) * period as u64;
            if out.is_inaudible(cycle.min(u32::MAX as u64) as u32) {
                voice.settle(synth, out, from, regs.mean(ram))?;
                let ticks = voice.skip(from, time, period)?;
                VoiceRegs::store_phase(ram, index, regs.advance(regs.phase, ticks as u64));
                continue;
            }

            let mut phase = regs.phase % regs.wrap();
            let wave = &*ram;
            voice.settle(synth, out, from, regs.amp(wave, phase))?;
            voice.step(synth, out, from, time, period, || {
                phase = regs.advance(phase, 1);
                regs.amp(wave, phase)
            })?;
            VoiceRegs::store_phase(ram, index, phase);
        }
        self.last_time = time;
        Ok(())
    }

    fn end_frame(&mut self, length: BlipTime) -> Result<()> {
        self.run_until(length)?;
        self.outputs.end_frame(length);
        self.last_time -= length;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, output: Option<usize>) -> Result<()> {
        check_osc(osc, OSC_COUNT)?;
        let time = self.last_time;
        self.outputs
            .reroute(&mut self.voices[osc], &self.synth, time, output)
    }

    fn outputs(&self) -> &OutputBank {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut OutputBank {
        &mut self.outputs
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.synth.set_volume(level)
    }

    fn set_treble(&mut self, eq: &Equalizer) -> Result<()> {
        self.synth.set_treble(eq)
    }
}

/// Fail unless `addr` is one of the chip's ports.
fn check_port(addr: u16) -> Result<()> {
    match addr {
        DATA_ADDR..=0x4FFF | LATCH_ADDR..=0xFFFF => Ok(()),
        _ => Err(BlipError::AddressOutOfRange { addr, chip: NAME }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poke(chip: &mut Namco163, start: u8, bytes: &[u8]) {
        chip.write(LATCH_ADDR, 0x80 | start).unwrap();
        for &b in bytes {
            chip.write(DATA_ADDR, b).unwrap();
        }
    }

    #[test]
    fn test_auto_increment_wraps_within_ram() {
        let mut chip = Namco163::new().unwrap();
        poke(&mut chip, 0x7E, &[1, 2, 3]);
        assert_eq!(chip.ram()[0x7E], 1);
        assert_eq!(chip.ram()[0x7F], 2);
        assert_eq!(chip.ram()[0x00], 3);
        assert_eq!(chip.address(), 0x81);

        chip.write(LATCH_ADDR, 0x10).unwrap();
        chip.write(DATA_ADDR, 9).unwrap();
        chip.write(DATA_ADDR, 8).unwrap();
        assert_eq!(chip.ram()[0x10], 8);
        assert_eq!(chip.address(), 0x10);
    }

    #[test]
    fn test_active_voice_count() {
        let mut chip = Namco163::new().unwrap();
        assert_eq!(chip.active_voices(), 1);
        poke(&mut chip, 0x7F, &[0x70]);
        assert_eq!(chip.active_voices(), 8);
    }

    #[test]
    fn test_nibbles_read_low_first() {
        let mut ram = [0u8; RAM_SIZE];
        ram[0] = 0xA3;
        assert_eq!(sample_at(&ram, 0), 3);
        assert_eq!(sample_at(&ram, 1), 0xA);
    }

    #[test]
    fn test_register_decoding() {
        let mut ram = [0u8; RAM_SIZE];
        ram[0x78..0x80].copy_from_slice(&[0x34, 0x01, 0x12, 0x02, 0xE1, 0x03, 0x20, 0x0F]);
        let regs = VoiceRegs::read(&ram, 7);
        assert_eq!(regs.freq, 0x11234);
        assert_eq!(regs.phase, 0x030201);
        assert_eq!(regs.length, 256 - 0xE0);
        assert_eq!(regs.wave_addr, 0x20);
        assert_eq!(regs.volume, 15);
    }

    #[test]
    fn test_phase_is_written_back_to_ram() {
        let mut chip = Namco163::new().unwrap();
        // voice 7: freq 0x10000 advances one sample per tick, 32 samples long
        poke(&mut chip, 0x78, &[0x00, 0x00, 0x00, 0x00, 0xE1, 0x00, 0x00, 0x0F]);
        chip.run_until(15 * 10).unwrap();
        assert_eq!(chip.ram()[0x7D], 10);
        chip.run_until(15 * 40).unwrap();
        assert_eq!(chip.ram()[0x7D], 40 % 32);
    }

    #[test]
    fn test_inactive_voices_stay_silent() {
        let mut chip = Namco163::new().unwrap();
        chip.outputs_mut().set_capacity(1024);
        poke(&mut chip, 0x40, &[0xFF, 0x00, 0xFF, 0x00, 0xE3, 0x00, 0x00, 0x0F]);
        chip.run_until(5000).unwrap();
        assert_eq!(chip.buffer_mut(0).unwrap().pending(), 0);
    }

    #[test]
    fn test_wave_mean() {
        let mut ram = [0u8; RAM_SIZE];
        ram[..4].copy_from_slice(&[0xFF, 0xFF, 0x00, 0x00]);
        let regs = VoiceRegs {
            freq: 1,
            phase: 0,
            length: 8,
            wave_addr: 0,
            volume: 2,
        };
        // four samples at +7, four at -8
        assert_eq!(regs.mean(&ram), (4 * 7 - 4 * 8) * 2 / 8);
    }

    #[test]
    fn test_ports() {
        assert!(check_port(0x4800).is_ok());
        assert!(check_port(0xF800).is_ok());
        assert!(check_port(0x5000).is_err());
        let mut chip = Namco163::new().unwrap();
        assert!(chip.write(0x4000, 0).is_err());
    }

    #[test]
    fn test_volume_change_lands_at_write_time() {
        let mut chip = Namco163::new().unwrap();
        chip.outputs_mut().set_capacity(256);
        // voice 7 at the slowest rate over a silent (level 0) table
        poke(&mut chip, 0x78, &[0x01, 0x00, 0x00, 0x00, 0xE0, 0x00, 0x00, 0x0F]);

        // ticks fall on multiples of 15; none in [5000, 5005)
        chip.write_at(5000, LATCH_ADDR, 0x7F).unwrap();
        chip.write_at(5000, DATA_ADDR, 0x01).unwrap();
        chip.run_until(5005).unwrap();
        let synth = chip.synth.clone();
        let expected = -8 * synth.delta_factor() * synth.kernel_unit() as i64;
        assert_eq!(chip.buffer_mut(7).unwrap().pending(), expected);
    }
}
