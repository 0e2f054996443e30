//! Konami SCC (051649)
//!
//! Five voices each loop a 32-byte signed waveform. Only four waveforms fit
//! in the chip's RAM; the fifth voice plays the fourth voice's table.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer};
use crate::oscillator::{ensure_forward, Voice};
use crate::Result;

/// Chip name
pub const NAME: &str = "scc";

/// MSX CPU clock in Hz
pub const CLOCK_RATE: u32 = 3_579_545;

/// Number of voices
pub const OSC_COUNT: usize = 5;

/// Bytes per waveform
pub const WAVE_SIZE: usize = 32;

/// Register space: wave RAM, then frequency, volume and enable registers
pub const REG_COUNT: usize = 0x90;

const FREQ_BASE: usize = 0x80;
const VOLUME_BASE: usize = 0x8A;
const ENABLE_REG: usize = 0x8F;
const MAX_AMP: i32 = 128 * 15;

#[derive(Clone, Debug, Default)]
struct SccVoice {
    voice: Voice,
    phase: usize,
}

/// Konami SCC
#[derive(Clone, Debug)]
pub struct Scc {
    regs: [u8; REG_COUNT],
    voices: [SccVoice; OSC_COUNT],
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Scc {
    /// Create a chip with cleared registers, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            regs: [0; REG_COUNT],
            voices: std::array::from_fn(|osc| SccVoice {
                voice: Voice::new(Some(osc)),
                phase: 0,
            }),
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// Raw register or wave RAM byte.
    pub fn register(&self, addr: usize) -> Option<u8> {
        self.regs.get(addr).copied()
    }

    /// Wave step period of a voice in clocks.
    pub fn period(&self, osc: usize) -> Result<BlipTime> {
        check_osc(osc, OSC_COUNT)?;
        Ok(period(&self.regs, osc))
    }

    /// Waveform of a voice; voices 3 and 4 share one.
    pub fn wave(&self, osc: usize) -> Result<&[u8]> {
        check_osc(osc, OSC_COUNT)?;
        let base = wave_base(osc);
        Ok(&self.regs[base..base + WAVE_SIZE])
    }
}

#[inline]
fn wave_base(osc: usize) -> usize {
    osc.min(3) * WAVE_SIZE
}

#[inline]
fn period(regs: &[u8; REG_COUNT], osc: usize) -> BlipTime {
    let lo = regs[FREQ_BASE + osc * 2] as BlipTime;
    let hi = (regs[FREQ_BASE + osc * 2 + 1] & 0x0F) as BlipTime;
    ((hi << 8) | lo) + 1
}

impl SoundChip for Scc {
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
        self.regs = [0; REG_COUNT];
        for state in &mut self.voices {
            state.voice.reset();
            state.phase = 0;
        }
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, 0x00..=(REG_COUNT as u16 - 1), NAME)?;
        self.run_until(time)?;
        log::trace!("{NAME}: write {addr:#04x} = {data:#04x} at {time}");
        self.regs[addr as usize] = data;
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let Self {
            regs,
            voices,
            synth,
            outputs,
            ..
        } = self;

        for (osc, state) in voices.iter_mut().enumerate() {
            let period = period(regs, osc);
            let volume = (regs[VOLUME_BASE + osc] & 0x0F) as i32;
            let enabled = regs[ENABLE_REG] & (1 << osc) != 0;
            let base = wave_base(osc);
            let wave = &regs[base..base + WAVE_SIZE];

            let out = match outputs.route(state.voice.output) {
                Some(out) if enabled && volume != 0 => out,
                out => {
                    if let Some(out) = out {
                        state.voice.silence(synth, out, from)?;
                    }
                    let steps = state.voice.skip(from, time, period)? as usize;
                    state.phase = (state.phase + steps) % WAVE_SIZE;
                    continue;
                }
            };

            if out.is_inaudible(period * WAVE_SIZE as BlipTime) {
                let sum: i32 = wave.iter().map(|&s| s as i8 as i32).sum();
                state.voice.settle(synth, out, from, sum * volume / WAVE_SIZE as i32)?;
                let steps = state.voice.skip(from, time, period)? as usize;
                state.phase = (state.phase + steps) % WAVE_SIZE;
                continue;
            }

            state
                .voice
                .settle(synth, out, from, wave[state.phase] as i8 as i32 * volume)?;
            let mut phase = state.phase;
            state.voice.step(synth, out, from, time, period, || {
                phase = (phase + 1) % WAVE_SIZE;
                wave[phase] as i8 as i32 * volume
            })?;
            state.phase = phase;
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
            .reroute(&mut self.voices[osc].voice, &self.synth, time, output)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlipError;

    #[test]
    fn test_fifth_voice_shares_fourth_wave() {
        let mut chip = Scc::new().unwrap();
        chip.write(0x60, 0x7F).unwrap();
        chip.write(0x7F, 0x80).unwrap();
        assert_eq!(chip.wave(4).unwrap(), chip.wave(3).unwrap());
        assert_eq!(chip.wave(4).unwrap()[0], 0x7F);
        assert_eq!(chip.wave(2).unwrap()[0], 0);
    }

    #[test]
    fn test_frequency_registers() {
        let mut chip = Scc::new().unwrap();
        chip.write(0x82, 0x34).unwrap();
        chip.write(0x83, 0xF2).unwrap(); // upper nibble ignored
        assert_eq!(chip.period(1).unwrap(), 0x235);
        assert_eq!(chip.period(0).unwrap(), 1);
    }

    #[test]
    fn test_window() {
        let mut chip = Scc::new().unwrap();
        assert!(chip.write(0x8F, 0x1F).is_ok());
        assert!(matches!(
            chip.write(0x90, 0),
            Err(BlipError::AddressOutOfRange { addr: 0x90, .. })
        ));
    }

    #[test]
    fn test_disabled_voice_is_silent() {
        let mut chip = Scc::new().unwrap();
        chip.outputs_mut().set_capacity(1024);
        for i in 0..32u16 {
            chip.write(i, if i < 16 { 0x7F } else { 0x80 }).unwrap();
        }
        chip.write(0x80, 0xFF).unwrap();
        chip.write(0x8A, 0x0F).unwrap();
        chip.run_until(8000).unwrap();
        assert_eq!(chip.buffer_mut(0).unwrap().pending(), 0);

        chip.write(0x8F, 0x01).unwrap();
        chip.run_until(8000 + 256).unwrap();
        let synth = chip.synth.clone();
        // settles on the current table sample when enabled
        let expected = 127 * 15 * synth.delta_factor() * synth.kernel_unit() as i64;
        assert_eq!(chip.buffer_mut(0).unwrap().pending(), expected);
    }

    #[test]
    fn test_volume_change_lands_at_write_time() {
        let mut chip = Scc::new().unwrap();
        chip.outputs_mut().set_capacity(128);
        chip.outputs_mut().set_bass_freq(0);
        for i in 0..32u16 {
            chip.write(i, 0x7F).unwrap();
        }
        chip.write(0x80, 0x9F).unwrap();
        chip.write(0x81, 0x0F).unwrap(); // 4000 clocks per step
        chip.write(0x8A, 0x0F).unwrap();
        chip.write(0x8F, 0x01).unwrap();
        assert_eq!(chip.period(0).unwrap(), 4000);

        // no wave step between 4000 and 8000
        chip.write_at(5000, 0x8A, 0x01).unwrap();
        chip.run_until(7000).unwrap();
        let synth = chip.synth.clone();
        let unit = synth.delta_factor() * synth.kernel_unit() as i64;
        assert_eq!(chip.buffer_mut(0).unwrap().pending(), 127 * unit);

        chip.end_frame(7000).unwrap();
        let buf = chip.buffer_mut(0).unwrap();
        let mut out = [0.0f32; 86];
        assert_eq!(buf.read_samples(&mut out), 86);
        // 5000 clocks is sample 61.7; the step is over by sample 75
        approx::assert_relative_eq!(out[55] / out[80], 15.0, max_relative = 0.01);
        assert_eq!(out[55], out[30]);
    }
}
