//! Konami VRC6 expansion audio
//!
//! Two pulse voices with eight duty settings and a digitized "gate" mode,
//! plus a sawtooth built from a 6-bit accumulator. Each voice exposes three
//! registers at $9000, $A000 and $B000; $9003 controls halting and the
//! frequency scaling used by test modes.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::{BlipError, Result};

/// Chip name
pub const NAME: &str = "vrc6";

/// NES CPU clock in Hz
pub const CLOCK_RATE: u32 = 1_789_773;

/// Number of oscillators (pulse 1, pulse 2, saw)
pub const OSC_COUNT: usize = 3;

const REGS_PER_OSC: usize = 3;
const FREQ_CTRL_ADDR: u16 = 0x9003;
const SAW_STEPS: u32 = 7;

/// Largest pulse level
const PULSE_MAX: i32 = 15;
/// Largest saw level after the 3-bit truncation
const SAW_MAX: i32 = 31;

#[derive(Clone, Debug)]
struct Vrc6Osc {
    regs: [u8; REGS_PER_OSC],
    voice: Voice,
    /// Duty position for pulses, steps until reset for the saw
    phase: u32,
    /// Saw accumulator
    accum: u8,
}

impl Vrc6Osc {
    fn new(osc: usize) -> Self {
        Self {
            regs: [0; REGS_PER_OSC],
            voice: Voice::new(Some(osc)),
            phase: 1,
            accum: 0,
        }
    }

    #[inline]
    fn enabled(&self, halted: bool) -> bool {
        self.regs[2] & 0x80 != 0 && !halted
    }

    /// Divider period in CPU clocks, after the $9003 scaling.
    #[inline]
    fn period(&self, freq_shift: u32) -> BlipTime {
        let raw = ((self.regs[2] as u32 & 0x0F) << 8) | self.regs[1] as u32;
        (raw >> freq_shift) + 1
    }

    fn run_pulse(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        freq_shift: u32,
        halted: bool,
    ) -> Result<()> {
        let period = self.period(freq_shift);
        let volume = (self.regs[0] & 0x0F) as i32;
        let enabled = self.enabled(halted);

        let Some(out) = out else {
            if enabled {
                let steps = self.voice.skip(from, to, period)?;
                self.phase = (self.phase + steps) & 15;
            }
            return Ok(());
        };
        if !enabled {
            self.voice.silence(synth, out, from)?;
            self.voice.delay = 0;
            return Ok(());
        }

        if self.regs[0] & 0x80 != 0 {
            // gate mode outputs the volume as a DAC level
            self.voice.settle(synth, out, from, volume)?;
            let steps = self.voice.skip(from, to, period)?;
            self.phase = (self.phase + steps) & 15;
            return Ok(());
        }

        let duty = ((self.regs[0] >> 4) & 7) as u32 + 1;
        if volume == 0 || out.is_inaudible(period * 16) {
            self.voice.settle(synth, out, from, volume * duty as i32 / 16)?;
            let steps = self.voice.skip(from, to, period)?;
            self.phase = (self.phase + steps) & 15;
            return Ok(());
        }

        let amp_at = move |phase: u32| if phase < duty { volume } else { 0 };
        self.voice.settle(synth, out, from, amp_at(self.phase))?;
        let mut phase = self.phase;
        self.voice.step(synth, out, from, to, period, || {
            phase = (phase + 1) & 15;
            amp_at(phase)
        })?;
        self.phase = phase;
        Ok(())
    }

    /// Advance the saw by one accumulator step, returning its output level.
    #[inline]
    fn saw_step(phase: &mut u32, accum: &mut u8, rate: u8) -> i32 {
        *phase -= 1;
        if *phase == 0 {
            *phase = SAW_STEPS;
            *accum = 0;
        }
        let level = (*accum >> 3) as i32;
        *accum = accum.wrapping_add(rate);
        level
    }

    fn run_saw(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        freq_shift: u32,
        halted: bool,
    ) -> Result<()> {
        let period = self.period(freq_shift) * 2;
        let rate = self.regs[0] & 0x3F;
        let enabled = self.enabled(halted);

        let out = match out {
            Some(out) if enabled && rate != 0 => out,
            out => {
                if let Some(out) = out {
                    self.voice.silence(synth, out, from)?;
                }
                if enabled {
                    let steps = self.voice.skip(from, to, period)?;
                    for _ in 0..steps % SAW_STEPS {
                        Self::saw_step(&mut self.phase, &mut self.accum, rate);
                    }
                } else {
                    ensure_forward(from, to)?;
                    self.voice.delay = 0;
                }
                return Ok(());
            }
        };

        if out.is_inaudible(period * SAW_STEPS) {
            let mean = (0..SAW_STEPS as i32).map(|k| (k * rate as i32) >> 3).sum::<i32>() / SAW_STEPS as i32;
            self.voice.settle(synth, out, from, mean)?;
            let steps = self.voice.skip(from, to, period)?;
            for _ in 0..steps % SAW_STEPS {
                Self::saw_step(&mut self.phase, &mut self.accum, rate);
            }
            return Ok(());
        }

        let (mut phase, mut accum) = (self.phase, self.accum);
        self.voice.step(synth, out, from, to, period, || {
            Self::saw_step(&mut phase, &mut accum, rate)
        })?;
        self.phase = phase;
        self.accum = accum;
        Ok(())
    }
}

/// Konami VRC6
#[derive(Clone, Debug)]
pub struct Vrc6 {
    oscs: [Vrc6Osc; OSC_COUNT],
    freq_ctrl: u8,
    pulse_synth: StepSynthesizer,
    saw_synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Vrc6 {
    /// Create a chip at power-up state, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            oscs: std::array::from_fn(Vrc6Osc::new),
            freq_ctrl: 0,
            pulse_synth: StepSynthesizer::new(Quality::Medium, PULSE_MAX)?,
            saw_synth: StepSynthesizer::new(Quality::Medium, SAW_MAX)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// Register value of a voice.
    pub fn register(&self, osc: usize, reg: usize) -> Result<u8> {
        check_osc(osc, OSC_COUNT)?;
        check_osc(reg, REGS_PER_OSC)?;
        Ok(self.oscs[osc].regs[reg])
    }

    fn freq_shift(&self) -> u32 {
        if self.freq_ctrl & 0x04 != 0 {
            8
        } else if self.freq_ctrl & 0x02 != 0 {
            4
        } else {
            0
        }
    }

    fn decode(addr: u16) -> Option<(usize, usize)> {
        let osc = match addr & 0xF000 {
            0x9000 => 0,
            0xA000 => 1,
            0xB000 => 2,
            _ => return None,
        };
        let reg = (addr & 0x0FFF) as usize;
        (reg < REGS_PER_OSC).then_some((osc, reg))
    }
}

impl SoundChip for Vrc6 {
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
        for (osc, state) in self.oscs.iter_mut().enumerate() {
            let output = state.voice.output;
            *state = Vrc6Osc::new(osc);
            state.voice.output = output;
        }
        self.freq_ctrl = 0;
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, 0x9000..=0xB002, NAME)?;
        if addr == FREQ_CTRL_ADDR {
            self.run_until(time)?;
            log::trace!("{NAME}: frequency control = {data:#04x} at {time}");
            self.freq_ctrl = data & 0x07;
            return Ok(());
        }
        let (osc, reg) =
            Self::decode(addr).ok_or(BlipError::AddressOutOfRange { addr, chip: NAME })?;
        self.run_until(time)?;
        log::trace!("{NAME}: write {addr:#06x} = {data:#04x} at {time}");
        let state = &mut self.oscs[osc];
        if reg == 2 && data & 0x80 == 0 && osc < 2 {
            state.phase = 0;
        }
        state.regs[reg] = data;
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let freq_shift = self.freq_shift();
        let halted = self.freq_ctrl & 0x01 != 0;
        let Self {
            oscs,
            pulse_synth,
            saw_synth,
            outputs,
            ..
        } = self;
        let [pulse1, pulse2, saw] = oscs;
        pulse1.run_pulse(pulse_synth, outputs.route(pulse1.voice.output), from, time, freq_shift, halted)?;
        pulse2.run_pulse(pulse_synth, outputs.route(pulse2.voice.output), from, time, freq_shift, halted)?;
        saw.run_saw(saw_synth, outputs.route(saw.voice.output), from, time, freq_shift, halted)?;
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
        let synth = if osc == 2 { &self.saw_synth } else { &self.pulse_synth };
        self.outputs
            .reroute(&mut self.oscs[osc].voice, synth, time, output)
    }

    fn outputs(&self) -> &OutputBank {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut OutputBank {
        &mut self.outputs
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.pulse_synth.set_volume(level)?;
        self.saw_synth.set_volume(level)
    }

    fn set_treble(&mut self, eq: &Equalizer) -> Result<()> {
        self.pulse_synth.set_treble(eq)?;
        self.saw_synth.set_treble(eq)
    }
}
