//! Ricoh 2A03 APU (NES)
//!
//! Two pulse voices with envelope and sweep, a triangle with a linear
//! counter, and an LFSR noise voice. Envelopes, sweeps and length counters
//! are clocked by the frame sequencer every [`FRAME_PERIOD`] cycles in either
//! the 4-step or 5-step pattern selected through $4017.
//!
//! The DMC registers ($4010-$4013) are accepted and stored but the delta
//! modulation channel itself is not emulated.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::{BlipError, Result};

/// Chip name
pub const NAME: &str = "nes_apu";

/// NTSC CPU clock in Hz
pub const CLOCK_RATE: u32 = 1_789_773;

/// First register address
pub const START_ADDR: u16 = 0x4000;

/// Last register address
pub const END_ADDR: u16 = 0x4017;

/// Number of oscillators (pulse 1, pulse 2, triangle, noise)
pub const OSC_COUNT: usize = 4;

/// CPU cycles between frame sequencer steps
pub const FRAME_PERIOD: BlipTime = 7457;

const STATUS_ADDR: u16 = 0x4015;
const FRAME_COUNTER_ADDR: u16 = 0x4017;

/// Length counter load values indexed by bits 3-7 of the fourth register
pub const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, //
    12, 16, 24, 18, 48, 20, 96, 22, 192, 24, 72, 26, 16, 28, 32, 30,
];

/// Noise timer periods in CPU cycles
pub const NOISE_PERIODS: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Triangle output over one 32-step cycle
const TRIANGLE_STEPS: [i32; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, //
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

/// (quarter frame, half frame) per sequencer step
const FOUR_STEP: [(bool, bool); 4] = [(true, false), (true, true), (true, false), (true, true)];
const FIVE_STEP: [(bool, bool); 5] = [
    (true, false),
    (true, true),
    (true, false),
    (false, false),
    (true, true),
];

const MAX_AMP: i32 = 15;

/// Register block and length counter shared by every voice
#[derive(Clone, Debug, Default)]
struct Channel {
    regs: [u8; 4],
    reg_written: [bool; 4],
    length_counter: u8,
    voice: Voice,
}

impl Channel {
    fn new(osc: usize) -> Self {
        Self {
            voice: Voice::new(Some(osc)),
            ..Self::default()
        }
    }

    /// 11-bit timer value from registers 2 and 3
    #[inline]
    fn period(&self) -> u32 {
        ((self.regs[3] as u32 & 7) << 8) | self.regs[2] as u32
    }

    fn clock_length(&mut self, halt_mask: u8) {
        if self.length_counter != 0 && self.regs[0] & halt_mask == 0 {
            self.length_counter -= 1;
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Envelope {
    level: u8,
    delay: i8,
}

impl Envelope {
    fn clock(&mut self, ch: &mut Channel) {
        let period = (ch.regs[0] & 15) as i8;
        if ch.reg_written[3] {
            ch.reg_written[3] = false;
            self.delay = period;
            self.level = 15;
        } else {
            self.delay -= 1;
            if self.delay < 0 {
                self.delay = period;
                if self.level != 0 || ch.regs[0] & 0x20 != 0 {
                    self.level = self.level.wrapping_sub(1) & 15;
                }
            }
        }
    }

    fn volume(&self, ch: &Channel) -> i32 {
        if ch.length_counter == 0 {
            0
        } else if ch.regs[0] & 0x10 != 0 {
            (ch.regs[0] & 15) as i32
        } else {
            self.level as i32
        }
    }
}

#[derive(Clone, Debug)]
struct Pulse {
    ch: Channel,
    env: Envelope,
    phase: u32,
    sweep_delay: i8,
    /// Pulse 1 negates in ones' complement
    negate_adjust: i32,
}

impl Pulse {
    fn new(osc: usize) -> Self {
        Self {
            ch: Channel::new(osc),
            env: Envelope::default(),
            phase: 0,
            sweep_delay: 0,
            negate_adjust: if osc == 0 { -1 } else { 0 },
        }
    }

    fn clock_sweep(&mut self) {
        let sweep = self.ch.regs[1];
        self.sweep_delay -= 1;
        if self.sweep_delay < 0 {
            self.ch.reg_written[1] = true;
            let period = self.ch.period() as i32;
            let shift = sweep & 7;
            if shift != 0 && sweep & 0x80 != 0 && period >= 8 {
                let mut offset = period >> shift;
                if sweep & 0x08 != 0 {
                    offset = self.negate_adjust - offset;
                }
                let target = period + offset;
                if target < 0x800 {
                    self.ch.regs[2] = target as u8;
                    self.ch.regs[3] = (self.ch.regs[3] & !7) | ((target >> 8) & 7) as u8;
                }
            }
        }
        if self.ch.reg_written[1] {
            self.ch.reg_written[1] = false;
            self.sweep_delay = ((sweep >> 4) & 7) as i8;
        }
    }

    fn advance(&mut self, from: BlipTime, to: BlipTime, timer_period: BlipTime) -> Result<()> {
        let steps = self.ch.voice.skip(from, to, timer_period)?;
        self.phase = (self.phase + steps) & 7;
        Ok(())
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
    ) -> Result<()> {
        let period = self.ch.period();
        let timer_period = (period + 1) * 2;
        let Some(out) = out else {
            return self.advance(from, to, timer_period);
        };

        let sweep_offset = if self.ch.regs[1] & 0x08 != 0 {
            0
        } else {
            period >> (self.ch.regs[1] & 7)
        };
        let volume = self.env.volume(&self.ch);
        if volume == 0 || period < 8 || period + sweep_offset >= 0x800 {
            self.ch.voice.silence(synth, out, from)?;
            return self.advance(from, to, timer_period);
        }

        // duty 3 is duty 1 inverted
        let (duty, inverted) = match self.ch.regs[0] >> 6 {
            3 => (2, true),
            d => (1u32 << d, false),
        };
        if out.is_inaudible(timer_period * 8) {
            let high = if inverted { 8 - duty } else { duty };
            self.ch.voice.settle(synth, out, from, volume * high as i32 / 8)?;
            return self.advance(from, to, timer_period);
        }

        let amp_at = move |phase: u32| if (phase < duty) != inverted { volume } else { 0 };
        self.ch.voice.settle(synth, out, from, amp_at(self.phase))?;
        let mut phase = self.phase;
        self.ch.voice.step(synth, out, from, to, timer_period, || {
            phase = (phase + 1) & 7;
            amp_at(phase)
        })?;
        self.phase = phase;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Triangle {
    ch: Channel,
    phase: usize,
    linear_counter: u8,
}

impl Triangle {
    fn clock_linear_counter(&mut self) {
        if self.ch.reg_written[3] {
            self.linear_counter = self.ch.regs[0] & 0x7F;
        } else if self.linear_counter != 0 {
            self.linear_counter -= 1;
        }
        if self.ch.regs[0] & 0x80 == 0 {
            self.ch.reg_written[3] = false;
        }
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
    ) -> Result<()> {
        let timer_period = self.ch.period() + 1;
        let active = self.ch.length_counter != 0 && self.linear_counter != 0;

        // a halted sequencer holds its level
        if !active {
            self.ch.voice.skip(from, to, timer_period)?;
            return Ok(());
        }
        let Some(out) = out else {
            let steps = self.ch.voice.skip(from, to, timer_period)? as usize;
            self.phase = (self.phase + steps) & 31;
            return Ok(());
        };

        if timer_period < 3 || out.is_inaudible(timer_period * 32) {
            self.ch.voice.settle(synth, out, from, MAX_AMP / 2)?;
            let steps = self.ch.voice.skip(from, to, timer_period)? as usize;
            self.phase = (self.phase + steps) & 31;
            return Ok(());
        }

        self.ch.voice.settle(synth, out, from, TRIANGLE_STEPS[self.phase])?;
        let mut phase = self.phase;
        self.ch.voice.step(synth, out, from, to, timer_period, || {
            phase = (phase + 1) & 31;
            TRIANGLE_STEPS[phase]
        })?;
        self.phase = phase;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Noise {
    ch: Channel,
    env: Envelope,
    /// 15-bit shift register
    shifter: u16,
}

/// Shift the 15-bit noise register once; mode 1 taps bit 6 instead of bit 1.
#[inline]
pub fn clock_noise(shifter: u16, short: bool) -> u16 {
    let tap = if short { 6 } else { 1 };
    let feedback = (shifter ^ (shifter >> tap)) & 1;
    (shifter >> 1) | (feedback << 14)
}

impl Noise {
    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
    ) -> Result<()> {
        let period = NOISE_PERIODS[(self.ch.regs[2] & 15) as usize] as BlipTime;
        let short = self.ch.regs[2] & 0x80 != 0;
        let volume = self.env.volume(&self.ch);

        let out = match out {
            Some(out) if volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.ch.voice.silence(synth, out, from)?;
                }
                let steps = self.ch.voice.skip(from, to, period)?;
                for _ in 0..steps {
                    self.shifter = clock_noise(self.shifter, short);
                }
                return Ok(());
            }
        };

        let amp_at = move |shifter: u16| if shifter & 1 == 0 { volume } else { 0 };
        self.ch.voice.settle(synth, out, from, amp_at(self.shifter))?;
        let mut shifter = self.shifter;
        self.ch.voice.step(synth, out, from, to, period, || {
            shifter = clock_noise(shifter, short);
            amp_at(shifter)
        })?;
        self.shifter = shifter;
        Ok(())
    }
}

fn power_up_voices() -> ([Pulse; 2], Triangle, Noise) {
    let triangle = Triangle {
        ch: Channel::new(2),
        phase: 0,
        linear_counter: 0,
    };
    let noise = Noise {
        ch: Channel::new(3),
        env: Envelope::default(),
        shifter: 1,
    };
    ([Pulse::new(0), Pulse::new(1)], triangle, noise)
}

/// Ricoh 2A03 APU
#[derive(Clone, Debug)]
pub struct NesApu {
    pulses: [Pulse; 2],
    triangle: Triangle,
    noise: Noise,
    square_synth: StepSynthesizer,
    triangle_synth: StepSynthesizer,
    noise_synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
    next_frame: BlipTime,
    frame_step: usize,
    five_step: bool,
    enables: u8,
    dmc_regs: [u8; 4],
}

impl NesApu {
    /// Create an APU at power-up state, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        let (pulses, triangle, noise) = power_up_voices();
        Ok(Self {
            pulses,
            triangle,
            noise,
            square_synth: StepSynthesizer::new(Quality::High, MAX_AMP)?,
            triangle_synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            noise_synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
            next_frame: FRAME_PERIOD,
            frame_step: 0,
            five_step: false,
            enables: 0,
            dmc_regs: [0; 4],
        })
    }

    fn channel_mut(&mut self, osc: usize) -> &mut Channel {
        match osc {
            0 | 1 => &mut self.pulses[osc].ch,
            2 => &mut self.triangle.ch,
            _ => &mut self.noise.ch,
        }
    }

    fn channel(&self, osc: usize) -> &Channel {
        match osc {
            0 | 1 => &self.pulses[osc].ch,
            2 => &self.triangle.ch,
            _ => &self.noise.ch,
        }
    }

    /// Remaining length count of a voice.
    pub fn length_counter(&self, osc: usize) -> Result<u8> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.channel(osc).length_counter)
    }

    /// 11-bit timer value of a voice.
    pub fn timer_period(&self, osc: usize) -> Result<u32> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.channel(osc).period())
    }

    /// Value last written to a DMC register ($4010-$4013).
    pub fn dmc_register(&self, index: usize) -> Option<u8> {
        self.dmc_regs.get(index).copied()
    }

    fn run_oscillators(&mut self, to: BlipTime) -> Result<()> {
        let from = self.last_time;
        let Self {
            pulses,
            triangle,
            noise,
            square_synth,
            triangle_synth,
            noise_synth,
            outputs,
            ..
        } = self;
        for pulse in pulses.iter_mut() {
            let out = outputs.route(pulse.ch.voice.output);
            pulse.run(square_synth, out, from, to)?;
        }
        triangle.run(triangle_synth, outputs.route(triangle.ch.voice.output), from, to)?;
        noise.run(noise_synth, outputs.route(noise.ch.voice.output), from, to)
    }

    fn clock_quarter_frame(&mut self) {
        let Self {
            pulses,
            triangle,
            noise,
            ..
        } = self;
        for pulse in pulses.iter_mut() {
            pulse.env.clock(&mut pulse.ch);
        }
        noise.env.clock(&mut noise.ch);
        triangle.clock_linear_counter();
    }

    fn clock_half_frame(&mut self) {
        for pulse in &mut self.pulses {
            pulse.ch.clock_length(0x20);
            pulse.clock_sweep();
        }
        self.triangle.ch.clock_length(0x80);
        self.noise.ch.clock_length(0x20);
    }

    fn clock_frame(&mut self) {
        let (quarter, half) = if self.five_step {
            FIVE_STEP[self.frame_step % FIVE_STEP.len()]
        } else {
            FOUR_STEP[self.frame_step % FOUR_STEP.len()]
        };
        let steps = if self.five_step { FIVE_STEP.len() } else { FOUR_STEP.len() };
        self.frame_step = (self.frame_step + 1) % steps;
        if quarter {
            self.clock_quarter_frame();
        }
        if half {
            self.clock_half_frame();
        }
    }

    fn write_register(&mut self, addr: u16, data: u8) {
        match addr {
            0x4000..=0x400F => {
                let osc = ((addr - START_ADDR) / 4) as usize;
                let reg = (addr & 3) as usize;
                let enabled = self.enables & (1 << osc) != 0;
                let ch = self.channel_mut(osc);
                ch.regs[reg] = data;
                ch.reg_written[reg] = true;
                if reg == 3 {
                    if enabled {
                        ch.length_counter = LENGTH_TABLE[(data >> 3) as usize];
                    }
                    if osc < 2 {
                        self.pulses[osc].phase = 7;
                    }
                }
            }
            0x4010..=0x4013 => {
                self.dmc_regs[(addr - 0x4010) as usize] = data;
                log::warn!("{NAME}: DMC register {addr:#06x} stored but not emulated");
            }
            STATUS_ADDR => {
                self.enables = data & 0x1F;
                for osc in 0..OSC_COUNT {
                    if data & (1 << osc) == 0 {
                        self.channel_mut(osc).length_counter = 0;
                    }
                }
            }
            FRAME_COUNTER_ADDR => {
                self.five_step = data & 0x80 != 0;
                self.frame_step = 0;
                self.next_frame = self.last_time + FRAME_PERIOD;
                if self.five_step {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
            }
            _ => {}
        }
    }
}

impl SoundChip for NesApu {
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
        let routes: Vec<_> = (0..OSC_COUNT).map(|osc| self.channel(osc).voice.output).collect();
        (self.pulses, self.triangle, self.noise) = power_up_voices();
        self.last_time = 0;
        self.next_frame = FRAME_PERIOD;
        self.frame_step = 0;
        self.five_step = false;
        self.enables = 0;
        self.dmc_regs = [0; 4];
        for (osc, output) in routes.into_iter().enumerate() {
            self.channel_mut(osc).voice.output = output;
        }
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, START_ADDR..=END_ADDR, NAME)?;
        if addr == 0x4014 || addr == 0x4016 {
            return Err(BlipError::AddressOutOfRange { addr, chip: NAME });
        }
        self.run_until(time)?;
        log::trace!("{NAME}: write {addr:#06x} = {data:#04x} at {time}");
        self.write_register(addr, data);
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        while self.last_time < time {
            let end = self.next_frame.min(time);
            self.run_oscillators(end)?;
            self.last_time = end;
            if end == self.next_frame {
                self.next_frame += FRAME_PERIOD;
                self.clock_frame();
            }
        }
        Ok(())
    }

    fn end_frame(&mut self, length: BlipTime) -> Result<()> {
        self.run_until(length)?;
        self.outputs.end_frame(length);
        self.last_time -= length;
        self.next_frame -= length;
        Ok(())
    }

    fn set_output(&mut self, osc: usize, output: Option<usize>) -> Result<()> {
        check_osc(osc, OSC_COUNT)?;
        let time = self.last_time;
        let Self {
            pulses,
            triangle,
            noise,
            square_synth,
            triangle_synth,
            noise_synth,
            outputs,
            ..
        } = self;
        match osc {
            0 | 1 => outputs.reroute(&mut pulses[osc].ch.voice, square_synth, time, output),
            2 => outputs.reroute(&mut triangle.ch.voice, triangle_synth, time, output),
            _ => outputs.reroute(&mut noise.ch.voice, noise_synth, time, output),
        }
    }

    fn outputs(&self) -> &OutputBank {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut OutputBank {
        &mut self.outputs
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.square_synth.set_volume(level)?;
        self.triangle_synth.set_volume(level)?;
        self.noise_synth.set_volume(level)
    }

    fn set_treble(&mut self, eq: &Equalizer) -> Result<()> {
        self.square_synth.set_treble(eq)?;
        self.triangle_synth.set_treble(eq)?;
        self.noise_synth.set_treble(eq)
    }
}
