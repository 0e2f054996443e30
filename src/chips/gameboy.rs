//! Nintendo Game Boy APU
//!
//! Two square voices (the first with a frequency sweep), a 4-bit wave voice
//! reading sixteen bytes of wave RAM, and a noise voice driven by a 15-bit
//! or 7-bit LFSR. A 256 Hz sequencer clocks the length counters, and
//! derived ticks clock the volume envelopes (64 Hz) and the sweep (128 Hz).
//!
//! The output is mixed to mono: a voice sounds when NR51 routes it to
//! either side, scaled by the louder of the two NR50 master volumes.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::Result;

/// Chip name
pub const NAME: &str = "gameboy";

/// CPU clock in Hz
pub const CLOCK_RATE: u32 = 4_194_304;

/// Number of oscillators (square 1, square 2, wave, noise)
pub const OSC_COUNT: usize = 4;

/// First register (NR10)
pub const START_ADDR: u16 = 0xFF10;

/// Last byte of wave RAM
pub const END_ADDR: u16 = 0xFF3F;

/// Clocks between 256 Hz sequencer ticks
pub const FRAME_PERIOD: BlipTime = CLOCK_RATE / 256;

const NR10: usize = 0x00;
const NR30: usize = 0x0A;
const NR32: usize = 0x0C;
const NR43: usize = 0x12;
const NR50: usize = 0x14;
const NR51: usize = 0x15;
const NR52: usize = 0x16;
const WAVE_RAM: usize = 0x20;
const REG_COUNT: usize = (END_ADDR - START_ADDR) as usize + 1;

/// Power-on register state after the boot ROM
const BOOT_NR50: u8 = 0x77;
const BOOT_NR51: u8 = 0xF3;

const LFSR_SEED: u16 = 0x7FFF;
/// Eighths of the cycle spent high, by duty setting
const DUTY_HIGH: [u32; 4] = [1, 2, 4, 6];
const WAVE_STEPS: usize = 32;
/// Largest level (15) times the largest master volume (8)
const MAX_AMP: i32 = 15 * 8;

/// Shift the noise LFSR once; 7-bit mode also feeds bit 6.
#[inline]
pub fn clock_lfsr(lfsr: u16, short: bool) -> u16 {
    let feedback = (lfsr ^ (lfsr >> 1)) & 1;
    let mut next = (lfsr >> 1) | (feedback << 14);
    if short {
        next = (next & !0x40) | (feedback << 6);
    }
    next
}

/// Enable flag and length counter shared by every voice
#[derive(Clone, Debug, Default)]
struct GbChannel {
    voice: Voice,
    enabled: bool,
    length: u16,
    length_enabled: bool,
}

impl GbChannel {
    fn new(osc: usize) -> Self {
        Self {
            voice: Voice::new(Some(osc)),
            ..Self::default()
        }
    }

    fn clock_length(&mut self) {
        if self.length_enabled && self.length != 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    /// Handle an NRx4 write: length enable and, with bit 7, trigger.
    fn control(&mut self, data: u8, full_length: u16, dac_on: bool) -> bool {
        self.length_enabled = data & 0x40 != 0;
        if data & 0x80 == 0 {
            return false;
        }
        self.enabled = dac_on;
        if self.length == 0 {
            self.length = full_length;
        }
        true
    }
}

#[derive(Clone, Debug, Default)]
struct Envelope {
    period: u8,
    up: bool,
    volume: u8,
    delay: u8,
}

impl Envelope {
    fn trigger(&mut self, nrx2: u8) {
        self.volume = nrx2 >> 4;
        self.up = nrx2 & 0x08 != 0;
        self.period = nrx2 & 0x07;
        self.delay = self.period;
    }

    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        self.delay = self.delay.saturating_sub(1);
        if self.delay == 0 {
            self.delay = self.period;
            if self.up && self.volume < 15 {
                self.volume += 1;
            } else if !self.up && self.volume > 0 {
                self.volume -= 1;
            }
        }
    }
}

#[inline]
fn dac_on(nrx2: u8) -> bool {
    nrx2 & 0xF8 != 0
}

#[derive(Clone, Debug)]
struct Square {
    ch: GbChannel,
    env: Envelope,
    freq: u16,
    duty: u8,
    phase: u32,
    shadow: u16,
    sweep_delay: u8,
}

impl Square {
    fn new(osc: usize) -> Self {
        Self {
            ch: GbChannel::new(osc),
            env: Envelope::default(),
            freq: 0,
            duty: 2,
            phase: 0,
            shadow: 0,
            sweep_delay: 0,
        }
    }

    #[inline]
    fn period(&self) -> BlipTime {
        (2048 - self.freq as BlipTime) * 4
    }

    fn sweep_target(&self, nr10: u8) -> u16 {
        let delta = self.shadow >> (nr10 & 7);
        if nr10 & 0x08 != 0 {
            self.shadow.saturating_sub(delta)
        } else {
            self.shadow + delta
        }
    }

    fn trigger_sweep(&mut self, nr10: u8) {
        self.shadow = self.freq;
        self.sweep_delay = match (nr10 >> 4) & 7 {
            0 => 8,
            p => p,
        };
        if nr10 & 7 != 0 && self.sweep_target(nr10) > 2047 {
            self.ch.enabled = false;
        }
    }

    fn clock_sweep(&mut self, nr10: u8) {
        let period = (nr10 >> 4) & 7;
        if period == 0 {
            return;
        }
        self.sweep_delay = self.sweep_delay.saturating_sub(1);
        if self.sweep_delay != 0 {
            return;
        }
        self.sweep_delay = period;
        let target = self.sweep_target(nr10);
        if target > 2047 {
            self.ch.enabled = false;
        } else if nr10 & 7 != 0 {
            self.shadow = target;
            self.freq = target;
        }
    }

    fn advance(&mut self, from: BlipTime, to: BlipTime) -> Result<()> {
        let steps = self.ch.voice.skip(from, to, self.period())?;
        self.phase = (self.phase + steps) & 7;
        Ok(())
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        master: i32,
    ) -> Result<()> {
        let volume = self.env.volume as i32 * master;
        let out = match out {
            Some(out) if self.ch.enabled && volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.ch.voice.silence(synth, out, from)?;
                }
                return self.advance(from, to);
            }
        };

        let period = self.period();
        let high = DUTY_HIGH[self.duty as usize & 3];
        if out.is_inaudible(period * 8) {
            self.ch.voice.settle(synth, out, from, volume * high as i32 / 8)?;
            return self.advance(from, to);
        }

        let amp_at = move |phase: u32| if phase < high { volume } else { 0 };
        self.ch.voice.settle(synth, out, from, amp_at(self.phase))?;
        let mut phase = self.phase;
        self.ch.voice.step(synth, out, from, to, period, || {
            phase = (phase + 1) & 7;
            amp_at(phase)
        })?;
        self.phase = phase;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Wave {
    ch: GbChannel,
    freq: u16,
    position: usize,
}

impl Wave {
    #[inline]
    fn period(&self) -> BlipTime {
        (2048 - self.freq as BlipTime) * 2
    }

    /// Sample `pos` of wave RAM; the high nibble plays first.
    #[inline]
    fn sample(ram: &[u8], pos: usize) -> i32 {
        let byte = ram[pos / 2];
        let nibble = if pos & 1 == 0 { byte >> 4 } else { byte & 0x0F };
        nibble as i32
    }

    fn advance(&mut self, from: BlipTime, to: BlipTime) -> Result<()> {
        let steps = self.ch.voice.skip(from, to, self.period())? as usize;
        self.position = (self.position + steps) % WAVE_STEPS;
        Ok(())
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        regs: &[u8; REG_COUNT],
        master: i32,
    ) -> Result<()> {
        let shift = match (regs[NR32] >> 5) & 3 {
            0 => None,
            code => Some(code as u32 - 1),
        };
        let dac = regs[NR30] & 0x80 != 0;
        let out = match (out, shift) {
            (Some(out), Some(shift)) if self.ch.enabled && dac && master != 0 => (out, shift),
            (out, _) => {
                if let Some(out) = out {
                    self.ch.voice.silence(synth, out, from)?;
                }
                return self.advance(from, to);
            }
        };
        let (out, shift) = out;
        let ram = &regs[WAVE_RAM..];

        let period = self.period();
        if out.is_inaudible(period * WAVE_STEPS as BlipTime) {
            let sum: i32 = (0..WAVE_STEPS).map(|pos| Self::sample(ram, pos) >> shift).sum();
            self.ch
                .voice
                .settle(synth, out, from, sum * master / WAVE_STEPS as i32)?;
            return self.advance(from, to);
        }

        self.ch
            .voice
            .settle(synth, out, from, (Self::sample(ram, self.position) >> shift) * master)?;
        let mut position = self.position;
        self.ch.voice.step(synth, out, from, to, period, || {
            position = (position + 1) % WAVE_STEPS;
            (Self::sample(ram, position) >> shift) * master
        })?;
        self.position = position;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Noise {
    ch: GbChannel,
    env: Envelope,
    lfsr: u16,
}

impl Noise {
    /// Shift period in clocks from NR43.
    fn period(nr43: u8) -> BlipTime {
        let divisor = match nr43 & 7 {
            0 => 8,
            r => 16 * r as BlipTime,
        };
        divisor << (nr43 >> 4)
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        nr43: u8,
        master: i32,
    ) -> Result<()> {
        let period = Self::period(nr43);
        let short = nr43 & 0x08 != 0;
        let volume = self.env.volume as i32 * master;

        let out = match out {
            Some(out) if self.ch.enabled && volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.ch.voice.silence(synth, out, from)?;
                }
                let shifts = self.ch.voice.skip(from, to, period)?;
                let shifts = shifts % if short { 127 } else { 32767 };
                for _ in 0..shifts {
                    self.lfsr = clock_lfsr(self.lfsr, short);
                }
                return Ok(());
            }
        };

        let mut lfsr = self.lfsr;
        let amp_at = move |lfsr: u16| if lfsr & 1 == 0 { volume } else { 0 };
        self.ch.voice.settle(synth, out, from, amp_at(lfsr))?;
        self.ch.voice.step(synth, out, from, to, period, || {
            lfsr = clock_lfsr(lfsr, short);
            amp_at(lfsr)
        })?;
        self.lfsr = lfsr;
        Ok(())
    }
}

/// Game Boy APU
#[derive(Clone, Debug)]
pub struct GameBoyApu {
    regs: [u8; REG_COUNT],
    squares: [Square; 2],
    wave: Wave,
    noise: Noise,
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
    next_frame: BlipTime,
    frame_step: u32,
}

fn boot_registers() -> [u8; REG_COUNT] {
    let mut regs = [0; REG_COUNT];
    regs[NR50] = BOOT_NR50;
    regs[NR51] = BOOT_NR51;
    regs[NR52] = 0x80;
    regs
}

fn boot_voices() -> ([Square; 2], Wave, Noise) {
    let wave = Wave {
        ch: GbChannel::new(2),
        freq: 0,
        position: 0,
    };
    let noise = Noise {
        ch: GbChannel::new(3),
        env: Envelope::default(),
        lfsr: LFSR_SEED,
    };
    ([Square::new(0), Square::new(1)], wave, noise)
}

impl GameBoyApu {
    /// Create an APU in its post-boot state, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        let (squares, wave, noise) = boot_voices();
        Ok(Self {
            regs: boot_registers(),
            squares,
            wave,
            noise,
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
            next_frame: FRAME_PERIOD,
            frame_step: 0,
        })
    }

    /// True while NR52 has the APU powered.
    pub fn powered(&self) -> bool {
        self.regs[NR52] & 0x80 != 0
    }

    /// Raw register value, wave RAM included.
    pub fn register(&self, addr: u16) -> Option<u8> {
        let index = addr.checked_sub(START_ADDR)? as usize;
        self.regs.get(index).copied()
    }

    /// Whether a voice is currently running.
    pub fn channel_enabled(&self, osc: usize) -> Result<bool> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.channel(osc).enabled)
    }

    /// Remaining length count of a voice.
    pub fn length_counter(&self, osc: usize) -> Result<u16> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.channel(osc).length)
    }

    /// 11-bit frequency value of a square voice, after any sweep.
    pub fn square_frequency(&self, osc: usize) -> Result<u16> {
        check_osc(osc, 2)?;
        Ok(self.squares[osc].freq)
    }

    /// Current envelope level of a square or noise voice.
    pub fn envelope_volume(&self, osc: usize) -> Result<u8> {
        check_osc(osc, OSC_COUNT)?;
        Ok(match osc {
            0 | 1 => self.squares[osc].env.volume,
            3 => self.noise.env.volume,
            _ => 0,
        })
    }

    /// Noise LFSR state.
    pub fn lfsr(&self) -> u16 {
        self.noise.lfsr
    }

    fn channel(&self, osc: usize) -> &GbChannel {
        match osc {
            0 | 1 => &self.squares[osc].ch,
            2 => &self.wave.ch,
            _ => &self.noise.ch,
        }
    }

    fn channel_mut(&mut self, osc: usize) -> &mut GbChannel {
        match osc {
            0 | 1 => &mut self.squares[osc].ch,
            2 => &mut self.wave.ch,
            _ => &mut self.noise.ch,
        }
    }

    /// Master scale for a voice: zero unless NR51 routes it somewhere.
    fn master(&self, osc: usize) -> i32 {
        if (self.regs[NR51] >> osc) & 0x11 == 0 {
            return 0;
        }
        let nr50 = self.regs[NR50];
        ((nr50 >> 4) & 7).max(nr50 & 7) as i32 + 1
    }

    fn run_oscillators(&mut self, to: BlipTime) -> Result<()> {
        let from = self.last_time;
        let masters: [i32; OSC_COUNT] = std::array::from_fn(|osc| self.master(osc));
        let Self {
            regs,
            squares,
            wave,
            noise,
            synth,
            outputs,
            ..
        } = self;
        for (osc, square) in squares.iter_mut().enumerate() {
            square.run(synth, outputs.route(square.ch.voice.output), from, to, masters[osc])?;
        }
        wave.run(synth, outputs.route(wave.ch.voice.output), from, to, regs, masters[2])?;
        noise.run(synth, outputs.route(noise.ch.voice.output), from, to, regs[NR43], masters[3])
    }

    fn clock_frame(&mut self) {
        let step = self.frame_step;
        self.frame_step = (self.frame_step + 1) % 4;
        for osc in 0..OSC_COUNT {
            self.channel_mut(osc).clock_length();
        }
        if step == 0 {
            for square in &mut self.squares {
                square.env.clock();
            }
            self.noise.env.clock();
        } else if step & 1 == 1 {
            self.squares[0].clock_sweep(self.regs[NR10]);
        }
    }

    fn power_off(&mut self) {
        self.regs[..NR52].iter_mut().for_each(|r| *r = 0);
        for osc in 0..OSC_COUNT {
            let ch = self.channel_mut(osc);
            ch.enabled = false;
            ch.length_enabled = false;
        }
    }

    fn write_register(&mut self, addr: u16, data: u8) {
        let index = (addr - START_ADDR) as usize;
        if index == NR52 {
            let was_on = self.powered();
            self.regs[NR52] = data & 0x80;
            if was_on && !self.powered() {
                log::debug!("{NAME}: powered off");
                self.power_off();
            } else if !was_on && self.powered() {
                self.frame_step = 0;
            }
            return;
        }
        if !self.powered() && index < WAVE_RAM {
            log::trace!("{NAME}: ignored write {addr:#06x} while powered off");
            return;
        }
        self.regs[index] = data;

        match index {
            0x01 | 0x06 => {
                let square = &mut self.squares[index / 5];
                square.duty = data >> 6;
                square.ch.length = 64 - (data & 0x3F) as u16;
            }
            0x02 | 0x07 => {
                if !dac_on(data) {
                    self.squares[index / 5].ch.enabled = false;
                }
            }
            0x03 | 0x08 => {
                let square = &mut self.squares[index / 5];
                square.freq = (square.freq & 0x700) | data as u16;
            }
            0x04 | 0x09 => {
                let osc = index / 5;
                let nrx2 = self.regs[index - 2];
                let nr10 = self.regs[NR10];
                let square = &mut self.squares[osc];
                square.freq = (square.freq & 0xFF) | ((data as u16 & 7) << 8);
                if square.ch.control(data, 64, dac_on(nrx2)) {
                    square.env.trigger(nrx2);
                    if osc == 0 {
                        square.trigger_sweep(nr10);
                    }
                }
            }
            NR30 => {
                if data & 0x80 == 0 {
                    self.wave.ch.enabled = false;
                }
            }
            0x0B => self.wave.ch.length = 256 - data as u16,
            0x0D => self.wave.freq = (self.wave.freq & 0x700) | data as u16,
            0x0E => {
                self.wave.freq = (self.wave.freq & 0xFF) | ((data as u16 & 7) << 8);
                let dac = self.regs[NR30] & 0x80 != 0;
                if self.wave.ch.control(data, 256, dac) {
                    self.wave.position = 0;
                }
            }
            0x10 => self.noise.ch.length = 64 - (data & 0x3F) as u16,
            0x11 => {
                if !dac_on(data) {
                    self.noise.ch.enabled = false;
                }
            }
            0x13 => {
                let nr42 = self.regs[0x11];
                if self.noise.ch.control(data, 64, dac_on(nr42)) {
                    self.noise.env.trigger(nr42);
                    self.noise.lfsr = LFSR_SEED;
                }
            }
            _ => {}
        }
    }
}

impl SoundChip for GameBoyApu {
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
        let routes: [Option<usize>; OSC_COUNT] =
            std::array::from_fn(|osc| self.channel(osc).voice.output);
        self.regs = boot_registers();
        (self.squares, self.wave, self.noise) = boot_voices();
        self.last_time = 0;
        self.next_frame = FRAME_PERIOD;
        self.frame_step = 0;
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
                if self.powered() {
                    self.clock_frame();
                }
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
        let voice = match osc {
            0 | 1 => &mut self.squares[osc].ch.voice,
            2 => &mut self.wave.ch.voice,
            _ => &mut self.noise.ch.voice,
        };
        self.outputs.reroute(voice, &self.synth, time, output)
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
