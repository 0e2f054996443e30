//! Hudson HuC6280 PSG
//!
//! Six voices loop 32-sample, 5-bit waveforms. A voice can instead drive its
//! DAC directly (DDA mode), and voices 5 and 6 can switch to noise. All
//! per-voice registers are reached through a channel select at $0800.
//!
//! Levels combine the voice volume with the voice and master balance into
//! one attenuation in 1.5 dB steps. The noise generator is not fully
//! documented; it is modeled as a maximal-length 16-bit LFSR.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::Result;
use std::sync::OnceLock;

/// Chip name
pub const NAME: &str = "huc6280";

/// PSG clock in Hz
pub const CLOCK_RATE: u32 = 3_579_545;

/// Number of voices
pub const OSC_COUNT: usize = 6;

/// Channel select register
pub const START_ADDR: u16 = 0x0800;

/// LFO control register
pub const END_ADDR: u16 = 0x0809;

/// Samples per waveform
pub const WAVE_SIZE: usize = 32;

const CTRL_ON: u8 = 0x80;
const CTRL_DDA: u8 = 0x40;
const NOISE_ENABLE: u8 = 0x80;
const NOISE_TAPS: u16 = 0xB400;
const NOISE_SEED: u16 = 1;

/// Attenuation at and past which a voice is silent
const SILENT_ATTENUATION: usize = 31;
/// Level at zero attenuation
const FULL_LEVEL: i32 = 64;
/// Samples are centered on 16
const MAX_AMP: i32 = 16 * FULL_LEVEL;

/// Level for each attenuation step of 1.5 dB.
pub fn level_table() -> &'static [i32; 32] {
    static TABLE: OnceLock<[i32; 32]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0; 32];
        for (step, level) in table.iter_mut().enumerate().take(SILENT_ATTENUATION) {
            *level = (FULL_LEVEL as f64 / 2f64.powf(0.25 * step as f64)).round() as i32;
        }
        table
    })
}

/// Louder side of a balance byte (left nibble, right nibble).
#[inline]
fn balance(byte: u8) -> usize {
    (byte >> 4).max(byte & 0x0F) as usize
}

/// Combined attenuation of voice volume, voice balance and master balance.
#[inline]
pub fn attenuation(control: u8, voice_balance: u8, main_balance: u8) -> usize {
    let volume = (control & 0x1F) as usize;
    (31 - volume) + 2 * (15 - balance(voice_balance)) + 2 * (15 - balance(main_balance))
}

/// Shift the noise LFSR once.
#[inline]
pub fn clock_noise(lfsr: u16) -> u16 {
    (lfsr >> 1) ^ (NOISE_TAPS & (lfsr & 1).wrapping_neg())
}

#[derive(Clone, Debug)]
struct PsgVoice {
    voice: Voice,
    freq: u16,
    control: u8,
    balance: u8,
    noise: u8,
    dac: u8,
    wave: [u8; WAVE_SIZE],
    write_pos: usize,
    phase: usize,
    lfsr: u16,
}

impl PsgVoice {
    fn new(osc: usize) -> Self {
        Self {
            voice: Voice::new(Some(osc)),
            freq: 0,
            control: 0,
            balance: 0,
            noise: 0,
            dac: 0,
            wave: [0; WAVE_SIZE],
            write_pos: 0,
            phase: 0,
            lfsr: NOISE_SEED,
        }
    }

    /// Wave step period; a frequency of zero counts as 0x1000.
    #[inline]
    fn period(&self) -> BlipTime {
        match self.freq {
            0 => 0x1000,
            f => f as BlipTime,
        }
    }

    #[inline]
    fn noise_period(&self) -> BlipTime {
        (32 - (self.noise & 0x1F) as BlipTime) * 64
    }

    #[inline]
    fn noise_on(&self, osc: usize) -> bool {
        osc >= 4 && self.noise & NOISE_ENABLE != 0
    }

    fn advance(&mut self, from: BlipTime, to: BlipTime, noise: bool) -> Result<()> {
        if noise {
            let shifts = self.voice.skip(from, to, self.noise_period())?;
            for _ in 0..shifts % 65_535 {
                self.lfsr = clock_noise(self.lfsr);
            }
        } else {
            let steps = self.voice.skip(from, to, self.period())? as usize;
            self.phase = (self.phase + steps) % WAVE_SIZE;
        }
        Ok(())
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        osc: usize,
        main_balance: u8,
    ) -> Result<()> {
        if self.control & CTRL_ON == 0 {
            // a stopped voice holds its position
            if let Some(out) = out {
                self.voice.silence(synth, out, from)?;
            }
            ensure_forward(from, to)?;
            self.voice.delay = 0;
            return Ok(());
        }

        let level = level_table()
            .get(attenuation(self.control, self.balance, main_balance))
            .copied()
            .unwrap_or(0);
        let noise = self.noise_on(osc);
        let out = match out {
            Some(out) if level != 0 => out,
            out => {
                if let Some(out) = out {
                    self.voice.silence(synth, out, from)?;
                }
                return self.advance(from, to, noise);
            }
        };

        if self.control & CTRL_DDA != 0 {
            self.voice
                .settle(synth, out, from, (self.dac as i32 - 16) * level)?;
            ensure_forward(from, to)?;
            return Ok(());
        }

        if noise {
            let amp_at = move |lfsr: u16| if lfsr & 1 != 0 { 15 * level } else { -16 * level };
            let mut lfsr = self.lfsr;
            self.voice.settle(synth, out, from, amp_at(lfsr))?;
            self.voice
                .step(synth, out, from, to, self.noise_period(), || {
                    lfsr = clock_noise(lfsr);
                    amp_at(lfsr)
                })?;
            self.lfsr = lfsr;
            return Ok(());
        }

        let period = self.period();
        let wave = &self.wave;
        if out.is_inaudible(period * WAVE_SIZE as BlipTime) {
            let sum: i32 = wave.iter().map(|&s| s as i32 - 16).sum();
            self.voice
                .settle(synth, out, from, sum * level / WAVE_SIZE as i32)?;
            return self.advance(from, to, false);
        }

        self.voice
            .settle(synth, out, from, (wave[self.phase] as i32 - 16) * level)?;
        let mut phase = self.phase;
        self.voice.step(synth, out, from, to, period, || {
            phase = (phase + 1) % WAVE_SIZE;
            (wave[phase] as i32 - 16) * level
        })?;
        self.phase = phase;
        Ok(())
    }

    fn write(&mut self, reg: u16, data: u8) {
        match reg {
            0x02 => self.freq = (self.freq & 0xF00) | data as u16,
            0x03 => self.freq = (self.freq & 0x0FF) | ((data as u16 & 0x0F) << 8),
            0x04 => {
                if data & (CTRL_ON | CTRL_DDA) == CTRL_DDA {
                    self.write_pos = 0;
                }
                self.control = data;
            }
            0x05 => self.balance = data,
            0x06 => {
                let sample = data & 0x1F;
                if self.control & CTRL_DDA != 0 {
                    self.dac = sample;
                } else if self.control & CTRL_ON == 0 {
                    self.wave[self.write_pos] = sample;
                    self.write_pos = (self.write_pos + 1) % WAVE_SIZE;
                }
            }
            0x07 => self.noise = data,
            _ => {}
        }
    }
}

/// Hudson HuC6280 PSG
#[derive(Clone, Debug)]
pub struct Huc6280 {
    voices: [PsgVoice; OSC_COUNT],
    select: u8,
    main_balance: u8,
    lfo: [u8; 2],
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Huc6280 {
    /// Create a chip at power-up state, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            voices: std::array::from_fn(PsgVoice::new),
            select: 0,
            main_balance: 0,
            lfo: [0; 2],
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// Currently selected voice.
    pub fn selected(&self) -> u8 {
        self.select
    }

    /// Waveform RAM of a voice.
    pub fn wave(&self, osc: usize) -> Result<&[u8; WAVE_SIZE]> {
        check_osc(osc, OSC_COUNT)?;
        Ok(&self.voices[osc].wave)
    }

    /// Wave step period of a voice in clocks.
    pub fn period(&self, osc: usize) -> Result<BlipTime> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.voices[osc].period())
    }

    /// LFO frequency and control registers as last written.
    pub fn lfo(&self) -> [u8; 2] {
        self.lfo
    }
}

impl SoundChip for Huc6280 {
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
        for (osc, state) in self.voices.iter_mut().enumerate() {
            let output = state.voice.output;
            *state = PsgVoice::new(osc);
            state.voice.output = output;
        }
        self.select = 0;
        self.main_balance = 0;
        self.lfo = [0; 2];
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, START_ADDR..=END_ADDR, NAME)?;
        self.run_until(time)?;
        log::trace!("{NAME}: write {addr:#06x} = {data:#04x} at {time}");
        match addr - START_ADDR {
            0x00 => self.select = data & 0x07,
            0x01 => self.main_balance = data,
            reg @ 0x02..=0x07 => {
                if let Some(voice) = self.voices.get_mut(self.select as usize) {
                    voice.write(reg, data);
                }
            }
            reg => {
                self.lfo[(reg - 0x08) as usize] = data;
                if data != 0 {
                    log::warn!("{NAME}: LFO register {addr:#06x} stored but not emulated");
                }
            }
        }
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let main_balance = self.main_balance;
        let Self {
            voices,
            synth,
            outputs,
            ..
        } = self;
        for (osc, state) in voices.iter_mut().enumerate() {
            state.run(synth, outputs.route(state.voice.output), from, time, osc, main_balance)?;
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
