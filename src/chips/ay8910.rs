//! General Instrument AY-3-8910 PSG
//!
//! Three square-wave tone channels, one 17-bit LFSR noise source shared by
//! all channels, and a 16-shape envelope generator. The mixer (R7) ANDs each
//! channel's tone and noise gates; disabling both leaves the channel at its
//! volume level, which is how sample playback on these chips works.
//!
//! Rendering splits each span at noise and envelope events only while some
//! audible channel depends on them; otherwise both generators are advanced
//! arithmetically.
//!
//! The same core drives the Sunsoft 5B (see [`super::fme7`]), which runs it
//! from the NES CPU clock through an extra divide-by-two.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer};
use crate::oscillator::{ensure_forward, Voice};
use crate::Result;
use bitflags::bitflags;

/// Chip name
pub const NAME: &str = "ay8910";

/// Default clock in Hz (MSX / Amstrad-class boards)
pub const CLOCK_RATE: u32 = 1_789_773;

/// Number of tone channels
pub const OSC_COUNT: usize = 3;

/// Registers R0-R15 (R14/R15 are I/O ports)
pub const REG_COUNT: usize = 16;

/// Logarithmic DAC levels, about 3 dB per step
pub const AMP_TABLE: [i32; 16] = [0, 2, 3, 4, 6, 8, 11, 16, 23, 32, 45, 64, 90, 128, 180, 255];

/// Largest DAC level
pub const MAX_AMP: i32 = 255;

/// Writable bits per register
const REG_MASK: [u8; REG_COUNT] = [
    0xFF, 0x0F, 0xFF, 0x0F, 0xFF, 0x0F, 0x1F, 0xFF, 0x1F, 0x1F, 0x1F, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF,
];

const NOISE_SEED: u32 = 1;
const NOISE_TAPS: u32 = 0x12000;

bitflags! {
    /// Mixer control (R7); a set bit disables the source
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mixer: u8 {
        /// Tone off on channel A
        const TONE_A = 0x01;
        /// Tone off on channel B
        const TONE_B = 0x02;
        /// Tone off on channel C
        const TONE_C = 0x04;
        /// Noise off on channel A
        const NOISE_A = 0x08;
        /// Noise off on channel B
        const NOISE_B = 0x10;
        /// Noise off on channel C
        const NOISE_C = 0x20;
        /// Port A as output
        const PORT_A_OUT = 0x40;
        /// Port B as output
        const PORT_B_OUT = 0x80;
    }
}

impl Mixer {
    #[inline]
    fn tone_off(self, channel: usize) -> bool {
        self.bits() & (0x01 << channel) != 0
    }

    #[inline]
    fn noise_off(self, channel: usize) -> bool {
        self.bits() & (0x08 << channel) != 0
    }
}

bitflags! {
    /// Envelope shape control (R13)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeShape: u8 {
        /// Stop after the first cycle
        const HOLD = 0x01;
        /// Reverse direction after each cycle
        const ALTERNATE = 0x02;
        /// First cycle counts up
        const ATTACK = 0x04;
        /// Keep cycling (otherwise fall to zero and hold)
        const CONTINUE = 0x08;
    }
}

/// 16-step envelope generator
#[derive(Clone, Debug)]
struct Envelope {
    step: i8,
    attack: u8,
    hold: bool,
    alternate: bool,
    holding: bool,
    /// Clocks until the next step
    delay: BlipTime,
}

impl Envelope {
    fn new() -> Self {
        Self {
            step: 15,
            attack: 0,
            hold: true,
            alternate: false,
            holding: true,
            delay: 1,
        }
    }

    fn restart(&mut self, shape: EnvelopeShape, period: BlipTime) {
        self.attack = if shape.contains(EnvelopeShape::ATTACK) { 15 } else { 0 };
        if shape.contains(EnvelopeShape::CONTINUE) {
            self.hold = shape.contains(EnvelopeShape::HOLD);
            self.alternate = shape.contains(EnvelopeShape::ALTERNATE);
        } else {
            self.hold = true;
            self.alternate = self.attack != 0;
        }
        self.step = 15;
        self.holding = false;
        self.delay = period;
    }

    /// Current level, 0-15
    #[inline]
    fn level(&self) -> usize {
        (self.step as u8 ^ self.attack) as usize & 15
    }

    fn clock(&mut self) {
        if self.holding {
            return;
        }
        self.step -= 1;
        if self.step < 0 {
            if self.alternate {
                self.attack ^= 15;
            }
            if self.hold {
                self.holding = true;
                self.step = 0;
            } else {
                self.step = 15;
            }
        }
    }

    /// Advance by `elapsed` clocks.
    fn advance(&mut self, elapsed: BlipTime, period: BlipTime) {
        let steps = countdown(&mut self.delay, elapsed, period);
        for _ in 0..steps {
            if self.holding {
                break;
            }
            self.clock();
        }
    }
}

/// Shift the 17-bit noise LFSR once.
#[inline]
pub fn clock_noise(lfsr: u32) -> u32 {
    if lfsr & 1 != 0 {
        (lfsr >> 1) ^ NOISE_TAPS
    } else {
        lfsr >> 1
    }
}

/// 17-bit Galois LFSR shared by the three channels
#[derive(Clone, Debug)]
struct Noise {
    lfsr: u32,
    /// Bit most recently shifted out
    output: bool,
    delay: BlipTime,
}

impl Noise {
    fn new() -> Self {
        Self {
            lfsr: NOISE_SEED,
            output: false,
            delay: 1,
        }
    }

    #[inline]
    fn clock(&mut self) {
        self.output = self.lfsr & 1 != 0;
        self.lfsr = clock_noise(self.lfsr);
    }

    fn advance(&mut self, elapsed: BlipTime, period: BlipTime) {
        for _ in 0..countdown(&mut self.delay, elapsed, period) {
            self.clock();
        }
    }
}

/// Consume `elapsed` clocks from a countdown that reloads with `period`,
/// returning how many times it expired.
fn countdown(delay: &mut BlipTime, elapsed: BlipTime, period: BlipTime) -> u32 {
    if elapsed < *delay {
        *delay -= elapsed;
        return 0;
    }
    let over = elapsed - *delay;
    *delay = period - over % period;
    1 + over / period
}

#[derive(Clone, Debug)]
struct Tone {
    voice: Voice,
    high: bool,
}

/// Register file, generators and routing shared by AY-compatible chips
#[derive(Clone, Debug)]
pub(crate) struct AyCore {
    regs: [u8; REG_COUNT],
    tones: [Tone; OSC_COUNT],
    noise: Noise,
    envelope: Envelope,
    /// Extra clock division (1 on the AY, 2 on the Sunsoft 5B)
    divider: u32,
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl AyCore {
    pub(crate) fn new(divider: u32, clock_rate: u32) -> Result<Self> {
        Ok(Self {
            regs: [0; REG_COUNT],
            tones: std::array::from_fn(|i| Tone {
                voice: Voice::new(Some(i)),
                high: false,
            }),
            noise: Noise::new(),
            envelope: Envelope::new(),
            divider: divider.max(1),
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, clock_rate),
            last_time: 0,
        })
    }

    #[inline]
    pub(crate) fn tone_period(&self, channel: usize) -> BlipTime {
        let raw = ((self.regs[channel * 2 + 1] as u32 & 0x0F) << 8) | self.regs[channel * 2] as u32;
        raw.max(1) * 8 * self.divider
    }

    #[inline]
    fn noise_period(&self) -> BlipTime {
        (self.regs[6] as u32 & 0x1F).max(1) * 16 * self.divider
    }

    #[inline]
    fn envelope_period(&self) -> BlipTime {
        let raw = self.regs[11] as u32 | (self.regs[12] as u32) << 8;
        raw.max(1) * 16 * self.divider
    }

    #[inline]
    fn channel_amp(&self, channel: usize) -> i32 {
        let vol = self.regs[8 + channel];
        if vol & 0x10 != 0 {
            AMP_TABLE[self.envelope.level()]
        } else {
            AMP_TABLE[(vol & 0x0F) as usize]
        }
    }

    pub(crate) fn register(&self, reg: usize) -> u8 {
        self.regs.get(reg).copied().unwrap_or(0)
    }

    pub(crate) fn last_time(&self) -> BlipTime {
        self.last_time
    }

    pub(crate) fn write(&mut self, time: BlipTime, reg: usize, data: u8) -> Result<()> {
        self.run(time)?;
        let data = data & REG_MASK[reg & 0x0F];
        self.regs[reg & 0x0F] = data;
        match reg {
            6 => {
                let period = self.noise_period();
                self.noise.delay = self.noise.delay.min(period);
            }
            11 | 12 => {
                let period = self.envelope_period();
                self.envelope.delay = self.envelope.delay.min(period);
            }
            13 => {
                let period = self.envelope_period();
                self.envelope.restart(EnvelopeShape::from_bits_truncate(data), period);
            }
            _ => {}
        }
        Ok(())
    }

    /// True when `channel` is routed and currently gated by noise.
    fn uses_noise(&self, channel: usize, mixer: Mixer) -> bool {
        !mixer.noise_off(channel)
            && self.tones[channel].voice.output.is_some()
            && (self.regs[8 + channel] & 0x1F) != 0
    }

    /// True when `channel` is routed and follows a moving envelope.
    fn uses_envelope(&self, channel: usize) -> bool {
        !self.envelope.holding
            && self.tones[channel].voice.output.is_some()
            && self.regs[8 + channel] & 0x10 != 0
    }

    pub(crate) fn run(&mut self, to: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, to)?;
        let mixer = Mixer::from_bits_retain(self.regs[7]);
        let noise_period = self.noise_period();
        let env_period = self.envelope_period();

        let mut time = self.last_time;
        while time < to {
            let mut end = to;
            if (0..OSC_COUNT).any(|c| self.uses_noise(c, mixer)) {
                end = end.min(time + self.noise.delay);
            }
            if (0..OSC_COUNT).any(|c| self.uses_envelope(c)) {
                end = end.min(time + self.envelope.delay);
            }
            for channel in 0..OSC_COUNT {
                self.run_tone(channel, mixer, time, end)?;
            }
            self.noise.advance(end - time, noise_period);
            self.envelope.advance(end - time, env_period);
            time = end;
        }
        self.last_time = to;
        Ok(())
    }

    /// Render one channel over a span where noise and envelope are constant.
    fn run_tone(&mut self, channel: usize, mixer: Mixer, from: BlipTime, to: BlipTime) -> Result<()> {
        let period = self.tone_period(channel);
        let amp = self.channel_amp(channel);
        let noise_gate = mixer.noise_off(channel) || self.noise.output;
        let tone_off = mixer.tone_off(channel);
        let half_amp = period <= 8 * self.divider;

        let Self {
            tones,
            synth,
            outputs,
            ..
        } = self;
        let tone = &mut tones[channel];
        let Some(out) = outputs.route(tone.voice.output) else {
            let steps = tone.voice.skip(from, to, period)?;
            tone.high ^= steps & 1 == 1;
            return Ok(());
        };

        let level = if !noise_gate {
            Some(0)
        } else if tone_off {
            Some(amp)
        } else if half_amp || out.is_inaudible(period * 2) {
            Some(amp / 2)
        } else if amp == 0 {
            Some(0)
        } else {
            None
        };

        if let Some(level) = level {
            tone.voice.settle(synth, out, from, level)?;
            let steps = tone.voice.skip(from, to, period)?;
            tone.high ^= steps & 1 == 1;
            return Ok(());
        }

        tone.voice.settle(synth, out, from, if tone.high { amp } else { 0 })?;
        let mut high = tone.high;
        tone.voice.step(synth, out, from, to, period, || {
            high = !high;
            if high {
                amp
            } else {
                0
            }
        })?;
        tone.high = high;
        Ok(())
    }

    pub(crate) fn end_frame(&mut self, length: BlipTime) -> Result<()> {
        self.run(length)?;
        self.outputs.end_frame(length);
        self.last_time -= length;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        for tone in &mut self.tones {
            tone.voice.reset();
            tone.high = false;
        }
        self.regs = [0; REG_COUNT];
        self.noise = Noise::new();
        self.envelope = Envelope::new();
        self.last_time = 0;
        self.outputs.flush();
    }

    pub(crate) fn set_output(&mut self, osc: usize, output: Option<usize>) -> Result<()> {
        check_osc(osc, OSC_COUNT)?;
        let time = self.last_time;
        self.outputs
            .reroute(&mut self.tones[osc].voice, &self.synth, time, output)
    }

    pub(crate) fn outputs(&self) -> &OutputBank {
        &self.outputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut OutputBank {
        &mut self.outputs
    }

    pub(crate) fn synth_mut(&mut self) -> &mut StepSynthesizer {
        &mut self.synth
    }
}

/// AY-3-8910 with registers addressed directly (0x00-0x0F)
#[derive(Clone, Debug)]
pub struct Ay8910 {
    core: AyCore,
}

impl Ay8910 {
    /// Create a chip at power-up state, each channel on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: AyCore::new(1, CLOCK_RATE)?,
        })
    }

    /// Current value of register `reg`.
    pub fn register(&self, reg: usize) -> u8 {
        self.core.register(reg)
    }

    /// Clocks between square edges on `channel`.
    pub fn tone_period(&self, channel: usize) -> BlipTime {
        self.core.tone_period(channel % OSC_COUNT)
    }

    /// Current envelope level (0-15).
    pub fn envelope_level(&self) -> usize {
        self.core.envelope.level()
    }

    /// Current noise LFSR state.
    pub fn noise_state(&self) -> u32 {
        self.core.noise.lfsr
    }
}

impl SoundChip for Ay8910 {
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
        self.core.reset();
    }

    fn last_time(&self) -> BlipTime {
        self.core.last_time()
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, 0x00..=0x0F, NAME)?;
        log::trace!("{NAME}: write R{addr} = {data:#04x} at {time}");
        self.core.write(time, addr as usize, data)
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        self.core.run(time)
    }

    fn end_frame(&mut self, length: BlipTime) -> Result<()> {
        self.core.end_frame(length)
    }

    fn set_output(&mut self, osc: usize, output: Option<usize>) -> Result<()> {
        self.core.set_output(osc, output)
    }

    fn outputs(&self) -> &OutputBank {
        self.core.outputs()
    }

    fn outputs_mut(&mut self) -> &mut OutputBank {
        self.core.outputs_mut()
    }

    fn set_volume(&mut self, level: f32) -> Result<()> {
        self.core.synth_mut().set_volume(level)
    }

    fn set_treble(&mut self, eq: &Equalizer) -> Result<()> {
        self.core.synth_mut().set_treble(eq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(shape: u8, steps: usize) -> Vec<usize> {
        let mut env = Envelope::new();
        env.restart(EnvelopeShape::from_bits_truncate(shape), 1);
        let mut out = vec![env.level()];
        for _ in 0..steps {
            env.clock();
            out.push(env.level());
        }
        out
    }

    #[test]
    fn test_decay_shapes_end_silent() {
        for shape in [0x00, 0x04, 0x09, 0x0F] {
            let trace = levels(shape, 40);
            assert_eq!(trace[39], 0, "shape {shape:#x} should hold at 0");
        }
    }

    #[test]
    fn test_attack_hold_ends_loud() {
        let trace = levels(0x0D, 40);
        assert_eq!(&trace[..3], &[0, 1, 2]);
        assert_eq!(trace[39], 15);
        assert_eq!(levels(0x0B, 40)[39], 15);
    }

    #[test]
    fn test_triangle_shape_alternates() {
        let trace = levels(0x0E, 48);
        assert_eq!(trace[15], 15);
        assert_eq!(trace[16], 15);
        assert_eq!(trace[31], 0);
        assert_eq!(trace[32], 0);
        assert_eq!(trace[47], 15);
    }

    #[test]
    fn test_sawtooth_repeats() {
        let trace = levels(0x08, 32);
        assert_eq!(trace[0], 15);
        assert_eq!(trace[15], 0);
        assert_eq!(trace[16], 15);
    }

    #[test]
    fn test_register_masks_applied() {
        let mut chip = Ay8910::new().unwrap();
        chip.write(0x01, 0xFF).unwrap();
        chip.write(0x06, 0xFF).unwrap();
        assert_eq!(chip.register(1), 0x0F);
        assert_eq!(chip.register(6), 0x1F);
        assert!(chip.write(0x10, 0).is_err());
    }

    #[test]
    fn test_countdown_reload() {
        let mut delay = 5;
        assert_eq!(countdown(&mut delay, 3, 10), 0);
        assert_eq!(delay, 2);
        assert_eq!(countdown(&mut delay, 25, 10), 3);
        assert_eq!(delay, 7);
    }

    #[test]
    fn test_disabled_mixer_outputs_volume_level() {
        let mut chip = Ay8910::new().unwrap();
        chip.outputs_mut().set_capacity(512);
        chip.set_sample_rate(48_000).unwrap();
        chip.write(0x07, 0x3F).unwrap(); // everything off
        chip.write(0x08, 0x0F).unwrap();
        chip.run_until(5000).unwrap();
        let synth = chip.core.synth.clone();
        let pending = chip.buffer_mut(0).unwrap().pending();
        assert_eq!(pending, MAX_AMP as i64 * synth.delta_factor() * synth.kernel_unit() as i64);
    }

    #[test]
    fn test_tone_toggles_at_period() {
        let mut chip = Ay8910::new().unwrap();
        chip.set_output(0, None).unwrap();
        chip.write(0x00, 100).unwrap();
        chip.run_until(800 * 10).unwrap();
        // ten toggles of 800 clocks leave the square where it started
        assert!(!chip.core.tones[0].high);
        assert_eq!(chip.core.tones[0].voice.delay, 0);
    }
}
