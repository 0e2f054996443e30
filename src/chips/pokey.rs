//! Atari POKEY
//!
//! Four voices, each a frequency divider feeding an output flip-flop. On
//! every divider edge the flip-flop either toggles (pure tone) or samples a
//! polynomial counter (4-bit, or 17-bit cut down to 9 bits by AUDCTL), and
//! the 5-bit polynomial can gate those edges. AUDCTL also selects the base
//! clock, joins pairs of dividers into 16-bit counters, and enables the
//! high-pass flip-flops that clock voice 1 from voice 3 and voice 2 from
//! voice 4.
//!
//! Polynomial bits are indexed by absolute clock time, so all voices read
//! the same sequence at the same moment.

use super::check_osc;
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::{BlipError, Result};
use bitflags::bitflags;
use std::sync::OnceLock;

/// Chip name
pub const NAME: &str = "pokey";

/// NTSC Atari clock in Hz
pub const CLOCK_RATE: u32 = 1_789_773;

/// Number of voices
pub const OSC_COUNT: usize = 4;

/// AUDCTL register
pub const AUDCTL_ADDR: u16 = 0x08;

/// STIMER strobe: restarts every divider
pub const STIMER_ADDR: u16 = 0x09;

/// SKCTL register
pub const SKCTL_ADDR: u16 = 0x0F;

const DIV_64KHZ: BlipTime = 28;
const DIV_15KHZ: BlipTime = 114;
const MAX_AMP: i32 = 15;

const POLY4_LEN: usize = 15;
const POLY5_LEN: u64 = 31;
const POLY9_LEN: usize = 511;
const POLY17_LEN: usize = 131_071;
const POLY5: u32 = 0x167C_6EA1;

bitflags! {
    /// Audio control (AUDCTL)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AudCtl: u8 {
        /// Use the 9-bit polynomial in place of the 17-bit one
        const POLY9 = 0x80;
        /// Clock voice 1 at the full CPU rate
        const CH1_FAST = 0x40;
        /// Clock voice 3 at the full CPU rate
        const CH3_FAST = 0x20;
        /// Join voices 1 and 2 into a 16-bit divider
        const JOIN_12 = 0x10;
        /// Join voices 3 and 4 into a 16-bit divider
        const JOIN_34 = 0x08;
        /// High-pass voice 1, clocked by voice 3
        const HIPASS_13 = 0x04;
        /// High-pass voice 2, clocked by voice 4
        const HIPASS_24 = 0x02;
        /// 15 kHz base clock instead of 64 kHz
        const CLOCK_15KHZ = 0x01;
    }
}

/// Polynomial counter outputs, one entry per clock
struct Polys {
    poly4: Vec<bool>,
    poly9: Vec<bool>,
    poly17: Vec<bool>,
}

/// Run a Galois LFSR with feedback `mask` from state 1 for `len` clocks.
fn gen_poly(mask: u32, len: usize) -> Vec<bool> {
    let mut n: u32 = 1;
    (0..len)
        .map(|_| {
            let bit = n & 1 != 0;
            n = (n >> 1) ^ (mask & (n & 1).wrapping_neg());
            bit
        })
        .collect()
}

fn polys() -> &'static Polys {
    static POLYS: OnceLock<Polys> = OnceLock::new();
    POLYS.get_or_init(|| Polys {
        poly4: gen_poly(0x0C, POLY4_LEN),
        poly9: gen_poly(0x108, POLY9_LEN),
        poly17: gen_poly(0x1_0800, POLY17_LEN),
    })
}

impl Polys {
    #[inline]
    fn poly5(&self, clock: u64) -> bool {
        (POLY5 >> (clock % POLY5_LEN)) & 1 != 0
    }

    #[inline]
    fn poly4(&self, clock: u64) -> bool {
        self.poly4[(clock % POLY4_LEN as u64) as usize]
    }

    #[inline]
    fn poly9(&self, clock: u64) -> bool {
        self.poly9[(clock % POLY9_LEN as u64) as usize]
    }

    #[inline]
    fn poly17(&self, clock: u64) -> bool {
        self.poly17[(clock % POLY17_LEN as u64) as usize]
    }
}

/// Per-span settings a voice needs from the chip
#[derive(Clone, Copy, Debug)]
struct SpanContext {
    period: BlipTime,
    muted: bool,
    poly9: bool,
    /// Absolute clock of time 0 in this frame
    base: u64,
    /// Delay and period of the divider clocking the high-pass flip-flop
    filter: Option<(BlipTime, BlipTime)>,
}

#[derive(Clone, Debug)]
struct PokeyVoice {
    voice: Voice,
    audf: u8,
    audc: u8,
    flip: bool,
    latch: bool,
}

impl PokeyVoice {
    fn new(osc: usize) -> Self {
        Self {
            voice: Voice::new(Some(osc)),
            audf: 0,
            audc: 0,
            flip: false,
            latch: false,
        }
    }

    /// Flip-flop state after a divider edge at absolute clock `clock`.
    #[inline]
    fn next_flip(audc: u8, flip: bool, clock: u64, poly9: bool) -> bool {
        let polys = polys();
        if audc & 0x80 == 0 && !polys.poly5(clock) {
            return flip;
        }
        if audc & 0x20 != 0 {
            !flip
        } else if audc & 0x40 != 0 {
            polys.poly4(clock)
        } else if poly9 {
            polys.poly9(clock)
        } else {
            polys.poly17(clock)
        }
    }

    /// Clock the divider and flip-flop over `[from, to)` without output.
    ///
    /// Costs O(1) in the span length: a toggling flip-flop only needs the
    /// parity of the edges poly5 lets through, and a sampling one only the
    /// last such edge. Poly5 repeats every 31 edges of any divider.
    fn advance(&mut self, from: BlipTime, to: BlipTime, ctx: &SpanContext) -> Result<()> {
        let period = ctx.period.max(1) as u64;
        let first = ctx.base + (from + self.voice.delay) as u64;
        let edges = self.voice.skip(from, to, ctx.period)? as u64;
        if edges == 0 {
            return Ok(());
        }
        let polys = polys();
        let clock_at = |k: u64| first + k * period;
        let gated = self.audc & 0x80 == 0;
        let passes = |k: u64| !gated || polys.poly5(clock_at(k));

        if self.audc & 0x20 != 0 {
            let toggles = if gated {
                let hits = |n: u64| (0..n).filter(|&k| passes(k)).count() as u64;
                edges / POLY5_LEN * hits(POLY5_LEN) + hits(edges % POLY5_LEN)
            } else {
                edges
            };
            self.flip ^= toggles & 1 != 0;
        } else if let Some(last) = (edges.saturating_sub(POLY5_LEN)..edges).rev().find(|&k| passes(k)) {
            self.flip = Self::next_flip(self.audc, self.flip, clock_at(last), ctx.poly9);
        }
        Ok(())
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        ctx: &SpanContext,
    ) -> Result<()> {
        let volume = (self.audc & 0x0F) as i32;
        let out = match out {
            Some(out) if !ctx.muted && volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.voice.silence(synth, out, from)?;
                }
                return self.advance(from, to, ctx);
            }
        };

        if self.audc & 0x10 != 0 {
            // volume-only: the level goes straight to the DAC
            self.voice.settle(synth, out, from, volume)?;
            return self.advance(from, to, ctx);
        }

        if ctx.filter.is_none() {
            self.latch = false;
            let pure = self.audc & 0xA0 == 0xA0;
            if pure && out.is_inaudible(ctx.period * 2) {
                self.voice.settle(synth, out, from, volume / 2)?;
                return self.advance(from, to, ctx);
            }
        }

        let period = ctx.period.max(1);
        let (mut clock_time, clock_period) = match ctx.filter {
            Some((delay, period)) => (from + delay, period.max(1)),
            None => (BlipTime::MAX, 1),
        };
        let amp = |flip: bool, latch: bool| if flip != latch { volume } else { 0 };

        self.voice
            .settle(synth, out, from, amp(self.flip, self.latch))?;
        let mut time = from + self.voice.delay;
        loop {
            if clock_time < time.min(to) {
                self.latch = self.flip;
                synth.update(clock_time, amp(self.flip, self.latch), &mut self.voice.last_amp, out)?;
                clock_time += clock_period;
                continue;
            }
            if time >= to {
                break;
            }
            self.flip = Self::next_flip(self.audc, self.flip, ctx.base + time as u64, ctx.poly9);
            synth.update(time, amp(self.flip, self.latch), &mut self.voice.last_amp, out)?;
            time += period;
        }
        self.voice.delay = time - to;
        Ok(())
    }
}

/// Atari POKEY
#[derive(Clone, Debug)]
pub struct Pokey {
    voices: [PokeyVoice; OSC_COUNT],
    audctl: AudCtl,
    skctl: u8,
    /// Absolute clock count at the start of the current frame
    poly_clock: u64,
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Pokey {
    /// Create a chip at power-up state, each voice on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            voices: std::array::from_fn(PokeyVoice::new),
            audctl: AudCtl::empty(),
            skctl: 0,
            poly_clock: 0,
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// Current AUDCTL value.
    pub fn audctl(&self) -> AudCtl {
        self.audctl
    }

    /// Divider period of every voice in clocks.
    pub fn periods(&self) -> [BlipTime; OSC_COUNT] {
        let ctl = self.audctl;
        let div = if ctl.contains(AudCtl::CLOCK_15KHZ) {
            DIV_15KHZ
        } else {
            DIV_64KHZ
        };
        let audf = |i: usize| self.voices[i].audf as BlipTime;
        let mut periods: [BlipTime; OSC_COUNT] = std::array::from_fn(|i| (audf(i) + 1) * div);

        for (low, fast, join) in [
            (0, AudCtl::CH1_FAST, AudCtl::JOIN_12),
            (2, AudCtl::CH3_FAST, AudCtl::JOIN_34),
        ] {
            if ctl.contains(fast) {
                periods[low] = audf(low) + 4;
            }
            if ctl.contains(join) {
                let joined = (audf(low + 1) << 8) | audf(low);
                periods[low + 1] = if ctl.contains(fast) {
                    joined + 7
                } else {
                    (joined + 1) * div
                };
            }
        }
        periods
    }

    /// Last SKCTL value.
    pub fn skctl(&self) -> u8 {
        self.skctl
    }

    /// Output flip-flop of a voice.
    pub fn flip(&self, osc: usize) -> Result<bool> {
        check_osc(osc, OSC_COUNT)?;
        Ok(self.voices[osc].flip)
    }

    fn write_register(&mut self, addr: u16, data: u8) {
        match addr {
            0x00..=0x07 => {
                let voice = &mut self.voices[(addr / 2) as usize];
                if addr & 1 == 0 {
                    voice.audf = data;
                } else {
                    voice.audc = data;
                }
            }
            AUDCTL_ADDR => {
                self.audctl = AudCtl::from_bits_retain(data);
                log::debug!("{NAME}: AUDCTL = {:?}", self.audctl);
            }
            STIMER_ADDR => {
                for voice in &mut self.voices {
                    voice.voice.delay = 0;
                }
            }
            SKCTL_ADDR => {
                if data & 0x08 != 0 {
                    log::warn!("{NAME}: two-tone mode stored but not emulated");
                }
                self.skctl = data;
            }
            _ => {}
        }
    }
}

impl SoundChip for Pokey {
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
            *state = PokeyVoice::new(osc);
            state.voice.output = output;
        }
        self.audctl = AudCtl::empty();
        self.skctl = 0;
        self.poly_clock = 0;
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        if !(addr <= STIMER_ADDR || addr == SKCTL_ADDR) {
            return Err(BlipError::AddressOutOfRange { addr, chip: NAME });
        }
        self.run_until(time)?;
        log::trace!("{NAME}: write {addr:#04x} = {data:#04x} at {time}");
        self.write_register(addr, data);
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let periods = self.periods();
        let ctl = self.audctl;
        // the high-pass clocks run after the voices they filter
        let clock_delays = [self.voices[2].voice.delay, self.voices[3].voice.delay];
        let base = self.poly_clock;
        let Self {
            voices,
            synth,
            outputs,
            ..
        } = self;

        for (osc, state) in voices.iter_mut().enumerate() {
            let muted = (osc == 0 && ctl.contains(AudCtl::JOIN_12))
                || (osc == 2 && ctl.contains(AudCtl::JOIN_34));
            let filter = match osc {
                0 if ctl.contains(AudCtl::HIPASS_13) => Some((clock_delays[0], periods[2])),
                1 if ctl.contains(AudCtl::HIPASS_24) => Some((clock_delays[1], periods[3])),
                _ => None,
            };
            let ctx = SpanContext {
                period: periods[osc],
                muted,
                poly9: ctl.contains(AudCtl::POLY9),
                base,
                filter,
            };
            state.run(synth, outputs.route(state.voice.output), from, time, &ctx)?;
        }
        self.last_time = time;
        Ok(())
    }

    fn end_frame(&mut self, length: BlipTime) -> Result<()> {
        self.run_until(length)?;
        self.outputs.end_frame(length);
        self.last_time -= length;
        self.poly_clock += length as u64;
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

    #[test]
    fn test_polys_are_maximal_length() {
        let polys = polys();
        assert_eq!(polys.poly4.iter().filter(|&&b| b).count(), 8);
        assert_eq!(polys.poly9.iter().filter(|&&b| b).count(), 256);
        assert_eq!(polys.poly17.iter().filter(|&&b| b).count(), 65_536);
        assert_eq!(POLY5.count_ones(), 16);
    }

    #[test]
    fn test_divider_periods() {
        let mut chip = Pokey::new().unwrap();
        chip.write(0x00, 9).unwrap();
        chip.write(0x02, 0x12).unwrap();
        assert_eq!(chip.periods()[0], 10 * 28);

        chip.write(AUDCTL_ADDR, 0x01).unwrap();
        assert_eq!(chip.periods()[0], 10 * 114);

        chip.write(AUDCTL_ADDR, 0x40).unwrap();
        assert_eq!(chip.periods()[0], 9 + 4);

        chip.write(AUDCTL_ADDR, 0x50).unwrap();
        assert_eq!(chip.periods()[1], 0x1209 + 7);

        chip.write(AUDCTL_ADDR, 0x10).unwrap();
        assert_eq!(chip.periods()[1], (0x1209 + 1) * 28);
    }

    #[test]
    fn test_pure_tone_toggles_each_edge() {
        let mut chip = Pokey::new().unwrap();
        chip.set_output(0, None).unwrap();
        chip.write(0x00, 9).unwrap();
        chip.write(0x01, 0xA8).unwrap(); // pure tone, no poly5, volume 8
        chip.run_until(280 * 3).unwrap();
        assert!(chip.flip(0).unwrap(), "three edges: 0, 280, 560");
        chip.run_until(280 * 4).unwrap();
        assert!(!chip.flip(0).unwrap());
    }

    #[test]
    fn test_volume_only_is_constant() {
        let mut chip = Pokey::new().unwrap();
        chip.outputs_mut().set_capacity(1024);
        chip.write(0x03, 0x1B).unwrap();
        chip.run_until(10_000).unwrap();
        let synth = chip.synth.clone();
        let pending = chip.buffer_mut(1).unwrap().pending();
        assert_eq!(pending, 11 * synth.delta_factor() * synth.kernel_unit() as i64);
    }

    #[test]
    fn test_joined_low_voice_is_silent() {
        let mut chip = Pokey::new().unwrap();
        chip.outputs_mut().set_capacity(1024);
        chip.write(AUDCTL_ADDR, 0x10).unwrap();
        chip.write(0x01, 0x1F).unwrap();
        chip.run_until(10_000).unwrap();
        assert_eq!(chip.buffer_mut(0).unwrap().pending(), 0);
    }

    #[test]
    fn test_register_window() {
        let mut chip = Pokey::new().unwrap();
        assert!(chip.write(STIMER_ADDR, 0).is_ok());
        assert!(chip.write(SKCTL_ADDR, 0x08).is_ok());
        assert_eq!(chip.skctl(), 0x08);
        for addr in [0x0A, 0x0E, 0x10] {
            assert!(matches!(
                chip.write(addr, 0),
                Err(BlipError::AddressOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_high_pass_with_equal_clocks_cancels() {
        let mut chip = Pokey::new().unwrap();
        chip.outputs_mut().set_capacity(2048);
        chip.set_output(2, None).unwrap();
        chip.write(0x00, 40).unwrap();
        chip.write(0x01, 0xAF).unwrap();
        chip.write(0x04, 40).unwrap();
        chip.write(0x05, 0xA0).unwrap();
        chip.write(AUDCTL_ADDR, 0x04).unwrap();
        chip.run_until(41 * 28 * 20).unwrap();
        // voice 3 latches voice 1 right after each toggle
        assert_eq!(chip.voices[0].voice.last_amp, 0);
    }

    /// Edge-by-edge reference for the flip-flop and divider delay.
    fn walk(voice: &PokeyVoice, from: BlipTime, to: BlipTime, ctx: &SpanContext) -> (bool, BlipTime) {
        let mut flip = voice.flip;
        let mut time = from + voice.voice.delay;
        while time < to {
            flip = PokeyVoice::next_flip(voice.audc, flip, ctx.base + time as u64, ctx.poly9);
            time += ctx.period.max(1);
        }
        (flip, time - to)
    }

    #[test]
    fn test_silent_advance_matches_edge_walk() {
        for audc in [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0] {
            for period in [1, 31, 93] {
                for poly9 in [false, true] {
                    let ctx = SpanContext {
                        period,
                        muted: true,
                        poly9,
                        base: 12_345,
                        filter: None,
                    };
                    let mut voice = PokeyVoice::new(0);
                    voice.audc = audc;
                    let mut from = 0;
                    for len in [0, 5, 93, 200, 3100, 31 * 93 + 7, 50_000] {
                        let to = from + len;
                        let expected = walk(&voice, from, to, &ctx);
                        voice.advance(from, to, &ctx).unwrap();
                        assert_eq!(
                            (voice.flip, voice.voice.delay),
                            expected,
                            "audc {audc:#04x}, period {period}, poly9 {poly9}, span {from}..{to}"
                        );
                        from = to;
                    }
                }
            }
        }
    }

    #[test]
    fn test_silent_advance_skips_long_spans() {
        let mut voice = PokeyVoice::new(0);
        voice.audc = 0xA0;
        let ctx = SpanContext {
            period: 1,
            muted: true,
            poly9: false,
            base: 0,
            filter: None,
        };
        voice.advance(0, u32::MAX - 1, &ctx).unwrap();
        assert!(!voice.flip, "an even number of edges");
        voice.advance(u32::MAX - 1, u32::MAX, &ctx).unwrap();
        assert!(voice.flip);
    }
}
