//! Texas Instruments SN76489 PSG
//!
//! Three square voices and one noise voice behind a single write-only port.
//! A byte with bit 7 set latches a channel and register type and carries
//! the low four data bits; a byte with bit 7 clear supplies the remaining
//! bits of the latched register.

use super::{check_osc, check_window};
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer, Quality, StepSynthesizer, SynthesisBuffer};
use crate::oscillator::{ensure_forward, Voice};
use crate::Result;

/// Chip name
pub const NAME: &str = "sn76489";

/// NTSC colour-burst clock in Hz
pub const CLOCK_RATE: u32 = 3_579_545;

/// Number of oscillators (three tones, noise)
pub const OSC_COUNT: usize = 4;

/// The only port
pub const PORT_ADDR: u16 = 0x00;

/// Output level per attenuation step, 2 dB apart
pub const VOLUME_TABLE: [i32; 16] = [64, 50, 39, 31, 24, 19, 15, 12, 9, 7, 5, 4, 3, 2, 1, 0];

const MAX_AMP: i32 = 64;
const NOISE_SEED: u16 = 0x8000;
/// Shift-rate dividers selected by noise bits 0-1
const NOISE_RATES: [BlipTime; 3] = [16, 32, 64];

/// Shift the noise register once.
///
/// White noise feeds back bits 0 and 3; periodic noise recirculates bit 0.
#[inline]
pub fn clock_noise(shifter: u16, white: bool) -> u16 {
    let feedback = if white {
        (shifter ^ (shifter >> 3)) & 1
    } else {
        shifter & 1
    };
    (shifter >> 1) | (feedback << 15)
}

#[derive(Clone, Debug)]
struct Tone {
    voice: Voice,
    period: u16,
    attenuation: u8,
    high: bool,
}

impl Tone {
    fn new(osc: usize) -> Self {
        Self {
            voice: Voice::new(Some(osc)),
            period: 0,
            attenuation: 0x0F,
            high: false,
        }
    }

    /// Divider count; zero behaves as 0x400.
    #[inline]
    fn divider(&self) -> BlipTime {
        match self.period {
            0 => 0x400,
            n => n as BlipTime,
        }
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
    ) -> Result<()> {
        let divider = self.divider();
        let period = divider * 16;
        let volume = VOLUME_TABLE[self.attenuation as usize];

        let out = match out {
            Some(out) if volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.voice.silence(synth, out, from)?;
                }
                let toggles = self.voice.skip(from, to, period)?;
                self.high ^= toggles & 1 != 0;
                return Ok(());
            }
        };

        if divider == 1 || out.is_inaudible(period * 2) {
            // a divider of one holds the output high; otherwise the mean
            let level = if divider == 1 { volume } else { volume / 2 };
            self.voice.settle(synth, out, from, level)?;
            let toggles = self.voice.skip(from, to, period)?;
            self.high ^= toggles & 1 != 0;
            return Ok(());
        }

        let mut high = self.high;
        self.voice
            .settle(synth, out, from, if high { volume } else { 0 })?;
        self.voice.step(synth, out, from, to, period, || {
            high = !high;
            if high {
                volume
            } else {
                0
            }
        })?;
        self.high = high;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Noise {
    voice: Voice,
    control: u8,
    attenuation: u8,
    shifter: u16,
}

impl Noise {
    fn new() -> Self {
        Self {
            voice: Voice::new(Some(3)),
            control: 0,
            attenuation: 0x0F,
            shifter: NOISE_SEED,
        }
    }

    #[inline]
    fn white(&self) -> bool {
        self.control & 0x04 != 0
    }

    /// Shift period in clocks; rate 3 follows tone 2.
    fn period(&self, tone2_divider: BlipTime) -> BlipTime {
        let rate = NOISE_RATES
            .get((self.control & 3) as usize)
            .copied()
            .unwrap_or(tone2_divider);
        rate * 32
    }

    fn run(
        &mut self,
        synth: &StepSynthesizer,
        out: Option<&mut SynthesisBuffer>,
        from: BlipTime,
        to: BlipTime,
        tone2_divider: BlipTime,
    ) -> Result<()> {
        let period = self.period(tone2_divider);
        let volume = VOLUME_TABLE[self.attenuation as usize];
        let white = self.white();

        let out = match out {
            Some(out) if volume != 0 => out,
            out => {
                if let Some(out) = out {
                    self.voice.silence(synth, out, from)?;
                }
                let shifts = self.voice.skip(from, to, period)?;
                // periodic noise repeats every 16 shifts
                let shifts = if white { shifts } else { shifts % 16 };
                for _ in 0..shifts {
                    self.shifter = clock_noise(self.shifter, white);
                }
                return Ok(());
            }
        };

        let mut shifter = self.shifter;
        self.voice
            .settle(synth, out, from, (shifter & 1) as i32 * volume)?;
        self.voice.step(synth, out, from, to, period, || {
            shifter = clock_noise(shifter, white);
            (shifter & 1) as i32 * volume
        })?;
        self.shifter = shifter;
        Ok(())
    }
}

/// TI SN76489
#[derive(Clone, Debug)]
pub struct Sn76489 {
    tones: [Tone; 3],
    noise: Noise,
    /// Latched channel (bits 1-2) and register type (bit 0, set for volume)
    latch: u8,
    synth: StepSynthesizer,
    outputs: OutputBank,
    last_time: BlipTime,
}

impl Sn76489 {
    /// Create a chip at power-up state with every channel attenuated.
    pub fn new() -> Result<Self> {
        Ok(Self {
            tones: std::array::from_fn(Tone::new),
            noise: Noise::new(),
            latch: 0,
            synth: StepSynthesizer::new(Quality::Medium, MAX_AMP)?,
            outputs: OutputBank::new(OSC_COUNT, CLOCK_RATE),
            last_time: 0,
        })
    }

    /// 10-bit divider of a tone channel.
    pub fn tone_period(&self, channel: usize) -> Result<u16> {
        check_osc(channel, 3)?;
        Ok(self.tones[channel].period)
    }

    /// 4-bit attenuation of any channel.
    pub fn attenuation(&self, channel: usize) -> Result<u8> {
        check_osc(channel, OSC_COUNT)?;
        Ok(match channel {
            3 => self.noise.attenuation,
            c => self.tones[c].attenuation,
        })
    }

    /// Noise shift register.
    pub fn noise_shifter(&self) -> u16 {
        self.noise.shifter
    }

    fn store(&mut self, data: u8, latch_byte: bool) {
        let channel = (self.latch >> 1) as usize;
        if self.latch & 1 != 0 {
            let attenuation = data & 0x0F;
            match channel {
                3 => self.noise.attenuation = attenuation,
                c => self.tones[c].attenuation = attenuation,
            }
            return;
        }
        match channel {
            3 => {
                self.noise.control = data & 0x07;
                self.noise.shifter = NOISE_SEED;
            }
            c if latch_byte => {
                let tone = &mut self.tones[c];
                tone.period = (tone.period & 0x3F0) | (data as u16 & 0x0F);
            }
            c => {
                let tone = &mut self.tones[c];
                tone.period = (tone.period & 0x00F) | ((data as u16 & 0x3F) << 4);
            }
        }
    }
}

impl SoundChip for Sn76489 {
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
        for (osc, tone) in self.tones.iter_mut().enumerate() {
            let output = tone.voice.output;
            *tone = Tone::new(osc);
            tone.voice.output = output;
        }
        let output = self.noise.voice.output;
        self.noise = Noise::new();
        self.noise.voice.output = output;
        self.latch = 0;
        self.last_time = 0;
        self.outputs.flush();
    }

    fn last_time(&self) -> BlipTime {
        self.last_time
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, PORT_ADDR..=PORT_ADDR, NAME)?;
        self.run_until(time)?;
        log::trace!("{NAME}: write {data:#04x} at {time}");
        let latch_byte = data & 0x80 != 0;
        if latch_byte {
            self.latch = (data >> 4) & 0x07;
        }
        self.store(data, latch_byte);
        Ok(())
    }

    fn run_until(&mut self, time: BlipTime) -> Result<()> {
        ensure_forward(self.last_time, time)?;
        let from = self.last_time;
        let tone2_divider = self.tones[2].divider();
        let Self {
            tones,
            noise,
            synth,
            outputs,
            ..
        } = self;
        for tone in tones.iter_mut() {
            tone.run(synth, outputs.route(tone.voice.output), from, time)?;
        }
        noise.run(synth, outputs.route(noise.voice.output), from, time, tone2_divider)?;
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
        let voice = match osc {
            3 => &mut self.noise.voice,
            c => &mut self.tones[c].voice,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlipError;

    #[test]
    fn test_latch_and_data_bytes() {
        let mut chip = Sn76489::new().unwrap();
        chip.write(0x00, 0x8E).unwrap();
        chip.write(0x00, 0x0F).unwrap();
        assert_eq!(chip.tone_period(0).unwrap(), 0xFE);

        chip.write(0x00, 0xB5).unwrap(); // channel 1 volume
        assert_eq!(chip.attenuation(1).unwrap(), 5);
        chip.write(0x00, 0x02).unwrap(); // data byte continues the volume latch
        assert_eq!(chip.attenuation(1).unwrap(), 2);
        assert_eq!(chip.attenuation(3).unwrap(), 0x0F);
    }

    #[test]
    fn test_noise_write_reseeds() {
        let mut chip = Sn76489::new().unwrap();
        chip.write(0x00, 0xF0).unwrap(); // noise volume on
        chip.write(0x00, 0xE4).unwrap(); // white, fastest rate
        chip.run_until(32 * 16 * 5).unwrap();
        assert_ne!(chip.noise_shifter(), NOISE_SEED);
        chip.write(0x00, 0xE4).unwrap();
        assert_eq!(chip.noise_shifter(), NOISE_SEED);
    }

    #[test]
    fn test_periodic_noise_cycles_every_sixteen_shifts() {
        let mut shifter = NOISE_SEED;
        for _ in 0..16 {
            shifter = clock_noise(shifter, false);
        }
        assert_eq!(shifter, NOISE_SEED);
    }

    #[test]
    fn test_white_noise_first_output_bit() {
        let mut shifter = NOISE_SEED;
        let bits: Vec<u16> = (0..16)
            .map(|_| {
                shifter = clock_noise(shifter, true);
                shifter & 1
            })
            .collect();
        assert_eq!(bits.iter().position(|&b| b == 1), Some(14));
    }

    #[test]
    fn test_tone_two_drives_noise_rate() {
        let mut chip = Sn76489::new().unwrap();
        chip.write(0x00, 0xC5).unwrap();
        chip.write(0x00, 0x02).unwrap(); // tone 2 divider 0x25
        chip.write(0x00, 0xE3).unwrap();
        assert_eq!(chip.noise.period(chip.tones[2].divider()), 0x25 * 32);
        assert_eq!(Noise::new().period(1), 16 * 32);
    }

    #[test]
    fn test_port_window() {
        let mut chip = Sn76489::new().unwrap();
        assert!(matches!(
            chip.write(0x01, 0x9F),
            Err(BlipError::AddressOutOfRange { addr: 0x01, .. })
        ));
    }

    #[test]
    fn test_divider_one_is_constant() {
        let mut chip = Sn76489::new().unwrap();
        chip.outputs_mut().set_capacity(1024);
        chip.write(0x00, 0x81).unwrap();
        chip.write(0x00, 0x00).unwrap();
        chip.write(0x00, 0x90).unwrap();
        chip.run_until(20_000).unwrap();
        let synth = chip.synth.clone();
        let pending = chip.buffer_mut(0).unwrap().pending();
        assert_eq!(pending, MAX_AMP as i64 * synth.delta_factor() * synth.kernel_unit() as i64);
    }
}
