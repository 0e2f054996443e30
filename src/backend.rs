//! Chip trait abstraction
//!
//! This module defines the interface every emulated sound chip implements,
//! and the buffer bank chips use to route their oscillators.

use crate::blip::buffer::DEFAULT_SAMPLE_RATE;
use crate::blip::{BlipTime, Equalizer, StepSynthesizer, SynthesisBuffer};
use crate::config::SynthConfig;
use crate::oscillator::Voice;
use crate::{BlipError, Result};

/// Common interface for emulated sound chips
///
/// Time is counted in chip clock cycles since the last
/// [`end_frame`](SoundChip::end_frame). Register writes take effect at the
/// chip's current time; [`write_at`](SoundChip::write_at) first catches the
/// oscillators up to an explicit time within the frame.
///
/// # Example
///
/// ```
/// use blipsynth::{chips::ChipKind, SoundChip};
///
/// fn render_frame(chip: &mut dyn SoundChip, cycles: u32) -> blipsynth::Result<f32> {
///     chip.end_frame(cycles)?;
///     Ok(chip.buffer_mut(0)?.read_sample())
/// }
///
/// # fn main() -> blipsynth::Result<()> {
/// let mut chip = ChipKind::Sn76489.build()?;
/// chip.set_sample_rate(44_100)?;
/// chip.write(0x00, 0x8E)?; // tone 0 period low bits
/// chip.write(0x00, 0x0F)?; // tone 0 period high bits
/// chip.write(0x00, 0x90)?; // tone 0 full volume
/// let cycles = chip.buffer_mut(0)?.cycles_per_sample();
/// render_frame(chip.as_mut(), cycles)?;
/// # Ok(())
/// # }
/// ```
pub trait SoundChip: Send {
    /// Short chip name used in errors and logs
    fn name(&self) -> &'static str;

    /// Nominal clock rate in Hz
    fn clock_rate(&self) -> u32;

    /// Number of oscillators
    fn oscillator_count(&self) -> usize;

    /// Restore power-up register and oscillator state
    ///
    /// Routing and synthesis settings are kept; buffers are flushed.
    fn reset(&mut self);

    /// Current time within the frame
    fn last_time(&self) -> BlipTime;

    /// Write a register at an explicit time within the current frame
    ///
    /// Fails with `AddressOutOfRange` outside the chip's window and with
    /// `TimeRegression` if `time` is earlier than [`last_time`](Self::last_time).
    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()>;

    /// Write a register at the current time
    fn write(&mut self, addr: u16, data: u8) -> Result<()> {
        let time = self.last_time();
        self.write_at(time, addr, data)
    }

    /// Render all oscillators up to `time`
    fn run_until(&mut self, time: BlipTime) -> Result<()>;

    /// Finish a frame of `length` clocks and start the next at time 0
    fn end_frame(&mut self, length: BlipTime) -> Result<()>;

    /// Route oscillator `osc` to buffer `output`, or mute it with `None`
    fn set_output(&mut self, osc: usize, output: Option<usize>) -> Result<()>;

    /// Buffer bank owned by the chip
    fn outputs(&self) -> &OutputBank;

    /// Mutable buffer bank owned by the chip
    fn outputs_mut(&mut self) -> &mut OutputBank;

    /// Set the volume of every synthesizer
    fn set_volume(&mut self, level: f32) -> Result<()>;

    /// Set the treble curve of every synthesizer
    fn set_treble(&mut self, eq: &Equalizer) -> Result<()>;

    /// Buffer at `index`
    fn buffer_mut(&mut self, index: usize) -> Result<&mut SynthesisBuffer> {
        self.outputs_mut().get_mut(index)
    }

    /// Set the output sample rate of every buffer, using the chip's clock
    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        let clock_rate = self.clock_rate();
        self.outputs_mut().set_sample_rate(sample_rate, clock_rate)
    }

    /// Apply a complete synthesis configuration
    fn configure(&mut self, config: &SynthConfig) -> Result<()> {
        config.validate()?;
        self.outputs_mut().set_capacity(config.frame_capacity);
        self.set_sample_rate(config.sample_rate)?;
        self.outputs_mut().set_bass_freq(config.bass_freq);
        self.set_treble(&config.treble.with_sample_rate(config.sample_rate))?;
        self.set_volume(config.volume)?;
        log::debug!("{}: configured {:?}", self.name(), config);
        Ok(())
    }
}

/// Buffers owned by one chip
///
/// Oscillators refer to buffers by index, so several can share one buffer
/// and rerouting never invalidates references.
#[derive(Debug, Clone)]
pub struct OutputBank {
    buffers: Vec<SynthesisBuffer>,
}

impl OutputBank {
    /// Create `count` buffers at the default sample rate for `clock_rate`.
    pub fn new(count: usize, clock_rate: u32) -> Self {
        let buffers = (0..count)
            .map(|_| {
                let mut buffer = SynthesisBuffer::new();
                if let Err(e) = buffer.set_sample_rate(DEFAULT_SAMPLE_RATE, clock_rate) {
                    log::warn!("output bank: {e}");
                }
                buffer
            })
            .collect();
        Self { buffers }
    }

    /// Number of buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True when the bank has no buffers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer at `index`, or `ChannelOutOfRange`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut SynthesisBuffer> {
        let count = self.buffers.len();
        self.buffers
            .get_mut(index)
            .ok_or(BlipError::ChannelOutOfRange { index, count })
    }

    /// Buffer a voice is routed to, if any.
    #[inline]
    pub fn route(&mut self, output: Option<usize>) -> Option<&mut SynthesisBuffer> {
        output.and_then(|index| self.buffers.get_mut(index))
    }

    /// Check that `output` names an existing buffer.
    pub fn validate(&self, output: Option<usize>) -> Result<()> {
        match output {
            Some(index) if index >= self.buffers.len() => Err(BlipError::ChannelOutOfRange {
                index,
                count: self.buffers.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Move `voice` to `output`, leaving no DC behind in its old buffer.
    pub fn reroute(
        &mut self,
        voice: &mut Voice,
        synth: &StepSynthesizer,
        time: BlipTime,
        output: Option<usize>,
    ) -> Result<()> {
        self.validate(output)?;
        if let Some(old) = self.route(voice.output) {
            voice.silence(synth, old, time)?;
        }
        voice.last_amp = 0;
        voice.output = output;
        Ok(())
    }

    /// Advance every buffer by `time` clocks.
    pub fn end_frame(&mut self, time: BlipTime) {
        self.buffers.iter_mut().for_each(|b| b.end_frame(time));
    }

    /// Set every buffer's rates.
    pub fn set_sample_rate(&mut self, sample_rate: u32, clock_rate: u32) -> Result<()> {
        self.buffers
            .iter_mut()
            .try_for_each(|b| b.set_sample_rate(sample_rate, clock_rate))
    }

    /// Set every buffer's drift-removal cutoff.
    pub fn set_bass_freq(&mut self, hz: u32) {
        self.buffers.iter_mut().for_each(|b| b.set_bass_freq(hz));
    }

    /// Resize every buffer for frames of up to `capacity` samples.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.buffers.iter_mut().for_each(|b| b.set_capacity(capacity));
    }

    /// Flush every buffer.
    pub fn flush(&mut self) {
        self.buffers.iter_mut().for_each(SynthesisBuffer::flush);
    }

    /// Samples every buffer can deliver.
    pub fn samples_avail(&self) -> usize {
        self.buffers
            .iter()
            .map(SynthesisBuffer::samples_avail)
            .min()
            .unwrap_or(0)
    }

    /// Read one sample from every buffer and return their sum.
    pub fn read_mixed(&mut self) -> f32 {
        self.buffers.iter_mut().map(SynthesisBuffer::read_sample).sum()
    }

    /// Iterate over the buffers.
    pub fn iter(&self) -> impl Iterator<Item = &SynthesisBuffer> {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blip::Quality;

    #[test]
    fn test_get_mut_bounds() {
        let mut bank = OutputBank::new(3, 1_789_773);
        assert!(bank.get_mut(2).is_ok());
        assert!(matches!(
            bank.get_mut(3),
            Err(BlipError::ChannelOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_reroute_removes_dc_from_old_buffer() {
        let mut bank = OutputBank::new(2, 768_000);
        bank.set_sample_rate(48_000, 768_000).unwrap();
        let synth = StepSynthesizer::new(Quality::Low, 15).unwrap();
        let mut voice = Voice::new(Some(0));

        let out = bank.route(voice.output).unwrap();
        voice.settle(&synth, out, 0, 9).unwrap();
        bank.reroute(&mut voice, &synth, 8, Some(1)).unwrap();

        assert_eq!(voice.output, Some(1));
        assert_eq!(voice.last_amp, 0);
        assert_eq!(bank.get_mut(0).unwrap().pending(), 0);
        assert!(bank.reroute(&mut voice, &synth, 8, Some(7)).is_err());
    }

    #[test]
    fn test_default_rate_uses_chip_clock() {
        let mut bank = OutputBank::new(1, 3_579_545);
        let buffer = bank.get_mut(0).unwrap();
        assert_eq!(buffer.sample_rate(), DEFAULT_SAMPLE_RATE);
        assert_eq!(buffer.cycles_per_sample(), 81);
    }
}
