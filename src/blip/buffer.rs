//! Synthesis buffer
//!
//! Holds pending band-limited deltas for the next few output samples and the
//! leaky integrator that turns them back into a waveform.

use super::{BlipTime, BUFFER_ACCURACY, SAMPLE_BITS, WIDEST_KERNEL};
use crate::{BlipError, Result};
use std::collections::VecDeque;
use std::fmt;

/// Default bass cutoff in Hz.
pub const DEFAULT_BASS_FREQ: u32 = 16;

/// Default output sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Shift that disables drift removal entirely.
const NO_BASS_SHIFT: u32 = 31;

const UNIT: u64 = 1 << BUFFER_ACCURACY;

/// Accumulates band-limited steps and produces output samples.
///
/// One buffer represents one output channel. Oscillators write into it
/// through a [`StepSynthesizer`](super::StepSynthesizer); the host advances it
/// with [`end_frame`](Self::end_frame) and drains it with
/// [`read_sample`](Self::read_sample).
#[derive(Clone)]
pub struct SynthesisBuffer {
    sample_rate: u32,
    clock_rate: u32,
    /// Clock cycles per output sample after quantization
    cycles: u32,
    /// Q16.16 output samples per clock cycle, rounded
    factor: u32,
    /// Clock cycles from the delay-line head to chip time 0; negative after
    /// reading past the available samples
    position: i64,
    bass_freq: u32,
    bass_shift: u32,
    accumulator: i64,
    /// Largest frame length in output samples
    capacity: usize,
    delay_line: VecDeque<i64>,
}

impl SynthesisBuffer {
    /// Create a buffer sized for per-sample frames at the default rates.
    pub fn new() -> Self {
        Self::with_capacity(1)
    }

    /// Create a buffer able to hold frames of up to `capacity` output samples.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buffer = Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            clock_rate: DEFAULT_SAMPLE_RATE,
            cycles: 1,
            factor: UNIT as u32,
            position: 0,
            bass_freq: DEFAULT_BASS_FREQ,
            bass_shift: NO_BASS_SHIFT,
            accumulator: 0,
            capacity,
            delay_line: VecDeque::from(vec![0; Self::line_len(capacity)]),
        };
        buffer.set_bass_freq(DEFAULT_BASS_FREQ);
        buffer
    }

    #[inline]
    fn line_len(capacity: usize) -> usize {
        capacity + WIDEST_KERNEL + 1
    }

    /// Set output and clock rates.
    ///
    /// The clock rate is re-quantized to a whole number of cycles per output
    /// sample. Pending deltas and the accumulator are cleared.
    pub fn set_sample_rate(&mut self, sample_rate: u32, clock_rate: u32) -> Result<()> {
        let invalid = BlipError::InvalidRate {
            sample_rate,
            clock_rate,
        };
        if sample_rate == 0 || clock_rate == 0 {
            return Err(invalid);
        }
        let cycles = (clock_rate as f64 / sample_rate as f64).round().max(1.0);
        let quantized = sample_rate as f64 * cycles;
        if quantized > u32::MAX as f64 {
            return Err(invalid);
        }
        let factor = (sample_rate as f64 / quantized * UNIT as f64).round();
        if factor < 1.0 {
            return Err(invalid);
        }

        self.sample_rate = sample_rate;
        self.clock_rate = quantized as u32;
        self.cycles = cycles as u32;
        self.factor = factor as u32;
        self.set_bass_freq(self.bass_freq);
        self.flush();
        log::debug!(
            "synthesis buffer: {} Hz output, {} Hz clock ({} cycles/sample)",
            self.sample_rate,
            self.clock_rate,
            cycles
        );
        Ok(())
    }

    /// Set the drift-removal cutoff. Zero disables it.
    pub fn set_bass_freq(&mut self, hz: u32) {
        self.bass_freq = hz;
        if hz == 0 {
            self.bass_shift = NO_BASS_SHIFT;
            return;
        }
        let mut shift = 13u32;
        let mut f = ((hz as u64) << 16) / self.sample_rate as u64;
        loop {
            f >>= 1;
            if f == 0 {
                break;
            }
            shift -= 1;
            if shift == 0 {
                break;
            }
        }
        self.bass_shift = shift;
    }

    /// Resize the delay line for frames of up to `capacity` samples and flush.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.delay_line = VecDeque::from(vec![0; Self::line_len(self.capacity)]);
        self.flush();
    }

    /// Discard pending deltas, the accumulator and the frame position.
    pub fn flush(&mut self) {
        self.position = 0;
        self.accumulator = 0;
        self.delay_line.iter_mut().for_each(|slot| *slot = 0);
    }

    /// Advance chip time 0 by `time` clock cycles.
    ///
    /// Positions are kept in whole clocks, so any split of the same span into
    /// frames lands every later event on the same sub-sample position.
    #[inline]
    pub fn end_frame(&mut self, time: BlipTime) {
        self.position += time as i64;
    }

    /// Whole output samples completed by previous frames.
    #[inline]
    pub fn samples_avail(&self) -> usize {
        (self.position.max(0) as u64 / self.cycles as u64) as usize
    }

    /// Convert a chip time in the current frame to Q16.16 output samples.
    ///
    /// Times already behind the delay-line head, which only exist after
    /// reading past `samples_avail()`, map to the head.
    #[inline]
    pub fn resampled_time(&self, time: BlipTime) -> u64 {
        let clocks = (self.position + time as i64).max(0) as u64;
        (clocks << BUFFER_ACCURACY) / self.cycles as u64
    }

    /// True when a waveform cycle of `cycle_clocks` spans less than one sample.
    #[inline]
    pub fn is_inaudible(&self, cycle_clocks: u32) -> bool {
        cycle_clocks < self.cycles
    }

    /// Produce the next output sample in `[-1.0, 1.0)`.
    #[inline]
    pub fn read_sample(&mut self) -> f32 {
        self.read_sample_i16() as f32 / 32768.0
    }

    /// Produce the next output sample as a clamped 16-bit value.
    pub fn read_sample_i16(&mut self) -> i16 {
        let slot = self.delay_line.pop_front().unwrap_or(0);
        self.delay_line.push_back(0);
        let drift = if self.bass_shift >= NO_BASS_SHIFT {
            0
        } else {
            self.accumulator >> self.bass_shift
        };
        self.accumulator += slot - drift;
        self.position -= self.cycles as i64;

        let sample = self.accumulator >> (SAMPLE_BITS - 15);
        sample.clamp(i16::MIN as i64, i16::MAX as i64) as i16
    }

    /// Fill `out` with up to `samples_avail()` samples, returning the count.
    pub fn read_samples(&mut self, out: &mut [f32]) -> usize {
        let count = out.len().min(self.samples_avail());
        for sample in &mut out[..count] {
            *sample = self.read_sample();
        }
        count
    }

    /// Add a raw contribution to the delay-line slot `index` samples ahead.
    #[inline]
    pub(crate) fn add_delta(&mut self, index: usize, value: i64) {
        if let Some(slot) = self.delay_line.get_mut(index) {
            *slot += value;
        }
    }

    /// Output sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Quantized clock rate in Hz.
    #[inline]
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Clock cycles per output sample after quantization.
    #[inline]
    pub fn cycles_per_sample(&self) -> BlipTime {
        self.cycles
    }

    /// Q16.16 samples per clock cycle, rounded. Reporting only: positions are
    /// converted exactly through `cycles_per_sample`.
    #[inline]
    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Current bass shift (31 = disabled).
    #[inline]
    pub fn bass_shift(&self) -> u32 {
        self.bass_shift
    }

    /// Raw integrator state.
    #[inline]
    pub fn accumulator(&self) -> i64 {
        self.accumulator
    }

    /// Delay-line length in slots.
    #[inline]
    pub fn delay_len(&self) -> usize {
        self.delay_line.len()
    }

    /// Sum of all pending deltas.
    pub fn pending(&self) -> i64 {
        self.delay_line.iter().sum()
    }
}

impl Default for SynthesisBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SynthesisBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisBuffer")
            .field("sample_rate", &self.sample_rate)
            .field("clock_rate", &self.clock_rate)
            .field("cycles", &self.cycles)
            .field("position", &self.position)
            .field("bass_shift", &self.bass_shift)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
