//! Step synthesizer
//!
//! Converts amplitude changes at chip-clock times into kernel-shaped deltas.
//! A synthesizer carries no per-voice state, so one instance can serve every
//! oscillator of the same kind on a chip.

use super::buffer::SynthesisBuffer;
use super::kernel::{Equalizer, ImpulseKernel, Quality};
use super::{BlipTime, BASE_KERNEL_UNIT, BUFFER_ACCURACY, PHASES, PHASE_BITS, SAMPLE_BITS, WIDEST_KERNEL};
use crate::{BlipError, Result};
use std::fmt;

/// Largest amplitude range whose unit step keeps a non-zero kernel at volume 1.0.
pub const MAX_AMP_RANGE: i32 = 1 << 29;

/// Band-limited step generator for one amplitude range
#[derive(Clone)]
pub struct StepSynthesizer {
    quality: Quality,
    amp_range: i32,
    eq: Equalizer,
    kernel: ImpulseKernel,
    level: f32,
    volume_unit: f64,
    delta_factor: i64,
}

impl StepSynthesizer {
    /// Create a synthesizer whose full-scale output corresponds to an
    /// amplitude of `amp_range`.
    ///
    /// Starts with the default treble (-8 dB) and a volume of 1.0. Ranges
    /// outside `1..=MAX_AMP_RANGE` fail with `InvalidAmpRange`.
    pub fn new(quality: Quality, amp_range: i32) -> Result<Self> {
        if !(1..=MAX_AMP_RANGE).contains(&amp_range) {
            return Err(BlipError::InvalidAmpRange(amp_range));
        }
        let eq = Equalizer::default();
        let mut synth = Self {
            quality,
            amp_range,
            kernel: ImpulseKernel::new(quality, &eq),
            eq,
            level: 1.0,
            volume_unit: 0.0,
            delta_factor: 0,
        };
        synth.apply_volume()?;
        Ok(synth)
    }

    /// Set the output level; `amp_range` then maps to `level` full scale.
    pub fn set_volume(&mut self, level: f32) -> Result<()> {
        if !level.is_finite() || level < 0.0 {
            return Err(BlipError::InvalidVolume(level));
        }
        let previous = self.level;
        self.level = level;
        if let Err(e) = self.apply_volume() {
            self.level = previous;
            self.apply_volume()?;
            return Err(e);
        }
        log::debug!(
            "step synth: volume {level} (delta factor {}, kernel unit {})",
            self.delta_factor,
            self.kernel.unit()
        );
        Ok(())
    }

    /// Regenerate the kernel for a new treble curve.
    pub fn set_treble(&mut self, eq: &Equalizer) -> Result<()> {
        self.eq = *eq;
        self.kernel.reshape(eq);
        log::debug!(
            "step synth: treble {} dB, rolloff {} Hz at {} Hz",
            eq.treble,
            eq.rolloff_freq,
            eq.sample_rate
        );
        self.apply_volume()
    }

    fn apply_volume(&mut self) -> Result<()> {
        self.volume_unit = self.level as f64 / self.amp_range as f64;
        if self.volume_unit == 0.0 {
            self.delta_factor = 0;
            return Ok(());
        }

        let mut factor = self.volume_unit * (1u64 << SAMPLE_BITS) as f64 / BASE_KERNEL_UNIT as f64;
        let mut shift = 0u32;
        while factor < 2.0 {
            shift += 1;
            factor *= 2.0;
        }
        let unit = BASE_KERNEL_UNIT.checked_shr(shift).unwrap_or(0);
        if unit == 0 {
            return Err(BlipError::VolumeTooLow(self.level));
        }
        if unit != self.kernel.unit() {
            self.kernel.quantize(unit);
        }
        self.delta_factor = factor.round() as i64;
        Ok(())
    }

    /// Add an amplitude change at chip time `time`.
    #[inline]
    pub fn offset(&self, time: BlipTime, delta: i32, buf: &mut SynthesisBuffer) -> Result<()> {
        self.offset_resampled(buf.resampled_time(time), delta, buf)
    }

    /// Add an amplitude change at a Q16.16 output-sample position.
    pub fn offset_resampled(&self, resampled: u64, delta: i32, buf: &mut SynthesisBuffer) -> Result<()> {
        let width = self.kernel.width();
        let start = (resampled >> BUFFER_ACCURACY) as usize + (WIDEST_KERNEL - width) / 2;
        if start + width > buf.delay_len() {
            return Err(BlipError::TimeOutOfRange {
                sample: resampled >> BUFFER_ACCURACY,
                capacity: buf.delay_len(),
            });
        }
        if delta == 0 {
            return Ok(());
        }

        let phase = (resampled >> (BUFFER_ACCURACY - PHASE_BITS)) as usize & (PHASES - 1);
        let scaled = delta as i64 * self.delta_factor;
        for (tap, &k) in self.kernel.row(phase).iter().enumerate() {
            buf.add_delta(start + tap, scaled * k as i64);
        }
        Ok(())
    }

    /// Move an oscillator to `amplitude`, emitting the difference from
    /// `last_amp` and recording the new level.
    #[inline]
    pub fn update(
        &self,
        time: BlipTime,
        amplitude: i32,
        last_amp: &mut i32,
        buf: &mut SynthesisBuffer,
    ) -> Result<()> {
        let delta = amplitude - *last_amp;
        if delta != 0 {
            self.offset(time, delta, buf)?;
            *last_amp = amplitude;
        }
        Ok(())
    }

    /// Current volume level.
    #[inline]
    pub fn volume(&self) -> f32 {
        self.level
    }

    /// Output level per unit of amplitude.
    #[inline]
    pub fn volume_unit(&self) -> f64 {
        self.volume_unit
    }

    /// Integer scale applied to every delta.
    #[inline]
    pub fn delta_factor(&self) -> i64 {
        self.delta_factor
    }

    /// Sum of each kernel row at the current volume.
    #[inline]
    pub fn kernel_unit(&self) -> i32 {
        self.kernel.unit()
    }

    /// Kernel width in taps.
    #[inline]
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Amplitude that maps to full scale.
    #[inline]
    pub fn amp_range(&self) -> i32 {
        self.amp_range
    }

    /// Current treble curve.
    #[inline]
    pub fn equalizer(&self) -> &Equalizer {
        &self.eq
    }
}

impl fmt::Debug for StepSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSynthesizer")
            .field("quality", &self.quality)
            .field("amp_range", &self.amp_range)
            .field("level", &self.level)
            .field("delta_factor", &self.delta_factor)
            .field("kernel_unit", &self.kernel.unit())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> SynthesisBuffer {
        let mut buf = SynthesisBuffer::with_capacity(64);
        buf.set_sample_rate(48_000, 768_000).unwrap();
        buf.set_bass_freq(0);
        buf
    }

    #[test]
    fn test_step_reaches_full_scale() {
        let synth = StepSynthesizer::new(Quality::High, 15).unwrap();
        let mut buf = buffer();
        let mut last = 0;
        synth.update(0, 15, &mut last, &mut buf).unwrap();
        assert_eq!(last, 15);

        buf.end_frame(16 * 32);
        let mut out = [0.0f32; 32];
        buf.read_samples(&mut out);
        approx::assert_abs_diff_eq!(out[31], 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_delta_is_conserved() {
        let synth = StepSynthesizer::new(Quality::Medium, 100).unwrap();
        let mut buf = buffer();
        let mut last = 0;
        for (i, amp) in [40, -20, 70, 10].into_iter().enumerate() {
            synth.update(i as u32 * 37, amp, &mut last, &mut buf).unwrap();
        }
        let expected = 10 * synth.delta_factor() * synth.kernel_unit() as i64;
        assert_eq!(buf.pending(), expected);

        buf.end_frame(16 * 40);
        for _ in 0..40 {
            buf.read_sample();
        }
        assert_eq!(buf.accumulator(), expected);
    }

    #[test]
    fn test_volume_validation() {
        let mut synth = StepSynthesizer::new(Quality::Low, 15).unwrap();
        assert!(matches!(synth.set_volume(-0.5), Err(BlipError::InvalidVolume(_))));
        assert!(matches!(synth.set_volume(f32::NAN), Err(BlipError::InvalidVolume(_))));
        assert!(matches!(synth.set_volume(1e-9), Err(BlipError::VolumeTooLow(_))));
        assert_eq!(synth.volume(), 1.0, "failed update keeps previous level");
    }

    #[test]
    fn test_rejects_unrepresentable_amp_range() {
        for range in [0, -15, MAX_AMP_RANGE + 1, i32::MAX] {
            assert!(
                matches!(
                    StepSynthesizer::new(Quality::Medium, range),
                    Err(BlipError::InvalidAmpRange(r)) if r == range
                ),
                "{range}"
            );
        }
    }

    #[test]
    fn test_largest_amp_range_still_sounds() {
        let synth = StepSynthesizer::new(Quality::Medium, MAX_AMP_RANGE).unwrap();
        assert!(synth.kernel_unit() > 0);
        assert!(synth.delta_factor() > 0);
        let mut buf = buffer();
        let mut last = 0;
        synth.update(0, MAX_AMP_RANGE, &mut last, &mut buf).unwrap();
        assert_ne!(buf.pending(), 0);
    }

    #[test]
    fn test_low_volume_attenuates_kernel() {
        let mut synth = StepSynthesizer::new(Quality::Medium, 15).unwrap();
        assert_eq!(synth.kernel_unit(), BASE_KERNEL_UNIT);
        synth.set_volume(1e-4).unwrap();
        assert!(synth.kernel_unit() < BASE_KERNEL_UNIT);
        assert!(synth.delta_factor() >= 2);
        let product = synth.delta_factor() as f64 * synth.kernel_unit() as f64;
        approx::assert_relative_eq!(product, 1e-4 / 15.0 * (1u64 << 30) as f64, max_relative = 0.3);
    }

    #[test]
    fn test_zero_volume_mutes() {
        let mut synth = StepSynthesizer::new(Quality::Medium, 15).unwrap();
        synth.set_volume(0.0).unwrap();
        let mut buf = buffer();
        let mut last = 0;
        synth.update(0, 15, &mut last, &mut buf).unwrap();
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_offset_past_delay_line_fails() {
        let synth = StepSynthesizer::new(Quality::High, 15).unwrap();
        let mut buf = SynthesisBuffer::new();
        buf.set_sample_rate(48_000, 768_000).unwrap();
        assert!(synth.offset(16, 1, &mut buf).is_ok());
        let err = synth.offset(16 * 4, 1, &mut buf);
        assert!(matches!(err, Err(BlipError::TimeOutOfRange { .. })));
    }

    #[test]
    fn test_treble_change_keeps_unit_exact() {
        let mut synth = StepSynthesizer::new(Quality::High, 15).unwrap();
        synth.set_volume(0.001).unwrap();
        let unit = synth.kernel_unit();
        synth.set_treble(&Equalizer::new(-24.0).with_sample_rate(48_000)).unwrap();
        assert_eq!(synth.kernel_unit(), unit);
    }
}
