//! Shared oscillator bookkeeping
//!
//! Every emulated voice renders the same way: catch up to the current
//! amplitude at the start of a span, then either visit each divider edge and
//! emit the steps it causes, or skip the edges arithmetically when nothing
//! would be heard. [`Voice`] holds the state those steps need and implements
//! them once for all chips.

use crate::blip::{BlipTime, StepSynthesizer, SynthesisBuffer};
use crate::{BlipError, Result};

/// Fail with `TimeRegression` when `to` precedes `from`.
#[inline]
pub fn ensure_forward(from: BlipTime, to: BlipTime) -> Result<()> {
    if to < from {
        return Err(BlipError::TimeRegression { from, to });
    }
    Ok(())
}

/// Timing and output state of one oscillator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Voice {
    /// Clocks from the end of the last rendered span to the next divider edge
    pub delay: BlipTime,
    /// Amplitude implied by everything emitted so far
    pub last_amp: i32,
    /// Buffer index in the chip's bank, `None` when muted
    pub output: Option<usize>,
}

impl Voice {
    /// Create a voice routed to `output`.
    pub fn new(output: Option<usize>) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Emit whatever step brings the output to `amp` at `time`.
    #[inline]
    pub fn settle(
        &mut self,
        synth: &StepSynthesizer,
        out: &mut SynthesisBuffer,
        time: BlipTime,
        amp: i32,
    ) -> Result<()> {
        synth.update(time, amp, &mut self.last_amp, out)
    }

    /// Return the output to zero at `time`.
    #[inline]
    pub fn silence(
        &mut self,
        synth: &StepSynthesizer,
        out: &mut SynthesisBuffer,
        time: BlipTime,
    ) -> Result<()> {
        self.settle(synth, out, time, 0)
    }

    /// Advance the divider over `[from, to)` without emitting anything.
    ///
    /// Returns how many edges were passed so the caller can advance its
    /// waveform position by the same amount.
    pub fn skip(&mut self, from: BlipTime, to: BlipTime, period: BlipTime) -> Result<u32> {
        ensure_forward(from, to)?;
        let period = period.max(1);
        let mut time = from + self.delay;
        let mut count = 0;
        if time < to {
            count = (to - time).div_ceil(period);
            time += count * period;
        }
        self.delay = time - to;
        Ok(count)
    }

    /// Visit every divider edge in `[from, to)`.
    ///
    /// `next` advances the waveform by one position and returns the new
    /// amplitude; each change is emitted at the edge's exact time.
    pub fn step<F>(
        &mut self,
        synth: &StepSynthesizer,
        out: &mut SynthesisBuffer,
        from: BlipTime,
        to: BlipTime,
        period: BlipTime,
        mut next: F,
    ) -> Result<()>
    where
        F: FnMut() -> i32,
    {
        ensure_forward(from, to)?;
        let period = period.max(1);
        let mut time = from + self.delay;
        while time < to {
            let amp = next();
            synth.update(time, amp, &mut self.last_amp, out)?;
            time += period;
        }
        self.delay = time - to;
        Ok(())
    }

    /// Clear timing and amplitude state, keeping the routing.
    pub fn reset(&mut self) {
        self.delay = 0;
        self.last_amp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blip::Quality;

    fn setup() -> (StepSynthesizer, SynthesisBuffer) {
        let mut buf = SynthesisBuffer::with_capacity(256);
        buf.set_sample_rate(48_000, 768_000).unwrap();
        (StepSynthesizer::new(Quality::Medium, 15).unwrap(), buf)
    }

    #[test]
    fn test_skip_counts_edges_and_keeps_overshoot() {
        let mut voice = Voice::new(Some(0));
        assert_eq!(voice.skip(0, 100, 30).unwrap(), 4); // edges at 0, 30, 60, 90
        assert_eq!(voice.delay, 20);
        assert_eq!(voice.skip(0, 10, 30).unwrap(), 0);
        assert_eq!(voice.delay, 10);
    }

    #[test]
    fn test_step_matches_skip_timing() {
        let (synth, mut buf) = setup();
        let mut stepped = Voice::new(Some(0));
        let mut edges = 0;
        stepped
            .step(&synth, &mut buf, 0, 1000, 64, || {
                edges += 1;
                (edges & 1) * 15
            })
            .unwrap();

        let mut skipped = Voice::new(Some(0));
        assert_eq!(skipped.skip(0, 1000, 64).unwrap(), edges as u32);
        assert_eq!(stepped.delay, skipped.delay);
        assert_eq!(stepped.last_amp, (edges & 1) * 15);
    }

    #[test]
    fn test_time_regression_rejected() {
        let (synth, mut buf) = setup();
        let mut voice = Voice::default();
        assert!(matches!(
            voice.skip(50, 10, 4),
            Err(BlipError::TimeRegression { from: 50, to: 10 })
        ));
        assert!(voice.step(&synth, &mut buf, 9, 8, 4, || 0).is_err());
    }

    #[test]
    fn test_silence_returns_to_zero() {
        let (synth, mut buf) = setup();
        let mut voice = Voice::new(Some(0));
        voice.settle(&synth, &mut buf, 0, 12).unwrap();
        voice.silence(&synth, &mut buf, 40).unwrap();
        assert_eq!(voice.last_amp, 0);
        assert_eq!(buf.pending(), 0, "up and down steps cancel");
    }
}
