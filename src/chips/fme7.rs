//! Sunsoft 5B / FME-7 expansion audio
//!
//! An AY-3-8910 core clocked from the NES CPU through an extra divide-by-two.
//! Registers are reached indirectly: a write to $C000-$DFFF latches the
//! register number, a write to $E000-$FFFF stores data into it.

use super::ay8910::AyCore;
use super::check_window;
use crate::backend::{OutputBank, SoundChip};
use crate::blip::{BlipTime, Equalizer};
use crate::Result;

/// Chip name
pub const NAME: &str = "fme7";

/// NES CPU clock in Hz
pub const CLOCK_RATE: u32 = 1_789_773;

/// Number of square channels
pub const OSC_COUNT: usize = 3;

/// Register latch port
pub const LATCH_ADDR: u16 = 0xC000;

/// Data port
pub const DATA_ADDR: u16 = 0xE000;

/// Sunsoft 5B
#[derive(Clone, Debug)]
pub struct Fme7 {
    core: AyCore,
    latch: u8,
}

impl Fme7 {
    /// Create a chip at power-up state, each channel on its own buffer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: AyCore::new(2, CLOCK_RATE)?,
            latch: 0,
        })
    }

    /// Currently latched register number.
    pub fn latch(&self) -> u8 {
        self.latch
    }

    /// Current value of register `reg`.
    pub fn register(&self, reg: usize) -> u8 {
        self.core.register(reg)
    }
}

impl SoundChip for Fme7 {
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
        self.latch = 0;
        self.core.reset();
    }

    fn last_time(&self) -> BlipTime {
        self.core.last_time()
    }

    fn write_at(&mut self, time: BlipTime, addr: u16, data: u8) -> Result<()> {
        check_window(addr, LATCH_ADDR..=0xFFFF, NAME)?;
        if addr < DATA_ADDR {
            self.core.run(time)?;
            log::trace!("{NAME}: latch {data:#04x} at {time}");
            self.latch = data;
            return Ok(());
        }
        let reg = self.latch as usize;
        if reg > 0x0F {
            // mapper registers share the latch
            self.core.run(time)?;
            log::trace!("{NAME}: ignored write {data:#04x} to latch {reg:#04x}");
            return Ok(());
        }
        log::trace!("{NAME}: write R{reg} = {data:#04x} at {time}");
        self.core.write(time, reg, data)
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
    use crate::BlipError;

    #[test]
    fn test_latch_then_data() {
        let mut chip = Fme7::new().unwrap();
        chip.write(0xC000, 0x08).unwrap();
        chip.write(0xE000, 0x0C).unwrap();
        assert_eq!(chip.latch(), 0x08);
        assert_eq!(chip.register(8), 0x0C);

        // mirrors anywhere in the port ranges
        chip.write(0xDFFF, 0x00).unwrap();
        chip.write(0xF123, 0x55).unwrap();
        assert_eq!(chip.register(0), 0x55);
    }

    #[test]
    fn test_mapper_latch_values_ignored() {
        let mut chip = Fme7::new().unwrap();
        chip.write(0xC000, 0x0D).unwrap();
        chip.write(0xE000, 0x0E).unwrap();
        chip.write(0xC000, 0x20).unwrap();
        chip.write(0xE000, 0xFF).unwrap();
        assert_eq!(chip.register(13), 0x0E);
    }

    #[test]
    fn test_window() {
        let mut chip = Fme7::new().unwrap();
        assert!(matches!(
            chip.write(0xBFFF, 0),
            Err(BlipError::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn test_square_period_doubles_against_ay() {
        let mut chip = Fme7::new().unwrap();
        chip.write(0xC000, 0x00).unwrap();
        chip.write(0xE000, 10).unwrap();
        assert_eq!(chip.core.tone_period(0), 160);

        let mut ay = crate::chips::Ay8910::new().unwrap();
        ay.write(0x00, 10).unwrap();
        assert_eq!(ay.tone_period(0), 80);
    }
}
