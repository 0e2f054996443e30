//! Sound chip emulations
//!
//! Each chip owns its registers, oscillators, step synthesizers and a buffer
//! bank, and implements [`SoundChip`]. [`ChipKind`] names the closed set of
//! supported chips and builds them.

pub mod ay8910;
pub mod fme7;
pub mod gameboy;
pub mod huc6280;
pub mod namco163;
pub mod nes_apu;
pub mod pokey;
pub mod scc;
pub mod sn76489;
pub mod vrc6;

use crate::backend::SoundChip;
use crate::{BlipError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

pub use ay8910::Ay8910;
pub use fme7::Fme7;
pub use gameboy::GameBoyApu;
pub use huc6280::Huc6280;
pub use namco163::Namco163;
pub use nes_apu::NesApu;
pub use pokey::Pokey;
pub use scc::Scc;
pub use sn76489::Sn76489;
pub use vrc6::Vrc6;

/// Supported chips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipKind {
    /// Ricoh 2A03 APU
    NesApu,
    /// Konami VRC6 expansion
    Vrc6,
    /// Sunsoft 5B / FME-7 expansion
    Fme7,
    /// Namco 163 wavetable expansion
    Namco163,
    /// Konami SCC
    Scc,
    /// Game Boy APU
    GameBoy,
    /// Atari POKEY
    Pokey,
    /// TI SN76489
    Sn76489,
    /// General Instrument AY-3-8910
    Ay8910,
    /// Hudson HuC6280 PSG
    Huc6280,
}

impl ChipKind {
    /// Every supported chip.
    pub const ALL: [ChipKind; 10] = [
        ChipKind::NesApu,
        ChipKind::Vrc6,
        ChipKind::Fme7,
        ChipKind::Namco163,
        ChipKind::Scc,
        ChipKind::GameBoy,
        ChipKind::Pokey,
        ChipKind::Sn76489,
        ChipKind::Ay8910,
        ChipKind::Huc6280,
    ];

    /// Construct the chip at its power-up state.
    pub fn build(self) -> Result<Box<dyn SoundChip>> {
        let chip: Box<dyn SoundChip> = match self {
            ChipKind::NesApu => Box::new(NesApu::new()?),
            ChipKind::Vrc6 => Box::new(Vrc6::new()?),
            ChipKind::Fme7 => Box::new(Fme7::new()?),
            ChipKind::Namco163 => Box::new(Namco163::new()?),
            ChipKind::Scc => Box::new(Scc::new()?),
            ChipKind::GameBoy => Box::new(GameBoyApu::new()?),
            ChipKind::Pokey => Box::new(Pokey::new()?),
            ChipKind::Sn76489 => Box::new(Sn76489::new()?),
            ChipKind::Ay8910 => Box::new(Ay8910::new()?),
            ChipKind::Huc6280 => Box::new(Huc6280::new()?),
        };
        Ok(chip)
    }

    /// Identifier used in configuration and logs.
    pub fn name(self) -> &'static str {
        match self {
            ChipKind::NesApu => nes_apu::NAME,
            ChipKind::Vrc6 => vrc6::NAME,
            ChipKind::Fme7 => fme7::NAME,
            ChipKind::Namco163 => namco163::NAME,
            ChipKind::Scc => scc::NAME,
            ChipKind::GameBoy => gameboy::NAME,
            ChipKind::Pokey => pokey::NAME,
            ChipKind::Sn76489 => sn76489::NAME,
            ChipKind::Ay8910 => ay8910::NAME,
            ChipKind::Huc6280 => huc6280::NAME,
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipKind {
    type Err = BlipError;

    fn from_str(s: &str) -> Result<Self> {
        ChipKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| BlipError::ConfigError(format!("unknown chip '{s}'")))
    }
}

/// Fail with `AddressOutOfRange` unless `addr` lies in `window`.
#[inline]
pub(crate) fn check_window(
    addr: u16,
    window: RangeInclusive<u16>,
    chip: &'static str,
) -> Result<()> {
    if window.contains(&addr) {
        Ok(())
    } else {
        Err(BlipError::AddressOutOfRange { addr, chip })
    }
}

/// Fail with `ChannelOutOfRange` unless `osc < count`.
#[inline]
pub(crate) fn check_osc(osc: usize, count: usize) -> Result<()> {
    if osc < count {
        Ok(())
    } else {
        Err(BlipError::ChannelOutOfRange { index: osc, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for kind in ChipKind::ALL {
            assert_eq!(kind.name().parse::<ChipKind>().unwrap(), kind);
            let chip = kind.build().unwrap();
            assert_eq!(chip.name(), kind.name());
            assert!(chip.oscillator_count() > 0);
        }
        assert!("sid".parse::<ChipKind>().is_err());
    }

    #[test]
    fn test_every_chip_rejects_bad_routing() {
        for kind in ChipKind::ALL {
            let mut chip = kind.build().unwrap();
            let count = chip.oscillator_count();
            assert!(chip.set_output(count, Some(0)).is_err(), "{kind}");
            assert!(chip.set_output(0, Some(count + 5)).is_err(), "{kind}");
            assert!(chip.set_output(0, None).is_ok(), "{kind}");
        }
    }

    #[test]
    fn test_every_chip_rejects_time_regression() {
        for kind in ChipKind::ALL {
            let mut chip = kind.build().unwrap();
            chip.run_until(500).unwrap();
            assert!(
                matches!(chip.run_until(499), Err(BlipError::TimeRegression { .. })),
                "{kind}"
            );
            chip.run_until(500).unwrap();
            chip.end_frame(600).unwrap();
            assert_eq!(chip.last_time(), 0, "{kind}");
        }
    }
}
