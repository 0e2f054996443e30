//! Synthesis configuration
//!
//! Output settings shared by every chip: sample rate, drift-removal cutoff,
//! treble curve, master volume and frame capacity. Loadable from JSON.

use crate::blip::buffer::{DEFAULT_BASS_FREQ, DEFAULT_SAMPLE_RATE};
use crate::blip::Equalizer;
use crate::{BlipError, Result};
use serde::{Deserialize, Serialize};

/// Highest accepted output sample rate in Hz.
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Output settings applied by [`SoundChip::configure`](crate::SoundChip::configure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Drift-removal cutoff in Hz (0 disables)
    pub bass_freq: u32,
    /// Treble curve; its `sample_rate` is replaced by the one above
    pub treble: Equalizer,
    /// Volume applied to every synthesizer
    pub volume: f32,
    /// Longest frame the host renders between reads, in output samples
    pub frame_capacity: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bass_freq: DEFAULT_BASS_FREQ,
            treble: Equalizer::default(),
            volume: 1.0,
            frame_capacity: 1,
        }
    }
}

impl SynthConfig {
    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BlipError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BlipError::ConfigError(e.to_string()))
    }

    /// Reject values no chip can work with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(BlipError::ConfigError(format!(
                "sample_rate {} outside 1..={MAX_SAMPLE_RATE}",
                self.sample_rate
            )));
        }
        if self.bass_freq > self.sample_rate / 2 {
            return Err(BlipError::ConfigError(format!(
                "bass_freq {} above Nyquist",
                self.bass_freq
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(BlipError::ConfigError(format!(
                "volume {} must be finite and non-negative",
                self.volume
            )));
        }
        if !self.treble.treble.is_finite() {
            return Err(BlipError::ConfigError("treble must be finite".to_string()));
        }
        if self.frame_capacity == 0 {
            return Err(BlipError::ConfigError("frame_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SynthConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = SynthConfig::from_json(r#"{ "sample_rate": 48000, "volume": 0.5 }"#).unwrap();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.volume, 0.5);
        assert_eq!(config.bass_freq, DEFAULT_BASS_FREQ);
        assert_eq!(config.frame_capacity, 1);
    }

    #[test]
    fn test_json_round_trip() {
        let config = SynthConfig {
            sample_rate: 32_000,
            frame_capacity: 800,
            ..SynthConfig::default()
        };
        let parsed = SynthConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_nonsense() {
        assert!(matches!(
            SynthConfig::from_json(r#"{ "sample_rate": 0 }"#),
            Err(BlipError::ConfigError(_))
        ));
        assert!(matches!(
            SynthConfig::from_json(r#"{ "volume": -1.0 }"#),
            Err(BlipError::ConfigError(_))
        ));
        assert!(matches!(
            SynthConfig::from_json("not json"),
            Err(BlipError::ConfigError(_))
        ));
    }
}
