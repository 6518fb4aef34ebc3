//! Automatic gain control.
//!
//! Normalizes block RMS toward a target level. The gain follows the desired
//! value with a one-pole smoother: a fast attack when the gain has to come
//! down, a slow release when it may go up. Silent blocks leave the gain alone
//! so pauses do not pump the noise floor up.

use crate::audio::level::rms;
use crate::defaults;
use crate::error::{ClearstreamError, Result};
use serde::{Deserialize, Serialize};

/// Blocks quieter than this are treated as silence.
const SILENCE_RMS: f32 = 1e-6;

/// AGC parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgcConfig {
    /// Target RMS level, normalized amplitude in [0, 1].
    pub target_level: f32,
    /// Gain ceiling in [1, 10].
    pub max_gain: f32,
    /// Attack time constant in seconds, [0, 2].
    pub attack_time: f32,
    /// Release time constant in seconds, [0, 5].
    pub release_time: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            target_level: defaults::AGC_TARGET_LEVEL,
            max_gain: defaults::AGC_MAX_GAIN,
            attack_time: defaults::AGC_ATTACK_SECS,
            release_time: defaults::AGC_RELEASE_SECS,
        }
    }
}

impl AgcConfig {
    /// Check every parameter against its allowed range.
    ///
    /// # Errors
    /// `InvalidParameter` naming the first parameter out of range.
    pub fn validate(&self) -> Result<()> {
        check_range("target_level", self.target_level, 0.0, 1.0)?;
        check_range("max_gain", self.max_gain, 1.0, 10.0)?;
        check_range("attack_time", self.attack_time, 0.0, 2.0)?;
        check_range("release_time", self.release_time, 0.0, 5.0)?;
        Ok(())
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(ClearstreamError::InvalidParameter {
            name: name.to_string(),
            message: format!("must be within [{min}, {max}], got {value}"),
        });
    }
    Ok(())
}

/// Stateful gain controller for one stream.
#[derive(Debug, Clone)]
pub struct AutomaticGainController {
    config: AgcConfig,
    sample_rate: u32,
    gain: f32,
}

impl AutomaticGainController {
    /// # Errors
    /// `InvalidParameter` for an out-of-range config, `InvalidSampleRate` for
    /// a zero sample rate.
    pub fn new(config: AgcConfig, sample_rate: u32) -> Result<Self> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(ClearstreamError::InvalidSampleRate { rate: sample_rate });
        }
        Ok(Self {
            config,
            sample_rate,
            gain: 1.0,
        })
    }

    pub fn config(&self) -> &AgcConfig {
        &self.config
    }

    pub fn current_gain(&self) -> f32 {
        self.gain
    }

    /// Back to unity gain.
    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    /// Process a block and return the scaled copy.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let mut output = input.to_vec();
        self.process_in_place(&mut output);
        output
    }

    /// Process a block in place.
    pub fn process_in_place(&mut self, block: &mut [f32]) {
        if block.is_empty() {
            return;
        }

        let level = rms(block);
        if level > SILENCE_RMS {
            self.update_gain(level, block.len());
        }

        let gain = self.gain;
        for sample in block.iter_mut() {
            *sample *= gain;
        }
    }

    fn update_gain(&mut self, level: f32, block_len: usize) {
        let desired = (self.config.target_level / level).clamp(0.0, self.config.max_gain);
        let tau = if desired < self.gain {
            self.config.attack_time
        } else {
            self.config.release_time
        };
        let coefficient = if tau <= 0.0 {
            1.0
        } else {
            let block_secs = block_len as f32 / self.sample_rate as f32;
            1.0 - (-block_secs / tau).exp()
        };
        self.gain += (desired - self.gain) * coefficient;
        self.gain = self.gain.clamp(0.0, self.config.max_gain);
    }
}
