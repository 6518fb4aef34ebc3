//! Sample-rate conversion and sample format helpers.
//!
//! Linear interpolation over 16-bit PCM. [`resample`] converts a whole buffer
//! in one go; [`StreamResampler`] converts block by block on the hot path and
//! produces the same samples as a one-shot conversion of the concatenated
//! input once [`StreamResampler::flush`] is called.

use crate::error::{ClearstreamError, Result};

/// Result of a one-shot resample.
#[derive(Debug, Clone, PartialEq)]
pub struct Resampled {
    pub data: Vec<i16>,
    pub was_resampled: bool,
    pub output_rate: u32,
}

/// Resample `pcm` from `input_rate` to `target_rate`.
///
/// Output length is `floor(len * target_rate / input_rate)`. Equal rates return
/// the input samples unchanged with `was_resampled == false`.
///
/// # Errors
/// `InvalidSampleRate` for a zero rate, `EmptyInput` for an empty buffer.
pub fn resample(pcm: &[i16], input_rate: u32, target_rate: u32) -> Result<Resampled> {
    validate_rates(input_rate, target_rate)?;
    if pcm.is_empty() {
        return Err(ClearstreamError::EmptyInput);
    }

    if input_rate == target_rate {
        return Ok(Resampled {
            data: pcm.to_vec(),
            was_resampled: false,
            output_rate: input_rate,
        });
    }

    let output_len = (pcm.len() as u64 * u64::from(target_rate) / u64::from(input_rate)) as usize;
    let last = pcm.len() - 1;
    let data = (0..output_len as u64)
        .map(|k| {
            let (index, frac) = source_position(k, input_rate, target_rate);
            let index = (index as usize).min(last);
            let left = pcm[index];
            let right = pcm.get(index + 1).copied().unwrap_or(left);
            interpolate(left, right, frac)
        })
        .collect();

    Ok(Resampled {
        data,
        was_resampled: true,
        output_rate: target_rate,
    })
}

/// Block-by-block linear resampler.
///
/// Carries the read position and the previous block's last sample across
/// calls so block boundaries do not introduce discontinuities.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    input_rate: u32,
    target_rate: u32,
    consumed: u64,
    produced: u64,
    last: Option<i16>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, target_rate: u32) -> Result<Self> {
        validate_rates(input_rate, target_rate)?;
        Ok(Self {
            input_rate,
            target_rate,
            consumed: 0,
            produced: 0,
            last: None,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.input_rate == self.target_rate
    }

    /// Convert one block, appending the output samples to `out`.
    pub fn process(&mut self, block: &[i16], out: &mut Vec<i16>) {
        if block.is_empty() {
            return;
        }
        if self.is_passthrough() {
            out.extend_from_slice(block);
            self.consumed += block.len() as u64;
            self.produced += block.len() as u64;
            return;
        }

        let base = self.consumed;
        let end = base + block.len() as u64;
        loop {
            let (index, frac) = source_position(self.produced, self.input_rate, self.target_rate);
            // The right neighbour must be inside this block.
            if index + 1 >= end {
                break;
            }
            let left = if index < base {
                self.last.unwrap_or(block[0])
            } else {
                block[(index - base) as usize]
            };
            let right = block[(index + 1 - base) as usize];
            out.push(interpolate(left, right, frac));
            self.produced += 1;
        }

        self.last = block.last().copied();
        self.consumed = end;
    }

    /// Emit the trailing samples that need no right neighbour.
    ///
    /// Call once at end of stream. After flushing, the total output equals a
    /// one-shot [`resample`] of everything passed to [`process`](Self::process).
    pub fn flush(&mut self, out: &mut Vec<i16>) {
        let Some(last) = self.last else {
            return;
        };
        if self.is_passthrough() {
            return;
        }
        let total = self.consumed * u64::from(self.target_rate) / u64::from(self.input_rate);
        while self.produced < total {
            out.push(last);
            self.produced += 1;
        }
    }

    /// Forget stream position and history.
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.produced = 0;
        self.last = None;
    }
}

fn validate_rates(input_rate: u32, target_rate: u32) -> Result<()> {
    if input_rate == 0 {
        return Err(ClearstreamError::InvalidSampleRate { rate: input_rate });
    }
    if target_rate == 0 {
        return Err(ClearstreamError::InvalidSampleRate { rate: target_rate });
    }
    Ok(())
}

/// Integer source index and fractional offset of output sample `k`.
fn source_position(k: u64, input_rate: u32, target_rate: u32) -> (u64, f64) {
    let scaled = k * u64::from(input_rate);
    let target = u64::from(target_rate);
    (scaled / target, (scaled % target) as f64 / target as f64)
}

fn interpolate(left: i16, right: i16, frac: f64) -> i16 {
    let value = f64::from(left) + (f64::from(right) - f64::from(left)) * frac;
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Convert a normalized sample to 16-bit PCM, saturating out-of-range values.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Convert a 16-bit PCM sample to [-1.0, 1.0).
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Average interleaved channels down to mono.
///
/// `channels <= 1` returns the input unchanged; a trailing partial frame is
/// dropped.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => {
            let n = usize::from(n);
            samples
                .chunks_exact(n)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                    (sum / n as i32) as i16
                })
                .collect()
        }
    }
}
