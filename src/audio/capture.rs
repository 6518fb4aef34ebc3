//! Live microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::resample::{downmix_to_mono, f32_to_i16};
use crate::audio::source::AudioSource;
use crate::error::{ClearstreamError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse"];

/// Device name patterns to filter out (not useful for voice input).
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "digital output",
    "hdmi",
    "s/pdif",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES.iter().any(|pref| lower.contains(pref))
}

/// List usable input devices, marking preferred ones with "\[recommended\]".
///
/// # Errors
/// `Device` if enumeration fails.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|e| ClearstreamError::Device {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut names = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        if should_filter_device(&name) {
            continue;
        }
        if is_preferred_device(&name) {
            names.push(format!("{} [recommended]", name));
        } else {
            names.push(name);
        }
    }
    Ok(names)
}

fn find_device(device_name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(name) = device_name {
        let devices = host.input_devices().map_err(|e| ClearstreamError::Device {
            message: format!("Failed to enumerate devices: {}", e),
        })?;
        for device in devices {
            if device.name().is_ok_and(|n| n == name) {
                return Ok(device);
            }
        }
        return Err(ClearstreamError::AudioDeviceNotFound {
            device: name.to_string(),
        });
    }

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if device.name().is_ok_and(|n| is_preferred_device(&n)) {
                return Ok(device);
            }
        }
    }
    host.default_input_device()
        .ok_or_else(|| ClearstreamError::AudioDeviceNotFound {
            device: "default".to_string(),
        })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only created, paused and dropped by the thread that
/// holds the source, behind the source's `&mut self`.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Captures the device's native format, downmixed to mono 16-bit PCM.
///
/// The native rate is kept; the pipeline resamples. A stream error from the
/// backend (device unplugged) makes every later read fail.
pub struct CpalAudioSource {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<i16>>>,
    failed: Arc<AtomicBool>,
}

impl CpalAudioSource {
    /// Open `device_name`, or the preferred default input device.
    ///
    /// # Errors
    /// `AudioDeviceNotFound` for an unknown name, `Device` when the device
    /// has no usable input configuration.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_device(device_name)?;
        let config = device
            .default_input_config()
            .map_err(|e| ClearstreamError::Device {
                message: format!("Failed to query default input config: {}", e),
            })?;

        log::info!(
            "capture: {} ({}ch/{}Hz/{:?})",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.channels(),
            config.sample_rate().0,
            config.sample_format()
        );

        Ok(Self {
            device,
            config,
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let channels = self.config.channels();
        let stream_config: cpal::StreamConfig = self.config.clone().into();

        let failed = Arc::clone(&self.failed);
        let err_callback = move |err: cpal::StreamError| {
            log::error!("capture: stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
        };

        let buffer = Arc::clone(&self.buffer);
        let stream = match self.config.sample_format() {
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let mono = downmix_to_mono(data, channels);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&mono);
                    }
                },
                err_callback,
                None,
            ),
            SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let pcm: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                    let mono = downmix_to_mono(&pcm, channels);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&mono);
                    }
                },
                err_callback,
                None,
            ),
            format => {
                return Err(ClearstreamError::AudioFormatMismatch {
                    expected: "i16 or f32".to_string(),
                    actual: format!("{format:?}"),
                });
            }
        };

        stream.map_err(|e| ClearstreamError::Device {
            message: format!("Failed to build input stream: {}", e),
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.failed.store(false, Ordering::SeqCst);

        let stream = self.build_stream()?;
        stream.play().map_err(|e| ClearstreamError::Device {
            message: format!("Failed to start audio stream: {}", e),
        })?;
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| ClearstreamError::Device {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(ClearstreamError::Device {
                message: "input stream failed".to_string(),
            });
        }
        let mut buffer = self.buffer.lock().map_err(|e| ClearstreamError::Device {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("PulseAudio"));
        assert!(!is_preferred_device("hw:0,0"));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_default_device_opens_and_reports_rate() {
        let source = CpalAudioSource::new(None).unwrap();
        assert!(source.sample_rate() > 0);
        assert!(!source.is_finite());
    }
}
