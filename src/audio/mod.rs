//! Audio sources and the per-frame signal stages.

pub mod agc;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod level;
pub mod resample;
pub mod segment;
pub mod source;
pub mod vad;
pub mod wav;

pub use agc::{AgcConfig, AutomaticGainController};
pub use resample::{Resampled, StreamResampler, resample};
pub use segment::{SegmentConfig, SegmentDetector};
pub use source::{AudioSource, MockAudioSource};
pub use vad::EnergyVad;
pub use wav::WavAudioSource;
