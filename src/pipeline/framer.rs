//! Re-blocks capture output into fixed-size frames.

use crate::audio::resample::i16_to_f32;
use crate::pipeline::types::AudioFrame;
use std::time::Instant;

/// Spare frame buffers kept for reuse.
const POOL_LIMIT: usize = 8;

/// Turns variable-size PCM blocks into [`AudioFrame`]s of exactly
/// `frame_size` samples with consecutive sequence numbers.
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
    next_sequence: u64,
    pool: Vec<Vec<f32>>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size),
            next_sequence: 0,
            pool: Vec::new(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples waiting for a frame to fill up.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append a block and return every frame it completes.
    pub fn push(&mut self, block: &[i16], timestamp: Instant) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = block;
        while !rest.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(rest.len());
            self.pending.extend(rest[..take].iter().map(|&s| i16_to_f32(s)));
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                frames.push(self.emit(timestamp));
            }
        }
        frames
    }

    /// Emit the partial frame at end of stream, zero-padded to `frame_size`.
    ///
    /// Returns the frame and the number of real samples in it.
    pub fn flush(&mut self, timestamp: Instant) -> Option<(AudioFrame, usize)> {
        if self.pending.is_empty() {
            return None;
        }
        let valid = self.pending.len();
        self.pending.resize(self.frame_size, 0.0);
        Some((self.emit(timestamp), valid))
    }

    /// Hand a finished frame's buffer back for reuse.
    pub fn recycle(&mut self, frame: AudioFrame) {
        if self.pool.len() < POOL_LIMIT {
            let mut samples = frame.samples;
            samples.clear();
            self.pool.push(samples);
        }
    }

    fn emit(&mut self, timestamp: Instant) -> AudioFrame {
        let spare = self
            .pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.frame_size));
        let samples = std::mem::replace(&mut self.pending, spare);
        let frame = AudioFrame::new(samples, timestamp, self.next_sequence);
        self.next_sequence += 1;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_blocks() {
        let mut framer = FrameAssembler::new(4);
        let frames = framer.push(&[0, 16384, -16384, 0, 1, 2, 3, 4], Instant::now());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.0, 0.5, -0.5, 0.0]);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_partial_blocks_accumulate() {
        let mut framer = FrameAssembler::new(480);
        let now = Instant::now();
        assert!(framer.push(&[0; 300], now).is_empty());
        assert_eq!(framer.pending_len(), 300);

        let frames = framer.push(&[0; 700], now);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 480));
        assert_eq!(framer.pending_len(), 40);
        assert_eq!(framer.next_sequence(), 2);
    }

    #[test]
    fn test_flush_pads_partial_frame() {
        let mut framer = FrameAssembler::new(4);
        framer.push(&[16384, 16384], Instant::now());
        let (frame, valid) = framer.flush(Instant::now()).unwrap();
        assert_eq!(valid, 2);
        assert_eq!(frame.samples, vec![0.5, 0.5, 0.0, 0.0]);
        assert!(framer.flush(Instant::now()).is_none());
    }

    #[test]
    fn test_recycled_buffers_are_reused() {
        let mut framer = FrameAssembler::new(4);
        let mut frames = framer.push(&[1; 4], Instant::now());
        let frame = frames.pop().unwrap();
        framer.recycle(frame);
        assert_eq!(framer.pool.len(), 1);

        let frames = framer.push(&[1; 4], Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4);
        assert!(framer.pool.is_empty());
    }

    #[test]
    fn test_zero_frame_size_is_clamped() {
        let framer = FrameAssembler::new(0);
        assert_eq!(framer.frame_size(), 1);
    }
}
