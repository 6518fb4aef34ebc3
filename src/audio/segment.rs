//! Voice segment detection over a stream of activity scores.
//!
//! A segment opens on the first score above the threshold, stays open through
//! short dips for `hangover_time`, and closes once the hangover runs out.
//! Segments shorter than `min_segment_duration` are discarded, and segments
//! separated by at most `merge_gap` are merged afterwards.

use crate::defaults;
use crate::pipeline::types::{VoiceActivityPoint, VoiceSegment};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentConfig {
    /// Scores strictly above this count as voice.
    pub threshold: f32,
    /// Seconds a segment is held open after the score drops.
    pub hangover_time: f64,
    /// Seconds between consecutive points.
    pub frame_time: f64,
    /// Shortest segment kept, in seconds.
    pub min_segment_duration: f64,
    /// Largest gap between segments that still merges them, in seconds.
    pub merge_gap: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            hangover_time: defaults::VAD_HANGOVER_SECS,
            frame_time: defaults::FRAME_SIZE as f64 / f64::from(defaults::SAMPLE_RATE),
            min_segment_duration: defaults::VAD_MIN_SEGMENT_SECS,
            merge_gap: defaults::VAD_MERGE_GAP_SECS,
        }
    }
}

impl SegmentConfig {
    /// Number of below-threshold points a segment survives.
    pub fn hangover_frames(&self) -> u32 {
        if self.frame_time <= 0.0 || self.hangover_time <= 0.0 {
            return 0;
        }
        (self.hangover_time / self.frame_time).ceil() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    InSegment,
    Hangover,
}

/// Incremental segment detector.
#[derive(Debug, Clone)]
pub struct SegmentDetector {
    config: SegmentConfig,
    hangover_frames: u32,
    state: DetectorState,
    start: f64,
    end: f64,
    remaining: u32,
    score_sum: f64,
    score_count: u32,
}

impl SegmentDetector {
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            config,
            hangover_frames: config.hangover_frames(),
            state: DetectorState::Idle,
            start: 0.0,
            end: 0.0,
            remaining: 0,
            score_sum: 0.0,
            score_count: 0,
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// True while a segment is open (including hangover).
    pub fn in_segment(&self) -> bool {
        self.state != DetectorState::Idle
    }

    /// Feed one point; returns a segment when one closes and is long enough.
    pub fn push(&mut self, point: VoiceActivityPoint) -> Option<VoiceSegment> {
        let voiced = point.score > self.config.threshold;
        match self.state {
            DetectorState::Idle => {
                if voiced {
                    self.state = DetectorState::InSegment;
                    self.start = point.time;
                    self.end = point.time;
                    self.remaining = self.hangover_frames;
                    self.score_sum = f64::from(point.score);
                    self.score_count = 1;
                }
                None
            }
            DetectorState::InSegment | DetectorState::Hangover => {
                if voiced {
                    self.state = DetectorState::InSegment;
                    self.end = point.time;
                    self.remaining = self.hangover_frames;
                    self.score_sum += f64::from(point.score);
                    self.score_count += 1;
                    None
                } else if self.remaining > 0 {
                    self.state = DetectorState::Hangover;
                    self.end = point.time;
                    self.remaining -= 1;
                    None
                } else {
                    self.close()
                }
            }
        }
    }

    /// Close any open segment at end of input.
    pub fn finish(&mut self) -> Option<VoiceSegment> {
        if self.state == DetectorState::Idle {
            return None;
        }
        self.close()
    }

    fn close(&mut self) -> Option<VoiceSegment> {
        self.state = DetectorState::Idle;
        let duration = self.end - self.start;
        if duration < self.config.min_segment_duration || self.score_count == 0 {
            return None;
        }
        Some(VoiceSegment {
            start_time: self.start,
            end_time: self.end,
            confidence: (self.score_sum / f64::from(self.score_count)) as f32,
        })
    }

    /// Run a whole timeline: detect, then merge close neighbours.
    pub fn detect(&mut self, points: &[VoiceActivityPoint]) -> Vec<VoiceSegment> {
        let mut segments: Vec<VoiceSegment> = points.iter().filter_map(|&p| self.push(p)).collect();
        segments.extend(self.finish());
        merge_segments(segments, self.config.merge_gap)
    }
}

/// Sort by start time and merge segments whose gap is at most `merge_gap`.
///
/// Merged segments take the mean of both confidences. The result is
/// time-ordered and non-overlapping.
pub fn merge_segments(mut segments: Vec<VoiceSegment>, merge_gap: f64) -> Vec<VoiceSegment> {
    segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

    let mut merged: Vec<VoiceSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match merged.last_mut() {
            Some(last) if segment.start_time - last.end_time <= merge_gap => {
                last.end_time = last.end_time.max(segment.end_time);
                last.confidence = (last.confidence + segment.confidence) / 2.0;
            }
            _ => merged.push(segment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORES: [f32; 10] = [0.1, 0.7, 0.9, 0.8, 0.3, 0.1, 0.6, 0.85, 0.4, 0.05];

    fn points(scores: &[f32], frame_time: f64) -> Vec<VoiceActivityPoint> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| VoiceActivityPoint {
                time: i as f64 * frame_time,
                score,
            })
            .collect()
    }

    fn config(merge_gap: f64) -> SegmentConfig {
        SegmentConfig {
            threshold: 0.5,
            hangover_time: 0.3,
            frame_time: 1.0,
            min_segment_duration: 0.0,
            merge_gap,
        }
    }

    #[test]
    fn test_scores_split_into_two_segments() {
        let segments = SegmentDetector::new(config(1.0)).detect(&points(&SCORES, 1.0));

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start_time, 1.0);
        assert_eq!(segments[0].end_time, 4.0);
        assert_eq!(segments[1].start_time, 6.0);
        assert_eq!(segments[1].end_time, 8.0);
    }

    #[test]
    fn test_gap_within_merge_gap_merges() {
        let segments = SegmentDetector::new(config(2.0)).detect(&points(&SCORES, 1.0));

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_time, 1.0);
        assert_eq!(segments[0].end_time, 8.0);
    }

    #[test]
    fn test_confidence_is_mean_of_voiced_scores() {
        let segments = SegmentDetector::new(config(1.0)).detect(&points(&SCORES, 1.0));

        assert!((segments[0].confidence - 0.8).abs() < 1e-6);
        assert!((segments[1].confidence - 0.725).abs() < 1e-6);
    }

    #[test]
    fn test_merged_confidence_is_averaged() {
        let segments = SegmentDetector::new(config(5.0)).detect(&points(&SCORES, 1.0));
        assert!((segments[0].confidence - (0.8 + 0.725) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_min_duration_discards_short_segments() {
        let cfg = SegmentConfig {
            min_segment_duration: 2.5,
            ..config(0.0)
        };
        let segments = SegmentDetector::new(cfg).detect(&points(&SCORES, 1.0));
        // [1..4] lasts 3s and survives, [6..8] lasts 2s and does not.
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_time, 1.0);
    }

    #[test]
    fn test_open_segment_closed_at_end_of_input() {
        let segments = SegmentDetector::new(config(0.0)).detect(&points(&[0.1, 0.9, 0.9], 1.0));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start_time, 1.0);
        assert_eq!(segments[0].end_time, 2.0);
    }

    #[test]
    fn test_no_voice_no_segments() {
        let segments = SegmentDetector::new(config(0.0)).detect(&points(&[0.1, 0.2, 0.5], 1.0));
        assert!(segments.is_empty());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut detector = SegmentDetector::new(config(0.0));
        detector.push(VoiceActivityPoint { time: 0.0, score: 0.5 });
        assert!(!detector.in_segment());
    }

    #[test]
    fn test_push_reports_segment_on_close() {
        let mut detector = SegmentDetector::new(SegmentConfig {
            hangover_time: 0.0,
            ..config(0.0)
        });
        assert!(detector.push(VoiceActivityPoint { time: 0.0, score: 0.9 }).is_none());
        assert!(detector.push(VoiceActivityPoint { time: 1.0, score: 0.9 }).is_none());
        let closed = detector.push(VoiceActivityPoint { time: 2.0, score: 0.0 });
        assert_eq!(
            closed,
            Some(VoiceSegment {
                start_time: 0.0,
                end_time: 1.0,
                confidence: 0.9
            })
        );
        assert!(detector.finish().is_none());
    }

    #[test]
    fn test_hangover_frames_rounds_up() {
        assert_eq!(config(0.0).hangover_frames(), 1);
        let fine = SegmentConfig {
            frame_time: 0.01,
            ..config(0.0)
        };
        assert_eq!(fine.hangover_frames(), 30);
        let zero = SegmentConfig {
            frame_time: 0.0,
            ..config(0.0)
        };
        assert_eq!(zero.hangover_frames(), 0);
    }

    #[test]
    fn test_merge_orders_and_removes_overlap() {
        let merged = merge_segments(
            vec![
                VoiceSegment { start_time: 5.0, end_time: 6.0, confidence: 0.6 },
                VoiceSegment { start_time: 0.0, end_time: 2.0, confidence: 0.8 },
                VoiceSegment { start_time: 1.5, end_time: 3.0, confidence: 0.4 },
            ],
            0.0,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start_time, 0.0);
        assert_eq!(merged[0].end_time, 3.0);
        assert!((merged[0].confidence - 0.6).abs() < 1e-6);
        assert_eq!(merged[1].start_time, 5.0);
        for pair in merged.windows(2) {
            assert!(pair[0].end_time < pair[1].start_time);
        }
    }
}
