//! Video sampling and aggregation.
//!
//! A video is classified by sampling evenly spaced frames, running each one
//! through the normal detection path and rolling the per-frame verdicts into
//! a summary.

use std::future::Future;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decision::unsafe_score;
use crate::error::{DetectError, FrameError};
use crate::types::{DetectionResult, Verdict};

/// Frames sampled when the caller does not say otherwise.
pub const DEFAULT_FRAME_COUNT: usize = 10;

/// Share of nsfw frames above which the whole video is nsfw.
pub const NSFW_FRAME_RATIO: f64 = 0.3;

/// Share of face frames above which the whole video is face.
pub const FACE_FRAME_RATIO: f64 = 0.2;

/// Source of decoded video frames.
///
/// Calls may block; the detector runs them on the blocking pool.
pub trait FrameSource: Send + Sync {
    /// Length of the video in seconds.
    fn duration_seconds(&self) -> Result<f64, FrameError>;

    /// Decodes the frame shown at `timestamp` seconds.
    fn frame_at(&self, timestamp: f64) -> Result<RgbaImage, FrameError>;
}

/// Verdict for one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrameResult {
    pub frame_number: usize,
    pub timestamp_seconds: f64,
    pub result: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsfw_scores: Option<Vec<f32>>,
    pub face_count: usize,
}

impl VideoFrameResult {
    /// Builds a frame record from a detection result.
    pub fn from_detection(frame_number: usize, timestamp_seconds: f64, result: DetectionResult) -> Self {
        Self {
            frame_number,
            timestamp_seconds,
            result: result.result,
            face_count: result.details.face_count.unwrap_or(0),
            nsfw_scores: result.details.nsfw_scores,
        }
    }
}

/// Aggregate over the sampled frames.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoSummary {
    /// Frames sampled, including those that failed to classify.
    pub total_frames: usize,
    pub nsfw_frame_count: usize,
    pub face_frame_count: usize,
    pub max_nsfw_score: f32,
    pub average_nsfw_score: f32,
}

/// Frames, summary and overall verdict of one video.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoReport {
    pub frames: Vec<VideoFrameResult>,
    pub summary: VideoSummary,
    pub verdict: Verdict,
}

/// Evenly spaced timestamps `i * duration / frame_count`.
///
/// A negative or non-finite duration samples the first frame only.
pub fn sample_timestamps(duration: f64, frame_count: usize) -> Vec<f64> {
    let duration = if duration.is_finite() && duration > 0.0 {
        duration
    } else {
        0.0
    };
    (0..frame_count)
        .map(|i| i as f64 * duration / frame_count as f64)
        .collect()
}

/// Classifies `frame_count` sampled frames with `per_frame` and aggregates.
///
/// Frames run one after another. A frame whose classification fails, or
/// comes back with an `error` verdict, is left out of the report.
pub async fn summarize<F, Fut>(duration: f64, frame_count: usize, mut per_frame: F) -> VideoReport
where
    F: FnMut(usize, f64) -> Fut,
    Fut: Future<Output = Result<DetectionResult, DetectError>>,
{
    let timestamps = sample_timestamps(duration, frame_count);
    let sampled = timestamps.len();
    let mut frames = Vec::with_capacity(sampled);

    for (frame_number, timestamp) in timestamps.into_iter().enumerate() {
        match per_frame(frame_number, timestamp).await {
            Ok(result) if result.is_error() => {
                warn!(
                    frame_number,
                    "Frame at {:.2}s failed to classify: {}",
                    timestamp,
                    result.details.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(result) => frames.push(VideoFrameResult::from_detection(
                frame_number,
                timestamp,
                result,
            )),
            Err(e) => warn!(frame_number, "Skipping frame at {:.2}s: {}", timestamp, e),
        }
    }

    debug!(sampled, classified = frames.len(), "Video sampling finished");
    aggregate(frames, sampled)
}

/// Rolls per-frame results into a report.
///
/// `sampled` counts every sampled frame, failed ones included, and is the
/// denominator of both verdict ratios.
pub fn aggregate(frames: Vec<VideoFrameResult>, sampled: usize) -> VideoReport {
    let total = sampled.max(frames.len());
    let nsfw = frames.iter().filter(|f| f.result == Verdict::Nsfw).count();
    let face = frames.iter().filter(|f| f.result == Verdict::Face).count();

    let scores: Vec<f32> = frames
        .iter()
        .filter_map(|f| f.nsfw_scores.as_deref().and_then(unsafe_score))
        .collect();
    let max_nsfw_score = scores.iter().copied().fold(0.0, f32::max);
    let average_nsfw_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };

    let verdict = if total == 0 {
        Verdict::Clear
    } else if nsfw as f64 / total as f64 > NSFW_FRAME_RATIO {
        Verdict::Nsfw
    } else if face as f64 / total as f64 > FACE_FRAME_RATIO {
        Verdict::Face
    } else {
        Verdict::Clear
    };

    VideoReport {
        frames,
        summary: VideoSummary {
            total_frames: total,
            nsfw_frame_count: nsfw,
            face_frame_count: face,
            max_nsfw_score,
            average_nsfw_score,
        },
        verdict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: usize, result: Verdict, score: Option<f32>) -> VideoFrameResult {
        VideoFrameResult {
            frame_number: number,
            timestamp_seconds: number as f64,
            result,
            nsfw_scores: score.map(|s| vec![1.0 - s, s]),
            face_count: usize::from(result == Verdict::Face),
        }
    }

    fn frames(nsfw: usize, face: usize, total: usize) -> Vec<VideoFrameResult> {
        (0..total)
            .map(|i| {
                let verdict = if i < nsfw {
                    Verdict::Nsfw
                } else if i < nsfw + face {
                    Verdict::Face
                } else {
                    Verdict::Clear
                };
                frame(i, verdict, None)
            })
            .collect()
    }

    #[test]
    fn four_of_ten_nsfw_frames_is_nsfw() {
        let report = aggregate(frames(4, 0, 10), 10);
        assert_eq!(report.verdict, Verdict::Nsfw);
        assert_eq!(report.summary.nsfw_frame_count, 4);
    }

    #[test]
    fn face_threshold_applies_after_nsfw() {
        let report = aggregate(frames(2, 3, 10), 10);
        assert_eq!(report.verdict, Verdict::Face);
        assert_eq!(report.summary.face_frame_count, 3);

        let report = aggregate(frames(3, 2, 10), 10);
        assert_eq!(report.verdict, Verdict::Clear);
    }

    #[test]
    fn empty_report_is_clear() {
        let report = aggregate(Vec::new(), 0);
        assert_eq!(report.verdict, Verdict::Clear);
        assert_eq!(report.summary, VideoSummary::default());
    }

    #[test]
    fn score_statistics_use_scored_frames_only() {
        let report = aggregate(vec![
            frame(0, Verdict::Nsfw, Some(0.8)),
            frame(1, Verdict::Clear, Some(0.2)),
            frame(2, Verdict::Face, None),
        ], 3);
        assert!((report.summary.max_nsfw_score - 0.8).abs() < 1e-6);
        assert!((report.summary.average_nsfw_score - 0.5).abs() < 1e-6);
        assert_eq!(report.summary.total_frames, 3);
    }

    #[test]
    fn timestamps_are_evenly_spaced() {
        assert_eq!(sample_timestamps(10.0, 5), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
        assert_eq!(sample_timestamps(f64::NAN, 2), vec![0.0, 0.0]);
        assert!(sample_timestamps(10.0, 0).is_empty());
    }

    #[tokio::test]
    async fn failed_frames_are_omitted() {
        let report = summarize(4.0, 4, |n, _t| async move {
            match n {
                0 => Err(DetectError::QueueClosed),
                1 => Ok(DetectionResult::error("decode failed")),
                _ => Ok(DetectionResult {
                    result: Verdict::Nsfw,
                    ..Default::default()
                }),
            }
        })
        .await;

        assert_eq!(report.summary.total_frames, 4);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.frames[0].frame_number, 2);
        assert_eq!(report.frames[1].timestamp_seconds, 3.0);
        assert_eq!(report.verdict, Verdict::Nsfw);
    }

    #[tokio::test]
    async fn ratios_count_failed_frames_as_sampled() {
        let report = summarize(10.0, 10, |n, _t| async move {
            match n {
                0..=3 => Err(DetectError::QueueClosed),
                4 | 5 => Ok(DetectionResult {
                    result: Verdict::Nsfw,
                    ..Default::default()
                }),
                _ => Ok(DetectionResult::default()),
            }
        })
        .await;

        // 2 of 10 sampled frames is not above 30 %
        assert_eq!(report.frames.len(), 6);
        assert_eq!(report.summary.total_frames, 10);
        assert_eq!(report.summary.nsfw_frame_count, 2);
        assert_eq!(report.verdict, Verdict::Clear);
    }

    #[test]
    fn all_frames_failing_is_clear() {
        let report = aggregate(Vec::new(), 10);
        assert_eq!(report.verdict, Verdict::Clear);
        assert_eq!(report.summary.total_frames, 10);
    }
}
