use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Emotion classes of the underlying classifier (FER-2013 label set).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmotionLabel {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

/// Confidence distribution over emotion labels for one frame or window.
/// Scores lie in [0,1]; a softmax-style classifier sums to ~1.
pub type EmotionScores = BTreeMap<EmotionLabel, f64>;

/// One analyzed frame: an offset into the video plus its emotion scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionRecord {
    /// Seconds from the start of the video.
    pub timestamp: f64,
    pub scores: EmotionScores,
}

impl EmotionRecord {
    /// The highest-confidence label, if any scores are present.
    pub fn dominant(&self) -> Option<(EmotionLabel, f64)> {
        self.scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(label, score)| (*label, *score))
    }

    pub fn scores_in_range(&self) -> bool {
        self.scores.values().all(|s| (0.0..=1.0).contains(s))
    }
}

/// Ordered per-frame emotion records for a whole video, persisted as the
/// job's result asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionTimeline {
    /// Source video duration in seconds.
    pub duration: f64,
    /// Sampling rate the records were produced at.
    pub sample_fps: f64,
    pub records: Vec<EmotionRecord>,
}

impl EmotionTimeline {
    /// Timestamps must be non-decreasing and every score within [0,1].
    pub fn is_well_formed(&self) -> bool {
        let ordered = self
            .records
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp);
        ordered && self.records.iter().all(EmotionRecord::scores_in_range)
    }

    /// Collapse consecutive records sharing a dominant emotion into
    /// `(start, end, label, peak_score)` spans. Used for annotation rendering.
    pub fn dominant_spans(&self) -> Vec<(f64, f64, EmotionLabel, f64)> {
        let frame_len = if self.sample_fps > 0.0 {
            1.0 / self.sample_fps
        } else {
            0.0
        };

        let mut spans: Vec<(f64, f64, EmotionLabel, f64)> = Vec::new();
        for record in &self.records {
            let Some((label, score)) = record.dominant() else {
                continue;
            };
            match spans.last_mut() {
                Some(span) if span.2 == label => {
                    span.1 = record.timestamp + frame_len;
                    span.3 = span.3.max(score);
                }
                _ => spans.push((record.timestamp, record.timestamp + frame_len, label, score)),
            }
        }
        spans
    }
}
