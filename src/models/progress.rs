//! Progress events published while a job runs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

/// Pipeline stage a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Synthetic greeting sent to a new subscriber; never published.
    Connected,
    Uploaded,
    Reading,
    Scanning,
    Downloading,
    Downloaded,
    Embedding,
    Saving,
    Complete,
    Error,
}

impl Stage {
    /// Whether no further events may follow this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connected => "connected",
            Stage::Uploaded => "uploaded",
            Stage::Reading => "reading",
            Stage::Scanning => "scanning",
            Stage::Downloading => "downloading",
            Stage::Downloaded => "downloaded",
            Stage::Embedding => "embedding",
            Stage::Saving => "saving",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }
}

/// A snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Job identifier.
    pub id: String,
    pub stage: Stage,
    pub message: String,
    pub percentage: u8,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(id: &str, stage: Stage, message: impl Into<String>, percentage: u8) -> Self {
        Self {
            id: id.to_string(),
            stage,
            message: message.into(),
            percentage: percentage.min(100),
            timestamp: Utc::now(),
        }
    }

    /// The greeting every subscriber receives first.
    pub fn connected(id: &str) -> Self {
        Self::new(id, Stage::Connected, "connection established", 0)
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Percentage sub-range reserved for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBand {
    pub start: u8,
    pub span: u8,
}

/// Downloading occupies 20-70%.
pub const DOWNLOAD_BAND: ProgressBand = ProgressBand { start: 20, span: 50 };

/// Embedding occupies 75-90%.
pub const EMBED_BAND: ProgressBand = ProgressBand { start: 75, span: 15 };

impl ProgressBand {
    /// Linear position of `done` out of `total` within the band, rounded down.
    pub fn at(&self, done: usize, total: usize) -> u8 {
        if total == 0 {
            return self.start;
        }
        let done = done.min(total);
        let offset = done * self.span as usize / total;
        self.start + offset as u8
    }
}
