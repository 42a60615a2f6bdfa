//! Clips and the observations made from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::parsing::{ParseError, StageOutput};

/// One discrete unit of sensor data. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    /// Camera or sensor the clip came from
    pub source_id: String,
    /// Position of the clip within its source stream
    pub index: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Opaque reference to the payload (path, object key, URL)
    pub payload_ref: String,
    /// Hints attached by the segmenter
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Clip {
    pub fn new(source_id: impl Into<String>, index: u64, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let source_id = source_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload_ref: format!("clips/{source_id}/{index:06}.mp4"),
            source_id,
            index,
            start,
            end,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Three-way label for signals a model cannot always decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Yes,
    No,
    Uncertain,
}

/// A named signal extracted by the Observer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Flag(bool),
    Scalar(f64),
    Label(TriState),
}

impl SignalValue {
    /// True only for a definite positive reading.
    pub fn is_positive(self) -> bool {
        match self {
            Self::Flag(b) => b,
            Self::Scalar(v) => v > 0.0,
            Self::Label(label) => label == TriState::Yes,
        }
    }

    pub const fn is_uncertain(self) -> bool {
        matches!(self, Self::Label(TriState::Uncertain))
    }
}

// ============================================================================
// Observation
// ============================================================================

/// Raw Observer output before ids are attached.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObserverOutput {
    pub summary: String,
    pub signals: BTreeMap<String, SignalValue>,
}

impl StageOutput for ObserverOutput {
    fn validate(&self) -> Result<(), ParseError> {
        if self.summary.trim().is_empty() {
            return Err(ParseError::Malformed("summary is empty".to_string()));
        }
        if let Some((name, _)) = self
            .signals
            .iter()
            .find(|(_, v)| matches!(v, SignalValue::Scalar(x) if !x.is_finite()))
        {
            return Err(ParseError::OutOfRange {
                field: "signals",
                value: name.clone(),
            });
        }
        Ok(())
    }
}

/// What the Observer saw in one clip. Produced once per clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub clip_id: String,
    pub summary: String,
    pub signals: BTreeMap<String, SignalValue>,
}

impl Observation {
    pub fn from_output(clip: &Clip, output: ObserverOutput) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            clip_id: clip.id.clone(),
            summary: output.summary,
            signals: output.signals,
        }
    }

    pub fn signal(&self, name: &str) -> Option<SignalValue> {
        self.signals.get(name).copied()
    }

    pub fn is_positive(&self, name: &str) -> bool {
        self.signal(name).is_some_and(SignalValue::is_positive)
    }

    pub fn is_uncertain(&self, name: &str) -> bool {
        self.signal(name).is_some_and(SignalValue::is_uncertain)
    }
}
