//! Classification service wire protocol
//!
//! Request and response bodies for the two endpoints the analyzer talks to:
//! - `POST /analyze` with `{comments: [{id, text, streamId}]}`
//! - `POST /report_word` with `{word, reason, context}`
//!
//! Only the first element of a classification response is consulted; the
//! request always carries exactly one comment.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Verdict for one comment text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// No usable verdict (never classified, or the service answered with an unrecognized label)
    #[default]
    Unknown,
    Normal,
    Flagged,
}

impl Classification {
    /// Map a service label onto a classification
    ///
    /// Accepts the English labels as well as the Korean labels the upstream
    /// service emits (`정상` normal, `혐오` hateful). Anything else is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "normal" | "Normal" | "정상" => Classification::Normal,
            "flagged" | "Flagged" | "혐오" => Classification::Flagged,
            _ => Classification::Unknown,
        }
    }

    pub fn is_flagged(self) -> bool {
        self == Classification::Flagged
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Unknown => write!(f, "unknown"),
            Classification::Normal => write!(f, "normal"),
            Classification::Flagged => write!(f, "flagged"),
        }
    }
}

/// One comment submitted for classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub id: String,
    pub text: String,
    #[serde(rename = "streamId", alias = "videoId")]
    pub stream_id: String,
}

/// Body of `POST /analyze`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub comments: Vec<CommentPayload>,
}

impl ClassifyRequest {
    /// Build the single-comment request used by the serialized queue
    pub fn single(id: impl Into<String>, text: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            comments: vec![CommentPayload {
                id: id.into(),
                text: text.into(),
                stream_id: stream_id.into(),
            }],
        }
    }
}

/// One classified comment in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedComment {
    pub id: String,

    /// Raw label as sent by the service
    #[serde(default)]
    pub classification: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Set by the service when analysis of this comment failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClassifiedComment {
    /// Parsed verdict (`Unknown` when the label is missing or unrecognized)
    pub fn verdict(&self) -> Classification {
        self.classification
            .as_deref()
            .map(Classification::from_label)
            .unwrap_or_default()
    }
}

/// Body returned by `POST /analyze`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    #[serde(default)]
    pub comments: Vec<ClassifiedComment>,
}

impl ClassifyResponse {
    /// Take the first result, the only one consulted in the single-comment contract
    pub fn into_first(self) -> Result<ClassifiedComment> {
        self.comments
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("response contains no comments".to_string()))
    }
}

/// Body of `POST /report_word`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWordRequest {
    pub word: String,
    pub reason: String,
    /// Original text of the comment the word was reported from
    pub context: String,
}

impl ReportWordRequest {
    /// Validate that the fields the service requires are present
    pub fn validate(&self) -> Result<()> {
        if self.word.trim().is_empty() {
            return Err(Error::InvalidInput("word must not be empty".to_string()));
        }
        if self.reason.trim().is_empty() {
            return Err(Error::InvalidInput("reason must not be empty".to_string()));
        }
        Ok(())
    }
}
