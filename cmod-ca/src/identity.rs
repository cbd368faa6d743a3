//! Comment identity derivation
//!
//! An identity is derived from the stream identifier and a bounded prefix of
//! the comment's original text with all whitespace removed. Two occurrences of
//! the same text in the same stream share an identity. Distinct texts that
//! share their first `prefix_chars` characters collide onto one identity;
//! that approximation is accepted and their classification state is merged.

use cmod_common::config::{DisplayConfig, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stream identifier used when none can be determined
pub const UNKNOWN_STREAM_ID: &str = "unknown_video_id";

const IDENTITY_PREFIX: &str = "pseudo";

/// Stable identity token for a comment text within one stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(String);

impl CommentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a token received from the classification service
    ///
    /// No validation: a foreign token that matches nothing in the registry is
    /// simply an unknown result.
    pub fn from_wire(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(50) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a text yields no identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityUnavailable {
    #[error("comment text is empty")]
    Empty,

    #[error("comment text is a reserved placeholder")]
    Placeholder,
}

/// Derives comment identities
///
/// Pure: the same input always yields the same output, so the scan path and
/// the reconciliation path can both call it freely.
#[derive(Debug, Clone)]
pub struct IdentityDeriver {
    prefix_chars: usize,
    placeholders: Vec<String>,
}

impl IdentityDeriver {
    pub fn new(prefix_chars: usize, placeholders: Vec<String>) -> Self {
        Self {
            prefix_chars: prefix_chars.max(1),
            placeholders: placeholders
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Build from configuration; both display placeholders are reserved
    pub fn from_config(pipeline: &PipelineConfig, display: &DisplayConfig) -> Self {
        Self::new(
            pipeline.identity_prefix_chars,
            vec![display.checking_text.clone(), display.censored_text.clone()],
        )
    }

    pub fn prefix_chars(&self) -> usize {
        self.prefix_chars
    }

    /// True if `text` is one of the reserved display strings
    pub fn is_placeholder(&self, text: &str) -> bool {
        let text = text.trim();
        self.placeholders.iter().any(|p| p == text)
    }

    /// Derive the identity of `text` within `stream_id`
    pub fn derive(&self, text: &str, stream_id: &str) -> Result<CommentId, IdentityUnavailable> {
        if text.trim().is_empty() {
            return Err(IdentityUnavailable::Empty);
        }
        if self.is_placeholder(text) {
            return Err(IdentityUnavailable::Placeholder);
        }

        let short: String = text
            .trim()
            .chars()
            .take(self.prefix_chars)
            .filter(|c| !c.is_whitespace())
            .collect();

        Ok(CommentId(format!(
            "{}--{}--{}",
            IDENTITY_PREFIX, stream_id, short
        )))
    }
}

impl Default for IdentityDeriver {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default(), &DisplayConfig::default())
    }
}

/// Extract the stream identifier from a watch page URL
///
/// Uses the `v` query parameter; anything else (no parameter, empty value,
/// unparsable URL) maps to [`UNKNOWN_STREAM_ID`].
pub fn stream_id_from_url(page_url: &str) -> String {
    url::Url::parse(page_url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN_STREAM_ID.to_string())
}
