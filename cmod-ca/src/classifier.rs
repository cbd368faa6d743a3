//! Classification service client
//!
//! One network call per queue entry and no retries inside the client: an
//! entry that fails resolves as `error` and the next scan decides whether to
//! send it again.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use cmod_common::protocol::{Classification, ClassifyResponse, ReportWordRequest};

use crate::identity::CommentId;
use crate::queue::QueueEntry;

const USER_AGENT: &str = concat!("cmod-ca/", env!("CARGO_PKG_VERSION"));
const ANALYZE_PATH: &str = "/analyze";
const REPORT_WORD_PATH: &str = "/report_word";

/// Classifier client errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    /// Connection, timeout or other transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Service answered with a non-success status
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// 2xx response whose body is missing or has the wrong shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Service reported that it could not analyze this comment
    #[error("Classifier rejected {identity}: {message}")]
    Rejected { identity: CommentId, message: String },

    /// Word report is missing a required field
    #[error("Invalid report: {0}")]
    InvalidReport(String),
}

impl ClassifierError {
    /// Network or HTTP-level failure, as opposed to a bad payload
    pub fn is_transport(&self) -> bool {
        matches!(self, ClassifierError::Network(_) | ClassifierError::HttpStatus(..))
    }
}

/// Successful verdict for one queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationOutcome {
    /// Identity the service answered for (normally the one that was sent)
    pub identity: CommentId,
    pub classification: Classification,
    pub reason: Option<String>,
}

/// Remote classification service
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify the text of one queue entry
    async fn classify(&self, entry: &QueueEntry) -> Result<ClassificationOutcome, ClassifierError>;

    /// Submit a report-a-word action; success needs nothing beyond an OK status
    async fn report_word(&self, report: &ReportWordRequest) -> Result<(), ClassifierError>;
}

/// HTTP client for the classification service
pub struct HttpClassifier {
    http_client: reqwest::Client,
    analyze_url: String,
    report_url: String,
}

impl HttpClassifier {
    /// Create a client for the service at `server_url` (no trailing slash needed)
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        let base = server_url.trim_end_matches('/');
        Ok(Self {
            http_client,
            analyze_url: format!("{}{}", base, ANALYZE_PATH),
            report_url: format!("{}{}", base, REPORT_WORD_PATH),
        })
    }

    pub fn analyze_url(&self) -> &str {
        &self.analyze_url
    }

    pub fn report_url(&self) -> &str {
        &self.report_url
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, entry: &QueueEntry) -> Result<ClassificationOutcome, ClassifierError> {
        debug!(identity = %entry.identity.short(), "Sending comment to classifier");

        let response = self
            .http_client
            .post(&self.analyze_url)
            .json(&entry.to_request())
            .send()
            .await
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::HttpStatus(status.as_u16(), error_text));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;

        let first = body
            .into_first()
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;

        if let Some(message) = first.error.clone() {
            return Err(ClassifierError::Rejected {
                identity: CommentId::from_wire(first.id),
                message,
            });
        }

        let classification = first.verdict();
        debug!(
            identity = %entry.identity.short(),
            %classification,
            reason = first.reason.as_deref().unwrap_or(""),
            "Classifier response received"
        );

        Ok(ClassificationOutcome {
            identity: CommentId::from_wire(first.id),
            classification,
            reason: first.reason,
        })
    }

    async fn report_word(&self, report: &ReportWordRequest) -> Result<(), ClassifierError> {
        report
            .validate()
            .map_err(|e| ClassifierError::InvalidReport(e.to_string()))?;

        let response = self
            .http_client
            .post(&self.report_url)
            .json(report)
            .send()
            .await
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::HttpStatus(status.as_u16(), error_text));
        }

        info!(word = %report.word, "Word report accepted");
        Ok(())
    }
}
