//! DOM source contract
//!
//! The pipeline never touches a real document. A DOM source enumerates the
//! comment occurrences currently rendered, reports each one's original text,
//! and carries out the render commands the pipeline issues. Structural
//! changes reach the pipeline as [`DomSignal`]s on a channel.

mod memory;

pub use memory::{Control, MemoryDom, NodeView};

/// Handle for one rendered comment occurrence
///
/// Stable for as long as the occurrence stays in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccurrenceId(pub u64);

impl std::fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands the pipeline issues to the DOM source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCommand {
    /// Show the checking placeholder; `text` is the original content kept alongside it
    RenderChecking { text: String },
    /// Replace the content with the censored placeholder
    RenderFlagged,
    /// Show the original content
    RenderNormal { text: String },
    AttachRevealControl,
    AttachHideControl,
    AttachReportControl,
}

/// Structural change notifications from the DOM source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomSignal {
    /// One or more comment occurrences were added
    OccurrencesAdded,
    OccurrenceRemoved(OccurrenceId),
    /// Text inside an occurrence changed
    TextChanged(OccurrenceId),
}

/// Source of comment occurrences and sink for render commands
pub trait DomSource {
    /// True once the comment container exists
    fn container_present(&self) -> bool;

    /// Occurrences currently rendered, in document order
    fn occurrences(&self) -> Vec<OccurrenceId>;

    /// Original content of an occurrence, as captured before any rendering
    ///
    /// None if the occurrence is gone or has no text yet.
    fn original_text(&self, occurrence: OccurrenceId) -> Option<String>;

    fn render(&mut self, occurrence: OccurrenceId, command: RenderCommand);
}
