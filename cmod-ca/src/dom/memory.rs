//! In-memory DOM source
//!
//! Backs the headless binary and the test suites. Cloning shares the same
//! document, so a test can hand one clone to the pipeline and inspect the
//! other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cmod_common::config::DisplayConfig;

use super::{DomSource, OccurrenceId, RenderCommand};

/// Interactive control attached next to a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Control {
    Reveal,
    Hide,
    Report,
}

/// Snapshot of one occurrence as a reader would see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub id: OccurrenceId,
    pub original: String,
    pub visible: String,
    pub controls: Vec<Control>,
}

#[derive(Debug)]
struct Node {
    original: String,
    visible: String,
    controls: Vec<Control>,
}

#[derive(Debug)]
struct State {
    container_present: bool,
    next_id: u64,
    order: Vec<OccurrenceId>,
    nodes: HashMap<OccurrenceId, Node>,
    commands: Vec<(OccurrenceId, RenderCommand)>,
    display: DisplayConfig,
}

/// Shared in-memory comment document
#[derive(Debug, Clone)]
pub struct MemoryDom {
    inner: Arc<Mutex<State>>,
}

impl MemoryDom {
    /// Empty document whose comment container already exists
    pub fn new(display: DisplayConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                container_present: true,
                next_id: 1,
                order: Vec::new(),
                nodes: HashMap::new(),
                commands: Vec::new(),
                display,
            })),
        }
    }

    /// Empty document whose comment container has not rendered yet
    pub fn without_container(display: DisplayConfig) -> Self {
        let dom = Self::new(display);
        dom.set_container_present(false);
        dom
    }

    pub fn set_container_present(&self, present: bool) {
        self.state().container_present = present;
    }

    /// Append a comment occurrence showing `text`
    pub fn add(&self, text: &str) -> OccurrenceId {
        let mut state = self.state();
        let id = OccurrenceId(state.next_id);
        state.next_id += 1;
        state.order.push(id);
        state.nodes.insert(
            id,
            Node {
                original: text.to_string(),
                visible: text.to_string(),
                controls: Vec::new(),
            },
        );
        id
    }

    pub fn remove(&self, id: OccurrenceId) {
        let mut state = self.state();
        state.order.retain(|o| *o != id);
        state.nodes.remove(&id);
    }

    /// Reuse an occurrence for different content, as virtualized lists do
    pub fn replace_text(&self, id: OccurrenceId, text: &str) {
        if let Some(node) = self.state().nodes.get_mut(&id) {
            node.original = text.to_string();
            node.visible = text.to_string();
            node.controls.clear();
        }
    }

    pub fn view(&self, id: OccurrenceId) -> Option<NodeView> {
        let state = self.state();
        state.nodes.get(&id).map(|node| NodeView {
            id,
            original: node.original.clone(),
            visible: node.visible.clone(),
            controls: node.controls.clone(),
        })
    }

    /// All occurrences in document order
    pub fn views(&self) -> Vec<NodeView> {
        let ids = self.state().order.clone();
        ids.into_iter().filter_map(|id| self.view(id)).collect()
    }

    pub fn visible_text(&self, id: OccurrenceId) -> Option<String> {
        self.state().nodes.get(&id).map(|n| n.visible.clone())
    }

    pub fn controls(&self, id: OccurrenceId) -> Vec<Control> {
        self.state()
            .nodes
            .get(&id)
            .map(|n| n.controls.clone())
            .unwrap_or_default()
    }

    /// Every render command received so far, in order
    pub fn commands(&self) -> Vec<(OccurrenceId, RenderCommand)> {
        self.state().commands.clone()
    }

    pub fn command_count(&self) -> usize {
        self.state().commands.len()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new(DisplayConfig::default())
    }
}

impl DomSource for MemoryDom {
    fn container_present(&self) -> bool {
        self.state().container_present
    }

    fn occurrences(&self) -> Vec<OccurrenceId> {
        self.state().order.clone()
    }

    fn original_text(&self, occurrence: OccurrenceId) -> Option<String> {
        self.state()
            .nodes
            .get(&occurrence)
            .map(|n| n.original.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn render(&mut self, occurrence: OccurrenceId, command: RenderCommand) {
        let mut state = self.state();
        let checking = state.display.checking_text.clone();
        let censored = state.display.censored_text.clone();
        state.commands.push((occurrence, command.clone()));

        let Some(node) = state.nodes.get_mut(&occurrence) else {
            return;
        };

        match command {
            RenderCommand::RenderChecking { .. } => {
                node.visible = checking;
                node.controls.retain(|c| *c == Control::Report);
            }
            RenderCommand::RenderFlagged => {
                node.visible = censored;
                node.controls.retain(|c| *c == Control::Report);
            }
            RenderCommand::RenderNormal { text } => {
                node.visible = text;
                node.controls.retain(|c| *c == Control::Report);
            }
            RenderCommand::AttachRevealControl => attach(&mut node.controls, Control::Reveal),
            RenderCommand::AttachHideControl => attach(&mut node.controls, Control::Hide),
            RenderCommand::AttachReportControl => attach(&mut node.controls, Control::Report),
        }
    }
}

fn attach(controls: &mut Vec<Control>, control: Control) {
    if !controls.contains(&control) {
        controls.push(control);
        controls.sort();
    }
}
