//! Per-viewer UI state
//!
//! A [`Viewer`] is one pane or tab looking at a shared [`DocumentSession`].
//! Expansion and focus are local to the viewer and never synchronized; the
//! document itself is shared, so every viewer sees every edit as soon as the
//! mutating call returns.

use crate::services::events::DomainEvent;
use crate::services::{EventFilter, EventKind, MutationService, Subscription};
use crate::session::DocumentSession;
use crate::tree::OutlineRow;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Local, unsynchronized UI state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerUiState {
    pub expanded: HashSet<String>,
    pub focused: Option<String>,
}

/// One pane observing and editing a shared document
pub struct Viewer {
    id: String,
    session: Arc<DocumentSession>,
    mutations: MutationService,
    ui: Arc<Mutex<ViewerUiState>>,
    subscription: Option<Subscription>,
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("id", &self.id)
            .field("ui", &*lock(&self.ui))
            .finish()
    }
}

impl Viewer {
    pub(crate) fn new(session: Arc<DocumentSession>, id: String) -> Self {
        let ui = Arc::new(Mutex::new(ViewerUiState::default()));
        let mutations = session.mutations().with_viewer(id.clone());

        // deleted nodes drop out of local state, whoever deleted them
        let state = Arc::clone(&ui);
        let subscription = session.hub().subscribe(
            EventKind::NodeDeleted,
            EventFilter::new(),
            move |event| {
                if let DomainEvent::NodeDeleted { node_id, .. } = event {
                    let mut ui = lock(&state);
                    ui.expanded.remove(node_id);
                    if ui.focused.as_deref() == Some(node_id.as_str()) {
                        ui.focused = None;
                    }
                }
                Ok(())
            },
        );

        tracing::debug!("Viewer {} opened", id);
        Self {
            id,
            session,
            mutations,
            ui,
            subscription: Some(subscription),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mutation service tagging events with this viewer's id
    pub fn mutations(&self) -> &MutationService {
        &self.mutations
    }

    pub fn session(&self) -> &Arc<DocumentSession> {
        &self.session
    }

    pub fn ui_state(&self) -> ViewerUiState {
        lock(&self.ui).clone()
    }

    pub fn expand(&self, id: &str) {
        lock(&self.ui).expanded.insert(id.to_string());
    }

    pub fn collapse(&self, id: &str) {
        lock(&self.ui).expanded.remove(id);
    }

    /// Flip expansion, returning whether `id` is now expanded
    pub fn toggle(&self, id: &str) -> bool {
        let mut ui = lock(&self.ui);
        if ui.expanded.remove(id) {
            false
        } else {
            ui.expanded.insert(id.to_string());
            true
        }
    }

    pub fn is_expanded(&self, id: &str) -> bool {
        lock(&self.ui).expanded.contains(id)
    }

    /// Focus a node; unknown ids clear focus
    pub fn focus(&self, id: Option<&str>) {
        let focused = id
            .filter(|id| self.session.get_node(id).is_some())
            .map(str::to_string);
        lock(&self.ui).focused = focused;
    }

    pub fn focused(&self) -> Option<String> {
        lock(&self.ui).focused.clone()
    }

    /// Rows this viewer shows: children of collapsed nodes are hidden
    pub fn visible_outline(&self) -> Vec<OutlineRow> {
        let expanded = lock(&self.ui).expanded.clone();
        let mut hidden_below: Option<u32> = None;
        let mut rows = Vec::new();
        for row in self.session.outline() {
            if let Some(depth) = hidden_below {
                if row.depth > depth {
                    continue;
                }
                hidden_below = None;
            }
            if !expanded.contains(&row.id) {
                hidden_below = Some(row.depth);
            }
            rows.push(row);
        }
        rows
    }

    /// Stop listening for document events
    ///
    /// Same as dropping the viewer.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        tracing::debug!("Viewer {} closed", self.id);
    }
}

fn lock(ui: &Mutex<ViewerUiState>) -> MutexGuard<'_, ViewerUiState> {
    ui.lock().unwrap_or_else(PoisonError::into_inner)
}
