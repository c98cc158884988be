//! Domain Events
//!
//! Every completed mutation publishes one or more [`DomainEvent`]s through the
//! [`SubscriberHub`](crate::services::SubscriberHub). Events describe the
//! committed in-memory state; persistence problems that surface later arrive
//! as [`DomainEvent::Diagnostic`].
//!
//! Each event carries the id of the viewer whose call produced it (`None` for
//! engine-internal transitions such as load or repair) so a viewer can tell
//! its own echoes from other panes' edits.

use crate::models::{HierarchyEdge, Node, ParentKey};
use serde::Serialize;
use serde_json::Value;

/// Structural transition that produced a [`DomainEvent::HierarchyChanged`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StructuralOperation {
    Create,
    Delete,
    Indent,
    Outdent,
    Merge,
    Split,
    Move,
    Load,
    Repair,
}

/// What went wrong, for [`Diagnostic`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    ChainCorruption,
    PersistenceFailure,
    WriteOrderingTimeout,
    SubscriberFailure,
}

/// Out-of-band report of a failure that did not fail the caller's request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub node_id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Discriminant of [`DomainEvent`], used for kind-filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    ContentUpdated,
    PropertiesUpdated,
    NodeDeleted,
    PlaceholderPromoted,
    HierarchyChanged,
    Diagnostic,
}

/// Committed change to the document
///
/// Serialized internally tagged (`{"type": "contentUpdated", ...}`) with flat
/// camelCase fields for forwarding to a frontend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    /// A node was inserted into the document (durable or placeholder)
    NodeCreated {
        node: Node,
        source_viewer_id: Option<String>,
    },

    /// Content replaced; `mentions` are the `nodespace://` targets found in it
    ContentUpdated {
        node_id: String,
        content: String,
        version: i64,
        mentions: Vec<String>,
        source_viewer_id: Option<String>,
    },

    /// Properties shallow-merged; `properties` is the full result
    PropertiesUpdated {
        node_id: String,
        properties: Value,
        version: i64,
        source_viewer_id: Option<String>,
    },

    /// Node removed; its children now live in its former parent scope
    NodeDeleted {
        node_id: String,
        promoted_children: Vec<String>,
        source_viewer_id: Option<String>,
    },

    /// A placeholder received content and is now being persisted
    PlaceholderPromoted {
        node_id: String,
        source_viewer_id: Option<String>,
    },

    /// Edges changed; `edges` are the new positions of every moved node
    HierarchyChanged {
        operation: StructuralOperation,
        node_id: String,
        edges: Vec<HierarchyEdge>,
        affected_scopes: Vec<ParentKey>,
        source_viewer_id: Option<String>,
    },

    /// Failure reported out of band
    Diagnostic(Diagnostic),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::NodeCreated { .. } => EventKind::NodeCreated,
            DomainEvent::ContentUpdated { .. } => EventKind::ContentUpdated,
            DomainEvent::PropertiesUpdated { .. } => EventKind::PropertiesUpdated,
            DomainEvent::NodeDeleted { .. } => EventKind::NodeDeleted,
            DomainEvent::PlaceholderPromoted { .. } => EventKind::PlaceholderPromoted,
            DomainEvent::HierarchyChanged { .. } => EventKind::HierarchyChanged,
            DomainEvent::Diagnostic(_) => EventKind::Diagnostic,
        }
    }

    /// Get a string representation of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::NodeCreated { .. } => "node:created",
            DomainEvent::ContentUpdated { .. } => "node:content",
            DomainEvent::PropertiesUpdated { .. } => "node:properties",
            DomainEvent::NodeDeleted { .. } => "node:deleted",
            DomainEvent::PlaceholderPromoted { .. } => "node:promoted",
            DomainEvent::HierarchyChanged { .. } => "hierarchy:changed",
            DomainEvent::Diagnostic(_) => "diagnostic:reported",
        }
    }

    /// Namespace tag used by namespace-filtered subscriptions
    pub fn namespace(&self) -> &'static str {
        let event_type = self.event_type();
        event_type
            .split_once(':')
            .map_or(event_type, |(namespace, _)| namespace)
    }

    /// Every node id the event is about
    pub fn node_ids(&self) -> Vec<&str> {
        match self {
            DomainEvent::NodeCreated { node, .. } => vec![node.id.as_str()],
            DomainEvent::ContentUpdated { node_id, .. }
            | DomainEvent::PropertiesUpdated { node_id, .. }
            | DomainEvent::PlaceholderPromoted { node_id, .. } => vec![node_id.as_str()],
            DomainEvent::NodeDeleted {
                node_id,
                promoted_children,
                ..
            } => std::iter::once(node_id.as_str())
                .chain(promoted_children.iter().map(String::as_str))
                .collect(),
            DomainEvent::HierarchyChanged { node_id, edges, .. } => {
                let mut ids = vec![node_id.as_str()];
                for edge in edges {
                    if !ids.contains(&edge.child_id.as_str()) {
                        ids.push(edge.child_id.as_str());
                    }
                }
                ids
            }
            DomainEvent::Diagnostic(diagnostic) => diagnostic.node_id.as_deref().into_iter().collect(),
        }
    }

    /// Viewer whose call produced the event
    pub fn source_viewer_id(&self) -> Option<&str> {
        match self {
            DomainEvent::NodeCreated {
                source_viewer_id, ..
            }
            | DomainEvent::ContentUpdated {
                source_viewer_id, ..
            }
            | DomainEvent::PropertiesUpdated {
                source_viewer_id, ..
            }
            | DomainEvent::NodeDeleted {
                source_viewer_id, ..
            }
            | DomainEvent::PlaceholderPromoted {
                source_viewer_id, ..
            }
            | DomainEvent::HierarchyChanged {
                source_viewer_id, ..
            } => source_viewer_id.as_deref(),
            DomainEvent::Diagnostic(_) => None,
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        matches!(self, DomainEvent::Diagnostic(_))
    }
}
