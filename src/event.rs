//! Structural Notifications
//!
//! Every structural change anywhere in the patch tree produces a
//! [`PatchEvent`] keyed by the identity of the patch it happened in, so the
//! root sees every change without walking the tree. The root coordinator
//! reacts first, then the event is queued for the presentation layer together
//! with the [`EngineEvent`]s the coordinator produced.

use crate::engine::NodeHandle;
use crate::graph::{ConnectionId, ModuleKey, PatchId};
use crate::port::{AttributeValue, PortIndex};
use crate::serialize::ConnectionDef;
use crate::translate::ApiEdge;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

/// A structural change in one patch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchEvent {
    pub patch: PatchId,
    #[serde(flatten)]
    pub kind: PatchEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PatchEventKind {
    ModuleAdded {
        module: ModuleKey,
        id: String,
        args: Vec<Value>,
    },
    ModuleRemoved {
        module: ModuleKey,
        id: String,
    },
    ConnectionAdded {
        connection: ConnectionId,
        wire: ConnectionDef,
        reconnect: bool,
    },
    /// Sent while the connection is still resolvable
    ConnectionPreRemove {
        connection: ConnectionId,
        wire: ConnectionDef,
    },
    ConnectionPostRemove {
        connection: ConnectionId,
        wire: ConnectionDef,
    },
    PatchCleared,
    ModuleParameterChanged {
        module: ModuleKey,
        id: String,
        attribute: String,
        value: AttributeValue,
    },
}

/// Result of the root coordinator driving the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EngineEvent {
    NodeCreated {
        module: ModuleKey,
        node: NodeHandle,
    },
    NodeReleased {
        module: ModuleKey,
        node: NodeHandle,
    },
    /// A concrete edge was connected; `reconnect` marks restored wiring
    EdgeConnected { edge: ApiEdge, reconnect: bool },
    OutputDisconnected {
        module: ModuleKey,
        output: PortIndex,
    },
    PatchCleared { patch: PatchId },
}

/// Anything the presentation layer can observe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "event")]
pub enum Notification {
    Patch(PatchEvent),
    Engine(EngineEvent),
}

impl Notification {
    pub fn as_patch(&self) -> Option<&PatchEvent> {
        match self {
            Notification::Patch(event) => Some(event),
            Notification::Engine(_) => None,
        }
    }

    pub fn as_engine(&self) -> Option<&EngineEvent> {
        match self {
            Notification::Engine(event) => Some(event),
            Notification::Patch(_) => None,
        }
    }
}

/// Bounded queue of notifications waiting to be drained
#[derive(Debug)]
pub struct EventLog {
    pending: VecDeque<Notification>,
    max_pending: usize,
}

impl EventLog {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_pending,
        }
    }

    pub fn push(&mut self, notification: Notification) {
        self.pending.push_back(notification);

        // Drop oldest
        while self.pending.len() > self.max_pending {
            self.pending.pop_front();
        }
    }

    /// Drain all pending notifications, oldest first
    pub fn drain(&mut self) -> Vec<Notification> {
        self.pending.drain(..).collect()
    }

    /// Peek at pending notifications without draining
    pub fn pending(&self) -> impl Iterator<Item = &Notification> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(crate::config::GraphConfig::default().max_pending_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn cleared(raw: u64) -> Notification {
        Notification::Patch(PatchEvent {
            patch: PatchId::from(KeyData::from_ffi(raw)),
            kind: PatchEventKind::PatchCleared,
        })
    }

    #[test]
    fn test_log_drops_oldest() {
        let mut log = EventLog::new(2);
        log.push(cleared(1));
        log.push(cleared(2));
        log.push(cleared(3));
        assert_eq!(log.pending_count(), 2);

        let drained = log.drain();
        assert_eq!(drained[0], cleared(2));
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn test_notification_accessors() {
        let n = cleared(1);
        assert!(n.as_patch().is_some());
        assert!(n.as_engine().is_none());
    }

    #[test]
    fn test_patch_event_serializes_flat() {
        let json = serde_json::to_value(cleared(1)).unwrap();
        assert_eq!(json["source"], "patch");
        assert_eq!(json["event"]["type"], "patch_cleared");
        assert!(json["event"].get("patch").is_some());
    }
}
