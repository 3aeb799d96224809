//! Audio Engine Capability
//!
//! The patch graph never processes audio itself. It drives an [`AudioEngine`]
//! that owns the processing nodes and their physical wiring. The engine's
//! connection primitive is coarse: [`AudioEngine::disconnect`] severs every
//! edge leaving an output, not just one.
//!
//! [`RecordingEngine`] is an in-memory engine with exactly those semantics. It
//! records every call it receives, which makes it the reference backend for
//! tests and for running a graph headless.

use crate::port::{AttributeValue, PortIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Opaque handle to a node owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(u64);

impl NodeHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where a backend edge lands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConnectTarget {
    /// A regular audio input of a node
    Input { node: NodeHandle, input: PortIndex },
    /// A parameter of a node, driven as modulation
    Param { node: NodeHandle, param: String },
    /// The engine's root destination (speakers)
    Destination,
}

impl ConnectTarget {
    pub fn node(&self) -> Option<NodeHandle> {
        match self {
            ConnectTarget::Input { node, .. } | ConnectTarget::Param { node, .. } => Some(*node),
            ConnectTarget::Destination => None,
        }
    }
}

/// Errors reported by an engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    UnsupportedType(String),
    UnknownNode(NodeHandle),
    Backend(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnsupportedType(constructor) => {
                write!(f, "Unsupported node type: {}", constructor)
            }
            EngineError::UnknownNode(node) => write!(f, "Unknown node: {}", node.raw()),
            EngineError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Capability consumed by the root coordinator
pub trait AudioEngine {
    /// Instantiate a node through the named backend constructor
    fn create_node(&mut self, constructor: &str, args: &[Value]) -> Result<NodeHandle, EngineError>;

    /// Start a source node
    fn start(&mut self, node: NodeHandle) -> Result<(), EngineError>;

    fn set_param(
        &mut self,
        node: NodeHandle,
        param: &str,
        value: &AttributeValue,
    ) -> Result<(), EngineError>;

    fn get_param(&self, node: NodeHandle, param: &str) -> Option<AttributeValue>;

    fn connect(
        &mut self,
        node: NodeHandle,
        output: PortIndex,
        target: &ConnectTarget,
    ) -> Result<(), EngineError>;

    /// Sever every edge leaving `output`
    fn disconnect(&mut self, node: NodeHandle, output: PortIndex) -> Result<(), EngineError>;

    /// Give a node back to the engine
    fn release(&mut self, _node: NodeHandle) -> Result<(), EngineError> {
        Ok(())
    }
}

/// One call received by a [`RecordingEngine`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "call")]
pub enum EngineCall {
    CreateNode {
        node: NodeHandle,
        constructor: String,
    },
    Start {
        node: NodeHandle,
    },
    SetParam {
        node: NodeHandle,
        param: String,
        value: AttributeValue,
    },
    Connect {
        node: NodeHandle,
        output: PortIndex,
        target: ConnectTarget,
    },
    Disconnect {
        node: NodeHandle,
        output: PortIndex,
    },
    Release {
        node: NodeHandle,
    },
}

/// A live edge held by a [`RecordingEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackendEdge {
    pub node: NodeHandle,
    pub output: PortIndex,
    pub target: ConnectTarget,
}

/// A node held by a [`RecordingEngine`]
#[derive(Debug, Clone, Default)]
pub struct RecordedNode {
    pub constructor: String,
    pub args: Vec<Value>,
    pub params: HashMap<String, AttributeValue>,
    pub started: bool,
}

/// In-memory engine that records calls and tracks live wiring
#[derive(Debug, Default)]
pub struct RecordingEngine {
    nodes: HashMap<NodeHandle, RecordedNode>,
    edges: Vec<BackendEdge>,
    calls: Vec<EngineCall>,
    next_handle: u64,
    supported: Option<Vec<String>>,
}

impl RecordingEngine {
    /// Create an engine that accepts every constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine that only knows the given constructors
    pub fn with_supported(constructors: &[&str]) -> Self {
        Self {
            supported: Some(constructors.iter().map(|c| c.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    /// Drain the call log
    pub fn take_calls(&mut self) -> Vec<EngineCall> {
        std::mem::take(&mut self.calls)
    }

    /// Connect and disconnect calls only, in order
    pub fn wiring_calls(&self) -> Vec<&EngineCall> {
        self.calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Connect { .. } | EngineCall::Disconnect { .. }))
            .collect()
    }

    /// Currently live edges
    pub fn edges(&self) -> &[BackendEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Live edges leaving one output
    pub fn edges_from(
        &self,
        node: NodeHandle,
        output: PortIndex,
    ) -> impl Iterator<Item = &BackendEdge> {
        self.edges
            .iter()
            .filter(move |e| e.node == node && e.output == output)
    }

    pub fn has_edge(&self, node: NodeHandle, output: PortIndex, target: &ConnectTarget) -> bool {
        self.edges
            .iter()
            .any(|e| e.node == node && e.output == output && &e.target == target)
    }

    pub fn node(&self, node: NodeHandle) -> Option<&RecordedNode> {
        self.nodes.get(&node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn check_node(&self, node: NodeHandle) -> Result<(), EngineError> {
        if self.nodes.contains_key(&node) {
            Ok(())
        } else {
            Err(EngineError::UnknownNode(node))
        }
    }
}

impl AudioEngine for RecordingEngine {
    fn create_node(
        &mut self,
        constructor: &str,
        args: &[Value],
    ) -> Result<NodeHandle, EngineError> {
        if let Some(supported) = &self.supported {
            if !supported.iter().any(|c| c == constructor) {
                return Err(EngineError::UnsupportedType(constructor.to_string()));
            }
        }

        self.next_handle += 1;
        let node = NodeHandle::new(self.next_handle);
        self.nodes.insert(
            node,
            RecordedNode {
                constructor: constructor.to_string(),
                args: args.to_vec(),
                ..RecordedNode::default()
            },
        );
        self.calls.push(EngineCall::CreateNode {
            node,
            constructor: constructor.to_string(),
        });
        Ok(node)
    }

    fn start(&mut self, node: NodeHandle) -> Result<(), EngineError> {
        let recorded = self
            .nodes
            .get_mut(&node)
            .ok_or(EngineError::UnknownNode(node))?;
        recorded.started = true;
        self.calls.push(EngineCall::Start { node });
        Ok(())
    }

    fn set_param(
        &mut self,
        node: NodeHandle,
        param: &str,
        value: &AttributeValue,
    ) -> Result<(), EngineError> {
        let recorded = self
            .nodes
            .get_mut(&node)
            .ok_or(EngineError::UnknownNode(node))?;
        recorded.params.insert(param.to_string(), value.clone());
        self.calls.push(EngineCall::SetParam {
            node,
            param: param.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    fn get_param(&self, node: NodeHandle, param: &str) -> Option<AttributeValue> {
        self.nodes.get(&node)?.params.get(param).cloned()
    }

    fn connect(
        &mut self,
        node: NodeHandle,
        output: PortIndex,
        target: &ConnectTarget,
    ) -> Result<(), EngineError> {
        self.check_node(node)?;
        if let Some(target_node) = target.node() {
            self.check_node(target_node)?;
        }

        self.calls.push(EngineCall::Connect {
            node,
            output,
            target: target.clone(),
        });

        // Connecting an existing pair again is a no-op on the backend
        if !self.has_edge(node, output, target) {
            self.edges.push(BackendEdge {
                node,
                output,
                target: target.clone(),
            });
        }
        Ok(())
    }

    fn disconnect(&mut self, node: NodeHandle, output: PortIndex) -> Result<(), EngineError> {
        self.check_node(node)?;
        self.edges
            .retain(|e| !(e.node == node && e.output == output));
        self.calls.push(EngineCall::Disconnect { node, output });
        Ok(())
    }

    fn release(&mut self, node: NodeHandle) -> Result<(), EngineError> {
        if self.nodes.remove(&node).is_none() {
            return Err(EngineError::UnknownNode(node));
        }
        self.edges
            .retain(|e| e.node != node && e.target.node() != Some(node));
        self.calls.push(EngineCall::Release { node });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_severs_whole_output() {
        let mut engine = RecordingEngine::new();
        let a = engine.create_node("createOscillator", &[]).unwrap();
        let b = engine.create_node("createGain", &[]).unwrap();
        let c = engine.create_node("createGain", &[]).unwrap();

        let to_b = ConnectTarget::Input { node: b, input: 0 };
        let to_c = ConnectTarget::Input { node: c, input: 0 };
        engine.connect(a, 0, &to_b).unwrap();
        engine.connect(a, 0, &to_c).unwrap();
        assert_eq!(engine.edges_from(a, 0).count(), 2);

        engine.disconnect(a, 0).unwrap();
        assert_eq!(engine.edge_count(), 0);
    }

    #[test]
    fn test_duplicate_connect_keeps_one_edge() {
        let mut engine = RecordingEngine::new();
        let a = engine.create_node("createOscillator", &[]).unwrap();
        engine.connect(a, 0, &ConnectTarget::Destination).unwrap();
        engine.connect(a, 0, &ConnectTarget::Destination).unwrap();
        assert_eq!(engine.edge_count(), 1);
        assert_eq!(engine.wiring_calls().len(), 2);
    }

    #[test]
    fn test_unsupported_constructor() {
        let mut engine = RecordingEngine::with_supported(&["createGain"]);
        assert!(engine.create_node("createGain", &[]).is_ok());
        assert_eq!(
            engine.create_node("createOscillator", &[]),
            Err(EngineError::UnsupportedType("createOscillator".into()))
        );
    }

    #[test]
    fn test_connect_unknown_node_fails() {
        let mut engine = RecordingEngine::new();
        let a = engine.create_node("createGain", &[]).unwrap();
        let ghost = NodeHandle::new(99);
        let result = engine.connect(a, 0, &ConnectTarget::Input { node: ghost, input: 0 });
        assert_eq!(result, Err(EngineError::UnknownNode(ghost)));
        assert!(engine.calls().iter().all(|c| !matches!(c, EngineCall::Connect { .. })));
    }

    #[test]
    fn test_release_drops_incident_edges() {
        let mut engine = RecordingEngine::new();
        let a = engine.create_node("createOscillator", &[]).unwrap();
        let b = engine.create_node("createGain", &[]).unwrap();
        engine
            .connect(a, 0, &ConnectTarget::Param { node: b, param: "gain".into() })
            .unwrap();
        engine.release(b).unwrap();
        assert_eq!(engine.edge_count(), 0);
        assert!(engine.node(b).is_none());
    }

    #[test]
    fn test_params_are_stored() {
        let mut engine = RecordingEngine::new();
        let a = engine.create_node("createOscillator", &[]).unwrap();
        engine.set_param(a, "frequency", &220.0.into()).unwrap();
        assert_eq!(engine.get_param(a, "frequency"), Some(AttributeValue::Number(220.0)));
        assert_eq!(engine.get_param(a, "detune"), None);
    }
}
