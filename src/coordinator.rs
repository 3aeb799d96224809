//! Root Coordinator
//!
//! Mirrors the logical graph onto the audio engine. It sees every
//! [`PatchEvent`] from every level of the tree and turns it into engine
//! calls: native modules get nodes, logical connections become the concrete
//! edges their expansion yields.
//!
//! The engine can only disconnect a whole output. Removing one logical
//! connection therefore disconnects each affected output once and then
//! reconnects every edge on it that another connection still implies.

use crate::engine::{AudioEngine, BackendEdge, ConnectTarget};
use crate::event::{EngineEvent, EventLog, Notification, PatchEvent, PatchEventKind};
use crate::graph::{ModuleKey, PatchError, PatchTree};
use crate::registry::ModuleKind;
use crate::translate::{ApiEdge, EdgeTarget};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Resolve a concrete edge to the backend nodes it runs between
///
/// Parameter ports of the target become [`ConnectTarget::Param`]. Returns
/// `None` while either end has no node.
pub fn backend_edge(tree: &PatchTree, edge: &ApiEdge) -> Option<BackendEdge> {
    let node = tree.module(edge.source)?.node()?;
    let target = match edge.target {
        EdgeTarget::Destination => ConnectTarget::Destination,
        EdgeTarget::Input { module, input } => {
            let target = tree.module(module)?;
            let target_node = target.node()?;
            match target.definition().param_for_input(input) {
                Some(param) => ConnectTarget::Param {
                    node: target_node,
                    param: param.id.clone(),
                },
                None => ConnectTarget::Input {
                    node: target_node,
                    input,
                },
            }
        }
    };
    Some(BackendEdge {
        node,
        output: edge.output,
        target,
    })
}

/// Drives an [`AudioEngine`] from structural events
pub struct RootCoordinator<E: AudioEngine> {
    engine: E,
    release_nodes: bool,
}

impl<E: AudioEngine> RootCoordinator<E> {
    pub fn new(engine: E, release_nodes: bool) -> Self {
        Self {
            engine,
            release_nodes,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// React to one event; runs before the event reaches anyone else
    pub fn handle(
        &mut self,
        tree: &mut PatchTree,
        event: &PatchEvent,
        log: &mut EventLog,
    ) -> Result<(), PatchError> {
        match &event.kind {
            PatchEventKind::ModuleAdded { module, args, .. } => {
                self.create_node(tree, *module, args, log)
            }
            PatchEventKind::ModuleRemoved { module, .. } => {
                self.release_node(tree, *module, log);
                Ok(())
            }
            PatchEventKind::ConnectionAdded {
                connection,
                reconnect,
                ..
            } => {
                for edge in tree.api_edges_for(*connection) {
                    self.realize(tree, &edge, *reconnect, log)?;
                }
                Ok(())
            }
            PatchEventKind::ConnectionPreRemove { connection, .. } => {
                let plan = tree.removal_plan(*connection);

                for &(module, output) in &plan.cleared_outputs {
                    let Some(node) = tree.module(module).and_then(|m| m.node()) else {
                        continue;
                    };
                    debug!(node = node.raw(), output, "disconnect");
                    self.engine.disconnect(node, output)?;
                    log.push(Notification::Engine(EngineEvent::OutputDisconnected {
                        module,
                        output,
                    }));
                }

                for edge in &plan.restore {
                    self.realize(tree, edge, true, log)?;
                }
                Ok(())
            }
            PatchEventKind::ConnectionPostRemove { .. } => Ok(()),
            PatchEventKind::PatchCleared => {
                info!(root = tree.is_root(event.patch), "patch cleared");
                log.push(Notification::Engine(EngineEvent::PatchCleared {
                    patch: event.patch,
                }));
                Ok(())
            }
            PatchEventKind::ModuleParameterChanged {
                module,
                attribute,
                value,
                ..
            } => {
                if let Some(node) = tree.module(*module).and_then(|m| m.node()) {
                    debug!(node = node.raw(), attribute = %attribute, %value, "set_param");
                    self.engine.set_param(node, attribute, value)?;
                }
                Ok(())
            }
        }
    }

    fn create_node(
        &mut self,
        tree: &mut PatchTree,
        module: ModuleKey,
        args: &[Value],
        log: &mut EventLog,
    ) -> Result<(), PatchError> {
        let Some(m) = tree.module(module) else {
            return Ok(());
        };
        let ModuleKind::Native { constructor, .. } = &m.definition().kind else {
            return Ok(());
        };
        let requires_start = m.definition().requires_start();

        debug!(constructor = %constructor, "create_node");
        let node = match self.engine.create_node(constructor, args) {
            Ok(node) => node,
            Err(err) => {
                error!(module = m.id(), %err, "backend refused node");
                return Err(err.into());
            }
        };

        if requires_start {
            debug!(node = node.raw(), "start");
            if let Err(err) = self.engine.start(node) {
                if let Err(release) = self.engine.release(node) {
                    warn!(node = node.raw(), %release, "failed to release unstarted node");
                }
                return Err(err.into());
            }
        }

        if let Some(m) = tree.module_mut(module) {
            m.set_node(Some(node));
        }
        log.push(Notification::Engine(EngineEvent::NodeCreated { module, node }));
        Ok(())
    }

    fn release_node(&mut self, tree: &mut PatchTree, module: ModuleKey, log: &mut EventLog) {
        let Some(node) = tree.module(module).and_then(|m| m.node()) else {
            return;
        };
        if let Some(m) = tree.module_mut(module) {
            m.set_node(None);
        }
        if !self.release_nodes {
            return;
        }

        debug!(node = node.raw(), "release");
        match self.engine.release(node) {
            Ok(()) => log.push(Notification::Engine(EngineEvent::NodeReleased { module, node })),
            Err(err) => warn!(node = node.raw(), %err, "failed to release node"),
        }
    }

    fn realize(
        &mut self,
        tree: &PatchTree,
        edge: &ApiEdge,
        reconnect: bool,
        log: &mut EventLog,
    ) -> Result<(), PatchError> {
        let Some(backend) = backend_edge(tree, edge) else {
            return Ok(());
        };

        debug!(node = backend.node.raw(), output = backend.output, reconnect, "connect");
        self.engine
            .connect(backend.node, backend.output, &backend.target)?;
        log.push(Notification::Engine(EngineEvent::EdgeConnected {
            edge: *edge,
            reconnect,
        }));
        Ok(())
    }
}
