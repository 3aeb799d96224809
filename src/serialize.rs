//! Serialization and Persistence
//!
//! Types for saving and loading patch trees. A snapshot addresses modules by
//! id only; the module type is recovered from the id prefix on load, so a
//! snapshot taken in one session restores with the same ids in the next.

use crate::engine::AudioEngine;
use crate::graph::{split_module_id, Graph, ModuleKey, PatchError, PatchId, Position};
use crate::port::{AttributeValue, InputIndex, PortIndex};
use crate::registry::{ModuleRegistry, ProxyKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

/// Serializable patch definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchDef {
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
}

impl PatchDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of modules here and in every nested patch
    pub fn module_count(&self) -> usize {
        self.modules
            .iter()
            .map(|m| 1 + m.sub_patch.as_ref().map_or(0, PatchDef::module_count))
            .sum()
    }
}

/// Serializable module instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDef {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<Position>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<AttributeState>>,

    /// Only present on subpatch modules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_patch: Option<PatchDef>,
}

impl ModuleDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pos: None,
            args: Vec::new(),
            attributes: None,
            sub_patch: None,
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.pos = Some(Position::new(x, y));
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_attribute(
        mut self,
        id: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.get_or_insert_with(Vec::new).push(AttributeState {
            id: id.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_sub_patch(mut self, sub_patch: PatchDef) -> Self {
        self.sub_patch = Some(sub_patch);
        self
    }
}

/// Persisted attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeState {
    pub id: String,
    pub value: AttributeValue,
}

/// Serializable connection, addressed by module ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDef {
    pub source: String,
    pub source_output: PortIndex,
    pub destination: String,
    /// `-1` on the wire for the root destination
    pub destination_input: InputIndex,
}

impl ConnectionDef {
    pub fn new(
        source: impl Into<String>,
        source_output: PortIndex,
        destination: impl Into<String>,
        destination_input: impl Into<InputIndex>,
    ) -> Self {
        Self {
            source: source.into(),
            source_output,
            destination: destination.into(),
            destination_input: destination_input.into(),
        }
    }
}

/// Check a definition against a registry without touching any graph
///
/// Every module type must be known, ids must be unique within their patch,
/// nested patches may only hang off subpatch modules and every connection
/// must name modules of its own patch on ports they have. The definition is
/// checked as a root patch, so `-1` inputs on output proxies are accepted.
pub fn validate_def(
    def: &PatchDef,
    registry: &ModuleRegistry,
    separator: char,
) -> Result<(), PatchError> {
    validate_patch_def(def, registry, separator, true)
}

fn validate_patch_def(
    def: &PatchDef,
    registry: &ModuleRegistry,
    separator: char,
    is_root: bool,
) -> Result<(), PatchError> {
    // id -> (proxy kind, input count, output count)
    let mut ports: HashMap<&str, (Option<ProxyKind>, PortIndex, PortIndex)> = HashMap::new();
    for module in &def.modules {
        let type_id = module_type(&module.id, separator)?;
        let definition = registry
            .get(type_id)
            .ok_or_else(|| PatchError::UnknownModuleType(type_id.to_string()))?;

        if ports.contains_key(module.id.as_str()) {
            return Err(PatchError::DuplicateModuleId(module.id.clone()));
        }

        if let Some(sub_patch) = &module.sub_patch {
            if definition.proxy_kind() != Some(ProxyKind::Subpatch) {
                return Err(PatchError::InvalidSnapshot(format!(
                    "{} is not a subpatch but carries one",
                    module.id
                )));
            }
            validate_patch_def(sub_patch, registry, separator, false)?;
        }

        let inputs = match definition.input_count() {
            Some(count) => count,
            None => proxy_count(module.sub_patch.as_ref(), registry, separator, ProxyKind::Input),
        };
        let outputs = match definition.output_count() {
            Some(count) => count,
            None => proxy_count(module.sub_patch.as_ref(), registry, separator, ProxyKind::Output),
        };
        ports.insert(module.id.as_str(), (definition.proxy_kind(), inputs, outputs));
    }

    for connection in &def.connections {
        let (_, _, outputs) = ports
            .get(connection.source.as_str())
            .ok_or_else(|| PatchError::ModuleNotFound(connection.source.clone()))?;
        let (kind, inputs, _) = ports
            .get(connection.destination.as_str())
            .ok_or_else(|| PatchError::ModuleNotFound(connection.destination.clone()))?;

        if connection.source_output >= *outputs {
            return Err(PatchError::InvalidPortIndex {
                module: connection.source.clone(),
                index: i64::from(connection.source_output),
            });
        }
        let valid = match connection.destination_input {
            InputIndex::Port(input) => input < *inputs,
            InputIndex::RootDestination => is_root && *kind == Some(ProxyKind::Output),
        };
        if !valid {
            return Err(PatchError::InvalidPortIndex {
                module: connection.destination.clone(),
                index: i64::from(connection.destination_input),
            });
        }
    }
    Ok(())
}

fn module_type(id: &str, separator: char) -> Result<&str, PatchError> {
    split_module_id(id, separator)
        .map(|(type_id, _)| type_id)
        .ok_or_else(|| PatchError::InvalidSnapshot(format!("malformed module id: {}", id)))
}

/// Ports a loaded subpatch will have: one per proxy of `kind` inside it
fn proxy_count(
    sub_patch: Option<&PatchDef>,
    registry: &ModuleRegistry,
    separator: char,
    kind: ProxyKind,
) -> PortIndex {
    sub_patch
        .map(|def| {
            def.modules
                .iter()
                .filter_map(|m| module_type(&m.id, separator).ok())
                .filter_map(|type_id| registry.get(type_id))
                .filter(|definition| definition.proxy_kind() == Some(kind))
                .count() as PortIndex
        })
        .unwrap_or(0)
}

impl<E: AudioEngine> Graph<E> {
    /// Convert a patch (and everything nested in it) to a serializable definition
    pub fn to_def(&self, patch: PatchId) -> Result<PatchDef, PatchError> {
        let tree = self.tree();
        let patch_data = tree.patch(patch).ok_or(PatchError::PatchNotFound)?;

        let modules = patch_data
            .modules()
            .iter()
            .map(|&key| self.module_def(patch, key))
            .collect::<Result<Vec<_>, _>>()?;

        let connections = patch_data
            .connections()
            .iter()
            .filter_map(|&id| tree.wire(id))
            .collect();

        Ok(PatchDef {
            modules,
            connections,
        })
    }

    fn module_def(&self, patch: PatchId, key: ModuleKey) -> Result<ModuleDef, PatchError> {
        let module = self.tree().module(key).ok_or(PatchError::PatchNotFound)?;

        let attributes: Vec<AttributeState> = module
            .attributes()
            .map(|(id, stored)| AttributeState {
                id: id.to_string(),
                value: self
                    .parameter(patch, module.id(), id)
                    .unwrap_or_else(|| stored.clone()),
            })
            .collect();

        let sub_patch = match module.child_patch() {
            Some(child) => Some(self.to_def(child)?),
            None => None,
        };

        Ok(ModuleDef {
            id: module.id().to_string(),
            pos: module.position(),
            args: module.args().to_vec(),
            attributes: (!attributes.is_empty()).then_some(attributes),
            sub_patch,
        })
    }

    /// Definition of the whole tree
    pub fn snapshot(&self) -> Result<PatchDef, PatchError> {
        self.to_def(self.root())
    }

    pub fn to_json(&self) -> Result<String, PatchError> {
        self.snapshot()?
            .to_json()
            .map_err(|e| PatchError::InvalidSnapshot(e.to_string()))
    }

    /// Load a definition into an existing patch
    ///
    /// The definition is validated first. If restoring still fails part way
    /// through, every module added by this call is removed again.
    pub fn load_def(&mut self, patch: PatchId, def: &PatchDef) -> Result<(), PatchError> {
        let is_root = self.tree().is_root(patch);
        validate_patch_def(def, self.registry(), self.config().id_separator, is_root)?;

        let before: HashSet<ModuleKey> = self
            .tree()
            .patch(patch)
            .ok_or(PatchError::PatchNotFound)?
            .modules()
            .iter()
            .copied()
            .collect();

        if let Err(err) = self.load_def_into(patch, def) {
            let added: Vec<ModuleKey> = self
                .tree()
                .patch(patch)
                .map(|p| p.modules().iter().copied().filter(|k| !before.contains(k)).collect())
                .unwrap_or_default();
            for key in added.into_iter().rev() {
                if let Err(rollback) = self.remove_module_by_key(patch, key) {
                    warn!(%rollback, "failed to roll back partially loaded module");
                }
            }
            return Err(err);
        }

        info!(modules = def.module_count(), connections = def.connections.len(), "patch loaded");
        Ok(())
    }

    /// Restore modules first, then replay connections
    pub(crate) fn load_def_into(
        &mut self,
        patch: PatchId,
        def: &PatchDef,
    ) -> Result<(), PatchError> {
        let separator = self.config().id_separator;
        for module in &def.modules {
            let type_id = module_type(&module.id, separator)?.to_string();
            self.insert_module(patch, &type_id, module.args.clone(), Some(module))?;
        }

        for connection in &def.connections {
            self.connect_wire(patch, connection)?;
        }
        Ok(())
    }

    /// Replace the whole tree with a definition
    ///
    /// Nothing is cleared if the definition does not validate. If loading
    /// fails after the clear (a backend refusing a node, say), the previous
    /// tree is loaded back before the error is returned.
    pub fn restore(&mut self, def: &PatchDef) -> Result<(), PatchError> {
        validate_def(def, self.registry(), self.config().id_separator)?;
        let previous = self.snapshot()?;
        let root = self.root();
        self.clear(root)?;
        info!("root patch cleared for restore");

        if let Err(err) = self.load_def(root, def) {
            warn!(%err, "restore failed, reloading previous patch");
            if let Err(reload) = self.load_def(root, &previous) {
                error!(%reload, "failed to reload previous patch");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Replace the whole tree with a JSON snapshot
    pub fn load_json(&mut self, json: &str) -> Result<(), PatchError> {
        let def =
            PatchDef::from_json(json).map_err(|e| PatchError::InvalidSnapshot(e.to_string()))?;
        self.restore(&def)
    }
}
