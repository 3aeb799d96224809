//! Patch Graph
//!
//! The hierarchical logical graph. A [`PatchTree`] owns every patch, module
//! and connection in flat arenas; ownership still forms a tree because each
//! patch records the subpatch module that owns it and each subpatch module
//! owns exactly one child patch.
//!
//! All mutation goes through [`Graph`], which emits a [`PatchEvent`] for every
//! structural change and lets the root coordinator mirror it onto the audio
//! engine before the event reaches the presentation layer.

use crate::config::GraphConfig;
use crate::coordinator::RootCoordinator;
use crate::engine::{AudioEngine, EngineError, NodeHandle};
use crate::event::{EventLog, Notification, PatchEvent, PatchEventKind};
use crate::port::{AttributeValue, InputIndex, PortIndex};
use crate::registry::{
    ModuleDefinition, ModuleKind, ModuleRegistry, ProxyKind, INPUT_TYPE, OUTPUT_TYPE,
};
use crate::serialize::{ConnectionDef, ModuleDef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

new_key_type! {
    /// Identity of one patch level in the tree
    pub struct PatchId;
    /// Identity of a module, stable for its whole lifetime
    pub struct ModuleKey;
    /// Identity of a logical connection
    pub struct ConnectionId;
}

/// Error types for patch operations
#[derive(Debug, Clone, PartialEq)]
pub enum PatchError {
    UnknownModuleType(String),
    ModuleNotFound(String),
    ConnectionNotFound,
    InvalidPortIndex { module: String, index: i64 },
    UnsupportedBackendOperation(String),
    PatchNotFound,
    DuplicateModuleId(String),
    UnknownParameter { module: String, parameter: String },
    InvalidParameterValue { module: String, parameter: String },
    InvalidSnapshot(String),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::UnknownModuleType(t) => write!(f, "Unknown module type: {}", t),
            PatchError::ModuleNotFound(id) => write!(f, "Module not found: {}", id),
            PatchError::ConnectionNotFound => write!(f, "Connection not found"),
            PatchError::InvalidPortIndex { module, index } => {
                write!(f, "Invalid port index {} on {}", index, module)
            }
            PatchError::UnsupportedBackendOperation(msg) => {
                write!(f, "Unsupported backend operation: {}", msg)
            }
            PatchError::PatchNotFound => write!(f, "Patch not found"),
            PatchError::DuplicateModuleId(id) => write!(f, "Duplicate module id: {}", id),
            PatchError::UnknownParameter { module, parameter } => {
                write!(f, "Unknown parameter {} on {}", parameter, module)
            }
            PatchError::InvalidParameterValue { module, parameter } => {
                write!(f, "Invalid value for parameter {} on {}", parameter, module)
            }
            PatchError::InvalidSnapshot(msg) => write!(f, "Invalid snapshot: {}", msg),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<EngineError> for PatchError {
    fn from(e: EngineError) -> Self {
        PatchError::UnsupportedBackendOperation(e.to_string())
    }
}

/// Editor position of a module
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Variant-specific state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleBody {
    /// Backend node, present once the root is attached to an engine
    Native { node: Option<NodeHandle> },
    Input,
    Output,
    /// Owns exactly one child patch
    Subpatch { child: PatchId },
}

/// A node in the logical graph
#[derive(Debug, Clone)]
pub struct Module {
    id: String,
    definition: Arc<ModuleDefinition>,
    patch: PatchId,
    args: Vec<Value>,
    attributes: Vec<(String, AttributeValue)>,
    position: Option<Position>,
    body: ModuleBody,
}

impl Module {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_id(&self) -> &str {
        &self.definition.type_id
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    /// The patch this module lives in
    pub fn patch(&self) -> PatchId {
        self.patch
    }

    /// Constructor arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn body(&self) -> ModuleBody {
        self.body
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, ModuleBody::Native { .. })
    }

    pub fn proxy_kind(&self) -> Option<ProxyKind> {
        match self.body {
            ModuleBody::Native { .. } => None,
            ModuleBody::Input => Some(ProxyKind::Input),
            ModuleBody::Output => Some(ProxyKind::Output),
            ModuleBody::Subpatch { .. } => Some(ProxyKind::Subpatch),
        }
    }

    pub fn node(&self) -> Option<NodeHandle> {
        match self.body {
            ModuleBody::Native { node } => node,
            _ => None,
        }
    }

    pub fn child_patch(&self) -> Option<PatchId> {
        match self.body {
            ModuleBody::Subpatch { child } => Some(child),
            _ => None,
        }
    }

    /// Stored value of an attribute
    pub fn attribute(&self, id: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == id)
            .map(|(_, value)| value)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(id, v)| (id.as_str(), v))
    }

    pub(crate) fn set_node(&mut self, handle: Option<NodeHandle>) {
        if let ModuleBody::Native { node } = &mut self.body {
            *node = handle;
        }
    }

    /// Store a value, returning the previous one
    fn store_attribute(&mut self, id: &str, value: AttributeValue) -> Option<AttributeValue> {
        match self.attributes.iter_mut().find(|(attr, _)| attr == id) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.attributes.push((id.to_string(), value));
                None
            }
        }
    }

    fn restore_attribute(&mut self, id: &str, previous: Option<AttributeValue>) {
        match previous {
            Some(value) => {
                self.store_attribute(id, value);
            }
            None => self.attributes.retain(|(attr, _)| attr != id),
        }
    }
}

/// A directed logical edge between two modules of the same patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    patch: PatchId,
    source: ModuleKey,
    source_output: PortIndex,
    destination: ModuleKey,
    destination_input: InputIndex,
}

impl Connection {
    pub fn patch(&self) -> PatchId {
        self.patch
    }

    pub fn source(&self) -> ModuleKey {
        self.source
    }

    pub fn source_output(&self) -> PortIndex {
        self.source_output
    }

    pub fn destination(&self) -> ModuleKey {
        self.destination
    }

    pub fn destination_input(&self) -> InputIndex {
        self.destination_input
    }

    pub fn touches(&self, module: ModuleKey) -> bool {
        self.source == module || self.destination == module
    }
}

/// One level of the hierarchy
#[derive(Debug, Clone, Default)]
pub struct Patch {
    modules: Vec<ModuleKey>,
    connections: Vec<ConnectionId>,
    parent: Option<ModuleKey>,
    counts_by_type: HashMap<String, u32>,
}

impl Patch {
    /// Modules in insertion order
    pub fn modules(&self) -> &[ModuleKey] {
        &self.modules
    }

    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    /// The subpatch module owning this patch, `None` for the root
    pub fn parent_module(&self) -> Option<ModuleKey> {
        self.parent
    }

    /// Last ordinal handed out for a module type
    pub fn count_for(&self, type_id: &str) -> u32 {
        self.counts_by_type.get(type_id).copied().unwrap_or(0)
    }
}

/// Arena storage for the whole patch hierarchy
#[derive(Debug, Clone)]
pub struct PatchTree {
    patches: SlotMap<PatchId, Patch>,
    modules: SlotMap<ModuleKey, Module>,
    connections: SlotMap<ConnectionId, Connection>,
    root: PatchId,
}

impl PatchTree {
    pub fn new() -> Self {
        let mut patches = SlotMap::with_key();
        let root = patches.insert(Patch::default());
        Self {
            patches,
            modules: SlotMap::with_key(),
            connections: SlotMap::with_key(),
            root,
        }
    }

    pub fn root(&self) -> PatchId {
        self.root
    }

    pub fn is_root(&self, patch: PatchId) -> bool {
        patch == self.root
    }

    pub fn patch(&self, patch: PatchId) -> Option<&Patch> {
        self.patches.get(patch)
    }

    pub fn module(&self, key: ModuleKey) -> Option<&Module> {
        self.modules.get(key)
    }

    pub(crate) fn module_mut(&mut self, key: ModuleKey) -> Option<&mut Module> {
        self.modules.get_mut(key)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Modules across the whole tree
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Connections across the whole tree
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn module_by_id(&self, patch: PatchId, id: &str) -> Option<ModuleKey> {
        self.patches
            .get(patch)?
            .modules
            .iter()
            .copied()
            .find(|&key| self.modules.get(key).is_some_and(|m| m.id == id))
    }

    pub fn modules_by_type(&self, patch: PatchId, type_id: &str) -> Vec<ModuleKey> {
        self.modules_where(patch, |m| m.type_id() == type_id)
    }

    /// Input proxies of a patch; their order numbers the owning subpatch's inputs
    pub fn inputs(&self, patch: PatchId) -> Vec<ModuleKey> {
        self.modules_where(patch, |m| m.body == ModuleBody::Input)
    }

    /// Output proxies of a patch; their order numbers the owning subpatch's outputs
    pub fn outputs(&self, patch: PatchId) -> Vec<ModuleKey> {
        self.modules_where(patch, |m| m.body == ModuleBody::Output)
    }

    pub fn subpatch_modules(&self, patch: PatchId) -> Vec<ModuleKey> {
        self.modules_where(patch, |m| m.child_patch().is_some())
    }

    fn modules_where(&self, patch: PatchId, predicate: impl Fn(&Module) -> bool) -> Vec<ModuleKey> {
        self.patches
            .get(patch)
            .map(|p| {
                p.modules
                    .iter()
                    .copied()
                    .filter(|&key| self.modules.get(key).is_some_and(&predicate))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Connections from or to a module, in its own patch
    pub fn connections_for_module(&self, key: ModuleKey) -> Vec<ConnectionId> {
        let Some(module) = self.modules.get(key) else {
            return Vec::new();
        };
        self.patch_connections(module.patch)
            .filter(|(_, c)| c.touches(key))
            .map(|(id, _)| id)
            .collect()
    }

    /// Connections of a patch and of every patch nested below it
    pub fn connections_with_nested(&self, patch: PatchId) -> Vec<ConnectionId> {
        let mut result: Vec<ConnectionId> = self
            .patches
            .get(patch)
            .map(|p| p.connections.clone())
            .unwrap_or_default();

        for key in self.subpatch_modules(patch) {
            if let Some(child) = self.modules[key].child_patch() {
                result.extend(self.connections_with_nested(child));
            }
        }
        result
    }

    pub(crate) fn patch_connections(
        &self,
        patch: PatchId,
    ) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.patches
            .get(patch)
            .into_iter()
            .flat_map(|p| p.connections.iter())
            .filter_map(|&id| self.connections.get(id).map(|c| (id, c)))
    }

    /// The patch enclosing the subpatch that owns `patch`
    pub fn parent_patch(&self, patch: PatchId) -> Option<PatchId> {
        let parent = self.patches.get(patch)?.parent?;
        self.modules.get(parent).map(|m| m.patch)
    }

    /// Ids of the enclosing subpatch modules, outermost first
    pub fn parent_path(&self, patch: PatchId) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self.patches.get(patch).and_then(|p| p.parent);
        while let Some(key) = current {
            let Some(module) = self.modules.get(key) else {
                break;
            };
            path.push(module.id.clone());
            current = self.patches.get(module.patch).and_then(|p| p.parent);
        }
        path.reverse();
        path
    }

    /// Resolve a separator-joined list of subpatch ids starting at the root
    pub fn patch_at_path(&self, path: &str, separator: char) -> Option<PatchId> {
        let mut patch = self.root;
        for id in path.split(separator).filter(|s| !s.is_empty()) {
            let key = self.module_by_id(patch, id)?;
            patch = self.modules[key].child_patch()?;
        }
        Some(patch)
    }

    /// Position of an input or output proxy among its siblings of the same kind
    pub fn proxy_port(&self, key: ModuleKey) -> Option<PortIndex> {
        let module = self.modules.get(key)?;
        let siblings = match module.body {
            ModuleBody::Input => self.inputs(module.patch),
            ModuleBody::Output => self.outputs(module.patch),
            _ => return None,
        };
        siblings
            .iter()
            .position(|&k| k == key)
            .map(|p| p as PortIndex)
    }

    pub fn input_count(&self, key: ModuleKey) -> PortIndex {
        let Some(module) = self.modules.get(key) else {
            return 0;
        };
        match module.body {
            ModuleBody::Subpatch { child } => self.inputs(child).len() as PortIndex,
            _ => module.definition.input_count().unwrap_or(0),
        }
    }

    pub fn output_count(&self, key: ModuleKey) -> PortIndex {
        let Some(module) = self.modules.get(key) else {
            return 0;
        };
        match module.body {
            ModuleBody::Subpatch { child } => self.outputs(child).len() as PortIndex,
            _ => module.definition.output_count().unwrap_or(0),
        }
    }

    /// Persisted form of a connection, addressed by module ids
    pub fn wire(&self, id: ConnectionId) -> Option<ConnectionDef> {
        let connection = self.connections.get(id)?;
        Some(ConnectionDef {
            source: self.modules.get(connection.source)?.id.clone(),
            source_output: connection.source_output,
            destination: self.modules.get(connection.destination)?.id.clone(),
            destination_input: connection.destination_input,
        })
    }

    /// Find a connection in a patch by its persisted form
    pub fn find_connection(&self, patch: PatchId, wire: &ConnectionDef) -> Option<ConnectionId> {
        self.patch_connections(patch)
            .find(|(id, _)| self.wire(*id).as_ref() == Some(wire))
            .map(|(id, _)| id)
    }

    fn validate_ports(
        &self,
        patch: PatchId,
        source: ModuleKey,
        source_output: PortIndex,
        destination: ModuleKey,
        destination_input: InputIndex,
    ) -> Result<(), PatchError> {
        if source_output >= self.output_count(source) {
            return Err(PatchError::InvalidPortIndex {
                module: self.modules[source].id.clone(),
                index: i64::from(source_output),
            });
        }

        let valid = match destination_input {
            InputIndex::Port(input) => input < self.input_count(destination),
            InputIndex::RootDestination => {
                self.modules[destination].body == ModuleBody::Output && self.is_root(patch)
            }
        };
        if !valid {
            return Err(PatchError::InvalidPortIndex {
                module: self.modules[destination].id.clone(),
                index: i64::from(destination_input),
            });
        }
        Ok(())
    }
}

impl Default for PatchTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull the ordinal out of a `<type><separator><ordinal>` id
pub(crate) fn split_module_id(id: &str, separator: char) -> Option<(&str, u32)> {
    let (type_id, ordinal) = id.rsplit_once(separator)?;
    let ordinal = ordinal.parse().ok()?;
    (!type_id.is_empty()).then_some((type_id, ordinal))
}

/// Connection on a subpatch port that has to move when a proxy goes away
struct ShiftedWire {
    wire: ConnectionDef,
    proxy: ProxyKind,
}

/// The root of a patch hierarchy and the entry point for every command
pub struct Graph<E: AudioEngine> {
    tree: PatchTree,
    registry: ModuleRegistry,
    config: GraphConfig,
    coordinator: Option<RootCoordinator<E>>,
    events: EventLog,
}

impl<E: AudioEngine> Graph<E> {
    /// Create an empty graph mirrored onto `engine`
    pub fn new(registry: ModuleRegistry, engine: E) -> Self {
        Self::with_config(registry, Some(engine), GraphConfig::default())
    }

    /// Create an empty graph with no engine attached
    pub fn detached(registry: ModuleRegistry) -> Self {
        Self::with_config(registry, None, GraphConfig::default())
    }

    pub fn with_config(registry: ModuleRegistry, engine: Option<E>, config: GraphConfig) -> Self {
        Self {
            tree: PatchTree::new(),
            registry,
            events: EventLog::new(config.max_pending_events),
            coordinator: engine.map(|e| RootCoordinator::new(e, config.release_nodes)),
            config,
        }
    }

    pub fn tree(&self) -> &PatchTree {
        &self.tree
    }

    pub fn root(&self) -> PatchId {
        self.tree.root()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.coordinator.is_some()
    }

    pub fn engine(&self) -> Option<&E> {
        self.coordinator.as_ref().map(|c| c.engine())
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        self.coordinator.as_mut().map(|c| c.engine_mut())
    }

    /// Look up a module by id within a patch
    pub fn module(&self, patch: PatchId, id: &str) -> Option<&Module> {
        self.tree
            .module_by_id(patch, id)
            .and_then(|key| self.tree.module(key))
    }

    /// Resolve a nested patch from a path of subpatch ids (empty path: root)
    pub fn patch_at_path(&self, path: &str) -> Option<PatchId> {
        self.tree.patch_at_path(path, self.config.path_separator)
    }

    /// The path that [`Graph::patch_at_path`] resolves back to `patch`
    pub fn path_of(&self, patch: PatchId) -> String {
        let separator = self.config.path_separator.to_string();
        self.tree.parent_path(patch).join(separator.as_str())
    }

    /// Drain queued notifications, oldest first
    pub fn drain_events(&mut self) -> Vec<Notification> {
        self.events.drain()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    fn dispatch(&mut self, patch: PatchId, kind: PatchEventKind) -> Result<(), PatchError> {
        let event = PatchEvent { patch, kind };
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.handle(&mut self.tree, &event, &mut self.events)?;
        }
        self.events.push(Notification::Patch(event));
        Ok(())
    }

    fn require_patch(&self, patch: PatchId) -> Result<&Patch, PatchError> {
        self.tree.patch(patch).ok_or(PatchError::PatchNotFound)
    }

    fn require_module(&self, patch: PatchId, id: &str) -> Result<ModuleKey, PatchError> {
        self.require_patch(patch)?;
        self.tree
            .module_by_id(patch, id)
            .ok_or_else(|| PatchError::ModuleNotFound(id.to_string()))
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// Add a module of `type_id`; its id is `<type>_<next ordinal>`
    pub fn add_module(
        &mut self,
        patch: PatchId,
        type_id: &str,
        args: Vec<Value>,
    ) -> Result<ModuleKey, PatchError> {
        self.insert_module(patch, type_id, args, None)
    }

    pub(crate) fn insert_module(
        &mut self,
        patch: PatchId,
        type_id: &str,
        args: Vec<Value>,
        loaded: Option<&ModuleDef>,
    ) -> Result<ModuleKey, PatchError> {
        let definition = match self.registry.get(type_id) {
            Some(definition) => Arc::clone(definition),
            None => {
                error!(type_id, "no module definition found");
                return Err(PatchError::UnknownModuleType(type_id.to_string()));
            }
        };

        let separator = self.config.id_separator;
        let previous_count = self.require_patch(patch)?.counts_by_type.get(type_id).copied();
        let ordinal = previous_count.unwrap_or(0) + 1;
        let (id, counter) = match loaded {
            Some(def) => {
                let restored = split_module_id(&def.id, separator).map_or(0, |(_, o)| o);
                (def.id.clone(), ordinal.max(restored))
            }
            None => (format!("{}{}{}", type_id, separator, ordinal), ordinal),
        };
        if self.tree.module_by_id(patch, &id).is_some() {
            return Err(PatchError::DuplicateModuleId(id));
        }

        let body = match definition.kind {
            ModuleKind::Native { .. } => ModuleBody::Native { node: None },
            ModuleKind::Proxy(ProxyKind::Input) => ModuleBody::Input,
            ModuleKind::Proxy(ProxyKind::Output) => ModuleBody::Output,
            ModuleKind::Proxy(ProxyKind::Subpatch) => ModuleBody::Subpatch {
                child: self.tree.patches.insert(Patch::default()),
            },
        };

        let attributes = definition
            .attributes
            .iter()
            .filter_map(|a| a.default_value().map(|v| (a.id.clone(), v)))
            .collect();

        let key = self.tree.modules.insert(Module {
            id: id.clone(),
            definition,
            patch,
            args: args.clone(),
            attributes,
            position: loaded.and_then(|def| def.pos),
            body,
        });
        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.counts_by_type.insert(type_id.to_string(), counter);
            patch_data.modules.push(key);
        }

        if let ModuleBody::Subpatch { child } = body {
            if let Some(p) = self.tree.patches.get_mut(child) {
                p.parent = Some(key);
            }

            let populated = match loaded {
                Some(def) => match &def.sub_patch {
                    Some(sub) => self.load_def_into(child, sub),
                    None => Ok(()),
                },
                None if self.config.seed_subpatch_ports => self.seed_subpatch(child),
                None => Ok(()),
            };
            if let Err(err) = populated {
                self.discard_module(patch, key, type_id, previous_count);
                return Err(err);
            }
        }

        // The coordinator creates the backend node here
        if let Err(err) = self.dispatch(
            patch,
            PatchEventKind::ModuleAdded {
                module: key,
                id,
                args,
            },
        ) {
            self.discard_module(patch, key, type_id, previous_count);
            return Err(err);
        }

        // Loaded values go in once a node exists to receive them
        if let Some(def) = loaded {
            self.apply_loaded_attributes(patch, key, def)?;
        }

        Ok(key)
    }

    fn seed_subpatch(&mut self, child: PatchId) -> Result<(), PatchError> {
        self.add_module(child, INPUT_TYPE, Vec::new())?;
        self.add_module(child, OUTPUT_TYPE, Vec::new())?;
        Ok(())
    }

    /// Undo a module whose construction failed before it was announced
    fn discard_module(
        &mut self,
        patch: PatchId,
        key: ModuleKey,
        type_id: &str,
        previous_count: Option<u32>,
    ) {
        if let Some(child) = self.tree.modules.get(key).and_then(|m| m.child_patch()) {
            if let Err(err) = self.clear(child) {
                warn!(%err, "failed to clear partially built subpatch");
            }
            self.tree.patches.remove(child);
        }

        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.modules.retain(|&k| k != key);
            match previous_count {
                Some(count) => patch_data.counts_by_type.insert(type_id.to_string(), count),
                None => patch_data.counts_by_type.remove(type_id),
            };
        }
        self.tree.modules.remove(key);
    }

    fn apply_loaded_attributes(
        &mut self,
        patch: PatchId,
        key: ModuleKey,
        def: &ModuleDef,
    ) -> Result<(), PatchError> {
        for state in def.attributes.iter().flatten() {
            match self.set_parameter_by_key(patch, key, &state.id, state.value.clone()) {
                Ok(()) => {}
                Err(
                    err @ (PatchError::UnknownParameter { .. }
                    | PatchError::InvalidParameterValue { .. }),
                ) => {
                    warn!(module = %def.id, %err, "skipping loaded attribute");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Remove a module, its connections and (for subpatches) everything nested in it
    pub fn remove_module(&mut self, patch: PatchId, id: &str) -> Result<(), PatchError> {
        let key = match self.require_module(patch, id) {
            Ok(key) => key,
            Err(err) => {
                error!(id, "module not found");
                return Err(err);
            }
        };
        self.remove_module_by_key(patch, key)
    }

    pub(crate) fn remove_module_by_key(
        &mut self,
        patch: PatchId,
        key: ModuleKey,
    ) -> Result<(), PatchError> {
        let shifted = self.detach_proxy_port(key)?;

        for connection in self.tree.connections_for_module(key) {
            self.remove_connection(connection)?;
        }

        let (id, child) = {
            let module = &self.tree.modules[key];
            (module.id.clone(), module.child_patch())
        };
        if let Some(child) = child {
            self.clear(child)?;
        }

        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.modules.retain(|&k| k != key);
        }

        // Listeners still see the module while handling the removal
        self.dispatch(patch, PatchEventKind::ModuleRemoved { module: key, id })?;

        if let Some(child) = child {
            self.tree.patches.remove(child);
        }
        self.tree.modules.remove(key);

        self.reattach_shifted(patch, shifted)
    }

    /// Free the enclosing subpatch port of an input/output proxy about to be removed
    ///
    /// Connections on the proxy's own port are removed. Connections on higher
    /// ports are removed too and returned, to be re-added one port lower once
    /// the proxy is gone.
    fn detach_proxy_port(&mut self, key: ModuleKey) -> Result<Vec<ShiftedWire>, PatchError> {
        let module = &self.tree.modules[key];
        let proxy = match module.body {
            ModuleBody::Input => ProxyKind::Input,
            ModuleBody::Output => ProxyKind::Output,
            _ => return Ok(Vec::new()),
        };
        let Some(owner) = self.tree.patches.get(module.patch).and_then(|p| p.parent) else {
            return Ok(Vec::new());
        };
        let Some(port) = self.tree.proxy_port(key) else {
            return Ok(Vec::new());
        };
        let outer = self.tree.modules[owner].patch;

        let affected: Vec<(ConnectionId, PortIndex)> = self
            .tree
            .patch_connections(outer)
            .filter_map(|(id, c)| match proxy {
                ProxyKind::Input if c.destination == owner => {
                    c.destination_input.port().map(|p| (id, p))
                }
                ProxyKind::Output if c.source == owner => Some((id, c.source_output)),
                _ => None,
            })
            .filter(|&(_, p)| p >= port)
            .collect();

        let mut shifted = Vec::new();
        for (id, p) in affected {
            let wire = self.tree.wire(id);
            self.remove_connection(id)?;
            if p > port {
                if let Some(wire) = wire {
                    shifted.push(ShiftedWire { wire, proxy });
                }
            }
        }
        Ok(shifted)
    }

    fn reattach_shifted(
        &mut self,
        patch: PatchId,
        shifted: Vec<ShiftedWire>,
    ) -> Result<(), PatchError> {
        let Some(outer) = self.tree.parent_patch(patch) else {
            return Ok(());
        };
        for ShiftedWire { wire, proxy } in shifted {
            let (source_output, destination_input) = match proxy {
                ProxyKind::Output => (wire.source_output - 1, wire.destination_input),
                _ => match wire.destination_input {
                    InputIndex::Port(p) => (wire.source_output, InputIndex::Port(p - 1)),
                    InputIndex::RootDestination => (wire.source_output, wire.destination_input),
                },
            };
            self.insert_connection(
                outer,
                &wire.source,
                source_output,
                &wire.destination,
                destination_input,
                false,
            )?;
        }
        Ok(())
    }

    /// Update a module's editor position
    pub fn set_position(
        &mut self,
        patch: PatchId,
        id: &str,
        position: Position,
    ) -> Result<(), PatchError> {
        let key = self.require_module(patch, id)?;
        if let Some(module) = self.tree.modules.get_mut(key) {
            module.position = Some(position);
        }
        Ok(())
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Set an attribute value and push it to the backend node, if any
    pub fn set_parameter(
        &mut self,
        patch: PatchId,
        id: &str,
        attribute: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<(), PatchError> {
        let key = self.require_module(patch, id)?;
        self.set_parameter_by_key(patch, key, attribute, value.into())
    }

    fn set_parameter_by_key(
        &mut self,
        patch: PatchId,
        key: ModuleKey,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<(), PatchError> {
        let module = &self.tree.modules[key];
        let id = module.id.clone();
        let Some(spec) = module.definition.attribute(attribute) else {
            return Err(PatchError::UnknownParameter {
                module: id,
                parameter: attribute.to_string(),
            });
        };

        if !spec.is_implemented() {
            warn!(module = %id, attribute, "attribute kind not implemented, value ignored");
            return Ok(());
        }

        let value = spec
            .coerce(value)
            .ok_or_else(|| PatchError::InvalidParameterValue {
                module: id.clone(),
                parameter: attribute.to_string(),
            })?;

        let previous = self.tree.modules[key].store_attribute(attribute, value.clone());
        let changed = self.dispatch(
            patch,
            PatchEventKind::ModuleParameterChanged {
                module: key,
                id,
                attribute: attribute.to_string(),
                value,
            },
        );
        if changed.is_err() {
            self.tree.modules[key].restore_attribute(attribute, previous);
        }
        changed
    }

    /// Current value of an attribute, read back from the backend when possible
    pub fn parameter(&self, patch: PatchId, id: &str, attribute: &str) -> Option<AttributeValue> {
        let module = self.module(patch, id)?;
        let stored = module.attribute(attribute).cloned();
        match (module.node(), self.engine()) {
            (Some(node), Some(engine)) => engine.get_param(node, attribute).or(stored),
            _ => stored,
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Connect `source:source_output` to `destination:destination_input`
    ///
    /// Identical connections are accepted; each one is tracked separately.
    pub fn add_connection(
        &mut self,
        patch: PatchId,
        source: &str,
        source_output: PortIndex,
        destination: &str,
        destination_input: PortIndex,
    ) -> Result<ConnectionId, PatchError> {
        self.insert_connection(
            patch,
            source,
            source_output,
            destination,
            InputIndex::Port(destination_input),
            false,
        )
    }

    /// Like [`Graph::add_connection`], announced as a reconnection
    pub fn add_reconnection(
        &mut self,
        patch: PatchId,
        source: &str,
        source_output: PortIndex,
        destination: &str,
        destination_input: PortIndex,
    ) -> Result<ConnectionId, PatchError> {
        self.insert_connection(
            patch,
            source,
            source_output,
            destination,
            InputIndex::Port(destination_input),
            true,
        )
    }

    /// Route a root-level output proxy to the engine's destination
    pub fn add_destination_connection(
        &mut self,
        source: &str,
        source_output: PortIndex,
        output: &str,
    ) -> Result<ConnectionId, PatchError> {
        let root = self.root();
        self.insert_connection(
            root,
            source,
            source_output,
            output,
            InputIndex::RootDestination,
            false,
        )
    }

    /// Add a connection from its persisted form
    pub fn connect_wire(
        &mut self,
        patch: PatchId,
        wire: &ConnectionDef,
    ) -> Result<ConnectionId, PatchError> {
        self.insert_connection(
            patch,
            &wire.source,
            wire.source_output,
            &wire.destination,
            wire.destination_input,
            false,
        )
    }

    pub(crate) fn insert_connection(
        &mut self,
        patch: PatchId,
        source: &str,
        source_output: PortIndex,
        destination: &str,
        destination_input: InputIndex,
        reconnect: bool,
    ) -> Result<ConnectionId, PatchError> {
        let source_key = self.require_module(patch, source)?;
        let destination_key = self.require_module(patch, destination)?;

        if let Err(err) = self.tree.validate_ports(
            patch,
            source_key,
            source_output,
            destination_key,
            destination_input,
        ) {
            error!(source, destination, %err, "rejected connection");
            return Err(err);
        }

        let id = self.tree.connections.insert(Connection {
            patch,
            source: source_key,
            source_output,
            destination: destination_key,
            destination_input,
        });
        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.connections.push(id);
        }

        let wire = ConnectionDef {
            source: source.to_string(),
            source_output,
            destination: destination.to_string(),
            destination_input,
        };
        if let Err(err) = self.dispatch(
            patch,
            PatchEventKind::ConnectionAdded {
                connection: id,
                wire,
                reconnect,
            },
        ) {
            if let Some(patch_data) = self.tree.patches.get_mut(patch) {
                patch_data.connections.retain(|&c| c != id);
            }
            self.tree.connections.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Remove a logical connection
    ///
    /// Backend rewiring happens in the pre-remove window while the connection
    /// is still part of the tree.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<(), PatchError> {
        let Some(connection) = self.tree.connections.get(id) else {
            error!("connection not found");
            return Err(PatchError::ConnectionNotFound);
        };
        let patch = connection.patch;
        let wire = self.tree.wire(id).ok_or(PatchError::ConnectionNotFound)?;

        self.dispatch(
            patch,
            PatchEventKind::ConnectionPreRemove {
                connection: id,
                wire: wire.clone(),
            },
        )?;

        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.connections.retain(|&c| c != id);
        }

        let removed = self.dispatch(
            patch,
            PatchEventKind::ConnectionPostRemove {
                connection: id,
                wire,
            },
        );
        self.tree.connections.remove(id);
        removed
    }

    /// Remove the first connection in `patch` matching `wire`
    pub fn disconnect(&mut self, patch: PatchId, wire: &ConnectionDef) -> Result<(), PatchError> {
        let id = self
            .tree
            .find_connection(patch, wire)
            .ok_or(PatchError::ConnectionNotFound)?;
        self.remove_connection(id)
    }

    // =========================================================================
    // Whole patches
    // =========================================================================

    /// Remove every module (last added first) and reset the id counters
    pub fn clear(&mut self, patch: PatchId) -> Result<(), PatchError> {
        let modules = self.require_patch(patch)?.modules.clone();
        for key in modules.into_iter().rev() {
            let still_present = self
                .tree
                .patches
                .get(patch)
                .is_some_and(|p| p.modules.contains(&key));
            if still_present {
                self.remove_module_by_key(patch, key)?;
            }
        }

        if let Some(patch_data) = self.tree.patches.get_mut(patch) {
            patch_data.counts_by_type.clear();
        }
        self.dispatch(patch, PatchEventKind::PatchCleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;
    use crate::registry::SUBPATCH_TYPE;

    fn detached() -> Graph<RecordingEngine> {
        Graph::detached(ModuleRegistry::new())
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "osc", vec![]).unwrap();
        assert!(graph.module(root, "osc_1").is_some());
        assert!(graph.module(root, "osc_2").is_some());

        graph.remove_module(root, "osc_1").unwrap();
        let key = graph.add_module(root, "osc", vec![]).unwrap();
        assert_eq!(graph.tree().module(key).unwrap().id(), "osc_3");
        assert!(graph.module(root, "osc_1").is_none());
    }

    #[test]
    fn test_unknown_type_leaves_graph_unchanged() {
        let mut graph = detached();
        let root = graph.root();
        let result = graph.add_module(root, "theremin", vec![]);
        assert_eq!(result, Err(PatchError::UnknownModuleType("theremin".into())));
        assert_eq!(graph.tree().module_count(), 0);
        assert_eq!(graph.tree().patch(root).unwrap().count_for("theremin"), 0);
    }

    #[test]
    fn test_subpatch_is_seeded_with_proxies() {
        let mut graph = detached();
        let root = graph.root();
        let key = graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = graph.tree().module(key).unwrap().child_patch().unwrap();

        assert_eq!(graph.tree().inputs(child).len(), 1);
        assert_eq!(graph.tree().outputs(child).len(), 1);
        assert!(graph.module(child, "input_1").is_some());
        assert!(graph.module(child, "output_1").is_some());
        assert_eq!(graph.tree().input_count(key), 1);
        assert_eq!(graph.tree().output_count(key), 1);
        assert_eq!(graph.tree().parent_patch(child), Some(root));
    }

    #[test]
    fn test_connection_validates_ports() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();

        assert!(graph.add_connection(root, "osc_1", 0, "gain_1", 0).is_ok());
        // gain param input
        assert!(graph.add_connection(root, "osc_1", 0, "gain_1", 1).is_ok());
        assert!(matches!(
            graph.add_connection(root, "osc_1", 1, "gain_1", 0),
            Err(PatchError::InvalidPortIndex { .. })
        ));
        assert!(matches!(
            graph.add_connection(root, "osc_1", 0, "gain_1", 2),
            Err(PatchError::InvalidPortIndex { .. })
        ));
        assert_eq!(
            graph.add_connection(root, "osc_1", 0, "nothing_1", 0),
            Err(PatchError::ModuleNotFound("nothing_1".into()))
        );
        assert_eq!(graph.tree().patch(root).unwrap().connections().len(), 2);
    }

    #[test]
    fn test_root_destination_sentinel_only_on_root_output() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "output", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        let sub = graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = graph.tree().module(sub).unwrap().child_patch().unwrap();

        assert!(graph.add_destination_connection("gain_1", 0, "output_1").is_ok());
        assert!(graph.add_destination_connection("output_1", 0, "gain_1").is_err());
        let nested = ConnectionDef::new("input_1", 0, "output_1", InputIndex::RootDestination);
        assert!(matches!(
            graph.connect_wire(child, &nested),
            Err(PatchError::InvalidPortIndex { index: -1, .. })
        ));
    }

    #[test]
    fn test_duplicate_connections_are_accepted() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        let a = graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        let b = graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(graph.tree().connection_count(), 2);
    }

    #[test]
    fn test_remove_module_cascades_connections() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "gain", vec![]).unwrap();
        graph.add_module(root, "delay", vec![]).unwrap();
        graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(root, "gain_1", 0, "delay_1", 0).unwrap();
        graph.drain_events();

        graph.remove_module(root, "gain_1").unwrap();
        assert_eq!(graph.tree().connection_count(), 0);

        let kinds: Vec<_> = graph
            .drain_events()
            .into_iter()
            .filter_map(|n| n.as_patch().map(|e| e.kind.clone()))
            .collect();
        assert!(matches!(kinds[0], PatchEventKind::ConnectionPreRemove { .. }));
        assert!(matches!(kinds[1], PatchEventKind::ConnectionPostRemove { .. }));
        assert!(matches!(kinds.last(), Some(PatchEventKind::ModuleRemoved { .. })));
    }

    #[test]
    fn test_remove_missing_module() {
        let mut graph = detached();
        let root = graph.root();
        assert_eq!(
            graph.remove_module(root, "osc_1"),
            Err(PatchError::ModuleNotFound("osc_1".into()))
        );
    }

    #[test]
    fn test_remove_subpatch_destroys_nested_patch() {
        let mut graph = detached();
        let root = graph.root();
        let sub = graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = graph.tree().module(sub).unwrap().child_patch().unwrap();
        graph.add_module(child, "gain", vec![]).unwrap();
        graph.add_connection(child, "input_1", 0, "gain_1", 0).unwrap();

        graph.remove_module(root, "subpatch_1").unwrap();
        assert_eq!(graph.tree().patch_count(), 1);
        assert_eq!(graph.tree().module_count(), 0);
        assert_eq!(graph.tree().connection_count(), 0);
        assert!(graph.tree().patch(child).is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();

        graph.clear(root).unwrap();
        graph.clear(root).unwrap();
        assert!(graph.tree().patch(root).unwrap().modules().is_empty());
        assert_eq!(graph.tree().module_count(), 0);

        // counters restart after a clear
        let key = graph.add_module(root, "osc", vec![]).unwrap();
        assert_eq!(graph.tree().module(key).unwrap().id(), "osc_1");
    }

    #[test]
    fn test_connections_never_dangle() {
        let mut graph = detached();
        let root = graph.root();
        for t in ["osc", "gain", "gain", "filter"] {
            graph.add_module(root, t, vec![]).unwrap();
        }
        graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
        graph.add_connection(root, "osc_1", 0, "gain_2", 1).unwrap();
        graph.add_connection(root, "gain_1", 0, "filter_1", 0).unwrap();
        graph.remove_module(root, "gain_1").unwrap();
        graph.remove_module(root, "osc_1").unwrap();

        let tree = graph.tree();
        let patch = tree.patch(root).unwrap();
        for &id in patch.connections() {
            let c = tree.connection(id).unwrap();
            assert!(patch.modules().contains(&c.source()));
            assert!(patch.modules().contains(&c.destination()));
        }
    }

    #[test]
    fn test_paths() {
        let mut graph = detached();
        let root = graph.root();
        let outer = graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let outer_patch = graph.tree().module(outer).unwrap().child_patch().unwrap();
        let inner = graph.add_module(outer_patch, SUBPATCH_TYPE, vec![]).unwrap();
        let inner_patch = graph.tree().module(inner).unwrap().child_patch().unwrap();

        assert_eq!(graph.path_of(inner_patch), "subpatch_1$subpatch_1");
        assert_eq!(graph.patch_at_path("subpatch_1$subpatch_1"), Some(inner_patch));
        assert_eq!(graph.patch_at_path(""), Some(root));
        assert_eq!(graph.patch_at_path("subpatch_2"), None);
        assert_eq!(
            graph.tree().parent_path(inner_patch),
            vec!["subpatch_1".to_string(), "subpatch_1".to_string()]
        );
    }

    #[test]
    fn test_set_parameter() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "osc", vec![]).unwrap();

        graph.set_parameter(root, "osc_1", "frequency", 220.0).unwrap();
        graph.set_parameter(root, "osc_1", "type", "square").unwrap();
        assert_eq!(
            graph.parameter(root, "osc_1", "frequency"),
            Some(AttributeValue::Number(220.0))
        );
        assert_eq!(graph.parameter(root, "osc_1", "type"), Some("square".into()));

        assert!(matches!(
            graph.set_parameter(root, "osc_1", "resonance", 1.0),
            Err(PatchError::UnknownParameter { .. })
        ));
        assert!(matches!(
            graph.set_parameter(root, "osc_1", "type", "noise"),
            Err(PatchError::InvalidParameterValue { .. })
        ));
    }

    #[test]
    fn test_custom_parameter_with_swapped_range() {
        use crate::port::AttributeSpec;

        let mut registry = ModuleRegistry::new();
        registry.register(
            ModuleDefinition::native("lfo", "createOscillator", 0, 1)
                .with_attribute(AttributeSpec::audio_param("depth", 0.0, 1.0, 0.0)),
        );
        let mut graph = Graph::new(registry, RecordingEngine::new());
        let root = graph.root();
        graph.add_module(root, "lfo", vec![]).unwrap();

        graph.set_parameter(root, "lfo_1", "depth", 0.5).unwrap();
        assert_eq!(
            graph.parameter(root, "lfo_1", "depth"),
            Some(AttributeValue::Number(0.5))
        );
        graph.set_parameter(root, "lfo_1", "depth", 4.0).unwrap();
        assert_eq!(
            graph.parameter(root, "lfo_1", "depth"),
            Some(AttributeValue::Number(1.0))
        );
    }

    #[test]
    fn test_buffer_attribute_is_a_diagnostic() {
        let mut graph = detached();
        let root = graph.root();
        graph.add_module(root, "convolver", vec![]).unwrap();
        assert!(graph
            .set_parameter(root, "convolver_1", "buffer", "impulse.wav")
            .is_ok());
        assert_eq!(graph.parameter(root, "convolver_1", "buffer"), None);
    }

    #[test]
    fn test_removing_proxy_shifts_higher_ports() {
        let mut graph = detached();
        let root = graph.root();
        let sub = graph.add_module(root, SUBPATCH_TYPE, vec![]).unwrap();
        let child = graph.tree().module(sub).unwrap().child_patch().unwrap();
        graph.add_module(child, INPUT_TYPE, vec![]).unwrap();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_module(root, "osc", vec![]).unwrap();
        graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
        graph.add_connection(root, "osc_2", 0, "subpatch_1", 1).unwrap();

        graph.remove_module(child, "input_1").unwrap();

        assert_eq!(graph.tree().input_count(sub), 1);
        let wires: Vec<_> = graph
            .tree()
            .patch(root)
            .unwrap()
            .connections()
            .iter()
            .filter_map(|&id| graph.tree().wire(id))
            .collect();
        assert_eq!(wires.len(), 1);
        assert_eq!(wires[0].source, "osc_2");
        assert_eq!(wires[0].destination_input, InputIndex::Port(0));
    }

    #[test]
    fn test_split_module_id() {
        assert_eq!(split_module_id("osc_12", '_'), Some(("osc", 12)));
        assert_eq!(split_module_id("my_gain_3", '_'), Some(("my_gain", 3)));
        assert_eq!(split_module_id("osc", '_'), None);
        assert_eq!(split_module_id("_3", '_'), None);
    }
}
