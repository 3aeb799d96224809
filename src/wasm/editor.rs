//! PatchworkEditor - Main WASM interface for editing a patch graph

use super::error::js_err;
use super::web_audio::WebAudioEngine;
use crate::config::GraphConfig;
use crate::graph::{Graph, PatchId, Position};
use crate::port::{AttributeValue, InputIndex, PortIndex};
use crate::registry::ModuleRegistry;
use crate::serialize::{ConnectionDef, PatchDef};
use serde_json::Value;
use wasm_bindgen::prelude::*;

/// Main WASM interface for the patch graph
///
/// Patches are addressed by the `$`-joined ids of the subpatch modules
/// leading to them; the empty string is the root.
#[wasm_bindgen]
pub struct PatchworkEditor {
    graph: Graph<WebAudioEngine>,
}

#[wasm_bindgen]
impl PatchworkEditor {
    /// Create an editor driving the given `AudioContext`
    #[wasm_bindgen(constructor)]
    pub fn new(context: JsValue) -> Self {
        // Initialize panic hook for better error messages
        console_error_panic_hook::set_once();

        Self {
            graph: Graph::new(ModuleRegistry::new(), WebAudioEngine::new(context)),
        }
    }

    /// Create an editor with a partial `GraphConfig` object
    pub fn with_config(context: JsValue, config: JsValue) -> Result<PatchworkEditor, JsValue> {
        console_error_panic_hook::set_once();

        let config: GraphConfig = serde_wasm_bindgen::from_value(config).map_err(js_err)?;
        Ok(Self {
            graph: Graph::with_config(
                ModuleRegistry::new(),
                Some(WebAudioEngine::new(context)),
                config,
            ),
        })
    }

    // =========================================================================
    // Catalog API
    // =========================================================================

    /// Get every registered module definition
    pub fn get_catalog(&self) -> Result<JsValue, JsValue> {
        let catalog: Vec<_> = self.graph.registry().list().collect();
        serde_wasm_bindgen::to_value(&catalog).map_err(js_err)
    }

    /// Get all display groups
    pub fn get_groups(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.graph.registry().groups()).map_err(js_err)
    }

    // =========================================================================
    // Module Management
    // =========================================================================

    /// Add a module; returns its generated id
    pub fn add_module(
        &mut self,
        path: &str,
        type_id: &str,
        args: JsValue,
    ) -> Result<String, JsValue> {
        let patch = self.patch(path)?;
        let args: Vec<Value> = if args.is_undefined() || args.is_null() {
            Vec::new()
        } else {
            serde_wasm_bindgen::from_value(args).map_err(js_err)?
        };

        let key = self.graph.add_module(patch, type_id, args).map_err(js_err)?;
        self.graph
            .tree()
            .module(key)
            .map(|m| m.id().to_string())
            .ok_or_else(|| js_err("module vanished after creation"))
    }

    pub fn remove_module(&mut self, path: &str, id: &str) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        self.graph.remove_module(patch, id).map_err(js_err)
    }

    pub fn set_module_position(
        &mut self,
        path: &str,
        id: &str,
        x: f64,
        y: f64,
    ) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        self.graph
            .set_position(patch, id, Position::new(x, y))
            .map_err(js_err)
    }

    /// Module ids of a patch in insertion order
    pub fn get_module_ids(&self, path: &str) -> Result<JsValue, JsValue> {
        let patch = self.patch(path)?;
        let tree = self.graph.tree();
        let ids: Vec<&str> = tree
            .patch(patch)
            .map(|p| {
                p.modules()
                    .iter()
                    .filter_map(|&key| tree.module(key).map(|m| m.id()))
                    .collect()
            })
            .unwrap_or_default();
        serde_wasm_bindgen::to_value(&ids).map_err(js_err)
    }

    /// Ids of the subpatch modules enclosing a patch, outermost first
    pub fn get_parent_path(&self, path: &str) -> Result<JsValue, JsValue> {
        let patch = self.patch(path)?;
        serde_wasm_bindgen::to_value(&self.graph.tree().parent_path(patch)).map_err(js_err)
    }

    pub fn module_count(&self) -> usize {
        self.graph.tree().module_count()
    }

    pub fn connection_count(&self) -> usize {
        self.graph.tree().connection_count()
    }

    /// Remove every module of a patch
    pub fn clear(&mut self, path: &str) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        self.graph.clear(patch).map_err(js_err)
    }

    // =========================================================================
    // Connection Management
    // =========================================================================

    /// Connect two modules; `destination_input` of -1 selects the audio destination
    pub fn connect(
        &mut self,
        path: &str,
        source: &str,
        source_output: PortIndex,
        destination: &str,
        destination_input: i32,
    ) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        let wire = wire(source, source_output, destination, destination_input)?;
        self.graph.connect_wire(patch, &wire).map_err(js_err)?;
        Ok(())
    }

    pub fn disconnect(
        &mut self,
        path: &str,
        source: &str,
        source_output: PortIndex,
        destination: &str,
        destination_input: i32,
    ) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        let wire = wire(source, source_output, destination, destination_input)?;
        self.graph.disconnect(patch, &wire).map_err(js_err)
    }

    /// Connections of a patch in persisted form
    pub fn get_connections(&self, path: &str) -> Result<JsValue, JsValue> {
        let patch = self.patch(path)?;
        let tree = self.graph.tree();
        let wires: Vec<ConnectionDef> = tree
            .patch(patch)
            .map(|p| p.connections().iter().filter_map(|&id| tree.wire(id)).collect())
            .unwrap_or_default();
        serde_wasm_bindgen::to_value(&wires).map_err(js_err)
    }

    // =========================================================================
    // Parameter Control
    // =========================================================================

    /// Set an attribute from a number or a string
    pub fn set_param(
        &mut self,
        path: &str,
        id: &str,
        attribute: &str,
        value: JsValue,
    ) -> Result<(), JsValue> {
        let patch = self.patch(path)?;
        let value = match (value.as_f64(), value.as_string()) {
            (Some(n), _) => AttributeValue::Number(n),
            (None, Some(s)) => AttributeValue::Text(s),
            (None, None) => return Err(js_err("parameter value must be a number or a string")),
        };
        self.graph
            .set_parameter(patch, id, attribute, value)
            .map_err(js_err)
    }

    pub fn get_param(&self, path: &str, id: &str, attribute: &str) -> Result<JsValue, JsValue> {
        let patch = self.patch(path)?;
        Ok(match self.graph.parameter(patch, id, attribute) {
            Some(AttributeValue::Number(n)) => JsValue::from_f64(n),
            Some(AttributeValue::Text(s)) => JsValue::from_str(&s),
            None => JsValue::UNDEFINED,
        })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save the whole tree as a plain object
    pub fn save_patch(&self) -> Result<JsValue, JsValue> {
        let def = self.graph.snapshot().map_err(js_err)?;
        serde_wasm_bindgen::to_value(&def).map_err(js_err)
    }

    /// Replace the whole tree with a saved object
    pub fn load_patch(&mut self, patch: JsValue) -> Result<(), JsValue> {
        let def: PatchDef = serde_wasm_bindgen::from_value(patch).map_err(js_err)?;
        self.graph.restore(&def).map_err(js_err)
    }

    pub fn to_json(&self) -> Result<String, JsValue> {
        self.graph.to_json().map_err(js_err)
    }

    /// Replace the whole tree with a JSON snapshot
    pub fn load_json(&mut self, json: &str) -> Result<(), JsValue> {
        self.graph.load_json(json).map_err(js_err)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Drain pending patch and engine notifications
    pub fn poll_events(&mut self) -> Result<JsValue, JsValue> {
        let events = self.graph.drain_events();
        serde_wasm_bindgen::to_value(&events).map_err(js_err)
    }

    pub fn pending_event_count(&self) -> usize {
        self.graph.events().pending_count()
    }
}

impl PatchworkEditor {
    fn patch(&self, path: &str) -> Result<PatchId, JsValue> {
        self.graph
            .patch_at_path(path)
            .ok_or_else(|| js_err(format!("no patch at path '{}'", path)))
    }

    pub fn graph(&self) -> &Graph<WebAudioEngine> {
        &self.graph
    }
}

fn wire(
    source: &str,
    source_output: PortIndex,
    destination: &str,
    destination_input: i32,
) -> Result<ConnectionDef, JsValue> {
    let destination_input = InputIndex::try_from(i64::from(destination_input)).map_err(js_err)?;
    Ok(ConnectionDef::new(
        source,
        source_output,
        destination,
        destination_input,
    ))
}
