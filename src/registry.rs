//! Module Definitions and Registry
//!
//! Every module in a patch is created from a [`ModuleDefinition`]: immutable
//! reference data describing its kind, port counts and attributes. The
//! [`ModuleRegistry`] maps type ids to definitions and ships with a set of
//! Web-Audio-style native types plus the three structural proxies.

use crate::port::{AttributeSpec, PortIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Type id of the subpatch input boundary proxy
pub const INPUT_TYPE: &str = "input";
/// Type id of the subpatch output boundary proxy
pub const OUTPUT_TYPE: &str = "output";
/// Type id of the nested patch container
pub const SUBPATCH_TYPE: &str = "subpatch";

/// Structural proxy subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Input,
    Output,
    Subpatch,
}

/// Closed classification of a module type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Backed 1:1 by a node in the audio engine
    Native {
        /// Backend constructor name (e.g. `createOscillator`)
        constructor: String,
        /// Audio inputs, not counting parameter inputs
        inputs: PortIndex,
        outputs: PortIndex,
        /// Source nodes that must be started after creation
        requires_start: bool,
    },

    /// Structural only, never gets a backend node
    Proxy(ProxyKind),
}

/// Immutable description of a module type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub type_id: String,
    pub label: String,
    pub group: String,
    pub kind: ModuleKind,
    pub attributes: Vec<AttributeSpec>,
}

impl ModuleDefinition {
    pub fn native(
        type_id: impl Into<String>,
        constructor: impl Into<String>,
        inputs: PortIndex,
        outputs: PortIndex,
    ) -> Self {
        let type_id = type_id.into();
        Self {
            label: type_id.clone(),
            type_id,
            group: String::from("Native"),
            kind: ModuleKind::Native {
                constructor: constructor.into(),
                inputs,
                outputs,
                requires_start: false,
            },
            attributes: Vec::new(),
        }
    }

    pub fn proxy(type_id: impl Into<String>, proxy: ProxyKind) -> Self {
        let type_id = type_id.into();
        Self {
            label: type_id.clone(),
            type_id,
            group: String::from("Structure"),
            kind: ModuleKind::Proxy(proxy),
            attributes: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeSpec) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Mark a native type as a source that needs an explicit start
    pub fn started(mut self) -> Self {
        if let ModuleKind::Native { requires_start, .. } = &mut self.kind {
            *requires_start = true;
        }
        self
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, ModuleKind::Native { .. })
    }

    pub fn proxy_kind(&self) -> Option<ProxyKind> {
        match self.kind {
            ModuleKind::Proxy(kind) => Some(kind),
            ModuleKind::Native { .. } => None,
        }
    }

    pub fn requires_start(&self) -> bool {
        matches!(
            self.kind,
            ModuleKind::Native {
                requires_start: true,
                ..
            }
        )
    }

    pub fn attribute(&self, id: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.id == id)
    }

    /// Attributes that are exposed as modulation inputs, in port order
    pub fn param_inputs(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.iter().filter(|a| a.is_audio_param())
    }

    /// The parameter a native input port maps to, if it is a parameter port
    ///
    /// Native input ports are the audio inputs followed by one port per
    /// `AudioParam` attribute.
    pub fn param_for_input(&self, input: PortIndex) -> Option<&AttributeSpec> {
        match self.kind {
            ModuleKind::Native { inputs, .. } if input >= inputs => {
                self.param_inputs().nth((input - inputs) as usize)
            }
            _ => None,
        }
    }

    /// Fixed input port count; `None` for subpatches, whose ports follow their contents
    pub fn input_count(&self) -> Option<PortIndex> {
        match self.kind {
            ModuleKind::Native { inputs, .. } => {
                Some(inputs + self.param_inputs().count() as PortIndex)
            }
            ModuleKind::Proxy(ProxyKind::Input) => Some(0),
            ModuleKind::Proxy(ProxyKind::Output) => Some(1),
            ModuleKind::Proxy(ProxyKind::Subpatch) => None,
        }
    }

    /// Fixed output port count; `None` for subpatches
    pub fn output_count(&self) -> Option<PortIndex> {
        match self.kind {
            ModuleKind::Native { outputs, .. } => Some(outputs),
            ModuleKind::Proxy(ProxyKind::Input) => Some(1),
            ModuleKind::Proxy(ProxyKind::Output) => Some(0),
            ModuleKind::Proxy(ProxyKind::Subpatch) => None,
        }
    }
}

/// Registry of available module types
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    definitions: HashMap<String, Arc<ModuleDefinition>>,
}

impl ModuleRegistry {
    /// Create a registry holding the built-in types
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtin();
        registry
    }

    /// Create a registry holding only the structural proxies
    pub fn empty() -> Self {
        let mut registry = Self {
            definitions: HashMap::new(),
        };
        registry
            .register(ModuleDefinition::proxy(INPUT_TYPE, ProxyKind::Input).with_label("Input"));
        registry
            .register(ModuleDefinition::proxy(OUTPUT_TYPE, ProxyKind::Output).with_label("Output"));
        registry.register(
            ModuleDefinition::proxy(SUBPATCH_TYPE, ProxyKind::Subpatch).with_label("Subpatch"),
        );
        registry
    }

    fn register_builtin(&mut self) {
        const WAVEFORMS: &[&str] = &["sine", "square", "sawtooth", "triangle"];
        const FILTER_TYPES: &[&str] = &[
            "lowpass", "highpass", "bandpass", "lowshelf", "highshelf", "peaking", "notch",
            "allpass",
        ];

        // Sources
        self.register(
            ModuleDefinition::native("osc", "createOscillator", 0, 1)
                .with_label("Oscillator")
                .with_group("Sources")
                .with_attribute(AttributeSpec::audio_param("frequency", 440.0, 0.0, 24000.0))
                .with_attribute(AttributeSpec::audio_param("detune", 0.0, -4800.0, 4800.0))
                .with_attribute(AttributeSpec::choice("type", WAVEFORMS, "sine"))
                .started(),
        );

        self.register(
            ModuleDefinition::native("constant", "createConstantSource", 0, 1)
                .with_label("Constant Source")
                .with_group("Sources")
                .with_attribute(AttributeSpec::audio_param("offset", 1.0, -3.4e38, 3.4e38))
                .started(),
        );

        self.register(
            ModuleDefinition::native("player", "createBufferSource", 0, 1)
                .with_label("Buffer Player")
                .with_group("Sources")
                .with_attribute(AttributeSpec::audio_param("playbackRate", 1.0, -3.4e38, 3.4e38))
                .with_attribute(AttributeSpec::audio_param("detune", 0.0, -4800.0, 4800.0))
                .with_attribute(AttributeSpec::buffer("buffer"))
                .started(),
        );

        // Processing
        self.register(
            ModuleDefinition::native("gain", "createGain", 1, 1)
                .with_label("Gain")
                .with_group("Processing")
                .with_attribute(AttributeSpec::audio_param("gain", 1.0, -3.4e38, 3.4e38)),
        );

        self.register(
            ModuleDefinition::native("filter", "createBiquadFilter", 1, 1)
                .with_label("Biquad Filter")
                .with_group("Processing")
                .with_attribute(AttributeSpec::audio_param("frequency", 350.0, 0.0, 24000.0))
                .with_attribute(AttributeSpec::audio_param("detune", 0.0, -4800.0, 4800.0))
                .with_attribute(AttributeSpec::audio_param("Q", 1.0, 0.0001, 1000.0))
                .with_attribute(AttributeSpec::audio_param("gain", 0.0, -40.0, 40.0))
                .with_attribute(AttributeSpec::choice("type", FILTER_TYPES, "lowpass")),
        );

        self.register(
            ModuleDefinition::native("delay", "createDelay", 1, 1)
                .with_label("Delay")
                .with_group("Processing")
                .with_attribute(AttributeSpec::audio_param("delayTime", 0.0, 0.0, 1.0)),
        );

        self.register(
            ModuleDefinition::native("panner", "createStereoPanner", 1, 1)
                .with_label("Stereo Panner")
                .with_group("Processing")
                .with_attribute(AttributeSpec::audio_param("pan", 0.0, -1.0, 1.0)),
        );

        self.register(
            ModuleDefinition::native("compressor", "createDynamicsCompressor", 1, 1)
                .with_label("Compressor")
                .with_group("Processing")
                .with_attribute(AttributeSpec::audio_param("threshold", -24.0, -100.0, 0.0))
                .with_attribute(AttributeSpec::audio_param("knee", 30.0, 0.0, 40.0))
                .with_attribute(AttributeSpec::audio_param("ratio", 12.0, 1.0, 20.0))
                .with_attribute(AttributeSpec::audio_param("attack", 0.003, 0.0, 1.0))
                .with_attribute(AttributeSpec::audio_param("release", 0.25, 0.0, 1.0)),
        );

        self.register(
            ModuleDefinition::native("convolver", "createConvolver", 1, 1)
                .with_label("Convolver")
                .with_group("Processing")
                .with_attribute(AttributeSpec::buffer("buffer")),
        );

        // Analysis and routing
        self.register(
            ModuleDefinition::native("analyser", "createAnalyser", 1, 1)
                .with_label("Analyser")
                .with_group("Analysis"),
        );

        self.register(
            ModuleDefinition::native("splitter", "createChannelSplitter", 1, 6)
                .with_label("Channel Splitter")
                .with_group("Routing"),
        );

        self.register(
            ModuleDefinition::native("merger", "createChannelMerger", 6, 1)
                .with_label("Channel Merger")
                .with_group("Routing"),
        );
    }

    /// Register (or replace) a definition
    pub fn register(&mut self, definition: ModuleDefinition) {
        self.definitions
            .insert(definition.type_id.clone(), Arc::new(definition));
    }

    pub fn get(&self, type_id: &str) -> Option<&Arc<ModuleDefinition>> {
        self.definitions.get(type_id)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.definitions.contains_key(type_id)
    }

    /// All registered definitions
    pub fn list(&self) -> impl Iterator<Item = &ModuleDefinition> {
        self.definitions.values().map(|d| d.as_ref())
    }

    /// Definitions in a display group
    pub fn list_by_group<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = &'a ModuleDefinition> {
        self.list().filter(move |d| d.group == group)
    }

    /// All unique display groups, sorted
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<_> = self.list().map(|d| d.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
