//! # Patchwork: Hierarchical Patch Graphs for Audio Engines
//!
//! `patchwork` maintains a user-editable, hierarchical graph of audio modules
//! and keeps a live audio engine's wiring in sync with it. Modules live in
//! patches; a subpatch module owns a nested patch whose input and output
//! proxies become its ports.
//!
//! ## Architecture
//!
//! - **Logical graph** ([`graph`]) - patches, modules and connections in arenas,
//!   mutated through [`Graph`]
//! - **Translation** ([`translate`]) - expansion of logical connections through
//!   proxies into concrete edges
//! - **Coordination** ([`coordinator`]) - node lifecycle plus the disconnect/reconnect
//!   protocol the engine's coarse `disconnect` requires
//! - **Engine capability** ([`engine`]) - the [`AudioEngine`] trait and an in-memory
//!   [`RecordingEngine`]
//!
//! ## Quick Start
//!
//! ```rust
//! use patchwork::prelude::*;
//!
//! let mut graph = Graph::new(ModuleRegistry::new(), RecordingEngine::new());
//! let root = graph.root();
//!
//! graph.add_module(root, "osc", vec![]).unwrap();
//! graph.add_module(root, "gain", vec![]).unwrap();
//! graph.add_module(root, "output", vec![]).unwrap();
//!
//! graph.add_connection(root, "osc_1", 0, "gain_1", 0).unwrap();
//! graph.add_destination_connection("gain_1", 0, "output_1").unwrap();
//! graph.set_parameter(root, "osc_1", "frequency", 220.0).unwrap();
//!
//! assert_eq!(graph.engine().unwrap().edge_count(), 2);
//! let json = graph.to_json().unwrap();
//! # assert!(json.contains("osc_1"));
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod event;
pub mod graph;
pub mod port;
pub mod registry;
pub mod serialize;
pub mod translate;

#[cfg(feature = "wasm")]
pub mod wasm;

/// Prelude module for convenient imports
pub mod prelude {
    // Logical graph
    pub use crate::graph::{
        Connection, ConnectionId, Graph, Module, ModuleBody, ModuleKey, Patch, PatchError,
        PatchId, PatchTree, Position,
    };

    // Ports and attributes
    pub use crate::port::{AttributeKind, AttributeSpec, AttributeValue, InputIndex, PortIndex};

    // Module types
    pub use crate::registry::{
        ModuleDefinition, ModuleKind, ModuleRegistry, ProxyKind, INPUT_TYPE, OUTPUT_TYPE,
        SUBPATCH_TYPE,
    };

    // Backend
    pub use crate::coordinator::{backend_edge, RootCoordinator};
    pub use crate::engine::{
        AudioEngine, BackendEdge, ConnectTarget, EngineCall, EngineError, NodeHandle,
        RecordingEngine,
    };
    pub use crate::translate::{ApiEdge, EdgeTarget, RemovalPlan};

    // Notifications
    pub use crate::event::{EngineEvent, EventLog, Notification, PatchEvent, PatchEventKind};

    // Persistence and configuration
    pub use crate::config::GraphConfig;
    pub use crate::serialize::{validate_def, AttributeState, ConnectionDef, ModuleDef, PatchDef};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
