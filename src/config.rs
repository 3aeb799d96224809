//! Graph Configuration

use serde::{Deserialize, Serialize};

/// Configuration for a [`Graph`](crate::graph::Graph)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Joins type and ordinal in module ids (default: `_`)
    pub id_separator: char,
    /// Joins subpatch module ids into a nested patch path (default: `$`)
    pub path_separator: char,
    /// Seed fresh subpatches with one input and one output (default: true)
    pub seed_subpatch_ports: bool,
    /// Maximum queued notifications before the oldest are dropped (default: 4096)
    pub max_pending_events: usize,
    /// Release backend nodes when their module is removed (default: true)
    pub release_nodes: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            id_separator: '_',
            path_separator: '$',
            seed_subpatch_ports: true,
            max_pending_events: 4096,
            release_nodes: true,
        }
    }
}

impl GraphConfig {
    /// Deserialize from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = GraphConfig::from_json(r#"{"release_nodes": false}"#).unwrap();
        assert!(!config.release_nodes);
        assert_eq!(config.id_separator, '_');
        assert_eq!(config.max_pending_events, 4096);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(GraphConfig::from_json("{}").unwrap(), GraphConfig::default());
    }
}
