//! Network configuration
//!
//! `NetworkConfig` carries the indexing and evaluation policy consumed by the index
//! selector, the join memory factory and the evaluation session. It can be built in
//! code, deserialised from YAML, read from `bingo.*` properties or from `BINGO_*`
//! environment variables. Every loader ends in [`NetworkConfig::validate`].

use crate::error::{NetworkError, NetworkResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Highest supported composite key depth for equality indexes
pub const MAX_COMPOSITE_KEY_DEPTH: u32 = 3;

pub const COMPOSITE_KEY_DEPTH_PROPERTY: &str = "bingo.compositeKeyDepth";
pub const INDEX_PRECEDENCE_PROPERTY: &str = "bingo.indexPrecedence";
pub const SEQUENTIAL_PROPERTY: &str = "bingo.sequential";
pub const INDEX_LEFT_BETA_MEMORY_PROPERTY: &str = "bingo.indexLeftBetaMemory";
pub const INDEX_RIGHT_BETA_MEMORY_PROPERTY: &str = "bingo.indexRightBetaMemory";
pub const BETA_RANGE_INDEX_PROPERTY: &str = "bingo.betaRangeIndex";
pub const MULTITHREAD_EVALUATION_PROPERTY: &str = "bingo.multithreadEvaluation";
pub const MAX_THREADS_PROPERTY: &str = "bingo.maxThreads";

/// Environment variable names, in the same order as the property names above
const ENV_MAPPING: [(&str, &str); 8] = [
    ("BINGO_COMPOSITE_KEY_DEPTH", COMPOSITE_KEY_DEPTH_PROPERTY),
    ("BINGO_INDEX_PRECEDENCE", INDEX_PRECEDENCE_PROPERTY),
    ("BINGO_SEQUENTIAL", SEQUENTIAL_PROPERTY),
    ("BINGO_INDEX_LEFT_BETA_MEMORY", INDEX_LEFT_BETA_MEMORY_PROPERTY),
    ("BINGO_INDEX_RIGHT_BETA_MEMORY", INDEX_RIGHT_BETA_MEMORY_PROPERTY),
    ("BINGO_BETA_RANGE_INDEX", BETA_RANGE_INDEX_PROPERTY),
    ("BINGO_MULTITHREAD_EVALUATION", MULTITHREAD_EVALUATION_PROPERTY),
    ("BINGO_MAX_THREADS", MAX_THREADS_PROPERTY),
];

/// How the index selector picks constraints when several are indexable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexPrecedence {
    /// Prefer equality constraints anywhere in the node; fall back to a range index
    #[default]
    #[serde(rename = "equality")]
    EqualityPriority,
    /// The first indexable constraint in declaration order decides the index kind
    #[serde(rename = "pattern")]
    PatternOrder,
}

impl IndexPrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexPrecedence::EqualityPriority => "equality",
            IndexPrecedence::PatternOrder => "pattern",
        }
    }
}

impl FromStr for IndexPrecedence {
    type Err = NetworkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "equality" => Ok(IndexPrecedence::EqualityPriority),
            "pattern" => Ok(IndexPrecedence::PatternOrder),
            other => Err(NetworkError::configuration(
                INDEX_PRECEDENCE_PROPERTY,
                "equality|pattern",
                other,
                format!("unknown index precedence '{other}'"),
            )),
        }
    }
}

impl fmt::Display for IndexPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indexing and evaluation policy for a network and its sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Maximum number of equality constraints combined into one hash key (0 disables indexing)
    pub composite_key_depth: u32,
    /// Constraint precedence used by the index selector
    pub index_precedence: IndexPrecedence,
    /// Sequential mode never re-scans left tuples, so no left memory is kept
    pub sequential: bool,
    /// Build indexed left memories
    pub index_left_beta_memory: bool,
    /// Build indexed right memories
    pub index_right_beta_memory: bool,
    /// Allow range indexes on join nodes (not/exists nodes always allow them)
    pub beta_node_range_index_enabled: bool,
    /// Evaluate structurally disjoint partitions in parallel
    pub multithread_evaluation: bool,
    /// Worker threads used by partitioned evaluation
    pub max_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            composite_key_depth: MAX_COMPOSITE_KEY_DEPTH,
            index_precedence: IndexPrecedence::EqualityPriority,
            sequential: false,
            index_left_beta_memory: true,
            index_right_beta_memory: true,
            beta_node_range_index_enabled: false,
            multithread_evaluation: false,
            max_threads: 3,
        }
    }
}

impl NetworkConfig {
    /// Reject values the network cannot honour
    pub fn validate(&self) -> NetworkResult<()> {
        if self.composite_key_depth > MAX_COMPOSITE_KEY_DEPTH {
            return Err(NetworkError::configuration(
                COMPOSITE_KEY_DEPTH_PROPERTY,
                "0..=3",
                &self.composite_key_depth.to_string(),
                "compositeKeyDepth cannot be greater than 3",
            ));
        }
        if self.max_threads == 0 {
            return Err(NetworkError::configuration(
                MAX_THREADS_PROPERTY,
                ">= 1",
                "0",
                "maxThreads must be at least 1",
            ));
        }
        Ok(())
    }

    /// Builder-style setter that validates the depth eagerly
    pub fn with_composite_key_depth(mut self, depth: u32) -> NetworkResult<Self> {
        self.composite_key_depth = depth;
        self.validate()?;
        Ok(self)
    }

    pub fn with_index_precedence(mut self, precedence: IndexPrecedence) -> Self {
        self.index_precedence = precedence;
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn with_beta_range_index(mut self, enabled: bool) -> Self {
        self.beta_node_range_index_enabled = enabled;
        self
    }

    pub fn with_beta_memory_indexing(mut self, left: bool, right: bool) -> Self {
        self.index_left_beta_memory = left;
        self.index_right_beta_memory = right;
        self
    }

    pub fn with_multithread_evaluation(mut self, enabled: bool, max_threads: usize) -> Self {
        self.multithread_evaluation = enabled;
        self.max_threads = max_threads;
        self
    }

    /// Load from a YAML document; missing keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> NetworkResult<Self> {
        let config: NetworkConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `bingo.*` properties. Keys owned by other collaborators are ignored and
    /// empty values fall back to the defaults.
    pub fn from_properties(properties: &HashMap<String, String>) -> NetworkResult<Self> {
        let mut config = NetworkConfig::default();
        for (name, value) in properties {
            config.set_property(name, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from `BINGO_*` environment variables
    pub fn from_env() -> NetworkResult<Self> {
        let mut config = NetworkConfig::default();
        for (var, property) in ENV_MAPPING {
            if let Ok(value) = std::env::var(var) {
                debug!(variable = var, value = %value, "Applying network setting from environment");
                config.set_property(property, &value)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply a single property. Unknown names are ignored.
    pub fn set_property(&mut self, name: &str, value: &str) -> NetworkResult<()> {
        let defaults = NetworkConfig::default();
        let value = value.trim();
        let empty = value.is_empty();
        match name.trim() {
            COMPOSITE_KEY_DEPTH_PROPERTY => {
                self.composite_key_depth =
                    if empty { defaults.composite_key_depth } else { parse_number(name, value)? };
            }
            INDEX_PRECEDENCE_PROPERTY => {
                self.index_precedence =
                    if empty { defaults.index_precedence } else { value.parse()? };
            }
            SEQUENTIAL_PROPERTY => {
                self.sequential = if empty { defaults.sequential } else { parse_flag(name, value)? };
            }
            INDEX_LEFT_BETA_MEMORY_PROPERTY => {
                self.index_left_beta_memory =
                    if empty { defaults.index_left_beta_memory } else { parse_flag(name, value)? };
            }
            INDEX_RIGHT_BETA_MEMORY_PROPERTY => {
                self.index_right_beta_memory =
                    if empty { defaults.index_right_beta_memory } else { parse_flag(name, value)? };
            }
            BETA_RANGE_INDEX_PROPERTY => {
                self.beta_node_range_index_enabled = if empty {
                    defaults.beta_node_range_index_enabled
                } else {
                    parse_flag(name, value)?
                };
            }
            MULTITHREAD_EVALUATION_PROPERTY => {
                self.multithread_evaluation =
                    if empty { defaults.multithread_evaluation } else { parse_flag(name, value)? };
            }
            MAX_THREADS_PROPERTY => {
                self.max_threads =
                    if empty { defaults.max_threads } else { parse_number(name, value)? };
            }
            _ => {}
        }
        Ok(())
    }

    /// Read back a property in its external form
    pub fn get_property(&self, name: &str) -> Option<String> {
        match name.trim() {
            COMPOSITE_KEY_DEPTH_PROPERTY => Some(self.composite_key_depth.to_string()),
            INDEX_PRECEDENCE_PROPERTY => Some(self.index_precedence.to_string()),
            SEQUENTIAL_PROPERTY => Some(self.sequential.to_string()),
            INDEX_LEFT_BETA_MEMORY_PROPERTY => Some(self.index_left_beta_memory.to_string()),
            INDEX_RIGHT_BETA_MEMORY_PROPERTY => Some(self.index_right_beta_memory.to_string()),
            BETA_RANGE_INDEX_PROPERTY => Some(self.beta_node_range_index_enabled.to_string()),
            MULTITHREAD_EVALUATION_PROPERTY => Some(self.multithread_evaluation.to_string()),
            MAX_THREADS_PROPERTY => Some(self.max_threads.to_string()),
            _ => None,
        }
    }
}

fn parse_flag(setting: &str, value: &str) -> NetworkResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(NetworkError::configuration(
            setting,
            "true|false",
            other,
            format!("'{other}' is not a boolean"),
        )),
    }
}

fn parse_number<T: FromStr>(setting: &str, value: &str) -> NetworkResult<T> {
    value.parse::<T>().map_err(|_| {
        NetworkError::configuration(setting, "an unsigned integer", value, format!("'{value}' is not a number"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.composite_key_depth, 3);
        assert_eq!(config.index_precedence, IndexPrecedence::EqualityPriority);
        assert!(config.index_left_beta_memory);
        assert!(config.index_right_beta_memory);
        assert!(!config.beta_node_range_index_enabled);
    }

    #[test]
    fn test_composite_key_depth_above_three_is_rejected() {
        let result = NetworkConfig::default().with_composite_key_depth(4);
        let err = result.unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("greater than 3"));
    }

    #[test]
    fn test_unknown_precedence_is_rejected() {
        let mut props = HashMap::new();
        props.insert(INDEX_PRECEDENCE_PROPERTY.to_string(), "salience".to_string());
        assert!(NetworkConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_properties_with_empty_values_use_defaults() {
        let mut props = HashMap::new();
        props.insert(COMPOSITE_KEY_DEPTH_PROPERTY.to_string(), String::new());
        props.insert(INDEX_PRECEDENCE_PROPERTY.to_string(), "pattern".to_string());
        props.insert(SEQUENTIAL_PROPERTY.to_string(), "TRUE".to_string());
        props.insert("bingo.unrelated".to_string(), "whatever".to_string());

        let config = NetworkConfig::from_properties(&props).unwrap();
        assert_eq!(config.composite_key_depth, 3);
        assert_eq!(config.index_precedence, IndexPrecedence::PatternOrder);
        assert!(config.sequential);
        assert_eq!(config.get_property(INDEX_PRECEDENCE_PROPERTY).as_deref(), Some("pattern"));
    }

    #[test]
    fn test_yaml_loading() {
        let yaml = "composite_key_depth: 2\nindex_precedence: pattern\nbeta_node_range_index_enabled: true\n";
        let config = NetworkConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.composite_key_depth, 2);
        assert_eq!(config.index_precedence, IndexPrecedence::PatternOrder);
        assert!(config.beta_node_range_index_enabled);
        assert_eq!(config.max_threads, 3);

        assert!(NetworkConfig::from_yaml_str("composite_key_depth: 4\n").is_err());
        assert!(NetworkConfig::from_yaml_str("index_precedence: newest\n").is_err());
    }

    #[test]
    fn test_invalid_flag_is_rejected() {
        let mut config = NetworkConfig::default();
        assert!(config.set_property(SEQUENTIAL_PROPERTY, "maybe").is_err());
        assert!(config.set_property(MAX_THREADS_PROPERTY, "-1").is_err());
    }
}
