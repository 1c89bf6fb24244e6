//! Logging configuration
//!
//! Usually the `[logging]` table of a node's TOML file. Levels can be set
//! per overlay component (`transport`, `routing`, `rpc`, `uplink`, `node`,
//! `core`), which is what you want when chasing a problem in one layer
//! without drowning in heartbeats and link-state floods from the others.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Components whose level can be set on their own
pub const COMPONENTS: &[&str] = &["core", "transport", "routing", "rpc", "uplink", "node"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for everything without a component entry; `RUST_LOG` wins
    pub default_level: String,

    /// Per component levels, e.g. `uplink = "debug"`
    pub components: BTreeMap<String, String>,

    pub console: ConsoleConfig,

    /// JSONL files, one set per node
    pub file: Option<FileConfig>,

    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            components: BTreeMap::new(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Pretty console at debug; uplink stays at info so sessions with
    /// heartbeats do not flood the terminal
    pub fn development() -> Self {
        Self {
            default_level: "debug".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: true,
                ansi: true,
            },
            ..Default::default()
        }
        .with_component("uplink", "info")
    }

    /// JSONL files under `log_dir`, nothing on the console
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            console: ConsoleConfig {
                enabled: false,
                pretty: false,
                ansi: false,
            },
            file: Some(FileConfig {
                directory: log_dir,
                ..FileConfig::default()
            }),
            ..Default::default()
        }
    }

    /// Warnings only; many nodes share one test process
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            ..Default::default()
        }
    }

    pub fn with_component(mut self, component: impl Into<String>, level: impl Into<String>) -> Self {
        self.components.insert(component.into(), level.into());
        self
    }

    /// `EnvFilter` directives, e.g. `info,overlink_uplink=debug`
    ///
    /// Unknown component names are passed through as plain targets.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.default_level.clone()];
        for (component, level) in &self.components {
            let target = if COMPONENTS.contains(&component.as_str()) {
                format!("overlink_{component}")
            } else {
                component.clone()
            };
            directives.push(format!("{target}={level}"));
        }
        directives.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human readable lines instead of JSONL
    pub pretty: bool,
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name prefix; derived from the node name when unset, so several
    /// nodes can log into one directory
    pub prefix: Option<String>,
    pub rotation: RotationStrategy,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: None,
            rotation: RotationStrategy::Daily,
        }
    }
}

impl FileConfig {
    /// Prefix of the log files written for `node_name`
    pub fn prefix_for(&self, node_name: Option<&str>) -> String {
        if let Some(prefix) = &self.prefix {
            return prefix.clone();
        }
        let node: String = node_name
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if node.is_empty() {
            "overlink".to_string()
        } else {
            format!("overlink-{node}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file, truncated when the node starts
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Event fields at the top level of each line
    pub flatten_events: bool,
    /// Enclosing spans, which carry request ids and channel ids
    pub include_spans: bool,
    pub include_location: bool,
    pub include_target: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_location: false,
            include_target: true,
        }
    }
}
