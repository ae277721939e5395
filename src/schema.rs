//! Suite configuration file.
//!
//! A script directory may carry a `scriptest.yaml` (or `scriptest.toml`)
//! with defaults for every script in it. Command-line flags override these.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Suite-level configuration loaded from the script root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Config file format version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Per-script timeout in seconds. Bounds foreground commands and `wait`.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Seconds `wait` blocks on a background process before giving up.
    #[serde(default)]
    pub wait_timeout: Option<u64>,

    /// Extra environment variables set in every script's session.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Values for caller-defined `[tag]` conditions.
    #[serde(default)]
    pub conditions: HashMap<String, bool>,

    /// Run scripts one after another instead of in parallel (default: false).
    #[serde(default)]
    pub serial: bool,

    /// Rewrite golden files in scripts when comparisons differ.
    #[serde(default)]
    pub update: bool,

    /// Directory sandboxes are created in.
    /// Use "local" for `.scriptest/<timestamp>/` in the script root, or a path.
    /// When not set the system temp directory is used.
    #[serde(default)]
    pub workdir_root: Option<WorkdirRoot>,
}

fn default_version() -> u32 {
    1
}

/// Where sandboxes are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(from = "String", into = "String")]
pub enum WorkdirRoot {
    /// `.scriptest/<timestamp>/` in the script root.
    Local,
    /// A specific directory.
    Path(PathBuf),
}

impl WorkdirRoot {
    /// Resolve to a concrete directory. `Local` is stamped with the current
    /// time so repeated runs do not collide.
    pub fn resolve(&self, script_root: &Path) -> PathBuf {
        match self {
            WorkdirRoot::Local => {
                let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
                script_root.join(".scriptest").join(stamp.to_string())
            }
            WorkdirRoot::Path(p) if p.is_relative() => script_root.join(p),
            WorkdirRoot::Path(p) => p.clone(),
        }
    }
}

impl From<String> for WorkdirRoot {
    fn from(s: String) -> Self {
        if s == "local" {
            WorkdirRoot::Local
        } else {
            WorkdirRoot::Path(PathBuf::from(s))
        }
    }
}

impl From<WorkdirRoot> for String {
    fn from(dir: WorkdirRoot) -> String {
        match dir {
            WorkdirRoot::Local => "local".to_string(),
            WorkdirRoot::Path(p) => p.display().to_string(),
        }
    }
}

/// Generate the JSON Schema for the suite configuration file.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(SuiteConfig)
}
