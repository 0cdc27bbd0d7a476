//! Daemon configuration.
//!
//! Settings are read from a TOML file; everything has a default so the
//! daemon also starts bare. Adaptor sections attach static property bags to
//! adaptor registry slots, applied when the adaptor is instantiated.
//!
//! ```toml
//! socket_path = "/tmp/sensord.sock"
//! pipe_capacity = 128
//! plugins = ["accelerometersensor"]
//!
//! [[adaptors]]
//! id = "accelerometeradaptor"
//! type = "accelerometeradaptor"
//! [adaptors.properties]
//! poll_file = "/dev/input/accel"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/sensord.sock")
}

fn default_pipe_capacity() -> usize {
    128
}

/// An adaptor registry slot declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptorSettings {
    /// Registry identifier, e.g. `accelerometeradaptor`.
    pub id: String,
    /// Factory type tag.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Static property bag applied at instantiation time.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path of the per-session sample socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Maximum number of in-flight records in the cross-thread sample pipe.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Plugins loaded at startup.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Adaptor slots registered (or re-propertied) after plugin load.
    #[serde(default)]
    pub adaptors: Vec<AdaptorSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pipe_capacity: default_pipe_capacity(),
            plugins: Vec::new(),
            adaptors: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }
}
