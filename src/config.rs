//! Node configuration and provisioner settings.
//!
//! `NodeConfig` is read from the node's YAML cloud-config. `Settings` is a
//! small JSON file at `~/.config/edgevpn-provision/settings.json` (or an
//! explicit path); failures there fall back to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// The parts of a node cloud-config this crate cares about.
///
/// Unknown top-level sections are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub kairos: Option<NetworkSection>,

    /// User-supplied daemon options, applied over every derived value.
    #[serde(default, deserialize_with = "scalar_map")]
    pub vpn: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub network_token: String,

    /// Run a local DNS forwarder and point the resolver at it.
    #[serde(default)]
    pub dns: bool,
}

impl NodeConfig {
    /// Parse a YAML cloud-config document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse node config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read node config {}", path.display()))?;
        Self::from_yaml(&text)
    }

    /// The shared secret, or `None` when absent or empty.
    pub fn network_token(&self) -> Option<&str> {
        self.kairos
            .as_ref()
            .map(|k| k.network_token.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn dns_enabled(&self) -> bool {
        self.kairos.as_ref().is_some_and(|k| k.dns)
    }
}

/// Accept `KEY: true` / `KEY: 8080` as well as quoted strings; values stay opaque.
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                return Err(D::Error::custom(format!(
                    "vpn option {key} must be a scalar, got {other:?}"
                )))
            }
        };
        out.insert(key, value);
    }
    Ok(out)
}

/// How to treat failures creating the service-manager override directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryErrors {
    /// Any failure other than "already exists" aborts provisioning.
    #[default]
    Strict,
    /// Log and continue; the env file write reports the real problem, if any.
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystemChoice {
    #[default]
    Auto,
    Systemd,
    Openrc,
}

/// Provisioner settings.
///
/// Every field has a serde default so that adding new fields later
/// doesn't break old settings files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding persisted cloud-configs (`100_<name>.yaml`).
    #[serde(default = "default_oem_dir")]
    pub oem_dir: PathBuf,

    #[serde(default)]
    pub directory_errors: DirectoryErrors,

    /// Stage the DNS document is applied at for the current boot.
    #[serde(default = "default_inline_stage")]
    pub inline_stage: String,

    /// Executor command line; `{stage}` is substituted, YAML goes to stdin.
    #[serde(default = "default_inline_command")]
    pub inline_command: Vec<String>,

    #[serde(default)]
    pub init_system: InitSystemChoice,
}

fn default_oem_dir() -> PathBuf {
    PathBuf::from("oem")
}

fn default_inline_stage() -> String {
    "network".to_string()
}

fn default_inline_command() -> Vec<String> {
    ["elemental", "run-stage", "-s", "{stage}", "-"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            oem_dir: default_oem_dir(),
            directory_errors: DirectoryErrors::default(),
            inline_stage: default_inline_stage(),
            inline_command: default_inline_command(),
            init_system: InitSystemChoice::default(),
        }
    }
}

impl Settings {
    /// Settings file path: `~/.config/edgevpn-provision/settings.json`.
    ///
    /// Returns `None` if the home/config directory can't be determined.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("edgevpn-provision").join("settings.json"))
    }

    /// Load settings from `explicit` or the default path, falling back to defaults on any error.
    pub fn load(explicit: Option<&Path>) -> Self {
        let Some(path) = explicit.map(Path::to_path_buf).or_else(Self::path) else {
            return Self::default();
        };

        let Ok(contents) = fs::read_to_string(&path) else {
            return Self::default();
        };

        match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable settings file"
                );
                Self::default()
            }
        }
    }
}
