//! Cloud-config documents: the staged file/DNS directives the node's
//! provisioning agent applies at boot, plus persistence into the OEM directory.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Mode of persisted documents in the OEM directory.
pub const OEM_FILE_MODE: u32 = 0o700;

/// A named document mapping stage names to the steps run at that stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub name: String,
    pub stages: BTreeMap<String, Vec<Stage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDirective>,

    #[serde(default, skip_serializing_if = "DnsDirective::is_empty")]
    pub dns: DnsDirective,
}

/// Write `content` to `path` when the stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDirective {
    pub path: String,
    pub content: String,
    pub permissions: u32,
}

/// Replace the node's nameserver list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsDirective {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
}

impl DnsDirective {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
    }
}

impl CloudConfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|source| ProvisionError::Serialize {
            what: "cloud config",
            source,
        })
    }
}

/// Path of the persisted document `name`: `<oem_dir>/100_<name>.yaml`.
pub fn oem_path(oem_dir: &Path, name: &str) -> PathBuf {
    oem_dir.join(format!("100_{}.yaml", name))
}

/// Persist already-serialized `yaml` as `<oem_dir>/100_<name>.yaml`, overwriting any previous copy.
pub async fn save_oem_yaml(oem_dir: &Path, name: &str, yaml: &str) -> Result<PathBuf> {
    let path = oem_path(oem_dir, name);
    let persist_err = |source| ProvisionError::ConfigPersist {
        path: path.clone(),
        source,
    };

    tokio::fs::write(&path, yaml).await.map_err(persist_err)?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(OEM_FILE_MODE))
        .await
        .map_err(persist_err)?;

    Ok(path)
}
