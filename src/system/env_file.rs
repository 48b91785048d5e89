//! Environment file consumed by the service manager (`KEY=VALUE` per line).
//!
//! Values outside a conservative unquoted alphabet are double-quoted with
//! `\`, `"`, `$` and `` ` `` escaped, which both systemd's `EnvironmentFile=`
//! and a POSIX shell (OpenRC scripts source the file) read back verbatim.

use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::options::OptionMap;

/// Override directory, relative to the provisioning root.
pub const OVERRIDE_DIR: &str = "etc/systemd/system.conf.d";

/// `<root>/etc/systemd/system.conf.d/edgevpn-<realm>.env`
pub fn env_path(root_dir: &Path, realm: &str) -> PathBuf {
    root_dir
        .join(OVERRIDE_DIR)
        .join(format!("edgevpn-{}.env", realm))
}

const UNQUOTED_PUNCT: &str = "_-./:@,+=%[]";

fn needs_quoting(value: &str) -> bool {
    !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || UNQUOTED_PUNCT.contains(c))
}

fn push_value(out: &mut String, value: &str) {
    if !needs_quoting(value) {
        out.push_str(value);
        return;
    }

    out.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Render options one per line, in key order.
///
/// Keys and values are expected to have passed `options::resolve`, which
/// rejects line breaks and other control characters.
pub fn render(options: &OptionMap) -> String {
    let mut out = String::new();
    for (key, value) in options {
        out.push_str(key);
        out.push('=');
        push_value(&mut out, value);
        out.push('\n');
    }
    out
}

/// Overwrite `path` with the rendered options.
pub async fn write(path: &Path, options: &OptionMap) -> Result<()> {
    tokio::fs::write(path, render(options))
        .await
        .map_err(|source| ProvisionError::EnvWrite {
            path: path.to_path_buf(),
            source,
        })
}
