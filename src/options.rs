//! Option resolution for the EdgeVPN daemon.
//!
//! Turns a `NodeConfig` into the daemon's environment (`OptionMap`) and,
//! when the DNS feature is on, the DNS redirection cloud-config. Pure: all
//! I/O belongs to the provisioner.

use std::collections::BTreeMap;

use crate::config::NodeConfig;
use crate::error::{ProvisionError, Result};
use crate::system::cloud_config::{CloudConfig, DnsDirective, FileDirective, Stage};

pub const KEY_TOKEN: &str = "EDGEVPNTOKEN";
pub const KEY_API: &str = "API";
pub const KEY_API_LISTEN: &str = "APILISTEN";
pub const KEY_DHCP: &str = "DHCP";
pub const KEY_DHCP_LEASE_DIR: &str = "DHCPLEASEDIR";
pub const KEY_DNS_ADDRESS: &str = "DNSADDRESS";
pub const KEY_DNS_FORWARD: &str = "DNSFORWARD";

pub const LEASE_DIR: &str = "/usr/local/.kairos/lease";
/// Bind address of the daemon's embedded DNS server.
pub const LOCAL_DNS_ADDRESS: &str = "127.0.0.1:53";
pub const LOCAL_DNS_HOST: &str = "127.0.0.1";

pub const RESOLVED_CONF_PATH: &str = "/etc/systemd/resolved.conf";
pub const DNS_DOCUMENT_NAME: &str = "DNS Configuration";
/// Stage at which the persisted DNS document applies on later boots.
pub const DNS_DOCUMENT_STAGE: &str = "initramfs";

const SCHEMES: [&str; 2] = ["https://", "http://"];

/// Daemon options, keyed by the daemon's environment variable names.
///
/// Ordered so the rendered env file is byte-stable across runs.
pub type OptionMap = BTreeMap<String, String>;

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub options: OptionMap,
    pub dns: Option<CloudConfig>,
}

/// Merge option layers in order; a later layer replaces colliding keys.
pub fn merge_layers<'a, I>(layers: I) -> OptionMap
where
    I: IntoIterator<Item = &'a OptionMap>,
{
    let mut merged = OptionMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Strip leading URI schemes; the daemon only accepts a bare `host:port`.
pub fn normalize_api_address(address: &str) -> &str {
    let mut rest = address;
    while let Some(stripped) = SCHEMES.iter().find_map(|s| rest.strip_prefix(s)) {
        rest = stripped;
    }
    rest
}

/// Reject what a `KEY=VALUE` env file cannot carry: non-identifier keys and
/// line breaks or other control characters in values.
fn validate_option(key: &str, value: &str) -> Result<()> {
    let mut chars = key.chars();
    let key_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    let reason = if !key_ok {
        "name must be letters, digits and '_', not starting with a digit"
    } else if value.chars().any(|c| c.is_control() && c != '\t') {
        "value contains a line break or control character"
    } else {
        return Ok(());
    };

    Err(ProvisionError::InvalidOption {
        key: key.escape_debug().to_string(),
        reason,
    })
}

fn defaults(token: &str, api_listen: &str) -> OptionMap {
    OptionMap::from([
        (KEY_TOKEN.to_string(), token.to_string()),
        (KEY_API.to_string(), "true".to_string()),
        (KEY_API_LISTEN.to_string(), api_listen.to_string()),
        (KEY_DHCP.to_string(), "true".to_string()),
        (KEY_DHCP_LEASE_DIR.to_string(), LEASE_DIR.to_string()),
    ])
}

fn dns_options() -> OptionMap {
    OptionMap::from([
        (KEY_DNS_ADDRESS.to_string(), LOCAL_DNS_ADDRESS.to_string()),
        (KEY_DNS_FORWARD.to_string(), "true".to_string()),
    ])
}

/// Cloud-config that points the node's resolver at the daemon's local DNS server.
pub fn dns_document() -> CloudConfig {
    let stage = Stage {
        files: vec![FileDirective {
            path: RESOLVED_CONF_PATH.to_string(),
            content: format!("\n[Resolve]\nDNS={}", LOCAL_DNS_HOST),
            permissions: 0o644,
        }],
        dns: DnsDirective {
            nameservers: vec![LOCAL_DNS_HOST.to_string()],
        },
    };

    CloudConfig {
        name: DNS_DOCUMENT_NAME.to_string(),
        stages: BTreeMap::from([(DNS_DOCUMENT_STAGE.to_string(), vec![stage])]),
    }
}

/// Resolve the daemon options for `config`.
///
/// Precedence is defaults, then DNS-derived keys, then the user's `vpn`
/// overrides. Unknown override keys pass through; every entry is only
/// checked for what the env file can represent.
pub fn resolve(config: Option<&NodeConfig>, api_address: &str) -> Result<Resolved> {
    let config = config.ok_or(ProvisionError::MissingCredential)?;
    let token = config
        .network_token()
        .ok_or(ProvisionError::MissingCredential)?;

    let api_listen = normalize_api_address(api_address);
    let base = defaults(token, api_listen);

    let (derived, dns) = if config.dns_enabled() {
        (dns_options(), Some(dns_document()))
    } else {
        (OptionMap::new(), None)
    };

    let options = merge_layers([&base, &derived, &config.vpn]);
    for (key, value) in &options {
        validate_option(key, value)?;
    }

    for (key, value) in options.iter().filter(|(k, _)| k.as_str() != KEY_TOKEN) {
        tracing::debug!(%key, %value, "Resolved option");
    }

    Ok(Resolved { options, dns })
}
