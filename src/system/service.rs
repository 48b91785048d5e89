//! EdgeVPN service definitions for systemd and OpenRC nodes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::InitSystemChoice;
use crate::error::{ProvisionError, Result};
use crate::system::env_file;

const SERVICE_NAME: &str = "edgevpn";

const SYSTEMD_UNIT: &str = "[Unit]
Description=EdgeVPN Daemon
After=network.target
[Service]
EnvironmentFile=/etc/systemd/system.conf.d/edgevpn-%i.env
LimitNOFILE=49152
ExecStart=edgevpn
Restart=always
[Install]
WantedBy=multi-user.target
";

/// Control over one service in the node's service manager.
#[allow(async_fn_in_trait)]
pub trait ServiceHandle {
    /// Write (or overwrite) the service definition.
    async fn write_unit(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    /// Start the service on future boots.
    async fn enable(&self) -> Result<()>;
}

/// Builds a [`ServiceHandle`] for an instance rooted at a directory.
pub trait ServiceFactory {
    type Handle: ServiceHandle;

    fn create(&self, instance: &str, root_dir: &Path) -> Result<Self::Handle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    OpenRc,
}

impl InitSystem {
    /// OpenRC if `<root>/sbin/openrc` exists, systemd otherwise.
    pub fn detect(root_dir: &Path) -> Self {
        if root_dir.join("sbin/openrc").exists() {
            InitSystem::OpenRc
        } else {
            InitSystem::Systemd
        }
    }
}

/// The EdgeVPN service for one instance.
#[derive(Debug, Clone)]
pub struct EdgeVpnService {
    init: InitSystem,
    instance: String,
    root_dir: PathBuf,
}

impl EdgeVpnService {
    pub fn new(init: InitSystem, instance: &str, root_dir: &Path) -> Result<Self> {
        validate_instance(instance)?;
        Ok(Self {
            init,
            instance: instance.to_string(),
            root_dir: root_dir.to_path_buf(),
        })
    }

    /// Name the service manager knows this instance by.
    pub fn unit_name(&self) -> String {
        match self.init {
            InitSystem::Systemd => format!("{}@{}", SERVICE_NAME, self.instance),
            InitSystem::OpenRc => format!("{}-{}", SERVICE_NAME, self.instance),
        }
    }

    /// Where `write_unit` puts the service definition.
    pub fn unit_path(&self) -> PathBuf {
        match self.init {
            InitSystem::Systemd => self
                .root_dir
                .join("etc/systemd/system")
                .join(format!("{}@.service", SERVICE_NAME)),
            InitSystem::OpenRc => self.root_dir.join("etc/init.d").join(self.unit_name()),
        }
    }

    pub fn unit_content(&self) -> String {
        match self.init {
            InitSystem::Systemd => SYSTEMD_UNIT.to_string(),
            InitSystem::OpenRc => openrc_script(&self.instance),
        }
    }

    fn is_host_root(&self) -> bool {
        self.root_dir == Path::new("/")
    }
}

fn validate_instance(instance: &str) -> Result<()> {
    let message = if instance.is_empty() {
        "instance name is empty"
    } else if instance.contains('/') {
        "instance name contains '/'"
    } else if instance.chars().any(char::is_whitespace) {
        "instance name contains whitespace"
    } else {
        return Ok(());
    };

    Err(ProvisionError::ServiceHandle {
        instance: instance.to_string(),
        message: message.to_string(),
    })
}

fn openrc_script(instance: &str) -> String {
    // Env path as seen from inside the node, independent of the provisioning root.
    let env = env_file::env_path(Path::new("/"), instance);
    format!(
        r#"#!/sbin/openrc-run

depend() {{
    after net
    provide {name}
}}

supervisor=supervise-daemon
name="{name}"
command="{name}"
log_file="/var/log/{name}-{instance}.log"
supervise_daemon_args="--stdout $log_file --stderr $log_file"
pidfile="/run/{name}-{instance}.pid"
respawn_delay=5
set -o allexport
if [ -f {env} ]; then . {env}; fi
set +o allexport
"#,
        name = SERVICE_NAME,
        instance = instance,
        env = env.display(),
    )
}

impl ServiceHandle for EdgeVpnService {
    async fn write_unit(&self) -> Result<()> {
        let path = self.unit_path();
        let unit_err = |source| ProvisionError::UnitFile {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(unit_err)?;
        }
        tokio::fs::write(&path, self.unit_content())
            .await
            .map_err(unit_err)?;

        if self.init == InitSystem::OpenRc {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(unit_err)?;
        }

        tracing::debug!(path = %path.display(), "Wrote service definition");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let unit = self.unit_name();
        match self.init {
            InitSystem::Systemd => run("systemctl", &["start", unit.as_str()]).await,
            InitSystem::OpenRc => run("rc-service", &[unit.as_str(), "start"]).await,
        }
    }

    async fn enable(&self) -> Result<()> {
        let unit = self.unit_name();
        match self.init {
            InitSystem::Systemd if self.is_host_root() => {
                run("systemctl", &["enable", unit.as_str()]).await
            }
            InitSystem::Systemd => {
                let root = format!("--root={}", self.root_dir.display());
                run("systemctl", &[root.as_str(), "enable", unit.as_str()]).await
            }
            InitSystem::OpenRc => run("rc-update", &["add", unit.as_str(), "default"]).await,
        }
    }
}

/// Picks the init system per `InitSystemChoice`, detecting it under the root when `Auto`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitSystemFactory {
    choice: InitSystemChoice,
}

impl InitSystemFactory {
    pub fn new(choice: InitSystemChoice) -> Self {
        Self { choice }
    }
}

impl ServiceFactory for InitSystemFactory {
    type Handle = EdgeVpnService;

    fn create(&self, instance: &str, root_dir: &Path) -> Result<EdgeVpnService> {
        let init = match self.choice {
            InitSystemChoice::Auto => InitSystem::detect(root_dir),
            InitSystemChoice::Systemd => InitSystem::Systemd,
            InitSystemChoice::Openrc => InitSystem::OpenRc,
        };
        EdgeVpnService::new(init, instance, root_dir)
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let command = format!("{} {}", program, args.join(" "));
    tracing::debug!(%command, "Running service manager command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProvisionError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Access denied") || stderr.contains("Permission denied") {
            return Err(ProvisionError::PermissionDenied);
        }
        return Err(ProvisionError::CommandFailed {
            command,
            message: stderr.trim().to_string(),
        });
    }

    Ok(())
}
