//! EdgeVPN service provisioning.
//!
//! Runs the setup steps strictly in order and stops at the first failure:
//!
//! 1. acquire the service handle
//! 2. resolve daemon options
//! 3. apply the DNS document for this boot (best-effort), then persist it
//! 4. ensure the override directory exists
//! 5. write the env file
//! 6. write the unit
//! 7. optionally start, then enable
//!
//! Nothing written before a failing step is rolled back; provisioning is
//! re-run on the next boot.

use std::io::ErrorKind;
use std::path::Path;

use crate::config::{DirectoryErrors, NodeConfig, Settings};
use crate::error::{ProvisionError, Result};
use crate::options;
use crate::system::cloud_config::save_oem_yaml;
use crate::system::{env_file, InlineExecutor, ServiceFactory, ServiceHandle};

/// Persisted name of the DNS document (`100_vpn_dns.yaml`).
pub const DNS_CONFIG_NAME: &str = "vpn_dns";

pub struct Provisioner<F, E> {
    factory: F,
    executor: E,
    settings: Settings,
}

impl<F, E> Provisioner<F, E>
where
    F: ServiceFactory,
    E: InlineExecutor,
{
    pub fn new(factory: F, executor: E, settings: Settings) -> Self {
        Self {
            factory,
            executor,
            settings,
        }
    }

    /// Set up (and optionally start) the EdgeVPN service for `instance`.
    pub async fn provision(
        &self,
        instance: &str,
        api_address: &str,
        root_dir: &Path,
        start: bool,
        config: Option<&NodeConfig>,
    ) -> Result<()> {
        let svc = self.factory.create(instance, root_dir)?;
        let resolved = options::resolve(config, api_address)?;

        if let Some(document) = &resolved.dns {
            let yaml = document.to_yaml()?;

            if let Err(e) = self
                .executor
                .apply(&yaml, &self.settings.inline_stage)
                .await
            {
                tracing::warn!(error = %e, "Could not apply DNS config for the current boot");
            }

            let path = save_oem_yaml(&self.settings.oem_dir, DNS_CONFIG_NAME, &yaml).await?;
            tracing::info!(path = %path.display(), "Persisted DNS config");
        }

        self.ensure_override_dir(&root_dir.join(env_file::OVERRIDE_DIR))
            .await?;

        let env_path = env_file::env_path(root_dir, instance);
        env_file::write(&env_path, &resolved.options).await?;
        tracing::info!(path = %env_path.display(), "Wrote EdgeVPN env file");

        svc.write_unit()
            .await
            .map_err(|e| ProvisionError::UnitWrite(Box::new(e)))?;
        tracing::info!(%instance, "Wrote EdgeVPN unit");

        if !start {
            return Ok(());
        }

        svc.start()
            .await
            .map_err(|e| ProvisionError::ServiceStart(Box::new(e)))?;
        svc.enable()
            .await
            .map_err(|e| ProvisionError::ServiceEnable(Box::new(e)))?;
        tracing::info!(%instance, "EdgeVPN started and enabled");

        Ok(())
    }

    async fn ensure_override_dir(&self, dir: &Path) -> Result<()> {
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
            Err(e) => match self.settings.directory_errors {
                DirectoryErrors::Strict => Err(ProvisionError::DirectoryCreate {
                    path: dir.to_path_buf(),
                    source: e,
                }),
                DirectoryErrors::Ignore => {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Ignoring directory creation failure"
                    );
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSection;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type CallLog = Arc<Mutex<Vec<String>>>;
    type TestProvisioner = Provisioner<FakeFactory, RecordingExecutor>;

    #[derive(Default, Clone)]
    struct FakeService {
        calls: CallLog,
        fail: Option<&'static str>,
    }

    impl FakeService {
        fn step(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(name.to_string());
            if self.fail == Some(name) {
                return Err(ProvisionError::CommandFailed {
                    command: name.to_string(),
                    message: "injected".into(),
                });
            }
            Ok(())
        }
    }

    impl ServiceHandle for FakeService {
        async fn write_unit(&self) -> Result<()> {
            self.step("write_unit")
        }
        async fn start(&self) -> Result<()> {
            self.step("start")
        }
        async fn enable(&self) -> Result<()> {
            self.step("enable")
        }
    }

    #[derive(Default, Clone)]
    struct FakeFactory {
        service: FakeService,
        refuse: bool,
    }

    impl FakeFactory {
        fn failing_at(step: &'static str) -> Self {
            Self {
                service: FakeService {
                    fail: Some(step),
                    ..FakeService::default()
                },
                ..Self::default()
            }
        }
    }

    impl ServiceFactory for FakeFactory {
        type Handle = FakeService;

        fn create(&self, instance: &str, _root_dir: &Path) -> Result<FakeService> {
            if self.refuse {
                return Err(ProvisionError::ServiceHandle {
                    instance: instance.to_string(),
                    message: "refused".into(),
                });
            }
            Ok(self.service.clone())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingExecutor {
        applied: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    impl InlineExecutor for RecordingExecutor {
        async fn apply(&self, yaml: &str, stage: &str) -> Result<()> {
            self.applied
                .lock()
                .unwrap()
                .push((yaml.to_string(), stage.to_string()));
            if self.fail {
                return Err(ProvisionError::CommandFailed {
                    command: "inline".into(),
                    message: "injected".into(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        root: TempDir,
        oem: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                oem: tempfile::tempdir().unwrap(),
            }
        }

        fn settings(&self) -> Settings {
            Settings {
                oem_dir: self.oem.path().to_path_buf(),
                ..Settings::default()
            }
        }

        fn provisioner(&self, factory: &FakeFactory) -> TestProvisioner {
            Provisioner::new(
                factory.clone(),
                RecordingExecutor::default(),
                self.settings(),
            )
        }

        fn env_path(&self) -> PathBuf {
            self.root
                .path()
                .join("etc/systemd/system.conf.d/edgevpn-kairos.env")
        }

        fn oem_path(&self) -> PathBuf {
            self.oem.path().join("100_vpn_dns.yaml")
        }
    }

    /// Provision instance `kairos` under the fixture root.
    async fn setup(
        provisioner: &TestProvisioner,
        fx: &Fixture,
        api_address: &str,
        start: bool,
        config: Option<&NodeConfig>,
    ) -> Result<()> {
        provisioner
            .provision("kairos", api_address, fx.root.path(), start, config)
            .await
    }

    fn node(token: &str, dns: bool) -> NodeConfig {
        NodeConfig {
            kairos: Some(NetworkSection {
                network_token: token.to_string(),
                dns,
            }),
            ..NodeConfig::default()
        }
    }

    fn calls(factory: &FakeFactory) -> Vec<String> {
        factory.service.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_setup_without_start() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let provisioner = fx.provisioner(&factory);

        let config = node("tok123", false);
        setup(&provisioner, &fx, "http://127.0.0.1:8080", false, Some(&config))
            .await
            .unwrap();

        let env = std::fs::read_to_string(fx.env_path()).unwrap();
        assert!(env.lines().any(|l| l == "EDGEVPNTOKEN=tok123"));
        assert!(env.lines().any(|l| l == "APILISTEN=127.0.0.1:8080"));
        assert!(!env.contains("DNSADDRESS"));
        assert_eq!(calls(&factory), vec!["write_unit"]);
        assert!(!fx.oem_path().exists());
    }

    #[tokio::test]
    async fn test_setup_with_start() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let provisioner = fx.provisioner(&factory);

        setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", false)))
            .await
            .unwrap();

        assert_eq!(calls(&factory), vec!["write_unit", "start", "enable"]);
    }

    #[tokio::test]
    async fn test_missing_credential_writes_nothing() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let executor = RecordingExecutor::default();
        let provisioner = Provisioner::new(factory.clone(), executor.clone(), fx.settings());

        for config in [None, Some(node("", true))] {
            let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, config.as_ref())
                .await
                .unwrap_err();
            assert!(matches!(err, ProvisionError::MissingCredential));
        }

        assert_eq!(std::fs::read_dir(fx.root.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(fx.oem.path()).unwrap().count(), 0);
        assert!(calls(&factory).is_empty());
        assert!(executor.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multiline_override_writes_nothing() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let provisioner = fx.provisioner(&factory);

        let mut config = node("tok123", true);
        config.vpn.insert(
            "ADDRESS".into(),
            "10.1.0.2/24\nEDGEVPNTOKEN=attacker".into(),
        );

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&config))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidOption { .. }));
        assert!(!fx.env_path().exists());
        assert!(!fx.oem_path().exists());
        assert!(calls(&factory).is_empty());
    }

    #[tokio::test]
    async fn test_quoted_override_keeps_single_token_line() {
        let fx = Fixture::new();
        let provisioner = fx.provisioner(&FakeFactory::default());

        let mut config = node("tok123", false);
        config
            .vpn
            .insert("LABEL".into(), "edge \"lab\" EDGEVPNTOKEN=x".into());

        setup(&provisioner, &fx, "127.0.0.1:8080", false, Some(&config))
            .await
            .unwrap();

        let env = std::fs::read_to_string(fx.env_path()).unwrap();
        let token_lines: Vec<&str> = env
            .lines()
            .filter(|l| l.starts_with("EDGEVPNTOKEN="))
            .collect();
        assert_eq!(token_lines, vec!["EDGEVPNTOKEN=tok123"]);
        assert!(env
            .lines()
            .any(|l| l == r#"LABEL="edge \"lab\" EDGEVPNTOKEN=x""#));
    }

    #[tokio::test]
    async fn test_service_handle_failure() {
        let fx = Fixture::new();
        let factory = FakeFactory {
            refuse: true,
            ..FakeFactory::default()
        };
        let provisioner = fx.provisioner(&factory);

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", true)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ServiceHandle { .. }));
        assert!(!fx.env_path().exists());
        assert!(!fx.oem_path().exists());
    }

    #[tokio::test]
    async fn test_dns_applied_and_persisted() {
        let fx = Fixture::new();
        let executor = RecordingExecutor::default();
        let provisioner =
            Provisioner::new(FakeFactory::default(), executor.clone(), fx.settings());

        setup(&provisioner, &fx, "127.0.0.1:8080", false, Some(&node("tok", true)))
            .await
            .unwrap();

        let persisted = std::fs::read_to_string(fx.oem_path()).unwrap();
        let applied = executor.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, persisted);
        assert_eq!(applied[0].1, "network");

        let env = std::fs::read_to_string(fx.env_path()).unwrap();
        assert!(env.contains("DNSADDRESS=127.0.0.1:53\n"));
        assert!(env.contains("DNSFORWARD=true\n"));
    }

    #[tokio::test]
    async fn test_inline_failure_is_ignored() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let executor = RecordingExecutor {
            fail: true,
            ..RecordingExecutor::default()
        };
        let provisioner = Provisioner::new(factory.clone(), executor, fx.settings());

        setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", true)))
            .await
            .unwrap();

        assert!(fx.oem_path().exists());
        assert_eq!(calls(&factory), vec!["write_unit", "start", "enable"]);
    }

    #[tokio::test]
    async fn test_persist_failure_aborts() {
        let fx = Fixture::new();
        let factory = FakeFactory::default();
        let settings = Settings {
            oem_dir: fx.oem.path().join("missing"),
            ..Settings::default()
        };
        let provisioner =
            Provisioner::new(factory.clone(), RecordingExecutor::default(), settings);

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", true)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::ConfigPersist { .. }));
        assert!(!fx.env_path().exists());
        assert!(calls(&factory).is_empty());
    }

    #[tokio::test]
    async fn test_unit_failure_keeps_env_and_skips_start() {
        let fx = Fixture::new();
        let factory = FakeFactory::failing_at("write_unit");
        let provisioner = fx.provisioner(&factory);

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", false)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::UnitWrite(_)));
        assert_eq!(err.to_string(), "could not write unit file");
        assert!(fx.env_path().exists());
        assert_eq!(calls(&factory), vec!["write_unit"]);
    }

    #[tokio::test]
    async fn test_start_failure_skips_enable() {
        let fx = Fixture::new();
        let factory = FakeFactory::failing_at("start");
        let provisioner = fx.provisioner(&factory);

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", false)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::ServiceStart(_)));
        assert_eq!(err.to_string(), "could not start svc");
        assert_eq!(calls(&factory), vec!["write_unit", "start"]);
    }

    #[tokio::test]
    async fn test_enable_failure_reported() {
        let fx = Fixture::new();
        let provisioner = fx.provisioner(&FakeFactory::failing_at("enable"));

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", false)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ServiceEnable(_)));
    }

    #[tokio::test]
    async fn test_rerun_is_byte_identical() {
        let fx = Fixture::new();
        let provisioner = fx.provisioner(&FakeFactory::default());
        let mut config = node("tok", true);
        config.vpn.insert("ADDRESS".into(), "10.1.0.2/24".into());

        setup(&provisioner, &fx, "https://127.0.0.1:8080", false, Some(&config))
            .await
            .unwrap();
        let env_first = std::fs::read(fx.env_path()).unwrap();
        let dns_first = std::fs::read(fx.oem_path()).unwrap();

        setup(&provisioner, &fx, "https://127.0.0.1:8080", false, Some(&config))
            .await
            .unwrap();

        assert_eq!(std::fs::read(fx.env_path()).unwrap(), env_first);
        assert_eq!(std::fs::read(fx.oem_path()).unwrap(), dns_first);
    }

    #[tokio::test]
    async fn test_directory_error_policy() {
        let fx = Fixture::new();
        // A regular file where the override directory's parent should be.
        std::fs::create_dir_all(fx.root.path().join("etc")).unwrap();
        std::fs::write(fx.root.path().join("etc/systemd"), "").unwrap();

        let strict = fx.provisioner(&FakeFactory::default());
        let err = setup(&strict, &fx, "127.0.0.1:8080", false, Some(&node("tok", false)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DirectoryCreate { .. }));

        let lenient = Provisioner::new(
            FakeFactory::default(),
            RecordingExecutor::default(),
            Settings {
                directory_errors: DirectoryErrors::Ignore,
                ..fx.settings()
            },
        );
        let err = setup(&lenient, &fx, "127.0.0.1:8080", false, Some(&node("tok", false)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::EnvWrite { .. }));
    }

    #[tokio::test]
    async fn test_file_at_override_dir_is_strict_error() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.root.path().join("etc/systemd")).unwrap();
        std::fs::write(fx.root.path().join(env_file::OVERRIDE_DIR), "").unwrap();
        let factory = FakeFactory::default();
        let provisioner = fx.provisioner(&factory);

        let err = setup(&provisioner, &fx, "127.0.0.1:8080", true, Some(&node("tok", false)))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::DirectoryCreate { .. }));
        assert!(calls(&factory).is_empty());
    }

    #[tokio::test]
    async fn test_existing_override_dir_is_fine() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.root.path().join(env_file::OVERRIDE_DIR)).unwrap();
        let provisioner = fx.provisioner(&FakeFactory::default());

        setup(&provisioner, &fx, "127.0.0.1:8080", false, Some(&node("tok", false)))
            .await
            .unwrap();
        assert!(fx.env_path().exists());
    }
}
