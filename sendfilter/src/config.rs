use std::collections::BTreeSet;
use std::time::Duration;

use ::config::{Config, Environment, File};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;

use crate::activity::Backend;
use crate::disposable::DisposableSettings;
use crate::error::FilterError;
use crate::pipeline::FilterConfiguration;
use crate::roles::{RoleId, RoleThresholds};

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub filter: CfgFilter,
    #[serde(default)]
    pub disposable: CfgDisposable,
    #[serde(default)]
    pub dns: CfgDns,
    pub storage: CfgStorage,
    pub directory: CfgDirectory,
    /// `"json"` for JSON log lines, anything else for human readable output.
    pub log_format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CfgFilter {
    pub check_disposable: bool,
    pub check_mx_record: bool,
    pub check_inactivity: bool,
    pub check_never_logged_in: bool,
    pub check_not_validated: bool,
    /// Unvalidated accounts only exist when the host application requires
    /// validation, so `check_not_validated` is ignored without it.
    pub require_validation: bool,
    pub inactivity_threshold_days: u64,
    pub passthrough_keys: Vec<String>,
    pub roles: Vec<CfgRole>,
    pub unassigned_threshold_days: Option<i64>,
    pub assigned_submission_threshold_days: Option<i64>,
    /// Upper bound for one filtering run.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CfgRole {
    pub id: i64,
    pub name: String,
    pub threshold_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CfgDisposable {
    pub url: Option<String>,
    pub expiration_days: u32,
    pub fetch_timeout_secs: u64,
}

impl Default for CfgDisposable {
    fn default() -> Self {
        CfgDisposable {
            url: None,
            expiration_days: 0,
            fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CfgDns {
    pub lookup_timeout_secs: u64,
}

impl Default for CfgDns {
    fn default() -> Self {
        CfgDns {
            lookup_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CfgStorage {
    pub storage_type: String,
    pub base_path: String,
}

#[derive(Debug, Deserialize)]
pub struct CfgDirectory {
    pub backend: String,
    pub path: String,
}

impl Cfg {
    /// Reads `cfg_path`, then applies `SENDFILTER__SECTION__KEY` environment overrides.
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .add_source(
                Environment::with_prefix("SENDFILTER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .into_diagnostic()
            .wrap_err_with(|| format!("reading configuration from {}", cfg_path))?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }

    pub fn backend(&self) -> std::result::Result<Backend, FilterError> {
        self.directory.backend.parse()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.disposable.fetch_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.dns.lookup_timeout_secs)
    }

    pub fn filter_timeout(&self) -> Option<Duration> {
        self.filter.timeout_ms.map(Duration::from_millis)
    }

    pub fn filter_configuration(&self) -> FilterConfiguration {
        let filter = &self.filter;
        FilterConfiguration {
            check_disposable: filter.check_disposable,
            check_mx_record: filter.check_mx_record,
            check_inactivity: filter.check_inactivity,
            check_never_logged_in: filter.check_never_logged_in,
            check_not_validated: filter.check_not_validated && filter.require_validation,
            inactivity_threshold_days: filter.inactivity_threshold_days,
            disposable: DisposableSettings {
                url: self.disposable.url.clone(),
                expiration_days: self.disposable.expiration_days,
            },
            passthrough_keys: filter.passthrough_keys.iter().cloned().collect::<BTreeSet<_>>(),
            role_thresholds: filter.role_thresholds(),
        }
    }
}

impl CfgFilter {
    pub fn role_thresholds(&self) -> RoleThresholds {
        let mut thresholds: RoleThresholds = self
            .roles
            .iter()
            .map(|role| (RoleId(role.id), role.threshold_days))
            .collect();
        thresholds.insert(RoleId::UNASSIGNED_ROLE, self.unassigned_threshold_days);
        thresholds.insert(
            RoleId::ASSIGNED_SUBMISSION,
            self.assigned_submission_threshold_days,
        );
        thresholds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
log_format = "json"

[filter]
check_disposable = true
check_mx_record = true
check_inactivity = true
check_not_validated = true
inactivity_threshold_days = 60
passthrough_keys = ["PASSWORD_RESET"]
unassigned_threshold_days = 365
timeout_ms = 1500

[[filter.roles]]
id = 16
name = "Journal manager"
threshold_days = 0

[[filter.roles]]
id = 65536
name = "Author"
threshold_days = -90

[[filter.roles]]
id = 1048576
name = "Reader"

[disposable]
url = "https://lists.example/disposable.txt"
expiration_days = 14

[storage]
storage_type = "filesystem"
base_path = "/var/lib/sendfilter"

[directory]
backend = "sqlite"
path = "/var/lib/app/app.db"
"#;

    fn load_sample() -> Cfg {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sendfilter.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        Cfg::load(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_load_sample_configuration() {
        let cfg = load_sample();

        assert_eq!(cfg.log_format.as_deref(), Some("json"));
        assert_eq!(cfg.backend().unwrap(), Backend::Sqlite);
        assert_eq!(cfg.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.lookup_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.filter_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(cfg.filter.roles[0].name, "Journal manager");
        assert_eq!(cfg.storage.storage_type, "filesystem");
    }

    #[test]
    fn test_filter_configuration_mapping() {
        let config = load_sample().filter_configuration();

        assert!(config.check_disposable);
        assert!(!config.check_never_logged_in);
        // Validation is not required, so the check has nothing to find.
        assert!(!config.check_not_validated);
        assert_eq!(config.inactivity_threshold_days, 60);
        assert!(config.is_passthrough("PASSWORD_RESET"));
        assert_eq!(config.disposable.expiration_days, 14);
        assert_eq!(
            config.role_thresholds,
            RoleThresholds::from([
                (RoleId::ASSIGNED_SUBMISSION, None),
                (RoleId::UNASSIGNED_ROLE, Some(365)),
                (RoleId(16), Some(0)),
                (RoleId(65536), Some(-90)),
                (RoleId(1048576), None),
            ])
        );
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut cfg = load_sample();
        cfg.directory.backend = "oracle".to_string();
        assert!(matches!(
            cfg.backend(),
            Err(FilterError::UnsupportedBackend { .. })
        ));
    }
}
