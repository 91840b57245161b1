//! # Manifest Documents
//!
//! Serde types for the secrets manifest plus the load/merge logic.
//!
//! A manifest declares a list of secrets, an optional global path template
//! with default variables, and a global service reconciliation policy.
//! Multiple manifest documents may be supplied; their secrets lists are
//! concatenated and the template/defaults/policy of the last document that
//! sets them win.
//!
//! Loading is parse-only. Semantic validation (references, paths, modes,
//! principals) happens in [`crate::validation`] before any secret I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::DeployError;

/// Default file mode applied when a secret declares none.
pub const DEFAULT_MODE: &str = "0600";

/// Unit name dependent services are ordered after by default.
pub const DEPLOYER_UNIT: &str = "secrets-deployer.service";

/// One declared secret.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    /// Vault reference: `vault://Vault/Item[/Section]/Field`
    pub reference: String,
    /// Explicit output path (relative to the output dir, or absolute).
    /// When absent the global path template is used instead.
    #[serde(default)]
    pub path: Option<String>,
    /// Template variables; merged over the manifest defaults, secret wins.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Octal permission string, e.g. "0600". World-write is always rejected.
    #[serde(default)]
    pub mode: Option<String>,
    /// Additional paths symlinked at the materialized file.
    #[serde(default)]
    pub symlinks: Vec<String>,
    /// Optional value template; the resolved secret is bound as `secret`.
    /// Absent means the raw value is written verbatim.
    #[serde(default)]
    pub template: Option<String>,
    /// Dependent services, either a flat name list or per-service policies.
    #[serde(default)]
    pub services: Option<ServiceSpec>,
}

impl SecretSpec {
    /// Effective mode string, falling back to the secure default.
    #[must_use]
    pub fn mode_str(&self) -> &str {
        self.mode.as_deref().unwrap_or(DEFAULT_MODE)
    }
}

/// The `services` field is dynamically shaped in the document: either a
/// plain list of unit names or a map from unit name to policy. Modeled as
/// a sum type at the boundary; normalization into [`ServicePolicy`] values
/// happens once, in the reconciler's action extraction.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServiceSpec {
    Names(Vec<String>),
    Detailed(HashMap<String, ServicePolicy>),
}

/// Per (secret, service) action policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePolicy {
    /// Restart the unit on change. A declared signal takes precedence.
    #[serde(default = "default_true")]
    pub restart: bool,
    /// OS signal name to deliver instead of restarting, e.g. "SIGHUP".
    #[serde(default)]
    pub signal: Option<String>,
    /// Upstream ordering dependencies for the unit.
    #[serde(default = "default_after")]
    pub after: Vec<String>,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            restart: true,
            signal: None,
            after: default_after(),
        }
    }
}

/// Global reconciliation behavior for the whole run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationPolicy {
    #[serde(default = "default_true")]
    pub restart_on_change: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Policy flag only: the pipeline reports it so a deployment layer can
    /// restore backups; no restore mechanism lives in this crate.
    #[serde(default)]
    pub rollback_on_failure: bool,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            restart_on_change: true,
            continue_on_error: false,
            max_retries: default_max_retries(),
            rollback_on_failure: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_after() -> Vec<String> {
    vec![DEPLOYER_UNIT.to_string()]
}

/// One deployment run's worth of declarations.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub path_template: Option<String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    #[serde(default)]
    pub service_reconciliation: Option<ReconciliationPolicy>,
}

impl Manifest {
    /// Effective reconciliation policy (declared block or defaults).
    #[must_use]
    pub fn reconciliation_policy(&self) -> ReconciliationPolicy {
        self.service_reconciliation.clone().unwrap_or_default()
    }

    /// Load a single manifest document.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            DeployError::file_system_with_source(
                "Loading manifest file",
                path,
                "Failed to read manifest file",
                e,
            )
        })?;

        serde_json::from_str(&data).map_err(|e| {
            DeployError::configuration_with(
                format!("Parsing manifest file {}", path.display()),
                format!("Invalid JSON: {e}"),
                vec![
                    "Check the manifest for syntax errors".to_string(),
                    "The services field must be a list of names or a map of policies".to_string(),
                ],
            )
        })
    }

    /// Load and merge multiple manifest documents in order.
    ///
    /// Secrets lists concatenate. For `pathTemplate`, `defaults`, and the
    /// reconciliation policy the last document that sets them wins.
    pub fn load_multiple(paths: &[impl AsRef<Path>]) -> Result<Self, DeployError> {
        if paths.is_empty() {
            return Err(DeployError::configuration(
                "Loading manifests",
                "No manifest file paths provided",
            ));
        }

        let mut merged = Manifest::default();
        for path in paths {
            let manifest = Self::load(path.as_ref())?;
            merged.secrets.extend(manifest.secrets);
            if manifest.path_template.is_some() {
                merged.path_template = manifest.path_template;
            }
            if !manifest.defaults.is_empty() {
                merged.defaults = manifest.defaults;
            }
            if manifest.service_reconciliation.is_some() {
                merged.service_reconciliation = manifest.service_reconciliation;
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_secret() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"secrets": [{"reference": "vault://Homelab/Database/password", "path": "db/password"}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.secrets.len(), 1);
        let secret = &manifest.secrets[0];
        assert_eq!(secret.mode_str(), "0600");
        assert!(secret.services.is_none());
        assert!(secret.template.is_none());
    }

    #[test]
    fn test_parse_flat_service_list() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"secrets": [{"reference": "vault://V/I/f", "path": "p", "services": ["postgresql", "nginx"]}]}"#,
        )
        .unwrap();
        match manifest.secrets[0].services.as_ref().unwrap() {
            ServiceSpec::Names(names) => assert_eq!(names, &["postgresql", "nginx"]),
            ServiceSpec::Detailed(_) => panic!("expected flat list"),
        }
    }

    #[test]
    fn test_parse_detailed_service_map() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "secrets": [{
                    "reference": "vault://V/I/f",
                    "path": "p",
                    "services": {
                        "nginx": {"restart": false, "signal": "SIGHUP"},
                        "postgresql": {}
                    }
                }]
            }"#,
        )
        .unwrap();
        match manifest.secrets[0].services.as_ref().unwrap() {
            ServiceSpec::Detailed(map) => {
                let nginx = &map["nginx"];
                assert!(!nginx.restart);
                assert_eq!(nginx.signal.as_deref(), Some("SIGHUP"));
                let pg = &map["postgresql"];
                assert!(pg.restart);
                assert_eq!(pg.after, vec![DEPLOYER_UNIT.to_string()]);
            }
            ServiceSpec::Names(_) => panic!("expected detailed map"),
        }
    }

    #[test]
    fn test_reconciliation_policy_defaults() {
        let policy = ReconciliationPolicy::default();
        assert!(policy.restart_on_change);
        assert!(!policy.continue_on_error);
        assert_eq!(policy.max_retries, 3);
        assert!(!policy.rollback_on_failure);
    }

    #[test]
    fn test_merge_last_document_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        std::fs::write(
            &first,
            r#"{"secrets": [{"reference": "vault://V/A/f", "path": "a"}],
                "pathTemplate": "/etc/first/{name}",
                "defaults": {"env": "dev"}}"#,
        )
        .unwrap();
        std::fs::write(
            &second,
            r#"{"secrets": [{"reference": "vault://V/B/f", "path": "b"}],
                "defaults": {"env": "prod"}}"#,
        )
        .unwrap();

        let merged = Manifest::load_multiple(&[&first, &second]).unwrap();
        assert_eq!(merged.secrets.len(), 2);
        assert_eq!(merged.path_template.as_deref(), Some("/etc/first/{name}"));
        assert_eq!(merged.defaults["env"], "prod");
    }

    #[test]
    fn test_load_multiple_empty_is_configuration_error() {
        let paths: [&Path; 0] = [];
        let err = Manifest::load_multiple(&paths).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }
}
