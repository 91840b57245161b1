//! End-to-end pipeline tests with in-memory vault and service-manager
//! fakes. Every scenario runs against a real temp directory so atomic
//! writes, modes, and hash persistence are exercised for real.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use zeroize::Zeroizing;

use secrets_deployer::error::{DeployError, VaultErrorKind};
use secrets_deployer::manifest::Manifest;
use secrets_deployer::pipeline::{Pipeline, PipelineConfig};
use secrets_deployer::reconciler::ServiceManager;
use secrets_deployer::validation::PrincipalLookup;
use secrets_deployer::vault::VaultClient;

/// In-memory vault that counts resolutions per reference.
#[derive(Default)]
struct FakeVault {
    values: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl FakeVault {
    fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            values: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl VaultClient for FakeVault {
    async fn resolve_secret(&self, reference: &str) -> Result<Zeroizing<String>, DeployError> {
        self.calls.lock().unwrap().push(reference.to_string());
        self.values
            .get(reference)
            .map(|v| Zeroizing::new(v.clone()))
            .ok_or_else(|| {
                DeployError::vault(
                    VaultErrorKind::NotFound,
                    "Resolving secret",
                    format!("No value for {reference}"),
                )
            })
    }
}

/// Service manager that records every dispatched action.
#[derive(Default)]
struct FakeServices {
    calls: Mutex<Vec<String>>,
}

impl FakeServices {
    fn record(&self, entry: String) -> Result<(), DeployError> {
        self.calls.lock().unwrap().push(entry);
        Ok(())
    }

    fn actions(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn restart(&self, unit: &str) -> Result<(), DeployError> {
        self.record(format!("restart {unit}"))
    }
    async fn reload(&self, unit: &str) -> Result<(), DeployError> {
        self.record(format!("reload {unit}"))
    }
    async fn send_signal(&self, unit: &str, signal: &str) -> Result<(), DeployError> {
        self.record(format!("signal {signal} {unit}"))
    }
    async fn is_active(&self, _unit: &str) -> Result<bool, DeployError> {
        Ok(true)
    }
    async fn unit_exists(&self, _unit: &str) -> Result<bool, DeployError> {
        Ok(true)
    }
}

/// Principals that exist on any Linux host the tests run on.
struct RootOnly;

impl PrincipalLookup for RootOnly {
    fn user_exists(&self, name: &str) -> bool {
        name == "root"
    }
    fn group_exists(&self, name: &str) -> bool {
        name == "root"
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    output_dir: PathBuf,
    state_file: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("secrets");
        let state_file = dir.path().join("state/hashes.json");
        Self {
            _dir: dir,
            output_dir,
            state_file,
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            output_dir: self.output_dir.clone(),
            state_file: self.state_file.clone(),
            dry_run: false,
        }
    }
}

fn manifest(json: &str) -> Manifest {
    serde_json::from_str(json).unwrap()
}

#[tokio::test]
async fn test_happy_path_materializes_and_restarts_once() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://Homelab/Database/password", "s3cr3t")]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{
            "secrets": [{
                "reference": "vault://Homelab/Database/password",
                "path": "db-secret",
                "mode": "0600",
                "services": ["postgresql"]
            }]
        }"#,
    );

    let pipeline = Pipeline::new(&vault, &services, &RootOnly, harness.config());
    let report = pipeline.run(&manifest).await.unwrap();

    let target = harness.output_dir.join("db-secret");
    assert_eq!(fs::read_to_string(&target).unwrap(), "s3cr3t");
    let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o600);

    assert_eq!(report.changed_paths, vec![target]);
    assert_eq!(report.services_dispatched, vec!["postgresql".to_string()]);
    assert_eq!(services.actions(), vec!["restart postgresql".to_string()]);
    assert!(!report.rollback_requested);
}

#[tokio::test]
async fn test_steady_state_rerun_dispatches_nothing() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://Homelab/Database/password", "stable")]);
    let services = FakeServices::default();

    let doc = r#"{
        "secrets": [{
            "reference": "vault://Homelab/Database/password",
            "path": "db-secret",
            "services": ["postgresql"]
        }]
    }"#;

    let pipeline = Pipeline::new(&vault, &services, &RootOnly, harness.config());
    pipeline.run(&manifest(doc)).await.unwrap();
    assert_eq!(services.actions().len(), 1);

    // Same manifest, same value: no change, no service action.
    let report = pipeline.run(&manifest(doc)).await.unwrap();
    assert!(report.changed_paths.is_empty());
    assert!(report.services_dispatched.is_empty());
    assert_eq!(services.actions().len(), 1);
}

#[tokio::test]
async fn test_changed_value_triggers_restart_again() {
    let harness = Harness::new();
    let services = FakeServices::default();
    let doc = r#"{
        "secrets": [{
            "reference": "vault://V/I/f",
            "path": "value",
            "services": ["app"]
        }]
    }"#;

    let vault = FakeVault::with(&[("vault://V/I/f", "v1")]);
    Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest(doc))
        .await
        .unwrap();

    let vault = FakeVault::with(&[("vault://V/I/f", "v2")]);
    let report = Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest(doc))
        .await
        .unwrap();

    assert_eq!(report.changed_paths.len(), 1);
    assert_eq!(
        services.actions(),
        vec!["restart app".to_string(), "restart app".to_string()]
    );
}

#[tokio::test]
async fn test_path_collision_fails_before_any_vault_call() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[
        ("vault://V/A/f", "a"),
        ("vault://V/B/f", "b"),
    ]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{
            "secrets": [
                {"reference": "vault://V/A/f", "path": "/etc/app/token"},
                {"reference": "vault://V/B/f", "path": "/etc/app/token"}
            ]
        }"#,
    );

    let pipeline = Pipeline::new(&vault, &services, &RootOnly, harness.config());
    let err = pipeline.run(&manifest).await.unwrap_err();

    assert!(matches!(err, DeployError::Validation(_)));
    assert!(err.to_string().contains("/etc/app/token"));
    assert_eq!(vault.call_count(), 0);
    assert!(services.actions().is_empty());
}

#[tokio::test]
async fn test_shared_service_across_secrets_restarted_once() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[
        ("vault://V/Db/user", "alice"),
        ("vault://V/Db/password", "hunter2"),
    ]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{
            "secrets": [
                {"reference": "vault://V/Db/user", "path": "db/user", "services": ["postgresql"]},
                {"reference": "vault://V/Db/password", "path": "db/password", "services": ["postgresql"]}
            ]
        }"#,
    );

    let pipeline = Pipeline::new(&vault, &services, &RootOnly, harness.config());
    let report = pipeline.run(&manifest).await.unwrap();

    assert_eq!(report.changed_paths.len(), 2);
    assert_eq!(services.actions(), vec!["restart postgresql".to_string()]);
}

#[tokio::test]
async fn test_templated_path_and_value_template() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://V/App/password", "pw")]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{
            "pathTemplate": "{service}/{name}",
            "defaults": {"service": "app"},
            "secrets": [{
                "reference": "vault://V/App/password",
                "variables": {"name": "db.env"},
                "template": "DATABASE_PASSWORD={{secret}}\n"
            }]
        }"#,
    );

    Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest)
        .await
        .unwrap();

    let target = harness.output_dir.join("app/db.env");
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        "DATABASE_PASSWORD=pw\n"
    );
}

#[tokio::test]
async fn test_missing_vault_item_fails_run() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{"secrets": [{"reference": "vault://V/Missing/f", "path": "x", "services": ["app"]}]}"#,
    );

    let err = Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::Vault {
            kind: VaultErrorKind::NotFound,
            ..
        }
    ));
    assert!(services.actions().is_empty());
}

#[tokio::test]
async fn test_continue_on_error_skips_failing_secret() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://V/Good/f", "ok")]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{
            "serviceReconciliation": {"continueOnError": true},
            "secrets": [
                {"reference": "vault://V/Missing/f", "path": "bad", "services": ["broken-app"]},
                {"reference": "vault://V/Good/f", "path": "good", "services": ["app"]}
            ]
        }"#,
    );

    let report = Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest)
        .await
        .unwrap();

    // The failing secret is skipped and reported; the healthy one deploys
    // and its service still restarts.
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].starts_with("secret[0]:"));
    assert_eq!(report.changed_paths, vec![harness.output_dir.join("good")]);
    assert_eq!(services.actions(), vec!["restart app".to_string()]);
    assert!(!harness.output_dir.join("bad").exists());
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://V/I/f", "value")]);
    let services = FakeServices::default();

    let manifest = manifest(
        r#"{"secrets": [{"reference": "vault://V/I/f", "path": "value", "services": ["app"]}]}"#,
    );

    let mut config = harness.config();
    config.dry_run = true;
    let report = Pipeline::new(&vault, &services, &RootOnly, config)
        .run(&manifest)
        .await
        .unwrap();

    // The plan reports what would happen; nothing hits the disk, the vault,
    // or the service manager.
    assert_eq!(report.changed_paths.len(), 1);
    assert_eq!(report.services_dispatched, vec!["app".to_string()]);
    assert_eq!(vault.call_count(), 0);
    assert!(services.actions().is_empty());
    assert!(!harness.output_dir.join("value").exists());
    assert!(!harness.state_file.exists());
}

#[tokio::test]
async fn test_hash_store_persists_across_pipeline_instances() {
    let harness = Harness::new();
    let services = FakeServices::default();
    let doc = r#"{"secrets": [{"reference": "vault://V/I/f", "path": "v", "services": ["app"]}]}"#;

    let vault = FakeVault::with(&[("vault://V/I/f", "same")]);
    Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest(doc))
        .await
        .unwrap();

    assert!(harness.state_file.exists());

    // Fresh pipeline, same state file: still no change detected.
    let report = Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest(doc))
        .await
        .unwrap();
    assert!(report.changed_paths.is_empty());
    assert_eq!(services.actions().len(), 1);
}

#[tokio::test]
async fn test_symlinks_created_and_counted_once() {
    let harness = Harness::new();
    let vault = FakeVault::with(&[("vault://V/I/f", "content")]);
    let services = FakeServices::default();
    let link = harness.output_dir.join("alias");

    let doc = format!(
        r#"{{"secrets": [{{"reference": "vault://V/I/f", "path": "real", "symlinks": ["{}"]}}]}}"#,
        link.display()
    );

    Pipeline::new(&vault, &services, &RootOnly, harness.config())
        .run(&manifest(&doc))
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(&link).unwrap(), "content");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
}
