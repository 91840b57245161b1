//! # Deployment Pipeline
//!
//! End-to-end orchestration of one run: validate the merged manifest, then
//! materialize every secret, detect content changes against the persistent
//! hash store, and reconcile dependent services for the secrets that
//! actually changed.
//!
//! Validation failures abort before any vault or filesystem I/O. A failed
//! materialization or change check aborts the run by default; under
//! `continueOnError` the secret is skipped with a warning and the rest of
//! the run proceeds. A failed hash store save is always just a warning: the
//! worst outcome of a lost store is spurious service restarts next run.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::DeployError;
use crate::hashstore::HashStore;
use crate::manifest::{Manifest, SecretSpec};
use crate::materializer::Materializer;
use crate::paths::PathResolver;
use crate::reconciler::{ServiceManager, ServiceReconciler};
use crate::validation::{validate_manifest, PrincipalLookup};
use crate::vault::VaultClient;

/// Run-level settings that come from the CLI rather than the manifest.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base directory for relative secret paths.
    pub output_dir: PathBuf,
    /// Location of the persistent hash store document.
    pub state_file: PathBuf,
    /// Validate and plan, but write nothing and dispatch nothing.
    pub dry_run: bool,
}

/// What one run did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Number of secrets in the validated manifest.
    pub secrets_total: usize,
    /// Resolved paths whose content changed this run (or would change,
    /// under dry-run every secret is listed here).
    pub changed_paths: Vec<PathBuf>,
    /// Units that had an action dispatched successfully.
    pub services_dispatched: Vec<String>,
    /// Unit failures tolerated under `continueOnError`.
    pub service_failures: Vec<String>,
    /// Secrets skipped after a materialize or change-check failure,
    /// tolerated under `continueOnError`.
    pub skipped: Vec<String>,
    /// Set when service actions failed and `rollbackOnFailure` is declared.
    /// Restoring previous secret content is the deployment layer's job.
    pub rollback_requested: bool,
}

/// The deployment pipeline with its injected seams.
pub struct Pipeline<'a> {
    vault: &'a dyn VaultClient,
    services: &'a dyn ServiceManager,
    principals: &'a dyn PrincipalLookup,
    config: PipelineConfig,
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(
        vault: &'a dyn VaultClient,
        services: &'a dyn ServiceManager,
        principals: &'a dyn PrincipalLookup,
        config: PipelineConfig,
    ) -> Self {
        Self {
            vault,
            services,
            principals,
            config,
        }
    }

    /// Execute one full deployment run over an already-merged manifest.
    pub async fn run(&self, manifest: &Manifest) -> Result<RunReport, DeployError> {
        let resolver = PathResolver::new(
            &self.config.output_dir,
            manifest.path_template.clone(),
            manifest.defaults.clone(),
        );

        validate_manifest(manifest, &resolver, self.principals)?;
        info!(secrets = manifest.secrets.len(), "manifest validated");

        let policy = manifest.reconciliation_policy();
        let mut report = RunReport {
            secrets_total: manifest.secrets.len(),
            ..RunReport::default()
        };

        if self.config.dry_run {
            return self.plan(manifest, &resolver, report).await;
        }

        let mut store = HashStore::load(&self.config.state_file);
        let materializer = Materializer::new(self.vault);
        let mut changed_secrets: Vec<&SecretSpec> = Vec::new();

        for (index, secret) in manifest.secrets.iter().enumerate() {
            let label = format!("secret[{index}]");
            let resolved = resolver.resolve(secret, &label)?;

            if let Err(e) = materializer.materialize(secret, &resolved, &label).await {
                if policy.continue_on_error {
                    warn!(secret = %label, error = %e, "failed to materialize, skipping");
                    report.skipped.push(format!("{label}: {e}"));
                    continue;
                }
                return Err(e);
            }

            match store.has_changed(&resolved) {
                Ok(true) => {
                    info!(path = %resolved.display(), "secret content changed");
                    changed_secrets.push(secret);
                    report.changed_paths.push(resolved);
                }
                Ok(false) => {}
                Err(e) => {
                    if policy.continue_on_error {
                        warn!(secret = %label, error = %e, "change check failed, skipping");
                        report.skipped.push(format!("{label}: {e}"));
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        // Persisted once per run. The secrets are already on disk at this
        // point, so a save failure must not fail the run.
        if let Err(e) = store.save() {
            warn!(error = %e, "failed to persist hash store, next run will re-detect changes");
        }

        info!(
            deployed = report.secrets_total,
            changed = report.changed_paths.len(),
            "secrets materialized"
        );

        let reconciler = ServiceReconciler::new(self.services, policy.clone());
        match reconciler.reconcile(&changed_secrets).await {
            Ok(outcome) => {
                report.services_dispatched = outcome.dispatched;
                report.service_failures = outcome.failures;
                report.rollback_requested =
                    policy.rollback_on_failure && !report.service_failures.is_empty();
                Ok(report)
            }
            Err(e) => {
                if policy.rollback_on_failure {
                    warn!(
                        "service reconciliation failed with rollbackOnFailure set, \
                         previously materialized secrets should be restored by the caller"
                    );
                }
                Err(e)
            }
        }
    }

    /// Dry-run: log what the run would do, touch nothing.
    async fn plan(
        &self,
        manifest: &Manifest,
        resolver: &PathResolver,
        mut report: RunReport,
    ) -> Result<RunReport, DeployError> {
        let mut all: Vec<&SecretSpec> = Vec::new();
        for (index, secret) in manifest.secrets.iter().enumerate() {
            let label = format!("secret[{index}]");
            let resolved = resolver.resolve(secret, &label)?;
            info!(
                path = %resolved.display(),
                mode = secret.mode_str(),
                reference = %secret.reference,
                "dry-run: would materialize"
            );
            all.push(secret);
            report.changed_paths.push(resolved);
        }

        // Every secret counts as changed: the dry-run report shows the
        // worst-case set of service actions.
        let reconciler =
            ServiceReconciler::new(self.services, manifest.reconciliation_policy())
                .with_dry_run(true);
        let outcome = reconciler.reconcile(&all).await?;
        report.services_dispatched = outcome.dispatched;
        Ok(report)
    }
}
