//! # Service Reconciliation
//!
//! Maps changed secrets to the minimal set of service actions and executes
//! them against the host's service manager with bounded retries.
//!
//! The [`ServiceManager`] trait is the dispatch seam; [`SystemdManager`]
//! backs it with `systemctl`. Tests inject a recording fake that fails a
//! configured number of times, which keeps the retry loop unit-testable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DeployError;
use crate::manifest::{ReconciliationPolicy, SecretSpec, ServicePolicy, ServiceSpec};

/// Abstract command surface of the host's service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(&self, unit: &str) -> Result<(), DeployError>;
    async fn reload(&self, unit: &str) -> Result<(), DeployError>;
    async fn send_signal(&self, unit: &str, signal: &str) -> Result<(), DeployError>;
    async fn is_active(&self, unit: &str) -> Result<bool, DeployError>;
    /// Whether a unit definition exists at all (`systemctl cat`).
    async fn unit_exists(&self, unit: &str) -> Result<bool, DeployError>;
}

/// systemd-backed implementation dispatching through `systemctl`.
#[derive(Debug)]
pub struct SystemdManager {
    systemctl: PathBuf,
}

impl SystemdManager {
    /// Locate `systemctl` in PATH.
    pub fn new() -> Result<Self, DeployError> {
        let systemctl = which::which("systemctl").map_err(|e| {
            DeployError::service_with_source(
                "Finding systemctl binary",
                "systemctl",
                "systemctl not found in PATH - service reconciliation requires systemd",
                e,
            )
        })?;
        Ok(Self { systemctl })
    }

    async fn run(&self, args: &[&str], operation: &str, unit: &str) -> Result<Output, DeployError> {
        tokio::process::Command::new(&self.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                DeployError::service_with_source(
                    operation.to_string(),
                    unit,
                    format!("Failed to spawn systemctl {}", args.join(" ")),
                    e,
                )
            })
    }

    async fn run_checked(
        &self,
        args: &[&str],
        operation: &str,
        unit: &str,
    ) -> Result<(), DeployError> {
        let output = self.run(args, operation, unit).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DeployError::service(
                operation.to_string(),
                unit,
                format!(
                    "systemctl {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn restart(&self, unit: &str) -> Result<(), DeployError> {
        self.run_checked(&["restart", unit], "Restarting service", unit)
            .await
    }

    async fn reload(&self, unit: &str) -> Result<(), DeployError> {
        self.run_checked(&["reload", unit], "Reloading service", unit)
            .await
    }

    async fn send_signal(&self, unit: &str, signal: &str) -> Result<(), DeployError> {
        // systemctl kill delivers to the unit's main process without any
        // shell involvement, so unit and signal names are never interpolated.
        self.run_checked(
            &["kill", "-s", signal, "--kill-who=main", unit],
            "Signaling service",
            unit,
        )
        .await
    }

    async fn is_active(&self, unit: &str) -> Result<bool, DeployError> {
        let output = self
            .run(&["is-active", "--quiet", unit], "Checking service status", unit)
            .await?;
        // Exit code 3 means inactive; anything else nonzero is a real error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(3) => Ok(false),
            _ => Err(DeployError::service(
                "Checking service status",
                unit,
                format!("systemctl is-active exited with {}", output.status),
            )),
        }
    }

    async fn unit_exists(&self, unit: &str) -> Result<bool, DeployError> {
        let output = self.run(&["cat", unit], "Validating service unit", unit).await?;
        Ok(output.status.success())
    }
}

/// One deduplicated action against one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAction {
    pub unit: String,
    pub restart: bool,
    pub signal: Option<String>,
    pub after: Vec<String>,
}

impl ServiceAction {
    fn from_policy(unit: &str, policy: &ServicePolicy) -> Self {
        Self {
            unit: unit.to_string(),
            restart: policy.restart,
            signal: policy.signal.clone(),
            after: policy.after.clone(),
        }
    }
}

/// Normalize a secret's `services` declaration into concrete actions.
/// A flat name list becomes the default policy (restart, no signal).
#[must_use]
pub fn extract_actions(secret: &SecretSpec) -> Vec<ServiceAction> {
    match &secret.services {
        None => Vec::new(),
        Some(ServiceSpec::Names(names)) => {
            let default = ServicePolicy::default();
            names
                .iter()
                .map(|name| ServiceAction::from_policy(name, &default))
                .collect()
        }
        Some(ServiceSpec::Detailed(map)) => map
            .iter()
            .map(|(name, policy)| ServiceAction::from_policy(name, policy))
            .collect(),
    }
}

/// Collapse actions by unit name. When two secrets disagree on what a unit
/// needs, `restart = true` wins: a full restart subsumes a reload. Output
/// is sorted by unit for deterministic dispatch order.
#[must_use]
pub fn dedup_actions(actions: Vec<ServiceAction>) -> Vec<ServiceAction> {
    let mut by_unit: HashMap<String, ServiceAction> = HashMap::new();
    for action in actions {
        match by_unit.get_mut(&action.unit) {
            Some(existing) => {
                if action.restart && !existing.restart {
                    *existing = action;
                }
            }
            None => {
                by_unit.insert(action.unit.clone(), action);
            }
        }
    }
    let mut deduped: Vec<ServiceAction> = by_unit.into_values().collect();
    deduped.sort_by(|a, b| a.unit.cmp(&b.unit));
    deduped
}

/// Linearly increasing delay between dispatch attempts.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    attempt: u32,
}

impl LinearBackoff {
    #[must_use]
    pub fn new(base: Duration) -> Self {
        Self { base, attempt: 0 }
    }

    /// Next delay: base, 2*base, 3*base, ...
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        self.base * self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Units an action was successfully dispatched to.
    pub dispatched: Vec<String>,
    /// Per-unit failures after retries were exhausted (continue-on-error).
    pub failures: Vec<String>,
}

/// Executes service actions for the secrets that changed in a run.
pub struct ServiceReconciler<'a> {
    manager: &'a dyn ServiceManager,
    policy: ReconciliationPolicy,
    retry_base: Duration,
    dry_run: bool,
}

impl std::fmt::Debug for ServiceReconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceReconciler")
            .field("policy", &self.policy)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl<'a> ServiceReconciler<'a> {
    #[must_use]
    pub fn new(manager: &'a dyn ServiceManager, policy: ReconciliationPolicy) -> Self {
        Self {
            manager,
            policy,
            retry_base: Duration::from_secs(1),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Shrink the retry delay; tests use this to keep the loop fast.
    #[must_use]
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Execute the deduplicated actions for the changed secrets.
    ///
    /// Never touches the service manager when the changed set is empty or
    /// `restartOnChange` is globally off - the steady-state rerun must stay
    /// action-free.
    pub async fn reconcile(
        &self,
        changed_secrets: &[&SecretSpec],
    ) -> Result<ReconcileOutcome, DeployError> {
        if changed_secrets.is_empty() {
            debug!("no secret changes detected, skipping service reconciliation");
            return Ok(ReconcileOutcome::default());
        }
        if !self.policy.restart_on_change {
            debug!("restartOnChange is disabled, skipping service reconciliation");
            return Ok(ReconcileOutcome::default());
        }

        let actions = dedup_actions(
            changed_secrets
                .iter()
                .flat_map(|secret| extract_actions(secret))
                .collect(),
        );

        let mut outcome = ReconcileOutcome::default();
        for action in actions {
            match self.execute_with_retry(&action).await {
                Ok(()) => outcome.dispatched.push(action.unit.clone()),
                Err(e) => {
                    if self.policy.continue_on_error {
                        warn!(unit = %action.unit, error = %e, "service action failed, continuing");
                        outcome.failures.push(format!("{}: {e}", action.unit));
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        if !outcome.failures.is_empty() {
            warn!(
                failed = outcome.failures.len(),
                "some service actions failed after retries"
            );
        }

        Ok(outcome)
    }

    async fn execute_with_retry(&self, action: &ServiceAction) -> Result<(), DeployError> {
        // A nonexistent unit will never succeed; fail before burning retries.
        if !self.dry_run && !self.manager.unit_exists(&action.unit).await? {
            return Err(DeployError::service(
                "Validating service unit",
                &action.unit,
                "Unit does not exist on this host",
            ));
        }

        let attempts = self.policy.max_retries.max(1);
        let mut backoff = LinearBackoff::new(self.retry_base);
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff.next_delay();
                info!(
                    unit = %action.unit,
                    attempt,
                    max = attempts,
                    "retrying service action after {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }

            match self.dispatch(action).await {
                Ok(()) => {
                    debug!(unit = %action.unit, "service action succeeded");
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            DeployError::service(
                "Dispatching service action",
                &action.unit,
                "Dispatch failed with no recorded error",
            )
        }))
    }

    async fn dispatch(&self, action: &ServiceAction) -> Result<(), DeployError> {
        if self.dry_run {
            info!(unit = %action.unit, "dry-run: would dispatch {}", describe(action));
            return Ok(());
        }

        match (&action.signal, action.restart) {
            (Some(signal), _) => {
                if !self.manager.is_active(&action.unit).await? {
                    warn!(unit = %action.unit, "unit is inactive, skipping signal");
                    return Ok(());
                }
                info!(unit = %action.unit, signal = %signal, "sending signal");
                self.manager.send_signal(&action.unit, signal).await
            }
            (None, true) => {
                info!(unit = %action.unit, "restarting service");
                self.manager.restart(&action.unit).await
            }
            (None, false) => {
                if !self.manager.is_active(&action.unit).await? {
                    warn!(unit = %action.unit, "unit is inactive, skipping reload");
                    return Ok(());
                }
                info!(unit = %action.unit, "reloading service");
                self.manager.reload(&action.unit).await
            }
        }
    }
}

fn describe(action: &ServiceAction) -> String {
    match (&action.signal, action.restart) {
        (Some(signal), _) => format!("signal {signal}"),
        (None, true) => "restart".to_string(),
        (None, false) => "reload".to_string(),
    }
}
