//! # Secrets Deployer
//!
//! Deploys secrets from a vault service to the local filesystem and
//! reconciles the systemd services that consume them.
//!
//! One run:
//!
//! 1. **Load and merge manifests** - Multiple JSON documents, secrets
//!    concatenate, last template/defaults/policy wins
//! 2. **Validate** - References, resolved paths, modes, owners/groups,
//!    before any vault or filesystem I/O
//! 3. **Materialize** - Atomic writes with declared mode, ownership, and
//!    symlinks
//! 4. **Detect changes** - SHA-256 content hashes against the persistent
//!    hash store
//! 5. **Reconcile services** - Restart, reload, or signal the units that
//!    depend on changed secrets, with bounded retries
//!
//! A vault throttling failure exits with code 166 so boot-time schedulers
//! can back off instead of hammering the service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use secrets_deployer::manifest::Manifest;
use secrets_deployer::pipeline::{Pipeline, PipelineConfig};
use secrets_deployer::reconciler::SystemdManager;
use secrets_deployer::validation::SystemPrincipals;
use secrets_deployer::vault::{load_token, store_token, ConnectClient};
use secrets_deployer::DeployError;

/// Exit code for vault throttling, distinct from generic failure so unit
/// schedulers can apply a longer restart delay.
const EXIT_RATE_LIMITED: u8 = 166;

const DEFAULT_TOKEN_FILE: &str = "/etc/secrets-deployer/token";
const DEFAULT_STATE_FILE: &str = "/var/lib/secrets-deployer/hashes.json";
const DEFAULT_OUTPUT_DIR: &str = "/var/lib/secrets-deployer/secrets";
const DEFAULT_VAULT_URL: &str = "http://localhost:8080";

#[derive(Debug, Parser)]
#[command(name = "secrets-deployer", version, about = "Deploy vault secrets to the filesystem and reconcile dependent services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one deployment: materialize secrets and reconcile services
    Deploy {
        /// Manifest file; may be given multiple times, merged in order
        #[arg(short, long = "manifest", required = true)]
        manifest: Vec<PathBuf>,

        /// Base directory for relative secret paths
        #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Location of the persistent content-hash store
        #[arg(long, default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,

        /// Service-account token file (the VAULT_SERVICE_TOKEN environment
        /// variable wins when both are set)
        #[arg(long, default_value = DEFAULT_TOKEN_FILE)]
        token_file: PathBuf,

        /// Vault service base URL
        #[arg(long, default_value = DEFAULT_VAULT_URL)]
        vault_url: String,

        /// Validate and plan, but write nothing and dispatch nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the service-account token
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Read a token from stdin and store it with restrictive permissions
    Set {
        /// Token file location
        #[arg(long, default_value = DEFAULT_TOKEN_FILE)]
        token_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secrets_deployer=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Deploy {
            manifest,
            output_dir,
            state_file,
            token_file,
            vault_url,
            dry_run,
        } => {
            deploy(
                &manifest, output_dir, state_file, &token_file, &vault_url, dry_run,
            )
            .await
        }
        Command::Token {
            command: TokenCommand::Set { token_file },
        } => token_set(&token_file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            if e.downcast_ref::<DeployError>()
                .is_some_and(DeployError::is_rate_limited)
            {
                ExitCode::from(EXIT_RATE_LIMITED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn deploy(
    manifests: &[PathBuf],
    output_dir: PathBuf,
    state_file: PathBuf,
    token_file: &std::path::Path,
    vault_url: &str,
    dry_run: bool,
) -> Result<()> {
    info!(manifests = manifests.len(), dry_run, "starting deployment");

    let manifest = Manifest::load_multiple(manifests)?;

    // Boot-time contract: an unusable token must not take down activation.
    // The previously materialized secrets stay in place; this run becomes
    // a no-op with a warning.
    let token = match load_token(Some(token_file)) {
        Ok(token) => token,
        Err(e) => {
            warn!("{e}");
            warn!("token is unusable, keeping existing secrets and skipping this update");
            return Ok(());
        }
    };

    let vault = ConnectClient::new(vault_url, token)?;
    let services = SystemdManager::new()?;
    let principals = SystemPrincipals;

    let pipeline = Pipeline::new(
        &vault,
        &services,
        &principals,
        PipelineConfig {
            output_dir,
            state_file,
            dry_run,
        },
    );

    let report = pipeline.run(&manifest).await?;

    info!(
        secrets = report.secrets_total,
        changed = report.changed_paths.len(),
        services = report.services_dispatched.len(),
        "deployment complete"
    );
    if report.rollback_requested {
        warn!("rollbackOnFailure is set and service actions failed; restore the previous secrets from your deployment layer");
    }
    Ok(())
}

fn token_set(token_file: &std::path::Path) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read token from stdin")?;
    let token = input.trim();
    if token.is_empty() {
        anyhow::bail!("No token provided on stdin");
    }

    store_token(token_file, token)?;
    info!(path = %token_file.display(), "token stored");
    Ok(())
}
