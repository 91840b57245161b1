//! # Manifest Validation
//!
//! Structural and security-policy validation of a merged manifest. Runs
//! before any vault or filesystem I/O and fails fast: the first violation
//! in manifest order is the error the operator sees.
//!
//! Principal existence checks go through the [`PrincipalLookup`] trait so
//! tests never depend on the host's user database.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::DeployError;
use crate::manifest::Manifest;
use crate::paths::PathResolver;
use crate::vault::SecretReference;

/// Absolute prefixes a secret must never be materialized under.
const DENYLISTED_PREFIXES: [&str; 11] = [
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/group",
];

/// Service users/groups worth suggesting when a declared principal is
/// unknown. Only the ones that actually exist on the host are offered.
const COMMON_PRINCIPALS: [&str; 10] = [
    "nginx",
    "apache",
    "www-data",
    "caddy",
    "postgres",
    "mysql",
    "redis",
    "docker",
    "nobody",
    "ssl-cert",
];

const MAX_PRINCIPAL_SUGGESTIONS: usize = 10;

fn mode_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-7]{3,4}$").expect("mode regex is valid"))
}

/// Host principal database seam.
pub trait PrincipalLookup {
    fn user_exists(&self, name: &str) -> bool;
    fn group_exists(&self, name: &str) -> bool;
}

/// Real lookup backed by the host's user database via `nix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPrincipals;

impl PrincipalLookup for SystemPrincipals {
    fn user_exists(&self, name: &str) -> bool {
        matches!(nix::unistd::User::from_name(name), Ok(Some(_)))
    }

    fn group_exists(&self, name: &str) -> bool {
        matches!(nix::unistd::Group::from_name(name), Ok(Some(_)))
    }
}

/// Validate the whole manifest against the resolver and host principals.
///
/// Checks, in order, per secret: reference shape, resolved path safety,
/// path and symlink uniqueness (first claim in manifest order wins), mode
/// string, then owner/group existence.
pub fn validate_manifest(
    manifest: &Manifest,
    resolver: &PathResolver,
    principals: &dyn PrincipalLookup,
) -> Result<(), DeployError> {
    if manifest.secrets.is_empty() {
        return Err(DeployError::configuration(
            "Manifest validation",
            "No secrets defined in manifest",
        ));
    }

    // Resolved path -> label of the secret that claimed it first.
    let mut seen_paths: HashMap<String, String> = HashMap::new();

    for (index, secret) in manifest.secrets.iter().enumerate() {
        let label = format!("secret[{index}]");

        SecretReference::parse(&secret.reference)?;

        let resolved = resolver.resolve(secret, &label)?;
        let resolved_str = resolved.to_string_lossy().into_owned();
        validate_resolved_path(&resolved_str, &label)?;
        claim_path(&mut seen_paths, &resolved_str, &label, "path")?;

        for (i, symlink) in secret.symlinks.iter().enumerate() {
            let symlink_label = format!("{label}.symlinks[{i}]");
            if symlink.is_empty() {
                return Err(DeployError::validation_field(
                    symlink_label,
                    "<empty>",
                    "Symlink path cannot be empty",
                    vec!["Remove empty symlink entries from the list".to_string()],
                ));
            }
            validate_resolved_path(symlink, &symlink_label)?;
            claim_path(&mut seen_paths, symlink, &symlink_label, "symlink")?;
        }

        if let Some(mode) = secret.mode.as_deref() {
            validate_mode(mode, &label)?;
        }

        validate_ownership(
            secret.owner.as_deref(),
            secret.group.as_deref(),
            &label,
            principals,
        )?;
    }

    Ok(())
}

/// Path safety checks shared by output paths and symlink paths: traversal
/// segments are always rejected; absolute paths must stay out of the
/// denylisted system prefixes.
pub fn validate_resolved_path(path: &str, label: &str) -> Result<(), DeployError> {
    if path.contains("..") {
        return Err(DeployError::validation_field(
            format!("{label}.path"),
            path,
            "Path traversal detected (contains '..')",
            vec![
                "Remove '..' from the path".to_string(),
                "Use an absolute path to place files outside the output directory".to_string(),
            ],
        ));
    }

    if path.starts_with('/') {
        for prefix in DENYLISTED_PREFIXES {
            if path == prefix || path.starts_with(&format!("{prefix}/")) {
                return Err(DeployError::validation_field(
                    format!("{label}.path"),
                    path,
                    format!("Path falls under protected system location: {prefix}"),
                    vec![
                        "Avoid placing secrets in system directories".to_string(),
                        "Use /etc/secrets/, /var/lib/secrets-deployer/, or /run/secrets/ instead"
                            .to_string(),
                    ],
                ));
            }
        }
    }

    Ok(())
}

fn claim_path(
    seen: &mut HashMap<String, String>,
    path: &str,
    label: &str,
    kind: &str,
) -> Result<(), DeployError> {
    if let Some(first_claim) = seen.get(path) {
        return Err(DeployError::validation_field(
            format!("{label}.{kind}"),
            path,
            format!("Duplicate {kind} path (already claimed by {first_claim})"),
            vec![
                "Every resolved output path and symlink must be globally unique".to_string(),
                format!("Change the {kind} of {label} or of {first_claim}"),
            ],
        ));
    }
    seen.insert(path.to_string(), label.to_string());
    Ok(())
}

/// Mode must be a 3-4 digit octal string with the world-write bit clear.
pub fn validate_mode(mode: &str, label: &str) -> Result<(), DeployError> {
    if !mode_regex().is_match(mode) {
        return Err(DeployError::validation_field(
            format!("{label}.mode"),
            mode,
            "Mode must be a 3-4 digit octal number",
            vec!["Use modes like 0600, 0640, or 0644".to_string()],
        ));
    }

    let bits = u32::from_str_radix(mode, 8).map_err(|_| {
        DeployError::validation_field(
            format!("{label}.mode"),
            mode,
            "Mode is not a valid octal number",
            vec!["Use modes like 0600, 0640, or 0644".to_string()],
        )
    })?;

    if bits & 0o002 != 0 {
        return Err(DeployError::validation_field(
            format!("{label}.mode"),
            mode,
            "Mode allows world write access (others can modify the secret)",
            vec![
                "Remove write permission for others".to_string(),
                "Use modes like 0600, 0640, or 0644 instead".to_string(),
            ],
        ));
    }

    // World-readable modes like 0644 stay allowed for certificate use cases.
    Ok(())
}

fn validate_ownership(
    owner: Option<&str>,
    group: Option<&str>,
    label: &str,
    principals: &dyn PrincipalLookup,
) -> Result<(), DeployError> {
    if let Some(owner) = owner {
        if owner != "root" && !principals.user_exists(owner) {
            return Err(DeployError::unknown_principal(
                format!("Validating {label}.owner"),
                owner,
                "user",
                &available_principals(principals, true),
            ));
        }
    }

    if let Some(group) = group {
        if group != "root" && !principals.group_exists(group) {
            return Err(DeployError::unknown_principal(
                format!("Validating {label}.group"),
                group,
                "group",
                &available_principals(principals, false),
            ));
        }
    }

    Ok(())
}

fn available_principals(principals: &dyn PrincipalLookup, users: bool) -> Vec<String> {
    let mut found = vec!["root".to_string()];
    for name in COMMON_PRINCIPALS {
        let exists = if users {
            principals.user_exists(name)
        } else {
            principals.group_exists(name)
        };
        if exists {
            found.push(name.to_string());
        }
        if found.len() >= MAX_PRINCIPAL_SUGGESTIONS {
            break;
        }
    }
    found
}
