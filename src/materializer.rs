//! # Secret Materializer
//!
//! Resolves a secret's value and writes it to its resolved path with the
//! declared mode and ownership, then points the declared symlinks at it.
//!
//! The write itself is atomic: the value lands in a temp file in the target
//! directory, gets its permissions set, and is persisted over the final
//! path. On any step failure the function returns before later steps run;
//! artifacts from earlier steps are deliberately left in place - run-level
//! rollback is the caller's concern.

use handlebars::Handlebars;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::DeployError;
use crate::manifest::SecretSpec;
use crate::validation::validate_resolved_path;
use crate::vault::VaultClient;

const DIR_MODE: u32 = 0o755;
const PROBE_FILE: &str = ".secrets-deployer-write-test";

/// Materializes secrets through an injected vault client.
pub struct Materializer<'a> {
    client: &'a dyn VaultClient,
}

impl std::fmt::Debug for Materializer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer").finish_non_exhaustive()
    }
}

impl<'a> Materializer<'a> {
    #[must_use]
    pub fn new(client: &'a dyn VaultClient) -> Self {
        Self { client }
    }

    /// Materialize one secret at its already-resolved path.
    ///
    /// On success exactly one regular file exists at `resolved_path` with
    /// the declared content, mode, and ownership, and every declared
    /// symlink resolves to it.
    pub async fn materialize(
        &self,
        secret: &SecretSpec,
        resolved_path: &Path,
        label: &str,
    ) -> Result<(), DeployError> {
        let mut value = self.client.resolve_secret(&secret.reference).await?;

        if let Some(template) = secret.template.as_deref() {
            value = render_template(template, &value, label)?;
        }

        let parent = resolved_path.parent().ok_or_else(|| {
            DeployError::file_system(
                format!("Resolving parent directory for {label}"),
                resolved_path,
                "Resolved path has no parent directory",
            )
        })?;
        ensure_directory_writable(parent, label)?;

        let mode = parse_mode(secret.mode_str(), label)?;
        write_atomically(resolved_path, value.as_bytes(), mode, label)?;
        debug!(path = %resolved_path.display(), mode = format!("{mode:o}"), "wrote secret file");

        if secret.owner.is_some() || secret.group.is_some() {
            set_ownership(
                resolved_path,
                secret.owner.as_deref(),
                secret.group.as_deref(),
                label,
            )?;
        }

        for (i, symlink) in secret.symlinks.iter().enumerate() {
            create_symlink(resolved_path, Path::new(symlink), &format!("{label}.symlinks[{i}]"))?;
        }

        Ok(())
    }
}

/// Render the declared value template with the secret bound as `secret`.
/// Escaping is disabled; the output is a raw file body, not markup.
fn render_template(
    template: &str,
    value: &str,
    label: &str,
) -> Result<Zeroizing<String>, DeployError> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.set_strict_mode(true);

    match handlebars.render_template(template, &json!({ "secret": value })) {
        Ok(rendered) => Ok(Zeroizing::new(rendered)),
        Err(e) => Err(DeployError::configuration_with(
            format!("Rendering template for {label}"),
            format!("Template failed: {e}"),
            vec![
                format!("Offending template: {template}"),
                "The secret value is available as {{ secret }}".to_string(),
            ],
        )),
    }
}

fn parse_mode(mode: &str, label: &str) -> Result<u32, DeployError> {
    u32::from_str_radix(mode, 8).map_err(|_| {
        DeployError::validation_field(
            format!("{label}.mode"),
            mode,
            "Mode is not a valid octal number",
            vec!["Use modes like 0600, 0640, or 0644".to_string()],
        )
    })
}

/// Create the directory if needed and verify effective writability with a
/// disposable probe file. Permission bits alone don't prove the acting
/// identity can write here.
fn ensure_directory_writable(dir: &Path, label: &str) -> Result<(), DeployError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| {
            DeployError::file_system_with_source(
                format!("Creating parent directory for {label}"),
                dir,
                "Failed to create parent directory",
                e,
            )
        })?;

    let probe = dir.join(PROBE_FILE);
    fs::write(&probe, b"test").map_err(|e| {
        DeployError::file_system_with_source(
            format!("Probing parent directory for {label}"),
            dir,
            "Parent directory is not writable",
            e,
        )
    })?;
    let _ = fs::remove_file(&probe); // cleanup is best effort

    Ok(())
}

fn write_atomically(
    path: &Path,
    content: &[u8],
    mode: u32,
    label: &str,
) -> Result<(), DeployError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        DeployError::file_system_with_source(
            format!("Creating temp file for {label}"),
            path,
            "Failed to create temporary file",
            e,
        )
    })?;

    temp.write_all(content).map_err(|e| {
        DeployError::file_system_with_source(
            format!("Writing secret file for {label}"),
            path,
            "Failed to write secret content",
            e,
        )
    })?;

    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| {
            DeployError::file_system_with_source(
                format!("Setting file mode for {label}"),
                path,
                format!("Failed to set mode {mode:o}"),
                e,
            )
        })?;

    temp.persist(path).map_err(|e| {
        DeployError::file_system_with_source(
            format!("Persisting secret file for {label}"),
            path,
            "Failed to move secret file into place",
            e,
        )
    })?;

    Ok(())
}

/// Change ownership on the materialized file. An unresolvable principal
/// here is the same error class as in validation; the file keeps its
/// previous ownership rather than ending up half-changed.
fn set_ownership(
    path: &Path,
    owner: Option<&str>,
    group: Option<&str>,
    label: &str,
) -> Result<(), DeployError> {
    let uid = match owner {
        Some("root") => Some(nix::unistd::Uid::from_raw(0)),
        Some(name) => {
            let user = nix::unistd::User::from_name(name).ok().flatten().ok_or_else(|| {
                DeployError::unknown_principal(
                    format!("Setting ownership for {label}"),
                    name,
                    "user",
                    &[],
                )
            })?;
            Some(user.uid)
        }
        None => None,
    };

    let gid = match group {
        Some("root") => Some(nix::unistd::Gid::from_raw(0)),
        Some(name) => {
            let found = nix::unistd::Group::from_name(name).ok().flatten().ok_or_else(|| {
                DeployError::unknown_principal(
                    format!("Setting ownership for {label}"),
                    name,
                    "group",
                    &[],
                )
            })?;
            Some(found.gid)
        }
        None => None,
    };

    nix::unistd::chown(path, uid, gid).map_err(|e| {
        DeployError::file_system_with_source(
            format!("Setting ownership for {label}"),
            path,
            format!(
                "Failed to change ownership to {}:{}",
                owner.unwrap_or("-"),
                group.unwrap_or("-")
            ),
            e,
        )
    })
}

/// Replace whatever sits at `link` with a symlink to `target`.
fn create_symlink(target: &Path, link: &Path, label: &str) -> Result<(), DeployError> {
    let link_str = link.to_string_lossy();
    validate_resolved_path(&link_str, label)?;

    if let Some(parent) = link.parent() {
        ensure_directory_writable(parent, label)?;
    }

    match fs::remove_file(link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(DeployError::file_system_with_source(
                format!("Removing existing entry for {label}"),
                link,
                "Failed to remove pre-existing file or symlink",
                e,
            ));
        }
    }

    std::os::unix::fs::symlink(target, link).map_err(|e| {
        DeployError::file_system_with_source(
            format!("Creating symlink for {label}"),
            link,
            format!("Failed to create symlink to {}", target.display()),
            e,
        )
    })
}
