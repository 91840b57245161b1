//! # Vault Client
//!
//! Resolves `vault://` references against a Connect-style REST API.
//!
//! The [`VaultClient`] trait is the seam the materializer depends on, so
//! tests can inject an in-memory implementation. [`ConnectClient`] is the
//! production implementation: bearer-token auth, vault lookup by name,
//! item lookup by title, then field (optionally section-scoped) extraction.
//!
//! Failures are classified as NotFound / AuthFailed / RateLimited / Network
//! and surfaced - never silently substituted.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{DeployError, VaultErrorKind};

/// Environment variable consulted before the token file.
pub const TOKEN_ENV_VAR: &str = "VAULT_SERVICE_TOKEN";

/// A parsed `vault://Vault/Item[/Section]/Field` reference.
///
/// At least three segments must follow the scheme; none may be empty.
/// Everything between the item and the final field is treated as the
/// section path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    pub vault: String,
    pub item: String,
    pub section: Option<String>,
    pub field: String,
}

impl SecretReference {
    pub fn parse(reference: &str) -> Result<Self, DeployError> {
        if reference.is_empty() {
            return Err(DeployError::validation_field(
                "reference",
                "<empty>",
                "Reference cannot be empty",
                vec![
                    "Add a valid reference: vault://Vault/Item/field".to_string(),
                    "Example: vault://Homelab/Database/password".to_string(),
                ],
            ));
        }

        let Some(rest) = reference.strip_prefix("vault://") else {
            return Err(DeployError::validation_field(
                "reference",
                reference,
                "Invalid vault reference format",
                vec![
                    "Use format: vault://Vault/Item/field".to_string(),
                    "Or with a section: vault://Vault/Item/Section/field".to_string(),
                    "Vault, item, and field names must not contain forward slashes".to_string(),
                ],
            ));
        };

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            return Err(DeployError::validation_field(
                "reference",
                reference,
                "Reference must have at least 3 parts: vault/item/field",
                vec![
                    "Verify the format: vault://Vault/Item/field".to_string(),
                    "Check for missing forward slashes".to_string(),
                ],
            ));
        }

        if parts.iter().any(|part| part.is_empty()) {
            return Err(DeployError::validation_field(
                "reference",
                reference,
                "Reference segments must all be non-empty",
                vec!["Remove doubled or trailing slashes from the reference".to_string()],
            ));
        }

        let vault = parts[0].to_string();
        let item = parts[1].to_string();
        let field = parts[parts.len() - 1].to_string();
        let section = if parts.len() > 3 {
            Some(parts[2..parts.len() - 1].join("/"))
        } else {
            None
        };

        Ok(Self {
            vault,
            item,
            section,
            field,
        })
    }
}

/// Resolves a reference string to the secret's current plaintext value.
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn resolve_secret(&self, reference: &str) -> Result<Zeroizing<String>, DeployError>;
}

/// Load the service-account token from the environment or a token file.
///
/// The environment variable wins. A missing, unreadable, or empty token is
/// an AuthFailed vault error; callers implementing the boot-time contract
/// degrade it to a warning and keep existing materialized secrets.
pub fn load_token(token_file: Option<&Path>) -> Result<Zeroizing<String>, DeployError> {
    if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
        let trimmed = token.trim();
        if !trimmed.is_empty() {
            return Ok(Zeroizing::new(trimmed.to_string()));
        }
    }

    let Some(path) = token_file else {
        return Err(DeployError::vault(
            VaultErrorKind::AuthFailed,
            "Loading service-account token",
            format!("No token provided - neither {TOKEN_ENV_VAR} nor a token file is set"),
        ));
    };

    let data = std::fs::read_to_string(path).map_err(|e| {
        DeployError::vault_with_source(
            VaultErrorKind::AuthFailed,
            "Loading service-account token",
            format!("Cannot read token file {}", path.display()),
            e,
        )
    })?;

    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Err(DeployError::vault(
            VaultErrorKind::AuthFailed,
            "Loading service-account token",
            format!("Token file {} is empty", path.display()),
        ));
    }

    Ok(Zeroizing::new(trimmed.to_string()))
}

/// Store the service-account token at `path` with mode 0600.
///
/// The file is created with the restrictive mode from the start; the token
/// value is never on disk behind umask-default permissions, not even
/// transiently. A pre-existing file is removed first so a looser old mode
/// cannot be inherited.
pub fn store_token(path: &Path, token: &str) -> Result<(), DeployError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DeployError::file_system_with_source(
                "Storing token",
                parent,
                "Failed to create token directory",
                e,
            )
        })?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(DeployError::file_system_with_source(
                "Storing token",
                path,
                "Failed to replace existing token file",
                e,
            ));
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| {
            DeployError::file_system_with_source(
                "Storing token",
                path,
                "Failed to create token file",
                e,
            )
        })?;

    file.write_all(token.as_bytes()).map_err(|e| {
        DeployError::file_system_with_source(
            "Storing token",
            path,
            "Failed to write token file",
            e,
        )
    })
}

// ============================================================================
// Connect REST API response structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct VaultSummary {
    id: String,
    #[allow(dead_code)] // Required for deserialization; name match is done server-side
    name: String,
}

#[derive(Debug, Deserialize)]
struct ItemSummary {
    id: String,
    #[allow(dead_code)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct FullItem {
    #[serde(default)]
    fields: Vec<ItemField>,
    #[serde(default)]
    sections: Vec<ItemSection>,
}

#[derive(Debug, Deserialize)]
struct ItemField {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    section: Option<SectionRef>,
}

#[derive(Debug, Deserialize)]
struct SectionRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ItemSection {
    id: String,
    #[serde(default)]
    label: Option<String>,
}

/// REST client for a Connect-style vault service.
pub struct ConnectClient {
    http: reqwest::Client,
    base_url: String,
    token: Zeroizing<String>,
}

impl std::fmt::Debug for ConnectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ConnectClient {
    pub fn new(base_url: impl Into<String>, token: Zeroizing<String>) -> Result<Self, DeployError> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            DeployError::vault_with_source(
                VaultErrorKind::Network,
                "Initializing vault client",
                "Failed to build HTTP client",
                e,
            )
        })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .bearer_auth(self.token.as_str())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        operation: &str,
    ) -> Result<T, DeployError> {
        let response = self.request(path, query).send().await.map_err(|e| {
            DeployError::vault_with_source(
                VaultErrorKind::Network,
                operation.to_string(),
                format!("Request to vault service failed: {}{path}", self.base_url),
                e,
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::vault(
                classify_status(status),
                operation.to_string(),
                format!("Vault service returned {status}: {body}"),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            DeployError::vault_with_source(
                VaultErrorKind::Network,
                operation.to_string(),
                "Failed to decode vault service response",
                e,
            )
        })
    }

    async fn lookup_vault_id(&self, vault: &str) -> Result<String, DeployError> {
        let operation = format!("Looking up vault '{vault}'");
        let filter = format!("name eq \"{vault}\"");
        let vaults: Vec<VaultSummary> = self
            .get_json("/v1/vaults", &[("filter", filter.as_str())], &operation)
            .await?;
        vaults.into_iter().next().map(|v| v.id).ok_or_else(|| {
            DeployError::vault(
                VaultErrorKind::NotFound,
                operation,
                format!("No vault named '{vault}' is visible to this service account"),
            )
        })
    }

    async fn lookup_item_id(&self, vault_id: &str, item: &str) -> Result<String, DeployError> {
        let operation = format!("Looking up item '{item}'");
        let filter = format!("title eq \"{item}\"");
        let items: Vec<ItemSummary> = self
            .get_json(
                &format!("/v1/vaults/{vault_id}/items"),
                &[("filter", filter.as_str())],
                &operation,
            )
            .await?;
        items.into_iter().next().map(|i| i.id).ok_or_else(|| {
            DeployError::vault(
                VaultErrorKind::NotFound,
                operation,
                format!("No item titled '{item}' in the vault"),
            )
        })
    }

    fn extract_field(
        item: &FullItem,
        reference: &SecretReference,
    ) -> Result<Zeroizing<String>, DeployError> {
        let operation = format!("Extracting field '{}'", reference.field);

        let section_id = match &reference.section {
            Some(section_label) => {
                let Some(section) = item
                    .sections
                    .iter()
                    .find(|s| s.label.as_deref() == Some(section_label.as_str()))
                else {
                    return Err(DeployError::vault(
                        VaultErrorKind::NotFound,
                        operation,
                        format!("Item has no section labeled '{section_label}'"),
                    ));
                };
                Some(section.id.clone())
            }
            None => None,
        };

        let field = item.fields.iter().find(|f| {
            f.label.as_deref() == Some(reference.field.as_str())
                && match &section_id {
                    Some(id) => f.section.as_ref().is_some_and(|s| &s.id == id),
                    None => true,
                }
        });

        match field.and_then(|f| f.value.as_deref()) {
            Some(value) => Ok(Zeroizing::new(value.to_string())),
            None => Err(DeployError::vault(
                VaultErrorKind::NotFound,
                operation,
                format!("Item has no field labeled '{}' with a value", reference.field),
            )),
        }
    }
}

#[async_trait]
impl VaultClient for ConnectClient {
    async fn resolve_secret(&self, reference: &str) -> Result<Zeroizing<String>, DeployError> {
        let parsed = SecretReference::parse(reference)?;
        let vault_id = self.lookup_vault_id(&parsed.vault).await?;
        let item_id = self.lookup_item_id(&vault_id, &parsed.item).await?;
        let item: FullItem = self
            .get_json(
                &format!("/v1/vaults/{vault_id}/items/{item_id}"),
                &[],
                &format!("Fetching item '{}'", parsed.item),
            )
            .await?;
        Self::extract_field(&item, &parsed)
    }
}

fn classify_status(status: StatusCode) -> VaultErrorKind {
    match status {
        StatusCode::NOT_FOUND => VaultErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VaultErrorKind::AuthFailed,
        StatusCode::TOO_MANY_REQUESTS => VaultErrorKind::RateLimited,
        _ => VaultErrorKind::Network,
    }
}
