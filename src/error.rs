//! # Error Taxonomy
//!
//! Structured errors for the deployment pipeline. Every error carries the
//! operation that was attempted, the component it failed in, and - where
//! actionable - remediation suggestions that are rendered beneath the
//! message. Suggestions are a usability contract, not a correctness one.

use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Classification of vault service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultErrorKind {
    /// The referenced vault, item, or field does not exist
    NotFound,
    /// The service-account token was rejected
    AuthFailed,
    /// The vault service throttled the request
    RateLimited,
    /// Transport-level failure reaching the vault service
    Network,
}

impl VaultErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultErrorKind::NotFound => "not-found",
            VaultErrorKind::AuthFailed => "auth-failed",
            VaultErrorKind::RateLimited => "rate-limited",
            VaultErrorKind::Network => "network",
        }
    }
}

/// Shared payload for all error variants: what was attempted, what went
/// wrong, optional context, and remediation suggestions.
#[derive(Debug)]
pub struct ErrorDetail {
    pub operation: String,
    pub issue: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ErrorDetail {
    fn new(operation: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            issue: issue.into(),
            context: None,
            suggestions: Vec::new(),
            source: None,
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.issue)?;
        if let Some(context) = &self.context {
            write!(f, "\n  Context: {context}")?;
        }
        if let Some(source) = &self.source {
            write!(f, "\n  Cause: {source}")?;
        }
        if !self.suggestions.is_empty() {
            write!(f, "\n  Suggestions:")?;
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                write!(f, "\n  {}. {suggestion}", i + 1)?;
            }
        }
        Ok(())
    }
}

/// Pipeline error taxonomy.
///
/// `Configuration` and `Validation` are always fatal to the whole run and
/// are produced before any secret I/O. `Vault` and `FileSystem` abort the
/// materialization of a single secret. `Service` failures are governed by
/// the reconciliation policy and never undo a successful materialization.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("[configuration] {0}")]
    Configuration(ErrorDetail),

    #[error("[validation] {0}")]
    Validation(ErrorDetail),

    #[error("[vault:{}] {detail}", kind.as_str())]
    Vault {
        kind: VaultErrorKind,
        detail: ErrorDetail,
    },

    #[error("[filesystem] {0}")]
    FileSystem(ErrorDetail),

    #[error("[service] {0}")]
    Service(ErrorDetail),
}

impl DeployError {
    pub fn configuration(operation: impl Into<String>, issue: impl Into<String>) -> Self {
        DeployError::Configuration(ErrorDetail::new(operation, issue))
    }

    pub fn configuration_with(
        operation: impl Into<String>,
        issue: impl Into<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new(operation, issue);
        detail.suggestions = suggestions;
        DeployError::Configuration(detail)
    }

    /// Validation error for a specific manifest field, echoing the offending
    /// value back in the context line.
    pub fn validation_field(
        field: impl Into<String>,
        value: impl Into<String>,
        issue: impl Into<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new("Manifest validation", issue);
        detail.context = Some(format!(
            "Field '{}' has value '{}'",
            field.into(),
            value.into()
        ));
        detail.suggestions = suggestions;
        DeployError::Validation(detail)
    }

    /// Unknown owner/group error, with a short list of principals that do
    /// exist on this host as a usability aid.
    pub fn unknown_principal(
        operation: impl Into<String>,
        name: &str,
        entity: &str,
        available: &[String],
    ) -> Self {
        let mut suggestions = vec![format!(
            "Create the {entity}: sudo {} {name}",
            if entity == "user" { "useradd" } else { "groupadd" }
        )];
        if !available.is_empty() {
            suggestions.push(format!("Or use an existing {entity}: {}", available.join(", ")));
        }
        let mut detail = ErrorDetail::new(operation, format!("{entity} '{name}' does not exist"));
        detail.suggestions = suggestions;
        DeployError::Validation(detail)
    }

    pub fn vault(
        kind: VaultErrorKind,
        operation: impl Into<String>,
        issue: impl Into<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new(operation, issue);
        detail.suggestions = match kind {
            VaultErrorKind::NotFound => vec![
                "Verify the reference format: vault://Vault/Item/field".to_string(),
                "Check that the vault, item, and field exist".to_string(),
                "Ensure the service account has access to the vault".to_string(),
            ],
            VaultErrorKind::AuthFailed => vec![
                "Verify the service-account token is valid and not expired".to_string(),
                "Check the token file is readable by the deployer".to_string(),
            ],
            VaultErrorKind::RateLimited => vec![
                "Wait a few minutes before retrying".to_string(),
                "Reduce the number of secrets deployed per run".to_string(),
            ],
            VaultErrorKind::Network => vec![
                "Check connectivity to the vault service".to_string(),
                "Check for firewall or proxy issues".to_string(),
            ],
        };
        DeployError::Vault { kind, detail }
    }

    pub fn vault_with_source(
        kind: VaultErrorKind,
        operation: impl Into<String>,
        issue: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        match Self::vault(kind, operation, issue) {
            DeployError::Vault { kind, mut detail } => {
                detail.source = Some(Box::new(source));
                DeployError::Vault { kind, detail }
            }
            other => other,
        }
    }

    pub fn file_system(
        operation: impl Into<String>,
        path: &Path,
        issue: impl Into<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new(operation, issue);
        detail.context = Some(format!("Target path: {}", path.display()));
        DeployError::FileSystem(detail)
    }

    pub fn file_system_with_source(
        operation: impl Into<String>,
        path: &Path,
        issue: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        let mut detail = ErrorDetail::new(operation, issue);
        detail.context = Some(format!("Target path: {}", path.display()));
        detail.source = Some(Box::new(source));
        DeployError::FileSystem(detail)
    }

    pub fn service(
        operation: impl Into<String>,
        unit: &str,
        issue: impl Into<String>,
    ) -> Self {
        let mut detail = ErrorDetail::new(operation, issue);
        detail.context = Some(format!("Unit: {unit}"));
        detail.suggestions = vec![
            format!("Check unit status: systemctl status {unit}"),
            format!("Check unit logs: journalctl -u {unit} -n 20"),
        ];
        DeployError::Service(detail)
    }

    pub fn service_with_source(
        operation: impl Into<String>,
        unit: &str,
        issue: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        match Self::service(operation, unit, issue) {
            DeployError::Service(mut detail) => {
                detail.source = Some(Box::new(source));
                DeployError::Service(detail)
            }
            other => other,
        }
    }

    /// True for vault throttling errors; the binary maps these to a
    /// dedicated exit code so boot-time schedulers can back off.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            DeployError::Vault {
                kind: VaultErrorKind::RateLimited,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validation_error_renders_field_and_suggestions() {
        let err = DeployError::validation_field(
            "secret[0].mode",
            "0777",
            "Mode allows world write access",
            vec!["Use modes like 0600 or 0640 instead".to_string()],
        );
        let rendered = err.to_string();
        assert!(rendered.contains("[validation]"));
        assert!(rendered.contains("secret[0].mode"));
        assert!(rendered.contains("0777"));
        assert!(rendered.contains("1. Use modes like 0600"));
    }

    #[test]
    fn test_vault_error_classification() {
        let err = DeployError::vault(
            VaultErrorKind::RateLimited,
            "Resolving secret",
            "Vault service throttled the request",
        );
        assert!(err.is_rate_limited());
        assert!(err.to_string().contains("vault:rate-limited"));

        let err = DeployError::vault(VaultErrorKind::NotFound, "Resolving secret", "No such item");
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_file_system_error_carries_path() {
        let path = PathBuf::from("/run/secrets/db");
        let err = DeployError::file_system("Writing secret file", &path, "Permission denied");
        assert!(err.to_string().contains("/run/secrets/db"));
    }

    #[test]
    fn test_unknown_principal_lists_alternatives() {
        let err = DeployError::unknown_principal(
            "Validating secret[1].owner",
            "webuser",
            "user",
            &["root".to_string(), "www-data".to_string()],
        );
        let rendered = err.to_string();
        assert!(rendered.contains("user 'webuser' does not exist"));
        assert!(rendered.contains("www-data"));
        assert!(rendered.contains("useradd"));
    }
}
