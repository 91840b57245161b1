//! # Path Resolution
//!
//! Turns a secret's declared or templated path into a concrete absolute
//! filesystem path. Resolution is deterministic and side-effect free:
//! identical inputs always produce the identical path, which the validator
//! relies on for its uniqueness check.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::DeployError;
use crate::manifest::SecretSpec;

/// Characters rejected inside substituted variable values. These values may
/// end up in filesystem paths or, indirectly, in service-manager commands.
const UNSAFE_CHARS: [char; 9] = [';', '&', '|', '$', '`', '(', ')', '<', '>'];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder regex is valid"))
}

/// Resolves secret output paths from explicit paths or the global template.
#[derive(Debug, Clone)]
pub struct PathResolver {
    output_dir: PathBuf,
    path_template: Option<String>,
    defaults: HashMap<String, String>,
}

impl PathResolver {
    #[must_use]
    pub fn new(
        output_dir: impl Into<PathBuf>,
        path_template: Option<String>,
        defaults: HashMap<String, String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            path_template,
            defaults,
        }
    }

    /// Resolve the output path for one secret.
    ///
    /// The secret's own `path` wins over the global template; if neither is
    /// set this is a configuration error. Relative results are joined under
    /// the output directory, absolute results are kept as-is.
    pub fn resolve(&self, secret: &SecretSpec, label: &str) -> Result<PathBuf, DeployError> {
        let template = match (&secret.path, &self.path_template) {
            (Some(path), _) => path.as_str(),
            (None, Some(template)) => template.as_str(),
            (None, None) => {
                return Err(DeployError::configuration_with(
                    format!("Resolving path for {label}"),
                    "No path specified and no pathTemplate configured",
                    vec![
                        "Specify a path directly in the secret".to_string(),
                        "Or configure a pathTemplate at the manifest level".to_string(),
                        "Example template: /etc/secrets/{service}/{name}".to_string(),
                    ],
                ));
            }
        };

        if template.is_empty() {
            return Err(DeployError::validation_field(
                format!("{label}.path"),
                "<empty>",
                "Path cannot be empty",
                vec![
                    "Use a relative path like database/password".to_string(),
                    "Or an absolute path like /run/secrets/db".to_string(),
                ],
            ));
        }

        let substituted = self.substitute(template, &secret.variables, label)?;
        let path = Path::new(&substituted);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.output_dir.join(path))
        }
    }

    /// Substitute every `{name}` placeholder from defaults merged with the
    /// secret's variables (secret wins). Unresolved placeholders are hard
    /// errors naming the missing key and the variables that are available.
    fn substitute(
        &self,
        template: &str,
        variables: &HashMap<String, String>,
        label: &str,
    ) -> Result<String, DeployError> {
        let mut merged: HashMap<&str, &str> = HashMap::new();
        for (k, v) in &self.defaults {
            merged.insert(k.as_str(), v.as_str());
        }
        for (k, v) in variables {
            merged.insert(k.as_str(), v.as_str());
        }

        let mut result = template.to_string();
        for captures in placeholder_regex().captures_iter(template) {
            let placeholder = &captures[0];
            let name = &captures[1];

            let Some(value) = merged.get(name) else {
                let mut available: Vec<&str> = merged.keys().copied().collect();
                available.sort_unstable();
                return Err(DeployError::validation_field(
                    format!("{label} template variable"),
                    name,
                    format!("Template variable '{{{name}}}' not found in variables or defaults"),
                    vec![
                        format!("Add '{name}' to the secret's variables"),
                        format!("Or add '{name}' to the manifest defaults"),
                        format!("Template: {template}"),
                        format!("Available variables: [{}]", available.join(", ")),
                    ],
                ));
            };

            validate_variable_value(value, name, label)?;
            result = result.replace(placeholder, value);
        }

        Ok(result)
    }
}

/// Reject substituted values that could traverse out of the target tree or
/// be interpreted by a shell downstream.
pub fn validate_variable_value(value: &str, name: &str, label: &str) -> Result<(), DeployError> {
    if value.contains("..") {
        return Err(DeployError::validation_field(
            format!("{label}.variables.{name}"),
            value,
            "Variable value contains path traversal attempt (..)",
            vec!["Use clean directory and file names without '..'".to_string()],
        ));
    }

    if let Some(bad) = value.chars().find(|c| UNSAFE_CHARS.contains(c)) {
        return Err(DeployError::validation_field(
            format!("{label}.variables.{name}"),
            value,
            format!("Variable value contains shell metacharacter: {bad}"),
            vec![
                "Use only alphanumeric characters, hyphens, and underscores".to_string(),
            ],
        ));
    }

    Ok(())
}
