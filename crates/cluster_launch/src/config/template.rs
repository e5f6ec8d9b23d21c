//! Template engine for `{name}` placeholders in batch scripts and job files

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

/// Matches escaped braces, shell expansions and placeholders in one pass.
///
/// Group 1 is the placeholder name. A leading `$` marks a shell expansion
/// (`${VAR}`) which is copied through untouched.
static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\$?\{(\w+)\}").expect("placeholder pattern is valid")
});

/// Variables available to a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    /// Substitution variables, ordered so debug output is stable
    pub vars: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Add multiple variables
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
        self
    }

    /// Set a variable in place
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Set a variable only when a value is present
    pub fn set_opt(&mut self, name: &str, value: Option<impl ToString>) {
        if let Some(value) = value {
            self.vars.insert(name.to_string(), value.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Render a template against this context.
    ///
    /// Output depends only on the template text and the variables, so two
    /// renders with the same inputs are byte-identical.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let mut error: Option<TemplateError> = None;

        let rendered = PLACEHOLDER_PATTERN.replace_all(template, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(rendered.into_owned())
    }

    /// Resolve a single match
    fn resolve_capture(&self, caps: &Captures) -> Result<String, TemplateError> {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        match whole {
            "{{" => return Ok("{".to_string()),
            "}}" => return Ok("}".to_string()),
            _ => {}
        }

        if whole.starts_with('$') {
            return Ok(whole.to_string());
        }

        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::Undefined(name.to_string()))
    }
}

/// Load a template from disk
pub fn load_template(path: &Path) -> Result<String, TemplateError> {
    std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
        path: path.display().to_string(),
        source: Arc::new(e),
    })
}

/// Errors that can occur while rendering a template
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("Undefined template variable: {0}")]
    Undefined(String),

    #[error("Failed to read template '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}
