//! Variable expansion for `$NAME` and `${NAME}` patterns

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching variable patterns: $$, ${NAME} or $NAME
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Substitution context containing all available variables
///
/// Lookup order is: service variables (from `env-file`), then loader-supplied
/// variables, then the process environment.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Variables supplied by the loader
    pub vars: HashMap<String, String>,
    /// Variables read from the service's env-file
    pub service_env: HashMap<String, String>,
    /// Whether to fall back to the process environment
    pub use_process_env: bool,
}

impl SubstitutionContext {
    /// Create a context that falls back to the process environment
    pub fn new() -> Self {
        Self {
            use_process_env: true,
            ..Self::default()
        }
    }

    /// Create a context that only sees explicitly supplied variables
    pub fn isolated() -> Self {
        Self::default()
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add multiple variables
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Derive a context for one service, layering its env-file variables on top
    pub fn for_service(&self, service_env: &HashMap<String, String>) -> Self {
        let mut ctx = self.clone();
        ctx.service_env = service_env.clone();
        ctx
    }

    /// Expand all variables in a string
    ///
    /// Expansion is a single pass: values are inserted verbatim and are not
    /// expanded again.
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = VARIABLE_PATTERN.replace_all(input, |caps: &Captures| {
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

        Ok(result.into_owned())
    }

    /// Resolve a single capture group
    fn resolve_capture(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        let name = caps.get(1).or_else(|| caps.get(2));
        match name {
            Some(name) => self.resolve_var(name.as_str()),
            // Escaped dollar
            None => Ok("$".to_string()),
        }
    }

    /// Resolve a variable reference
    fn resolve_var(&self, name: &str) -> Result<String, SubstitutionError> {
        if let Some(value) = self.service_env.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        if self.use_process_env {
            if let Ok(value) = std::env::var(name) {
                return Ok(value);
            }
        }
        Err(SubstitutionError::UndefinedVar(name.to_string()))
    }
}

/// Parse the contents of an env-file: `NAME=value` lines, `#` comments
pub fn parse_env_file(content: &str) -> Result<HashMap<String, String>, SubstitutionError> {
    let mut vars = HashMap::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            return Err(SubstitutionError::InvalidEnvLine {
                line: lineno + 1,
                content: raw.to_string(),
            });
        };

        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SubstitutionError::InvalidEnvLine {
                line: lineno + 1,
                content: raw.to_string(),
            });
        }

        vars.insert(name.to_string(), value.trim().to_string());
    }

    Ok(vars)
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Undefined variable: {0}")]
    UndefinedVar(String),

    #[error("Invalid env-file line {line}: '{content}'")]
    InvalidEnvLine { line: usize, content: String },
}
