//! Configuration loader
//!
//! Loading pipeline:
//! 1. Size check and UTF-8 BOM stripping
//! 2. Environment variable expansion (pre-parse, on raw text)
//! 3. YAML parsing into [`GateConfig`]
//! 4. Validation (after CLI overrides have been layered on)
//!
//! Parsing and validation are separate steps so `server run` can apply flag
//! overrides to a partially specified file before the result is checked.

use std::path::Path;
use std::sync::Arc;

use serde_yaml::Value;

use crate::config::schema::GateConfig;
use crate::config::validation::Validator;
use crate::error::ConfigError;

/// Environment variable overriding the maximum configuration size.
pub const MAX_CONFIG_SIZE_ENV: &str = "KNOCKGATE_MAX_CONFIG_SIZE";

const DEFAULT_MAX_CONFIG_SIZE: usize = 1024 * 1024;

// ============================================================================
// Public API
// ============================================================================

/// Options for the configuration loader.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Maximum configuration file size in bytes.
    pub max_config_size: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_config_size: std::env::var(MAX_CONFIG_SIZE_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONFIG_SIZE),
        }
    }
}

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct LoadResult {
    /// The loaded configuration.
    pub config: GateConfig,

    /// Warnings encountered during loading and validation.
    pub warnings: Vec<LoadWarning>,
}

/// Warning during configuration loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Warning message.
    pub message: String,

    /// Location where the warning occurred.
    pub location: Option<String>,
}

impl std::fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} (at {location})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Looks up an environment variable by name.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration loader.
pub struct ConfigLoader {
    options: LoaderOptions,
    env: EnvLookup,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(LoaderOptions::default())
    }
}

impl ConfigLoader {
    /// Creates a loader that reads the process environment.
    #[must_use]
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replaces the environment lookup used for `${VAR}` expansion.
    #[must_use]
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, fails to
    /// parse, or fails validation.
    pub fn load(&self, path: &Path) -> Result<LoadResult, ConfigError> {
        let loaded = self.parse_file(path)?;
        Self::validate(&path.display().to_string(), loaded)
    }

    /// Reads and parses a configuration file without validating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, or fails
    /// to parse.
    pub fn parse_file(&self, path: &Path) -> Result<LoadResult, ConfigError> {
        let metadata = std::fs::metadata(path).map_err(|_| ConfigError::MissingFile {
            path: path.to_path_buf(),
        })?;

        let max = self.options.max_config_size;
        let file_size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if file_size > max {
            return Err(ConfigError::InvalidValue {
                field: "file_size".to_string(),
                value: format!("{file_size} bytes"),
                expected: format!("at most {max} bytes"),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            line: None,
            message: format!("cannot read configuration: {e}"),
        })?;

        self.parse_str(&raw, path)
    }

    /// Parses configuration text. `path` is used for error messages only.
    ///
    /// # Errors
    ///
    /// Returns an error if environment expansion or YAML parsing fails.
    pub fn parse_str(&self, raw: &str, path: &Path) -> Result<LoadResult, ConfigError> {
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);

        let mut env_sub = EnvSubstitution::new(&self.env);
        let substituted = env_sub.substitute(raw, path)?;

        let to_parse_error = |e: serde_yaml::Error| ConfigError::ParseError {
            path: path.to_path_buf(),
            line: e.location().map(|l| l.line()),
            message: e.to_string(),
        };

        let root: Value = serde_yaml::from_str(&substituted).map_err(to_parse_error)?;
        if root.is_null() {
            return Err(ConfigError::ParseError {
                path: path.to_path_buf(),
                line: None,
                message: "Configuration file is empty".to_string(),
            });
        }

        // Parse the text again (not the Value) so type errors keep their line
        let config: GateConfig = serde_yaml::from_str(&substituted).map_err(to_parse_error)?;

        Ok(LoadResult {
            config,
            warnings: env_sub.warnings,
        })
    }

    /// Validates a parsed configuration, appending validation warnings.
    ///
    /// `label` names the configuration source in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every error found.
    pub fn validate(label: &str, loaded: LoadResult) -> Result<LoadResult, ConfigError> {
        let LoadResult {
            config,
            mut warnings,
        } = loaded;

        let result = Validator::new().validate(&config);
        if result.has_errors() {
            return Err(ConfigError::ValidationError {
                path: label.to_string(),
                errors: result.errors,
            });
        }

        warnings.extend(result.warnings.into_iter().map(|issue| LoadWarning {
            message: issue.message,
            location: Some(issue.path),
        }));

        Ok(LoadResult { config, warnings })
    }
}

// ============================================================================
// Environment Variable Substitution
// ============================================================================

/// Pre-parse environment variable substitution.
///
/// Runs on raw YAML text BEFORE parsing so substituted numbers keep their
/// YAML type.
struct EnvSubstitution<'a> {
    env: &'a EnvLookup,
    warnings: Vec<LoadWarning>,
}

impl<'a> EnvSubstitution<'a> {
    const fn new(env: &'a EnvLookup) -> Self {
        Self {
            env,
            warnings: Vec::new(),
        }
    }

    /// Substitutes environment variables in raw YAML text.
    ///
    /// Supports:
    /// - `${VAR}` - expand to value (empty string if unset, with warning)
    /// - `${VAR:-default}` - expand to default if unset
    /// - `${VAR:?message}` - fail if unset
    /// - `$$` - literal `$`
    fn substitute(&mut self, raw: &str, source_path: &Path) -> Result<String, ConfigError> {
        let mut result = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        let mut line = 1usize;

        while let Some(c) = chars.next() {
            match c {
                '\n' => {
                    line += 1;
                    result.push(c);
                }
                '$' if chars.peek() == Some(&'$') => {
                    chars.next();
                    result.push('$');
                }
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    let spec = parse_var_spec(&mut chars).ok_or_else(|| {
                        ConfigError::ParseError {
                            path: source_path.to_path_buf(),
                            line: Some(line),
                            message: "Unclosed environment variable reference".to_string(),
                        }
                    })?;

                    match ((self.env)(&spec.name), spec.fallback) {
                        (Some(value), _) => result.push_str(&value),
                        (None, Some(Fallback::Default(default))) => result.push_str(&default),
                        (None, Some(Fallback::Required(message))) => {
                            return Err(ConfigError::EnvVarNotSet {
                                var: spec.name,
                                location: if message.is_empty() {
                                    format!("{}:{line}", source_path.display())
                                } else {
                                    format!("{}:{line}: {message}", source_path.display())
                                },
                            });
                        }
                        (None, None) => self.warnings.push(LoadWarning {
                            message: format!(
                                "Environment variable '{}' is not set, using empty string",
                                spec.name
                            ),
                            location: Some(format!("{}:{line}", source_path.display())),
                        }),
                    }
                }
                _ => result.push(c),
            }
        }

        Ok(result)
    }
}

enum Fallback {
    Default(String),
    Required(String),
}

struct VarSpec {
    name: String,
    fallback: Option<Fallback>,
}

/// Parses the body of `${...}` after the opening brace.
///
/// Returns `None` if the reference is never closed.
fn parse_var_spec(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<VarSpec> {
    let mut name = String::new();

    while let Some(c) = chars.next() {
        match c {
            '}' => {
                return Some(VarSpec {
                    name,
                    fallback: None,
                });
            }
            ':' if chars.peek() == Some(&'-') => {
                chars.next();
                let default = read_until_close(chars)?;
                return Some(VarSpec {
                    name,
                    fallback: Some(Fallback::Default(default)),
                });
            }
            ':' if chars.peek() == Some(&'?') => {
                chars.next();
                let message = read_until_close(chars)?;
                return Some(VarSpec {
                    name,
                    fallback: Some(Fallback::Required(message)),
                });
            }
            _ => name.push(c),
        }
    }
    None
}

/// Reads up to the matching `}`, allowing nested braces.
fn read_until_close(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
    let mut value = String::new();
    let mut depth = 1;

    for c in chars.by_ref() {
        match c {
            '{' => {
                depth += 1;
                value.push(c);
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(value);
                }
                value.push(c);
            }
            _ => value.push(c),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    use crate::config::schema::FirewallBackend;

    fn loader_with(vars: &[(&str, &str)]) -> ConfigLoader {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ConfigLoader::default().with_env(Arc::new(move |name| vars.get(name).cloned()))
    }

    fn parse(loader: &ConfigLoader, yaml: &str) -> Result<LoadResult, ConfigError> {
        loader.parse_str(yaml, Path::new("gate.yaml"))
    }

    #[test]
    fn parses_full_config() {
        let yaml = r"
sequence: [7000, 8000, 9000]
window: 5s
protected_port: 22
bind_address: 127.0.0.1
sweep_interval: 500ms
firewall:
  backend: dry-run
  chain: KNOCK
";
        let loaded = parse(&loader_with(&[]), yaml).unwrap();
        let config = loaded.config;
        assert_eq!(config.sequence(), vec![7000, 8000, 9000]);
        assert_eq!(config.window(), Duration::from_secs(5));
        assert_eq!(config.protected_port(), 22);
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.firewall().backend(), FirewallBackend::DryRun);
        assert_eq!(config.firewall().chain(), "KNOCK");
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn strips_bom() {
        let loaded = parse(&loader_with(&[]), "\u{feff}protected_port: 22\n").unwrap();
        assert_eq!(loaded.config.protected_port(), 22);
    }

    #[test]
    fn expands_env_vars_before_parsing() {
        let loader = loader_with(&[("GATE_PORT", "2200")]);
        let loaded = parse(&loader, "protected_port: ${GATE_PORT}\nwindow: ${W:-3}\n").unwrap();
        assert_eq!(loaded.config.protected_port(), 2200);
        assert_eq!(loaded.config.window(), Duration::from_secs(3));
    }

    #[test]
    fn unset_var_warns() {
        let loaded = parse(&loader_with(&[]), "firewall:\n  chain: IN${SUFFIX}\n").unwrap();
        assert_eq!(loaded.config.firewall().chain(), "IN");
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.warnings[0].location.as_deref(), Some("gate.yaml:2"));
    }

    #[test]
    fn required_var_fails_when_unset() {
        let err = parse(&loader_with(&[]), "protected_port: ${PORT:?set PORT}\n").unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotSet { ref var, .. } if var == "PORT"));
    }

    #[test]
    fn double_dollar_is_literal() {
        let loaded = parse(&loader_with(&[]), "firewall:\n  chain: A$$B\n").unwrap();
        assert_eq!(loaded.config.firewall().chain(), "A$B");
    }

    #[test]
    fn unclosed_reference_is_parse_error() {
        let err = parse(&loader_with(&[]), "protected_port: ${PORT\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { line: Some(1), .. }));
    }

    #[test]
    fn type_error_reports_line() {
        let err = parse(&loader_with(&[]), "sequence: [1, 2]\nprotected_port: ssh\n").unwrap_err();
        match err {
            ConfigError::ParseError { line, .. } => assert_eq!(line, Some(2)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(parse(&loader_with(&[]), "sequnce: [1, 2]\n").is_err());
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = parse(&loader_with(&[]), "\n# nothing here\n").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn load_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sequence: [2222, 3333]\nprotected_port: 2222").unwrap();

        let err = ConfigLoader::default().load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn load_surfaces_validation_warnings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "window: 100ms").unwrap();

        let loaded = ConfigLoader::default().load(file.path()).unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.warnings[0].location.as_deref(), Some("window"));
    }

    #[test]
    fn missing_file() {
        let err = ConfigLoader::default()
            .load(Path::new("/nonexistent/knockgate.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { .. }));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "protected_port: 2222").unwrap();

        let loader = ConfigLoader::new(LoaderOptions { max_config_size: 4 });
        let err = loader.load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "file_size"));
    }
}
