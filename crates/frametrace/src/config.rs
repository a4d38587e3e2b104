//! Tracer configuration.
//!
//! A [`Config`] is owned by a [`TracerState`](crate::TracerState) and read at
//! several points of a conversion (classification, wrapping of values, backend
//! invocation). Options can be set field by field, from the environment
//! (`FRAMETRACE_<OPTION>` variables) or from a JSON document. Setting an
//! option by name rejects names that do not exist.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Prefix of environment variables read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "FRAMETRACE_";

/// Verbosity of the `frametrace` log target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Error returned when a configuration value cannot be applied.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration option `{0}`")]
    UnknownOption(String),
    #[error("invalid value `{value}` for `{name}`: {reason}")]
    InvalidValue { name: String, value: String, reason: String },
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

/// All tunable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Level applied to the `frametrace` log target when logging is initialized.
    pub log_level: LogLevel,
    /// Print full failure reports instead of one-line summaries.
    pub verbose: bool,
    /// Number of cache entries a call site may hold before it is disabled.
    pub cache_size_limit: usize,
    /// Run dead-code elimination on rewritten code.
    pub dead_code_elimination: bool,
    /// Run the original graph next to the compiled one and compare outputs.
    pub verify_correctness: bool,
    /// Guard tensors on rank instead of exact sizes.
    pub dynamic_shapes: bool,
    /// Keep `Tensor.item()` inside the graph instead of breaking.
    pub capture_scalar_outputs: bool,
    /// Propagate backend failures to the caller instead of running uncompiled.
    pub raise_on_backend_error: bool,
    /// Maximum nesting of inlined user functions.
    pub max_inline_depth: usize,
    /// Instruction budget of a single tracing attempt.
    pub max_trace_instructions: usize,
    /// When set, only functions with this name are traced.
    pub debug_function: Option<String>,
    /// Code whose filename contains any of these patterns is never traced.
    pub skip_filenames: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Warn,
            verbose: false,
            cache_size_limit: 64,
            dead_code_elimination: true,
            verify_correctness: false,
            dynamic_shapes: false,
            capture_scalar_outputs: false,
            raise_on_backend_error: true,
            max_inline_depth: 8,
            max_trace_instructions: 100_000,
            debug_function: None,
            skip_filenames: Vec::new(),
        }
    }
}

/// Names accepted by [`Config::set_option`].
pub const OPTION_NAMES: &[&str] = &[
    "log_level",
    "verbose",
    "cache_size_limit",
    "dead_code_elimination",
    "verify_correctness",
    "dynamic_shapes",
    "capture_scalar_outputs",
    "raise_on_backend_error",
    "max_inline_depth",
    "max_trace_instructions",
    "debug_function",
    "skip_filenames",
];

impl Config {
    /// Default configuration with `FRAMETRACE_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Applies every `FRAMETRACE_<OPTION>` pair; other variables are ignored.
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<(), ConfigError> {
        for (key, value) in vars {
            if let Some(option) = key.strip_prefix(ENV_PREFIX) {
                let option = option.to_ascii_lowercase();
                if OPTION_NAMES.contains(&option.as_str()) {
                    self.set_option(&option, &value)?;
                }
            }
        }
        Ok(())
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Sets one option from its string form.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "log_level" => self.log_level = parse_value(name, value)?,
            "verbose" => self.verbose = parse_bool(name, value)?,
            "cache_size_limit" => self.cache_size_limit = parse_value(name, value)?,
            "dead_code_elimination" => self.dead_code_elimination = parse_bool(name, value)?,
            "verify_correctness" => self.verify_correctness = parse_bool(name, value)?,
            "dynamic_shapes" => self.dynamic_shapes = parse_bool(name, value)?,
            "capture_scalar_outputs" => self.capture_scalar_outputs = parse_bool(name, value)?,
            "raise_on_backend_error" => self.raise_on_backend_error = parse_bool(name, value)?,
            "max_inline_depth" => self.max_inline_depth = parse_value(name, value)?,
            "max_trace_instructions" => self.max_trace_instructions = parse_value(name, value)?,
            "debug_function" => {
                self.debug_function = if value.is_empty() { None } else { Some(value.to_owned()) };
            }
            "skip_filenames" => {
                self.skip_filenames = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            _ => return Err(ConfigError::UnknownOption(name.to_owned())),
        }
        Ok(())
    }

    /// Parses and applies a `name=value` assignment.
    pub fn set_assignment(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let Some((name, value)) = assignment.split_once('=') else {
            return Err(ConfigError::InvalidValue {
                name: assignment.to_owned(),
                value: String::new(),
                reason: "expected name=value".to_owned(),
            });
        };
        self.set_option(name.trim(), value.trim())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_owned(),
            value: value.to_owned(),
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        name: name.to_owned(),
        value: value.to_owned(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.cache_size_limit, 64);
        assert!(config.dead_code_elimination);
        assert!(config.raise_on_backend_error);
        assert!(!config.dynamic_shapes);
    }

    #[test]
    fn unknown_option_rejected() {
        let mut config = Config::default();
        let err = config.set_option("cache_limit", "3").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(name) if name == "cache_limit"));
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config
            .apply_env([
                ("FRAMETRACE_DYNAMIC_SHAPES".to_owned(), "1".to_owned()),
                ("FRAMETRACE_CACHE_SIZE_LIMIT".to_owned(), "4".to_owned()),
                ("FRAMETRACE_NOT_AN_OPTION".to_owned(), "x".to_owned()),
                ("HOME".to_owned(), "/root".to_owned()),
            ])
            .unwrap();
        assert!(config.dynamic_shapes);
        assert_eq!(config.cache_size_limit, 4);
    }

    #[test]
    fn json_keeps_defaults() {
        let config = Config::from_json(r#"{"verify_correctness": true, "log_level": "debug"}"#).unwrap();
        assert!(config.verify_correctness);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache_size_limit, 64);
        assert!(Config::from_json(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn assignment_parsing() {
        let mut config = Config::default();
        config.set_assignment("skip_filenames = vendor/, gen_").unwrap();
        assert_eq!(config.skip_filenames, vec!["vendor/".to_owned(), "gen_".to_owned()]);
        assert!(config.set_assignment("verbose=maybe").is_err());
    }
}
