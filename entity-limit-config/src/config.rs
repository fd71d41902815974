use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use entity_limit::{ConditionCatalog, ConditionKind, LimitRule, StaticRuleCatalog, Violation};
use entity_limit_log::LogConfig;
use serde::{Deserialize, Serialize};

/// Defines the source of a config error
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a specific field of the configuration.
    Field(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(inner.into()),
        }
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: impl Into<String>) -> Self {
        self.source = ConfigErrorSource::Field(name.into());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }

    /// Returns the field that caused the error, if known.
    pub fn field_name(&self) -> Option<&str> {
        match &self.source {
            ConfigErrorSource::Field(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// Two limit rules share the same name.
    #[error("duplicate limit rule")]
    DuplicateRule,
    /// A rule references a condition kind that is not supported or not registered.
    #[error("unknown condition kind")]
    UnknownCondition,
}

/// The format of a configuration file, derived from its extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

fn default_conditions() -> Vec<ConditionKind> {
    ConditionCatalog::builtin().all_kinds().collect()
}

/// The raw values of a configuration file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    conditions: Vec<ConditionKind>,
    limits: Vec<LimitRule>,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            logging: LogConfig::default(),
            conditions: default_conditions(),
            limits: Vec::new(),
        }
    }
}

impl ConfigValues {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let f = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;
        let reader = io::BufReader::new(f);

        match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::from_reader(reader)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path)),
            ConfigFormat::Json => serde_json::from_reader(reader)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(path)),
        }
    }

    /// Rejects configurations the engine must never see.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut kinds = BTreeSet::new();
        for kind in &self.conditions {
            if !kinds.insert(kind.id) {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field(format!("conditions.{}", kind.id)));
            }
        }

        let mut names = BTreeSet::new();
        for (index, rule) in self.limits.iter().enumerate() {
            if rule.name.is_empty() {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field(format!("limits[{index}].name")));
            }

            let prefix = format!("limits.{}", rule.name);

            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::new(ConfigErrorKind::DuplicateRule).field(prefix));
            }

            if rule.entity_type.is_empty() {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field(format!("{prefix}.entityType")));
            }

            if rule.bundles.iter().any(String::is_empty) {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field(format!("{prefix}.bundles")));
            }

            for condition in &rule.conditions {
                let known = match condition {
                    Violation::Unsupported => false,
                    condition => condition.id().is_ok_and(|id| kinds.contains(&id)),
                };

                if !known {
                    return Err(ConfigError::new(ConfigErrorKind::UnknownCondition)
                        .field(format!("{prefix}.conditions")));
                }
            }
        }

        Ok(())
    }
}

/// Configuration of the entity limit engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    values: ConfigValues,
    path: Option<PathBuf>,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON, all other files as YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let values = ConfigValues::load(path)?;
        values.validate().map_err(|e| match e.source {
            ConfigErrorSource::None => e.file(path),
            _ => e,
        })?;

        entity_limit_log::debug!(
            path = %path.display(),
            rules = values.limits.len(),
            "loaded entity limit configuration"
        );

        Ok(Config {
            values,
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates and validates a configuration from a JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?;
        values.validate()?;

        Ok(Config { values, path: None })
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the path this configuration was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Installs the global logger with the configured options.
    ///
    /// Must be called at most once, before any log statement is emitted.
    pub fn init_logging(&self) {
        entity_limit_log::init(self.logging());
    }

    /// Returns all configured limit rules, including disabled ones.
    pub fn rules(&self) -> &[LimitRule] {
        &self.values.limits
    }

    /// Returns the registry of condition kinds.
    pub fn condition_catalog(&self) -> ConditionCatalog {
        self.values.conditions.iter().copied().collect()
    }

    /// Returns a rule catalog over the configured rules.
    pub fn rule_catalog(&self) -> StaticRuleCatalog {
        StaticRuleCatalog::new(self.values.limits.clone())
    }
}
