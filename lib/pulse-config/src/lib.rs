//! Primitives for loading and querying configuration.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider as _,
};
use pulse_error::GenericError;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field had an unexpected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // Prefix is already uppercased with a trailing underscore.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

/// A configuration loader that can pull from various sources.
///
/// Wraps `figment` to expose a small API for layering configuration sources. Sources added later take precedence
/// over sources added earlier.
///
/// # Supported sources
///
/// - YAML file
/// - inline YAML string
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    figment: Figment,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            lookup_sources: HashSet::new(),
            figment: Figment::new(),
        }
    }
}

impl ConfigurationLoader {
    /// Attempts to load the given YAML configuration file, ignoring any errors.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved) => self.figment = self.figment.admerge(resolved),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from an inline YAML document.
    ///
    /// # Errors
    ///
    /// If the document is not valid YAML, an error will be returned.
    pub fn from_yaml_str(mut self, raw: &str) -> Result<Self, ConfigurationError> {
        let resolved = ResolvedProvider::from_yaml_str(raw)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.figment = self.figment.admerge(resolved);
        Ok(self)
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `pulse` matches
    /// any variable starting with `PULSE_`. The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // Snapshot the environment now so later changes to the process environment are not observed.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.figment = self.figment.admerge(Serialized::defaults(default_dict.clone()));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Consumes the loader and wraps it in a [`GenericConfiguration`].
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// A generic configuration object.
///
/// The merged configuration in raw form. Values are queried by key and extracted as typed values. Keys take the form
/// `a.b.c`, where periods indicate nesting.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, Kind::MissingField(_)) {
                    // Nested keys only present in the environment are flattened with `_` instead of `.`.
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// ## Errors
    ///
    /// If the value exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Listener {
        address: String,
        #[serde(default)]
        enabled: bool,
    }

    #[test]
    fn typed_lookups() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("hostname: web-01\nlistener:\n  address: 127.0.0.1:8125\n  enabled: true\n")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<String>("hostname").unwrap(), "web-01");
        assert_eq!(
            config.get_typed::<Listener>("listener").unwrap(),
            Listener {
                address: "127.0.0.1:8125".to_string(),
                enabled: true
            }
        );
        assert_eq!(config.try_get_typed::<String>("license_key").unwrap(), None);
    }

    #[test]
    fn missing_field_help_mentions_environment() {
        std::env::set_var("PULSECFGTEST_UNRELATED", "1");
        let config = ConfigurationLoader::default()
            .from_environment("pulsecfgtest")
            .unwrap()
            .into_generic();

        match config.get_typed::<String>("license_key") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("PULSECFGTEST_LICENSE_KEY"), "{}", help_text);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn environment_overrides_yaml() {
        std::env::set_var("PULSEOVERRIDETEST_HOSTNAME", "from-env");
        let config = ConfigurationLoader::default()
            .from_yaml_str("hostname: from-yaml\nbatch_size: 10\n")
            .unwrap()
            .from_environment("PULSEOVERRIDETEST")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<String>("hostname").unwrap(), "from-env");
        assert_eq!(config.get_typed::<u64>("batch_size").unwrap(), 10);
    }

    #[test]
    fn invalid_type_reported() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("batch_size: lots\n")
            .unwrap()
            .into_generic();

        assert!(matches!(
            config.get_typed::<u64>("batch_size"),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
    }

    #[test]
    fn empty_prefix_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn missing_file_ignored() {
        let config = ConfigurationLoader::default()
            .try_from_yaml("/nonexistent/pulse.yaml")
            .into_generic();
        let value: serde_json::Value = config.as_typed().unwrap();
        assert_eq!(value, serde_json::json!({}));
    }
}
