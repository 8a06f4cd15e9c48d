//! Loading and querying layered configuration.
#![deny(missing_docs)]

use std::{borrow::Cow, collections::BTreeSet, sync::Arc};

use figment::{error::Kind, Figment};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A type-erased error.
pub type GenericError = anyhow::Error;

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

    /// Requested field had a different data type than expected.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&BTreeSet::new(), e)
    }
}

/// Configuration loader that merges values from multiple sources.
///
/// Sources take precedence in the order they are added: values from a source override the values of any source added
/// before it. Once all sources are added, the merged values can either be deserialized directly
/// ([`into_typed`][Self::into_typed]) or queried by key ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - serializable defaults
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: BTreeSet<String>,
    providers: Vec<ResolvedProvider>,
}

impl ConfigurationLoader {
    /// Adds the given value as a source of defaults.
    ///
    /// # Errors
    ///
    /// If the value cannot be serialized into a map of configuration values, an error will be returned.
    pub fn add_defaults<T>(mut self, defaults: T) -> Result<Self, ConfigurationError>
    where
        T: Serialize,
    {
        let provider = ResolvedProvider::from_serialized(defaults, "defaults")?;
        self.providers.push(provider);
        Ok(self)
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = ResolvedProvider::from_yaml(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(provider);
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to read YAML configuration file. Ignoring.")
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = ResolvedProvider::from_json(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(provider);
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    pub fn try_from_json<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_json(&path) {
            Ok(provider) => self.providers.push(provider),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to read JSON configuration file. Ignoring.")
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `app` matches any
    /// environment variable starting with `app_`. The prefix is case-insensitive, and the matched keys are lowercased
    /// with the prefix stripped: `APP_BULK_MAX_ITEMS` sets `bulk_max_items`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        let provider = ResolvedProvider::from_environment(&prefix)?;
        if !provider.is_empty() {
            self.providers.push(provider);
        }
        self.env_prefixes.insert(prefix);
        Ok(self)
    }

    fn merged(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.merged()
            .extract()
            .map_err(|e| from_figment_error(&self.env_prefixes, e))
    }

    /// Consumes the configuration loader and wraps the merged values in a generic wrapper.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.merged(),
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: BTreeSet<String>,
}

/// A generic configuration object.
///
/// Holds the merged values of a [`ConfigurationLoader`] in their raw form. Values can be queried by key, or the entire
/// configuration can be deserialized at once.
///
/// Keys take the form `a.b.c`, where periods indicate a nested value. Since environment variables cannot express
/// nesting, a nested key that is not found is looked up again with its periods replaced by underscores.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = &self.inner.figment;
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|fallback_e| self.map_error(fallback_e)),
            Err(e) => Err(self.map_error(e)),
        }
    }

    fn map_error(&self, e: figment::Error) -> ConfigurationError {
        from_figment_error(&self.inner.env_prefixes, e)
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized into `T`, an error
    /// will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if a key does not exist or could not be deserialized.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but the value could not be deserialized into `T`, an error will be returned.
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

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the value could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner.figment.extract().map_err(|e| self.map_error(e))
    }
}

fn from_figment_error(env_prefixes: &BTreeSet<String>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = vec![field.to_string()];
            valid_keys.extend(
                env_prefixes
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase())),
            );
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
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Settings {
        name: String,
        #[serde(default)]
        workers: u32,
    }

    fn temp_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let yaml = temp_file(".yaml", "name: from-yaml\nworkers: 2\n");
        let json = temp_file(".json", r#"{ "workers": 8 }"#);

        let settings: Settings = ConfigurationLoader::default()
            .add_defaults(serde_json::json!({ "name": "default", "workers": 1 }))
            .unwrap()
            .from_yaml(yaml.path())
            .unwrap()
            .from_json(json.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(
            settings,
            Settings {
                name: "from-yaml".to_string(),
                workers: 8
            }
        );
    }

    #[test]
    fn missing_files_are_optional_with_try() {
        let config = ConfigurationLoader::default()
            .try_from_yaml("/nonexistent/courier.yaml")
            .try_from_json("/nonexistent/courier.json")
            .into_generic();

        assert_eq!(config.try_get_typed::<String>("name").unwrap(), None);
        assert!(ConfigurationLoader::default().from_yaml("/nonexistent/courier.yaml").is_err());
    }

    #[test]
    fn environment_overrides_files() {
        std::env::set_var("COURIER_CFG_TEST_NAME", "from-env");
        std::env::set_var("COURIER_CFG_TEST_NESTED_VALUE", "42");

        let yaml = temp_file(".yaml", "name: from-yaml\n");
        let config = ConfigurationLoader::default()
            .from_yaml(yaml.path())
            .unwrap()
            .from_environment("courier_cfg_test")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<String>("name").unwrap(), "from-env");
        assert_eq!(config.get_typed::<u32>("nested.value").unwrap(), 42);
        assert_eq!(config.get_typed_or_default::<u32>("workers"), 0);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn missing_field_mentions_environment_variable() {
        let config = ConfigurationLoader::default()
            .from_environment("courier_cfg_missing")
            .unwrap()
            .into_generic();

        match config.get_typed::<String>("api_key") {
            Err(ConfigurationError::MissingField { help_text, field }) => {
                assert_eq!(field, "api_key");
                assert!(help_text.contains("COURIER_CFG_MISSING_API_KEY"), "{}", help_text);
            }
            other => panic!("expected missing field error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_type_names_field() {
        let config = ConfigurationLoader::default()
            .add_defaults(serde_json::json!({ "workers": "many" }))
            .unwrap()
            .into_generic();

        assert!(matches!(
            config.get_typed::<u32>("workers"),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
    }
}
