use std::path::Path;

use figment::{
    providers::{Data, Env, Format, Json, Serialized, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};
use serde::Serialize;

/// A provider whose data has already been read and parsed.
///
/// Reading eagerly means that unreadable or malformed sources fail when they are added to the loader, rather than when
/// values are first extracted.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    fn from_file<F, P>(path: P, name: &'static str) -> Result<Self, Error>
    where
        F: Format,
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let data = Data::<F>::string(&contents).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(name, path),
        })
    }

    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Yaml, _>(path, "YAML file")
    }

    pub fn from_json<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Json, _>(path, "JSON file")
    }

    /// Reads every environment variable starting with `prefix`, with the prefix stripped and the remainder lowercased.
    pub fn from_environment(prefix: &str) -> Result<Self, Error> {
        let env = Env::prefixed(prefix);
        let data = env.data()?;

        Ok(Self {
            data,
            metadata: Metadata::named(format!("environment variables prefixed with `{}`", prefix)),
        })
    }

    /// Returns `true` if no values were read.
    pub fn is_empty(&self) -> bool {
        self.data.values().all(Dict::is_empty)
    }

    pub fn from_serialized<T>(value: T, name: &'static str) -> Result<Self, Error>
    where
        T: Serialize,
    {
        let data = Serialized::defaults(value).data()?;

        Ok(Self {
            data,
            metadata: Metadata::named(name),
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
