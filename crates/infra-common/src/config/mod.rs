//! Layered configuration loading
//!
//! Configuration is always loaded explicitly by the process entry point and
//! handed to components as plain values; nothing in the workspace reads the
//! environment behind a component's back.
//!
//! Layers, lowest precedence first:
//! 1. the type's `Default`
//! 2. an optional TOML file
//! 3. environment variables with a prefix (`PREFIX__SECTION__KEY`)

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::context::ErrorExt;
use crate::errors::types::{Error, Result};

/// Load `T` from defaults, an optional TOML file and prefixed environment
/// variables.
pub fn load_layered<T>(file: Option<&Path>, env_prefix: Option<&str>) -> Result<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    let defaults = toml::to_string(&T::default())
        .map_err(|e| Error::Config(format!("cannot serialise defaults: {}", e)))?;

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(&defaults, ::config::FileFormat::Toml));

    if let Some(path) = file {
        if !path.exists() {
            return Err(Error::Config(format!("config file not found: {}", path.display())));
        }
        builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Toml));
    }

    if let Some(prefix) = env_prefix {
        builder = builder.add_source(
            ::config::Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
    }

    let loaded: Result<T> = builder
        .build()
        .and_then(|c| c.try_deserialize::<T>())
        .map_err(Error::from);
    loaded.with_context("config", "load_layered")
}

/// Parse `T` from a TOML document, falling back to defaults for missing keys
/// when `T` uses `#[serde(default)]`.
pub fn from_toml_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        domain: String,
        timeout_ms: u64,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                domain: "example.com".into(),
                timeout_ms: 500,
            }
        }
    }

    #[test]
    fn test_defaults_only() {
        let sample: Sample = load_layered(None, None).unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let sample: Sample = from_toml_str("timeout_ms = 1500").unwrap();
        assert_eq!(sample.domain, "example.com");
        assert_eq!(sample.timeout_ms, 1500);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_layered::<Sample>(Some(Path::new("/nonexistent/sipdrill.toml")), None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = from_toml_str::<Sample>("timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
