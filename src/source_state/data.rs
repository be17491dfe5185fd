//! Structured data files: template data and external manifests.
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;

use crate::attr::TEMPLATE_SUFFIX;
use crate::error::SourceError;

/// Serialization format of a data file, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `.json`
    Json,
    /// `.toml`
    Toml,
    /// `.yaml` or `.yml`
    Yaml,
}

impl Format {
    /// Format of `name`, ignoring a trailing template suffix.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.strip_suffix(TEMPLATE_SUFFIX).unwrap_or(name);
        let ext = Path::new(name).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    /// Format of `name`, or [`SourceError::UnknownFormat`].
    ///
    /// # Errors
    ///
    /// Returns an error if the extension is not recognised.
    pub fn require(name: &str) -> Result<Self> {
        Self::from_name(name).ok_or_else(|| {
            SourceError::UnknownFormat {
                path: name.to_string(),
            }
            .into()
        })
    }

    /// Decode `bytes`, naming `origin` in errors.
    ///
    /// # Errors
    ///
    /// Returns the parse error.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8], origin: &str) -> Result<T> {
        match self {
            Self::Json => serde_json::from_slice(bytes).with_context(|| format!("parse {origin}")),
            Self::Toml => {
                let text = std::str::from_utf8(bytes).with_context(|| format!("read {origin}"))?;
                toml::from_str(text).with_context(|| format!("parse {origin}"))
            }
            Self::Yaml => serde_yaml::from_slice(bytes).with_context(|| format!("parse {origin}")),
        }
    }
}
