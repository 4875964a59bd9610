//! Error types for the shot pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShotError {
    #[error("Invalid configuration at `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("No shot source enabled: configure at least one of catalog.storybook, catalog.pages or catalog.custom")]
    NoSources,

    #[error("Discovery failed for {source_name}: {reason}")]
    Discovery { source_name: String, reason: String },

    #[error("Capture failed for '{key}': {reason}")]
    Capture { key: String, reason: String },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl ShotError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ShotError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn discovery(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ShotError::Discovery {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort the run before any capture starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShotError::Config { .. } | ShotError::NoSources | ShotError::Discovery { .. }
        )
    }
}

pub type ShotResult<T> = Result<T, ShotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ShotError::NoSources.is_fatal());
        assert!(ShotError::discovery("pages_json_url", "connection refused").is_fatal());
        assert!(ShotError::config("concurrency.shot_concurrency", "must be > 0").is_fatal());
        assert!(!ShotError::Timeout("home".into()).is_fatal());
        assert!(!ShotError::Upload("503".into()).is_fatal());
    }

    #[test]
    fn test_config_error_mentions_field() {
        let err = ShotError::config("defaults.threshold", "must be >= 0");
        assert!(err.to_string().contains("defaults.threshold"));
    }
}
