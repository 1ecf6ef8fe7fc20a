//! Named secret resolution for protocol managers and recipes.

mod aws;
mod env;

pub use self::aws::AwsSecretsCredentialProvider;
pub use self::env::EnvCredentialProvider;

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential '{field}' for configuration '{config_name}' is missing")]
    Missing { config_name: String, field: String },
    #[error("credential backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Resolves one named secret. Implementations must not cache secrets across
/// processes; in-process caches are fine.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self, config_name: &str, field: &str) -> Result<String>;
}

/// Fixed in-memory credentials, used by tests and inline configuration.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    entries: BTreeMap<(String, String), String>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, config_name: &str, field: &str, value: &str) -> Self {
        self.entries.insert(
            (config_name.to_string(), field.to_string()),
            value.to_string(),
        );
        self
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credential(&self, config_name: &str, field: &str) -> Result<String> {
        self.entries
            .get(&(config_name.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                config_name: config_name.to_string(),
                field: field.to_string(),
            })
    }
}
