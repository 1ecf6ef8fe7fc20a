use crate::{CredentialError, CredentialProvider, Result};
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::Client;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Resolves credentials from AWS Secrets Manager.
///
/// Each configuration maps to one secret named `<secret_prefix>/<config_name>`
/// holding a JSON object of fields. Fetched secrets are cached for the life
/// of the process.
pub struct AwsSecretsCredentialProvider {
    secret_prefix: String,
    region: Option<String>,
    client: Mutex<Option<Client>>,
    cache: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl AwsSecretsCredentialProvider {
    pub fn new(secret_prefix: &str, region: Option<String>) -> Self {
        Self {
            secret_prefix: secret_prefix.to_string(),
            region,
            client: Mutex::new(None),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    async fn client(&self) -> Client {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return client.clone();
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let client = Client::new(&loader.load().await);
        *guard = Some(client.clone());
        client
    }

    async fn secret_document(&self, config_name: &str) -> Result<serde_json::Value> {
        if let Some(doc) = self.cache.lock().await.get(config_name) {
            return Ok(doc.clone());
        }

        let secret_id = if self.secret_prefix.is_empty() {
            config_name.to_string()
        } else {
            format!("{}/{}", self.secret_prefix, config_name)
        };

        let output = self
            .client()
            .await
            .get_secret_value()
            .secret_id(&secret_id)
            .send()
            .await
            .map_err(|err| CredentialError::Backend(err.to_string()))?;

        let raw = output
            .secret_string()
            .ok_or_else(|| CredentialError::Backend(format!("secret '{secret_id}' has no string payload")))?;
        let doc: serde_json::Value = serde_json::from_str(raw)
            .map_err(|err| CredentialError::Backend(format!("secret '{secret_id}' is not JSON: {err}")))?;

        self.cache
            .lock()
            .await
            .insert(config_name.to_string(), doc.clone());
        Ok(doc)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for AwsSecretsCredentialProvider {
    async fn get_credential(&self, config_name: &str, field: &str) -> Result<String> {
        let doc = self.secret_document(config_name).await?;
        match doc.get(field).and_then(|v| v.as_str()) {
            Some(value) => Ok(value.to_string()),
            None => Err(CredentialError::Missing {
                config_name: config_name.to_string(),
                field: field.to_string(),
            }),
        }
    }
}
