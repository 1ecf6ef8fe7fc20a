use crate::{CredentialError, CredentialProvider, Result};

/// Resolves credentials from environment variables named
/// `<PREFIX>_<CONFIG_NAME>_<FIELD>`, upper-cased with `-` mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    env_prefix: String,
}

impl EnvCredentialProvider {
    pub fn new(env_prefix: &str) -> Self {
        Self {
            env_prefix: env_prefix.to_string(),
        }
    }

    fn variable_name(&self, config_name: &str, field: &str) -> String {
        let mut name = String::new();
        if !self.env_prefix.is_empty() {
            name.push_str(&self.env_prefix);
            name.push('_');
        }
        name.push_str(config_name);
        name.push('_');
        name.push_str(field);
        name.replace('-', "_").to_uppercase()
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new("TRAWLER")
    }
}

#[async_trait::async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credential(&self, config_name: &str, field: &str) -> Result<String> {
        let variable = self.variable_name(config_name, field);
        std::env::var(&variable).map_err(|_| CredentialError::Missing {
            config_name: config_name.to_string(),
            field: field.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_names_are_uppercased() {
        let provider = EnvCredentialProvider::new("TRAWLER");
        assert_eq!(
            provider.variable_name("fr-api", "consumer_key"),
            "TRAWLER_FR_API_CONSUMER_KEY"
        );
        assert_eq!(
            EnvCredentialProvider::new("").variable_name("sftp", "password"),
            "SFTP_PASSWORD"
        );
    }

    #[tokio::test]
    async fn resolves_from_process_environment() {
        std::env::set_var("TRAWLER_UNIT_TEST_TOKEN", "sesame");
        let provider = EnvCredentialProvider::default();
        assert_eq!(
            provider.get_credential("unit-test", "token").await.unwrap(),
            "sesame"
        );
    }
}
