//! Environment-driven application configuration.
//!
//! Every setting can come from a `TRAWLER_*` environment variable; the few
//! that are also CLI flags (`--storage`, `--kvstore`,
//! `--credentials-provider`, `--concurrency`) override the environment.

use anyhow::Context;
use credentials::{AwsSecretsCredentialProvider, CredentialProvider, EnvCredentialProvider};
use kv::{KvStore, MemoryKvStore, RedisConfig, RedisKvStore, Serializer};
use std::sync::Arc;
use std::time::Duration;
use storage::StorageBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageKind {
    File,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KvKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CredentialsKind {
    Env,
    Aws,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub run_id: String,
    pub concurrency: usize,

    pub storage_kind: StorageKind,
    pub storage_bucket: Option<String>,
    pub storage_prefix: String,
    pub storage_region: Option<String>,
    pub storage_endpoint: Option<String>,
    pub storage_output_dir: String,
    pub storage_unzip: bool,
    pub storage_bundler: bool,

    pub kv_kind: KvKind,
    pub kv_host: String,
    pub kv_port: u16,
    pub kv_db: i64,
    pub kv_password: Option<String>,
    pub kv_prefix: String,
    pub kv_default_ttl: Option<Duration>,
    pub kv_serializer: Serializer,

    pub credentials_kind: CredentialsKind,
    pub credentials_region: Option<String>,
    pub credentials_env_prefix: String,
    pub credentials_secret_prefix: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_opt(name) {
        Some(value) => matches!(value.as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let storage_kind = match env_opt("TRAWLER_STORAGE_TYPE").as_deref() {
            None | Some("file") => StorageKind::File,
            Some("s3") => StorageKind::S3,
            Some(other) => anyhow::bail!("unsupported TRAWLER_STORAGE_TYPE '{other}'"),
        };
        let kv_kind = match env_opt("TRAWLER_KV_TYPE").as_deref() {
            None | Some("memory") => KvKind::Memory,
            Some("redis") => KvKind::Redis,
            Some(other) => anyhow::bail!("unsupported TRAWLER_KV_TYPE '{other}'"),
        };
        let credentials_kind = match env_opt("TRAWLER_CREDENTIALS_TYPE").as_deref() {
            None | Some("env") => CredentialsKind::Env,
            Some("aws") => CredentialsKind::Aws,
            Some(other) => anyhow::bail!("unsupported TRAWLER_CREDENTIALS_TYPE '{other}'"),
        };
        let kv_serializer = match env_opt("TRAWLER_KV_SERIALIZER").as_deref() {
            None | Some("json") => Serializer::Json,
            Some("binary") => Serializer::Binary,
            Some(other) => anyhow::bail!("unsupported TRAWLER_KV_SERIALIZER '{other}'"),
        };

        Ok(Self {
            run_id: env_opt("TRAWLER_RUN_ID")
                .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4())),
            concurrency: env_opt("TRAWLER_CONCURRENCY")
                .map(|v| v.parse().context("parsing TRAWLER_CONCURRENCY"))
                .transpose()?
                .unwrap_or(4),

            storage_kind,
            storage_bucket: env_opt("TRAWLER_STORAGE_BUCKET"),
            storage_prefix: env_opt("TRAWLER_STORAGE_PREFIX").unwrap_or_default(),
            storage_region: env_opt("TRAWLER_STORAGE_REGION"),
            storage_endpoint: env_opt("TRAWLER_STORAGE_ENDPOINT"),
            storage_output_dir: env_opt("TRAWLER_STORAGE_OUTPUT_DIR")
                .unwrap_or_else(|| "captured".to_string()),
            storage_unzip: env_flag("TRAWLER_STORAGE_UNZIP", false),
            storage_bundler: env_flag("TRAWLER_STORAGE_BUNDLER", true),

            kv_kind,
            kv_host: env_opt("TRAWLER_KV_HOST").unwrap_or_else(|| "localhost".to_string()),
            kv_port: env_opt("TRAWLER_KV_PORT")
                .map(|v| v.parse().context("parsing TRAWLER_KV_PORT"))
                .transpose()?
                .unwrap_or(6379),
            kv_db: env_opt("TRAWLER_KV_DB")
                .map(|v| v.parse().context("parsing TRAWLER_KV_DB"))
                .transpose()?
                .unwrap_or(0),
            kv_password: env_opt("TRAWLER_KV_PASSWORD"),
            kv_prefix: env_opt("TRAWLER_KV_PREFIX").unwrap_or_else(|| "trawler".to_string()),
            kv_default_ttl: env_opt("TRAWLER_KV_TTL")
                .map(|v| v.parse::<u64>().context("parsing TRAWLER_KV_TTL"))
                .transpose()?
                .map(Duration::from_secs),
            kv_serializer,

            credentials_kind,
            credentials_region: env_opt("TRAWLER_CREDENTIALS_REGION"),
            credentials_env_prefix: env_opt("TRAWLER_CREDENTIALS_ENV_PREFIX")
                .unwrap_or_else(|| "TRAWLER".to_string()),
            credentials_secret_prefix: env_opt("TRAWLER_CREDENTIALS_SECRET_PREFIX")
                .unwrap_or_else(|| "trawler".to_string()),
        })
    }

    pub fn build_kv_store(&self) -> Arc<dyn KvStore> {
        match self.kv_kind {
            KvKind::Memory => Arc::new(MemoryKvStore::new(
                self.kv_serializer,
                self.kv_default_ttl,
                &self.kv_prefix,
            )),
            KvKind::Redis => Arc::new(RedisKvStore::new(RedisConfig {
                host: self.kv_host.clone(),
                port: self.kv_port,
                db: self.kv_db,
                password: self.kv_password.clone(),
                serializer: self.kv_serializer,
                default_ttl: self.kv_default_ttl,
                key_prefix: self.kv_prefix.clone(),
            })),
        }
    }

    pub fn build_credential_provider(&self) -> Arc<dyn CredentialProvider> {
        match self.credentials_kind {
            CredentialsKind::Env => {
                Arc::new(EnvCredentialProvider::new(&self.credentials_env_prefix))
            }
            CredentialsKind::Aws => Arc::new(AwsSecretsCredentialProvider::new(
                &self.credentials_secret_prefix,
                self.credentials_region.clone(),
            )),
        }
    }

    pub async fn build_storage_sink(&self) -> anyhow::Result<fetcher::DynSink> {
        let builder = match self.storage_kind {
            StorageKind::File => StorageBuilder::new().file_storage(&self.storage_output_dir),
            StorageKind::S3 => {
                let bucket = self
                    .storage_bucket
                    .as_deref()
                    .context("TRAWLER_STORAGE_BUCKET is required for s3 storage")?;
                StorageBuilder::new().object_storage(
                    bucket,
                    &self.storage_prefix,
                    self.storage_region.clone(),
                    self.storage_endpoint.clone(),
                )
            }
        };
        Ok(builder
            .decorators(self.storage_unzip, self.storage_bundler)
            .build()
            .await)
    }
}
