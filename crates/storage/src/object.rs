use crate::spool::spool_to_temp;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use fetcher::{BundleContext, BundleRef, ByteStream, ResourceMeta, StorageError, StorageSink};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Object-store sink: one object per resource under
/// `<prefix>/bundles/<bid>/resources_<name>`, plus a terminal
/// `metadata.json` whose absence marks an abandoned bundle. Partial writes
/// are not garbage-collected here; an external sweep can use that signal.
pub struct ObjectStoreSink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl ObjectStoreSink {
    pub fn new(client: aws_sdk_s3::Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Build a sink from ambient AWS configuration, with optional region and
    /// endpoint overrides (the endpoint override also enables path-style
    /// addressing, which local S3 stand-ins require).
    pub async fn from_env(
        bucket: &str,
        prefix: &str,
        region: Option<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(aws_sdk_s3::Client::from_conf(builder.build()), bucket, prefix)
    }
}

#[async_trait::async_trait]
impl StorageSink for ObjectStoreSink {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError> {
        Ok(Box::new(ObjectBundleContext {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            bundle_prefix: format!("{}/bundles/{}", self.prefix, bundle.bid),
            bundle,
            resource_keys: Vec::new(),
        }))
    }
}

struct ObjectBundleContext {
    client: aws_sdk_s3::Client,
    bucket: String,
    bundle_prefix: String,
    bundle: BundleRef,
    resource_keys: Vec<String>,
}

impl ObjectBundleContext {
    /// Key on the last URL path segment when it survives sanitizing, a
    /// stable URL hash otherwise.
    fn resource_key(&self, url: &str) -> String {
        let segment = url::Url::parse(url)
            .ok()
            .and_then(|parsed| {
                parsed.path_segments().and_then(|segments| {
                    segments
                        .filter(|segment| !segment.is_empty())
                        .last()
                        .map(str::to_string)
                })
            })
            .map(|segment| crate::file::sanitize(&segment))
            .filter(|segment| !segment.is_empty());

        let name = segment
            .unwrap_or_else(|| hex::encode(&Sha256::digest(url.as_bytes())[..4]));
        format!("{}/resources_{}", self.bundle_prefix, name)
    }
}

#[async_trait::async_trait]
impl BundleContext for ObjectBundleContext {
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        stream: ByteStream,
    ) -> Result<(), StorageError> {
        // Spool first: the SDK wants a sized, replayable body.
        let spooled = spool_to_temp(stream).await?;
        let body = S3ByteStream::from_path(spooled.path())
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        let key = self.resource_key(&resource.url);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(
                resource
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .metadata("url", &resource.url)
            .metadata(
                "status_code",
                resource.status.map_or_else(String::new, |s| s.to_string()),
            )
            .body(body)
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        tracing::debug!(bid = %self.bundle.bid, key, "resource uploaded");
        self.resource_keys.push(key);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
        let mut bundle = self.bundle;
        bundle.resources_count = self.resource_keys.len() as u32;
        bundle.storage_key = Some(self.bundle_prefix.clone());

        let metadata = json!({
            "bid": bundle.bid.to_string(),
            "primary_url": bundle.primary_url,
            "resources_count": bundle.resources_count,
            "storage_key": bundle.storage_key,
            "resource_keys": self.resource_keys,
            "meta": bundle.meta,
        });

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(format!("{}/metadata.json", self.bundle_prefix))
            .content_type("application/json")
            .body(S3ByteStream::from(serde_json::to_vec_pretty(&metadata)?))
            .send()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_for(prefix: &str) -> ObjectBundleContext {
        // Client construction needs a runtime; tests only exercise key
        // shaping, so a minimal config is enough.
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        ObjectBundleContext {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: "bucket".to_string(),
            bundle_prefix: prefix.to_string(),
            bundle: BundleRef::new("https://h/a"),
            resource_keys: Vec::new(),
        }
    }

    #[test]
    fn resource_keys_use_filename_or_hash() {
        let ctx = context_for("pfx/bundles/b1");
        assert_eq!(
            ctx.resource_key("https://h/data/report.json"),
            "pfx/bundles/b1/resources_report.json"
        );
        // A bare host has no usable filename: fall back to a stable hash.
        let hashed = ctx.resource_key("https://h/");
        assert!(hashed.starts_with("pfx/bundles/b1/resources_"));
        assert_eq!(hashed, ctx.resource_key("https://h/"));
    }
}
