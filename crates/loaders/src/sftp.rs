use anyhow::Context;
use fetcher::{
    BundleLoader, BundleRef, FetchRunContext, RequestMeta, ResourceMeta, StorageSink,
};
use protocols::{FileAttrs, SftpClient};
use serde_json::json;
use std::sync::Arc;

/// Strip the `sftp://` scheme, leaving the remote path.
pub fn sftp_path(url: &str) -> &str {
    url.strip_prefix("sftp://").unwrap_or(url)
}

/// Loader for SFTP paths. A file URL streams that file; a directory URL
/// loads every contained file matching the filename pattern, one bundle
/// each. Entries that fail mid-directory are logged and skipped so one bad
/// file cannot sink the rest of the listing.
pub struct SftpLoader {
    sftp: Arc<dyn SftpClient>,
    filename_pattern: glob::Pattern,
}

impl SftpLoader {
    pub fn new(sftp: Arc<dyn SftpClient>) -> Self {
        Self {
            sftp,
            filename_pattern: glob::Pattern::new("*").expect("valid pattern"),
        }
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.filename_pattern = glob::Pattern::new(pattern)?;
        Ok(self)
    }

    async fn load_file(
        &self,
        path: &str,
        attrs: &FileAttrs,
        sink: &dyn StorageSink,
    ) -> anyhow::Result<BundleRef> {
        let url = format!("sftp://{path}");
        let bundle = BundleRef::new(&url)
            .with_meta("size", json!(attrs.size))
            .with_meta("modified", json!(attrs.mtime));

        let mut bundle_ctx = sink.open_bundle(bundle).await?;
        let stream = match self.sftp.open_read(path).await {
            Ok(stream) => stream,
            Err(err) => {
                drop(bundle_ctx);
                return Err(err).with_context(|| format!("opening {url}"));
            }
        };

        let resource = ResourceMeta::new(&url)
            .with_status(200)
            .with_content_type(Some("application/octet-stream".to_string()));
        if let Err(err) = bundle_ctx.write_resource(resource, stream).await {
            drop(bundle_ctx);
            return Err(err).with_context(|| format!("storing {url}"));
        }

        let finished = bundle_ctx.close().await?;
        tracing::info!(url, bid = %finished.bid, "loaded sftp bundle");
        Ok(finished)
    }

    async fn load_directory(
        &self,
        path: &str,
        sink: &dyn StorageSink,
    ) -> anyhow::Result<Vec<BundleRef>> {
        let entries = self
            .sftp
            .list_dir(path)
            .await
            .with_context(|| format!("listing sftp://{path}"))?;

        let mut bundles = Vec::new();
        for entry in entries {
            if entry.attrs.is_dir || !self.filename_pattern.matches(&entry.name) {
                continue;
            }
            let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
            match self.load_file(&child, &entry.attrs, sink).await {
                Ok(bundle) => bundles.push(bundle),
                Err(err) => {
                    tracing::error!(path = %child, error = %format!("{err:#}"), "failed to load directory entry");
                }
            }
        }
        Ok(bundles)
    }
}

#[async_trait::async_trait]
impl BundleLoader for SftpLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        sink: &dyn StorageSink,
        _ctx: &FetchRunContext,
    ) -> anyhow::Result<Vec<BundleRef>> {
        let path = sftp_path(&request.url);
        let attrs = self
            .sftp
            .stat(path)
            .await
            .with_context(|| format!("stat {}", request.url))?;

        if attrs.is_dir {
            self.load_directory(path, sink).await
        } else {
            Ok(vec![self.load_file(path, &attrs, sink).await?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::{FakeSftp, RecordingSink};

    fn fake_tree() -> Arc<FakeSftp> {
        Arc::new(
            FakeSftp::new()
                .with_file("/d/a.txt", b"alpha", 100)
                .with_file("/d/b.log", b"beta", 200)
                .with_file("/d/c.txt", b"gamma", 300)
                .with_file("/d/sub/nested.txt", b"nested", 400),
        )
    }

    #[tokio::test]
    async fn single_file_streams_to_one_bundle() {
        let sink = RecordingSink::new();
        let loader = SftpLoader::new(fake_tree());

        let refs = loader
            .load(
                &RequestMeta::new("sftp:///d/a.txt"),
                &sink,
                &FetchRunContext::new("test"),
            )
            .await
            .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].primary_url, "sftp:///d/a.txt");
        assert_eq!(refs[0].meta["size"], 5);

        let resources = sink.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].1, b"alpha");
    }

    #[tokio::test]
    async fn directory_filters_by_pattern() {
        let sink = RecordingSink::new();
        let loader = SftpLoader::new(fake_tree()).with_pattern("*.txt").unwrap();

        let refs = loader
            .load(
                &RequestMeta::new("sftp:///d"),
                &sink,
                &FetchRunContext::new("test"),
            )
            .await
            .unwrap();

        // a.txt and c.txt match; b.log and the subdirectory do not.
        assert_eq!(refs.len(), 2);
        let urls: Vec<_> = sink
            .resources()
            .iter()
            .map(|(meta, _)| meta.url.clone())
            .collect();
        assert_eq!(urls, vec!["sftp:///d/a.txt", "sftp:///d/c.txt"]);
    }

    #[tokio::test]
    async fn missing_path_errors() {
        let sink = RecordingSink::new();
        let loader = SftpLoader::new(fake_tree());
        let result = loader
            .load(
                &RequestMeta::new("sftp:///nope"),
                &sink,
                &FetchRunContext::new("test"),
            )
            .await;
        assert!(result.is_err());
    }
}
