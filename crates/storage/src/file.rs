use fetcher::{BundleContext, BundleRef, ByteStream, ResourceMeta, StorageError, StorageSink};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Local-filesystem sink: one `bundle_<bid>/` directory per bundle, a
/// `.meta` sidecar per resource, and a terminal `bundle.meta` summary.
///
/// An abandoned bundle is recognizable by the absence of `bundle.meta`.
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait::async_trait]
impl StorageSink for FileSink {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError> {
        let bundle_dir = self.output_dir.join(format!("bundle_{}", bundle.bid));
        tokio::fs::create_dir_all(&bundle_dir).await?;
        tracing::debug!(bid = %bundle.bid, dir = %bundle_dir.display(), "bundle opened");
        Ok(Box::new(FileBundleContext {
            bundle_dir,
            bundle,
            resources_written: 0,
        }))
    }
}

struct FileBundleContext {
    bundle_dir: PathBuf,
    bundle: BundleRef,
    resources_written: u32,
}

#[async_trait::async_trait]
impl BundleContext for FileBundleContext {
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        mut stream: ByteStream,
    ) -> Result<(), StorageError> {
        let filename = safe_filename(&resource.url);
        let path = self.bundle_dir.join(&filename);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let sidecar = json!({
            "url": resource.url,
            "content_type": resource.content_type,
            "status_code": resource.status,
            "size": size,
        });
        tokio::fs::write(
            self.bundle_dir.join(format!("{filename}.meta")),
            serde_json::to_vec_pretty(&sidecar)?,
        )
        .await?;

        self.resources_written += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
        let mut bundle = self.bundle;
        bundle.resources_count = self.resources_written;
        bundle.storage_key = Some(self.bundle_dir.display().to_string());

        let summary = json!({
            "bid": bundle.bid.to_string(),
            "primary_url": bundle.primary_url,
            "resources_count": bundle.resources_count,
            "storage_key": bundle.storage_key,
            "meta": bundle.meta,
        });
        tokio::fs::write(
            self.bundle_dir.join("bundle.meta"),
            serde_json::to_vec_pretty(&summary)?,
        )
        .await?;

        Ok(bundle)
    }
}

/// Map a URL onto a filename that is safe for any filesystem: URL-decode the
/// path, strip the leading `/`, and replace anything outside `[A-Za-z0-9_.-]`
/// with `_`. An empty result becomes `index.html`.
pub fn safe_filename(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    let decoded = percent_encoding::percent_decode_str(&path).decode_utf8_lossy();
    let safe = sanitize(decoded.trim_start_matches('/'));

    if safe.is_empty() {
        "index.html".to_string()
    } else {
        safe
    }
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub(crate) fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetcher::bytes_stream;

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(safe_filename("https://h/a/b/report.html"), "a_b_report.html");
        assert_eq!(safe_filename("https://h/"), "index.html");
        assert_eq!(safe_filename("https://h"), "index.html");
        assert_eq!(safe_filename("https://h/caf%C3%A9 menu.pdf"), "caf__menu.pdf");
    }

    #[tokio::test]
    async fn bundle_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());

        let bundle = BundleRef::new("https://h/a.html");
        let bid = bundle.bid;
        let mut ctx = sink.open_bundle(bundle).await.unwrap();

        ctx.write_resource(
            ResourceMeta::new("https://h/a.html")
                .with_status(200)
                .with_content_type(Some("text/html".to_string())),
            bytes_stream("<html/>"),
        )
        .await
        .unwrap();

        let finished = ctx.close().await.unwrap();
        assert_eq!(finished.resources_count, 1);

        let bundle_dir = dir.path().join(format!("bundle_{bid}"));
        assert_eq!(
            std::fs::read(bundle_dir.join("a.html")).unwrap(),
            b"<html/>"
        );
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(bundle_dir.join("a.html.meta")).unwrap())
                .unwrap();
        assert_eq!(sidecar["status_code"], 200);
        assert_eq!(sidecar["size"], 7);

        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(bundle_dir.join("bundle.meta")).unwrap())
                .unwrap();
        assert_eq!(summary["resources_count"], 1);
        assert_eq!(summary["primary_url"], "https://h/a.html");
    }

    #[tokio::test]
    async fn abandoned_bundle_has_no_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());

        let bundle = BundleRef::new("https://h/b");
        let bid = bundle.bid;
        let mut ctx = sink.open_bundle(bundle).await.unwrap();
        ctx.write_resource(
            ResourceMeta::new("https://h/b").with_status(200),
            bytes_stream("partial"),
        )
        .await
        .unwrap();
        drop(ctx);

        assert!(!dir
            .path()
            .join(format!("bundle_{bid}"))
            .join("bundle.meta")
            .exists());
    }
}
