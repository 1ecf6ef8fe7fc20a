use crate::spool::{spool_to_temp, stream_file};
use fetcher::{BundleContext, BundleRef, ByteStream, ResourceMeta, StorageError, StorageSink};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Decorator that collapses every resource of a bundle into one DEFLATE
/// archive, written to the inner sink as a single `bundle.zip` resource.
/// Entries are named `resource_<NNN>.<ext>`, the extension derived from each
/// resource's content type.
pub struct BundleResourcesDecorator {
    inner: Arc<dyn StorageSink>,
}

impl BundleResourcesDecorator {
    pub fn new(inner: Arc<dyn StorageSink>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl StorageSink for BundleResourcesDecorator {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError> {
        Ok(Box::new(BundleZipContext {
            inner: self.inner.open_bundle(bundle).await?,
            spooled: Vec::new(),
        }))
    }
}

struct SpooledResource {
    content_type: Option<String>,
    temp: NamedTempFile,
}

struct BundleZipContext {
    inner: Box<dyn BundleContext>,
    spooled: Vec<SpooledResource>,
}

#[async_trait::async_trait]
impl BundleContext for BundleZipContext {
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        stream: ByteStream,
    ) -> Result<(), StorageError> {
        let temp = spool_to_temp(stream).await?;
        self.spooled.push(SpooledResource {
            content_type: resource.content_type,
            temp,
        });
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
        let BundleZipContext { mut inner, spooled } = *self;
        if spooled.is_empty() {
            return inner.close().await;
        }

        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            let out = NamedTempFile::new()?;
            let mut writer = zip::ZipWriter::new(out.reopen()?);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);

            for (index, resource) in spooled.iter().enumerate() {
                let name = format!(
                    "resource_{:03}{}",
                    index,
                    extension_for(resource.content_type.as_deref())
                );
                writer
                    .start_file(name, options)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                std::io::copy(&mut resource.temp.reopen()?, &mut writer)?;
            }
            writer
                .finish()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            Ok(out)
        })
        .await
        .map_err(|err| StorageError::Backend(err.to_string()))??;

        inner
            .write_resource(
                ResourceMeta::new("bundle.zip")
                    .with_status(200)
                    .with_content_type(Some("application/zip".to_string())),
                stream_file(archive.reopen()?),
            )
            .await?;

        inner.close().await
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type {
        Some(ct) if ct.contains("html") => ".html",
        Some(ct) if ct.contains("json") => ".json",
        Some(ct) if ct.contains("xml") => ".xml",
        Some(ct) if ct.contains("text") => ".txt",
        _ => ".bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::RecordingSink;
    use fetcher::bytes_stream;
    use std::io::Read;

    #[tokio::test]
    async fn resources_collapse_into_one_archive() {
        let recording = RecordingSink::new();
        let sink = BundleResourcesDecorator::new(Arc::new(recording.clone()));

        let mut ctx = sink
            .open_bundle(BundleRef::new("https://h/page"))
            .await
            .unwrap();
        for (url, content_type, body) in [
            ("https://h/page", Some("text/html"), "<html/>"),
            ("https://h/data", Some("application/json"), "{}"),
            ("https://h/blob", None, "raw"),
        ] {
            ctx.write_resource(
                ResourceMeta::new(url)
                    .with_status(200)
                    .with_content_type(content_type.map(str::to_string)),
                bytes_stream(body),
            )
            .await
            .unwrap();
        }
        let finished = ctx.close().await.unwrap();
        // The inner sink saw exactly one resource.
        assert_eq!(finished.resources_count, 1);

        let resources = recording.resources();
        assert_eq!(resources.len(), 1);
        let (meta, body) = &resources[0];
        assert_eq!(meta.url, "bundle.zip");
        assert_eq!(meta.content_type.as_deref(), Some("application/zip"));

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body.clone())).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["resource_000.html", "resource_001.json", "resource_002.bin"]
        );

        let mut first = String::new();
        archive
            .by_name("resource_000.html")
            .unwrap()
            .read_to_string(&mut first)
            .unwrap();
        assert_eq!(first, "<html/>");
    }

    #[tokio::test]
    async fn empty_bundle_writes_nothing() {
        let recording = RecordingSink::new();
        let sink = BundleResourcesDecorator::new(Arc::new(recording.clone()));

        let ctx = sink
            .open_bundle(BundleRef::new("https://h/empty"))
            .await
            .unwrap();
        let finished = ctx.close().await.unwrap();

        assert_eq!(finished.resources_count, 0);
        assert!(recording.resources().is_empty());
    }
}
