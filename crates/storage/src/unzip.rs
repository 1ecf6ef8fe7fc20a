use crate::spool::{spool_to_temp, stream_temp};
use fetcher::{BundleContext, BundleRef, ByteStream, ResourceMeta, StorageError, StorageSink};
use std::io::Read;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Decorator that transparently decompresses incoming resources.
///
/// The first two spooled bytes decide: `1f 8b` streams the gunzipped bytes
/// with the `.gz`/`.gzip` URL suffix stripped; `PK` fans a zip archive out
/// into one inner write per entry. URLs ending in `.zip` (or an explicit
/// `application/zip` content type) bypass decompression so intentional
/// archives survive intact. Decompression failures fall back to the
/// original bytes.
pub struct UnzipResourceDecorator {
    inner: Arc<dyn StorageSink>,
}

impl UnzipResourceDecorator {
    pub fn new(inner: Arc<dyn StorageSink>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl StorageSink for UnzipResourceDecorator {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError> {
        Ok(Box::new(UnzipBundleContext {
            inner: self.inner.open_bundle(bundle).await?,
        }))
    }
}

struct UnzipBundleContext {
    inner: Box<dyn BundleContext>,
}

#[async_trait::async_trait]
impl BundleContext for UnzipBundleContext {
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        stream: ByteStream,
    ) -> Result<(), StorageError> {
        if should_bypass(&resource.url, resource.content_type.as_deref()) {
            return self.inner.write_resource(resource, stream).await;
        }

        let spooled = spool_to_temp(stream).await?;
        let stripped_url = strip_compression_suffix(&resource.url);

        match sniff(&spooled)? {
            Sniffed::Gzip => {
                match decompress_gzip(&spooled).await {
                    Ok(decompressed) => {
                        let resource = ResourceMeta {
                            url: stripped_url,
                            ..resource
                        };
                        self.inner
                            .write_resource(resource, stream_temp(&decompressed)?)
                            .await
                    }
                    Err(err) => {
                        tracing::error!(url = %resource.url, error = %err, "gzip decompression failed, storing original bytes");
                        let resource = ResourceMeta {
                            url: stripped_url,
                            ..resource
                        };
                        self.inner
                            .write_resource(resource, stream_temp(&spooled)?)
                            .await
                    }
                }
            }
            Sniffed::Zip => match extract_zip(&spooled).await {
                Ok(entries) => {
                    for (name, entry) in &entries {
                        let extracted = ResourceMeta {
                            url: format!("{stripped_url}/{name}"),
                            content_type: Some("application/octet-stream".to_string()),
                            ..resource.clone()
                        };
                        self.inner
                            .write_resource(extracted, stream_temp(entry)?)
                            .await?;
                    }
                    Ok(())
                }
                Err(err) => {
                    tracing::error!(url = %resource.url, error = %err, "zip extraction failed, storing original bytes");
                    let resource = ResourceMeta {
                        url: stripped_url,
                        ..resource
                    };
                    self.inner
                        .write_resource(resource, stream_temp(&spooled)?)
                        .await
                }
            },
            Sniffed::Plain => {
                let resource = ResourceMeta {
                    url: stripped_url,
                    ..resource
                };
                self.inner
                    .write_resource(resource, stream_temp(&spooled)?)
                    .await
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
        self.inner.close().await
    }
}

enum Sniffed {
    Gzip,
    Zip,
    Plain,
}

fn sniff(spooled: &NamedTempFile) -> Result<Sniffed, StorageError> {
    let mut header = [0u8; 2];
    let mut file = spooled.reopen()?;
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(match &header[..read] {
        [0x1f, 0x8b] => Sniffed::Gzip,
        b"PK" => Sniffed::Zip,
        _ => Sniffed::Plain,
    })
}

async fn decompress_gzip(spooled: &NamedTempFile) -> Result<NamedTempFile, StorageError> {
    let source = spooled.reopen()?;
    tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
        let mut decoder = flate2::read::GzDecoder::new(source);
        let mut out = NamedTempFile::new()?;
        std::io::copy(&mut decoder, out.as_file_mut())?;
        Ok(out)
    })
    .await
    .map_err(|err| StorageError::Backend(err.to_string()))?
    .map_err(StorageError::from)
}

async fn extract_zip(
    spooled: &NamedTempFile,
) -> Result<Vec<(String, NamedTempFile)>, StorageError> {
    let source = spooled.reopen()?;
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<(String, NamedTempFile)>> {
        let mut archive = zip::ZipArchive::new(source)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            if entry.name().ends_with('/') {
                continue;
            }
            let name = entry.name().to_string();
            let mut out = NamedTempFile::new()?;
            std::io::copy(&mut entry, out.as_file_mut())?;
            entries.push((name, out));
        }
        Ok(entries)
    })
    .await
    .map_err(|err| StorageError::Backend(err.to_string()))?
    .map_err(StorageError::from)
}

/// Strip a trailing `.gz`/`.gzip` from the URL path, so `page.html.gz`
/// stores as `page.html` whether or not decompression succeeded.
pub(crate) fn strip_compression_suffix(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        let path = parsed.path().to_string();
        for suffix in [".gz", ".gzip"] {
            if let Some(stripped) = path.strip_suffix(suffix) {
                let stripped = stripped.to_string();
                parsed.set_path(&stripped);
                return parsed.to_string();
            }
        }
        return url.to_string();
    }
    for suffix in [".gz", ".gzip"] {
        if let Some(stripped) = url.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    url.to_string()
}

/// Archives that are deliberate artifacts pass through untouched.
fn should_bypass(url: &str, content_type: Option<&str>) -> bool {
    if let Ok(parsed) = url::Url::parse(url) {
        if parsed.path().ends_with(".zip") {
            return true;
        }
    } else if url.ends_with(".zip") {
        return true;
    }
    matches!(content_type, Some(ct) if ct.contains("application/zip"))
}
