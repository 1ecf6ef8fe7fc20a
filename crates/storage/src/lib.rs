//! Storage sinks and streaming decorators for fetched bundles.
//!
//! Decorators compose from the inside out: the builder wraps the base sink
//! with unzip first (when enabled), then the archive bundler, so compressed
//! payloads are expanded before they are re-archived.

mod bundle_zip;
mod file;
mod object;
mod spool;
mod unzip;

pub use bundle_zip::BundleResourcesDecorator;
pub use file::{safe_filename, FileSink};
pub use object::ObjectStoreSink;
pub use unzip::UnzipResourceDecorator;

use fetcher::DynSink;
use std::path::PathBuf;
use std::sync::Arc;

enum Base {
    File(PathBuf),
    Object {
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint_url: Option<String>,
    },
    Custom(DynSink),
}

/// Fluent configuration of a sink and its decorator chain. The archive
/// bundler is on by default; unzip is opt-in.
pub struct StorageBuilder {
    base: Base,
    use_unzip: bool,
    use_bundler: bool,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self {
            base: Base::File(PathBuf::from("captured")),
            use_unzip: false,
            use_bundler: true,
        }
    }

    pub fn file_storage(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.base = Base::File(output_dir.into());
        self
    }

    pub fn object_storage(
        mut self,
        bucket: &str,
        prefix: &str,
        region: Option<String>,
        endpoint_url: Option<String>,
    ) -> Self {
        self.base = Base::Object {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            region,
            endpoint_url,
        };
        self
    }

    pub fn custom_storage(mut self, sink: DynSink) -> Self {
        self.base = Base::Custom(sink);
        self
    }

    pub fn decorators(mut self, use_unzip: bool, use_bundler: bool) -> Self {
        self.use_unzip = use_unzip;
        self.use_bundler = use_bundler;
        self
    }

    pub async fn build(self) -> DynSink {
        let mut sink: DynSink = match self.base {
            Base::File(path) => Arc::new(FileSink::new(path)),
            Base::Object {
                bucket,
                prefix,
                region,
                endpoint_url,
            } => Arc::new(ObjectStoreSink::from_env(&bucket, &prefix, region, endpoint_url).await),
            Base::Custom(sink) => sink,
        };

        if self.use_unzip {
            sink = Arc::new(UnzipResourceDecorator::new(sink));
        }
        if self.use_bundler {
            sink = Arc::new(BundleResourcesDecorator::new(sink));
        }
        sink
    }
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Re-exported so dependents that only consume the trait need not import the
// core crate as well.
pub use fetcher::{BundleContext, StorageError};
