//! Bundle locators: resumable producers of work.
//!
//! Every locator serializes its mutable state behind a mutex and persists
//! progress to the KV store, so runs resume where they stopped and no URL is
//! yielded twice.

mod directory;
mod paginated;
mod persist;
mod requeue;
mod single;

pub use directory::{DirectoryBundleLocator, FileFilter, FileListBundleLocator};
pub use paginated::{
    DateFilter, NarrowingStrategy, PaginatedApiBundleLocator, PaginatedApiConfig,
    PaginationStrategy, QueryBuilder,
};
pub use persist::{BundleResult, ErrorRecord};
pub use requeue::RequeueFailedLocator;
pub use single::SingleApiBundleLocator;

/// Strip the `sftp://` scheme, leaving the remote path.
pub(crate) fn remote_path(url: &str) -> &str {
    url.strip_prefix("sftp://").unwrap_or(url)
}
