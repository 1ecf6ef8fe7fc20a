//! Bundle loaders: protocol-specific fetchers that write bundles.

mod http;
mod sftp;

pub use http::{ErrorHandler, HttpLoader, JsonProbe};
pub use sftp::{sftp_path, SftpLoader};
