//! Shared test doubles: an in-memory storage sink, an in-memory SFTP tree,
//! and a canned-response TCP fixture server.

use fetcher::{
    bytes_stream, BundleContext, BundleRef, ByteStream, ResourceMeta, StorageError, StorageSink,
};
use futures::StreamExt;
use protocols::{DirEntry, FileAttrs, SftpClient, SftpError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Storage sink capturing every resource written through it.
#[derive(Clone, Default)]
pub struct RecordingSink {
    resources: Arc<Mutex<Vec<(ResourceMeta, Vec<u8>)>>>,
    closed_bundles: Arc<Mutex<Vec<BundleRef>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resources(&self) -> Vec<(ResourceMeta, Vec<u8>)> {
        self.resources.lock().unwrap().clone()
    }

    pub fn closed_bundles(&self) -> Vec<BundleRef> {
        self.closed_bundles.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StorageSink for RecordingSink {
    async fn open_bundle(
        &self,
        bundle: BundleRef,
    ) -> Result<Box<dyn BundleContext>, StorageError> {
        Ok(Box::new(RecordingContext {
            resources: self.resources.clone(),
            closed_bundles: self.closed_bundles.clone(),
            bundle,
            written: 0,
        }))
    }
}

struct RecordingContext {
    resources: Arc<Mutex<Vec<(ResourceMeta, Vec<u8>)>>>,
    closed_bundles: Arc<Mutex<Vec<BundleRef>>>,
    bundle: BundleRef,
    written: u32,
}

#[async_trait::async_trait]
impl BundleContext for RecordingContext {
    async fn write_resource(
        &mut self,
        resource: ResourceMeta,
        mut stream: ByteStream,
    ) -> Result<(), StorageError> {
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        self.resources.lock().unwrap().push((resource, body));
        self.written += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<BundleRef, StorageError> {
        let mut bundle = self.bundle;
        bundle.resources_count = self.written;
        self.closed_bundles.lock().unwrap().push(bundle.clone());
        Ok(bundle)
    }
}

/// In-memory SFTP tree keyed by absolute path.
#[derive(Default)]
pub struct FakeSftp {
    files: BTreeMap<String, FakeFile>,
}

#[derive(Clone)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mtime: u64,
}

impl FakeSftp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: &[u8], mtime: u64) -> Self {
        self.files.insert(
            path.trim_end_matches('/').to_string(),
            FakeFile {
                contents: contents.to_vec(),
                mtime,
            },
        );
        self
    }
}

#[async_trait::async_trait]
impl SftpClient for FakeSftp {
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let dir_prefix = format!("{}/", path.trim_end_matches('/'));
        let mut seen_dirs = Vec::new();
        let mut entries = Vec::new();

        for (file_path, file) in &self.files {
            let Some(rest) = file_path.strip_prefix(&dir_prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => entries.push(DirEntry {
                    name: rest.to_string(),
                    attrs: FileAttrs {
                        is_dir: false,
                        size: Some(file.contents.len() as u64),
                        mtime: Some(file.mtime),
                    },
                }),
                Some((child_dir, _)) => {
                    if !seen_dirs.contains(&child_dir.to_string()) {
                        seen_dirs.push(child_dir.to_string());
                        entries.push(DirEntry {
                            name: child_dir.to_string(),
                            attrs: FileAttrs {
                                is_dir: true,
                                size: None,
                                mtime: None,
                            },
                        });
                    }
                }
            }
        }

        if entries.is_empty() && !self.files.contains_key(path.trim_end_matches('/')) {
            // Distinguish "empty directory" from "no such directory" only as
            // far as the fakes need to.
            return Ok(Vec::new());
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileAttrs, SftpError> {
        let path = path.trim_end_matches('/');
        if let Some(file) = self.files.get(path) {
            return Ok(FileAttrs {
                is_dir: false,
                size: Some(file.contents.len() as u64),
                mtime: Some(file.mtime),
            });
        }
        let dir_prefix = format!("{path}/");
        if self.files.keys().any(|key| key.starts_with(&dir_prefix)) {
            return Ok(FileAttrs {
                is_dir: true,
                size: None,
                mtime: None,
            });
        }
        Err(SftpError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such path: {path}"),
        )))
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream, SftpError> {
        match self.files.get(path.trim_end_matches('/')) {
            Some(file) => Ok(bytes_stream(file.contents.clone())),
            None => Err(SftpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {path}"),
            ))),
        }
    }
}

/// Response returned by a [`FixtureServer`] handler.
#[derive(Clone)]
pub struct FixtureResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FixtureResponse {
    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    pub fn ok_json(body: &str) -> Self {
        Self::ok("application/json", body.as_bytes().to_vec())
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: Vec::new(),
        }
    }
}

/// Minimal HTTP/1.1 fixture: one request per connection, responses computed
/// from the request target (path plus query).
pub struct FixtureServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FixtureServer {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str) -> FixtureResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let target = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    seen.lock().unwrap().push(target.clone());

                    let response = handler(&target);
                    let head = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        response.status,
                        response.content_type,
                        response.body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&response.body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, requests }
    }

    /// Serve the same response to every request.
    pub async fn always(response: FixtureResponse) -> Self {
        Self::spawn(move |_| response.clone()).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
