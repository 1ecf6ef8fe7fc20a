use fetcher::{ByteStream, StorageError};
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub(crate) const CHUNK: usize = 8192;

/// Drain a stream into a named temp file. The file is deleted when the
/// returned handle drops, which covers every abandon path.
pub(crate) async fn spool_to_temp(mut stream: ByteStream) -> Result<NamedTempFile, StorageError> {
    let temp = NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(temp)
}

pub(crate) fn stream_file(file: std::fs::File) -> ByteStream {
    Box::pin(ReaderStream::with_capacity(
        tokio::fs::File::from_std(file),
        CHUNK,
    ))
}

/// Re-stream a spooled temp file from the start.
pub(crate) fn stream_temp(temp: &NamedTempFile) -> Result<ByteStream, StorageError> {
    Ok(stream_file(temp.reopen()?))
}
