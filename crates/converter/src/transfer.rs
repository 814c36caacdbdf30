//! Streaming payloads between the transport and a job workspace.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;
use crate::job::{RemoteRef, SourceRef};
use crate::progress::Throttle;

/// Suffix of artifacts still being written to the outbox
const PART_SUFFIX: &str = ".part";
/// Outbox names tried before giving up on a file name
const MAX_NAME_ATTEMPTS: usize = 1000;

pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// An outbound stream opened on the transport
pub struct Upload {
    pub writer: ByteSink,
    /// Where the artifact will be reachable once the upload is committed
    pub remote: RemoteRef,
}

/// The chat transport, seen from the pipeline
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the inbound payload behind `source`
    async fn open_source(&self, source: &SourceRef) -> Result<ByteSource, TransferError>;

    /// Open an outbound stream for an artifact of `size` bytes
    async fn open_upload(&self, file_name: &str, size: u64) -> Result<Upload, TransferError>;

    /// Make a fully written upload visible under its remote name
    async fn commit_upload(&self, _remote: &RemoteRef) -> Result<(), TransferError> {
        Ok(())
    }

    /// Discard an upload that stopped part-way; nothing of it may stay behind
    async fn abort_upload(&self, _remote: &RemoteRef) {}
}

/// Transport backed by the local file system: sources are paths, uploads land in an outbox directory
#[derive(Debug, Clone)]
pub struct LocalTransport {
    outbox: PathBuf,
}

impl LocalTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> std::io::Result<Self> {
        let outbox = outbox.into();
        std::fs::create_dir_all(&outbox)?;
        Ok(Self { outbox })
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    /// Candidate names in the outbox: `name.ext`, `name-1.ext`, `name-2.ext`, ...
    fn candidate(&self, file_name: &str, n: usize) -> PathBuf {
        if n == 0 {
            return self.outbox.join(file_name);
        }
        let name = Path::new(file_name);
        let stem = name.file_stem().and_then(|s| s.to_str()).unwrap_or("artifact");
        match name.extension().and_then(|s| s.to_str()) {
            Some(ext) => self.outbox.join(format!("{}-{}.{}", stem, n, ext)),
            None => self.outbox.join(format!("{}-{}", stem, n)),
        }
    }
}

/// In-flight name of an artifact; renamed to `path` once complete
fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    PathBuf::from(part)
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open_source(&self, source: &SourceRef) -> Result<ByteSource, TransferError> {
        let file = File::open(&source.remote_id).await?;
        Ok(Box::new(file))
    }

    async fn open_upload(&self, file_name: &str, size: u64) -> Result<Upload, TransferError> {
        for n in 0..MAX_NAME_ATTEMPTS {
            let path = self.candidate(file_name, n);
            if path.exists() {
                continue;
            }
            // create_new claims the name against concurrent uploads
            let file = match OpenOptions::new().write(true).create_new(true).open(part_path(&path)).await {
                Ok(file) => file,
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            debug!("Delivering {} bytes to {}", size, path.display());
            return Ok(Upload {
                writer: Box::new(file),
                remote: RemoteRef(path.display().to_string()),
            });
        }
        Err(TransferError::Transport(format!(
            "no free name for {} in {}",
            file_name,
            self.outbox.display()
        )))
    }

    async fn commit_upload(&self, remote: &RemoteRef) -> Result<(), TransferError> {
        let path = PathBuf::from(&remote.0);
        tokio::fs::rename(part_path(&path), &path).await?;
        Ok(())
    }

    async fn abort_upload(&self, remote: &RemoteRef) {
        let part = part_path(Path::new(&remote.0));
        match tokio::fs::remove_file(&part).await {
            Ok(()) => debug!("Discarded partial upload {}", part.display()),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial upload {}: {}", part.display(), e),
        }
    }
}

/// Moves payloads in fixed-size chunks, enforcing the size ceiling as bytes arrive
#[derive(Clone)]
pub struct TransferStager {
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    progress_interval: Duration,
}

impl TransferStager {
    pub fn new(transport: Arc<dyn Transport>, chunk_size: usize, progress_interval: Duration) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            progress_interval,
        }
    }

    /// Stream `source` into `dest`, aborting as soon as more than `max_bytes` have arrived.
    ///
    /// `on_progress(bytes, total)` fires at most once per progress interval,
    /// plus one final call with the complete byte count. A failed download
    /// leaves no partial file behind.
    pub async fn download<F>(
        &self,
        source: &SourceRef,
        dest: &Path,
        max_bytes: u64,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64, TransferError>
    where
        F: FnMut(u64, Option<u64>),
    {
        if let Some(declared) = source.declared_size {
            if declared > max_bytes {
                return Err(TransferError::SizeLimitExceeded {
                    limit: max_bytes,
                    observed: declared,
                });
            }
        }

        let mut reader = self.transport.open_source(source).await?;
        let mut file = File::create(dest).await?;

        let result = self
            .pump(&mut reader, &mut file, max_bytes, source.declared_size, cancel, &mut on_progress)
            .await;
        let result = match result {
            Ok(bytes) => file.sync_all().await.map(|_| bytes).map_err(TransferError::from),
            Err(e) => Err(e),
        };
        drop(file);

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                if e.kind() != IoErrorKind::NotFound {
                    debug!("Could not remove partial download {}: {}", dest.display(), e);
                }
            }
        }
        result
    }

    /// Stream the file at `src` to the transport under `file_name`.
    ///
    /// Once every byte is written, `confirm` decides whether the artifact is
    /// committed; a refusal, like any failure, aborts the upload on the
    /// transport so no partial artifact is left behind.
    pub async fn upload<F, C>(
        &self,
        src: &Path,
        file_name: &str,
        max_bytes: u64,
        cancel: &CancellationToken,
        mut on_progress: F,
        confirm: C,
    ) -> Result<RemoteRef, TransferError>
    where
        F: FnMut(u64, Option<u64>),
        C: FnOnce() -> bool,
    {
        let size = tokio::fs::metadata(src).await?.len();
        if size > max_bytes {
            return Err(TransferError::SizeLimitExceeded {
                limit: max_bytes,
                observed: size,
            });
        }

        let mut reader = File::open(src).await?;
        let Upload { mut writer, remote } = self.transport.open_upload(file_name, size).await?;

        let result = match self
            .pump(&mut reader, &mut writer, max_bytes, Some(size), cancel, &mut on_progress)
            .await
        {
            Ok(_) => writer.shutdown().await.map_err(TransferError::from),
            Err(e) => Err(e),
        };
        drop(writer);

        let result = match result {
            Ok(()) if confirm() => self.transport.commit_upload(&remote).await,
            Ok(()) => Err(TransferError::Cancelled),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.transport.abort_upload(&remote).await;
            return Err(e);
        }

        Ok(remote)
    }

    async fn pump<R, W, F>(
        &self,
        reader: &mut R,
        writer: &mut W,
        max_bytes: u64,
        total: Option<u64>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        F: FnMut(u64, Option<u64>),
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut transferred: u64 = 0;
        let mut throttle = Throttle::new(self.progress_interval);

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }

            transferred += n as u64;
            if transferred > max_bytes {
                return Err(TransferError::SizeLimitExceeded {
                    limit: max_bytes,
                    observed: transferred,
                });
            }

            writer.write_all(&buf[..n]).await?;

            if throttle.ready() {
                on_progress(transferred, total);
            }
        }

        writer.flush().await?;
        on_progress(transferred, Some(transferred));
        Ok(transferred)
    }
}
