//! Attachment storage.

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::{Attachment, AttachmentKind};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// URL prefix under which stored files are served.
pub const UPLOADS_PREFIX: &str = "/uploads";

const META_SUFFIX: &str = ".meta";

/// Stores uploaded files and describes the ones it issued.
///
/// Attachment metadata always comes from the store, never from a client.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` and return the attachment it is served as.
    async fn store(&self, data: Bytes, name: &str, mime_type: &str) -> io::Result<Attachment>;

    /// The stored attachment behind `url`, or `None` if this store did not
    /// issue it.
    async fn describe(&self, url: &str) -> io::Result<Option<Attachment>>;

    /// Remove the file behind `url`. Unknown URLs are ignored.
    async fn remove(&self, url: &str) -> io::Result<()>;
}

/// Name and type recorded next to each stored file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeta {
    name: String,
    mime_type: String,
}

/// Files under a local directory, served read-only at `/uploads/<file>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The stored file name a URL refers to, if it has the shape this store
    /// issues.
    fn file_name(url: &str) -> Option<&str> {
        let name = url.strip_prefix(UPLOADS_PREFIX)?.strip_prefix('/')?;
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.ends_with(META_SUFFIX)
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        valid.then_some(name)
    }

    fn meta_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{file_name}{META_SUFFIX}"))
    }
}

/// `.ext` from the original name, restricted to short alphanumeric
/// extensions.
fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, data: Bytes, name: &str, mime_type: &str) -> io::Result<Attachment> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = format!("{}{}", Uuid::new_v4(), extension(name));
        let meta = StoredMeta {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
        };

        tokio::fs::write(self.meta_path(&file_name), serde_json::to_vec(&meta)?).await?;
        tokio::fs::write(self.dir.join(&file_name), &data).await?;

        debug!(file = %file_name, size = data.len(), mime = %mime_type, "Stored upload");
        Ok(Attachment {
            kind: AttachmentKind::from_mime(mime_type),
            url: format!("{UPLOADS_PREFIX}/{file_name}"),
            name: meta.name,
            size: data.len() as u64,
            mime_type: meta.mime_type,
        })
    }

    async fn describe(&self, url: &str) -> io::Result<Option<Attachment>> {
        let Some(file_name) = Self::file_name(url) else {
            return Ok(None);
        };

        let raw = match tokio::fs::read(self.meta_path(file_name)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let size = match tokio::fs::metadata(self.dir.join(file_name)).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let meta: StoredMeta = serde_json::from_slice(&raw)?;

        Ok(Some(Attachment {
            kind: AttachmentKind::from_mime(&meta.mime_type),
            url: url.to_string(),
            name: meta.name,
            size,
            mime_type: meta.mime_type,
        }))
    }

    async fn remove(&self, url: &str) -> io::Result<()> {
        let Some(file_name) = Self::file_name(url) else {
            return Ok(());
        };
        ignore_missing(tokio::fs::remove_file(self.dir.join(file_name)).await)?;
        ignore_missing(tokio::fs::remove_file(self.meta_path(file_name)).await)?;
        debug!(file = %file_name, "Removed upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        assert_eq!(extension("photo.PNG"), ".png");
        assert_eq!(extension("archive.tar.gz"), ".gz");
        assert_eq!(extension("noext"), "");
        assert_eq!(extension("bad.ex/t"), "");
    }

    #[tokio::test]
    async fn test_store_and_describe() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path().join("uploads"));

        let stored = blobs
            .store(Bytes::from_static(b"%PDF-1.4"), "report.pdf", "application/pdf")
            .await
            .unwrap();
        assert!(stored.url.starts_with("/uploads/"));
        assert!(stored.url.ends_with(".pdf"));
        assert_eq!(stored.kind, AttachmentKind::File);
        assert_eq!(stored.size, 8);

        let described = blobs.describe(&stored.url).await.unwrap();
        assert_eq!(described, Some(stored.clone()));

        let meta_url = format!("{}{META_SUFFIX}", stored.url);
        assert_eq!(blobs.describe(&meta_url).await.unwrap(), None);
        assert_eq!(blobs.describe("/uploads/missing.txt").await.unwrap(), None);
        assert_eq!(blobs.describe("/uploads/../secret").await.unwrap(), None);
        assert_eq!(blobs.describe("https://example.com/a.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path());

        let stored = blobs
            .store(Bytes::from_static(b"hello"), "note.txt", "text/plain")
            .await
            .unwrap();
        blobs.remove(&stored.url).await.unwrap();

        assert_eq!(blobs.describe(&stored.url).await.unwrap(), None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        blobs.remove(&stored.url).await.unwrap();
        blobs.remove("/uploads/../secret").await.unwrap();
    }
}
