//! Durable backend keeping one file per variant.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<sha256(identity)>/<sha256(variant key)>.variant
//! <root>/tmp_<pid>_<seq>            (in-flight writes)
//! ```
//!
//! A variant file is a big-endian `u32` metadata length, the JSON metadata,
//! then the body. Writes go to a temp file that is renamed into place, so a
//! reader sees either the old file or the new one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{BackendFuture, CacheBackend, is_evictable};
use crate::cache::clock::{from_unix_millis, unix_millis};
use crate::cache::error::BackendError;
use crate::cache::etag::EntityTag;
use crate::cache::key::{ResourceIdentity, VariantKey};
use crate::cache::record::VariantRecord;
use crate::http::Headers;
use crate::negotiate::MediaType;

const RECORD_EXTENSION: &str = "variant";
const TEMP_PREFIX: &str = "tmp_";
const META_LEN_BYTES: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    identity: ResourceIdentity,
    key: VariantKey,
    media_type: MediaType,
    etag: EntityTag,
    created_at_ms: u64,
    max_age_ms: u64,
    last_modified_ms: Option<u64>,
    headers: Vec<(String, String)>,
}

impl PersistedRecord {
    fn new(identity: &ResourceIdentity, key: &VariantKey, record: &VariantRecord) -> Self {
        Self {
            identity: identity.clone(),
            key: key.clone(),
            media_type: record.media_type().clone(),
            etag: record.etag().clone(),
            created_at_ms: unix_millis(record.created_at()),
            max_age_ms: u64::try_from(record.max_age().as_millis()).unwrap_or(u64::MAX),
            last_modified_ms: record.last_modified().map(unix_millis),
            headers: record
                .headers()
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }

    fn into_record(self, body: Bytes) -> VariantRecord {
        VariantRecord::new(
            body,
            self.media_type,
            from_unix_millis(self.created_at_ms),
            Duration::from_millis(self.max_age_ms),
        )
        .with_etag(self.etag)
        .with_last_modified(self.last_modified_ms.map(from_unix_millis))
        .with_headers(self.headers.into_iter().collect::<Headers>())
    }
}

#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    temp_seq: AtomicU64,
}

impl FileBackend {
    /// Opens (creating if needed) a backend rooted at `dir` and removes temp
    /// files left behind by an interrupted process.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let backend = Self {
            dir,
            temp_seq: AtomicU64::new(0),
        };
        let removed = backend.remove_temp_files().await?;
        if removed > 0 {
            debug!(dir = %backend.dir.display(), removed, "removed stale temp files");
        }
        Ok(backend)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn identity_dir(&self, identity: &ResourceIdentity) -> PathBuf {
        self.dir.join(digest(identity.as_str().as_bytes()))
    }

    fn record_path(&self, identity: &ResourceIdentity, key: &VariantKey) -> Result<PathBuf, BackendError> {
        let name = digest(key.storage_key()?.as_bytes());
        Ok(self
            .identity_dir(identity)
            .join(format!("{name}.{RECORD_EXTENSION}")))
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{TEMP_PREFIX}{}_{seq}", std::process::id()))
    }

    async fn remove_temp_files(&self) -> Result<usize, BackendError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp && entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn read_record(path: &Path) -> Result<Option<(PersistedRecord, Bytes)>, BackendError> {
        match fs::read(path).await {
            Ok(data) => decode(path, Bytes::from(data)).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn sweep_identity_dir(
        &self,
        dir: &Path,
        now: SystemTime,
        retention: Duration,
    ) -> Result<usize, BackendError> {
        let mut removed = 0;
        let mut remaining = 0;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                remaining += 1;
                continue;
            }
            let evict = match Self::read_record(&path).await {
                Ok(Some((meta, body))) => is_evictable(&meta.into_record(body), now, retention),
                Ok(None) => false,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "dropping unreadable variant file");
                    true
                }
            };
            if evict {
                remove_file_if_present(&path).await?;
                removed += 1;
            } else {
                remaining += 1;
            }
        }
        if remaining == 0 {
            match fs::remove_dir(dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                // A concurrent put may have landed a file after the scan.
                Err(err) => debug!(dir = %dir.display(), error = %err, "kept identity directory"),
            }
        }
        Ok(removed)
    }
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
    ) -> BackendFuture<'a, Option<VariantRecord>> {
        Box::pin(async move {
            let path = self.record_path(identity, key)?;
            let Some((meta, body)) = Self::read_record(&path).await? else {
                return Ok(None);
            };
            if meta.key != *key || meta.identity != *identity {
                debug!(path = %path.display(), "variant file belongs to another key");
                return Ok(None);
            }
            Ok(Some(meta.into_record(body)))
        })
    }

    fn put<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
        record: VariantRecord,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = self.record_path(identity, key)?;
            fs::create_dir_all(self.identity_dir(identity)).await?;
            let data = encode(&PersistedRecord::new(identity, key, &record), record.body())?;

            let temp = self.temp_path();
            let written = async {
                let mut file = fs::File::create(&temp).await?;
                file.write_all(&data).await?;
                file.sync_all().await?;
                fs::rename(&temp, &path).await
            }
            .await;
            if let Err(err) = written {
                let _ = fs::remove_file(&temp).await;
                return Err(err.into());
            }
            Ok(())
        })
    }

    fn remove_all<'a>(&'a self, identity: &'a ResourceIdentity) -> BackendFuture<'a, usize> {
        Box::pin(async move {
            let dir = self.identity_dir(identity);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
                Err(err) => return Err(err.into()),
            };
            let mut count = 0;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXTENSION) {
                    count += 1;
                }
            }
            match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(count),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(count),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn remove_expired(&self, now: SystemTime, retention: Duration) -> BackendFuture<'_, usize> {
        Box::pin(async move {
            let mut removed = 0;
            let mut entries = fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    removed += self.sweep_identity_dir(&entry.path(), now, retention).await?;
                }
            }
            Ok(removed)
        })
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn encode(meta: &PersistedRecord, body: &[u8]) -> Result<Vec<u8>, BackendError> {
    let meta = serde_json::to_vec(meta)?;
    let meta_len = u32::try_from(meta.len())
        .map_err(|_| BackendError::Io(std::io::Error::other("variant metadata exceeds 4 GiB")))?;
    let mut buf = Vec::with_capacity(META_LEN_BYTES + meta.len() + body.len());
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(body);
    Ok(buf)
}

fn decode(path: &Path, data: Bytes) -> Result<(PersistedRecord, Bytes), BackendError> {
    let corrupt = |reason| BackendError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    if data.len() < META_LEN_BYTES {
        return Err(corrupt("truncated length prefix"));
    }
    let meta_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let meta_end = META_LEN_BYTES
        .checked_add(meta_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| corrupt("truncated metadata"))?;
    let meta: PersistedRecord = serde_json::from_slice(&data[META_LEN_BYTES..meta_end])?;
    Ok((meta, data.slice(meta_end..)))
}

async fn remove_file_if_present(path: &Path) -> Result<(), BackendError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
