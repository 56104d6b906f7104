//! LocalBackend: a development fixture keeping objects on local disk with
//! metadata in SQLite. It gives no replication or durability guarantees.
//!
//! Every upload is written to its own blob file beneath
//! `base_path/{shard}/{shard}/{blob}`, where the shards are the first two bytes
//! of MD5(key). The `objects` row names the blob together with its content
//! type and size, so a row and the bytes it describes always change together.
//! Replaced or deleted blobs are removed only after the row stops naming them.

use super::{BackendError, BackendResult, ObjectBackend, ReadinessCheck};
use crate::models::object::{ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
/// Lookups retried when a concurrent put swaps the blob under a reader.
const OPEN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
enum LocalError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LocalError> for BackendError {
    fn from(err: LocalError) -> Self {
        match err {
            LocalError::ObjectNotFound(target) => BackendError::NotFound { target },
            LocalError::Sqlx(ref inner) => BackendError::failure("DatabaseError", inner),
            LocalError::Io(ref inner) => BackendError::failure("IoError", inner),
        }
    }
}

type LocalResult<T> = Result<T, LocalError>;

#[derive(Debug, Clone, FromRow)]
struct ObjectRow {
    key: String,
    blob: String,
    content_type: String,
    size_bytes: i64,
    last_modified: DateTime<Utc>,
}

pub struct LocalBackend {
    db: SqlitePool,
    base_path: PathBuf,
}

impl LocalBackend {
    /// Open (creating if needed) the metadata database and payload directory.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let db = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::with_pool(db, base_path).await
    }

    /// Wrap an existing pool, applying the schema.
    pub async fn with_pool(db: SqlitePool, base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&db).await?;
        }
        Ok(Self {
            db,
            base_path: base_path.into(),
        })
    }

    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str, blob: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(blob);
        path
    }

    async fn fetch_object(&self, key: &str) -> LocalResult<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT key, blob, content_type, size_bytes, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => LocalError::ObjectNotFound(key.to_string()),
            other => LocalError::Sqlx(other),
        })
    }

    /// Write a fresh blob (temp file, fsync, rename), then point the row at it
    /// and drop the blob it replaced.
    async fn write_object(&self, key: &str, payload: ObjectPayload) -> LocalResult<()> {
        let blob = Uuid::new_v4().simple().to_string();
        let file_path = self.blob_path(key, &blob);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = self.base_path.join(format!(".tmp-{}", blob));
        if let Err(err) = write_synced(&tmp_path, &payload.bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(LocalError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(LocalError::Io(err));
        }

        let etag = format!("{:x}", md5::compute(&payload.bytes));
        let replaced = match self
            .swap_row(key, &blob, &payload.content_type, payload.len() as i64, &etag)
            .await
        {
            Ok(replaced) => replaced,
            Err(err) => {
                self.discard_blob(&file_path).await;
                return Err(err);
            }
        };

        if let Some(old_blob) = replaced {
            self.discard_blob(&self.blob_path(key, &old_blob)).await;
        }
        Ok(())
    }

    /// Replace the row for `key` in one transaction, returning the blob it named.
    async fn swap_row(
        &self,
        key: &str,
        blob: &str,
        content_type: &str,
        size_bytes: i64,
        etag: &str,
    ) -> LocalResult<Option<String>> {
        let mut tx = self.db.begin().await?;
        // Writing first takes the write lock before anything is read.
        let replaced: Option<String> =
            sqlx::query_scalar("DELETE FROM objects WHERE key = ? RETURNING blob")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO objects (key, blob, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(blob)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(replaced)
    }

    /// Open the blob the row currently names. A put that replaces the row
    /// between the lookup and the open removes the old blob, so look again.
    async fn open_object(&self, key: &str) -> LocalResult<(ObjectRow, File)> {
        let mut attempt = 1;
        loop {
            let row = self.fetch_object(key).await?;
            match File::open(self.blob_path(key, &row.blob)).await {
                Ok(file) => return Ok((row, file)),
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < OPEN_ATTEMPTS => {
                    debug!(key, blob = %row.blob, attempt, "blob replaced during lookup");
                    attempt += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(LocalError::ObjectNotFound(key.to_string()));
                }
                Err(err) => return Err(LocalError::Io(err)),
            }
        }
    }

    /// Delete the row and its blob together. The row is only committed away
    /// once the blob is gone, so a failed removal leaves the object listed.
    async fn remove_object(&self, key: &str) -> LocalResult<()> {
        let mut tx = self.db.begin().await?;
        let blob: Option<String> =
            sqlx::query_scalar("DELETE FROM objects WHERE key = ? RETURNING blob")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let blob = blob.ok_or_else(|| LocalError::ObjectNotFound(key.to_string()))?;

        let file_path = self.blob_path(key, &blob);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            // Dropping `tx` rolls the row back.
            Err(err) => return Err(LocalError::Io(err)),
        }
        tx.commit().await?;

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Best-effort removal of a blob no row names any more.
    async fn discard_blob(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove orphaned blob {}: {}", path.display(), err),
        }
    }

    async fn list_objects(&self) -> LocalResult<Vec<ObjectSummary>> {
        let rows = sqlx::query_as::<_, ObjectRow>(
            "SELECT key, blob, content_type, size_bytes, last_modified
             FROM objects ORDER BY key ASC",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ObjectSummary {
                key: row.key,
                size: row.size_bytes,
                last_modified: row.last_modified,
            })
            .collect())
    }

    /// Remove empty directories from `start` up to, not including, `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn disk_check(&self) -> ReadinessCheck {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp_path, b"readyz").await {
            return ReadinessCheck::failed("disk", format!("could not write tmp file: {}", e));
        }
        let check = match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => ReadinessCheck::passed("disk"),
            Ok(_) => ReadinessCheck::failed("disk", "file content mismatch"),
            Err(e) => ReadinessCheck::failed("disk", format!("could not read tmp file: {}", e)),
        };
        if let Err(e) = fs::remove_file(&tmp_path).await {
            debug!("could not remove readiness probe file: {}", e);
        }
        check
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &ObjectKey, payload: ObjectPayload) -> BackendResult<()> {
        Ok(self.write_object(key.as_str(), payload).await?)
    }

    async fn get(&self, key: &ObjectKey) -> BackendResult<ObjectDownload> {
        let (row, file) = self.open_object(key.as_str()).await?;
        Ok(ObjectDownload {
            content_type: row.content_type,
            content_length: u64::try_from(row.size_bytes).ok(),
            body: ReaderStream::new(file).boxed(),
        })
    }

    async fn delete(&self, key: &ObjectKey) -> BackendResult<()> {
        Ok(self.remove_object(key.as_str()).await?)
    }

    async fn list(&self) -> BackendResult<Vec<ObjectSummary>> {
        Ok(self.list_objects().await?)
    }

    async fn check(&self) -> Vec<ReadinessCheck> {
        let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.db)
            .await
        {
            Ok(1) => ReadinessCheck::passed("sqlite"),
            Ok(v) => ReadinessCheck::failed("sqlite", format!("unexpected result: {}", v)),
            Err(e) => ReadinessCheck::failed("sqlite", format!("error: {}", e)),
        };
        vec![sqlite, self.disk_check().await]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn backend() -> (LocalBackend, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::connect("sqlite::memory:", dir.path().join("objects"))
            .await
            .unwrap();
        (backend, dir)
    }

    fn key(raw: &str) -> ObjectKey {
        ObjectKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn round_trips_bytes_and_content_type() {
        let (backend, _dir) = backend().await;
        let k = key("reports/jan.csv");
        backend
            .put(
                &k,
                ObjectPayload::new(Bytes::from_static(b"a,b,c\n1,2,3"), Some("text/csv".into())),
            )
            .await
            .unwrap();

        let download = backend.get(&k).await.unwrap();
        assert_eq!(download.content_type, "text/csv");
        assert_eq!(download.content_length, Some(11));
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"a,b,c\n1,2,3");
    }

    async fn blob_of(backend: &LocalBackend, k: &ObjectKey) -> PathBuf {
        let row = backend.fetch_object(k.as_str()).await.unwrap();
        backend.blob_path(k.as_str(), &row.blob)
    }

    #[tokio::test]
    async fn delete_removes_file_and_prunes_shards() {
        let (backend, _dir) = backend().await;
        let k = key("nested/deep/file.bin");
        backend
            .put(&k, ObjectPayload::new(Bytes::from_static(b"x"), None))
            .await
            .unwrap();
        let path = blob_of(&backend, &k).await;
        assert!(path.exists());

        backend.delete(&k).await.unwrap();
        assert!(!path.exists());
        let (shard_a, _) = LocalBackend::object_shards(k.as_str());
        assert!(!backend.base_path.join(shard_a).exists());

        let err = backend.delete(&k).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));
        let err = backend.get(&k).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failed_blob_removal_keeps_the_object_listed() {
        let (backend, _dir) = backend().await;
        let k = key("stuck.bin");
        backend
            .put(&k, ObjectPayload::new(Bytes::from_static(b"x"), None))
            .await
            .unwrap();
        let path = blob_of(&backend, &k).await;
        fs::remove_file(&path).await.unwrap();
        fs::create_dir(&path).await.unwrap();

        let err = backend.delete(&k).await.unwrap_err();
        assert!(matches!(err, BackendError::Failure { kind, .. } if kind == "IoError"));
        let listing = backend.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].key, "stuck.bin");
    }

    #[tokio::test]
    async fn overwrite_replaces_the_previous_blob() {
        let (backend, _dir) = backend().await;
        let k = key("a.txt");
        backend
            .put(&k, ObjectPayload::new(Bytes::from_static(b"one"), None))
            .await
            .unwrap();
        let first = blob_of(&backend, &k).await;
        backend
            .put(&k, ObjectPayload::new(Bytes::from_static(b"second"), None))
            .await
            .unwrap();
        let second = blob_of(&backend, &k).await;

        assert_ne!(first, second);
        assert!(!first.exists());
        assert!(second.exists());
    }

    #[tokio::test]
    async fn concurrent_puts_keep_metadata_and_bytes_together() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let backend = Arc::new(
            LocalBackend::connect(&url, dir.path().join("objects"))
                .await
                .unwrap(),
        );
        let k = key("race.bin");

        for round in 0..50 {
            let writers: Vec<_> = (1..=4usize)
                .map(|i| {
                    let backend = backend.clone();
                    let k = k.clone();
                    tokio::spawn(async move {
                        let payload = ObjectPayload::new(
                            Bytes::from(vec![i as u8; i * 1000 + round]),
                            Some(format!("type/{}", i)),
                        );
                        backend.put(&k, payload).await.unwrap();
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap();
            }

            let download = backend.get(&k).await.unwrap();
            let content_type = download.content_type.clone();
            let content_length = download.content_length;
            let body = download
                .body
                .try_collect::<Vec<Bytes>>()
                .await
                .unwrap()
                .concat();
            assert_eq!(content_length, Some(body.len() as u64), "round {round}");
            let writer = body[0] as usize;
            assert_eq!(body.len(), writer * 1000 + round, "round {round}");
            assert_eq!(content_type, format!("type/{}", writer), "round {round}");
        }

        let shard_dir = blob_of(&backend, &k).await.parent().unwrap().to_path_buf();
        assert_eq!(std::fs::read_dir(shard_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn list_is_sorted_and_reflects_overwrites() {
        let (backend, _dir) = backend().await;
        for (name, body) in [("b.txt", "bb"), ("a.txt", "a"), ("b.txt", "bbb")] {
            backend
                .put(&key(name), ObjectPayload::new(Bytes::from(body), None))
                .await
                .unwrap();
        }
        let listing = backend.list().await.unwrap();
        let keys: Vec<_> = listing.iter().map(|o| (o.key.as_str(), o.size)).collect();
        assert_eq!(keys, vec![("a.txt", 1), ("b.txt", 3)]);
    }

    #[tokio::test]
    async fn traversal_like_keys_stay_under_base_path() {
        let (backend, _dir) = backend().await;
        let k = key("../escape");
        backend
            .put(&k, ObjectPayload::new(Bytes::from_static(b"x"), None))
            .await
            .unwrap();
        assert!(blob_of(&backend, &k).await.starts_with(&backend.base_path));
        assert_eq!(backend.list().await.unwrap()[0].key, "../escape");
    }

    #[tokio::test]
    async fn readiness_checks_pass() {
        let (backend, _dir) = backend().await;
        let checks = backend.check().await;
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().all(ReadinessCheck::ok));
    }
}
