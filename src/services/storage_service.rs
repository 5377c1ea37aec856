//! src/services/storage_service.rs
//!
//! StorageService — the object-storage backend behind the upload adapter.
//! Metadata lives in SQLite, payloads on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. The quota ceiling is enforced
//! here at write time against live usage.

use crate::models::{bucket::Bucket, file::VirtualFile, object::Object};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{BTreeMap, HashMap},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("quota exceeded: {used} of {max} bytes in use, {requested} requested")]
    QuotaExceeded { used: u64, max: u64, requested: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage operations the upload adapter relies on.
///
/// Implementations are shared across sessions and must synchronize
/// internally; callers never hold a lock across calls.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the bucket if it is missing, returning the stored record either way.
    async fn upsert_bucket(&self, name: &str) -> StorageResult<Bucket>;

    async fn get_bucket(&self, name: &str) -> StorageResult<Bucket>;

    /// Total bytes currently stored in the bucket.
    async fn bucket_quota(&self, bucket: &Bucket) -> StorageResult<u64>;

    /// List the files under `path`. Non-recursive listings collapse nested
    /// keys into one directory entry per child segment.
    async fn list_files(
        &self,
        bucket: &Bucket,
        path: &str,
        recursive: bool,
    ) -> StorageResult<Vec<VirtualFile>>;

    /// Metadata plus an open, seekable handle on the payload.
    async fn get_file(&self, bucket: &Bucket, key: &str) -> StorageResult<(Object, File)>;

    /// Persist `data` under `key`, replacing any existing object. Rejects the
    /// write when the bucket's live usage plus `data` would exceed `max_bytes`.
    async fn put_asset(
        &self,
        bucket: &Bucket,
        key: &str,
        data: Bytes,
        last_modified: DateTime<Utc>,
        max_bytes: u64,
    ) -> StorageResult<Object>;
}

/// StorageService provides the backend for asset buckets:
/// - Upsert/fetch buckets (metadata row + bucket directory)
/// - Report bucket usage
/// - List objects as virtual files
/// - Write an asset (bytes to disk, metadata into SQLite) under a quota
/// - Open an asset for reading
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// One writer per bucket at a time, so the quota check and the write
    /// it guards cannot interleave with another write to the same bucket.
    write_locks: Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const OBJECT_COLUMNS: &str =
    "id, bucket_id, key, filename, size_bytes, etag, last_modified, is_deleted";

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            write_locks: Arc::default(),
        }
    }

    fn bucket_write_lock(&self, bucket: &Bucket) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(bucket.id).or_default().clone()
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Physical base folder for a bucket. Does not check for existence.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard identifiers for an object key: the first two bytes of
    /// MD5(bucket/key) as lowercase hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{key}. Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Fetch bucket metadata from SQLite. Returns BucketNotFound if missing.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    /// Fetch a non-deleted object metadata record.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0"
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Live usage of a bucket, optionally ignoring the object stored under `except_key`.
    async fn used_bytes(&self, bucket: &Bucket, except_key: Option<&str>) -> StorageResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM objects WHERE is_deleted = 0 AND bucket_id = ",
        );
        builder.push_bind(bucket.id);
        if let Some(key) = except_key {
            builder.push(" AND key <> ");
            builder.push_bind(key);
        }
        let used: i64 = builder
            .build_query_scalar()
            .fetch_one(&*self.db)
            .await?;
        Ok(used.max(0) as u64)
    }

    /// Write `data` to a temp file beside `file_path` and fsync it. The
    /// caller renames it into place.
    async fn stage_payload(&self, file_path: &Path, data: &[u8]) -> StorageResult<PathBuf> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            remove_logged(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(tmp_path)
    }

    /// Move `tmp_path` over `file_path`, keeping any previous payload at the
    /// returned backup path until the caller commits or restores it.
    async fn swap_in_payload(
        &self,
        tmp_path: &Path,
        file_path: &Path,
    ) -> StorageResult<Option<PathBuf>> {
        let backup = match fs::metadata(file_path).await {
            Ok(_) => {
                let backup = file_path.with_file_name(format!(".bak-{}", Uuid::new_v4()));
                fs::rename(file_path, &backup).await?;
                Some(backup)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(StorageError::Io(err)),
        };

        if let Err(err) = fs::rename(tmp_path, file_path).await {
            restore_payload(backup.as_deref(), file_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(backup)
    }
}

/// Remove a scratch file, logging instead of failing.
async fn remove_logged(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

/// Put the previous payload back after a failed write, or drop the new one
/// when there was none.
async fn restore_payload(backup: Option<&Path>, file_path: &Path) {
    match backup {
        Some(backup) => {
            if let Err(err) = fs::rename(backup, file_path).await {
                warn!(
                    "failed to restore {} from {}: {}",
                    file_path.display(),
                    backup.display(),
                    err
                );
            }
        }
        None => remove_logged(file_path).await,
    }
}

#[async_trait]
impl ObjectStorage for StorageService {
    /// Validates the name, inserts the metadata row unless it already exists,
    /// and makes sure the bucket directory is present.
    async fn upsert_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        self.fetch_bucket(name).await
    }

    async fn get_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.fetch_bucket(name).await
    }

    async fn bucket_quota(&self, bucket: &Bucket) -> StorageResult<u64> {
        self.used_bytes(bucket, None).await
    }

    async fn list_files(
        &self,
        bucket: &Bucket,
        path: &str,
        recursive: bool,
    ) -> StorageResult<Vec<VirtualFile>> {
        let trimmed = path.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE is_deleted = 0 AND bucket_id = "
        ));
        builder.push_bind(bucket.id);
        if !prefix.is_empty() {
            builder.push(" AND instr(key, ");
            builder.push_bind(prefix.clone());
            builder.push(") = 1");
        }
        builder.push(" ORDER BY key ASC");

        let rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;
        debug!(
            "listing {} objects under `{}` in {}",
            rows.len(),
            prefix,
            bucket.name
        );

        let mut dirs: BTreeMap<String, Option<DateTime<Utc>>> = BTreeMap::new();
        let mut files = Vec::new();
        for obj in rows {
            if !recursive {
                let common = compute_common_prefix(&obj.key, Some(prefix.as_str()), "/");
                if let Some(common) = common {
                    let name = common[prefix.len()..].trim_end_matches('/').to_string();
                    let latest = dirs.entry(name).or_insert(None);
                    if latest.is_none_or(|t| t < obj.last_modified) {
                        *latest = Some(obj.last_modified);
                    }
                    continue;
                }
            }
            files.push(VirtualFile {
                name: obj.key[prefix.len()..].to_string(),
                is_dir: false,
                size: obj.size_bytes,
                mod_time: Some(obj.last_modified),
            });
        }

        let mut listing: Vec<VirtualFile> = dirs
            .into_iter()
            .map(|(name, mod_time)| VirtualFile {
                mod_time,
                ..VirtualFile::dir(name)
            })
            .collect();
        listing.extend(files);
        Ok(listing)
    }

    /// Returns ObjectNotFound if metadata exists but the physical file is missing.
    async fn get_file(&self, bucket: &Bucket, key: &str) -> StorageResult<(Object, File)> {
        ensure_key_safe(key)?;
        let object = self.fetch_object(bucket, key).await?;

        let file_path = self.object_path(&bucket.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Under the bucket's write lock:
    /// - checks live usage (excluding the object being replaced) against `max_bytes`
    /// - stages the payload in a temp file (fsync)
    /// - upserts the metadata row in a transaction
    /// - swaps the payload into place, then commits
    ///
    /// Any failure leaves the previously committed object and its payload intact.
    async fn put_asset(
        &self,
        bucket: &Bucket,
        key: &str,
        data: Bytes,
        last_modified: DateTime<Utc>,
        max_bytes: u64,
    ) -> StorageResult<Object> {
        ensure_key_safe(key)?;

        let lock = self.bucket_write_lock(bucket);
        let _guard = lock.lock().await;

        let requested = data.len() as u64;
        let used = self.used_bytes(bucket, Some(key)).await?;
        if used.saturating_add(requested) > max_bytes {
            return Err(StorageError::QuotaExceeded {
                used,
                max: max_bytes,
                requested,
            });
        }

        let file_path = self.object_path(&bucket.name, key);
        let tmp_path = self.stage_payload(&file_path, &data).await?;

        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        let etag = format!("{:x}", md5::compute(&data));

        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                remove_logged(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let upserted = sqlx::query_as::<_, Object>(&format!(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, filename, size_bytes, etag, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(key)
        .bind(&filename)
        .bind(requested as i64)
        .bind(&etag)
        .bind(last_modified)
        .fetch_one(&mut *tx)
        .await;

        let object = match upserted {
            Ok(obj) => obj,
            Err(err) => {
                // dropping `tx` rolls the upsert back
                remove_logged(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let backup = match self.swap_in_payload(&tmp_path, &file_path).await {
            Ok(backup) => backup,
            Err(err) => {
                remove_logged(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            restore_payload(backup.as_deref(), &file_path).await;
            return Err(StorageError::Sqlx(err));
        }
        if let Some(backup) = backup {
            remove_logged(&backup).await;
        }

        Ok(object)
    }
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty keys, keys that begin or end with `/`, and keys containing `..`.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidObjectKey(key.to_string());
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
        return Err(invalid());
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    Ok(())
}

/// Compute a synthetic "common prefix" for delimiter-grouped listings.
///
/// Returns Some(prefix) if the key belongs to a grouped prefix, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::new();
    if let Some(prefix) = requested_prefix {
        combined.push_str(prefix);
    }
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
