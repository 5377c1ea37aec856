//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a single object (blob) within a bucket.
///
/// The `Object` struct stores its metadata, not the actual content bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Last segment of the key.
    pub filename: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload.
    pub etag: Option<String>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is marked as deleted.
    pub is_deleted: bool,
}
