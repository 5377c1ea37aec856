//! Represents a storage bucket — one namespaced container per user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket owned by the storage backend.
///
/// Asset buckets are named deterministically from the owning user's ID
/// (see [`Bucket::asset_name`]) and created lazily on first validated session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// Name of the bucket holding a user's static assets.
    pub fn asset_name(user_id: Uuid) -> String {
        format!("static-{}", user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_name_is_derived_from_user_id() {
        let id = Uuid::nil();
        assert_eq!(
            Bucket::asset_name(id),
            "static-00000000-0000-0000-0000-000000000000"
        );
    }
}
