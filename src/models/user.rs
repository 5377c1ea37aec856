//! Users resolved from a presented public key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered user. Immutable for the lifetime of a session once resolved.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,

    /// Display name; uploads require it to be non-empty.
    pub name: String,

    pub created_at: DateTime<Utc>,
}
