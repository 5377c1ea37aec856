//! Projects group a user's uploaded files by the first segment of their path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A named logical grouping of files within one user's bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Project {
    pub id: Uuid,

    /// Owning user.
    pub user_id: Uuid,

    /// Name derived from the upload path, unique per user.
    pub name: String,

    /// Display name (the project directory the files were uploaded under).
    pub project_dir: String,

    pub created_at: DateTime<Utc>,

    /// Touched every time a session uploads into this project.
    pub updated_at: DateTime<Utc>,
}
