//! SQLite-backed identity and project stores.
//!
//! Users are resolved from the public key presented at session start;
//! entitlements are rows in `feature_flags`; projects are keyed by
//! `(user_id, name)`.

use crate::models::{project::Project, user::User};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Resolves presented credentials to users and answers entitlement checks.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when no user owns `key_text`.
    async fn find_user_for_key(&self, username: &str, key_text: &str)
    -> sqlx::Result<Option<User>>;

    async fn has_feature_for_user(&self, user_id: Uuid, feature: &str) -> sqlx::Result<bool>;
}

/// Project records grouping a user's uploads.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn find_project_by_name(&self, user_id: Uuid, name: &str)
    -> sqlx::Result<Option<Project>>;

    /// Returns the new project's ID.
    async fn insert_project(&self, user_id: Uuid, name: &str, project_dir: &str)
    -> sqlx::Result<Uuid>;

    /// Touch `updated_at` on an existing project.
    async fn update_project(&self, user_id: Uuid, name: &str) -> sqlx::Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create a user owning `key_text` (already normalized).
    pub async fn register_user(&self, name: &str, key_text: &str) -> sqlx::Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)")
            .bind(user.id)
            .bind(&user.name)
            .bind(user.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO public_keys (id, user_id, public_key, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(user.id)
        .bind(key_text)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(user)
    }

    pub async fn grant_feature(&self, user_id: Uuid, feature: &str) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO feature_flags (id, user_id, name, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(feature)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn find_user_for_key(
        &self,
        username: &str,
        key_text: &str,
    ) -> sqlx::Result<Option<User>> {
        debug!("resolving key for ({})", username);
        sqlx::query_as::<_, User>(
            "SELECT users.id, users.name, users.created_at
             FROM users JOIN public_keys ON public_keys.user_id = users.id
             WHERE public_keys.public_key = ?",
        )
        .bind(key_text)
        .fetch_optional(&*self.db)
        .await
    }

    async fn has_feature_for_user(&self, user_id: Uuid, feature: &str) -> sqlx::Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM feature_flags WHERE user_id = ? AND name = ?")
                .bind(user_id)
                .bind(feature)
                .fetch_optional(&*self.db)
                .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn find_project_by_name(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> sqlx::Result<Option<Project>> {
        sqlx::query_as::<_, Project>(
            "SELECT id, user_id, name, project_dir, created_at, updated_at
             FROM projects WHERE user_id = ? AND name = ?",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&*self.db)
        .await
    }

    async fn insert_project(
        &self,
        user_id: Uuid,
        name: &str,
        project_dir: &str,
    ) -> sqlx::Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO projects (id, user_id, name, project_dir, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(name)
        .bind(project_dir)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(id)
    }

    async fn update_project(&self, user_id: Uuid, name: &str) -> sqlx::Result<()> {
        let result = sqlx::query("UPDATE projects SET updated_at = ? WHERE user_id = ? AND name = ?")
            .bind(Utc::now())
            .bind(user_id)
            .bind(name)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::new(Arc::new(test_pool().await))
    }

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn finds_user_by_key_only() {
        let store = store().await;
        let alice = store.register_user("alice", "ssh-ed25519 AAAA").await.unwrap();

        let found = store
            .find_user_for_key("whoever", "ssh-ed25519 AAAA")
            .await
            .unwrap();
        assert_eq!(found, Some(alice));
        assert_eq!(
            store.find_user_for_key("alice", "ssh-ed25519 BBBB").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn feature_flags() {
        let store = store().await;
        let alice = store.register_user("alice", "ssh-ed25519 AAAA").await.unwrap();
        assert!(!store.has_feature_for_user(alice.id, "pgs").await.unwrap());

        store.grant_feature(alice.id, "pgs").await.unwrap();
        store.grant_feature(alice.id, "pgs").await.unwrap();
        assert!(store.has_feature_for_user(alice.id, "pgs").await.unwrap());
        assert!(!store.has_feature_for_user(alice.id, "prose").await.unwrap());
    }

    #[tokio::test]
    async fn project_lifecycle() {
        let store = store().await;
        let alice = store.register_user("alice", "ssh-ed25519 AAAA").await.unwrap();
        assert_eq!(store.find_project_by_name(alice.id, "blog").await.unwrap(), None);

        let id = store.insert_project(alice.id, "blog", "blog").await.unwrap();
        let project = store
            .find_project_by_name(alice.id, "blog")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.id, id);
        assert_eq!(project.project_dir, "blog");

        store.update_project(alice.id, "blog").await.unwrap();
        let touched = store
            .find_project_by_name(alice.id, "blog")
            .await
            .unwrap()
            .unwrap();
        assert!(touched.updated_at >= project.updated_at);

        assert!(store.insert_project(alice.id, "blog", "blog").await.is_err());
        assert!(matches!(
            store.update_project(alice.id, "missing").await,
            Err(sqlx::Error::RowNotFound)
        ));
    }
}
