//! Per-session cache of validated state.
//!
//! Each field is set at most once per validation and lives exactly as long as
//! the owning [`Session`](super::Session). Reading a field that was never set
//! means a write or listing ran before validation; that is reported as
//! [`AssetError::SessionNotValidated`] instead of falling back to a default.

use crate::{
    errors::{AssetError, AssetResult},
    models::{bucket::Bucket, project::Project, user::User},
};
use tracing::error;

#[derive(Debug, Default)]
pub struct SessionContext {
    user: Option<User>,
    bucket: Option<Bucket>,
    bucket_quota: Option<u64>,
    project: Option<Project>,
}

fn required<'a, T>(value: Option<&'a T>, key: &'static str) -> AssetResult<&'a T> {
    value.ok_or_else(|| {
        error!("{} read from session context before validation", key);
        AssetError::SessionNotValidated(key)
    })
}

impl SessionContext {
    pub fn set_user(&mut self, user: User) {
        self.user = Some(user);
    }

    pub fn set_bucket(&mut self, bucket: Bucket) {
        self.bucket = Some(bucket);
    }

    pub fn set_bucket_quota(&mut self, bytes: u64) {
        self.bucket_quota = Some(bytes);
    }

    pub fn set_project(&mut self, project: Project) {
        self.project = Some(project);
    }

    pub fn user(&self) -> AssetResult<&User> {
        required(self.user.as_ref(), "user")
    }

    pub fn bucket(&self) -> AssetResult<&Bucket> {
        required(self.bucket.as_ref(), "bucket")
    }

    /// Usage snapshot taken at validation. Advisory only; the storage backend
    /// re-checks live usage on every write.
    pub fn bucket_quota(&self) -> AssetResult<u64> {
        required(self.bucket_quota.as_ref(), "bucket quota").copied()
    }

    /// The project resolved by an earlier write, if any. Absence is normal.
    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    /// Whether user, bucket and quota snapshot have all been cached.
    pub fn is_validated(&self) -> bool {
        self.user.is_some() && self.bucket.is_some() && self.bucket_quota.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn unset_keys_fail_loudly() {
        let ctx = SessionContext::default();
        assert!(matches!(ctx.user(), Err(AssetError::SessionNotValidated("user"))));
        assert!(matches!(ctx.bucket(), Err(AssetError::SessionNotValidated("bucket"))));
        assert!(matches!(
            ctx.bucket_quota(),
            Err(AssetError::SessionNotValidated("bucket quota"))
        ));
        assert!(ctx.project().is_none());
        assert!(!ctx.is_validated());
    }

    #[test]
    fn set_values_replace_previous_ones() {
        let mut ctx = SessionContext::default();
        ctx.set_bucket_quota(10);
        ctx.set_bucket_quota(42);
        assert_eq!(ctx.bucket_quota().unwrap(), 42);

        let user = User {
            id: Uuid::new_v4(),
            name: "alice".into(),
            created_at: Utc::now(),
        };
        ctx.set_user(user.clone());
        assert_eq!(ctx.user().unwrap(), &user);
        assert!(!ctx.is_validated());

        ctx.set_bucket(Bucket {
            id: Uuid::new_v4(),
            name: Bucket::asset_name(user.id),
            created_at: Utc::now(),
        });
        assert!(ctx.is_validated());
    }
}
