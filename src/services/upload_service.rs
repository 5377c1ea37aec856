//! Turns an authenticated session into validated, quota-checked asset
//! operations.
//!
//! `validate` resolves the user, their asset bucket and a usage snapshot once
//! and caches them on the session. Later `list`, `read` and `write` calls work
//! off that cache. `write` also resolves the upload's project, at most once
//! per project name while the session keeps uploading into it.

use crate::{
    config::SiteConfig,
    errors::{AssetError, AssetResult},
    models::{
        bucket::Bucket,
        file::{FileEntry, VirtualFile, asset_key, base_name, is_current_dir, normalize_dir},
        object::Object,
        project::Project,
        user::User,
    },
    services::{
        database::{IdentityStore, ProjectStore},
        storage_service::{ObjectStorage, ensure_key_safe},
    },
    session::Session,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, warn};

/// Everything the storage write needs for one uploaded file.
pub struct FileData<'a> {
    pub entry: &'a FileEntry,
    pub user: &'a User,
    pub text: Bytes,
    pub bucket: &'a Bucket,
    /// Usage snapshot from validation, informational only.
    pub bucket_quota: u64,
}

#[derive(Clone)]
pub struct UploadService {
    identities: Arc<dyn IdentityStore>,
    projects: Arc<dyn ProjectStore>,
    storage: Arc<dyn ObjectStorage>,
    cfg: SiteConfig,
}

impl UploadService {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        projects: Arc<dyn ProjectStore>,
        storage: Arc<dyn ObjectStorage>,
        cfg: SiteConfig,
    ) -> Self {
        Self {
            identities,
            projects,
            storage,
            cfg,
        }
    }

    /// Resolve the session's user, upsert their asset bucket and snapshot its
    /// usage. Nothing is cached unless every step succeeds.
    ///
    /// Identity and entitlement failures return before storage is touched.
    pub async fn validate(&self, session: &mut Session) -> AssetResult<()> {
        let key = session.key_text()?;

        let user = self
            .identities
            .find_user_for_key(session.user(), &key)
            .await?
            .ok_or(AssetError::CredentialNotFound)?;

        if user.name.is_empty() {
            return Err(AssetError::InvalidIdentity);
        }

        if !self
            .identities
            .has_feature_for_user(user.id, &self.cfg.space)
            .await?
        {
            return Err(AssetError::NotEntitled);
        }

        let bucket = self
            .storage
            .upsert_bucket(&Bucket::asset_name(user.id))
            .await?;
        let total_file_size = self.storage.bucket_quota(&bucket).await?;
        info!(
            "({}) bucket size is current ({} bytes)",
            user.name, total_file_size
        );
        info!(
            "({}) attempting to upload files to ({})",
            user.name, self.cfg.space
        );

        let ctx = session.context_mut();
        ctx.set_bucket(bucket);
        ctx.set_bucket_quota(total_file_size);
        ctx.set_user(user);
        Ok(())
    }

    /// Validate unless this session already has been.
    pub async fn ensure_validated(&self, session: &mut Session) -> AssetResult<()> {
        if session.context().is_validated() {
            debug!("({}) session already validated", session.user());
            return Ok(());
        }
        self.validate(session).await
    }

    /// List `path` in the user's asset bucket.
    ///
    /// An empty path yields a single synthetic root directory named `/`, and
    /// `.` one named `.`; neither enumerates the bucket.
    pub async fn list(&self, session: &Session, path: &str) -> AssetResult<Vec<VirtualFile>> {
        let user = session.context().user()?;

        if path.is_empty() {
            return Ok(vec![VirtualFile::dir("/")]);
        }
        if is_current_dir(path) {
            return Ok(vec![VirtualFile::dir(".")]);
        }

        let bucket = self.storage.get_bucket(&Bucket::asset_name(user.id)).await?;
        Ok(self
            .storage
            .list_files(&bucket, &normalize_dir(path), false)
            .await?)
    }

    /// Open the asset stored for `path`, with metadata describing the stored
    /// object (its size is the number of bytes actually written).
    pub async fn read(&self, session: &Session, path: &str) -> AssetResult<(VirtualFile, File)> {
        let user = session.context().user()?;

        let bucket = self.storage.get_bucket(&Bucket::asset_name(user.id)).await?;
        let (object, contents) = self.storage.get_file(&bucket, asset_key(path)).await?;

        let info = VirtualFile {
            name: base_name(path).to_string(),
            is_dir: false,
            size: object.size_bytes,
            mod_time: Some(object.last_modified),
        };
        Ok((info, contents))
    }

    /// Store one uploaded file and return its public URL.
    pub async fn write(&self, session: &mut Session, mut entry: FileEntry) -> AssetResult<String> {
        let ctx = session.context();
        let user = ctx.user()?.clone();
        let bucket = ctx.bucket()?.clone();
        let bucket_quota = ctx.bucket_quota()?;

        let mut text = Vec::new();
        entry
            .reader
            .read_to_end(&mut text)
            .await
            .map_err(|err| AssetError::StorageUnavailable(err.to_string()))?;
        // transports don't all report size before the transfer completes
        if entry.size != text.len() as i64 {
            debug!(
                "({}) {} declared {} bytes, received {}",
                user.name,
                entry.filepath,
                entry.size,
                text.len()
            );
        }
        entry.size = text.len() as i64;

        let project_name = entry
            .project_name()
            .ok_or_else(|| AssetError::InvalidPath(entry.filepath.clone()))?
            .to_string();
        // a key storage would refuse must not leave a project behind
        ensure_key_safe(entry.asset_key())?;
        self.resolve_project(session, &user, &project_name).await?;

        let data = FileData {
            entry: &entry,
            user: &user,
            text: Bytes::from(text),
            bucket: &bucket,
            bucket_quota,
        };
        self.write_asset(&data).await?;

        Ok(self.cfg.asset_url(
            &user.name,
            &project_name,
            &entry.project_relative_path(&project_name),
        ))
    }

    /// Find, create, or touch the project named `name`, unless the session
    /// already holds it. The cache only changes once the store calls succeed.
    async fn resolve_project(
        &self,
        session: &mut Session,
        user: &User,
        name: &str,
    ) -> AssetResult<()> {
        if let Some(cached) = session.context().project() {
            if cached.name == name {
                return Ok(());
            }
            debug!(
                "({}) switching project from ({}) to ({})",
                user.name, cached.name, name
            );
        }

        let project = match self.projects.find_project_by_name(user.id, name).await? {
            Some(project) => {
                self.projects.update_project(user.id, name).await?;
                project
            }
            None => {
                self.projects.insert_project(user.id, name, name).await?;
                self.fetch_inserted_project(user, name).await?
            }
        };

        session.context_mut().set_project(project);
        Ok(())
    }

    async fn fetch_inserted_project(&self, user: &User, name: &str) -> AssetResult<Project> {
        self.projects
            .find_project_by_name(user.id, name)
            .await?
            .ok_or_else(|| {
                AssetError::StorageUnavailable(format!("project ({}) missing after insert", name))
            })
    }

    /// Persist the bytes. The backend makes the authoritative quota decision
    /// against live usage; the snapshot is only used for logging.
    async fn write_asset(&self, data: &FileData<'_>) -> AssetResult<Object> {
        let size = data.text.len() as u64;
        if data.bucket_quota.saturating_add(size) > self.cfg.max_bucket_bytes {
            warn!(
                "({}) snapshot of {} bytes plus {} bytes exceeds quota of {} bytes",
                data.user.name, data.bucket_quota, size, self.cfg.max_bucket_bytes
            );
        }

        let modified = DateTime::from_timestamp(data.entry.mtime, 0)
            .filter(|_| data.entry.mtime > 0)
            .unwrap_or_else(Utc::now);

        let object = self
            .storage
            .put_asset(
                data.bucket,
                data.entry.asset_key(),
                data.text.clone(),
                modified,
                self.cfg.max_bucket_bytes,
            )
            .await?;
        info!(
            "({}) stored {} ({} bytes) in {}",
            data.user.name, object.key, object.size_bytes, data.bucket.name
        );
        Ok(object)
    }
}
