//! `put <path> [size] [mtime]`: store the command's input as an asset and
//! reply with its public URL.

use super::{CommandHandler, error_handler};
use crate::{models::file::FileEntry, services::upload_service::UploadService, session::Session};
use async_trait::async_trait;
use std::{io::Cursor, sync::Arc};

pub struct UploadHandler {
    service: UploadService,
    next: Arc<dyn CommandHandler>,
}

impl UploadHandler {
    pub fn new(service: UploadService, next: Arc<dyn CommandHandler>) -> Self {
        Self { service, next }
    }
}

#[async_trait]
impl CommandHandler for UploadHandler {
    async fn handle(&self, session: &mut Session) {
        let (path, declared, mtime) = match session.command() {
            [cmd, path, rest @ ..] if cmd == "put" => {
                let declared = rest.first().and_then(|s| s.parse::<i64>().ok());
                let mtime = rest.get(1).and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
                (path.clone(), declared, mtime)
            }
            _ => return self.next.handle(session).await,
        };

        if let Err(err) = self.service.ensure_validated(session).await {
            return error_handler(session, &err);
        }

        let input = session.take_input().unwrap_or_default();
        let size = declared.unwrap_or(input.len() as i64);
        let entry = FileEntry::new(path, size, mtime, Cursor::new(input));

        match self.service.write(session, entry).await {
            Ok(url) => session.write(format!("{}\n", url).as_bytes()),
            Err(err) => error_handler(session, &err),
        }
    }
}
