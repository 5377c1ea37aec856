//! `get <path>`: send an uploaded asset back to the client.

use super::{CommandHandler, error_handler};
use crate::{errors::AssetError, services::upload_service::UploadService, session::Session};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub struct DownloadHandler {
    service: UploadService,
    next: Arc<dyn CommandHandler>,
}

impl DownloadHandler {
    pub fn new(service: UploadService, next: Arc<dyn CommandHandler>) -> Self {
        Self { service, next }
    }
}

#[async_trait]
impl CommandHandler for DownloadHandler {
    async fn handle(&self, session: &mut Session) {
        let path = match session.command() {
            [cmd, path] if cmd == "get" => path.clone(),
            _ => return self.next.handle(session).await,
        };

        if let Err(err) = self.service.ensure_validated(session).await {
            return error_handler(session, &err);
        }

        let (info, mut file) = match self.service.read(session, &path).await {
            Ok(found) => found,
            Err(err) => return error_handler(session, &err),
        };

        let mut contents = Vec::with_capacity(info.size.max(0) as usize);
        if let Err(err) = file.read_to_end(&mut contents).await {
            return error_handler(session, &AssetError::StorageUnavailable(err.to_string()));
        }
        debug!("({}) sending {} ({} bytes)", session.user(), info.name, contents.len());
        session.write(&contents);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::UnsupportedCommand,
        services::test_support::{ALICE_KEY, Fixture},
    };

    #[tokio::test]
    async fn missing_asset_is_reported() {
        let fx = Fixture::new(1024).await;
        fx.register("alice", ALICE_KEY, true).await;
        let handler = DownloadHandler::new(fx.service.clone(), Arc::new(UnsupportedCommand));
        let mut session = Session::new("alice", Some(ALICE_KEY.into()));
        session.start_command(vec!["get".into(), "/blog/none.md".into()], None);

        handler.handle(&mut session).await;

        assert_eq!(session.exit_status(), 1);
        let output = String::from_utf8_lossy(session.output()).to_string();
        assert!(output.contains("blog/none.md"), "{output}");
    }
}
