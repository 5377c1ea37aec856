//! Command handlers for client sessions, plus the HTTP health probes.
//!
//! Session handlers form a chain: each one inspects the session's current
//! command and either runs it or hands the session to the next handler.

pub mod download_handler;
pub mod health_handlers;
pub mod list_handler;
pub mod upload_handler;

use crate::{errors::AssetError, services::upload_service::UploadService, session::Session};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, session: &mut Session);
}

/// Report `err` to the client and end the current command with status 1.
pub fn error_handler(session: &mut Session, err: &AssetError) {
    warn!("({}) command {:?} failed: {}", session.user(), session.command(), err);
    session.write(format!("{}\n", err).as_bytes());
    session.exit(1);
}

/// End of the chain: nothing recognized the command.
pub struct UnsupportedCommand;

#[async_trait]
impl CommandHandler for UnsupportedCommand {
    async fn handle(&self, session: &mut Session) {
        let line = format!("unsupported command: {}\n", session.command().join(" "));
        session.write(line.as_bytes());
        session.exit(1);
    }
}

/// Listing, then upload, then download, then the unsupported-command fallback.
pub fn command_chain(service: UploadService) -> Arc<dyn CommandHandler> {
    let fallback: Arc<dyn CommandHandler> = Arc::new(UnsupportedCommand);
    let download = Arc::new(download_handler::DownloadHandler::new(
        service.clone(),
        fallback,
    ));
    let upload = Arc::new(upload_handler::UploadHandler::new(service.clone(), download));
    Arc::new(list_handler::ListHandler::new(service, upload))
}
