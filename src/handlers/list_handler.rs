//! `command ls`: list the top level of the user's asset bucket.

use super::{CommandHandler, error_handler};
use crate::{models::file::VirtualFile, services::upload_service::UploadService, session::Session};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ListHandler {
    service: UploadService,
    next: Arc<dyn CommandHandler>,
}

impl ListHandler {
    pub fn new(service: UploadService, next: Arc<dyn CommandHandler>) -> Self {
        Self { service, next }
    }
}

fn is_list_command(cmd: &[String]) -> bool {
    cmd.len() > 1 && cmd[0] == "command" && cmd[1] == "ls"
}

/// One name per line, sorted ascending. Separators are stripped from names
/// and directories get exactly one trailing `/`.
pub fn format_listing(files: &[VirtualFile]) -> String {
    let mut names: Vec<String> = files
        .iter()
        .map(|file| {
            let mut name = file.name.replace('/', "");
            if file.is_dir {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();
    names.join("\n")
}

#[async_trait]
impl CommandHandler for ListHandler {
    async fn handle(&self, session: &mut Session) {
        if !is_list_command(session.command()) {
            return self.next.handle(session).await;
        }

        if let Err(err) = self.service.ensure_validated(session).await {
            return error_handler(session, &err);
        }

        let files = match self.service.list(session, "/").await {
            Ok(files) => files,
            Err(err) => return error_handler(session, &err),
        };

        session.write(format_listing(&files).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::UnsupportedCommand,
        services::test_support::{ALICE_KEY, Fixture},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file(name: &str, is_dir: bool) -> VirtualFile {
        VirtualFile {
            name: name.into(),
            is_dir,
            size: 0,
            mod_time: None,
        }
    }

    #[test]
    fn listing_is_sorted_and_directories_get_one_separator() {
        let files = vec![
            file("zeta.txt", false),
            file("/docs/", true),
            file("a/b", false),
            file("blog", true),
            file("Alpha", false),
        ];
        assert_eq!(format_listing(&files), "Alpha\nab\nblog/\ndocs/\nzeta.txt");
    }

    #[test]
    fn synthetic_root_lists_as_single_separator() {
        assert_eq!(format_listing(&[VirtualFile::dir("/")]), "/");
        assert_eq!(format_listing(&[]), "");
    }

    #[test]
    fn duplicates_are_kept() {
        let files = vec![file("b", false), file("a", false), file("b", false)];
        assert_eq!(format_listing(&files), "a\nb\nb");
    }

    #[test]
    fn matches_only_the_two_token_command() {
        let cmd = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        assert!(is_list_command(&cmd("command ls")));
        assert!(is_list_command(&cmd("command ls -la")));
        assert!(!is_list_command(&cmd("ls")));
        assert!(!is_list_command(&cmd("command")));
        assert!(!is_list_command(&cmd("command rm")));
    }

    struct Recorder(AtomicUsize);

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, _session: &mut Session) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn other_commands_pass_through_untouched() {
        let fx = Fixture::new(1024).await;
        let next = Arc::new(Recorder(AtomicUsize::new(0)));
        let handler = ListHandler::new(fx.service.clone(), next.clone());
        let mut session = Session::new("alice", Some(ALICE_KEY.into()));
        session.start_command(vec!["put".into(), "/a/b".into()], None);

        handler.handle(&mut session).await;

        assert_eq!(next.0.load(Ordering::SeqCst), 1);
        assert!(session.output().is_empty());
        assert_eq!(fx.storage.total_calls(), 0);
    }

    #[tokio::test]
    async fn validation_failure_is_reported_to_client() {
        let fx = Fixture::new(1024).await;
        fx.register("alice", ALICE_KEY, false).await;
        let handler = ListHandler::new(fx.service.clone(), Arc::new(UnsupportedCommand));
        let mut session = Session::new("alice", Some(ALICE_KEY.into()));
        session.start_command(vec!["command".into(), "ls".into()], None);

        handler.handle(&mut session).await;

        assert_eq!(session.output(), b"you do not have access to this service\n");
        assert_eq!(session.exit_status(), 1);
    }

    #[tokio::test]
    async fn empty_bucket_lists_nothing() {
        let fx = Fixture::new(1024).await;
        fx.register("alice", ALICE_KEY, true).await;
        let handler = ListHandler::new(fx.service.clone(), Arc::new(UnsupportedCommand));
        let mut session = Session::new("alice", Some(ALICE_KEY.into()));
        session.start_command(vec!["command".into(), "ls".into()], None);

        handler.handle(&mut session).await;

        assert_eq!(session.exit_status(), 0);
        assert!(session.output().is_empty());
    }
}
