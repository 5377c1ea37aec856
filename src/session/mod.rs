//! One authenticated client connection and the command currently running on it.

pub mod context;

use crate::errors::{AssetError, AssetResult};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use context::SessionContext;

/// Normalize public key text to `<algorithm> <base64 blob>`.
///
/// Trailing comments are dropped; a blob that does not decode as base64
/// counts as no key at all.
pub fn normalize_key(raw: &str) -> Option<String> {
    let mut parts = raw.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(algo), Some(blob)) if general_purpose::STANDARD.decode(blob).is_ok() => {
            Some(format!("{} {}", algo, blob))
        }
        _ => None,
    }
}

/// State of a single client session.
///
/// A session is driven by one task at a time. Commands run sequentially; each
/// one gets fresh output and exit status, while the [`SessionContext`] carries
/// over for the whole connection.
#[derive(Debug)]
pub struct Session {
    user: String,
    public_key: Option<String>,
    command: Vec<String>,
    input: Option<Bytes>,
    context: SessionContext,
    output: Vec<u8>,
    exit_status: Option<u32>,
}

impl Session {
    pub fn new(user: impl Into<String>, public_key: Option<String>) -> Self {
        Self {
            user: user.into(),
            public_key,
            command: Vec::new(),
            input: None,
            context: SessionContext::default(),
            output: Vec::new(),
            exit_status: None,
        }
    }

    /// Username the client connected as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The presented public key, normalized with [`normalize_key`].
    pub fn key_text(&self) -> AssetResult<String> {
        self.public_key
            .as_deref()
            .and_then(normalize_key)
            .ok_or(AssetError::CredentialNotFound)
    }

    /// Begin a new command, resetting per-command output and status.
    pub fn start_command(&mut self, command: Vec<String>, input: Option<Bytes>) {
        self.command = command;
        self.input = input;
        self.output.clear();
        self.exit_status = None;
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Payload sent along with the current command. Can be taken once.
    pub fn take_input(&mut self) -> Option<Bytes> {
        self.input.take()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    pub fn write(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Mark the current command finished with `status`. The first call wins.
    pub fn exit(&mut self, status: u32) {
        self.exit_status.get_or_insert(status);
    }

    /// Exit status of the current command; 0 when it never called [`Session::exit`].
    pub fn exit_status(&self) -> u32 {
        self.exit_status.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_text_drops_comment() {
        let session = Session::new("alice", Some("ssh-ed25519 AAAAC3Nz alice@laptop".into()));
        assert_eq!(session.key_text().unwrap(), "ssh-ed25519 AAAAC3Nz");
    }

    #[test]
    fn key_text_requires_a_decodable_blob() {
        for key in [None, Some("ssh-ed25519"), Some("ssh-ed25519 !!notbase64")] {
            let session = Session::new("alice", key.map(String::from));
            assert!(matches!(session.key_text(), Err(AssetError::CredentialNotFound)));
        }
    }

    #[test]
    fn start_command_resets_output_but_keeps_context() {
        let mut session = Session::new("alice", None);
        session.context_mut().set_bucket_quota(7);
        session.start_command(vec!["command".into(), "ls".into()], None);
        session.write(b"oops");
        session.exit(1);
        session.exit(0);
        assert_eq!(session.exit_status(), 1);

        session.start_command(vec!["get".into(), "/a".into()], Some(Bytes::from_static(b"x")));
        assert!(session.output().is_empty());
        assert_eq!(session.exit_status(), 0);
        assert_eq!(session.take_input(), Some(Bytes::from_static(b"x")));
        assert_eq!(session.take_input(), None);
        assert_eq!(session.context().bucket_quota().unwrap(), 7);
    }
}
