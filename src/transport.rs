//! Line-oriented TCP transport for client sessions.
//!
//! The first line of a connection is `<username> <public key text>`. Every
//! following line is one command. `put <path> <len> [mtime]` is followed by
//! exactly `<len>` raw bytes of file content; a `put` without a usable length
//! is answered and then ends the session. Each command is answered with
//! `<exit status> <output length>\n` and the output bytes. `exit` or EOF
//! ends the session.

use crate::{handlers::CommandHandler, session::Session};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_LINE_SIZE: usize = 64 * 1024;
const MAX_PAYLOAD_SIZE: u64 = 512 * 1024 * 1024;
const PAYLOAD_CHUNK_SIZE: u64 = 64 * 1024;

/// Accept connections until `shutdown` fires. Every connection runs on its
/// own task with its own [`Session`]; nothing is shared between them except
/// the handler chain.
pub async fn run_session_listener(
    listener: TcpListener,
    chain: Arc<dyn CommandHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Session listener on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping session listener");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer) = accept_result?;
                info!("Client connected from {}", peer);

                let chain = chain.clone();
                let token = shutdown.child_token();
                tokio::spawn(async move {
                    let (reader_half, mut writer_half) = stream.into_split();
                    let mut reader = BufReader::new(reader_half);
                    match run_session(&mut reader, &mut writer_half, chain, token).await {
                        Ok(()) => info!("Client {} disconnected", peer),
                        Err(e) => warn!("Client {} error: {:#}", peer, e),
                    }
                });
            }
        }
    }

    Ok(())
}

/// Drive one session over an arbitrary reader/writer pair.
pub async fn run_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    chain: Arc<dyn CommandHandler>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(hello) = read_line(reader).await? else {
        return Ok(());
    };
    let (user, public_key) = parse_handshake(&hello)?;
    debug!("Session opened for ({})", user);
    let mut session = Session::new(user, public_key);

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Shutdown signal received, closing session");
                break;
            }
            line = read_line(reader) => line?,
        };
        let Some(line) = line else {
            debug!("Reader closed (EOF), closing session");
            break;
        };

        let command: Vec<String> = line.split_whitespace().map(String::from).collect();
        match command.first().map(String::as_str) {
            None => continue,
            Some("exit") => break,
            _ => {}
        }

        let input = if command[0] == "put" {
            let Some(len) = payload_len(&command) else {
                // the payload that may follow cannot be framed; stop before
                // any of it is read as commands
                write_reply(writer, 1, b"put requires a byte length\n").await?;
                debug!("Unframed put payload, closing session");
                break;
            };
            Some(read_payload(reader, len).await?)
        } else {
            None
        };

        session.start_command(command, input);
        chain.handle(&mut session).await;
        write_reply(writer, session.exit_status(), session.output()).await?;
    }

    Ok(())
}

/// `<username> [public key text...]`
fn parse_handshake(line: &str) -> Result<(String, Option<String>)> {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let user = match parts.next() {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => bail!("missing username in handshake"),
    };
    let key = parts
        .next()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from);
    Ok((user, key))
}

fn payload_len(command: &[String]) -> Option<u64> {
    command
        .get(2)
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|len| *len <= MAX_PAYLOAD_SIZE)
}

/// Exactly `len` payload bytes. The buffer grows with what actually arrives.
async fn read_payload<R>(reader: &mut R, len: u64) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(len.min(PAYLOAD_CHUNK_SIZE) as usize);
    (&mut *reader)
        .take(len)
        .read_to_end(&mut buf)
        .await
        .context("reading upload payload")?;
    if buf.len() as u64 != len {
        bail!("upload payload ended after {} of {} bytes", buf.len(), len);
    }
    Ok(Bytes::from(buf))
}

/// Next line without its terminator; `None` at EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_SIZE {
        bail!("line exceeds {} bytes", MAX_LINE_SIZE);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn write_reply<W>(writer: &mut W, status: u32, output: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{} {}\n", status, output.len()).as_bytes())
        .await?;
    writer.write_all(output).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::command_chain,
        services::test_support::{ALICE_KEY, Fixture},
    };

    fn reply(status: u32, body: &str) -> String {
        format!("{} {}\n{}", status, body.len(), body)
    }

    async fn drive(fx: &Fixture, script: &[u8]) -> String {
        let mut reader = script;
        let mut out = Vec::new();
        run_session(
            &mut reader,
            &mut out,
            command_chain(fx.service.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn handshake_splits_user_and_key() {
        assert_eq!(
            parse_handshake("alice ssh-ed25519 AAAA alice@laptop\n").unwrap(),
            ("alice".into(), Some("ssh-ed25519 AAAA alice@laptop".into()))
        );
        assert_eq!(parse_handshake("bob").unwrap(), ("bob".into(), None));
        assert!(parse_handshake("   ").is_err());
    }

    #[tokio::test]
    async fn scripted_session_uploads_and_lists() {
        let fx = Fixture::new(1024).await;
        fx.register("alice", ALICE_KEY, true).await;

        let script = format!(
            "alice {}\nput /blog/post1.md 10\n0123456789put /blog/post2.md 3\nabc\ncommand ls\nexit\nget /blog/post1.md\n",
            ALICE_KEY
        );
        let out = drive(&fx, script.as_bytes()).await;

        let expected = [
            reply(0, "https://alice-blog.pgs.test/post1.md\n"),
            reply(0, "https://alice-blog.pgs.test/post2.md\n"),
            reply(0, "blog/"),
        ]
        .concat();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn put_without_length_is_rejected_before_dispatch() {
        let fx = Fixture::new(1024).await;
        let out = drive(&fx, b"alice\nput /blog/a.md\n").await;
        assert_eq!(out, reply(1, "put requires a byte length\n"));
        assert_eq!(fx.storage.total_calls(), 0);
    }

    #[tokio::test]
    async fn unusable_put_length_closes_the_session() {
        let fx = Fixture::new(1024).await;
        fx.register("alice", ALICE_KEY, true).await;

        for length in ["999999999999", "ten"] {
            let script = format!("alice {ALICE_KEY}\nput /blog/a.md {length}\ncommand ls\n");
            let out = drive(&fx, script.as_bytes()).await;
            // the trailing line is payload, never a command
            assert_eq!(out, reply(1, "put requires a byte length\n"), "length {length}");
        }
        assert_eq!(fx.storage.total_calls(), 0);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let fx = Fixture::new(1024).await;
        let mut reader: &[u8] = b"alice\nput /blog/a.md 10\nabc";
        let mut out = Vec::new();
        let err = run_session(
            &mut reader,
            &mut out,
            command_chain(fx.service.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("3 of 10 bytes"));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn errors_do_not_end_the_session() {
        let fx = Fixture::new(1024).await;
        let out = drive(&fx, b"alice\ncommand ls\nbogus\n").await;
        assert_eq!(
            out,
            [
                reply(1, "key not found\n"),
                reply(1, "unsupported command: bogus\n")
            ]
            .concat()
        );
    }
}
