//! STDIO subprocess transport for upstream MCP servers.
//!
//! The child is spawned with raw `tokio::process::Command` rather than rmcp's
//! `TokioChildProcess` so its stdout can be filtered: servers that print
//! banners or log lines to stdout would otherwise corrupt the JSON-RPC stream.
//! Stderr is drained to debug logs. Reconnection is the connection manager's
//! job; a failed open is simply returned.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, ReadHalf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, resolve_env_vars};
use crate::error::ConcourseError;
use crate::upstream::RmcpUpstream;

const PIPE_CAPACITY: usize = 64 * 1024;

fn spawn_stdio_child(config: &ServerConfig) -> crate::Result<Child> {
    let program = config.command.as_deref().ok_or_else(|| {
        ConcourseError::InvalidConfig(
            config.name.clone(),
            "STDIO transport requires 'command' field".to_string(),
        )
    })?;

    let mut cmd = Command::new(program);
    cmd.args(&config.args)
        .envs(resolve_env_vars(&config.env))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    cmd.spawn()
        .map_err(|e| ConcourseError::Transport(config.name.clone(), e.to_string()))
}

/// Only JSON lines are forwarded to the rmcp transport.
fn is_protocol_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line).is_ok()
}

/// Read `source` line by line until EOF, a read error, `cancel`, or until
/// `on_line` returns `false`.
fn pump_lines<R, F, Fut>(source: R, cancel: CancellationToken, mut on_line: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                },
            };
            if !on_line(line).await {
                break;
            }
        }
    });
}

/// Filter the child's stdout into an in-memory pipe that rmcp reads from.
///
/// Dropping the write side when the child's stdout ends signals EOF to rmcp.
fn filtered_stdout(
    stdout: ChildStdout,
    server: String,
    cancel: CancellationToken,
) -> ReadHalf<DuplexStream> {
    let (rmcp_side, filter_side) = tokio::io::duplex(PIPE_CAPACITY);
    let (reader, _) = tokio::io::split(rmcp_side);
    let (_, writer) = tokio::io::split(filter_side);
    let writer = Arc::new(Mutex::new(writer));

    pump_lines(stdout, cancel, move |line| {
        let writer = Arc::clone(&writer);
        let server = server.clone();
        async move {
            if !is_protocol_line(&line) {
                tracing::debug!(server = %server, line = %line, "discarding non-JSON stdout line");
                return true;
            }
            let mut writer = writer.lock().await;
            writer.write_all(line.as_bytes()).await.is_ok()
                && writer.write_all(b"\n").await.is_ok()
        }
    });

    reader
}

/// Spawn the child, wire up its pipes and perform the MCP handshake.
pub async fn open_stdio(
    config: &ServerConfig,
    cancel: CancellationToken,
) -> crate::Result<RmcpUpstream> {
    let mut child = spawn_stdio_child(config)?;
    let pipe_error = |pipe: &str| {
        ConcourseError::Transport(config.name.clone(), format!("failed to open {} pipe", pipe))
    };
    let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

    let reader = filtered_stdout(stdout, config.name.clone(), cancel.clone());
    let server = config.name.clone();
    pump_lines(stderr, cancel.clone(), move |line| {
        tracing::debug!(server = %server, line = %line, "server stderr");
        std::future::ready(true)
    });

    tracing::debug!(server = %config.name, pid = ?child.id(), "spawned STDIO server");
    let handshake = ().serve_with_ct((reader, stdin), cancel.clone());
    super::finish_handshake(config, handshake, Some(child), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stdio_config(name: &str, command: Option<&str>) -> ServerConfig {
        let mut config = ServerConfig::stdio(name, "placeholder");
        config.command = command.map(|s| s.to_string());
        config
    }

    #[test]
    fn test_spawn_stdio_child_missing_command() {
        let config = make_stdio_config("test", None);
        let result = spawn_stdio_child(&config);
        assert!(
            matches!(result, Err(ConcourseError::InvalidConfig(name, _)) if name == "test"),
            "Expected InvalidConfig error when command is None"
        );
    }

    #[tokio::test]
    async fn test_spawn_stdio_child_bad_command() {
        let config = make_stdio_config("test", Some("/this/command/does/not/exist-concourse"));
        let result = spawn_stdio_child(&config);
        assert!(
            matches!(result, Err(ConcourseError::Transport(name, _)) if name == "test"),
            "Expected Transport error for non-existent command"
        );
    }

    #[tokio::test]
    async fn test_open_stdio_bad_command_is_transport_error() {
        let config = make_stdio_config("test", Some("/this/command/does/not/exist-concourse"));
        let result = open_stdio(&config, CancellationToken::new()).await;
        assert!(matches!(result, Err(ConcourseError::Transport(_, _))));
    }

    #[tokio::test]
    async fn test_filtered_stdout_drops_noise() {
        let (mut child_side, stdout_side) = tokio::io::duplex(1024);
        // ChildStdout cannot be built in tests; exercise the pump directly.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        pump_lines(stdout_side, CancellationToken::new(), move |line| {
            let keep = is_protocol_line(&line);
            if keep {
                let _ = tx.send(line);
            }
            std::future::ready(true)
        });

        child_side
            .write_all(b"Starting server...\n{\"jsonrpc\":\"2.0\",\"id\":1}\nready\n")
            .await
            .unwrap();
        drop(child_side);

        assert_eq!(rx.recv().await.as_deref(), Some(r#"{"jsonrpc":"2.0","id":1}"#));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_protocol_line_filter() {
        assert!(is_protocol_line(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert!(is_protocol_line(r#"{"x":1}"#));
        assert!(!is_protocol_line("not json line"));
        assert!(!is_protocol_line("Server listening on stdio..."));
    }
}
