//! Exec bridges over the router: an interactive PTY session against a single task, and the
//! non-interactive fan-out form that prefixes output from every task in a group.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

use crate::client::{ServiceClient, WsStream};
use crate::tunnel::{read_data, write_data, TunnelParams};
use crate::{OsmoError, Result};

/// Shells that require a TTY; rejected for group exec.
pub const INTERACTIVE_COMMANDS: &[&str] = &["bash", "sh", "zsh", "fish", "tcsh", "csh", "ksh"];

/// Reads the controlling terminal's dimensions, falling back to 80x24 when stdin is not a
/// terminal.
#[cfg(unix)]
fn terminal_size() -> (u16, u16) {
    use nix::libc;
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes into the winsize out-parameter
    let res = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if res == 0 && ws.ws_row > 0 {
        (ws.ws_row, ws.ws_col)
    } else {
        (24, 80)
    }
}

#[cfg(not(unix))]
fn terminal_size() -> (u16, u16) {
    (24, 80)
}

/// Restores the terminal attributes captured at construction when dropped, so the terminal is
/// sane on every exit path of the interactive session.
#[cfg(unix)]
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl RawModeGuard {
    fn new() -> Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        let stdin = std::io::stdin();
        let original = tcgetattr(&stdin).map_err(|e| OsmoError::Other(e.to_string()))?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSADRAIN, &raw)
            .map_err(|e| OsmoError::Other(e.to_string()))?;
        Ok(RawModeGuard { original })
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};
        let _ = tcsetattr(&std::io::stdin(), SetArg::TCSADRAIN, &self.original);
    }
}

async fn send_terminal_size(ws: &mut WsStream) -> Result<()> {
    let (rows, cols) = terminal_size();
    let size_message = serde_json::json!({"Rows": rows, "Cols": cols}).to_string();
    ws.send(Message::Binary(size_message.into_bytes())).await?;
    Ok(())
}

/// Runs an interactive exec session: terminal size is transmitted first, then bytes stream in
/// both directions with the local terminal in raw mode.
///
/// Returns an error on transport failure so `--keep-alive` callers can reconnect.
pub async fn run_exec_interactive(
    client: &ServiceClient,
    workflow_id: &str,
    params: &TunnelParams,
    connect_timeout: Duration,
) -> Result<()> {
    let endpoint = format!("api/router/exec/{}/client/{}", workflow_id, params.key);
    let mut ws = client
        .create_websocket(
            &params.router_address,
            &endpoint,
            vec![("cookie".to_owned(), params.cookie.clone())],
            Vec::new(),
            connect_timeout,
        )
        .await?;

    send_terminal_size(&mut ws).await?;

    // The first message only arrives once the task container has connected to the router
    let first = match ws.next().await {
        Some(Ok(Message::Binary(data))) => data,
        Some(Ok(Message::Text(text))) => text.into_bytes(),
        _ => {
            tracing::error!("Received EOF from user task container");
            return Ok(());
        }
    };

    #[cfg(unix)]
    let _raw_guard = RawModeGuard::new()?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&first).await?;
    stdout.flush().await?;

    let (mut ws_sink, mut ws_stream) = ws.split();
    let stdin = tokio::io::stdin();

    tokio::select! {
        _ = read_data(stdin, &mut ws_sink, None, crate::tunnel::SOCKET_READ_BUFFER_SIZE) => {}
        _ = write_data(&mut stdout, &mut ws_stream) => {}
    }
    let _ = ws_sink.close().await;
    Ok(())
}

/// Runs a non-interactive exec against one task of a group, prefixing every output line with
/// the task name. Returns when the remote side closes.
pub async fn run_exec_command(
    client: &ServiceClient,
    workflow_id: &str,
    task_name: &str,
    params: &TunnelParams,
    connect_timeout: Duration,
) -> Result<()> {
    let endpoint = format!("api/router/exec/{}/client/{}", workflow_id, params.key);
    let mut ws = client
        .create_websocket(
            &params.router_address,
            &endpoint,
            vec![("cookie".to_owned(), params.cookie.clone())],
            Vec::new(),
            connect_timeout,
        )
        .await?;

    send_terminal_size(&mut ws).await?;

    let mut pending = String::new();
    while let Some(message) = ws.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        pending.push_str(&String::from_utf8_lossy(&data));
        // Only print whole lines so interleaved tasks stay readable
        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            print!("[{}] {}", task_name, line);
        }
    }
    if !pending.is_empty() {
        println!("[{}] {}", task_name, pending);
    }
    Ok(())
}
