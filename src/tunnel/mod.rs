//! WebSocket tunneling between local sockets and the OSMO router. TCP and UDP port-forwards
//! share the same scaffold: a control WebSocket is opened per operation, and every local
//! connection performs a `{key, cookie}` handshake over it before opening its own data
//! WebSocket.

pub mod exec;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{Method, RequestOptions, ServiceClient, WsStream};
use crate::limit::TokenBucket;
use crate::{OsmoError, Result};

pub const SOCKET_READ_BUFFER_SIZE: usize = 4096;

/// Connection parameters issued by the service for one tunnel. The `key` identifies the
/// control channel on the router and the `cookie` scopes session state.
#[derive(Deserialize, Debug, Clone)]
pub struct TunnelParams {
    pub router_address: String,
    pub key: String,
    pub cookie: String,
}

/// Computes the reconnect delay for the given retry count: a random component in `[0, 5)`
/// seconds plus `2^min(retry, 5)` seconds.
pub fn exponential_backoff_delay(retry: u32) -> Duration {
    let random_delay: f64 = rand::thread_rng().gen_range(0.0..5.0);
    let exp_delay = 2f64.powi(retry.min(5) as i32);
    Duration::from_secs_f64(random_delay + exp_delay)
}

/// Fetches a fresh session cookie from the router. The cookie attributes are rebuilt by hand
/// rather than forwarding `set-cookie` verbatim, to survive duplicate cookie names behind
/// virtual-node SSH port-forwarding.
pub async fn get_session_cookie(router_address: &str, timeout: Duration) -> Result<String> {
    let mut url = Url::parse(router_address)?;
    match url.scheme() {
        "wss" => url.set_scheme("https").expect("https is a valid scheme"),
        "ws" => url.set_scheme("http").expect("http is a valid scheme"),
        "http" | "https" => {}
        _ => {
            return Err(OsmoError::server(format!(
                "Invalid router address: {}",
                router_address
            )))
        }
    }
    let resp = reqwest::Client::new()
        .get(format!(
            "{}/api/router/version",
            url.as_str().trim_end_matches('/')
        ))
        .timeout(timeout)
        .send()
        .await?;

    let mut cookies = Vec::new();
    for value in resp.headers().get_all(reqwest::header::SET_COOKIE) {
        if let Ok(raw) = value.to_str() {
            cookies.push(rebuild_cookie(raw));
        }
    }
    Ok(cookies.join(", "))
}

/// Keeps the `name=value` pair plus the Path, SameSite, and Secure attributes of a
/// `set-cookie` value.
fn rebuild_cookie(raw: &str) -> String {
    let mut parts = Vec::new();
    for (i, segment) in raw.split(';').enumerate() {
        let segment = segment.trim();
        if i == 0 {
            parts.push(segment.to_owned());
            continue;
        }
        let lowered = segment.to_ascii_lowercase();
        if lowered.starts_with("path=") || lowered.starts_with("samesite=") || lowered == "secure"
        {
            parts.push(segment.to_owned());
        }
    }
    parts.join("; ")
}

/// Forwards data from a socket read half to a data WebSocket, optionally rate-limited.
/// Returns when the reader reaches EOF or the WebSocket closes.
pub async fn read_data<R>(
    mut reader: R,
    ws_sink: &mut SplitSink<WsStream, Message>,
    rate_limiter: Option<&TokenBucket>,
    buffer_size: usize,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(limiter) = rate_limiter {
                    limiter.wait_for_tokens(n).await;
                }
                if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Forwards data from a data WebSocket to a socket write half. Returns when the WebSocket
/// closes or the writer fails.
pub async fn write_data<W>(mut writer: W, ws_stream: &mut SplitStream<WsStream>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = ws_stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

/// Options for a TCP tunnel beyond the connection parameters.
pub struct TcpTunnelOptions {
    /// Extra query parameters appended to the router WebSocket URLs.
    pub query: Vec<(String, String)>,
    /// Signalled once the listener is accepting connections.
    pub ready: Option<watch::Sender<bool>>,
    /// Cancelling this token tears the tunnel down.
    pub close: CancellationToken,
    pub buffer_size: usize,
    /// Applied to the socket-to-WebSocket direction of every connection.
    pub rate_limiter: Option<Arc<TokenBucket>>,
}

impl Default for TcpTunnelOptions {
    fn default() -> Self {
        TcpTunnelOptions {
            query: Vec::new(),
            ready: None,
            close: CancellationToken::new(),
            buffer_size: SOCKET_READ_BUFFER_SIZE,
            rate_limiter: None,
        }
    }
}

/// Runs TCP port-forwarding on an already-bound listener until the control channel closes,
/// the close token fires, or the listener fails.
///
/// Each accepted connection handshakes a fresh session cookie and connection key over the
/// control WebSocket, then copies bytes in both directions over its own data WebSocket.
pub async fn run_tcp(
    client: &ServiceClient,
    listener: TcpListener,
    message: &str,
    endpoint: &str,
    timeout: Duration,
    params: &TunnelParams,
    options: TcpTunnelOptions,
) -> Result<()> {
    let local_port = listener.local_addr()?.port();
    let ctrl_ws = client
        .create_websocket(
            &params.router_address,
            &format!("{}/{}", endpoint, params.key),
            vec![("cookie".to_owned(), params.cookie.clone())],
            options.query.clone(),
            timeout,
        )
        .await?;
    let (ctrl_sink, mut ctrl_stream) = ctrl_ws.split();
    let ctrl_sink = Arc::new(Mutex::new(ctrl_sink));

    // The router never sends application data on the control channel; draining it is how we
    // notice the channel closing
    let ctrl_closed = CancellationToken::new();
    let ctrl_watcher = {
        let ctrl_closed = ctrl_closed.clone();
        tokio::spawn(async move {
            while let Some(message) = ctrl_stream.next().await {
                if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
            ctrl_closed.cancel();
        })
    };

    println!("{}", message);
    if let Some(ready) = &options.ready {
        let _ = ready.send(true);
    }

    let result = loop {
        tokio::select! {
            _ = options.close.cancelled() => break Ok(()),
            _ = ctrl_closed.cancelled() => {
                break Err(OsmoError::server("Control connection closed"));
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                tracing::debug!(port = local_port, "Handle new client connection");
                let client = client.clone();
                let router_address = params.router_address.clone();
                let endpoint = endpoint.to_owned();
                let query = options.query.clone();
                let ctrl_sink = ctrl_sink.clone();
                let close = options.close.clone();
                let rate_limiter = options.rate_limiter.clone();
                let buffer_size = options.buffer_size;
                tokio::spawn(async move {
                    handle_connection(
                        client,
                        stream,
                        router_address,
                        endpoint,
                        query,
                        timeout,
                        ctrl_sink,
                        close,
                        rate_limiter,
                        buffer_size,
                    )
                    .await;
                });
            }
        }
    };

    ctrl_watcher.abort();
    let _ = ctrl_sink.lock().await.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    client: ServiceClient,
    stream: tokio::net::TcpStream,
    router_address: String,
    endpoint: String,
    query: Vec<(String, String)>,
    timeout: Duration,
    ctrl_sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
    close: CancellationToken,
    rate_limiter: Option<Arc<TokenBucket>>,
    buffer_size: usize,
) {
    let conn_key = format!("PORTFORWARD-{}", uuid::Uuid::new_v4().simple());
    let cookie = match get_session_cookie(&router_address, timeout).await {
        Ok(cookie) => cookie,
        Err(err) => {
            tracing::error!(error = %err, "Error fetching router session cookie");
            close.cancel();
            return;
        }
    };

    let payload = serde_json::json!({"key": conn_key, "cookie": cookie}).to_string();
    if ctrl_sink
        .lock()
        .await
        .send(Message::Binary(payload.into_bytes()))
        .await
        .is_err()
    {
        tracing::error!("Error: control connection closed");
        close.cancel();
        return;
    }

    let data_ws = match client
        .create_websocket(
            &router_address,
            &format!("{}/{}", endpoint, conn_key),
            vec![("cookie".to_owned(), cookie)],
            query,
            timeout,
        )
        .await
    {
        Ok(ws) => ws,
        Err(err) => {
            tracing::error!(error = %err, "Error opening data connection");
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = data_ws.split();
    let (reader, mut writer) = stream.into_split();

    // When either direction finishes the other is abandoned and the session torn down
    tokio::select! {
        _ = read_data(reader, &mut ws_sink, rate_limiter.as_deref(), buffer_size) => {}
        _ = write_data(&mut writer, &mut ws_stream) => {}
    }
    let _ = ws_sink.close().await;
    let _ = writer.shutdown().await;
}

/// Encodes a datagram and its source address as `IP(4) || PORT(2) || payload`.
pub fn encode_addr(data: &[u8], ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + data.len());
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Decodes a framed datagram into its payload and destination address.
pub fn decode_addr(data: &[u8]) -> Result<(Vec<u8>, Ipv4Addr, u16)> {
    if data.len() < 6 {
        return Err(OsmoError::server("Truncated UDP frame from router"));
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Ok((data[6..].to_vec(), ip, port))
}

/// Runs UDP port-forwarding: local datagrams are framed with their source address and relayed
/// over the control WebSocket; router frames are decoded and emitted via `send_to`.
pub async fn run_udp(
    client: &ServiceClient,
    host: &str,
    port: u16,
    message: &str,
    endpoint: &str,
    timeout: Duration,
    params: &TunnelParams,
) -> Result<()> {
    let ctrl_ws = client
        .create_websocket(
            &params.router_address,
            &format!("{}/{}", endpoint, params.key),
            vec![("cookie".to_owned(), params.cookie.clone())],
            Vec::new(),
            timeout,
        )
        .await?;
    let (mut ctrl_sink, mut ctrl_stream) = ctrl_ws.split();

    // On macOS, force IPv4 binding when localhost is used to avoid IPv6 (::1) binding
    let bind_host = if cfg!(target_os = "macos") && (host == "localhost" || host == "::1") {
        "127.0.0.1"
    } else {
        host
    };
    let socket = UdpSocket::bind((bind_host, port)).await?;

    println!("{}", message);

    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, addr) = received?;
                let std::net::IpAddr::V4(ip) = addr.ip() else { continue };
                let frame = encode_addr(&buf[..len], ip, addr.port());
                if ctrl_sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            incoming = ctrl_stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let (payload, ip, dest_port) = decode_addr(&data)?;
                        socket.send_to(&payload, (ip, dest_port)).await?;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    let _ = ctrl_sink.close().await;
    Ok(())
}

/// Requests port-forward connection parameters from the service for a set of remote ports.
pub async fn request_port_forward(
    client: &ServiceClient,
    workflow_id: &str,
    task: &str,
    remote_ports: &[u16],
    use_udp: bool,
) -> Result<Vec<TunnelParams>> {
    let mut params: Vec<(String, String)> = remote_ports
        .iter()
        .map(|p| ("task_ports".to_owned(), p.to_string()))
        .collect();
    params.push(("use_udp".to_owned(), use_udp.to_string()));
    let result = client
        .request_json(
            Method::POST,
            &format!("api/workflow/{}/portforward/{}", workflow_id, task),
            RequestOptions::with_params(params),
        )
        .await?;
    serde_json::from_value(result).map_err(|e| {
        OsmoError::server(format!("Malformed port-forward response from service: {}", e))
    })
}

/// Holds one local/remote port pair forwarded forever, re-requesting parameters and backing
/// off after every disconnect. Runs until cancelled by the caller (Ctrl-C at the CLI).
#[allow(clippy::too_many_arguments)]
pub async fn forward_single_port(
    client: &ServiceClient,
    workflow_id: &str,
    task: &str,
    host: &str,
    local_port: u16,
    remote_port: u16,
    use_udp: bool,
    timeout: Duration,
    mut params: TunnelParams,
) -> Result<()> {
    let message = format!(
        "Starting port forwarding from {}/{} to {}. Please visit http://{}:{} if a web \
         application is hosted by the task.",
        workflow_id, task, local_port, host, local_port
    );
    let endpoint = format!("api/router/portforward/{}/client", workflow_id);

    let mut retry = 0;
    loop {
        let result = if use_udp {
            run_udp(
                client,
                host,
                local_port,
                &message,
                &endpoint,
                timeout,
                &params,
            )
            .await
        } else {
            // A bind failure (port already taken) is not worth retrying
            let listener = TcpListener::bind((host, local_port)).await?;
            run_tcp(
                client,
                listener,
                &message,
                &endpoint,
                timeout,
                &params,
                TcpTunnelOptions::default(),
            )
            .await
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_retryable() || err.status_code().is_none() => {
                tracing::error!(error = %err, "Port-forward connection failed, retrying");
            }
            Err(err) => return Err(err),
        }

        retry += 1;
        let delay = exponential_backoff_delay(retry);
        println!(
            "Reconnect to remote port {} in {} seconds...",
            remote_port,
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
        params = request_port_forward(client, workflow_id, task, &[remote_port], use_udp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OsmoError::server("Service returned no port-forward parameters"))?;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_udp_frame_round_trip() {
        let frame = encode_addr(b"hello", Ipv4Addr::new(127, 0, 0, 1), 9000);
        assert_eq!(frame.len(), 6 + 5);
        let (payload, ip, port) = decode_addr(&frame).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 9000);
    }

    #[test]
    fn test_decode_rejects_truncated_frames() {
        assert!(decode_addr(&[1, 2, 3]).is_err());
        // A headerless frame is still decodable as an empty payload
        let (payload, _, _) = decode_addr(&encode_addr(b"", Ipv4Addr::LOCALHOST, 1)).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_backoff_schedule_bounds() {
        for retry in 0..10 {
            let exp = 2u64.pow(retry.min(5));
            for _ in 0..20 {
                let delay = exponential_backoff_delay(retry).as_secs_f64();
                assert!(delay >= exp as f64, "retry {} delay {} too small", retry, delay);
                assert!(
                    delay < exp as f64 + 5.0,
                    "retry {} delay {} too large",
                    retry,
                    delay
                );
            }
        }
    }

    #[test]
    fn test_rebuild_cookie_keeps_scoping_attributes() {
        let raw = "session=abc123; Path=/; HttpOnly; SameSite=Lax; Secure; Max-Age=3600";
        assert_eq!(
            rebuild_cookie(raw),
            "session=abc123; Path=/; SameSite=Lax; Secure"
        );
    }
}
