//! Authenticated request/response to the OSMO service over HTTPS, plus the WebSocket dialer
//! used by the router tunnels. Every call refreshes the id token first and decorates the
//! request with the auth, version, and user-agent headers.

use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::login::{LoginManager, LOGIN_TIMEOUT, OSMO_AUTH_HEADER, OSMO_USER_HEADER};
use crate::version::{Version, VERSION_HEADER, VERSION_WARNING_HEADER};
use crate::{OsmoError, Result};

/// Maximum attempts for requests carrying the version header.
const RETRY_ATTEMPTS: u32 = 5;

/// The stream type returned by the WebSocket dialer.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub use reqwest::Method;

/// How the response body should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Decode the body as JSON
    Json,
    /// Return the body as text
    PlainText,
    /// Return the body as bytes
    Binary,
    /// Return the response for the caller to iterate the byte stream
    Streaming,
}

/// A decoded response, tagged by the mode the caller requested.
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Binary(bytes::Bytes),
    Streaming(reqwest::Response),
}

impl ResponseBody {
    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Ok(v),
            _ => Err(OsmoError::Other(
                "Response was not requested in JSON mode".to_owned(),
            )),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            ResponseBody::Text(t) => Ok(t),
            _ => Err(OsmoError::Other(
                "Response was not requested in text mode".to_owned(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<reqwest::Response> {
        match self {
            ResponseBody::Streaming(r) => Ok(r),
            _ => Err(OsmoError::Other(
                "Response was not requested in streaming mode".to_owned(),
            )),
        }
    }
}

/// Options for a single request. `send_version_header` also opts the request into the bounded
/// retry policy.
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub payload: Option<serde_json::Value>,
    pub params: Vec<(String, String)>,
    pub send_version_header: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            headers: Vec::new(),
            payload: None,
            params: Vec::new(),
            send_version_header: true,
        }
    }
}

impl RequestOptions {
    pub fn with_params(params: Vec<(String, String)>) -> Self {
        RequestOptions {
            params,
            ..Default::default()
        }
    }

    pub fn with_payload(payload: serde_json::Value) -> Self {
        RequestOptions {
            payload: Some(payload),
            ..Default::default()
        }
    }
}

/// OSMO service client that makes authenticated requests using a [`LoginManager`].
#[derive(Clone)]
pub struct ServiceClient {
    login_manager: LoginManager,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(login_manager: LoginManager) -> Result<Self> {
        // No client-wide timeout: per-request timeouts are applied below so streaming
        // responses can stay open indefinitely
        let http = reqwest::Client::builder().build()?;
        Ok(ServiceClient {
            login_manager,
            http,
        })
    }

    pub fn login_manager(&self) -> &LoginManager {
        &self.login_manager
    }

    /// Makes an authenticated request to the service and decodes the response per `mode`.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        opts: RequestOptions,
        mode: ResponseMode,
    ) -> Result<ResponseBody> {
        let url = format!(
            "{}/{}",
            self.login_manager.url().await?.trim_end_matches('/'),
            endpoint
        );

        // Make sure the tokens are up to date
        self.login_manager.refresh_id_token().await?;

        let headers = self.build_headers(&opts.headers, opts.send_version_header).await?;

        let attempts = if opts.send_version_header {
            RETRY_ATTEMPTS
        } else {
            1
        };

        let mut refreshed_on_unauthorized = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .headers(headers.clone())
                .query(&opts.params);
            if let Some(payload) = &opts.payload {
                builder = builder.json(payload);
            }
            if mode != ResponseMode::Streaming {
                builder = builder.timeout(LOGIN_TIMEOUT);
            }

            match builder.send().await {
                Ok(resp) => {
                    // Tolerate clock skew: one forced refresh on any 401 from the service
                    if resp.status() == StatusCode::UNAUTHORIZED && !refreshed_on_unauthorized {
                        refreshed_on_unauthorized = true;
                        self.login_manager.force_refresh().await?;
                        continue;
                    }
                    return handle_response(resp, mode).await;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(error = %e, attempt, "Transient request failure, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Convenience wrapper for JSON-mode requests.
    pub async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<serde_json::Value> {
        self.request(method, endpoint, opts, ResponseMode::Json)
            .await?
            .into_json()
    }

    /// Makes an authenticated request with a raw streaming body. Used for uploads; the body
    /// cannot be replayed, so no retry policy applies.
    pub async fn request_raw_body(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(String, String)>,
        body: reqwest::Body,
        content_type: &str,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}/{}",
            self.login_manager.url().await?.trim_end_matches('/'),
            endpoint
        );
        self.login_manager.refresh_id_token().await?;
        let mut headers = self.build_headers(&[], true).await?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).map_err(|e| OsmoError::Other(e.to_string()))?,
        );
        let resp = self
            .http
            .request(method, &url)
            .headers(headers)
            .query(&params)
            .body(body)
            .send()
            .await?;
        handle_response(resp, ResponseMode::Json)
            .await?
            .into_json()
    }

    /// Opens an authenticated WebSocket to a router endpoint.
    ///
    /// The supplied address scheme is converted from `http(s)` to `ws(s)` when necessary and
    /// the same auth headers as HTTP requests are attached. TLS uses native roots.
    pub async fn create_websocket(
        &self,
        address: &str,
        endpoint: &str,
        headers: Vec<(String, String)>,
        params: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<WsStream> {
        // Make sure the tokens are up to date
        self.login_manager.refresh_id_token().await?;

        let mut url = Url::parse(&format!(
            "{}/{}",
            address.trim_end_matches('/'),
            endpoint
        ))?;
        match url.scheme() {
            "http" => url.set_scheme("ws").expect("ws is a valid scheme"),
            "https" => url.set_scheme("wss").expect("wss is a valid scheme"),
            "ws" | "wss" => {}
            other => {
                return Err(OsmoError::server(format!(
                    "Invalid router address scheme: {}",
                    other
                )))
            }
        }
        for (key, value) in params {
            url.query_pairs_mut().append_pair(&key, &value);
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(OsmoError::from)?;
        let auth_headers = self.build_headers(&headers, true).await?;
        request.headers_mut().extend(auth_headers);

        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| OsmoError::server("Timed out opening WebSocket to the router"))??;
        Ok(ws)
    }

    async fn build_headers(
        &self,
        extra: &[(String, String)],
        version_header: bool,
    ) -> Result<HeaderMap> {
        let storage = self.login_manager.storage().await?;
        let mut headers = HeaderMap::new();

        if let Some(token_login) = &storage.token_login {
            let mut value = HeaderValue::from_str(&token_login.id_token)
                .map_err(|e| OsmoError::Other(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(OSMO_AUTH_HEADER), value);
            let dev_env = std::env::var("OSMO_LOGIN_DEV")
                .map(|v| v == "true" || v == "True")
                .unwrap_or(false);
            if dev_env {
                if let Some(username) = &token_login.username {
                    headers.insert(
                        HeaderName::from_static(OSMO_USER_HEADER),
                        HeaderValue::from_str(username)
                            .map_err(|e| OsmoError::Other(e.to_string()))?,
                    );
                }
            }
        }
        if let Some(dev_login) = &storage.dev_login {
            headers.insert(
                HeaderName::from_static(OSMO_USER_HEADER),
                HeaderValue::from_str(&dev_login.username)
                    .map_err(|e| OsmoError::Other(e.to_string()))?,
            );
        }
        if version_header {
            headers.insert(
                HeaderName::from_static(VERSION_HEADER),
                HeaderValue::from_str(&Version::current().to_string())
                    .map_err(|e| OsmoError::Other(e.to_string()))?,
            );
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(self.login_manager.user_agent())
                .map_err(|e| OsmoError::Other(e.to_string()))?,
        );

        for (key, value) in extra {
            headers.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| OsmoError::Other(e.to_string()))?,
                HeaderValue::from_str(value).map_err(|e| OsmoError::Other(e.to_string()))?,
            );
        }
        Ok(headers)
    }
}

/// Maps a response to a decoded body or a structured error, surfacing any version warning the
/// service attached.
pub async fn handle_response(resp: reqwest::Response, mode: ResponseMode) -> Result<ResponseBody> {
    if let Some(raw) = resp.headers().get(VERSION_WARNING_HEADER) {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(raw.as_bytes()) {
            eprintln!("{}", String::from_utf8_lossy(&decoded));
        }
    }

    let status = resp.status();
    if !status.is_success() {
        tracing::error!(status = status.as_u16(), "Server responded with an error");
    }

    if status.is_client_error() {
        let body = resp.text().await.unwrap_or_default();
        return Err(client_error(status, body));
    }

    if status.is_server_error() || !status.is_success() {
        let mut message = format!("Status Code: {}\nHeader:\n", status.as_u16());
        for (key, value) in resp.headers() {
            message.push_str(&format!("  {}: {}\n", key, value.to_str().unwrap_or("")));
        }
        let body = resp.text().await.unwrap_or_default();
        message.push_str(&format!("Body:\n{}", body));
        return Err(OsmoError::Server {
            message,
            status_code: Some(status.as_u16()),
        });
    }

    match mode {
        ResponseMode::PlainText => Ok(ResponseBody::Text(resp.text().await?)),
        ResponseMode::Binary => Ok(ResponseBody::Binary(resp.bytes().await?)),
        ResponseMode::Streaming => Ok(ResponseBody::Streaming(resp)),
        ResponseMode::Json => {
            let text = resp.text().await?;
            Ok(ResponseBody::Json(serde_json::from_str(&text)?))
        }
    }
}

/// Shapes a 4xx into the error taxonomy. JSON bodies with an `error_code` map to the
/// structured submission/credential kinds; anything else is a user error carrying the body.
fn client_error(status: StatusCode, body: String) -> OsmoError {
    let status_code = Some(status.as_u16());
    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            if status == StatusCode::NOT_FOUND {
                return OsmoError::NotFound;
            }
            return OsmoError::User {
                message: body,
                status_code,
            };
        }
    };

    let message = payload
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or(&body)
        .to_owned();
    let workflow_id = payload
        .get("workflow_id")
        .and_then(|w| w.as_str())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_owned());

    match payload.get("error_code").and_then(|c| c.as_str()) {
        Some("SUBMISSION") => OsmoError::Submission {
            message,
            workflow_id,
            status_code,
        },
        Some("CREDENTIAL") => OsmoError::Credential {
            message,
            workflow_id,
            status_code,
        },
        Some(_) => OsmoError::User {
            message,
            status_code,
        },
        None => OsmoError::User {
            message: body,
            status_code,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_error_maps_structured_codes() {
        let err = client_error(
            StatusCode::BAD_REQUEST,
            r#"{"error_code": "SUBMISSION", "message": "bad spec", "workflow_id": "wf-1"}"#.into(),
        );
        assert!(matches!(err, OsmoError::Submission { .. }));
        assert_eq!(err.workflow_id(), Some("wf-1"));

        let err = client_error(
            StatusCode::FORBIDDEN,
            r#"{"error_code": "CREDENTIAL", "message": "no access"}"#.into(),
        );
        assert!(matches!(err, OsmoError::Credential { .. }));

        let err = client_error(
            StatusCode::BAD_REQUEST,
            r#"{"error_code": "QUOTA", "message": "too many"}"#.into(),
        );
        assert!(matches!(err, OsmoError::User { .. }));
    }

    #[test]
    fn test_client_error_tolerates_non_json_bodies() {
        let err = client_error(StatusCode::BAD_REQUEST, "plain failure".into());
        match err {
            OsmoError::User {
                message,
                status_code,
            } => {
                assert_eq!(message, "plain failure");
                assert_eq!(status_code, Some(400));
            }
            other => panic!("expected user error, got {:?}", other),
        }

        assert!(matches!(
            client_error(StatusCode::NOT_FOUND, "nope".into()),
            OsmoError::NotFound
        ));
    }
}
