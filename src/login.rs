//! Identity and token store. Manages the persisted login (`login.yaml`), the OIDC
//! device/password flows against the auth provider, access-token logins against the service,
//! and the refresh performed before every authenticated request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::{config, OsmoError, Result};

/// Header carrying the raw id token on authenticated requests.
pub const OSMO_AUTH_HEADER: &str = "x-osmo-auth";
/// Header carrying the username for dev logins (and the dev bypass on token logins).
pub const OSMO_USER_HEADER: &str = "x-osmo-user";

/// Request timeout applied to auth provider calls.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Scopes requested in the OIDC flows.
const OIDC_SCOPE: &str = "openid offline_access profile";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Path of the device-authorization endpoint relative to the auth realm, used when the
/// service does not advertise one.
pub const DEFAULT_DEVICE_AUTH_PATH: &str = "realms/osmo/protocol/openid-connect/auth/device";
const DEFAULT_TOKEN_PATH: &str = "realms/osmo/protocol/openid-connect/token";

/// Refresh the id token when it is within this many seconds of expiring.
const EXPIRY_WIGGLE_ROOM_SECS: i64 = 60;

/// Static process configuration for the login flows.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// OIDC client id used when the service does not advertise one.
    pub client_id: String,
    /// Token endpoint override. When unset, the endpoint is derived from the service URL.
    pub token_endpoint: Option<String>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        LoginConfig {
            client_id: "osmo-cli".to_owned(),
            token_endpoint: None,
        }
    }
}

impl LoginConfig {
    /// The token endpoint to use for a given service URL.
    pub fn token_endpoint_or_default(&self, url: &str) -> String {
        self.token_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/{}", url.trim_end_matches('/'), DEFAULT_TOKEN_PATH))
    }
}

/// Tokens persisted after an OIDC or access-token login.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenLogin {
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Development-only login: the username travels as a non-verified header.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DevLogin {
    pub username: String,
}

/// The persisted record of the last successful authentication. Exactly one of `token_login`
/// and `dev_login` is populated; `osmo_token` marks token logins that refresh through the
/// service's access-token endpoint instead of the OIDC provider.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginStorage {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_login: Option<TokenLogin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_login: Option<DevLogin>,
    #[serde(default)]
    pub osmo_token: bool,
}

#[derive(Deserialize, Debug)]
struct Claims {
    exp: i64,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    message: Option<String>,
    interval: u64,
    expires_in: u64,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Manages user login and decorates outbound requests with authentication headers.
///
/// Clones share the same underlying storage so concurrent callers observe at most one token
/// refresh in flight.
#[derive(Clone)]
pub struct LoginManager {
    config: LoginConfig,
    user_agent: String,
    http: reqwest::Client,
    storage: Arc<RwLock<Option<LoginStorage>>>,
}

impl LoginManager {
    /// Creates a manager, loading the persisted login from the config directory if present.
    /// A missing login file is not an error until an authenticated call is attempted.
    pub fn new(config: LoginConfig, user_agent_prefix: &str) -> Result<Self> {
        let user_agent = format!("{}/{}", user_agent_prefix, crate::Version::current());
        let storage = match std::fs::read_to_string(config::login_file()) {
            Ok(raw) => serde_yaml::from_str::<LoginStorage>(&raw).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(LoginManager {
            config,
            user_agent,
            http: reqwest::Client::new(),
            storage: Arc::new(RwLock::new(storage)),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    /// The current login, or the "must login first" user error.
    pub async fn storage(&self) -> Result<LoginStorage> {
        self.storage
            .read()
            .await
            .clone()
            .ok_or_else(|| OsmoError::user("Must login first with \"login\" command"))
    }

    /// The service URL of the current login.
    pub async fn url(&self) -> Result<String> {
        Ok(self.storage().await?.url)
    }

    /// Fetches the device endpoint and client id advertised by the service.
    pub async fn fetch_login_info(&self, url: &str) -> Result<(String, Option<String>)> {
        let resp = self
            .http
            .get(format!("{}/api/login/info", url.trim_end_matches('/')))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await?;
        let info: serde_json::Value = provider_response(resp).await?.json().await?;
        let device_endpoint = match info.get("device_endpoint").and_then(|v| v.as_str()) {
            Some(e) => e.to_owned(),
            None => format!("{}/{}", url.trim_end_matches('/'), DEFAULT_DEVICE_AUTH_PATH),
        };
        let client_id = info
            .get("device_client_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_owned());
        Ok((device_endpoint, client_id))
    }

    /// Logs in with the OAuth2 device-authorization-grant flow.
    ///
    /// Prompts the user to visit the verification URI and polls the token endpoint at the
    /// server-returned interval until tokens are issued, the provider returns a non-pending
    /// error, or `expires_in` elapses.
    ///
    /// NOTE: this function requires user interaction and prints to stdout.
    pub async fn device_code_login(
        &self,
        url: &str,
        device_endpoint: &str,
        client_id: Option<&str>,
    ) -> Result<()> {
        let client_id = client_id.unwrap_or(&self.config.client_id);
        let resp = self
            .http
            .post(device_endpoint)
            .form(&[("client_id", client_id), ("scope", OIDC_SCOPE)])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await?;
        let device: DeviceAuthorization = provider_response(resp).await?.json().await?;

        if let Some(message) = &device.message {
            println!("{}", message);
        } else if let Some(complete) = &device.verification_uri_complete {
            println!("Visit {} and complete authentication.", complete);
        } else {
            println!(
                "Visit {} and enter the following code: {}",
                device.verification_uri, device.user_code
            );
        }

        let token_endpoint = self.config.token_endpoint_or_default(url);
        let deadline = Utc::now() + chrono::Duration::seconds(device.expires_in as i64);

        // Keep polling until the user finishes authenticating
        let token = loop {
            if Utc::now() > deadline {
                return Err(OsmoError::server(
                    "Did not complete device authentication in time!",
                ));
            }
            let resp = self
                .http
                .post(&token_endpoint)
                .form(&[
                    ("grant_type", DEVICE_GRANT_TYPE),
                    ("device_code", &device.device_code),
                    ("client_id", client_id),
                ])
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .timeout(LOGIN_TIMEOUT)
                .send()
                .await?;
            let token: TokenResponse = resp.json().await?;
            match token.error.as_deref() {
                Some("authorization_pending") => {
                    tokio::time::sleep(Duration::from_secs(device.interval)).await
                }
                Some(error) => {
                    return Err(OsmoError::server(format!(
                        "Unexpected error during device auth flow {}",
                        error
                    )))
                }
                None => break token,
            }
        };

        self.store_token_login(url, token, &token_endpoint).await
    }

    /// Logs in with the OAuth2 resource-owner-password-credentials flow. This should only be
    /// used for service accounts that cannot authenticate through a browser.
    pub async fn owner_password_login(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let token_endpoint = self.config.token_endpoint_or_default(url);
        let resp = self
            .http
            .post(&token_endpoint)
            .form(&[
                ("grant_type", "password"),
                ("client_id", &self.config.client_id),
                ("username", username),
                ("password", password),
                ("scope", OIDC_SCOPE),
            ])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await?;
        let token: TokenResponse = provider_response(resp).await?.json().await?;
        if let Some(error) = token.error {
            return Err(OsmoError::server(format!(
                "Unexpected error during password auth flow {}",
                error
            )));
        }
        self.store_token_login(url, token, &token_endpoint).await
    }

    /// Logs in with a long-lived access token. The token is kept as a refresh reference: the
    /// service's access-token endpoint exchanges it for short-lived id tokens.
    pub async fn token_login(&self, url: &str, access_token: &str) -> Result<()> {
        let refresh_url = format!(
            "{}/api/auth/access_token/refresh?token={}",
            url.trim_end_matches('/'),
            access_token
        );
        let id_token = self.fetch_token_from_refresh_url(&refresh_url).await?;
        let name = display_name(&id_token).unwrap_or_else(|_| "user".to_owned());
        let storage = LoginStorage {
            url: url.to_owned(),
            name,
            token_login: Some(TokenLogin {
                id_token,
                refresh_token: None,
                refresh_url: Some(refresh_url),
                username: None,
            }),
            dev_login: None,
            osmo_token: true,
        };
        self.save(storage, true).await
    }

    /// Development-only login: stores a username that is sent as a non-verified header.
    pub async fn dev_login(&self, url: &str, username: &str) -> Result<()> {
        let storage = LoginStorage {
            url: url.to_owned(),
            name: username.to_owned(),
            token_login: None,
            dev_login: Some(DevLogin {
                username: username.to_owned(),
            }),
            osmo_token: false,
        };
        self.save(storage, true).await
    }

    /// Removes the persisted login. Missing file is not an error.
    pub async fn logout(&self) -> Result<()> {
        *self.storage.write().await = None;
        match tokio::fs::remove_file(config::login_file()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Refreshes the id token if its expiry is imminent. Invoked before every authenticated
    /// request; a no-op for dev logins and fresh tokens.
    pub async fn refresh_id_token(&self) -> Result<()> {
        self.refresh(false).await
    }

    /// Unconditionally refreshes the id token. Used when the service answers 401 despite a
    /// locally-valid token (clock skew).
    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh(true).await
    }

    async fn refresh(&self, force: bool) -> Result<()> {
        // Hold the write lock across the whole exchange so concurrent callers observe at most
        // one refresh in flight
        let mut guard = self.storage.write().await;
        let storage = guard
            .as_mut()
            .ok_or_else(|| OsmoError::user("Must login first with \"login\" command"))?;
        let Some(token_login) = storage.token_login.as_mut() else {
            return Ok(());
        };
        if !force {
            let expiry = token_expiry(&token_login.id_token)?;
            if Utc::now() + chrono::Duration::seconds(EXPIRY_WIGGLE_ROOM_SECS) < expiry {
                return Ok(());
            }
        }
        tracing::debug!("Token is expiring, attempting to refresh");

        if storage.osmo_token {
            let refresh_url = token_login.refresh_url.clone().ok_or_else(|| {
                OsmoError::user("Stored login has no refresh URL, please login again")
            })?;
            token_login.id_token = self.fetch_token_from_refresh_url(&refresh_url).await?;
        } else {
            let refresh_url = token_login.refresh_url.clone().ok_or_else(|| {
                OsmoError::user("Stored login has no refresh URL, please login again")
            })?;
            let refresh_token = token_login.refresh_token.clone().ok_or_else(|| {
                OsmoError::user("Stored login has no refresh token, please login again")
            })?;
            let resp = self
                .http
                .post(&refresh_url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", &refresh_token),
                    ("client_id", &self.config.client_id),
                ])
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .timeout(LOGIN_TIMEOUT)
                .send()
                .await?;
            let token: TokenResponse = provider_response(resp).await?.json().await?;
            if let Some(error) = token.error {
                return Err(OsmoError::server(format!(
                    "Unable to refresh token: {}",
                    error
                )));
            }
            token_login.id_token = token
                .id_token
                .ok_or_else(|| OsmoError::server("Token response did not contain an id token"))?;
            if let Some(new_refresh) = token.refresh_token {
                token_login.refresh_token = Some(new_refresh);
            }
        }

        let updated = storage.clone();
        drop(guard);
        self.persist(&updated).await
    }

    /// Exchanges a long-lived access token reference for a fresh id token.
    pub async fn fetch_token_from_refresh_url(&self, refresh_url: &str) -> Result<String> {
        let resp = self
            .http
            .get(refresh_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await?;
        let token: serde_json::Value = provider_response(resp).await?.json().await?;
        token
            .get("id_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_owned())
            .ok_or_else(|| OsmoError::server("Token response did not contain an id token"))
    }

    async fn store_token_login(
        &self,
        url: &str,
        token: TokenResponse,
        token_endpoint: &str,
    ) -> Result<()> {
        let id_token = token
            .id_token
            .ok_or_else(|| OsmoError::server("Token response did not contain an id token"))?;
        let refresh_token = token.refresh_token.ok_or_else(|| {
            OsmoError::server("Token response did not contain a refresh token")
        })?;
        let name = display_name(&id_token).unwrap_or_else(|_| "user".to_owned());
        let username = display_name(&id_token).ok();
        let storage = LoginStorage {
            url: url.to_owned(),
            name,
            token_login: Some(TokenLogin {
                id_token,
                refresh_token: Some(refresh_token),
                refresh_url: Some(token_endpoint.to_owned()),
                username,
            }),
            dev_login: None,
            osmo_token: false,
        };
        self.save(storage, true).await
    }

    async fn save(&self, storage: LoginStorage, welcome: bool) -> Result<()> {
        self.persist(&storage).await?;
        if welcome {
            println!("Successfully logged in. Welcome {}.", storage.name);
        }
        *self.storage.write().await = Some(storage);
        Ok(())
    }

    async fn persist(&self, storage: &LoginStorage) -> Result<()> {
        let dir = config::client_config_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let raw = serde_yaml::to_string(storage)?;

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .mode(0o600)
                .truncate(true)
                .open(config::login_file())
                .await?
        };

        #[cfg(not(unix))]
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(config::login_file())
            .await?;

        file.write_all(raw.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Maps a non-2xx auth provider response to a server error carrying the body.
async fn provider_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(OsmoError::Server {
        message: format!("Auth provider responded with {}: {}", status, body),
        status_code: Some(status.as_u16()),
    })
}

fn decode_claims(token: &str) -> Result<Claims> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    // The signature is verified by the service; the client only needs the claims
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|e| OsmoError::user(format!("Invalid token data: {}", e)))?;
    Ok(data.claims)
}

fn token_expiry(token: &str) -> Result<DateTime<Utc>> {
    let claims = decode_claims(token)?;
    Utc.timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| OsmoError::user("Invalid token expiry"))
}

fn display_name(token: &str) -> Result<String> {
    let claims = decode_claims(token)?;
    Ok(claims
        .preferred_username
        .or(claims.email)
        .unwrap_or_else(|| "user".to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_token(claims: serde_json::Value) -> String {
        use base64::Engine;
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(serde_json::to_vec(&serde_json::json!({"alg": "RS256"})).unwrap());
        let body = engine.encode(serde_json::to_vec(&claims).unwrap());
        format!("{}.{}.c2ln", header, body)
    }

    #[test]
    fn test_token_expiry_decodes_exp() {
        let token = make_token(serde_json::json!({"exp": 1_900_000_000i64}));
        let expiry = token_expiry(&token).unwrap();
        assert_eq!(expiry.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_display_name_prefers_username() {
        let token = make_token(serde_json::json!({
            "exp": 1_900_000_000i64,
            "preferred_username": "jdoe",
            "email": "jdoe@example.com"
        }));
        assert_eq!(display_name(&token).unwrap(), "jdoe");
        let token = make_token(serde_json::json!({
            "exp": 1_900_000_000i64,
            "email": "jdoe@example.com"
        }));
        assert_eq!(display_name(&token).unwrap(), "jdoe@example.com");
    }

    #[test]
    fn test_storage_round_trips_through_yaml() {
        let storage = LoginStorage {
            url: "https://osmo.example.com".into(),
            name: "jdoe".into(),
            token_login: Some(TokenLogin {
                id_token: "tok".into(),
                refresh_token: Some("refresh".into()),
                refresh_url: Some("https://auth.example.com/token".into()),
                username: Some("jdoe".into()),
            }),
            dev_login: None,
            osmo_token: false,
        };
        let raw = serde_yaml::to_string(&storage).unwrap();
        let parsed: LoginStorage = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed.url, storage.url);
        assert!(parsed.token_login.is_some());
        assert!(parsed.dev_login.is_none());
    }
}
