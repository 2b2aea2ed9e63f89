//! OAuth2 helpers shared by the Drive and Earth Engine clients
use crate::config::{DriveConfig, EarthEngineConfig};
use crate::error::GlobeError;
use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use url::Url;

pub const DRIVE_SCOPES: &[&str] = &["https://www.googleapis.com/auth/drive"];
pub const EARTH_ENGINE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/earthengine",
    "https://www.googleapis.com/auth/devstorage.full_control",
];

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are refreshed before use
const EXPIRY_MARGIN_SECS: i64 = 60;

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecrets {
    installed: Option<OAuthClient>,
    web: Option<OAuthClient>,
}

impl OAuthClient {
    /// Reads a client secrets file as downloaded from the Google Cloud console.
    pub fn read_secrets<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GlobeError::FileNotFound(path.to_path_buf()).into());
        }
        let content = fs::read_to_string(path)?;
        let secrets: ClientSecrets = serde_json::from_str(&content)
            .with_context(|| format!("Invalid client secrets in {}", path.display()))?;
        secrets
            .installed
            .or(secrets.web)
            .ok_or(anyhow!("No 'installed' or 'web' client in {}", path.display()))
    }
}

/// Refresh-token credentials as written by `earthengine authenticate`
#[derive(Deserialize, Debug)]
pub struct EarthEngineCredentials {
    pub refresh_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl EarthEngineCredentials {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GlobeError::FileNotFound(path.to_path_buf()).into());
        }
        let content = fs::read_to_string(path)?;
        let credentials = serde_json::from_str(&content)
            .with_context(|| format!("Invalid Earth Engine credentials in {}", path.display()))?;
        Ok(credentials)
    }

    fn client(self: &Self) -> Result<OAuthClient> {
        match (&self.client_id, &self.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(OAuthClient {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                auth_uri: default_auth_uri(),
                token_uri: default_token_uri(),
            }),
            _ => Err(GlobeError::Auth(
                "Earth Engine credentials carry no client_id/client_secret, re-run `earthengine authenticate`"
                    .to_string(),
            )
            .into()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredToken {
    pub fn is_valid_at(self: &Self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now,
            None => false,
        }
    }

    pub fn covers(self: &Self, scopes: &[&str]) -> bool {
        scopes.iter().all(|s| self.scopes.iter().any(|t| t.as_str() == *s))
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                log::warn!("Ignoring unreadable token cache {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<String>, scopes: &[String]) -> StoredToken {
        let scopes = match self.scope {
            Some(scope) => scope.split_whitespace().map(String::from).collect(),
            None => scopes.to_vec(),
        };
        StoredToken {
            access_token: self.access_token,
            // Refresh responses usually omit the refresh token
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
            scopes,
        }
    }
}

/// Hands out bearer tokens, refreshing them when they are about to expire.
pub struct Authenticator {
    http: reqwest::Client,
    client: OAuthClient,
    scopes: Vec<String>,
    cache: Option<PathBuf>,
    token: Mutex<StoredToken>,
}

impl Authenticator {
    /// Drive authentication: cached token, else refresh, else interactive consent.
    /// The resulting token is persisted to the token cache.
    pub async fn drive(http: reqwest::Client, config: &DriveConfig) -> Result<Self> {
        let client = OAuthClient::read_secrets(&config.credentials)?;
        let scopes: Vec<String> = DRIVE_SCOPES.iter().map(|s| s.to_string()).collect();
        let cached = StoredToken::read(&config.token_cache)?.filter(|t| t.covers(DRIVE_SCOPES));

        let token = match cached {
            Some(token) if token.is_valid_at(Utc::now()) => {
                log::debug!("Using cached Drive token");
                token
            }
            Some(StoredToken {
                refresh_token: Some(refresh_token),
                ..
            }) => {
                log::info!("Refreshing expired Drive token");
                refresh(&http, &client, &refresh_token, &scopes).await?
            }
            _ => consent_flow(&http, &client, &scopes).await?,
        };
        token.write(&config.token_cache)?;

        Ok(Self {
            http,
            client,
            scopes,
            cache: Some(config.token_cache.clone()),
            token: Mutex::new(token),
        })
    }

    /// Earth Engine authentication from a stored refresh token. Any failure here is fatal.
    pub async fn earth_engine(http: reqwest::Client, config: &EarthEngineConfig) -> Result<Self> {
        let init = async {
            let credentials = EarthEngineCredentials::read(&config.credentials)?;
            let client = credentials.client()?;
            let scopes = if credentials.scopes.is_empty() {
                EARTH_ENGINE_SCOPES.iter().map(|s| s.to_string()).collect()
            } else {
                credentials.scopes.clone()
            };
            let token = refresh(&http, &client, &credentials.refresh_token, &scopes).await?;
            anyhow::Ok((client, scopes, token))
        };
        let (client, scopes, token) = init
            .await
            .map_err(|e| GlobeError::EarthEngineInit(format!("{:#}", e)))?;

        Ok(Self {
            http,
            client,
            scopes,
            cache: None,
            token: Mutex::new(token),
        })
    }

    #[cfg(test)]
    pub fn with_token(token: StoredToken) -> Self {
        Self {
            http: reqwest::Client::new(),
            client: OAuthClient {
                client_id: "test".to_string(),
                client_secret: "test".to_string(),
                auth_uri: default_auth_uri(),
                token_uri: default_token_uri(),
            },
            scopes: vec![],
            cache: None,
            token: Mutex::new(token),
        }
    }

    pub async fn bearer(self: &Self) -> Result<String> {
        let mut token = self.token.lock().await;
        if !token.is_valid_at(Utc::now()) {
            let refresh_token = token
                .refresh_token
                .clone()
                .ok_or_else(|| GlobeError::Auth("Token expired and cannot be refreshed".into()))?;
            log::debug!("Refreshing access token");
            *token = refresh(&self.http, &self.client, &refresh_token, &self.scopes).await?;
            if let Some(cache) = &self.cache {
                token.write(cache)?;
            }
        }
        Ok(token.access_token.clone())
    }
}

async fn request_token(
    http: &reqwest::Client,
    client: &OAuthClient,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = http.post(&client.token_uri).form(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GlobeError::Auth(format!("token endpoint returned {}: {}", status, body)).into());
    }
    Ok(response.json::<TokenResponse>().await?)
}

async fn refresh(
    http: &reqwest::Client,
    client: &OAuthClient,
    refresh_token: &str,
    scopes: &[String],
) -> Result<StoredToken> {
    let response = request_token(
        http,
        client,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ],
    )
    .await?;
    Ok(response.into_token(Some(refresh_token.to_string()), scopes))
}

/// Installed-app consent flow with a loopback redirect on an ephemeral port.
async fn consent_flow(
    http: &reqwest::Client,
    client: &OAuthClient,
    scopes: &[String],
) -> Result<StoredToken> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
    let scope = scopes.join(" ");
    let url = Url::parse_with_params(
        &client.auth_uri,
        &[
            ("client_id", client.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )?;
    println!("Please visit this URL to authorize this application: {url}");

    let code = receive_authorization_code(listener).await?;
    let response = request_token(
        http,
        client,
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ],
    )
    .await?;
    Ok(response.into_token(None, scopes))
}

type CodeSender = Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>;

/// Serves the redirect on `listener` until a request to `/` carries `code` or `error`.
/// Other requests are answered and ignored.
async fn receive_authorization_code(listener: TcpListener) -> Result<String> {
    let (code_tx, code_rx) = oneshot::channel::<Result<String>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let sender: CodeSender = Arc::new(Mutex::new(Some(code_tx)));

    let app = Router::new()
        .route("/", get(redirect_handler))
        .with_state(sender);
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    let received = code_rx.await;
    let _ = shutdown_tx.send(());
    received.map_err(|_| GlobeError::Auth("Redirect server stopped before consent".into()))?
}

async fn redirect_handler(
    State(sender): State<CodeSender>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    let Some(result) = authorization_code(&params) else {
        return (StatusCode::BAD_REQUEST, "Waiting for the authorization redirect.");
    };
    let body = match &result {
        Ok(_) => "The authentication flow has completed. You may close this window.",
        Err(_) => "The authentication flow failed. Check the terminal for details.",
    };
    if let Some(tx) = sender.lock().await.take() {
        let _ = tx.send(result);
    }
    (StatusCode::OK, body)
}

/// `None` while the redirect carries neither `code` nor `error`.
fn authorization_code(params: &HashMap<String, String>) -> Option<Result<String>> {
    if let Some(error) = params.get("error") {
        return Some(Err(GlobeError::Auth(format!("consent denied: {}", error)).into()));
    }
    params.get("code").map(|code| Ok(code.clone()))
}
