use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::BusError;

/// Bot Framework client-credentials endpoint.
pub const TOKEN_ENDPOINT: &str =
    "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token";
pub const TOKEN_SCOPE: &str = "https://api.botframework.com/.default";

/// A token this close to expiry (in seconds) is re-issued before use.
const REFRESH_MARGIN_SECS: i64 = 1;

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl Token {
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.expires_at - now <= REFRESH_MARGIN_SECS
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Issues and lazily refreshes OAuth2 client-credentials tokens.
///
/// There is no background timer: a token is only refreshed when a send
/// needs it, so idle accounts never hit the issuer.
#[derive(Debug, Clone)]
pub struct TokenManager {
    client: reqwest::Client,
    endpoint: String,
    scope: String,
}

impl TokenManager {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, TOKEN_ENDPOINT)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            scope: TOKEN_SCOPE.to_string(),
        }
    }

    pub async fn get_token(&self, app_id: &str, app_secret: &str) -> Result<Token, BusError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", app_id),
            ("client_secret", app_secret),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| BusError::Token(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BusError::Token(format!("({}): {}", status, body)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BusError::Token(format!("invalid token response: {}", e)))?;

        let token = Token {
            access_token: body.access_token,
            expires_at: Utc::now().timestamp() + body.expires_in,
        };
        info!("Issued token for app {} (expires in {}s)", app_id, body.expires_in);
        Ok(token)
    }

    /// Return `token` unchanged unless it is about to expire, in which case
    /// a new one is issued before the caller proceeds.
    pub async fn ensure_fresh(
        &self,
        token: Token,
        app_id: &str,
        app_secret: &str,
    ) -> Result<Token, BusError> {
        let now = Utc::now().timestamp();
        if token.needs_refresh(now) {
            debug!("Token for app {} expired, re-issuing", app_id);
            return self.get_token(app_id, app_secret).await;
        }
        debug!("Token for app {} expires in {}s", app_id, token.expires_at - now);
        Ok(token)
    }
}
