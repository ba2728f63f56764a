// =============================================================================
// Token Provider — refresh-token exchange and access-token claims
// =============================================================================
//
// The access token is a JWT issued by the broker. Its claims are decoded for
// expiry tracking and display only; the signature is not checked here, the
// token arrives over the already-authenticated refresh channel.
// =============================================================================

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{FeedError, Result};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(2);

/// `aud` is either one string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub ent: String,
    #[serde(rename = "clientid", default)]
    pub client_id: String,
    /// Space-separated portfolio codes.
    #[serde(default)]
    pub portfolios: String,
    #[serde(default)]
    pub agreements: String,
    #[serde(default)]
    pub ein: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub azp: String,
}

impl TokenClaims {
    pub fn portfolios(&self) -> Vec<&str> {
        self.portfolios.split_whitespace().collect()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.exp <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// Decode the claims segment of a JWT without verifying its signature.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(FeedError::AuthClaims("token is not a JWT".to_string())),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| FeedError::AuthClaims(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FeedError::AuthClaims(format!("payload is not a claims object: {e}")))
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(rename = "AccessToken")]
    access_token: String,
}

#[derive(Default)]
struct TokenState {
    access_token: String,
    claims: Option<TokenClaims>,
}

/// Holds the current access token and knows how to renew it.
pub struct TokenProvider {
    auth_host: String,
    refresh_token: String,
    client: reqwest::Client,
    state: RwLock<TokenState>,
}

impl TokenProvider {
    pub fn new(auth_host: impl Into<String>, refresh_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .build()
            .map_err(|e| FeedError::AuthTransport(format!("http client: {e}")))?;

        Ok(Self {
            auth_host: auth_host.into().trim_end_matches('/').to_string(),
            refresh_token: refresh_token.into(),
            client,
            state: RwLock::new(TokenState::default()),
        })
    }

    /// Exchange the refresh credential for a new access token.
    ///
    /// 403 is `AuthForbidden`; network failures and other statuses are
    /// `AuthTransport`; an undecodable token is `AuthClaims` and is not
    /// installed.
    #[instrument(skip(self), name = "auth::refresh")]
    pub async fn refresh(&self) -> Result<()> {
        let url = format!("{}/refresh", self.auth_host);

        let resp = self
            .client
            .post(&url)
            .query(&[("token", self.refresh_token.as_str())])
            .send()
            .await
            .map_err(|e| FeedError::AuthTransport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            return Err(FeedError::AuthForbidden);
        }
        if !status.is_success() {
            return Err(FeedError::AuthTransport(format!(
                "refresh answered {status}"
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::AuthTransport(format!("refresh body: {e}")))?;

        let claims = decode_claims(&body.access_token)?;
        info!(
            client_id = %claims.client_id,
            portfolios = claims.portfolios().len(),
            expires_at = ?claims.expires_at(),
            "access token refreshed"
        );

        let mut state = self.state.write();
        state.access_token = body.access_token;
        state.claims = Some(claims);
        Ok(())
    }

    /// Install a token obtained elsewhere. Claims are decoded when possible.
    pub fn set_access_token(&self, token: impl Into<String>) {
        let token = token.into();
        let claims = decode_claims(&token).ok();
        if claims.is_none() {
            debug!("installed access token carries no readable claims");
        }
        let mut state = self.state.write();
        state.access_token = token;
        state.claims = claims;
    }

    pub fn access_token(&self) -> String {
        self.state.read().access_token.clone()
    }

    pub fn claims(&self) -> Option<TokenClaims> {
        self.state.read().claims.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().claims.as_ref().and_then(TokenClaims::expires_at)
    }

    /// True when there is no token, or it expires within `margin`.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        let state = self.state.read();
        if state.access_token.is_empty() {
            return true;
        }
        match state.claims.as_ref().and_then(TokenClaims::expires_at) {
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
                expires_at - margin <= Utc::now()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn decodes_claims_without_signature_check() {
        let token = jwt(json!({
            "clientid": "c-42",
            "portfolios": "D1 D2  750",
            "exp": 1_900_000_000i64,
            "aud": ["Client", "Warp"],
            "scope": "OrdersRead"
        }));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.client_id, "c-42");
        assert_eq!(claims.portfolios(), vec!["D1", "D2", "750"]);
        assert_eq!(claims.expires_at().unwrap().timestamp(), 1_900_000_000);
        assert_eq!(claims.aud, Some(Audience::Many(vec!["Client".into(), "Warp".into()])));
    }

    #[test]
    fn rejects_non_jwt() {
        assert!(matches!(decode_claims("opaque"), Err(FeedError::AuthClaims(_))));
        assert!(matches!(decode_claims("a.!!!.c"), Err(FeedError::AuthClaims(_))));
    }

    #[test]
    fn expiry_drives_needs_refresh() {
        let provider = TokenProvider::new("http://localhost", "r").unwrap();
        assert!(provider.needs_refresh(Duration::ZERO));

        let soon = Utc::now().timestamp() + 30;
        provider.set_access_token(jwt(json!({ "exp": soon })));
        assert!(!provider.needs_refresh(Duration::ZERO));
        assert!(provider.needs_refresh(Duration::from_secs(60)));

        provider.set_access_token("opaque-token");
        assert_eq!(provider.access_token(), "opaque-token");
        assert!(!provider.needs_refresh(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn refresh_installs_new_token() {
        let token = jwt(json!({ "clientid": "c-1", "exp": Utc::now().timestamp() + 3600 }));
        let issued = token.clone();
        let router = Router::new().route(
            "/refresh",
            post(move |Query(q): Query<HashMap<String, String>>| {
                let issued = issued.clone();
                async move {
                    if q.get("token").map(String::as_str) == Some("refresh-1") {
                        Ok(Json(json!({ "AccessToken": issued })))
                    } else {
                        Err(AxumStatus::FORBIDDEN)
                    }
                }
            }),
        );
        let host = serve(router).await;

        let provider = TokenProvider::new(host.clone(), "refresh-1").unwrap();
        provider.refresh().await.unwrap();
        assert_eq!(provider.access_token(), token);
        assert_eq!(provider.claims().unwrap().client_id, "c-1");

        let denied = TokenProvider::new(host, "wrong").unwrap();
        assert!(matches!(denied.refresh().await, Err(FeedError::AuthForbidden)));
        assert!(denied.access_token().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let provider = TokenProvider::new("http://127.0.0.1:1", "r").unwrap();
        assert!(matches!(provider.refresh().await, Err(FeedError::AuthTransport(_))));
    }
}
