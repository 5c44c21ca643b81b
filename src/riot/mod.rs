//! Riot identity provider client.
//!
//! Three stateless calls against the upstream auth endpoints, each a single
//! request/response with no retry of its own — the session layer owns
//! retry policy. Endpoint paths and payload shapes are provider-owned
//! contracts; this module tracks them, it does not redesign them.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_AUTH_BASE: &str = "https://auth.riotgames.com";
const DEFAULT_ENTITLEMENTS_BASE: &str = "https://entitlements.auth.riotgames.com";

/// Upstream identity failures, split by what a retry could fix.
///
/// `Rejected` means the provider refused the supplied credentials; a
/// re-authentication attempt is warranted. Everything else is transport or
/// provider trouble that re-authenticating cannot cure.
#[derive(Debug)]
pub enum RiotError {
    /// Provider rejected the credentials (4xx auth status or a login
    /// challenge instead of tokens)
    Rejected { status: u16, detail: String },
    /// Provider-side failure (5xx and other unexpected statuses)
    Upstream { status: u16, detail: String },
    /// Transport failure before any response arrived
    Network(reqwest::Error),
    /// Response arrived but did not have the expected shape
    Malformed(String),
}

impl RiotError {
    /// True when a single re-authentication cycle makes sense.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, RiotError::Rejected { .. })
    }

    fn from_status(status: u16, detail: String) -> Self {
        match status {
            400 | 401 | 403 => RiotError::Rejected { status, detail },
            _ => RiotError::Upstream { status, detail },
        }
    }
}

impl std::fmt::Display for RiotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiotError::Rejected { status, detail } => {
                write!(f, "credentials rejected (status {}): {}", status, detail)
            }
            RiotError::Upstream { status, detail } => {
                write!(f, "upstream failure (status {}): {}", status, detail)
            }
            RiotError::Network(e) => write!(f, "network error: {}", e),
            RiotError::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl std::error::Error for RiotError {}

impl From<reqwest::Error> for RiotError {
    fn from(e: reqwest::Error) -> Self {
        RiotError::Network(e)
    }
}

/// Bearer + entitlement token pair from a completed exchange.
#[derive(Clone, Debug)]
pub struct SessionTokens {
    pub access_token: String,
    pub entitlement_token: String,
}

/// Who the access token belongs to.
#[derive(Clone, Debug)]
pub struct PlayerIdentity {
    /// Globally unique player id
    pub puuid: String,
    /// Human-readable `name#tag`
    pub riot_id: String,
}

/// Seam between the handshake/session layers and the real HTTP client.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a captured session cookie string for fresh tokens.
    async fn tokens_from_cookies(&self, cookies: &str) -> Result<SessionTokens, RiotError>;

    /// Obtain an entitlement token when only an access token is on hand.
    async fn entitlement_from_access_token(&self, access_token: &str)
        -> Result<String, RiotError>;

    /// Look up the player behind an access token.
    async fn player_identity(&self, access_token: &str) -> Result<PlayerIdentity, RiotError>;
}

#[derive(Deserialize)]
struct EntitlementsResponse {
    entitlements_token: String,
}

#[derive(Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    acct: AcctInfo,
}

#[derive(Deserialize, Default)]
struct AcctInfo {
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    tag_line: String,
}

/// Real client against the Riot auth endpoints.
pub struct RiotClient {
    http: reqwest::Client,
    auth_base: String,
    entitlements_base: String,
}

impl RiotClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            auth_base: DEFAULT_AUTH_BASE.to_string(),
            entitlements_base: DEFAULT_ENTITLEMENTS_BASE.to_string(),
        }
    }

    /// Point both endpoints somewhere else (tests).
    pub fn with_base_urls(http: reqwest::Client, auth: &str, entitlements: &str) -> Self {
        Self {
            http,
            auth_base: auth.trim_end_matches('/').to_string(),
            entitlements_base: entitlements.trim_end_matches('/').to_string(),
        }
    }

    async fn read_error(response: reqwest::Response) -> RiotError {
        let status = response.status().as_u16();
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "unreadable body".to_string());
        RiotError::from_status(status, detail)
    }
}

#[async_trait]
impl IdentityProvider for RiotClient {
    async fn tokens_from_cookies(&self, cookies: &str) -> Result<SessionTokens, RiotError> {
        let body = json!({
            "client_id": "play-valorant-web-prod",
            "nonce": "1",
            "redirect_uri": "https://playvalorant.com/opt_in",
            "response_type": "token id_token",
            "scope": "account openid",
        });

        tracing::debug!("Requesting tokens from session cookies");

        let response = self
            .http
            .post(format!("{}/api/v1/authorization", self.auth_base))
            .header("Cookie", cookies)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RiotError::Malformed(format!("authorization response: {}", e)))?;

        // A valid session produces a redirect uri carrying the token in its
        // fragment; an invalid one produces a login challenge instead.
        let uri = data["response"]["parameters"]["uri"]
            .as_str()
            .ok_or_else(|| RiotError::Rejected {
                status: 200,
                detail: "authorization response carried no token uri (session expired)"
                    .to_string(),
            })?;

        let access_token = uri
            .split("access_token=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                RiotError::Malformed("no access_token in redirect uri".to_string())
            })?
            .to_string();

        let entitlement_token = self.entitlement_from_access_token(&access_token).await?;

        Ok(SessionTokens {
            access_token,
            entitlement_token,
        })
    }

    async fn entitlement_from_access_token(
        &self,
        access_token: &str,
    ) -> Result<String, RiotError> {
        let response = self
            .http
            .post(format!("{}/api/token/v1", self.entitlements_base))
            .bearer_auth(access_token)
            .json(&json!({}))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let data: EntitlementsResponse = response
            .json()
            .await
            .map_err(|e| RiotError::Malformed(format!("entitlements response: {}", e)))?;

        Ok(data.entitlements_token)
    }

    async fn player_identity(&self, access_token: &str) -> Result<PlayerIdentity, RiotError> {
        let response = self
            .http
            .get(format!("{}/userinfo", self.auth_base))
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| RiotError::Malformed(format!("userinfo response: {}", e)))?;

        Ok(PlayerIdentity {
            puuid: info.sub,
            riot_id: format!("{}#{}", info.acct.game_name, info.acct.tag_line),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> RiotClient {
        RiotClient::with_base_urls(reqwest::Client::new(), &server.url(), &server.url())
    }

    #[tokio::test]
    async fn test_cookie_exchange_happy_path() {
        let mut server = mockito::Server::new_async().await;

        let auth = server
            .mock("POST", "/api/v1/authorization")
            .match_header("cookie", "ssid=abc; clid=ue1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response":{"parameters":{"uri":"https://playvalorant.com/opt_in#access_token=tok-123&scope=openid&expires_in=3600"}}}"#,
            )
            .create_async()
            .await;

        let entitlements = server
            .mock("POST", "/api/token/v1")
            .match_header("authorization", "Bearer tok-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entitlements_token":"ent-456"}"#)
            .create_async()
            .await;

        let tokens = client_for(&server)
            .tokens_from_cookies("ssid=abc; clid=ue1")
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "tok-123");
        assert_eq!(tokens.entitlement_token, "ent-456");
        auth.assert_async().await;
        entitlements.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_session_is_rejection() {
        let mut server = mockito::Server::new_async().await;

        // Provider answers 200 with a login challenge instead of a token uri
        server
            .mock("POST", "/api/v1/authorization")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"type":"auth","country":"jpn"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .tokens_from_cookies("ssid=stale")
            .await
            .unwrap_err();

        assert!(err.is_auth_rejection());
    }

    #[tokio::test]
    async fn test_auth_status_4xx_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/authorization")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let err = client_for(&server)
            .tokens_from_cookies("ssid=bad")
            .await
            .unwrap_err();

        assert!(err.is_auth_rejection());
    }

    #[tokio::test]
    async fn test_server_error_is_upstream_not_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/authorization")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = client_for(&server)
            .tokens_from_cookies("ssid=abc")
            .await
            .unwrap_err();

        assert!(!err.is_auth_rejection());
        assert!(matches!(err, RiotError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_entitlement_only_exchange() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/v1")
            .match_header("authorization", "Bearer tok-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"entitlements_token":"ent-789"}"#)
            .create_async()
            .await;

        let token = client_for(&server)
            .entitlement_from_access_token("tok-123")
            .await
            .unwrap();

        assert_eq!(token, "ent-789");
    }

    #[tokio::test]
    async fn test_player_identity_lookup() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/userinfo")
            .match_header("authorization", "Bearer tok-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"sub":"puuid-abc","acct":{"game_name":"Steel","tag_line":"KR1"}}"#,
            )
            .create_async()
            .await;

        let identity = client_for(&server).player_identity("tok-123").await.unwrap();

        assert_eq!(identity.puuid, "puuid-abc");
        assert_eq!(identity.riot_id, "Steel#KR1");
    }

    #[tokio::test]
    async fn test_malformed_entitlements_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/v1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"unexpected":"shape"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .entitlement_from_access_token("tok-123")
            .await
            .unwrap_err();

        assert!(matches!(err, RiotError::Malformed(_)));
    }
}
