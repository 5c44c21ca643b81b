//! Webhook link event processing.
//!
//! The browser extension completes a Riot login out of band and posts the
//! captured credential back through a channel anyone can write to. This
//! module proves the event is genuine, binds it to the user that asked for
//! it, runs the credential exchange, and upserts the linked account:
//!
//! 1. Verify the detached HMAC over the literal payload bytes
//! 2. Parse the payload; pick the credential form (tagged, never implicit)
//! 3. Consume the one-time state token → requesting user
//! 4. Exchange the credential for (access, entitlement) tokens
//! 5. Look up the player identity behind the access token
//! 6. Encrypt the secret, upsert the account, notify the requester
//!
//! Forged, stale, replayed, and incomplete events are dropped without any
//! user-visible effect — a prober learns nothing about which state tokens
//! exist. Only storage faults surface as errors.

pub mod signature;

use crate::credentials::{self, SecretBox};
use crate::riot::{IdentityProvider, PlayerIdentity, RiotError, SessionTokens};
use crate::store::{LinkStore, NewLinkedAccount};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Regional routing key assigned to fresh links.
const DEFAULT_SHARD: &str = "ap";

/// Wire shape of a link event payload.
#[derive(Deserialize)]
struct LinkEventPayload {
    state_token: String,
    #[serde(default)]
    cookies_str: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    flow: Option<String>,
}

/// Which credential form the extension delivered.
///
/// Explicit variants instead of presence-based branching: an event with
/// neither field is rejected once, at conversion time.
#[derive(Clone, Debug)]
pub enum CredentialSource {
    /// Full session cookie string; enables silent re-authentication later
    SessionCookies(String),
    /// Bearer token only; the account will need a re-link for refreshes
    AccessToken(String),
}

impl LinkEventPayload {
    fn credential(&self) -> Option<CredentialSource> {
        if let Some(cookies) = self.cookies_str.as_deref().filter(|c| !c.is_empty()) {
            return Some(CredentialSource::SessionCookies(cookies.to_string()));
        }
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            return Some(CredentialSource::AccessToken(token.to_string()));
        }
        None
    }
}

/// Out-of-band notification channel back to the requester.
///
/// The chat-platform surface implements this; the handshake never formats
/// platform-specific messages itself.
#[async_trait]
pub trait LinkNotifier: Send + Sync {
    async fn link_succeeded(&self, requester_id: i64, riot_id: &str);
    async fn link_failed(&self, requester_id: i64, reason: &str);
}

/// Notifier that only logs. Stands in until a chat transport is wired up.
pub struct LogNotifier;

#[async_trait]
impl LinkNotifier for LogNotifier {
    async fn link_succeeded(&self, requester_id: i64, riot_id: &str) {
        info!(requester_id, riot_id, "Link succeeded");
    }

    async fn link_failed(&self, requester_id: i64, reason: &str) {
        info!(requester_id, reason, "Link failed");
    }
}

/// What became of a processed event.
#[derive(Debug, PartialEq)]
pub enum HandshakeOutcome {
    /// Forged, stale, replayed, or incomplete; absorbed silently
    Dropped,
    /// Challenge resolved but the provider refused the credential;
    /// the requester was told to retry the link flow
    AuthFailed,
    /// Account created or refreshed
    Linked { account_id: i64, riot_id: String },
}

/// Consumes inbound link events and drives the credential exchange.
pub struct HandshakeReceiver {
    store: Arc<LinkStore>,
    secrets: SecretBox,
    provider: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn LinkNotifier>,
    hmac_secret: String,
}

impl HandshakeReceiver {
    pub fn new(
        store: Arc<LinkStore>,
        secrets: SecretBox,
        provider: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn LinkNotifier>,
        hmac_secret: String,
    ) -> Self {
        Self {
            store,
            secrets,
            provider,
            notifier,
            hmac_secret,
        }
    }

    /// Process one inbound event: payload bytes exactly as delivered plus
    /// the detached base64 signature.
    ///
    /// Errors are storage or encryption faults only; every authentication
    /// outcome, including forgery, maps to a [`HandshakeOutcome`].
    pub async fn process_event(
        &self,
        payload: &[u8],
        signature_b64: &str,
    ) -> Result<HandshakeOutcome> {
        if !signature::verify(payload, signature_b64, &self.hmac_secret) {
            warn!("Dropping link event: bad signature");
            return Ok(HandshakeOutcome::Dropped);
        }

        let event: LinkEventPayload = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping link event: unparseable payload");
                return Ok(HandshakeOutcome::Dropped);
            }
        };

        debug!(flow = event.flow.as_deref().unwrap_or("unspecified"), "Link event verified");

        let Some(credential) = event.credential() else {
            warn!("Dropping link event: no credential in payload");
            return Ok(HandshakeOutcome::Dropped);
        };

        let Some(requester_id) = self
            .store
            .consume_challenge(&event.state_token)
            .context("Failed to resolve state token")?
        else {
            warn!("Dropping link event: unknown or expired state token");
            return Ok(HandshakeOutcome::Dropped);
        };

        let (tokens, identity) = match self.exchange(&credential).await {
            Ok(pair) => pair,
            Err(e) => {
                // Not retried here: the user restarts from challenge issuance
                warn!(requester_id, error = %e, "Credential exchange failed");
                self.notifier
                    .link_failed(requester_id, "authentication failed, retry linking")
                    .await;
                return Ok(HandshakeOutcome::AuthFailed);
            }
        };

        let raw_secret = match &credential {
            CredentialSource::SessionCookies(cookies) => cookies.clone(),
            CredentialSource::AccessToken(_) => credentials::placeholder_secret(requester_id),
        };
        let encrypted_secret = self
            .secrets
            .encrypt(&raw_secret)
            .context("Failed to encrypt secret")?;

        let account = self
            .store
            .upsert_account(&NewLinkedAccount {
                requester_id,
                nickname: identity.riot_id.clone(),
                riot_id: identity.riot_id.clone(),
                encrypted_secret,
                access_token: tokens.access_token,
                entitlement_token: tokens.entitlement_token,
                puuid: identity.puuid.clone(),
                shard: DEFAULT_SHARD.to_string(),
            })
            .context("Failed to upsert linked account")?;

        info!(
            requester_id,
            account_id = account.id,
            riot_id = %identity.riot_id,
            "Handshake completed"
        );
        self.notifier
            .link_succeeded(requester_id, &identity.riot_id)
            .await;

        Ok(HandshakeOutcome::Linked {
            account_id: account.id,
            riot_id: identity.riot_id,
        })
    }

    async fn exchange(
        &self,
        credential: &CredentialSource,
    ) -> Result<(SessionTokens, PlayerIdentity), RiotError> {
        let tokens = match credential {
            CredentialSource::SessionCookies(cookies) => {
                self.provider.tokens_from_cookies(cookies).await?
            }
            CredentialSource::AccessToken(token) => {
                let entitlement_token =
                    self.provider.entitlement_from_access_token(token).await?;
                SessionTokens {
                    access_token: token.clone(),
                    entitlement_token,
                }
            }
        };

        let identity = self.provider.player_identity(&tokens.access_token).await?;
        Ok((tokens, identity))
    }
}
