//! Re-authentication wrapper around authenticated data fetches.
//!
//! Bearer tokens expire; the stored session cookie usually still works.
//! [`SessionManager::with_authenticated_account`] runs a fetch and, when
//! the provider rejects the tokens, performs exactly one recovery cycle:
//! decrypt the cookie, exchange it for fresh tokens, persist them, retry
//! the fetch once. A second failure is terminal — unbounded retries
//! against the identity provider risk rate limiting or lockout, and one
//! attempt covers the common case of a naturally expired token.

use crate::credentials::{self, SecretBox};
use crate::riot::{IdentityProvider, RiotError};
use crate::store::{LinkStore, LinkedAccount};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Terminal outcomes of an authenticated fetch.
#[derive(Debug)]
pub enum SessionError {
    /// The account id resolves to nothing
    AccountMissing,
    /// Recovery is impossible without the user re-running the link flow:
    /// unreadable or placeholder secret, rejected re-authentication, or a
    /// fetch still failing after fresh tokens
    RelinkRequired(String),
    /// Upstream or transport trouble re-authentication cannot cure;
    /// propagated unchanged so callers can back off and retry later
    Fetch(RiotError),
    /// Storage fault
    Storage(anyhow::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AccountMissing => write!(f, "account missing"),
            SessionError::RelinkRequired(reason) => {
                write!(f, "account needs re-linking: {}", reason)
            }
            SessionError::Fetch(e) => write!(f, "fetch failed: {}", e),
            SessionError::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Wraps fetches in the retry-once-after-reauthentication policy.
pub struct SessionManager {
    store: Arc<LinkStore>,
    secrets: SecretBox,
    provider: Arc<dyn IdentityProvider>,
}

impl SessionManager {
    pub fn new(
        store: Arc<LinkStore>,
        secrets: SecretBox,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            store,
            secrets,
            provider,
        }
    }

    /// Run `op` against a live account, recovering once from token expiry.
    ///
    /// `op` receives the account row (tokens included) and reports upstream
    /// failures as [`RiotError`]; only an authentication rejection triggers
    /// the recovery cycle.
    pub async fn with_authenticated_account<T, F, Fut>(
        &self,
        account_id: i64,
        op: F,
    ) -> Result<T, SessionError>
    where
        F: Fn(LinkedAccount) -> Fut,
        Fut: Future<Output = Result<T, RiotError>>,
    {
        let account = self
            .store
            .get_account(account_id)
            .map_err(SessionError::Storage)?
            .ok_or(SessionError::AccountMissing)?;

        let first_error = match op(account.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_auth_rejection() => e,
            Err(e) => return Err(SessionError::Fetch(e)),
        };

        warn!(
            account_id,
            error = %first_error,
            "Fetch rejected, attempting re-authentication"
        );

        let refreshed = self.reauthenticate(&account).await?;

        info!(account_id, "Re-authentication succeeded, retrying fetch");

        match op(refreshed).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_auth_rejection() => Err(SessionError::RelinkRequired(
                "fetch rejected even with fresh tokens".to_string(),
            )),
            Err(e) => Err(SessionError::Fetch(e)),
        }
    }

    /// One recovery cycle: decrypt the cookie, exchange, persist.
    ///
    /// Two operations racing on the same expired account may both land
    /// here; that is tolerated (last writer wins, an extra upstream call,
    /// no other side effect).
    async fn reauthenticate(&self, account: &LinkedAccount) -> Result<LinkedAccount, SessionError> {
        let secret = self
            .secrets
            .decrypt(&account.encrypted_secret)
            .map_err(|e| SessionError::RelinkRequired(format!("stored secret unreadable: {}", e)))?;

        if credentials::is_placeholder(&secret) {
            return Err(SessionError::RelinkRequired(
                "account was linked without a session cookie".to_string(),
            ));
        }

        let tokens = self
            .provider
            .tokens_from_cookies(&secret)
            .await
            .map_err(|e| {
                if e.is_auth_rejection() {
                    SessionError::RelinkRequired(format!("session cookie no longer valid: {}", e))
                } else {
                    SessionError::Fetch(e)
                }
            })?;

        self.store
            .refresh_tokens(account.id, &tokens.access_token, &tokens.entitlement_token)
            .map_err(SessionError::Storage)?
            // Unlinked between the fetch and the refresh
            .ok_or(SessionError::AccountMissing)
    }
}
