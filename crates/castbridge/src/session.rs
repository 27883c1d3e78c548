//! Process-wide registry of upstream accounts and their sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::provider::UpstreamProvider;
use crate::{BridgeError, SessionConfig};

/// Login details for one upstream account
#[derive(Clone)]
pub struct Credentials {
    /// Local name the account is registered under
    pub account: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        account: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated upstream session, shared read-only by channels
pub struct Session {
    pub account: String,
    /// Upstream session id
    pub token: String,
    /// Login-derived key protecting stream tokens
    pub secret: Vec<u8>,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl Session {
    /// Usable for at least `margin` more
    pub fn is_valid_at(&self, now: Instant, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

struct AccountSlot {
    credentials: Credentials,
    /// Held across a login so concurrent callers wait for one refresh
    current: tokio::sync::Mutex<Option<Arc<Session>>>,
}

pub struct SessionStore {
    provider: Arc<dyn UpstreamProvider>,
    config: SessionConfig,
    accounts: Mutex<HashMap<String, Arc<AccountSlot>>>,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn UpstreamProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Register or replace the credentials of an account
    pub fn register(&self, credentials: Credentials) {
        info!(account = %credentials.account, username = %credentials.username, "Registered upstream account");
        let slot = Arc::new(AccountSlot {
            credentials: credentials.clone(),
            current: tokio::sync::Mutex::new(None),
        });
        self.accounts.lock().insert(credentials.account, slot);
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.accounts.lock().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    fn slot(&self, account: &str) -> Result<Arc<AccountSlot>, BridgeError> {
        self.accounts
            .lock()
            .get(account)
            .cloned()
            .ok_or_else(|| BridgeError::Auth(format!("No credentials registered for {account}")))
    }

    /// Return a session valid beyond the refresh margin, logging in when the
    /// cached one is missing or about to expire
    pub async fn acquire(&self, account: &str) -> Result<Arc<Session>, BridgeError> {
        let slot = self.slot(account)?;
        let mut current = slot.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.is_valid_at(Instant::now(), self.config.refresh_margin) {
                return Ok(Arc::clone(session));
            }
            debug!(account, "Session expiring, refreshing");
        }

        let session = Arc::new(self.login(&slot.credentials).await?);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop `session` if it is still the current one for `account`.
    ///
    /// Returns whether anything was dropped; a later `acquire` logs in again.
    pub async fn invalidate(&self, account: &str, session: &Arc<Session>) -> bool {
        let Ok(slot) = self.slot(account) else {
            return false;
        };
        let mut current = slot.current.lock().await;
        match current.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, session) => {
                warn!(account, "Upstream rejected session, dropping it");
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Forget every account and session
    pub fn shutdown(&self) {
        let count = {
            let mut accounts = self.accounts.lock();
            let count = accounts.len();
            accounts.clear();
            count
        };
        debug!(accounts = count, "Session store cleared");
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session, BridgeError> {
        let mut attempts = 0;
        loop {
            match self.provider.authenticate(credentials).await {
                Ok(grant) => {
                    let issued_at = Instant::now();
                    let lifetime = grant.expires_in.unwrap_or(self.config.session_ttl);
                    info!(
                        account = %credentials.account,
                        lifetime_secs = lifetime.as_secs(),
                        "Logged in to upstream"
                    );
                    return Ok(Session {
                        account: credentials.account.clone(),
                        token: grant.token,
                        secret: grant.secret,
                        issued_at,
                        expires_at: issued_at + lifetime,
                    });
                }
                Err(e @ BridgeError::CredentialsRejected(_)) => {
                    warn!(account = %credentials.account, "Credentials rejected: {e}");
                    return Err(e);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.max_auth_retries {
                        return Err(BridgeError::Auth(format!(
                            "Login for {} failed after {attempts} attempts: {e}",
                            credentials.account
                        )));
                    }
                    let delay = self.config.auth_retry_delay_base * 2_u32.pow(attempts - 1);
                    warn!(
                        account = %credentials.account,
                        attempt = attempts,
                        ?delay,
                        "Login failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
