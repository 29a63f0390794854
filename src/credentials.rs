//! Leased database credentials and their rotation

mod renewer;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use renewer::{
    CredentialRenewer, Reconnect, RenewalInput, RenewalPolicy, RenewalState, transition,
};

use crate::error::StoreError;

/// Lease attached to a dynamic credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: String,
    pub issued_at: DateTime<Utc>,
    pub duration: Duration,
    pub renewable: bool,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.issued_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Move the expiry after the broker renewed the lease in place
    pub fn extend_to(&mut self, expires_at: DateTime<Utc>) {
        self.duration = (expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
    }
}

/// Username and secret issued by a broker
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    secret: String,
    pub lease: Lease,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>, lease: Lease) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            lease,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lease.expires_at()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("lease", &self.lease)
            .finish()
    }
}

/// What a broker reports about a lease it is watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// The lease was extended in place
    Renewed { expires_at: DateTime<Utc> },
    /// The lease can no longer be extended and a new credential is needed
    Expiring,
    /// The broker could not be reached or answered with an error
    Failed(String),
}

/// External issuer of leased credentials
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn login(&self) -> Result<Credential, StoreError>;

    async fn watch_lease(&self, credential: &Credential) -> LeaseEvent;
}

/// Connection URL with `{username}` and `{password}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTemplate(String);

impl ConnectionTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, StoreError> {
        let template = template.into();
        if !template.contains("{username}") || !template.contains("{password}") {
            return Err(StoreError::validation(
                "connection template must contain {username} and {password}",
            ));
        }
        Ok(Self(template))
    }

    /// Substitute URL-encoded credentials
    pub fn render(&self, credential: &Credential) -> String {
        self.0
            .replace("{username}", &urlencoding::encode(&credential.username))
            .replace("{password}", &urlencoding::encode(credential.secret()))
    }
}

/// Obtain a fresh credential to replace `current`.
///
/// Fails when the broker is unavailable or hands back a lease that is
/// already expired.
pub async fn renew_credential(
    broker: &dyn CredentialBroker,
    current: &Credential,
) -> Result<Credential, StoreError> {
    let fresh = broker
        .login()
        .await
        .map_err(|e| e.context("credential login"))?;

    let now = Utc::now();
    if fresh.expires_at() <= now {
        return Err(StoreError::connection(format!(
            "broker issued lease {} that expired at {}",
            fresh.lease.lease_id,
            fresh.expires_at()
        )));
    }
    if fresh.lease.lease_id == current.lease.lease_id && fresh.expires_at() <= current.expires_at()
    {
        return Err(StoreError::connection(format!(
            "broker returned the expiring lease {} again",
            current.lease.lease_id
        )));
    }
    Ok(fresh)
}
