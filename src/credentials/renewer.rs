use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{ConnectionTemplate, Credential, CredentialBroker, LeaseEvent, renew_credential};
use crate::error::StoreError;

/// Anything whose live connection can be rebuilt from a new URL
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self, url: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// `run` has not started yet
    Idle,
    Active { expires_at: DateTime<Utc> },
    /// Rotating to a new credential, `attempt` counts from 1
    Renewing { attempt: u32 },
    /// Every rotation attempt failed
    Expired,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalInput {
    Lease(LeaseEvent),
    Rotated { expires_at: DateTime<Utc> },
    RotationFailed(String),
    Cancelled,
}

/// Next renewal state. Terminal states absorb every input.
pub fn transition(state: &RenewalState, input: &RenewalInput, max_attempts: u32) -> RenewalState {
    match (state, input) {
        (RenewalState::Expired | RenewalState::Stopped, _) => *state,
        (_, RenewalInput::Cancelled) => RenewalState::Stopped,

        (RenewalState::Active { .. }, RenewalInput::Lease(LeaseEvent::Renewed { expires_at })) => {
            RenewalState::Active {
                expires_at: *expires_at,
            }
        }
        (
            RenewalState::Active { .. },
            RenewalInput::Lease(LeaseEvent::Expiring | LeaseEvent::Failed(_)),
        ) => RenewalState::Renewing { attempt: 1 },

        (RenewalState::Renewing { .. }, RenewalInput::Rotated { expires_at }) => {
            RenewalState::Active {
                expires_at: *expires_at,
            }
        }
        (RenewalState::Renewing { attempt }, RenewalInput::RotationFailed(_)) => {
            if *attempt >= max_attempts {
                RenewalState::Expired
            } else {
                RenewalState::Renewing {
                    attempt: attempt + 1,
                }
            }
        }

        _ => *state,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// Pause between lease checks while the credential is healthy
    pub check_interval: Duration,
    /// Upper bound on a single lease check
    pub check_timeout: Duration,
    /// Rotation attempts before giving up
    pub attempts: u32,
    /// Pause between failed rotation attempts
    pub retry_delay: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Watches the lease of the credential a backend connects with and swaps
/// the backend onto a fresh credential before the old one lapses.
pub struct CredentialRenewer {
    broker: Arc<dyn CredentialBroker>,
    target: Arc<dyn Reconnect>,
    template: ConnectionTemplate,
    policy: RenewalPolicy,
    state: watch::Sender<RenewalState>,
}

impl CredentialRenewer {
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        target: Arc<dyn Reconnect>,
        template: ConnectionTemplate,
        policy: RenewalPolicy,
    ) -> Self {
        let (state, _) = watch::channel(RenewalState::Idle);
        Self {
            broker,
            target,
            template,
            policy,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RenewalState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RenewalState {
        *self.state.borrow()
    }

    /// Log in, point the target at the first credential, then keep it
    /// renewed until shutdown.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let credential = self
            .broker
            .login()
            .await
            .map_err(|e| e.context("initial credential login"))?;
        if credential.expires_at() <= Utc::now() {
            return Err(StoreError::connection(format!(
                "broker issued lease {} that expired at {}",
                credential.lease.lease_id,
                credential.expires_at()
            )));
        }

        self.target
            .reconnect(&self.template.render(&credential))
            .await
            .map_err(|e| e.context("initial reconnect"))?;
        info!(
            username = %credential.username,
            lease_id = %credential.lease.lease_id,
            "Connected with leased credential"
        );

        self.run(credential, shutdown).await
    }

    /// Drive the renewal loop until shutdown or until rotation is exhausted,
    /// in which case `FatalCredential` is returned.
    pub async fn run(
        &self,
        initial: Credential,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut credential = initial;
        let mut state = if *shutdown.borrow() {
            RenewalState::Stopped
        } else {
            RenewalState::Active {
                expires_at: credential.expires_at(),
            }
        };
        self.state.send_replace(state);
        info!(
            username = %credential.username,
            lease_id = %credential.lease.lease_id,
            expires_at = %credential.expires_at(),
            "Credential renewer started"
        );

        loop {
            let input = match state {
                RenewalState::Active { .. } => {
                    let input = tokio::select! {
                        _ = shutdown.changed() => RenewalInput::Cancelled,
                        event = self.check_lease(&credential) => RenewalInput::Lease(event),
                    };
                    if let RenewalInput::Lease(LeaseEvent::Renewed { expires_at }) = &input {
                        credential.lease.extend_to(*expires_at);
                    }
                    input
                }
                RenewalState::Renewing { attempt } => {
                    let outcome = tokio::select! {
                        _ = shutdown.changed() => None,
                        outcome = self.rotate(attempt, &credential) => Some(outcome),
                    };
                    match outcome {
                        None => RenewalInput::Cancelled,
                        Some(Ok(fresh)) => {
                            let expires_at = fresh.expires_at();
                            info!(
                                attempt,
                                username = %fresh.username,
                                lease_id = %fresh.lease.lease_id,
                                expires_at = %expires_at,
                                "Credential rotated"
                            );
                            credential = fresh;
                            RenewalInput::Rotated { expires_at }
                        }
                        Some(Err(e)) => {
                            warn!(
                                attempt,
                                max_attempts = self.policy.attempts,
                                error = %e,
                                "Credential rotation attempt failed"
                            );
                            RenewalInput::RotationFailed(e.to_string())
                        }
                    }
                }
                RenewalState::Expired => {
                    error!(
                        attempts = self.policy.attempts,
                        lease_id = %credential.lease.lease_id,
                        "Credential rotation exhausted"
                    );
                    return Err(StoreError::FatalCredential(format!(
                        "lease {} could not be replaced after {} attempts",
                        credential.lease.lease_id, self.policy.attempts
                    )));
                }
                RenewalState::Stopped | RenewalState::Idle => {
                    info!("Credential renewer stopped");
                    return Ok(());
                }
            };

            let next = transition(&state, &input, self.policy.attempts);
            if next != state {
                debug!(from = ?state, to = ?next, "Renewal state changed");
            }
            state = next;
            self.state.send_replace(state);
        }
    }

    /// Run [`start`](Self::start) in the background. A failed first login or
    /// exhausted rotation terminates the process with a non-zero status.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.start(shutdown).await {
                error!(error = %e, "Database credentials expired, exiting");
                std::process::exit(1);
            }
        })
    }

    async fn check_lease(&self, credential: &Credential) -> LeaseEvent {
        sleep(self.policy.check_interval).await;
        match timeout(self.policy.check_timeout, self.broker.watch_lease(credential)).await {
            Ok(event) => {
                debug!(lease_id = %credential.lease.lease_id, event = ?event, "Lease checked");
                event
            }
            Err(_) => LeaseEvent::Failed(format!(
                "lease check exceeded {:?}",
                self.policy.check_timeout
            )),
        }
    }

    async fn rotate(&self, attempt: u32, current: &Credential) -> Result<Credential, StoreError> {
        if attempt > 1 {
            sleep(self.policy.retry_delay).await;
        }
        let fresh = renew_credential(self.broker.as_ref(), current).await?;
        self.target.reconnect(&self.template.render(&fresh)).await?;
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::lease;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBroker {
        events: Mutex<VecDeque<LeaseEvent>>,
        logins: Mutex<VecDeque<Result<Credential, StoreError>>>,
    }

    impl ScriptedBroker {
        fn new(events: Vec<LeaseEvent>, logins: Vec<Result<Credential, StoreError>>) -> Self {
            Self {
                events: Mutex::new(events.into()),
                logins: Mutex::new(logins.into()),
            }
        }
    }

    #[async_trait]
    impl CredentialBroker for ScriptedBroker {
        async fn login(&self) -> Result<Credential, StoreError> {
            self.logins
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(StoreError::connection("broker unavailable")))
        }

        async fn watch_lease(&self, credential: &Credential) -> LeaseEvent {
            self.events
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(LeaseEvent::Renewed {
                    expires_at: credential.expires_at(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingTarget {
        urls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Reconnect for RecordingTarget {
        async fn reconnect(&self, url: &str) -> Result<(), StoreError> {
            self.urls.lock().unwrap().push(url.to_string());
            if self.fail {
                Err(StoreError::connection("replacement unreachable"))
            } else {
                Ok(())
            }
        }
    }

    fn policy() -> RenewalPolicy {
        RenewalPolicy {
            check_interval: Duration::from_secs(1),
            check_timeout: Duration::from_secs(1),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    fn template() -> ConnectionTemplate {
        ConnectionTemplate::new("mysql://{username}:{password}@db/reports").unwrap()
    }

    fn credential(user: &str, lease_id: &str, secs: u64) -> Credential {
        Credential::new(user, "secret", lease(lease_id, Utc::now(), secs))
    }

    #[test]
    fn test_transition_table() {
        let expires_at = Utc::now();
        let active = RenewalState::Active { expires_at };

        assert_eq!(
            transition(&active, &RenewalInput::Lease(LeaseEvent::Expiring), 3),
            RenewalState::Renewing { attempt: 1 }
        );
        assert_eq!(
            transition(&active, &RenewalInput::Lease(LeaseEvent::Failed("x".into())), 3),
            RenewalState::Renewing { attempt: 1 }
        );
        assert_eq!(
            transition(
                &RenewalState::Renewing { attempt: 2 },
                &RenewalInput::RotationFailed("x".into()),
                3
            ),
            RenewalState::Renewing { attempt: 3 }
        );
        assert_eq!(
            transition(
                &RenewalState::Renewing { attempt: 3 },
                &RenewalInput::RotationFailed("x".into()),
                3
            ),
            RenewalState::Expired
        );
        assert_eq!(
            transition(
                &RenewalState::Renewing { attempt: 1 },
                &RenewalInput::Rotated { expires_at },
                3
            ),
            active
        );
        assert_eq!(
            transition(&active, &RenewalInput::Cancelled, 3),
            RenewalState::Stopped
        );
        assert_eq!(
            transition(&RenewalState::Expired, &RenewalInput::Cancelled, 3),
            RenewalState::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_logs_in_and_connects_first() {
        let broker = Arc::new(ScriptedBroker::new(
            Vec::new(),
            vec![Ok(credential("app-1", "l1", 3600))],
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target.clone(),
            template(),
            policy(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.start(shutdown_rx).await });

        states
            .wait_for(|s| matches!(s, RenewalState::Active { .. }))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(
            *target.urls.lock().unwrap(),
            vec!["mysql://app-1:secret@db/reports".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_without_initial_credential() {
        let broker = Arc::new(ScriptedBroker::new(
            Vec::new(),
            vec![Err(StoreError::connection("login refused"))],
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = CredentialRenewer::new(broker, target.clone(), template(), policy());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = renewer.start(shutdown_rx).await.unwrap_err();

        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(renewer.state(), RenewalState::Idle);
        assert!(target.urls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_raises_rotation_bar() {
        let initial = credential("app", "l1", 60);
        let extended = initial.expires_at() + chrono::Duration::hours(1);
        // Same lease id, longer than the original 60s but shorter than the renewal
        let stale = Credential::new("app", "secret", lease("l1", Utc::now(), 1800));
        let fresh = credential("app-2", "l2", 7200);
        let fresh_expiry = fresh.expires_at();
        let broker = Arc::new(ScriptedBroker::new(
            vec![
                LeaseEvent::Renewed {
                    expires_at: extended,
                },
                LeaseEvent::Expiring,
            ],
            vec![Ok(stale), Ok(fresh)],
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target.clone(),
            template(),
            policy(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.run(initial, shutdown_rx).await });

        states
            .wait_for(|s| *s == RenewalState::Active { expires_at: fresh_expiry })
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(
            *target.urls.lock().unwrap(),
            vec!["mysql://app-2:secret@db/reports".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_stays_active_until_shutdown() {
        let initial = credential("app", "l1", 60);
        let extended = initial.expires_at() + chrono::Duration::hours(1);
        let broker = Arc::new(ScriptedBroker::new(
            vec![LeaseEvent::Renewed {
                expires_at: extended,
            }],
            Vec::new(),
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target.clone(),
            template(),
            policy(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.run(initial, shutdown_rx).await });

        states
            .wait_for(|s| *s == RenewalState::Active { expires_at: extended })
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(renewer.state(), RenewalState::Stopped);
        assert!(target.urls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_lease_rotates_and_reconnects() {
        let initial = credential("app", "l1", 60);
        let fresh = Credential::new("app-2", "n3w", lease("l2", Utc::now(), 3600));
        let fresh_expiry = fresh.expires_at();
        let broker = Arc::new(ScriptedBroker::new(
            vec![LeaseEvent::Expiring],
            vec![Ok(fresh)],
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target.clone(),
            template(),
            policy(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.run(initial, shutdown_rx).await });

        states
            .wait_for(|s| *s == RenewalState::Active { expires_at: fresh_expiry })
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(
            *target.urls.lock().unwrap(),
            vec!["mysql://app-2:n3w@db/reports".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failed_attempt() {
        let initial = credential("app", "l1", 60);
        let fresh = credential("app-2", "l2", 3600);
        let broker = Arc::new(ScriptedBroker::new(
            vec![LeaseEvent::Failed("broker timeout".into())],
            vec![Err(StoreError::connection("login refused")), Ok(fresh)],
        ));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target.clone(),
            template(),
            policy(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.run(initial, shutdown_rx).await });

        states
            .wait_for(|s| *s == RenewalState::Renewing { attempt: 2 })
            .await
            .unwrap();
        states
            .wait_for(|s| matches!(s, RenewalState::Active { .. }))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(target.urls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rotation_is_fatal() {
        let initial = credential("app", "l1", 60);
        let broker = Arc::new(ScriptedBroker::new(
            vec![LeaseEvent::Expiring],
            vec![
                Ok(credential("app-2", "l2", 3600)),
                Ok(credential("app-3", "l3", 3600)),
                Ok(credential("app-4", "l4", 3600)),
            ],
        ));
        let target = Arc::new(RecordingTarget {
            urls: Mutex::new(Vec::new()),
            fail: true,
        });
        let renewer = CredentialRenewer::new(broker, target.clone(), template(), policy());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = renewer.run(initial, shutdown_rx).await.unwrap_err();

        assert!(matches!(err, StoreError::FatalCredential(_)));
        assert_eq!(renewer.state(), RenewalState::Expired);
        assert_eq!(target.urls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_rotation_stops_cleanly() {
        let initial = credential("app", "l1", 60);
        let broker = Arc::new(ScriptedBroker::new(vec![LeaseEvent::Expiring], Vec::new()));
        let target = Arc::new(RecordingTarget::default());
        let renewer = Arc::new(CredentialRenewer::new(
            broker,
            target,
            template(),
            RenewalPolicy {
                retry_delay: Duration::from_secs(3600),
                ..policy()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut states = renewer.subscribe();
        let running = Arc::clone(&renewer);
        let handle = tokio::spawn(async move { running.run(initial, shutdown_rx).await });

        states
            .wait_for(|s| *s == RenewalState::Renewing { attempt: 2 })
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(renewer.state(), RenewalState::Stopped);
    }
}
