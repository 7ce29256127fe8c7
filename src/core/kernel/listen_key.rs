use crate::core::errors::ExchangeError;
use crate::core::kernel::task::ScheduledTask;
use crate::core::types::StreamKind;
use async_trait::async_trait;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{error, info, warn};

/// Exchange-mandated keep-alive cadence; keys expire after 60 minutes without one.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Keys are invalidated 24 hours after creation regardless of keep-alives.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(23 * 60 * 60);

/// Listen-key lifecycle endpoints
#[async_trait]
pub trait ListenKeyApi: Send + Sync + 'static {
    /// Create a listen key (POST)
    async fn acquire(&self, kind: StreamKind) -> Result<String, ExchangeError>;

    /// Extend the validity of `key` (PUT)
    async fn keepalive(&self, kind: StreamKind, key: &str) -> Result<(), ExchangeError>;

    /// Invalidate `key` (DELETE)
    async fn release(&self, kind: StreamKind, key: &str) -> Result<(), ExchangeError>;
}

/// What to do once consecutive keep-alive failures exceed the retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalExhaustedAction {
    /// Acquire a fresh key and swap it in
    Regenerate,
    /// Give up and terminate the session
    Stop,
}

/// What the hard lifetime rotation does to the dependent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Swap in a new key and reopen the socket with it
    Reconnect,
    /// Swap in a new key; the socket keeps running until its next reconnect
    PrefetchOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenKeyPolicy {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub renew_interval: Duration,
    pub max_lifetime: Duration,
    pub on_renewal_exhausted: RenewalExhaustedAction,
    pub rotation: RotationPolicy,
}

impl Default for ListenKeyPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval: Duration::ZERO,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            on_renewal_exhausted: RenewalExhaustedAction::Regenerate,
            rotation: RotationPolicy::Reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKeyState {
    Uninitialized,
    Acquiring,
    Active,
    Renewing,
    Regenerating,
    Terminated,
}

/// Point-in-time view of the manager, published atomically on every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenKeySnapshot {
    pub state: ListenKeyState,
    pub key: Option<String>,
    pub renew_failures: u32,
}

/// Notifications for the connection that depends on the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Renewed,
    Regenerated { key: String },
    Rotated { key: String, reconnect: bool },
    Terminated { reason: String },
}

fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

struct Shared<A: ListenKeyApi> {
    api: Arc<A>,
    kind: StreamKind,
    policy: ListenKeyPolicy,
    snapshot: watch::Sender<ListenKeySnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl<A: ListenKeyApi> Shared<A> {
    fn current_key(&self) -> Option<String> {
        self.snapshot.borrow().key.clone()
    }

    fn set_state(&self, state: ListenKeyState) {
        self.snapshot.send_modify(|snapshot| snapshot.state = state);
    }

    fn publish_key(&self, key: String) {
        self.snapshot.send_replace(ListenKeySnapshot {
            state: ListenKeyState::Active,
            key: Some(key),
            renew_failures: 0,
        });
    }

    fn notify(&self, event: SessionEvent) {
        // No subscriber simply means no connection is attached yet.
        let _ = self.events.send(event);
    }

    /// POST for a new key, retrying with a fixed delay up to the policy budget
    async fn acquire(&self) -> Result<String, ExchangeError> {
        self.set_state(ListenKeyState::Acquiring);

        let kind = self.kind;
        let max_retries = self.policy.max_retries;
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let api = &self.api;

        let strategy = FixedInterval::new(self.policy.retry_interval).take(max_retries as usize);
        let result = Retry::spawn(strategy, move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            match api.acquire(kind).await {
                Ok(key) => Ok(key),
                Err(e) => {
                    error!(kind = %kind, attempt, "Error generating listen key: {}", e);
                    if attempt <= max_retries {
                        info!(
                            "Retrying {} listen key generation ({}/{})...",
                            kind, attempt, max_retries
                        );
                    }
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(key) => {
                info!(kind = %kind, key = short_key(&key), "Listen key generated");
                self.publish_key(key.clone());
                Ok(key)
            }
            Err(last) => {
                let attempts = attempts.load(Ordering::SeqCst);
                error!(kind = %kind, attempts, "Listen key generation exhausted: {}", last);
                Err(ExchangeError::TokenAcquisitionExhausted { kind, attempts })
            }
        }
    }

    fn terminate(&self, reason: String) {
        error!(kind = %self.kind, "Listen key session terminated: {}", reason);
        self.snapshot.send_replace(ListenKeySnapshot {
            state: ListenKeyState::Terminated,
            key: None,
            renew_failures: 0,
        });
        self.notify(SessionEvent::Terminated { reason });
    }

    async fn regenerate(&self) -> ControlFlow<()> {
        info!(kind = %self.kind, "Regenerating listen key...");
        self.set_state(ListenKeyState::Regenerating);
        match self.acquire().await {
            Ok(key) => {
                self.notify(SessionEvent::Regenerated { key });
                ControlFlow::Continue(())
            }
            Err(e) => {
                self.terminate(format!("Failed to regenerate listen key: {}", e));
                ControlFlow::Break(())
            }
        }
    }

    async fn renew(&self, failures: &mut u32) -> ControlFlow<()> {
        let Some(key) = self.current_key() else {
            return self.regenerate().await;
        };

        self.set_state(ListenKeyState::Renewing);
        match self.api.keepalive(self.kind, &key).await {
            Ok(()) => {
                *failures = 0;
                self.snapshot.send_modify(|snapshot| {
                    snapshot.state = ListenKeyState::Active;
                    snapshot.renew_failures = 0;
                });
                info!(kind = %self.kind, key = short_key(&key), "Listen key renewed");
                self.notify(SessionEvent::Renewed);
                ControlFlow::Continue(())
            }
            Err(e) => {
                error!(kind = %self.kind, "Error renewing listen key: {}", e);
                let exhausted = *failures >= self.policy.max_retries;

                if e.is_invalid_listen_key()
                    || (exhausted
                        && self.policy.on_renewal_exhausted == RenewalExhaustedAction::Regenerate)
                {
                    *failures = 0;
                    self.regenerate().await
                } else if exhausted {
                    self.terminate(format!(
                        "Listen key renewal failed {} times",
                        *failures + 1
                    ));
                    ControlFlow::Break(())
                } else {
                    *failures += 1;
                    let count = *failures;
                    self.snapshot.send_modify(|snapshot| {
                        snapshot.state = ListenKeyState::Active;
                        snapshot.renew_failures = count;
                    });
                    info!(
                        "Retrying {} listen key renewal ({}/{})...",
                        self.kind, count, self.policy.max_retries
                    );
                    ControlFlow::Continue(())
                }
            }
        }
    }

    async fn rotate(&self) -> ControlFlow<()> {
        let reconnect = self.policy.rotation == RotationPolicy::Reconnect;
        info!(kind = %self.kind, reconnect, "Listen key reached max lifetime, rotating");
        match self.acquire().await {
            Ok(key) => {
                self.notify(SessionEvent::Rotated { key, reconnect });
                ControlFlow::Continue(())
            }
            Err(e) => {
                self.terminate(format!("Failed to rotate listen key: {}", e));
                ControlFlow::Break(())
            }
        }
    }

    /// Keep-alive and hard-rotation timers; runs until the session terminates
    async fn run_renewal(self: Arc<Self>) {
        let renew_every = self.policy.renew_interval;
        let lifetime = self.policy.max_lifetime;
        let start = Instant::now();

        let mut renew = interval_at(start + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rotate = interval_at(start + lifetime, lifetime);
        rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            let flow = tokio::select! {
                _ = renew.tick() => {
                    let before = self.current_key();
                    let flow = self.renew(&mut failures).await;
                    if self.current_key() != before {
                        rotate.reset();
                    }
                    flow
                }
                _ = rotate.tick() => {
                    let flow = self.rotate().await;
                    failures = 0;
                    renew.reset();
                    flow
                }
            };

            if flow.is_break() {
                return;
            }
        }
    }
}

/// Read-only view handed to the connection that uses the key
#[derive(Clone)]
pub struct ListenKeyHandle {
    kind: StreamKind,
    snapshot: watch::Receiver<ListenKeySnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for ListenKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenKeyHandle")
            .field("kind", &self.kind)
            .field("state", &self.snapshot.borrow().state)
            .finish_non_exhaustive()
    }
}

impl ListenKeyHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn current_key(&self) -> Option<String> {
        self.snapshot.borrow().key.clone()
    }

    pub fn snapshot(&self) -> ListenKeySnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Owns the single active listen key of one stream kind
///
/// `start` acquires the key and spawns the renewal task; `shutdown` (or
/// dropping the manager) cancels that task.
pub struct ListenKeyManager<A: ListenKeyApi> {
    shared: Arc<Shared<A>>,
    renewal: Option<ScheduledTask>,
}

impl<A: ListenKeyApi> ListenKeyManager<A> {
    pub fn new(api: Arc<A>, kind: StreamKind, policy: ListenKeyPolicy) -> Self {
        let (snapshot, _) = watch::channel(ListenKeySnapshot {
            state: ListenKeyState::Uninitialized,
            key: None,
            renew_failures: 0,
        });
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                api,
                kind,
                policy,
                snapshot,
                events,
            }),
            renewal: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn handle(&self) -> ListenKeyHandle {
        ListenKeyHandle {
            kind: self.shared.kind,
            snapshot: self.shared.snapshot.subscribe(),
            events: self.shared.events.clone(),
        }
    }

    pub fn snapshot(&self) -> ListenKeySnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Acquire a key without scheduling renewal
    pub async fn acquire(&self) -> Result<String, ExchangeError> {
        match self.shared.acquire().await {
            Ok(key) => Ok(key),
            Err(e) => {
                self.shared.set_state(ListenKeyState::Uninitialized);
                Err(e)
            }
        }
    }

    /// Acquire a key and start the renewal / rotation schedule from now
    pub async fn start(&mut self) -> Result<String, ExchangeError> {
        if let Some(mut previous) = self.renewal.take() {
            previous.cancel();
        }
        let key = self.acquire().await?;
        self.renewal = Some(ScheduledTask::spawn(
            "listen-key-renewal",
            self.shared.clone().run_renewal(),
        ));
        Ok(key)
    }

    pub fn is_renewing(&self) -> bool {
        self.renewal
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel renewal and release the active key. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(mut renewal) = self.renewal.take() {
            renewal.cancel();
        }

        let previous = self.shared.snapshot.send_replace(ListenKeySnapshot {
            state: ListenKeyState::Uninitialized,
            key: None,
            renew_failures: 0,
        });

        if let Some(key) = previous.key {
            match self.shared.api.release(self.shared.kind, &key).await {
                Ok(()) => info!(kind = %self.shared.kind, "Listen key released"),
                Err(e) => warn!(kind = %self.shared.kind, "Failed to release listen key: {}", e),
            }
        }
    }
}
