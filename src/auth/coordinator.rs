//! Token Coordinator
//!
//! Keeps the single access/refresh token pair valid for any number of
//! concurrent request handlers while guaranteeing that at most one token
//! exchange is in flight at a time.
//!
//! The coordinator is an actor. Every refresh decision is made by one loop
//! task that owns a bounded mailbox; callers post a [`RefreshRequest`] and
//! wait on a private oneshot for the answer. A heartbeat task posts a
//! synthetic request every tick so renewal happens even without traffic.
//!
//! A running loop plus its heartbeat form a *generation*. [`TokenCoordinator::restart`]
//! retires the current generation with a synchronous handshake (install the
//! new pair, stop the heartbeat, drain the mailbox, acknowledge) before the
//! next generation is spawned, so no queued caller is left without a reply
//! and two generations never run at the same time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{TokenPair, TokenStore};
use crate::clock::unix_now;
use crate::graph::{Grant, RemoteError, TokenExchange};

/// Outcome of [`TokenCoordinator::ensure_fresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The access token can be used
    Ok,
    /// No token was ever loaded; an authorization flow has to run first
    NotInitialized,
    /// The coordinator did not answer in time; the token may still be usable
    TimedOut,
    /// The token endpoint rejected the refresh
    RefreshFailed,
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Age after which the loop performs an exchange
    pub refresh_limit: Duration,
    /// Safety margin before `refresh_limit` at which callers stop using the fast path
    pub refresh_margin: Duration,
    /// How long a caller waits for the loop to answer
    pub reply_timeout: Duration,
    /// Heartbeat period
    pub heartbeat: Duration,
    /// Window after a failed exchange during which no new exchange is attempted
    pub cooldown: Duration,
    /// Mailbox capacity
    pub mailbox: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_limit: Duration::from_secs(3550),
            refresh_margin: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(1),
            heartbeat: Duration::from_secs(1),
            cooldown: Duration::from_secs(5),
            mailbox: 1024,
        }
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// Id of the running generation, 0 if none
    pub generation: u64,
    pub last_refreshed_at: i64,
}

/// A caller's request for a freshness decision
struct RefreshRequest {
    issued_at: i64,
    reply: oneshot::Sender<Freshness>,
}

/// Retire handshake sent to a running loop
struct Retire {
    /// Pair to install before draining
    install: Option<TokenPair>,
    ack: oneshot::Sender<()>,
}

/// Token state shared with callers
///
/// Written only by the generation loop, or by `restart` while no loop runs.
struct Shared {
    tokens: RwLock<TokenPair>,
    /// Mirror of `tokens.last_refreshed_at` for the lock-free fast path
    last_refreshed_at: AtomicI64,
}

impl Shared {
    fn last_refreshed_at(&self) -> i64 {
        self.last_refreshed_at.load(Ordering::Acquire)
    }

    fn install(&self, pair: TokenPair) {
        let at = pair.last_refreshed_at;
        match self.tokens.write() {
            Ok(mut tokens) => *tokens = pair,
            Err(poisoned) => *poisoned.into_inner() = pair,
        }
        self.last_refreshed_at.store(at, Ordering::Release);
    }

    fn snapshot(&self) -> TokenPair {
        match self.tokens.read() {
            Ok(tokens) => tokens.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Handle to a running generation
struct Generation {
    id: u64,
    mailbox: mpsc::Sender<RefreshRequest>,
    retire: oneshot::Sender<Retire>,
    task: JoinHandle<()>,
}

impl Generation {
    /// Retire this generation and wait until its loop and heartbeat are gone
    async fn retire(self, install: Option<TokenPair>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = self
            .retire
            .send(Retire {
                install,
                ack: ack_tx,
            })
            .is_ok();
        if sent && ack_rx.await.is_err() {
            warn!(generation = self.id, "Coordinator loop exited without acknowledging retire");
        }
        if let Err(e) = self.task.await {
            error!(generation = self.id, error = %e, "Coordinator loop panicked");
        }
    }
}

/// Everything the loop owns
struct LoopContext {
    id: u64,
    shared: Arc<Shared>,
    exchanger: Arc<dyn TokenExchange>,
    store: Option<TokenStore>,
    refresh_limit: i64,
    cooldown: i64,
    /// Epoch seconds of the last failed exchange
    last_failure: Option<i64>,
}

/// Single-writer owner of the token pair
pub struct TokenCoordinator {
    shared: Arc<Shared>,
    exchanger: Arc<dyn TokenExchange>,
    store: Option<TokenStore>,
    config: CoordinatorConfig,
    slot: Mutex<Option<Generation>>,
    next_generation: AtomicU64,
    current_generation: AtomicU64,
}

impl TokenCoordinator {
    /// Create an uninitialized coordinator
    ///
    /// Nothing runs until [`restart`](Self::restart) installs a pair.
    pub fn new(
        exchanger: Arc<dyn TokenExchange>,
        store: Option<TokenStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tokens: RwLock::new(TokenPair {
                    access_token: String::new(),
                    refresh_token: String::new(),
                    last_refreshed_at: 0,
                }),
                last_refreshed_at: AtomicI64::new(0),
            }),
            exchanger,
            store,
            config,
            slot: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            current_generation: AtomicU64::new(0),
        }
    }

    /// Make sure the access token is usable, refreshing it if needed
    pub async fn ensure_fresh(&self) -> Freshness {
        let last = self.shared.last_refreshed_at();
        if last == 0 {
            return Freshness::NotInitialized;
        }

        let now = unix_now();
        let fast_limit = self
            .config
            .refresh_limit
            .saturating_sub(self.config.refresh_margin)
            .as_secs() as i64;
        if now - last < fast_limit {
            return Freshness::Ok;
        }

        match time::timeout(self.config.reply_timeout, self.request_refresh(now)).await {
            Ok(freshness) => freshness,
            Err(_) => {
                debug!(issued_at = now, "Timed out waiting for token coordinator");
                Freshness::TimedOut
            }
        }
    }

    async fn request_refresh(&self, issued_at: i64) -> Freshness {
        loop {
            let (id, mailbox) = {
                let slot = self.slot.lock().await;
                match slot.as_ref() {
                    Some(generation) => (generation.id, generation.mailbox.clone()),
                    None => return Freshness::NotInitialized,
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let request = RefreshRequest {
                issued_at,
                reply: reply_tx,
            };
            if mailbox.send(request).await.is_ok() {
                if let Ok(freshness) = reply_rx.await {
                    return freshness;
                }
            }

            // Lost the race against a retire; restart holds the slot lock until
            // the successor is installed, so an unchanged id means a dead loop.
            let current = self.slot.lock().await.as_ref().map(|g| g.id);
            if current == Some(id) {
                error!(generation = id, "Token coordinator loop is not accepting requests");
                return Freshness::RefreshFailed;
            }
        }
    }

    /// Install a newly obtained pair and replace the running generation
    ///
    /// Returns once the previous generation has fully stopped and the new one
    /// is accepting requests.
    pub async fn restart(&self, pair: TokenPair) {
        let mut slot = self.slot.lock().await;

        match slot.take() {
            Some(old) => {
                let old_id = old.id;
                old.retire(Some(pair)).await;
                debug!(generation = old_id, "Previous coordinator generation stopped");
            }
            None => self.shared.install(pair),
        }

        let generation = self.spawn_generation();
        info!(
            generation = generation.id,
            last_refreshed_at = self.shared.last_refreshed_at(),
            "Token coordinator started"
        );
        self.current_generation.store(generation.id, Ordering::Release);
        *slot = Some(generation);
    }

    /// Stop the running generation, if any
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.take() {
            let id = old.id;
            old.retire(None).await;
            self.current_generation.store(0, Ordering::Release);
            info!(generation = id, "Token coordinator stopped");
        }
    }

    /// Redeem an authorization code, persist the pair and restart the loop
    pub async fn redeem(&self, code: &str) -> Result<(), RemoteError> {
        let issued = self
            .exchanger
            .exchange(Grant::AuthorizationCode(code.to_string()))
            .await?;
        let pair = TokenPair {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            last_refreshed_at: unix_now(),
        };

        info!("New token pair obtained from authorization code");
        // A retiring loop may still persist its own refresh; save once it has stopped
        self.restart(pair.clone()).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&pair) {
                error!(path = %store.path().display(), error = %e, "Failed to persist new token pair");
            }
        }
        Ok(())
    }

    /// Current access token, empty if uninitialized
    pub fn access_token(&self) -> String {
        self.shared.snapshot().access_token
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            generation: self.current_generation.load(Ordering::Acquire),
            last_refreshed_at: self.shared.last_refreshed_at(),
        }
    }

    fn spawn_generation(&self) -> Generation {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.mailbox.max(1));
        let (retire_tx, retire_rx) = oneshot::channel();

        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            id,
            mailbox_tx.clone(),
            self.config.heartbeat,
            stop.clone(),
        ));

        let context = LoopContext {
            id,
            shared: Arc::clone(&self.shared),
            exchanger: Arc::clone(&self.exchanger),
            store: self.store.clone(),
            refresh_limit: self.config.refresh_limit.as_secs() as i64,
            cooldown: self.config.cooldown.as_secs() as i64,
            last_failure: None,
        };
        let task = tokio::spawn(context.run(mailbox_rx, retire_rx, heartbeat, stop));

        Generation {
            id,
            mailbox: mailbox_tx,
            retire: retire_tx,
            task,
        }
    }
}

impl LoopContext {
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<RefreshRequest>,
        mut retire: oneshot::Receiver<Retire>,
        heartbeat: JoinHandle<()>,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                // Retire always wins over pending requests
                biased;

                retire = &mut retire => {
                    let retire = retire.ok();
                    if let Some(pair) = retire.as_ref().and_then(|r| r.install.clone()) {
                        self.shared.install(pair);
                    }

                    stop.cancel();
                    if let Err(e) = heartbeat.await {
                        error!(generation = self.id, error = %e, "Heartbeat task panicked");
                    }

                    mailbox.close();
                    let mut drained = 0usize;
                    while let Some(request) = mailbox.recv().await {
                        self.handle(request).await;
                        drained += 1;
                    }

                    debug!(generation = self.id, drained = drained, "Coordinator generation retiring");
                    if let Some(retire) = retire {
                        let _ = retire.ack.send(());
                    }
                    return;
                }

                request = mailbox.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => return,
                },
            }
        }
    }

    async fn handle(&mut self, request: RefreshRequest) {
        let outcome = self.decide(request.issued_at).await;
        // The caller may have given up waiting
        let _ = request.reply.send(outcome);
    }

    async fn decide(&mut self, issued_at: i64) -> Freshness {
        if issued_at - self.shared.last_refreshed_at() < self.refresh_limit {
            return Freshness::Ok;
        }

        if let Some(failed_at) = self.last_failure {
            if issued_at < failed_at + self.cooldown {
                return Freshness::RefreshFailed;
            }
        }

        let refresh_token = self.shared.snapshot().refresh_token;
        let start = Instant::now();
        let result = self
            .exchanger
            .exchange(Grant::RefreshToken(refresh_token))
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(issued) => {
                let pair = TokenPair {
                    access_token: issued.access_token,
                    refresh_token: issued.refresh_token,
                    last_refreshed_at: unix_now(),
                };
                self.shared.install(pair.clone());
                self.last_failure = None;

                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&pair) {
                        error!(path = %store.path().display(), error = %e, "Failed to persist refreshed token pair");
                    }
                }

                info!(
                    generation = self.id,
                    elapsed_ms = elapsed_ms,
                    last_refreshed_at = pair.last_refreshed_at,
                    "Access token refreshed"
                );
                Freshness::Ok
            }
            Err(e) => {
                self.last_failure = Some(unix_now());
                warn!(
                    generation = self.id,
                    elapsed_ms = elapsed_ms,
                    transient = e.is_transient(),
                    error = %e,
                    "Token refresh failed"
                );
                Freshness::RefreshFailed
            }
        }
    }
}

/// Post a synthetic refresh check every `every` until `stop` fires
async fn heartbeat(
    id: u64,
    mailbox: mpsc::Sender<RefreshRequest>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!(generation = id, "Heartbeat stopped");
                return;
            }

            _ = ticker.tick() => {
                let (reply, _) = oneshot::channel();
                let request = RefreshRequest { issued_at: unix_now(), reply };
                if let Err(mpsc::error::TrySendError::Closed(_)) = mailbox.try_send(request) {
                    return;
                }
            }
        }
    }
}
