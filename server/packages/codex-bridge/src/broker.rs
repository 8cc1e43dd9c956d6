use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use codex_bridge_app_server_client::{AppServerClient, ClientError, ClientOptions, LaunchSpec};
use codex_bridge_error::BridgeError;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::bridge::{format_rfc3339, map_client_error};
use crate::user_env::UserEnvironment;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `None` means unlimited.
    pub max_sessions: Option<usize>,
    /// `None` disables idle eviction and the cleanup loop.
    pub idle_timeout: Option<Duration>,
    pub cleanup_interval: Duration,
    /// Bound on reading a dead subprocess's stderr during removal.
    pub stderr_drain: Duration,
    pub client: ClientOptions,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_sessions: Some(50),
            idle_timeout: Some(Duration::from_secs(1800)),
            cleanup_interval: Duration::from_secs(60),
            stderr_drain: Duration::from_secs(1),
            client: ClientOptions::default(),
        }
    }
}

/// Owns one app-server subprocess per user.
///
/// The user map is only mutated under that user's lock; the global
/// `user_locks` mutex is held just long enough to find or insert a lock.
#[derive(Debug, Clone)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    config: BrokerConfig,
    environment: Arc<dyn UserEnvironment>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    capacity: Option<Arc<Semaphore>>,
    cleanup_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    epoch: Instant,
}

#[derive(Debug)]
struct Session {
    user_id: String,
    client: Arc<AppServerClient>,
    home: Option<PathBuf>,
    created_at: OffsetDateTime,
    /// Milliseconds since the broker epoch.
    last_activity_ms: AtomicU64,
    /// Turns currently streaming on `client`; such a session is never idle.
    active_turns: AtomicUsize,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Marks a turn as running on a session until dropped. Every event of the
/// turn should go through [`TurnActivity::touch`].
#[derive(Debug)]
pub struct TurnActivity {
    session: Arc<Session>,
    epoch: Instant,
}

impl TurnActivity {
    pub fn touch(&self) {
        stamp(&self.session, self.epoch);
    }
}

impl Drop for TurnActivity {
    fn drop(&mut self) {
        stamp(&self.session, self.epoch);
        self.session.active_turns.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct SessionInfo {
    pub user_id: String,
    pub home: Option<String>,
    pub created_at: String,
    pub idle_secs: u64,
    pub pid: Option<u32>,
}

impl SessionBroker {
    pub fn new(config: BrokerConfig, environment: Arc<dyn UserEnvironment>) -> Self {
        let capacity = config
            .max_sessions
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            inner: Arc::new(BrokerInner {
                config,
                environment,
                sessions: RwLock::new(HashMap::new()),
                user_locks: Mutex::new(HashMap::new()),
                capacity,
                cleanup_task: std::sync::Mutex::new(None),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn environment(&self) -> &Arc<dyn UserEnvironment> {
        &self.inner.environment
    }

    /// Returns the live client for `user_id`, spawning one when the user has
    /// none. Concurrent first calls for one user share a single spawn.
    pub async fn get_client(&self, user_id: &str) -> Result<Arc<AppServerClient>, BridgeError> {
        if let Some(client) = self.live_client(user_id).await {
            return Ok(client);
        }

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let existing = self.inner.sessions.read().await.get(user_id).cloned();
        if let Some(session) = existing {
            if session.client.is_alive() {
                self.touch_session(&session);
                return Ok(session.client.clone());
            }
            tracing::warn!(user_id = %user_id, "broker: session has a dead process, removing");
            self.inner.sessions.write().await.remove(user_id);
            self.destroy(session).await;
        }

        let session = self.create_session(user_id).await?;
        let client = session.client.clone();
        let total = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.insert(user_id.to_string(), session);
            sessions.len()
        };
        tracing::info!(user_id = %user_id, total = total, "broker: created session");
        Ok(client)
    }

    /// Marks the user's session as active. Returns false when none exists.
    pub async fn touch(&self, user_id: &str) -> bool {
        match self.inner.sessions.read().await.get(user_id) {
            Some(session) => {
                self.touch_session(session);
                true
            }
            None => false,
        }
    }

    /// Registers a running turn on the user's session so the sweep leaves it
    /// alone. `None` when the user has no session.
    pub async fn begin_turn(&self, user_id: &str) -> Option<TurnActivity> {
        let session = self.inner.sessions.read().await.get(user_id)?.clone();
        session.active_turns.fetch_add(1, Ordering::SeqCst);
        self.touch_session(&session);
        Some(TurnActivity {
            session,
            epoch: self.inner.epoch,
        })
    }

    /// Removes every session whose process has died, and every session with
    /// no running turn that has been idle for longer than the configured
    /// timeout. Returns the removed user ids.
    pub async fn evict_idle(&self) -> Vec<String> {
        let timeout = self.inner.config.idle_timeout;

        let candidates: Vec<String> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .filter(|session| self.is_reclaimable(session, timeout))
            .map(|session| session.user_id.clone())
            .collect();

        let evictions = candidates.into_iter().map(|user_id| async move {
            let lock = self.user_lock(&user_id).await;
            let _guard = lock.lock().await;
            // Re-checked under the map's write lock so a concurrent fast-path
            // touch either lands first or finds the session gone.
            let removed = {
                let mut sessions = self.inner.sessions.write().await;
                let still_idle = sessions
                    .get(&user_id)
                    .is_some_and(|session| self.is_reclaimable(session, timeout));
                if still_idle {
                    sessions.remove(&user_id)
                } else {
                    None
                }
            };
            let session = removed?;
            if session.client.is_alive() {
                tracing::info!(
                    user_id = %user_id,
                    idle_secs = self.idle_for(&session).as_secs(),
                    "broker: expiring idle session"
                );
            } else {
                tracing::warn!(user_id = %user_id, "broker: reclaiming session with a dead process");
            }
            self.destroy(session).await;
            Some(user_id)
        });
        let evicted: Vec<String> = join_all(evictions).await.into_iter().flatten().collect();

        self.prune_locks().await;
        evicted
    }

    /// Starts the periodic eviction sweep. A no-op when idle eviction is
    /// disabled or the loop is already running. The loop exits once the
    /// broker is dropped.
    pub fn start_cleanup_loop(&self) {
        let Some(timeout) = self.inner.config.idle_timeout else {
            tracing::info!("broker: idle timeout disabled, skipping cleanup loop");
            return;
        };
        let mut slot = lock_unpoisoned(&self.inner.cleanup_task);
        if slot.is_some() {
            return;
        }

        let period = self.inner.config.cleanup_interval;
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let broker = SessionBroker { inner };
                let evicted = broker.evict_idle().await;
                let active = broker.active_session_count().await;
                tracing::info!(
                    evicted = evicted.len(),
                    active = active,
                    "broker: cleanup tick"
                );
            }
        }));
        tracing::info!(
            interval_secs = period.as_secs(),
            timeout_secs = timeout.as_secs(),
            "broker: started cleanup loop"
        );
    }

    /// Stops the cleanup loop and closes every subprocess. Each session is
    /// bounded by its own grace period.
    pub async fn shutdown_all(&self) {
        if let Some(task) = lock_unpoisoned(&self.inner.cleanup_task).take() {
            task.abort();
        }

        let sessions: Vec<Arc<Session>> = {
            let mut guard = self.inner.sessions.write().await;
            guard.drain().map(|(_, session)| session).collect()
        };
        let count = sessions.len();
        join_all(sessions.into_iter().map(|session| self.destroy(session))).await;
        self.inner.user_locks.lock().await.clear();
        tracing::info!(closed = count, "broker: shutdown complete");
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .map(|session| SessionInfo {
                user_id: session.user_id.clone(),
                home: session
                    .home
                    .as_ref()
                    .map(|home| home.to_string_lossy().into_owned()),
                created_at: format_rfc3339(session.created_at),
                idle_secs: self.idle_for(session).as_secs(),
                pid: session.client.pid(),
            })
            .collect();
        infos.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        infos
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    async fn live_client(&self, user_id: &str) -> Option<Arc<AppServerClient>> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(user_id)?;
        if !session.client.is_alive() {
            return None;
        }
        self.touch_session(session);
        Some(session.client.clone())
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn prune_locks(&self) {
        let sessions = self.inner.sessions.read().await;
        self.inner.user_locks.lock().await.retain(|user_id, lock| {
            sessions.contains_key(user_id) || Arc::strong_count(lock) > 1
        });
    }

    async fn create_session(&self, user_id: &str) -> Result<Arc<Session>, BridgeError> {
        let start = Instant::now();
        let permit = match &self.inner.capacity {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    let limit = self.inner.config.max_sessions.unwrap_or_default();
                    tracing::error!(user_id = %user_id, limit = limit, "broker: max sessions reached");
                    return Err(BridgeError::Capacity { limit });
                }
            },
            None => None,
        };

        let environment = &self.inner.environment;
        let home = environment.user_home(user_id);
        match &home {
            Some(home) => {
                tokio::fs::create_dir_all(home).await.map_err(|err| {
                    tracing::error!(user_id = %user_id, home = %home.display(), error = %err, "broker: failed to create home");
                    BridgeError::Internal {
                        message: format!("failed to create user directory: {err}"),
                    }
                })?;
            }
            None => tracing::info!(user_id = %user_id, "broker: using built-in home"),
        }

        let mut launch = LaunchSpec::app_server(environment.binary_path())
            .with_args(environment.app_server_args())
            .with_env(environment.user_env(user_id));
        if let Some(cwd) = environment.working_dir() {
            launch = launch.with_cwd(cwd);
        }
        tracing::info!(
            user_id = %user_id,
            command = %launch.display_command(),
            "broker: spawning app-server"
        );

        let client = Arc::new(AppServerClient::new(launch, self.inner.config.client.clone()));
        if let Err(err) = client.ensure_started().await {
            tracing::error!(user_id = %user_id, error = %err, "broker: app-server failed to start");
            return Err(start_error(err));
        }

        tracing::info!(
            user_id = %user_id,
            pid = ?client.pid(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "broker: app-server ready"
        );
        Ok(Arc::new(Session {
            user_id: user_id.to_string(),
            client,
            home,
            created_at: OffsetDateTime::now_utc(),
            last_activity_ms: AtomicU64::new(self.now_ms()),
            active_turns: AtomicUsize::new(0),
            _permit: permit,
        }))
    }

    async fn destroy(&self, session: Arc<Session>) {
        let diagnostics = session
            .client
            .drain_diagnostics(self.inner.config.stderr_drain)
            .await;
        if !diagnostics.is_empty() {
            tracing::warn!(
                user_id = %session.user_id,
                stderr = %diagnostics.join("\n"),
                "broker: app-server stderr"
            );
        }
        session.client.close().await;
        tracing::info!(user_id = %session.user_id, "broker: removed session");
    }

    fn touch_session(&self, session: &Session) {
        stamp(session, self.inner.epoch);
    }

    fn is_reclaimable(&self, session: &Session, timeout: Option<Duration>) -> bool {
        if !session.client.is_alive() {
            return true;
        }
        session.active_turns.load(Ordering::SeqCst) == 0
            && timeout.is_some_and(|timeout| self.idle_for(session) > timeout)
    }

    fn idle_for(&self, session: &Session) -> Duration {
        let last = session.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }
}

fn stamp(session: &Session, epoch: Instant) {
    session
        .last_activity_ms
        .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
}

/// A start failure is always fatal for the new session; authentication
/// errors keep their message.
fn start_error(err: ClientError) -> BridgeError {
    match map_client_error(err) {
        BridgeError::Protocol { method, message, .. } => BridgeError::Transport {
            message: format!("{method} failed: {message}"),
        },
        other => other,
    }
}

fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
