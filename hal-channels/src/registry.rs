//! Session registry.
//!
//! One [`Session`] per conversation (channel + thread). Every key owns a slot
//! guarded by an async mutex, so create, touch, remove and the dispatcher's
//! agent calls for one conversation are serialised while different
//! conversations proceed in parallel.
//!
//! A slot is removed from the map only while its lock is held. A task that
//! waited on a slot that has since been removed notices on wakeup (the slot is
//! no longer current, or its session has ended) and retries against the map.
//!
//! Inactivity timers are reset through the slot without taking its lock, so
//! an event that queues behind a long agent call still counts as activity.
//! A held [`SessionGuard`] keeps its session's timer from firing.

use crate::agent::{AgentError, AgentFramework, AgentHandle, AgentResult, ProxyHandle};
use crate::message::ConversationKey;
use crate::timer::{InactivityTimer, TimerHandle, TimerHold};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hal_common::config::{AgentConfig, Config};
use serde::Serialize;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Map entry for one conversation. A slot carries at most one session over
/// its lifetime; the timer handle is set when that session is opened.
#[derive(Clone)]
struct Slot {
    session: Arc<Mutex<Option<Session>>>,
    timer: Arc<OnceLock<TimerHandle>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            timer: Arc::new(OnceLock::new()),
        }
    }

    fn is(&self, other: &Slot) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

/// Timer payload identifying the session that went idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub key: ConversationKey,
    pub session_id: Uuid,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The user asked to close the session.
    Exit,
    /// Inactivity timeout.
    Expired,
    /// Explicit removal through the registry.
    Removed,
    /// Process shutdown.
    Shutdown,
}

impl EndReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Expired => "expired",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the agent commits the conversation to memory before closing.
    pub const fn learns(&self) -> bool {
        !matches!(self, Self::Exit)
    }
}

/// Live state of one conversation with the agent.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub key: ConversationKey,
    pub user_id: String,
    pub agent: AgentHandle,
    pub proxy: ProxyHandle,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    timer: InactivityTimer,
    ended: bool,
}

impl Session {
    /// Restart the inactivity countdown.
    pub fn touch(&mut self) {
        self.timer.reset();
        self.last_activity = Utc::now();
    }

    pub fn is_expired(&self) -> bool {
        self.timer.has_expired()
    }

    pub fn timer(&self) -> &InactivityTimer {
        &self.timer
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            channel_id: self.key.channel_id.clone(),
            thread_ts: self.key.thread_ts.clone(),
            busy: false,
            id: Some(self.id),
            user_id: Some(self.user_id.clone()),
            created_at: Some(self.created_at),
            last_activity: Some(self.last_activity),
        }
    }
}

/// Exclusive access to a live session. Other work on the same conversation
/// waits until the guard is dropped or passed to [`SessionRegistry::end`].
/// The session cannot expire while the guard is held; dropping it restarts
/// the inactivity window.
pub struct SessionGuard {
    slot: Slot,
    session: OwnedMappedMutexGuard<Option<Session>, Session>,
    _hold: TimerHold,
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Summary of a tracked conversation for the sessions endpoint.
///
/// A conversation whose slot is locked by in-flight work is reported as
/// `busy` with only its key.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub channel_id: String,
    pub thread_ts: String,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Lookup outcome for a locked slot.
enum Lookup {
    Live(SessionGuard),
    Vacant(OwnedMutexGuard<Option<Session>>),
    Stale,
}

pub struct SessionRegistry {
    slots: DashMap<ConversationKey, Slot>,
    agent: Arc<dyn AgentFramework>,
    agent_config: AgentConfig,
    inactivity_timeout: Duration,
    call_timeout: Duration,
    expired_tx: mpsc::UnboundedSender<Expiry>,
    expired_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Expiry>>>,
}

impl SessionRegistry {
    pub fn new(
        agent: Arc<dyn AgentFramework>,
        agent_config: AgentConfig,
        inactivity_timeout: Duration,
    ) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let call_timeout = agent_config.call_timeout();
        Self {
            slots: DashMap::new(),
            agent,
            agent_config,
            inactivity_timeout,
            call_timeout,
            expired_tx,
            expired_rx: std::sync::Mutex::new(Some(expired_rx)),
        }
    }

    pub fn from_config(agent: Arc<dyn AgentFramework>, config: &Config) -> Self {
        Self::new(
            agent,
            config.agent.clone(),
            config.session.inactivity_timeout(),
        )
    }

    pub fn agent(&self) -> &Arc<dyn AgentFramework> {
        &self.agent
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run an agent call under the configured call timeout.
    pub async fn bounded<T, F>(&self, call: F) -> AgentResult<T>
    where
        F: Future<Output = AgentResult<T>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| AgentError::Timeout(self.call_timeout))?
    }

    /// Number of tracked conversations, including ones being opened.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Lock the live session for `key`, creating one when absent.
    ///
    /// Returns the guard and whether the session was created by this call.
    /// A session whose timer already fired is cleaned up and replaced.
    pub async fn get_or_create(
        &self,
        key: &ConversationKey,
        user_id: &str,
    ) -> AgentResult<(SessionGuard, bool)> {
        loop {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(Slot::new)
                .clone();

            let mut vacant = match self.lock(key, slot.clone()).await {
                Lookup::Live(guard) if guard.is_expired() => {
                    self.end(guard, EndReason::Expired).await;
                    continue;
                }
                Lookup::Live(guard) => return Ok((guard, false)),
                Lookup::Stale => continue,
                Lookup::Vacant(vacant) => vacant,
            };

            match self.open_session(key, user_id).await {
                Ok(session) => {
                    tracing::info!(
                        conversation = %key,
                        session_id = %session.id,
                        user_id = %user_id,
                        "Session created"
                    );
                    let _ = slot.timer.set(session.timer.handle());
                    *vacant = Some(session);
                    let guard = Self::live(slot, vacant).map_err(|_| {
                        AgentError::InvalidResponse("session vanished after creation".into())
                    })?;
                    return Ok((guard, true));
                }
                Err(e) => {
                    self.slots.remove_if(key, |_, current| current.is(&slot));
                    return Err(e);
                }
            }
        }
    }

    /// Lock the live session for `key` without creating one. An expired
    /// session is cleaned up and reported as absent.
    pub async fn get(&self, key: &ConversationKey) -> Option<SessionGuard> {
        loop {
            let slot = self.slots.get(key)?.value().clone();
            match self.lock(key, slot).await {
                Lookup::Live(guard) if guard.is_expired() => {
                    self.end(guard, EndReason::Expired).await;
                    return None;
                }
                Lookup::Live(guard) => return Some(guard),
                Lookup::Vacant(_) => return None,
                Lookup::Stale => continue,
            }
        }
    }

    /// Restart the inactivity countdown for `key` without waiting for work
    /// in flight on the conversation. Returns whether a live timer was reset.
    pub fn touch(&self, key: &ConversationKey) -> bool {
        let Some(slot) = self.slots.get(key).map(|entry| entry.value().clone()) else {
            return false;
        };
        slot.timer.get().is_some_and(TimerHandle::reset)
    }

    /// End the session for `key`, learning from the conversation first.
    /// Removing an absent key is a no-op that returns `false`.
    pub async fn remove(&self, key: &ConversationKey) -> bool {
        let Some(guard) = self.get_any(key).await else {
            return false;
        };
        self.end(guard, EndReason::Removed).await;
        true
    }

    /// End a session the caller holds.
    ///
    /// Agent cleanup is best-effort: failures are logged and the session is
    /// removed regardless.
    pub async fn end(&self, mut guard: SessionGuard, reason: EndReason) {
        guard.ended = true;
        guard.timer.stop();

        let key = guard.key.clone();
        let session_id = guard.id;
        let agent = guard.agent.clone();

        if reason.learns() {
            if let Err(e) = self.bounded(self.agent.learn_from_feedback(&agent)).await {
                tracing::warn!(
                    conversation = %key,
                    session_id = %session_id,
                    error = %e,
                    "Failed to learn from feedback"
                );
            }
        }

        if let Err(e) = self.bounded(self.agent.close(&agent)).await {
            tracing::warn!(
                conversation = %key,
                session_id = %session_id,
                error = %e,
                "Failed to close agent"
            );
        }

        let slot = guard.slot.clone();
        self.slots.remove_if(&key, |_, current| current.is(&slot));

        tracing::info!(
            conversation = %key,
            session_id = %session_id,
            reason = reason.as_str(),
            "Session ended"
        );
    }

    /// Summaries of every tracked conversation, sorted by key.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let slots: Vec<(ConversationKey, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut infos: Vec<SessionInfo> = slots
            .into_iter()
            .filter_map(|(key, slot)| match slot.session.try_lock() {
                Ok(session) => (*session).as_ref().filter(|s| !s.ended).map(Session::info),
                Err(_) => Some(SessionInfo {
                    channel_id: key.channel_id,
                    thread_ts: key.thread_ts,
                    busy: true,
                    id: None,
                    user_id: None,
                    created_at: None,
                    last_activity: None,
                }),
            })
            .collect();

        infos.sort_by(|a, b| (&a.channel_id, &a.thread_ts).cmp(&(&b.channel_id, &b.thread_ts)));
        infos
    }

    /// End every session, learning from each conversation first.
    pub async fn shutdown(&self) {
        let keys: Vec<ConversationKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        tracing::info!(sessions = keys.len(), "Closing all sessions");

        for key in keys {
            if let Some(guard) = self.get_any(&key).await {
                self.end(guard, EndReason::Shutdown).await;
            }
        }
    }

    /// Start the task that ends sessions whose inactivity timer fired.
    ///
    /// Only the first call starts a reaper; later calls return `None`.
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.expired_rx.lock().ok().and_then(|mut rx| rx.take())?;
        let registry: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(expiry) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.reap(expiry).await;
            }
            tracing::debug!("Session reaper stopped");
        }))
    }

    async fn reap(&self, expiry: Expiry) {
        let Some(guard) = self.get_any(&expiry.key).await else {
            return;
        };
        if guard.id != expiry.session_id {
            tracing::debug!(
                conversation = %expiry.key,
                session_id = %expiry.session_id,
                "Ignoring expiry for a previous session"
            );
            return;
        }

        tracing::info!(
            conversation = %expiry.key,
            session_id = %expiry.session_id,
            idle_secs = self.inactivity_timeout.as_secs(),
            "Session idle, cleaning up"
        );
        self.end(guard, EndReason::Expired).await;
    }

    /// Lock the live session for `key`, expired or not.
    async fn get_any(&self, key: &ConversationKey) -> Option<SessionGuard> {
        loop {
            let slot = self.slots.get(key)?.value().clone();
            match self.lock(key, slot).await {
                Lookup::Live(guard) => return Some(guard),
                Lookup::Vacant(_) => return None,
                Lookup::Stale => continue,
            }
        }
    }

    async fn lock(&self, key: &ConversationKey, slot: Slot) -> Lookup {
        let locked = Arc::clone(&slot.session).lock_owned().await;

        let current = self
            .slots
            .get(key)
            .is_some_and(|entry| entry.value().is(&slot));
        if !current {
            return Lookup::Stale;
        }

        match Self::live(slot, locked) {
            Ok(guard) => Lookup::Live(guard),
            Err(locked) if locked.is_none() => Lookup::Vacant(locked),
            Err(_) => Lookup::Stale,
        }
    }

    fn live(
        slot: Slot,
        locked: OwnedMutexGuard<Option<Session>>,
    ) -> Result<SessionGuard, OwnedMutexGuard<Option<Session>>> {
        OwnedMutexGuard::try_map(locked, |session| match session {
            Some(session) if !session.ended => Some(session),
            _ => None,
        })
        .map(|session| {
            let hold = session.timer.hold();
            SessionGuard {
                slot,
                session,
                _hold: hold,
            }
        })
    }

    async fn open_session(&self, key: &ConversationKey, user_id: &str) -> AgentResult<Session> {
        let agent = self
            .bounded(
                self.agent
                    .create_agent(&self.agent_config.name, &self.agent_config),
            )
            .await?;

        let proxy = match self.bounded(self.agent.create_proxy(user_id)).await {
            Ok(proxy) => proxy,
            Err(e) => {
                if let Err(close_err) = self.bounded(self.agent.close(&agent)).await {
                    tracing::warn!(error = %close_err, "Failed to close half-created agent");
                }
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let mut timer = InactivityTimer::new(self.inactivity_timeout);
        timer.start(
            self.expired_tx.clone(),
            Expiry {
                key: key.clone(),
                session_id: id,
            },
        );

        let now = Utc::now();
        Ok(Session {
            id,
            key: key.clone(),
            user_id: user_id.to_string(),
            agent,
            proxy,
            created_at: now,
            last_activity: now,
            timer,
            ended: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAgent;
    use std::sync::atomic::Ordering;
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_secs(10);

    fn registry() -> (Arc<SessionRegistry>, Arc<MockAgent>) {
        let agent = Arc::new(MockAgent::default());
        let registry = Arc::new(SessionRegistry::new(
            agent.clone(),
            AgentConfig::default(),
            WINDOW,
        ));
        (registry, agent)
    }

    fn key() -> ConversationKey {
        ConversationKey::new("C1", "100")
    }

    #[tokio::test]
    async fn get_or_create_then_reuse() {
        let (registry, agent) = registry();

        let (first, created) = registry.get_or_create(&key(), "U1").await.unwrap();
        assert!(created);
        let id = first.id;
        assert_eq!(first.user_id, "U1");
        assert!(first.timer().is_active());
        drop(first);

        let (second, created) = registry.get_or_create(&key(), "U2").await.unwrap();
        assert!(!created);
        assert_eq!(second.id, id);
        assert_eq!(agent.count("create_agent"), 1);
        assert_eq!(agent.calls()[1], "create_proxy:U1");
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_session() {
        let (registry, agent) = registry();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (guard, _) = registry
                        .get_or_create(&key(), &format!("U{i}"))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                    guard.id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(agent.count("create_agent"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn different_keys_get_different_sessions() {
        let (registry, _) = registry();
        let (a, _) = registry.get_or_create(&key(), "U1").await.unwrap();
        let (b, _) = registry
            .get_or_create(&ConversationKey::new("C1", "200"), "U1")
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.agent, b.agent);
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_entry() {
        let (registry, agent) = registry();
        agent.fail_create.store(true, Ordering::SeqCst);

        assert!(registry.get_or_create(&key(), "U1").await.is_err());
        assert!(!registry.contains(&key()));
        assert!(registry.is_empty());

        agent.fail_create.store(false, Ordering::SeqCst);
        let (_, created) = registry.get_or_create(&key(), "U1").await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn remove_learns_closes_and_is_idempotent() {
        let (registry, agent) = registry();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        assert!(registry.remove(&key()).await);
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("learn:agent-1"), 1);
        assert_eq!(agent.count("close:agent-1"), 1);

        assert!(!registry.remove(&key()).await);
        assert_eq!(agent.count("close"), 1);
    }

    #[tokio::test]
    async fn remove_survives_learn_failure() {
        let (registry, agent) = registry();
        agent.fail_learn.store(true, Ordering::SeqCst);
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        assert!(registry.remove(&key()).await);
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test]
    async fn remove_survives_close_failure() {
        let (registry, agent) = registry();
        agent.fail_close.store(true, Ordering::SeqCst);
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        assert!(registry.remove(&key()).await);
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("learn:agent-1"), 1);
        assert_eq!(agent.count("close:agent-1"), 1);

        let (_, created) = registry.get_or_create(&key(), "U1").await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn exit_closes_without_learning() {
        let (registry, agent) = registry();
        let (guard, _) = registry.get_or_create(&key(), "U1").await.unwrap();

        registry.end(guard, EndReason::Exit).await;
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("learn"), 0);
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test]
    async fn touch_and_get_absent_key() {
        let (registry, _) = registry();
        assert!(!registry.touch(&key()));
        assert!(registry.get(&key()).await.is_none());
        assert!(!registry.contains(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reaped() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        sleep(WINDOW - Duration::from_secs(1)).await;
        assert!(registry.contains(&key()));

        sleep(Duration::from_secs(2)).await;
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("learn:agent-1"), 1);
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_every_half_window_keeps_session_alive() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        for _ in 0..5 {
            sleep(WINDOW / 2).await;
            assert!(registry.touch(&key()));
        }
        assert!(registry.contains(&key()));
        assert_eq!(agent.count("close"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_does_not_wait_for_busy_session() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        let (guard, _) = registry.get_or_create(&key(), "U1").await.unwrap();

        // The guard stands in for an agent call that outlives the window.
        sleep(WINDOW * 2).await;
        assert!(registry.touch(&key()));
        assert!(registry.contains(&key()));
        assert_eq!(agent.count("close"), 0);

        drop(guard);
        sleep(WINDOW - Duration::from_secs(1)).await;
        assert!(registry.contains(&key()));
        let guard = registry.get(&key()).await.unwrap();
        assert!(!guard.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_waits_for_work_in_flight() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        let (guard, _) = registry.get_or_create(&key(), "U1").await.unwrap();

        sleep(WINDOW * 3).await;
        assert!(registry.contains(&key()));
        assert!(!guard.is_expired());
        drop(guard);

        sleep(WINDOW + Duration::from_secs(1)).await;
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("learn:agent-1"), 1);
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_after_remove_cannot_revive_timer() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        let remover = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove(&key()).await })
        };
        assert!(remover.await.unwrap());
        assert!(!registry.touch(&key()));

        sleep(WINDOW * 2).await;
        assert!(!registry.contains(&key()));
        assert_eq!(agent.count("close"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_racing_remove_leaves_one_close() {
        let (registry, agent) = registry();
        registry.spawn_reaper().unwrap();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        registry.touch(&key());
                    } else {
                        registry.remove(&key()).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        sleep(WINDOW * 2).await;
        assert!(registry.is_empty());
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_counts_as_absent() {
        let (registry, agent) = registry();
        let (guard, _) = registry.get_or_create(&key(), "U1").await.unwrap();
        let old_id = guard.id;
        drop(guard);

        // No reaper: the expiry is only observed on the next lookup.
        sleep(WINDOW + Duration::from_secs(1)).await;
        let (guard, created) = registry.get_or_create(&key(), "U1").await.unwrap();
        assert!(created);
        assert_ne!(guard.id, old_id);
        assert_eq!(agent.count("learn:agent-1"), 1);
        assert_eq!(agent.count("close:agent-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_does_not_end_new_session() {
        let (registry, agent) = registry();
        let (guard, _) = registry.get_or_create(&key(), "U1").await.unwrap();
        let old_id = guard.id;
        drop(guard);

        assert!(registry.remove(&key()).await);
        drop(registry.get_or_create(&key(), "U1").await.unwrap());

        registry
            .reap(Expiry {
                key: key(),
                session_id: old_id,
            })
            .await;
        assert!(registry.contains(&key()));
        assert_eq!(agent.count("close:agent-2"), 0);
    }

    #[tokio::test]
    async fn snapshot_reports_idle_and_busy_sessions() {
        let (registry, _) = registry();
        drop(registry.get_or_create(&key(), "U1").await.unwrap());
        let (_held, _) = registry
            .get_or_create(&ConversationKey::new("C2", "300"), "U2")
            .await
            .unwrap();

        let infos = registry.snapshot();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].channel_id, "C1");
        assert!(!infos[0].busy);
        assert_eq!(infos[0].user_id.as_deref(), Some("U1"));
        assert_eq!(infos[1].channel_id, "C2");
        assert!(infos[1].busy);
        assert!(infos[1].id.is_none());
    }

    #[tokio::test]
    async fn shutdown_ends_every_session() {
        let (registry, agent) = registry();
        for thread in ["1", "2", "3"] {
            drop(
                registry
                    .get_or_create(&ConversationKey::new("C1", thread), "U1")
                    .await
                    .unwrap(),
            );
        }

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(agent.count("learn"), 3);
        assert_eq!(agent.count("close"), 3);
    }

    #[tokio::test]
    async fn reaper_starts_once() {
        let (registry, _) = registry();
        assert!(registry.spawn_reaper().is_some());
        assert!(registry.spawn_reaper().is_none());
    }
}
