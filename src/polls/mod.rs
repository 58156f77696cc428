mod builder;

pub use builder::{build_poll, validate_poll, MIN_OPTIONS};

use crate::config::ManagerConfig;
use crate::db::PollStorage;
use crate::error::PollError;
use crate::models::{truncate_to_millis, Poll, PollDraft, PollId, VoterId};
use crate::tasks::poll_sweeper;
use crate::voting::PollRuntime;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications for anything rendering polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Registered { poll_id: PollId },
    /// `voters` is everyone holding a selection at the moment of closing.
    Closed { poll_id: PollId, voters: Vec<VoterId> },
    Deleted { poll_id: PollId },
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: usize,
    pub reaped: usize,
}

/// Registry of every live poll, plus creation, closing and the periodic sweep.
pub struct PollManager {
    storage: Arc<dyn PollStorage>,
    config: ManagerConfig,
    polls: DashMap<PollId, Arc<PollRuntime>>,
    events: broadcast::Sender<PollEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PollManager {
    pub fn new(storage: Arc<dyn PollStorage>, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            config,
            polls: DashMap::new(),
            events,
            sweeper: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> Arc<dyn PollStorage> {
        Arc::clone(&self.storage)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    pub fn build_poll(&self, creator: Uuid, draft: PollDraft) -> Result<Poll, PollError> {
        build_poll(creator, draft)
    }

    /// Persists a new poll and makes it live. Nothing is registered in memory
    /// unless the storage write succeeded.
    pub async fn register_poll(&self, creator: Uuid, poll: Poll) -> Result<PollId, PollError> {
        validate_poll(&poll)?;
        if self.polls.contains_key(&poll.id) {
            return Err(PollError::Validation(format!(
                "Poll {} is already registered",
                poll.id
            )));
        }

        if let Err(e) = self.storage.create_poll(&poll).await {
            error!("Failed to persist poll {} for {}: {}", poll.id, creator, e);
            return Err(e.into());
        }

        let poll_id = poll.id;
        let (readable_id, closes_at) = (poll.readable_id.clone(), poll.closes_at);
        match self.polls.entry(poll_id) {
            Entry::Occupied(_) => {
                return Err(PollError::Validation(format!(
                    "Poll {} is already registered",
                    poll_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(PollRuntime::new(poll)));
            }
        }

        info!(
            "Registered poll {} ({:?}) by {}, closes at {}",
            poll_id,
            readable_id,
            creator,
            closes_at.to_rfc3339()
        );
        let _ = self.events.send(PollEvent::Registered { poll_id });
        Ok(poll_id)
    }

    pub fn get(&self, poll_id: PollId) -> Option<Arc<PollRuntime>> {
        self.polls.get(&poll_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves either a UUID string or a readable id.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<Arc<PollRuntime>> {
        let identifier = identifier.trim();
        if let Ok(poll_id) = Uuid::parse_str(identifier) {
            if let Some(runtime) = self.get(poll_id) {
                return Some(runtime);
            }
        }
        self.polls
            .iter()
            .find(|entry| entry.value().readable_id() == identifier)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn all(&self) -> Vec<Arc<PollRuntime>> {
        self.polls.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn active(&self) -> Vec<Arc<PollRuntime>> {
        self.all().into_iter().filter(|rt| !rt.is_closed()).collect()
    }

    pub fn closed(&self) -> Vec<Arc<PollRuntime>> {
        self.all().into_iter().filter(|rt| rt.is_closed()).collect()
    }

    /// Closes a poll right away. The in-memory close happens first so votes
    /// are rejected immediately; a failed storage write is only logged.
    ///
    /// Returns `false` when the poll is not loaded.
    pub async fn close(&self, poll_id: PollId) -> bool {
        let Some(runtime) = self.get(poll_id) else {
            return false;
        };

        let now = truncate_to_millis(Utc::now());
        let transitioned = runtime.close(now);
        let closed_at = runtime.closed_at().unwrap_or(now);

        match self.storage.close_poll(poll_id, closed_at).await {
            Ok(()) => {
                if transitioned {
                    info!("Closed poll {}", poll_id);
                    self.notify_closed(&runtime);
                }
            }
            Err(e) => error!("Poll {} closed in memory but not in storage: {}", poll_id, e),
        }
        true
    }

    /// Removes a poll from storage, then from memory.
    pub async fn delete_poll(&self, poll_id: PollId) -> Result<bool, PollError> {
        self.storage.delete_poll(poll_id).await?;
        let existed = self.polls.remove(&poll_id).is_some();
        info!("Deleted poll {} (was loaded: {})", poll_id, existed);
        let _ = self.events.send(PollEvent::Deleted { poll_id });
        Ok(existed)
    }

    pub fn find_voters(&self, poll_id: PollId) -> HashSet<VoterId> {
        self.get(poll_id)
            .map(|rt| rt.voters_snapshot())
            .unwrap_or_default()
    }

    /// Loads recent polls from storage and seeds every runtime with its
    /// persisted selections before exposing it. Returns how many polls were loaded.
    pub async fn bootstrap(&self) -> Result<usize, PollError> {
        let polls = self.storage.load_recent_polls(self.config.retention).await?;
        let storage = &self.storage;

        let loads = polls.into_iter().map(|poll| async move {
            let selections = storage.load_all_selections(poll.id).await;
            (poll, selections)
        });
        let loaded = futures::future::join_all(loads).await;

        let mut count = 0;
        for (poll, selections) in loaded {
            let poll_id = poll.id;
            let runtime = PollRuntime::new(poll);
            match selections {
                Ok(selections) => {
                    for (voter, selection) in selections {
                        runtime.supply_selection_bootstrap(voter, selection);
                    }
                }
                Err(e) => warn!(
                    "Could not load selections for poll {}, starting empty: {}",
                    poll_id, e
                ),
            }

            // a poll registered while loading wins over the stored copy
            self.polls.entry(poll_id).or_insert_with(|| Arc::new(runtime));
            count += 1;
        }

        info!("Bootstrapped {} poll(s) from storage", count);
        Ok(count)
    }

    /// Bootstraps, then starts the periodic sweep.
    pub async fn start(self: &Arc<Self>) -> Result<(), PollError> {
        self.bootstrap().await?;

        let handle = poll_sweeper::spawn_sweeper(Arc::downgrade(self), self.config.sweep_interval);
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_once_at(Utc::now()).await
    }

    /// Closes polls past their deadline, then drops closed polls older than
    /// the retention window from memory.
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let closed = self.close_due_polls(now).await;
        let reaped = self.reap_expired_polls(now);
        if closed > 0 || reaped > 0 {
            debug!("Sweep closed {} and reaped {} poll(s)", closed, reaped);
        }
        SweepReport { closed, reaped }
    }

    async fn close_due_polls(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Arc<PollRuntime>> = self
            .polls
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0;
        for runtime in due {
            let closes_at = runtime.closes_at();
            match self.storage.close_poll(runtime.id(), closes_at).await {
                Ok(()) => {
                    if runtime.close(closes_at) {
                        info!("Poll {} reached its deadline and was closed", runtime.id());
                        self.notify_closed(&runtime);
                        closed += 1;
                    }
                }
                Err(e) => warn!(
                    "Failed to close poll {}, will retry next sweep: {}",
                    runtime.id(),
                    e
                ),
            }
        }
        closed
    }

    fn reap_expired_polls(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention;
        let before = self.polls.len();
        self.polls.retain(|_, runtime| !runtime.expired_before(cutoff));
        before.saturating_sub(self.polls.len())
    }

    fn notify_closed(&self, runtime: &PollRuntime) {
        let voters = runtime.voters_snapshot().into_iter().collect();
        let _ = self.events.send(PollEvent::Closed {
            poll_id: runtime.id(),
            voters,
        });
    }

    /// Stops the sweep and forgets every loaded poll.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.polls.clear();
        info!("Poll manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStorage;
    use crate::models::{PollOption, PollRules, Selection};
    use chrono::Duration;
    use tempfile::tempdir;

    fn poll(question: &str) -> Poll {
        Poll::new(
            Uuid::new_v4(),
            Some(question.to_lowercase()),
            question.to_string(),
            vec![PollOption::new(0, "yes", None), PollOption::new(1, "no", None)],
            PollRules::single_choice(),
            Duration::minutes(10),
        )
    }

    async fn manager(dir: &std::path::Path) -> PollManager {
        let storage = FileStorage::open(dir).await.unwrap();
        PollManager::new(Arc::new(storage), ManagerConfig::default())
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut events = manager.subscribe();

        let p = poll("Lunch");
        let id = manager.register_poll(p.owner, p.clone()).await.unwrap();

        assert!(manager.get(id).is_some());
        assert_eq!(manager.find_by_identifier("lunch").unwrap().id(), id);
        assert_eq!(manager.find_by_identifier(&id.to_string()).unwrap().id(), id);
        assert_eq!(manager.active().len(), 1);
        assert!(manager.closed().is_empty());
        assert_eq!(events.recv().await.unwrap(), PollEvent::Registered { poll_id: id });

        assert!(manager.register_poll(p.owner, p).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_registration_keeps_one_runtime() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let p = poll("Twice");
        let id = p.id;

        let (first, second) = tokio::join!(
            manager.register_poll(p.owner, p.clone()),
            manager.register_poll(p.owner, p.clone())
        );
        assert_eq!(first.is_ok() as usize + second.is_ok() as usize, 1);

        let runtime = manager.get(id).unwrap();
        runtime.apply_selection(Uuid::new_v4(), Selection::from([0]));
        assert!(manager.register_poll(p.owner, p).await.is_err());
        assert_eq!(manager.get(id).unwrap().tallies(), vec![1, 0]);
        assert_eq!(manager.all().len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_malformed_polls() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;

        let mut p = poll("Broken");
        p.options.truncate(1);
        assert!(matches!(
            manager.register_poll(p.owner, p).await,
            Err(PollError::Validation(_))
        ));
        assert!(manager.all().is_empty());
    }

    #[tokio::test]
    async fn manual_close_notifies_voters() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let p = poll("Close me");
        let id = manager.register_poll(p.owner, p).await.unwrap();

        let voter = Uuid::new_v4();
        manager.get(id).unwrap().apply_selection(voter, Selection::from([1]));
        let mut events = manager.subscribe();

        assert!(manager.close(id).await);
        assert!(manager.get(id).unwrap().is_closed());
        assert_eq!(
            events.recv().await.unwrap(),
            PollEvent::Closed { poll_id: id, voters: vec![voter] }
        );
        assert!(!manager.close(Uuid::new_v4()).await);

        let stored = manager.storage().load_poll(id).await.unwrap().unwrap();
        assert!(stored.closed);
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let p = poll("Gone");
        let id = manager.register_poll(p.owner, p).await.unwrap();

        assert!(manager.delete_poll(id).await.unwrap());
        assert!(manager.get(id).is_none());
        assert!(manager.storage().load_poll(id).await.unwrap().is_none());
        assert!(manager.find_voters(id).is_empty());
    }

    #[tokio::test]
    async fn sweep_closes_then_reaps() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let p = poll("Sweep");
        let closes_at = p.closes_at;
        let id = manager.register_poll(p.owner, p).await.unwrap();

        let report = manager.sweep_once_at(closes_at - Duration::seconds(1)).await;
        assert_eq!(report, SweepReport::default());

        let report = manager.sweep_once_at(closes_at).await;
        assert_eq!(report.closed, 1);
        assert_eq!(manager.get(id).unwrap().closed_at(), Some(closes_at));

        let retention = manager.config().retention;
        let report = manager.sweep_once_at(closes_at + retention).await;
        assert_eq!(report.reaped, 0);

        let report = manager
            .sweep_once_at(closes_at + retention + Duration::milliseconds(1))
            .await;
        assert_eq!(report.reaped, 1);
        assert!(manager.get(id).is_none());
    }
}
