mod file;
mod sqlite;

pub use file::FileStorage;
pub use sqlite::SqlStorage;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageResult;
use crate::models::{Poll, PollId, Selection, VoterId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Persistence boundary for polls.
///
/// Per-voter selections are the source of truth; option vote counts are never
/// written and come back as zero from every load. Each write is atomic with
/// respect to its own key, so a restart followed by `load_all_selections`
/// always rebuilds the tallies that were true at the last durable write.
#[async_trait]
pub trait PollStorage: Send + Sync {
    /// Creates or replaces a poll definition and its option list.
    async fn create_poll(&self, poll: &Poll) -> StorageResult<()>;

    async fn load_poll(&self, poll_id: PollId) -> StorageResult<Option<Poll>>;

    /// Open polls whose scheduled close is still in the future.
    async fn load_active_polls(&self) -> StorageResult<Vec<Poll>>;

    /// Active polls plus polls closed within `retention`.
    ///
    /// Overdue polls (open in storage but past `closes_at`) are closed durably
    /// before the result is assembled, with `closed_at` defaulting to `closes_at`.
    async fn load_recent_polls(&self, retention: Duration) -> StorageResult<Vec<Poll>>;

    async fn load_all_polls(&self) -> StorageResult<Vec<Poll>>;

    /// Marks the poll closed. The first recorded `closed_at` wins.
    async fn close_poll(&self, poll_id: PollId, closed_at: DateTime<Utc>) -> StorageResult<()>;

    /// Removes the definition and every selection of the poll.
    async fn delete_poll(&self, poll_id: PollId) -> StorageResult<()>;

    /// Atomically replaces one voter's selection. An empty set deletes it.
    async fn save_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
        indices: &Selection,
    ) -> StorageResult<()>;

    async fn delete_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
    ) -> StorageResult<()> {
        self.save_voter_selection(poll_id, voter_id, &Selection::new())
            .await
    }

    async fn load_voter_selection(&self, poll_id: PollId, voter_id: VoterId)
    -> StorageResult<Selection>;

    async fn load_voters(&self, poll_id: PollId) -> StorageResult<HashSet<VoterId>> {
        Ok(self.load_all_selections(poll_id).await?.into_keys().collect())
    }

    async fn load_all_selections(&self, poll_id: PollId)
    -> StorageResult<HashMap<VoterId, Selection>>;
}

/// Opens the backend selected by configuration.
pub async fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn PollStorage>> {
    match config.backend {
        StorageBackend::File => {
            info!("Using file poll storage (JSON) at {}", config.data_dir.display());
            let storage = FileStorage::open(&config.data_dir).await?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Sqlite => {
            info!("Using SQL poll storage at {}", config.database_url);
            let storage = SqlStorage::connect(&config.database_url, config.max_connections).await?;
            Ok(Arc::new(storage))
        }
    }
}
