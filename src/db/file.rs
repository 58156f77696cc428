use super::PollStorage;
use crate::error::{StorageError, StorageResult};
use crate::models::{from_millis, Poll, PollId, PollOption, PollRules, Selection, VoterId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// JSON-file backend: one definition file per poll plus one voter map per poll.
///
/// Every operation runs under a single process-wide lock and every write goes
/// to a temporary file that is synced and then renamed over the target, so a
/// crash never leaves a half-written document behind.
pub struct FileStorage {
    base_dir: PathBuf,
    votes_dir: PathBuf,
    io_lock: Mutex<()>,
}

// Stored poll JSON (no per-option votes; those live in the votes file)
#[derive(Debug, Serialize, Deserialize)]
struct PollRecord {
    id: Uuid,
    readable_id: String,
    owner: Uuid,
    question: String,
    created_at: i64,
    closes_at: i64,
    closed_at: Option<i64>,
    closed: bool,
    multiple_choice: bool,
    max_selections: usize,
    allow_resubmissions: bool,
    show_results: bool,
    options: Vec<OptionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptionRecord {
    idx: usize,
    label: String,
    tooltip: Option<String>,
}

type VotesDocument = BTreeMap<VoterId, Selection>;

impl PollRecord {
    fn from_poll(poll: &Poll) -> Self {
        Self {
            id: poll.id,
            readable_id: poll.readable_id.clone(),
            owner: poll.owner,
            question: poll.question.clone(),
            created_at: poll.created_at.timestamp_millis(),
            closes_at: poll.closes_at.timestamp_millis(),
            closed_at: poll.closed_at.map(|dt| dt.timestamp_millis()),
            closed: poll.closed,
            multiple_choice: poll.rules.multiple_choice,
            max_selections: poll.rules.max_selections,
            allow_resubmissions: poll.rules.allow_resubmissions,
            show_results: poll.rules.can_view_results,
            options: poll
                .options
                .iter()
                .map(|o| OptionRecord {
                    idx: o.index,
                    label: o.label.clone(),
                    tooltip: o.tooltip.clone(),
                })
                .collect(),
        }
    }

    fn into_poll(self) -> StorageResult<Poll> {
        let ts = |ms: i64| {
            from_millis(ms)
                .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", ms)))
        };

        let mut options: Vec<PollOption> = self
            .options
            .into_iter()
            .map(|o| PollOption::new(o.idx, o.label, o.tooltip))
            .collect();
        options.sort_by_key(|o| o.index);

        Ok(Poll {
            id: self.id,
            readable_id: self.readable_id,
            owner: self.owner,
            question: self.question,
            created_at: ts(self.created_at)?,
            closes_at: ts(self.closes_at)?,
            closed_at: self.closed_at.map(ts).transpose()?,
            options,
            rules: PollRules {
                multiple_choice: self.multiple_choice,
                max_selections: self.max_selections.max(1),
                allow_resubmissions: self.allow_resubmissions,
                can_view_results: self.show_results,
            },
            closed: self.closed,
        })
    }

    /// Closes the record if it is open and past its schedule. Returns whether it changed.
    fn close_if_overdue(&mut self, now_ms: i64) -> bool {
        if self.closed || self.closes_at > now_ms {
            return false;
        }
        self.closed = true;
        self.closed_at = Some(self.closed_at.unwrap_or(self.closes_at));
        true
    }
}

impl FileStorage {
    pub async fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let base_dir = dir.as_ref().to_path_buf();
        let votes_dir = base_dir.join("votes");
        fs::create_dir_all(&votes_dir).await?;

        Ok(Self {
            base_dir,
            votes_dir,
            io_lock: Mutex::new(()),
        })
    }

    fn poll_path(&self, poll_id: PollId) -> PathBuf {
        self.base_dir.join(format!("{}.json", poll_id))
    }

    fn votes_path(&self, poll_id: PollId) -> PathBuf {
        self.votes_dir.join(format!("{}-votes.json", poll_id))
    }

    async fn read_poll_record(&self, poll_id: PollId) -> StorageResult<Option<PollRecord>> {
        match fs::read(self.poll_path(poll_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_poll_record(&self, record: &PollRecord) -> StorageResult<()> {
        let payload = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.poll_path(record.id), &payload).await
    }

    async fn read_votes(&self, poll_id: PollId) -> StorageResult<VotesDocument> {
        match fs::read(self.votes_path(poll_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(VotesDocument::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_votes(&self, poll_id: PollId, votes: &VotesDocument) -> StorageResult<()> {
        let payload = serde_json::to_vec(votes)?;
        write_atomic(&self.votes_path(poll_id), &payload).await
    }

    // Every readable poll definition in the base directory. Unreadable files are skipped.
    async fn read_all_records(&self) -> StorageResult<Vec<PollRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping unreadable poll file {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<PollRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt poll file {}: {}", path.display(), e),
            }
        }

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

// Converts records to polls, skipping any whose fields don't survive conversion
fn decode_records(records: impl IntoIterator<Item = PollRecord>) -> Vec<Poll> {
    records
        .into_iter()
        .filter_map(|record| {
            let poll_id = record.id;
            record
                .into_poll()
                .map_err(|e| warn!("Skipping unusable poll record {}: {}", poll_id, e))
                .ok()
        })
        .collect()
}

async fn write_atomic(path: &Path, payload: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PollStorage for FileStorage {
    async fn create_poll(&self, poll: &Poll) -> StorageResult<()> {
        let _guard = self.io_lock.lock().await;
        self.write_poll_record(&PollRecord::from_poll(poll)).await?;

        if fs::metadata(self.votes_path(poll.id)).await.is_err() {
            self.write_votes(poll.id, &VotesDocument::new()).await?;
        }
        Ok(())
    }

    async fn load_poll(&self, poll_id: PollId) -> StorageResult<Option<Poll>> {
        let _guard = self.io_lock.lock().await;
        self.read_poll_record(poll_id)
            .await?
            .map(PollRecord::into_poll)
            .transpose()
    }

    async fn load_active_polls(&self) -> StorageResult<Vec<Poll>> {
        let _guard = self.io_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        let open = self
            .read_all_records()
            .await?
            .into_iter()
            .filter(|r| !r.closed && r.closes_at > now_ms);
        Ok(decode_records(open))
    }

    async fn load_recent_polls(&self, retention: Duration) -> StorageResult<Vec<Poll>> {
        let _guard = self.io_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = (Utc::now() - retention).timestamp_millis();

        let mut recent = Vec::new();
        let mut overdue = 0usize;
        for mut record in self.read_all_records().await? {
            if record.close_if_overdue(now_ms) {
                match self.write_poll_record(&record).await {
                    Ok(()) => overdue += 1,
                    // still served closed; the next load retries the write
                    Err(e) => warn!("Failed to persist overdue close of poll {}: {}", record.id, e),
                }
            }

            let visible = if record.closed {
                record.closed_at.unwrap_or(record.closes_at) >= cutoff_ms
            } else {
                true
            };
            if visible {
                recent.extend(decode_records([record]));
            }
        }

        if overdue > 0 {
            info!("Closed {} overdue poll(s) during load", overdue);
        }
        Ok(recent)
    }

    async fn load_all_polls(&self) -> StorageResult<Vec<Poll>> {
        let _guard = self.io_lock.lock().await;
        Ok(decode_records(self.read_all_records().await?))
    }

    async fn close_poll(&self, poll_id: PollId, closed_at: DateTime<Utc>) -> StorageResult<()> {
        let _guard = self.io_lock.lock().await;
        let Some(mut record) = self.read_poll_record(poll_id).await? else {
            return Ok(());
        };

        if record.closed && record.closed_at.is_some() {
            return Ok(());
        }
        record.closed = true;
        record.closed_at = Some(record.closed_at.unwrap_or(closed_at.timestamp_millis()));
        self.write_poll_record(&record).await
    }

    async fn delete_poll(&self, poll_id: PollId) -> StorageResult<()> {
        let _guard = self.io_lock.lock().await;
        remove_if_exists(&self.poll_path(poll_id)).await?;
        remove_if_exists(&self.votes_path(poll_id)).await
    }

    async fn save_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
        indices: &Selection,
    ) -> StorageResult<()> {
        let _guard = self.io_lock.lock().await;

        let record = self
            .read_poll_record(poll_id)
            .await?
            .ok_or(StorageError::PollNotFound(poll_id))?;
        if let Some(&index) = indices.iter().find(|&&i| i >= record.options.len()) {
            return Err(StorageError::InvalidOption { poll_id, index });
        }

        let mut votes = self.read_votes(poll_id).await?;
        if indices.is_empty() {
            votes.remove(&voter_id);
        } else {
            votes.insert(voter_id, indices.clone());
        }
        self.write_votes(poll_id, &votes).await
    }

    async fn load_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
    ) -> StorageResult<Selection> {
        let _guard = self.io_lock.lock().await;
        Ok(self
            .read_votes(poll_id)
            .await?
            .remove(&voter_id)
            .unwrap_or_default())
    }

    async fn load_all_selections(
        &self,
        poll_id: PollId,
    ) -> StorageResult<HashMap<VoterId, Selection>> {
        let _guard = self.io_lock.lock().await;
        Ok(self
            .read_votes(poll_id)
            .await?
            .into_iter()
            .filter(|(_, selection)| !selection.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_poll() -> Poll {
        Poll::new(
            Uuid::new_v4(),
            None,
            "Best editor?".to_string(),
            vec![PollOption::new(0, "vim", None), PollOption::new(1, "emacs", None)],
            PollRules::single_choice(),
            Duration::minutes(30),
        )
    }

    #[tokio::test]
    async fn layout_matches_poll_and_votes_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let poll = sample_poll();

        storage.create_poll(&poll).await.unwrap();

        assert!(dir.path().join(format!("{}.json", poll.id)).exists());
        assert!(dir
            .path()
            .join("votes")
            .join(format!("{}-votes.json", poll.id))
            .exists());
    }

    #[tokio::test]
    async fn no_temp_files_left_after_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let poll = sample_poll();
        storage.create_poll(&poll).await.unwrap();

        for _ in 0..5 {
            storage
                .save_voter_selection(poll.id, Uuid::new_v4(), &Selection::from([1]))
                .await
                .unwrap();
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("votes"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn corrupt_definition_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let poll = sample_poll();
        storage.create_poll(&poll).await.unwrap();

        std::fs::write(dir.path().join("garbage.json"), b"{ not json").unwrap();

        let all = storage.load_all_polls().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, poll.id);
    }

    #[tokio::test]
    async fn out_of_range_record_does_not_block_loading() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let good = sample_poll();
        storage.create_poll(&good).await.unwrap();

        let mut broken = PollRecord::from_poll(&sample_poll());
        broken.created_at = i64::MAX;
        storage.write_poll_record(&broken).await.unwrap();

        let recent = storage.load_recent_polls(Duration::hours(72)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, good.id);

        assert_eq!(storage.load_active_polls().await.unwrap().len(), 1);
        assert_eq!(storage.load_all_polls().await.unwrap().len(), 1);
    }

    #[test]
    fn overdue_record_keeps_existing_closed_at() {
        let poll = sample_poll();
        let mut record = PollRecord::from_poll(&poll);
        record.closed_at = Some(record.created_at);

        assert!(record.close_if_overdue(record.closes_at + 1));
        assert!(record.closed);
        assert_eq!(record.closed_at, Some(record.created_at));
        assert!(!record.close_if_overdue(record.closes_at + 2));
    }
}
