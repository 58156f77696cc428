use super::PollStorage;
use crate::error::{StorageError, StorageResult};
use crate::models::{from_millis, Poll, PollId, PollOption, PollRules, Selection, VoterId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

const POLL_COLUMNS: &str = "id, readable_id, owner, question, created_at, closes_at, \
     closed_at, closed, multiple_choice, max_selections, allow_resubmissions, show_results";

pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    pub async fn connect(db_url: &str, max_connections: u32) -> StorageResult<Self> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                readable_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                question TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                closes_at INTEGER NOT NULL,
                closed_at INTEGER,
                closed INTEGER NOT NULL DEFAULT 0,
                multiple_choice INTEGER NOT NULL,
                max_selections INTEGER NOT NULL,
                allow_resubmissions INTEGER NOT NULL,
                show_results INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                poll_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                label TEXT NOT NULL,
                tooltip TEXT,
                PRIMARY KEY (poll_id, idx),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS voter_selections (
                poll_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                option_idx INTEGER NOT NULL,
                PRIMARY KEY (poll_id, voter_id, option_idx),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_polls_active ON polls(closed, closes_at)",
            "CREATE INDEX IF NOT EXISTS idx_polls_closed_at ON polls(closed_at)",
            "CREATE INDEX IF NOT EXISTS idx_selections_poll_voter \
             ON voter_selections(poll_id, voter_id)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }

        Ok(())
    }

    async fn load_options(
        conn: &mut SqliteConnection,
        poll_id: &str,
    ) -> StorageResult<Vec<PollOption>> {
        let rows = sqlx::query(
            r#"
            SELECT idx, label, tooltip
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY idx
            "#,
        )
        .bind(poll_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<PollOption> {
                let idx: i64 = row.try_get("idx")?;
                Ok(PollOption::new(
                    idx as usize,
                    row.try_get::<String, _>("label")?,
                    row.try_get::<Option<String>, _>("tooltip")?,
                ))
            })
            .collect()
    }

    // Assembles full polls (with options) for a list of poll rows.
    async fn hydrate(
        conn: &mut SqliteConnection,
        rows: Vec<SqliteRow>,
    ) -> StorageResult<Vec<Poll>> {
        let mut polls = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let options = Self::load_options(&mut *conn, &id).await?;
            polls.push(poll_from_row(&row, options)?);
        }
        Ok(polls)
    }
}

#[async_trait]
impl PollStorage for SqlStorage {
    async fn create_poll(&self, poll: &Poll) -> StorageResult<()> {
        let id = poll.id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (
                id, readable_id, owner, question,
                created_at, closes_at, closed_at, closed,
                multiple_choice, max_selections, allow_resubmissions, show_results
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                readable_id = excluded.readable_id,
                owner = excluded.owner,
                question = excluded.question,
                created_at = excluded.created_at,
                closes_at = excluded.closes_at,
                closed_at = excluded.closed_at,
                closed = excluded.closed,
                multiple_choice = excluded.multiple_choice,
                max_selections = excluded.max_selections,
                allow_resubmissions = excluded.allow_resubmissions,
                show_results = excluded.show_results
            "#,
        )
        .bind(&id)
        .bind(&poll.readable_id)
        .bind(poll.owner.to_string())
        .bind(&poll.question)
        .bind(poll.created_at.timestamp_millis())
        .bind(poll.closes_at.timestamp_millis())
        .bind(poll.closed_at.map(|dt| dt.timestamp_millis()))
        .bind(poll.closed)
        .bind(poll.rules.multiple_choice)
        .bind(poll.rules.max_selections as i64)
        .bind(poll.rules.allow_resubmissions)
        .bind(poll.rules.can_view_results)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM poll_options WHERE poll_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        // Labels and tooltips only; counts are derived from selections
        for option in &poll.options {
            sqlx::query(
                r#"
                INSERT INTO poll_options (poll_id, idx, label, tooltip)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(option.index as i64)
            .bind(&option.label)
            .bind(option.tooltip.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_poll(&self, poll_id: PollId) -> StorageResult<Option<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!("SELECT {} FROM polls WHERE id = ?", POLL_COLUMNS))
            .bind(poll_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => Ok(Self::hydrate(&mut *conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn load_active_polls(&self) -> StorageResult<Vec<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM polls WHERE closed = 0 AND closes_at > ? ORDER BY created_at",
            POLL_COLUMNS
        ))
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&mut *conn)
        .await?;

        Self::hydrate(&mut *conn, rows).await
    }

    async fn load_recent_polls(&self, retention: Duration) -> StorageResult<Vec<Poll>> {
        let now = Utc::now();
        let cutoff = now - retention;
        let mut tx = self.pool.begin().await?;

        let overdue = sqlx::query(
            r#"
            UPDATE polls
            SET closed = 1, closed_at = COALESCE(closed_at, closes_at)
            WHERE closed = 0 AND closes_at <= ?
            "#,
        )
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if overdue > 0 {
            info!("Closed {} overdue poll(s) during load", overdue);
        }

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM polls
            WHERE (closed = 0 AND closes_at > ?)
               OR (closed = 1 AND COALESCE(closed_at, closes_at) >= ?)
            ORDER BY created_at
            "#,
            POLL_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .bind(cutoff.timestamp_millis())
        .fetch_all(&mut *tx)
        .await?;

        let polls = Self::hydrate(&mut *tx, rows).await?;
        tx.commit().await?;
        Ok(polls)
    }

    async fn load_all_polls(&self) -> StorageResult<Vec<Poll>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!("SELECT {} FROM polls ORDER BY created_at", POLL_COLUMNS))
            .fetch_all(&mut *conn)
            .await?;

        Self::hydrate(&mut *conn, rows).await
    }

    async fn close_poll(&self, poll_id: PollId, closed_at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE polls
            SET closed = 1, closed_at = COALESCE(closed_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(closed_at.timestamp_millis())
        .bind(poll_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_poll(&self, poll_id: PollId) -> StorageResult<()> {
        let id = poll_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM voter_selections WHERE poll_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
        indices: &Selection,
    ) -> StorageResult<()> {
        let pid = poll_id.to_string();
        let vid = voter_id.to_string();
        let mut tx = self.pool.begin().await?;

        // Taking the write lock first avoids a read-to-write upgrade under WAL
        sqlx::query("DELETE FROM voter_selections WHERE poll_id = ? AND voter_id = ?")
            .bind(&pid)
            .bind(&vid)
            .execute(&mut *tx)
            .await?;

        // Returning early drops the tx, which rolls the delete back
        let option_count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM poll_options WHERE poll_id = polls.id)
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(&pid)
        .fetch_optional(&mut *tx)
        .await?;

        let option_count = option_count.ok_or(StorageError::PollNotFound(poll_id))? as usize;
        if let Some(&index) = indices.iter().find(|&&i| i >= option_count) {
            return Err(StorageError::InvalidOption { poll_id, index });
        }

        for index in indices {
            sqlx::query(
                r#"
                INSERT INTO voter_selections (poll_id, voter_id, option_idx)
                VALUES (?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&pid)
            .bind(&vid)
            .bind(*index as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_voter_selection(
        &self,
        poll_id: PollId,
        voter_id: VoterId,
    ) -> StorageResult<Selection> {
        let indices: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT option_idx
            FROM voter_selections
            WHERE poll_id = ? AND voter_id = ?
            "#,
        )
        .bind(poll_id.to_string())
        .bind(voter_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(indices.into_iter().map(|i| i as usize).collect())
    }

    async fn load_all_selections(
        &self,
        poll_id: PollId,
    ) -> StorageResult<HashMap<VoterId, Selection>> {
        let rows = sqlx::query(
            r#"
            SELECT voter_id, option_idx
            FROM voter_selections
            WHERE poll_id = ?
            ORDER BY voter_id, option_idx
            "#,
        )
        .bind(poll_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut selections: HashMap<VoterId, Selection> = HashMap::new();
        for row in rows {
            let voter = parse_uuid(&row.try_get::<String, _>("voter_id")?)?;
            let index: i64 = row.try_get("option_idx")?;
            selections.entry(voter).or_default().insert(index as usize);
        }
        Ok(selections)
    }
}

fn poll_from_row(row: &SqliteRow, options: Vec<PollOption>) -> StorageResult<Poll> {
    let closed_at: Option<i64> = row.try_get("closed_at")?;
    let max_selections: i64 = row.try_get("max_selections")?;

    Ok(Poll {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        readable_id: row.try_get("readable_id")?,
        owner: parse_uuid(&row.try_get::<String, _>("owner")?)?,
        question: row.try_get("question")?,
        created_at: parse_millis(row.try_get("created_at")?)?,
        closes_at: parse_millis(row.try_get("closes_at")?)?,
        closed_at: closed_at.map(parse_millis).transpose()?,
        options,
        rules: PollRules {
            multiple_choice: row.try_get("multiple_choice")?,
            max_selections: max_selections.max(1) as usize,
            allow_resubmissions: row.try_get("allow_resubmissions")?,
            can_view_results: row.try_get("show_results")?,
        },
        closed: row.try_get("closed")?,
    })
}

fn parse_uuid(raw: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Corrupt(format!("bad uuid {:?}: {}", raw, e)))
}

fn parse_millis(ms: i64) -> StorageResult<DateTime<Utc>> {
    from_millis(ms).ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, SqlStorage) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("polls.db").display());
        let storage = SqlStorage::connect(&url, 4).await.unwrap();
        (dir, storage)
    }

    fn sample_poll() -> Poll {
        Poll::new(
            Uuid::new_v4(),
            Some("lunch".to_string()),
            "Where to eat?".to_string(),
            vec![
                PollOption::new(0, "Pizza", Some("cheesy".to_string())),
                PollOption::new(1, "Tacos", None),
            ],
            PollRules::single_choice(),
            Duration::minutes(10),
        )
    }

    #[tokio::test]
    async fn selection_rows_are_one_per_index() {
        let (_dir, storage) = open_temp().await;
        let mut poll = sample_poll();
        poll.options.push(PollOption::new(2, "Sushi", None));
        storage.create_poll(&poll).await.unwrap();

        let voter = Uuid::new_v4();
        storage
            .save_voter_selection(poll.id, voter, &Selection::from([0, 2]))
            .await
            .unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM voter_selections WHERE poll_id = ?")
                .bind(poll.id.to_string())
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn deleting_poll_cascades_options() {
        let (_dir, storage) = open_temp().await;
        let poll = sample_poll();
        storage.create_poll(&poll).await.unwrap();
        storage.delete_poll(poll.id).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM poll_options WHERE poll_id = ?")
            .bind(poll.id.to_string())
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn upsert_replaces_option_list() {
        let (_dir, storage) = open_temp().await;
        let mut poll = sample_poll();
        storage.create_poll(&poll).await.unwrap();

        poll.options[1] = PollOption::new(1, "Burritos", None);
        storage.create_poll(&poll).await.unwrap();

        let loaded = storage.load_poll(poll.id).await.unwrap().unwrap();
        assert_eq!(loaded.options.len(), 2);
        assert_eq!(loaded.options[1].label, "Burritos");
        assert_eq!(loaded.options[0].tooltip.as_deref(), Some("cheesy"));
    }
}
