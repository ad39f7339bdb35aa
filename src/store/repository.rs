//! Run database repository.
//!
//! Status transitions are guarded compare-and-set UPDATEs: each `mark_*`
//! names the statuses it may move from, so repeated terminal calls and
//! concurrent writers affect zero rows instead of rewinding a run.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::Run;

/// Fixed reason recorded when recovery fails a run whose owning process
/// died without updating its status.
pub const ORPHAN_REASON: &str = "orphaned: server restarted while run was in progress";

/// Repository for run persistence.
#[derive(Debug, Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new pending run and return its assigned id.
    pub async fn create(
        &self,
        conversation_id: &str,
        user_id: &str,
        project_id: &str,
        command: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (conversation_id, user_id, project_id, command, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(project_id)
        .bind(command)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("creating run")?;

        Ok(result.last_insert_rowid())
    }

    /// Get a run by id.
    pub async fn get(&self, id: i64) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, conversation_id, user_id, project_id, command, status,
                   created_at, started_at, completed_at, result, error
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching run")?;

        Ok(run)
    }

    /// List the most recent runs for a conversation, newest first.
    pub async fn list_by_conversation(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, conversation_id, user_id, project_id, command, status,
                   created_at, started_at, completed_at, result, error
            FROM runs
            WHERE conversation_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing runs by conversation")?;

        Ok(runs)
    }

    /// Mark a pending run as running.
    pub async fn mark_running(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking run running")?;

        Ok(())
    }

    /// Mark a run as completed with its result text. Idempotent: a run
    /// already in a terminal status is left untouched.
    pub async fn mark_completed(&self, id: i64, result: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs SET status = 'completed', completed_at = ?, result = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(result)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking run completed")?;

        Ok(())
    }

    /// Mark a run as failed with an error message. Idempotent.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs SET status = 'failed', completed_at = ?, error = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking run failed")?;

        Ok(())
    }

    /// Mark a run as cancelled. Idempotent.
    pub async fn mark_cancelled(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs SET status = 'cancelled', completed_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking run cancelled")?;

        Ok(())
    }

    /// Cancel a run only while it is still pending. Used for queued
    /// entries, where racing the consumer's `mark_running` must leave
    /// exactly one winner. Returns true when this call won.
    pub async fn cancel_pending(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("cancelling pending run")?;

        Ok(result.rows_affected() > 0)
    }

    /// Fail every run still marked running from a previous process
    /// lifetime. Must run before any queue consumer starts; no live
    /// process can correspond to these rows. Returns the number healed.
    pub async fn recover_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'failed', completed_at = ?, error = ? WHERE status = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(ORPHAN_REASON)
        .execute(&self.pool)
        .await
        .context("recovering orphaned runs")?;

        Ok(result.rows_affected())
    }

    /// Delete the oldest terminal runs beyond the retention count.
    /// Pending and running rows are never deleted. Returns rows removed.
    pub async fn prune(&self, conversation_id: Option<&str>, keep: i64) -> Result<u64> {
        let result = match conversation_id {
            Some(conversation) => {
                sqlx::query(
                    r#"
                    DELETE FROM runs
                    WHERE conversation_id = ?1
                      AND status IN ('completed', 'failed', 'cancelled')
                      AND id NOT IN (
                          SELECT id FROM runs WHERE conversation_id = ?1
                          ORDER BY id DESC LIMIT ?2
                      )
                    "#,
                )
                .bind(conversation)
                .bind(keep)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM runs
                    WHERE status IN ('completed', 'failed', 'cancelled')
                      AND id NOT IN (SELECT id FROM runs ORDER BY id DESC LIMIT ?)
                    "#,
                )
                .bind(keep)
                .execute(&self.pool)
                .await
            }
        }
        .context("pruning runs")?;

        Ok(result.rows_affected())
    }

    /// Distinct conversation ids present in the store, for the prune task.
    pub async fn conversations(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT conversation_id FROM runs")
                .fetch_all(&self.pool)
                .await
                .context("listing conversations")?;

        Ok(rows.into_iter().map(|(c,)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, RunStatus};

    async fn repo() -> RunRepository {
        let db = Database::in_memory().await.unwrap();
        RunRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo().await;
        let id = repo.create("chat-1", "alice", "demo", "just build").await.unwrap();

        let run = repo.get(id).await.unwrap().unwrap();
        assert_eq!(run.conversation_id, "chat-1");
        assert_eq!(run.command, "just build");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());
    }

    #[tokio::test]
    async fn test_forward_only_transitions() {
        let repo = repo().await;
        let id = repo.create("chat-1", "alice", "demo", "ls").await.unwrap();

        repo.mark_running(id).await.unwrap();
        repo.mark_completed(id, "done").await.unwrap();

        // A later terminal transition is a no-op, not a rewind.
        repo.mark_failed(id, "boom").await.unwrap();
        repo.mark_cancelled(id).await.unwrap();

        let run = repo.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_deref(), Some("done"));
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_mark_running_requires_pending() {
        let repo = repo().await;
        let id = repo.create("chat-1", "alice", "demo", "ls").await.unwrap();

        repo.mark_cancelled(id).await.unwrap();
        repo.mark_running(id).await.unwrap();

        let run = repo.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recover_orphans_is_idempotent() {
        let repo = repo().await;
        let id = repo.create("chat-1", "alice", "demo", "sleep 60").await.unwrap();
        repo.mark_running(id).await.unwrap();

        let healed = repo.recover_orphans().await.unwrap();
        assert_eq!(healed, 1);

        let run = repo.get(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(ORPHAN_REASON));

        // Running again finds nothing to heal.
        let healed = repo.recover_orphans().await.unwrap();
        assert_eq!(healed, 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let repo = repo().await;
        let mut ids = Vec::new();
        for i in 0..150 {
            let id = repo
                .create("chat-1", "alice", "demo", &format!("cmd {i}"))
                .await
                .unwrap();
            repo.mark_running(id).await.unwrap();
            repo.mark_completed(id, "ok").await.unwrap();
            ids.push(id);
        }

        let removed = repo.prune(Some("chat-1"), 100).await.unwrap();
        assert_eq!(removed, 50);

        let remaining = repo.list_by_conversation("chat-1", 500).await.unwrap();
        assert_eq!(remaining.len(), 100);
        // The newest 100 survive.
        let expected: Vec<i64> = ids.iter().rev().take(100).copied().collect();
        let actual: Vec<i64> = remaining.iter().map(|r| r.id).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_prune_spares_in_progress_runs() {
        let repo = repo().await;
        let active = repo.create("chat-1", "alice", "demo", "cmd").await.unwrap();
        repo.mark_running(active).await.unwrap();
        for _ in 0..5 {
            let id = repo.create("chat-1", "alice", "demo", "cmd").await.unwrap();
            repo.mark_running(id).await.unwrap();
            repo.mark_completed(id, "ok").await.unwrap();
        }

        repo.prune(Some("chat-1"), 1).await.unwrap();

        let run = repo.get(active).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_conversations_listing() {
        let repo = repo().await;
        repo.create("chat-1", "alice", "demo", "a").await.unwrap();
        repo.create("chat-2", "bob", "demo", "b").await.unwrap();

        let mut conversations = repo.conversations().await.unwrap();
        conversations.sort();
        assert_eq!(conversations, vec!["chat-1", "chat-2"]);
    }
}
