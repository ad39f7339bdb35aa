//! Execution service facade.
//!
//! Owns the run store, the per-conversation queues, the delivery layer,
//! and the registries shared with consumer tasks: which run is active per
//! conversation (with its cancel signal) and which runs are awaiting a
//! prompt response.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{Notify, mpsc};

use crate::auth::Allowlist;
use crate::settings::ExecConfig;
use crate::consumer;
use crate::delivery::{DeliveryConfig, OutputDelivery};
use crate::error::{ExecError, ExecResult};
use crate::project::ProjectRegistry;
use crate::queue::{ChatQueue, EnqueueOutcome};
use crate::store::{Database, Run, RunRepository, RunRequest, RunStatus};
use crate::transport::ChatTransport;

/// Resolved execution tunables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub dequeue_wait: Duration,
    pub run_timeout: Duration,
    pub prompt_timeout: Duration,
    pub output_buffer_cap: usize,
    pub result_cap: usize,
    pub keep_runs: i64,
    pub prune_interval: Duration,
}

impl From<&ExecConfig> for ServiceConfig {
    fn from(config: &ExecConfig) -> Self {
        Self {
            dequeue_wait: Duration::from_secs(config.dequeue_wait_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            prompt_timeout: Duration::from_secs(config.prompt_timeout_secs),
            output_buffer_cap: config.output_buffer_cap,
            result_cap: config.result_cap,
            keep_runs: config.keep_runs as i64,
            prune_interval: Duration::from_secs(config.prune_interval_secs),
        }
    }
}

/// The run currently executing for a conversation.
pub(crate) struct ActiveRun {
    pub run_id: i64,
    pub cancel: Arc<Notify>,
}

/// Service wiring the execution pipeline together.
pub struct ExecService {
    pub(crate) config: ServiceConfig,
    pub(crate) repo: RunRepository,
    pub(crate) queue: ChatQueue,
    pub(crate) delivery: OutputDelivery,
    allowlist: Allowlist,
    projects: ProjectRegistry,
    /// Conversation id -> active run. Written only by consumer tasks.
    pub(crate) active: DashMap<String, ActiveRun>,
    /// Run id -> prompt responder for runs in AwaitingInput.
    pub(crate) prompts: DashMap<i64, mpsc::Sender<String>>,
}

impl ExecService {
    pub fn new(
        db: &Database,
        transport: Arc<dyn ChatTransport>,
        allowlist: Allowlist,
        projects: ProjectRegistry,
        exec: &ExecConfig,
    ) -> Arc<Self> {
        let delivery = OutputDelivery::new(
            transport,
            DeliveryConfig {
                min_interval: Duration::from_secs(exec.publish_interval_secs),
                message_limit: exec.message_limit,
            },
        );

        Arc::new(Self {
            config: ServiceConfig::from(exec),
            repo: RunRepository::new(db.pool().clone()),
            queue: ChatQueue::new(exec.queue_capacity),
            delivery,
            allowlist,
            projects,
            active: DashMap::new(),
            prompts: DashMap::new(),
        })
    }

    /// Heal orphaned runs and start the background pruning task. Must
    /// complete before any enqueue so no consumer can observe a stale
    /// `running` row.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let healed = self
            .repo
            .recover_orphans()
            .await
            .context("recovering orphaned runs")?;
        if healed > 0 {
            info!("recovered {healed} orphaned runs from previous lifetime");
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.prune_loop().await;
        });

        Ok(())
    }

    /// Validate and enqueue a command for a conversation. Returns the
    /// assigned run id. Rejections (allowlist, project, full queue)
    /// happen before anything is persisted.
    pub async fn enqueue(
        self: &Arc<Self>,
        conversation_id: &str,
        user_id: &str,
        project_id: &str,
        program: &str,
        args: Vec<String>,
    ) -> ExecResult<i64> {
        if !self.allowlist.is_allowed(user_id) {
            return Err(ExecError::Forbidden(user_id.to_string()));
        }
        let workdir = self.projects.resolve(project_id)?;

        self.queue.reserve(conversation_id)?;

        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        let run_id = match self
            .repo
            .create(conversation_id, user_id, project_id, &command)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.queue.release(conversation_id);
                return Err(ExecError::Storage(e.to_string()));
            }
        };

        let request = RunRequest {
            run_id,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            program: program.to_string(),
            args,
            workdir,
            enqueued_at: chrono::Utc::now(),
        };

        debug!("enqueued run {run_id} for conversation {conversation_id}: {command}");

        if self.queue.commit(request) == EnqueueOutcome::SpawnConsumer {
            self.spawn_consumer(conversation_id);
        }

        Ok(run_id)
    }

    fn spawn_consumer(self: &Arc<Self>, conversation_id: &str) {
        let service = Arc::clone(self);
        let conversation = conversation_id.to_string();
        tokio::spawn(async move {
            consumer::run_loop(service, conversation).await;
        });
    }

    /// Look up a run by id.
    pub async fn status(&self, run_id: i64) -> ExecResult<Option<Run>> {
        self.repo
            .get(run_id)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))
    }

    /// Most recent runs for a conversation, newest first.
    pub async fn history(&self, conversation_id: &str, limit: i64) -> ExecResult<Vec<Run>> {
        self.repo
            .list_by_conversation(conversation_id, limit)
            .await
            .map_err(|e| ExecError::Storage(e.to_string()))
    }

    /// Cancel one run, whether queued or in flight. Terminal runs are
    /// left untouched.
    pub async fn cancel_run(&self, run_id: i64) -> ExecResult<()> {
        // In flight: signal the owning consumer.
        for entry in self.active.iter() {
            if entry.run_id == run_id {
                debug!("cancelling in-flight run {run_id}");
                entry.cancel.notify_one();
                return Ok(());
            }
        }

        // Queued (or between dequeue and start): the pending-only CAS
        // decides the winner against the consumer's mark_running.
        let Some(run) = self.status(run_id).await? else {
            return Ok(());
        };
        if run.status == RunStatus::Pending {
            if self.queue.cancel_entry(&run.conversation_id, run_id) {
                debug!("cancelling queued run {run_id}");
            }
            let won = self
                .repo
                .cancel_pending(run_id)
                .await
                .map_err(|e| ExecError::Storage(e.to_string()))?;
            if won {
                return Ok(());
            }
        }

        // The consumer picked it up meanwhile; it has registered itself
        // in the active map before marking the run running.
        if let Some(active) = self.active.get(&run.conversation_id) {
            if active.run_id == run_id {
                active.cancel.notify_one();
            }
        }
        Ok(())
    }

    /// Cancel everything for a conversation: queued entries and the
    /// in-flight run.
    pub async fn cancel_conversation(&self, conversation_id: &str) -> ExecResult<()> {
        let cancelled = self.queue.cancel_all(conversation_id);
        for run_id in &cancelled {
            self.repo
                .cancel_pending(*run_id)
                .await
                .map_err(|e| ExecError::Storage(e.to_string()))?;
        }
        if !cancelled.is_empty() {
            info!(
                "cancelled {} queued runs for conversation {conversation_id}",
                cancelled.len()
            );
        }

        if let Some(active) = self.active.get(conversation_id) {
            debug!("cancelling in-flight run {} for {conversation_id}", active.run_id);
            active.cancel.notify_one();
        }
        Ok(())
    }

    /// Resolve an AwaitingInput run with a remote selection.
    pub async fn respond_to_prompt(&self, run_id: i64, selection: &str) -> ExecResult<()> {
        let sender = self
            .prompts
            .get(&run_id)
            .map(|s| s.value().clone())
            .ok_or(ExecError::NoPendingPrompt(run_id))?;
        sender
            .send(selection.to_string())
            .await
            .map_err(|_| ExecError::NoPendingPrompt(run_id))
    }

    /// Cancel all in-flight runs and wait briefly for consumers to
    /// finalize their store records.
    pub async fn shutdown(&self) {
        let conversations: Vec<String> =
            self.active.iter().map(|e| e.key().clone()).collect();
        if conversations.is_empty() {
            return;
        }

        info!("shutting down: cancelling {} active runs", conversations.len());
        for conversation in &conversations {
            for run_id in self.queue.cancel_all(conversation) {
                if let Err(e) = self.repo.cancel_pending(run_id).await {
                    warn!("shutdown: cancelling queued run {run_id} failed: {e:?}");
                }
            }
            if let Some(active) = self.active.get(conversation) {
                active.cancel.notify_one();
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.active.is_empty() {
            warn!("{} runs still active at shutdown", self.active.len());
        }
    }

    async fn prune_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quick.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let conversations = match self.repo.conversations().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("prune: listing conversations failed: {e:?}");
                    continue;
                }
            };
            for conversation in conversations {
                match self.repo.prune(Some(&conversation), self.config.keep_runs).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        debug!("pruned {removed} runs from conversation {conversation}")
                    }
                    Err(e) => warn!("prune failed for {conversation}: {e:?}"),
                }
            }
        }
    }
}
