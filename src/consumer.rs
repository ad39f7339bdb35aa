//! Queue consumer: the per-conversation orchestration loop.
//!
//! One task per conversation pops requests in FIFO order and drives each
//! run through Starting -> Streaming <-> AwaitingInput -> Finalizing.
//! Two runs never overlap within a conversation.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ExecError;
use crate::prompt::{self, PromptState};
use crate::queue::Dequeued;
use crate::runner::{CommandProcess, newest_slice};
use crate::service::{ActiveRun, ExecService};
use crate::store::{RunRequest, RunStatus};

/// Cadence of the output read loop.
const READ_INTERVAL: Duration = Duration::from_millis(100);

/// How one run ended.
enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
    PromptTimedOut,
    Cancelled,
}

/// What happened while a run was awaiting input.
enum InputOutcome {
    Resumed,
    Exited(ExitStatus),
    PromptTimedOut,
    DeadlineExceeded,
    Cancelled,
}

/// Consumer loop for one conversation. Spawned on first enqueue; retires
/// once the queue stays empty past the idle wait.
pub(crate) async fn run_loop(service: Arc<ExecService>, conversation_id: String) {
    debug!("consumer started for conversation {conversation_id}");
    loop {
        match service
            .queue
            .dequeue(&conversation_id, service.config.dequeue_wait)
            .await
        {
            Dequeued::Entry(request) => {
                let run_id = request.run_id;
                if let Err(e) = execute_run(&service, request).await {
                    warn!("run {run_id} in {conversation_id} failed internally: {e:?}");
                }
            }
            Dequeued::NoWork => {
                if service.queue.try_retire(&conversation_id) {
                    debug!("consumer for {conversation_id} retired after idle wait");
                    break;
                }
            }
        }
    }
}

/// Execute one dequeued request end to end, keeping the shared registries
/// consistent on every exit path.
async fn execute_run(service: &Arc<ExecService>, request: RunRequest) -> Result<()> {
    let run_id = request.run_id;
    let conversation_id = request.conversation_id.clone();

    // Registration happens before mark_running so cancellation always
    // finds either a pending row or a registered active run.
    let cancel = Arc::new(Notify::new());
    service.active.insert(
        conversation_id.clone(),
        ActiveRun {
            run_id,
            cancel: Arc::clone(&cancel),
        },
    );

    let result = drive(service, &request, &cancel).await;

    service.active.remove(&conversation_id);
    service.prompts.remove(&run_id);
    service.delivery.forget(run_id);

    result
}

async fn drive(
    service: &Arc<ExecService>,
    request: &RunRequest,
    cancel: &Notify,
) -> Result<()> {
    let run_id = request.run_id;
    let conversation_id = &request.conversation_id;

    service
        .repo
        .mark_running(run_id)
        .await
        .context("marking run running")?;

    // The pending-only cancel CAS may have won the race instead.
    match service.repo.get(run_id).await.context("re-reading run")? {
        Some(run) if run.status == RunStatus::Running => {}
        _ => {
            debug!("run {run_id} was cancelled before start, skipping");
            return Ok(());
        }
    }

    info!(
        "starting run {run_id} for {conversation_id}: {} {:?} in {}",
        request.program,
        request.args,
        request.workdir.display()
    );

    let mut proc = match CommandProcess::start(
        &request.program,
        &request.args,
        &request.workdir,
        service.config.output_buffer_cap,
    ) {
        Ok(proc) => proc,
        Err(e @ ExecError::Launch { .. }) => {
            let message = e.to_string();
            warn!("run {run_id}: {message}");
            service
                .repo
                .mark_failed(run_id, &message)
                .await
                .context("marking run failed")?;
            finalize_message(service, run_id, conversation_id, "failed", Some(&message), "").await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let deadline = Instant::now() + service.config.run_timeout;
    let mut poll = tokio::time::interval(READ_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = cancel.notified() => {
                info!("run {run_id} cancelled by request");
                proc.terminate().await;
                break RunOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("run {run_id} exceeded {:?}", service.config.run_timeout);
                proc.terminate().await;
                break RunOutcome::TimedOut;
            }
            _ = poll.tick() => {
                let fresh = proc.read_available();
                if !fresh.is_empty() {
                    publish_progress(service, run_id, conversation_id, &proc).await;

                    if let Some(prompt) = prompt::detect(&fresh) {
                        let input = await_input(
                            service,
                            &mut proc,
                            run_id,
                            conversation_id,
                            prompt,
                            cancel,
                            deadline,
                        )
                        .await;
                        match input {
                            InputOutcome::Resumed => continue,
                            InputOutcome::Exited(status) => break RunOutcome::Exited(status),
                            InputOutcome::PromptTimedOut => break RunOutcome::PromptTimedOut,
                            InputOutcome::Cancelled => break RunOutcome::Cancelled,
                            InputOutcome::DeadlineExceeded => {
                                warn!("run {run_id} exceeded {:?}", service.config.run_timeout);
                                proc.terminate().await;
                                break RunOutcome::TimedOut;
                            }
                        }
                    }
                }
                if let Some(status) = proc.try_wait() {
                    break RunOutcome::Exited(status);
                }
            }
        }
    };

    // Finalizing: pick up anything still in flight, persist the terminal
    // status, and flush the last visible update.
    proc.read_available();
    let result_text = newest_slice(proc.buffer().as_str(), service.config.result_cap).to_string();

    match outcome {
        RunOutcome::Exited(status) if status.success() => {
            info!("run {run_id} completed");
            service
                .repo
                .mark_completed(run_id, &result_text)
                .await
                .context("marking run completed")?;
            finalize_message(service, run_id, conversation_id, "completed", None, &result_text)
                .await;
        }
        RunOutcome::Exited(status) => {
            let error = match status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            };
            info!("run {run_id} failed: {error}");
            service
                .repo
                .mark_failed(run_id, &error)
                .await
                .context("marking run failed")?;
            finalize_message(service, run_id, conversation_id, "failed", Some(&error), &result_text)
                .await;
        }
        RunOutcome::TimedOut => {
            let error =
                ExecError::TimedOut(service.config.run_timeout.as_secs()).to_string();
            service
                .repo
                .mark_failed(run_id, &error)
                .await
                .context("marking run failed")?;
            finalize_message(service, run_id, conversation_id, "failed", Some(&error), &result_text)
                .await;
        }
        RunOutcome::PromptTimedOut => {
            info!("run {run_id} cancelled: prompt response never arrived");
            service
                .repo
                .mark_cancelled(run_id)
                .await
                .context("marking run cancelled")?;
            finalize_message(
                service,
                run_id,
                conversation_id,
                "cancelled",
                Some("no response to prompt"),
                &result_text,
            )
            .await;
        }
        RunOutcome::Cancelled => {
            service
                .repo
                .mark_cancelled(run_id)
                .await
                .context("marking run cancelled")?;
            finalize_message(service, run_id, conversation_id, "cancelled", None, &result_text)
                .await;
        }
    }

    Ok(())
}

/// Streaming -> AwaitingInput. Keeps draining output and watching for
/// exit so a false-positive detection degrades to an ignored prompt.
async fn await_input(
    service: &Arc<ExecService>,
    proc: &mut CommandProcess,
    run_id: i64,
    conversation_id: &str,
    prompt: PromptState,
    cancel: &Notify,
    deadline: Instant,
) -> InputOutcome {
    let (tx, mut rx) = mpsc::channel::<String>(1);
    service.prompts.insert(run_id, tx);

    let labels: Vec<String> = prompt.options.iter().map(|o| o.label.clone()).collect();
    let mut text = format!("Run {run_id} is waiting for input:");
    for (i, label) in labels.iter().enumerate() {
        text.push_str(&format!("\n{}. {label}", i + 1));
    }
    if let Err(e) = service
        .delivery
        .announce(conversation_id, &text, Some(&labels))
        .await
    {
        warn!("run {run_id}: prompt announcement degraded: {e}");
    }

    let prompt_deadline = Instant::now() + service.config.prompt_timeout;
    let mut poll = tokio::time::interval(READ_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            selection = rx.recv() => {
                let Some(selection) = selection else {
                    break InputOutcome::Resumed;
                };
                let reply = prompt.reply_for(&selection);
                debug!("run {run_id}: prompt answered with {reply:?}");
                match proc.write_stdin(&reply).await {
                    Ok(()) => break InputOutcome::Resumed,
                    Err(_) => {
                        // Stdin is gone; the exit check below settles it.
                        if let Some(status) = proc.try_wait() {
                            break InputOutcome::Exited(status);
                        }
                        break InputOutcome::Resumed;
                    }
                }
            }
            _ = cancel.notified() => {
                info!("run {run_id} cancelled while awaiting input");
                proc.terminate().await;
                break InputOutcome::Cancelled;
            }
            _ = tokio::time::sleep_until(prompt_deadline) => {
                warn!(
                    "run {run_id}: no prompt response within {:?}, terminating",
                    service.config.prompt_timeout
                );
                proc.terminate().await;
                break InputOutcome::PromptTimedOut;
            }
            _ = tokio::time::sleep_until(deadline) => {
                break InputOutcome::DeadlineExceeded;
            }
            _ = poll.tick() => {
                // The process may move on or exit by itself; the prompt
                // was advisory.
                let fresh = proc.read_available();
                if !fresh.is_empty() {
                    publish_progress(service, run_id, conversation_id, proc).await;
                }
                if let Some(status) = proc.try_wait() {
                    debug!("run {run_id} exited while awaiting input");
                    break InputOutcome::Exited(status);
                }
            }
        }
    };

    service.prompts.remove(&run_id);
    outcome
}

async fn publish_progress(
    service: &Arc<ExecService>,
    run_id: i64,
    conversation_id: &str,
    proc: &CommandProcess,
) {
    if let Err(e) = service
        .delivery
        .publish(run_id, conversation_id, proc.buffer().as_str())
        .await
    {
        // Degraded delivery never fails the run.
        debug!("run {run_id}: output update degraded: {e}");
    }
}

async fn finalize_message(
    service: &Arc<ExecService>,
    run_id: i64,
    conversation_id: &str,
    status: &str,
    detail: Option<&str>,
    output: &str,
) {
    let mut text = match detail {
        Some(detail) => format!("Run {run_id} {status}: {detail}"),
        None => format!("Run {run_id} {status}"),
    };
    if !output.is_empty() {
        text.push('\n');
        text.push_str(output);
    }
    if let Err(e) = service
        .delivery
        .flush(run_id, conversation_id, Some(&text))
        .await
    {
        warn!("run {run_id}: final update degraded: {e}");
    }
}
