//! Autonomous build-loop controller.
//!
//! Each iteration re-resolves the unit's worktree, clears the session,
//! and runs one build execution with an instruction payload that embeds
//! the completion-marker contract. The per-item marker advances the loop,
//! the all-complete marker finishes it, and anything else stops it.

use crate::LoopError;
use drover_agent::{
    ALL_COMPLETE_MARKER, CompletionMarker, ExecuteOptions, ITEM_COMPLETE_MARKER, Session,
    SessionEvent, SessionHandle, SessionMode, strongest_marker,
};
use drover_workspace::WorktreeResolver;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct BuildLoopConfig {
    pub unit_id: String,
    pub unit_label: String,
    pub main_root: PathBuf,
    pub max_iterations: u32,
    pub iteration_delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BuildLoopState {
    /// 1-based; the iteration currently (or last) run.
    pub iteration: u32,
    pub max_iterations: u32,
    pub running: bool,
    pub last_marker: Option<CompletionMarker>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterationsReached,
    NoCompletionMarker,
    IterationFailed,
    Cancelled,
}

/// Terminal loop status. Stops are statuses, not errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoopOutcome {
    Finished { iterations: u32 },
    Stopped { reason: StopReason, iterations: u32 },
}

/// Cancels a running loop from any task. Effective between iterations and
/// mid-execution (the live subprocess is killed).
#[derive(Clone)]
pub struct LoopCancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl LoopCancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

pub struct BuildLoop {
    session: Session,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    handle: SessionHandle,
    resolver: WorktreeResolver,
    config: BuildLoopConfig,
    state: BuildLoopState,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    forward: Option<mpsc::UnboundedSender<SessionEvent>>,
    tracker_mutations: Option<Arc<Notify>>,
}

impl BuildLoop {
    pub fn new(
        session: Session,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        resolver: WorktreeResolver,
        config: BuildLoopConfig,
    ) -> Self {
        let handle = session.handle();
        let state = BuildLoopState {
            iteration: 1,
            max_iterations: config.max_iterations,
            running: false,
            last_marker: None,
        };
        Self {
            session,
            events,
            handle,
            resolver,
            config,
            state,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
            forward: None,
            tracker_mutations: None,
        }
    }

    pub fn cancel_handle(&self) -> LoopCancelHandle {
        LoopCancelHandle {
            flag: self.cancelled.clone(),
            notify: self.cancel_notify.clone(),
        }
    }

    /// Re-emits every session event to this sender for display.
    pub fn forward_events(&mut self, sender: mpsc::UnboundedSender<SessionEvent>) {
        self.forward = Some(sender);
    }

    /// Notified on every tracker-mutating tool call, so live-sync polling
    /// can reset to its floor.
    pub fn notify_tracker_mutations(&mut self, notify: Arc<Notify>) {
        self.tracker_mutations = Some(notify);
    }

    pub fn state(&self) -> &BuildLoopState {
        &self.state
    }

    pub async fn run(&mut self) -> Result<LoopOutcome, LoopError> {
        self.state.running = true;
        self.state.iteration = 1;
        self.state.last_marker = None;

        let outcome = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break self.stopped(StopReason::Cancelled);
            }

            let working_dir = self.prepare_working_dir().await;
            self.session.clear();
            self.session.set_working_dir(working_dir);

            let prompt = build_iteration_prompt(
                &self.config.unit_label,
                self.state.iteration,
                self.config.max_iterations,
            );
            info!(
                unit = %self.config.unit_id,
                iteration = self.state.iteration,
                max = self.config.max_iterations,
                "build iteration starting",
            );

            let iteration = self.run_iteration(prompt).await?;
            self.state.last_marker = iteration.marker;

            if iteration.killed {
                break self.stopped(StopReason::Cancelled);
            }
            match iteration.marker {
                Some(CompletionMarker::All) => {
                    info!(unit = %self.config.unit_id, "all items complete");
                    self.state.running = false;
                    break LoopOutcome::Finished {
                        iterations: self.state.iteration,
                    };
                }
                Some(CompletionMarker::Item) => {
                    if self.state.iteration + 1 > self.config.max_iterations {
                        break self.stopped(StopReason::MaxIterationsReached);
                    }
                    self.state.iteration += 1;
                }
                None => {
                    let reason = if iteration.failed {
                        StopReason::IterationFailed
                    } else {
                        StopReason::NoCompletionMarker
                    };
                    break self.stopped(reason);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.iteration_delay) => {}
                _ = self.cancel_notify.notified() => {
                    break self.stopped(StopReason::Cancelled);
                }
            }
        };

        self.state.running = false;
        Ok(outcome)
    }

    fn stopped(&mut self, reason: StopReason) -> LoopOutcome {
        warn!(unit = %self.config.unit_id, ?reason, iteration = self.state.iteration, "build loop stopped");
        self.state.running = false;
        LoopOutcome::Stopped {
            reason,
            iterations: self.state.iteration,
        }
    }

    /// Worktree resolution is best-effort: any workspace error falls back
    /// to the main root so the loop keeps going.
    async fn prepare_working_dir(&self) -> PathBuf {
        let record = match self
            .resolver
            .resolve_or_create(
                &self.config.main_root,
                &self.config.unit_id,
                &self.config.unit_label,
            )
            .await
        {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "worktree resolution failed; using main root");
                return self.config.main_root.clone();
            }
        };
        if let Err(error) = self
            .resolver
            .sync_config(&self.config.main_root, &record.working_copy_path)
            .await
        {
            warn!(%error, "config sync failed");
        }
        if let Err(error) = self
            .resolver
            .seed_plan_document(
                &self.config.main_root,
                &record.working_copy_path,
                &self.config.unit_id,
            )
            .await
        {
            warn!(%error, "plan seeding failed");
        }
        record.working_copy_path
    }

    async fn run_iteration(&mut self, prompt: String) -> Result<IterationResult, LoopError> {
        let exec = self.session.execute(
            prompt,
            ExecuteOptions {
                mode: Some(SessionMode::Build),
                resume: false,
            },
        );
        tokio::pin!(exec);
        let mut exec_done = false;

        let mut markers = Vec::new();
        let mut result = IterationResult::default();
        let mut complete = false;
        loop {
            tokio::select! {
                outcome = &mut exec, if !exec_done => {
                    exec_done = true;
                    outcome?;
                }
                event = self.events.recv(), if !complete => match event {
                    Some(event) => {
                        match &event {
                            SessionEvent::MarkerDetected { marker } => {
                                markers.push(*marker);
                                // The marker is the iteration's verdict;
                                // stop the subprocess rather than wait out
                                // its remaining output.
                                self.handle.stop_for_iteration();
                            }
                            SessionEvent::Error { .. } => result.failed = true,
                            SessionEvent::TrackerMutated { .. } => {
                                if let Some(notify) = &self.tracker_mutations {
                                    notify.notify_waiters();
                                }
                            }
                            SessionEvent::Complete { killed } => {
                                result.killed = *killed;
                                complete = true;
                            }
                            _ => {}
                        }
                        if let Some(forward) = &self.forward {
                            let _ = forward.send(event);
                        }
                    }
                    None => complete = true,
                },
                _ = self.cancel_notify.notified(), if !exec_done => {
                    self.handle.kill();
                }
            }
            if exec_done && complete {
                break;
            }
        }

        result.marker = strongest_marker(&markers);
        Ok(result)
    }
}

#[derive(Debug, Default)]
struct IterationResult {
    marker: Option<CompletionMarker>,
    failed: bool,
    killed: bool,
}

/// Instruction payload for one iteration, embedding the marker contract.
pub fn build_iteration_prompt(unit_label: &str, iteration: u32, max_iterations: u32) -> String {
    format!(
        "You are on iteration {iteration} of {max_iterations} building \"{unit_label}\".\n\
         Pick the next unfinished work item from the plan document and complete it fully, \
         including its tests.\n\
         When the item is done, output exactly {ITEM_COMPLETE_MARKER} in plain text.\n\
         If every item in the plan is done, output exactly {ALL_COMPLETE_MARKER} instead.\n\
         Output no marker if you could not finish the item."
    )
}
