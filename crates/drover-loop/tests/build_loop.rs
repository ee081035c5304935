//! Build-loop state machine against a scripted transport and git runner.

use async_trait::async_trait;
use drover_agent::{
    AgentError, AgentInput, AgentProcess, AgentTransport, ALL_COMPLETE_MARKER,
    ITEM_COMPLETE_MARKER, RawEvent, Session, SpawnSpec,
};
use drover_loop::{BuildLoop, BuildLoopConfig, LoopOutcome, StopReason};
use drover_workspace::{GitRunner, WorkspaceError, WorktreeResolver};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// One scripted subprocess run: a fixed event sequence, then stream end.
struct ScriptedProcess {
    events: VecDeque<RawEvent>,
}

#[async_trait]
impl AgentProcess for ScriptedProcess {
    async fn next_event(&mut self) -> Option<RawEvent> {
        self.events.pop_front()
    }

    fn send(&mut self, _input: AgentInput) {}

    async fn kill(&mut self) {
        self.events.clear();
    }

    async fn wait_exit(&mut self) -> Option<i32> {
        Some(0)
    }
}

/// Hands out one scripted run per iteration and records every prompt.
struct ScriptedTransport {
    runs: Mutex<VecDeque<Vec<RawEvent>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(runs: Vec<Vec<RawEvent>>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn AgentProcess>, AgentError> {
        self.prompts.lock().unwrap().push(spec.prompt);
        match self.runs.lock().unwrap().pop_front() {
            Some(events) => Ok(Box::new(ScriptedProcess {
                events: events.into(),
            })),
            None => Err(AgentError::Transport("no scripted run left".into())),
        }
    }
}

#[derive(Default)]
struct FakeGitRunner;

#[async_trait]
impl GitRunner for FakeGitRunner {
    async fn run(&self, _root: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        if args.first() == Some(&"worktree") && args.get(1) == Some(&"add") {
            if let Some(path) = args.last() {
                std::fs::create_dir_all(path)?;
            }
            return Ok(String::new());
        }
        if args.first() == Some(&"rev-parse") {
            return Err(WorkspaceError::GitCommand {
                args: args.join(" "),
                stderr: "unknown revision".into(),
            });
        }
        Ok(String::new())
    }
}

fn item_run() -> Vec<RawEvent> {
    vec![
        RawEvent::Text {
            content: format!("item shipped {ITEM_COMPLETE_MARKER}"),
        },
        RawEvent::Done,
    ]
}

fn all_run() -> Vec<RawEvent> {
    vec![
        RawEvent::Text {
            content: format!("last item shipped {ITEM_COMPLETE_MARKER} and {ALL_COMPLETE_MARKER}"),
        },
        RawEvent::Done,
    ]
}

fn build_loop(
    transport: Arc<ScriptedTransport>,
    max_iterations: u32,
) -> (TempDir, BuildLoop) {
    let parent = TempDir::new().unwrap();
    let main_root = parent.path().join("repo");
    std::fs::create_dir_all(&main_root).unwrap();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session::new(transport, &main_root, events_tx);
    let resolver = WorktreeResolver::new(Arc::new(FakeGitRunner));
    let config = BuildLoopConfig {
        unit_id: "AB-12".into(),
        unit_label: "Fix login".into(),
        main_root,
        max_iterations,
        iteration_delay: Duration::ZERO,
    };
    (parent, BuildLoop::new(session, events_rx, resolver, config))
}

#[tokio::test]
async fn three_iterations_then_all_complete_finishes() {
    let transport = ScriptedTransport::new(vec![item_run(), item_run(), all_run()]);
    let (_parent, mut build_loop) = build_loop(transport.clone(), 3);

    let outcome = build_loop.run().await.unwrap();
    assert_eq!(outcome, LoopOutcome::Finished { iterations: 3 });

    let prompts = transport.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].contains("iteration 2 of 3"));
    assert!(prompts[0].contains(ITEM_COMPLETE_MARKER));
    assert!(prompts[0].contains(ALL_COMPLETE_MARKER));
}

#[tokio::test]
async fn item_markers_only_stop_at_the_iteration_ceiling() {
    let transport = ScriptedTransport::new(vec![item_run(), item_run(), item_run()]);
    let (_parent, mut build_loop) = build_loop(transport.clone(), 2);

    let outcome = build_loop.run().await.unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Stopped {
            reason: StopReason::MaxIterationsReached,
            iterations: 2,
        }
    );
    // No third spawn: the ceiling stops the loop, not an empty script.
    assert_eq!(transport.prompts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn terminal_output_without_marker_stops_the_loop() {
    let transport = ScriptedTransport::new(vec![vec![
        RawEvent::Text {
            content: "I could not finish".into(),
        },
        RawEvent::Done,
    ]]);
    let (_parent, mut build_loop) = build_loop(transport, 3);

    let outcome = build_loop.run().await.unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Stopped {
            reason: StopReason::NoCompletionMarker,
            iterations: 1,
        }
    );
}

#[tokio::test]
async fn iteration_error_without_marker_stops_as_failed() {
    let transport = ScriptedTransport::new(vec![vec![
        RawEvent::Error {
            message: "tooling exploded".into(),
        },
        RawEvent::Done,
    ]]);
    let (_parent, mut build_loop) = build_loop(transport, 3);

    let outcome = build_loop.run().await.unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Stopped {
            reason: StopReason::IterationFailed,
            iterations: 1,
        }
    );
}

#[tokio::test]
async fn cancel_before_run_stops_immediately() {
    let transport = ScriptedTransport::new(vec![item_run()]);
    let (_parent, mut build_loop) = build_loop(transport.clone(), 3);

    build_loop.cancel_handle().cancel();
    let outcome = build_loop.run().await.unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Stopped {
            reason: StopReason::Cancelled,
            iterations: 1,
        }
    );
    assert!(transport.prompts.lock().unwrap().is_empty());
}
