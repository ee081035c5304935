//! Session controller flow tests against a scripted transport.

use async_trait::async_trait;
use drover_agent::{
    AgentError, AgentInput, AgentProcess, AgentTransport, ExecuteOptions, RawEvent, Session,
    SessionEvent, SessionRegistry, SpawnSpec,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Fake process fed by the test through a channel. The stream stays open
/// until the test drops its sender.
struct ScriptedProcess {
    events: mpsc::UnboundedReceiver<RawEvent>,
    sent: Arc<Mutex<Vec<AgentInput>>>,
}

#[async_trait]
impl AgentProcess for ScriptedProcess {
    async fn next_event(&mut self) -> Option<RawEvent> {
        self.events.recv().await
    }

    fn send(&mut self, input: AgentInput) {
        self.sent.lock().unwrap().push(input);
    }

    async fn kill(&mut self) {
        self.events.close();
    }

    async fn wait_exit(&mut self) -> Option<i32> {
        Some(0)
    }
}

/// Hands out pre-scripted processes in order and counts spawns.
struct ScriptedTransport {
    processes: Mutex<VecDeque<ScriptedProcess>>,
    spawns: AtomicUsize,
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn spawn(&self, _spec: SpawnSpec) -> Result<Box<dyn AgentProcess>, AgentError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        match self.processes.lock().unwrap().pop_front() {
            Some(process) => Ok(Box::new(process)),
            None => Err(AgentError::Transport("no scripted process left".into())),
        }
    }
}

struct ProcessScript {
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    sent: Arc<Mutex<Vec<AgentInput>>>,
}

fn scripted_transport(count: usize) -> (Arc<ScriptedTransport>, Vec<ProcessScript>) {
    let mut processes = VecDeque::new();
    let mut scripts = Vec::new();
    for _ in 0..count {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        processes.push_back(ScriptedProcess {
            events: raw_rx,
            sent: sent.clone(),
        });
        scripts.push(ProcessScript { raw_tx, sent });
    }
    (
        Arc::new(ScriptedTransport {
            processes: Mutex::new(processes),
            spawns: AtomicUsize::new(0),
        }),
        scripts,
    )
}

async fn drain_until_complete(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(event)) => {
                let done = matches!(event, SessionEvent::Complete { .. });
                collected.push(event);
                if done {
                    return collected;
                }
            }
            _ => panic!("event stream ended before Complete: {collected:?}"),
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn normal_exit_emits_exactly_one_complete() {
    let (transport, mut scripts) = scripted_transport(1);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, "/tmp/work", events_tx);

    let script = scripts.remove(0);
    let runner = tokio::spawn(async move {
        session
            .execute("do the thing", ExecuteOptions::default())
            .await
    });

    script
        .raw_tx
        .send(RawEvent::Text {
            content: "on it".into(),
        })
        .unwrap();
    script.raw_tx.send(RawEvent::Done).unwrap();
    drop(script.raw_tx);

    let collected = drain_until_complete(&mut events_rx).await;
    runner.await.unwrap().unwrap();

    let completes = collected
        .iter()
        .filter(|event| matches!(event, SessionEvent::Complete { .. }))
        .count();
    assert_eq!(completes, 1);
    assert!(collected.contains(&SessionEvent::AssistantText {
        content: "on it".into()
    }));
    assert!(collected.contains(&SessionEvent::Complete { killed: false }));
    assert!(collected.contains(&SessionEvent::TurnExit));
}

#[tokio::test]
async fn kill_terminates_and_reports_killed() {
    let (transport, mut scripts) = scripted_transport(1);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, "/tmp/work", events_tx);
    let handle = session.handle();

    let script = scripts.remove(0);
    let runner =
        tokio::spawn(async move { session.execute("spin", ExecuteOptions::default()).await });

    // Wait until the stream is live before sending control input, since
    // commands queued while idle are discarded as stale.
    script
        .raw_tx
        .send(RawEvent::Text {
            content: "working".into(),
        })
        .unwrap();
    assert!(matches!(
        next_event(&mut events_rx).await,
        SessionEvent::AssistantText { .. }
    ));

    handle.kill();
    let collected = drain_until_complete(&mut events_rx).await;
    runner.await.unwrap().unwrap();

    assert!(collected.contains(&SessionEvent::Complete { killed: true }));
}

#[tokio::test]
async fn stop_for_iteration_completes_without_the_killed_flag() {
    let (transport, mut scripts) = scripted_transport(1);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, "/tmp/work", events_tx);
    let handle = session.handle();

    let script = scripts.remove(0);
    let runner =
        tokio::spawn(async move { session.execute("iterate", ExecuteOptions::default()).await });

    script
        .raw_tx
        .send(RawEvent::Text {
            content: "item done".into(),
        })
        .unwrap();
    assert!(matches!(
        next_event(&mut events_rx).await,
        SessionEvent::AssistantText { .. }
    ));

    // Loop-internal stop: terminal, but not a user kill.
    handle.stop_for_iteration();
    let collected = drain_until_complete(&mut events_rx).await;
    runner.await.unwrap().unwrap();

    assert!(collected.contains(&SessionEvent::Complete { killed: false }));
    assert!(!collected.contains(&SessionEvent::Complete { killed: true }));
}

#[tokio::test]
async fn answer_is_forwarded_as_tool_result() {
    let (transport, mut scripts) = scripted_transport(1);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, "/tmp/work", events_tx);
    let handle = session.handle();

    let script = scripts.remove(0);
    let runner =
        tokio::spawn(async move { session.execute("choose", ExecuteOptions::default()).await });

    script
        .raw_tx
        .send(RawEvent::ToolUse {
            id: "q1".into(),
            name: "ask_user".into(),
            input: json!({"questions": [{"header": "Scope", "question": "Which one?", "options": ["a", "b"]}]}),
        })
        .unwrap();

    match next_event(&mut events_rx).await {
        SessionEvent::Question { question } => assert_eq!(question.tool_use_id, "q1"),
        other => panic!("expected Question, got {other:?}"),
    }

    handle.answer("q1", "a");
    let sent = script.sent.clone();
    timeout(Duration::from_secs(2), async {
        loop {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("answer never reached the subprocess");

    assert_eq!(
        sent.lock().unwrap().as_slice(),
        &[AgentInput::ToolResult {
            id: "q1".into(),
            content: "a".into(),
        }]
    );

    script.raw_tx.send(RawEvent::Done).unwrap();
    drop(script.raw_tx);
    drain_until_complete(&mut events_rx).await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn spawn_failure_still_completes() {
    let (transport, _scripts) = scripted_transport(0);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(transport, "/tmp/work", events_tx);

    session
        .execute("anything", ExecuteOptions::default())
        .await
        .unwrap();

    let collected = drain_until_complete(&mut events_rx).await;
    assert!(matches!(collected[0], SessionEvent::Error { .. }));
    assert!(collected.contains(&SessionEvent::Complete { killed: false }));
}

#[tokio::test]
async fn second_execute_while_busy_is_rejected_not_queued() {
    let (transport, mut scripts) = scripted_transport(2);
    let mut registry = SessionRegistry::new();
    let (id, mut events_rx) = registry.create(transport.clone(), "/tmp/work");

    assert!(registry.execute(&id, "first", ExecuteOptions::default()));
    // The lock is taken synchronously, so this is already busy.
    assert!(registry.execute(&id, "second", ExecuteOptions::default()));

    let script = scripts.remove(0);
    script.raw_tx.send(RawEvent::Done).unwrap();
    drop(script.raw_tx);

    let collected = drain_until_complete(&mut events_rx).await;
    let busies = collected
        .iter()
        .filter(|event| matches!(event, SessionEvent::Busy))
        .count();
    assert_eq!(busies, 1);
    assert_eq!(transport.spawns.load(Ordering::SeqCst), 1);

    // The rejected prompt was not queued: nothing further arrives.
    assert!(
        timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .is_err()
    );
}
