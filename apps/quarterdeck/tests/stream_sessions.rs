//! End-to-end tests for log stream sessions against a scripted
//! orchestrator: chunk reassembly, replace semantics, teardown paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use quarterdeck::log_stream::{LogStreamManager, LogStreamSink};
use quarterdeck::orchestrator::{LiveTail, OrchestratorApi, OrchestratorError};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Line(String),
    Error(String),
    End,
}

struct RecordingSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingSink {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LogStreamSink for RecordingSink {
    fn on_line(&self, line: &str) {
        let _ = self.tx.send(Event::Line(line.to_string()));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.send(Event::Error(error.to_string()));
    }

    fn on_end(&self) {
        let _ = self.tx.send(Event::End);
    }
}

/// One scripted live tail: the test feeds chunks through `chunks`, and
/// `closed` resolves when the session drops the stream.
struct TailHandle {
    chunks: mpsc::UnboundedSender<Result<Bytes, OrchestratorError>>,
    closed: oneshot::Receiver<()>,
}

impl TailHandle {
    fn send(&self, chunk: &[u8]) {
        self.chunks
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .expect("session dropped tail before end of script");
    }

    fn fail(&self, message: &str) {
        let _ = self.chunks.send(Err(OrchestratorError::Api {
            status: 500,
            message: message.to_string(),
        }));
    }

    fn end(self) -> oneshot::Receiver<()> {
        // Dropping the sender ends the stream.
        self.closed
    }
}

struct NotifyOnDrop(Option<oneshot::Sender<()>>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

struct MockOrchestrator {
    historical: Mutex<Vec<String>>,
    fail_historical: Mutex<bool>,
    fail_open: Mutex<Option<String>>,
    tails: Mutex<Vec<TailHandle>>,
}

impl MockOrchestrator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            historical: Mutex::new(Vec::new()),
            fail_historical: Mutex::new(false),
            fail_open: Mutex::new(None),
            tails: Mutex::new(Vec::new()),
        })
    }

    fn set_historical(&self, lines: &[&str]) {
        *self.historical.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    fn fail_historical(&self) {
        *self.fail_historical.lock().unwrap() = true;
    }

    fn fail_open(&self, message: &str) {
        *self.fail_open.lock().unwrap() = Some(message.to_string());
    }

    fn take_tail(&self) -> TailHandle {
        self.tails.lock().unwrap().remove(0)
    }

    fn open_count(&self) -> usize {
        self.tails.lock().unwrap().len()
    }
}

#[async_trait]
impl OrchestratorApi for MockOrchestrator {
    async fn fetch_recent_lines(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: Option<&str>,
        _limit: u32,
    ) -> Result<Vec<String>, OrchestratorError> {
        if *self.fail_historical.lock().unwrap() {
            return Err(OrchestratorError::Api {
                status: 404,
                message: "previous log not available".to_string(),
            });
        }
        Ok(self.historical.lock().unwrap().clone())
    }

    async fn open_live_tail(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: Option<&str>,
    ) -> Result<LiveTail, OrchestratorError> {
        if let Some(message) = self.fail_open.lock().unwrap().clone() {
            return Err(OrchestratorError::Api {
                status: 404,
                message,
            });
        }
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        self.tails.lock().unwrap().push(TailHandle {
            chunks: chunk_tx,
            closed: closed_rx,
        });
        let guard = NotifyOnDrop(Some(closed_tx));
        Ok(LiveTail {
            chunks: Box::pin(async_stream::stream! {
                let _guard = guard;
                while let Some(item) = chunk_rx.recv().await {
                    yield item;
                }
            }),
        })
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let outcome = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome.unwrap());
}

/// Poll until all sessions are gone; teardown runs just after the final
/// callback fires.
async fn wait_for_empty(manager: &LogStreamManager) {
    timeout(Duration::from_secs(1), async {
        while manager.active_session_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions were not torn down");
}

#[tokio::test]
async fn historical_snippet_precedes_live_lines() {
    let orchestrator = MockOrchestrator::new();
    orchestrator.set_historical(&["boot ok"]);
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"req 200\n");

    assert_eq!(next_event(&mut events).await, Event::Line("boot ok".into()));
    assert_eq!(next_event(&mut events).await, Event::Line("req 200".into()));
}

#[tokio::test]
async fn chunks_are_reassembled_and_partial_flushed_on_end() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"hello wo");
    tail.send(b"rld\nfoo");
    tail.send(b"\n");
    tail.send(b"bar");
    tail.end();

    assert_eq!(
        next_event(&mut events).await,
        Event::Line("hello world".into())
    );
    assert_eq!(next_event(&mut events).await, Event::Line("foo".into()));
    assert_eq!(next_event(&mut events).await, Event::Line("bar".into()));
    assert_eq!(next_event(&mut events).await, Event::End);
    assert_no_event(&mut events).await;
    wait_for_empty(&manager).await;
}

#[tokio::test]
async fn end_without_partial_emits_only_end() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"done\n");
    tail.end();

    assert_eq!(next_event(&mut events).await, Event::Line("done".into()));
    assert_eq!(next_event(&mut events).await, Event::End);
    assert_no_event(&mut events).await;
    wait_for_empty(&manager).await;
}

#[tokio::test]
async fn restart_with_same_key_replaces_prior_session() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink1, mut events1) = RecordingSink::new();
    let (sink2, mut events2) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink1)
        .await
        .unwrap();
    let first_tail = orchestrator.take_tail();

    manager
        .start_session("s1", "prod", "web-1", None, sink2)
        .await
        .unwrap();
    assert_eq!(manager.active_session_count(), 1);
    assert_eq!(orchestrator.open_count(), 1);

    // The prior tail is released once its reader observes the cancel.
    timeout(Duration::from_secs(1), first_tail.end())
        .await
        .expect("prior tail was not released")
        .unwrap();

    // The replacement keeps streaming; the replaced sink stays silent.
    let second_tail = orchestrator.take_tail();
    second_tail.send(b"fresh\n");
    assert_eq!(next_event(&mut events2).await, Event::Line("fresh".into()));
    assert_no_event(&mut events1).await;
}

#[tokio::test]
async fn stop_is_idempotent_and_silent() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    assert_eq!(manager.active_session_count(), 1);

    manager.stop_session("s1");
    manager.stop_session("s1");
    manager.stop_session("never-started");
    assert_eq!(manager.active_session_count(), 0);

    // A stopped session emits nothing, not even a buffered partial.
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn stop_discards_buffered_partial_line() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"complete\npart");
    assert_eq!(
        next_event(&mut events).await,
        Event::Line("complete".into())
    );

    manager.stop_session("s1");
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn open_failure_registers_nothing() {
    let orchestrator = MockOrchestrator::new();
    orchestrator.fail_open("pods \"web-9\" not found");
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    let result = manager
        .start_session("s1", "prod", "web-9", None, sink)
        .await;
    assert!(result.is_err());
    assert_eq!(manager.active_session_count(), 0);
    assert_no_event(&mut events).await;

    // Stopping the failed id is a harmless no-op.
    manager.stop_session("s1");
}

#[tokio::test]
async fn historical_failure_does_not_prevent_live_tail() {
    let orchestrator = MockOrchestrator::new();
    orchestrator.fail_historical();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"live anyway\n");
    assert_eq!(
        next_event(&mut events).await,
        Event::Line("live anyway".into())
    );
}

#[tokio::test]
async fn transport_error_surfaces_once_and_tears_down() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink, mut events) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink)
        .await
        .unwrap();
    let tail = orchestrator.take_tail();
    tail.send(b"before\n");
    tail.fail("container terminated");

    assert_eq!(next_event(&mut events).await, Event::Line("before".into()));
    match next_event(&mut events).await {
        Event::Error(message) => assert!(message.contains("container terminated")),
        other => panic!("expected error event, got {:?}", other),
    }
    assert_no_event(&mut events).await;
    wait_for_empty(&manager).await;

    // The failed session left the registry; a restart under the same id
    // opens a fresh tail.
    let (sink2, _events2) = RecordingSink::new();
    manager
        .start_session("s1", "prod", "web-1", None, sink2)
        .await
        .unwrap();
    assert_eq!(manager.active_session_count(), 1);
}

#[tokio::test]
async fn sessions_are_independent() {
    let orchestrator = MockOrchestrator::new();
    let manager = LogStreamManager::new(orchestrator.clone(), 100);
    let (sink1, mut events1) = RecordingSink::new();
    let (sink2, mut events2) = RecordingSink::new();

    manager
        .start_session("s1", "prod", "web-1", None, sink1)
        .await
        .unwrap();
    manager
        .start_session("s2", "prod", "web-2", None, sink2)
        .await
        .unwrap();
    assert_eq!(manager.active_session_count(), 2);

    let tail1 = orchestrator.take_tail();
    let tail2 = orchestrator.take_tail();
    tail1.fail("pod deleted");
    tail2.send(b"unaffected\n");

    match next_event(&mut events1).await {
        Event::Error(_) => {}
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events2).await,
        Event::Line("unaffected".into())
    );
}
