//! Log-tail session management.
//!
//! Each subscription becomes one session: a bounded historical snippet is
//! fetched and emitted first, then a follow-mode byte stream is opened
//! against the orchestration API and reassembled into lines by a dedicated
//! reader task. Sessions are keyed by stream id in a shared registry;
//! stopping, replacing, upstream errors and upstream end-of-stream all
//! converge on one idempotent teardown path.
//!
//! Known limitation: no deduplication is performed between the historical
//! snippet and the live tail, so a line written while the subscription is
//! being established can reach the viewer twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::orchestrator::{LiveTail, OrchestratorApi, OrchestratorError};

#[derive(Debug, Error)]
pub enum StreamError {
    /// The live tail could not be opened at subscribe time (e.g. the pod
    /// does not exist). No session is registered.
    #[error("failed to open live tail: {0}")]
    SubscriptionRejected(#[from] OrchestratorError),
}

/// Callbacks through which a session reports to its subscriber. All three
/// must be non-blocking; they are invoked from the session's reader task.
pub trait LogStreamSink: Send + Sync + 'static {
    fn on_line(&self, line: &str);
    fn on_error(&self, error: &str);
    fn on_end(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    Ending,
}

struct SessionEntry {
    state: SessionState,
    cancel: CancellationToken,
    /// Checked-and-set exactly once; whichever teardown trigger wins the
    /// swap performs the release.
    closed: Arc<AtomicBool>,
}

/// Accumulates bytes until a newline completes a line. Owned exclusively by
/// one session's reader task. Bytes stay raw until a full line is cut, so a
/// multi-byte codepoint split across chunks never corrupts output.
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a chunk and return every newline-terminated line, in order.
    /// The trailing partial segment stays buffered.
    pub fn extend(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Take the trailing partial line, if any. Called once on normal end of
    /// stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry and lifecycle owner for all log-tail sessions. Cheap to clone;
/// clones share the registry.
#[derive(Clone)]
pub struct LogStreamManager {
    sessions: Arc<DashMap<String, SessionEntry>>,
    orchestrator: Arc<dyn OrchestratorApi>,
    recent_line_limit: u32,
}

impl LogStreamManager {
    pub fn new(orchestrator: Arc<dyn OrchestratorApi>, recent_line_limit: u32) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            orchestrator,
            recent_line_limit,
        }
    }

    /// Start a session for `stream_id`, replacing any existing session with
    /// the same id (the prior session is fully torn down, cancel signalled,
    /// before the new live tail is opened). Returns once the session is
    /// streaming; on failure no session is registered and the error is
    /// returned for the caller to surface.
    pub async fn start_session(
        &self,
        stream_id: &str,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        sink: Arc<dyn LogStreamSink>,
    ) -> Result<(), StreamError> {
        // Replace, never duplicate.
        self.stop_session(stream_id);

        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        let entry = SessionEntry {
            state: SessionState::Starting,
            cancel: cancel.clone(),
            closed: closed.clone(),
        };
        if let Some(prior) = self.sessions.insert(stream_id.to_string(), entry) {
            // Lost a race with a concurrent start for the same id; the
            // prior starter's registration is torn down like any other.
            release(&prior.closed, &prior.cancel);
        }

        // Best-effort historical snippet: emitted before any live line, and
        // never allowed to prevent the tail from starting.
        match self
            .orchestrator
            .fetch_recent_lines(namespace, pod, container, self.recent_line_limit)
            .await
        {
            Ok(lines) => {
                for line in &lines {
                    counter!("quarterdeck_log_lines_total", 1);
                    sink.on_line(line);
                }
            }
            Err(err) => {
                warn!(
                    stream_id,
                    namespace, pod, error = %err,
                    "historical log fetch failed; starting live tail anyway"
                );
                counter!("quarterdeck_historical_fetch_failures_total", 1);
            }
        }

        // The historical fetch is not cancellable; a stop issued while it
        // ran has already unregistered the session.
        if cancel.is_cancelled() {
            self.finish(stream_id, &closed, &cancel);
            return Ok(());
        }

        let tail = match self.orchestrator.open_live_tail(namespace, pod, container).await {
            Ok(tail) => tail,
            Err(err) => {
                counter!("quarterdeck_log_sessions_failed_total", 1);
                self.finish(stream_id, &closed, &cancel);
                return Err(StreamError::SubscriptionRejected(err));
            }
        };

        self.set_state(stream_id, &closed, SessionState::Streaming);
        counter!("quarterdeck_log_sessions_started_total", 1);
        gauge!("quarterdeck_log_sessions_active", self.sessions.len() as f64);
        debug!(stream_id, namespace, pod, "log stream session started");

        let manager = self.clone();
        let id = stream_id.to_string();
        tokio::spawn(async move {
            manager.run_session(id, tail, sink, cancel, closed).await;
        });
        Ok(())
    }

    /// Stop a session. Idempotent: unknown or already-closed ids succeed
    /// silently.
    pub fn stop_session(&self, stream_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(stream_id) {
            if release(&entry.closed, &entry.cancel) {
                gauge!("quarterdeck_log_sessions_active", self.sessions.len() as f64);
                debug!(stream_id, "log stream session stopped");
            }
        }
    }

    /// Number of registered sessions, for diagnostics.
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current state of a session, for diagnostics.
    pub fn session_state(&self, stream_id: &str) -> Option<SessionState> {
        self.sessions.get(stream_id).map(|entry| entry.state)
    }

    /// Drive one live tail until cancellation, upstream error, or upstream
    /// end of stream. Every exit path lands in `finish`.
    async fn run_session(
        self,
        stream_id: String,
        tail: LiveTail,
        sink: Arc<dyn LogStreamSink>,
        cancel: CancellationToken,
        closed: Arc<AtomicBool>,
    ) {
        let mut chunks = tail.chunks;
        let mut buffer = LineBuffer::new();
        loop {
            tokio::select! {
                biased;
                // Explicit stop or replacement: unwind without emitting.
                _ = cancel.cancelled() => break,
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => {
                        for line in buffer.extend(&chunk) {
                            counter!("quarterdeck_log_lines_total", 1);
                            sink.on_line(&line);
                        }
                    }
                    Some(Err(err)) => {
                        self.set_state(&stream_id, &closed, SessionState::Ending);
                        if !closed.load(Ordering::SeqCst) {
                            sink.on_error(&err.to_string());
                        }
                        debug!(stream_id = %stream_id, error = %err, "live tail failed");
                        break;
                    }
                    None => {
                        self.set_state(&stream_id, &closed, SessionState::Ending);
                        if !closed.load(Ordering::SeqCst) {
                            if let Some(rest) = buffer.flush() {
                                counter!("quarterdeck_log_lines_total", 1);
                                sink.on_line(&rest);
                            }
                            sink.on_end();
                        }
                        debug!(stream_id = %stream_id, "live tail ended");
                        break;
                    }
                }
            }
        }
        self.finish(&stream_id, &closed, &cancel);
    }

    /// Idempotent teardown shared by every termination trigger. Only the
    /// caller that wins the closed flag releases resources, and the
    /// registry entry is removed only if it still belongs to this session
    /// (a replacement may already occupy the id).
    fn finish(&self, stream_id: &str, closed: &Arc<AtomicBool>, cancel: &CancellationToken) {
        let released = release(closed, cancel);
        self.sessions
            .remove_if(stream_id, |_, entry| Arc::ptr_eq(&entry.closed, closed));
        if released {
            gauge!("quarterdeck_log_sessions_active", self.sessions.len() as f64);
        }
    }

    fn set_state(&self, stream_id: &str, closed: &Arc<AtomicBool>, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(stream_id) {
            if Arc::ptr_eq(&entry.closed, closed) {
                entry.state = state;
            }
        }
    }
}

/// Check-and-set the closed flag; cancel on the winning call. Returns
/// whether this call performed the release.
fn release(closed: &Arc<AtomicBool>, cancel: &CancellationToken) -> bool {
    if closed.swap(true, Ordering::SeqCst) {
        return false;
    }
    cancel.cancel();
    true
}
