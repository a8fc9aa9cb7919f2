//! Recording session factory for tests
//!
//! Every session opened through [`RecordingSessionFactory`] appends the calls
//! it receives to an event log that tests can inspect afterwards. Failure
//! modes (open failure, send failure, partial flush) are switched on with
//! builder methods.

use async_trait::async_trait;
use bytes::Bytes;
use iap_tunnel_proto::TargetDescriptor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{InboundSink, SessionError, SessionFactory, SessionResult, TokenProvider, TunnelSession};

/// One call observed by a recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Send(Bytes),
    LocalEof,
    WaitForAllSent,
    Close,
}

struct SessionRecord {
    target: TargetDescriptor,
    token: Option<String>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    inbound: Arc<dyn InboundSink>,
}

#[derive(Default)]
struct RecorderState {
    open_calls: usize,
    sessions: Vec<SessionRecord>,
    fail_open: bool,
    fail_send_after: Option<usize>,
    partial_flush: bool,
    stall_local_eof: bool,
}

/// Factory whose sessions record every call made on them
#[derive(Clone, Default)]
pub struct RecordingSessionFactory {
    state: Arc<Mutex<RecorderState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordingSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` fails with [`SessionError::Closed`]
    pub fn with_open_failure(self) -> Self {
        lock(&self.state).fail_open = true;
        self
    }

    /// Sessions reject every `send` after the first `sends` succeed
    pub fn with_send_failure_after(self, sends: usize) -> Self {
        lock(&self.state).fail_send_after = Some(sends);
        self
    }

    /// `wait_for_all_sent` reports that data was lost
    pub fn with_partial_flush(self) -> Self {
        lock(&self.state).partial_flush = true;
        self
    }

    /// `local_eof` is recorded but never completes
    pub fn with_stalled_local_eof(self) -> Self {
        lock(&self.state).stall_local_eof = true;
        self
    }

    /// Number of times `open` was invoked, successful or not
    pub fn open_calls(&self) -> usize {
        lock(&self.state).open_calls
    }

    /// Number of sessions successfully opened
    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn events(&self, session: usize) -> Vec<SessionEvent> {
        let state = lock(&self.state);
        state
            .sessions
            .get(session)
            .map(|record| lock(&record.events).clone())
            .unwrap_or_default()
    }

    /// Concatenation of every `Send` payload of one session
    pub fn sent_bytes(&self, session: usize) -> Vec<u8> {
        self.events(session)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Send(data) => Some(data),
                _ => None,
            })
            .flat_map(|data| data.to_vec())
            .collect()
    }

    pub fn target(&self, session: usize) -> Option<TargetDescriptor> {
        lock(&self.state)
            .sessions
            .get(session)
            .map(|record| record.target.clone())
    }

    pub fn token(&self, session: usize) -> Option<String> {
        lock(&self.state)
            .sessions
            .get(session)
            .and_then(|record| record.token.clone())
    }

    /// Sink registered by the relay, for simulating remote traffic
    pub fn inbound(&self, session: usize) -> Option<Arc<dyn InboundSink>> {
        lock(&self.state)
            .sessions
            .get(session)
            .map(|record| record.inbound.clone())
    }

    /// Poll until `session` has recorded `event`, up to `timeout`
    pub async fn wait_for_event(
        &self,
        session: usize,
        event: &SessionEvent,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events(session).contains(event) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until at least `count` sessions exist, up to `timeout`
    pub async fn wait_for_sessions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.session_count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionFactory for RecordingSessionFactory {
    async fn open(
        &self,
        target: &TargetDescriptor,
        tokens: Arc<dyn TokenProvider>,
        inbound: Arc<dyn InboundSink>,
    ) -> SessionResult<Box<dyn TunnelSession>> {
        let token = tokens.access_token().await;

        let mut state = lock(&self.state);
        state.open_calls += 1;
        let token = token?;
        if state.fail_open {
            return Err(SessionError::Closed);
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        state.sessions.push(SessionRecord {
            target: target.clone(),
            token,
            events: events.clone(),
            inbound,
        });

        Ok(Box::new(RecordingSession {
            events,
            sends: 0,
            fail_send_after: state.fail_send_after,
            partial_flush: state.partial_flush,
            stall_local_eof: state.stall_local_eof,
        }))
    }
}

struct RecordingSession {
    events: Arc<Mutex<Vec<SessionEvent>>>,
    sends: usize,
    fail_send_after: Option<usize>,
    partial_flush: bool,
    stall_local_eof: bool,
}

#[async_trait]
impl TunnelSession for RecordingSession {
    async fn send(&mut self, data: Bytes) -> SessionResult<()> {
        if self.fail_send_after.is_some_and(|limit| self.sends >= limit) {
            return Err(SessionError::Closed);
        }
        self.sends += 1;
        lock(&self.events).push(SessionEvent::Send(data));
        Ok(())
    }

    async fn local_eof(&mut self) -> SessionResult<()> {
        lock(&self.events).push(SessionEvent::LocalEof);
        if self.stall_local_eof {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_all_sent(&mut self) -> bool {
        lock(&self.events).push(SessionEvent::WaitForAllSent);
        !self.partial_flush
    }

    async fn close(&mut self) {
        lock(&self.events).push(SessionEvent::Close);
    }
}
