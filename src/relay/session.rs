//! Packet Relay Sessions
//!
//! A [`Session`] is the outbound connection a packet relay opened on behalf
//! of one client address. The [`SessionTable`] maps client addresses to their
//! live session and is shared between the relay's datagram handlers, which
//! create sessions, and each session's reader task, which retires it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::net::WriteHalf;
use crate::shutdown::StopSignal;

/// Failure to use a session's outbound connection
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was retired while the caller still held it
    #[error("session for {0} is closed")]
    Closed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Closed sessions are expected while a relay or session shuts down
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed(_))
    }
}

/// Outbound connection serving one client address
#[derive(Debug)]
pub struct Session {
    key: String,
    writer: tokio::sync::Mutex<Option<WriteHalf>>,
    deadline: Mutex<Instant>,
    timeout: Duration,
    closed: StopSignal,
}

impl Session {
    /// Wrap the write half of a freshly dialed connection. The read
    /// deadline starts armed at `now + timeout`.
    pub fn new(key: impl Into<String>, writer: WriteHalf, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            deadline: Mutex::new(Instant::now() + timeout),
            timeout,
            closed: StopSignal::new(),
        }
    }

    /// Client address this session serves
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Write one payload to the destination
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if self.closed.is_triggered() {
            return Err(self.closed_error());
        }
        let mut closed = self.closed.subscribe();
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| self.closed_error())?;
        tokio::select! {
            result = writer.write_all(payload) => Ok(result?),
            _ = closed.wait() => Err(self.closed_error()),
        }
    }

    /// Push the read deadline out to `now + timeout`
    pub fn refresh(&self) -> Result<(), SessionError> {
        if self.closed.is_triggered() {
            return Err(self.closed_error());
        }
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
            Instant::now() + self.timeout;
        Ok(())
    }

    /// Current read deadline
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the read deadline passes without being refreshed
    pub async fn idle(&self) {
        loop {
            let deadline = self.deadline();
            if deadline <= Instant::now() {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Close the outbound connection. In-flight and later sends fail with
    /// [`SessionError::Closed`].
    pub async fn close(&self) {
        self.closed.trigger();
        self.writer.lock().await.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed(self.key.clone())
    }
}

/// Concurrency-safe map from client address to live session
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the live session for a client address
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store `session` unless its key already has a live session.
    ///
    /// Returns the session that is in the table afterwards. When it is not
    /// `session`, another handler won the race for this client and the caller
    /// must close its own connection instead of using it.
    pub fn insert_or_get(&self, session: Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(session.key().to_string())
                .or_insert(session),
        )
    }

    /// Remove the entry for `session`'s key if it still refers to `session`
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session.key()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.key());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
