//! Connection lifecycle for one session.
//!
//! A session owns at most one channel. The [`ConnectionManager`] tracks it
//! through `Absent → Connecting → Open` and back to `Absent` on close;
//! a failed outbound attempt ends in the terminal `Closed` state. Any
//! inbound attempt that arrives while a channel exists is refused and
//! closed in the background.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::link::code_from_link;
use crate::transfer::protocol::WireMessage;

/// How this session finds its peer. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Shows its own identifier and waits for the peer to connect
    Initiator,
    /// Connects to the identifier it was given
    Joiner { target: String },
}

impl Role {
    /// Picks the role from an optional target identifier.
    pub fn from_target(target: Option<String>) -> Self {
        match target {
            Some(target) if !target.is_empty() => Role::Joiner { target },
            _ => Role::Initiator,
        }
    }

    /// Picks the role from the link (or bare code) the session was started
    /// with, if any.
    pub fn from_link(link: Option<&str>) -> Self {
        Self::from_target(link.and_then(code_from_link))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Open,
    /// An outbound attempt failed; the session cannot be reused
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Absent => "absent",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not connected to a device")]
    NotConnected,
    #[error("Cannot start a connection while {0}")]
    Busy(ConnectionState),
}

/// Result of offering an inbound channel to the manager.
pub enum Admission<C> {
    /// The channel is now the active connection
    Accepted(Arc<C>),
    /// Another connection already exists; the channel is being closed
    Rejected,
}

/// Owns the session's single channel.
pub struct ConnectionManager<C: MessageChannel> {
    state: ConnectionState,
    active: Option<Arc<C>>,
}

impl<C: MessageChannel> Default for ConnectionManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MessageChannel> ConnectionManager<C> {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Absent,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The open channel, if any.
    pub fn active(&self) -> Option<&Arc<C>> {
        match self.state {
            ConnectionState::Open => self.active.as_ref(),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.active().is_some()
    }

    /// Marks an outbound attempt as started.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Absent {
            return Err(SessionError::Busy(self.state));
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Records the channel produced by a successful outbound attempt.
    pub fn on_open(&mut self, conn: C) -> Arc<C> {
        let conn = Arc::new(conn);
        info!(peer = %conn.peer(), "Connection established");
        self.active = Some(conn.clone());
        self.state = ConnectionState::Open;
        conn
    }

    /// Records a failed outbound attempt. Terminal for the session.
    pub fn on_connect_failed(&mut self) {
        self.active = None;
        self.state = ConnectionState::Closed;
    }

    /// Admits `conn` as the active channel, or closes it if the session
    /// already has one.
    ///
    /// The rejected channel is closed on its own task, so a transport with
    /// a slow close never holds up the active session.
    pub fn on_incoming_connection(&mut self, conn: C) -> Admission<C> {
        if self.state != ConnectionState::Absent {
            warn!(
                peer = %conn.peer(),
                state = %self.state,
                "Rejecting incoming connection: already connected"
            );
            tokio::spawn(async move {
                conn.close("busy").await;
            });
            return Admission::Rejected;
        }

        info!(peer = %conn.peer(), "Incoming connection accepted");
        let conn = Arc::new(conn);
        self.active = Some(conn.clone());
        self.state = ConnectionState::Open;
        Admission::Accepted(conn)
    }

    /// Forwards one message over the open channel.
    pub async fn send(&self, msg: WireMessage) -> Result<()> {
        let conn = self.active().ok_or(SessionError::NotConnected)?;
        debug!(peer = %conn.peer(), kind = msg.kind(), "sending message");
        conn.send(msg).await
    }

    /// Forgets the channel after the transport reported it closed.
    ///
    /// Returns the channel that was active, if any.
    pub fn on_closed(&mut self) -> Option<Arc<C>> {
        let previous = self.active.take();
        if let Some(conn) = &previous {
            info!(peer = %conn.peer(), "Connection closed");
        }
        self.state = ConnectionState::Absent;
        previous
    }

    /// Closes the active channel locally, e.g. at shutdown.
    pub async fn close(&mut self, reason: &'static str) {
        if let Some(conn) = self.on_closed() {
            conn.close(reason).await;
        }
    }
}
