//! PTY events bridged from reader threads into the async core.
//!
//! Each PTY gets a dedicated blocking reader thread (reads from the PTY
//! master never wake an async executor). The thread forwards chunks over an
//! unbounded channel as [`PtyEvent`]s; the registry consumes them, updates
//! terminal state, and re-emits routed output.

/// Events emitted by PTY reader threads and the supervisor.
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// Raw output bytes read from one PTY master.
    ///
    /// Strictly ordered per terminal (one reader thread each); no ordering
    /// across terminals.
    Output {
        /// Terminal id the bytes belong to.
        id: String,
        /// The chunk, exactly as read.
        data: Vec<u8>,
    },

    /// The child process exited or the PTY reached EOF.
    ///
    /// Also fires when the broker itself kills the child; consumers must
    /// tolerate ids that are no longer registered.
    Exited {
        /// Terminal id whose child is gone.
        id: String,
    },
}

impl PtyEvent {
    /// Create an output event.
    #[must_use]
    pub fn output(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Output {
            id: id.into(),
            data: data.into(),
        }
    }

    /// Create an exited event.
    #[must_use]
    pub fn exited(id: impl Into<String>) -> Self {
        Self::Exited { id: id.into() }
    }

    /// The terminal id this event concerns.
    #[must_use]
    pub fn terminal_id(&self) -> &str {
        match self {
            Self::Output { id, .. } | Self::Exited { id } => id,
        }
    }
}
