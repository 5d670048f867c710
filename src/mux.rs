//! Terminal multiplexer adapter.
//!
//! Provides a trait-based abstraction ([`Multiplexer`]) over the external
//! terminal multiplexer, with a concrete [`TmuxAdapter`] that execs the
//! `tmux` CLI. The multiplexer owns session persistence across broker
//! restarts; the broker only creates, enumerates, addresses, and kills
//! sessions through this seam.
//!
//! Design notes:
//! - All invocations pass arguments as a vector — nothing is ever
//!   interpolated through a shell.
//! - Every call is bounded by [`MUX_COMMAND_TIMEOUT`]; expiry maps to
//!   [`MuxError::Timeout`] so a hung tmux can never block a caller.
//! - The multiplexer is shared machine state: sessions may appear or
//!   disappear between calls, so absence is tolerated wherever it is
//!   harmless (`kill_session` is idempotent, `list_sessions` fails soft).

// Rust guideline compliant 2026-02

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::constants::MUX_COMMAND_TIMEOUT;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from multiplexer operations.
#[derive(Debug)]
pub enum MuxError {
    /// The multiplexer binary is not installed or not found in PATH.
    NotInstalled,
    /// The invocation exceeded [`MUX_COMMAND_TIMEOUT`].
    Timeout { command: String },
    /// `create_session` raced with an existing session of the same name.
    SessionExists { name: String },
    /// A multiplexer command failed with the given stderr message.
    CommandFailed { command: String, stderr: String },
    /// An I/O error occurred spawning or communicating with the binary.
    Io(std::io::Error),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::NotInstalled => write!(f, "tmux is not installed or not in PATH"),
            MuxError::Timeout { command } => {
                write!(
                    f,
                    "tmux command timed out after {}s: `{}`",
                    MUX_COMMAND_TIMEOUT.as_secs(),
                    command
                )
            }
            MuxError::SessionExists { name } => {
                write!(f, "tmux session already exists: {}", name)
            }
            MuxError::CommandFailed { command, stderr } => {
                write!(f, "tmux command failed: `{}`: {}", command, stderr)
            }
            MuxError::Io(e) => write!(f, "tmux I/O error: {}", e),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MuxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            MuxError::NotInstalled
        } else {
            MuxError::Io(err)
        }
    }
}

/// Result alias for multiplexer operations.
pub type MuxResult<T> = Result<T, MuxError>;

// ---------------------------------------------------------------------------
// Multiplexer trait
// ---------------------------------------------------------------------------

/// Trait abstracting terminal multiplexer operations.
///
/// The registry and recovery service depend on this seam rather than on
/// tmux directly, which also lets tests substitute an in-memory backend.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Enumerate current session names.
    ///
    /// Fails soft: a missing or stopped multiplexer yields an empty list.
    async fn list_sessions(&self) -> Vec<String>;

    /// Whether a session with this exact name currently exists.
    async fn session_exists(&self, name: &str) -> bool;

    /// Start a detached session with the given name and working directory,
    /// optionally running `command` instead of the default shell.
    async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: Option<&str>,
    ) -> MuxResult<()>;

    /// Destroy a session. Absence is success.
    async fn kill_session(&self, name: &str) -> MuxResult<()>;

    /// Send text as if typed, preserving every byte including
    /// shell-special characters. `target` is a session name or a fully
    /// qualified pane reference (`session:window.pane`).
    async fn send_literal(&self, target: &str, text: &str) -> MuxResult<()>;

    /// Send a named key (e.g. `Enter`) interpreted by the multiplexer.
    async fn send_key(&self, target: &str, key: &str) -> MuxResult<()>;

    /// Current working directory of the session's active pane, if the
    /// multiplexer can report one.
    async fn pane_current_path(&self, name: &str) -> Option<std::path::PathBuf>;

    /// Whether the multiplexer server is reachable at all.
    async fn server_alive(&self) -> bool;

    /// Argv for a PTY child that attaches to the named session.
    fn attach_argv(&self, session_name: &str) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// TmuxAdapter
// ---------------------------------------------------------------------------

/// Concrete [`Multiplexer`] implementation that execs `tmux`.
#[derive(Debug, Clone)]
pub struct TmuxAdapter {
    binary: String,
}

impl Default for TmuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxAdapter {
    /// Adapter using the `tmux` binary from PATH.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }

    /// Adapter using a specific binary. Lets tests point at a nonexistent
    /// binary to exercise the fail-soft paths.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `tmux <args>` with the standard timeout, capturing output.
    async fn run(&self, args: &[&str]) -> MuxResult<std::process::Output> {
        let rendered = format!("{} {}", self.binary, args.join(" "));
        log::debug!("[mux] exec: {rendered}");

        let fut = Command::new(&self.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output();

        match tokio::time::timeout(MUX_COMMAND_TIMEOUT, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(MuxError::from(e)),
            Err(_elapsed) => Err(MuxError::Timeout { command: rendered }),
        }
    }

    /// Run a command and map a non-zero exit status to `CommandFailed`.
    async fn run_checked(&self, args: &[&str]) -> MuxResult<std::process::Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(MuxError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    async fn list_sessions(&self) -> Vec<String> {
        // `list-sessions` exits non-zero when no server is running; both
        // that and a missing binary degrade to "no sessions".
        match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                log::debug!("[mux] list_sessions unavailable: {e}");
                Vec::new()
            }
        }
    }

    async fn session_exists(&self, name: &str) -> bool {
        // Exact-match filter: has-session treats the name as a prefix.
        matches!(
            self.run(&["has-session", "-t", &format!("={name}")]).await,
            Ok(output) if output.status.success()
        )
    }

    async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        command: Option<&str>,
    ) -> MuxResult<()> {
        let dir = working_dir.to_string_lossy();
        let mut args = vec!["new-session", "-d", "-s", name, "-c", dir.as_ref()];
        if let Some(cmd) = command {
            args.push(cmd);
        }
        match self.run_checked(&args).await {
            Ok(_) => Ok(()),
            Err(MuxError::CommandFailed { stderr, .. }) if stderr.contains("duplicate session") => {
                Err(MuxError::SessionExists {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn kill_session(&self, name: &str) -> MuxResult<()> {
        match self.run_checked(&["kill-session", "-t", &format!("={name}")]).await {
            Ok(_) => Ok(()),
            // Already gone — idempotent success.
            Err(MuxError::CommandFailed { stderr, .. })
                if stderr.contains("can't find session") || stderr.contains("no server") =>
            {
                Ok(())
            }
            Err(MuxError::NotInstalled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_literal(&self, target: &str, text: &str) -> MuxResult<()> {
        // `-l` disables key-name lookup so the text arrives byte-for-byte.
        self.run_checked(&["send-keys", "-t", target, "-l", text])
            .await
            .map(|_| ())
    }

    async fn send_key(&self, target: &str, key: &str) -> MuxResult<()> {
        self.run_checked(&["send-keys", "-t", target, key])
            .await
            .map(|_| ())
    }

    async fn pane_current_path(&self, name: &str) -> Option<std::path::PathBuf> {
        let output = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                &format!("={name}"),
                "#{pane_current_path}",
            ])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            None
        } else {
            Some(std::path::PathBuf::from(path))
        }
    }

    async fn server_alive(&self) -> bool {
        matches!(
            self.run(&["list-sessions"]).await,
            Ok(output) if output.status.success()
        )
    }

    fn attach_argv(&self, session_name: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            format!("={session_name}"),
        ]
    }
}
