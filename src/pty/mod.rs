//! PTY supervision for broker terminals.
//!
//! Each terminal is backed by one OS child process running in a
//! pseudo-terminal. For multiplexer-backed terminals the child is
//! `tmux attach-session -t <session>`, so killing the child detaches from
//! the session without destroying it; plain terminals run the configured
//! shell directly.
//!
//! # Architecture
//!
//! ```text
//! PtySupervisor
//! └── shells: id → PtyProcess
//!     ├── master: MasterPty        (resize)
//!     ├── writer: Write            (input)
//!     ├── child:  Child            (kill / wait)
//!     └── reader thread ──chunks──► PtyEvent channel ──► registry
//! ```
//!
//! Resizes are debounced per terminal: a burst of resize calls applies only
//! the final `(cols, rows)` pair after [`RESIZE_DEBOUNCE`], and calls that
//! do not change the dimensions are suppressed entirely. The multiplexer
//! manages its own layout, so forwarding every intermediate container size
//! corrupts rendering on the client side.

// Rust guideline compliant 2026-02

pub mod events;

pub use events::PtyEvent;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::{PTY_EXIT_GRACE, RESIZE_DEBOUNCE};

/// Default terminal dimensions before the first client resize arrives.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal dimensions before the first client resize arrives.
pub const DEFAULT_ROWS: u16 = 24;

/// Everything needed to start one terminal's child process.
#[derive(Debug, Clone)]
pub struct PtySpawnParams {
    /// Terminal id; also the multiplexer session name for attached ones.
    pub id: String,
    /// Child argv. The registry supplies the multiplexer attach command
    /// (or the bare shell) here; the supervisor never interprets it.
    pub argv: Vec<String>,
    /// Opaque type tag, advertised to the child environment.
    pub terminal_type: String,
    /// Human label, advertised to the child environment.
    pub name: String,
    /// Working directory the child starts in.
    pub working_dir: PathBuf,
    /// Initial dimensions; `None` uses the defaults.
    pub cols: Option<u16>,
    /// Initial dimensions; `None` uses the defaults.
    pub rows: Option<u16>,
}

/// State for a single live PTY.
struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send>,
    /// Last dimensions actually applied to the PTY.
    cols: u16,
    rows: u16,
    /// Most recent requested dimensions waiting for the debounce window.
    pending_resize: Option<(u16, u16)>,
    /// Whether a debounce timer task is already scheduled for this PTY.
    debounce_armed: bool,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("pending_resize", &self.pending_resize)
            .finish_non_exhaustive()
    }
}

/// Owns every live PTY child and its reader thread.
#[derive(Debug)]
pub struct PtySupervisor {
    shells: Mutex<HashMap<String, PtyProcess>>,
    events_tx: UnboundedSender<PtyEvent>,
}

impl PtySupervisor {
    /// Create a supervisor that reports output and exits on `events_tx`.
    #[must_use]
    pub fn new(events_tx: UnboundedSender<PtyEvent>) -> Self {
        Self {
            shells: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    /// Spawn the child process for one terminal and start streaming its
    /// output. Fails if the id is already supervised or the spawn fails.
    pub fn spawn(&self, params: &PtySpawnParams) -> Result<()> {
        {
            let shells = self.shells.lock().expect("shells lock poisoned");
            if shells.contains_key(&params.id) {
                bail!("PTY already exists for terminal {}", params.id);
            }
        }

        let cols = params.cols.unwrap_or(DEFAULT_COLS);
        let rows = params.rows.unwrap_or(DEFAULT_ROWS);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let cmd = build_command(params)?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn PTY child for {}", params.id))?;

        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;

        spawn_reader_thread(params.id.clone(), reader, self.events_tx.clone());

        let mut shells = self.shells.lock().expect("shells lock poisoned");
        shells.insert(
            params.id.clone(),
            PtyProcess {
                master: pair.master,
                writer,
                child,
                cols,
                rows,
                pending_resize: None,
                debounce_armed: false,
            },
        );

        log::info!("[pty] spawned terminal {} ({}x{})", params.id, cols, rows);
        Ok(())
    }

    /// Forward raw input bytes to the PTY master.
    ///
    /// Writing to a terminal that is gone is a logged no-op; input races
    /// teardown routinely during tab close.
    pub fn write(&self, id: &str, data: &[u8]) {
        let mut shells = self.shells.lock().expect("shells lock poisoned");
        match shells.get_mut(id) {
            Some(proc) => {
                if let Err(e) = proc.writer.write_all(data).and_then(|()| proc.writer.flush()) {
                    log::warn!("[pty] write to terminal {id} failed: {e}");
                }
            }
            None => log::debug!("[pty] dropped {} input bytes for unknown terminal {id}", data.len()),
        }
    }

    /// Request a resize, debounced per terminal.
    ///
    /// Returns the dimensions that will be applied, or an error when the
    /// terminal is unknown (callers treat that as soft during startup
    /// races). No-change requests are suppressed.
    pub fn resize(self: &Arc<Self>, id: &str, cols: u16, rows: u16) -> Result<(u16, u16)> {
        let mut shells = self.shells.lock().expect("shells lock poisoned");
        let Some(proc) = shells.get_mut(id) else {
            bail!("resize for unknown terminal {id}");
        };

        if proc.pending_resize.is_none() && proc.cols == cols && proc.rows == rows {
            return Ok((cols, rows));
        }

        proc.pending_resize = Some((cols, rows));
        if !proc.debounce_armed {
            proc.debounce_armed = true;
            let supervisor = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(RESIZE_DEBOUNCE).await;
                supervisor.apply_pending_resize(&id);
            });
        }
        Ok((cols, rows))
    }

    /// Apply the most recent pending resize for a terminal, if any.
    fn apply_pending_resize(&self, id: &str) {
        let mut shells = self.shells.lock().expect("shells lock poisoned");
        let Some(proc) = shells.get_mut(id) else {
            return;
        };
        proc.debounce_armed = false;
        let Some((cols, rows)) = proc.pending_resize.take() else {
            return;
        };
        if proc.cols == cols && proc.rows == rows {
            return;
        }
        let result = proc.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        match result {
            Ok(()) => {
                proc.cols = cols;
                proc.rows = rows;
                log::debug!("[pty] resized terminal {id} to {cols}x{rows}");
            }
            Err(e) => log::warn!("[pty] resize of terminal {id} failed: {e}"),
        }
    }

    /// Last applied dimensions for a terminal.
    #[must_use]
    pub fn dims(&self, id: &str) -> Option<(u16, u16)> {
        let shells = self.shells.lock().expect("shells lock poisoned");
        shells.get(id).map(|p| (p.cols, p.rows))
    }

    /// Whether a PTY is currently supervised under this id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.shells
            .lock()
            .expect("shells lock poisoned")
            .contains_key(id)
    }

    /// Number of supervised PTYs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shells.lock().expect("shells lock poisoned").len()
    }

    /// Kill a terminal's child process and forget it.
    ///
    /// Without `force` the child first gets an EOF (master dropped) and a
    /// bounded window to exit on its own; with `force` it is killed
    /// immediately. Unknown ids are a no-op.
    pub fn kill(&self, id: &str, force: bool) {
        let proc = {
            let mut shells = self.shells.lock().expect("shells lock poisoned");
            shells.remove(id)
        };
        let Some(proc) = proc else {
            log::debug!("[pty] kill for unknown terminal {id}");
            return;
        };
        log::info!("[pty] killing terminal {id} (force={force})");
        // Teardown blocks on child exit; keep it off the async runtime.
        thread::spawn(move || teardown_process(proc, force));
    }

    /// Tear down every supervised PTY for shutdown.
    ///
    /// With `force`, children are killed immediately; otherwise each gets
    /// the usual exit grace. Multiplexer sessions are untouched either
    /// way — detaching is the whole point of attach-mode children.
    pub fn cleanup_with_grace(&self, force: bool) {
        let drained: Vec<(String, PtyProcess)> = {
            let mut shells = self.shells.lock().expect("shells lock poisoned");
            shells.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        log::info!(
            "[pty] shutting down {} terminal(s) (force={force})",
            drained.len()
        );
        let handles: Vec<_> = drained
            .into_iter()
            .map(|(_, proc)| thread::spawn(move || teardown_process(proc, force)))
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Kill path shared by single kill and shutdown.
///
/// Dropping the master and writer first sends EOF/SIGHUP to the child, so
/// a tmux attach client exits cleanly and the session survives.
fn teardown_process(mut proc: PtyProcess, force: bool) {
    drop(proc.writer);
    drop(proc.master);

    if !force {
        let deadline = std::time::Instant::now() + PTY_EXIT_GRACE;
        while std::time::Instant::now() < deadline {
            match proc.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(std::time::Duration::from_millis(50)),
                Err(_) => break,
            }
        }
    }

    if let Err(e) = proc.child.kill() {
        log::debug!("[pty] kill failed (child likely already gone): {e}");
    }
    // Reap so no zombie lingers.
    let _ = proc.child.wait();
}

/// Build the child command for a terminal.
fn build_command(params: &PtySpawnParams) -> Result<CommandBuilder> {
    let Some((program, args)) = params.argv.split_first() else {
        bail!("empty argv for terminal {}", params.id);
    };
    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }
    cmd.cwd(&params.working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("TERMINAL_TABS_PROCESS", "1");
    cmd.env("TERMINAL_TABS_TYPE", &params.terminal_type);
    cmd.env("TERMINAL_TABS_NAME", &params.name);
    cmd.env("TERMINAL_TABS_ID", &params.id);
    Ok(cmd)
}

/// Reader thread: blocking read loop on the PTY master.
///
/// Chunks go out as [`PtyEvent::Output`]; EOF or a read error means the
/// child is gone and emits [`PtyEvent::Exited`]. The channel is unbounded,
/// so a busy terminal never blocks its own reader; backpressure is applied
/// later, per client, by the ownership router.
fn spawn_reader_thread(
    id: String,
    mut reader: Box<dyn Read + Send>,
    events_tx: UnboundedSender<PtyEvent>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if events_tx.send(PtyEvent::output(id.clone(), &buf[..n])).is_err() {
                        // Registry is gone; broker is shutting down.
                        return;
                    }
                }
            }
        }
        let _ = events_tx.send(PtyEvent::exited(id.clone()));
        log::debug!("[pty] reader thread for {id} exiting");
    });
}
