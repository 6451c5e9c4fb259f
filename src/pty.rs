//! PTY process wrapper.
//!
//! Owns one shell spawned on a pseudo-terminal. Output and process exit are
//! exposed as channels so the relay can wait on them next to its socket.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::error::{RelayError, RelayResult};

pub const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_OUTPUT_CHANNEL_SIZE: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What to run and how the terminal should look at spawn time.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    /// Added on top of the server's own environment.
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Window size and liveness of one PTY.
///
/// Shared between the owning relay and the session registry so resize
/// requests can reach the terminal without touching the process itself.
pub struct PtyControl {
    pid: u32,
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Set in the same critical section that reaps the child, so nothing
    /// holding this lock can signal a pid that has already been freed.
    exited: Mutex<bool>,
}

impl PtyControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !*self.exited.lock()
    }

    /// Ask the OS to change the terminal window size.
    pub fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        if !self.is_alive() {
            return Err(RelayError::Resize {
                pid: self.pid,
                reason: "process has exited".to_string(),
            });
        }
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::Resize {
                pid: self.pid,
                reason: e.to_string(),
            })
    }

    /// Current window size as reported by the OS, `(cols, rows)`.
    pub fn size(&self) -> RelayResult<(u16, u16)> {
        let size = self.master.lock().get_size().map_err(|e| RelayError::Resize {
            pid: self.pid,
            reason: e.to_string(),
        })?;
        Ok((size.cols, size.rows))
    }
}

/// Write side and kill switch of a spawned process. Only the owning relay
/// holds one. Dropping it kills the process.
pub struct PtyHandle {
    pid: u32,
    control: Arc<PtyControl>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
}

impl PtyHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn control(&self) -> Arc<PtyControl> {
        Arc::clone(&self.control)
    }

    /// Queue bytes for the process input, preserving order. Never waits on
    /// the process, so a child that stops reading cannot stall the caller.
    pub fn write(&self, data: Vec<u8>) -> RelayResult<()> {
        if !self.control.is_alive() {
            return Err(RelayError::WriteAfterExit(self.pid));
        }
        self.input_tx
            .send(data)
            .map_err(|_| RelayError::WriteAfterExit(self.pid))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        self.control.resize(cols, rows)
    }

    /// Terminate the process. Safe to call repeatedly or after exit.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let exited = self.control.exited.lock();
        if *exited {
            debug!(pid = self.pid, "Process already exited, nothing to kill");
            return;
        }
        if let Err(e) = self.killer.lock().kill() {
            warn!(pid = self.pid, error = %e, "Failed to kill PTY process");
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Ordered stream of output chunks. Ends once the PTY reports EOF.
pub struct PtyOutput {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PtyOutput {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Fires once when the process terminates.
pub struct ExitSignal {
    rx: Option<oneshot::Receiver<Option<u32>>>,
}

impl ExitSignal {
    /// Resolves with the exit code the first time; pending forever after.
    pub async fn wait(&mut self) -> Option<u32> {
        match self.rx.as_mut() {
            Some(rx) => {
                let code = rx.await.ok().flatten();
                self.rx = None;
                code
            }
            None => std::future::pending().await,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.rx.is_none()
    }
}

/// A freshly spawned process, split so its parts can be awaited concurrently.
pub struct PtyProcess {
    pub handle: PtyHandle,
    pub output: PtyOutput,
    pub exit: ExitSignal,
}

impl PtyProcess {
    pub fn spawn(opts: &SpawnOptions) -> RelayResult<Self> {
        let spawn_err = |reason: String| RelayError::Spawn {
            command: opts.command.clone(),
            reason,
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err(format!("failed to open PTY: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err(format!("failed to take PTY writer: {e}")))?;

        let mut cmd = CommandBuilder::new(&opts.command);
        cmd.args(&opts.args);
        if let Some(cwd) = &opts.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(e.to_string()))?;
        // The child holds its own copy; ours would keep the PTY open past exit.
        drop(pair.slave);

        let Some(pid) = child.process_id() else {
            let _ = child.kill();
            return Err(spawn_err("process id unavailable".to_string()));
        };

        let killer = child.clone_killer();
        let control = Arc::new(PtyControl {
            pid,
            master: Mutex::new(pair.master),
            exited: Mutex::new(false),
        });

        let (output_tx, output_rx) = mpsc::channel(PTY_OUTPUT_CHANNEL_SIZE);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        spawn_reader_thread(pid, reader, output_tx);
        spawn_writer_thread(pid, writer, input_rx);
        spawn_waiter_thread(pid, child, Arc::clone(&control), exit_tx);

        info!(pid, command = %opts.command, cols = opts.cols, rows = opts.rows, "PTY process spawned");

        Ok(Self {
            handle: PtyHandle {
                pid,
                control,
                input_tx,
                killer: Mutex::new(killer),
                killed: AtomicBool::new(false),
            },
            output: PtyOutput { rx: output_rx },
            exit: ExitSignal { rx: Some(exit_rx) },
        })
    }
}

fn spawn_reader_thread(pid: u32, mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        let mut total_bytes_read: usize = 0;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes_read += n;
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        debug!(pid, "Output receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO once the last slave descriptor closes.
                Err(e) => {
                    debug!(pid, error = %e, "PTY read ended");
                    break;
                }
            }
        }

        debug!(pid, total_bytes_read, "Reader thread finished");
    });
}

fn spawn_writer_thread(
    pid: u32,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        let mut total_bytes_written: usize = 0;

        while let Some(data) = input_rx.blocking_recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(pid, error = %e, errno = ?e.raw_os_error(), "PTY write error");
                    return;
                }
            }
            total_bytes_written += data.len();
        }

        debug!(pid, total_bytes_written, "Writer thread finished");
    });
}

fn spawn_waiter_thread(
    pid: u32,
    mut child: Box<dyn Child + Send>,
    control: Arc<PtyControl>,
    exit_tx: oneshot::Sender<Option<u32>>,
) {
    std::thread::spawn(move || {
        // Poll rather than block in wait(): reaping has to happen under the
        // exit lock that kill() takes.
        let code = loop {
            {
                let mut exited = control.exited.lock();
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *exited = true;
                        break Some(status.exit_code());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to wait for PTY process");
                        *exited = true;
                        break None;
                    }
                }
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };
        info!(pid, exit_code = ?code, "PTY process exited");
        let _ = exit_tx.send(code);
    });
}
