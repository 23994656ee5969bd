//! Shell process on a pseudo-terminal.
//!
//! [`PtyProcess::spawn`] starts the configured shell on a fresh PTY and hands
//! back two halves: the process itself (input, resize, termination) and a
//! [`PtyOutput`] stream fed by a dedicated reader thread. Splitting them lets
//! the input side be shared while the output side is consumed by a single
//! aggregator task.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ShellConfig;

/// `TERM` value exported to the shell. A dumb terminal keeps most programs
/// from emitting cursor control in the first place.
pub const TERM_VALUE: &str = "dumb";

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the reader thread's output channel, in reads.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long the shell gets to exit after SIGHUP before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to open the PTY or start the shell.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// The shell exited; its terminal no longer accepts input.
    #[error("shell has exited")]
    ChildExited,

    /// The process was already terminated by the bridge.
    #[error("shell already terminated")]
    AlreadyTerminated,

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to stop the shell.
    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Status of the shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStatus {
    /// The shell is still running.
    Running,
    /// The shell exited with a code.
    Exited(u32),
}

/// Sink for bytes destined to the shell's terminal.
///
/// Implemented by [`PtyProcess`]; the router only depends on this trait so
/// it can be exercised without a real terminal.
pub trait ShellInput: Send + Sync {
    /// Writes `data` and flushes it to the terminal.
    fn write_input(&self, data: &[u8]) -> Result<(), PtyError>;
}

/// Outcome of a single [`PtyOutput::read_available`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes produced by the shell (never empty from a real PTY).
    Data(Vec<u8>),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The terminal closed; the shell has exited.
    Eof,
}

/// Read half of a spawned shell.
pub struct PtyOutput {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PtyOutput {
    /// Wraps an existing byte channel. Closing the sender reads as EOF.
    pub fn from_receiver(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Waits up to `timeout` for the next piece of output.
    pub async fn read_available(&mut self, timeout: Duration) -> ReadOutcome {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(data)) => ReadOutcome::Data(data),
            Ok(None) => ReadOutcome::Eof,
            Err(_) => ReadOutcome::Timeout,
        }
    }
}

/// The shell process and the write side of its terminal.
///
/// Dropping a `PtyProcess` whose shell is still running kills and reaps it.
pub struct PtyProcess {
    /// The PTY master handle; taken on terminate to close the descriptor.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The child process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Exit status, once observed.
    exit_code: Mutex<Option<u32>>,

    /// Set once terminate() has run.
    terminated: AtomicBool,

    /// Shell executable, for logging.
    command: String,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns the shell described by `config` on a new PTY.
    ///
    /// The shell inherits the daemon's environment plus `config.env`, with
    /// `TERM` forced to [`TERM_VALUE`].
    pub fn spawn(config: &ShellConfig) -> Result<(Self, PtyOutput), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        if let Some(ref dir) = config.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", TERM_VALUE);

        // Take both master handles before the child exists so a failure
        // here cannot leak a running shell.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {}", config.command, e)))?;

        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        if let Err(e) = spawn_reader(reader, tx, pid) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PtyError::SpawnFailed(format!("reader thread: {}", e)));
        }

        tracing::info!(pid = ?pid, shell = %config.command, "Shell started");

        let process = PtyProcess {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            exit_code: Mutex::new(None),
            terminated: AtomicBool::new(false),
            command: config.command.clone(),
            pid,
        };

        Ok((process, PtyOutput::from_receiver(rx)))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        matches!(self.status(), Ok(ShellStatus::Running))
    }

    /// Checks whether the shell has exited without waiting for it.
    pub fn status(&self) -> Result<ShellStatus, PtyError> {
        let mut exit_code = lock(&self.exit_code);
        if let Some(code) = *exit_code {
            return Ok(ShellStatus::Exited(code));
        }

        match lock(&self.child).try_wait()? {
            Some(status) => {
                let code = status.exit_code();
                *exit_code = Some(code);
                tracing::debug!(pid = ?self.pid, code, "Shell exited");
                Ok(ShellStatus::Exited(code))
            }
            None => Ok(ShellStatus::Running),
        }
    }

    /// Writes data to the shell's terminal and flushes it.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(PtyError::AlreadyTerminated);
        }
        if let ShellStatus::Exited(_) = self.status()? {
            return Err(PtyError::ChildExited);
        }

        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or(PtyError::AlreadyTerminated)?;
        writer.write_all(data).map_err(write_error)?;
        writer.flush().map_err(write_error)?;

        tracing::trace!(pid = ?self.pid, bytes = data.len(), "Wrote to PTY");
        Ok(())
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::AlreadyTerminated)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Stops the shell and closes the terminal.
    ///
    /// Sends SIGHUP, waits briefly for the shell to leave, then kills it.
    /// Blocks for at most the grace period plus the final reap, so async
    /// callers should run it on a blocking thread.
    pub fn terminate(&self) -> Result<ShellStatus, PtyError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Err(PtyError::AlreadyTerminated);
        }

        // Closing our side of the terminal first unblocks a shell stuck on
        // a full output buffer.
        lock(&self.writer).take();
        lock(&self.master).take();

        if let ShellStatus::Exited(code) = self.status()? {
            tracing::info!(pid = ?self.pid, code, "Shell already exited");
            return Ok(ShellStatus::Exited(code));
        }

        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                tracing::debug!(pid, error = %e, "Failed to send SIGHUP");
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if let ShellStatus::Exited(code) = self.status()? {
                tracing::info!(pid = ?self.pid, code, "Shell terminated");
                return Ok(ShellStatus::Exited(code));
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        tracing::warn!(pid = ?self.pid, shell = %self.command, "Shell ignored SIGHUP, killing");

        let mut exit_code = lock(&self.exit_code);
        let mut child = lock(&self.child);
        if let Err(e) = child.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Kill failed, reaping anyway");
        }
        let status = child
            .wait()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;

        let code = status.exit_code();
        *exit_code = Some(code);
        Ok(ShellStatus::Exited(code))
    }
}

impl ShellInput for PtyProcess {
    fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        self.write(data)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let exited = self
            .exit_code
            .get_mut()
            .map(|code| code.is_some())
            .unwrap_or(false);
        if exited {
            return;
        }

        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!(pid = ?self.pid, "Killed shell on drop");
        }
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_eio(error: &io::Error) -> bool {
    error.raw_os_error() == Some(Errno::EIO as i32)
}

fn write_error(error: io::Error) -> PtyError {
    if error.kind() == io::ErrorKind::BrokenPipe || is_eio(&error) {
        PtyError::ChildExited
    } else {
        PtyError::WriteFailed(error.to_string())
    }
}

/// Starts the thread that moves terminal output into `tx`.
///
/// Reads block, so they run on a plain OS thread rather than the runtime.
/// The thread ends at EOF (Linux reports EIO once the shell's side closes)
/// or when the receiver is dropped.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    pid: Option<u32>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(pid = ?pid, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            tracing::trace!(pid = ?pid, "Output receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_eio(&e) => {
                        tracing::debug!(pid = ?pid, "PTY closed - process exited");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(pid = ?pid, error = %e, "Error reading from PTY");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}
