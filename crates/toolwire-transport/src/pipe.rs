//! Child-process transport.
//!
//! Frames are newline-delimited JSON: one object per line on the child's
//! stdin and stdout. The child's stderr is forwarded to `tracing`.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use toolwire_core::{EventSink, InboundEvents, Transport, TransportError, TransportKind};

/// How long `close` waits for the child to exit on EOF before killing it.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames queued for the child's stdin before `send` waits.
const OUTBOUND_CAPACITY: usize = 256;

/// Program and arguments for the child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl PipeCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Split a shell-style command line into program and arguments.
    ///
    /// # Errors
    /// Returns error if the line cannot be parsed or is empty.
    pub fn parse(command_line: &str) -> Result<Self, TransportError> {
        let mut parts = shlex::split(command_line)
            .ok_or_else(|| {
                TransportError::ConnectFailed(format!("cannot parse command: {command_line}"))
            })?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| TransportError::ConnectFailed("empty command".to_string()))?;
        Ok(Self::new(program).args(parts))
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Resolve the program to a path. Explicit paths are used as given;
    /// bare names are looked up on `PATH`.
    async fn resolve(&self) -> Result<PathBuf, TransportError> {
        let path = Path::new(&self.program);
        if path.is_absolute() || path.components().count() > 1 {
            return Ok(path.to_path_buf());
        }
        let program = self.program.clone();
        tokio::task::spawn_blocking(move || which::which(program))
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?
            .map_err(|e| {
                TransportError::ConnectFailed(format!("executable not found: {}: {e}", self.program))
            })
    }
}

struct Writer {
    frames: mpsc::Sender<Bytes>,
    events: EventSink,
    task: JoinHandle<()>,
}

struct Process {
    child: AsyncGroupChild,
    events: EventSink,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// Transport over a child process's stdio.
pub struct PipeTransport {
    command: PipeCommand,
    close_timeout: Duration,
    writer: Mutex<Option<Writer>>,
    process: tokio::sync::Mutex<Option<Process>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipeTransport {
    #[must_use]
    pub fn new(command: PipeCommand) -> Self {
        Self {
            command,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            writer: Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Bound on how long `close` waits for a graceful exit.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn command(&self) -> &PipeCommand {
        &self.command
    }

    fn build_command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.command.working_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Stop the writer without waiting on it. Dropping stdin signals EOF
    /// to the child.
    fn stop_writer(&self) {
        if let Some(writer) = lock(&self.writer).take() {
            writer.task.abort();
        }
    }

    async fn shutdown(&self, mut process: Process) {
        process.events.terminate(None).await;
        match tokio::time::timeout(self.close_timeout, process.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "child process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed waiting for child process"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.close_timeout.as_millis(),
                    "child process did not exit in time, killing"
                );
                if let Err(e) = process.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill child process");
                }
            }
        }
        process.reader.abort();
        if let Some(stderr) = process.stderr {
            stderr.abort();
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn connect(&self) -> Result<InboundEvents, TransportError> {
        let mut process = self.process.lock().await;
        if let Some(stale) = process.take() {
            stale.events.terminate(None).await;
            self.stop_writer();
            self.shutdown(stale).await;
        }

        let program = self.command.resolve().await?;
        let mut child = self.build_command(&program).group_spawn().map_err(|e| {
            TransportError::ConnectFailed(format!("failed to spawn {}: {e}", program.display()))
        })?;

        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.start_kill();
            return Err(TransportError::ConnectFailed(
                "child stdio unavailable".to_string(),
            ));
        };
        let stderr = child
            .inner()
            .stderr
            .take()
            .map(|stderr| tokio::spawn(log_stderr(stderr, self.command.program.clone())));

        let (events, inbound) = EventSink::channel();
        let reader = tokio::spawn(read_frames(stdout, events.clone()));

        tracing::info!(
            program = %program.display(),
            pid = child.id(),
            "pipe transport connected"
        );
        let (frames, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let task = tokio::spawn(write_frames(stdin, outbound, events.clone()));
        if let Some(stale) = lock(&self.writer).replace(Writer {
            frames,
            events: events.clone(),
            task,
        }) {
            stale.task.abort();
        }
        *process = Some(Process {
            child,
            events,
            reader,
            stderr,
        });
        Ok(inbound)
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.contains(&b'\n') {
            return Err(TransportError::Write(
                "frame contains a line break".to_string(),
            ));
        }
        let frames = {
            let writer = lock(&self.writer);
            let writer = writer.as_ref().ok_or(TransportError::NotConnected)?;
            if writer.events.is_terminated() {
                return Err(TransportError::Closed);
            }
            writer.frames.clone()
        };
        // Waits only while the queue is full; write errors arrive as the
        // terminal event.
        frames.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_writer();
        let Some(process) = self.process.lock().await.take() else {
            return Ok(());
        };
        // Terminate first so the child's EOF is not reported as unexpected.
        process.events.terminate(None).await;
        self.shutdown(process).await;
        tracing::debug!(program = %self.command.program, "pipe transport closed");
        Ok(())
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        let writer = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = writer.take() {
            writer.task.abort();
        }
        if let Some(process) = self.process.get_mut() {
            let _ = process.child.start_kill();
            process.reader.abort();
        }
    }
}

async fn write_frames(mut stdin: ChildStdin, mut frames: mpsc::Receiver<Bytes>, events: EventSink) {
    while let Some(frame) = frames.recv().await {
        let result = async {
            stdin.write_all(&frame).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            events
                .terminate(Some(TransportError::Write(e.to_string())))
                .await;
            return;
        }
    }
}

/// Lines are handed on as raw bytes; decoding, and dropping what does not
/// decode, is up to the consumer.
async fn read_frames(stdout: ChildStdout, events: EventSink) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                events
                    .terminate(Some(TransportError::UnexpectedClose(
                        "child process closed stdout".to_string(),
                    )))
                    .await;
                return;
            }
            Ok(_) => {
                let frame = line.trim_ascii();
                if frame.is_empty() {
                    continue;
                }
                if !events.frame(Bytes::copy_from_slice(frame)).await {
                    return;
                }
            }
            Err(e) => {
                events.terminate(Some(TransportError::from(e))).await;
                return;
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr, program: String) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(line.trim_ascii_end());
                tracing::debug!(target: "toolwire::pipe::stderr", program = %program, "{text}");
            }
        }
    }
}
