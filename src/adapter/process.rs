//! Subprocess execution with a deadline and cooperative cancellation.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for pipes to close after the process exits. Agents sometimes
/// leave helpers (browser bridges) running that inherit stdout.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);
const DIAGNOSTIC_TAIL_CHARS: usize = 2000;
const READ_CHUNK: usize = 8 * 1024;

/// The process was stopped before it finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("timeout after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Fails on a non-zero exit, quoting the tail of both streams.
    pub fn ensure_success(self) -> anyhow::Result<Self> {
        if self.status.success() {
            return Ok(self);
        }
        anyhow::bail!("exited with {}{}", self.status, self.diagnostic());
    }

    fn diagnostic(&self) -> String {
        let mut out = String::new();
        for (name, text) in [("stderr", &self.stderr), ("stdout", &self.stdout)] {
            let text = text.trim();
            if !text.is_empty() {
                out.push_str(&format!("; {name}: {}", tail(text, DIAGNOSTIC_TAIL_CHARS)));
            }
        }
        out
    }
}

/// Runs `command` to completion, writing `stdin` (if any) and capturing both
/// output streams. The child is killed when `timeout` elapses or `cancel`
/// fires, and the error then has an [`Interrupted`] root cause.
pub async fn run(
    mut command: Command,
    stdin: Option<&str>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<ProcessOutput> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {program}"))?;
    let stdout = spawn_reader(child.stdout.take().context("open stdout")?);
    let stderr = spawn_reader(child.stderr.take().context("open stderr")?);

    let outcome = tokio::select! {
        status = feed_and_wait(&mut child, stdin) => Ok(status),
        _ = tokio::time::sleep(timeout) => Err(Interrupted::Timeout(timeout)),
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
    };

    let status = match outcome {
        Ok(status) => status.with_context(|| format!("run {program}"))?,
        Err(interrupted) => {
            tracing::warn!(program = %program, reason = %interrupted, "killing subprocess");
            if let Err(err) = child.kill().await {
                tracing::warn!(program = %program, error = %err, "kill subprocess");
            }
            stdout.abort();
            stderr.abort();
            return Err(anyhow::Error::new(interrupted)
                .context(format!("{program} did not finish; process killed")));
        }
    };

    let (stdout, stderr) = tokio::join!(
        stdout.collect(&program, "stdout"),
        stderr.collect(&program, "stderr"),
    );
    let (stdout, stderr) = (stdout?, stderr?);

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        elapsed: started.elapsed(),
    })
}

async fn feed_and_wait(child: &mut Child, stdin: Option<&str>) -> anyhow::Result<ExitStatus> {
    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().context("open stdin")?;
        match pipe.write_all(input.as_bytes()).await {
            Ok(()) => {}
            // The child may exit without reading its input.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(err) => return Err(err).context("write stdin"),
        }
        drop(pipe);
    }
    child.wait().await.context("wait for exit")
}

/// Pipe output gathered by a background task. The buffer stays readable if
/// the task has to be abandoned.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl PipeReader {
    fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the pipe to close. A pipe still held open by an orphaned
    /// helper after the grace period yields what was read so far.
    async fn collect(mut self, program: &str, name: &str) -> anyhow::Result<String> {
        let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, &mut self.task).await;
        match drained {
            Ok(joined) => joined
                .with_context(|| format!("join {name} reader"))?
                .with_context(|| format!("read {name}"))?,
            Err(_) => {
                self.task.abort();
                let _ = (&mut self.task).await;
                tracing::warn!(
                    program = %program,
                    stream = name,
                    grace_secs = PIPE_DRAIN_GRACE.as_secs(),
                    "pipe still open after exit; keeping partial output"
                );
            }
        }
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn spawn_reader<R>(mut pipe: R) -> PipeReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let task = tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = pipe.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]);
        }
    });
    PipeReader { buf, task }
}

/// Last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[start..]
}

/// First `max_chars` characters of `text`, and whether anything was cut.
pub fn preview(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (format!("{}...(truncated)", &text[..idx]), true),
        None => (text.to_owned(), false),
    }
}

/// True when the root cause of `err` is a timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.root_cause().downcast_ref::<Interrupted>(),
        Some(Interrupted::Timeout(_))
    )
}
