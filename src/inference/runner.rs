use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Semaphore,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{parse_payload, ImageGenerator};
use crate::error::InferenceError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
const STDERR_TAIL_BYTES: usize = 8 * 1024;
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs the external generation script, one process per image.
///
/// Every call passes `--model_path <dir> --prompt <text>` after the configured
/// leading arguments. The number of processes alive at once across all callers
/// is capped by `max_concurrent`.
#[derive(Debug, Clone)]
pub struct InferenceRunner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl InferenceRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Generates one image. The process runs on its own task: if the returned
    /// future is dropped the process still runs to completion and is reaped,
    /// and its output is discarded.
    pub async fn run(&self, model_path: &Path, prompt: &str) -> Result<Bytes, InferenceError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| InferenceError::ProcessLaunch {
                program: self.program.clone(),
                source: io::Error::new(io::ErrorKind::Other, "inference runner shut down"),
            })?;

        let mut args = self.args.clone();
        args.push("--model_path".into());
        args.push(model_path.to_string_lossy().into_owned());
        args.push("--prompt".into());
        args.push(prompt.to_string());
        let invocation = Invocation {
            program: self.program.clone(),
            args,
            timeout: self.timeout,
        };

        let task = tokio::spawn(async move {
            let _permit = permit;
            invocation.execute().await
        });
        match task.await {
            Ok(result) => result,
            Err(join) => Err(InferenceError::NonZeroExit {
                code: None,
                stderr: format!("inference task did not complete: {join}"),
            }),
        }
    }
}

#[async_trait]
impl ImageGenerator for InferenceRunner {
    async fn generate(&self, model_path: &Path, prompt: &str) -> Result<Bytes, InferenceError> {
        self.run(model_path, prompt).await
    }
}

struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl Invocation {
    async fn execute(self) -> Result<Bytes, InferenceError> {
        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // own group, so helpers the script forks are killed along with it
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|source| InferenceError::ProcessLaunch {
                program: self.program.clone(),
                source,
            })?;
        let pid = child.id();
        info!(program = ?self.program, pid = ?pid, "inference process started");

        let mut stdout = tokio::spawn(drain(child.stdout.take()));
        let mut stderr = tokio::spawn(drain(child.stderr.take()));
        let timeout = self.timeout;
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                warn!(?timeout, "inference process timed out; killing it");
                kill_group(pid);
                child.kill().await.map(|_| None)
            }
        };
        // the script is done; anything still holding its pipes goes too
        kill_group(pid);
        let stdout = collect(&mut stdout).await;
        let stderr = collect(&mut stderr).await;

        let status: Option<ExitStatus> = status.map_err(|err| InferenceError::NonZeroExit {
            code: None,
            stderr: format!("failed waiting for inference process: {err}"),
        })?;
        let stderr = stderr_tail(&stderr);
        debug!(elapsed = ?started.elapsed(), ?status, "inference process finished");

        match status {
            None => Err(InferenceError::NonZeroExit {
                code: None,
                stderr: format!("timed out after {timeout:?}\n{stderr}"),
            }),
            Some(status) if !status.success() => {
                warn!(code = ?status.code(), "inference process failed");
                Err(InferenceError::NonZeroExit {
                    code: status.code(),
                    stderr,
                })
            }
            Some(_) => parse_payload(&stdout),
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: signalling a process group has no memory-safety preconditions
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn drain<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(error) = pipe.read_to_end(&mut buf).await {
            debug!("stopped reading inference output: {error}");
        }
    }
    buf
}

/// Output of a drain task, given up on after `DRAIN_GRACE`.
async fn collect(task: &mut JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_GRACE, &mut *task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(error)) => {
            debug!("inference output reader failed: {error}");
            Vec::new()
        }
        Err(_) => {
            warn!("inference output still open after the process exited; abandoning it");
            task.abort();
            Vec::new()
        }
    }
}

/// Last `STDERR_TAIL_BYTES` of stderr, cut on a character boundary.
fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
