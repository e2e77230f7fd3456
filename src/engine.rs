//! Thin adapter around the container engine CLI.
//!
//! Every invocation is `prefix ++ [program] ++ args`. An empty prefix runs the
//! engine locally; a non-empty one (typically a remote shell invocation) runs
//! it wherever the prefix points. The adapter never interprets stdout.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default deadline for local engine calls.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline when a command prefix redirects calls to a remote host.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(20);

/// Captured result of one engine invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl EngineOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the engine complained about an unknown container, volume or image.
    pub fn reports_missing(&self) -> bool {
        let stderr = self.stderr.to_ascii_lowercase();
        stderr.contains("no such container")
            || stderr.contains("no such object")
            || stderr.contains("no such volume")
            || stderr.contains("no such image")
    }

    /// Turn a non-zero exit into `Error::Engine`, keeping stderr verbatim.
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Engine {
                command: command.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Spawns a fully formed command line. Implemented by [`ProcessRunner`] for real
/// use and by scripted fakes in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<EngineOutput>;

    /// Like `run`, but hands every stdout line to `on_line` as it arrives.
    async fn run_lines(
        &self,
        argv: &[String],
        timeout: Duration,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<EngineOutput> {
        let output = self.run(argv, None, timeout).await?;
        for line in output.stdout.lines() {
            on_line(line);
        }
        Ok(output)
    }
}

/// Runs commands as child processes on the tokio runtime.
pub struct ProcessRunner;

impl ProcessRunner {
    fn command(argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::EngineMissing("empty command line".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        suppress_console(&mut cmd);
        Ok(cmd)
    }
}

#[cfg(windows)]
fn suppress_console(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn suppress_console(_cmd: &mut Command) {}

fn spawn_error(program: &str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::EngineMissing(format!("{} not found on PATH", program))
    } else {
        Error::Io(e)
    }
}

fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<EngineOutput> {
        let mut cmd = Self::command(argv)?;
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        let mut child = cmd.spawn().map_err(|e| spawn_error(&argv[0], e))?;

        let pipe = child.stdin.take();
        let input = stdin.map(|s| s.to_vec());
        let exchange = async move {
            // Feed stdin while collecting output; a child that exits early
            // closes its end and must still report its own exit code and stderr.
            let feed = async move {
                if let (Some(data), Some(mut pipe)) = (input, pipe) {
                    match pipe.write_all(&data).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            debug!("Child closed stdin before reading all input");
                        }
                        Err(e) => warn!("Could not write child stdin: {}", e),
                    }
                }
            };
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // On timeout the future (and the child it owns) is dropped, which kills it.
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(output)) => Ok(EngineOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout {
                command: display_argv(argv),
                after: timeout,
            }),
        }
    }

    async fn run_lines(
        &self,
        argv: &[String],
        timeout: Duration,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<EngineOutput> {
        let mut cmd = Self::command(argv)?;
        cmd.stdin(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| spawn_error(&argv[0], e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("stdout not captured")))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("stderr not captured")))?;

        let exchange = async {
            let read_stdout = async {
                let mut collected = String::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    on_line(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok::<_, io::Error>(collected)
            };
            let read_stderr = async {
                let mut buf = String::new();
                stderr_pipe.read_to_string(&mut buf).await.map(|_| buf)
            };
            let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
            let status = child.wait().await?;
            Ok::<_, io::Error>(EngineOutput {
                stdout: stdout?,
                stderr: stderr?,
                exit_code: status.code().unwrap_or(-1),
            })
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill timed out command: {}", e);
                }
                Err(Error::Timeout {
                    command: display_argv(argv),
                    after: timeout,
                })
            }
        }
    }
}

/// Cancellation handle for a request started with [`Engine::run_async`].
#[derive(Debug)]
pub struct RequestHandle {
    abort: AbortHandle,
}

impl RequestHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Best effort: the child is killed if the task has not completed yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// The engine as seen by the rest of the console.
#[derive(Clone)]
pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    program: String,
    prefix: Vec<String>,
    timeout: Duration,
}

impl Engine {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, prefix: Vec<String>) -> Self {
        let timeout = if prefix.is_empty() {
            LOCAL_TIMEOUT
        } else {
            REMOTE_TIMEOUT
        };
        Self {
            runner,
            program: program.into(),
            prefix,
            timeout,
        }
    }

    /// Local engine driven through real child processes.
    pub fn local(program: impl Into<String>) -> Self {
        Self::new(Arc::new(ProcessRunner), program, Vec::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_remote(&self) -> bool {
        !self.prefix.is_empty()
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Full command line for an engine subcommand.
    pub fn argv<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.prefix.len() + 1 + args.len());
        argv.extend(self.prefix.iter().cloned());
        argv.push(self.program.clone());
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    pub async fn run<S: AsRef<str> + Sync>(&self, args: &[S]) -> Result<EngineOutput> {
        self.run_with(args, None, None).await
    }

    pub async fn run_with<S: AsRef<str> + Sync>(
        &self,
        args: &[S],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<EngineOutput> {
        let argv = self.argv(args);
        debug!("engine: {}", display_argv(&argv));
        let output = self
            .runner
            .run(&argv, stdin.map(str::as_bytes), timeout.unwrap_or(self.timeout))
            .await?;
        if !output.success() {
            debug!("engine exit {}: {}", output.exit_code, output.stderr.trim());
        }
        Ok(output)
    }

    /// Streams stdout line by line; used for long-running pulls.
    pub async fn run_lines<S: AsRef<str> + Sync>(
        &self,
        args: &[S],
        timeout: Option<Duration>,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<EngineOutput> {
        let argv = self.argv(args);
        debug!("engine (streaming): {}", display_argv(&argv));
        self.runner
            .run_lines(&argv, timeout.unwrap_or(self.timeout), on_line)
            .await
    }

    /// Blocking variant for callers outside the async runtime (startup checks,
    /// one-shot subcommands). Must not be called from inside a tokio task.
    pub fn run_blocking<S: AsRef<str> + Sync>(
        &self,
        args: &[S],
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<EngineOutput> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.run_with(args, stdin, timeout))
    }

    /// Non-blocking variant: the callback receives the result on a runtime worker.
    pub fn run_async<F>(
        &self,
        handle: &Handle,
        args: Vec<String>,
        stdin: Option<String>,
        timeout: Option<Duration>,
        callback: F,
    ) -> RequestHandle
    where
        F: FnOnce(Result<EngineOutput>) + Send + 'static,
    {
        let engine = self.clone();
        let task = handle.spawn(async move {
            let result = engine.run_with(args.as_slice(), stdin.as_deref(), timeout).await;
            callback(result);
        });
        RequestHandle::new(task.abort_handle())
    }

    /// Check the engine answers at all. Anything but a clean `version` is EngineMissing.
    pub async fn probe(&self) -> Result<()> {
        match self.run(&["version"]).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(Error::EngineMissing(output.stderr.trim().to_string())),
            Err(Error::Timeout { .. }) => Err(Error::EngineMissing(format!(
                "{} did not answer within {}s",
                self.program,
                self.timeout.as_secs()
            ))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Responder = dyn Fn(&[String], Option<&str>) -> Result<EngineOutput> + Send + Sync;

    /// Records every command line and answers from a closure.
    pub struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        responder: Box<Responder>,
        delay: Option<Duration>,
    }

    impl ScriptedRunner {
        pub fn new<F>(responder: F) -> Arc<Self>
        where
            F: Fn(&[String], Option<&str>) -> Result<EngineOutput> + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
                delay: None,
            })
        }

        pub fn delayed<F>(delay: Duration, responder: F) -> Arc<Self>
        where
            F: Fn(&[String], Option<&str>) -> Result<EngineOutput> + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
                delay: Some(delay),
            })
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            argv: &[String],
            stdin: Option<&[u8]>,
            _timeout: Duration,
        ) -> Result<EngineOutput> {
            self.calls.lock().push(argv.join(" "));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let stdin = stdin.map(|s| String::from_utf8_lossy(s).into_owned());
            (self.responder)(argv, stdin.as_deref())
        }
    }

    pub fn engine(runner: Arc<ScriptedRunner>) -> Engine {
        Engine::new(runner, "docker", Vec::new())
    }
}
