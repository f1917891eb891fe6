//! Dependency-injected boundary for every external subprocess invocation.
//!
//! Per §9 Design Notes ("expose them as dependency-injected handles; tests
//! substitute in-memory fakes"), nothing in this crate calls
//! `tokio::process::Command` directly outside this module's default
//! implementation. Discovery, the repository façade, the hooks manager,
//! and the database strategies all take a `&dyn ProcessRunner`, so tests
//! can inject a `mockall`-generated fake that records argv and returns
//! canned output without a live Docker daemon or `kopia` binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// The outcome of running a subprocess to completion and capturing its
/// output.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A fully specified subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }
}

/// Abstraction over "run a subprocess and get its output", injected so the
/// rest of the crate never depends on a live container runtime or snapshot
/// engine to be unit-tested.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput>;

    /// True iff `program` resolves on `$PATH` (used for engine/tool
    /// availability probes such as `check_docker`/`check_kopia`).
    async fn which(&self, program: &str) -> bool;
}

/// Production [`ProcessRunner`] shelling out via `tokio::process::Command`.
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, spec: CommandSpec) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        if let Some(bytes) = spec.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&bytes).await?;
            }
        }

        let run_fut = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout).await?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr).await?;
            }
            let status = child.wait().await?;
            std::io::Result::Ok((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match spec.timeout {
            Some(d) => match tokio::time::timeout(d, run_fut).await {
                Ok(res) => res?,
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("{} timed out after {:?}", spec.program, d),
                    ));
                }
            },
            None => run_fut.await?,
        };

        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn which(&self, program: &str) -> bool {
        let path = match std::env::var_os("PATH") {
            Some(p) => p,
            None => return false,
        };
        std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
    }
}

/// Streams `bytes` to a subprocess's stdin and returns the child's stdout,
/// used by the archiver/dumper-to-snapshot streaming pipeline where the
/// producer and consumer are both subprocesses chained via an in-process
/// buffer rather than an OS pipe (the repository façade is a separate
/// process from the archiver; kopia itself reads from *our* stdin).
pub async fn pipe_stdout_to_stdin(
    runner: &dyn ProcessRunner,
    producer: CommandSpec,
    mut consumer: CommandSpec,
) -> std::io::Result<CommandOutput> {
    let produced = runner.run(producer).await?;
    if !produced.success() {
        return Ok(produced);
    }
    consumer.stdin = Some(produced.stdout);
    runner.run(consumer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_runner_captures_stdout_and_status() {
        let runner = SystemProcessRunner;
        let out = runner
            .run(CommandSpec::new("echo", vec!["hello".to_string()]))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_str().trim(), "hello");
    }

    #[tokio::test]
    async fn which_finds_a_binary_known_to_exist() {
        let runner = SystemProcessRunner;
        assert!(runner.which("sh").await);
        assert!(!runner.which("definitely-not-a-real-binary-xyz").await);
    }
}
