//! Running external programs (`mount`, `umount`, `cvmfs_talk`, ...).
//!
//! Each invocation is logged before and after it runs under an `Exec-ID`
//! so the two lines can be matched up in a busy log.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

/// A program invocation, kept as plain data so fakes can inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kill the process if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit. `code` is -1 when the process was killed by a signal.
    #[error("{program} exited with code {code}; output: {output}")]
    Exit {
        program: String,
        code: i32,
        output: String,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

impl ExecError {
    /// Combined output of a process that exited with an error, empty otherwise.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Exit { output, .. } => output,
            _ => "",
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` to completion and return its stdout followed by its stderr.
    async fn combined_output(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError>;
}

/// Source of `Exec-ID`s.
#[derive(Debug, Default)]
pub struct ExecCounter(AtomicU64);

impl ExecCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Runs commands as child processes of the plugin.
#[derive(Debug, Clone)]
pub struct Executor {
    counter: Arc<ExecCounter>,
}

impl Executor {
    pub fn new(counter: Arc<ExecCounter>) -> Self {
        Self { counter }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Arc::new(ExecCounter::default()))
    }
}

#[async_trait]
impl CommandRunner for Executor {
    async fn combined_output(&self, cmd: &Cmd) -> Result<Vec<u8>, ExecError> {
        let exec_id = self.counter.next();
        info!(
            "Exec-ID {exec_id}: Running command prog={} args={:?}",
            cmd.program, cmd.args
        );

        let mut command = Command::new(&cmd.program);
        // A dropped future (cancelled RPC, timeout) takes the child down with it.
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match cmd.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, command.output()).await {
                Ok(res) => res,
                Err(_) => {
                    let err = ExecError::Timeout {
                        program: cmd.program.clone(),
                        timeout,
                    };
                    error!("Exec-ID {exec_id}: Error: {err}");
                    return Err(err);
                }
            },
            None => command.output().await,
        };

        let output = output.map_err(|source| {
            let err = ExecError::Spawn {
                program: cmd.program.clone(),
                source,
            };
            error!("Exec-ID {exec_id}: Error: {err}");
            err
        })?;

        info!("Exec-ID {exec_id}: Process exited: {}", output.status);

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            let err = ExecError::Exit {
                program: cmd.program.clone(),
                code: output.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&combined).into_owned(),
            };
            error!("Exec-ID {exec_id}: Error: {err}");
            return Err(err);
        }

        Ok(combined)
    }
}
