//! Process launching seam for the supervisor
//!
//! The launcher trait keeps the supervisor's restart and batch logic
//! testable against scripted processes; the production implementation forks
//! real children with `tokio::process` and kills them on drop so a
//! supervisor crash never leaks a fleet.

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentSpec;
use crate::error::{Classified, ErrorKind};

/// Exit information from a terminated agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code when the process exited normally
    pub code: Option<i32>,
    /// Whether the exit was clean (code 0)
    pub success: bool,
}

/// Errors from launching a process
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The spec's launch command is empty
    #[error("agent '{agent}' has no launch command")]
    EmptyCommand {
        /// Offending agent
        agent: String,
    },

    /// The OS refused the spawn
    #[error("spawn of '{agent}' failed: {source}")]
    Spawn {
        /// Agent being launched
        agent: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl Classified for LaunchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyCommand { .. } => ErrorKind::Config,
            Self::Spawn { .. } => ErrorKind::Retryable,
        }
    }
}

/// A launched agent process
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, when known
    fn pid(&self) -> Option<u32>;

    /// Waits for the process to exit
    async fn wait(&mut self) -> ExitInfo;

    /// Kills the process immediately (SIGKILL path)
    async fn kill(&mut self);
}

/// Launches agent processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the agent with the given environment
    async fn spawn(
        &self,
        spec: &AgentSpec,
        env: Vec<(String, String)>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// Production launcher forking real OS processes
#[derive(Debug, Default)]
pub struct TokioLauncher;

struct TokioHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessHandle for TokioHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ExitInfo {
        match self.child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                success: status.success(),
            },
            Err(_) => ExitInfo {
                code: None,
                success: false,
            },
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(
        &self,
        spec: &AgentSpec,
        env: Vec<(String, String)>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let Some((program, args)) = spec.launch_cmd.split_first() else {
            return Err(LaunchError::EmptyCommand {
                agent: spec.name.to_string(),
            });
        };

        debug!(agent = %spec.name, program, "spawning agent process");
        let child = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            // Agent output goes to the supervisor's stderr stream where the
            // operator's collector picks it up.
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                agent: spec.name.to_string(),
                source,
            })?;

        Ok(Box::new(TokioHandle { child }))
    }
}
