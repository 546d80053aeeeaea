//! Executor: turns a raw command string into a sandboxed exec call, applying
//! the whitelist, working-directory, and timeout rules from SPEC_FULL.md
//! §4.4. Command lexing follows POSIX shell-quoting rules via `shlex`.

use std::sync::Arc;
use std::time::Duration;

use crate::core::driver::{retry_transient, ContainerDriver, ExecResult};
use crate::core::registry::{SessionHandle, SessionRegistry};
use crate::error::{CoreError, CoreResult};

pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

impl From<ExecResult> for ExecOutcome {
    fn from(r: ExecResult) -> Self {
        Self {
            exit_code: r.exit_code,
            stdout: r.stdout,
            stderr: r.stderr,
            duration_ms: r.duration_ms,
            timed_out: r.timed_out,
            truncated: r.truncated,
        }
    }
}

pub struct Executor {
    driver: Arc<dyn ContainerDriver>,
    registry: Arc<SessionRegistry>,
}

impl Executor {
    pub fn new(driver: Arc<dyn ContainerDriver>, registry: Arc<SessionRegistry>) -> Self {
        Self { driver, registry }
    }

    /// Runs `command` inside the session's container. `working_dir` must be
    /// rooted at `/workspace` or `/tmp`; anything else is rejected before any
    /// container interaction happens. A `timeout` of `None` falls back to the
    /// configured default.
    pub async fn execute(
        &self,
        handle: &SessionHandle,
        command: &str,
        working_dir: Option<&str>,
        timeout: Option<Duration>,
    ) -> CoreResult<ExecOutcome> {
        let argv = shlex::split(command)
            .ok_or_else(|| CoreError::CommandNotAllowed(format!("unparsable command: {command}")))?;

        let Some(program) = argv.first() else {
            return Err(CoreError::CommandNotAllowed("empty command".to_string()));
        };

        // An empty whitelist means nothing is allowed, not everything.
        let allowed = self.registry.config().allowed_commands.clone();
        if !allowed.contains(program) {
            return Err(CoreError::CommandNotAllowed(program.clone()));
        }

        let working_dir = working_dir.unwrap_or("/workspace");
        if !(working_dir == "/workspace"
            || working_dir.starts_with("/workspace/")
            || working_dir == "/tmp"
            || working_dir.starts_with("/tmp/"))
        {
            return Err(CoreError::PathInvalid(format!(
                "working directory '{working_dir}' is outside /workspace and /tmp"
            )));
        }

        let timeout = timeout.unwrap_or(self.registry.config().default_exec_timeout);

        let result = retry_transient(|| self.driver.exec(&handle.container_id, &argv, working_dir, timeout))
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;

        self.registry.touch(&handle.user_id, &handle.session_id).await?;

        Ok(result.into())
    }
}
