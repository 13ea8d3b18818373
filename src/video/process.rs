use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use super::error::VideoError;
use crate::sys::send_signal;

/// A running transcoder child.
///
/// The child is killed when this is dropped, so an aborted supervisor never leaves an orphan.
#[derive(Debug)]
pub struct TranscoderProcess {
    child: Child,
    pid: Option<u32>,
}

impl TranscoderProcess {
    /// Start `program` with `args`, piping stdout and stderr.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, VideoError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let pid = child.id();
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, VideoError> {
        self.child.wait().await.map_err(VideoError::Wait)
    }

    /// SIGTERM, then SIGKILL if the process is still running after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, VideoError> {
        if let Some(status) = self.child.try_wait().map_err(VideoError::Wait)? {
            return Ok(status);
        }

        if let Some(pid) = self.child.id() {
            debug!(pid, "Sending SIGTERM to transcoder");
            send_signal(pid, libc::SIGTERM).map_err(|source| VideoError::Signal { pid, source })?;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(VideoError::Wait),
            Err(_) => {
                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Transcoder ignored SIGTERM, killing");
                self.child.kill().await.map_err(VideoError::Wait)?;
                self.wait().await
            }
        }
    }
}
