//! Subprocess runner.
//!
//! Owns exactly one live subprocess per active run. Stdout and stderr are
//! pumped into an unbounded channel by background reader tasks and drained
//! into the bounded output buffer in arrival order by `read_available`.

mod buffer;

pub use buffer::{OutputBuffer, newest_lines, newest_slice};

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::error::ExecError;

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Read chunk size for the stdout/stderr pump tasks.
const READ_CHUNK: usize = 4096;

/// Outcome of waiting for process exit.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Handle to one running command.
#[derive(Debug)]
pub struct CommandProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: OutputBuffer,
    program: String,
}

impl CommandProcess {
    /// Launch a process from an explicit argument vector, never through a
    /// command-line-interpreting shell.
    pub fn start(
        program: &str,
        args: &[String],
        cwd: &Path,
        buffer_cap: usize,
    ) -> Result<Self, ExecError> {
        debug!("spawning {} {:?} in {}", program, args, cwd.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Launch {
            program: program.to_string(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();

        let (tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx));
        }

        Ok(Self {
            child,
            pid,
            stdin,
            output_rx,
            buffer: OutputBuffer::new(buffer_cap),
            program: program.to_string(),
        })
    }

    /// Process id, if the process started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking poll: drain newly produced output into the buffer and
    /// return just the fresh text.
    pub fn read_available(&mut self) -> String {
        let mut fresh = String::new();
        while let Ok(chunk) = self.output_rx.try_recv() {
            fresh.push_str(&String::from_utf8_lossy(&chunk));
        }
        if !fresh.is_empty() {
            self.buffer.push_str(&fresh);
        }
        fresh
    }

    /// The accumulated (bounded) output so far.
    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    /// Write a line plus newline to the process stdin.
    pub async fn write_stdin(&mut self, line: &str) -> Result<(), ExecError> {
        if self.try_wait().is_some() {
            return Err(ExecError::NotRunning);
        }
        let stdin = self.stdin.as_mut().ok_or(ExecError::NotRunning)?;
        let payload = format!("{line}\n");
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|_| ExecError::NotRunning)?;
        stdin.flush().await.map_err(|_| ExecError::NotRunning)?;
        Ok(())
    }

    /// Check for exit without blocking.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("error polling {} for exit: {:?}", self.program, e);
                None
            }
        }
    }

    /// Block until exit or the timeout elapses.
    pub async fn wait(&mut self, timeout: Duration) -> std::io::Result<WaitOutcome> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(WaitOutcome::Exited(status?)),
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Graceful-then-forced shutdown: SIGTERM, up to 5 seconds to exit,
    /// then SIGKILL and reap. Used on every cancellation and timeout path.
    pub async fn terminate(&mut self) {
        if self.try_wait().is_some() {
            return;
        }

        // Closing stdin first unblocks processes reading interactive input.
        self.stdin.take();

        if let Some(pid) = self.pid {
            debug!("sending SIGTERM to {} (pid {})", self.program, pid);
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} exited after SIGTERM: {}", self.program, status);
                return;
            }
            Ok(Err(e)) => {
                warn!("error waiting for {} after SIGTERM: {:?}", self.program, e);
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, force killing",
                    self.program, TERMINATE_GRACE
                );
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!("failed to kill {}: {:?}", self.program, e);
        }

        // Reap so no zombie is left behind.
        if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
            .await
            .is_err()
        {
            warn!("timeout reaping {} after SIGKILL", self.program);
        }
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output pump ended: {:?}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    async fn drain_until_exit(proc: &mut CommandProcess) -> String {
        let mut collected = String::new();
        for _ in 0..100 {
            collected.push_str(&proc.read_available());
            if proc.try_wait().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // One final drain after exit picks up anything still in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        collected.push_str(&proc.read_available());
        collected
    }

    #[tokio::test]
    async fn test_launch_error_for_missing_executable() {
        let err = CommandProcess::start("definitely-not-a-binary", &[], &cwd(), 1024).unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut proc =
            CommandProcess::start("echo", &["hello".to_string()], &cwd(), 1024).unwrap();
        let output = drain_until_exit(&mut proc).await;
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_stdin_round_trip() {
        let mut proc = CommandProcess::start("cat", &[], &cwd(), 1024).unwrap();
        proc.write_stdin("ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = proc.read_available();
        assert!(output.contains("ping"));

        proc.terminate().await;
    }

    #[tokio::test]
    async fn test_write_stdin_after_exit_fails() {
        let mut proc = CommandProcess::start("true", &[], &cwd(), 1024).unwrap();
        match proc.wait(Duration::from_secs(5)).await.unwrap() {
            WaitOutcome::Exited(status) => assert!(status.success()),
            WaitOutcome::TimedOut => panic!("true should exit immediately"),
        }

        let err = proc.write_stdin("late").await.unwrap_err();
        assert!(matches!(err, ExecError::NotRunning));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut proc =
            CommandProcess::start("sleep", &["30".to_string()], &cwd(), 1024).unwrap();
        match proc.wait(Duration::from_millis(100)).await.unwrap() {
            WaitOutcome::TimedOut => {}
            WaitOutcome::Exited(_) => panic!("sleep should still be running"),
        }

        proc.terminate().await;
        assert!(proc.try_wait().is_some());
    }

    #[tokio::test]
    async fn test_terminate_kills_process() {
        let mut proc =
            CommandProcess::start("sleep", &["30".to_string()], &cwd(), 1024).unwrap();
        let pid = proc.pid().unwrap();

        proc.terminate().await;

        // kill -0 errors once the process is gone.
        let status = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let mut proc = CommandProcess::start("true", &[], &cwd(), 1024).unwrap();
        proc.wait(Duration::from_secs(5)).await.unwrap();
        proc.terminate().await;
        proc.terminate().await;
    }

    #[tokio::test]
    async fn test_stderr_is_interleaved() {
        let mut proc = CommandProcess::start(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2".to_string()],
            &cwd(),
            1024,
        )
        .unwrap();
        let output = drain_until_exit(&mut proc).await;
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }
}
