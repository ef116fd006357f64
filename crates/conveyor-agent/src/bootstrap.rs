use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// What the bootstrap needs to run one job's commands.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
}

/// A spawned bootstrap: its merged output stream, its eventual exit
/// status, and a signalling handle.
///
/// The three parts are deliberately independent so a supervisor can wait
/// on output and exit while signalling from another select arm.
pub struct BootstrapProcess {
    /// stdout and stderr, interleaved in read order. Closed on exit.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves once, with -1 when no exit code is available (killed by
    /// signal, or the wait itself failed).
    pub exit: oneshot::Receiver<i32>,
    pub control: Arc<dyn ProcessControl>,
}

/// Signals for a running bootstrap.
pub trait ProcessControl: Send + Sync {
    /// Ask the process group to stop (SIGTERM).
    fn terminate(&self);
    /// Stop the process group now (SIGKILL).
    fn kill(&self);
}

/// The opaque runner that executes a job's command.
///
/// The agent core only ever sees output bytes and an exit status; tests
/// substitute scripted processes.
#[async_trait]
pub trait Bootstrap: Send + Sync + 'static {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<BootstrapProcess>;
}

/// Runs the job command through `/bin/sh -c` in its own process group.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellBootstrap;

#[async_trait]
impl Bootstrap for ShellBootstrap {
    async fn spawn(&self, spec: CommandSpec) -> io::Result<BootstrapProcess> {
        let command = spec
            .env
            .get("BUILDKITE_COMMAND")
            .cloned()
            .ok_or_else(|| io::Error::other("job environment has no BUILDKITE_COMMAND"))?;

        tokio::fs::create_dir_all(&spec.working_dir).await?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&command)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation can signal the whole tree.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        debug!(pid = child.id(), "bootstrap spawned");
        let pgid = child.id().map(|id| id as i32);

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, tx);
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = exit_tx.send(code);
        });

        Ok(BootstrapProcess {
            output: rx,
            exit: exit_rx,
            control: Arc::new(ProcessGroup { pgid }),
        })
    }
}

/// Forward one pipe into the output channel until EOF.
///
/// A full channel blocks the read, which in turn fills the pipe and
/// throttles the subprocess. That is the intended backpressure path.
fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn signal(&self, _sig: i32) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, _sig);
            }
        }
    }
}

impl ProcessControl for ProcessGroup {
    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
    }

    fn kill(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut process: BootstrapProcess) -> (Vec<u8>, i32) {
        let mut out = Vec::new();
        while let Some(bytes) = process.output.recv().await {
            out.extend(bytes);
        }
        let status = process.exit.await.unwrap_or(-1);
        (out, status)
    }

    #[test_log::test(tokio::test)]
    async fn runs_the_command_and_streams_its_output() {
        let dir = std::env::temp_dir().join(format!("conveyor-test-{}", std::process::id()));
        let spec = CommandSpec {
            env: HashMap::from([("BUILDKITE_COMMAND".to_string(), "echo echo".to_string())]),
            working_dir: dir,
        };
        let process = ShellBootstrap.spawn(spec).await.unwrap();
        let (out, status) = drain(process).await;
        assert_eq!(out, b"echo\n");
        assert_eq!(status, 0);
    }

    #[test_log::test(tokio::test)]
    async fn missing_command_refuses_to_spawn() {
        let spec = CommandSpec {
            env: HashMap::new(),
            working_dir: std::env::temp_dir(),
        };
        assert!(ShellBootstrap.spawn(spec).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn nonzero_exit_status_is_observed() {
        let spec = CommandSpec {
            env: HashMap::from([("BUILDKITE_COMMAND".to_string(), "exit 3".to_string())]),
            working_dir: std::env::temp_dir(),
        };
        let process = ShellBootstrap.spawn(spec).await.unwrap();
        let (_, status) = drain(process).await;
        assert_eq!(status, 3);
    }
}
