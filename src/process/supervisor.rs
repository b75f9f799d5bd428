use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use super::tree;

/// Time descendants get to die before the root is killed.
const DESCENDANT_SETTLE: Duration = Duration::from_millis(100);

/// Time the platform escalation gets before we give up and report.
const ESCALATION_SETTLE: Duration = Duration::from_millis(500);

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed. `None` leaves stdin null.
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Called once per output line from either stream, in arrival order per stream.
pub type LineHandler = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Clone)]
struct Managed {
    pid: u32,
    kill: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl Managed {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn request_kill(&self) {
        let sender = self.kill.lock().ok().and_then(|mut guard| guard.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<ProcessExit> {
        let waited = tokio::time::timeout(timeout, self.exit.wait_for(|e| e.is_some())).await;
        match waited {
            Ok(Ok(exit)) => *exit,
            _ => None,
        }
    }
}

/// Named registry of running subprocesses.
///
/// Each process runs in its own process group (Unix) with piped output. A
/// waiter task owns the `Child`; stopping a process tears down its whole tree.
#[derive(Clone)]
pub struct ProcessSupervisor {
    processes: Arc<DashMap<String, Managed>>,
    kill_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(kill_timeout: Duration) -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
            kill_timeout,
        }
    }

    /// Spawn `spec` under `name` and return its pid.
    ///
    /// Fails if a live process is already registered under `name`. An exited
    /// entry with the same name is replaced.
    pub async fn start(&self, name: &str, spec: CommandSpec, on_line: LineHandler) -> Result<u32> {
        if let Some(existing) = self.processes.get(name)
            && !existing.has_exited()
        {
            bail!("Process '{}' is already running (pid {})", name, existing.pid);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", spec.display()))?;
        let pid = child.id().context("Spawned process has no pid")?;
        tracing::debug!(name, pid, command = %spec.display(), "Process spawned");

        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.stdin) {
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::warn!(name, "Failed to write stdin: {}", e);
                }
                if let Err(e) = stdin.shutdown().await {
                    tracing::debug!(name, "Failed to close stdin: {}", e);
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(name, OutputStream::Stdout, stdout, on_line.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(name, OutputStream::Stderr, stderr, on_line);
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter_name = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                requested = &mut kill_rx => {
                    if requested.is_ok()
                        && let Err(e) = child.start_kill()
                    {
                        tracing::debug!(name = %waiter_name, "start_kill failed: {}", e);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(name = %waiter_name, "Failed to wait on process: {}", e);
                    None
                }
            };
            tracing::debug!(name = %waiter_name, pid, ?code, "Process exited");
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        self.processes.insert(
            name.to_string(),
            Managed {
                pid,
                kill: Arc::new(Mutex::new(Some(kill_tx))),
                exit: exit_rx,
            },
        );
        Ok(pid)
    }

    /// Terminate the process tree registered under `name`. Unknown names
    /// succeed.
    ///
    /// An entry whose root already exited is still swept: background children
    /// it left behind stay in its process group and are killed through it.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let Some((_, mut managed)) = self.processes.remove(name) else {
            return Ok(());
        };
        let pid = managed.pid;

        if managed.has_exited() {
            // The root was reaped, so its pid may be reused; only the group is
            // safe to address.
            if tree::kill_group(pid) {
                tracing::debug!(name, pid, "Killed leftover process group members");
            }
            return Ok(());
        }

        let descendants = tokio::task::spawn_blocking(move || {
            let found = tree::descendants(pid);
            tree::kill_pids(&found);
            found
        })
        .await
        .context("Process tree walk panicked")?;
        if !descendants.is_empty() {
            tracing::debug!(name, pid, count = descendants.len(), "Killed descendants");
            tokio::time::sleep(DESCENDANT_SETTLE).await;
        }

        managed.request_kill();
        if managed.wait_exit(self.kill_timeout).await.is_some() {
            // Group members the lineage walk missed, e.g. children that double-forked.
            #[cfg(unix)]
            tree::kill_group(pid);
            tracing::info!(name, pid, "Process stopped");
            return Ok(());
        }

        tree::escalate(pid);
        if managed.wait_exit(ESCALATION_SETTLE).await.is_some() {
            tracing::info!(name, pid, "Process stopped after escalation");
            Ok(())
        } else {
            bail!("Process '{}' (pid {}) did not exit after forced kill", name, pid)
        }
    }

    /// Stop every tracked process concurrently. Failures are logged.
    pub async fn stop_all(&self) {
        let names = self.names();
        let stops = names.iter().map(|name| async move {
            if let Err(e) = self.stop(name).await {
                tracing::error!(name = %name, "Failed to stop process: {:#}", e);
            }
        });
        futures::future::join_all(stops).await;
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.processes
            .get(name)
            .map(|m| !m.has_exited())
            .unwrap_or(false)
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.processes.get(name).map(|m| m.pid)
    }

    /// Wait for the named process to exit. `None` when the name is unknown.
    pub async fn wait(&self, name: &str) -> Option<ProcessExit> {
        let mut rx = self.processes.get(name).map(|m| m.exit.clone())?;
        let exit = rx.wait_for(|e| e.is_some()).await.ok().and_then(|e| *e);
        exit
    }

    pub fn names(&self) -> Vec<String> {
        self.processes.iter().map(|e| e.key().clone()).collect()
    }
}

fn spawn_reader<R>(name: &str, stream: OutputStream, reader: R, on_line: LineHandler)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => on_line(stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(name, ?stream, "Output reader failed: {}", e);
                    break;
                }
            }
        }
    });
}
