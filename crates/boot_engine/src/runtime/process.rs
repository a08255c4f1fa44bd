//! Process supervisor: launches services and owns their child processes

use crate::config::{ServiceDefinition, ServiceKind};
use crate::runtime::dependency::{ServiceNode, ServiceState};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Default time a long-running process must survive to count as started
pub const DEFAULT_GRACE_INTERVAL: Duration = Duration::from_millis(500);

/// A supervised child that outlived its launch
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// Service id
    pub service: String,
    /// Process ID
    pub pid: u32,
    /// Spawn time
    pub started_at: Instant,
}

impl ProcessRecord {
    /// Get uptime duration
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Launches services and tracks the processes that keep running
///
/// The process table is private to the supervisor: entries are added when a
/// `process` service passes its grace interval and removed by a reaper task
/// when the child exits. Dropping the supervisor kills every child it still
/// supervises.
#[derive(Debug)]
pub struct Supervisor {
    /// Survival time required of `process` services
    grace_interval: Duration,
    /// Environment applied to every child
    env: HashMap<String, String>,
    /// `process` children will outlive this supervisor
    release_on_exit: bool,
    /// Running children by service id
    table: Arc<Mutex<IndexMap<String, ProcessRecord>>>,
    /// Reaper tasks of adopted children
    reapers: Mutex<Vec<JoinHandle<()>>>,
    /// Set once adopted children should be released instead of reaped
    detach: watch::Sender<bool>,
    /// Number of spawn attempts
    spawn_attempts: AtomicUsize,
}

impl Supervisor {
    /// Create a supervisor with the given grace interval
    pub fn new(grace_interval: Duration) -> Self {
        let (detach, _) = watch::channel(false);
        Self {
            grace_interval,
            env: HashMap::new(),
            release_on_exit: false,
            table: Arc::new(Mutex::new(IndexMap::new())),
            reapers: Mutex::new(Vec::new()),
            detach,
            spawn_attempts: AtomicUsize::new(0),
        }
    }

    /// Set environment variables passed to every child
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Prepare `process` children to be left running by `detach_all`
    ///
    /// Their output cannot be forwarded once this process exits, so children
    /// without a logfile have stdout and stderr discarded.
    pub fn with_release_on_exit(mut self, release: bool) -> Self {
        self.release_on_exit = release;
        self
    }

    pub fn grace_interval(&self) -> Duration {
        self.grace_interval
    }

    /// Number of times a command spawn has been attempted
    pub fn spawn_count(&self) -> usize {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    /// Processes still alive, in the order they started
    pub async fn running(&self) -> Vec<ProcessRecord> {
        self.table.lock().await.values().cloned().collect()
    }

    /// Launch a node and drive it to `Started` or `Failed`
    ///
    /// Only the caller owning the node's launch may invoke this, once.
    pub async fn launch(&self, node: &ServiceNode) -> Result<(), ProcessError> {
        let def = node.definition();

        if !node.transition(ServiceState::Starting) {
            return Err(ProcessError::NotStopped {
                service: def.id.clone(),
                state: node.state(),
            });
        }

        let result = match def.kind {
            ServiceKind::Virtual | ServiceKind::Target => Ok(()),
            ServiceKind::Scripted => self.run_scripted(def).await,
            ServiceKind::Process => self.run_process(def).await,
        };

        match &result {
            Ok(()) => {
                node.transition(ServiceState::Started);
                log::info!("[{}] Started", def.id);
            }
            Err(e) => {
                node.transition(ServiceState::Failed);
                log::error!("[{}] {}", def.id, e);
            }
        }
        result
    }

    /// Run a one-shot command; started iff it exits with status 0
    async fn run_scripted(&self, def: &ServiceDefinition) -> Result<(), ProcessError> {
        let mut child = self.spawn(def)?;

        let status = match def.start_timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(status) => status,
                    Err(_) => {
                        log::warn!("[{}] Still running after {:?}, killing", def.id, limit);
                        let _ = child.kill().await;
                        return Err(ProcessError::StartTimeout {
                            service: def.id.clone(),
                            timeout: limit,
                        });
                    }
                }
            }
            None => child.wait().await,
        }
        .map_err(|e| ProcessError::Wait {
            service: def.id.clone(),
            source: e,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::ExitedWithError {
                service: def.id.clone(),
                status: describe_status(status),
            })
        }
    }

    /// Run a long-lived command; started once it survives the grace interval
    async fn run_process(&self, def: &ServiceDefinition) -> Result<(), ProcessError> {
        let mut pending = PendingChild(Some(self.spawn(def)?));
        let pid = pending.id().unwrap_or(0);
        let started_at = Instant::now();

        let waited = tokio::time::timeout(self.grace_interval, pending.wait()).await;
        match waited {
            Err(_) => {
                if let Some(child) = pending.adopt() {
                    self.adopt(
                        ProcessRecord {
                            service: def.id.clone(),
                            pid,
                            started_at,
                        },
                        child,
                    )
                    .await;
                }
                Ok(())
            }
            // Forking daemons exit 0 once they have detached
            Ok(Ok(status)) if status.success() => {
                log::info!(
                    "[{}] Exited successfully within {:?}, assuming it detached",
                    def.id,
                    self.grace_interval
                );
                Ok(())
            }
            Ok(Ok(status)) => Err(ProcessError::ExitedEarly {
                service: def.id.clone(),
                status: describe_status(status),
            }),
            Ok(Err(e)) => Err(ProcessError::Wait {
                service: def.id.clone(),
                source: e,
            }),
        }
    }

    /// Spawn the service's command with output wired to its logfile or the log
    fn spawn(&self, def: &ServiceDefinition) -> Result<Child, ProcessError> {
        let argv = def.command.as_deref().unwrap_or_default();
        let Some((executable, args)) = argv.split_first() else {
            return Err(ProcessError::NoCommand(def.id.clone()));
        };

        log::info!("[{}] Starting: {}", def.id, argv.join(" "));

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .envs(&self.env)
            .envs(&def.env)
            .stdin(Stdio::null())
            // `process` children are killed by `PendingChild` or the supervisor
            .kill_on_drop(def.kind != ServiceKind::Process);

        if let Some(dir) = &def.working_dir {
            cmd.current_dir(dir);
        }

        match &def.logfile {
            Some(path) => {
                let open = || {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| ProcessError::Logfile {
                            service: def.id.clone(),
                            source: e,
                        })
                };
                cmd.stdout(Stdio::from(open()?)).stderr(Stdio::from(open()?));
            }
            None if self.release_on_exit && def.kind == ServiceKind::Process => {
                log::debug!("[{}] No logfile, discarding output", def.id);
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            None => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            service: def.id.clone(),
            executable: executable.clone(),
            source: e,
        })?;

        log::debug!("[{}] Spawned with PID {}", def.id, child.id().unwrap_or(0));

        if let Some(stdout) = child.stdout.take() {
            forward_output(def.id.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(def.id.clone(), stderr, true);
        }

        Ok(child)
    }

    /// Record a surviving child and reap it when it exits
    async fn adopt(&self, record: ProcessRecord, mut child: Child) {
        let service = record.service.clone();
        self.table.lock().await.insert(service.clone(), record);

        let table = Arc::clone(&self.table);
        let mut detach = self.detach.subscribe();
        let reaper = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = detached(&mut detach) => {
                    table.lock().await.shift_remove(&service);
                    log::debug!("[{}] Released from supervision", service);
                    // Spawned without kill_on_drop, so this leaves it running
                    drop(child);
                    return;
                }
            };
            table.lock().await.shift_remove(&service);

            match status {
                Ok(status) => log::warn!(
                    "[{}] Process exited after boot: {}",
                    service,
                    describe_status(status)
                ),
                Err(e) => log::error!("[{}] Error waiting for process: {}", service, e),
            }
        });
        self.reapers.lock().await.push(reaper);
    }

    /// Stop supervising every running child, leaving it alive
    ///
    /// Used when the caller exits after boot. Waits until every reaper has
    /// let go of its child.
    pub async fn detach_all(&self) {
        if !self.release_on_exit {
            log::warn!("Detaching children whose output is piped to this process");
        }
        self.detach.send_replace(true);
        let reapers = std::mem::take(&mut *self.reapers.lock().await);
        for reaper in reapers {
            if let Err(e) = reaper.await {
                log::debug!("Reaper task failed: {}", e);
            }
        }
    }

    /// Terminate every running child: SIGTERM, then SIGKILL after `timeout`
    pub async fn terminate_all(&self, timeout: Duration) {
        let running = self.running().await;
        if running.is_empty() {
            return;
        }

        log::info!("Terminating {} processes...", running.len());
        for record in &running {
            log::info!("[{}] Stopping process {}", record.service, record.pid);
            send_signal(record.pid, false);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.table.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for record in self.running().await {
            log::warn!(
                "[{}] Process did not exit gracefully, forcing kill",
                record.service
            );
            send_signal(record.pid, true);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if *self.detach.borrow() {
            return;
        }
        if let Ok(table) = self.table.try_lock() {
            for record in table.values() {
                send_signal(record.pid, true);
            }
        }
    }
}

/// A `process` child within its grace interval; killed if the launch is
/// dropped before the child is adopted
struct PendingChild(Option<Child>);

impl PendingChild {
    fn id(&self) -> Option<u32> {
        self.0.as_ref().and_then(Child::id)
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        match self.0.as_mut() {
            Some(child) => child.wait().await,
            None => Err(std::io::Error::other("child already adopted")),
        }
    }

    fn adopt(mut self) -> Option<Child> {
        self.0.take()
    }
}

impl Drop for PendingChild {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            // Fails harmlessly if the child already exited
            let _ = child.start_kill();
        }
    }
}

/// Resolves once `detach_all` is called; never if the supervisor is gone
async fn detached(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|detached| *detached).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Forward a child's output to the log, line by line
fn forward_output<R>(service: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log::warn!("[{}] {}", service, line);
            } else {
                log::info!("[{}] {}", service, line);
            }
        }
    });
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        log::debug!("Failed to send {:?} to {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _force: bool) {
    log::warn!("Cannot signal process {} on this platform", pid);
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("killed by signal {}", signal);
                }
            }
            "unknown exit status".to_string()
        }
    }
}

/// Errors that can occur while launching a service
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Service '{service}' cannot launch from state {state}")]
    NotStopped { service: String, state: ServiceState },

    #[error("Service '{0}' has no command")]
    NoCommand(String),

    #[error("Failed to spawn '{executable}' for '{service}': {source}")]
    SpawnFailed {
        service: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open logfile for '{service}': {source}")]
    Logfile {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error waiting for '{service}': {source}")]
    Wait {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{service}' exited during its grace interval with {status}")]
    ExitedEarly { service: String, status: String },

    #[error("Script '{service}' failed with {status}")]
    ExitedWithError { service: String, status: String },

    #[error("Script '{service}' did not finish within {timeout:?}")]
    StartTimeout { service: String, timeout: Duration },

    #[error("Launch of '{0}' was interrupted")]
    Interrupted(String),
}
