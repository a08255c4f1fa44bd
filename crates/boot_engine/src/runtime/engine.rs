//! Boot engine - drives a target's dependency closure to started

use crate::config::{LoadError, ServiceLoader, ServiceSet};
use crate::runtime::dependency::{DependencyError, DependencyGraph, ServiceState};
use crate::runtime::process::{ProcessError, Supervisor, DEFAULT_GRACE_INTERVAL};
use crate::runtime::scheduler::{BootPlan, Scheduler};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Boot engine configuration
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Time a `process` service must stay alive to count as started
    pub grace_interval: Duration,
    /// Upper bound on the whole boot (None = unbounded)
    pub boot_timeout: Option<Duration>,
    /// Time allowed for processes to exit after SIGTERM on shutdown
    pub shutdown_timeout: Duration,
    /// Environment variables applied to every service
    pub env: HashMap<String, String>,
    /// `process` services will be left running after this process exits
    pub release_on_exit: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            grace_interval: DEFAULT_GRACE_INTERVAL,
            boot_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
            env: HashMap::new(),
            release_on_exit: false,
        }
    }
}

/// A service that failed during boot
#[derive(Debug)]
pub struct ServiceFailure {
    pub service: String,
    pub error: ProcessError,
}

/// A service that never ran because a hard dependency failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedService {
    pub service: String,
    /// The failed dependency that blocked it
    pub prerequisite: String,
}

/// Outcome of a boot
#[derive(Debug)]
pub struct BootReport {
    pub target: String,
    /// Whether the target reached `Started`
    pub reached: bool,
    /// Services that started, in the order they did
    pub started: Vec<String>,
    /// Services whose launch failed
    pub failed: Vec<ServiceFailure>,
    /// Services marked failed without being launched
    pub blocked: Vec<BlockedService>,
    pub elapsed: Duration,
}

impl BootReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            reached: false,
            started: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Ids of services whose launch failed
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.service.as_str()).collect()
    }

    /// Ids of services blocked by a failed dependency
    pub fn blocked_ids(&self) -> Vec<&str> {
        self.blocked.iter().map(|b| b.service.as_str()).collect()
    }

    /// Turn an unreached target into an error
    pub fn into_result(self) -> Result<Self, BootError> {
        if self.reached {
            Ok(self)
        } else {
            Err(BootError::TargetUnreachable(Box::new(self)))
        }
    }
}

impl std::fmt::Display for BootReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = if self.reached { "reached" } else { "NOT reached" };
        writeln!(
            f,
            "Target '{}' {} in {:.2?}",
            self.target, verdict, self.elapsed
        )?;
        writeln!(f, "  Started: {}", self.started.join(", "))?;
        for failure in &self.failed {
            writeln!(f, "  Failed: {} ({})", failure.service, failure.error)?;
        }
        for blocked in &self.blocked {
            writeln!(
                f,
                "  Blocked: {} (dependency '{}' failed)",
                blocked.service, blocked.prerequisite
            )?;
        }
        Ok(())
    }
}

/// Boots services from a dependency graph
///
/// One engine performs one boot. The graph is read-only; each node's state
/// is written only by the routine launching it, or by the scheduler when it
/// marks a never-launched node as blocked.
#[derive(Debug)]
pub struct BootEngine {
    config: BootConfig,
    graph: DependencyGraph,
    supervisor: Supervisor,
    booted: AtomicBool,
}

/// What woke the boot loop
enum Wakeup {
    Finished(usize, Result<(), ProcessError>),
    Cancelled,
    TimedOut,
}

impl BootEngine {
    /// Create an engine from loaded service definitions
    pub fn new(services: ServiceSet, config: BootConfig) -> Result<Self, BootError> {
        let graph = DependencyGraph::build(services)?;
        let supervisor = Supervisor::new(config.grace_interval)
            .with_env(config.env.clone())
            .with_release_on_exit(config.release_on_exit);

        Ok(Self {
            config,
            graph,
            supervisor,
            booted: AtomicBool::new(false),
        })
    }

    /// Load a services directory and create an engine for it
    pub fn from_dir(dir: impl AsRef<Path>, config: BootConfig) -> Result<Self, BootError> {
        let services = ServiceLoader::new(dir.as_ref()).load_all()?;
        Self::new(services, config)
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Current state of a service
    pub fn state(&self, id: &str) -> Option<ServiceState> {
        self.graph.get(id).map(|node| node.state())
    }

    /// Watch a service's state transitions
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<ServiceState>> {
        self.graph.get(id).map(|node| node.subscribe())
    }

    /// Generate the start plan for a target without launching anything
    pub fn plan(&self, target: &str) -> Result<BootPlan, BootError> {
        BootPlan::build(&self.graph, target).map_err(|e| match e {
            DependencyError::UnknownService(name) => BootError::UnknownTarget(name),
            other => BootError::Dependency(other),
        })
    }

    /// Boot `target` and its dependency closure
    pub async fn start(&self, target: &str) -> Result<BootReport, BootError> {
        let (_cancel_tx, cancel_rx) = watch::channel(());
        self.start_with_cancel(target, cancel_rx).await
    }

    /// Boot `target`, aborting when `cancel` fires or the boot timeout expires
    ///
    /// Returns a report when every closure member reached a terminal state,
    /// whether or not the target itself started.
    pub async fn start_with_cancel(
        &self,
        target: &str,
        mut cancel: watch::Receiver<()>,
    ) -> Result<BootReport, BootError> {
        let mut scheduler = Scheduler::new(&self.graph, target).map_err(|e| match e {
            DependencyError::UnknownService(name) => BootError::UnknownTarget(name),
            other => BootError::Dependency(other),
        })?;

        if self.booted.swap(true, Ordering::SeqCst) {
            return Err(BootError::AlreadyBooted);
        }

        let started_at = Instant::now();
        let deadline = self.config.boot_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut report = BootReport::new(target);

        log::info!(
            "Booting '{}' ({} services in closure)",
            target,
            scheduler.members().len()
        );

        let mut in_flight = FuturesUnordered::new();
        let interruption = loop {
            for (idx, cause) in scheduler.propagate_failures() {
                let blocked = BlockedService {
                    service: self.graph.node(idx).id().to_string(),
                    prerequisite: self.graph.node(cause).id().to_string(),
                };
                log::warn!(
                    "[{}] Not starting: dependency '{}' failed",
                    blocked.service,
                    blocked.prerequisite
                );
                report.blocked.push(blocked);
            }

            for idx in scheduler.take_eligible() {
                let node = self.graph.node(idx);
                in_flight.push(async move { (idx, self.supervisor.launch(node).await) });
            }

            if in_flight.is_empty() {
                break None;
            }

            let wakeup = tokio::select! {
                Some((idx, result)) = in_flight.next() => Wakeup::Finished(idx, result),
                _ = cancelled(&mut cancel) => Wakeup::Cancelled,
                _ = expired(deadline) => Wakeup::TimedOut,
            };

            match wakeup {
                Wakeup::Finished(idx, result) => {
                    let service = self.graph.node(idx).id().to_string();
                    match result {
                        Ok(()) => report.started.push(service),
                        Err(error) => report.failed.push(ServiceFailure { service, error }),
                    }
                }
                Wakeup::Cancelled => break Some(Wakeup::Cancelled),
                Wakeup::TimedOut => break Some(Wakeup::TimedOut),
            }
        };

        // Dropping in-flight launches kills their children
        drop(in_flight);

        if interruption.is_none() && !scheduler.is_settled() {
            // Unreachable for an acyclic graph
            log::error!("Boot of '{}' stalled with unsettled services", target);
        }

        for idx in scheduler.unsettled() {
            let node = self.graph.node(idx);
            node.transition(ServiceState::Failed);
            report.failed.push(ServiceFailure {
                service: node.id().to_string(),
                error: ProcessError::Interrupted(node.id().to_string()),
            });
        }

        report.reached = self.graph.node(scheduler.target()).state() == ServiceState::Started;
        report.elapsed = started_at.elapsed();

        match interruption {
            Some(Wakeup::Cancelled) => {
                log::warn!("Boot of '{}' cancelled", target);
                Err(BootError::Cancelled(Box::new(report)))
            }
            Some(_) => {
                log::error!("Boot of '{}' timed out", target);
                Err(BootError::TimedOut(Box::new(report)))
            }
            None => {
                if report.reached {
                    log::info!("Target '{}' reached in {:.2?}", target, report.elapsed);
                } else {
                    log::error!(
                        "Target '{}' not reached; failed: [{}], blocked: [{}]",
                        target,
                        report.failed_ids().join(", "),
                        report.blocked_ids().join(", ")
                    );
                }
                Ok(report)
            }
        }
    }

    /// Wait for the shutdown signal or for every supervised process to exit
    pub async fn wait(&self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown_rx) => {
                    log::info!("Shutdown signal received");
                    break;
                }

                // Check process table periodically
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if self.supervisor.running().await.is_empty() {
                        log::info!("All supervised processes have exited");
                        break;
                    }
                }
            }
        }
    }

    /// Terminate every supervised process
    pub async fn shutdown(&self) {
        self.supervisor
            .terminate_all(self.config.shutdown_timeout)
            .await;
        log::info!("All processes shut down");
    }
}

/// Resolves when the sender signals; never if the sender is gone
async fn cancelled(rx: &mut watch::Receiver<()>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Errors that can occur in the boot engine
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Failed to load services: {0}")]
    Load(#[from] LoadError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("This engine has already booted")]
    AlreadyBooted,

    #[error("Boot cancelled")]
    Cancelled(Box<BootReport>),

    #[error("Boot timed out after {:.2?}", .0.elapsed)]
    TimedOut(Box<BootReport>),

    #[error("Target '{}' not reached (failed: [{}], blocked: [{}])", .0.target, .0.failed_ids().join(", "), .0.blocked_ids().join(", "))]
    TargetUnreachable(Box<BootReport>),
}

impl BootError {
    /// The partial report, if the boot got underway
    pub fn report(&self) -> Option<&BootReport> {
        match self {
            BootError::Cancelled(report)
            | BootError::TimedOut(report)
            | BootError::TargetUnreachable(report) => Some(report.as_ref()),
            _ => None,
        }
    }
}
