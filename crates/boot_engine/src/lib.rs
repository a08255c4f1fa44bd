//! Boot Engine
//!
//! A minimal dinit-style boot engine: reads a directory of service
//! descriptions and brings a target service up together with everything it
//! depends on.
//!
//! # Overview
//!
//! - Service files are parsed into definitions (`config`)
//! - Definitions are linked into a validated, acyclic dependency graph
//! - Independent services launch concurrently; a service starts only after
//!   its hard dependencies have started
//! - A failed service fails every service that requires it, without
//!   launching them
//!
//! # Example Service Files
//!
//! ```text
//! # /etc/dinit.d/dbus
//! type = process
//! command = /usr/bin/dbus-daemon --system --nofork
//! logfile = /var/log/dbus.log
//!
//! # /etc/dinit.d/boot
//! type = internal
//! depends-on = dbus
//! waits-for = xvfb
//! ```
//!
//! ```no_run
//! # async fn run() -> Result<(), boot_engine::BootError> {
//! use boot_engine::{BootConfig, BootEngine};
//!
//! let engine = BootEngine::from_dir("/etc/dinit.d", BootConfig::default())?;
//! let report = engine.start("boot").await?.into_result()?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::BootArgs;
pub use config::{
    LoadError, RestartPolicy, ServiceDefinition, ServiceKind, ServiceLoader, ServiceSet,
    SubstitutionContext, SubstitutionError,
};
pub use runtime::{
    BlockedService, BootConfig, BootEngine, BootError, BootPlan, BootReport, DependencyError,
    DependencyGraph, ProcessError, ServiceFailure, ServiceState, Supervisor,
};
