//! Boot Engine CLI
//!
//! Usage:
//!   boot_engine /etc/dinit.d
//!   boot_engine services/ --target desktop -e DISPLAY=:99 --timeout-secs 60
//!   boot_engine services/ --dry-run

use anyhow::Context;
use boot_engine::{BootArgs, BootEngine, BootError, ServiceLoader, SubstitutionContext};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: BootArgs = argh::from_env();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the target was reached
async fn run(args: BootArgs) -> anyhow::Result<bool> {
    log::info!("Loading services from: {}", args.services_dir);
    let ctx = SubstitutionContext::new().with_vars(args.vars());
    let services = ServiceLoader::new(&args.services_dir)
        .with_context(ctx)
        .load_all()
        .with_context(|| format!("Failed to load services from '{}'", args.services_dir))?;

    let count = services.len();
    let engine = BootEngine::new(services, args.to_config())?;

    // Validate only mode
    if args.validate {
        println!("Services directory '{}' is valid", args.services_dir);
        println!("  Services: {}", count);
        return Ok(true);
    }

    // Dry run mode
    if args.dry_run {
        let plan = engine.plan(&args.target)?;
        println!("{}", plan);
        return Ok(true);
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        })
        .context("Error setting Ctrl+C handler")?;
    }

    let report = match engine.start_with_cancel(&args.target, shutdown_rx.clone()).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(report) = e.report() {
                print!("{}", report);
            }
            engine.shutdown().await;
            return match e {
                BootError::Cancelled(_) | BootError::TimedOut(_) => {
                    log::error!("{}", e);
                    Ok(false)
                }
                other => Err(other.into()),
            };
        }
    };
    print!("{}", report);

    if !report.reached {
        engine.shutdown().await;
        return Ok(false);
    }

    if !args.settle().is_zero() {
        log::info!("Waiting {:?} for services to settle", args.settle());
        tokio::time::sleep(args.settle()).await;
    }

    if args.exit_after_boot {
        engine.supervisor().detach_all().await;
        log::info!("Target reached, leaving services running");
        return Ok(true);
    }

    // Wait for shutdown signal or all processes to exit
    engine.wait(shutdown_rx).await;

    // Shutdown all processes
    engine.shutdown().await;

    log::info!("Boot engine exiting");
    Ok(true)
}
