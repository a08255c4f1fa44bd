//! Command-line interface for boot_engine

use crate::runtime::BootConfig;
use argh::FromArgs;
use std::collections::HashMap;
use std::time::Duration;

/// Minimal dinit-style boot engine
#[derive(FromArgs, Debug)]
pub struct BootArgs {
    /// directory of service description files (default: /etc/dinit.d)
    #[argh(positional, default = "String::from(\"/etc/dinit.d\")")]
    pub services_dir: String,

    /// service to bring up (default: boot)
    #[argh(option, short = 't', default = "String::from(\"boot\")")]
    pub target: String,

    /// set a substitution variable (format: NAME=value)
    #[argh(option, short = 'e', from_str_fn(parse_var))]
    pub var: Vec<(String, String)>,

    /// milliseconds a process must stay alive to count as started
    #[argh(option, default = "500")]
    pub grace_ms: u64,

    /// abort the boot after this many seconds
    #[argh(option)]
    pub timeout_secs: Option<u64>,

    /// seconds to wait after the target is reached
    #[argh(option, default = "0")]
    pub settle_secs: u64,

    /// show the boot plan without starting anything
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the services directory and exit
    #[argh(switch)]
    pub validate: bool,

    /// exit once the target is reached instead of supervising
    #[argh(switch)]
    pub exit_after_boot: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a variable in format "NAME=value"
fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("Invalid variable '{}'. Expected 'NAME=value'", s)),
    }
}

impl BootArgs {
    /// Substitution variables given on the command line
    pub fn vars(&self) -> HashMap<String, String> {
        self.var.iter().cloned().collect()
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Build the engine configuration
    pub fn to_config(&self) -> BootConfig {
        BootConfig {
            grace_interval: Duration::from_millis(self.grace_ms),
            boot_timeout: self.timeout_secs.map(Duration::from_secs),
            env: self.vars(),
            release_on_exit: self.exit_after_boot,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<BootArgs, argh::EarlyExit> {
        BootArgs::from_args(&["boot_engine"], args)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.services_dir, "/etc/dinit.d");
        assert_eq!(args.target, "boot");
        assert!(!args.dry_run);

        let config = args.to_config();
        assert_eq!(config.grace_interval, Duration::from_millis(500));
        assert_eq!(config.boot_timeout, None);
    }

    #[test]
    fn test_options() {
        let args = parse(&[
            "/tmp/services",
            "--target",
            "desktop",
            "--grace-ms",
            "50",
            "--timeout-secs",
            "30",
            "-e",
            "DISPLAY=:99",
            "--exit-after-boot",
        ])
        .unwrap();

        assert_eq!(args.services_dir, "/tmp/services");
        assert_eq!(args.target, "desktop");
        assert!(args.exit_after_boot);

        let config = args.to_config();
        assert!(config.release_on_exit);
        assert_eq!(config.grace_interval, Duration::from_millis(50));
        assert_eq!(config.boot_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.env.get("DISPLAY").map(String::as_str), Some(":99"));
    }

    #[test]
    fn test_target_short_flag_after_dir() {
        let args = parse(&["-t", "graphical", "/srv/dinit.d"]).unwrap();
        assert_eq!(args.services_dir, "/srv/dinit.d");
        assert_eq!(args.target, "graphical");
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("URL=http://host?a=b"),
            Ok(("URL".to_string(), "http://host?a=b".to_string()))
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }
}
