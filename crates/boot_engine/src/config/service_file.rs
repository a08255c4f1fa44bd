//! Service description files and the directory loader
//!
//! One file describes one service; the file name is the service id. Files
//! ending in `.yaml`/`.yml` use YAML, everything else uses the dinit-style
//! `key = value` line syntax:
//!
//! ```text
//! # /etc/dinit.d/chromium
//! type = process
//! command = /usr/bin/chromium --no-sandbox --display=$DISPLAY
//! depends-on = xfce
//! waits-for = dbus
//! ```

use crate::config::substitution::{parse_env_file, SubstitutionContext, SubstitutionError};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Matches `key = value` and `key: value` lines
static SETTING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_.-]*)\s*[=:]\s*(.*)$").unwrap());

/// dinit settings that have no meaning for a forward-only boot
const IGNORED_SETTINGS: &[&str] = &[
    "stop-command",
    "stop-timeout",
    "smooth-recovery",
    "restart-delay",
    "restart-limit-interval",
    "restart-limit-count",
    "options",
    "load-options",
    "term-signal",
    "termsignal",
    "socket-listen",
    "socket-permissions",
    "socket-uid",
    "socket-gid",
    "pid-file",
    "ready-notification",
    "run-as",
    "chain-to",
    "inittab-id",
    "inittab-line",
    "log-type",
    "log-buffer-size",
    "consumer-of",
    "rlimit-nofile",
    "rlimit-core",
    "rlimit-data",
    "rlimit-addrspace",
];

/// All services loaded from one directory, in load order
pub type ServiceSet = IndexMap<String, ServiceDefinition>;

/// Kind of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Long-running command, up once it survives the grace interval
    Process,
    /// One-shot command, up once it exits successfully
    Scripted,
    /// No command; groups dependencies
    Virtual,
    /// No command; a named boot milestone
    Target,
}

impl ServiceKind {
    /// Parse a `type` setting
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "process" => Some(ServiceKind::Process),
            "scripted" => Some(ServiceKind::Scripted),
            "virtual" | "internal" => Some(ServiceKind::Virtual),
            "target" => Some(ServiceKind::Target),
            _ => None,
        }
    }

    /// Whether services of this kind run a command
    pub fn is_executable(&self) -> bool {
        matches!(self, ServiceKind::Process | ServiceKind::Scripted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Process => "process",
            ServiceKind::Scripted => "scripted",
            ServiceKind::Virtual => "virtual",
            ServiceKind::Target => "target",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restart policy for a service
///
/// Parsed for compatibility with existing service files. The boot engine
/// never restarts a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    Never,
    /// Always restart on exit
    Always,
    /// Only restart on failure (non-zero exit code)
    OnFailure,
}

impl RestartPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "false" | "never" => Some(RestartPolicy::Never),
            "yes" | "true" | "always" => Some(RestartPolicy::Always),
            "on-failure" => Some(RestartPolicy::OnFailure),
            _ => None,
        }
    }
}

/// A loaded, validated service description
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    /// Unique service id
    pub id: String,
    /// Service kind
    pub kind: ServiceKind,
    /// Executable and arguments; present iff `kind` is executable
    pub command: Option<Vec<String>>,
    /// Hard dependencies: must be started first, failure propagates
    pub depends_on: Vec<String>,
    /// Soft dependencies: started and waited for, failure tolerated
    pub waits_for: Vec<String>,
    /// Services that must wait for this one, if both are booted
    pub before: Vec<String>,
    /// Services this one must wait for, if both are booted
    pub after: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub working_dir: Option<PathBuf>,
    /// File receiving stdout and stderr, appended
    pub logfile: Option<PathBuf>,
    /// Variables from the env-file, passed to the process
    pub env: HashMap<String, String>,
    /// Bound on a scripted command's run time
    pub start_timeout: Option<Duration>,
    pub description: Option<String>,
    /// File this definition was read from
    pub source: PathBuf,
}

impl ServiceDefinition {
    /// Parse a dinit-style description without touching the filesystem
    pub fn from_dinit_str(id: &str, content: &str) -> Result<Self, LoadError> {
        let path = PathBuf::from(id);
        let raw = RawService::from_dinit(&path, content)?;
        raw.resolve(id, &path, Path::new("."), &SubstitutionContext::isolated())
    }

    /// Parse a YAML description without touching the filesystem
    pub fn from_yaml_str(id: &str, content: &str) -> Result<Self, LoadError> {
        let path = PathBuf::from(format!("{}.yaml", id));
        let raw = RawService::from_yaml(&path, content)?;
        raw.resolve(id, &path, Path::new("."), &SubstitutionContext::isolated())
    }

    /// All ids this service references through hard or soft dependencies
    pub fn required_ids(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .chain(self.waits_for.iter())
            .map(String::as_str)
    }
}

/// Command given either as one shell-like line or as an argv list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

/// Restart value can be a YAML boolean or a policy name
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RestartValue {
    Flag(bool),
    Named(String),
}

/// Settings as written in the file, before validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawService {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<CommandSpec>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(rename = "depends-on.d")]
    depends_on_d: Option<String>,
    #[serde(default)]
    waits_for: Vec<String>,
    #[serde(rename = "waits-for.d")]
    waits_for_d: Option<String>,
    #[serde(default)]
    before: Vec<String>,
    #[serde(default)]
    after: Vec<String>,
    restart: Option<RestartValue>,
    working_dir: Option<String>,
    logfile: Option<String>,
    env_file: Option<String>,
    start_timeout: Option<f64>,
    description: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl RawService {
    fn from_yaml(path: &Path, content: &str) -> Result<Self, LoadError> {
        let raw: RawService = serde_yaml::from_str(content).map_err(|e| LoadError::Yaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        for key in raw.extra.keys() {
            warn_unrecognized(path, key);
        }
        Ok(raw)
    }

    fn from_dinit(path: &Path, content: &str) -> Result<Self, LoadError> {
        let mut raw = RawService::default();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let caps = SETTING_PATTERN.captures(line).ok_or_else(|| LoadError::Syntax {
                path: path.to_path_buf(),
                line: lineno + 1,
                message: format!("expected 'key = value', found '{}'", line),
            })?;
            let key = &caps[1];
            let value = caps[2].trim().to_string();

            raw.apply(path, lineno + 1, key, value)?;
        }

        Ok(raw)
    }

    /// Apply one dinit-style setting
    fn apply(&mut self, path: &Path, line: usize, key: &str, value: String) -> Result<(), LoadError> {
        let syntax = |message: String| LoadError::Syntax {
            path: path.to_path_buf(),
            line,
            message,
        };

        match key {
            "type" => self.kind = Some(value),
            "command" => self.command = Some(CommandSpec::Line(value)),
            // A milestone dependency behaves like a hard one during boot
            "depends-on" | "depends-ms" => self.depends_on.push(value),
            "depends-on.d" => self.depends_on_d = Some(value),
            "waits-for" => self.waits_for.push(value),
            "waits-for.d" => self.waits_for_d = Some(value),
            "before" => self.before.push(value),
            "after" => self.after.push(value),
            "restart" => self.restart = Some(RestartValue::Named(value)),
            "working-dir" => self.working_dir = Some(value),
            "logfile" => self.logfile = Some(value),
            "env-file" => self.env_file = Some(value),
            "description" => self.description = Some(value),
            "start-timeout" => {
                let secs = value
                    .parse::<f64>()
                    .map_err(|_| syntax(format!("invalid start-timeout '{}'", value)))?;
                self.start_timeout = Some(secs);
            }
            _ if IGNORED_SETTINGS.contains(&key) => {
                log::debug!("{}: ignoring setting '{}'", path.display(), key);
            }
            _ => warn_unrecognized(path, key),
        }

        Ok(())
    }

    /// Validate the settings and produce a definition
    fn resolve(
        self,
        id: &str,
        path: &Path,
        base_dir: &Path,
        ctx: &SubstitutionContext,
    ) -> Result<ServiceDefinition, LoadError> {
        let invalid = |message: String| LoadError::Invalid {
            path: path.to_path_buf(),
            message,
        };
        let subst_err = |source: SubstitutionError| LoadError::Substitution {
            path: path.to_path_buf(),
            source,
        };

        let kind = match self.kind.as_deref() {
            None => ServiceKind::Process,
            Some(s) => ServiceKind::parse(s)
                .ok_or_else(|| invalid(format!("unknown service type '{}'", s)))?,
        };

        let env = match &self.env_file {
            Some(file) => {
                let env_path = base_dir.join(file);
                let content =
                    std::fs::read_to_string(&env_path).map_err(|e| LoadError::Io {
                        path: env_path.clone(),
                        source: e,
                    })?;
                parse_env_file(&content).map_err(subst_err)?
            }
            None => HashMap::new(),
        };
        let ctx = ctx.for_service(&env);

        let command = match (kind.is_executable(), self.command) {
            (true, None) => {
                return Err(invalid(format!("type '{}' requires a command", kind)));
            }
            (false, Some(_)) => {
                return Err(invalid(format!("type '{}' cannot have a command", kind)));
            }
            (false, None) => None,
            (true, Some(spec)) => {
                let tokens = match spec {
                    CommandSpec::Line(line) => split_command(&line).map_err(&invalid)?,
                    CommandSpec::Argv(argv) => argv,
                };
                let argv = tokens
                    .iter()
                    .map(|t| ctx.substitute(t))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(subst_err)?;
                if argv.first().map_or(true, |exe| exe.is_empty()) {
                    return Err(invalid("command is empty".to_string()));
                }
                Some(argv)
            }
        };

        let mut depends_on = self.depends_on;
        if let Some(dir) = &self.depends_on_d {
            depends_on.extend(list_dependency_dir(&base_dir.join(dir))?);
        }
        let mut waits_for = self.waits_for;
        if let Some(dir) = &self.waits_for_d {
            waits_for.extend(list_dependency_dir(&base_dir.join(dir))?);
        }

        for dep in depends_on.iter().chain(&waits_for).chain(&self.before).chain(&self.after) {
            if dep.is_empty() || dep.contains(char::is_whitespace) {
                return Err(invalid(format!("invalid service name '{}'", dep)));
            }
        }

        let restart_policy = match self.restart {
            None => RestartPolicy::Never,
            Some(RestartValue::Flag(true)) => RestartPolicy::Always,
            Some(RestartValue::Flag(false)) => RestartPolicy::Never,
            Some(RestartValue::Named(s)) => RestartPolicy::parse(&s)
                .ok_or_else(|| invalid(format!("invalid restart policy '{}'", s)))?,
        };

        let start_timeout = match self.start_timeout {
            None => None,
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) => return Err(invalid(format!("invalid start-timeout '{}'", secs))),
        };

        let working_dir = self
            .working_dir
            .map(|d| ctx.substitute(&d).map(PathBuf::from))
            .transpose()
            .map_err(subst_err)?;
        let logfile = self
            .logfile
            .map(|f| ctx.substitute(&f).map(PathBuf::from))
            .transpose()
            .map_err(subst_err)?;

        Ok(ServiceDefinition {
            id: id.to_string(),
            kind,
            command,
            depends_on,
            waits_for,
            before: self.before,
            after: self.after,
            restart_policy,
            working_dir,
            logfile,
            env,
            start_timeout,
            description: self.description,
            source: path.to_path_buf(),
        })
    }
}

fn warn_unrecognized(path: &Path, key: &str) {
    log::warn!("{}: unrecognized setting '{}'", path.display(), key);
}

/// Entry names of a `depends-on.d`/`waits-for.d` directory, sorted
fn list_dependency_dir(dir: &Path) -> Result<Vec<String>, LoadError> {
    let read_err = |e| LoadError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let name = entry.map_err(read_err)?.file_name().to_string_lossy().into_owned();
        if !is_skipped_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_skipped_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with('~')
}

/// `*.env` files hold variables for `env-file`, not services
fn is_env_file_name(name: &str) -> bool {
    name.ends_with(".env")
}

/// Split a command line into arguments
///
/// Whitespace separates arguments; single quotes, double quotes and
/// backslash escapes group characters.
pub fn split_command(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated quote in '{}'", line)),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => current.push(c),
                            None => return Err(format!("unterminated quote in '{}'", line)),
                        },
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated quote in '{}'", line)),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(format!("trailing backslash in '{}'", line)),
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }

    if in_arg {
        args.push(current);
    }
    Ok(args)
}

/// Loads every service description in a directory
#[derive(Debug, Clone)]
pub struct ServiceLoader {
    dir: PathBuf,
    ctx: SubstitutionContext,
}

impl ServiceLoader {
    /// Create a loader for a services directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ctx: SubstitutionContext::new(),
        }
    }

    /// Use a custom substitution context
    pub fn with_context(mut self, ctx: SubstitutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all service files, sorted by file name
    ///
    /// Hidden files, `~` backups, `*.env` variable files and sub-directories
    /// are skipped.
    ///
    /// Loading is all-or-nothing: the first invalid file aborts the load.
    pub fn load_all(&self) -> Result<ServiceSet, LoadError> {
        let read_err = |e| LoadError::ReadDir {
            path: self.dir.clone(),
            source: e,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_skipped_name(&name) || is_env_file_name(&name) {
                continue;
            }
            // Follows symlinks
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            files.push((name, path));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut services = ServiceSet::with_capacity(files.len());
        for (_, path) in files {
            let definition = self.load_file(&path)?;
            if let Some(existing) = services.get(&definition.id) {
                return Err(LoadError::DuplicateId {
                    id: definition.id.clone(),
                    first: existing.source.clone(),
                    second: path,
                });
            }
            services.insert(definition.id.clone(), definition);
        }

        log::debug!(
            "Loaded {} services from {}",
            services.len(),
            self.dir.display()
        );
        Ok(services)
    }

    /// Load a single service file
    pub fn load_file(&self, path: &Path) -> Result<ServiceDefinition, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (id, raw) = match yaml_stem(&file_name) {
            Some(stem) => (stem.to_string(), RawService::from_yaml(path, &content)?),
            None => (file_name.clone(), RawService::from_dinit(path, &content)?),
        };

        raw.resolve(&id, path, &self.dir, &self.ctx)
    }
}

fn yaml_stem(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".yml"))
}

/// Errors that can occur when loading service descriptions
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read directory '{}': {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{}': {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("'{}' line {line}: {message}", .path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("'{}': {message}", .path.display())]
    Invalid { path: PathBuf, message: String },

    #[error("'{}': {source}", .path.display())]
    Substitution {
        path: PathBuf,
        #[source]
        source: SubstitutionError,
    },

    #[error("Duplicate service id '{id}' defined by '{}' and '{}'", .first.display(), .second.display())]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl LoadError {
    /// File or directory the error refers to
    pub fn path(&self) -> &Path {
        match self {
            LoadError::ReadDir { path, .. }
            | LoadError::Io { path, .. }
            | LoadError::Yaml { path, .. }
            | LoadError::Syntax { path, .. }
            | LoadError::Invalid { path, .. }
            | LoadError::Substitution { path, .. } => path,
            LoadError::DuplicateId { second, .. } => second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dinit_process() {
        let def = ServiceDefinition::from_dinit_str(
            "chromium",
            r#"
# browser
type = process
command = /usr/bin/chromium --no-sandbox "--user-data-dir=/tmp/chrome profile"
depends-on = xfce
depends-on: dbus
waits-for = network
restart = on-failure
"#,
        )
        .unwrap();

        assert_eq!(def.id, "chromium");
        assert_eq!(def.kind, ServiceKind::Process);
        assert_eq!(
            def.command.unwrap(),
            vec![
                "/usr/bin/chromium",
                "--no-sandbox",
                "--user-data-dir=/tmp/chrome profile"
            ]
        );
        assert_eq!(def.depends_on, vec!["xfce", "dbus"]);
        assert_eq!(def.waits_for, vec!["network"]);
        assert_eq!(def.restart_policy, RestartPolicy::OnFailure);
    }

    #[test]
    fn test_parse_yaml_scripted() {
        let def = ServiceDefinition::from_yaml_str(
            "setup",
            r#"
type: scripted
command: ["sh", "-c", "echo ready"]
depends-on:
  - mount
start-timeout: 2.5
"#,
        )
        .unwrap();

        assert_eq!(def.kind, ServiceKind::Scripted);
        assert_eq!(def.command.unwrap(), vec!["sh", "-c", "echo ready"]);
        assert_eq!(def.depends_on, vec!["mount"]);
        assert_eq!(def.start_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_internal_is_virtual() {
        let def = ServiceDefinition::from_dinit_str("boot", "type = internal\nwaits-for = a\n").unwrap();
        assert_eq!(def.kind, ServiceKind::Virtual);
        assert!(def.command.is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = ServiceDefinition::from_dinit_str("x", "type = daemon\ncommand = /bin/true\n");
        assert!(matches!(result, Err(LoadError::Invalid { message, .. }) if message.contains("daemon")));
    }

    #[test]
    fn test_missing_command_is_rejected() {
        let result = ServiceDefinition::from_dinit_str("x", "type = scripted\n");
        assert!(matches!(result, Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_command_on_target_is_rejected() {
        let result = ServiceDefinition::from_yaml_str("boot", "type: target\ncommand: /bin/true\n");
        assert!(matches!(result, Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_malformed_line_names_line() {
        let result = ServiceDefinition::from_dinit_str("x", "type = process\nthis is not a setting\n");
        assert!(matches!(result, Err(LoadError::Syntax { line: 2, .. })));
    }

    #[test]
    fn test_unknown_settings_are_tolerated() {
        let def = ServiceDefinition::from_dinit_str(
            "x",
            "type = process\ncommand = /bin/sleep 10\nsmooth-recovery = yes\nfancy-new-key = 1\n",
        )
        .unwrap();
        assert_eq!(def.kind, ServiceKind::Process);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("a  b\tc").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_command(r#"sh -c 'exit 3'"#).unwrap(), vec!["sh", "-c", "exit 3"]);
        assert_eq!(split_command(r#"echo "a \"b\"" c\ d"#).unwrap(), vec!["echo", "a \"b\"", "c d"]);
        assert_eq!(split_command("''").unwrap(), vec![""]);
        assert!(split_command("echo 'oops").is_err());
    }

    #[test]
    fn test_loader_orders_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zeta"), "type = virtual\n").unwrap();
        std::fs::write(dir.path().join("alpha.yaml"), "type: virtual\n").unwrap();
        std::fs::write(dir.path().join("mid"), "type = virtual\n").unwrap();
        std::fs::write(dir.path().join(".hidden"), "garbage").unwrap();
        std::fs::write(dir.path().join("mid~"), "garbage").unwrap();
        std::fs::create_dir(dir.path().join("boot.d")).unwrap();

        let services = ServiceLoader::new(dir.path()).load_all().unwrap();
        let ids: Vec<_> = services.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_loader_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good"), "type = virtual\n").unwrap();
        std::fs::write(dir.path().join("bad"), "type = bogus\n").unwrap();

        let err = ServiceLoader::new(dir.path()).load_all().unwrap_err();
        assert_eq!(err.path(), dir.path().join("bad"));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_loader_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc"), "type = virtual\n").unwrap();
        std::fs::write(dir.path().join("svc.yml"), "type: virtual\n").unwrap();

        let result = ServiceLoader::new(dir.path()).load_all();
        assert!(matches!(result, Err(LoadError::DuplicateId { id, .. }) if id == "svc"));
    }

    #[test]
    fn test_loader_reads_dependency_dir_and_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let boot_d = dir.path().join("boot.d");
        std::fs::create_dir(&boot_d).unwrap();
        std::fs::write(boot_d.join("xfce"), "").unwrap();
        std::fs::write(boot_d.join("chromium"), "").unwrap();
        std::fs::write(dir.path().join("display.env"), "DISPLAY=:1\n").unwrap();
        std::fs::write(dir.path().join("boot"), "type = internal\nwaits-for.d = boot.d\n").unwrap();
        std::fs::write(
            dir.path().join("xfce"),
            "type = process\nenv-file = display.env\ncommand = startxfce4 --display $DISPLAY\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("chromium"), "type = process\ncommand = chromium\n").unwrap();

        let services = ServiceLoader::new(dir.path())
            .with_context(SubstitutionContext::isolated())
            .load_all()
            .unwrap();

        assert_eq!(services["boot"].waits_for, vec!["chromium", "xfce"]);
        assert_eq!(
            services["xfce"].command.as_deref().unwrap(),
            ["startxfce4", "--display", ":1"]
        );
        assert_eq!(services["xfce"].env["DISPLAY"], ":1");
    }

    #[test]
    fn test_loader_skips_env_files() {
        let dir = tempfile::tempdir().unwrap();
        // Not valid service syntax; must never be parsed as one
        std::fs::write(dir.path().join("session.env"), "_TOKEN=abc\n").unwrap();
        std::fs::write(dir.path().join("unused.env"), "DISPLAY=:0\n").unwrap();
        std::fs::write(
            dir.path().join("xvfb"),
            "type = process\nenv-file = session.env\ncommand = Xvfb\n",
        )
        .unwrap();

        let services = ServiceLoader::new(dir.path()).load_all().unwrap();

        assert_eq!(services.keys().collect::<Vec<_>>(), vec!["xvfb"]);
    }

    #[test]
    fn test_loader_rejects_undefined_variable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc"), "command = run $NO_SUCH_VAR\n").unwrap();

        let result = ServiceLoader::new(dir.path())
            .with_context(SubstitutionContext::isolated())
            .load_all();
        assert!(matches!(result, Err(LoadError::Substitution { .. })));
    }
}
