//! Runtime settings.
//!
//! Resolution order for every value: command line, then environment (clap
//! reads both), then the `[taskd]` table of the TOML config file, then the
//! built-in default. Relative paths in the config file are resolved against
//! the file's directory. Every resolved path is made absolute against the
//! working directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use taskd_orchestration::WorkerType;

pub const DEFAULT_SECRET: &str = "change-me-in-production";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_CAPACITY: usize = 4;
const DEFAULT_STATE_PATH: &str = ".taskd/state.json";
const DEFAULT_WORKTREES_DIR: &str = ".taskd/worktrees";

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "taskd", version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Task orchestration service")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "TASKD_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "TASKD_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "TASKD_PORT")]
    pub port: Option<u16>,

    /// Maximum number of concurrently active tasks
    #[arg(long, env = "TASKD_CAPACITY")]
    pub capacity: Option<usize>,

    /// Path of the persisted orchestrator state
    #[arg(long = "state-path", env = "TASKD_STATE_PATH", value_name = "FILE")]
    pub state_path: Option<PathBuf>,

    /// Repository whose worktrees host the tasks
    #[arg(long = "repo-path", env = "TASKD_REPO_PATH", value_name = "DIR")]
    pub repo_path: Option<PathBuf>,

    #[arg(long = "worktrees-root", env = "TASKD_WORKTREES_ROOT", value_name = "DIR")]
    pub worktrees_root: Option<PathBuf>,

    /// Execution backend (local | tmux)
    #[arg(long, env = "TASKD_BACKEND")]
    pub backend: Option<String>,

    /// Shared HMAC secret for dispatch requests
    #[arg(long = "dispatch-secret", env = "TASKD_DISPATCH_SECRET", hide_env_values = true)]
    pub dispatch_secret: Option<String>,

    #[arg(long = "token-issuer-url", env = "TASKD_TOKEN_ISSUER_URL")]
    pub token_issuer_url: Option<String>,

    #[arg(
        long = "token-issuer-bearer",
        env = "TASKD_TOKEN_ISSUER_BEARER",
        hide_env_values = true
    )]
    pub token_issuer_bearer: Option<String>,

    /// Log filter (e.g. info, debug, taskd=trace)
    #[arg(long = "log-level", env = "TASKD_LOG", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Tmux,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "tmux" => Ok(BackendKind::Tmux),
            other => Err(anyhow!("unsupported backend '{other}' (expected local or tmux)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intervals {
    pub credential_refresh: Duration,
    pub webhook_retry: Duration,
    pub task_poll: Duration,
    pub drain_poll: Duration,
    pub drain_timeout: Duration,
    /// Refresh the credential when it expires within this window.
    pub refresh_margin: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            credential_refresh: Duration::from_secs(300),
            webhook_retry: Duration::from_secs(300),
            task_poll: Duration::from_secs(30),
            drain_poll: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(600),
            refresh_margin: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenIssuerSettings {
    pub url: String,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub capacity: usize,
    pub state_path: PathBuf,
    pub repo_path: PathBuf,
    pub worktrees_root: PathBuf,
    pub backend: BackendKind,
    pub dispatch_secret: String,
    pub token_issuer: Option<TokenIssuerSettings>,
    pub worker_commands: HashMap<WorkerType, String>,
    pub intervals: Intervals,
    pub log_level: Option<String>,
}

impl Settings {
    pub fn uses_default_secret(&self) -> bool {
        self.dispatch_secret == DEFAULT_SECRET
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Merge CLI/env values over the config file over defaults.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = load_file_config(cli.config.as_deref())?.unwrap_or_default();
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: FileConfig) -> Result<Self> {
        let capacity = cli
            .capacity
            .or(file.capacity)
            .unwrap_or(DEFAULT_CAPACITY);
        if capacity == 0 {
            bail!("capacity must be at least 1");
        }

        let repo_path = absolute(
            cli.repo_path
                .clone()
                .or(file.repo_path)
                .unwrap_or_else(|| PathBuf::from(".")),
        )?;
        let worktrees_root = absolute(
            cli.worktrees_root
                .clone()
                .or(file.worktrees_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKTREES_DIR)),
        )?;
        let state_path = absolute(
            cli.state_path
                .clone()
                .or(file.state_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
        )?;

        let backend = match cli.backend.as_deref().or(file.backend.as_deref()) {
            Some(raw) => BackendKind::parse(raw)?,
            None => BackendKind::Local,
        };

        let token_issuer = cli
            .token_issuer_url
            .clone()
            .or(file.token_issuer_url)
            .map(|url| TokenIssuerSettings {
                url,
                bearer: cli
                    .token_issuer_bearer
                    .clone()
                    .or(file.token_issuer_bearer),
            });

        let mut worker_commands = default_worker_commands();
        worker_commands.extend(file.workers);

        let intervals = file.intervals;
        for (name, value) in [
            ("credential_refresh_secs", intervals.credential_refresh),
            ("webhook_retry_secs", intervals.webhook_retry),
            ("task_poll_secs", intervals.task_poll),
            ("drain_poll_secs", intervals.drain_poll),
        ] {
            if value.is_zero() {
                bail!("interval {name} must be greater than zero");
            }
        }

        Ok(Self {
            host: cli
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            capacity,
            state_path,
            repo_path,
            worktrees_root,
            backend,
            dispatch_secret: cli
                .dispatch_secret
                .clone()
                .or(file.dispatch_secret)
                .unwrap_or_else(|| DEFAULT_SECRET.to_string()),
            token_issuer,
            worker_commands,
            intervals,
            log_level: cli.log_level.clone().or(file.log_level),
        })
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    Ok(cwd.join(path))
}

fn default_worker_commands() -> HashMap<WorkerType, String> {
    HashMap::from([
        (
            WorkerType::Opus,
            r#"claude --model opus -p "$(cat "$TASKD_PROMPT_FILE")""#.to_string(),
        ),
        (
            WorkerType::Auto,
            r#"claude -p "$(cat "$TASKD_PROMPT_FILE")""#.to_string(),
        ),
        (
            WorkerType::Glm,
            r#"glm-worker --prompt-file "$TASKD_PROMPT_FILE""#.to_string(),
        ),
    ])
}

/// Values read from the `[taskd]` table, paths already resolved.
#[derive(Debug, Default)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    capacity: Option<usize>,
    state_path: Option<PathBuf>,
    repo_path: Option<PathBuf>,
    worktrees_root: Option<PathBuf>,
    backend: Option<String>,
    dispatch_secret: Option<String>,
    token_issuer_url: Option<String>,
    token_issuer_bearer: Option<String>,
    log_level: Option<String>,
    workers: HashMap<WorkerType, String>,
    intervals: Intervals,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    taskd: Option<RawFileConfig>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    host: Option<String>,
    port: Option<u16>,
    capacity: Option<usize>,
    state_path: Option<String>,
    repo_path: Option<String>,
    worktrees_root: Option<String>,
    backend: Option<String>,
    dispatch_secret: Option<String>,
    log_level: Option<String>,
    token_issuer: Option<RawTokenIssuer>,
    workers: Option<HashMap<String, String>>,
    intervals: Option<RawIntervals>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawTokenIssuer {
    url: Option<String>,
    bearer: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawIntervals {
    credential_refresh_secs: Option<u64>,
    webhook_retry_secs: Option<u64>,
    task_poll_secs: Option<u64>,
    drain_poll_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
    refresh_margin_secs: Option<u64>,
}

impl RawFileConfig {
    fn into_runtime_config(self, base_dir: &Path) -> Result<FileConfig> {
        let resolve = |raw: Option<String>| {
            raw.map(|value| {
                let path = PathBuf::from(value);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
        };

        let defaults = Intervals::default();
        let raw = self.intervals.unwrap_or_default();
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };
        let intervals = Intervals {
            credential_refresh: secs(raw.credential_refresh_secs, defaults.credential_refresh),
            webhook_retry: secs(raw.webhook_retry_secs, defaults.webhook_retry),
            task_poll: secs(raw.task_poll_secs, defaults.task_poll),
            drain_poll: secs(raw.drain_poll_secs, defaults.drain_poll),
            drain_timeout: secs(raw.drain_timeout_secs, defaults.drain_timeout),
            refresh_margin: secs(raw.refresh_margin_secs, defaults.refresh_margin),
        };

        let mut workers = HashMap::new();
        for (name, command) in self.workers.unwrap_or_default() {
            workers.insert(parse_worker_type(&name)?, command);
        }

        let issuer = self.token_issuer.unwrap_or_default();
        Ok(FileConfig {
            host: self.host,
            port: self.port,
            capacity: self.capacity,
            state_path: resolve(self.state_path),
            repo_path: resolve(self.repo_path),
            worktrees_root: resolve(self.worktrees_root),
            backend: self.backend,
            dispatch_secret: self.dispatch_secret,
            token_issuer_url: issuer.url,
            token_issuer_bearer: issuer.bearer,
            log_level: self.log_level,
            workers,
            intervals,
        })
    }
}

fn parse_worker_type(name: &str) -> Result<WorkerType> {
    match name {
        "opus" => Ok(WorkerType::Opus),
        "auto" => Ok(WorkerType::Auto),
        "glm" => Ok(WorkerType::Glm),
        other => Err(anyhow!("unknown worker type '{other}' in [taskd.workers]")),
    }
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read taskd config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    parsed
        .taskd
        .map(|raw| raw.into_runtime_config(path.parent().unwrap_or(Path::new("."))))
        .transpose()
}
