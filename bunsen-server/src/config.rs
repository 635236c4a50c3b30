use anyhow::{anyhow, bail, Context, Result};
use bunsen_core::{FoldLimits, TriggerConfig};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Clone)]
pub enum GitHubAuth {
    Token(String),
    App { app_id: u64, private_key: String },
}

impl fmt::Debug for GitHubAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitHubAuth::Token(_) => f.write_str("Token([REDACTED])"),
            GitHubAuth::App { app_id, .. } => f
                .debug_struct("App")
                .field("app_id", app_id)
                .field("private_key", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn default_model(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Anthropic => "claude-3-5-haiku-latest",
        }
    }

    pub fn default_api_url(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com",
            LlmProvider::Anthropic => "https://api.anthropic.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Sqlite,
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub github_webhook_secret: String,
    pub github_auth: GitHubAuth,
    pub github_api_url: String,
    pub trigger_label: String,
    pub agent_name: String,
    /// Login the agent's own comments arrive under.
    pub agent_login: String,
    pub workflow_file: String,
    pub workflow_ref: String,
    pub reply_to_new_threads: bool,
    pub allow_retrigger: bool,
    pub llm_provider: LlmProvider,
    pub llm_model: String,
    pub llm_api_key: String,
    pub llm_api_url: String,
    pub dispatch_max_attempts: u32,
    pub dispatch_timeout: Duration,
    pub dispatch_backoff: Duration,
    pub dedup_window: usize,
    pub context_max_entries: usize,
    pub state_cas_max_attempts: u32,
    pub state_backend: StateBackend,
    /// Directory for the SQLite database. Defaults to the working directory.
    pub state_dir: PathBuf,
    pub port: u16,
    pub recording_enabled: bool,
    pub recording_log_path: String,
    /// Bearer token for `/status`. When unset the endpoint returns 403.
    pub status_auth_token: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("github_auth", &self.github_auth)
            .field("github_api_url", &self.github_api_url)
            .field("trigger_label", &self.trigger_label)
            .field("agent_name", &self.agent_name)
            .field("agent_login", &self.agent_login)
            .field("workflow_file", &self.workflow_file)
            .field("workflow_ref", &self.workflow_ref)
            .field("llm_provider", &self.llm_provider)
            .field("llm_model", &self.llm_model)
            .field("state_backend", &self.state_backend)
            .field("state_dir", &self.state_dir)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let github_webhook_secret = get("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let github_auth = match (get("GITHUB_TOKEN"), get("GITHUB_APP_ID")) {
            (Some(token), _) => GitHubAuth::Token(token),
            (None, Some(app_id)) => {
                let app_id = app_id
                    .parse::<u64>()
                    .context("GITHUB_APP_ID must be a valid number")?;
                let private_key = get("GITHUB_PRIVATE_KEY")
                    .context("GITHUB_PRIVATE_KEY is required when GITHUB_APP_ID is set")?
                    .replace("\\n", "\n");
                GitHubAuth::App {
                    app_id,
                    private_key,
                }
            }
            (None, None) => bail!("either GITHUB_TOKEN or GITHUB_APP_ID must be set"),
        };

        let github_api_url = get("GITHUB_API_URL")
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let trigger_label =
            get("BUNSEN_TRIGGER_LABEL").unwrap_or_else(|| "ready-for-dev".to_string());
        let agent_name = get("BUNSEN_AGENT_NAME")
            .map(|n| n.trim_start_matches('@').to_string())
            .unwrap_or_else(|| "bunsen".to_string());
        let agent_login =
            get("BUNSEN_AGENT_LOGIN").unwrap_or_else(|| format!("{}[bot]", agent_name));
        let workflow_file =
            get("BUNSEN_WORKFLOW_FILE").unwrap_or_else(|| "coding_agent.yaml".to_string());
        let workflow_ref = get("BUNSEN_WORKFLOW_REF").unwrap_or_else(|| "main".to_string());

        let reply_to_new_threads =
            parse_flag("BUNSEN_REPLY_TO_NEW_THREADS", get("BUNSEN_REPLY_TO_NEW_THREADS"), false)?;
        let allow_retrigger =
            parse_flag("BUNSEN_ALLOW_RETRIGGER", get("BUNSEN_ALLOW_RETRIGGER"), true)?;

        let llm_provider = match get("LLM_PROVIDER").as_deref().map(str::to_ascii_lowercase) {
            None => LlmProvider::OpenAi,
            Some(p) if p == "openai" => LlmProvider::OpenAi,
            Some(p) if p == "anthropic" => LlmProvider::Anthropic,
            Some(other) => bail!("LLM_PROVIDER must be 'openai' or 'anthropic', got '{}'", other),
        };
        let llm_model = get("LLM_MODEL").unwrap_or_else(|| llm_provider.default_model().to_string());
        let llm_api_key =
            get("LLM_API_KEY").context("LLM_API_KEY environment variable is required")?;
        let llm_api_url = get("LLM_API_URL")
            .unwrap_or_else(|| llm_provider.default_api_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let dispatch_max_attempts: u32 =
            parse_number("DISPATCH_MAX_ATTEMPTS", get("DISPATCH_MAX_ATTEMPTS"), 3)?;
        if dispatch_max_attempts == 0 {
            bail!("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }
        let dispatch_timeout = Duration::from_secs(parse_number(
            "DISPATCH_TIMEOUT_SECS",
            get("DISPATCH_TIMEOUT_SECS"),
            60,
        )?);
        if dispatch_timeout.is_zero() {
            bail!("DISPATCH_TIMEOUT_SECS must be at least 1");
        }
        if stale_dispatch_after(dispatch_timeout).is_none() {
            bail!(
                "DISPATCH_TIMEOUT_SECS is too large: {}",
                dispatch_timeout.as_secs()
            );
        }
        let dispatch_backoff = Duration::from_millis(parse_number(
            "DISPATCH_BACKOFF_MS",
            get("DISPATCH_BACKOFF_MS"),
            500,
        )?);
        let dedup_window = parse_number("DEDUP_WINDOW", get("DEDUP_WINDOW"), 64)?;
        let context_max_entries =
            parse_number("CONTEXT_MAX_ENTRIES", get("CONTEXT_MAX_ENTRIES"), 50)?;
        let state_cas_max_attempts: u32 =
            parse_number("STATE_CAS_MAX_ATTEMPTS", get("STATE_CAS_MAX_ATTEMPTS"), 3)?;
        if state_cas_max_attempts == 0 {
            bail!("STATE_CAS_MAX_ATTEMPTS must be at least 1");
        }

        let state_backend = match get("STATE_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => StateBackend::Sqlite,
            Some(b) if b == "sqlite" => StateBackend::Sqlite,
            Some(b) if b == "memory" => StateBackend::Memory,
            Some(other) => bail!("STATE_BACKEND must be 'sqlite' or 'memory', got '{}'", other),
        };
        let state_dir = get("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let port = parse_number("PORT", get("PORT"), 8000)?;

        let recording_enabled = parse_flag("RECORDING_ENABLED", get("RECORDING_ENABLED"), false)?;
        let recording_log_path =
            get("RECORDING_LOG_PATH").unwrap_or_else(|| "recordings.jsonl".to_string());

        let status_auth_token = parse_status_auth_token(lookup("STATUS_AUTH_TOKEN"));

        Ok(Config {
            github_webhook_secret,
            github_auth,
            github_api_url,
            trigger_label,
            agent_name,
            agent_login,
            workflow_file,
            workflow_ref,
            reply_to_new_threads,
            allow_retrigger,
            llm_provider,
            llm_model,
            llm_api_key,
            llm_api_url,
            dispatch_max_attempts,
            dispatch_timeout,
            dispatch_backoff,
            dedup_window,
            context_max_entries,
            state_cas_max_attempts,
            state_backend,
            state_dir,
            port,
            recording_enabled,
            recording_log_path,
            status_auth_token,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("bunsen.db")
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        // An in-flight dispatch cannot legitimately outlive its own deadline
        // twice over; past that it was abandoned by a crash.
        let stale = stale_dispatch_after(self.dispatch_timeout)
            .unwrap_or_else(|| chrono::Duration::seconds(120));
        TriggerConfig {
            trigger_label: self.trigger_label.clone(),
            agent_name: self.agent_name.clone(),
            agent_login: self.agent_login.clone(),
            reply_to_new_threads: self.reply_to_new_threads,
            allow_retrigger: self.allow_retrigger,
            stale_dispatch_after: stale,
            limits: FoldLimits {
                dedup_window: self.dedup_window,
                context_max_entries: self.context_max_entries,
            },
        }
    }
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or whitespace-only, so an
/// empty token can never authenticate.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_flag(name: &str, value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("{} must be a boolean, got '{}'", name, v)),
        },
    }
}

/// Twice the dispatch timeout, or `None` if that does not fit a timestamp delta.
fn stale_dispatch_after(dispatch_timeout: Duration) -> Option<chrono::Duration> {
    dispatch_timeout
        .checked_mul(2)
        .and_then(|stale| chrono::Duration::from_std(stale).ok())
}

fn parse_number<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
    }
}
