//! Application configuration.
//!
//! Settings come from CLI flags and environment variables (`.env` is
//! loaded by `main` before parsing). Required vendor keys fail fast at
//! startup with a message naming the missing variable.

use std::time::Duration;

use clap::Parser;

/// Default per-model stream deadline, seconds.
const DEFAULT_STREAM_TIMEOUT_SECONDS: u64 = 25;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// HTTP Basic auth username
    #[arg(long, env = "AUTH_USERNAME", default_value = "admin")]
    pub auth_username: String,

    /// HTTP Basic auth password (unset = auth disabled, dev only)
    #[arg(long, env = "AUTH_PASSWORD")]
    pub auth_password: Option<String>,

    /// Per-model stream deadline override, seconds
    #[arg(long, env = "STREAM_TIMEOUT_SECONDS")]
    pub stream_timeout_seconds: Option<u64>,
}

/// Which vendor API serves a configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Anthropic,
    Gemini,
}

/// One entry of the configured model set.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: &'static str,
    pub vendor: Vendor,
}

/// The configured model set. Fixed for the life of the process; session
/// histories are keyed by exactly these ids.
pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "gemini-2.5-pro",
        vendor: Vendor::Gemini,
    },
    ModelSpec {
        id: "gemini-2.5-flash",
        vendor: Vendor::Gemini,
    },
    ModelSpec {
        id: "claude-opus-4-20250514",
        vendor: Vendor::Anthropic,
    },
    ModelSpec {
        id: "claude-sonnet-4-5-20250929",
        vendor: Vendor::Anthropic,
    },
];

/// Configured model ids, in display order.
#[must_use]
pub fn model_ids() -> Vec<String> {
    MODELS.iter().map(|m| m.id.to_string()).collect()
}

/// Resolved application configuration.
///
/// The `Debug` impl is hand-written so API keys never reach a log line.
#[derive(Clone)]
pub struct AppConfig {
    pub port: u16,
    pub auth_username: String,
    /// `None` disables authentication (dev only).
    pub auth_password: Option<String>,
    pub stream_timeout: Duration,
    pub anthropic_api_key: String,
    pub google_api_key: String,
    pub kalimat_api_key: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field("auth_username", &self.auth_username)
            .field("auth_enabled", &self.auth_enabled())
            .field("stream_timeout", &self.stream_timeout)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from CLI arguments and the environment.
    pub fn load() -> Result<Self, String> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| e.to_string())?;

        let anthropic_api_key = required_env("ANTHROPIC_API_KEY")?;
        let google_api_key = required_env("GOOGLE_API_KEY")?;
        let kalimat_api_key = required_env("KALIMAT_API_KEY")?;

        let stream_timeout = Duration::from_secs(
            cli.stream_timeout_seconds
                .unwrap_or(DEFAULT_STREAM_TIMEOUT_SECONDS),
        );

        Ok(Self {
            port: cli.port,
            auth_username: cli.auth_username,
            auth_password: cli.auth_password.filter(|p| !p.is_empty()),
            stream_timeout,
            anthropic_api_key,
            google_api_key,
            kalimat_api_key,
        })
    }

    /// Whether HTTP Basic auth is enforced.
    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        self.auth_password.is_some()
    }
}

fn required_env(name: &str) -> Result<String, String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("Missing required env var: {name}"))
}
