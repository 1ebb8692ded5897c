//! Service configuration.
//!
//! Everything operational is tunable through environment variables; the
//! mechanism (eligibility rules, queue serialization) is not. In particular
//! the soak durations and the auto-merge label are policy, not mechanism,
//! and deployments are expected to adjust them.
//!
//! | Variable | Default |
//! |---|---|
//! | `MERGE_PILOT_BIND` | `0.0.0.0:3000` |
//! | `MERGE_PILOT_WEBHOOK_SECRET` | required |
//! | `MERGE_PILOT_AUTO_MERGE_LABEL` | `auto-merge` |
//! | `MERGE_PILOT_SOAK_HUMAN_SECS` | `60` |
//! | `MERGE_PILOT_SOAK_BOT_SECS` | `600` |
//! | `MERGE_PILOT_DEDUPE_CAPACITY` | `4096` |
//! | `MERGE_PILOT_DEDUPE_TTL_HOURS` | `24` |
//! | `MERGE_PILOT_AUDIT_LOG` | `data/audit.jsonl` |
//! | `MERGE_PILOT_CLOSED_PR_RETENTION_HOURS` | `24` |
//! | `MERGE_PILOT_GITHUB_TOKEN` | unset (dry run) |
//! | `MERGE_PILOT_GITHUB_REPO` | unset; `owner/name` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::SoakPolicy;

/// Errors raised while loading configuration. All of them are startup
/// errors; the process refuses to run half-configured.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Credentials and coordinates for the code-host merge executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
}

/// The full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket the HTTP server binds.
    pub bind: SocketAddr,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Label that opts a PR into auto-merging.
    pub auto_merge_label: String,
    /// Soak durations by author kind.
    pub soak: SoakPolicy,
    /// Maximum delivery IDs held in the dedupe window.
    pub dedupe_capacity: usize,
    /// How long a delivery ID stays in the dedupe window.
    pub dedupe_ttl: chrono::Duration,
    /// Path of the durable audit log.
    pub audit_log_path: PathBuf,
    /// How long closed PR records are kept in the store.
    pub closed_pr_retention: chrono::Duration,
    /// Merge executor credentials; `None` runs with the no-op executor.
    pub github: Option<GitHubConfig>,
}

impl Config {
    /// Loads configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = parse_or(
            &lookup,
            "MERGE_PILOT_BIND",
            SocketAddr::from(([0, 0, 0, 0], 3000)),
        )?;
        let webhook_secret = lookup("MERGE_PILOT_WEBHOOK_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("MERGE_PILOT_WEBHOOK_SECRET"))?;
        let auto_merge_label = lookup("MERGE_PILOT_AUTO_MERGE_LABEL")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "auto-merge".to_string());

        let soak = SoakPolicy {
            human: Duration::from_secs(parse_or(&lookup, "MERGE_PILOT_SOAK_HUMAN_SECS", 60u64)?),
            bot: Duration::from_secs(parse_or(&lookup, "MERGE_PILOT_SOAK_BOT_SECS", 600u64)?),
        };

        let dedupe_capacity = parse_or(&lookup, "MERGE_PILOT_DEDUPE_CAPACITY", 4096usize)?;
        let dedupe_ttl =
            chrono::Duration::hours(parse_or(&lookup, "MERGE_PILOT_DEDUPE_TTL_HOURS", 24i64)?);
        let audit_log_path = lookup("MERGE_PILOT_AUDIT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/audit.jsonl"));
        let closed_pr_retention = chrono::Duration::hours(parse_or(
            &lookup,
            "MERGE_PILOT_CLOSED_PR_RETENTION_HOURS",
            24i64,
        )?);

        let github = github_config(&lookup)?;

        Ok(Config {
            bind,
            webhook_secret,
            auto_merge_label,
            soak,
            dedupe_capacity,
            dedupe_ttl,
            audit_log_path,
            closed_pr_retention,
            github,
        })
    }
}

fn github_config(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<GitHubConfig>> {
    let token = lookup("MERGE_PILOT_GITHUB_TOKEN").filter(|s| !s.is_empty());
    let repo = lookup("MERGE_PILOT_GITHUB_REPO").filter(|s| !s.is_empty());

    match (token, repo) {
        (None, None) => Ok(None),
        (Some(token), Some(repo)) => {
            let (owner, name) = repo.split_once('/').ok_or(ConfigError::Invalid {
                name: "MERGE_PILOT_GITHUB_REPO",
                value: repo.clone(),
            })?;
            if owner.is_empty() || name.is_empty() {
                return Err(ConfigError::Invalid {
                    name: "MERGE_PILOT_GITHUB_REPO",
                    value: repo.clone(),
                });
            }
            Ok(Some(GitHubConfig {
                token,
                owner: owner.to_string(),
                repo: name.to_string(),
            }))
        }
        // Half-configured credentials are a startup error, not a silent
        // dry run.
        (Some(_), None) => Err(ConfigError::Missing("MERGE_PILOT_GITHUB_REPO")),
        (None, Some(_)) => Err(ConfigError::Missing("MERGE_PILOT_GITHUB_TOKEN")),
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        None => Ok(default),
        Some(value) if value.is_empty() => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
        }),
    }
}
